//! Queued dispatch.
//!
//! The producer thread reads records from the source and offers them to a
//! bounded channel without blocking. When the channel is full the record is
//! dropped and every listener is told so directly from the producer, ahead of
//! whatever is still queued. The consumer thread drains the channel, resolves
//! each record's path through the registry and calls the listeners.
//!
//! Only the producer holds the channel's sender. Destroying the session closes
//! the source, the producer exits and drops the sender, and the consumer's
//! `blocking_recv` returns `None`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::config::{Fault, MonitorConfig, ThreadFactory, ThreadRole};
use crate::direct::DirectMonitor;
use crate::dispatch::{deliver_event, deliver_overflow};
use crate::error::{Result, WatchError};
use crate::event::{EventMask, OverflowEvent, RawEvent, WatchDescriptor};
use crate::listener::EventListener;
use crate::registry::Registry;
use crate::session::{EventSink, Session, SessionOptions, ShutdownHandle};
use crate::source::EventSource;
use crate::stats::{ServiceStats, StatsCollector};
use crate::table::WatchTable;

enum Delivery {
    Event(RawEvent),
    Overflow(OverflowEvent),
}

/// Builder for a [`Monitor`] or [`DirectMonitor`].
#[derive(Clone, Default)]
pub struct MonitorBuilder {
    config: MonitorConfig,
    options: SessionOptions,
}

impl MonitorBuilder {
    /// Replace the whole config.
    pub fn config(mut self, config: MonitorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the delivery queue capacity.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Read events from `source` instead of the kernel.
    pub fn source(mut self, source: Arc<dyn EventSource>) -> Self {
        self.options = self.options.with_source(source);
        self
    }

    /// Create dispatch threads through `factory`.
    pub fn thread_factory(mut self, factory: Arc<dyn ThreadFactory>) -> Self {
        self.options = self.options.with_thread_factory(factory);
        self
    }

    /// Send faults caught on dispatch threads to `handler`.
    pub fn fault_handler(mut self, handler: impl Fn(&Fault) + Send + Sync + 'static) -> Self {
        self.options = self.options.with_fault_handler(handler);
        self
    }

    /// Open a queued monitor.
    pub fn build(self) -> Result<Monitor> {
        Monitor::with_options(self.config, self.options)
    }

    /// Open a monitor that dispatches on the reader thread.
    pub fn build_direct(self) -> Result<DirectMonitor> {
        DirectMonitor::with_options(&self.config, self.options)
    }
}

/// Queued inotify dispatch session.
pub struct Monitor {
    table: WatchTable,
    stats: Arc<StatsCollector>,
}

impl Monitor {
    /// Start building a monitor.
    pub fn builder() -> MonitorBuilder {
        MonitorBuilder::default()
    }

    /// Open a monitor on the kernel's inotify.
    pub fn open(config: MonitorConfig) -> Result<Self> {
        Self::with_options(config, SessionOptions::new())
    }

    /// Open a monitor with explicit collaborators.
    pub fn with_options(config: MonitorConfig, options: SessionOptions) -> Result<Self> {
        config.validate()?;
        let (session, threads) = options.open(&config)?;
        let table = WatchTable::new(Arc::clone(&session));
        let stats = Arc::new(StatsCollector::new(config.queue_capacity));
        let (tx, rx) = mpsc::channel(config.queue_capacity);

        let consumer = Consumer {
            session: Arc::clone(&session),
            registry: Arc::clone(table.registry()),
            stats: Arc::clone(&stats),
            queue: rx,
        };
        let producer = Producer {
            session: Arc::clone(&session),
            registry: Arc::clone(table.registry()),
            stats: Arc::clone(&stats),
            queue: tx,
        };

        let started = threads
            .spawn(ThreadRole::Consumer, Box::new(move || consumer.run()))
            .map_err(WatchError::from)
            .and_then(|_| session.spawn_reader(threads.as_ref(), ThreadRole::Producer, Arc::new(producer)));
        if let Err(err) = started {
            session.destroy();
            return Err(err);
        }

        info!("monitor opened with queue capacity {}", config.queue_capacity);
        Ok(Self { table, stats })
    }

    /// Watch `path` for the events in `mask`.
    ///
    /// Watching a path again merges `mask` into the existing watch and returns
    /// the same descriptor.
    pub fn add_watch(&self, path: impl AsRef<Path>, mask: EventMask) -> Result<WatchDescriptor> {
        self.table.add_watch(path.as_ref(), mask)
    }

    /// Watch every directory under `root`, parents first.
    pub fn add_watch_recursive(&self, root: impl AsRef<Path>, mask: EventMask) -> Result<Vec<WatchDescriptor>> {
        self.table.add_watch_recursive(root.as_ref(), mask)
    }

    /// Stop watching `wd`. Returns false if it was not watched.
    pub fn remove_watch(&self, wd: WatchDescriptor) -> Result<bool> {
        self.table.remove_watch(wd)
    }

    /// Attach a listener to `wd`. Attaching it twice has no effect.
    pub fn add_listener(&self, wd: WatchDescriptor, listener: Arc<dyn EventListener>) -> Result<()> {
        self.table.add_listener(wd, listener)
    }

    /// Detach a listener from `wd`.
    pub fn remove_listener(&self, wd: WatchDescriptor, listener: &Arc<dyn EventListener>) -> Result<bool> {
        self.table.remove_listener(wd, listener)
    }

    /// Path watched under `wd`.
    pub fn get_path(&self, wd: WatchDescriptor) -> Result<Option<PathBuf>> {
        self.table.get_path(wd)
    }

    /// Descriptor `path` is watched under.
    pub fn get_watch(&self, path: impl AsRef<Path>) -> Result<Option<WatchDescriptor>> {
        self.table.get_watch(path.as_ref())
    }

    /// Snapshot of the listeners attached to `wd`.
    pub fn get_listeners(&self, wd: WatchDescriptor) -> Result<Vec<Arc<dyn EventListener>>> {
        self.table.get_listeners(wd)
    }

    /// Snapshot of every attached listener, without duplicates.
    pub fn get_all_listeners(&self) -> Result<Vec<Arc<dyn EventListener>>> {
        self.table.get_all_listeners()
    }

    /// Snapshot of every watch.
    pub fn watches(&self) -> Result<Vec<(WatchDescriptor, PathBuf)>> {
        self.table.watches()
    }

    /// Close the session. Idempotent and never fails; close errors go to the
    /// fault handler.
    pub fn destroy(&self) {
        self.table.session().destroy();
    }

    /// Returns true until the session is destroyed.
    pub fn is_active(&self) -> bool {
        self.table.session().is_active()
    }

    /// Handle that can destroy this session from a listener.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle::new(self.table.session())
    }

    /// Point-in-time service statistics.
    pub fn stats(&self) -> ServiceStats {
        self.stats.snapshot()
    }

    /// Delivery queue capacity.
    pub fn queue_capacity(&self) -> usize {
        self.stats.queue_capacity()
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.destroy();
    }
}

struct Producer {
    session: Arc<Session>,
    registry: Arc<Registry<dyn EventListener>>,
    stats: Arc<StatsCollector>,
    queue: mpsc::Sender<Delivery>,
}

impl EventSink for Producer {
    fn accept(&self, event: RawEvent) {
        let delivery = if event.is_overflow() {
            Delivery::Overflow(OverflowEvent::in_order())
        } else {
            Delivery::Event(event)
        };

        match self.queue.try_send(delivery) {
            Ok(()) => {
                let depth = self.queue.max_capacity() - self.queue.capacity();
                self.stats.record_arrival(depth);
            }
            Err(TrySendError::Full(_)) => {
                debug!("delivery queue full; dropping event");
                deliver_overflow(
                    &self.session,
                    &self.registry,
                    ThreadRole::Producer,
                    Some(&self.stats),
                    &OverflowEvent::out_of_order(),
                );
            }
            Err(TrySendError::Closed(_)) => warn!("consumer has exited; dropping event"),
        }
    }
}

struct Consumer {
    session: Arc<Session>,
    registry: Arc<Registry<dyn EventListener>>,
    stats: Arc<StatsCollector>,
    queue: mpsc::Receiver<Delivery>,
}

impl Consumer {
    fn run(mut self) {
        debug!("consumer thread started");
        while self.session.is_active() {
            let Some(delivery) = self.queue.blocking_recv() else {
                break;
            };
            if !self.session.is_active() {
                break;
            }
            match delivery {
                Delivery::Event(raw) => deliver_event(
                    &self.session,
                    &self.registry,
                    ThreadRole::Consumer,
                    Some(&self.stats),
                    raw,
                ),
                Delivery::Overflow(overflow) => deliver_overflow(
                    &self.session,
                    &self.registry,
                    ThreadRole::Consumer,
                    Some(&self.stats),
                    &overflow,
                ),
            }
        }
        debug!("consumer thread exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use pretty_assertions::assert_eq;

    fn monitor(capacity: usize) -> (Monitor, Arc<MemorySource>) {
        let source = Arc::new(MemorySource::new());
        let monitor = Monitor::builder()
            .queue_capacity(capacity)
            .source(source.clone())
            .build()
            .unwrap();
        (monitor, source)
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = Monitor::builder()
            .queue_capacity(0)
            .source(Arc::new(MemorySource::new()))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, WatchError::InvalidArgument(_)));
    }

    #[test]
    fn test_oversized_capacity_is_an_error() {
        let source = Arc::new(MemorySource::new());
        let err = Monitor::builder()
            .queue_capacity(usize::MAX)
            .source(source.clone())
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, WatchError::InvalidArgument(_)));
        assert!(!source.is_closed());
    }

    #[test]
    fn test_rewatch_merges_mask() {
        let (monitor, source) = monitor(4);
        let a = monitor.add_watch("/w", EventMask::CREATE).unwrap();
        let b = monitor.add_watch("/w/", EventMask::DELETE).unwrap();
        assert_eq!(a, b);
        assert_eq!(source.mask(a), Some(EventMask::CREATE | EventMask::DELETE));
        assert_eq!(monitor.watches().unwrap().len(), 1);
    }

    #[test]
    fn test_empty_mask_rejected() {
        let (monitor, _) = monitor(4);
        let err = monitor.add_watch("/w", EventMask::ONLYDIR).unwrap_err();
        assert!(matches!(err, WatchError::InvalidArgument(_)));
    }

    #[test]
    fn test_operations_after_destroy() {
        let (monitor, source) = monitor(4);
        let wd = monitor.add_watch("/w", EventMask::CREATE).unwrap();
        monitor.destroy();
        monitor.destroy();

        assert!(!monitor.is_active());
        assert!(source.is_closed());
        assert!(matches!(monitor.get_path(wd), Err(WatchError::NotActive)));
        assert!(matches!(monitor.remove_watch(wd), Err(WatchError::NotActive)));
        assert!(matches!(monitor.add_watch("/x", EventMask::CREATE), Err(WatchError::NotActive)));
        assert_eq!(monitor.queue_capacity(), 4);
    }

    #[test]
    fn test_shutdown_handle() {
        let (monitor, _) = monitor(4);
        let handle = monitor.shutdown_handle();
        assert!(handle.is_active());
        handle.destroy();
        assert!(!monitor.is_active());
    }
}
