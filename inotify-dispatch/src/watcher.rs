//! Single-path watcher with a pluggable notification primitive.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::config::{MonitorConfig, ThreadRole};
use crate::dispatch::{deliver_event, deliver_overflow, invoke};
use crate::error::{Result, WatchError};
use crate::event::{EventMask, OverflowEvent, RawEvent, WatchDescriptor};
use crate::listener::EventListener;
use crate::registry::Registry;
use crate::session::{EventSink, Session, SessionOptions, ShutdownHandle, normalize};

const THREAD_PREFIX: &str = "path-watcher";

/// Counter that releases waiters once it reaches zero.
#[derive(Debug)]
pub struct CountDownLatch {
    count: Mutex<usize>,
    zero: Condvar,
}

impl CountDownLatch {
    /// Latch released after `count` calls to `count_down`.
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            zero: Condvar::new(),
        }
    }

    /// Decrement the count, releasing waiters when it reaches zero.
    pub fn count_down(&self) {
        let mut count = self.count.lock();
        if *count == 0 {
            return;
        }
        *count -= 1;
        if *count == 0 {
            self.zero.notify_all();
        }
    }

    /// Remaining count.
    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    /// Block until the count reaches zero.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.zero.wait(&mut count);
        }
    }

    /// Block until the count reaches zero or `timeout` elapses. Returns true if
    /// the count reached zero.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock();
        let _ = self
            .zero
            .wait_while_for(&mut count, |count| *count > 0, timeout);
        *count == 0
    }
}

/// How a [`PathWatcher`] signals an ordinary event.
///
/// Listeners attached to the watcher are called in every mode; overflow
/// records only ever reach listeners.
#[derive(Clone, Default)]
pub enum Notifier {
    /// Only attached listeners are called.
    #[default]
    Listeners,

    /// Run a callback.
    Callback(Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>),

    /// Wait at a barrier. The reader thread blocks until every party arrives.
    Barrier(Arc<Barrier>),

    /// Count a latch down.
    Latch(Arc<CountDownLatch>),

    /// Release one semaphore permit.
    Semaphore(Arc<Semaphore>),
}

impl Notifier {
    fn signal(&self, session: &Session) {
        match self {
            Self::Listeners => {}
            Self::Callback(callback) => invoke(session, ThreadRole::Reader, None, callback.as_ref()),
            Self::Barrier(barrier) => {
                barrier.wait();
            }
            Self::Latch(latch) => latch.count_down(),
            Self::Semaphore(semaphore) => semaphore.add_permits(1),
        }
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Listeners => "Listeners",
            Self::Callback(_) => "Callback",
            Self::Barrier(_) => "Barrier",
            Self::Latch(_) => "Latch",
            Self::Semaphore(_) => "Semaphore",
        };
        f.write_str(name)
    }
}

/// Builder for a [`PathWatcher`].
pub struct PathWatcherBuilder {
    path: PathBuf,
    mask: EventMask,
    notifier: Notifier,
    listeners: Vec<Arc<dyn EventListener>>,
    options: SessionOptions,
}

impl PathWatcherBuilder {
    /// How to signal events, replacing the default.
    pub fn notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    /// Attach a listener before the first event can arrive.
    pub fn listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Session options, e.g. a non-kernel source.
    pub fn options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    /// Open the session, add the watch and start reading.
    pub fn build(self) -> Result<PathWatcher> {
        let path = normalize(&self.path)?;
        if self.mask.kinds().is_empty() {
            return Err(WatchError::invalid_argument("event mask selects no events"));
        }

        let config = MonitorConfig::default().with_thread_name_prefix(THREAD_PREFIX);
        let (session, threads) = self.options.open(&config)?;

        let wd = match session.source().add_watch(&path, self.mask) {
            Ok(wd) => wd,
            Err(err) => {
                session.destroy();
                return Err(err);
            }
        };

        // Listeners go in before the reader starts so none miss an event.
        let registry: Arc<Registry<dyn EventListener>> = Arc::new(Registry::new());
        registry.insert(wd, path.clone());
        for listener in self.listeners {
            registry.add_listener(wd, listener)?;
        }

        let sink = Arc::new(Signal {
            session: Arc::clone(&session),
            registry: Arc::clone(&registry),
            notifier: self.notifier.clone(),
        });
        if let Err(err) = session.spawn_reader(threads.as_ref(), ThreadRole::Reader, sink) {
            session.destroy();
            return Err(err);
        }

        info!("watching {} as {wd} ({:?})", path.display(), self.notifier);
        Ok(PathWatcher {
            session,
            registry,
            path,
            mask: self.mask,
            wd,
        })
    }
}

/// Watches one path for one event mask.
pub struct PathWatcher {
    session: Arc<Session>,
    registry: Arc<Registry<dyn EventListener>>,
    path: PathBuf,
    mask: EventMask,
    wd: WatchDescriptor,
}

impl PathWatcher {
    /// Configure a watcher on `path` before opening it.
    pub fn builder(path: impl AsRef<Path>, mask: EventMask) -> PathWatcherBuilder {
        PathWatcherBuilder {
            path: path.as_ref().to_path_buf(),
            mask,
            notifier: Notifier::default(),
            listeners: Vec::new(),
            options: SessionOptions::new(),
        }
    }

    /// Watch `path` on the kernel's inotify, signalling through `notifier`.
    pub fn open(path: impl AsRef<Path>, mask: EventMask, notifier: Notifier) -> Result<Self> {
        Self::builder(path, mask).notifier(notifier).build()
    }

    /// The watched path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Events the watch was added with.
    pub fn mask(&self) -> EventMask {
        self.mask
    }

    /// Descriptor of the watch.
    pub fn wd(&self) -> WatchDescriptor {
        self.wd
    }

    /// Attach a listener. Fails with `InvalidDescriptor` once the kernel has
    /// revoked the watch.
    pub fn add_listener(&self, listener: Arc<dyn EventListener>) -> Result<()> {
        self.session.ensure_active()?;
        self.registry.add_listener(self.wd, listener)?;
        Ok(())
    }

    /// Detach a listener. Returns false if it was not attached.
    pub fn remove_listener(&self, listener: &Arc<dyn EventListener>) -> Result<bool> {
        self.session.ensure_active()?;
        self.registry.remove_listener(self.wd, listener)
    }

    /// Number of attached listeners.
    pub fn listener_count(&self) -> usize {
        self.registry
            .listeners(self.wd)
            .as_ref()
            .map_or(0, Vec::len)
    }

    /// Returns false once the kernel has revoked the watch.
    pub fn is_watching(&self) -> bool {
        self.registry.contains(self.wd)
    }

    /// Close the session. Idempotent.
    pub fn destroy(&self) {
        self.session.destroy();
    }

    /// Returns true until the session is destroyed.
    pub fn is_active(&self) -> bool {
        self.session.is_active()
    }

    /// Handle that can destroy the session from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle::new(&self.session)
    }
}

impl Drop for PathWatcher {
    fn drop(&mut self) {
        self.destroy();
    }
}

struct Signal {
    session: Arc<Session>,
    registry: Arc<Registry<dyn EventListener>>,
    notifier: Notifier,
}

impl EventSink for Signal {
    fn accept(&self, event: RawEvent) {
        if event.is_overflow() {
            deliver_overflow(
                &self.session,
                &self.registry,
                ThreadRole::Reader,
                None,
                &OverflowEvent::in_order(),
            );
            return;
        }

        debug!("{:?} on {}", event.mask, event.wd);
        self.notifier.signal(&self.session);
        deliver_event(&self.session, &self.registry, ThreadRole::Reader, None, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::thread;

    #[test]
    fn test_latch_counts_down_to_zero() {
        let latch = Arc::new(CountDownLatch::new(2));
        let waiter = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || latch.wait())
        };

        latch.count_down();
        assert_eq!(latch.count(), 1);
        assert!(!latch.wait_timeout(Duration::from_millis(10)));
        latch.count_down();
        latch.count_down();
        assert_eq!(latch.count(), 0);
        waiter.join().unwrap();
        assert!(latch.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_notifier_debug_names() {
        assert_eq!(format!("{:?}", Notifier::default()), "Listeners");
        let latch = Notifier::Latch(Arc::new(CountDownLatch::new(1)));
        assert_eq!(format!("{latch:?}"), "Latch");
    }
}
