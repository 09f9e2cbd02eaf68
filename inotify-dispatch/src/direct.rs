//! Inline dispatch without a delivery queue.
//!
//! Listeners run on the reader thread, so a slow listener delays reading and
//! the kernel queue absorbs the backlog. Kernel overflow records reach every
//! listener in order with the events around them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::config::{MonitorConfig, ThreadRole};
use crate::dispatch::{deliver_event, deliver_overflow};
use crate::error::Result;
use crate::event::{EventMask, OverflowEvent, RawEvent, WatchDescriptor};
use crate::listener::EventListener;
use crate::monitor::MonitorBuilder;
use crate::registry::Registry;
use crate::session::{EventSink, Session, SessionOptions, ShutdownHandle};
use crate::table::WatchTable;

/// Dispatch session that calls listeners on the reader thread.
pub struct DirectMonitor {
    table: WatchTable,
}

impl DirectMonitor {
    /// Start building a direct monitor; finish with
    /// [`MonitorBuilder::build_direct`].
    pub fn builder() -> MonitorBuilder {
        MonitorBuilder::default()
    }

    /// Open a direct monitor with explicit collaborators. The queue capacity
    /// in `config` is not used.
    pub fn with_options(config: &MonitorConfig, options: SessionOptions) -> Result<Self> {
        let (session, threads) = options.open(config)?;
        let table = WatchTable::new(Arc::clone(&session));
        let sink = Arc::new(Inline {
            session: Arc::clone(&session),
            registry: Arc::clone(table.registry()),
        });
        if let Err(err) = session.spawn_reader(threads.as_ref(), ThreadRole::Reader, sink) {
            session.destroy();
            return Err(err);
        }

        info!("direct monitor opened");
        Ok(Self { table })
    }

    /// Watch `path` for the events in `mask`.
    pub fn add_watch(&self, path: impl AsRef<Path>, mask: EventMask) -> Result<WatchDescriptor> {
        self.table.add_watch(path.as_ref(), mask)
    }

    /// Watch every directory under `root`, parents first.
    pub fn add_watch_recursive(&self, root: impl AsRef<Path>, mask: EventMask) -> Result<Vec<WatchDescriptor>> {
        self.table.add_watch_recursive(root.as_ref(), mask)
    }

    /// Stop watching `wd`. Returns false if it was not registered.
    pub fn remove_watch(&self, wd: WatchDescriptor) -> Result<bool> {
        self.table.remove_watch(wd)
    }

    /// Attach a listener to a registered watch.
    pub fn add_listener(&self, wd: WatchDescriptor, listener: Arc<dyn EventListener>) -> Result<()> {
        self.table.add_listener(wd, listener)
    }

    /// Detach a listener. Returns false if it was not attached.
    pub fn remove_listener(&self, wd: WatchDescriptor, listener: &Arc<dyn EventListener>) -> Result<bool> {
        self.table.remove_listener(wd, listener)
    }

    /// Path registered for `wd`.
    pub fn get_path(&self, wd: WatchDescriptor) -> Result<Option<PathBuf>> {
        self.table.get_path(wd)
    }

    /// Descriptor registered for `path`.
    pub fn get_watch(&self, path: impl AsRef<Path>) -> Result<Option<WatchDescriptor>> {
        self.table.get_watch(path.as_ref())
    }

    /// Listeners attached to `wd`.
    pub fn get_listeners(&self, wd: WatchDescriptor) -> Result<Vec<Arc<dyn EventListener>>> {
        self.table.get_listeners(wd)
    }

    /// Every attached listener, each once.
    pub fn get_all_listeners(&self) -> Result<Vec<Arc<dyn EventListener>>> {
        self.table.get_all_listeners()
    }

    /// Every registered watch with its path.
    pub fn watches(&self) -> Result<Vec<(WatchDescriptor, PathBuf)>> {
        self.table.watches()
    }

    /// Close the session. Idempotent.
    pub fn destroy(&self) {
        self.table.session().destroy();
    }

    /// Returns true until the session is destroyed.
    pub fn is_active(&self) -> bool {
        self.table.session().is_active()
    }

    /// Handle that can destroy the session from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle::new(self.table.session())
    }
}

impl Drop for DirectMonitor {
    fn drop(&mut self) {
        self.destroy();
    }
}

struct Inline {
    session: Arc<Session>,
    registry: Arc<Registry<dyn EventListener>>,
}

impl EventSink for Inline {
    fn accept(&self, event: RawEvent) {
        if event.is_overflow() {
            deliver_overflow(
                &self.session,
                &self.registry,
                ThreadRole::Reader,
                None,
                &OverflowEvent::in_order(),
            );
        } else {
            deliver_event(&self.session, &self.registry, ThreadRole::Reader, None, event);
        }
    }
}
