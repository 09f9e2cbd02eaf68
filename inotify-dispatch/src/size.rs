//! File size tracking.
//!
//! Every event on a watched file re-reads its size. A change is reported to
//! the file's size listeners after the ordinary event callback.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::{MonitorConfig, ThreadRole};
use crate::dispatch::{deliver_event, deliver_overflow, invoke};
use crate::error::{Result, WatchError};
use crate::event::{EventMask, OverflowEvent, RawEvent, WatchDescriptor};
use crate::listener::{SizeChange, SizeListener};
use crate::registry::Registry;
use crate::session::{EventSink, Session, SessionOptions, ShutdownHandle, normalize};

const THREAD_PREFIX: &str = "size-watcher";

type Sizes = Arc<Mutex<HashMap<PathBuf, u64>>>;

/// Watches regular files and reports size changes.
pub struct SizeWatcher {
    session: Arc<Session>,
    registry: Arc<Registry<dyn SizeListener>>,
    sizes: Sizes,
}

impl SizeWatcher {
    /// Open on the kernel's inotify.
    pub fn open() -> Result<Self> {
        Self::with_options(SessionOptions::new())
    }

    /// Open with a custom source, thread factory or fault handler.
    pub fn with_options(options: SessionOptions) -> Result<Self> {
        let config = MonitorConfig::default().with_thread_name_prefix(THREAD_PREFIX);
        let (session, threads) = options.open(&config)?;
        let registry: Arc<Registry<dyn SizeListener>> = Arc::new(Registry::new());
        let sizes: Sizes = Arc::default();

        let sink = Arc::new(Measure {
            session: Arc::clone(&session),
            registry: Arc::clone(&registry),
            sizes: Arc::clone(&sizes),
        });
        if let Err(err) = session.spawn_reader(threads.as_ref(), ThreadRole::Reader, sink) {
            session.destroy();
            return Err(err);
        }

        Ok(Self {
            session,
            registry,
            sizes,
        })
    }

    /// Start tracking a regular file. Adding a tracked file again returns its
    /// descriptor unchanged.
    pub fn add_file(&self, path: impl AsRef<Path>) -> Result<WatchDescriptor> {
        self.session.ensure_active()?;
        let path = normalize(path.as_ref())?;
        if let Some(wd) = self.registry.watch(&path) {
            return Ok(wd);
        }

        let size = match fs::metadata(&path) {
            Ok(metadata) if metadata.is_file() => metadata.len(),
            _ => {
                return Err(WatchError::invalid_argument(format!(
                    "{} is not a regular file",
                    path.display()
                )));
            }
        };

        // Record the size first so the first event has a baseline.
        self.sizes.lock().insert(path.clone(), size);
        let wd = match self.session.source().add_watch(&path, EventMask::ALL_EVENTS) {
            Ok(wd) => wd,
            Err(err) => {
                self.sizes.lock().remove(&path);
                return Err(err);
            }
        };
        info!("tracking size of {} ({size} bytes) as {wd}", path.display());
        self.registry.insert(wd, path);
        Ok(wd)
    }

    /// Stop tracking a file. Returns false if it was not tracked.
    pub fn remove_file(&self, path: impl AsRef<Path>) -> Result<bool> {
        self.session.ensure_active()?;
        let path = normalize(path.as_ref())?;
        let Some(wd) = self.registry.watch(&path) else {
            return Ok(false);
        };
        let Some((path, listeners)) = self.registry.take(wd) else {
            return Ok(false);
        };
        let size = self.sizes.lock().remove(&path);
        match self.session.source().remove_watch(wd) {
            Ok(()) | Err(WatchError::InvalidDescriptor(_)) => Ok(true),
            Err(err) => {
                if let Some(size) = size {
                    self.sizes.lock().insert(path.clone(), size);
                }
                self.registry.restore(wd, path, listeners);
                Err(err)
            }
        }
    }

    /// Attach a listener to a tracked file.
    pub fn add_listener(&self, path: impl AsRef<Path>, listener: Arc<dyn SizeListener>) -> Result<()> {
        let wd = self.tracked(path.as_ref())?;
        self.registry.add_listener(wd, listener)?;
        Ok(())
    }

    /// Detach a listener. Returns false if it was not attached.
    pub fn remove_listener(&self, path: impl AsRef<Path>, listener: &Arc<dyn SizeListener>) -> Result<bool> {
        let wd = self.tracked(path.as_ref())?;
        self.registry.remove_listener(wd, listener)
    }

    /// Last recorded size of a tracked file.
    pub fn size(&self, path: impl AsRef<Path>) -> Option<u64> {
        let path = normalize(path.as_ref()).ok()?;
        self.sizes.lock().get(&path).copied()
    }

    /// Every tracked file.
    pub fn files(&self) -> Vec<PathBuf> {
        self.registry
            .watches()
            .into_iter()
            .map(|(_, path)| path)
            .collect()
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

    fn tracked(&self, path: &Path) -> Result<WatchDescriptor> {
        self.session.ensure_active()?;
        let path = normalize(path)?;
        self.registry.watch(&path).ok_or_else(|| {
            WatchError::invalid_argument(format!("{} is not tracked", path.display()))
        })
    }
}

impl Drop for SizeWatcher {
    fn drop(&mut self) {
        self.destroy();
    }
}

struct Measure {
    session: Arc<Session>,
    registry: Arc<Registry<dyn SizeListener>>,
    sizes: Sizes,
}

impl EventSink for Measure {
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

        let wd = event.wd;
        let Some((path, listeners)) = self.registry.lookup(wd) else {
            return;
        };
        if event.is_ignored() {
            self.sizes.lock().remove(&path);
        }
        deliver_event(&self.session, &self.registry, ThreadRole::Reader, None, event);

        let Ok(metadata) = fs::metadata(&path) else {
            debug!("{} is no longer readable", path.display());
            return;
        };
        let size = metadata.len();
        let previous = {
            let mut sizes = self.sizes.lock();
            if !sizes.contains_key(&path) {
                return;
            }
            sizes.insert(path.clone(), size).unwrap_or(size)
        };
        let delta = i128::from(size) - i128::from(previous);
        if delta == 0 {
            return;
        }

        let change = SizeChange {
            wd,
            path,
            size,
            delta: i64::try_from(delta).unwrap_or(if delta > 0 { i64::MAX } else { i64::MIN }),
        };
        for listener in &listeners {
            if delta > 0 {
                invoke(&self.session, ThreadRole::Reader, None, || listener.size_increased(&change));
            } else {
                invoke(&self.session, ThreadRole::Reader, None, || listener.size_decreased(&change));
            }
        }
    }
}
