//! Watch and listener bookkeeping shared by the general-purpose monitors.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{Result, WatchError};
use crate::event::{EventMask, WatchDescriptor};
use crate::listener::EventListener;
use crate::registry::Registry;
use crate::session::{Session, normalize};
use crate::tree::directory_tree;

pub(crate) struct WatchTable {
    session: Arc<Session>,
    registry: Arc<Registry<dyn EventListener>>,
}

impl WatchTable {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            registry: Arc::new(Registry::new()),
        }
    }

    pub(crate) fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub(crate) fn registry(&self) -> &Arc<Registry<dyn EventListener>> {
        &self.registry
    }

    pub(crate) fn add_watch(&self, path: &Path, mask: EventMask) -> Result<WatchDescriptor> {
        self.session.ensure_active()?;
        let path = normalize(path)?;
        if mask.kinds().is_empty() {
            return Err(WatchError::invalid_argument("event mask selects no events"));
        }

        let mask = if self.registry.watch(&path).is_some() {
            mask | EventMask::MASK_ADD
        } else {
            mask
        };
        let wd = self.session.source().add_watch(&path, mask)?;
        info!("watching {} as {wd}", path.display());
        self.registry.insert(wd, path);
        Ok(wd)
    }

    pub(crate) fn add_watch_recursive(&self, root: &Path, mask: EventMask) -> Result<Vec<WatchDescriptor>> {
        self.session.ensure_active()?;
        let root = normalize(root)?;
        let dirs = directory_tree(&root)?;
        if dirs.is_empty() {
            return Err(WatchError::invalid_argument(format!(
                "{} is not a directory",
                root.display()
            )));
        }

        let mut added = Vec::with_capacity(dirs.len());
        for dir in dirs {
            match self.add_watch(&dir, mask) {
                Ok(wd) => added.push(wd),
                Err(err) if err.is_resource_limit() => {
                    warn!("stopped watching under {} after {} directories: {err}", root.display(), added.len());
                    return Err(err);
                }
                Err(WatchError::Io(err)) => debug!("skipping {}: {err}", dir.display()),
                Err(err) => return Err(err),
            }
        }
        Ok(added)
    }

    pub(crate) fn remove_watch(&self, wd: WatchDescriptor) -> Result<bool> {
        self.session.ensure_active()?;
        // Purged before the source is asked so the IGNORED record it reports
        // reaches no listener.
        let Some((path, listeners)) = self.registry.take(wd) else {
            return Ok(false);
        };
        match self.session.source().remove_watch(wd) {
            Ok(()) => {}
            Err(WatchError::InvalidDescriptor(_)) => debug!("watch {wd} was already gone"),
            Err(err) => {
                warn!("failed to remove watch {wd} on {}: {err}", path.display());
                self.registry.restore(wd, path, listeners);
                return Err(err);
            }
        }
        info!("stopped watching {} ({wd})", path.display());
        Ok(true)
    }

    pub(crate) fn add_listener(&self, wd: WatchDescriptor, listener: Arc<dyn EventListener>) -> Result<()> {
        self.session.ensure_active()?;
        if !self.registry.add_listener(wd, listener)? {
            debug!("listener already attached to {wd}");
        }
        Ok(())
    }

    pub(crate) fn remove_listener(&self, wd: WatchDescriptor, listener: &Arc<dyn EventListener>) -> Result<bool> {
        self.session.ensure_active()?;
        self.registry.remove_listener(wd, listener)
    }

    pub(crate) fn get_path(&self, wd: WatchDescriptor) -> Result<Option<PathBuf>> {
        self.session.ensure_active()?;
        Ok(self.registry.path(wd))
    }

    pub(crate) fn get_watch(&self, path: &Path) -> Result<Option<WatchDescriptor>> {
        self.session.ensure_active()?;
        Ok(self.registry.watch(&normalize(path)?))
    }

    pub(crate) fn get_listeners(&self, wd: WatchDescriptor) -> Result<Vec<Arc<dyn EventListener>>> {
        self.session.ensure_active()?;
        self.registry
            .listeners(wd)
            .ok_or(WatchError::InvalidDescriptor(wd))
    }

    pub(crate) fn get_all_listeners(&self) -> Result<Vec<Arc<dyn EventListener>>> {
        self.session.ensure_active()?;
        Ok(self.registry.all_listeners())
    }

    pub(crate) fn watches(&self) -> Result<Vec<(WatchDescriptor, PathBuf)>> {
        self.session.ensure_active()?;
        Ok(self.registry.watches())
    }
}
