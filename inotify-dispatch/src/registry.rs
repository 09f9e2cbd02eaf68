//! Watch registry mapping descriptors to paths and listener sets.
//!
//! All three maps sit behind one `parking_lot::RwLock`, whose task-fair policy
//! keeps watch churn from starving readers or writers. A descriptor has a path
//! entry, a reverse entry and a (possibly empty) listener set, or none of the
//! three.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Result, WatchError};
use crate::event::WatchDescriptor;
use crate::listener::identity;

type ListenerSet<L> = HashMap<usize, Arc<L>>;

struct Maps<L: ?Sized> {
    paths: HashMap<WatchDescriptor, PathBuf>,
    watches: HashMap<PathBuf, WatchDescriptor>,
    listeners: HashMap<WatchDescriptor, ListenerSet<L>>,
}

impl<L: ?Sized> Maps<L> {
    fn bind(&mut self, wd: WatchDescriptor, path: PathBuf) {
        if let Some(stale) = self.watches.get(&path).copied() {
            if stale != wd {
                debug!("dropping stale descriptor {stale} for {}", path.display());
                self.purge(stale);
            }
        }

        if let Some(previous) = self.paths.insert(wd, path.clone()) {
            if previous != path {
                self.watches.remove(&previous);
            }
        }
        self.watches.insert(path, wd);
        self.listeners.entry(wd).or_default();
    }

    fn purge(&mut self, wd: WatchDescriptor) -> Option<PathBuf> {
        let path = self.paths.remove(&wd)?;
        self.watches.remove(&path);
        self.listeners.remove(&wd);
        Some(path)
    }
}

/// Thread-safe descriptor/path/listener registry.
pub struct Registry<L: ?Sized> {
    maps: RwLock<Maps<L>>,
}

impl<L: ?Sized> Registry<L> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            maps: RwLock::new(Maps {
                paths: HashMap::new(),
                watches: HashMap::new(),
                listeners: HashMap::new(),
            }),
        }
    }

    /// Record that `path` is watched under `wd`.
    ///
    /// Re-registering the same pair keeps the existing listener set. If the
    /// kernel hands back `wd` for a different path, or `path` was bound to a
    /// stale descriptor, the old pairing is dropped so the mapping stays a
    /// bijection.
    pub fn insert(&self, wd: WatchDescriptor, path: PathBuf) {
        self.maps.write().bind(wd, path);
    }

    /// Remove a descriptor and everything attached to it.
    pub fn remove(&self, wd: WatchDescriptor) -> Option<PathBuf> {
        self.maps.write().purge(wd)
    }

    /// Remove a descriptor, handing back its path and listeners so the entry
    /// can be put back with [`Registry::restore`].
    pub fn take(&self, wd: WatchDescriptor) -> Option<(PathBuf, Vec<Arc<L>>)> {
        let mut maps = self.maps.write();
        let listeners = maps
            .listeners
            .get(&wd)
            .map(|set| set.values().cloned().collect())
            .unwrap_or_default();
        let path = maps.purge(wd)?;
        Some((path, listeners))
    }

    /// Re-register an entry removed by [`Registry::take`].
    pub fn restore(&self, wd: WatchDescriptor, path: PathBuf, listeners: Vec<Arc<L>>) {
        let mut maps = self.maps.write();
        maps.bind(wd, path);
        if let Some(set) = maps.listeners.get_mut(&wd) {
            for listener in listeners {
                set.entry(identity(&listener)).or_insert(listener);
            }
        }
    }

    /// Remove a path and everything attached to its descriptor.
    pub fn remove_path(&self, path: &Path) -> Option<WatchDescriptor> {
        let mut maps = self.maps.write();
        let wd = maps.watches.get(path).copied()?;
        maps.purge(wd);
        Some(wd)
    }

    /// Path watched under `wd`.
    pub fn path(&self, wd: WatchDescriptor) -> Option<PathBuf> {
        self.maps.read().paths.get(&wd).cloned()
    }

    /// Descriptor `path` is watched under.
    pub fn watch(&self, path: &Path) -> Option<WatchDescriptor> {
        self.maps.read().watches.get(path).copied()
    }

    /// Returns true if `wd` has a registry entry.
    pub fn contains(&self, wd: WatchDescriptor) -> bool {
        self.maps.read().paths.contains_key(&wd)
    }

    /// Attach a listener. Returns false if it was already attached.
    pub fn add_listener(&self, wd: WatchDescriptor, listener: Arc<L>) -> Result<bool> {
        let mut maps = self.maps.write();
        let set = maps
            .listeners
            .get_mut(&wd)
            .ok_or(WatchError::InvalidDescriptor(wd))?;
        Ok(set.insert(identity(&listener), listener).is_none())
    }

    /// Detach a listener. Returns false if it was not attached.
    pub fn remove_listener(&self, wd: WatchDescriptor, listener: &Arc<L>) -> Result<bool> {
        let mut maps = self.maps.write();
        let set = maps
            .listeners
            .get_mut(&wd)
            .ok_or(WatchError::InvalidDescriptor(wd))?;
        Ok(set.remove(&identity(listener)).is_some())
    }

    /// Snapshot of the listeners attached to `wd`, or `None` if `wd` has no
    /// entry.
    pub fn listeners(&self, wd: WatchDescriptor) -> Option<Vec<Arc<L>>> {
        let maps = self.maps.read();
        maps.listeners
            .get(&wd)
            .map(|set| set.values().cloned().collect())
    }

    /// Path and listener snapshot for `wd`, read under one lock.
    pub fn lookup(&self, wd: WatchDescriptor) -> Option<(PathBuf, Vec<Arc<L>>)> {
        let maps = self.maps.read();
        let path = maps.paths.get(&wd)?.clone();
        let listeners = maps
            .listeners
            .get(&wd)
            .map(|set| set.values().cloned().collect())
            .unwrap_or_default();
        Some((path, listeners))
    }

    /// Snapshot of every attached listener, each appearing once even when
    /// attached to several descriptors.
    pub fn all_listeners(&self) -> Vec<Arc<L>> {
        let maps = self.maps.read();
        let mut unique: HashMap<usize, Arc<L>> = HashMap::new();
        for set in maps.listeners.values() {
            for (id, listener) in set {
                unique.entry(*id).or_insert_with(|| Arc::clone(listener));
            }
        }
        unique.into_values().collect()
    }

    /// Snapshot of every watched descriptor and path.
    pub fn watches(&self) -> Vec<(WatchDescriptor, PathBuf)> {
        let maps = self.maps.read();
        maps.paths
            .iter()
            .map(|(wd, path)| (*wd, path.clone()))
            .collect()
    }

    /// Number of active watches.
    pub fn len(&self) -> usize {
        self.maps.read().paths.len()
    }

    /// Returns true if nothing is watched.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let maps = self.maps.read();
        assert_eq!(maps.paths.len(), maps.watches.len());
        assert_eq!(maps.paths.len(), maps.listeners.len());
        for (wd, path) in &maps.paths {
            assert_eq!(maps.watches.get(path), Some(wd));
            assert!(maps.listeners.contains_key(wd));
        }
    }
}

impl<L: ?Sized> Default for Registry<L> {
    fn default() -> Self {
        Self::new()
    }
}
