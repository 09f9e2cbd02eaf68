//! In-process event source.
//!
//! Behaves like the kernel for watch bookkeeping while records are injected
//! by the caller. Used by tests and by embedders that synthesize events.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::error::{ResourceLimit, Result, WatchError};
use crate::event::{EventMask, RawEvent, WatchDescriptor};
use crate::source::EventSource;
use crate::wire;

struct Watch {
    path: PathBuf,
    mask: EventMask,
}

struct State {
    pending: VecDeque<Vec<RawEvent>>,
    closed: bool,
    next_wd: i32,
    by_path: HashMap<PathBuf, WatchDescriptor>,
    watches: HashMap<WatchDescriptor, Watch>,
}

/// Event source whose records are injected in-process.
pub struct MemorySource {
    state: Mutex<State>,
    ready: Condvar,
    watch_limit: Option<usize>,
}

impl MemorySource {
    /// Create an open source with no watches.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                pending: VecDeque::new(),
                closed: false,
                next_wd: 1,
                by_path: HashMap::new(),
                watches: HashMap::new(),
            }),
            ready: Condvar::new(),
            watch_limit: None,
        }
    }

    /// Fail `add_watch` with a watch-limit error beyond `limit` watches.
    pub fn with_watch_limit(mut self, limit: usize) -> Self {
        self.watch_limit = Some(limit);
        self
    }

    /// Queue one record for the next `read`.
    pub fn inject(&self, event: RawEvent) {
        self.inject_batch(vec![event]);
    }

    /// Queue records to be returned together by one `read`.
    pub fn inject_batch(&self, events: Vec<RawEvent>) {
        if events.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        if state.closed {
            debug!("dropping {} injected events after close", events.len());
            return;
        }
        state.pending.push_back(events);
        self.ready.notify_all();
    }

    /// Decode a wire-format buffer and queue its records as one batch.
    pub fn inject_bytes(&self, bytes: &[u8]) -> Result<()> {
        let events = wire::decode(bytes)?;
        self.inject_batch(events);
        Ok(())
    }

    /// Current mask of a watch.
    pub fn mask(&self, wd: WatchDescriptor) -> Option<EventMask> {
        self.state.lock().watches.get(&wd).map(|w| w.mask)
    }

    /// Number of watches the source holds.
    pub fn watch_count(&self) -> usize {
        self.state.lock().watches.len()
    }

    /// Returns true once `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSource for MemorySource {
    fn add_watch(&self, path: &Path, mask: EventMask) -> Result<WatchDescriptor> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(WatchError::NotActive);
        }

        let requested = mask - EventMask::MASK_ADD;
        if let Some(wd) = state.by_path.get(path).copied() {
            if let Some(watch) = state.watches.get_mut(&wd) {
                watch.mask = if mask.contains(EventMask::MASK_ADD) {
                    watch.mask | requested
                } else {
                    requested
                };
            }
            return Ok(wd);
        }

        if self.watch_limit.is_some_and(|limit| state.watches.len() >= limit) {
            return Err(ResourceLimit::UserWatches.into());
        }

        let wd = WatchDescriptor::new(state.next_wd);
        state.next_wd += 1;
        state.by_path.insert(path.to_path_buf(), wd);
        state.watches.insert(
            wd,
            Watch {
                path: path.to_path_buf(),
                mask: requested,
            },
        );
        Ok(wd)
    }

    fn remove_watch(&self, wd: WatchDescriptor) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(WatchError::NotActive);
        }

        let watch = state
            .watches
            .remove(&wd)
            .ok_or(WatchError::InvalidDescriptor(wd))?;
        state.by_path.remove(&watch.path);
        state
            .pending
            .push_back(vec![RawEvent::new(wd, EventMask::IGNORED)]);
        self.ready.notify_all();
        Ok(())
    }

    fn read(&self) -> Result<Option<Vec<RawEvent>>> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Ok(None);
            }
            if let Some(batch) = state.pending.pop_front() {
                return Ok(Some(batch));
            }
            self.ready.wait(&mut state);
        }
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.closed = true;
        state.pending.clear();
        self.ready.notify_all();
        Ok(())
    }
}
