//! Listener callbacks.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::event::{ContextualEvent, OverflowEvent, WatchDescriptor};

/// Receives filesystem events.
///
/// Callbacks run on a dispatch thread against a snapshot of the listener set,
/// so they may add or remove listeners, or destroy the session, without
/// deadlocking. Errors and panics are reported to the fault handler and do not
/// stop dispatch.
pub trait EventListener: Send + Sync {
    /// A filesystem event occurred on a watch this listener is attached to.
    fn filesystem_event_occurred(&self, event: &ContextualEvent) -> anyhow::Result<()>;

    /// Events were dropped.
    fn queue_full(&self, _event: &OverflowEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A change in a watched file's size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeChange {
    /// Watch the change was observed on.
    pub wd: WatchDescriptor,

    /// The watched file.
    pub path: PathBuf,

    /// Size after the change, in bytes.
    pub size: u64,

    /// Signed difference from the previously recorded size.
    pub delta: i64,
}

/// Receives size changes in addition to ordinary events.
pub trait SizeListener: EventListener {
    /// The file grew.
    fn size_increased(&self, change: &SizeChange) -> anyhow::Result<()>;

    /// The file shrank.
    fn size_decreased(&self, change: &SizeChange) -> anyhow::Result<()>;
}

/// Identity of a shared listener, independent of its vtable.
pub(crate) fn identity<L: ?Sized>(listener: &Arc<L>) -> usize {
    Arc::as_ptr(listener).cast::<()>() as usize
}
