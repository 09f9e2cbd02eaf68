//! Event sources feeding a dispatch session.
//!
//! A source owns the kernel-facing side of a session: it adds and removes
//! watches and hands back decoded records. `read` is the only blocking call
//! and `close` must wake a blocked `read` promptly.

use std::path::Path;
use std::sync::Arc;

use crate::error::Result;
use crate::event::{EventMask, RawEvent, WatchDescriptor};

pub mod memory;

#[cfg(target_os = "linux")]
pub mod inotify;

pub use memory::MemorySource;

#[cfg(target_os = "linux")]
pub use inotify::InotifySource;

/// Blocking, cancelable source of kernel records.
pub trait EventSource: Send + Sync {
    /// Start watching `path` for the events in `mask`.
    ///
    /// Watching an already watched path returns its existing descriptor. The
    /// `MASK_ADD` bit merges `mask` into the existing one instead of
    /// replacing it.
    fn add_watch(&self, path: &Path, mask: EventMask) -> Result<WatchDescriptor>;

    /// Stop watching `wd`. The source reports an `IGNORED` record for it.
    fn remove_watch(&self, wd: WatchDescriptor) -> Result<()>;

    /// Block until records are available. Returns `None` once closed.
    fn read(&self) -> Result<Option<Vec<RawEvent>>>;

    /// Close the source, waking any blocked `read`. Idempotent.
    fn close(&self) -> Result<()>;
}

/// Open the platform's kernel source.
pub fn default_source() -> Result<Arc<dyn EventSource>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(InotifySource::open()?))
    }

    #[cfg(not(target_os = "linux"))]
    {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "inotify is only available on linux",
        )
        .into())
    }
}
