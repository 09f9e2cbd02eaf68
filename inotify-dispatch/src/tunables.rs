//! Kernel inotify limits under `/proc/sys/fs/inotify`.

use std::ffi::OsStr;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::Path;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, WatchError};

/// A writable kernel inotify limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tunable {
    /// Events the kernel queues per instance before overflowing.
    MaxQueuedEvents,

    /// Instances a user may hold.
    MaxUserInstances,

    /// Watches a user may hold across all instances.
    MaxUserWatches,
}

impl Tunable {
    /// Every tunable, in file name order.
    pub const ALL: [Self; 3] = [Self::MaxQueuedEvents, Self::MaxUserInstances, Self::MaxUserWatches];

    /// File under `/proc/sys/fs/inotify` holding the limit.
    pub fn path(self) -> &'static Path {
        Path::new(match self {
            Self::MaxQueuedEvents => "/proc/sys/fs/inotify/max_queued_events",
            Self::MaxUserInstances => "/proc/sys/fs/inotify/max_user_instances",
            Self::MaxUserWatches => "/proc/sys/fs/inotify/max_user_watches",
        })
    }

    /// Current value of the limit.
    pub fn read(self) -> Result<u64> {
        read_value(self.path())
    }

    /// Returns true if the current process may change the limit.
    pub fn is_writable(self) -> bool {
        OpenOptions::new().write(true).open(self.path()).is_ok()
    }

    /// Set the limit. Needs privileges on most systems.
    pub fn write(self, value: u64) -> Result<()> {
        write_value(self.path(), value)?;
        info!("set {self} to {value}");
        Ok(())
    }
}

impl fmt::Display for Tunable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self
            .path()
            .file_name()
            .and_then(OsStr::to_str)
            .unwrap_or_default();
        f.write_str(name)
    }
}

pub(crate) fn read_value(path: &Path) -> Result<u64> {
    let text = fs::read_to_string(path)?;
    text.trim().parse().map_err(|err| {
        WatchError::Io(io::Error::new(
            ErrorKind::InvalidData,
            format!("{}: {err}", path.display()),
        ))
    })
}

pub(crate) fn write_value(path: &Path, value: u64) -> Result<()> {
    let mut file = OpenOptions::new().write(true).open(path).map_err(|err| {
        if err.kind() == ErrorKind::PermissionDenied {
            WatchError::PermissionDenied(path.display().to_string())
        } else {
            err.into()
        }
    })?;
    writeln!(file, "{value}")?;
    Ok(())
}

/// The three kernel limits, each `None` if it could not be read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelLimits {
    /// Per-instance event queue length.
    pub max_queued_events: Option<u64>,
    /// Instances per user.
    pub max_user_instances: Option<u64>,
    /// Watches per user.
    pub max_user_watches: Option<u64>,
}

impl KernelLimits {
    /// Read all three limits, logging the ones that cannot be read.
    pub fn read() -> Self {
        let read = |tunable: Tunable| match tunable.read() {
            Ok(value) => Some(value),
            Err(err) => {
                debug!("cannot read {tunable}: {err}");
                None
            }
        };
        Self {
            max_queued_events: read(Tunable::MaxQueuedEvents),
            max_user_instances: read(Tunable::MaxUserInstances),
            max_user_watches: read(Tunable::MaxUserWatches),
        }
    }
}

static KERNEL_LIMITS: OnceCell<KernelLimits> = OnceCell::new();

/// Limits read when the first kernel session was opened.
pub fn kernel_limits() -> &'static KernelLimits {
    KERNEL_LIMITS.get_or_init(|| {
        let limits = KernelLimits::read();
        info!(
            "inotify limits: max_queued_events={:?} max_user_instances={:?} max_user_watches={:?}",
            limits.max_queued_events, limits.max_user_instances, limits.max_user_watches
        );
        limits
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::NamedTempFile;

    #[test]
    fn test_paths_and_names() {
        assert_eq!(
            Tunable::MaxUserWatches.path(),
            Path::new("/proc/sys/fs/inotify/max_user_watches")
        );
        assert_eq!(Tunable::MaxQueuedEvents.to_string(), "max_queued_events");
    }

    #[test]
    fn test_read_write_value() {
        let file = NamedTempFile::new().unwrap();
        fs::write(file.path(), "8192\n").unwrap();
        assert_eq!(read_value(file.path()).unwrap(), 8192);

        write_value(file.path(), 524_288).unwrap();
        assert_eq!(read_value(file.path()).unwrap(), 524_288);
    }

    #[test]
    fn test_garbage_is_invalid_data() {
        let file = NamedTempFile::new().unwrap();
        fs::write(file.path(), "lots").unwrap();
        match read_value(file.path()) {
            Err(WatchError::Io(err)) => assert_eq!(err.kind(), ErrorKind::InvalidData),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
