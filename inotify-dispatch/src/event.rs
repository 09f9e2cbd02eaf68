//! Events produced by the kernel and delivered to listeners.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque handle identifying one watched path within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WatchDescriptor(i32);

impl WatchDescriptor {
    /// Wrap a raw kernel descriptor.
    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    /// The raw kernel value.
    pub const fn raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for WatchDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

bitflags! {
    /// Event-kind, event-modifier and watch-modifier bits.
    ///
    /// Values match `<sys/inotify.h>` so masks pass through the wire format
    /// and the kernel unchanged.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct EventMask: u32 {
        /// File was accessed.
        const ACCESS = 0x0000_0001;
        /// File was modified.
        const MODIFY = 0x0000_0002;
        /// Metadata changed.
        const ATTRIB = 0x0000_0004;
        /// Writable file was closed.
        const CLOSE_WRITE = 0x0000_0008;
        /// Unwritable file was closed.
        const CLOSE_NOWRITE = 0x0000_0010;
        /// File was opened.
        const OPEN = 0x0000_0020;
        /// File was moved out of a watched directory.
        const MOVED_FROM = 0x0000_0040;
        /// File was moved into a watched directory.
        const MOVED_TO = 0x0000_0080;
        /// File was created in a watched directory.
        const CREATE = 0x0000_0100;
        /// File was deleted from a watched directory.
        const DELETE = 0x0000_0200;
        /// Watched path itself was deleted.
        const DELETE_SELF = 0x0000_0400;
        /// Watched path itself was moved.
        const MOVE_SELF = 0x0000_0800;

        /// Either close event.
        const CLOSE = Self::CLOSE_WRITE.bits() | Self::CLOSE_NOWRITE.bits();
        /// Either half of a rename.
        const MOVE = Self::MOVED_FROM.bits() | Self::MOVED_TO.bits();
        /// Every event kind.
        const ALL_EVENTS = 0x0000_0fff;

        /// Backing filesystem was unmounted.
        const UNMOUNT = 0x0000_2000;
        /// Kernel event queue overflowed.
        const Q_OVERFLOW = 0x0000_4000;
        /// Watch was removed, explicitly or implicitly.
        const IGNORED = 0x0000_8000;
        /// Subject of the event is a directory.
        const ISDIR = 0x4000_0000;

        /// Only watch the path if it is a directory.
        const ONLYDIR = 0x0100_0000;
        /// Do not dereference a symlink.
        const DONT_FOLLOW = 0x0200_0000;
        /// Merge with an existing watch mask instead of replacing it.
        const MASK_ADD = 0x2000_0000;
        /// Remove the watch after one event.
        const ONESHOT = 0x8000_0000;
    }
}

impl EventMask {
    /// The event-kind bits only.
    pub fn kinds(self) -> Self {
        self & Self::ALL_EVENTS
    }

    /// Returns true if `kind` is present, treating the compound `CLOSE` and
    /// `MOVE` kinds as matching either half.
    pub fn has_kind(self, kind: Self) -> bool {
        if kind == Self::CLOSE || kind == Self::MOVE {
            return self.intersects(kind);
        }
        self.contains(kind)
    }
}

/// A decoded kernel record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Watch the record was reported for.
    pub wd: WatchDescriptor,

    /// Event kinds and modifiers.
    pub mask: EventMask,

    /// Correlates `MOVED_FROM`/`MOVED_TO` halves of one rename.
    pub cookie: u32,

    /// Name relative to the watched directory, if any. Kept as the kernel
    /// reported it, so names that are not valid UTF-8 still resolve.
    pub name: Option<OsString>,
}

impl RawEvent {
    /// Create a record without a name or cookie.
    pub fn new(wd: WatchDescriptor, mask: EventMask) -> Self {
        Self {
            wd,
            mask,
            cookie: 0,
            name: None,
        }
    }

    /// Set the relative name.
    pub fn with_name(mut self, name: impl Into<OsString>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the rename cookie.
    pub fn with_cookie(mut self, cookie: u32) -> Self {
        self.cookie = cookie;
        self
    }

    /// Watch was revoked; registry entries must be purged after dispatch.
    pub fn is_ignored(&self) -> bool {
        self.mask.contains(EventMask::IGNORED)
    }

    /// Kernel-side queue overflowed.
    pub fn is_overflow(&self) -> bool {
        self.mask.contains(EventMask::Q_OVERFLOW)
    }

    /// Subject is a directory.
    pub fn is_dir(&self) -> bool {
        self.mask.contains(EventMask::ISDIR)
    }

    /// Backing filesystem was unmounted.
    pub fn is_unmounted(&self) -> bool {
        self.mask.contains(EventMask::UNMOUNT)
    }
}

/// A record together with the absolute path it concerns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextualEvent {
    /// The kernel record.
    pub raw: RawEvent,

    /// Watched path joined with the record name. `None` when the descriptor
    /// was no longer registered at dispatch time.
    pub path: Option<PathBuf>,
}

impl ContextualEvent {
    /// Resolve `raw` against the path it was watched under.
    pub fn resolve(raw: RawEvent, watched: Option<&Path>) -> Self {
        let path = watched.map(|base| contextual_path(base, raw.name.as_deref()));
        Self { raw, path }
    }

    /// Watch the record was reported for.
    pub fn wd(&self) -> WatchDescriptor {
        self.raw.wd
    }

    /// Event kinds and modifiers.
    pub fn mask(&self) -> EventMask {
        self.raw.mask
    }
}

/// Join a watched path with an event name.
///
/// `Path::join` inserts a separator only when `base` lacks one, so `/a/b/`
/// and `/a/b` both produce `/a/b/c.txt`.
pub fn contextual_path(base: &Path, name: Option<&OsStr>) -> PathBuf {
    match name {
        Some(name) if !name.is_empty() => base.join(name),
        _ => base.to_path_buf(),
    }
}

/// Notification that events were dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverflowEvent {
    /// True when the delivery queue was full and this notice bypassed it.
    pub out_of_order: bool,

    /// When the overflow was observed.
    pub timestamp: DateTime<Utc>,
}

impl OverflowEvent {
    /// Kernel-reported overflow, delivered in queue order.
    pub fn in_order() -> Self {
        Self {
            out_of_order: false,
            timestamp: Utc::now(),
        }
    }

    /// Delivery-queue overflow, delivered ahead of queued events.
    pub fn out_of_order() -> Self {
        Self {
            out_of_order: true,
            timestamp: Utc::now(),
        }
    }
}
