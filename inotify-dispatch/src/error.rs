//! Error types for the dispatch engine.

use std::fmt;

use thiserror::Error;

use crate::event::WatchDescriptor;

/// Result type alias for dispatch operations.
pub type Result<T> = std::result::Result<T, WatchError>;

/// Errors that can occur while watching paths or dispatching events.
#[derive(Error, Debug)]
pub enum WatchError {
    /// A kernel-side resource was exhausted.
    #[error("resource limit reached: {0}")]
    ResourceLimit(ResourceLimit),

    /// The descriptor has no registry entry.
    #[error("invalid watch descriptor: {0}")]
    InvalidDescriptor(WatchDescriptor),

    /// An argument was rejected before reaching the kernel.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The session has been destroyed.
    #[error("session is not active")]
    NotActive,

    /// A kernel tunable could not be changed.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WatchError {
    /// Build an `InvalidArgument` error.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument(reason.into())
    }

    /// Returns true if this error reports kernel resource exhaustion.
    pub fn is_resource_limit(&self) -> bool {
        matches!(self, Self::ResourceLimit(_))
    }
}

/// Which kernel resource ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceLimit {
    /// Insufficient kernel memory (`ENOMEM`).
    KernelMemory,

    /// Per-user instance limit (`EMFILE` on init).
    UserInstances,

    /// System-wide open file limit (`ENFILE`).
    SystemDescriptors,

    /// Per-user watch limit (`ENOSPC` on add).
    UserWatches,
}

impl fmt::Display for ResourceLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::KernelMemory => "insufficient kernel memory",
            Self::UserInstances => "per-user instance limit",
            Self::SystemDescriptors => "system-wide file descriptor limit",
            Self::UserWatches => "per-user watch limit",
        };
        f.write_str(text)
    }
}

impl From<ResourceLimit> for WatchError {
    fn from(limit: ResourceLimit) -> Self {
        Self::ResourceLimit(limit)
    }
}
