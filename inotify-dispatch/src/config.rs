//! Session configuration, thread creation and fault policy.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::error;

use crate::error::{Result, WatchError};

/// Default delivery queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 16_384;

/// Largest queue capacity the delivery channel supports.
pub const MAX_QUEUE_CAPACITY: usize = Semaphore::MAX_PERMITS;

/// Default prefix for dispatch thread names.
pub const DEFAULT_THREAD_PREFIX: &str = "inotify-monitor";

/// Configuration for a dispatch session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Number of events the delivery queue holds before overflowing.
    pub queue_capacity: usize,

    /// Prefix for dispatch thread names.
    pub thread_name_prefix: String,

    /// Stack size for dispatch threads (None = platform default).
    pub stack_size: Option<usize>,
}

impl MonitorConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            thread_name_prefix: DEFAULT_THREAD_PREFIX.to_string(),
            stack_size: None,
        }
    }

    /// Set the queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the thread name prefix.
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Set the thread stack size.
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Check the config before a session is opened.
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(WatchError::invalid_argument("queue capacity must be positive"));
        }
        if self.queue_capacity > MAX_QUEUE_CAPACITY {
            return Err(WatchError::invalid_argument(format!(
                "queue capacity {} exceeds the maximum of {MAX_QUEUE_CAPACITY}",
                self.queue_capacity
            )));
        }
        if self.thread_name_prefix.is_empty() {
            return Err(WatchError::invalid_argument("thread name prefix is empty"));
        }
        Ok(())
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// What a dispatch thread does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadRole {
    /// Drains the event source into the delivery queue.
    Producer,

    /// Drains the delivery queue into listeners.
    Consumer,

    /// Drains the event source and dispatches inline.
    Reader,
}

impl ThreadRole {
    /// Short lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Producer => "producer",
            Self::Consumer => "consumer",
            Self::Reader => "reader",
        }
    }
}

impl fmt::Display for ThreadRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Creates the long-lived dispatch threads.
///
/// Returned handles are never joined by the session; threads exit on their
/// own once the session is destroyed and never hold the process open.
pub trait ThreadFactory: Send + Sync {
    /// Start `task` on a new thread.
    fn spawn(
        &self,
        role: ThreadRole,
        task: Box<dyn FnOnce() + Send + 'static>,
    ) -> io::Result<JoinHandle<()>>;
}

/// Spawns threads named `{prefix}-{role}`.
#[derive(Debug, Clone)]
pub struct NamedThreads {
    prefix: String,
    stack_size: Option<usize>,
}

impl NamedThreads {
    /// Create a factory with the given name prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            stack_size: None,
        }
    }

    /// Create a factory from a session config.
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            prefix: config.thread_name_prefix.clone(),
            stack_size: config.stack_size,
        }
    }

    /// Name given to a thread in `role`.
    pub fn thread_name(&self, role: ThreadRole) -> String {
        format!("{}-{role}", self.prefix)
    }
}

impl ThreadFactory for NamedThreads {
    fn spawn(
        &self,
        role: ThreadRole,
        task: Box<dyn FnOnce() + Send + 'static>,
    ) -> io::Result<JoinHandle<()>> {
        let mut builder = thread::Builder::new().name(self.thread_name(role));
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }
        builder.spawn(task)
    }
}

/// A failure caught on a dispatch thread.
#[derive(Debug)]
pub enum Fault {
    /// A listener returned an error.
    Listener {
        /// Thread the listener ran on.
        role: ThreadRole,
        /// The returned error.
        error: anyhow::Error,
    },

    /// A listener panicked.
    ListenerPanic {
        /// Thread the listener ran on.
        role: ThreadRole,
        /// Panic payload, if it was a string.
        message: String,
    },

    /// Reading from the event source failed; the session is destroyed.
    Read(WatchError),

    /// Closing the event source failed; the session is destroyed anyway.
    Close(WatchError),
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listener { role, error } => write!(f, "listener failed on {role} thread: {error:#}"),
            Self::ListenerPanic { role, message } => {
                write!(f, "listener panicked on {role} thread: {message}")
            }
            Self::Read(err) => write!(f, "event source read failed: {err}"),
            Self::Close(err) => write!(f, "event source close failed: {err}"),
        }
    }
}

/// Policy invoked for every [`Fault`].
pub type FaultHandler = Arc<dyn Fn(&Fault) + Send + Sync>;

/// Default policy: log the fault and carry on.
pub fn log_faults() -> FaultHandler {
    Arc::new(|fault: &Fault| error!("{fault}"))
}
