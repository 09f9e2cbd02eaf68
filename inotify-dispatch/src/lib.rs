//! # Inotify Dispatch
//!
//! This crate turns Linux inotify records into listener callbacks. A session
//! owns one inotify instance, a registry of watched paths and the threads that
//! move events from the kernel to listeners.
//!
//! ## Features
//!
//! - **Queued Dispatch**: Reading and listener work run on separate threads
//! - **Bounded Queue**: A full queue drops events and tells listeners at once
//! - **Watch Registry**: Descriptors, paths and listener sets kept consistent
//! - **Service Statistics**: Queue depth, arrival gaps and callback latency
//! - **Wire Decoding**: Variable-length kernel records parsed without copies
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Inotify Dispatch                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  EventSource ──► producer ──► bounded queue ──► consumer        │
//! │       │              │                            │             │
//! │       ▼              ▼                            ▼             │
//! │   wire::decode   StatsCollector   Registry ──► EventListener    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`Monitor`] is the queued session. [`DirectMonitor`] dispatches on the
//! reader thread, [`PathWatcher`] watches a single path and [`SizeWatcher`]
//! reports file size changes.

pub mod config;
mod direct;
mod dispatch;
pub mod error;
pub mod event;
pub mod listener;
mod monitor;
pub mod registry;
mod session;
mod size;
pub mod source;
pub mod stats;
mod table;
pub mod tree;
pub mod tunables;
mod watcher;
pub mod wire;

pub use config::{
    DEFAULT_QUEUE_CAPACITY, Fault, FaultHandler, MAX_QUEUE_CAPACITY, MonitorConfig, NamedThreads, ThreadFactory,
    ThreadRole, log_faults,
};
pub use direct::DirectMonitor;
pub use error::{ResourceLimit, Result, WatchError};
pub use event::{ContextualEvent, EventMask, OverflowEvent, RawEvent, WatchDescriptor, contextual_path};
pub use listener::{EventListener, SizeChange, SizeListener};
pub use monitor::{Monitor, MonitorBuilder};
pub use registry::Registry;
pub use session::{SessionOptions, ShutdownHandle};
pub use size::SizeWatcher;
pub use source::{EventSource, MemorySource};
pub use stats::{ServiceStats, StatsCollector};
pub use tree::directory_tree;
pub use tunables::{KernelLimits, Tunable, kernel_limits};
pub use watcher::{CountDownLatch, Notifier, PathWatcher, PathWatcherBuilder};

#[cfg(target_os = "linux")]
pub use source::InotifySource;
