//! Session lifecycle shared by every dispatch strategy.
//!
//! A session owns one event source and a liveness flag. Destroying it closes
//! the source, which wakes the thread blocked in `read`; every other dispatch
//! thread winds down from there.

use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use tracing::{debug, info};

use crate::config::{Fault, FaultHandler, MonitorConfig, NamedThreads, ThreadFactory, ThreadRole, log_faults};
use crate::error::{Result, WatchError};
use crate::event::RawEvent;
use crate::source::{EventSource, default_source};

/// Receives every record read from a session's source, on the reader thread.
pub trait EventSink: Send + Sync {
    /// Handle one record.
    fn accept(&self, event: RawEvent);
}

/// Optional collaborators for opening a session.
///
/// Anything left unset falls back to the kernel source, threads named after
/// the config prefix and a fault handler that logs.
#[derive(Clone, Default)]
pub struct SessionOptions {
    source: Option<Arc<dyn EventSource>>,
    thread_factory: Option<Arc<dyn ThreadFactory>>,
    fault_handler: Option<FaultHandler>,
}

impl SessionOptions {
    /// Options with every collaborator defaulted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read events from `source` instead of the kernel.
    pub fn with_source(mut self, source: Arc<dyn EventSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Create dispatch threads through `factory`.
    pub fn with_thread_factory(mut self, factory: Arc<dyn ThreadFactory>) -> Self {
        self.thread_factory = Some(factory);
        self
    }

    /// Send faults caught on dispatch threads to `handler`.
    pub fn with_fault_handler(mut self, handler: impl Fn(&Fault) + Send + Sync + 'static) -> Self {
        self.fault_handler = Some(Arc::new(handler));
        self
    }

    pub(crate) fn open(self, config: &MonitorConfig) -> Result<(Arc<Session>, Arc<dyn ThreadFactory>)> {
        let source = match self.source {
            Some(source) => source,
            None => default_source()?,
        };
        let threads = self
            .thread_factory
            .unwrap_or_else(|| Arc::new(NamedThreads::from_config(config)));
        let faults = self.fault_handler.unwrap_or_else(log_faults);
        Ok((Session::new(source, faults), threads))
    }
}

/// Source plus liveness flag.
pub(crate) struct Session {
    source: Arc<dyn EventSource>,
    active: AtomicBool,
    faults: FaultHandler,
}

impl Session {
    pub(crate) fn new(source: Arc<dyn EventSource>, faults: FaultHandler) -> Arc<Self> {
        Arc::new(Self {
            source,
            active: AtomicBool::new(true),
            faults,
        })
    }

    pub(crate) fn source(&self) -> &dyn EventSource {
        self.source.as_ref()
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(WatchError::NotActive)
        }
    }

    /// Hand a fault to the policy. A panicking policy is contained here.
    pub(crate) fn report(&self, fault: Fault) {
        let handler = &self.faults;
        if panic::catch_unwind(AssertUnwindSafe(|| handler(&fault))).is_err() {
            debug!("fault handler panicked while handling: {fault}");
        }
    }

    /// Mark the session inactive and close the source. Only the first call
    /// does anything; later calls return immediately.
    pub(crate) fn destroy(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = self.source.close() {
            self.report(Fault::Close(err));
        }
        info!("dispatch session destroyed");
    }

    /// Start the thread that drains the source into `sink`.
    pub(crate) fn spawn_reader(
        self: &Arc<Self>,
        threads: &dyn ThreadFactory,
        role: ThreadRole,
        sink: Arc<dyn EventSink>,
    ) -> Result<JoinHandle<()>> {
        let session = Arc::clone(self);
        let handle = threads.spawn(role, Box::new(move || read_loop(&session, role, sink.as_ref())))?;
        Ok(handle)
    }
}

fn read_loop(session: &Session, role: ThreadRole, sink: &dyn EventSink) {
    debug!("{role} thread started");
    while session.is_active() {
        match session.source.read() {
            Ok(Some(events)) => {
                for event in events {
                    if !session.is_active() {
                        break;
                    }
                    sink.accept(event);
                }
            }
            Ok(None) => break,
            Err(err) => {
                if session.is_active() {
                    session.report(Fault::Read(err));
                    session.destroy();
                }
                break;
            }
        }
    }
    debug!("{role} thread exiting");
}

/// Handle for destroying a session from anywhere, including from inside a
/// listener, without holding the strategy that owns it.
#[derive(Clone)]
pub struct ShutdownHandle {
    session: Arc<Session>,
}

impl ShutdownHandle {
    pub(crate) fn new(session: &Arc<Session>) -> Self {
        Self {
            session: Arc::clone(session),
        }
    }

    /// Destroy the session. Idempotent.
    pub fn destroy(&self) {
        self.session.destroy();
    }

    /// Returns true until the session is destroyed.
    pub fn is_active(&self) -> bool {
        self.session.is_active()
    }
}

/// Reject empty paths and anchor relative ones at the working directory.
pub(crate) fn normalize(path: &Path) -> Result<PathBuf> {
    if path.as_os_str().is_empty() {
        return Err(WatchError::invalid_argument("path is empty"));
    }
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::path::absolute(path)?)
    }
}
