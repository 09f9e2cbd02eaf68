//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use codex_inotify_dispatch::{
    ContextualEvent, EventListener, EventMask, EventSource, Fault, MemorySource, Monitor, OverflowEvent, RawEvent,
    Result, ThreadFactory, ThreadRole, WatchDescriptor,
};

/// How long any cross-thread expectation may take.
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// What a [`Recorder`] saw.
#[derive(Debug)]
pub enum Seen {
    Event(ContextualEvent),
    Overflow(OverflowEvent),
}

/// Listener that forwards everything it sees to a channel.
pub struct Recorder {
    tx: Sender<Seen>,
}

impl Recorder {
    pub fn new() -> (Arc<Self>, Receiver<Seen>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl EventListener for Recorder {
    fn filesystem_event_occurred(&self, event: &ContextualEvent) -> anyhow::Result<()> {
        self.tx.send(Seen::Event(event.clone()))?;
        Ok(())
    }

    fn queue_full(&self, event: &OverflowEvent) -> anyhow::Result<()> {
        self.tx.send(Seen::Overflow(*event))?;
        Ok(())
    }
}

pub fn next(rx: &Receiver<Seen>) -> Seen {
    rx.recv_timeout(TIMEOUT).unwrap()
}

pub fn next_event(rx: &Receiver<Seen>) -> ContextualEvent {
    match next(rx) {
        Seen::Event(event) => event,
        Seen::Overflow(overflow) => panic!("expected an event, got {overflow:?}"),
    }
}

pub fn next_overflow(rx: &Receiver<Seen>) -> OverflowEvent {
    match next(rx) {
        Seen::Overflow(overflow) => overflow,
        Seen::Event(event) => panic!("expected an overflow, got {event:?}"),
    }
}

/// Queued monitor reading from an in-memory source.
pub fn memory_monitor(capacity: usize) -> (Monitor, Arc<MemorySource>) {
    let source = Arc::new(MemorySource::new());
    let monitor = Monitor::builder()
        .queue_capacity(capacity)
        .source(source.clone())
        .build()
        .unwrap();
    (monitor, source)
}

/// Fault handler that forwards each fault's message to a channel.
pub fn fault_channel() -> (impl Fn(&Fault) + Send + Sync + 'static, Receiver<String>) {
    let (tx, rx) = mpsc::channel();
    (move |fault: &Fault| drop(tx.send(fault.to_string())), rx)
}

/// Thread factory that reports each thread's role when it exits.
pub struct TrackedThreads {
    exits: Sender<ThreadRole>,
}

impl TrackedThreads {
    pub fn new() -> (Arc<Self>, Receiver<ThreadRole>) {
        let (exits, rx) = mpsc::channel();
        (Arc::new(Self { exits }), rx)
    }
}

impl ThreadFactory for TrackedThreads {
    fn spawn(&self, role: ThreadRole, task: Box<dyn FnOnce() + Send + 'static>) -> io::Result<JoinHandle<()>> {
        let exits = self.exits.clone();
        thread::Builder::new()
            .name(format!("tracked-{role}"))
            .spawn(move || {
                task();
                let _ = exits.send(role);
            })
    }
}

/// Memory source whose reads, removals or closes can be made to fail.
pub struct BrokenSource {
    pub inner: MemorySource,
    pub fail_read: AtomicBool,
    pub fail_remove: AtomicBool,
    pub fail_close: bool,
}

impl BrokenSource {
    pub fn new(fail_close: bool) -> Arc<Self> {
        Arc::new(Self {
            inner: MemorySource::new(),
            fail_read: AtomicBool::new(false),
            fail_remove: AtomicBool::new(false),
            fail_close,
        })
    }
}

impl EventSource for BrokenSource {
    fn add_watch(&self, path: &Path, mask: EventMask) -> Result<WatchDescriptor> {
        self.inner.add_watch(path, mask)
    }

    fn remove_watch(&self, wd: WatchDescriptor) -> Result<()> {
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(io::Error::other("remove failed").into());
        }
        self.inner.remove_watch(wd)
    }

    fn read(&self) -> Result<Option<Vec<RawEvent>>> {
        let batch = self.inner.read()?;
        if self.fail_read.load(Ordering::SeqCst) {
            return Err(io::Error::other("device went away").into());
        }
        Ok(batch)
    }

    fn close(&self) -> Result<()> {
        self.inner.close()?;
        if self.fail_close {
            return Err(io::Error::other("close failed").into());
        }
        Ok(())
    }
}
