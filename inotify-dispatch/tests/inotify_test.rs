//! Integration tests against the kernel's inotify.

#![cfg(target_os = "linux")]

mod common;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use codex_inotify_dispatch::{
    EventMask, Monitor, MonitorConfig, Notifier, PathWatcher, Tunable, WatchError, kernel_limits,
};

use common::{Recorder, Seen, TIMEOUT, next};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Wait for an event with `kind`, skipping anything else the kernel reports.
fn wait_for(rx: &std::sync::mpsc::Receiver<Seen>, kind: EventMask) -> Option<PathBuf> {
    loop {
        match next(rx) {
            Seen::Event(event) if event.mask().contains(kind) => return event.path,
            _ => continue,
        }
    }
}

#[test]
fn test_kernel_events_reach_listener() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    let monitor = Monitor::open(MonitorConfig::new().with_queue_capacity(64)).unwrap();
    let wd = monitor
        .add_watch(temp.path(), EventMask::CREATE | EventMask::DELETE)
        .unwrap();
    let (recorder, rx) = Recorder::new();
    monitor.add_listener(wd, recorder).unwrap();

    let file = temp.path().join("created.txt");
    fs::write(&file, "hello").unwrap();
    assert_eq!(wait_for(&rx, EventMask::CREATE), Some(file.clone()));

    fs::remove_file(&file).unwrap();
    assert_eq!(wait_for(&rx, EventMask::DELETE), Some(file));
    assert!(monitor.stats().serviced >= 2);
}

#[test]
fn test_recursive_watch_sees_nested_directory() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    fs::create_dir_all(temp.path().join("a/b")).unwrap();
    let monitor = Monitor::open(MonitorConfig::default()).unwrap();
    let wds = monitor
        .add_watch_recursive(temp.path(), EventMask::CREATE)
        .unwrap();
    assert_eq!(wds.len(), 3);

    let nested = temp.path().canonicalize().unwrap().join("a/b");
    let wd = monitor.get_watch(&nested).unwrap().unwrap();
    let (recorder, rx) = Recorder::new();
    monitor.add_listener(wd, recorder).unwrap();

    fs::write(nested.join("deep.txt"), "x").unwrap();
    assert_eq!(wait_for(&rx, EventMask::CREATE), Some(nested.join("deep.txt")));
}

#[test]
fn test_deleting_watched_directory_revokes_watch() {
    init_tracing();
    let temp = TempDir::new().unwrap();
    let doomed = temp.path().join("doomed");
    fs::create_dir(&doomed).unwrap();

    let monitor = Monitor::open(MonitorConfig::default()).unwrap();
    let wd = monitor.add_watch(&doomed, EventMask::DELETE_SELF).unwrap();
    let (recorder, rx) = Recorder::new();
    monitor.add_listener(wd, recorder).unwrap();

    fs::remove_dir(&doomed).unwrap();
    assert_eq!(wait_for(&rx, EventMask::IGNORED), Some(doomed));

    // Removing a revoked watch is not an error
    let _ = monitor.remove_watch(wd).unwrap();
    assert_eq!(monitor.get_path(wd).unwrap(), None);
}

#[test]
fn test_missing_path_is_io_error() {
    let temp = TempDir::new().unwrap();
    let monitor = Monitor::open(MonitorConfig::default()).unwrap();
    let err = monitor
        .add_watch(temp.path().join("missing"), EventMask::CREATE)
        .unwrap_err();
    assert!(matches!(err, WatchError::Io(_)));
}

#[test]
fn test_destroy_closes_kernel_session() {
    let monitor = Monitor::open(MonitorConfig::default()).unwrap();
    monitor.destroy();
    monitor.destroy();
    assert!(!monitor.is_active());
    assert!(matches!(monitor.add_watch("/", EventMask::CREATE), Err(WatchError::NotActive)));
}

#[test]
fn test_path_watcher_on_kernel() {
    let temp = TempDir::new().unwrap();
    let latch = Arc::new(codex_inotify_dispatch::CountDownLatch::new(1));
    let watcher = PathWatcher::open(temp.path(), EventMask::CREATE, Notifier::Latch(latch.clone())).unwrap();

    fs::write(temp.path().join("ping"), "x").unwrap();
    assert!(latch.wait_timeout(TIMEOUT));
    watcher.destroy();
}

#[test]
fn test_kernel_limits_are_readable() {
    let limits = kernel_limits();
    if let Some(watches) = limits.max_user_watches {
        assert!(watches > 0);
        assert_eq!(Tunable::MaxUserWatches.read().ok(), Some(watches));
    }
}
