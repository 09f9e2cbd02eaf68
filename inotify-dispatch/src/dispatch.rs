//! Listener invocation and per-record delivery.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use tracing::{debug, warn};

use crate::config::{Fault, ThreadRole};
use crate::event::{ContextualEvent, OverflowEvent, RawEvent};
use crate::listener::EventListener;
use crate::registry::Registry;
use crate::session::Session;
use crate::stats::StatsCollector;

/// Run one listener callback, timing it into `stats` and routing errors and
/// panics to the session's fault handler.
pub(crate) fn invoke<F>(session: &Session, role: ThreadRole, stats: Option<&StatsCollector>, callback: F)
where
    F: FnOnce() -> anyhow::Result<()>,
{
    let started = Instant::now();
    let outcome = panic::catch_unwind(AssertUnwindSafe(callback));
    if let Some(stats) = stats {
        stats.record_service(started.elapsed());
    }

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(error)) => session.report(Fault::Listener { role, error }),
        Err(payload) => session.report(Fault::ListenerPanic {
            role,
            message: panic_message(payload.as_ref()),
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Deliver one record to the listeners of its watch.
///
/// The path is resolved through the registry before listeners run. An
/// `IGNORED` record purges the watch once its listeners have seen it.
pub(crate) fn deliver_event<L>(
    session: &Session,
    registry: &Registry<L>,
    role: ThreadRole,
    stats: Option<&StatsCollector>,
    raw: RawEvent,
) where
    L: EventListener + ?Sized,
{
    let wd = raw.wd;
    let ignored = raw.is_ignored();
    let (path, listeners) = match registry.lookup(wd) {
        Some((path, listeners)) => (Some(path), listeners),
        None => {
            if !ignored {
                warn!("record {:?} for unregistered descriptor {wd}", raw.mask);
            }
            (None, Vec::new())
        }
    };

    let event = ContextualEvent::resolve(raw, path.as_deref());
    for listener in &listeners {
        invoke(session, role, stats, || listener.filesystem_event_occurred(&event));
    }

    if ignored {
        if let Some(path) = registry.remove(wd) {
            debug!("watch {wd} on {} revoked", path.display());
        }
    }
}

/// Tell every listener of `registry`, once each, that events were dropped.
pub(crate) fn deliver_overflow<L>(
    session: &Session,
    registry: &Registry<L>,
    role: ThreadRole,
    stats: Option<&StatsCollector>,
    overflow: &OverflowEvent,
) where
    L: EventListener + ?Sized,
{
    for listener in registry.all_listeners() {
        invoke(session, role, stats, || listener.queue_full(overflow));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FaultHandler;
    use crate::event::{EventMask, WatchDescriptor};
    use crate::source::MemorySource;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder {
        paths: Mutex<Vec<Option<PathBuf>>>,
        overflows: Mutex<usize>,
    }

    impl EventListener for Recorder {
        fn filesystem_event_occurred(&self, event: &ContextualEvent) -> anyhow::Result<()> {
            self.paths.lock().push(event.path.clone());
            Ok(())
        }

        fn queue_full(&self, _event: &OverflowEvent) -> anyhow::Result<()> {
            *self.overflows.lock() += 1;
            Ok(())
        }
    }

    fn session_with_faults() -> (Arc<Session>, Arc<Mutex<Vec<String>>>) {
        let faults = Arc::new(Mutex::new(Vec::new()));
        let handler: FaultHandler = {
            let faults = Arc::clone(&faults);
            Arc::new(move |fault: &Fault| faults.lock().push(fault.to_string()))
        };
        (Session::new(Arc::new(MemorySource::new()), handler), faults)
    }

    #[test]
    fn test_invoke_reports_errors_and_panics() {
        let (session, faults) = session_with_faults();
        let stats = StatsCollector::new(1);

        invoke(&session, ThreadRole::Consumer, Some(&stats), || Ok(()));
        invoke(&session, ThreadRole::Consumer, Some(&stats), || anyhow::bail!("bad listener"));
        invoke(&session, ThreadRole::Consumer, Some(&stats), || panic!("boom"));

        assert_eq!(stats.snapshot().callbacks, 3);
        let faults = faults.lock();
        assert_eq!(faults.len(), 2);
        assert!(faults[0].contains("bad listener"));
        assert!(faults[1].contains("boom"));
    }

    #[test]
    fn test_deliver_event_resolves_and_purges() {
        let (session, _) = session_with_faults();
        let registry: Registry<dyn EventListener> = Registry::new();
        let wd = WatchDescriptor::new(3);
        registry.insert(wd, PathBuf::from("/w"));
        let recorder = Arc::new(Recorder::default());
        registry.add_listener(wd, recorder.clone()).unwrap();

        let created = RawEvent::new(wd, EventMask::CREATE).with_name("f");
        deliver_event(&session, &registry, ThreadRole::Reader, None, created);
        deliver_event(&session, &registry, ThreadRole::Reader, None, RawEvent::new(wd, EventMask::IGNORED));

        assert_eq!(
            *recorder.paths.lock(),
            vec![Some(PathBuf::from("/w/f")), Some(PathBuf::from("/w"))]
        );
        assert!(!registry.contains(wd));
    }

    #[test]
    fn test_overflow_reaches_shared_listener_once() {
        let (session, _) = session_with_faults();
        let registry: Registry<dyn EventListener> = Registry::new();
        let recorder = Arc::new(Recorder::default());
        for raw in 1..=3 {
            let wd = WatchDescriptor::new(raw);
            registry.insert(wd, PathBuf::from(format!("/w{raw}")));
            registry.add_listener(wd, recorder.clone()).unwrap();
        }

        deliver_overflow(&session, &registry, ThreadRole::Reader, None, &OverflowEvent::out_of_order());
        assert_eq!(*recorder.overflows.lock(), 1);
    }
}
