//! Service statistics for a dispatch session.
//!
//! Only running extrema and counters are kept. Readers see values that may
//! lag the dispatch threads slightly.

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

const UNSET: u64 = u64::MAX;

/// Accumulates arrival and service-time statistics.
pub struct StatsCollector {
    queue_capacity: usize,
    largest_queue_size: AtomicUsize,
    serviced: AtomicU64,
    last_arrival: Mutex<Option<Instant>>,
    last_arrival_millis: AtomicI64,
    min_interarrival_nanos: AtomicU64,
    max_interarrival_nanos: AtomicU64,
    min_service_nanos: AtomicU64,
    max_service_nanos: AtomicU64,
    callbacks: AtomicU64,
}

impl StatsCollector {
    /// Create a collector for a queue of `queue_capacity` slots.
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            queue_capacity,
            largest_queue_size: AtomicUsize::new(0),
            serviced: AtomicU64::new(0),
            last_arrival: Mutex::new(None),
            last_arrival_millis: AtomicI64::new(0),
            min_interarrival_nanos: AtomicU64::new(UNSET),
            max_interarrival_nanos: AtomicU64::new(0),
            min_service_nanos: AtomicU64::new(UNSET),
            max_service_nanos: AtomicU64::new(0),
            callbacks: AtomicU64::new(0),
        }
    }

    /// Record a successful enqueue that left `depth` items queued.
    pub fn record_arrival(&self, depth: usize) {
        let now = Instant::now();
        let previous = self.last_arrival.lock().replace(now);
        if let Some(previous) = previous {
            let delta = nanos(now.saturating_duration_since(previous));
            self.min_interarrival_nanos.fetch_min(delta, Ordering::Relaxed);
            self.max_interarrival_nanos.fetch_max(delta, Ordering::Relaxed);
        }

        self.last_arrival_millis
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        self.serviced.fetch_add(1, Ordering::Relaxed);
        self.largest_queue_size.fetch_max(depth, Ordering::Relaxed);
    }

    /// Record the wall-clock duration of one listener callback.
    pub fn record_service(&self, elapsed: Duration) {
        let elapsed = nanos(elapsed);
        self.min_service_nanos.fetch_min(elapsed, Ordering::Relaxed);
        self.max_service_nanos.fetch_max(elapsed, Ordering::Relaxed);
        self.callbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Configured queue capacity.
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Largest queue depth observed after an enqueue.
    pub fn largest_queue_size(&self) -> usize {
        self.largest_queue_size.load(Ordering::Relaxed)
    }

    /// Number of events that went through the queue.
    pub fn serviced(&self) -> u64 {
        self.serviced.load(Ordering::Relaxed)
    }

    /// Shortest gap between two enqueued events.
    pub fn min_interarrival(&self) -> Option<Duration> {
        extremum(&self.min_interarrival_nanos, &self.min_interarrival_nanos)
    }

    /// Longest gap between two enqueued events.
    pub fn max_interarrival(&self) -> Option<Duration> {
        extremum(&self.min_interarrival_nanos, &self.max_interarrival_nanos)
    }

    /// Wall-clock time of the last enqueue.
    pub fn last_arrival(&self) -> Option<DateTime<Utc>> {
        match self.last_arrival_millis.load(Ordering::Relaxed) {
            0 => None,
            millis => DateTime::from_timestamp_millis(millis),
        }
    }

    /// Fastest listener callback.
    pub fn min_service_time(&self) -> Option<Duration> {
        extremum(&self.min_service_nanos, &self.min_service_nanos)
    }

    /// Slowest listener callback.
    pub fn max_service_time(&self) -> Option<Duration> {
        extremum(&self.min_service_nanos, &self.max_service_nanos)
    }

    /// Point-in-time copy of every statistic.
    pub fn snapshot(&self) -> ServiceStats {
        ServiceStats {
            queue_capacity: self.queue_capacity,
            largest_queue_size: self.largest_queue_size(),
            serviced: self.serviced(),
            min_interarrival_ms: self.min_interarrival().map(millis),
            max_interarrival_ms: self.max_interarrival().map(millis),
            last_arrival: self.last_arrival(),
            min_service_ms: self.min_service_time().map(millis),
            max_service_ms: self.max_service_time().map(millis),
            callbacks: self.callbacks.load(Ordering::Relaxed),
        }
    }
}

// `min` doubles as the "any samples yet" flag for both extrema.
fn extremum(min: &AtomicU64, value: &AtomicU64) -> Option<Duration> {
    if min.load(Ordering::Relaxed) == UNSET {
        return None;
    }
    Some(Duration::from_nanos(value.load(Ordering::Relaxed)))
}

fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(UNSET - 1)
}

fn millis(duration: Duration) -> f64 {
    duration.as_nanos() as f64 / 1_000_000.0
}

/// Snapshot of a session's service statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStats {
    /// Delivery queue capacity.
    pub queue_capacity: usize,

    /// Largest queue depth observed.
    pub largest_queue_size: usize,

    /// Events that passed through the queue.
    pub serviced: u64,

    /// Shortest interarrival time in milliseconds.
    pub min_interarrival_ms: Option<f64>,

    /// Longest interarrival time in milliseconds.
    pub max_interarrival_ms: Option<f64>,

    /// When the last event was enqueued.
    pub last_arrival: Option<DateTime<Utc>>,

    /// Fastest listener callback in milliseconds.
    pub min_service_ms: Option<f64>,

    /// Slowest listener callback in milliseconds.
    pub max_service_ms: Option<f64>,

    /// Listener callbacks measured.
    pub callbacks: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_collector() {
        let stats = StatsCollector::new(8);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.queue_capacity, 8);
        assert_eq!(snapshot.serviced, 0);
        assert_eq!(snapshot.min_interarrival_ms, None);
        assert_eq!(snapshot.max_service_ms, None);
        assert_eq!(snapshot.last_arrival, None);
    }

    #[test]
    fn test_first_arrival_has_no_interarrival() {
        let stats = StatsCollector::new(8);
        stats.record_arrival(1);
        assert_eq!(stats.serviced(), 1);
        assert_eq!(stats.min_interarrival(), None);
        assert!(stats.last_arrival().is_some());
    }

    #[test]
    fn test_arrival_extrema() {
        let stats = StatsCollector::new(8);
        stats.record_arrival(1);
        std::thread::sleep(Duration::from_millis(5));
        stats.record_arrival(3);
        stats.record_arrival(2);

        let min = stats.min_interarrival().unwrap();
        let max = stats.max_interarrival().unwrap();
        assert!(max >= Duration::from_millis(5));
        assert!(min <= max);
        assert_eq!(stats.largest_queue_size(), 3);
        assert_eq!(stats.serviced(), 3);
    }

    #[test]
    fn test_service_extrema() {
        let stats = StatsCollector::new(8);
        stats.record_service(Duration::from_millis(4));
        stats.record_service(Duration::from_millis(1));
        stats.record_service(Duration::from_millis(9));

        assert_eq!(stats.min_service_time(), Some(Duration::from_millis(1)));
        assert_eq!(stats.max_service_time(), Some(Duration::from_millis(9)));
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.callbacks, 3);
        assert_eq!(snapshot.max_service_ms, Some(9.0));
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = StatsCollector::new(4);
        stats.record_arrival(1);
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["queue_capacity"], 4);
        assert_eq!(json["serviced"], 1);
    }
}
