//! Metrics for the priority request queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Counters describing queue activity
#[derive(Debug, Default)]
pub struct QueueMetrics {
    /// Entries offered to `enqueue`
    pub requests_received: AtomicU64,

    /// Entries currently waiting for admission
    pub requests_queued: AtomicU64,

    /// Entries currently in flight
    pub requests_in_flight: AtomicU64,

    /// Entries admitted to the transport
    pub requests_admitted: AtomicU64,

    /// Entries resolved successfully
    pub requests_completed: AtomicU64,

    /// Entries rejected by the transport
    pub requests_failed: AtomicU64,

    /// Entries cancelled, queued or in flight
    pub requests_cancelled: AtomicU64,

    /// Entries rejected as duplicates
    pub requests_duplicate: AtomicU64,

    /// Total admission wait in milliseconds
    pub total_queue_wait_ms: AtomicU64,

    /// Total transport time in milliseconds
    pub total_processing_ms: AtomicU64,

    /// Highest queue depth observed
    pub max_queue_depth: AtomicU64,

    /// Batches sent through the queue
    pub batches_sent: AtomicU64,

    /// Logical queries folded into those batches
    pub total_batch_entries: AtomicU64,
}

impl QueueMetrics {
    /// Create new metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an entry offered to the queue
    pub fn record_received(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an entry entering the queue
    pub fn record_queued(&self) {
        let queued = self.requests_queued.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_queue_depth.fetch_max(queued, Ordering::Relaxed);
    }

    /// Record an entry leaving the queue without being admitted
    pub fn record_dropped(&self) {
        self.requests_queued.fetch_sub(1, Ordering::Relaxed);
        self.requests_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an entry being admitted
    pub fn record_admitted(&self, wait_time: Duration) {
        self.requests_queued.fetch_sub(1, Ordering::Relaxed);
        self.requests_in_flight.fetch_add(1, Ordering::Relaxed);
        self.requests_admitted.fetch_add(1, Ordering::Relaxed);
        self.total_queue_wait_ms
            .fetch_add(wait_time.as_millis() as u64, Ordering::Relaxed);
    }

    /// Record an in-flight entry settling
    pub fn record_settled(&self, outcome: Outcome, processing_time: Duration) {
        self.requests_in_flight.fetch_sub(1, Ordering::Relaxed);
        self.total_processing_ms
            .fetch_add(processing_time.as_millis() as u64, Ordering::Relaxed);
        let counter = match outcome {
            Outcome::Resolved => &self.requests_completed,
            Outcome::Failed => &self.requests_failed,
            Outcome::Cancelled => &self.requests_cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an entry rejected for a duplicate key
    pub fn record_duplicate(&self) {
        self.requests_duplicate.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an entry cancelled before it was ever queued
    pub fn record_cancelled(&self) {
        self.requests_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a batch of `size` logical queries being sent
    pub fn record_batch(&self, size: usize) {
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
        self.total_batch_entries
            .fetch_add(size as u64, Ordering::Relaxed);
    }

    /// Current queue depth
    pub fn queue_depth(&self) -> u64 {
        self.requests_queued.load(Ordering::Relaxed)
    }

    /// Current in-flight count
    pub fn in_flight(&self) -> u64 {
        self.requests_in_flight.load(Ordering::Relaxed)
    }

    /// Admitted entries that have settled, however they ended
    fn settled(&self) -> u64 {
        self.requests_admitted
            .load(Ordering::Relaxed)
            .saturating_sub(self.requests_in_flight.load(Ordering::Relaxed))
    }

    /// Average admission wait in milliseconds
    pub fn avg_queue_wait_ms(&self) -> f64 {
        let admitted = self.requests_admitted.load(Ordering::Relaxed);
        if admitted == 0 {
            return 0.0;
        }
        self.total_queue_wait_ms.load(Ordering::Relaxed) as f64 / admitted as f64
    }

    /// Average transport time in milliseconds
    pub fn avg_processing_ms(&self) -> f64 {
        let settled = self.settled();
        if settled == 0 {
            return 0.0;
        }
        self.total_processing_ms.load(Ordering::Relaxed) as f64 / settled as f64
    }

    /// Average number of logical queries per batch
    pub fn avg_batch_size(&self) -> f64 {
        let batches = self.batches_sent.load(Ordering::Relaxed);
        if batches == 0 {
            return 0.0;
        }
        self.total_batch_entries.load(Ordering::Relaxed) as f64 / batches as f64
    }

    /// Get a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_received: self.requests_received.load(Ordering::Relaxed),
            requests_queued: self.requests_queued.load(Ordering::Relaxed),
            requests_in_flight: self.requests_in_flight.load(Ordering::Relaxed),
            requests_admitted: self.requests_admitted.load(Ordering::Relaxed),
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            requests_cancelled: self.requests_cancelled.load(Ordering::Relaxed),
            requests_duplicate: self.requests_duplicate.load(Ordering::Relaxed),
            max_queue_depth: self.max_queue_depth.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            avg_queue_wait_ms: self.avg_queue_wait_ms(),
            avg_processing_ms: self.avg_processing_ms(),
            avg_batch_size: self.avg_batch_size(),
        }
    }
}

/// How an in-flight entry settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Resolved,
    Failed,
    Cancelled,
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub requests_received: u64,
    pub requests_queued: u64,
    pub requests_in_flight: u64,
    pub requests_admitted: u64,
    pub requests_completed: u64,
    pub requests_failed: u64,
    pub requests_cancelled: u64,
    pub requests_duplicate: u64,
    pub max_queue_depth: u64,
    pub batches_sent: u64,
    pub avg_queue_wait_ms: f64,
    pub avg_processing_ms: f64,
    pub avg_batch_size: f64,
}

/// Timer for an entry's queued and in-flight phases
#[derive(Debug, Clone, Copy)]
pub struct RequestTimer {
    pub queued_at: Instant,
    pub started_at: Option<Instant>,
}

impl RequestTimer {
    pub fn new() -> Self {
        Self {
            queued_at: Instant::now(),
            started_at: None,
        }
    }

    pub fn start_processing(&mut self) {
        self.started_at = Some(Instant::now());
    }

    pub fn queue_wait_time(&self) -> Duration {
        self.started_at
            .map(|s| s.duration_since(self.queued_at))
            .unwrap_or_else(|| self.queued_at.elapsed())
    }

    pub fn processing_time(&self) -> Duration {
        self.started_at
            .map(|s| s.elapsed())
            .unwrap_or(Duration::ZERO)
    }
}

impl Default for RequestTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = QueueMetrics::new();

        metrics.record_received();
        metrics.record_queued();
        assert_eq!(metrics.queue_depth(), 1);

        metrics.record_admitted(Duration::from_millis(100));
        assert_eq!(metrics.queue_depth(), 0);
        assert_eq!(metrics.in_flight(), 1);

        metrics.record_settled(Outcome::Resolved, Duration::from_millis(500));
        assert_eq!(metrics.in_flight(), 0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_received, 1);
        assert_eq!(snapshot.requests_completed, 1);
        assert_eq!(snapshot.avg_queue_wait_ms, 100.0);
        assert_eq!(snapshot.avg_processing_ms, 500.0);
    }

    #[test]
    fn test_max_queue_depth() {
        let metrics = QueueMetrics::new();

        for _ in 0..5 {
            metrics.record_queued();
        }
        for _ in 0..3 {
            metrics.record_dropped();
        }

        assert_eq!(metrics.max_queue_depth.load(Ordering::Relaxed), 5);
        assert_eq!(metrics.queue_depth(), 2);
        assert_eq!(metrics.snapshot().requests_cancelled, 3);
    }

    #[test]
    fn test_outcomes_counted_separately() {
        let metrics = QueueMetrics::new();

        for outcome in [Outcome::Resolved, Outcome::Failed, Outcome::Cancelled] {
            metrics.record_queued();
            metrics.record_admitted(Duration::ZERO);
            metrics.record_settled(outcome, Duration::ZERO);
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_completed, 1);
        assert_eq!(snapshot.requests_failed, 1);
        assert_eq!(snapshot.requests_cancelled, 1);
        assert_eq!(snapshot.requests_in_flight, 0);
    }

    #[test]
    fn test_averages_count_cancelled_admissions() {
        let metrics = QueueMetrics::new();

        for outcome in [Outcome::Resolved, Outcome::Cancelled] {
            metrics.record_queued();
            metrics.record_admitted(Duration::from_millis(100));
            metrics.record_settled(outcome, Duration::from_millis(40));
        }
        metrics.record_queued();
        metrics.record_admitted(Duration::from_millis(100));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_admitted, 3);
        assert_eq!(snapshot.avg_queue_wait_ms, 100.0);
        assert_eq!(snapshot.avg_processing_ms, 40.0);
    }

    #[test]
    fn test_batch_metrics() {
        let metrics = QueueMetrics::new();

        metrics.record_batch(4);
        metrics.record_batch(6);

        assert_eq!(metrics.avg_batch_size(), 5.0);
    }
}
