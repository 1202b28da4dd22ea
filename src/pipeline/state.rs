//! Process-wide pipeline counters.
//!
//! Plain atomics updated from every stage and read by the `/metrics`
//! and `/status` handlers. No metrics crate: the exposition handler
//! formats these by hand.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

/// Shared counters and gauges. Wrapped in `Arc`, never locked.
pub struct PipelineMetrics {
    started_at: Instant,
    ready: AtomicBool,

    pub segments_processed: AtomicU64,
    pub samples_processed: AtomicU64,
    pub segments_rejected: AtomicU64,

    pub triggers_confirmed: AtomicU64,
    pub triggers_rejected: AtomicU64,

    pub events_committed: AtomicU64,
    pub dead_letters: AtomicU64,
    pub reorder_violations: AtomicU64,

    /// Current depth of the candidate work queue.
    pub queue_depth: AtomicI64,
    /// High-water mark of the candidate work queue.
    pub queue_peak: AtomicI64,

    pub alerts_sent: AtomicU64,
    pub alerts_deduplicated: AtomicU64,
    pub alerts_failed: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            ready: AtomicBool::new(false),
            segments_processed: AtomicU64::new(0),
            samples_processed: AtomicU64::new(0),
            segments_rejected: AtomicU64::new(0),
            triggers_confirmed: AtomicU64::new(0),
            triggers_rejected: AtomicU64::new(0),
            events_committed: AtomicU64::new(0),
            dead_letters: AtomicU64::new(0),
            reorder_violations: AtomicU64::new(0),
            queue_depth: AtomicI64::new(0),
            queue_peak: AtomicI64::new(0),
            alerts_sent: AtomicU64::new(0),
            alerts_deduplicated: AtomicU64::new(0),
            alerts_failed: AtomicU64::new(0),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn enqueue(&self) {
        let depth = self.queue_depth.fetch_add(1, Ordering::SeqCst) + 1;
        self.queue_peak.fetch_max(depth, Ordering::SeqCst);
    }

    pub fn dequeue(&self) {
        self.queue_depth.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_peak_tracks_high_water() {
        let m = PipelineMetrics::new();
        m.enqueue();
        m.enqueue();
        m.enqueue();
        m.dequeue();
        assert_eq!(m.queue_depth.load(Ordering::SeqCst), 2);
        assert_eq!(m.queue_peak.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn readiness_flips_once() {
        let m = PipelineMetrics::new();
        assert!(!m.is_ready());
        m.mark_ready();
        assert!(m.is_ready());
    }
}
