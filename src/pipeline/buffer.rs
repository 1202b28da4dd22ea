//! Rolling buffer of recent raw segments, per channel.
//!
//! Ingest tasks append raw (pre-filter) segments; workers read event
//! windows back out when a candidate needs its pre-roll, event, and
//! post-roll samples — for its own channel and for the neighboring
//! channels feeding the locator.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use crate::types::{ChannelId, WaveformSegment};

/// Shared per-channel retention buffer.
pub struct SegmentBuffer {
    retention_ns: i64,
    inner: RwLock<HashMap<ChannelId, VecDeque<WaveformSegment>>>,
}

impl SegmentBuffer {
    /// `retention_s` bounds how much trailing data each channel keeps.
    pub fn new(retention_s: f64) -> Self {
        Self {
            retention_ns: (retention_s * crate::types::NANOS_PER_SEC as f64) as i64,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Append a segment and evict anything past retention.
    pub fn insert(&self, segment: WaveformSegment) {
        let mut inner = self.inner.write().expect("segment buffer lock poisoned");
        let deque = inner.entry(segment.channel.clone()).or_default();
        let horizon = segment.end_ns() - self.retention_ns;
        deque.push_back(segment);
        while deque.front().map(|s| s.end_ns() < horizon).unwrap_or(false) {
            deque.pop_front();
        }
    }

    /// Channels currently holding data.
    pub fn channels(&self) -> Vec<ChannelId> {
        self.inner
            .read()
            .expect("segment buffer lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Whether `[start_ns, end_ns)` is contiguously covered for a channel.
    pub fn covers(&self, channel: &ChannelId, start_ns: i64, end_ns: i64) -> bool {
        match self.window(channel, start_ns, end_ns) {
            Some(w) => {
                let tol = (crate::types::NANOS_PER_SEC as f64 / w.sample_rate) as i64;
                w.start_ns <= start_ns + tol && w.end_ns() + tol >= end_ns
            }
            None => false,
        }
    }

    /// Extract a contiguous window `[start_ns, end_ns)` for a channel.
    ///
    /// Stitches consecutive buffered segments; returns `None` if the
    /// window is not covered (a hole inside it, or data already
    /// evicted). Partial head/tail coverage is clamped to what exists.
    pub fn window(
        &self,
        channel: &ChannelId,
        start_ns: i64,
        end_ns: i64,
    ) -> Option<WaveformSegment> {
        let inner = self.inner.read().expect("segment buffer lock poisoned");
        let deque = inner.get(channel)?;
        let mut pieces: Vec<WaveformSegment> = Vec::new();

        for seg in deque {
            if seg.end_ns() <= start_ns || seg.start_ns >= end_ns {
                continue;
            }
            pieces.push(seg.slice(start_ns.max(seg.start_ns), end_ns.min(seg.end_ns())));
        }
        if pieces.is_empty() {
            return None;
        }

        // Verify the pieces are contiguous before stitching.
        let rate = pieces[0].sample_rate;
        let tol = (crate::types::NANOS_PER_SEC as f64 / (2.0 * rate)) as i64;
        for pair in pieces.windows(2) {
            if (pair[1].start_ns - pair[0].end_ns()).abs() > tol {
                return None;
            }
        }

        let start = pieces[0].start_ns;
        let mut samples = Vec::with_capacity(pieces.iter().map(|p| p.len()).sum());
        for piece in &pieces {
            samples.extend_from_slice(&piece.samples);
        }
        Some(WaveformSegment::new(channel.clone(), start, rate, samples))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chan() -> ChannelId {
        ChannelId::new("QW", "STA1", "00", "HHZ")
    }

    fn seg(start_ns: i64, n: usize, fill: f64) -> WaveformSegment {
        WaveformSegment::new(chan(), start_ns, 100.0, vec![fill; n])
    }

    #[test]
    fn window_stitches_consecutive_segments() {
        let buffer = SegmentBuffer::new(60.0);
        buffer.insert(seg(0, 100, 1.0));
        buffer.insert(seg(1_000_000_000, 100, 2.0));
        buffer.insert(seg(2_000_000_000, 100, 3.0));

        let window = buffer
            .window(&chan(), 500_000_000, 2_500_000_000)
            .expect("window should stitch");
        assert_eq!(window.len(), 200);
        assert_eq!(window.samples[0], 1.0);
        assert_eq!(window.samples[199], 3.0);
    }

    #[test]
    fn hole_in_window_returns_none() {
        let buffer = SegmentBuffer::new(60.0);
        buffer.insert(seg(0, 100, 1.0));
        buffer.insert(seg(3_000_000_000, 100, 2.0)); // 2 s hole

        assert!(buffer.window(&chan(), 0, 4_000_000_000).is_none());
    }

    #[test]
    fn eviction_respects_retention() {
        let buffer = SegmentBuffer::new(2.0);
        for i in 0..10 {
            buffer.insert(seg(i * 1_000_000_000, 100, i as f64));
        }
        // Data older than ~2 s behind the newest end must be gone.
        assert!(buffer.window(&chan(), 0, 1_000_000_000).is_none());
        assert!(buffer
            .window(&chan(), 8_000_000_000, 10_000_000_000)
            .is_some());
    }

    #[test]
    fn unknown_channel_is_none() {
        let buffer = SegmentBuffer::new(60.0);
        assert!(buffer.window(&chan(), 0, 1_000).is_none());
    }
}
