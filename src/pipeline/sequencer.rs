//! Commit-order sequencer.
//!
//! Workers finish out of order; the store must see events in
//! trigger-instant order. Every candidate gets a monotonically
//! increasing sequence number at detector-emit time, and the committer
//! buffers completions until their predecessors commit. A completion
//! older than the reorder window commits anyway and counts a
//! reorder-violation — the window bounds memory, not correctness of
//! the happy path.

use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::types::ClassifiedEvent;

/// Worker completion for one sequenced candidate.
#[derive(Debug)]
pub enum Outcome {
    /// Fully processed; append to the store.
    Classified(Box<ClassifiedEvent>),
    /// Failed a stage; record in the dead-letter stream.
    DeadLetter {
        stage: &'static str,
        reason: String,
        payload: serde_json::Value,
    },
}

/// One sequenced completion.
#[derive(Debug)]
pub struct Completion {
    pub sequence: u64,
    pub outcome: Outcome,
}

/// Reorder buffer. Feed completions in any order; take commits out in
/// sequence order, except where the window expires.
pub struct Sequencer {
    next: u64,
    window: Duration,
    buffer: BTreeMap<u64, (Instant, Outcome)>,
    reorder_violations: u64,
}

impl Sequencer {
    /// `first_sequence` is the first number the detectors will emit.
    pub fn new(first_sequence: u64, window: Duration) -> Self {
        Self {
            next: first_sequence,
            window,
            buffer: BTreeMap::new(),
            reorder_violations: 0,
        }
    }

    pub fn reorder_violations(&self) -> u64 {
        self.reorder_violations
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Offer one completion; returns everything now ready to commit, in
    /// order.
    pub fn offer(&mut self, completion: Completion) -> Vec<Completion> {
        if completion.sequence < self.next {
            // Predecessors already committed past this sequence (window
            // expiry); commit immediately and count the violation.
            self.reorder_violations += 1;
            tracing::warn!(
                sequence = completion.sequence,
                expected = self.next,
                "late completion committed out of order"
            );
            return vec![completion];
        }
        self.buffer
            .insert(completion.sequence, (Instant::now(), completion.outcome));
        self.drain_ready()
    }

    /// Commit everything buffered longer than the reorder window, plus
    /// anything that becomes in-order as a result. Call on a timer.
    pub fn flush_expired(&mut self) -> Vec<Completion> {
        let now = Instant::now();
        let expired_head = self
            .buffer
            .iter()
            .next()
            .map(|(seq, (at, _))| (*seq, now.duration_since(*at) >= self.window))
            .filter(|(_, expired)| *expired)
            .map(|(seq, _)| seq);

        let mut out = Vec::new();
        if let Some(seq) = expired_head {
            // Skip the hole: everything before `seq` is declared missing.
            if seq > self.next {
                self.reorder_violations += 1;
                tracing::warn!(
                    from = self.next,
                    to = seq,
                    "reorder window expired, skipping missing sequences"
                );
            }
            self.next = seq;
            out = self.drain_ready();
        }
        out
    }

    /// Drain every remaining completion in order (shutdown path).
    pub fn drain_all(&mut self) -> Vec<Completion> {
        let mut out = Vec::new();
        let buffer = std::mem::take(&mut self.buffer);
        for (sequence, (_, outcome)) in buffer {
            self.next = sequence + 1;
            out.push(Completion { sequence, outcome });
        }
        out
    }

    fn drain_ready(&mut self) -> Vec<Completion> {
        let mut out = Vec::new();
        while let Some(entry) = self.buffer.first_entry() {
            if *entry.key() != self.next {
                break;
            }
            let (sequence, (_, outcome)) = entry.remove_entry();
            self.next = sequence + 1;
            out.push(Completion { sequence, outcome });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dead(sequence: u64) -> Completion {
        Completion {
            sequence,
            outcome: Outcome::DeadLetter {
                stage: "test",
                reason: "r".into(),
                payload: serde_json::Value::Null,
            },
        }
    }

    fn sequences(completions: &[Completion]) -> Vec<u64> {
        completions.iter().map(|c| c.sequence).collect()
    }

    #[test]
    fn in_order_completions_flow_through() {
        let mut seq = Sequencer::new(1, Duration::from_secs(30));
        assert_eq!(sequences(&seq.offer(dead(1))), vec![1]);
        assert_eq!(sequences(&seq.offer(dead(2))), vec![2]);
        assert_eq!(seq.reorder_violations(), 0);
    }

    #[test]
    fn out_of_order_buffers_until_predecessor() {
        let mut seq = Sequencer::new(1, Duration::from_secs(30));
        assert!(seq.offer(dead(3)).is_empty());
        assert!(seq.offer(dead(2)).is_empty());
        assert_eq!(seq.pending(), 2);
        assert_eq!(sequences(&seq.offer(dead(1))), vec![1, 2, 3]);
        assert_eq!(seq.pending(), 0);
        assert_eq!(seq.reorder_violations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn window_expiry_skips_the_hole() {
        let mut seq = Sequencer::new(1, Duration::from_millis(100));
        assert!(seq.offer(dead(2)).is_empty());
        assert!(seq.offer(dead(3)).is_empty());

        tokio::time::advance(Duration::from_millis(150)).await;
        let committed = seq.flush_expired();
        assert_eq!(sequences(&committed), vec![2, 3]);
        assert_eq!(seq.reorder_violations(), 1);

        // The straggler commits immediately, as another violation.
        let late = seq.offer(dead(1));
        assert_eq!(sequences(&late), vec![1]);
        assert_eq!(seq.reorder_violations(), 2);
    }

    #[test]
    fn drain_all_empties_in_order() {
        let mut seq = Sequencer::new(1, Duration::from_secs(30));
        seq.offer(dead(4));
        seq.offer(dead(2));
        let drained = seq.drain_all();
        assert_eq!(sequences(&drained), vec![2, 4]);
        assert_eq!(seq.pending(), 0);
    }
}
