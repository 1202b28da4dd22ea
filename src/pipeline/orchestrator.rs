//! Pipeline orchestrator (C10).
//!
//! Topology:
//!
//! ```text
//! source (per channel) ─→ validator ─→ bandpass ─→ detector
//!        │ (raw segments into the shared SegmentBuffer)
//!        └ confirmed candidates ──→ bounded queue ──→ worker pool
//!                                                        │
//!                 committer (reorder buffer) ←── completions
//!                        │
//!                 event store ─→ tail ─→ alert dispatcher
//! ```
//!
//! The candidate queue is bounded; a full queue blocks the ingest task
//! (backpressure) rather than dropping — dropping seismic events is
//! never silent. Candidates carry sequence numbers assigned at
//! detector-emit time, and the committer restores trigger order within
//! the configured reorder window.
//!
//! Cancellation drains: ingest stops reading, the queue empties through
//! the workers, and the committer flushes its buffer before exiting, so
//! every in-flight candidate ends committed or dead-lettered.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::PipelineSettings;
use crate::detector::StaLtaDetector;
use crate::processing::{detrend, DetrendMode, StreamingBandpass};
use crate::runtime::Runtime;
use crate::types::{CandidateEvent, CandidateState};
use crate::validator::check_segment;

use super::buffer::SegmentBuffer;
use super::sequencer::{Completion, Outcome, Sequencer};
use super::source::{SegmentEvent, SegmentSource};
use super::worker;

/// How much trailing raw waveform each channel retains for gathering.
const BUFFER_RETENTION_S: f64 = 240.0;
/// Committer tick for reorder-window expiry and periodic flushing.
const COMMIT_TICK_MS: u64 = 500;

/// A running pipeline: hold to keep it alive, `shutdown()` to drain.
pub struct Pipeline {
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    buffer: Arc<SegmentBuffer>,
}

impl Pipeline {
    /// Spawn the full concurrent graph over the given per-channel
    /// sources.
    pub fn spawn(
        runtime: Arc<Runtime>,
        settings: PipelineSettings,
        detector_settings: crate::config::DetectorSettings,
        sources: Vec<Box<dyn SegmentSource>>,
        cancel: CancellationToken,
    ) -> Self {
        let buffer = Arc::new(SegmentBuffer::new(BUFFER_RETENTION_S));
        let sequence = Arc::new(AtomicU64::new(1));

        let (cand_tx, cand_rx) = mpsc::channel::<CandidateEvent>(settings.queue_capacity);
        let cand_rx = Arc::new(Mutex::new(cand_rx));
        let (done_tx, done_rx) = mpsc::channel::<Completion>(settings.queue_capacity.max(64));

        let mut tasks = JoinSet::new();

        // Ingest: one task per source/channel.
        for source in sources {
            tasks.spawn(ingest_task(
                runtime.clone(),
                detector_settings,
                source,
                buffer.clone(),
                sequence.clone(),
                cand_tx.clone(),
                done_tx.clone(),
                cancel.clone(),
            ));
        }
        drop(cand_tx);

        // Worker pool.
        for worker_id in 0..settings.worker_count.max(1) {
            tasks.spawn(worker_task(
                runtime.clone(),
                buffer.clone(),
                cand_rx.clone(),
                done_tx.clone(),
                worker_id,
            ));
        }
        drop(done_tx);

        // Committer.
        tasks.spawn(committer_task(runtime.clone(), settings, done_rx));

        info!(
            workers = settings.worker_count,
            queue_capacity = settings.queue_capacity,
            "pipeline spawned"
        );

        Self {
            cancel,
            tasks,
            buffer,
        }
    }

    pub fn buffer(&self) -> Arc<SegmentBuffer> {
        self.buffer.clone()
    }

    /// Signal cancellation and wait for the drain to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        while self.tasks.join_next().await.is_some() {}
        info!("pipeline drained and stopped");
    }

    /// Wait for the pipeline to finish on its own (sources exhausted).
    pub async fn join(mut self) {
        while self.tasks.join_next().await.is_some() {}
    }
}

/// Read segments, validate, maintain the raw buffer, run the detector,
/// and push sequenced candidates downstream with backpressure.
#[allow(clippy::too_many_arguments)]
async fn ingest_task(
    runtime: Arc<Runtime>,
    detector_settings: crate::config::DetectorSettings,
    mut source: Box<dyn SegmentSource>,
    buffer: Arc<SegmentBuffer>,
    sequence: Arc<AtomicU64>,
    cand_tx: mpsc::Sender<CandidateEvent>,
    done_tx: mpsc::Sender<Completion>,
    cancel: CancellationToken,
) {
    let mut detector: Option<StaLtaDetector> = None;
    let mut filter: Option<StreamingBandpass> = None;
    let mut expected_start_ns: Option<i64> = None;
    let bp = runtime.bandpass;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => {
                info!(source = source.source_name(), "ingest cancelled");
                break;
            }
            result = source.next_segment() => match result {
                Ok(ev) => ev,
                Err(err) => {
                    warn!(source = source.source_name(), error = %err, "source failed");
                    break;
                }
            },
        };

        let segment = match event {
            SegmentEvent::Segment(seg) => seg,
            SegmentEvent::Eof => {
                info!(source = source.source_name(), "source exhausted");
                break;
            }
        };

        // C3: structural checks. A bad segment dies alone, with a record.
        if let Err(reasons) = check_segment(&segment) {
            runtime.metrics.segments_rejected.fetch_add(1, Ordering::Relaxed);
            let _ = runtime.store.dead_letter(
                "validator",
                &reasons.join("; "),
                serde_json::json!({
                    "channel": segment.channel.to_string(),
                    "start_ns": segment.start_ns,
                }),
            );
            continue;
        }

        runtime.metrics.segments_processed.fetch_add(1, Ordering::Relaxed);
        runtime
            .metrics
            .samples_processed
            .fetch_add(segment.len() as u64, Ordering::Relaxed);

        // Raw samples go to the gather buffer before any filtering.
        buffer.insert(segment.clone());

        let det = detector.get_or_insert_with(|| {
            StaLtaDetector::new(segment.channel.clone(), detector_settings)
        });

        // C4 front end for detection: a stateful causal bandpass so
        // chunked input sees no boundary transients. A stream gap zeroes
        // the filter state (the detector applies its own gap policy).
        if filter.is_none() {
            filter = StreamingBandpass::new(bp.low_hz, bp.high_hz, segment.sample_rate, bp.order)
                .ok();
        }
        let contiguous = expected_start_ns
            .map(|expected| (segment.start_ns - expected).abs()
                < (crate::types::NANOS_PER_SEC as f64 / (2.0 * segment.sample_rate)) as i64)
            .unwrap_or(true);
        expected_start_ns = Some(segment.end_ns());

        let conditioned = match filter.as_mut() {
            Some(f) => {
                if !contiguous {
                    f.reset();
                }
                f.process(&segment)
            }
            // Rate too low for the configured band: detrended passthrough.
            None => detrend(&segment, DetrendMode::Constant),
        };

        for detection in det.process_segment(&conditioned) {
            match detection.candidate.state {
                CandidateState::Confirmed => {
                    let mut candidate = detection.candidate;
                    candidate.sequence = sequence.fetch_add(1, Ordering::SeqCst);
                    runtime.metrics.triggers_confirmed.fetch_add(1, Ordering::Relaxed);
                    runtime.metrics.enqueue();
                    // Bounded send IS the backpressure: a full queue
                    // parks this ingest task.
                    if cand_tx.send(candidate).await.is_err() {
                        warn!("candidate queue closed, stopping ingest");
                        return;
                    }
                }
                _ => {
                    runtime.metrics.triggers_rejected.fetch_add(1, Ordering::Relaxed);
                    let seq = sequence.fetch_add(1, Ordering::SeqCst);
                    let outcome =
                        worker::rejection_outcome(&detection.candidate, detection.reject_reason);
                    if done_tx
                        .send(Completion { sequence: seq, outcome })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
        }
    }
}

/// Pull candidates, process, emit completions.
async fn worker_task(
    runtime: Arc<Runtime>,
    buffer: Arc<SegmentBuffer>,
    cand_rx: Arc<Mutex<mpsc::Receiver<CandidateEvent>>>,
    done_tx: mpsc::Sender<Completion>,
    worker_id: usize,
) {
    loop {
        let candidate = {
            let mut rx = cand_rx.lock().await;
            rx.recv().await
        };
        let Some(candidate) = candidate else {
            // Queue closed and drained: ingest is done.
            break;
        };
        runtime.metrics.dequeue();

        // The candidate arrives at de-trigger time, before its post-roll
        // has streamed in; wait (bounded) for the window to fill.
        wait_for_window(&buffer, &candidate).await;

        let sequence = candidate.sequence;
        let outcome = worker::process_candidate(&runtime, candidate, &buffer);
        if done_tx.send(Completion { sequence, outcome }).await.is_err() {
            break;
        }
    }
    tracing::debug!(worker_id, "worker stopped");
}

/// Bounded wait for the candidate's full gather window. Gives up after
/// the post-roll length plus a margin; an unfillable window (stream
/// gap, source died) then dead-letters at the gather stage.
async fn wait_for_window(buffer: &SegmentBuffer, candidate: &CandidateEvent) {
    let wait_budget_ms = (candidate.post_roll.duration_s() * 1000.0) as u64 + 15_000;
    let deadline = tokio::time::Instant::now()
        + std::time::Duration::from_millis(wait_budget_ms);
    while tokio::time::Instant::now() < deadline {
        if buffer.covers(
            &candidate.channel,
            candidate.pre_roll.start_ns,
            candidate.post_roll.end_ns,
        ) {
            // Settle interval: neighbor channels feeding the locator may
            // still be landing their own segments.
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }
}

/// Restore sequence order and write to the store.
async fn committer_task(
    runtime: Arc<Runtime>,
    settings: PipelineSettings,
    mut done_rx: mpsc::Receiver<Completion>,
) {
    let mut sequencer = Sequencer::new(
        1,
        std::time::Duration::from_millis(settings.reorder_window_ms),
    );
    let mut tick = tokio::time::interval(std::time::Duration::from_millis(COMMIT_TICK_MS));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            maybe = done_rx.recv() => {
                match maybe {
                    Some(completion) => {
                        let prior = sequencer.reorder_violations();
                        for ready in sequencer.offer(completion) {
                            commit(&runtime, ready);
                        }
                        let now = sequencer.reorder_violations();
                        if now > prior {
                            runtime.metrics.reorder_violations.fetch_add(now - prior, Ordering::Relaxed);
                        }
                    }
                    None => break,
                }
            }
            _ = tick.tick() => {
                let prior = sequencer.reorder_violations();
                for ready in sequencer.flush_expired() {
                    commit(&runtime, ready);
                }
                let now = sequencer.reorder_violations();
                if now > prior {
                    runtime.metrics.reorder_violations.fetch_add(now - prior, Ordering::Relaxed);
                }
                let _ = runtime.store.flush();
            }
        }
    }

    // Drain on shutdown: nothing in flight may be lost silently.
    for ready in sequencer.drain_all() {
        commit(&runtime, ready);
    }
    let _ = runtime.store.flush();
    info!(
        committed = runtime.metrics.events_committed.load(Ordering::Relaxed),
        dead_letters = runtime.metrics.dead_letters.load(Ordering::Relaxed),
        "committer stopped"
    );
}

fn commit(runtime: &Runtime, completion: Completion) {
    match completion.outcome {
        Outcome::Classified(event) => match runtime.store.append(&event) {
            Ok(_) => {
                runtime.metrics.events_committed.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                tracing::error!(error = %err, "store append failed");
                // Store corruption is fatal to the process; the
                // supervisor restarts it and recovery reads the log.
                if matches!(err, crate::error::PipelineError::Corruption(_)) {
                    std::process::exit(2);
                }
            }
        },
        Outcome::DeadLetter { stage, reason, payload } => {
            runtime.metrics.dead_letters.fetch_add(1, Ordering::Relaxed);
            let _ = runtime.store.dead_letter(stage, &reason, payload);
        }
    }
}
