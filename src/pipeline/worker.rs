//! Per-candidate processing: gather → condition → features →
//! classify + magnitude → locate → classified event.
//!
//! Any per-event failure becomes a dead-letter outcome with its stage
//! and reason; workers never fail the pipeline.

use chrono::Utc;
use uuid::Uuid;

use crate::detector::REJECT_BELOW_MIN_DURATION;
use crate::locator::ArrivalPick;
use crate::processing::{bandpass, detrend, DetrendMode};
use crate::runtime::Runtime;
use crate::types::{CandidateEvent, CandidateState, ClassifiedEvent, PipelineTiming, WaveformSegment};

use super::buffer::SegmentBuffer;
use super::sequencer::Outcome;

/// Locations with RMS residual above this are low quality; the event's
/// classification confidence is halved.
const RMS_DOWNGRADE_THRESHOLD_S: f64 = 1.0;
/// Pick uncertainty assigned to threshold picks.
const PICK_SIGMA_S: f64 = 0.05;

/// Process one confirmed candidate end to end.
pub fn process_candidate(
    runtime: &Runtime,
    candidate: CandidateEvent,
    buffer: &SegmentBuffer,
) -> Outcome {
    debug_assert_eq!(candidate.state, CandidateState::Confirmed);
    let started = std::time::Instant::now();
    let detected_at = Utc::now();

    // Gather the candidate channel's window: pre-roll through post-roll.
    let window = match buffer.window(
        &candidate.channel,
        candidate.pre_roll.start_ns,
        candidate.post_roll.end_ns,
    ) {
        Some(w) => w,
        None => {
            return dead_letter(
                "gather",
                "event window not covered by buffered waveforms",
                &candidate,
            )
        }
    };

    // Condition: detrend, then the configured bandpass.
    let bp = runtime.bandpass;
    let conditioned = detrend(&window, DetrendMode::Linear);
    let conditioned = match bandpass(&conditioned, bp.low_hz, bp.high_hz, bp.order) {
        Ok(seg) => seg,
        Err(err) => return dead_letter("processor", &err.to_string(), &candidate),
    };

    // Features over the event window proper (trigger to end), falling
    // back to the full conditioned window when the slice is degenerate.
    let event_slice = conditioned.slice(candidate.trigger_ns, candidate.end_ns);
    let feature_input: &WaveformSegment = if event_slice.len() >= 16 {
        &event_slice
    } else {
        &conditioned
    };
    let features = match runtime.extractor.extract(feature_input) {
        Ok(f) => f,
        Err(err) => return dead_letter("features", &err.to_string(), &candidate),
    };

    // Classification and magnitude are independent; run them on both
    // rayon lanes.
    let scale = runtime.model.current().magnitude.scale;
    let (class_result, mag_result) = rayon::join(
        || runtime.classifier.classify(&features),
        || runtime.magnitude.estimate(&features, scale),
    );
    let mut classification = match class_result {
        Ok(c) => c,
        Err(err) => {
            // Schema mismatch must reach operators, not vanish.
            tracing::error!(error = %err, "classifier rejected feature vector");
            return dead_letter("classifier", &err.to_string(), &candidate);
        }
    };
    let magnitude = match mag_result {
        Ok(m) => m,
        Err(err) => return dead_letter("magnitude", &err.to_string(), &candidate),
    };

    // Arrival picks from every buffered channel with a known station.
    let picks = collect_picks(runtime, &candidate, buffer);
    let stations: Vec<String> = picks.iter().map(|p| p.station.clone()).collect();
    let (location, _origin_ns) = match runtime.locator.locate(&picks) {
        Ok(result) => result,
        // Covers InsufficientStations and non-convergence alike: the
        // event is a local rejection with its reason, never a drop.
        Err(err) => return dead_letter("locator", &err.to_string(), &candidate),
    };

    if location.rms_residual_s > RMS_DOWNGRADE_THRESHOLD_S {
        tracing::warn!(
            rms = location.rms_residual_s,
            "low-quality location, downgrading confidence"
        );
        classification.confidence *= 0.5;
    }

    let event = ClassifiedEvent {
        event_id: Uuid::new_v4().to_string(),
        sequence: candidate.sequence,
        candidate,
        features,
        classification,
        magnitude,
        location,
        stations,
        timing: PipelineTiming {
            detected_at,
            classified_at: Utc::now(),
            processing_ms: started.elapsed().as_millis() as u64,
        },
    };
    Outcome::Classified(Box::new(event))
}

/// Dead-letter outcome for a rejected detection (never entered the
/// worker pool).
pub fn rejection_outcome(candidate: &CandidateEvent, reason: Option<&'static str>) -> Outcome {
    Outcome::DeadLetter {
        stage: "detector",
        reason: reason.unwrap_or(REJECT_BELOW_MIN_DURATION).to_string(),
        payload: serde_json::to_value(candidate).unwrap_or(serde_json::Value::Null),
    }
}

fn dead_letter(stage: &'static str, reason: &str, candidate: &CandidateEvent) -> Outcome {
    Outcome::DeadLetter {
        stage,
        reason: reason.to_string(),
        payload: serde_json::to_value(candidate).unwrap_or(serde_json::Value::Null),
    }
}

/// Threshold picks across all buffered channels whose stations are in
/// the registry: the first sample crossing half the window's peak
/// amplitude, searched from the candidate's pre-roll.
fn collect_picks(
    runtime: &Runtime,
    candidate: &CandidateEvent,
    buffer: &SegmentBuffer,
) -> Vec<ArrivalPick> {
    let start_ns = candidate.pre_roll.start_ns;
    let end_ns = candidate.post_roll.end_ns;

    let mut picks = Vec::new();
    let mut seen_stations = std::collections::HashSet::new();

    for channel in buffer.channels() {
        if runtime.locator.registry().get(&channel.station).is_none() {
            continue;
        }
        // One pick per station, whichever channel yields it first.
        if !seen_stations.insert(channel.station.clone()) {
            continue;
        }
        let Some(window) = buffer.window(&channel, start_ns, end_ns) else {
            continue;
        };
        if let Some(time_ns) = threshold_pick(&window) {
            picks.push(ArrivalPick {
                station: channel.station.clone(),
                time_ns,
                sigma_s: PICK_SIGMA_S,
            });
        }
    }
    picks
}

/// First crossing of half the peak absolute amplitude. `None` when the
/// window has no contrast (peak below 3x the window median).
fn threshold_pick(window: &WaveformSegment) -> Option<i64> {
    let mut abs: Vec<f64> = window.samples.iter().map(|v| v.abs()).collect();
    let peak = abs.iter().cloned().fold(0.0_f64, f64::max);
    if peak <= 0.0 {
        return None;
    }
    let mid = abs.len() / 2;
    abs.select_nth_unstable_by(mid, |a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let median = abs[mid];
    if peak < 3.0 * median.max(f64::MIN_POSITIVE) {
        return None;
    }

    let threshold = 0.5 * peak;
    window
        .samples
        .iter()
        .position(|v| v.abs() >= threshold)
        .map(|idx| window.sample_time_ns(idx))
}
