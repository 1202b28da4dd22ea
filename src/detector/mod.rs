//! STA/LTA event detection (C6).
//!
//! One [`StaLtaDetector`] per channel, fed samples strictly in time
//! order. The detector keeps rolling short-term and long-term averages
//! of sample energy and walks `IDLE → ARMED → TRIGGERED` per the
//! trigger/de-trigger ratios. Candidates are emitted in trigger-instant
//! order; rejected candidates are returned too so the caller can
//! dead-letter them with a reason.
//!
//! De-trigger lag compensation: a boxcar STA trails the end of a strong
//! arrival by roughly one STA window, so the recorded event end is
//! backdated by the STA window length (clamped to the trigger instant).
//! Without this, confirmed durations overstate the signal by the window
//! length and short blips sneak past the minimum-duration gate.

use std::collections::VecDeque;

use crate::config::DetectorSettings;
use crate::types::{
    CandidateEvent, CandidateState, ChannelId, TimeWindow, WaveformSegment, NANOS_PER_SEC,
};

/// Reason attached to rejected candidates for the dead-letter stream.
pub const REJECT_BELOW_MIN_DURATION: &str = "below_min_duration";
/// Reason attached when an input gap kills an open trigger.
pub const REJECT_INPUT_GAP: &str = "input_gap";

/// Detector states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    /// Accumulating a full, gap-free LTA window.
    Idle,
    /// LTA stable; watching for the trigger ratio.
    Armed,
    /// Trigger open; LTA frozen.
    Triggered,
}

/// A finalized detection plus the reason when rejected.
#[derive(Debug, Clone)]
pub struct Detection {
    pub candidate: CandidateEvent,
    /// `Some` only for rejected candidates.
    pub reject_reason: Option<&'static str>,
}

/// Per-channel STA/LTA trigger state machine.
pub struct StaLtaDetector {
    id: String,
    channel: ChannelId,
    settings: DetectorSettings,
    state: DetectorState,

    sample_rate: f64,
    sta_win: usize,
    lta_win: usize,

    sta_buf: VecDeque<f64>,
    sta_sum: f64,
    lta_buf: VecDeque<f64>,
    lta_sum: f64,
    /// LTA value frozen at trigger-on.
    frozen_lta: f64,

    trigger_ns: i64,
    trigger_ratio: f64,
    refractory_until_ns: i64,
    /// End instant of the last processed sample, for gap detection.
    next_expected_ns: Option<i64>,
}

impl StaLtaDetector {
    pub fn new(channel: ChannelId, settings: DetectorSettings) -> Self {
        Self {
            id: format!("sta_lta:{channel}"),
            channel,
            settings,
            state: DetectorState::Idle,
            sample_rate: 0.0,
            sta_win: 0,
            lta_win: 0,
            sta_buf: VecDeque::new(),
            sta_sum: 0.0,
            lta_buf: VecDeque::new(),
            lta_sum: 0.0,
            frozen_lta: 0.0,
            trigger_ns: 0,
            trigger_ratio: 0.0,
            refractory_until_ns: i64::MIN,
            next_expected_ns: None,
        }
    }

    pub fn state(&self) -> DetectorState {
        self.state
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub fn detector_id(&self) -> &str {
        &self.id
    }

    /// Process one segment, returning finalized detections in
    /// trigger-instant order.
    pub fn process_segment(&mut self, segment: &WaveformSegment) -> Vec<Detection> {
        let mut out = Vec::new();

        if segment.is_empty() {
            return out;
        }

        // Rate change forces a full reset; the windows no longer apply.
        if self.sample_rate != segment.sample_rate {
            self.configure_rate(segment.sample_rate);
        }

        // Inter-segment discontinuity or declared in-segment gaps invoke
        // the gap policy before any sample of this segment is consumed.
        let has_gap = self.has_boundary_gap(segment) || !segment.gaps.is_empty();
        if has_gap {
            if let Some(detection) = self.apply_gap_policy(segment.start_ns) {
                out.push(detection);
            }
        }
        self.next_expected_ns = Some(segment.end_ns());

        let period_ns = (NANOS_PER_SEC as f64 / self.sample_rate) as i64;
        for (i, &v) in segment.samples.iter().enumerate() {
            let t_ns = segment.start_ns + i as i64 * period_ns;
            if let Some(detection) = self.step(v, t_ns) {
                out.push(detection);
            }
        }

        out
    }

    fn configure_rate(&mut self, rate: f64) {
        self.sample_rate = rate;
        self.sta_win = ((self.settings.sta_s * rate) as usize).max(1);
        self.lta_win = ((self.settings.lta_s * rate) as usize).max(self.sta_win + 1);
        self.reset_averages();
        self.state = DetectorState::Idle;
        self.next_expected_ns = None;
    }

    fn reset_averages(&mut self) {
        self.sta_buf.clear();
        self.sta_sum = 0.0;
        self.lta_buf.clear();
        self.lta_sum = 0.0;
    }

    fn has_boundary_gap(&self, segment: &WaveformSegment) -> bool {
        match self.next_expected_ns {
            // Contiguity tolerance: half a sample period.
            Some(expected) => {
                let tol = (NANOS_PER_SEC as f64 / (2.0 * self.sample_rate)) as i64;
                segment.start_ns > expected + tol
            }
            None => false,
        }
    }

    /// Gap policy: `TRIGGERED → ARMED` with rejection, `ARMED → IDLE`
    /// otherwise. Averages restart from scratch either way.
    fn apply_gap_policy(&mut self, gap_ns: i64) -> Option<Detection> {
        let detection = if self.state == DetectorState::Triggered {
            let candidate = self.build_candidate(CandidateState::Rejected, gap_ns.max(self.trigger_ns));
            tracing::debug!(detector = %self.id, "input gap rejected open trigger");
            Some(Detection {
                candidate,
                reject_reason: Some(REJECT_INPUT_GAP),
            })
        } else {
            None
        };

        self.state = if self.state == DetectorState::Triggered {
            DetectorState::Armed
        } else {
            DetectorState::Idle
        };
        self.reset_averages();
        detection
    }

    /// Advance one sample. At most one finalization can occur per sample.
    fn step(&mut self, value: f64, t_ns: i64) -> Option<Detection> {
        let energy = value * value;

        // STA always advances.
        self.sta_buf.push_back(energy);
        self.sta_sum += energy;
        if self.sta_buf.len() > self.sta_win {
            self.sta_sum -= self.sta_buf.pop_front().unwrap_or(0.0);
        }

        // LTA freezes while a trigger is open.
        if self.state != DetectorState::Triggered {
            self.lta_buf.push_back(energy);
            self.lta_sum += energy;
            if self.lta_buf.len() > self.lta_win {
                self.lta_sum -= self.lta_buf.pop_front().unwrap_or(0.0);
            }
        }

        match self.state {
            DetectorState::Idle => {
                // Stable means a full, contiguous LTA window.
                if self.lta_buf.len() == self.lta_win {
                    self.state = DetectorState::Armed;
                }
                None
            }
            DetectorState::Armed => {
                if t_ns < self.refractory_until_ns {
                    return None;
                }
                // A gap may have emptied the averages while leaving the
                // state ARMED; wait for a full LTA window before judging
                // ratios again.
                if self.lta_buf.len() < self.lta_win {
                    return None;
                }
                let lta = self.lta_sum / self.lta_buf.len() as f64;
                if lta <= 0.0 {
                    return None;
                }
                let ratio = (self.sta_sum / self.sta_buf.len() as f64) / lta;
                if ratio >= self.settings.r_on {
                    self.state = DetectorState::Triggered;
                    self.frozen_lta = lta;
                    self.trigger_ns = t_ns;
                    self.trigger_ratio = ratio;
                    tracing::debug!(
                        detector = %self.id,
                        ratio = format!("{ratio:.2}"),
                        "trigger on"
                    );
                }
                None
            }
            DetectorState::Triggered => {
                let ratio = (self.sta_sum / self.sta_buf.len() as f64) / self.frozen_lta;
                let elapsed_ns = t_ns - self.trigger_ns;
                let d_max_ns = (self.settings.d_max_s * NANOS_PER_SEC as f64) as i64;

                if elapsed_ns >= d_max_ns {
                    // Truncate at the maximum event duration.
                    return Some(self.finalize(self.trigger_ns + d_max_ns, t_ns, true));
                }

                if ratio <= self.settings.r_off {
                    // Backdate the end by the STA lag (clamped to trigger).
                    let sta_ns = (self.settings.sta_s * NANOS_PER_SEC as f64) as i64;
                    let end_ns = (t_ns - sta_ns).max(self.trigger_ns);
                    let duration_ns = end_ns - self.trigger_ns;
                    let confirmed = duration_meets_minimum(duration_ns, self.settings.d_min_s);
                    return Some(self.finalize(end_ns, t_ns, confirmed));
                }
                None
            }
        }
    }

    fn finalize(&mut self, end_ns: i64, now_ns: i64, confirmed: bool) -> Detection {
        let state = if confirmed {
            CandidateState::Confirmed
        } else {
            CandidateState::Rejected
        };
        let candidate = self.build_candidate(state, end_ns);

        self.state = DetectorState::Armed;
        self.refractory_until_ns =
            now_ns + (self.settings.refractory_s * NANOS_PER_SEC as f64) as i64;

        tracing::info!(
            detector = %self.id,
            confirmed,
            duration_s = format!("{:.2}", candidate.duration_s()),
            "trigger finalized"
        );

        Detection {
            candidate,
            reject_reason: (!confirmed).then_some(REJECT_BELOW_MIN_DURATION),
        }
    }

    fn build_candidate(&self, state: CandidateState, end_ns: i64) -> CandidateEvent {
        let pre_ns = (self.settings.pre_roll_s * NANOS_PER_SEC as f64) as i64;
        let post_ns = (self.settings.post_roll_s * NANOS_PER_SEC as f64) as i64;
        CandidateEvent {
            detector_id: self.id.clone(),
            sequence: 0,
            channel: self.channel.clone(),
            trigger_ns: self.trigger_ns,
            end_ns,
            trigger_ratio: self.trigger_ratio,
            state,
            pre_roll: TimeWindow {
                start_ns: self.trigger_ns - pre_ns,
                end_ns: self.trigger_ns,
            },
            post_roll: TimeWindow {
                start_ns: end_ns,
                end_ns: end_ns + post_ns,
            },
        }
    }
}

/// Duration gate at de-trigger: exactly `d_min` confirms, one sample
/// less rejects.
pub fn duration_meets_minimum(duration_ns: i64, d_min_s: f64) -> bool {
    duration_ns >= (d_min_s * NANOS_PER_SEC as f64) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectorSettings;

    const RATE: f64 = 100.0;

    fn chan() -> ChannelId {
        ChannelId::new("QW", "STA1", "00", "HHZ")
    }

    fn settings() -> DetectorSettings {
        DetectorSettings {
            sta_s: 1.0,
            lta_s: 10.0,
            r_on: 4.0,
            r_off: 2.0,
            d_min_s: 1.0,
            d_max_s: 30.0,
            pre_roll_s: 5.0,
            post_roll_s: 10.0,
            refractory_s: 5.0,
        }
    }

    /// Deterministic pseudo-noise with unit-ish variance.
    fn noise(n: usize, seed_offset: usize) -> Vec<f64> {
        (0..n)
            .map(|i| {
                let x = ((i + seed_offset) as f64 * 12.9898).sin() * 43_758.547;
                (x - x.floor()) * 2.0 - 1.0
            })
            .collect()
    }

    fn seg(samples: Vec<f64>, start_ns: i64) -> WaveformSegment {
        WaveformSegment::new(chan(), start_ns, RATE, samples)
    }

    fn gated_sine(amp: f64, freq: f64, n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| amp * (2.0 * std::f64::consts::PI * freq * i as f64 / RATE).sin())
            .collect()
    }

    #[test]
    fn idle_until_lta_window_fills() {
        let mut det = StaLtaDetector::new(chan(), settings());
        det.process_segment(&seg(noise(500, 0), 0));
        assert_eq!(det.state(), DetectorState::Idle);
        det.process_segment(&seg(noise(600, 500), 5_000_000_000));
        assert_eq!(det.state(), DetectorState::Armed);
    }

    #[test]
    fn clean_event_confirms_with_physical_duration() {
        let mut det = StaLtaDetector::new(chan(), settings());

        // 60 s noise, 5 s of 5 Hz amplitude-20 sine, 60 s noise.
        let mut samples = noise(6000, 0);
        samples.extend(gated_sine(20.0, 5.0, 500));
        samples.extend(noise(6000, 7000));

        let detections = det.process_segment(&seg(samples, 0));
        let confirmed: Vec<_> = detections
            .iter()
            .filter(|d| d.candidate.state == CandidateState::Confirmed)
            .collect();
        assert_eq!(confirmed.len(), 1, "detections: {}", detections.len());

        let cand = &confirmed[0].candidate;
        let trigger_s = cand.trigger_ns as f64 / 1e9;
        assert!(
            (trigger_s - 60.0).abs() <= 0.1,
            "trigger at {trigger_s} s, expected ~60 s"
        );
        let duration = cand.duration_s();
        assert!(
            (4.8..=5.2).contains(&duration),
            "duration {duration} s outside [4.8, 5.2]"
        );
        // Roll windows hang off the trigger and the compensated end.
        assert_eq!(cand.pre_roll.end_ns, cand.trigger_ns);
        assert_eq!(cand.post_roll.start_ns, cand.end_ns);
    }

    #[test]
    fn sub_threshold_blip_is_rejected() {
        let mut det = StaLtaDetector::new(chan(), settings());

        let mut samples = noise(6000, 0);
        samples.extend(gated_sine(20.0, 5.0, 20)); // 0.2 s transient
        samples.extend(noise(6000, 7000));

        let detections = det.process_segment(&seg(samples, 0));
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].candidate.state, CandidateState::Rejected);
        assert_eq!(detections[0].reject_reason, Some(REJECT_BELOW_MIN_DURATION));
    }

    #[test]
    fn long_event_truncates_at_d_max() {
        let mut s = settings();
        s.d_max_s = 3.0;
        let mut det = StaLtaDetector::new(chan(), s);

        let mut samples = noise(3000, 0);
        samples.extend(gated_sine(20.0, 5.0, 2000)); // 20 s, well past d_max
        samples.extend(noise(3000, 9000));

        let detections = det.process_segment(&seg(samples, 0));
        let confirmed: Vec<_> = detections
            .iter()
            .filter(|d| d.candidate.state == CandidateState::Confirmed)
            .collect();
        assert!(!confirmed.is_empty());
        let duration = confirmed[0].candidate.duration_s();
        assert!((duration - 3.0).abs() < 0.02, "duration {duration}");
    }

    #[test]
    fn gap_rejects_open_trigger_and_resets_armed_state() {
        let mut det = StaLtaDetector::new(chan(), settings());

        let mut samples = noise(3000, 0);
        samples.extend(gated_sine(20.0, 5.0, 100)); // trigger opens
        let detections = det.process_segment(&seg(samples, 0));
        assert!(detections.is_empty());
        assert_eq!(det.state(), DetectorState::Triggered);

        // Next segment starts 2 s late: gap policy fires.
        let late_start = 33_000_000_000;
        let detections = det.process_segment(&seg(noise(1000, 4000), late_start));
        let rejected: Vec<_> = detections
            .iter()
            .filter(|d| d.reject_reason == Some(REJECT_INPUT_GAP))
            .collect();
        assert_eq!(rejected.len(), 1);
    }

    #[test]
    fn armed_state_drops_to_idle_on_gap() {
        let mut det = StaLtaDetector::new(chan(), settings());
        det.process_segment(&seg(noise(2000, 0), 0));
        assert_eq!(det.state(), DetectorState::Armed);

        det.process_segment(&seg(noise(100, 3000), 25_000_000_000));
        assert_eq!(det.state(), DetectorState::Idle);
    }

    #[test]
    fn refractory_suppresses_immediate_retrigger() {
        let mut det = StaLtaDetector::new(chan(), settings());

        let mut samples = noise(3000, 0);
        samples.extend(gated_sine(20.0, 5.0, 200)); // first event (2 s)
        samples.extend(noise(200, 5000)); // 2 s quiet, inside refractory
        samples.extend(gated_sine(20.0, 5.0, 200)); // would retrigger
        samples.extend(noise(3000, 9000));

        let detections = det.process_segment(&seg(samples, 0));
        let confirmed = detections
            .iter()
            .filter(|d| d.candidate.state == CandidateState::Confirmed)
            .count();
        assert_eq!(confirmed, 1, "refractory must absorb the second burst");
    }

    #[test]
    fn trigger_instants_strictly_increase() {
        let mut s = settings();
        s.refractory_s = 1.0;
        let mut det = StaLtaDetector::new(chan(), s);

        let mut samples = noise(3000, 0);
        for burst in 0..3 {
            samples.extend(gated_sine(20.0, 5.0, 300));
            samples.extend(noise(1500, 4000 + burst * 1000));
        }

        let detections = det.process_segment(&seg(samples, 0));
        let triggers: Vec<i64> = detections.iter().map(|d| d.candidate.trigger_ns).collect();
        assert!(triggers.len() >= 2);
        assert!(triggers.windows(2).all(|w| w[0] < w[1]), "{triggers:?}");
    }

    #[test]
    fn duration_boundary_exact_min_confirms() {
        // Exactly d_min confirms; one sample (10 ms at 100 Hz) less rejects.
        assert!(duration_meets_minimum(1_000_000_000, 1.0));
        assert!(!duration_meets_minimum(1_000_000_000 - 10_000_000, 1.0));
    }
}
