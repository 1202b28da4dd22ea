//! Event records: external catalog events, internal detections, and the
//! fully classified events written to the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::features::FeatureVector;
use super::waveform::ChannelId;

/// Magnitude scales recognized by the catalog path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MagnitudeScale {
    Ml,
    Mw,
    Ms,
    Mb,
}

impl std::fmt::Display for MagnitudeScale {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MagnitudeScale::Ml => write!(f, "Ml"),
            MagnitudeScale::Mw => write!(f, "Mw"),
            MagnitudeScale::Ms => write!(f, "Ms"),
            MagnitudeScale::Mb => write!(f, "Mb"),
        }
    }
}

impl std::str::FromStr for MagnitudeScale {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ml" => Ok(MagnitudeScale::Ml),
            "mw" | "mww" => Ok(MagnitudeScale::Mw),
            "ms" => Ok(MagnitudeScale::Ms),
            "mb" => Ok(MagnitudeScale::Mb),
            other => Err(format!("unrecognized magnitude scale '{other}'")),
        }
    }
}

/// External-origin earthquake record. Immutable once accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEvent {
    /// Unique within the source agency.
    pub catalog_id: String,
    pub origin_time: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub depth_km: f64,
    pub magnitude: f64,
    pub magnitude_scale: MagnitudeScale,
    pub agency: String,
    /// Raw upstream payload, kept for audit.
    pub raw: serde_json::Value,
}

/// Candidate lifecycle. Terminal after `Confirmed` or `Rejected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidateState {
    Provisional,
    Confirmed,
    Rejected,
}

/// Half-open time interval `[start_ns, end_ns)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_ns: i64,
    pub end_ns: i64,
}

impl TimeWindow {
    pub fn duration_s(&self) -> f64 {
        (self.end_ns - self.start_ns) as f64 / super::NANOS_PER_SEC as f64
    }
}

/// Internal-origin detection emitted by a channel detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateEvent {
    pub detector_id: String,
    /// Monotonically increasing emit sequence assigned by the orchestrator;
    /// the store's writer commits in this order.
    pub sequence: u64,
    pub channel: ChannelId,
    /// Trigger-on instant, UTC nanoseconds.
    pub trigger_ns: i64,
    /// Event end (lag-compensated de-trigger instant).
    pub end_ns: i64,
    /// STA/LTA ratio at trigger-on.
    pub trigger_ratio: f64,
    pub state: CandidateState,
    /// `[trigger - pre_roll, trigger)`.
    pub pre_roll: TimeWindow,
    /// `[end, end + post_roll)`.
    pub post_roll: TimeWindow,
}

impl CandidateEvent {
    pub fn duration_s(&self) -> f64 {
        (self.end_ns - self.trigger_ns) as f64 / super::NANOS_PER_SEC as f64
    }
}

/// Closed label set. The model artifact declares its labels; the loader
/// rejects artifacts whose labels fall outside this set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLabel {
    Earthquake,
    Explosion,
    Volcanic,
    Noise,
}

impl std::fmt::Display for EventLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventLabel::Earthquake => write!(f, "earthquake"),
            EventLabel::Explosion => write!(f, "explosion"),
            EventLabel::Volcanic => write!(f, "volcanic"),
            EventLabel::Noise => write!(f, "noise"),
        }
    }
}

impl std::str::FromStr for EventLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "earthquake" => Ok(EventLabel::Earthquake),
            "explosion" => Ok(EventLabel::Explosion),
            "volcanic" => Ok(EventLabel::Volcanic),
            "noise" => Ok(EventLabel::Noise),
            other => Err(format!("unrecognized event label '{other}'")),
        }
    }
}

/// Classifier output: label plus calibrated probability.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Classification {
    pub label: EventLabel,
    /// Calibrated probability in `[0, 1]`.
    pub confidence: f64,
}

/// Magnitude with bootstrap confidence interval. `low <= value <= high`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MagnitudeEstimate {
    pub value: f64,
    pub low: f64,
    pub high: f64,
    pub scale: MagnitudeScale,
}

/// Hypocenter estimate with horizontal error ellipse projection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LocationEstimate {
    pub latitude: f64,
    pub longitude: f64,
    pub depth_km: f64,
    /// Semi-major axis of the 1-sigma horizontal error ellipse.
    pub horizontal_err_km: f64,
    pub depth_err_km: f64,
    pub rms_residual_s: f64,
    pub ellipse_major_km: f64,
    pub ellipse_minor_km: f64,
    /// Azimuth of the major axis, degrees clockwise from north.
    pub ellipse_azimuth_deg: f64,
}

/// Per-event latency bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineTiming {
    pub detected_at: DateTime<Utc>,
    pub classified_at: DateTime<Utc>,
    pub processing_ms: u64,
}

/// Join of a confirmed candidate with every downstream result.
/// Immutable once appended to the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedEvent {
    pub event_id: String,
    pub sequence: u64,
    pub candidate: CandidateEvent,
    pub features: FeatureVector,
    pub classification: Classification,
    pub magnitude: MagnitudeEstimate,
    pub location: LocationEstimate,
    /// Station codes that contributed arrival picks to the location.
    pub stations: Vec<String>,
    pub timing: PipelineTiming,
}

impl ClassifiedEvent {
    pub fn trigger_ns(&self) -> i64 {
        self.candidate.trigger_ns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magnitude_scale_parse() {
        assert_eq!("ml".parse::<MagnitudeScale>().unwrap(), MagnitudeScale::Ml);
        assert_eq!("Mww".parse::<MagnitudeScale>().unwrap(), MagnitudeScale::Mw);
        assert!("richter".parse::<MagnitudeScale>().is_err());
    }

    #[test]
    fn label_round_trip() {
        for label in [
            EventLabel::Earthquake,
            EventLabel::Explosion,
            EventLabel::Volcanic,
            EventLabel::Noise,
        ] {
            assert_eq!(label.to_string().parse::<EventLabel>().unwrap(), label);
        }
    }

    #[test]
    fn candidate_duration() {
        let cand = CandidateEvent {
            detector_id: "sta_lta".into(),
            sequence: 1,
            channel: ChannelId::new("QW", "STA1", "", "HHZ"),
            trigger_ns: 1_000_000_000,
            end_ns: 6_000_000_000,
            trigger_ratio: 5.0,
            state: CandidateState::Confirmed,
            pre_roll: TimeWindow {
                start_ns: 0,
                end_ns: 1_000_000_000,
            },
            post_roll: TimeWindow {
                start_ns: 6_000_000_000,
                end_ns: 7_000_000_000,
            },
        };
        assert!((cand.duration_s() - 5.0).abs() < 1e-12);
    }
}
