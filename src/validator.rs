//! Structural and physical-range sanity checks (C3).
//!
//! Pure per-record functions: a failing record is fatal to that record,
//! never to the pipeline. Callers route failures to the dead-letter
//! stream with the collected reasons.

use chrono::{Duration, Utc};

use crate::error::PipelineError;
use crate::types::{CatalogEvent, WaveformSegment};

/// Earliest plausible origin time for a catalog record.
const MIN_ORIGIN_YEAR: i32 = 1900;
/// Maximum plausible hypocenter depth in km.
const MAX_DEPTH_KM: f64 = 800.0;
/// Plausible magnitude range across all supported scales.
const MAGNITUDE_RANGE: (f64, f64) = (-2.0, 10.0);
/// Plausible sample-rate range in Hz.
const SAMPLE_RATE_RANGE: (f64, f64) = (0.1, 20_000.0);

/// Check a catalog event, returning every violated constraint.
pub fn check_catalog_event(event: &CatalogEvent) -> Result<(), Vec<String>> {
    let mut reasons = Vec::new();

    if event.catalog_id.is_empty() {
        reasons.push("catalog_id is empty".to_string());
    }
    if event.agency.is_empty() {
        reasons.push("agency is empty".to_string());
    }

    let origin_year = chrono::Datelike::year(&event.origin_time);
    if origin_year < MIN_ORIGIN_YEAR {
        reasons.push(format!("origin year {origin_year} before {MIN_ORIGIN_YEAR}"));
    }
    if event.origin_time > Utc::now() + Duration::hours(1) {
        reasons.push("origin time more than 1h in the future".to_string());
    }

    if !(-90.0..=90.0).contains(&event.latitude) {
        reasons.push(format!("latitude {} out of [-90, 90]", event.latitude));
    }
    if !(-180.0..=180.0).contains(&event.longitude) {
        reasons.push(format!("longitude {} out of [-180, 180]", event.longitude));
    }
    if !(0.0..=MAX_DEPTH_KM).contains(&event.depth_km) {
        reasons.push(format!("depth {} km out of [0, {MAX_DEPTH_KM}]", event.depth_km));
    }
    if !(MAGNITUDE_RANGE.0..=MAGNITUDE_RANGE.1).contains(&event.magnitude) {
        reasons.push(format!(
            "magnitude {} out of [{}, {}]",
            event.magnitude, MAGNITUDE_RANGE.0, MAGNITUDE_RANGE.1
        ));
    }

    if reasons.is_empty() {
        Ok(())
    } else {
        Err(reasons)
    }
}

/// Check a waveform segment, returning every violated constraint.
pub fn check_segment(segment: &WaveformSegment) -> Result<(), Vec<String>> {
    let mut reasons = Vec::new();

    if !(SAMPLE_RATE_RANGE.0..=SAMPLE_RATE_RANGE.1).contains(&segment.sample_rate) {
        reasons.push(format!(
            "sample rate {} Hz out of [{}, {}]",
            segment.sample_rate, SAMPLE_RATE_RANGE.0, SAMPLE_RATE_RANGE.1
        ));
    }
    if segment.samples.is_empty() {
        reasons.push("segment has no samples".to_string());
    }

    if segment.samples.iter().any(|v| !v.is_finite()) {
        reasons.push("segment contains NaN or infinite samples".to_string());
    }

    // Gap intervals must be disjoint, ordered, and strictly inside the
    // segment bounds.
    let start = segment.start_ns;
    let end = segment.end_ns();
    let mut prev_end = start;
    for gap in &segment.gaps {
        if gap.start_ns >= gap.end_ns {
            reasons.push(format!("gap [{}, {}) is empty or inverted", gap.start_ns, gap.end_ns));
            continue;
        }
        if gap.start_ns < prev_end {
            reasons.push(format!("gap starting at {} overlaps a predecessor", gap.start_ns));
        }
        if gap.start_ns <= start || gap.end_ns >= end {
            reasons.push(format!(
                "gap [{}, {}) not strictly inside segment [{start}, {end})",
                gap.start_ns, gap.end_ns
            ));
        }
        prev_end = gap.end_ns;
    }

    if reasons.is_empty() {
        Ok(())
    } else {
        Err(reasons)
    }
}

/// Convenience wrapper producing the taxonomy error for API paths.
pub fn validate_catalog_event(event: CatalogEvent) -> crate::error::Result<CatalogEvent> {
    check_catalog_event(&event)
        .map(|_| event)
        .map_err(|reasons| PipelineError::Validation(reasons.join("; ")))
}

/// Convenience wrapper producing the taxonomy error for API paths.
pub fn validate_segment(segment: WaveformSegment) -> crate::error::Result<WaveformSegment> {
    check_segment(&segment)
        .map(|_| segment)
        .map_err(|reasons| PipelineError::Validation(reasons.join("; ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChannelId, GapInterval, MagnitudeScale};
    use chrono::TimeZone;

    fn good_event() -> CatalogEvent {
        CatalogEvent {
            catalog_id: "us7000abcd".into(),
            origin_time: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
            latitude: 35.0,
            longitude: -118.0,
            depth_km: 10.0,
            magnitude: 4.2,
            magnitude_scale: MagnitudeScale::Ml,
            agency: "us".into(),
            raw: serde_json::Value::Null,
        }
    }

    fn good_segment() -> WaveformSegment {
        WaveformSegment::new(
            ChannelId::new("QW", "STA1", "00", "HHZ"),
            1_000_000_000,
            100.0,
            vec![0.5; 500],
        )
    }

    #[test]
    fn accepts_valid_records() {
        assert!(check_catalog_event(&good_event()).is_ok());
        assert!(check_segment(&good_segment()).is_ok());
    }

    #[test]
    fn collects_all_event_violations() {
        let mut ev = good_event();
        ev.latitude = 95.0;
        ev.depth_km = 1000.0;
        ev.magnitude = 12.0;
        let reasons = check_catalog_event(&ev).unwrap_err();
        assert_eq!(reasons.len(), 3);
    }

    #[test]
    fn future_origin_rejected() {
        let mut ev = good_event();
        ev.origin_time = Utc::now() + Duration::hours(2);
        assert!(check_catalog_event(&ev).is_err());
    }

    #[test]
    fn nan_samples_rejected() {
        let mut seg = good_segment();
        seg.samples[100] = f64::NAN;
        let reasons = check_segment(&seg).unwrap_err();
        assert!(reasons[0].contains("NaN"));
    }

    #[test]
    fn out_of_bounds_gap_rejected() {
        let mut seg = good_segment();
        seg.gaps.push(GapInterval {
            start_ns: 0,
            end_ns: 2_000_000_000,
        });
        assert!(check_segment(&seg).is_err());
    }

    #[test]
    fn overlapping_gaps_rejected() {
        let mut seg = good_segment();
        seg.gaps.push(GapInterval {
            start_ns: 1_500_000_000,
            end_ns: 2_500_000_000,
        });
        seg.gaps.push(GapInterval {
            start_ns: 2_000_000_000,
            end_ns: 3_000_000_000,
        });
        assert!(check_segment(&seg).is_err());
    }

    #[test]
    fn wrapper_maps_to_validation_error() {
        let mut ev = good_event();
        ev.catalog_id.clear();
        let err = validate_catalog_event(ev).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }
}
