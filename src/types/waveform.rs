//! Waveform segment and channel identity types.

use serde::{Deserialize, Serialize};

/// Nanoseconds per second, the resolution of all instants in the pipeline.
pub const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Identity of one data stream: `(network, station, location, channel)`.
///
/// Renders as `NET.STA.LOC.CHA` (SEED convention). The location code may
/// be empty, in which case the rendered form keeps the dot separator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId {
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
}

impl ChannelId {
    pub fn new(network: &str, station: &str, location: &str, channel: &str) -> Self {
        Self {
            network: network.to_string(),
            station: station.to_string(),
            location: location.to_string(),
            channel: channel.to_string(),
        }
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.network, self.station, self.location, self.channel
        )
    }
}

impl std::str::FromStr for ChannelId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 4 {
            return Err(format!("channel id '{s}' must have 4 dot-separated parts"));
        }
        Ok(ChannelId::new(parts[0], parts[1], parts[2], parts[3]))
    }
}

/// Half-open interval `[start_ns, end_ns)` where data is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapInterval {
    pub start_ns: i64,
    pub end_ns: i64,
}

impl GapInterval {
    pub fn duration_ns(&self) -> i64 {
        self.end_ns - self.start_ns
    }
}

/// Upstream quality assessment of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityFlag {
    Good,
    Degraded,
    Suspect,
}

/// A finite contiguous run of samples for one channel.
///
/// Samples are physical units after instrument response correction.
/// Invariant (enforced by the validator, relied on everywhere):
/// `start_ns + count / sample_rate` equals the segment end within one
/// sample, gaps are disjoint and strictly inside the segment, and no
/// sample is NaN or infinite.
///
/// Segments are handed between stages by value or behind `Arc`;
/// downstream stages never mutate samples — every processing operation
/// returns a new segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaveformSegment {
    pub channel: ChannelId,
    /// Start instant, UTC nanoseconds since the epoch.
    pub start_ns: i64,
    /// Sampling rate in Hz.
    pub sample_rate: f64,
    pub samples: Vec<f64>,
    /// Disjoint `[start, end)` intervals inside the segment with no data.
    pub gaps: Vec<GapInterval>,
    pub quality: QualityFlag,
}

impl WaveformSegment {
    /// Build a gap-free segment.
    pub fn new(channel: ChannelId, start_ns: i64, sample_rate: f64, samples: Vec<f64>) -> Self {
        Self {
            channel,
            start_ns,
            sample_rate,
            samples,
            gaps: Vec::new(),
            quality: QualityFlag::Good,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// End instant: `start + count / rate`, in nanoseconds.
    pub fn end_ns(&self) -> i64 {
        self.start_ns + ((self.samples.len() as f64 / self.sample_rate) * NANOS_PER_SEC as f64) as i64
    }

    pub fn duration_s(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate
    }

    /// Instant of sample `idx`.
    pub fn sample_time_ns(&self, idx: usize) -> i64 {
        self.start_ns + ((idx as f64 / self.sample_rate) * NANOS_PER_SEC as f64) as i64
    }

    /// Index of the sample at or after `instant_ns`, clamped to the segment.
    pub fn index_at(&self, instant_ns: i64) -> usize {
        if instant_ns <= self.start_ns {
            return 0;
        }
        let offset_s = (instant_ns - self.start_ns) as f64 / NANOS_PER_SEC as f64;
        ((offset_s * self.sample_rate).ceil() as usize).min(self.samples.len())
    }

    /// Fraction of the nominal duration covered by gaps, in `[0, 1]`.
    pub fn gap_fraction(&self) -> f64 {
        let total_ns = self.end_ns() - self.start_ns;
        if total_ns <= 0 {
            return 0.0;
        }
        let gap_ns: i64 = self.gaps.iter().map(GapInterval::duration_ns).sum();
        (gap_ns as f64 / total_ns as f64).clamp(0.0, 1.0)
    }

    /// New segment with the same identity but different samples.
    ///
    /// Used by processing stages that transform samples in place of the
    /// originals without touching timing metadata.
    pub fn with_samples(&self, samples: Vec<f64>) -> Self {
        Self {
            channel: self.channel.clone(),
            start_ns: self.start_ns,
            sample_rate: self.sample_rate,
            samples,
            gaps: self.gaps.clone(),
            quality: self.quality,
        }
    }

    /// Sub-segment covering `[from_ns, to_ns)`, clamped to the segment.
    pub fn slice(&self, from_ns: i64, to_ns: i64) -> Self {
        let lo = self.index_at(from_ns);
        let hi = self.index_at(to_ns).max(lo);
        Self {
            channel: self.channel.clone(),
            start_ns: self.sample_time_ns(lo),
            sample_rate: self.sample_rate,
            samples: self.samples[lo..hi].to_vec(),
            gaps: Vec::new(),
            quality: self.quality,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chan() -> ChannelId {
        ChannelId::new("QW", "STA1", "00", "HHZ")
    }

    #[test]
    fn channel_id_round_trip() {
        let id = chan();
        assert_eq!(id.to_string(), "QW.STA1.00.HHZ");
        let parsed: ChannelId = "QW.STA1.00.HHZ".parse().unwrap();
        assert_eq!(parsed, id);
        assert!("QW.STA1".parse::<ChannelId>().is_err());
    }

    #[test]
    fn end_matches_count_over_rate() {
        let seg = WaveformSegment::new(chan(), 0, 100.0, vec![0.0; 250]);
        assert_eq!(seg.end_ns(), 2_500_000_000);
        assert!((seg.duration_s() - 2.5).abs() < 1e-12);
    }

    #[test]
    fn index_at_clamps() {
        let seg = WaveformSegment::new(chan(), 1_000_000_000, 100.0, vec![0.0; 100]);
        assert_eq!(seg.index_at(0), 0);
        assert_eq!(seg.index_at(1_500_000_000), 50);
        assert_eq!(seg.index_at(10_000_000_000), 100);
    }

    #[test]
    fn gap_fraction_bounded() {
        let mut seg = WaveformSegment::new(chan(), 0, 100.0, vec![0.0; 1000]);
        seg.gaps.push(GapInterval {
            start_ns: 1_000_000_000,
            end_ns: 2_000_000_000,
        });
        assert!((seg.gap_fraction() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn slice_keeps_rate_and_identity() {
        let samples: Vec<f64> = (0..1000).map(|i| i as f64).collect();
        let seg = WaveformSegment::new(chan(), 0, 100.0, samples);
        let sub = seg.slice(2_000_000_000, 3_000_000_000);
        assert_eq!(sub.len(), 100);
        assert_eq!(sub.samples[0], 200.0);
        assert_eq!(sub.start_ns, 2_000_000_000);
    }
}
