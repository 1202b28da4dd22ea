//! Feature extraction (C5).
//!
//! A [`FeatureExtractor`] is built once from the feature settings and
//! produces fixed-order vectors for one schema id. Extraction is
//! deterministic: the same segment and schema id always yield the same
//! vector. Undefined outcomes (flat traces, zero total power) emit the
//! schema sentinel, never NaN.
//!
//! Feature families, in emission order:
//!
//! - time domain: peak amplitude, RMS, zero-crossing rate, envelope
//!   moments (mean, variance, skewness, kurtosis), duration above
//!   threshold;
//! - frequency domain: dominant frequency, spectral centroid,
//!   bandwidth, spectral entropy, per-band power ratios;
//! - time-frequency: wavelet detail energies per level plus the final
//!   approximation energy, normalized by total energy.

use crate::config::FeatureSettings;
use crate::error::{PipelineError, Result};
use crate::processing::{compute_spectrum, wavelet_level_energies, FrequencySpectrum, Wavelet};
use crate::types::{FeatureSchema, FeatureVector, WaveformSegment};

/// Envelope smoothing window in seconds.
const ENVELOPE_SMOOTH_S: f64 = 0.1;
/// Envelope fraction of peak that counts as "above threshold".
const DURATION_THRESHOLD_FRAC: f64 = 0.2;

/// Deterministic extractor for one feature schema.
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    schema: FeatureSchema,
    bands: Vec<[f64; 2]>,
    wavelet: Wavelet,
    wavelet_levels: usize,
}

impl FeatureExtractor {
    /// Build the extractor and its schema from configuration.
    pub fn from_settings(settings: &FeatureSettings) -> Result<Self> {
        let wavelet: Wavelet = settings
            .wavelet
            .parse()
            .map_err(PipelineError::Validation)?;

        let mut names: Vec<String> = vec![
            "peak_amplitude".into(),
            "rms".into(),
            "zero_crossing_rate".into(),
            "envelope_mean".into(),
            "envelope_variance".into(),
            "envelope_skewness".into(),
            "envelope_kurtosis".into(),
            "duration_above_threshold".into(),
            "dominant_frequency".into(),
            "spectral_centroid".into(),
            "spectral_bandwidth".into(),
            "spectral_entropy".into(),
        ];
        for band in &settings.bands {
            names.push(format!("band_power_ratio_{}_{}", band[0], band[1]));
        }
        for level in 1..=settings.wavelet_levels {
            names.push(format!("wavelet_energy_l{level}"));
        }
        names.push("wavelet_energy_approx".into());

        Ok(Self {
            schema: FeatureSchema {
                schema_id: settings.schema_id.clone(),
                names,
                sentinel: crate::config::defaults::FEATURE_SENTINEL,
            },
            bands: settings.bands.clone(),
            wavelet,
            wavelet_levels: settings.wavelet_levels,
        })
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    pub fn schema_id(&self) -> &str {
        &self.schema.schema_id
    }

    /// Extract the full vector from a processed segment.
    pub fn extract(&self, segment: &WaveformSegment) -> Result<FeatureVector> {
        if segment.is_empty() {
            return Err(PipelineError::Validation(
                "cannot extract features from an empty segment".into(),
            ));
        }

        let sentinel = self.schema.sentinel;
        let mut values = Vec::with_capacity(self.schema.dimension());

        self.time_domain(segment, &mut values);
        self.frequency_domain(segment, &mut values);
        self.time_frequency(segment, &mut values);

        // The sentinel, not NaN, marks anything a producer could not define.
        for v in values.iter_mut() {
            if !v.is_finite() {
                *v = sentinel;
            }
        }

        FeatureVector::from_schema(&self.schema, values).map_err(PipelineError::Internal)
    }

    // --- time domain -------------------------------------------------------

    fn time_domain(&self, segment: &WaveformSegment, out: &mut Vec<f64>) {
        let x = &segment.samples;
        let n = x.len() as f64;

        let peak = x.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
        let rms = (x.iter().map(|v| v * v).sum::<f64>() / n).sqrt();

        let crossings = x.windows(2).filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0)).count();
        let zcr = crossings as f64 / segment.duration_s();

        let envelope = smoothed_envelope(x, segment.sample_rate);
        let (mean, var, skew, kurt) = moments(&envelope);

        let threshold = DURATION_THRESHOLD_FRAC * peak;
        let above = envelope.iter().filter(|&&v| v >= threshold).count();
        let duration_above = if peak > 0.0 {
            above as f64 / segment.sample_rate
        } else {
            self.schema.sentinel
        };

        out.extend_from_slice(&[peak, rms, zcr, mean, var, skew, kurt, duration_above]);
    }

    // --- frequency domain --------------------------------------------------

    fn frequency_domain(&self, segment: &WaveformSegment, out: &mut Vec<f64>) {
        let sentinel = self.schema.sentinel;
        let spectrum = match compute_spectrum(&segment.samples, segment.sample_rate) {
            Ok(s) => s,
            Err(_) => {
                out.extend(std::iter::repeat(sentinel).take(4 + self.bands.len()));
                return;
            }
        };
        let total_power = spectrum.total_power();

        if total_power <= f64::EPSILON {
            // Flat trace: every spectral feature is undefined.
            out.extend(std::iter::repeat(sentinel).take(4 + self.bands.len()));
            return;
        }

        out.push(spectrum.peak_frequency);
        let (centroid, bandwidth) = centroid_and_bandwidth(&spectrum, total_power);
        out.push(centroid);
        out.push(bandwidth);
        out.push(spectral_entropy(&spectrum, total_power));

        for band in &self.bands {
            out.push(spectrum.band_power(band[0], band[1]) / total_power);
        }
    }

    // --- time-frequency ----------------------------------------------------

    fn time_frequency(&self, segment: &WaveformSegment, out: &mut Vec<f64>) {
        let sentinel = self.schema.sentinel;
        match wavelet_level_energies(&segment.samples, self.wavelet, self.wavelet_levels) {
            Ok(energies) => {
                let total: f64 = energies.iter().sum();
                if total <= f64::EPSILON {
                    out.extend(std::iter::repeat(sentinel).take(energies.len()));
                } else {
                    out.extend(energies.iter().map(|e| e / total));
                }
            }
            Err(_) => {
                // Segment shorter than 2^levels samples.
                out.extend(std::iter::repeat(sentinel).take(self.wavelet_levels + 1));
            }
        }
    }
}

/// Rectified amplitude envelope smoothed with a short moving average.
fn smoothed_envelope(x: &[f64], sample_rate: f64) -> Vec<f64> {
    let win = ((ENVELOPE_SMOOTH_S * sample_rate) as usize).max(1);
    let mut out = Vec::with_capacity(x.len());
    let mut acc = 0.0;
    let mut queue = std::collections::VecDeque::with_capacity(win);
    for &v in x {
        let a = v.abs();
        acc += a;
        queue.push_back(a);
        if queue.len() > win {
            acc -= queue.pop_front().unwrap_or(0.0);
        }
        out.push(acc / queue.len() as f64);
    }
    out
}

/// Mean, variance, skewness, excess kurtosis.
fn moments(x: &[f64]) -> (f64, f64, f64, f64) {
    let n = x.len() as f64;
    let mean = x.iter().sum::<f64>() / n;
    let var = x.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    if var <= f64::EPSILON {
        return (mean, 0.0, 0.0, 0.0);
    }
    let std = var.sqrt();
    let skew = x.iter().map(|v| ((v - mean) / std).powi(3)).sum::<f64>() / n;
    let kurt = x.iter().map(|v| ((v - mean) / std).powi(4)).sum::<f64>() / n - 3.0;
    (mean, var, skew, kurt)
}

fn centroid_and_bandwidth(spectrum: &FrequencySpectrum, total_power: f64) -> (f64, f64) {
    let centroid: f64 = spectrum
        .frequencies
        .iter()
        .zip(spectrum.magnitudes.iter())
        .map(|(&f, &m)| f * m * m)
        .sum::<f64>()
        / total_power;
    let variance: f64 = spectrum
        .frequencies
        .iter()
        .zip(spectrum.magnitudes.iter())
        .map(|(&f, &m)| (f - centroid).powi(2) * m * m)
        .sum::<f64>()
        / total_power;
    (centroid, variance.sqrt())
}

/// Normalized Shannon entropy of the power distribution, in `[0, 1]`.
fn spectral_entropy(spectrum: &FrequencySpectrum, total_power: f64) -> f64 {
    let n = spectrum.magnitudes.len();
    if n < 2 {
        return 0.0;
    }
    let entropy: f64 = spectrum
        .magnitudes
        .iter()
        .map(|&m| {
            let p = m * m / total_power;
            if p > 0.0 {
                -p * p.ln()
            } else {
                0.0
            }
        })
        .sum();
    entropy / (n as f64).ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChannelId;
    use std::f64::consts::PI;

    fn extractor() -> FeatureExtractor {
        FeatureExtractor::from_settings(&FeatureSettings::default()).unwrap()
    }

    fn seg(samples: Vec<f64>) -> WaveformSegment {
        WaveformSegment::new(ChannelId::new("QW", "STA1", "00", "HHZ"), 0, 100.0, samples)
    }

    fn tone(freq: f64, amp: f64, n: usize) -> Vec<f64> {
        (0..n).map(|i| amp * (2.0 * PI * freq * i as f64 / 100.0).sin()).collect()
    }

    #[test]
    fn schema_dimension_matches_settings() {
        let ex = extractor();
        // 8 time + 4 spectral + 3 bands + 4 wavelet levels + 1 approx.
        assert_eq!(ex.schema().dimension(), 8 + 4 + 3 + 4 + 1);
        assert_eq!(ex.schema_id(), "qw-std-v1");
    }

    #[test]
    fn extraction_is_deterministic() {
        let ex = extractor();
        let s = seg(tone(5.0, 3.0, 1024));
        let a = ex.extract(&s).unwrap();
        let b = ex.extract(&s).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn tone_features_are_physical() {
        let ex = extractor();
        let s = seg(tone(5.0, 3.0, 2048));
        let v = ex.extract(&s).unwrap();
        let schema = ex.schema();

        let peak = v.values[schema.index_of("peak_amplitude").unwrap()];
        assert!((peak - 3.0).abs() < 0.01);

        let rms = v.values[schema.index_of("rms").unwrap()];
        assert!((rms - 3.0 / 2f64.sqrt()).abs() < 0.05);

        let dom = v.values[schema.index_of("dominant_frequency").unwrap()];
        assert!((dom - 5.0).abs() < 0.5);

        // 5 Hz tone: the 3-10 Hz band dominates.
        let b2 = v.values[schema.index_of("band_power_ratio_3_10").unwrap()];
        assert!(b2 > 0.8, "band ratio {b2}");

        // ~10 zero crossings per second at 5 Hz.
        let zcr = v.values[schema.index_of("zero_crossing_rate").unwrap()];
        assert!((zcr - 10.0).abs() < 1.0, "zcr {zcr}");
    }

    #[test]
    fn flat_trace_uses_sentinel_not_nan() {
        let ex = extractor();
        let v = ex.extract(&seg(vec![0.0; 1024])).unwrap();
        let schema = ex.schema();
        let sentinel = schema.sentinel;

        assert_eq!(v.values[schema.index_of("dominant_frequency").unwrap()], sentinel);
        assert_eq!(
            v.values[schema.index_of("duration_above_threshold").unwrap()],
            sentinel
        );
        assert!(v.values.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn wavelet_ratios_sum_to_one_for_live_trace() {
        let ex = extractor();
        let v = ex.extract(&seg(tone(8.0, 1.0, 1024))).unwrap();
        let schema = ex.schema();
        let sum: f64 = (1..=4)
            .map(|l| v.values[schema.index_of(&format!("wavelet_energy_l{l}")).unwrap()])
            .sum::<f64>()
            + v.values[schema.index_of("wavelet_energy_approx").unwrap()];
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn short_segment_fails_cleanly() {
        let ex = extractor();
        assert!(ex.extract(&seg(vec![])).is_err());
    }
}
