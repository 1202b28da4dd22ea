//! Waveform conditioning: detrend, bandpass, resample, SNR, quality.
//!
//! All functions return a new segment and never mutate the input. The
//! bandpass is a cascade of Butterworth second-order sections (RBJ
//! bilinear-transform coefficients); odd orders add a reversed second
//! pass, giving zero phase at the cost of doubling the effective order.

use super::ProcessingError;
use crate::types::{TimeWindow, WaveformSegment};

/// Detrending modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetrendMode {
    /// Remove the mean.
    Constant,
    /// Remove the least-squares line.
    Linear,
}

/// Remove a constant or linear trend.
pub fn detrend(segment: &WaveformSegment, mode: DetrendMode) -> WaveformSegment {
    let x = &segment.samples;
    let n = x.len();
    if n == 0 {
        return segment.clone();
    }

    let out = match mode {
        DetrendMode::Constant => {
            let mean = x.iter().sum::<f64>() / n as f64;
            x.iter().map(|v| v - mean).collect()
        }
        DetrendMode::Linear => {
            // Least-squares fit y = a + b*t over t = 0..n-1.
            let nf = n as f64;
            let t_mean = (nf - 1.0) / 2.0;
            let y_mean = x.iter().sum::<f64>() / nf;
            let mut num = 0.0;
            let mut den = 0.0;
            for (i, &v) in x.iter().enumerate() {
                let dt = i as f64 - t_mean;
                num += dt * (v - y_mean);
                den += dt * dt;
            }
            let b = if den > 0.0 { num / den } else { 0.0 };
            let a = y_mean - b * t_mean;
            x.iter()
                .enumerate()
                .map(|(i, &v)| v - (a + b * i as f64))
                .collect()
        }
    };

    segment.with_samples(out)
}

// ============================================================================
// Butterworth cascade
// ============================================================================

/// One second-order section, direct form II transposed.
#[derive(Debug, Clone, Copy)]
struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}

impl Biquad {
    fn lowpass(f: f64, fs: f64, q: f64) -> Self {
        let w0 = 2.0 * std::f64::consts::PI * f / fs;
        let (sin_w0, cos_w0) = w0.sin_cos();
        let alpha = sin_w0 / (2.0 * q);
        let a0 = 1.0 + alpha;
        Self {
            b0: ((1.0 - cos_w0) / 2.0) / a0,
            b1: (1.0 - cos_w0) / a0,
            b2: ((1.0 - cos_w0) / 2.0) / a0,
            a1: (-2.0 * cos_w0) / a0,
            a2: (1.0 - alpha) / a0,
        }
    }

    fn highpass(f: f64, fs: f64, q: f64) -> Self {
        let w0 = 2.0 * std::f64::consts::PI * f / fs;
        let (sin_w0, cos_w0) = w0.sin_cos();
        let alpha = sin_w0 / (2.0 * q);
        let a0 = 1.0 + alpha;
        Self {
            b0: ((1.0 + cos_w0) / 2.0) / a0,
            b1: (-(1.0 + cos_w0)) / a0,
            b2: ((1.0 + cos_w0) / 2.0) / a0,
            a1: (-2.0 * cos_w0) / a0,
            a2: (1.0 - alpha) / a0,
        }
    }

    fn apply(&self, x: &[f64]) -> Vec<f64> {
        let mut out = Vec::with_capacity(x.len());
        let mut z1 = 0.0;
        let mut z2 = 0.0;
        for &v in x {
            let y = self.b0 * v + z1;
            z1 = self.b1 * v - self.a1 * y + z2;
            z2 = self.b2 * v - self.a2 * y;
            out.push(y);
        }
        out
    }
}

/// Butterworth Q values for an order-N cascade of second-order sections.
/// Odd orders carry a trailing first-order section (Q = 0.5 marker).
fn butterworth_qs(order: u32) -> Vec<f64> {
    let n = order as f64;
    let pairs = order / 2;
    let mut qs: Vec<f64> = (1..=pairs)
        .map(|k| {
            let theta = (2.0 * k as f64 - 1.0) * std::f64::consts::PI / (2.0 * n);
            1.0 / (2.0 * theta.sin())
        })
        .collect();
    if order % 2 == 1 {
        qs.push(0.5);
    }
    qs
}

fn run_cascade(samples: &[f64], low_hz: f64, high_hz: f64, fs: f64, order: u32) -> Vec<f64> {
    let mut data = samples.to_vec();
    for q in butterworth_qs(order) {
        data = Biquad::highpass(low_hz, fs, q).apply(&data);
        data = Biquad::lowpass(high_hz, fs, q).apply(&data);
    }
    data
}

/// Butterworth bandpass. Requires `0 < low_hz < high_hz < fNyquist`.
///
/// Odd orders run the cascade forward then reversed (zero phase);
/// even orders run a single forward pass.
pub fn bandpass(
    segment: &WaveformSegment,
    low_hz: f64,
    high_hz: f64,
    order: u32,
) -> Result<WaveformSegment, ProcessingError> {
    let fs = segment.sample_rate;
    if fs <= 0.0 {
        return Err(ProcessingError::InvalidSamplingRate(fs));
    }
    let nyquist = fs / 2.0;
    if low_hz <= 0.0 || high_hz <= low_hz || high_hz >= nyquist {
        return Err(ProcessingError::InvalidBand(format!(
            "bandpass [{low_hz}, {high_hz}] Hz violates 0 < low < high < {nyquist}"
        )));
    }
    if order == 0 {
        return Err(ProcessingError::InvalidBand("order must be positive".into()));
    }

    let mut data = run_cascade(&segment.samples, low_hz, high_hz, fs, order);
    if order % 2 == 1 {
        data.reverse();
        data = run_cascade(&data, low_hz, high_hz, fs, order);
        data.reverse();
    }
    Ok(segment.with_samples(data))
}

/// Stateful causal bandpass for live streams.
///
/// Same Butterworth cascade as [`bandpass`], but filter state carries
/// across segments so chunked input sees no boundary transients. Call
/// [`reset`](StreamingBandpass::reset) after a stream gap.
pub struct StreamingBandpass {
    stages: Vec<StreamingStage>,
}

struct StreamingStage {
    hp: Biquad,
    lp: Biquad,
    hp_z: (f64, f64),
    lp_z: (f64, f64),
}

impl StreamingBandpass {
    /// Same validity requirements as [`bandpass`].
    pub fn new(
        low_hz: f64,
        high_hz: f64,
        sample_rate: f64,
        order: u32,
    ) -> Result<Self, ProcessingError> {
        if sample_rate <= 0.0 {
            return Err(ProcessingError::InvalidSamplingRate(sample_rate));
        }
        let nyquist = sample_rate / 2.0;
        if low_hz <= 0.0 || high_hz <= low_hz || high_hz >= nyquist {
            return Err(ProcessingError::InvalidBand(format!(
                "bandpass [{low_hz}, {high_hz}] Hz violates 0 < low < high < {nyquist}"
            )));
        }
        if order == 0 {
            return Err(ProcessingError::InvalidBand("order must be positive".into()));
        }
        let stages = butterworth_qs(order)
            .into_iter()
            .map(|q| StreamingStage {
                hp: Biquad::highpass(low_hz, sample_rate, q),
                lp: Biquad::lowpass(high_hz, sample_rate, q),
                hp_z: (0.0, 0.0),
                lp_z: (0.0, 0.0),
            })
            .collect();
        Ok(Self { stages })
    }

    /// Filter a segment, carrying state from the previous call.
    pub fn process(&mut self, segment: &WaveformSegment) -> WaveformSegment {
        let mut out = Vec::with_capacity(segment.len());
        for &v in &segment.samples {
            let mut y = v;
            for stage in self.stages.iter_mut() {
                y = step(&stage.hp, y, &mut stage.hp_z);
                y = step(&stage.lp, y, &mut stage.lp_z);
            }
            out.push(y);
        }
        segment.with_samples(out)
    }

    /// Zero the filter state (after a stream gap).
    pub fn reset(&mut self) {
        for stage in self.stages.iter_mut() {
            stage.hp_z = (0.0, 0.0);
            stage.lp_z = (0.0, 0.0);
        }
    }
}

/// One direct-form-II-transposed step.
fn step(bq: &Biquad, v: f64, z: &mut (f64, f64)) -> f64 {
    let y = bq.b0 * v + z.0;
    z.0 = bq.b1 * v - bq.a1 * y + z.1;
    z.1 = bq.b2 * v - bq.a2 * y;
    y
}

// ============================================================================
// Resampling
// ============================================================================

/// Anti-aliased resample to `target_rate`.
///
/// Downsampling low-passes at 0.45 × target rate (order 4) before linear
/// interpolation. Upsampling is refused unless `allow_upsample` is set;
/// there is no information above the original Nyquist to recover.
pub fn resample(
    segment: &WaveformSegment,
    target_rate: f64,
    allow_upsample: bool,
) -> Result<WaveformSegment, ProcessingError> {
    let fs = segment.sample_rate;
    if target_rate <= 0.0 {
        return Err(ProcessingError::InvalidSamplingRate(target_rate));
    }
    if (target_rate - fs).abs() < f64::EPSILON {
        return Ok(segment.clone());
    }
    if target_rate > fs && !allow_upsample {
        return Err(ProcessingError::InvalidBand(format!(
            "refusing to upsample {fs} Hz to {target_rate} Hz without the upsample flag"
        )));
    }

    // Anti-alias before decimation.
    let filtered = if target_rate < fs {
        let cutoff = 0.45 * target_rate;
        let mut data = segment.samples.clone();
        for q in butterworth_qs(4) {
            data = Biquad::lowpass(cutoff, fs, q).apply(&data);
        }
        data
    } else {
        segment.samples.clone()
    };

    let duration_s = segment.samples.len() as f64 / fs;
    let out_len = (duration_s * target_rate).round() as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src_pos = i as f64 * fs / target_rate;
        let idx = src_pos.floor() as usize;
        let frac = src_pos - idx as f64;
        let v = if idx + 1 < filtered.len() {
            filtered[idx] * (1.0 - frac) + filtered[idx + 1] * frac
        } else {
            *filtered.last().unwrap_or(&0.0)
        };
        out.push(v);
    }

    let mut resampled = segment.with_samples(out);
    resampled.sample_rate = target_rate;
    Ok(resampled)
}

// ============================================================================
// SNR and quality
// ============================================================================

fn window_rms(segment: &WaveformSegment, window: TimeWindow) -> Result<f64, ProcessingError> {
    let lo = segment.index_at(window.start_ns);
    let hi = segment.index_at(window.end_ns);
    if hi <= lo {
        return Err(ProcessingError::InvalidWindow(format!(
            "window [{}, {}) selects no samples",
            window.start_ns, window.end_ns
        )));
    }
    let slice = &segment.samples[lo..hi];
    let sum_sq: f64 = slice.iter().map(|v| v * v).sum();
    Ok((sum_sq / slice.len() as f64).sqrt())
}

/// Signal-to-noise ratio in dB between two windows of the segment.
pub fn snr_db(
    segment: &WaveformSegment,
    signal_window: TimeWindow,
    noise_window: TimeWindow,
) -> Result<f64, ProcessingError> {
    let signal_rms = window_rms(segment, signal_window)?;
    let noise_rms = window_rms(segment, noise_window)?;
    if noise_rms <= 0.0 {
        // Silent noise window: treat as maximally clean.
        return Ok(f64::INFINITY);
    }
    Ok(20.0 * (signal_rms / noise_rms).log10())
}

/// Composite segment quality in `[0, 1]`.
///
/// Weighting: 0.4 × gap completeness + 0.3 × saturation headroom +
/// 0.3 × dynamic-range term. The dynamic-range term is the ratio of the
/// 95th-percentile to the median absolute amplitude, mapped through
/// `clamp(log10(ratio) / 2, 0, 1)` — flat or clipped traces score near
/// zero, impulsive traces near one.
pub fn quality_score(segment: &WaveformSegment) -> f64 {
    let n = segment.samples.len();
    if n == 0 {
        return 0.0;
    }

    let gap_term = 1.0 - segment.gap_fraction();

    let mut abs: Vec<f64> = segment.samples.iter().map(|v| v.abs()).collect();
    abs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let peak = *abs.last().unwrap_or(&0.0);

    let saturation_frac = if peak > 0.0 {
        abs.iter().filter(|&&v| v >= 0.995 * peak).count() as f64 / n as f64
    } else {
        0.0
    };
    let saturation_term = 1.0 - saturation_frac.min(1.0);

    let median = abs[n / 2];
    let p95 = abs[(n as f64 * 0.95) as usize % n];
    let range_term = if median > 0.0 && p95 > median {
        ((p95 / median).log10() / 2.0).clamp(0.0, 1.0)
    } else {
        0.0
    };

    (0.4 * gap_term + 0.3 * saturation_term + 0.3 * range_term).clamp(0.0, 1.0)
}
