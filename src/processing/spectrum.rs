//! FFT computation using rustfft.
//!
//! Pre-planned forward transforms with one-sided amplitude scaling.
//! The feature extractor derives its spectral features from
//! [`FrequencySpectrum`]; the detector path never touches this module.

use ndarray::Array1;
use num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::ProcessingError;

/// One-sided frequency spectrum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrequencySpectrum {
    /// Frequency bins (Hz), DC through Nyquist.
    pub frequencies: Vec<f64>,
    /// Amplitude at each bin.
    pub magnitudes: Vec<f64>,
    /// RMS of the bin amplitudes.
    pub rms: f64,
    /// Frequency of the largest bin.
    pub peak_frequency: f64,
    /// Sampling rate the spectrum was computed at.
    pub sample_rate: f64,
}

impl FrequencySpectrum {
    /// Total power (sum of squared amplitudes) in `[low_hz, high_hz)`.
    pub fn band_power(&self, low_hz: f64, high_hz: f64) -> f64 {
        self.frequencies
            .iter()
            .zip(self.magnitudes.iter())
            .filter(|(&f, _)| f >= low_hz && f < high_hz)
            .map(|(_, &m)| m * m)
            .sum()
    }

    /// Total power across all bins.
    pub fn total_power(&self) -> f64 {
        self.magnitudes.iter().map(|m| m * m).sum()
    }
}

/// Compute the spectrum of a sample slice.
///
/// Pads to the next power of two and applies one-sided scaling.
pub fn compute_spectrum(
    samples: &[f64],
    sample_rate: f64,
) -> Result<FrequencySpectrum, ProcessingError> {
    if samples.is_empty() {
        return Err(ProcessingError::InsufficientData {
            needed: 1,
            available: 0,
        });
    }
    if sample_rate <= 0.0 {
        return Err(ProcessingError::InvalidSamplingRate(sample_rate));
    }

    let fft_size = samples.len().next_power_of_two();
    let processor = SpectrumProcessor::new(fft_size, sample_rate)?;

    let mut padded = Array1::zeros(fft_size);
    for (i, &s) in samples.iter().enumerate().take(fft_size) {
        padded[i] = s;
    }

    processor.compute(&padded)
}

/// FFT processor with a pre-planned transform for repeated computation
/// at a fixed size.
pub struct SpectrumProcessor {
    fft: Arc<dyn Fft<f64>>,
    size: usize,
    sample_rate: f64,
}

impl SpectrumProcessor {
    /// `size` is rounded up to the next power of two.
    pub fn new(size: usize, sample_rate: f64) -> Result<Self, ProcessingError> {
        if sample_rate <= 0.0 {
            return Err(ProcessingError::InvalidSamplingRate(sample_rate));
        }
        let actual_size = size.next_power_of_two();
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(actual_size);
        Ok(Self {
            fft,
            size: actual_size,
            sample_rate,
        })
    }

    /// Compute the one-sided spectrum of a real signal.
    pub fn compute(&self, signal: &Array1<f64>) -> Result<FrequencySpectrum, ProcessingError> {
        if signal.len() < self.size {
            return Err(ProcessingError::InsufficientData {
                needed: self.size,
                available: signal.len(),
            });
        }

        let mut buffer: Vec<Complex<f64>> = signal
            .iter()
            .take(self.size)
            .map(|&x| Complex::new(x, 0.0))
            .collect();

        self.fft.process(&mut buffer);

        let n_positive = self.size / 2 + 1;
        let freq_resolution = self.sample_rate / self.size as f64;

        let frequencies: Vec<f64> = (0..n_positive)
            .map(|i| i as f64 * freq_resolution)
            .collect();

        // 2/N one-sided scaling, except DC and Nyquist.
        let magnitudes: Vec<f64> = buffer
            .iter()
            .take(n_positive)
            .enumerate()
            .map(|(i, c)| {
                let scale = if i == 0 || i == n_positive - 1 {
                    1.0 / self.size as f64
                } else {
                    2.0 / self.size as f64
                };
                c.norm() * scale
            })
            .collect();

        let rms =
            (magnitudes.iter().map(|x| x.powi(2)).sum::<f64>() / magnitudes.len() as f64).sqrt();

        let peak_idx = magnitudes
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, _)| i)
            .unwrap_or(0);
        let peak_frequency = frequencies.get(peak_idx).copied().unwrap_or(0.0);

        Ok(FrequencySpectrum {
            frequencies,
            magnitudes,
            rms,
            peak_frequency,
            sample_rate: self.sample_rate,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Hz per bin.
    pub fn frequency_resolution(&self) -> f64 {
        self.sample_rate / self.size as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    #[test]
    fn processor_creation_rounds_to_power_of_two() {
        let p = SpectrumProcessor::new(1000, 1000.0).unwrap();
        assert_eq!(p.size(), 1024);
        assert!((p.frequency_resolution() - 1000.0 / 1024.0).abs() < 1e-9);
    }

    #[test]
    fn sine_peak_lands_on_its_frequency() {
        let rate = 1000.0;
        let samples: Vec<f64> = (0..1024)
            .map(|i| (2.0 * PI * 100.0 * i as f64 / rate).sin())
            .collect();
        let spectrum = compute_spectrum(&samples, rate).unwrap();
        assert!((spectrum.peak_frequency - 100.0).abs() < 2.0);
    }

    #[test]
    fn band_power_concentrates_around_tone() {
        let rate = 100.0;
        let samples: Vec<f64> = (0..2048)
            .map(|i| (2.0 * PI * 5.0 * i as f64 / rate).sin())
            .collect();
        let spectrum = compute_spectrum(&samples, rate).unwrap();
        let in_band = spectrum.band_power(3.0, 10.0);
        let out_band = spectrum.band_power(10.0, 20.0);
        assert!(in_band > 100.0 * out_band.max(1e-12));
    }

    #[test]
    fn rejects_empty_and_bad_rate() {
        assert!(compute_spectrum(&[], 100.0).is_err());
        assert!(compute_spectrum(&[1.0], 0.0).is_err());
    }
}
