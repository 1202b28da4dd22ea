//! Discrete wavelet decomposition for time-frequency features.
//!
//! Mallat cascade with periodic extension. Two mother wavelets are
//! supported — Haar and Daubechies-4 — which covers the configured
//! feature schemas; adding a wavelet means adding its analysis filters
//! here and its name to config validation.

use super::ProcessingError;

/// Supported mother wavelets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wavelet {
    Haar,
    Db4,
}

impl std::str::FromStr for Wavelet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "haar" => Ok(Wavelet::Haar),
            "db4" => Ok(Wavelet::Db4),
            other => Err(format!("unsupported wavelet '{other}'")),
        }
    }
}

impl Wavelet {
    /// Analysis low-pass (scaling) filter coefficients.
    fn lowpass(&self) -> &'static [f64] {
        match self {
            Wavelet::Haar => &HAAR_LO,
            Wavelet::Db4 => &DB4_LO,
        }
    }
}

const HAAR_LO: [f64; 2] = [std::f64::consts::FRAC_1_SQRT_2, std::f64::consts::FRAC_1_SQRT_2];

// Daubechies-4 scaling coefficients (orthonormal form).
const DB4_LO: [f64; 8] = [
    0.230_377_813_308_855_2,
    0.714_846_570_552_541_5,
    0.630_880_767_929_590_4,
    -0.027_983_769_416_983_85,
    -0.187_034_811_718_881_14,
    0.030_841_381_835_986_965,
    0.032_883_011_666_982_945,
    -0.010_597_401_784_997_278,
];

/// Quadrature mirror of the low-pass filter.
fn highpass_of(lo: &[f64]) -> Vec<f64> {
    lo.iter()
        .rev()
        .enumerate()
        .map(|(i, &h)| if i % 2 == 0 { h } else { -h })
        .collect()
}

/// One analysis step: periodic convolution + downsample by two.
/// Returns (approximation, detail).
fn analysis_step(signal: &[f64], lo: &[f64], hi: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let n = signal.len();
    let half = n / 2;
    let mut approx = Vec::with_capacity(half);
    let mut detail = Vec::with_capacity(half);
    for k in 0..half {
        let mut a = 0.0;
        let mut d = 0.0;
        for (t, (&l, &h)) in lo.iter().zip(hi.iter()).enumerate() {
            let idx = (2 * k + t) % n;
            a += l * signal[idx];
            d += h * signal[idx];
        }
        approx.push(a);
        detail.push(d);
    }
    (approx, detail)
}

/// Per-level detail energies of a `levels`-deep decomposition, finest
/// level first, with the final approximation energy appended.
///
/// Output length is `levels + 1`. Requires at least `2^levels` samples.
pub fn wavelet_level_energies(
    samples: &[f64],
    wavelet: Wavelet,
    levels: usize,
) -> Result<Vec<f64>, ProcessingError> {
    let min_len = 1usize << levels;
    if samples.len() < min_len {
        return Err(ProcessingError::InsufficientData {
            needed: min_len,
            available: samples.len(),
        });
    }

    let lo = wavelet.lowpass();
    let hi = highpass_of(lo);

    // Truncate to an even length at each step via periodic wrap; work on
    // an owned copy so the input is untouched.
    let mut current: Vec<f64> = samples.to_vec();
    if current.len() % 2 == 1 {
        current.pop();
    }

    let mut energies = Vec::with_capacity(levels + 1);
    for _ in 0..levels {
        let (approx, detail) = analysis_step(&current, lo, &hi);
        energies.push(detail.iter().map(|v| v * v).sum());
        current = approx;
        if current.len() % 2 == 1 {
            current.pop();
        }
        if current.len() < 2 {
            break;
        }
    }
    // Pad with zero energies if the cascade bottomed out early.
    while energies.len() < levels {
        energies.push(0.0);
    }
    energies.push(current.iter().map(|v| v * v).sum());

    Ok(energies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    #[test]
    fn wavelet_parse() {
        assert_eq!("haar".parse::<Wavelet>().unwrap(), Wavelet::Haar);
        assert_eq!("DB4".parse::<Wavelet>().unwrap(), Wavelet::Db4);
        assert!("sym8".parse::<Wavelet>().is_err());
    }

    #[test]
    fn db4_filters_are_orthonormal() {
        let sum_sq: f64 = DB4_LO.iter().map(|v| v * v).sum();
        assert!((sum_sq - 1.0).abs() < 1e-9);
        let sum: f64 = DB4_LO.iter().sum();
        assert!((sum - std::f64::consts::SQRT_2).abs() < 1e-9);
    }

    #[test]
    fn energy_is_preserved_by_one_haar_step() {
        let signal: Vec<f64> = (0..256).map(|i| (i as f64 * 0.17).sin()).collect();
        let hi = highpass_of(&HAAR_LO);
        let (approx, detail) = analysis_step(&signal, &HAAR_LO, &hi);
        let in_energy: f64 = signal.iter().map(|v| v * v).sum();
        let out_energy: f64 =
            approx.iter().map(|v| v * v).sum::<f64>() + detail.iter().map(|v| v * v).sum::<f64>();
        assert!((in_energy - out_energy).abs() / in_energy < 1e-9);
    }

    #[test]
    fn high_frequency_energy_lands_in_fine_levels() {
        let rate = 100.0;
        // Nyquist-adjacent tone: detail level 1 should dominate.
        let fast: Vec<f64> = (0..512).map(|i| (PI * i as f64).cos()).collect();
        let energies = wavelet_level_energies(&fast, Wavelet::Haar, 4).unwrap();
        let total: f64 = energies.iter().sum();
        assert!(energies[0] / total > 0.9, "energies {energies:?}");

        // Slow tone: approximation should dominate.
        let slow: Vec<f64> = (0..512)
            .map(|i| (2.0 * PI * 0.5 * i as f64 / rate).sin())
            .collect();
        let energies = wavelet_level_energies(&slow, Wavelet::Db4, 4).unwrap();
        let total: f64 = energies.iter().sum();
        assert!(energies[4] / total > 0.5, "energies {energies:?}");
    }

    #[test]
    fn output_length_is_levels_plus_one() {
        let signal = vec![1.0; 128];
        let energies = wavelet_level_energies(&signal, Wavelet::Db4, 5).unwrap();
        assert_eq!(energies.len(), 6);
    }

    #[test]
    fn too_short_input_rejected() {
        let signal = vec![1.0; 8];
        assert!(wavelet_level_energies(&signal, Wavelet::Haar, 4).is_err());
    }
}
