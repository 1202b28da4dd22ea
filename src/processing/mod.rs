//! Signal processing (C4): conditioning operations on waveform segments
//! plus the spectral and wavelet kernels the feature extractor builds on.
//!
//! Every operation is pure: it reads one segment and produces a new one
//! (or a scalar), never mutating its input.

mod signal;
mod spectrum;
mod wavelet;

pub use signal::{
    bandpass, detrend, quality_score, resample, snr_db, DetrendMode, StreamingBandpass,
};
pub use spectrum::{compute_spectrum, FrequencySpectrum, SpectrumProcessor};
pub use wavelet::{wavelet_level_energies, Wavelet};

use thiserror::Error;

/// Errors in signal processing.
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("insufficient data: need {needed}, have {available}")]
    InsufficientData { needed: usize, available: usize },

    #[error("invalid sampling rate: {0}")]
    InvalidSamplingRate(f64),

    #[error("invalid band: {0}")]
    InvalidBand(String),

    #[error("invalid window: {0}")]
    InvalidWindow(String),
}

impl From<ProcessingError> for crate::error::PipelineError {
    fn from(err: ProcessingError) -> Self {
        crate::error::PipelineError::Validation(err.to_string())
    }
}
