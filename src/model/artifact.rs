//! Versioned model artifact: serialized linear classifier, calibration
//! curve, and magnitude regression with its held-out residuals.
//!
//! The on-disk form is JSON with a magic marker, checked at load.
//! Everything in the artifact is read-only after loading; training
//! happens in a separate pipeline and only its output ships here.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{PipelineError, Result};
use crate::types::{EventLabel, MagnitudeScale};

/// Magic marker expected in the artifact header.
pub const MODEL_MAGIC: &str = "qw-model";

/// Monotone piecewise-linear map from raw softmax probability to
/// calibrated probability (isotonic-regression output).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationCurve {
    /// Knot inputs, strictly increasing, spanning [0, 1].
    pub x: Vec<f64>,
    /// Knot outputs, non-decreasing, within [0, 1].
    pub y: Vec<f64>,
}

impl CalibrationCurve {
    /// Identity calibration.
    pub fn identity() -> Self {
        Self {
            x: vec![0.0, 1.0],
            y: vec![0.0, 1.0],
        }
    }

    /// Linear interpolation with clamped ends.
    pub fn apply(&self, p: f64) -> f64 {
        let p = p.clamp(0.0, 1.0);
        if self.x.len() < 2 {
            return p;
        }
        match self.x.iter().position(|&x| x >= p) {
            Some(0) => self.y[0],
            Some(i) => {
                let (x0, x1) = (self.x[i - 1], self.x[i]);
                let (y0, y1) = (self.y[i - 1], self.y[i]);
                let t = if x1 > x0 { (p - x0) / (x1 - x0) } else { 0.0 };
                (y0 + t * (y1 - y0)).clamp(0.0, 1.0)
            }
            None => *self.y.last().unwrap_or(&p),
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.x.len() != self.y.len() || self.x.len() < 2 {
            return Err("calibration curve needs matching x/y with >= 2 knots".into());
        }
        if self.x.windows(2).any(|w| w[1] <= w[0]) {
            return Err("calibration knot inputs must strictly increase".into());
        }
        if self.y.windows(2).any(|w| w[1] < w[0]) {
            return Err("calibration knot outputs must be non-decreasing".into());
        }
        Ok(())
    }
}

/// Magnitude regression bundled with its held-out residual sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MagnitudeModel {
    pub scale: MagnitudeScale,
    /// Linear coefficients over standardized features.
    pub coefficients: Vec<f64>,
    pub intercept: f64,
    /// Held-out residuals the bootstrap interval resamples from.
    pub residuals: Vec<f64>,
    /// Interval width parameter: the CI is the `[alpha/2, 1 - alpha/2]`
    /// bootstrap quantile range.
    pub alpha: f64,
}

/// The complete artifact as serialized to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub magic: String,
    pub version: String,
    /// Feature schema this model was trained against.
    pub schema_id: String,
    /// Closed label set, one per weight row.
    pub labels: Vec<EventLabel>,
    /// One weight row per label, over standardized features.
    pub weights: Vec<Vec<f64>>,
    pub biases: Vec<f64>,
    /// Per-feature standardization. Scales of zero are treated as one.
    pub feature_means: Vec<f64>,
    pub feature_scales: Vec<f64>,
    pub calibration: CalibrationCurve,
    pub magnitude: MagnitudeModel,
}

impl ModelArtifact {
    /// Load and structurally validate an artifact file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Validation(format!("cannot read model {}: {e}", path.display()))
        })?;
        let artifact: ModelArtifact = serde_json::from_str(&raw).map_err(|e| {
            PipelineError::Validation(format!("cannot parse model {}: {e}", path.display()))
        })?;
        artifact
            .validate()
            .map_err(|reason| PipelineError::Validation(format!("model {}: {reason}", path.display())))?;
        Ok(artifact)
    }

    /// Dimension of the feature space the model expects.
    pub fn dimension(&self) -> usize {
        self.feature_means.len()
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.magic != MODEL_MAGIC {
            return Err(format!("bad magic '{}'", self.magic));
        }
        if self.labels.is_empty() {
            return Err("artifact declares no labels".into());
        }
        if self.weights.len() != self.labels.len() || self.biases.len() != self.labels.len() {
            return Err("weights/biases must have one row per label".into());
        }
        let dim = self.feature_means.len();
        if dim == 0 || self.feature_scales.len() != dim {
            return Err("feature standardization vectors are inconsistent".into());
        }
        if self.weights.iter().any(|row| row.len() != dim) {
            return Err("weight row dimension does not match feature dimension".into());
        }
        if self.magnitude.coefficients.len() != dim {
            return Err("magnitude coefficient dimension does not match features".into());
        }
        if self.magnitude.residuals.is_empty() {
            return Err("magnitude model ships no residual sample".into());
        }
        if !(0.0..1.0).contains(&self.magnitude.alpha) {
            return Err(format!("magnitude alpha {} out of (0, 1)", self.magnitude.alpha));
        }
        self.calibration.validate()?;
        Ok(())
    }

    /// Standardize a raw feature vector into model space.
    pub fn standardize(&self, values: &[f64]) -> Vec<f64> {
        values
            .iter()
            .zip(self.feature_means.iter().zip(self.feature_scales.iter()))
            .map(|(&v, (&m, &s))| if s > 0.0 { (v - m) / s } else { v - m })
            .collect()
    }

    /// Small well-formed artifact for unit tests: neutral weights, an
    /// identity calibration, and a symmetric residual sample.
    pub fn synthetic_for_tests(schema_id: &str, dim: usize) -> Self {
        let labels = vec![
            EventLabel::Earthquake,
            EventLabel::Explosion,
            EventLabel::Volcanic,
            EventLabel::Noise,
        ];
        Self {
            magic: MODEL_MAGIC.to_string(),
            version: "test".to_string(),
            schema_id: schema_id.to_string(),
            labels: labels.clone(),
            weights: vec![vec![0.0; dim]; labels.len()],
            biases: vec![0.0; labels.len()],
            feature_means: vec![0.0; dim],
            feature_scales: vec![1.0; dim],
            calibration: CalibrationCurve::identity(),
            magnitude: MagnitudeModel {
                scale: MagnitudeScale::Ml,
                coefficients: vec![0.0; dim],
                intercept: 3.0,
                residuals: vec![-0.4, -0.2, -0.1, 0.0, 0.1, 0.2, 0.4],
                alpha: 0.05,
            },
        }
    }
}
