//! Event classification (C7): softmax over the artifact's linear model,
//! calibrated through its isotonic curve.

use crate::error::{PipelineError, Result};
use crate::types::{Classification, FeatureVector};

use super::ModelHandle;

/// Classifier facade over the current model artifact.
#[derive(Clone)]
pub struct Classifier {
    model: ModelHandle,
}

impl Classifier {
    pub fn new(model: ModelHandle) -> Self {
        Self { model }
    }

    /// Classify a feature vector.
    ///
    /// Returns `SchemaMismatch` when the vector's schema id differs from
    /// the artifact's — fatal to the call, flagged to operators by the
    /// caller, never fatal to the process.
    pub fn classify(&self, features: &FeatureVector) -> Result<Classification> {
        let artifact = self.model.current();

        if features.schema_id != artifact.schema_id {
            return Err(PipelineError::SchemaMismatch {
                expected: artifact.schema_id.clone(),
                got: features.schema_id.clone(),
            });
        }
        if features.dimension() != artifact.dimension() {
            return Err(PipelineError::SchemaMismatch {
                expected: format!("{} ({}d)", artifact.schema_id, artifact.dimension()),
                got: format!("{} ({}d)", features.schema_id, features.dimension()),
            });
        }

        let z = artifact.standardize(&features.values);

        let logits: Vec<f64> = artifact
            .weights
            .iter()
            .zip(artifact.biases.iter())
            .map(|(row, &b)| row.iter().zip(z.iter()).map(|(w, x)| w * x).sum::<f64>() + b)
            .collect();

        let probs = softmax(&logits);
        let (best_idx, &best_p) = probs
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .ok_or_else(|| PipelineError::Internal("artifact has no labels".into()))?;

        Ok(Classification {
            label: artifact.labels[best_idx],
            confidence: artifact.calibration.apply(best_p),
        })
    }
}

/// Numerically stable softmax.
fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}
