//! Model artifact loading and inference (C7 / C8).
//!
//! The artifact is immutable once loaded; hot reload swaps the whole
//! artifact atomically behind an `ArcSwap`, so in-flight inference
//! finishes on the old artifact and new calls see the new one.

mod artifact;
mod classifier;
mod magnitude;

pub use artifact::{CalibrationCurve, MagnitudeModel, ModelArtifact, MODEL_MAGIC};
pub use classifier::Classifier;
pub use magnitude::MagnitudeEstimator;

use arc_swap::ArcSwap;
use std::sync::Arc;

use crate::error::{PipelineError, Result};

/// Process-wide handle to the currently served artifact.
///
/// Cloning is cheap; all clones observe the same swap.
#[derive(Clone)]
pub struct ModelHandle {
    inner: Arc<ArcSwap<ModelArtifact>>,
    expected_schema_id: String,
}

impl ModelHandle {
    /// Load the initial artifact. Schema mismatch against the configured
    /// expectation is a startup failure (exit code 3 at the binary).
    pub fn load(path: &str, expected_schema_id: &str) -> Result<Self> {
        let artifact = ModelArtifact::load(path)?;
        if artifact.schema_id != expected_schema_id {
            return Err(PipelineError::SchemaMismatch {
                expected: expected_schema_id.to_string(),
                got: artifact.schema_id.clone(),
            });
        }
        tracing::info!(
            version = %artifact.version,
            schema = %artifact.schema_id,
            labels = artifact.labels.len(),
            "model artifact loaded"
        );
        Ok(Self {
            inner: Arc::new(ArcSwap::from_pointee(artifact)),
            expected_schema_id: expected_schema_id.to_string(),
        })
    }

    /// Build a handle around an already-constructed artifact (tests,
    /// embedded defaults).
    pub fn from_artifact(artifact: ModelArtifact) -> Self {
        let expected = artifact.schema_id.clone();
        Self {
            inner: Arc::new(ArcSwap::from_pointee(artifact)),
            expected_schema_id: expected,
        }
    }

    /// Current artifact snapshot.
    pub fn current(&self) -> Arc<ModelArtifact> {
        self.inner.load_full()
    }

    /// Reload from disk and swap. The old artifact keeps serving until
    /// the swap completes; a failed load leaves it in place.
    pub fn reload(&self, path: &str) -> Result<()> {
        let artifact = ModelArtifact::load(path)?;
        if artifact.schema_id != self.expected_schema_id {
            return Err(PipelineError::SchemaMismatch {
                expected: self.expected_schema_id.clone(),
                got: artifact.schema_id.clone(),
            });
        }
        let version = artifact.version.clone();
        self.inner.store(Arc::new(artifact));
        tracing::info!(version = %version, "model artifact swapped");
        Ok(())
    }
}
