//! Feature schema and vector types.
//!
//! A schema is a versioned, ordered list of named scalar features. Any
//! extractor producing the same `schema_id` must emit the same names in
//! the same order; the classifier and magnitude models check the id
//! before inference.

use serde::{Deserialize, Serialize};

/// Named, versioned feature layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSchema {
    /// Versioned identifier, e.g. `qw-std-v1/b1-3,3-10,10-20/db4x4`.
    pub schema_id: String,
    /// Feature names in emission order.
    pub names: Vec<String>,
    /// Value emitted for undefined outcomes (e.g. dominant frequency of
    /// a flat trace). Never NaN.
    pub sentinel: f64,
}

impl FeatureSchema {
    pub fn dimension(&self) -> usize {
        self.names.len()
    }

    /// Position of a named feature, if the schema carries it.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }
}

/// Fixed-width real-valued vector conforming to a schema.
///
/// NaN is forbidden; constructors enforce it so downstream stages can
/// rely on finite values without re-checking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub schema_id: String,
    pub values: Vec<f64>,
}

impl FeatureVector {
    /// Build a vector, verifying dimension and finiteness against the schema.
    pub fn from_schema(schema: &FeatureSchema, values: Vec<f64>) -> Result<Self, String> {
        if values.len() != schema.dimension() {
            return Err(format!(
                "feature vector has {} values, schema '{}' expects {}",
                values.len(),
                schema.schema_id,
                schema.dimension()
            ));
        }
        if let Some(idx) = values.iter().position(|v| !v.is_finite()) {
            return Err(format!(
                "feature '{}' is not finite",
                schema.names.get(idx).map(String::as_str).unwrap_or("?")
            ));
        }
        Ok(Self {
            schema_id: schema.schema_id.clone(),
            values,
        })
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }
}
