//! Quakewatch: real-time seismic event detection and classification.
//!
//! Regional network operators feed continuous station streams and an
//! external earthquake catalog in; a validated, located, classified,
//! queryable event feed comes out with sub-minute latency.
//!
//! ## Architecture
//!
//! - **Clients**: rate-limited, cached, breaker-guarded fetchers for
//!   the catalog and waveform services
//! - **Detector**: per-channel STA/LTA trigger state machine
//! - **Processing / Features**: filters, spectra, wavelets feeding a
//!   fixed-schema feature vector
//! - **Model**: immutable artifact serving classification and magnitude
//!   with calibrated confidence
//! - **Locator**: multi-station arrival-time inversion
//! - **Pipeline**: bounded-queue orchestration with strict commit order
//! - **Store**: append-only indexed event catalog plus dead letters
//! - **Alerts**: deduplicated, rate-limited notification
//! - **API**: axum HTTP surface with SSE live tail

pub mod alerts;
pub mod api;
pub mod client;
pub mod config;
pub mod detector;
pub mod error;
pub mod features;
pub mod locator;
pub mod model;
pub mod pipeline;
pub mod processing;
pub mod runtime;
pub mod store;
pub mod types;
pub mod validator;

// Re-export the error taxonomy
pub use error::{PipelineError, Result};

// Re-export commonly used domain types
pub use types::{
    Alert, AlertLevel, CandidateEvent, CandidateState, CatalogEvent, ChannelId, Classification,
    ClassifiedEvent, EventLabel, FeatureSchema, FeatureVector, LocationEstimate,
    MagnitudeEstimate, MagnitudeScale, WaveformSegment,
};

// Re-export the runtime context
pub use runtime::Runtime;
