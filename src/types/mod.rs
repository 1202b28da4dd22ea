//! Core domain types shared across the pipeline.
//!
//! Everything that crosses a component boundary lives here: waveform
//! segments, catalog / candidate / classified events, feature vectors,
//! and alerts. All types are plain serde-serializable data; behavior
//! stays in the owning components.

mod alert;
mod event;
mod features;
mod waveform;

pub use alert::{Alert, AlertLevel};
pub use event::{
    CandidateEvent, CandidateState, CatalogEvent, Classification, ClassifiedEvent, EventLabel,
    LocationEstimate, MagnitudeEstimate, MagnitudeScale, PipelineTiming, TimeWindow,
};
pub use features::{FeatureSchema, FeatureVector};
pub use waveform::{ChannelId, GapInterval, QualityFlag, WaveformSegment, NANOS_PER_SEC};
