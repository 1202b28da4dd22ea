//! Pipeline orchestration (C10).
//!
//! ```text
//! sources → validator → streaming bandpass → detectors
//!   └ raw segments → SegmentBuffer
//! detectors → bounded candidate queue → worker pool → committer → store
//! ```
//!
//! Backpressure is the queue bound: detectors block rather than drop.
//! Commit order is trigger-instant order via per-candidate sequence
//! numbers and the committer's reorder buffer.

mod buffer;
mod orchestrator;
mod sequencer;
mod source;
mod state;
mod worker;

pub use buffer::SegmentBuffer;
pub use orchestrator::Pipeline;
pub use sequencer::{Completion, Outcome, Sequencer};
pub use source::{LiveSource, ReplaySource, SegmentEvent, SegmentSource, SyntheticSource};
pub use state::PipelineMetrics;
pub use worker::process_candidate;
