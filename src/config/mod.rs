//! Pipeline configuration.
//!
//! All operator-tunable values live in one TOML file, deserialized into
//! [`PipelineConfig`]. Every field has a default so a missing file or a
//! partial file still yields a runnable configuration.
//!
//! ## Loading order
//!
//! 1. `QUAKEWATCH_CONFIG` environment variable (path to TOML file)
//! 2. `quakewatch.toml` in the current working directory
//! 3. Built-in defaults
//!
//! ## Usage
//!
//! Call `config::init()` once at startup, then `config::get()` anywhere:
//!
//! ```ignore
//! // In main():
//! config::init(PipelineConfig::load()?);
//!
//! // Anywhere in the codebase:
//! let r_on = config::get().detector.r_on;
//! ```

pub mod defaults;
mod settings;
mod validation;

pub use settings::*;
pub use validation::{validate, ValidationOutcome};

use std::sync::OnceLock;

/// Global pipeline configuration, initialized once at startup.
static PIPELINE_CONFIG: OnceLock<PipelineConfig> = OnceLock::new();

/// Initialize the global configuration.
///
/// Must be called exactly once before any calls to `get()`. A second
/// call is ignored with a warning.
pub fn init(config: PipelineConfig) {
    if PIPELINE_CONFIG.set(config).is_err() {
        tracing::warn!("config::init() called more than once — ignoring");
    }
}

/// Get a reference to the global configuration.
///
/// Panics if `init()` has not been called: a missing config is a fatal
/// startup error, not a recoverable condition.
pub fn get() -> &'static PipelineConfig {
    PIPELINE_CONFIG
        .get()
        .expect("config::get() called before config::init() — this is a startup bug")
}

/// Check whether the config has been initialized.
///
/// Useful for tests and optional config paths.
pub fn is_initialized() -> bool {
    PIPELINE_CONFIG.get().is_some()
}
