//! Configuration structs and TOML loading.

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::defaults;
use crate::error::{PipelineError, Result};
use crate::types::AlertLevel;

/// Root configuration for the whole process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub server: ServerSettings,
    pub auth: AuthSettings,
    pub catalog: ServiceSettings,
    pub waveform: ServiceSettings,
    pub detector: DetectorSettings,
    pub processor: ProcessorSettings,
    pub features: FeatureSettings,
    pub model: ModelSettings,
    pub locator: LocatorSettings,
    pub pipeline: PipelineSettings,
    pub alerts: AlertSettings,
    pub store: StoreSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            auth: AuthSettings::default(),
            catalog: ServiceSettings::default(),
            waveform: ServiceSettings {
                base_url: defaults::WAVEFORM_BASE_URL.to_string(),
                ..ServiceSettings::default()
            },
            detector: DetectorSettings::default(),
            processor: ProcessorSettings::default(),
            features: FeatureSettings::default(),
            model: ModelSettings::default(),
            locator: LocatorSettings::default(),
            pipeline: PipelineSettings::default(),
            alerts: AlertSettings::default(),
            store: StoreSettings::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration using the documented precedence:
    /// `QUAKEWATCH_CONFIG` env var, then `./quakewatch.toml`, then defaults.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("QUAKEWATCH_CONFIG") {
            return Self::load_from(&path);
        }
        let local = Path::new("quakewatch.toml");
        if local.exists() {
            return Self::load_from(local);
        }
        tracing::info!("no config file found, using built-in defaults");
        Ok(Self::default())
    }

    /// Load and parse a specific TOML file.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Validation(format!("cannot read config {}: {e}", path.display()))
        })?;
        let config: PipelineConfig = toml::from_str(&raw).map_err(|e| {
            PipelineError::Validation(format!("cannot parse config {}: {e}", path.display()))
        })?;
        tracing::info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }
}

// ============================================================================
// Server / Auth
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address for the public HTTP API.
    pub addr: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            addr: defaults::SERVER_ADDR.to_string(),
        }
    }
}

/// Bearer-token validation parameters. Token issuance is external; the
/// pipeline only validates issuer, audience, expiry, and the role claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub issuer: String,
    pub audience: String,
    /// HS256 shared secret from the trust anchor. Empty disables auth
    /// (useful for tests and closed deployments).
    pub hs256_secret: String,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            issuer: "quakewatch-trust".to_string(),
            audience: "quakewatch-api".to_string(),
            hs256_secret: String::new(),
        }
    }
}

// ============================================================================
// External service clients (C1 / C2)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Maximum retry attempts after the first try.
    pub max: u32,
    /// Base backoff; attempt `i` waits `backoff_ms * 2^i` plus jitter.
    pub backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max: defaults::SERVICE_RETRY_MAX,
            backoff_ms: defaults::SERVICE_RETRY_BACKOFF_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Consecutive failures that open the breaker.
    pub threshold: u32,
    /// Open duration before a probe call is allowed.
    pub cool_down_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            threshold: defaults::SERVICE_BREAKER_THRESHOLD,
            cool_down_ms: defaults::SERVICE_BREAKER_COOL_DOWN_MS,
        }
    }
}

/// Shared shape for the catalog and waveform service clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    pub base_url: String,
    pub rate_limit_rps: f64,
    pub burst: u32,
    /// Per-call deadline.
    pub timeout_ms: u64,
    pub retry: RetrySettings,
    pub breaker: BreakerSettings,
    pub cache_ttl_s: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            base_url: defaults::CATALOG_BASE_URL.to_string(),
            rate_limit_rps: defaults::SERVICE_RATE_LIMIT_RPS,
            burst: defaults::SERVICE_BURST,
            timeout_ms: defaults::SERVICE_TIMEOUT_MS,
            retry: RetrySettings::default(),
            breaker: BreakerSettings::default(),
            cache_ttl_s: defaults::SERVICE_CACHE_TTL_S,
        }
    }
}

// ============================================================================
// Detector (C6)
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorSettings {
    pub sta_s: f64,
    pub lta_s: f64,
    pub r_on: f64,
    pub r_off: f64,
    pub d_min_s: f64,
    pub d_max_s: f64,
    pub pre_roll_s: f64,
    pub post_roll_s: f64,
    pub refractory_s: f64,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            sta_s: defaults::DETECTOR_STA_S,
            lta_s: defaults::DETECTOR_LTA_S,
            r_on: defaults::DETECTOR_R_ON,
            r_off: defaults::DETECTOR_R_OFF,
            d_min_s: defaults::DETECTOR_D_MIN_S,
            d_max_s: defaults::DETECTOR_D_MAX_S,
            pre_roll_s: defaults::DETECTOR_PRE_ROLL_S,
            post_roll_s: defaults::DETECTOR_POST_ROLL_S,
            refractory_s: defaults::DETECTOR_REFRACTORY_S,
        }
    }
}

// ============================================================================
// Signal processor (C4)
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BandpassSettings {
    pub low_hz: f64,
    pub high_hz: f64,
    pub order: u32,
}

impl Default for BandpassSettings {
    fn default() -> Self {
        Self {
            low_hz: defaults::BANDPASS_LOW_HZ,
            high_hz: defaults::BANDPASS_HIGH_HZ,
            order: defaults::BANDPASS_ORDER,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorSettings {
    pub bandpass: BandpassSettings,
}

// ============================================================================
// Feature extraction (C5)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureSettings {
    pub schema_id: String,
    /// Band-power ratio bands, `[low_hz, high_hz]` pairs.
    pub bands: Vec<[f64; 2]>,
    /// Mother wavelet: `haar` or `db4`.
    pub wavelet: String,
    pub wavelet_levels: usize,
}

impl Default for FeatureSettings {
    fn default() -> Self {
        Self {
            schema_id: defaults::FEATURES_SCHEMA_ID.to_string(),
            bands: defaults::FEATURE_BANDS.to_vec(),
            wavelet: defaults::FEATURES_WAVELET.to_string(),
            wavelet_levels: defaults::FEATURES_WAVELET_LEVELS,
        }
    }
}

// ============================================================================
// Model (C7 / C8)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub path: String,
    /// Schema the artifact must declare; mismatch is a startup error.
    pub expected_schema_id: String,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            path: defaults::MODEL_PATH.to_string(),
            expected_schema_id: defaults::FEATURES_SCHEMA_ID.to_string(),
        }
    }
}

// ============================================================================
// Locator (C9)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocatorSettings {
    pub min_stations: usize,
    pub grid_step_deg: f64,
    pub max_iter: usize,
    pub eps_km: f64,
    /// TOML station registry (code → lat/lon/elevation).
    pub station_file: String,
}

impl Default for LocatorSettings {
    fn default() -> Self {
        Self {
            min_stations: defaults::LOCATOR_MIN_STATIONS,
            grid_step_deg: defaults::LOCATOR_GRID_STEP_DEG,
            max_iter: defaults::LOCATOR_MAX_ITER,
            eps_km: defaults::LOCATOR_EPS_KM,
            station_file: defaults::LOCATOR_STATION_FILE.to_string(),
        }
    }
}

// ============================================================================
// Orchestrator (C10)
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Bounded work queue between detectors and workers. Overflow blocks
    /// upstream; candidates are never dropped.
    pub queue_capacity: usize,
    /// How long the committer buffers out-of-order completions before
    /// committing anyway and counting a reorder violation.
    pub reorder_window_ms: u64,
    pub worker_count: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            queue_capacity: defaults::PIPELINE_QUEUE_CAPACITY,
            reorder_window_ms: defaults::PIPELINE_REORDER_WINDOW_MS,
            worker_count: defaults::PIPELINE_WORKER_COUNT,
        }
    }
}

// ============================================================================
// Alerts (C12)
// ============================================================================

/// One alert rule: all present predicate fields must match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRuleSettings {
    pub label: Option<String>,
    pub min_magnitude: Option<f64>,
    pub min_confidence: Option<f64>,
    pub level: AlertLevel,
    /// Template for the dedup key; `{label}`, `{region}`, and
    /// `{event_id}` are substituted.
    pub dedup_template: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertSettings {
    pub rules: Vec<AlertRuleSettings>,
    pub dedup_window_s: u64,
    pub per_subscriber_rps: f64,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            rules: vec![
                AlertRuleSettings {
                    label: Some("earthquake".to_string()),
                    min_magnitude: Some(5.0),
                    min_confidence: None,
                    level: AlertLevel::Critical,
                    dedup_template: "{label}:{region}".to_string(),
                },
                AlertRuleSettings {
                    label: Some("earthquake".to_string()),
                    min_magnitude: Some(3.5),
                    min_confidence: None,
                    level: AlertLevel::Warn,
                    dedup_template: "{label}:{region}".to_string(),
                },
                AlertRuleSettings {
                    label: None,
                    min_magnitude: None,
                    min_confidence: Some(0.5),
                    level: AlertLevel::Info,
                    dedup_template: "{event_id}".to_string(),
                },
            ],
            dedup_window_s: defaults::ALERTS_DEDUP_WINDOW_S,
            per_subscriber_rps: defaults::ALERTS_PER_SUBSCRIBER_RPS,
        }
    }
}

// ============================================================================
// Store (C11)
// ============================================================================

/// Durability mode for the event store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsyncMode {
    /// Flush after every append.
    PerWrite,
    /// Background flush on an interval.
    Periodic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub dir: String,
    pub fsync: FsyncMode,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            dir: defaults::STORE_DIR.to_string(),
            fsync: FsyncMode::Periodic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_empty_toml() {
        let config: PipelineConfig = toml::from_str("").unwrap();
        assert_eq!(config.detector.sta_s, 1.0);
        assert_eq!(config.pipeline.queue_capacity, 256);
        assert_eq!(config.store.fsync, FsyncMode::Periodic);
        assert_eq!(config.features.bands.len(), 3);
    }

    #[test]
    fn partial_toml_overrides_only_named_keys() {
        let toml_src = r#"
            [detector]
            r_on = 6.0

            [store]
            fsync = "per_write"

            [[alerts.rules]]
            label = "earthquake"
            min_magnitude = 6.0
            level = "CRITICAL"
            dedup_template = "{label}:{region}"
        "#;
        let config: PipelineConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(config.detector.r_on, 6.0);
        // untouched sibling keeps its default
        assert_eq!(config.detector.r_off, 2.0);
        assert_eq!(config.store.fsync, FsyncMode::PerWrite);
        assert_eq!(config.alerts.rules.len(), 1);
    }

    #[test]
    fn service_settings_nested_retry() {
        let toml_src = r#"
            [catalog]
            rate_limit_rps = 2.0

            [catalog.retry]
            max = 7
        "#;
        let config: PipelineConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(config.catalog.rate_limit_rps, 2.0);
        assert_eq!(config.catalog.retry.max, 7);
        assert_eq!(config.catalog.retry.backoff_ms, 250);
    }
}
