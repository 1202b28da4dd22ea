//! Built-in defaults for every configuration value.
//!
//! Kept in one place so operators reading the sample TOML and engineers
//! reading the settings structs see identical numbers.

/// HTTP server bind address.
pub const SERVER_ADDR: &str = "0.0.0.0:8080";

// --- external service clients ---------------------------------------------

pub const CATALOG_BASE_URL: &str = "https://earthquake.usgs.gov/fdsnws/event/1/query";
pub const WAVEFORM_BASE_URL: &str = "http://127.0.0.1:9090/waveforms";
pub const SERVICE_RATE_LIMIT_RPS: f64 = 5.0;
pub const SERVICE_BURST: u32 = 5;
pub const SERVICE_TIMEOUT_MS: u64 = 10_000;
pub const SERVICE_RETRY_MAX: u32 = 4;
pub const SERVICE_RETRY_BACKOFF_MS: u64 = 250;
pub const SERVICE_BREAKER_THRESHOLD: u32 = 5;
pub const SERVICE_BREAKER_COOL_DOWN_MS: u64 = 10_000;
pub const SERVICE_CACHE_TTL_S: u64 = 300;

// --- detector --------------------------------------------------------------

pub const DETECTOR_STA_S: f64 = 1.0;
pub const DETECTOR_LTA_S: f64 = 10.0;
pub const DETECTOR_R_ON: f64 = 4.0;
pub const DETECTOR_R_OFF: f64 = 2.0;
pub const DETECTOR_D_MIN_S: f64 = 1.0;
pub const DETECTOR_D_MAX_S: f64 = 30.0;
pub const DETECTOR_PRE_ROLL_S: f64 = 5.0;
pub const DETECTOR_POST_ROLL_S: f64 = 10.0;
pub const DETECTOR_REFRACTORY_S: f64 = 5.0;

// --- signal processor ------------------------------------------------------

pub const BANDPASS_LOW_HZ: f64 = 1.0;
pub const BANDPASS_HIGH_HZ: f64 = 20.0;
pub const BANDPASS_ORDER: u32 = 4;

// --- feature extraction ----------------------------------------------------

pub const FEATURES_SCHEMA_ID: &str = "qw-std-v1";
/// Band-power ratio bands in Hz, `[low, high]` pairs.
pub const FEATURE_BANDS: [[f64; 2]; 3] = [[1.0, 3.0], [3.0, 10.0], [10.0, 20.0]];
pub const FEATURES_WAVELET: &str = "db4";
pub const FEATURES_WAVELET_LEVELS: usize = 4;
/// Value emitted for undefined features (flat traces etc.).
pub const FEATURE_SENTINEL: f64 = -1.0;

// --- model -----------------------------------------------------------------

pub const MODEL_PATH: &str = "./models/classifier-v1.json";

// --- locator ---------------------------------------------------------------

pub const LOCATOR_MIN_STATIONS: usize = 4;
pub const LOCATOR_GRID_STEP_DEG: f64 = 0.1;
pub const LOCATOR_MAX_ITER: usize = 20;
pub const LOCATOR_EPS_KM: f64 = 0.1;
pub const LOCATOR_STATION_FILE: &str = "./stations.toml";

// --- pipeline orchestrator -------------------------------------------------

pub const PIPELINE_QUEUE_CAPACITY: usize = 256;
pub const PIPELINE_REORDER_WINDOW_MS: u64 = 30_000;
pub const PIPELINE_WORKER_COUNT: usize = 4;

// --- alerting --------------------------------------------------------------

pub const ALERTS_DEDUP_WINDOW_S: u64 = 600;
pub const ALERTS_PER_SUBSCRIBER_RPS: f64 = 1.0;

// --- store -----------------------------------------------------------------

pub const STORE_DIR: &str = "./data/catalog";
