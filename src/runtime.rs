//! Process runtime context.
//!
//! Built once at startup from the loaded configuration and passed down
//! through component boundaries — no component reaches for globals
//! except the read-only config handle. Holds the process-wide shared
//! resources: metrics, the event store, the model artifact handle, the
//! locator, and the external-service clients.

use std::sync::Arc;

use crate::client::{CatalogClient, WaveformClient};
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::features::FeatureExtractor;
use crate::locator::{Locator, Station, StationRegistry, TravelTimeModel};
use crate::model::{Classifier, MagnitudeEstimator, ModelArtifact, ModelHandle};
use crate::pipeline::PipelineMetrics;
use crate::store::EventStore;

/// Shared context for every component.
pub struct Runtime {
    pub metrics: Arc<PipelineMetrics>,
    pub store: Arc<EventStore>,
    pub model: ModelHandle,
    pub classifier: Classifier,
    pub magnitude: MagnitudeEstimator,
    pub locator: Arc<Locator>,
    pub extractor: Arc<FeatureExtractor>,
    pub catalog: Arc<CatalogClient>,
    pub waveform: Arc<WaveformClient>,
    /// Conditioning parameters the workers apply before extraction.
    pub bandpass: crate::config::BandpassSettings,
}

impl Runtime {
    /// Build the runtime from the initialized global config.
    ///
    /// `synthetic_model` substitutes a neutral built-in artifact for the
    /// on-disk model — demo mode and tests only.
    pub fn initialize(config: &PipelineConfig, synthetic_model: bool) -> Result<Arc<Self>> {
        let metrics = Arc::new(PipelineMetrics::new());

        let extractor = Arc::new(FeatureExtractor::from_settings(&config.features)?);

        let store = Arc::new(EventStore::open(
            &config.store.dir,
            config.store.fsync,
            &config.features.schema_id,
        )?);

        let model = if synthetic_model {
            tracing::warn!("serving the built-in synthetic model artifact");
            ModelHandle::from_artifact(ModelArtifact::synthetic_for_tests(
                &config.model.expected_schema_id,
                extractor.schema().dimension(),
            ))
        } else {
            ModelHandle::load(&config.model.path, &config.model.expected_schema_id)?
        };
        let classifier = Classifier::new(model.clone());
        let magnitude = MagnitudeEstimator::new(model.clone());

        let registry = if std::path::Path::new(&config.locator.station_file).exists() {
            StationRegistry::from_file(&config.locator.station_file)?
        } else {
            tracing::warn!(
                path = %config.locator.station_file,
                "station file missing, using the built-in demo network"
            );
            demo_registry()
        };
        let locator = Arc::new(Locator::new(
            config.locator.clone(),
            registry,
            TravelTimeModel::default_crust(),
        ));

        let catalog = Arc::new(CatalogClient::new(&config.catalog));
        let waveform = Arc::new(WaveformClient::new(&config.waveform));

        Ok(Arc::new(Self {
            metrics,
            store,
            model,
            classifier,
            magnitude,
            locator,
            extractor,
            catalog,
            waveform,
            bandpass: config.processor.bandpass,
        }))
    }
}

/// Four-station demo network around the southern California test
/// geometry; keeps zero-config startups and demos locatable.
fn demo_registry() -> StationRegistry {
    StationRegistry::from_stations(vec![
        demo_station("STA1", 35.3, -118.4),
        demo_station("STA2", 34.7, -117.6),
        demo_station("STA3", 35.4, -117.5),
        demo_station("STA4", 34.6, -118.5),
    ])
}

fn demo_station(code: &str, latitude: f64, longitude: f64) -> Station {
    Station {
        code: code.to_string(),
        network: "QW".to_string(),
        latitude,
        longitude,
        elevation_m: 0.0,
    }
}
