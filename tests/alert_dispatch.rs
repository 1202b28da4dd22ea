//! Alert dispatcher over a real store tail: rule matching, windowed
//! dedup, cursor persistence across restarts.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use quakewatch::alerts::{AlertDispatcher, AlertSubscriber};
use quakewatch::config::{AlertSettings, FsyncMode};
use quakewatch::error::Result;
use quakewatch::pipeline::PipelineMetrics;
use quakewatch::store::EventStore;
use quakewatch::types::{
    Alert, CandidateEvent, CandidateState, ChannelId, Classification, ClassifiedEvent,
    EventLabel, FeatureVector, LocationEstimate, MagnitudeEstimate, MagnitudeScale,
    PipelineTiming, TimeWindow,
};

/// Subscriber that records every delivered alert.
struct CollectingSubscriber {
    received: Arc<Mutex<Vec<Alert>>>,
}

#[async_trait]
impl AlertSubscriber for CollectingSubscriber {
    async fn deliver(&self, alert: &Alert) -> Result<()> {
        self.received.lock().await.push(alert.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "collector"
    }
}

fn event(id: &str, sequence: u64, magnitude: f64, latitude: f64) -> ClassifiedEvent {
    ClassifiedEvent {
        event_id: id.to_string(),
        sequence,
        candidate: CandidateEvent {
            detector_id: "sta_lta:QW.STA1..HHZ".into(),
            sequence,
            channel: ChannelId::new("QW", "STA1", "", "HHZ"),
            trigger_ns: sequence as i64 * 1_000_000_000,
            end_ns: sequence as i64 * 1_000_000_000 + 5_000_000_000,
            trigger_ratio: 6.0,
            state: CandidateState::Confirmed,
            pre_roll: TimeWindow { start_ns: 0, end_ns: 1 },
            post_roll: TimeWindow { start_ns: 1, end_ns: 2 },
        },
        features: FeatureVector {
            schema_id: "qw-std-v1".into(),
            values: vec![0.0],
        },
        classification: Classification {
            label: EventLabel::Earthquake,
            confidence: 0.95,
        },
        magnitude: MagnitudeEstimate {
            value: magnitude,
            low: magnitude - 0.3,
            high: magnitude + 0.3,
            scale: MagnitudeScale::Ml,
        },
        location: LocationEstimate {
            latitude,
            longitude: -118.3,
            depth_km: 8.0,
            horizontal_err_km: 2.0,
            depth_err_km: 3.0,
            rms_residual_s: 0.04,
            ellipse_major_km: 2.0,
            ellipse_minor_km: 1.0,
            ellipse_azimuth_deg: 15.0,
        },
        stations: vec!["STA1".into(), "STA2".into(), "STA3".into(), "STA4".into()],
        timing: PipelineTiming {
            detected_at: Utc::now(),
            classified_at: Utc::now(),
            processing_ms: 42,
        },
    }
}

fn fast_settings() -> AlertSettings {
    let mut settings = AlertSettings::default();
    settings.per_subscriber_rps = 100.0;
    settings
}

async fn run_dispatcher(
    store: Arc<EventStore>,
    metrics: Arc<PipelineMetrics>,
    received: Arc<Mutex<Vec<Alert>>>,
) {
    let subscriber: Arc<dyn AlertSubscriber> = Arc::new(CollectingSubscriber {
        received,
    });
    let dispatcher = AlertDispatcher::new(
        &fast_settings(),
        vec![subscriber],
        store,
        metrics,
    )
    .unwrap();

    let cancel = CancellationToken::new();
    let stop = cancel.clone();
    let task = tokio::spawn(dispatcher.run(cancel));
    tokio::time::sleep(Duration::from_millis(600)).await;
    stop.cancel();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dedups_by_region_and_resumes_from_cursor() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        EventStore::open(dir.path().join("catalog"), FsyncMode::PerWrite, "qw-std-v1").unwrap(),
    );
    let metrics = Arc::new(PipelineMetrics::new());

    // Two events in the same 1-degree cell, one in another.
    store.append(&event("ev-a", 1, 5.6, 35.2)).unwrap();
    store.append(&event("ev-b", 2, 5.8, 35.7)).unwrap();
    store.append(&event("ev-c", 3, 5.7, 36.4)).unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    run_dispatcher(store.clone(), metrics.clone(), received.clone()).await;

    {
        let alerts = received.lock().await;
        assert_eq!(alerts.len(), 2, "one alert per region cell");
        assert_eq!(alerts[0].event_id, "ev-a");
        assert_eq!(alerts[1].event_id, "ev-c");
        assert_eq!(alerts[0].dedup_key, "earthquake:35:-119");
        assert_eq!(alerts[1].dedup_key, "earthquake:36:-119");
    }
    assert_eq!(
        metrics
            .alerts_deduplicated
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );

    // Restart: the persisted cursor prevents re-alerting the backlog.
    let metrics2 = Arc::new(PipelineMetrics::new());
    run_dispatcher(store.clone(), metrics2, received.clone()).await;
    assert_eq!(received.lock().await.len(), 2, "replay must not re-alert");

    // New events after the restart still alert.
    store.append(&event("ev-d", 4, 6.0, 37.5)).unwrap();
    let metrics3 = Arc::new(PipelineMetrics::new());
    run_dispatcher(store, metrics3, received.clone()).await;
    let alerts = received.lock().await;
    assert_eq!(alerts.len(), 3);
    assert_eq!(alerts[2].event_id, "ev-d");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn live_appends_reach_subscribers() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        EventStore::open(dir.path().join("catalog"), FsyncMode::PerWrite, "qw-std-v1").unwrap(),
    );
    let metrics = Arc::new(PipelineMetrics::new());
    let received = Arc::new(Mutex::new(Vec::new()));

    let subscriber: Arc<dyn AlertSubscriber> = Arc::new(CollectingSubscriber {
        received: received.clone(),
    });
    let dispatcher =
        AlertDispatcher::new(&fast_settings(), vec![subscriber], store.clone(), metrics).unwrap();

    let cancel = CancellationToken::new();
    let stop = cancel.clone();
    let task = tokio::spawn(dispatcher.run(cancel));
    tokio::time::sleep(Duration::from_millis(150)).await;

    // Appended while the dispatcher is live: arrives via the broadcast.
    store.append(&event("ev-live", 1, 5.5, 34.2)).unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    stop.cancel();
    task.await.unwrap();

    let alerts = received.lock().await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].event_id, "ev-live");
    assert_eq!(alerts[0].level, quakewatch::types::AlertLevel::Critical);
}
