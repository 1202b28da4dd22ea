//! Alert dispatch (C12).
//!
//! Consumes the store tail, evaluates the configured rule set against
//! each classified event, deduplicates by templated key within the
//! dedup window, and delivers to subscribers under a per-subscriber
//! token bucket. Delivery is at-least-once: subscribers must be
//! idempotent on `event_id`. The tail cursor persists in the store, so
//! a restarted dispatcher resumes where it stopped.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::TokenBucket;
use crate::config::{AlertRuleSettings, AlertSettings};
use crate::error::Result;
use crate::pipeline::PipelineMetrics;
use crate::store::EventStore;
use crate::types::{Alert, AlertLevel, ClassifiedEvent, EventLabel};

/// Cursor name under which the dispatcher persists its position.
const CURSOR_NAME: &str = "alert-dispatcher";
/// Delivery attempts per subscriber before the failure is logged and
/// the dispatcher moves on.
const DELIVERY_ATTEMPTS: u32 = 3;
/// Deadline for one token-bucket wait per delivery.
const DELIVERY_TOKEN_WAIT: Duration = Duration::from_secs(30);

// ============================================================================
// Rules
// ============================================================================

/// One compiled rule: all present predicate fields must match.
#[derive(Debug, Clone)]
pub struct AlertRule {
    label: Option<EventLabel>,
    min_magnitude: Option<f64>,
    min_confidence: Option<f64>,
    level: AlertLevel,
    dedup_template: String,
}

impl AlertRule {
    /// Compile from config; unknown labels were already rejected by
    /// config validation.
    pub fn compile(settings: &AlertRuleSettings) -> Result<Self> {
        let label = match &settings.label {
            Some(raw) => Some(
                raw.parse::<EventLabel>()
                    .map_err(crate::error::PipelineError::Validation)?,
            ),
            None => None,
        };
        Ok(Self {
            label,
            min_magnitude: settings.min_magnitude,
            min_confidence: settings.min_confidence,
            level: settings.level,
            dedup_template: settings.dedup_template.clone(),
        })
    }

    fn matches(&self, event: &ClassifiedEvent) -> bool {
        if let Some(label) = self.label {
            if event.classification.label != label {
                return false;
            }
        }
        if let Some(min_mag) = self.min_magnitude {
            if event.magnitude.value < min_mag {
                return false;
            }
        }
        if let Some(min_conf) = self.min_confidence {
            if event.classification.confidence < min_conf {
                return false;
            }
        }
        true
    }

    /// Substitute `{label}`, `{region}` (1° cell), and `{event_id}`.
    fn dedup_key(&self, event: &ClassifiedEvent) -> String {
        let region = format!(
            "{}:{}",
            event.location.latitude.floor() as i64,
            event.location.longitude.floor() as i64
        );
        self.dedup_template
            .replace("{label}", &event.classification.label.to_string())
            .replace("{region}", &region)
            .replace("{event_id}", &event.event_id)
    }
}

/// Rule evaluation plus windowed dedup state.
pub struct AlertEngine {
    rules: Vec<AlertRule>,
    dedup_window: Duration,
    /// dedup key → (first alert instant, suppressed count).
    seen: HashMap<String, (Instant, u64)>,
}

/// Outcome of evaluating one event.
#[derive(Debug, PartialEq)]
pub enum Evaluation {
    /// No rule matched.
    NoMatch,
    /// Matched, duplicate inside the window; counter updated.
    Suppressed { dedup_key: String, count: u64 },
    /// Matched and fresh: dispatch.
    Dispatch(Alert),
}

impl AlertEngine {
    pub fn new(settings: &AlertSettings) -> Result<Self> {
        let rules = settings
            .rules
            .iter()
            .map(AlertRule::compile)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            rules,
            dedup_window: Duration::from_secs(settings.dedup_window_s),
            seen: HashMap::new(),
        })
    }

    /// First matching rule wins; rules are evaluated in config order, so
    /// operators order them most-severe first.
    pub fn evaluate(&mut self, event: &ClassifiedEvent) -> Evaluation {
        let Some(rule) = self.rules.iter().find(|r| r.matches(event)) else {
            return Evaluation::NoMatch;
        };
        let dedup_key = rule.dedup_key(event);

        let now = Instant::now();
        self.seen
            .retain(|_, (at, _)| now.duration_since(*at) < self.dedup_window);

        if let Some((_, count)) = self.seen.get_mut(&dedup_key) {
            *count += 1;
            return Evaluation::Suppressed {
                dedup_key,
                count: *count,
            };
        }
        self.seen.insert(dedup_key.clone(), (now, 0));

        Evaluation::Dispatch(Alert {
            event_id: event.event_id.clone(),
            level: rule.level,
            issued_at: Utc::now(),
            payload: serde_json::json!({
                "label": event.classification.label.to_string(),
                "confidence": event.classification.confidence,
                "magnitude": event.magnitude.value,
                "latitude": event.location.latitude,
                "longitude": event.location.longitude,
                "depth_km": event.location.depth_km,
                "trigger_ns": event.trigger_ns(),
            }),
            dedup_key,
        })
    }
}

// ============================================================================
// Subscribers
// ============================================================================

/// Outbound alert sink. Implementations must be idempotent on
/// `event_id` — delivery is at-least-once.
#[async_trait]
pub trait AlertSubscriber: Send + Sync {
    async fn deliver(&self, alert: &Alert) -> Result<()>;
    fn name(&self) -> &str;
}

/// Subscriber that writes alerts to the tracing log. The default sink
/// in deployments without an outbound channel configured.
pub struct LogSubscriber;

#[async_trait]
impl AlertSubscriber for LogSubscriber {
    async fn deliver(&self, alert: &Alert) -> Result<()> {
        info!(
            level = %alert.level,
            event_id = %alert.event_id,
            dedup_key = %alert.dedup_key,
            "ALERT {}",
            alert.payload
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

struct SubscriberSlot {
    subscriber: Arc<dyn AlertSubscriber>,
    bucket: TokenBucket,
}

/// The dispatcher task: tail → rules → dedup → rate-limited delivery.
pub struct AlertDispatcher {
    engine: AlertEngine,
    subscribers: Vec<SubscriberSlot>,
    store: Arc<EventStore>,
    metrics: Arc<PipelineMetrics>,
}

impl AlertDispatcher {
    pub fn new(
        settings: &AlertSettings,
        subscribers: Vec<Arc<dyn AlertSubscriber>>,
        store: Arc<EventStore>,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Self> {
        let engine = AlertEngine::new(settings)?;
        let slots = subscribers
            .into_iter()
            .map(|subscriber| SubscriberSlot {
                bucket: TokenBucket::new(settings.per_subscriber_rps, 1),
                subscriber,
            })
            .collect();
        Ok(Self {
            engine,
            subscribers: slots,
            store,
            metrics,
        })
    }

    /// Run until cancelled. Resumes from the persisted cursor.
    pub async fn run(mut self, cancel: CancellationToken) {
        let cursor = self.store.load_cursor(CURSOR_NAME).ok().flatten();
        let (backlog, mut live) = match self.store.tail(cursor) {
            Ok(t) => t,
            Err(err) => {
                warn!(error = %err, "alert dispatcher cannot open the store tail");
                return;
            }
        };
        info!(
            backlog = backlog.len(),
            cursor = ?cursor,
            subscribers = self.subscribers.len(),
            "alert dispatcher started"
        );

        let mut last_seen = cursor;
        for (id, event) in backlog {
            self.handle(id, &event).await;
            last_seen = Some(id);
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = live.recv() => match received {
                    Ok((id, event)) => {
                        // The broadcast replays appends that may already be
                        // in the backlog; cursor comparison dedups.
                        if last_seen.map(|c| id <= c).unwrap_or(false) {
                            continue;
                        }
                        self.handle(id, &event).await;
                        last_seen = Some(id);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "alert tail lagged, re-reading from cursor");
                        let (catchup, fresh) = match self.store.tail(last_seen) {
                            Ok(t) => t,
                            Err(err) => {
                                warn!(error = %err, "tail re-read failed");
                                break;
                            }
                        };
                        live = fresh;
                        for (id, event) in catchup {
                            self.handle(id, &event).await;
                            last_seen = Some(id);
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        info!("alert dispatcher stopped");
    }

    async fn handle(&mut self, storage_id: u64, event: &ClassifiedEvent) {
        match self.engine.evaluate(event) {
            Evaluation::NoMatch => {}
            Evaluation::Suppressed { dedup_key, count } => {
                self.metrics
                    .alerts_deduplicated
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                tracing::debug!(dedup_key = %dedup_key, count, "alert suppressed by dedup window");
            }
            Evaluation::Dispatch(alert) => {
                for slot in &self.subscribers {
                    self.deliver_to(slot, &alert).await;
                }
            }
        }
        let _ = self.store.save_cursor(CURSOR_NAME, storage_id);
    }

    async fn deliver_to(&self, slot: &SubscriberSlot, alert: &Alert) {
        let deadline = Instant::now() + DELIVERY_TOKEN_WAIT;
        if let Err(err) = slot.bucket.acquire(deadline).await {
            warn!(subscriber = slot.subscriber.name(), error = %err, "alert delivery rate-limited out");
            self.metrics
                .alerts_failed
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return;
        }

        for attempt in 0..DELIVERY_ATTEMPTS {
            match slot.subscriber.deliver(alert).await {
                Ok(()) => {
                    self.metrics
                        .alerts_sent
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    return;
                }
                Err(err) if attempt + 1 < DELIVERY_ATTEMPTS => {
                    warn!(
                        subscriber = slot.subscriber.name(),
                        attempt,
                        error = %err,
                        "alert delivery failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(200 * (attempt as u64 + 1))).await;
                }
                Err(err) => {
                    warn!(
                        subscriber = slot.subscriber.name(),
                        error = %err,
                        "alert delivery failed permanently"
                    );
                    self.metrics
                        .alerts_failed
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        CandidateEvent, CandidateState, ChannelId, Classification, FeatureVector,
        LocationEstimate, MagnitudeEstimate, MagnitudeScale, PipelineTiming, TimeWindow,
    };

    fn event(label: EventLabel, magnitude: f64, confidence: f64, lat: f64) -> ClassifiedEvent {
        ClassifiedEvent {
            event_id: uuid::Uuid::new_v4().to_string(),
            sequence: 1,
            candidate: CandidateEvent {
                detector_id: "d".into(),
                sequence: 1,
                channel: ChannelId::new("QW", "STA1", "00", "HHZ"),
                trigger_ns: 0,
                end_ns: 5_000_000_000,
                trigger_ratio: 5.0,
                state: CandidateState::Confirmed,
                pre_roll: TimeWindow { start_ns: -5_000_000_000, end_ns: 0 },
                post_roll: TimeWindow { start_ns: 5_000_000_000, end_ns: 15_000_000_000 },
            },
            features: FeatureVector { schema_id: "qw-std-v1".into(), values: vec![0.0] },
            classification: Classification { label, confidence },
            magnitude: MagnitudeEstimate { value: magnitude, low: magnitude - 0.3, high: magnitude + 0.3, scale: MagnitudeScale::Ml },
            location: LocationEstimate {
                latitude: lat,
                longitude: -118.2,
                depth_km: 10.0,
                horizontal_err_km: 2.0,
                depth_err_km: 3.0,
                rms_residual_s: 0.05,
                ellipse_major_km: 2.0,
                ellipse_minor_km: 1.0,
                ellipse_azimuth_deg: 10.0,
            },
            stations: vec!["STA1".into()],
            timing: PipelineTiming {
                detected_at: Utc::now(),
                classified_at: Utc::now(),
                processing_ms: 10,
            },
        }
    }

    fn engine() -> AlertEngine {
        AlertEngine::new(&AlertSettings::default()).unwrap()
    }

    #[test]
    fn big_earthquake_is_critical() {
        let mut engine = engine();
        match engine.evaluate(&event(EventLabel::Earthquake, 5.5, 0.9, 35.4)) {
            Evaluation::Dispatch(alert) => {
                assert_eq!(alert.level, AlertLevel::Critical);
                assert_eq!(alert.dedup_key, "earthquake:35:-119");
            }
            other => panic!("expected dispatch, got {other:?}"),
        }
    }

    #[test]
    fn moderate_earthquake_is_warn() {
        let mut engine = engine();
        match engine.evaluate(&event(EventLabel::Earthquake, 4.0, 0.9, 35.4)) {
            Evaluation::Dispatch(alert) => assert_eq!(alert.level, AlertLevel::Warn),
            other => panic!("expected dispatch, got {other:?}"),
        }
    }

    #[test]
    fn low_confidence_noise_matches_nothing() {
        let mut engine = engine();
        assert_eq!(
            engine.evaluate(&event(EventLabel::Noise, 1.0, 0.2, 35.0)),
            Evaluation::NoMatch
        );
    }

    #[test]
    fn same_region_dedups_within_window() {
        let mut engine = engine();
        let first = engine.evaluate(&event(EventLabel::Earthquake, 5.5, 0.9, 35.4));
        assert!(matches!(first, Evaluation::Dispatch(_)));

        // Different event id, same 1-degree cell: suppressed.
        match engine.evaluate(&event(EventLabel::Earthquake, 5.9, 0.9, 35.6)) {
            Evaluation::Suppressed { dedup_key, count } => {
                assert_eq!(dedup_key, "earthquake:35:-119");
                assert_eq!(count, 1);
            }
            other => panic!("expected suppression, got {other:?}"),
        }

        // A different cell dispatches independently.
        assert!(matches!(
            engine.evaluate(&event(EventLabel::Earthquake, 5.9, 0.9, 36.4)),
            Evaluation::Dispatch(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn dedup_window_expires() {
        let mut settings = AlertSettings::default();
        settings.dedup_window_s = 10;
        let mut engine = AlertEngine::new(&settings).unwrap();

        assert!(matches!(
            engine.evaluate(&event(EventLabel::Earthquake, 5.5, 0.9, 35.4)),
            Evaluation::Dispatch(_)
        ));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(matches!(
            engine.evaluate(&event(EventLabel::Earthquake, 5.5, 0.9, 35.4)),
            Evaluation::Dispatch(_)
        ));
    }

    #[test]
    fn replay_is_idempotent_within_window() {
        let mut engine = engine();
        let e = event(EventLabel::Earthquake, 5.5, 0.9, 35.4);
        assert!(matches!(engine.evaluate(&e), Evaluation::Dispatch(_)));
        // Replaying the same store tail entry produces no second alert.
        assert!(matches!(engine.evaluate(&e), Evaluation::Suppressed { .. }));
    }
}
