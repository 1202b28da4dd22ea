//! Public API handlers.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::atomic::Ordering;

use crate::error::PipelineError;
use crate::store::EventFilter;
use crate::types::{ClassifiedEvent, EventLabel};

use super::auth::{AuthContext, Role};
use super::envelope::ApiFailure;
use super::ApiState;

// ============================================================================
// Liveness / readiness
// ============================================================================

/// GET /health — liveness only.
pub async fn get_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// GET /ready — 503 until store, clients, model, and stations are up.
pub async fn get_ready(State(state): State<ApiState>) -> impl IntoResponse {
    if state.runtime.metrics.is_ready() {
        (StatusCode::OK, Json(serde_json::json!({"status": "ready"})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "initializing"})),
        )
    }
}

/// GET /status — operational counters (supplemental, viewer-gated).
pub async fn get_status(
    State(state): State<ApiState>,
    auth: AuthContext,
) -> Result<Json<serde_json::Value>, ApiFailure> {
    auth.require(Role::Viewer)?;
    let m = &state.runtime.metrics;
    Ok(Json(serde_json::json!({
        "uptime_seconds": m.uptime_secs(),
        "ready": m.is_ready(),
        "segments_processed": m.segments_processed.load(Ordering::Relaxed),
        "segments_rejected": m.segments_rejected.load(Ordering::Relaxed),
        "triggers_confirmed": m.triggers_confirmed.load(Ordering::Relaxed),
        "triggers_rejected": m.triggers_rejected.load(Ordering::Relaxed),
        "events_committed": m.events_committed.load(Ordering::Relaxed),
        "dead_letters": m.dead_letters.load(Ordering::Relaxed),
        "reorder_violations": m.reorder_violations.load(Ordering::Relaxed),
        "queue_depth": m.queue_depth.load(Ordering::Relaxed),
        "queue_peak": m.queue_peak.load(Ordering::Relaxed),
        "alerts_sent": m.alerts_sent.load(Ordering::Relaxed),
        "alerts_deduplicated": m.alerts_deduplicated.load(Ordering::Relaxed),
        "store_events": state.runtime.store.event_count(),
        "store_dead_letters": state.runtime.store.dead_letter_count(),
    })))
}

// ============================================================================
// Event queries
// ============================================================================

/// Query parameters for GET /events.
#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    pub start_ns: Option<i64>,
    pub end_ns: Option<i64>,
    pub label: Option<String>,
    pub min_magnitude: Option<f64>,
    pub min_latitude: Option<f64>,
    pub max_latitude: Option<f64>,
    pub min_longitude: Option<f64>,
    pub max_longitude: Option<f64>,
    pub limit: Option<usize>,
}

impl EventsQuery {
    fn to_filter(&self) -> Result<EventFilter, ApiFailure> {
        let label = match &self.label {
            Some(raw) => Some(
                raw.parse::<EventLabel>()
                    .map_err(|e| ApiFailure(PipelineError::Validation(e)))?,
            ),
            None => None,
        };

        let bbox = match (
            self.min_latitude,
            self.max_latitude,
            self.min_longitude,
            self.max_longitude,
        ) {
            (None, None, None, None) => None,
            (Some(min_lat), Some(max_lat), Some(min_lon), Some(max_lon)) => {
                Some(crate::client::BoundingBox {
                    min_latitude: min_lat,
                    max_latitude: max_lat,
                    min_longitude: min_lon,
                    max_longitude: max_lon,
                })
            }
            _ => {
                return Err(ApiFailure(PipelineError::Validation(
                    "bounding box requires all four min/max lat/lon fields".into(),
                )))
            }
        };

        Ok(EventFilter {
            start_ns: self.start_ns,
            end_ns: self.end_ns,
            bbox,
            label,
            min_magnitude: self.min_magnitude,
            limit: Some(self.limit.unwrap_or(1000).min(10_000)),
        })
    }
}

/// GET /events — range query, ordered by trigger instant ascending.
pub async fn get_events(
    State(state): State<ApiState>,
    auth: AuthContext,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<ClassifiedEvent>>, ApiFailure> {
    auth.require(Role::Viewer)?;
    let filter = query.to_filter()?;
    let events = state.runtime.store.query(&filter)?;
    Ok(Json(events))
}

/// GET /events/{id}.
pub async fn get_event(
    State(state): State<ApiState>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> Result<Json<ClassifiedEvent>, ApiFailure> {
    auth.require(Role::Viewer)?;
    let event = state.runtime.store.get_by_id(&id)?;
    Ok(Json(event))
}

/// Cursor for the live stream.
#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    /// Replay from this storage id (exclusive); omit for everything.
    pub cursor: Option<u64>,
}

/// GET /events/stream — live tail as Server-Sent Events.
///
/// SSE rather than WebSocket: the tail is strictly server→client, SSE
/// reconnects carry `Last-Event-ID` for cursor resume, and plain HTTP
/// intermediaries pass it through. Each message is one classified event
/// with the storage id as the SSE id.
pub async fn stream_events(
    State(state): State<ApiState>,
    auth: AuthContext,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiFailure> {
    auth.require(Role::Viewer)?;

    let (backlog, live) = state.runtime.store.tail(query.cursor)?;
    let last_replayed = backlog.last().map(|(id, _)| *id).or(query.cursor);

    let backlog_stream = stream::iter(backlog.into_iter().map(|(id, event)| sse_event(id, &event)));

    let live_stream = stream::unfold(
        (live, last_replayed),
        |(mut rx, last)| async move {
            loop {
                match rx.recv().await {
                    Ok((id, event)) => {
                        // Appends racing the backlog snapshot would repeat.
                        if last.map(|l| id <= l).unwrap_or(false) {
                            continue;
                        }
                        return Some((sse_event(id, &event), (rx, Some(id))));
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
                }
            }
        },
    );

    let stream = backlog_stream.chain(live_stream).map(Ok::<_, Infallible>);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn sse_event(id: u64, event: &ClassifiedEvent) -> SseEvent {
    SseEvent::default()
        .id(id.to_string())
        .event("classified")
        .json_data(event)
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to serialize SSE event");
            SseEvent::default().event("error").data("serialization failure")
        })
}

// ============================================================================
// Metrics
// ============================================================================

/// GET /metrics — Prometheus text exposition (version 0.0.4), formatted
/// by hand from the process counters.
pub async fn get_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let m = &state.runtime.metrics;
    let mut body = String::with_capacity(2048);

    let counters: [(&str, &str, u64); 9] = [
        ("qw_segments_total", "Waveform segments processed", m.segments_processed.load(Ordering::Relaxed)),
        ("qw_segments_rejected_total", "Segments failing validation", m.segments_rejected.load(Ordering::Relaxed)),
        ("qw_triggers_confirmed_total", "Confirmed detector triggers", m.triggers_confirmed.load(Ordering::Relaxed)),
        ("qw_triggers_rejected_total", "Rejected detector triggers", m.triggers_rejected.load(Ordering::Relaxed)),
        ("qw_events_committed_total", "Classified events committed", m.events_committed.load(Ordering::Relaxed)),
        ("qw_dead_letters_total", "Events routed to the dead-letter stream", m.dead_letters.load(Ordering::Relaxed)),
        ("qw_reorder_violations_total", "Commits outside the reorder window", m.reorder_violations.load(Ordering::Relaxed)),
        ("qw_alerts_sent_total", "Alerts delivered to subscribers", m.alerts_sent.load(Ordering::Relaxed)),
        ("qw_alerts_deduplicated_total", "Alerts suppressed by dedup", m.alerts_deduplicated.load(Ordering::Relaxed)),
    ];
    for (name, help, value) in counters {
        body.push_str(&format!("# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"));
    }

    body.push_str(&format!(
        "# HELP qw_queue_depth Candidate queue depth\n# TYPE qw_queue_depth gauge\nqw_queue_depth {}\n",
        m.queue_depth.load(Ordering::Relaxed)
    ));
    body.push_str(&format!(
        "# HELP qw_queue_peak Candidate queue high-water mark\n# TYPE qw_queue_peak gauge\nqw_queue_peak {}\n",
        m.queue_peak.load(Ordering::Relaxed)
    ));
    body.push_str(&format!(
        "# HELP qw_uptime_seconds Process uptime\n# TYPE qw_uptime_seconds gauge\nqw_uptime_seconds {}\n",
        m.uptime_secs()
    ));

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

// ============================================================================
// Operator actions
// ============================================================================

/// POST /model/reload — quiesce-free artifact swap (operator+).
pub async fn post_model_reload(
    State(state): State<ApiState>,
    auth: AuthContext,
) -> Result<Json<serde_json::Value>, ApiFailure> {
    auth.require(Role::Operator)?;
    state.runtime.model.reload(&state.model_path)?;
    let version = state.runtime.model.current().version.clone();
    Ok(Json(serde_json::json!({"status": "reloaded", "version": version})))
}

/// POST /admin/cache/purge — drop client response caches (admin).
pub async fn post_purge_caches(
    State(state): State<ApiState>,
    auth: AuthContext,
) -> Result<Json<serde_json::Value>, ApiFailure> {
    auth.require(Role::Admin)?;
    state.runtime.catalog.purge_cache().await;
    state.runtime.waveform.purge_cache().await;
    Ok(Json(serde_json::json!({"status": "purged"})))
}
