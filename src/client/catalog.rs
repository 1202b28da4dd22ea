//! Catalog client (C1): fetches earthquake metadata from the external
//! GeoJSON catalog service.
//!
//! Query results are cached by canonicalized request before the rate
//! bucket is charged; cache hits cost no token. Transport and 5xx
//! failures retry under the `ResilientCaller`; 4xx (except 429) surface
//! immediately as `Validation`; 429 honors `Retry-After`.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

use crate::config::ServiceSettings;
use crate::error::{PipelineError, Result};
use crate::types::{CatalogEvent, MagnitudeScale};

use super::cache::{canonical_key, ResponseCache};
use super::resilient::ResilientCaller;

/// Geographic bounding box filter.
#[derive(Debug, Clone, Copy)]
pub struct BoundingBox {
    pub min_latitude: f64,
    pub max_latitude: f64,
    pub min_longitude: f64,
    pub max_longitude: f64,
}

impl BoundingBox {
    fn check(&self) -> std::result::Result<(), String> {
        if self.min_latitude >= self.max_latitude
            || self.min_longitude >= self.max_longitude
            || self.min_latitude < -90.0
            || self.max_latitude > 90.0
            || self.min_longitude < -180.0
            || self.max_longitude > 180.0
        {
            return Err(format!("malformed bounding box {self:?}"));
        }
        Ok(())
    }
}

/// Event query filters.
#[derive(Debug, Clone)]
pub struct EventQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub bbox: Option<BoundingBox>,
    pub min_magnitude: Option<f64>,
}

impl EventQuery {
    fn check(&self) -> Result<()> {
        if self.start >= self.end {
            return Err(PipelineError::Validation(format!(
                "empty time range [{}, {})",
                self.start, self.end
            )));
        }
        if let Some(bbox) = &self.bbox {
            bbox.check().map_err(PipelineError::Validation)?;
        }
        Ok(())
    }

    fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("format", "geojson".to_string()),
            ("starttime", self.start.to_rfc3339()),
            ("endtime", self.end.to_rfc3339()),
        ];
        if let Some(m) = self.min_magnitude {
            pairs.push(("minmagnitude", m.to_string()));
        }
        if let Some(b) = &self.bbox {
            pairs.push(("minlatitude", b.min_latitude.to_string()));
            pairs.push(("maxlatitude", b.max_latitude.to_string()));
            pairs.push(("minlongitude", b.min_longitude.to_string()));
            pairs.push(("maxlongitude", b.max_longitude.to_string()));
        }
        pairs
    }
}

// --- GeoJSON wire format ----------------------------------------------------

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    id: Option<String>,
    properties: FeatureProperties,
    geometry: Option<FeatureGeometry>,
}

#[derive(Debug, Deserialize)]
struct FeatureProperties {
    /// Milliseconds since the epoch.
    time: Option<i64>,
    mag: Option<f64>,
    #[serde(rename = "magType")]
    mag_type: Option<String>,
    net: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FeatureGeometry {
    /// `[longitude, latitude, depth_km]`.
    coordinates: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct UpstreamError {
    #[allow(dead_code)]
    error: Option<String>,
    message: Option<String>,
}

/// Rate-limited, cached, retrying catalog fetcher.
pub struct CatalogClient {
    http: reqwest::Client,
    base_url: String,
    caller: ResilientCaller,
    cache: ResponseCache<Vec<CatalogEvent>>,
}

impl CatalogClient {
    pub fn new(settings: &ServiceSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .expect("failed to build HTTP client");
        Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            caller: ResilientCaller::from_settings("catalog", settings),
            cache: ResponseCache::new(Duration::from_secs(settings.cache_ttl_s)),
        }
    }

    /// Fetch all events matching the filters, ordered by origin time,
    /// with duplicate catalog ids removed.
    pub async fn fetch_events(&self, query: &EventQuery) -> Result<Vec<CatalogEvent>> {
        query.check()?;

        let pairs = query.query_pairs();
        let key = canonical_key(
            &pairs
                .iter()
                .map(|(k, v)| (*k, v.clone()))
                .collect::<Vec<_>>(),
        );
        if let Some(hit) = self.cache.get(&key).await {
            tracing::debug!(key = %key, "catalog cache hit");
            return Ok(hit);
        }

        let url = self.base_url.clone();
        let http = self.http.clone();
        let body = self
            .caller
            .call(move || {
                let http = http.clone();
                let url = url.clone();
                let pairs = pairs.clone();
                async move { request_text(&http, &url, &pairs).await }
            })
            .await?;

        let events = parse_feature_collection(&body)?;
        self.cache.insert(key, events.clone()).await;
        Ok(events)
    }

    /// Fetch one event by catalog id.
    pub async fn fetch_event(&self, id: &str) -> Result<CatalogEvent> {
        if id.is_empty() {
            return Err(PipelineError::Validation("empty catalog id".into()));
        }
        let pairs = vec![
            ("format", "geojson".to_string()),
            ("eventid", id.to_string()),
        ];
        let key = canonical_key(
            &pairs
                .iter()
                .map(|(k, v)| (*k, v.clone()))
                .collect::<Vec<_>>(),
        );
        if let Some(mut hit) = self.cache.get(&key).await {
            if let Some(event) = hit.pop() {
                return Ok(event);
            }
        }

        let url = self.base_url.clone();
        let http = self.http.clone();
        let body = self
            .caller
            .call(move || {
                let http = http.clone();
                let url = url.clone();
                let pairs = pairs.clone();
                async move { request_text(&http, &url, &pairs).await }
            })
            .await?;

        let events = parse_feature_collection(&body)?;
        let event = events
            .into_iter()
            .find(|e| e.catalog_id == id)
            .ok_or_else(|| PipelineError::NotFound(format!("catalog event '{id}'")))?;
        self.cache.insert(key, vec![event.clone()]).await;
        Ok(event)
    }

    /// Drop all cached responses (admin purge).
    pub async fn purge_cache(&self) {
        self.cache.purge().await;
    }

    pub fn breaker_state(&self) -> super::breaker::BreakerState {
        self.caller.breaker().state()
    }
}

/// One HTTP round trip mapped into the error taxonomy.
async fn request_text(
    http: &reqwest::Client,
    url: &str,
    pairs: &[(&'static str, String)],
) -> Result<String> {
    let response = http.get(url).query(pairs).send().await?;
    let status = response.status();

    if status.is_success() {
        return Ok(response.text().await?);
    }

    if status.as_u16() == 429 {
        let retry_after_ms = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|secs| secs * 1000)
            .unwrap_or(1000);
        return Err(PipelineError::RateLimited { retry_after_ms });
    }

    let message = response
        .text()
        .await
        .ok()
        .and_then(|body| serde_json::from_str::<UpstreamError>(&body).ok())
        .and_then(|e| e.message)
        .unwrap_or_else(|| status.to_string());

    if status.is_server_error() {
        Err(PipelineError::Transient(format!("catalog {status}: {message}")))
    } else {
        Err(PipelineError::Validation(format!("catalog {status}: {message}")))
    }
}

/// Parse a GeoJSON FeatureCollection, skipping malformed features,
/// deduplicating ids, and sorting by origin time.
fn parse_feature_collection(body: &str) -> Result<Vec<CatalogEvent>> {
    let collection: FeatureCollection = serde_json::from_str(body)
        .map_err(|e| PipelineError::Validation(format!("catalog response not GeoJSON: {e}")))?;

    let mut seen: HashSet<String> = HashSet::new();
    let mut events = Vec::with_capacity(collection.features.len());

    for feature in collection.features {
        match feature_to_event(feature) {
            Ok(event) => {
                if seen.insert(event.catalog_id.clone()) {
                    events.push(event);
                }
            }
            Err(reason) => {
                tracing::warn!(reason = %reason, "skipping malformed catalog feature");
            }
        }
    }

    events.sort_by_key(|e| e.origin_time);
    Ok(events)
}

fn feature_to_event(feature: Feature) -> std::result::Result<CatalogEvent, String> {
    let id = feature.id.filter(|s| !s.is_empty()).ok_or("feature has no id")?;
    let geometry = feature.geometry.ok_or("feature has no geometry")?;
    if geometry.coordinates.len() < 3 {
        return Err(format!("feature '{id}' coordinates too short"));
    }
    let time_ms = feature.properties.time.ok_or("feature has no time")?;
    let origin_time = Utc
        .timestamp_millis_opt(time_ms)
        .single()
        .ok_or_else(|| format!("feature '{id}' time {time_ms} out of range"))?;
    let magnitude = feature.properties.mag.ok_or("feature has no magnitude")?;
    let magnitude_scale: MagnitudeScale = feature
        .properties
        .mag_type
        .as_deref()
        .unwrap_or("ml")
        .parse()
        .map_err(|e: String| e)?;

    let raw = serde_json::json!({
        "id": id,
        "time": time_ms,
        "mag": magnitude,
        "coordinates": geometry.coordinates,
    });

    Ok(CatalogEvent {
        catalog_id: id,
        origin_time,
        longitude: geometry.coordinates[0],
        latitude: geometry.coordinates[1],
        depth_km: geometry.coordinates[2],
        magnitude,
        magnitude_scale,
        agency: feature.properties.net.unwrap_or_else(|| "external".to_string()),
        raw,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_geojson() -> String {
        serde_json::json!({
            "type": "FeatureCollection",
            "features": [
                {
                    "id": "ev2",
                    "properties": {"time": 1_700_000_100_000_i64, "mag": 4.5, "magType": "ml", "net": "us"},
                    "geometry": {"coordinates": [-118.0, 35.0, 10.0]}
                },
                {
                    "id": "ev1",
                    "properties": {"time": 1_700_000_000_000_i64, "mag": 3.1, "magType": "mb", "net": "us"},
                    "geometry": {"coordinates": [-117.5, 34.8, 7.2]}
                },
                {
                    "id": "ev2",
                    "properties": {"time": 1_700_000_100_000_i64, "mag": 4.5, "magType": "ml", "net": "us"},
                    "geometry": {"coordinates": [-118.0, 35.0, 10.0]}
                },
                {
                    "id": "broken",
                    "properties": {"mag": 2.0},
                    "geometry": {"coordinates": [-118.0, 35.0, 10.0]}
                }
            ]
        })
        .to_string()
    }

    #[test]
    fn parses_sorts_and_dedups() {
        let events = parse_feature_collection(&sample_geojson()).unwrap();
        assert_eq!(events.len(), 2, "dup and broken features must drop");
        assert_eq!(events[0].catalog_id, "ev1");
        assert_eq!(events[1].catalog_id, "ev2");
        assert_eq!(events[1].latitude, 35.0);
        assert_eq!(events[1].longitude, -118.0);
        assert_eq!(events[1].depth_km, 10.0);
        assert_eq!(events[1].magnitude_scale, MagnitudeScale::Ml);
    }

    #[test]
    fn non_geojson_body_is_validation() {
        let err = parse_feature_collection("<html>oops</html>").unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn empty_time_range_rejected_before_any_io() {
        let client = CatalogClient::new(&ServiceSettings::default());
        let now = Utc::now();
        let err = client
            .fetch_events(&EventQuery {
                start: now,
                end: now,
                bbox: None,
                min_magnitude: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn malformed_bbox_rejected() {
        let client = CatalogClient::new(&ServiceSettings::default());
        let now = Utc::now();
        let err = client
            .fetch_events(&EventQuery {
                start: now - chrono::Duration::hours(1),
                end: now,
                bbox: Some(BoundingBox {
                    min_latitude: 40.0,
                    max_latitude: 30.0,
                    min_longitude: -120.0,
                    max_longitude: -110.0,
                }),
                min_magnitude: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }
}
