//! Event catalog store (C11) and the dead-letter stream.
//!
//! Backed by sled trees:
//!
//! - `log`: storage id (u64 big-endian) → serialized ClassifiedEvent —
//!   the append-only log; big-endian keys give natural append order.
//! - `by_id`: event id → storage id — the offset index.
//! - `by_time`: (trigger instant, storage id) → storage id — the
//!   secondary time index range queries scan.
//! - `dead_letter`: rejection records with stage and reason.
//! - `meta`: the header record `{magic, version, schema_id}` checked on
//!   open; a mismatched major version refuses to open (corruption).
//!
//! Durability: `per_write` flushes after every append; `periodic`
//! relies on sled's background flushing plus the process's periodic
//! flush task. An acknowledged append survives restart under
//! `per_write`; `periodic` bounds loss to the flush interval.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

use crate::config::FsyncMode;
use crate::error::{PipelineError, Result};
use crate::types::{CatalogEvent, ClassifiedEvent, EventLabel};

/// Store header magic.
const STORE_MAGIC: &str = "qwstore";
/// Major format version; bump only on incompatible layout changes.
const STORE_VERSION: u32 = 1;
/// Tail broadcast capacity; slow subscribers re-read from their cursor.
const TAIL_CAPACITY: usize = 1024;

/// Header record persisted in the `meta` tree.
#[derive(Debug, Serialize, Deserialize)]
struct StoreHeader {
    magic: String,
    version: u32,
    schema_id: String,
}

/// One dead-letter record: an input or intermediate event that failed a
/// stage, kept with its reason instead of being silently dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub stage: String,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Query filters for `query`.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// `[start_ns, end_ns)` over trigger instants.
    pub start_ns: Option<i64>,
    pub end_ns: Option<i64>,
    pub bbox: Option<crate::client::BoundingBox>,
    pub label: Option<EventLabel>,
    pub min_magnitude: Option<f64>,
    pub limit: Option<usize>,
}

/// Append-only classified-event catalog.
#[derive(Debug)]
pub struct EventStore {
    db: sled::Db,
    log: sled::Tree,
    by_id: sled::Tree,
    by_time: sled::Tree,
    dead: sled::Tree,
    cursors: sled::Tree,
    catalog: sled::Tree,
    fsync: FsyncMode,
    next_id: AtomicU64,
    next_dead_id: AtomicU64,
    tail_tx: broadcast::Sender<(u64, ClassifiedEvent)>,
}

impl EventStore {
    /// Open (or create) the store, verifying the header record.
    pub fn open<P: AsRef<Path>>(dir: P, fsync: FsyncMode, schema_id: &str) -> Result<Self> {
        let db = sled::open(dir.as_ref())?;
        let log = db.open_tree("log")?;
        let by_id = db.open_tree("by_id")?;
        let by_time = db.open_tree("by_time")?;
        let dead = db.open_tree("dead_letter")?;
        let cursors = db.open_tree("cursors")?;
        let catalog = db.open_tree("catalog_events")?;
        let meta = db.open_tree("meta")?;

        match meta.get(b"header")? {
            Some(raw) => {
                let header: StoreHeader = serde_json::from_slice(&raw)
                    .map_err(|e| PipelineError::Corruption(format!("unreadable store header: {e}")))?;
                if header.magic != STORE_MAGIC || header.version != STORE_VERSION {
                    return Err(PipelineError::Corruption(format!(
                        "store header {}/v{} incompatible with {}/v{}",
                        header.magic, header.version, STORE_MAGIC, STORE_VERSION
                    )));
                }
                if header.schema_id != schema_id {
                    tracing::warn!(
                        stored = %header.schema_id,
                        configured = %schema_id,
                        "store was written with a different feature schema"
                    );
                }
            }
            None => {
                let header = StoreHeader {
                    magic: STORE_MAGIC.to_string(),
                    version: STORE_VERSION,
                    schema_id: schema_id.to_string(),
                };
                meta.insert(b"header", serde_json::to_vec(&header)?)?;
                db.flush()?;
            }
        }

        let next_id = log
            .last()?
            .map(|(k, _)| decode_u64(&k) + 1)
            .unwrap_or(0);
        let next_dead_id = dead
            .last()?
            .map(|(k, _)| decode_u64(&k) + 1)
            .unwrap_or(0);

        let (tail_tx, _) = broadcast::channel(TAIL_CAPACITY);

        tracing::info!(
            events = log.len(),
            dead_letters = dead.len(),
            fsync = ?fsync,
            "event store opened"
        );

        Ok(Self {
            db,
            log,
            by_id,
            by_time,
            dead,
            cursors,
            catalog,
            fsync,
            next_id: AtomicU64::new(next_id),
            next_dead_id: AtomicU64::new(next_dead_id),
            tail_tx,
        })
    }

    /// Atomically append one classified event. Returns the storage id.
    ///
    /// The append is durable on return under `per_write`; subscribers on
    /// the live tail are notified after the write lands.
    pub fn append(&self, event: &ClassifiedEvent) -> Result<u64> {
        if self.by_id.contains_key(event.event_id.as_bytes())? {
            return Err(PipelineError::Validation(format!(
                "event '{}' already appended",
                event.event_id
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let key = id.to_be_bytes();
        let value = serde_json::to_vec(event)?;

        self.log.insert(key, value)?;
        self.by_id.insert(event.event_id.as_bytes(), key.to_vec())?;
        self.by_time
            .insert(time_key(event.trigger_ns(), id).to_vec(), key.to_vec())?;

        if self.fsync == FsyncMode::PerWrite {
            self.db.flush()?;
        }

        let _ = self.tail_tx.send((id, event.clone()));
        Ok(id)
    }

    /// Fetch by event id.
    pub fn get_by_id(&self, event_id: &str) -> Result<ClassifiedEvent> {
        let key = self
            .by_id
            .get(event_id.as_bytes())?
            .ok_or_else(|| PipelineError::NotFound(format!("event '{event_id}'")))?;
        let raw = self
            .log
            .get(&key)?
            .ok_or_else(|| PipelineError::Corruption(format!("dangling index for '{event_id}'")))?;
        decode_event(&raw)
    }

    /// Range query ordered by trigger instant ascending.
    pub fn query(&self, filter: &EventFilter) -> Result<Vec<ClassifiedEvent>> {
        let lo = time_key(filter.start_ns.unwrap_or(i64::MIN), 0);
        let hi = time_key(filter.end_ns.unwrap_or(i64::MAX), u64::MAX);
        let limit = filter.limit.unwrap_or(usize::MAX);

        let mut out = Vec::new();
        for item in self.by_time.range(lo..hi) {
            let (_, log_key) = item?;
            let raw = self
                .log
                .get(&log_key)?
                .ok_or_else(|| PipelineError::Corruption("dangling time index".into()))?;
            let event = decode_event(&raw)?;
            if matches_filter(&event, filter) {
                out.push(event);
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Replay from a cursor (exclusive) and subscribe to the live feed.
    ///
    /// The cursor is the storage id of the last event the subscriber has
    /// seen; `None` replays everything. Returns the backlog plus a
    /// receiver for appends after the snapshot. Events may appear in
    /// both; consumers dedup on storage id.
    pub fn tail(
        &self,
        cursor: Option<u64>,
    ) -> Result<(Vec<(u64, ClassifiedEvent)>, broadcast::Receiver<(u64, ClassifiedEvent)>)> {
        let rx = self.tail_tx.subscribe();
        let start = cursor.map(|c| c + 1).unwrap_or(0);
        let mut backlog = Vec::new();
        for item in self.log.range(start.to_be_bytes()..) {
            let (k, raw) = item?;
            backlog.push((decode_u64(&k), decode_event(&raw)?));
        }
        Ok((backlog, rx))
    }

    /// Record a per-event failure with its reason. Never drops.
    pub fn dead_letter(&self, stage: &str, reason: &str, payload: serde_json::Value) -> Result<u64> {
        let record = DeadLetterRecord {
            stage: stage.to_string(),
            reason: reason.to_string(),
            recorded_at: Utc::now(),
            payload,
        };
        let id = self.next_dead_id.fetch_add(1, Ordering::SeqCst);
        self.dead
            .insert(id.to_be_bytes(), serde_json::to_vec(&record)?)?;
        if self.fsync == FsyncMode::PerWrite {
            self.db.flush()?;
        }
        tracing::warn!(stage, reason, "event dead-lettered");
        Ok(id)
    }

    /// Most recent dead letters, newest first.
    pub fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterRecord>> {
        let mut out = Vec::with_capacity(limit);
        for item in self.dead.iter().rev().take(limit) {
            let (_, raw) = item?;
            out.push(serde_json::from_slice(&raw).map_err(|e| {
                PipelineError::Corruption(format!("unreadable dead-letter record: {e}"))
            })?);
        }
        Ok(out)
    }

    pub fn event_count(&self) -> usize {
        self.log.len()
    }

    pub fn dead_letter_count(&self) -> usize {
        self.dead.len()
    }

    /// Persist an external catalog event (the metadata path). Keyed by
    /// origin time then catalog id; re-ingesting the same id at the
    /// same instant is a no-op, keeping accepted records immutable.
    pub fn record_catalog_event(&self, event: &CatalogEvent) -> Result<bool> {
        let mut key = Vec::with_capacity(8 + event.catalog_id.len());
        let origin_ns = event
            .origin_time
            .timestamp_nanos_opt()
            .unwrap_or_default();
        key.extend_from_slice(&((origin_ns as u64) ^ (1 << 63)).to_be_bytes());
        key.extend_from_slice(event.catalog_id.as_bytes());

        if self.catalog.contains_key(&key)? {
            return Ok(false);
        }
        self.catalog.insert(key, serde_json::to_vec(event)?)?;
        if self.fsync == FsyncMode::PerWrite {
            self.db.flush()?;
        }
        Ok(true)
    }

    /// Catalog events ordered by origin time ascending.
    pub fn catalog_events(&self, limit: usize) -> Result<Vec<CatalogEvent>> {
        let mut out = Vec::new();
        for item in self.catalog.iter().take(limit) {
            let (_, raw) = item?;
            out.push(serde_json::from_slice(&raw).map_err(|e| {
                PipelineError::Corruption(format!("unreadable catalog record: {e}"))
            })?);
        }
        Ok(out)
    }

    /// Persist a named subscriber cursor (last storage id consumed).
    /// Recoverable after restart, which is the tail durability contract.
    pub fn save_cursor(&self, name: &str, id: u64) -> Result<()> {
        self.cursors.insert(name.as_bytes(), id.to_be_bytes().to_vec())?;
        Ok(())
    }

    /// Load a named subscriber cursor.
    pub fn load_cursor(&self, name: &str) -> Result<Option<u64>> {
        Ok(self.cursors.get(name.as_bytes())?.map(|raw| decode_u64(&raw)))
    }

    /// Flush pending writes (the periodic flush task calls this).
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn decode_event(raw: &[u8]) -> Result<ClassifiedEvent> {
    serde_json::from_slice(raw)
        .map_err(|e| PipelineError::Corruption(format!("unreadable event record: {e}")))
}

fn decode_u64(key: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&key[..8]);
    u64::from_be_bytes(bytes)
}

/// Order-preserving 16-byte time-index key: sign-flipped trigger
/// instant, then storage id to disambiguate equal instants.
fn time_key(trigger_ns: i64, id: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&((trigger_ns as u64) ^ (1 << 63)).to_be_bytes());
    key[8..].copy_from_slice(&id.to_be_bytes());
    key
}

fn matches_filter(event: &ClassifiedEvent, filter: &EventFilter) -> bool {
    if let Some(label) = filter.label {
        if event.classification.label != label {
            return false;
        }
    }
    if let Some(min_mag) = filter.min_magnitude {
        if event.magnitude.value < min_mag {
            return false;
        }
    }
    if let Some(bbox) = &filter.bbox {
        let loc = &event.location;
        if loc.latitude < bbox.min_latitude
            || loc.latitude > bbox.max_latitude
            || loc.longitude < bbox.min_longitude
            || loc.longitude > bbox.max_longitude
        {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        CandidateEvent, CandidateState, ChannelId, Classification, FeatureVector,
        LocationEstimate, MagnitudeEstimate, MagnitudeScale, PipelineTiming, TimeWindow,
    };

    fn sample_event(event_id: &str, sequence: u64, trigger_ns: i64) -> ClassifiedEvent {
        ClassifiedEvent {
            event_id: event_id.to_string(),
            sequence,
            candidate: CandidateEvent {
                detector_id: "sta_lta:QW.STA1.00.HHZ".into(),
                sequence,
                channel: ChannelId::new("QW", "STA1", "00", "HHZ"),
                trigger_ns,
                end_ns: trigger_ns + 5_000_000_000,
                trigger_ratio: 6.2,
                state: CandidateState::Confirmed,
                pre_roll: TimeWindow {
                    start_ns: trigger_ns - 5_000_000_000,
                    end_ns: trigger_ns,
                },
                post_roll: TimeWindow {
                    start_ns: trigger_ns + 5_000_000_000,
                    end_ns: trigger_ns + 15_000_000_000,
                },
            },
            features: FeatureVector {
                schema_id: "qw-std-v1".into(),
                values: vec![1.0, 2.0, 3.0],
            },
            classification: Classification {
                label: EventLabel::Earthquake,
                confidence: 0.92,
            },
            magnitude: MagnitudeEstimate {
                value: 4.1,
                low: 3.8,
                high: 4.4,
                scale: MagnitudeScale::Ml,
            },
            location: LocationEstimate {
                latitude: 35.0,
                longitude: -118.0,
                depth_km: 9.5,
                horizontal_err_km: 2.1,
                depth_err_km: 3.4,
                rms_residual_s: 0.06,
                ellipse_major_km: 2.1,
                ellipse_minor_km: 1.2,
                ellipse_azimuth_deg: 40.0,
            },
            stations: vec!["STA1".into(), "STA2".into(), "STA3".into(), "STA4".into()],
            timing: PipelineTiming {
                detected_at: Utc::now(),
                classified_at: Utc::now(),
                processing_ms: 120,
            },
        }
    }

    fn open_store(dir: &Path) -> EventStore {
        EventStore::open(dir, FsyncMode::PerWrite, "qw-std-v1").unwrap()
    }

    #[test]
    fn append_then_get_by_id_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let event = sample_event("ev-1", 1, 1_000_000_000);
        let id = store.append(&event).unwrap();
        assert_eq!(id, 0);

        let loaded = store.get_by_id("ev-1").unwrap();
        assert_eq!(loaded.event_id, event.event_id);
        assert_eq!(loaded.magnitude.value, event.magnitude.value);
        assert_eq!(loaded.trigger_ns(), event.trigger_ns());
    }

    #[test]
    fn duplicate_append_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store.append(&sample_event("ev-1", 1, 1_000)).unwrap();
        assert!(store.append(&sample_event("ev-1", 2, 2_000)).is_err());
    }

    #[test]
    fn query_orders_by_trigger_instant() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        // Appended out of trigger order on purpose.
        store.append(&sample_event("b", 2, 2_000_000_000)).unwrap();
        store.append(&sample_event("a", 1, 1_000_000_000)).unwrap();
        store.append(&sample_event("c", 3, 3_000_000_000)).unwrap();

        let events = store.query(&EventFilter::default()).unwrap();
        let ids: Vec<&str> = events.iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(events.windows(2).all(|w| w[0].trigger_ns() <= w[1].trigger_ns()));
    }

    #[test]
    fn query_filters_apply() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let mut quiet = sample_event("small", 1, 1_000_000_000);
        quiet.magnitude.value = 2.0;
        store.append(&quiet).unwrap();
        store.append(&sample_event("big", 2, 2_000_000_000)).unwrap();

        let filter = EventFilter {
            min_magnitude: Some(3.0),
            ..Default::default()
        };
        let events = store.query(&filter).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, "big");

        let filter = EventFilter {
            start_ns: Some(1_500_000_000),
            ..Default::default()
        };
        assert_eq!(store.query(&filter).unwrap().len(), 1);
    }

    #[test]
    fn events_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(dir.path());
            store.append(&sample_event("durable", 1, 1_000)).unwrap();
        }
        let store = open_store(dir.path());
        assert_eq!(store.event_count(), 1);
        assert!(store.get_by_id("durable").is_ok());
        // Storage ids keep increasing after reopen.
        let id = store.append(&sample_event("next", 2, 2_000)).unwrap();
        assert_eq!(id, 1);
    }

    #[test]
    fn tail_replays_from_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        for i in 0..5 {
            store
                .append(&sample_event(&format!("ev-{i}"), i, i as i64 * 1_000))
                .unwrap();
        }

        let (backlog, _rx) = store.tail(Some(1)).unwrap();
        let ids: Vec<u64> = backlog.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![2, 3, 4]);

        let (all, _rx) = store.tail(None).unwrap();
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn tail_receives_live_appends() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let (_backlog, mut rx) = store.tail(None).unwrap();

        store.append(&sample_event("live", 1, 9_000)).unwrap();
        let (id, event) = rx.recv().await.unwrap();
        assert_eq!(id, 0);
        assert_eq!(event.event_id, "live");
    }

    #[test]
    fn dead_letters_are_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store
            .dead_letter("detector", "below_min_duration", serde_json::json!({"x": 1}))
            .unwrap();
        store
            .dead_letter("locator", "insufficient stations", serde_json::Value::Null)
            .unwrap();

        assert_eq!(store.dead_letter_count(), 2);
        let records = store.dead_letters(10).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].stage, "locator");
        assert_eq!(records[1].reason, "below_min_duration");
    }

    #[test]
    fn catalog_events_persist_in_origin_order() {
        use chrono::TimeZone;
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let make = |id: &str, minute: u32| CatalogEvent {
            catalog_id: id.to_string(),
            origin_time: Utc.with_ymd_and_hms(2026, 3, 1, 12, minute, 0).unwrap(),
            latitude: 35.0,
            longitude: -118.0,
            depth_km: 10.0,
            magnitude: 4.0,
            magnitude_scale: crate::types::MagnitudeScale::Ml,
            agency: "us".into(),
            raw: serde_json::Value::Null,
        };

        assert!(store.record_catalog_event(&make("b", 30)).unwrap());
        assert!(store.record_catalog_event(&make("a", 10)).unwrap());
        // Same id, same instant: immutable once accepted.
        assert!(!store.record_catalog_event(&make("a", 10)).unwrap());

        let events = store.catalog_events(10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].catalog_id, "a");
        assert_eq!(events[1].catalog_id, "b");
    }

    #[test]
    fn cursors_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(dir.path());
            store.save_cursor("alerts", 41).unwrap();
        }
        let store = open_store(dir.path());
        assert_eq!(store.load_cursor("alerts").unwrap(), Some(41));
        assert_eq!(store.load_cursor("other").unwrap(), None);
    }

    #[test]
    fn incompatible_header_refuses_to_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = sled::open(dir.path()).unwrap();
            let meta = db.open_tree("meta").unwrap();
            meta.insert(
                b"header",
                serde_json::to_vec(&StoreHeader {
                    magic: "other".into(),
                    version: 9,
                    schema_id: "x".into(),
                })
                .unwrap(),
            )
            .unwrap();
            db.flush().unwrap();
        }
        let err = EventStore::open(dir.path(), FsyncMode::PerWrite, "qw-std-v1").unwrap_err();
        assert_eq!(err.kind(), "corruption");
    }
}
