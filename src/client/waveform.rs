//! Waveform client (C2): fetches framed waveform segments from the
//! external data center and decodes them into [`WaveformSegment`]s.
//!
//! Frame layout (little-endian):
//!
//! ```text
//! magic "QWSG" | net len u16 + bytes | sta | loc | cha
//! | start_ns i64 | rate_hz f64 | count u32 | encoding u8 | gain f64
//! | count samples (f32 / i32 / i16 per encoding)
//! ```
//!
//! Integer encodings multiply by the per-segment gain on decode.
//! Segments for the same channel are returned ordered and
//! non-overlapping; upstream overlaps keep the earlier segment.

use std::collections::HashMap;
use std::time::Duration;

use crate::config::ServiceSettings;
use crate::error::{PipelineError, Result};
use crate::types::{ChannelId, WaveformSegment};

use super::cache::{canonical_key, ResponseCache};
use super::resilient::ResilientCaller;

/// Frame magic marker.
pub const FRAME_MAGIC: &[u8; 4] = b"QWSG";

/// Sample encodings on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleEncoding {
    Float32,
    Int32,
    Int16,
}

impl SampleEncoding {
    fn from_byte(b: u8) -> std::result::Result<Self, String> {
        match b {
            0 => Ok(SampleEncoding::Float32),
            1 => Ok(SampleEncoding::Int32),
            2 => Ok(SampleEncoding::Int16),
            other => Err(format!("unknown sample encoding {other}")),
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            SampleEncoding::Float32 => 0,
            SampleEncoding::Int32 => 1,
            SampleEncoding::Int16 => 2,
        }
    }

    fn sample_width(self) -> usize {
        match self {
            SampleEncoding::Float32 | SampleEncoding::Int32 => 4,
            SampleEncoding::Int16 => 2,
        }
    }
}

/// Rate-limited, cached, retrying waveform fetcher.
pub struct WaveformClient {
    http: reqwest::Client,
    base_url: String,
    caller: ResilientCaller,
    cache: ResponseCache<Vec<WaveformSegment>>,
}

impl WaveformClient {
    pub fn new(settings: &ServiceSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .expect("failed to build HTTP client");
        Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            caller: ResilientCaller::from_settings("waveform", settings),
            cache: ResponseCache::new(Duration::from_secs(settings.cache_ttl_s)),
        }
    }

    /// Fetch `[t0_ns, t1_ns)` for a channel selector.
    pub async fn get_waveforms(
        &self,
        channels: &[ChannelId],
        t0_ns: i64,
        t1_ns: i64,
    ) -> Result<Vec<WaveformSegment>> {
        if channels.is_empty() {
            return Err(PipelineError::Validation("empty channel selector".into()));
        }
        if t0_ns >= t1_ns {
            return Err(PipelineError::Validation(format!(
                "empty time range [{t0_ns}, {t1_ns})"
            )));
        }

        let mut selector: Vec<String> = channels.iter().map(|c| c.to_string()).collect();
        selector.sort();
        let pairs = vec![
            ("channels", selector.join(",")),
            ("start_ns", t0_ns.to_string()),
            ("end_ns", t1_ns.to_string()),
        ];
        let key = canonical_key(
            &pairs
                .iter()
                .map(|(k, v)| (*k, v.clone()))
                .collect::<Vec<_>>(),
        );
        if let Some(hit) = self.cache.get(&key).await {
            tracing::debug!(key = %key, "waveform cache hit");
            return Ok(hit);
        }

        let url = self.base_url.clone();
        let http = self.http.clone();
        let bytes = self
            .caller
            .call(move || {
                let http = http.clone();
                let url = url.clone();
                let pairs = pairs.clone();
                async move {
                    let response = http.get(&url).query(&pairs).send().await?;
                    let status = response.status();
                    if status.is_success() {
                        Ok(response.bytes().await?.to_vec())
                    } else if status.as_u16() == 429 {
                        let retry_after_ms = response
                            .headers()
                            .get(reqwest::header::RETRY_AFTER)
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse::<u64>().ok())
                            .map(|secs| secs * 1000)
                            .unwrap_or(1000);
                        Err(PipelineError::RateLimited { retry_after_ms })
                    } else if status.is_server_error() {
                        Err(PipelineError::Transient(format!("waveform service {status}")))
                    } else {
                        Err(PipelineError::Validation(format!("waveform service {status}")))
                    }
                }
            })
            .await?;

        let segments = normalize_per_channel(decode_frames(&bytes)?);
        self.cache.insert(key, segments.clone()).await;
        Ok(segments)
    }

    pub async fn purge_cache(&self) {
        self.cache.purge().await;
    }

    pub fn breaker_state(&self) -> super::breaker::BreakerState {
        self.caller.breaker().state()
    }
}

// ============================================================================
// Frame codec
// ============================================================================

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> std::result::Result<&'a [u8], String> {
        if self.pos + n > self.buf.len() {
            return Err(format!(
                "truncated frame: wanted {n} bytes at offset {}",
                self.pos
            ));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u16(&mut self) -> std::result::Result<u16, String> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> std::result::Result<u32, String> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> std::result::Result<i64, String> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn f64(&mut self) -> std::result::Result<f64, String> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn string(&mut self) -> std::result::Result<String, String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| format!("invalid utf8 in header: {e}"))
    }

    fn at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }
}

/// Decode a response body into segments.
pub fn decode_frames(bytes: &[u8]) -> Result<Vec<WaveformSegment>> {
    let mut reader = Reader { buf: bytes, pos: 0 };
    let mut segments = Vec::new();

    while !reader.at_end() {
        decode_one(&mut reader)
            .map(|seg| segments.push(seg))
            .map_err(|reason| {
                PipelineError::Validation(format!("bad waveform frame: {reason}"))
            })?;
    }
    Ok(segments)
}

fn decode_one(reader: &mut Reader<'_>) -> std::result::Result<WaveformSegment, String> {
    let magic = reader.take(4)?;
    if magic != FRAME_MAGIC {
        return Err(format!("bad magic {magic:?}"));
    }

    let network = reader.string()?;
    let station = reader.string()?;
    let location = reader.string()?;
    let channel = reader.string()?;
    let start_ns = reader.i64()?;
    let rate_hz = reader.f64()?;
    let count = reader.u32()? as usize;
    let encoding = SampleEncoding::from_byte(reader.take(1)?[0])?;
    let gain = reader.f64()?;

    if rate_hz <= 0.0 {
        return Err(format!("non-positive sample rate {rate_hz}"));
    }

    let raw = reader.take(count * encoding.sample_width())?;
    let samples: Vec<f64> = match encoding {
        SampleEncoding::Float32 => raw
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()) as f64)
            .collect(),
        SampleEncoding::Int32 => raw
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes(c.try_into().unwrap()) as f64 * gain)
            .collect(),
        SampleEncoding::Int16 => raw
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes(c.try_into().unwrap()) as f64 * gain)
            .collect(),
    };

    Ok(WaveformSegment::new(
        ChannelId::new(&network, &station, &location, &channel),
        start_ns,
        rate_hz,
        samples,
    ))
}

/// Encode a segment into one frame. Int encodings quantize by `1/gain`.
pub fn encode_frame(
    segment: &WaveformSegment,
    encoding: SampleEncoding,
    gain: f64,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + segment.len() * encoding.sample_width());
    out.extend_from_slice(FRAME_MAGIC);
    for field in [
        &segment.channel.network,
        &segment.channel.station,
        &segment.channel.location,
        &segment.channel.channel,
    ] {
        out.extend_from_slice(&(field.len() as u16).to_le_bytes());
        out.extend_from_slice(field.as_bytes());
    }
    out.extend_from_slice(&segment.start_ns.to_le_bytes());
    out.extend_from_slice(&segment.sample_rate.to_le_bytes());
    out.extend_from_slice(&(segment.len() as u32).to_le_bytes());
    out.push(encoding.to_byte());
    out.extend_from_slice(&gain.to_le_bytes());

    match encoding {
        SampleEncoding::Float32 => {
            for &v in &segment.samples {
                out.extend_from_slice(&(v as f32).to_le_bytes());
            }
        }
        SampleEncoding::Int32 => {
            for &v in &segment.samples {
                out.extend_from_slice(&((v / gain).round() as i32).to_le_bytes());
            }
        }
        SampleEncoding::Int16 => {
            for &v in &segment.samples {
                out.extend_from_slice(&((v / gain).round() as i16).to_le_bytes());
            }
        }
    }
    out
}

/// Per-channel ordering and overlap dedup: sort by start, keep the
/// earlier segment when two overlap.
fn normalize_per_channel(segments: Vec<WaveformSegment>) -> Vec<WaveformSegment> {
    let mut by_channel: HashMap<ChannelId, Vec<WaveformSegment>> = HashMap::new();
    for seg in segments {
        by_channel.entry(seg.channel.clone()).or_default().push(seg);
    }

    let mut out = Vec::new();
    let mut channels: Vec<ChannelId> = by_channel.keys().cloned().collect();
    channels.sort_by_key(|c| c.to_string());

    for channel in channels {
        let mut group = by_channel.remove(&channel).unwrap_or_default();
        group.sort_by_key(|s| s.start_ns);
        let mut last_end = i64::MIN;
        for seg in group {
            if seg.start_ns < last_end {
                tracing::warn!(channel = %seg.channel, start_ns = seg.start_ns, "dropping overlapping segment");
                continue;
            }
            last_end = seg.end_ns();
            out.push(seg);
        }
    }
    out
}
