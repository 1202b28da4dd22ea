//! Segment source abstraction for waveform ingestion.
//!
//! One trait covers every input mode: the live waveform client, replay
//! of pre-built segments (tests), and a synthetic generator for demos.
//! The ingest loop calls [`next_segment`] in a select! with
//! cancellation.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::sync::Arc;

use crate::client::WaveformClient;
use crate::types::{ChannelId, WaveformSegment, NANOS_PER_SEC};

/// Events produced by a segment source.
pub enum SegmentEvent {
    /// A segment was read.
    Segment(WaveformSegment),
    /// Source reached end of data.
    Eof,
}

/// Trait abstracting where waveform segments come from.
#[async_trait]
pub trait SegmentSource: Send + 'static {
    /// Read the next segment. `Err` means an unrecoverable source error.
    async fn next_segment(&mut self) -> anyhow::Result<SegmentEvent>;

    /// Human-readable name for logging (e.g. "replay", "synthetic").
    fn source_name(&self) -> &str;
}

// ============================================================================
// Replay source (tests, canned data)
// ============================================================================

/// Replays pre-built segments with an optional inter-segment delay.
pub struct ReplaySource {
    segments: std::vec::IntoIter<WaveformSegment>,
    delay_ms: u64,
    yielded_first: bool,
}

impl ReplaySource {
    pub fn new(segments: Vec<WaveformSegment>, delay_ms: u64) -> Self {
        Self {
            segments: segments.into_iter(),
            delay_ms,
            yielded_first: false,
        }
    }
}

#[async_trait]
impl SegmentSource for ReplaySource {
    async fn next_segment(&mut self) -> anyhow::Result<SegmentEvent> {
        if self.yielded_first && self.delay_ms > 0 {
            tokio::time::sleep(tokio::time::Duration::from_millis(self.delay_ms)).await;
        }
        match self.segments.next() {
            Some(seg) => {
                self.yielded_first = true;
                Ok(SegmentEvent::Segment(seg))
            }
            None => Ok(SegmentEvent::Eof),
        }
    }

    fn source_name(&self) -> &str {
        "replay"
    }
}

// ============================================================================
// Synthetic source (demo mode)
// ============================================================================

/// Generates Gaussian noise with periodic sine bursts on one channel.
///
/// Chunks are emitted back to back in stream time; `pace` controls
/// whether wall-clock pacing matches stream time (demo) or runs flat
/// out (tests).
pub struct SyntheticSource {
    channel: ChannelId,
    sample_rate: f64,
    chunk_len: usize,
    /// Seconds of stream time between burst onsets; 0 disables bursts.
    burst_period_s: f64,
    burst_len_s: f64,
    burst_amplitude: f64,
    pace: bool,
    next_start_ns: i64,
    rng: StdRng,
    noise: Normal<f64>,
}

impl SyntheticSource {
    pub fn new(channel: ChannelId, sample_rate: f64, burst_period_s: f64, pace: bool) -> Self {
        // Seed per channel so multi-channel runs differ but reruns do not.
        let seed = channel
            .to_string()
            .bytes()
            .fold(0x51_57u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
        Self {
            channel,
            sample_rate,
            chunk_len: sample_rate as usize, // 1 s chunks
            burst_period_s,
            burst_len_s: 5.0,
            burst_amplitude: 20.0,
            pace,
            next_start_ns: 0,
            rng: StdRng::seed_from_u64(seed),
            noise: Normal::new(0.0, 1.0).expect("unit normal"),
        }
    }

    /// Stream-time start for the first chunk (defaults to 0).
    pub fn starting_at(mut self, start_ns: i64) -> Self {
        self.next_start_ns = start_ns;
        self
    }
}

#[async_trait]
impl SegmentSource for SyntheticSource {
    async fn next_segment(&mut self) -> anyhow::Result<SegmentEvent> {
        if self.pace {
            let chunk_ms = (self.chunk_len as f64 / self.sample_rate * 1000.0) as u64;
            tokio::time::sleep(tokio::time::Duration::from_millis(chunk_ms)).await;
        }

        let start_ns = self.next_start_ns;
        let period_ns = (NANOS_PER_SEC as f64 / self.sample_rate) as i64;
        self.next_start_ns += self.chunk_len as i64 * period_ns;

        let mut samples: Vec<f64> = (0..self.chunk_len)
            .map(|_| self.noise.sample(&mut self.rng))
            .collect();

        if self.burst_period_s > 0.0 {
            let burst_period_ns = (self.burst_period_s * NANOS_PER_SEC as f64) as i64;
            let burst_len_ns = (self.burst_len_s * NANOS_PER_SEC as f64) as i64;
            for (i, v) in samples.iter_mut().enumerate() {
                let t_ns = start_ns + i as i64 * period_ns;
                let phase_ns = t_ns.rem_euclid(burst_period_ns);
                // Bursts occupy the first burst_len of each period,
                // skipping the very first period so the LTA can settle.
                if t_ns >= burst_period_ns && phase_ns < burst_len_ns {
                    let t_s = t_ns as f64 / NANOS_PER_SEC as f64;
                    *v += self.burst_amplitude
                        * (2.0 * std::f64::consts::PI * 5.0 * t_s).sin();
                }
            }
        }

        Ok(SegmentEvent::Segment(WaveformSegment::new(
            self.channel.clone(),
            start_ns,
            self.sample_rate,
            samples,
        )))
    }

    fn source_name(&self) -> &str {
        "synthetic"
    }
}

// ============================================================================
// Live source (waveform client)
// ============================================================================

/// Polls the waveform client for successive time windows.
pub struct LiveSource {
    client: Arc<WaveformClient>,
    channel: ChannelId,
    poll_interval_ms: u64,
    cursor_ns: i64,
    pending: Vec<WaveformSegment>,
}

impl LiveSource {
    pub fn new(client: Arc<WaveformClient>, channel: ChannelId, poll_interval_ms: u64) -> Self {
        let now_ns = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default();
        Self {
            client,
            channel,
            poll_interval_ms,
            cursor_ns: now_ns,
            pending: Vec::new(),
        }
    }
}

#[async_trait]
impl SegmentSource for LiveSource {
    async fn next_segment(&mut self) -> anyhow::Result<SegmentEvent> {
        loop {
            if let Some(seg) = self.pending.pop() {
                return Ok(SegmentEvent::Segment(seg));
            }

            tokio::time::sleep(tokio::time::Duration::from_millis(self.poll_interval_ms)).await;
            let now_ns = chrono::Utc::now()
                .timestamp_nanos_opt()
                .unwrap_or_default();
            if now_ns <= self.cursor_ns {
                continue;
            }

            match self
                .client
                .get_waveforms(std::slice::from_ref(&self.channel), self.cursor_ns, now_ns)
                .await
            {
                Ok(mut segments) => {
                    if let Some(last_end) = segments.iter().map(|s| s.end_ns()).max() {
                        self.cursor_ns = last_end;
                    } else {
                        self.cursor_ns = now_ns;
                    }
                    // Serve oldest first.
                    segments.sort_by_key(|s| std::cmp::Reverse(s.start_ns));
                    self.pending = segments;
                }
                Err(err) if err.is_retryable() => {
                    tracing::warn!(channel = %self.channel, error = %err, "waveform poll failed, will retry");
                }
                Err(err) => {
                    // Unavailable (breaker open) keeps polling; anything
                    // else is unrecoverable for this source.
                    if err.kind() == "unavailable" {
                        tracing::warn!(channel = %self.channel, "waveform service unavailable");
                    } else {
                        return Err(anyhow::anyhow!("waveform source failed: {err}"));
                    }
                }
            }
        }
    }

    fn source_name(&self) -> &str {
        "waveform-client"
    }
}
