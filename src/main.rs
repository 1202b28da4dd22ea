//! Quakewatch — real-time seismic event pipeline.
//!
//! # Usage
//!
//! ```bash
//! # Demo mode: synthetic 4-channel network, built-in model
//! cargo run --release -- --synthetic
//!
//! # Live mode: poll the configured waveform service for every
//! # registered station
//! QUAKEWATCH_CONFIG=quakewatch.toml cargo run --release -- --live
//! ```
//!
//! # Environment Variables
//!
//! - `QUAKEWATCH_CONFIG`: path to the TOML configuration
//! - `RUST_LOG`: logging filter (default: info)
//!
//! # Exit codes
//!
//! 0 normal shutdown · 1 configuration error · 2 unrecoverable store
//! corruption · 3 model load failure · 4 bind/listen failure

use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use quakewatch::alerts::{AlertDispatcher, AlertSubscriber, LogSubscriber};
use quakewatch::api::{self, ApiState};
use quakewatch::config::{self, PipelineConfig};
use quakewatch::pipeline::{Pipeline, SegmentSource, SyntheticSource};
use quakewatch::types::ChannelId;
use quakewatch::Runtime;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "quakewatch")]
#[command(about = "Real-time seismic event detection, classification, and location")]
#[command(version)]
struct CliArgs {
    /// Path to the TOML configuration (overrides QUAKEWATCH_CONFIG)
    #[arg(long)]
    config: Option<String>,

    /// Override the API bind address (default from config)
    #[arg(short, long)]
    addr: Option<String>,

    /// Generate a synthetic multi-channel network with periodic bursts
    /// and serve the built-in model (demo mode)
    #[arg(long)]
    synthetic: bool,

    /// Poll the configured waveform service for every registered station
    #[arg(long)]
    live: bool,

    /// Seconds between synthetic bursts (0 = noise only)
    #[arg(long, default_value = "60")]
    burst_period_s: f64,

    /// Synthetic sample rate in Hz
    #[arg(long, default_value = "100")]
    sample_rate: f64,
}

// ============================================================================
// Exit-code mapping
// ============================================================================

/// Map a startup failure onto the documented exit codes.
fn startup_exit_code(err: &quakewatch::PipelineError) -> i32 {
    match err.kind() {
        "corruption" => 2,
        "schema_mismatch" => 3,
        "validation" if err.to_string().contains("model") => 3,
        _ => 1,
    }
}

fn main() {
    let args = CliArgs::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Configuration: file errors and range violations are exit code 1.
    let config_result = match &args.config {
        Some(path) => PipelineConfig::load_from(path),
        None => PipelineConfig::load(),
    };
    let mut loaded = match config_result {
        Ok(c) => c,
        Err(err) => {
            error!("configuration error: {err}");
            std::process::exit(1);
        }
    };
    if let Some(addr) = &args.addr {
        loaded.server.addr = addr.clone();
    }

    let outcome = config::validate(&loaded);
    for warning in &outcome.warnings {
        warn!("config warning: {warning}");
    }
    if !outcome.is_ok() {
        for e in &outcome.errors {
            error!("config error: {e}");
        }
        std::process::exit(1);
    }
    config::init(loaded);

    let runtime = tokio::runtime::Runtime::new().expect("failed to build tokio runtime");
    let code = runtime.block_on(run(args));
    std::process::exit(code);
}

async fn run(args: CliArgs) -> i32 {
    let config = config::get();

    info!("🌍 Quakewatch starting");
    info!("   detection:  STA/LTA {}s/{}s, on {} off {}",
        config.detector.sta_s, config.detector.lta_s, config.detector.r_on, config.detector.r_off);
    info!("   bandpass:   {}-{} Hz order {}",
        config.processor.bandpass.low_hz, config.processor.bandpass.high_hz, config.processor.bandpass.order);
    info!("   store:      {} ({:?})", config.store.dir, config.store.fsync);

    let runtime = match Runtime::initialize(config, args.synthetic) {
        Ok(rt) => rt,
        Err(err) => {
            error!("startup failed: {err}");
            return startup_exit_code(&err);
        }
    };

    let cancel = CancellationToken::new();

    // Segment sources: one per channel.
    let sources = build_sources(&args, &runtime);
    if sources.is_empty() {
        error!("no input sources configured (pass --synthetic or --live)");
        return 1;
    }

    let pipeline = Pipeline::spawn(
        runtime.clone(),
        config.pipeline,
        config.detector,
        sources,
        cancel.clone(),
    );

    // Metadata path: periodic catalog sync (live mode only; demo runs
    // have no external catalog to poll).
    if args.live {
        tokio::spawn(catalog_sync_task(runtime.clone(), cancel.clone()));
    }

    // Alert dispatcher over the store tail.
    let subscribers: Vec<Arc<dyn AlertSubscriber>> = vec![Arc::new(LogSubscriber)];
    let dispatcher = match AlertDispatcher::new(
        &config.alerts,
        subscribers,
        runtime.store.clone(),
        runtime.metrics.clone(),
    ) {
        Ok(d) => d,
        Err(err) => {
            error!("alert rules invalid: {err}");
            return 1;
        }
    };
    let dispatcher_task = tokio::spawn(dispatcher.run(cancel.clone()));

    // API server; bind failure is exit code 4.
    let state = ApiState {
        runtime: runtime.clone(),
        auth: config.auth.clone(),
        model_path: config.model.path.clone(),
    };
    let server_cancel = cancel.clone();
    let addr = config.server.addr.clone();
    let server_task = tokio::spawn(api::serve(state, addr, server_cancel));

    // Everything is initialized: flip readiness.
    runtime.metrics.mark_ready();
    info!("✅ ready");

    // Shutdown on SIGINT/SIGTERM, or if the server fails to bind.
    let exit_code = tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received");
            0
        }
        result = server_task => {
            match result {
                Ok(Ok(())) => 0,
                Ok(Err(err)) => {
                    error!("server failed: {err}");
                    4
                }
                Err(err) => {
                    error!("server task panicked: {err}");
                    4
                }
            }
        }
    };

    // Drain: cancel ingest, let the queue empty, flush the committer.
    cancel.cancel();
    pipeline.shutdown().await;
    let _ = dispatcher_task.await;

    let m = &runtime.metrics;
    use std::sync::atomic::Ordering;
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("📊 FINAL STATISTICS");
    info!("   Segments processed:  {}", m.segments_processed.load(Ordering::Relaxed));
    info!("   Triggers confirmed:  {}", m.triggers_confirmed.load(Ordering::Relaxed));
    info!("   Triggers rejected:   {}", m.triggers_rejected.load(Ordering::Relaxed));
    info!("   Events committed:    {}", m.events_committed.load(Ordering::Relaxed));
    info!("   Dead letters:        {}", m.dead_letters.load(Ordering::Relaxed));
    info!("   Alerts sent:         {}", m.alerts_sent.load(Ordering::Relaxed));
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    exit_code
}

/// Build per-channel sources for the selected input mode.
fn build_sources(args: &CliArgs, runtime: &Arc<Runtime>) -> Vec<Box<dyn SegmentSource>> {
    let mut sources: Vec<Box<dyn SegmentSource>> = Vec::new();

    if args.synthetic {
        for station in runtime.locator.registry().stations() {
            let channel = ChannelId::new(&station.network, &station.code, "", "HHZ");
            sources.push(Box::new(SyntheticSource::new(
                channel,
                args.sample_rate,
                args.burst_period_s,
                true,
            )));
        }
        info!(channels = sources.len(), "synthetic network ready");
    } else if args.live {
        for station in runtime.locator.registry().stations() {
            let channel = ChannelId::new(&station.network, &station.code, "", "HHZ");
            sources.push(Box::new(quakewatch::pipeline::LiveSource::new(
                runtime.waveform.clone(),
                channel,
                1000,
            )));
        }
        info!(channels = sources.len(), "live waveform polling ready");
    }

    sources
}

/// Pull recent catalog events, validate them, and persist accepted
/// records; rejects go to the dead-letter stream with their reasons.
async fn catalog_sync_task(runtime: Arc<Runtime>, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(std::time::Duration::from_secs(300));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }

        let now = chrono::Utc::now();
        let query = quakewatch::client::EventQuery {
            start: now - chrono::Duration::hours(1),
            end: now,
            bbox: None,
            min_magnitude: None,
        };
        match runtime.catalog.fetch_events(&query).await {
            Ok(events) => {
                let mut accepted = 0usize;
                for event in events {
                    match quakewatch::validator::check_catalog_event(&event) {
                        Ok(()) => {
                            if runtime.store.record_catalog_event(&event).unwrap_or(false) {
                                accepted += 1;
                            }
                        }
                        Err(reasons) => {
                            let _ = runtime.store.dead_letter(
                                "catalog-validator",
                                &reasons.join("; "),
                                event.raw.clone(),
                            );
                        }
                    }
                }
                if accepted > 0 {
                    info!(accepted, "catalog sync stored new events");
                }
            }
            Err(err) => warn!(error = %err, "catalog sync failed"),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
