//! Physical-range validation of the loaded configuration.
//!
//! Errors are fatal to startup (exit code 1). Warnings flag values that
//! parse but look operationally suspicious; they never block startup.

use super::settings::PipelineConfig;

/// Result of validating a configuration.
#[derive(Debug, Default)]
pub struct ValidationOutcome {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationOutcome {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validate every section of the configuration.
pub fn validate(config: &PipelineConfig) -> ValidationOutcome {
    let mut out = ValidationOutcome::default();

    validate_detector(config, &mut out);
    validate_processor(config, &mut out);
    validate_services(config, &mut out);
    validate_features(config, &mut out);
    validate_locator(config, &mut out);
    validate_pipeline(config, &mut out);
    validate_alerts(config, &mut out);

    out
}

fn validate_detector(config: &PipelineConfig, out: &mut ValidationOutcome) {
    let d = &config.detector;
    if d.sta_s <= 0.0 || d.lta_s <= 0.0 {
        out.errors
            .push(format!("detector windows must be positive (sta={}, lta={})", d.sta_s, d.lta_s));
    }
    if d.sta_s >= d.lta_s {
        out.errors
            .push(format!("detector.sta_s ({}) must be shorter than detector.lta_s ({})", d.sta_s, d.lta_s));
    }
    if d.r_off >= d.r_on {
        out.errors
            .push(format!("detector.r_off ({}) must be below detector.r_on ({})", d.r_off, d.r_on));
    }
    if d.d_min_s <= 0.0 || d.d_max_s <= d.d_min_s {
        out.errors.push(format!(
            "detector durations must satisfy 0 < d_min_s ({}) < d_max_s ({})",
            d.d_min_s, d.d_max_s
        ));
    }
    if d.pre_roll_s < 0.0 || d.post_roll_s < 0.0 || d.refractory_s < 0.0 {
        out.errors
            .push("detector roll/refractory intervals must be non-negative".to_string());
    }
    if d.r_on < 1.5 {
        out.warnings
            .push(format!("detector.r_on = {} will trigger on modest noise excursions", d.r_on));
    }
}

fn validate_processor(config: &PipelineConfig, out: &mut ValidationOutcome) {
    let bp = &config.processor.bandpass;
    if bp.low_hz <= 0.0 || bp.high_hz <= bp.low_hz {
        out.errors.push(format!(
            "processor.bandpass requires 0 < low_hz ({}) < high_hz ({})",
            bp.low_hz, bp.high_hz
        ));
    }
    if bp.order == 0 || bp.order > 12 {
        out.errors
            .push(format!("processor.bandpass.order ({}) must be in 1..=12", bp.order));
    }
}

fn validate_services(config: &PipelineConfig, out: &mut ValidationOutcome) {
    for (name, svc) in [("catalog", &config.catalog), ("waveform", &config.waveform)] {
        if svc.rate_limit_rps <= 0.0 {
            out.errors
                .push(format!("{name}.rate_limit_rps must be positive"));
        }
        if svc.burst == 0 {
            out.errors.push(format!("{name}.burst must be at least 1"));
        }
        if svc.timeout_ms == 0 {
            out.errors.push(format!("{name}.timeout_ms must be positive"));
        }
        if svc.breaker.threshold == 0 {
            out.errors
                .push(format!("{name}.breaker.threshold must be at least 1"));
        }
        if svc.base_url.is_empty() {
            out.errors.push(format!("{name}.base_url must be set"));
        }
    }
}

fn validate_features(config: &PipelineConfig, out: &mut ValidationOutcome) {
    let f = &config.features;
    if f.bands.is_empty() {
        out.errors.push("features.bands must not be empty".to_string());
    }
    for band in &f.bands {
        if band[0] <= 0.0 || band[1] <= band[0] {
            out.errors
                .push(format!("features band [{}, {}] must satisfy 0 < low < high", band[0], band[1]));
        }
    }
    if !matches!(f.wavelet.as_str(), "haar" | "db4") {
        out.errors
            .push(format!("features.wavelet '{}' is not supported (haar, db4)", f.wavelet));
    }
    if f.wavelet_levels == 0 || f.wavelet_levels > 10 {
        out.errors
            .push(format!("features.wavelet_levels ({}) must be in 1..=10", f.wavelet_levels));
    }
}

fn validate_locator(config: &PipelineConfig, out: &mut ValidationOutcome) {
    let l = &config.locator;
    if l.min_stations < 4 {
        out.errors.push(format!(
            "locator.min_stations ({}) must be at least 4 (three spatial unknowns plus origin time)",
            l.min_stations
        ));
    }
    if l.grid_step_deg <= 0.0 || l.grid_step_deg > 2.0 {
        out.errors
            .push(format!("locator.grid_step_deg ({}) must be in (0, 2]", l.grid_step_deg));
    }
    if l.max_iter == 0 {
        out.errors.push("locator.max_iter must be positive".to_string());
    }
    if l.eps_km <= 0.0 {
        out.errors.push("locator.eps_km must be positive".to_string());
    }
}

fn validate_pipeline(config: &PipelineConfig, out: &mut ValidationOutcome) {
    let p = &config.pipeline;
    if p.queue_capacity == 0 {
        out.errors
            .push("pipeline.queue_capacity must be at least 1".to_string());
    }
    if p.worker_count == 0 {
        out.errors
            .push("pipeline.worker_count must be at least 1".to_string());
    }
    if p.queue_capacity < p.worker_count {
        out.warnings.push(format!(
            "pipeline.queue_capacity ({}) below worker_count ({}) leaves workers idle",
            p.queue_capacity, p.worker_count
        ));
    }
}

fn validate_alerts(config: &PipelineConfig, out: &mut ValidationOutcome) {
    if config.alerts.per_subscriber_rps <= 0.0 {
        out.errors
            .push("alerts.per_subscriber_rps must be positive".to_string());
    }
    for (i, rule) in config.alerts.rules.iter().enumerate() {
        if rule.dedup_template.is_empty() {
            out.errors
                .push(format!("alerts.rules[{i}].dedup_template must not be empty"));
        }
        if let Some(ref label) = rule.label {
            if label.parse::<crate::types::EventLabel>().is_err() {
                out.errors
                    .push(format!("alerts.rules[{i}].label '{label}' is not a known label"));
            }
        }
        if rule.label.is_none() && rule.min_magnitude.is_none() && rule.min_confidence.is_none() {
            out.warnings
                .push(format!("alerts.rules[{i}] matches every event"));
        }
    }
}
