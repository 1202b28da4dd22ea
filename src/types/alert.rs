//! Outbound alert record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Alert severity, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertLevel {
    Info,
    Warn,
    Critical,
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertLevel::Info => write!(f, "INFO"),
            AlertLevel::Warn => write!(f, "WARN"),
            AlertLevel::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// One outbound notification. At most one alert is emitted per
/// `dedup_key` within the dispatcher's dedup window; later matches
/// increment a suppression counter instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub event_id: String,
    pub level: AlertLevel,
    pub issued_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub dedup_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered() {
        assert!(AlertLevel::Critical > AlertLevel::Warn);
        assert!(AlertLevel::Warn > AlertLevel::Info);
    }
}
