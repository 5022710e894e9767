pub mod alerts;
pub mod analytics;
pub mod data_service;
pub mod health;
pub mod metrics;
pub mod monitor;
pub mod patterns;
pub mod query_monitor;
pub mod query_tracker;
pub mod recovery;
pub mod retry;
pub mod rules;
pub mod wrapper;

pub use alerts::*;
pub use analytics::*;
pub use data_service::*;
pub use health::*;
pub use metrics::*;
pub use monitor::*;
pub use patterns::*;
pub use query_monitor::*;
pub use query_tracker::*;
pub use recovery::*;
pub use wrapper::*;

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Error => "error",
            AlertSeverity::Critical => "critical",
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    SlowQuery,
    NPlusOne,
    HighErrorRate,
    ConnectionFailure,
    SuspiciousQuery,
    RateLimitExceeded,
    PerformanceDegradation,
    ConnectionRecovered,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::SlowQuery => "slow_query",
            AlertType::NPlusOne => "n_plus_one",
            AlertType::HighErrorRate => "high_error_rate",
            AlertType::ConnectionFailure => "connection_failure",
            AlertType::SuspiciousQuery => "suspicious_query",
            AlertType::RateLimitExceeded => "rate_limit_exceeded",
            AlertType::PerformanceDegradation => "performance_degradation",
            AlertType::ConnectionRecovered => "connection_recovered",
        }
    }

    pub fn category(&self) -> AlertCategory {
        match self {
            AlertType::SlowQuery | AlertType::NPlusOne | AlertType::PerformanceDegradation => {
                AlertCategory::Performance
            }
            AlertType::HighErrorRate
            | AlertType::ConnectionFailure
            | AlertType::SuspiciousQuery
            | AlertType::RateLimitExceeded
            | AlertType::ConnectionRecovered => AlertCategory::Security,
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which projection of the alert history an alert belongs to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AlertCategory {
    Performance,
    Security,
}

/// Structured payload attached to snapshots and alerts
pub type Details = serde_json::Map<String, serde_json::Value>;

/// Turn a `json!({...})` object into `Details`; non-objects are wrapped under `"value"`
pub fn details_from(value: serde_json::Value) -> Details {
    match value {
        serde_json::Value::Object(map) => map,
        other => {
            let mut map = Details::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}
