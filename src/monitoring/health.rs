use super::{details_from, DataService, Details};
use crate::config::SharedConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Ordered from best to worst
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    Unhealthy,
}

impl HealthStatus {
    /// Critical and unhealthy snapshots mean the database is not usable
    pub fn is_failure(&self) -> bool {
        matches!(self, HealthStatus::Critical | HealthStatus::Unhealthy)
    }

    /// Value exported on the `db_health_status` gauge
    pub fn gauge_value(&self) -> f64 {
        match self {
            HealthStatus::Healthy => 0.0,
            HealthStatus::Warning => 1.0,
            HealthStatus::Critical => 2.0,
            HealthStatus::Unhealthy => 3.0,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
            HealthStatus::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

/// Immutable point-in-time health observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub latency: Duration,
    pub checked_at: DateTime<Utc>,
    pub details: Option<Details>,
}

impl HealthSnapshot {
    pub fn new(status: HealthStatus, latency: Duration, details: Option<Details>) -> Self {
        Self {
            status,
            latency,
            checked_at: Utc::now(),
            details,
        }
    }

    pub fn latency_ms(&self) -> f64 {
        self.latency.as_secs_f64() * 1000.0
    }
}

/// Runs one health check against the data service and classifies it.
///
/// The probe holds no state; recording the snapshot is the caller's job.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    service: Arc<dyn DataService>,
    config: SharedConfig,
}

impl HealthProbe {
    pub fn new(service: Arc<dyn DataService>, config: SharedConfig) -> Self {
        Self { service, config }
    }

    pub async fn check(&self) -> HealthSnapshot {
        let config = self.config.current();
        let start = Instant::now();

        let healthy = match self.service.health_check().await {
            Ok(healthy) => healthy,
            Err(e) => {
                error!("Database health check failed: {}", e);
                return HealthSnapshot::new(
                    HealthStatus::Unhealthy,
                    start.elapsed(),
                    Some(details_from(json!({ "error": e.to_string() }))),
                );
            }
        };

        if !healthy || !self.service.is_connected() {
            warn!(
                "Database connectivity issue (health_check={}, connected={})",
                healthy,
                self.service.is_connected()
            );
            return HealthSnapshot::new(
                HealthStatus::Critical,
                start.elapsed(),
                Some(details_from(json!({
                    "error": "connectivity issue",
                    "connected": self.service.is_connected(),
                }))),
            );
        }

        if let Err(e) = self.service.verify().await {
            warn!("Database verification query failed: {}", e);
            return HealthSnapshot::new(
                HealthStatus::Critical,
                start.elapsed(),
                Some(details_from(json!({ "query_error": e.to_string() }))),
            );
        }

        let latency = start.elapsed();
        let status = classify_latency(
            latency,
            config.health_warning_latency,
            config.health_critical_latency,
        );

        match status {
            HealthStatus::Healthy => debug!("Database health check passed in {:?}", latency),
            _ => warn!("Database response time degraded: {:?} ({})", latency, status),
        }

        let details = if status == HealthStatus::Healthy {
            None
        } else {
            Some(details_from(json!({
                "latency_ms": latency.as_secs_f64() * 1000.0,
                "warning_threshold_ms": config.health_warning_latency.as_secs_f64() * 1000.0,
                "critical_threshold_ms": config.health_critical_latency.as_secs_f64() * 1000.0,
            })))
        };

        HealthSnapshot::new(status, latency, details)
    }
}

/// Map a successful probe's latency onto a status
pub fn classify_latency(latency: Duration, warning: Duration, critical: Duration) -> HealthStatus {
    if latency > critical {
        HealthStatus::Critical
    } else if latency > warning {
        HealthStatus::Warning
    } else {
        HealthStatus::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitoringConfig;
    use crate::monitoring::MockDataService;

    fn probe_for(service: Arc<MockDataService>) -> HealthProbe {
        let config = MonitoringConfig::builder()
            .health_latency(Duration::from_millis(50), Duration::from_millis(150))
            .build()
            .unwrap();
        HealthProbe::new(service, SharedConfig::new(config))
    }

    #[tokio::test]
    async fn test_healthy_probe() {
        let service = Arc::new(MockDataService::new());
        let snapshot = probe_for(service).check().await;
        assert_eq!(snapshot.status, HealthStatus::Healthy);
        assert!(snapshot.details.is_none());
    }

    #[tokio::test]
    async fn test_exception_is_unhealthy_with_error_detail() {
        let service = Arc::new(MockDataService::new());
        service.fail_health_checks(Some("connection reset"));

        let snapshot = probe_for(service).check().await;
        assert_eq!(snapshot.status, HealthStatus::Unhealthy);
        let details = snapshot.details.unwrap();
        assert_eq!(details["error"], "connection reset");
    }

    #[tokio::test]
    async fn test_false_health_check_is_critical() {
        let service = Arc::new(MockDataService::new());
        service.set_healthy(false);

        let snapshot = probe_for(service).check().await;
        assert_eq!(snapshot.status, HealthStatus::Critical);
    }

    #[tokio::test]
    async fn test_verification_failure_is_critical() {
        let service = Arc::new(MockDataService::new());
        service.fail_verification(Some("relation does not exist"));

        let snapshot = probe_for(service).check().await;
        assert_eq!(snapshot.status, HealthStatus::Critical);
        assert!(snapshot.details.unwrap().contains_key("query_error"));
    }

    #[tokio::test]
    async fn test_latency_tiers() {
        let service = Arc::new(MockDataService::new());
        service.set_latency(Duration::from_millis(80));
        let probe = probe_for(service.clone());
        assert_eq!(probe.check().await.status, HealthStatus::Warning);

        service.set_latency(Duration::from_millis(200));
        assert_eq!(probe.check().await.status, HealthStatus::Critical);
    }

    #[test]
    fn test_classify_latency_boundaries() {
        let warning = Duration::from_secs(1);
        let critical = Duration::from_secs(5);
        assert_eq!(
            classify_latency(Duration::from_secs(1), warning, critical),
            HealthStatus::Healthy
        );
        assert_eq!(
            classify_latency(Duration::from_secs(3), warning, critical),
            HealthStatus::Warning
        );
        assert_eq!(
            classify_latency(Duration::from_secs(6), warning, critical),
            HealthStatus::Critical
        );
    }

    #[test]
    fn test_status_ordering() {
        assert!(HealthStatus::Healthy < HealthStatus::Warning);
        assert!(HealthStatus::Critical < HealthStatus::Unhealthy);
        assert!(HealthStatus::Unhealthy.is_failure());
        assert!(!HealthStatus::Warning.is_failure());
    }
}
