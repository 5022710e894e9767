use super::{
    details_from, AlertCategory, AlertSeverity, AlertType, Details, MetricsCollector,
    PerformanceMetrics, QueryExecution, QueryPattern,
};
use crate::config::{MonitoringConfig, SharedConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    pub id: Uuid,
    pub alert_type: AlertType,
    pub category: AlertCategory,
    pub severity: AlertSeverity,
    pub message: String,
    pub details: Details,
    pub timestamp: DateTime<Utc>,
}

/// An alert that has been decided on but not yet raised
#[derive(Debug, Clone, PartialEq)]
pub struct AlertDraft {
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub details: Details,
}

impl AlertDraft {
    pub fn new(alert_type: AlertType, severity: AlertSeverity, message: impl Into<String>) -> Self {
        Self {
            alert_type,
            severity,
            message: message.into(),
            details: Details::new(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details_from(details);
        self
    }
}

impl From<AlertDraft> for Alert {
    fn from(draft: AlertDraft) -> Self {
        Self {
            id: Uuid::new_v4(),
            alert_type: draft.alert_type,
            category: draft.alert_type.category(),
            severity: draft.severity,
            message: draft.message,
            details: draft.details,
            timestamp: Utc::now(),
        }
    }
}

/// Receiver of every new alert. Runs synchronously inside dispatch, so it
/// must not raise alerts itself.
pub trait AlertCallback: Send + Sync {
    fn on_alert(&self, alert: &Alert) -> anyhow::Result<()>;
}

impl<F> AlertCallback for F
where
    F: Fn(&Alert) -> anyhow::Result<()> + Send + Sync,
{
    fn on_alert(&self, alert: &Alert) -> anyhow::Result<()> {
        self(alert)
    }
}

/// Token returned by `add_alert_callback`, used for removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u64);

/// Severity tier for a finished query, or `None` below the slow threshold
pub fn slow_query_severity(duration: Duration, config: &MonitoringConfig) -> Option<AlertSeverity> {
    if duration >= config.critical_query_threshold {
        Some(AlertSeverity::Critical)
    } else if duration >= config.very_slow_query_threshold {
        Some(AlertSeverity::Error)
    } else if duration >= config.slow_query_threshold {
        Some(AlertSeverity::Warning)
    } else {
        None
    }
}

/// `Error` above the threshold, `Critical` when everything failed
pub fn error_rate_severity(error_rate: f64, threshold: f64) -> Option<AlertSeverity> {
    if error_rate <= threshold {
        None
    } else if error_rate >= 1.0 {
        Some(AlertSeverity::Critical)
    } else {
        Some(AlertSeverity::Error)
    }
}

/// `Error` at the threshold, `Critical` at twice the threshold
pub fn connection_failure_severity(failures: u32, threshold: u32) -> Option<AlertSeverity> {
    if threshold == 0 || failures < threshold {
        None
    } else if failures >= threshold.saturating_mul(2) {
        Some(AlertSeverity::Critical)
    } else {
        Some(AlertSeverity::Error)
    }
}

pub fn error_rate_draft(metrics: &PerformanceMetrics, threshold: f64) -> Option<AlertDraft> {
    if metrics.total_queries == 0 {
        return None;
    }
    let severity = error_rate_severity(metrics.error_rate, threshold)?;
    Some(
        AlertDraft::new(
            AlertType::HighErrorRate,
            severity,
            format!(
                "High error rate: {:.1}% of {} queries failed (threshold {:.1}%)",
                metrics.error_rate * 100.0,
                metrics.total_queries,
                threshold * 100.0
            ),
        )
        .with_details(json!({
            "error_rate": metrics.error_rate,
            "threshold": threshold,
            "total_queries": metrics.total_queries,
            "failed_queries": metrics.failed_queries,
        })),
    )
}

pub fn connection_failure_draft(failures: u32, threshold: u32) -> Option<AlertDraft> {
    let severity = connection_failure_severity(failures, threshold)?;
    Some(
        AlertDraft::new(
            AlertType::ConnectionFailure,
            severity,
            format!("{failures} consecutive database connection failures"),
        )
        .with_details(json!({
            "consecutive_failures": failures,
            "threshold": threshold,
        })),
    )
}

/// Threshold evaluation, bounded alert history, and callback fan-out
pub struct AlertingSystem {
    config: SharedConfig,
    history: RwLock<VecDeque<Alert>>,
    callbacks: RwLock<Vec<(CallbackId, Arc<dyn AlertCallback>)>>,
    next_callback_id: AtomicU64,
    dispatch: Mutex<()>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl fmt::Debug for AlertingSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertingSystem")
            .field("alerts", &self.alert_count())
            .field("callbacks", &self.callback_count())
            .finish_non_exhaustive()
    }
}

impl AlertingSystem {
    pub fn new(config: SharedConfig) -> Self {
        Self {
            config,
            history: RwLock::new(VecDeque::new()),
            callbacks: RwLock::new(Vec::new()),
            next_callback_id: AtomicU64::new(1),
            dispatch: Mutex::new(()),
            metrics: None,
        }
    }

    /// Count every raised alert in `db_alerts_total`
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn add_alert_callback(&self, callback: Arc<dyn AlertCallback>) -> CallbackId {
        let id = CallbackId(self.next_callback_id.fetch_add(1, Ordering::SeqCst));
        if let Ok(mut callbacks) = self.callbacks.write() {
            callbacks.push((id, callback));
        }
        debug!("Registered alert callback {:?}", id);
        id
    }

    pub fn remove_alert_callback(&self, id: CallbackId) -> bool {
        match self.callbacks.write() {
            Ok(mut callbacks) => {
                let before = callbacks.len();
                callbacks.retain(|(existing, _)| *existing != id);
                callbacks.len() != before
            }
            Err(_) => false,
        }
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.read().map(|c| c.len()).unwrap_or(0)
    }

    /// Record the alert, then run every callback in registration order
    pub fn trigger_alert(&self, draft: AlertDraft) -> Alert {
        let alert = Alert::from(draft);

        match alert.severity {
            AlertSeverity::Info => info!(alert_type = %alert.alert_type, "{}", alert.message),
            AlertSeverity::Warning => warn!(alert_type = %alert.alert_type, "{}", alert.message),
            AlertSeverity::Error | AlertSeverity::Critical => error!(
                alert_type = %alert.alert_type,
                severity = %alert.severity,
                "{}",
                alert.message
            ),
        }

        let max_history = self.config.current().max_security_history;
        if let Ok(mut history) = self.history.write() {
            history.push_back(alert.clone());
            while history.len() > max_history {
                history.pop_front();
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_alert(&alert);
        }

        self.dispatch(&alert);
        alert
    }

    fn dispatch(&self, alert: &Alert) {
        let _guard = match self.dispatch.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let callbacks: Vec<(CallbackId, Arc<dyn AlertCallback>)> = match self.callbacks.read() {
            Ok(callbacks) => callbacks.clone(),
            Err(_) => return,
        };

        for (id, callback) in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback.on_alert(alert))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Alert callback {:?} failed: {}", id, e),
                Err(_) => error!("Alert callback {:?} panicked", id),
            }
        }
    }

    pub fn check_slow_query_alert(&self, execution: &QueryExecution) -> Option<Alert> {
        let duration = execution.duration?;
        let config = self.config.current();
        let severity = slow_query_severity(duration, &config)?;

        let duration_ms = duration.as_secs_f64() * 1000.0;
        let draft = AlertDraft::new(
            AlertType::SlowQuery,
            severity,
            format!(
                "Slow {} query on {} took {:.0}ms",
                execution.query_type,
                execution.table_label(),
                duration_ms
            ),
        )
        .with_details(json!({
            "query_id": execution.query_id,
            "query_type": execution.query_type,
            "table_name": execution.table_name,
            "query_hash": execution.query_hash,
            "duration_ms": duration_ms,
            "threshold_ms": config.slow_query_threshold.as_secs_f64() * 1000.0,
        }));
        Some(self.trigger_alert(draft))
    }

    pub fn check_pattern_alert(&self, pattern: &QueryPattern) -> Alert {
        let table = pattern.table_name.as_deref().unwrap_or("unknown");
        let draft = AlertDraft::new(
            AlertType::NPlusOne,
            pattern.severity,
            format!(
                "Potential N+1 query: {} identical queries on {} within {:?}",
                pattern.occurrence_count, table, pattern.time_window
            ),
        )
        .with_details(json!({
            "occurrence_count": pattern.occurrence_count,
            "table_name": pattern.table_name,
            "query_hash": pattern.query_hash,
            "time_window_secs": pattern.time_window.as_secs_f64(),
            "sample_query": pattern.sample_query,
        }));
        self.trigger_alert(draft)
    }

    pub fn check_error_rate_alert(&self, metrics: &PerformanceMetrics) -> Option<Alert> {
        let threshold = self.config.current().error_rate_threshold;
        error_rate_draft(metrics, threshold).map(|draft| self.trigger_alert(draft))
    }

    pub fn check_connection_failure_alert(&self, failures: u32) -> Option<Alert> {
        let threshold = self.config.current().connection_failure_threshold;
        connection_failure_draft(failures, threshold).map(|draft| self.trigger_alert(draft))
    }

    /// Alert history filtered by either or both dimensions, oldest first
    pub fn get_alerts(
        &self,
        severity: Option<AlertSeverity>,
        alert_type: Option<AlertType>,
    ) -> Vec<Alert> {
        self.history
            .read()
            .map(|history| {
                history
                    .iter()
                    .filter(|a| severity.map(|s| a.severity == s).unwrap_or(true))
                    .filter(|a| alert_type.map(|t| a.alert_type == t).unwrap_or(true))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The most recent `limit` alerts of a category, oldest first
    pub fn get_alerts_by_category(
        &self,
        category: AlertCategory,
        limit: Option<usize>,
    ) -> Vec<Alert> {
        let matching: Vec<Alert> = self
            .history
            .read()
            .map(|history| {
                history
                    .iter()
                    .filter(|a| a.category == category)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let skip = limit
            .map(|l| matching.len().saturating_sub(l))
            .unwrap_or(0);
        matching.into_iter().skip(skip).collect()
    }

    pub fn alert_count(&self) -> usize {
        self.history.read().map(|h| h.len()).unwrap_or(0)
    }

    pub fn clear(&self) {
        if let Ok(mut history) = self.history.write() {
            history.clear();
        }
    }
}
