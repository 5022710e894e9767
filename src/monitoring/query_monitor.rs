use super::{
    AlertingSystem, MetricsCollector, PerformanceAnalytics, PerformanceMetrics, QueryExecution,
    QueryExecutionTracker, QueryHandle, QueryPattern, QueryPatternDetector, QueryRequest,
    QueryStatus,
};
use crate::config::SharedConfig;
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;

/// Query tracking, pattern detection, analytics, and per-query alerting
#[derive(Debug)]
pub struct QueryPerformanceMonitor {
    config: SharedConfig,
    tracker: QueryExecutionTracker,
    detector: QueryPatternDetector,
    analytics: PerformanceAnalytics,
    alerting: Arc<AlertingSystem>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl QueryPerformanceMonitor {
    pub fn new(config: SharedConfig, alerting: Arc<AlertingSystem>) -> Result<Self> {
        Ok(Self {
            tracker: QueryExecutionTracker::new(config.clone())?,
            detector: QueryPatternDetector::new(config.clone()),
            analytics: PerformanceAnalytics::new(config.clone()),
            config,
            alerting,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn tracker(&self) -> &QueryExecutionTracker {
        &self.tracker
    }

    pub fn detector(&self) -> &QueryPatternDetector {
        &self.detector
    }

    pub fn analytics(&self) -> &PerformanceAnalytics {
        &self.analytics
    }

    pub fn alerting(&self) -> &Arc<AlertingSystem> {
        &self.alerting
    }

    pub fn start_query(&self, request: QueryRequest) -> Option<QueryHandle> {
        self.tracker.start_query(request)
    }

    /// Finish a query and run pattern analysis, slow-query alerting, and
    /// metrics recording on it
    pub fn finish_query(
        &self,
        handle: &QueryHandle,
        status: QueryStatus,
        error_message: Option<String>,
        row_count: Option<u64>,
    ) -> Option<QueryExecution> {
        let execution = self
            .tracker
            .finish_query(handle, status, error_message, row_count)?;

        for pattern in self.detector.analyze(&execution) {
            self.alerting.check_pattern_alert(&pattern);
        }
        self.alerting.check_slow_query_alert(&execution);

        if let Some(metrics) = &self.metrics {
            metrics.record_query(&execution);
        }
        Some(execution)
    }

    /// Metrics over the whole history, or only queries finished inside `window`
    pub fn get_performance_metrics(&self, window: Option<Duration>) -> PerformanceMetrics {
        let executions = match window {
            Some(window) => self.tracker.executions_since(window),
            None => self.tracker.get_query_history(None),
        };
        self.analytics.calculate_metrics(&executions)
    }

    /// The most recent `limit` queries at or above the slow threshold
    pub fn get_slow_queries(&self, limit: Option<usize>) -> Vec<QueryExecution> {
        let slow = self.tracker.get_slow_queries(None);
        let skip = limit.map(|l| slow.len().saturating_sub(l)).unwrap_or(0);
        slow.into_iter().skip(skip).collect()
    }

    pub fn get_query_patterns(&self) -> Vec<QueryPattern> {
        self.detector.get_patterns()
    }

    /// Compute metrics over the security window, compare them against the
    /// trend baseline, then add them to the trend. Returns the metrics and
    /// whether they indicate degradation.
    pub fn sample_trend(&self) -> (PerformanceMetrics, bool) {
        let window = self.config.current().security_window;
        let metrics = self.get_performance_metrics(Some(window));
        if metrics.total_queries == 0 {
            return (metrics, false);
        }

        let degraded = self.analytics.detect_performance_degradation(&metrics);
        self.analytics.update_trending_data(&metrics);
        self.detector.prune();
        (metrics, degraded)
    }

    pub fn reset(&self) {
        self.tracker.clear();
        self.detector.clear();
        self.analytics.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitoringConfig;
    use crate::monitoring::{AlertSeverity, AlertType, QueryType};

    fn monitor(config: MonitoringConfig) -> QueryPerformanceMonitor {
        let shared = SharedConfig::new(config);
        let alerting = Arc::new(AlertingSystem::new(shared.clone()));
        QueryPerformanceMonitor::new(shared, alerting).unwrap()
    }

    #[test]
    fn test_n_plus_one_raises_alert_every_time() {
        let monitor = monitor(
            MonitoringConfig::builder()
                .n_plus_one(3, Duration::from_secs(10))
                .build()
                .unwrap(),
        );

        for id in 0..4 {
            let handle = monitor
                .start_query(
                    QueryRequest::new(QueryType::Select)
                        .table("comments")
                        .text(format!("SELECT * FROM comments WHERE post_id = {id}")),
                )
                .unwrap();
            monitor.finish_query(&handle, QueryStatus::Success, None, Some(2));
        }

        let patterns = monitor.get_query_patterns();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].occurrence_count, 4);
        assert_eq!(
            monitor
                .alerting()
                .get_alerts(None, Some(AlertType::NPlusOne))
                .len(),
            2
        );
    }

    #[test]
    fn test_slow_query_alert() {
        let monitor = monitor(
            MonitoringConfig::builder()
                .slow_query_threshold(Duration::from_millis(10))
                .build()
                .unwrap(),
        );

        let handle = monitor
            .start_query(QueryRequest::new(QueryType::Update).table("trips"))
            .unwrap();
        std::thread::sleep(Duration::from_millis(15));
        let execution = monitor
            .finish_query(&handle, QueryStatus::Success, None, Some(1))
            .unwrap();

        assert!(execution.is_slow(Duration::from_millis(10)));
        let alerts = monitor
            .alerting()
            .get_alerts(None, Some(AlertType::SlowQuery));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::Warning);
        assert_eq!(monitor.get_slow_queries(Some(5)).len(), 1);
    }

    #[test]
    fn test_sample_trend_skips_empty_windows() {
        let monitor = monitor(MonitoringConfig::default());
        let (metrics, degraded) = monitor.sample_trend();
        assert_eq!(metrics.total_queries, 0);
        assert!(!degraded);
        assert!(monitor.analytics().trend().is_empty());

        let handle = monitor
            .start_query(QueryRequest::new(QueryType::Count).table("trips"))
            .unwrap();
        monitor.finish_query(&handle, QueryStatus::Success, None, None);
        monitor.sample_trend();
        assert_eq!(monitor.analytics().trend().len(), 1);

        monitor.reset();
        assert!(monitor.analytics().trend().is_empty());
        assert_eq!(monitor.tracker().history_len(), 0);
    }
}
