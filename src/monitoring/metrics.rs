use super::{Alert, HealthSnapshot, QueryExecution};
use crate::error::Result;
use prometheus::{
    exponential_buckets, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts,
    Registry,
};
use std::fmt;
use tracing::error;

/// Prometheus metrics for one monitored data service
pub struct MetricsCollector {
    registry: Registry,
    service: String,

    // Connection metrics
    pub connection_attempts_total: IntCounterVec,
    pub active_connections: IntGaugeVec,

    // Query metrics
    pub query_duration_seconds: HistogramVec,
    pub queries_total: IntCounterVec,
    pub query_errors_total: IntCounterVec,

    // Health metrics
    pub health_status: GaugeVec,
    pub health_check_duration_seconds: HistogramVec,

    // Alerting and recovery
    pub alerts_total: IntCounterVec,
    pub recovery_attempts_total: IntCounterVec,
}

impl fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}

impl MetricsCollector {
    pub fn new(service: impl Into<String>) -> Result<Self> {
        let registry = Registry::new();

        let connection_attempts_total = IntCounterVec::new(
            Opts::new(
                "db_connection_attempts_total",
                "Total number of database connection attempts",
            ),
            &["service", "outcome"],
        )?;
        registry.register(Box::new(connection_attempts_total.clone()))?;

        let active_connections = IntGaugeVec::new(
            Opts::new(
                "db_active_connections",
                "Number of database connections currently in use",
            ),
            &["service"],
        )?;
        registry.register(Box::new(active_connections.clone()))?;

        let query_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "db_query_duration_seconds",
                "Duration of database queries in seconds",
            )
            .buckets(exponential_buckets(0.001, 2.0, 15)?),
            &["service", "operation", "table"],
        )?;
        registry.register(Box::new(query_duration_seconds.clone()))?;

        let queries_total = IntCounterVec::new(
            Opts::new("db_queries_total", "Total number of database queries"),
            &["service", "operation", "table", "status"],
        )?;
        registry.register(Box::new(queries_total.clone()))?;

        let query_errors_total = IntCounterVec::new(
            Opts::new(
                "db_query_errors_total",
                "Total number of failed database queries",
            ),
            &["service", "operation", "table"],
        )?;
        registry.register(Box::new(query_errors_total.clone()))?;

        let health_status = GaugeVec::new(
            Opts::new(
                "db_health_status",
                "Database health (0 healthy, 1 warning, 2 critical, 3 unhealthy)",
            ),
            &["service"],
        )?;
        registry.register(Box::new(health_status.clone()))?;

        let health_check_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "db_health_check_duration_seconds",
                "Duration of database health checks in seconds",
            )
            .buckets(exponential_buckets(0.001, 2.0, 15)?),
            &["service"],
        )?;
        registry.register(Box::new(health_check_duration_seconds.clone()))?;

        let alerts_total = IntCounterVec::new(
            Opts::new("db_alerts_total", "Total number of alerts raised"),
            &["alert_type", "severity"],
        )?;
        registry.register(Box::new(alerts_total.clone()))?;

        let recovery_attempts_total = IntCounterVec::new(
            Opts::new(
                "db_recovery_attempts_total",
                "Total number of connection recovery attempts",
            ),
            &["service", "outcome"],
        )?;
        registry.register(Box::new(recovery_attempts_total.clone()))?;

        Ok(Self {
            registry,
            service: service.into(),
            connection_attempts_total,
            active_connections,
            query_duration_seconds,
            queries_total,
            query_errors_total,
            health_status,
            health_check_duration_seconds,
            alerts_total,
            recovery_attempts_total,
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_connection_attempt(&self, success: bool) {
        self.connection_attempts_total
            .with_label_values(&[self.service.as_str(), outcome(success)])
            .inc();
    }

    pub fn set_active_connections(&self, count: u32) {
        self.active_connections
            .with_label_values(&[self.service.as_str()])
            .set(i64::from(count));
    }

    pub fn record_query(&self, execution: &QueryExecution) {
        let operation = execution.query_type.as_str();
        let table = execution.table_label();
        let status = execution.status.map(|s| s.as_str()).unwrap_or("unknown");

        if let Some(duration) = execution.duration {
            self.query_duration_seconds
                .with_label_values(&[self.service.as_str(), operation, table])
                .observe(duration.as_secs_f64());
        }
        self.queries_total
            .with_label_values(&[self.service.as_str(), operation, table, status])
            .inc();
        if execution.is_failure() {
            self.query_errors_total
                .with_label_values(&[self.service.as_str(), operation, table])
                .inc();
        }
    }

    pub fn record_health(&self, snapshot: &HealthSnapshot) {
        self.health_status
            .with_label_values(&[self.service.as_str()])
            .set(snapshot.status.gauge_value());
        self.health_check_duration_seconds
            .with_label_values(&[self.service.as_str()])
            .observe(snapshot.latency.as_secs_f64());
    }

    pub fn record_alert(&self, alert: &Alert) {
        self.alerts_total
            .with_label_values(&[alert.alert_type.as_str(), alert.severity.as_str()])
            .inc();
    }

    pub fn record_recovery_attempt(&self, success: bool) {
        self.recovery_attempts_total
            .with_label_values(&[self.service.as_str(), outcome(success)])
            .inc();
    }

    /// Render all metrics in Prometheus text format
    pub fn gather_metrics(&self) -> String {
        use prometheus::TextEncoder;
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .unwrap_or_else(|e| {
                error!("Failed to encode metrics: {}", e);
                String::new()
            })
    }
}

fn outcome(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "failure"
    }
}
