use super::rules::{RuleEngine, SweepSnapshot};
use super::{
    Alert, AlertCallback, AlertCategory, AlertingSystem, CallbackId, DataService, HealthProbe,
    HealthSnapshot, HealthStatus, MetricsCollector, MonitoredDataService, PerformanceMetrics,
    QueryExecution, QueryPattern, QueryPerformanceMonitor, RecoveryOrchestrator, RecoveryState,
};
use crate::config::{MonitoringConfig, MonitoringUpdate, SharedConfig};
use crate::error::Result;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Window used for the per-user rate check
const RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize)]
pub struct MonitoringStatistics {
    pub health_checks: u64,
    pub security_checks: u64,
    pub health_history_len: usize,
    pub tracked_queries: usize,
    pub active_queries: usize,
    pub query_patterns: usize,
    pub total_alerts: usize,
    pub security_alerts: usize,
    pub performance_alerts: usize,
    pub alert_callbacks: usize,
    pub connection_failures: u32,
    pub recovery_state: RecoveryState,
    pub recovery_runs: u64,
    pub recovery_attempts: u64,
    pub tick_failures: u64,
    pub last_security_check: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitoringStatus {
    pub monitoring_active: bool,
    pub config: MonitoringConfig,
    pub last_health_check: Option<HealthSnapshot>,
    pub statistics: MonitoringStatistics,
}

#[derive(Debug, Default)]
struct MonitorCounters {
    health_checks: AtomicU64,
    security_checks: AtomicU64,
    recovery_runs: AtomicU64,
    tick_failures: AtomicU64,
}

struct MonitorInner {
    service: Arc<dyn DataService>,
    config: SharedConfig,
    probe: HealthProbe,
    queries: Arc<QueryPerformanceMonitor>,
    alerting: Arc<AlertingSystem>,
    recovery: Arc<RecoveryOrchestrator>,
    metrics: Arc<MetricsCollector>,
    rules: RuleEngine,
    health_history: RwLock<VecDeque<HealthSnapshot>>,
    connection_failures: AtomicU32,
    last_sweep_sequence: AtomicU64,
    last_security_check: RwLock<Option<DateTime<Utc>>>,
    counters: MonitorCounters,
    active: AtomicBool,
    config_changed: Notify,
    recovery_task: Mutex<Option<JoinHandle<()>>>,
}

struct BackgroundTask {
    handle: JoinHandle<()>,
    shutdown: oneshot::Sender<()>,
}

/// Health, security, and query monitoring for one data service.
///
/// Clones share the same state and background task.
#[derive(Clone)]
pub struct ConsolidatedMonitor {
    inner: Arc<MonitorInner>,
    task: Arc<Mutex<Option<BackgroundTask>>>,
}

impl fmt::Debug for ConsolidatedMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsolidatedMonitor")
            .field("service", &self.inner.service.service_name())
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl ConsolidatedMonitor {
    pub fn new(service: Arc<dyn DataService>, config: MonitoringConfig) -> Result<Self> {
        config.validate()?;
        let config = SharedConfig::new(config);

        let metrics = Arc::new(MetricsCollector::new(service.service_name())?);
        let alerting = Arc::new(AlertingSystem::new(config.clone()).with_metrics(metrics.clone()));
        let queries = Arc::new(
            QueryPerformanceMonitor::new(config.clone(), alerting.clone())?
                .with_metrics(metrics.clone()),
        );
        // Reconnects go through the wrapper so they show up in the connection metrics
        let instrumented: Arc<dyn DataService> = Arc::new(MonitoredDataService::new(
            service.clone(),
            queries.clone(),
            metrics.clone(),
        ));
        let recovery = Arc::new(
            RecoveryOrchestrator::new(instrumented, config.clone(), alerting.clone())
                .with_metrics(metrics.clone()),
        );
        let probe = HealthProbe::new(service.clone(), config.clone());

        info!(
            "Database monitor created for service '{}'",
            service.service_name()
        );

        Ok(Self {
            inner: Arc::new(MonitorInner {
                service,
                config,
                probe,
                queries,
                alerting,
                recovery,
                metrics,
                rules: RuleEngine::new()?,
                health_history: RwLock::new(VecDeque::new()),
                connection_failures: AtomicU32::new(0),
                last_sweep_sequence: AtomicU64::new(0),
                last_security_check: RwLock::new(None),
                counters: MonitorCounters::default(),
                active: AtomicBool::new(false),
                config_changed: Notify::new(),
                recovery_task: Mutex::new(None),
            }),
            task: Arc::new(Mutex::new(None)),
        })
    }

    pub fn config(&self) -> Arc<MonitoringConfig> {
        self.inner.config.current()
    }

    pub fn shared_config(&self) -> &SharedConfig {
        &self.inner.config
    }

    pub fn service(&self) -> &Arc<dyn DataService> {
        &self.inner.service
    }

    pub fn queries(&self) -> &Arc<QueryPerformanceMonitor> {
        &self.inner.queries
    }

    pub fn alerting(&self) -> &Arc<AlertingSystem> {
        &self.inner.alerting
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.inner.metrics
    }

    pub fn recovery(&self) -> &Arc<RecoveryOrchestrator> {
        &self.inner.recovery
    }

    /// Wrap the monitored service so its operations are tracked
    pub fn monitored_service(&self) -> MonitoredDataService<dyn DataService> {
        self.instrument(self.inner.service.clone())
    }

    /// Wrap any data service with this monitor's query tracking and metrics
    pub fn instrument<S: DataService + ?Sized>(&self, service: Arc<S>) -> MonitoredDataService<S> {
        MonitoredDataService::new(
            service,
            self.inner.queries.clone(),
            self.inner.metrics.clone(),
        )
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    fn task_slot(&self) -> std::sync::MutexGuard<'_, Option<BackgroundTask>> {
        match self.task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Spawn the background loop. Returns `false` if it was already running.
    pub fn start_monitoring(&self) -> bool {
        let mut slot = self.task_slot();
        if let Some(task) = slot.as_ref() {
            if !task.handle.is_finished() {
                debug!("Monitoring already running");
                return false;
            }
        }

        let config = self.inner.config.current();
        info!(
            "Starting database monitoring (health every {:?}, security every {:?})",
            config.health_check_interval, config.security_check_interval
        );

        let (shutdown, shutdown_rx) = oneshot::channel();
        self.inner.active.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(run_loop(self.inner.clone(), shutdown_rx));
        *slot = Some(BackgroundTask { handle, shutdown });
        true
    }

    /// Signal the background loop and wait for it to exit, then cancel any
    /// recovery it started. Safe to call repeatedly.
    pub async fn stop_monitoring(&self) {
        let task = self.task_slot().take();
        self.inner.active.store(false, Ordering::SeqCst);

        match task {
            Some(task) => {
                let _ = task.shutdown.send(());
                if let Err(e) = task.handle.await {
                    error!("Monitoring task ended abnormally: {}", e);
                }
                info!("Database monitoring stopped");
            }
            None => debug!("Monitoring not running"),
        }

        self.inner.cancel_recovery().await;
    }

    /// Run a health probe now, outside the schedule
    pub async fn manual_health_check(&self) -> HealthSnapshot {
        self.inner.health_tick().await
    }

    /// Run a security sweep now, outside the schedule. Returns raised alerts.
    pub async fn manual_security_check(&self) -> Vec<Alert> {
        self.inner.security_tick()
    }

    pub fn get_current_health(&self) -> Option<HealthSnapshot> {
        self.inner
            .health_history
            .read()
            .ok()
            .and_then(|history| history.back().cloned())
    }

    /// The most recent `limit` snapshots, oldest first
    pub fn get_health_history(&self, limit: Option<usize>) -> Vec<HealthSnapshot> {
        self.inner
            .health_history
            .read()
            .map(|history| {
                let skip = limit
                    .map(|l| history.len().saturating_sub(l))
                    .unwrap_or(0);
                history.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    pub fn get_monitoring_status(&self) -> MonitoringStatus {
        let inner = &self.inner;
        let tracker = inner.queries.tracker();
        let counters = &inner.counters;

        MonitoringStatus {
            monitoring_active: self.is_active(),
            config: (*inner.config.current()).clone(),
            last_health_check: self.get_current_health(),
            statistics: MonitoringStatistics {
                health_checks: counters.health_checks.load(Ordering::SeqCst),
                security_checks: counters.security_checks.load(Ordering::SeqCst),
                health_history_len: inner.health_history.read().map(|h| h.len()).unwrap_or(0),
                tracked_queries: tracker.history_len(),
                active_queries: tracker.active_count(),
                query_patterns: inner.queries.get_query_patterns().len(),
                total_alerts: inner.alerting.alert_count(),
                security_alerts: inner
                    .alerting
                    .get_alerts_by_category(AlertCategory::Security, None)
                    .len(),
                performance_alerts: inner
                    .alerting
                    .get_alerts_by_category(AlertCategory::Performance, None)
                    .len(),
                alert_callbacks: inner.alerting.callback_count(),
                connection_failures: inner.connection_failures.load(Ordering::SeqCst),
                recovery_state: inner.recovery.state(),
                recovery_runs: counters.recovery_runs.load(Ordering::SeqCst),
                recovery_attempts: inner.recovery.total_attempts(),
                tick_failures: counters.tick_failures.load(Ordering::SeqCst),
                last_security_check: inner.last_security_check.read().ok().and_then(|t| *t),
            },
        }
    }

    /// Apply new intervals or thresholds without restarting. The background
    /// loop reschedules on the next wake-up.
    pub fn configure_monitoring(&self, update: MonitoringUpdate) -> Result<Arc<MonitoringConfig>> {
        let reschedule = update.reschedules(&self.inner.config.current());
        let config = self.inner.config.update(&update)?;
        if reschedule {
            self.inner.config_changed.notify_one();
        }
        info!(reschedule, "Monitoring configuration updated");
        Ok(config)
    }

    pub fn add_alert_callback(&self, callback: Arc<dyn AlertCallback>) -> CallbackId {
        self.inner.alerting.add_alert_callback(callback)
    }

    pub fn remove_alert_callback(&self, id: CallbackId) -> bool {
        self.inner.alerting.remove_alert_callback(id)
    }

    /// Count one more consecutive connection failure
    pub fn record_connection_failure(&self) -> u32 {
        self.inner.record_connection_failure()
    }

    pub fn reset_connection_failures(&self) {
        self.inner.connection_failures.store(0, Ordering::SeqCst);
    }

    pub fn connection_failures(&self) -> u32 {
        self.inner.connection_failures.load(Ordering::SeqCst)
    }

    pub fn get_security_alerts(&self, limit: Option<usize>) -> Vec<Alert> {
        self.inner
            .alerting
            .get_alerts_by_category(AlertCategory::Security, limit)
    }

    pub fn get_performance_alerts(&self, limit: Option<usize>) -> Vec<Alert> {
        self.inner
            .alerting
            .get_alerts_by_category(AlertCategory::Performance, limit)
    }

    pub fn get_performance_metrics(&self) -> PerformanceMetrics {
        self.inner.queries.get_performance_metrics(None)
    }

    pub fn get_slow_queries(&self, limit: Option<usize>) -> Vec<QueryExecution> {
        self.inner.queries.get_slow_queries(limit)
    }

    pub fn get_query_patterns(&self) -> Vec<QueryPattern> {
        self.inner.queries.get_query_patterns()
    }

    pub fn gather_metrics(&self) -> String {
        self.inner.metrics.gather_metrics()
    }

    /// Clear histories, patterns, trends, alerts, and counters
    pub fn reset(&self) {
        let inner = &self.inner;
        if let Ok(mut history) = inner.health_history.write() {
            history.clear();
        }
        inner.queries.reset();
        inner.alerting.clear();
        inner.connection_failures.store(0, Ordering::SeqCst);
        inner
            .last_sweep_sequence
            .store(inner.queries.tracker().last_sequence(), Ordering::SeqCst);
        if let Ok(mut last) = inner.last_security_check.write() {
            *last = None;
        }
        inner.counters.health_checks.store(0, Ordering::SeqCst);
        inner.counters.security_checks.store(0, Ordering::SeqCst);
        inner.counters.recovery_runs.store(0, Ordering::SeqCst);
        inner.counters.tick_failures.store(0, Ordering::SeqCst);
        info!("Monitoring state reset");
    }
}

impl MonitorInner {
    async fn health_tick(self: &Arc<Self>) -> HealthSnapshot {
        let snapshot = self.probe.check().await;
        let config = self.config.current();

        if let Ok(mut history) = self.health_history.write() {
            history.push_back(snapshot.clone());
            while history.len() > config.max_health_history {
                history.pop_front();
            }
        }
        self.metrics.record_health(&snapshot);
        if let Some(active) = self.service.active_connections() {
            self.metrics.set_active_connections(active);
        }
        self.counters.health_checks.fetch_add(1, Ordering::SeqCst);

        match snapshot.status {
            HealthStatus::Healthy => {
                self.connection_failures.store(0, Ordering::SeqCst);
            }
            HealthStatus::Warning => {}
            HealthStatus::Critical | HealthStatus::Unhealthy => {
                self.record_connection_failure();
                if config.enable_recovery {
                    self.spawn_recovery();
                }
            }
        }

        snapshot
    }

    fn record_connection_failure(&self) -> u32 {
        let failures = self.connection_failures.fetch_add(1, Ordering::SeqCst) + 1;
        warn!("Database connection failure recorded ({} consecutive)", failures);
        failures
    }

    fn recovery_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        match self.recovery_task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn spawn_recovery(self: &Arc<Self>) {
        let mut slot = self.recovery_slot();
        let running = slot.as_ref().is_some_and(|handle| !handle.is_finished());
        if running || self.recovery.is_in_flight() {
            debug!("Recovery already running, not spawning another");
            return;
        }

        let inner = self.clone();
        *slot = Some(tokio::spawn(async move {
            if let Some(outcome) = inner.recovery.recover().await {
                inner.counters.recovery_runs.fetch_add(1, Ordering::SeqCst);
                if outcome.recovered() {
                    inner.connection_failures.store(0, Ordering::SeqCst);
                }
            }
        }));
    }

    async fn cancel_recovery(&self) {
        let handle = self.recovery_slot().take();
        let Some(handle) = handle else {
            return;
        };
        if handle.is_finished() {
            return;
        }

        handle.abort();
        match handle.await {
            Err(e) if !e.is_cancelled() => error!("Recovery task ended abnormally: {}", e),
            _ => info!("Cancelled in-flight connection recovery"),
        }
    }

    fn security_tick(&self) -> Vec<Alert> {
        let config = self.config.current();
        let tracker = self.queries.tracker();

        let (metrics, degraded) = self.queries.sample_trend();

        let upto = tracker.last_sequence();
        let previous = self.last_sweep_sequence.swap(upto, Ordering::SeqCst);
        let new_queries = tracker
            .executions_after(previous)
            .into_iter()
            .filter(|e| e.sequence <= upto)
            .collect();

        let snapshot = SweepSnapshot {
            window: config.security_window,
            slow_queries: metrics.slow_queries,
            metrics,
            connection_failures: self.connection_failures.load(Ordering::SeqCst),
            new_queries,
            recent_minute: tracker.executions_since(RATE_WINDOW),
            degraded,
        };

        let alerts: Vec<Alert> = self
            .rules
            .evaluate(&snapshot, &config)
            .into_iter()
            .map(|(_, draft)| self.alerting.trigger_alert(draft))
            .collect();

        self.counters.security_checks.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_security_check.write() {
            *last = Some(Utc::now());
        }
        debug!("Security check raised {} alerts", alerts.len());
        alerts
    }
}

async fn run_loop(inner: Arc<MonitorInner>, mut shutdown: oneshot::Receiver<()>) {
    // Deadlines of the last ticks that ran. A reschedule counts the new period
    // from these, so elapsed time toward the next tick is kept.
    let mut last_health: Option<Instant> = None;
    let mut last_security = Instant::now();

    loop {
        let config = inner.config.current();
        let health_period = config.health_check_interval;
        let security_period = config.security_check_interval;

        // The first health check runs immediately
        let health_start = last_health.map_or_else(Instant::now, |last| last + health_period);
        let mut health = interval_at(health_start, health_period);
        let mut security = interval_at(last_security + security_period, security_period);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        security.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!("Monitoring loop received shutdown");
                    return;
                }
                _ = inner.config_changed.notified() => {
                    debug!("Rescheduling monitoring loop after interval change");
                    break;
                }
                deadline = health.tick() => {
                    last_health = Some(deadline);
                    let tick = AssertUnwindSafe(inner.health_tick()).catch_unwind();
                    if tick.await.is_err() {
                        inner.counters.tick_failures.fetch_add(1, Ordering::SeqCst);
                        error!("Health check tick panicked; monitoring continues");
                    }
                }
                deadline = security.tick() => {
                    last_security = deadline;
                    let tick = AssertUnwindSafe(async { inner.security_tick() }).catch_unwind();
                    if tick.await.is_err() {
                        inner.counters.tick_failures.fetch_add(1, Ordering::SeqCst);
                        error!("Security check tick panicked; monitoring continues");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::{AlertType, MockDataService, QueryRequest, QueryStatus, QueryType};

    fn monitor_with(service: Arc<MockDataService>, config: MonitoringConfig) -> ConsolidatedMonitor {
        ConsolidatedMonitor::new(service, config).unwrap()
    }

    fn fast_config() -> MonitoringConfig {
        MonitoringConfig::builder()
            .health_check_interval(Duration::from_millis(20))
            .security_check_interval(Duration::from_millis(50))
            .recovery(false, 3, Duration::from_millis(10))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let monitor = monitor_with(Arc::new(MockDataService::new()), fast_config());
        assert!(monitor.start_monitoring());
        assert!(!monitor.start_monitoring());
        assert!(monitor.is_active());

        monitor.stop_monitoring().await;
        assert!(!monitor.is_active());
        assert!(monitor.start_monitoring());
        monitor.stop_monitoring().await;
    }

    #[tokio::test]
    async fn test_failures_counted_and_reset() {
        let service = Arc::new(MockDataService::new());
        let monitor = monitor_with(service.clone(), fast_config());

        service.set_healthy(false);
        monitor.manual_health_check().await;
        monitor.manual_health_check().await;
        assert_eq!(monitor.connection_failures(), 2);

        service.set_healthy(true);
        let snapshot = monitor.manual_health_check().await;
        assert_eq!(snapshot.status, HealthStatus::Healthy);
        assert_eq!(monitor.connection_failures(), 0);
    }

    #[tokio::test]
    async fn test_health_history_bounded() {
        let config = MonitoringConfig::builder()
            .max_health_history(3)
            .recovery(false, 1, Duration::from_millis(10))
            .build()
            .unwrap();
        let monitor = monitor_with(Arc::new(MockDataService::new()), config);
        for _ in 0..5 {
            monitor.manual_health_check().await;
        }
        assert_eq!(monitor.get_health_history(None).len(), 3);
        assert_eq!(monitor.get_health_history(Some(2)).len(), 2);
        assert_eq!(monitor.get_monitoring_status().statistics.health_checks, 5);
    }

    #[tokio::test]
    async fn test_connection_failure_rule() {
        let monitor = monitor_with(Arc::new(MockDataService::new()), fast_config());
        for _ in 0..3 {
            monitor.record_connection_failure();
        }
        let alerts = monitor.manual_security_check().await;
        assert!(alerts
            .iter()
            .any(|a| a.alert_type == AlertType::ConnectionFailure));

        monitor.reset_connection_failures();
        assert!(monitor.manual_security_check().await.is_empty());
    }

    #[tokio::test]
    async fn test_suspicious_queries_reported_once() {
        let monitor = monitor_with(Arc::new(MockDataService::new()), fast_config());
        let queries = monitor.queries();
        let handle = queries
            .start_query(
                QueryRequest::new(QueryType::RawSql)
                    .text("SELECT * FROM users WHERE name = '' OR 1=1")
                    .user("mallory"),
            )
            .unwrap();
        queries.finish_query(&handle, QueryStatus::Success, None, None);

        let first = monitor.manual_security_check().await;
        assert!(first
            .iter()
            .any(|a| a.alert_type == AlertType::SuspiciousQuery));
        let second = monitor.manual_security_check().await;
        assert!(!second
            .iter()
            .any(|a| a.alert_type == AlertType::SuspiciousQuery));
    }

    #[tokio::test]
    async fn test_recovery_spawned_on_critical() {
        let service = Arc::new(MockDataService::new());
        let config = MonitoringConfig::builder()
            .recovery(true, 2, Duration::from_millis(5))
            .build()
            .unwrap();
        let monitor = monitor_with(service.clone(), config);

        service.set_connected(false);
        let snapshot = monitor.manual_health_check().await;
        assert_eq!(snapshot.status, HealthStatus::Critical);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(service.is_connected());
        assert_eq!(monitor.recovery().state(), RecoveryState::Recovered);
        assert_eq!(monitor.connection_failures(), 0);
        assert_eq!(
            monitor
                .get_security_alerts(None)
                .last()
                .map(|a| a.alert_type),
            Some(AlertType::ConnectionRecovered)
        );
    }

    #[tokio::test]
    async fn test_configure_monitoring_hot_reload() {
        let service = Arc::new(MockDataService::new());
        let config = MonitoringConfig::builder()
            .health_check_interval(Duration::from_secs(3600))
            .recovery(false, 1, Duration::from_millis(10))
            .build()
            .unwrap();
        let monitor = monitor_with(service.clone(), config);
        monitor.start_monitoring();

        // First tick fires immediately, the next one is an hour away
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(service.health_check_count(), 1);

        monitor
            .configure_monitoring(MonitoringUpdate {
                health_check_interval: Some(Duration::from_millis(20)),
                ..Default::default()
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(service.health_check_count() >= 3);
        assert_eq!(
            monitor.config().health_check_interval,
            Duration::from_millis(20)
        );

        let bad = monitor.configure_monitoring(MonitoringUpdate {
            slow_query_threshold: Some(Duration::from_secs(60)),
            ..Default::default()
        });
        assert!(bad.is_err());
        monitor.stop_monitoring().await;
    }

    #[tokio::test]
    async fn test_reset() {
        let monitor = monitor_with(Arc::new(MockDataService::new()), fast_config());
        monitor.manual_health_check().await;
        monitor.record_connection_failure();

        monitor.reset();
        let status = monitor.get_monitoring_status();
        assert!(status.last_health_check.is_none());
        assert_eq!(status.statistics.health_checks, 0);
        assert_eq!(status.statistics.connection_failures, 0);
    }

    /// Panics on the first health check, then defers to a healthy mock
    #[derive(Debug, Default)]
    struct PanicsOnce {
        inner: MockDataService,
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl DataService for PanicsOnce {
        fn is_connected(&self) -> bool {
            self.inner.is_connected()
        }

        async fn health_check(&self) -> anyhow::Result<bool> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("health check blew up");
            }
            self.inner.health_check().await
        }

        async fn connect(&self) -> anyhow::Result<()> {
            self.inner.connect().await
        }

        async fn close(&self) -> anyhow::Result<()> {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn test_panicking_tick_does_not_stop_monitoring() {
        let service = Arc::new(PanicsOnce::default());
        let config = MonitoringConfig::builder()
            .health_check_interval(Duration::from_millis(20))
            .security_check_interval(Duration::from_secs(60))
            .recovery(false, 1, Duration::from_millis(10))
            .build()
            .unwrap();
        let monitor = ConsolidatedMonitor::new(service.clone(), config).unwrap();

        monitor.start_monitoring();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(monitor.is_active());
        monitor.stop_monitoring().await;

        let statistics = monitor.get_monitoring_status().statistics;
        assert_eq!(statistics.tick_failures, 1);
        assert!(statistics.health_checks >= 2);
        assert!(service.calls.load(Ordering::SeqCst) >= 3);
        assert_eq!(
            monitor.get_current_health().map(|h| h.status),
            Some(HealthStatus::Healthy)
        );
    }

    #[tokio::test]
    async fn test_threshold_updates_do_not_delay_ticks() {
        let service = Arc::new(MockDataService::new());
        let config = MonitoringConfig::builder()
            .health_check_interval(Duration::from_millis(50))
            .security_check_interval(Duration::from_millis(50))
            .recovery(false, 1, Duration::from_millis(10))
            .build()
            .unwrap();
        let monitor = monitor_with(service.clone(), config);
        monitor.start_monitoring();

        for i in 0..20 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            monitor
                .configure_monitoring(MonitoringUpdate {
                    error_rate_threshold: Some(if i % 2 == 0 { 0.2 } else { 0.3 }),
                    ..Default::default()
                })
                .unwrap();
        }
        monitor.stop_monitoring().await;

        let statistics = monitor.get_monitoring_status().statistics;
        assert!(statistics.health_checks >= 5, "{statistics:?}");
        assert!(statistics.security_checks >= 5, "{statistics:?}");
    }

    #[tokio::test]
    async fn test_reschedule_keeps_elapsed_phase() {
        let service = Arc::new(MockDataService::new());
        let config = MonitoringConfig::builder()
            .health_check_interval(Duration::from_millis(200))
            .recovery(false, 1, Duration::from_millis(10))
            .build()
            .unwrap();
        let monitor = monitor_with(service.clone(), config);
        monitor.start_monitoring();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(service.health_check_count(), 1);
        monitor
            .configure_monitoring(MonitoringUpdate {
                security_check_interval: Some(Duration::from_secs(30)),
                ..Default::default()
            })
            .unwrap();

        // Second check is still due 200ms after the first, not 200ms after the update
        tokio::time::sleep(Duration::from_millis(130)).await;
        assert!(service.health_check_count() >= 2);
        monitor.stop_monitoring().await;
    }

    #[tokio::test]
    async fn test_stop_cancels_recovery() {
        let service = Arc::new(MockDataService::new());
        service.set_connected(false);
        service.fail_next_connects(100);
        let config = MonitoringConfig::builder()
            .health_check_interval(Duration::from_secs(60))
            .recovery(true, 5, Duration::from_millis(100))
            .build()
            .unwrap();
        let monitor = monitor_with(service.clone(), config);

        monitor.start_monitoring();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(monitor.recovery().is_in_flight());
        monitor.stop_monitoring().await;

        let connects = service.connect_calls();
        let alerts = monitor.alerting().alert_count();
        assert!(!monitor.recovery().is_in_flight());
        assert_eq!(monitor.recovery().state(), RecoveryState::Idle);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(service.connect_calls(), connects);
        assert_eq!(monitor.alerting().alert_count(), alerts);
    }

    #[tokio::test]
    async fn test_recovery_reconnects_are_metered() {
        let service = Arc::new(MockDataService::new());
        service.set_connected(false);
        service.fail_next_connects(1);
        let config = MonitoringConfig::builder()
            .recovery(true, 3, Duration::from_millis(5))
            .build()
            .unwrap();
        let monitor = monitor_with(service.clone(), config);

        monitor.manual_health_check().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(monitor.recovery().state(), RecoveryState::Recovered);

        let attempts = &monitor.metrics().connection_attempts_total;
        let service_name = service.service_name();
        assert_eq!(
            attempts
                .with_label_values(&[service_name, "failure"])
                .get(),
            1
        );
        assert_eq!(
            attempts
                .with_label_values(&[service_name, "success"])
                .get(),
            1
        );
    }
}
