use crate::error::{MonitorError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Master switch for query tracking
    pub enabled: bool,

    /// Period between background health probes
    pub health_check_interval: Duration,

    /// Period between background security sweeps
    pub security_check_interval: Duration,

    /// Probe latency above which the database is reported as WARNING
    pub health_warning_latency: Duration,

    /// Probe latency above which the database is reported as CRITICAL
    pub health_critical_latency: Duration,

    /// Query duration tiers: slow < very slow < critical
    pub slow_query_threshold: Duration,
    pub very_slow_query_threshold: Duration,
    pub critical_query_threshold: Duration,

    /// Identical queries within the window needed to flag an N+1 burst
    pub n_plus_one_threshold: usize,
    pub n_plus_one_time_window: Duration,

    /// Fraction of failed queries (0.0 - 1.0) that raises HIGH_ERROR_RATE
    pub error_rate_threshold: f64,

    /// Capacities of the bounded histories
    pub max_query_history: usize,
    pub max_security_history: usize,
    pub max_health_history: usize,

    /// Reconnection settings
    pub enable_recovery: bool,
    pub max_recovery_attempts: u32,
    pub recovery_delay: Duration,

    /// Multiplier applied to the delay after each failed reconnect (1.0 keeps it constant)
    pub recovery_backoff: f64,
    pub max_recovery_delay: Duration,

    /// Look-back window used by the security sweep
    pub security_window: Duration,

    /// Slow queries inside the security window that raise a burst alert
    pub slow_query_burst_threshold: usize,

    /// Consecutive connection failures that raise CONNECTION_FAILURE
    pub connection_failure_threshold: u32,

    /// Per-user query budget for the last minute
    pub max_queries_per_minute: usize,

    /// Relative increase of average duration over baseline treated as degradation
    pub degradation_ratio: f64,
    pub baseline_window: Duration,
    pub min_baseline_points: usize,
    pub max_trend_points: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            health_check_interval: Duration::from_secs(30),
            security_check_interval: Duration::from_secs(60),
            health_warning_latency: Duration::from_secs(1),
            health_critical_latency: Duration::from_secs(5),
            slow_query_threshold: Duration::from_secs(1),
            very_slow_query_threshold: Duration::from_secs(5),
            critical_query_threshold: Duration::from_secs(10),
            n_plus_one_threshold: 10,
            n_plus_one_time_window: Duration::from_secs(60),
            error_rate_threshold: 0.1,
            max_query_history: 1000,
            max_security_history: 1000,
            max_health_history: 100,
            enable_recovery: true,
            max_recovery_attempts: 3,
            recovery_delay: Duration::from_secs(5),
            recovery_backoff: 1.0,
            max_recovery_delay: Duration::from_secs(60),
            security_window: Duration::from_secs(300),
            slow_query_burst_threshold: 10,
            connection_failure_threshold: 3,
            max_queries_per_minute: 1000,
            degradation_ratio: 0.5,
            baseline_window: Duration::from_secs(2 * 60 * 60),
            min_baseline_points: 5,
            max_trend_points: 1000,
        }
    }
}

impl MonitoringConfig {
    pub fn builder() -> MonitoringConfigBuilder {
        MonitoringConfigBuilder::default()
    }

    /// Load configuration from `DB_MONITOR_*` environment variables.
    ///
    /// Durations are given in (fractional) seconds. A `.env` file is honoured
    /// if present. The resulting configuration is validated.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = MonitoringConfig::default();

        if let Some(enabled) = env_parse::<bool>("DB_MONITOR_ENABLED")? {
            config.enabled = enabled;
        }
        if let Some(d) = env_duration("DB_MONITOR_HEALTH_CHECK_INTERVAL_SECS")? {
            config.health_check_interval = d;
        }
        if let Some(d) = env_duration("DB_MONITOR_SECURITY_CHECK_INTERVAL_SECS")? {
            config.security_check_interval = d;
        }
        if let Some(d) = env_duration("DB_MONITOR_HEALTH_WARNING_LATENCY_SECS")? {
            config.health_warning_latency = d;
        }
        if let Some(d) = env_duration("DB_MONITOR_HEALTH_CRITICAL_LATENCY_SECS")? {
            config.health_critical_latency = d;
        }
        if let Some(d) = env_duration("DB_MONITOR_SLOW_QUERY_SECS")? {
            config.slow_query_threshold = d;
        }
        if let Some(d) = env_duration("DB_MONITOR_VERY_SLOW_QUERY_SECS")? {
            config.very_slow_query_threshold = d;
        }
        if let Some(d) = env_duration("DB_MONITOR_CRITICAL_QUERY_SECS")? {
            config.critical_query_threshold = d;
        }
        if let Some(n) = env_parse::<usize>("DB_MONITOR_N_PLUS_ONE_THRESHOLD")? {
            config.n_plus_one_threshold = n;
        }
        if let Some(d) = env_duration("DB_MONITOR_N_PLUS_ONE_WINDOW_SECS")? {
            config.n_plus_one_time_window = d;
        }
        if let Some(rate) = env_parse::<f64>("DB_MONITOR_ERROR_RATE_THRESHOLD")? {
            config.error_rate_threshold = rate;
        }
        if let Some(n) = env_parse::<usize>("DB_MONITOR_MAX_QUERY_HISTORY")? {
            config.max_query_history = n;
        }
        if let Some(n) = env_parse::<usize>("DB_MONITOR_MAX_SECURITY_HISTORY")? {
            config.max_security_history = n;
        }
        if let Some(n) = env_parse::<usize>("DB_MONITOR_MAX_HEALTH_HISTORY")? {
            config.max_health_history = n;
        }
        if let Some(enabled) = env_parse::<bool>("DB_MONITOR_ENABLE_RECOVERY")? {
            config.enable_recovery = enabled;
        }
        if let Some(n) = env_parse::<u32>("DB_MONITOR_MAX_RECOVERY_ATTEMPTS")? {
            config.max_recovery_attempts = n;
        }
        if let Some(d) = env_duration("DB_MONITOR_RECOVERY_DELAY_SECS")? {
            config.recovery_delay = d;
        }
        if let Some(factor) = env_parse::<f64>("DB_MONITOR_RECOVERY_BACKOFF")? {
            config.recovery_backoff = factor;
        }
        if let Some(d) = env_duration("DB_MONITOR_MAX_RECOVERY_DELAY_SECS")? {
            config.max_recovery_delay = d;
        }
        if let Some(d) = env_duration("DB_MONITOR_SECURITY_WINDOW_SECS")? {
            config.security_window = d;
        }
        if let Some(n) = env_parse::<u32>("DB_MONITOR_CONNECTION_FAILURE_THRESHOLD")? {
            config.connection_failure_threshold = n;
        }
        if let Some(n) = env_parse::<usize>("DB_MONITOR_MAX_QUERIES_PER_MINUTE")? {
            config.max_queries_per_minute = n;
        }

        config.validate()?;
        info!("Loaded monitoring configuration from environment");
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !(self.slow_query_threshold < self.very_slow_query_threshold
            && self.very_slow_query_threshold < self.critical_query_threshold)
        {
            return Err(MonitorError::InvalidThresholds {
                slow: self.slow_query_threshold,
                very_slow: self.very_slow_query_threshold,
                critical: self.critical_query_threshold,
            });
        }

        if self.health_warning_latency >= self.health_critical_latency {
            return Err(MonitorError::config(format!(
                "Health warning latency ({:?}) must be below critical latency ({:?})",
                self.health_warning_latency, self.health_critical_latency
            )));
        }

        if self.health_check_interval.is_zero() {
            return Err(MonitorError::config(
                "Health check interval must be greater than 0",
            ));
        }

        if self.security_check_interval.is_zero() {
            return Err(MonitorError::config(
                "Security check interval must be greater than 0",
            ));
        }

        if self.n_plus_one_threshold == 0 {
            return Err(MonitorError::config(
                "N+1 threshold must be greater than 0",
            ));
        }

        if self.n_plus_one_time_window.is_zero() {
            return Err(MonitorError::config("N+1 time window must be greater than 0"));
        }

        if !(0.0..=1.0).contains(&self.error_rate_threshold) {
            return Err(MonitorError::config(
                "Error rate threshold must be between 0.0 and 1.0",
            ));
        }

        if self.max_query_history == 0
            || self.max_security_history == 0
            || self.max_health_history == 0
        {
            return Err(MonitorError::config(
                "History capacities must be greater than 0",
            ));
        }

        if self.enable_recovery && self.max_recovery_attempts == 0 {
            return Err(MonitorError::config(
                "Recovery is enabled but max_recovery_attempts is 0",
            ));
        }

        if !(self.recovery_backoff.is_finite() && self.recovery_backoff >= 1.0) {
            return Err(MonitorError::config(
                "Recovery backoff must be a finite multiplier of at least 1.0",
            ));
        }

        if self.max_recovery_delay < self.recovery_delay {
            return Err(MonitorError::config(format!(
                "Max recovery delay ({:?}) must not be below the recovery delay ({:?})",
                self.max_recovery_delay, self.recovery_delay
            )));
        }

        if self.degradation_ratio <= 0.0 {
            return Err(MonitorError::config(
                "Degradation ratio must be positive",
            ));
        }

        if self.max_trend_points == 0 {
            return Err(MonitorError::config("Trend capacity must be greater than 0"));
        }

        Ok(())
    }

    /// Apply a partial update and validate the result
    pub fn apply(&self, update: &MonitoringUpdate) -> Result<Self> {
        let mut next = self.clone();

        if let Some(v) = update.enabled {
            next.enabled = v;
        }
        if let Some(v) = update.health_check_interval {
            next.health_check_interval = v;
        }
        if let Some(v) = update.security_check_interval {
            next.security_check_interval = v;
        }
        if let Some(v) = update.health_warning_latency {
            next.health_warning_latency = v;
        }
        if let Some(v) = update.health_critical_latency {
            next.health_critical_latency = v;
        }
        if let Some(v) = update.slow_query_threshold {
            next.slow_query_threshold = v;
        }
        if let Some(v) = update.very_slow_query_threshold {
            next.very_slow_query_threshold = v;
        }
        if let Some(v) = update.critical_query_threshold {
            next.critical_query_threshold = v;
        }
        if let Some(v) = update.n_plus_one_threshold {
            next.n_plus_one_threshold = v;
        }
        if let Some(v) = update.n_plus_one_time_window {
            next.n_plus_one_time_window = v;
        }
        if let Some(v) = update.error_rate_threshold {
            next.error_rate_threshold = v;
        }
        if let Some(v) = update.enable_recovery {
            next.enable_recovery = v;
        }
        if let Some(v) = update.max_recovery_attempts {
            next.max_recovery_attempts = v;
        }
        if let Some(v) = update.recovery_delay {
            next.recovery_delay = v;
        }
        if let Some(v) = update.recovery_backoff {
            next.recovery_backoff = v;
        }
        if let Some(v) = update.max_recovery_delay {
            next.max_recovery_delay = v;
        }

        next.validate()?;
        Ok(next)
    }

    /// Create a report of the effective configuration for troubleshooting
    pub fn diagnostic_report(&self) -> String {
        let mut report = String::new();
        report.push_str("=== Database Monitor Configuration ===\n\n");

        report.push_str("Scheduling:\n");
        report.push_str(&format!(
            "  Health check interval: {:?}\n",
            self.health_check_interval
        ));
        report.push_str(&format!(
            "  Security check interval: {:?}\n",
            self.security_check_interval
        ));

        report.push_str("\nHealth Thresholds:\n");
        report.push_str(&format!("  Warning latency: {:?}\n", self.health_warning_latency));
        report.push_str(&format!(
            "  Critical latency: {:?}\n",
            self.health_critical_latency
        ));

        report.push_str("\nQuery Thresholds:\n");
        report.push_str(&format!("  Slow: {:?}\n", self.slow_query_threshold));
        report.push_str(&format!("  Very slow: {:?}\n", self.very_slow_query_threshold));
        report.push_str(&format!("  Critical: {:?}\n", self.critical_query_threshold));
        report.push_str(&format!(
            "  N+1: {} queries within {:?}\n",
            self.n_plus_one_threshold, self.n_plus_one_time_window
        ));
        report.push_str(&format!(
            "  Error rate: {:.1}%\n",
            self.error_rate_threshold * 100.0
        ));

        report.push_str("\nRecovery:\n");
        report.push_str(&format!("  Enabled: {}\n", self.enable_recovery));
        report.push_str(&format!("  Max attempts: {}\n", self.max_recovery_attempts));
        report.push_str(&format!("  Delay: {:?}\n", self.recovery_delay));
        report.push_str(&format!(
            "  Backoff: x{} (capped at {:?})\n",
            self.recovery_backoff, self.max_recovery_delay
        ));

        report.push_str("\nValidation Results:\n");
        match self.validate() {
            Ok(_) => report.push_str("  All configuration checks passed\n"),
            Err(e) => report.push_str(&format!("  Configuration error: {e}\n")),
        }

        report.push_str("\n=== End Configuration Report ===\n");
        report
    }
}

/// Builder that validates on `build()`
#[derive(Debug, Clone, Default)]
pub struct MonitoringConfigBuilder {
    config: MonitoringConfig,
}

impl MonitoringConfigBuilder {
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.config.health_check_interval = interval;
        self
    }

    pub fn security_check_interval(mut self, interval: Duration) -> Self {
        self.config.security_check_interval = interval;
        self
    }

    pub fn health_latency(mut self, warning: Duration, critical: Duration) -> Self {
        self.config.health_warning_latency = warning;
        self.config.health_critical_latency = critical;
        self
    }

    pub fn query_thresholds(
        mut self,
        slow: Duration,
        very_slow: Duration,
        critical: Duration,
    ) -> Self {
        self.config.slow_query_threshold = slow;
        self.config.very_slow_query_threshold = very_slow;
        self.config.critical_query_threshold = critical;
        self
    }

    /// Set only the slow threshold, shifting the higher tiers when they would
    /// no longer sit above it
    pub fn slow_query_threshold(mut self, slow: Duration) -> Self {
        self.config.slow_query_threshold = slow;
        if self.config.very_slow_query_threshold <= slow {
            self.config.very_slow_query_threshold = slow * 5;
        }
        if self.config.critical_query_threshold <= self.config.very_slow_query_threshold {
            self.config.critical_query_threshold = self.config.very_slow_query_threshold * 2;
        }
        self
    }

    pub fn n_plus_one(mut self, threshold: usize, window: Duration) -> Self {
        self.config.n_plus_one_threshold = threshold;
        self.config.n_plus_one_time_window = window;
        self
    }

    pub fn error_rate_threshold(mut self, threshold: f64) -> Self {
        self.config.error_rate_threshold = threshold;
        self
    }

    pub fn max_query_history(mut self, max: usize) -> Self {
        self.config.max_query_history = max;
        self
    }

    pub fn max_security_history(mut self, max: usize) -> Self {
        self.config.max_security_history = max;
        self
    }

    pub fn max_health_history(mut self, max: usize) -> Self {
        self.config.max_health_history = max;
        self
    }

    pub fn recovery(mut self, enabled: bool, max_attempts: u32, delay: Duration) -> Self {
        self.config.enable_recovery = enabled;
        self.config.max_recovery_attempts = max_attempts;
        self.config.recovery_delay = delay;
        if self.config.max_recovery_delay < delay {
            self.config.max_recovery_delay = delay;
        }
        self
    }

    /// Grow the reconnect delay by `factor` after each failure, up to `max_delay`
    pub fn recovery_backoff(mut self, factor: f64, max_delay: Duration) -> Self {
        self.config.recovery_backoff = factor;
        self.config.max_recovery_delay = max_delay;
        self
    }

    pub fn security_window(mut self, window: Duration) -> Self {
        self.config.security_window = window;
        self
    }

    pub fn slow_query_burst_threshold(mut self, threshold: usize) -> Self {
        self.config.slow_query_burst_threshold = threshold;
        self
    }

    pub fn connection_failure_threshold(mut self, threshold: u32) -> Self {
        self.config.connection_failure_threshold = threshold;
        self
    }

    pub fn max_queries_per_minute(mut self, max: usize) -> Self {
        self.config.max_queries_per_minute = max;
        self
    }

    pub fn degradation(mut self, ratio: f64, baseline_window: Duration, min_points: usize) -> Self {
        self.config.degradation_ratio = ratio;
        self.config.baseline_window = baseline_window;
        self.config.min_baseline_points = min_points;
        self
    }

    pub fn build(self) -> Result<MonitoringConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Partial configuration used for hot reload; `None` keeps the current value
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitoringUpdate {
    pub enabled: Option<bool>,
    pub health_check_interval: Option<Duration>,
    pub security_check_interval: Option<Duration>,
    pub health_warning_latency: Option<Duration>,
    pub health_critical_latency: Option<Duration>,
    pub slow_query_threshold: Option<Duration>,
    pub very_slow_query_threshold: Option<Duration>,
    pub critical_query_threshold: Option<Duration>,
    pub n_plus_one_threshold: Option<usize>,
    pub n_plus_one_time_window: Option<Duration>,
    pub error_rate_threshold: Option<f64>,
    pub enable_recovery: Option<bool>,
    pub max_recovery_attempts: Option<u32>,
    pub recovery_delay: Option<Duration>,
    pub recovery_backoff: Option<f64>,
    pub max_recovery_delay: Option<Duration>,
}

impl MonitoringUpdate {
    /// Whether applying this update to `current` changes a schedule period
    pub fn reschedules(&self, current: &MonitoringConfig) -> bool {
        self.health_check_interval
            .is_some_and(|d| d != current.health_check_interval)
            || self
                .security_check_interval
                .is_some_and(|d| d != current.security_check_interval)
    }
}

/// Shared, hot-swappable handle to the current configuration
#[derive(Debug, Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<Arc<MonitoringConfig>>>,
}

impl SharedConfig {
    pub fn new(config: MonitoringConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// Snapshot of the configuration in effect right now
    pub fn current(&self) -> Arc<MonitoringConfig> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Validate and swap in a new configuration
    pub fn replace(&self, config: MonitoringConfig) -> Result<()> {
        config.validate()?;
        match self.inner.write() {
            Ok(mut guard) => *guard = Arc::new(config),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(config),
        }
        Ok(())
    }

    /// Apply a partial update. Read, validate, and swap happen under one
    /// write guard so concurrent updates never overwrite each other.
    pub fn update(&self, update: &MonitoringUpdate) -> Result<Arc<MonitoringConfig>> {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = Arc::new(guard.apply(update)?);
        *guard = next.clone();
        Ok(next)
    }
}

impl From<MonitoringConfig> for SharedConfig {
    fn from(config: MonitoringConfig) -> Self {
        Self::new(config)
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| MonitorError::config(format!("Invalid {name}: {e}"))),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => {
            warn!("Ignoring {}: {}", name, e);
            Ok(None)
        }
    }
}

fn env_duration(name: &str) -> Result<Option<Duration>> {
    match env_parse::<f64>(name)? {
        Some(secs) => Duration::try_from_secs_f64(secs)
            .map(Some)
            .map_err(|e| MonitorError::config(format!("Invalid {name}: {e}"))),
        None => Ok(None),
    }
}
