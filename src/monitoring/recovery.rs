use super::retry::{RetryConfig, RetryPolicy};
use super::{
    Alert, AlertDraft, AlertSeverity, AlertType, AlertingSystem, DataService, MetricsCollector,
};
use crate::config::SharedConfig;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryState {
    Idle,
    Attempting,
    Recovered,
    Exhausted,
}

impl fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecoveryState::Idle => "idle",
            RecoveryState::Attempting => "attempting",
            RecoveryState::Recovered => "recovered",
            RecoveryState::Exhausted => "exhausted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryOutcome {
    pub state: RecoveryState,
    pub attempts: u32,
    pub alert: Alert,
}

impl RecoveryOutcome {
    pub fn recovered(&self) -> bool {
        self.state == RecoveryState::Recovered
    }
}

/// Clears the in-flight flag even if the recovery future is dropped. A
/// cycle cancelled mid-attempt goes back to `Idle`.
struct InFlight<'a>(&'a RecoveryOrchestrator);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let recovery = self.0;
        if recovery.state() == RecoveryState::Attempting {
            debug!("Connection recovery cancelled");
            recovery.set_state(RecoveryState::Idle);
        }
        recovery.in_flight.store(false, Ordering::SeqCst);
    }
}

/// Bounded close-then-connect retries against the data service
pub struct RecoveryOrchestrator {
    service: Arc<dyn DataService>,
    config: SharedConfig,
    alerting: Arc<AlertingSystem>,
    metrics: Option<Arc<MetricsCollector>>,
    state: Mutex<RecoveryState>,
    in_flight: AtomicBool,
    total_attempts: AtomicU64,
}

impl fmt::Debug for RecoveryOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryOrchestrator")
            .field("state", &self.state())
            .field("in_flight", &self.is_in_flight())
            .finish_non_exhaustive()
    }
}

impl RecoveryOrchestrator {
    pub fn new(
        service: Arc<dyn DataService>,
        config: SharedConfig,
        alerting: Arc<AlertingSystem>,
    ) -> Self {
        Self {
            service,
            config,
            alerting,
            metrics: None,
            state: Mutex::new(RecoveryState::Idle),
            in_flight: AtomicBool::new(false),
            total_attempts: AtomicU64::new(0),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn state(&self) -> RecoveryState {
        match self.state.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_state(&self, state: RecoveryState) {
        match self.state.lock() {
            Ok(mut guard) => *guard = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Reconnection attempts made over the orchestrator's lifetime
    pub fn total_attempts(&self) -> u64 {
        self.total_attempts.load(Ordering::SeqCst)
    }

    /// Run one recovery cycle. Returns `None` when recovery is disabled or
    /// another cycle is already running.
    pub async fn recover(&self) -> Option<RecoveryOutcome> {
        let config = self.config.current();
        if !config.enable_recovery {
            debug!("Connection recovery disabled");
            return None;
        }

        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Connection recovery already in progress");
            return None;
        }
        let _in_flight = InFlight(self);

        self.set_state(RecoveryState::Attempting);
        info!(
            "Attempting database connection recovery ({} attempts, {:?} delay, backoff x{})",
            config.max_recovery_attempts, config.recovery_delay, config.recovery_backoff
        );

        let policy = RetryPolicy::new(RetryConfig::for_recovery(&config));
        let attempts = AtomicU32::new(0);

        let result = policy
            .execute(|attempt| {
                attempts.store(attempt, Ordering::SeqCst);
                self.attempt(attempt)
            })
            .await;
        let attempts = attempts.load(Ordering::SeqCst);

        let (state, draft) = match result {
            Ok(()) => (
                RecoveryState::Recovered,
                AlertDraft::new(
                    AlertType::ConnectionRecovered,
                    AlertSeverity::Info,
                    format!("Database connection recovered after {attempts} attempt(s)"),
                )
                .with_details(json!({ "attempts": attempts })),
            ),
            Err(e) => (
                RecoveryState::Exhausted,
                AlertDraft::new(
                    AlertType::ConnectionFailure,
                    AlertSeverity::Critical,
                    format!("Database connection recovery failed after {attempts} attempts: {e}"),
                )
                .with_details(json!({
                    "attempts": attempts,
                    "last_error": e.to_string(),
                })),
            ),
        };

        self.set_state(state);
        let alert = self.alerting.trigger_alert(draft);
        Some(RecoveryOutcome {
            state,
            attempts,
            alert,
        })
    }

    async fn attempt(&self, attempt: u32) -> anyhow::Result<()> {
        self.total_attempts.fetch_add(1, Ordering::SeqCst);
        debug!("Recovery attempt {}", attempt);

        if let Err(e) = self.service.close().await {
            warn!("Closing connection before reconnect failed: {}", e);
        }

        let result = match self.service.connect().await {
            Ok(()) if self.service.is_connected() => Ok(()),
            Ok(()) => Err(anyhow::anyhow!("service still disconnected after connect")),
            Err(e) => Err(e),
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_recovery_attempt(result.is_ok());
        }
        result
    }
}
