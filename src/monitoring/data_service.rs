use anyhow::Result;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// The data-access layer the monitor observes.
///
/// The monitor only reads status through this trait and reconnects through
/// `close`/`connect` during recovery; it never assumes exclusive access.
#[async_trait]
pub trait DataService: Send + Sync + std::fmt::Debug {
    /// Name used as the `service` metrics label
    fn service_name(&self) -> &str {
        "database"
    }

    fn is_connected(&self) -> bool;

    async fn health_check(&self) -> Result<bool>;

    /// Lightweight query run after a successful health check
    async fn verify(&self) -> Result<()> {
        Ok(())
    }

    async fn connect(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Connections currently checked out, if the service can tell
    fn active_connections(&self) -> Option<u32> {
        None
    }
}

/// PostgreSQL implementation backed by a sqlx pool
#[derive(Debug)]
pub struct PostgresDataService {
    database_url: String,
    max_connections: u32,
    acquire_timeout: Duration,
    pool: RwLock<Option<PgPool>>,
}

impl PostgresDataService {
    pub fn new(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections,
            acquire_timeout: Duration::from_secs(5),
            pool: RwLock::new(None),
        }
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Create the service and open its pool
    pub async fn connect_to(database_url: impl Into<String>, max_connections: u32) -> Result<Self> {
        let service = Self::new(database_url, max_connections);
        service.connect().await?;
        Ok(service)
    }

    fn pool(&self) -> Option<PgPool> {
        match self.pool.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_pool(&self, pool: Option<PgPool>) -> Option<PgPool> {
        match self.pool.write() {
            Ok(mut guard) => std::mem::replace(&mut *guard, pool),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), pool),
        }
    }
}

#[async_trait]
impl DataService for PostgresDataService {
    fn service_name(&self) -> &str {
        "postgres"
    }

    fn is_connected(&self) -> bool {
        self.pool().map(|pool| !pool.is_closed()).unwrap_or(false)
    }

    async fn health_check(&self) -> Result<bool> {
        let Some(pool) = self.pool() else {
            return Ok(false);
        };

        debug!("Performing database health check");
        sqlx::query("SELECT 1 as health_check")
            .fetch_one(&pool)
            .await?;
        Ok(true)
    }

    async fn verify(&self) -> Result<()> {
        let Some(pool) = self.pool() else {
            return Err(anyhow::anyhow!("No connection pool available"));
        };

        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM pg_stat_activity")
            .fetch_one(&pool)
            .await?;
        Ok(())
    }

    async fn connect(&self) -> Result<()> {
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .connect(&self.database_url)
            .await?;

        if let Some(previous) = self.set_pool(Some(pool)) {
            previous.close().await;
        }
        info!("Connected database pool (max {} connections)", self.max_connections);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(pool) = self.set_pool(None) {
            pool.close().await;
            info!("Closed database pool");
        }
        Ok(())
    }

    fn active_connections(&self) -> Option<u32> {
        self.pool()
            .map(|pool| pool.size().saturating_sub(pool.num_idle() as u32))
    }
}

/// Scriptable in-memory service for tests and simulations
#[derive(Debug)]
pub struct MockDataService {
    name: String,
    connected: AtomicBool,
    healthy: AtomicBool,
    health_error: Mutex<Option<String>>,
    verify_error: Mutex<Option<String>>,
    latency: Mutex<Duration>,
    failing_connects: AtomicU32,
    connect_calls: AtomicU32,
    close_calls: AtomicU32,
    health_checks: AtomicU32,
}

impl Default for MockDataService {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDataService {
    /// A connected, healthy service with no latency
    pub fn new() -> Self {
        Self {
            name: "mock".to_string(),
            connected: AtomicBool::new(true),
            healthy: AtomicBool::new(true),
            health_error: Mutex::new(None),
            verify_error: Mutex::new(None),
            latency: Mutex::new(Duration::ZERO),
            failing_connects: AtomicU32::new(0),
            connect_calls: AtomicU32::new(0),
            close_calls: AtomicU32::new(0),
            health_checks: AtomicU32::new(0),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Make `health_check` return `Ok(healthy)`
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Make `health_check` fail with the given message (`None` clears it)
    pub fn fail_health_checks(&self, message: Option<&str>) {
        set_message(&self.health_error, message);
    }

    /// Make `verify` fail with the given message (`None` clears it)
    pub fn fail_verification(&self, message: Option<&str>) {
        set_message(&self.verify_error, message);
    }

    pub fn set_latency(&self, latency: Duration) {
        match self.latency.lock() {
            Ok(mut guard) => *guard = latency,
            Err(poisoned) => *poisoned.into_inner() = latency,
        }
    }

    /// The next `count` calls to `connect` fail
    pub fn fail_next_connects(&self, count: u32) {
        self.failing_connects.store(count, Ordering::SeqCst);
    }

    pub fn connect_calls(&self) -> u32 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> u32 {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn health_check_count(&self) -> u32 {
        self.health_checks.load(Ordering::SeqCst)
    }

    fn current_latency(&self) -> Duration {
        match self.latency.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

fn set_message(slot: &Mutex<Option<String>>, message: Option<&str>) {
    let value = message.map(str::to_string);
    match slot.lock() {
        Ok(mut guard) => *guard = value,
        Err(poisoned) => *poisoned.into_inner() = value,
    }
}

fn read_message(slot: &Mutex<Option<String>>) -> Option<String> {
    match slot.lock() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

#[async_trait]
impl DataService for MockDataService {
    fn service_name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn health_check(&self) -> Result<bool> {
        self.health_checks.fetch_add(1, Ordering::SeqCst);

        let latency = self.current_latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if let Some(message) = read_message(&self.health_error) {
            return Err(anyhow::anyhow!(message));
        }

        Ok(self.is_connected() && self.healthy.load(Ordering::SeqCst))
    }

    async fn verify(&self) -> Result<()> {
        match read_message(&self.verify_error) {
            Some(message) => Err(anyhow::anyhow!(message)),
            None => Ok(()),
        }
    }

    async fn connect(&self) -> Result<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);

        let remaining = self.failing_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_connects.store(remaining - 1, Ordering::SeqCst);
            warn!("Mock connect failing ({} failures left)", remaining - 1);
            return Err(anyhow::anyhow!("connection refused"));
        }

        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn active_connections(&self) -> Option<u32> {
        Some(u32::from(self.is_connected()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_health_states() {
        let service = MockDataService::new();
        assert!(service.health_check().await.unwrap());

        service.set_healthy(false);
        assert!(!service.health_check().await.unwrap());

        service.fail_health_checks(Some("boom"));
        assert!(service.health_check().await.is_err());
        assert_eq!(service.health_check_count(), 3);
    }

    #[tokio::test]
    async fn test_mock_reconnect() {
        let service = MockDataService::new();
        service.fail_next_connects(1);

        service.close().await.unwrap();
        assert!(!service.is_connected());
        assert!(!service.health_check().await.unwrap());

        assert!(service.connect().await.is_err());
        assert!(!service.is_connected());

        service.connect().await.unwrap();
        assert!(service.is_connected());
        assert_eq!(service.connect_calls(), 2);
        assert_eq!(service.close_calls(), 1);
    }

    #[test]
    fn test_postgres_service_starts_disconnected() {
        let service = PostgresDataService::new("postgresql://localhost/test", 5);
        assert!(!service.is_connected());
        assert_eq!(service.service_name(), "postgres");
        assert_eq!(service.active_connections(), None);
    }
}
