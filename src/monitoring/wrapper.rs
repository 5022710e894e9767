use super::{
    DataService, MetricsCollector, QueryExecution, QueryHandle, QueryPerformanceMonitor,
    QueryRequest, QueryStatus,
};
use anyhow::Result;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Classify a failed operation; anything mentioning a timeout is a `Timeout`
pub fn classify_error(error: &anyhow::Error) -> QueryStatus {
    let message = format!("{error:#}").to_lowercase();
    if message.contains("timeout") || message.contains("timed out") {
        QueryStatus::Timeout
    } else {
        QueryStatus::Error
    }
}

/// Finishes the query as cancelled if the operation future is dropped
struct PendingQuery<'a> {
    queries: &'a QueryPerformanceMonitor,
    handle: Option<QueryHandle>,
}

impl PendingQuery<'_> {
    fn finish(
        mut self,
        status: QueryStatus,
        error_message: Option<String>,
        row_count: Option<u64>,
    ) -> Option<QueryExecution> {
        let handle = self.handle.take()?;
        self.queries
            .finish_query(&handle, status, error_message, row_count)
    }
}

impl Drop for PendingQuery<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!(query_id = %handle, "Tracked operation dropped before completion");
            self.queries
                .finish_query(&handle, QueryStatus::Cancelled, None, None);
        }
    }
}

/// Instruments a data service: every tracked operation is bracketed with
/// start/finish, and connection lifecycle calls feed the connection metrics
#[derive(Debug)]
pub struct MonitoredDataService<S: DataService + ?Sized> {
    inner: Arc<S>,
    queries: Arc<QueryPerformanceMonitor>,
    metrics: Arc<MetricsCollector>,
}

impl<S: DataService + ?Sized> Clone for MonitoredDataService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            queries: self.queries.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<S: DataService + ?Sized> MonitoredDataService<S> {
    pub fn new(
        inner: Arc<S>,
        queries: Arc<QueryPerformanceMonitor>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            inner,
            queries,
            metrics,
        }
    }

    pub fn inner(&self) -> &Arc<S> {
        &self.inner
    }

    pub async fn track<T, F>(&self, request: QueryRequest, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.track_with_rows(request, operation, |_| None).await
    }

    /// Like `track`, with `rows` extracting the affected row count on success
    pub async fn track_with_rows<T, F, R>(
        &self,
        request: QueryRequest,
        operation: F,
        rows: R,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
        R: FnOnce(&T) -> Option<u64>,
    {
        let pending = PendingQuery {
            queries: &self.queries,
            handle: self.queries.start_query(request),
        };

        let result = operation.await;
        match &result {
            Ok(value) => {
                pending.finish(QueryStatus::Success, None, rows(value));
            }
            Err(e) => {
                pending.finish(classify_error(e), Some(format!("{e:#}")), None);
            }
        }

        self.refresh_active_connections();
        result
    }

    fn refresh_active_connections(&self) {
        if let Some(active) = self.inner.active_connections() {
            self.metrics.set_active_connections(active);
        }
    }
}

#[async_trait]
impl<S: DataService + ?Sized> DataService for MonitoredDataService<S> {
    fn service_name(&self) -> &str {
        self.inner.service_name()
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    async fn health_check(&self) -> Result<bool> {
        self.inner.health_check().await
    }

    async fn verify(&self) -> Result<()> {
        self.inner.verify().await
    }

    async fn connect(&self) -> Result<()> {
        let result = self.inner.connect().await;
        self.metrics.record_connection_attempt(result.is_ok());
        self.refresh_active_connections();
        result
    }

    async fn close(&self) -> Result<()> {
        let result = self.inner.close().await;
        self.metrics
            .set_active_connections(self.inner.active_connections().unwrap_or(0));
        result
    }

    fn active_connections(&self) -> Option<u32> {
        self.inner.active_connections()
    }
}
