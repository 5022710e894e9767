use crate::config::SharedConfig;
use crate::error::Result;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, trace};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryType {
    Select,
    Insert,
    Update,
    Delete,
    Upsert,
    VectorSearch,
    Count,
    Transaction,
    FunctionCall,
    RawSql,
}

impl QueryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::Select => "select",
            QueryType::Insert => "insert",
            QueryType::Update => "update",
            QueryType::Delete => "delete",
            QueryType::Upsert => "upsert",
            QueryType::VectorSearch => "vector_search",
            QueryType::Count => "count",
            QueryType::Transaction => "transaction",
            QueryType::FunctionCall => "function_call",
            QueryType::RawSql => "raw_sql",
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryStatus {
    Success,
    Error,
    Timeout,
    Cancelled,
}

impl QueryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryStatus::Success => "success",
            QueryStatus::Error => "error",
            QueryStatus::Timeout => "timeout",
            QueryStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, QueryStatus::Success)
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle returned by `start_query`; `None` from the tracker means tracking is off
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryHandle {
    id: Arc<str>,
}

impl QueryHandle {
    fn new() -> Self {
        Self {
            id: Arc::from(Uuid::new_v4().to_string()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for QueryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Everything known about an operation when it starts
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub query_type: QueryType,
    pub table_name: Option<String>,
    pub query_text: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub tags: BTreeMap<String, String>,
}

impl QueryRequest {
    pub fn new(query_type: QueryType) -> Self {
        Self {
            query_type,
            table_name: None,
            query_text: None,
            user_id: None,
            session_id: None,
            tags: BTreeMap::new(),
        }
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table_name = Some(table.into());
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.query_text = Some(text.into());
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// A tracked operation. Mutable only until it is finished.
#[derive(Debug, Clone, Serialize)]
pub struct QueryExecution {
    pub query_id: String,
    pub query_type: QueryType,
    pub table_name: Option<String>,
    pub query_text: Option<String>,
    pub query_hash: String,
    #[serde(skip_serializing)]
    pub start_time: Instant,
    #[serde(skip_serializing)]
    pub end_time: Option<Instant>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
    pub status: Option<QueryStatus>,
    pub error_message: Option<String>,
    pub row_count: Option<u64>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub tags: BTreeMap<String, String>,
    /// Position in completion order, assigned at finish
    pub sequence: u64,
}

impl QueryExecution {
    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }

    pub fn is_success(&self) -> bool {
        self.status == Some(QueryStatus::Success)
    }

    pub fn is_failure(&self) -> bool {
        self.status.map(|s| s.is_failure()).unwrap_or(false)
    }

    /// Finished with a duration at or above `threshold`
    pub fn is_slow(&self, threshold: Duration) -> bool {
        self.duration.map(|d| d >= threshold).unwrap_or(false)
    }

    pub fn duration_ms(&self) -> Option<f64> {
        self.duration.map(|d| d.as_secs_f64() * 1000.0)
    }

    /// Table label used in metrics and breakdowns
    pub fn table_label(&self) -> &str {
        self.table_name.as_deref().unwrap_or("unknown")
    }

    fn finish(
        &mut self,
        status: QueryStatus,
        error_message: Option<String>,
        row_count: Option<u64>,
        sequence: u64,
    ) {
        let end = Instant::now();
        self.end_time = Some(end);
        self.finished_at = Some(Utc::now());
        self.duration = Some(end.saturating_duration_since(self.start_time));
        self.status = Some(status);
        self.error_message = error_message;
        self.row_count = row_count;
        self.sequence = sequence;
    }
}

/// Strips literals from query text so structurally identical queries share a hash
#[derive(Debug, Clone)]
pub struct QueryNormalizer {
    quoted: Regex,
    numbers: Regex,
    whitespace: Regex,
}

impl QueryNormalizer {
    pub fn new() -> Result<Self> {
        Ok(Self {
            quoted: Regex::new(r#"'(?:[^']|'')*'|"(?:[^"]|"")*""#)?,
            numbers: Regex::new(r"\b\d+(?:\.\d+)?\b")?,
            whitespace: Regex::new(r"\s+")?,
        })
    }

    pub fn normalize(&self, text: &str) -> String {
        let lowered = text.to_lowercase();
        let without_strings = self.quoted.replace_all(&lowered, "?");
        let without_numbers = self.numbers.replace_all(&without_strings, "?");
        self.whitespace
            .replace_all(without_numbers.trim(), " ")
            .into_owned()
    }

    /// Fingerprint of `(type, table, normalized text)`
    pub fn fingerprint(
        &self,
        query_type: QueryType,
        table_name: Option<&str>,
        text: Option<&str>,
    ) -> String {
        let normalized = text.map(|t| self.normalize(t)).unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(query_type.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(table_name.unwrap_or("").as_bytes());
        hasher.update(b"|");
        hasher.update(normalized.as_bytes());
        let result = hasher.finalize();
        format!("{result:x}")
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    active: HashMap<String, QueryExecution>,
    history: VecDeque<QueryExecution>,
}

/// Records start and finish of data operations into a bounded history
#[derive(Debug)]
pub struct QueryExecutionTracker {
    config: SharedConfig,
    normalizer: QueryNormalizer,
    enabled: AtomicBool,
    sequence: AtomicU64,
    state: Mutex<TrackerState>,
}

impl QueryExecutionTracker {
    pub fn new(config: SharedConfig) -> Result<Self> {
        Ok(Self {
            config,
            normalizer: QueryNormalizer::new()?,
            enabled: AtomicBool::new(true),
            sequence: AtomicU64::new(0),
            state: Mutex::new(TrackerState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn normalizer(&self) -> &QueryNormalizer {
        &self.normalizer
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst) && self.config.current().enabled
    }

    /// Turn tracking on or off; disabling drops in-flight queries
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            let dropped = {
                let mut state = self.state();
                let count = state.active.len();
                state.active.clear();
                count
            };
            debug!("Query tracking disabled, dropped {} active queries", dropped);
        }
    }

    pub fn start_query(&self, request: QueryRequest) -> Option<QueryHandle> {
        if !self.is_enabled() {
            return None;
        }

        let handle = QueryHandle::new();
        let query_hash = self.normalizer.fingerprint(
            request.query_type,
            request.table_name.as_deref(),
            request.query_text.as_deref(),
        );

        let execution = QueryExecution {
            query_id: handle.id().to_string(),
            query_type: request.query_type,
            table_name: request.table_name,
            query_text: request.query_text,
            query_hash,
            start_time: Instant::now(),
            end_time: None,
            started_at: Utc::now(),
            finished_at: None,
            duration: None,
            status: None,
            error_message: None,
            row_count: None,
            user_id: request.user_id,
            session_id: request.session_id,
            tags: request.tags,
            sequence: 0,
        };

        trace!(query_id = %handle, query_type = %execution.query_type, "Query started");
        self.state().active.insert(handle.id().to_string(), execution);
        Some(handle)
    }

    /// Finish a tracked query. Unknown or already-finished handles return `None`.
    pub fn finish_query(
        &self,
        handle: &QueryHandle,
        status: QueryStatus,
        error_message: Option<String>,
        row_count: Option<u64>,
    ) -> Option<QueryExecution> {
        let max_history = self.config.current().max_query_history;

        let mut state = self.state();
        let mut execution = state.active.remove(handle.id())?;
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        execution.finish(status, error_message, row_count, sequence);

        state.history.push_back(execution.clone());
        while state.history.len() > max_history {
            state.history.pop_front();
        }
        drop(state);

        trace!(
            query_id = %handle,
            status = %status,
            duration_ms = execution.duration_ms().unwrap_or_default(),
            "Query finished"
        );
        Some(execution)
    }

    /// Most recent finished queries, newest last
    pub fn get_query_history(&self, limit: Option<usize>) -> Vec<QueryExecution> {
        let state = self.state();
        let skip = limit
            .map(|l| state.history.len().saturating_sub(l))
            .unwrap_or(0);
        state.history.iter().skip(skip).cloned().collect()
    }

    pub fn get_active_queries(&self) -> Vec<QueryExecution> {
        self.state().active.values().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.state().active.len()
    }

    pub fn history_len(&self) -> usize {
        self.state().history.len()
    }

    /// Finished queries with `duration >= threshold` (default: the slow threshold)
    pub fn get_slow_queries(&self, threshold: Option<Duration>) -> Vec<QueryExecution> {
        let threshold = threshold.unwrap_or_else(|| self.config.current().slow_query_threshold);
        self.state()
            .history
            .iter()
            .filter(|e| e.is_slow(threshold))
            .cloned()
            .collect()
    }

    /// Finished queries whose completion falls inside the last `window`
    pub fn executions_since(&self, window: Duration) -> Vec<QueryExecution> {
        let now = Instant::now();
        self.state()
            .history
            .iter()
            .filter(|e| {
                e.end_time
                    .map(|end| now.saturating_duration_since(end) <= window)
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Finished queries with a completion sequence greater than `sequence`
    pub fn executions_after(&self, sequence: u64) -> Vec<QueryExecution> {
        self.state()
            .history
            .iter()
            .filter(|e| e.sequence > sequence)
            .cloned()
            .collect()
    }

    /// Sequence number of the latest finished query
    pub fn last_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        let mut state = self.state();
        state.active.clear();
        state.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitoringConfig;

    fn tracker_with_history(max: usize) -> QueryExecutionTracker {
        let config = MonitoringConfig::builder()
            .max_query_history(max)
            .build()
            .unwrap();
        QueryExecutionTracker::new(SharedConfig::new(config)).unwrap()
    }

    #[test]
    fn test_normalization_strips_literals() {
        let normalizer = QueryNormalizer::new().unwrap();
        assert_eq!(
            normalizer.normalize("SELECT *  FROM comments\n WHERE id = 42 AND name = 'bob'"),
            "select * from comments where id = ? and name = ?"
        );
        assert_eq!(
            normalizer.normalize("select * from t where x = 3.14"),
            "select * from t where x = ?"
        );
    }

    #[test]
    fn test_fingerprint_groups_by_shape_and_table() {
        let normalizer = QueryNormalizer::new().unwrap();
        let a = normalizer.fingerprint(
            QueryType::Select,
            Some("comments"),
            Some("SELECT * FROM comments WHERE post_id = 1"),
        );
        let b = normalizer.fingerprint(
            QueryType::Select,
            Some("comments"),
            Some("select * from comments where post_id = 999"),
        );
        let other_table = normalizer.fingerprint(
            QueryType::Select,
            Some("posts"),
            Some("SELECT * FROM comments WHERE post_id = 1"),
        );
        let other_type = normalizer.fingerprint(
            QueryType::Count,
            Some("comments"),
            Some("SELECT * FROM comments WHERE post_id = 1"),
        );

        assert_eq!(a, b);
        assert_ne!(a, other_table);
        assert_ne!(a, other_type);
    }

    #[test]
    fn test_start_and_finish() {
        let tracker = tracker_with_history(10);
        let handle = tracker
            .start_query(QueryRequest::new(QueryType::Insert).table("trips").user("u1"))
            .unwrap();
        assert_eq!(tracker.active_count(), 1);

        let execution = tracker
            .finish_query(&handle, QueryStatus::Success, None, Some(1))
            .unwrap();
        assert_eq!(tracker.active_count(), 0);
        assert_eq!(tracker.history_len(), 1);
        assert_eq!(execution.row_count, Some(1));
        assert_eq!(execution.user_id.as_deref(), Some("u1"));
        assert_eq!(
            execution.duration,
            Some(execution.end_time.unwrap() - execution.start_time)
        );
    }

    #[test]
    fn test_finish_twice_is_noop() {
        let tracker = tracker_with_history(10);
        let handle = tracker.start_query(QueryRequest::new(QueryType::Select)).unwrap();

        assert!(tracker
            .finish_query(&handle, QueryStatus::Success, None, None)
            .is_some());
        assert!(tracker
            .finish_query(&handle, QueryStatus::Success, None, None)
            .is_none());
        assert_eq!(tracker.history_len(), 1);
    }

    #[test]
    fn test_history_bounded_keeps_newest() {
        let tracker = tracker_with_history(3);
        for i in 0..5 {
            let handle = tracker
                .start_query(QueryRequest::new(QueryType::Select).tag("i", i.to_string()))
                .unwrap();
            tracker.finish_query(&handle, QueryStatus::Success, None, None);
        }

        let history = tracker.get_query_history(None);
        assert_eq!(history.len(), 3);
        let tags: Vec<&str> = history.iter().map(|e| e.tags["i"].as_str()).collect();
        assert_eq!(tags, vec!["2", "3", "4"]);

        assert_eq!(tracker.get_query_history(Some(1)).len(), 1);
        assert_eq!(tracker.get_query_history(Some(1))[0].tags["i"], "4");
    }

    #[test]
    fn test_disabled_tracking() {
        let tracker = tracker_with_history(10);
        let handle = tracker.start_query(QueryRequest::new(QueryType::Select)).unwrap();

        tracker.set_enabled(false);
        assert!(tracker.start_query(QueryRequest::new(QueryType::Select)).is_none());
        assert_eq!(tracker.active_count(), 0);
        assert!(tracker
            .finish_query(&handle, QueryStatus::Success, None, None)
            .is_none());

        tracker.set_enabled(true);
        assert!(tracker.start_query(QueryRequest::new(QueryType::Select)).is_some());
    }

    #[test]
    fn test_disabled_by_config() {
        let config = MonitoringConfig::builder().enabled(false).build().unwrap();
        let tracker = QueryExecutionTracker::new(SharedConfig::new(config)).unwrap();
        assert!(tracker.start_query(QueryRequest::new(QueryType::Select)).is_none());
    }

    #[test]
    fn test_slow_queries_and_sequence() {
        let tracker = tracker_with_history(10);
        let slow = tracker.start_query(QueryRequest::new(QueryType::Select)).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        tracker.finish_query(&slow, QueryStatus::Success, None, None);

        let fast = tracker.start_query(QueryRequest::new(QueryType::Select)).unwrap();
        tracker.finish_query(&fast, QueryStatus::Error, Some("boom".into()), None);

        let slow_queries = tracker.get_slow_queries(Some(Duration::from_millis(20)));
        assert_eq!(slow_queries.len(), 1);
        assert_eq!(slow_queries[0].query_id, slow.id());

        assert_eq!(tracker.last_sequence(), 2);
        let after = tracker.executions_after(1);
        assert_eq!(after.len(), 1);
        assert!(after[0].is_failure());
    }
}
