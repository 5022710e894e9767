use super::{AlertSeverity, QueryExecution};
use crate::config::SharedConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    NPlusOne,
}

/// A burst of structurally identical queries
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryPattern {
    pub pattern_type: PatternType,
    pub query_hash: String,
    pub table_name: Option<String>,
    pub occurrence_count: usize,
    pub time_window: Duration,
    pub first_occurrence: DateTime<Utc>,
    pub last_occurrence: DateTime<Utc>,
    pub severity: AlertSeverity,
    pub sample_query: Option<String>,
}

#[derive(Debug, Default)]
struct DetectorState {
    /// Occurrence times per query hash, oldest first
    occurrences: HashMap<String, VecDeque<(Instant, DateTime<Utc>)>>,
    /// Latest detected pattern per query hash
    patterns: HashMap<String, QueryPattern>,
}

/// Sliding-window N+1 detection over the finished-query stream
#[derive(Debug)]
pub struct QueryPatternDetector {
    config: SharedConfig,
    state: Mutex<DetectorState>,
}

impl QueryPatternDetector {
    pub fn new(config: SharedConfig) -> Self {
        Self {
            config,
            state: Mutex::new(DetectorState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, DetectorState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn analyze(&self, execution: &QueryExecution) -> Vec<QueryPattern> {
        self.analyze_at(execution, Instant::now())
    }

    /// Record one occurrence observed at `now` and report a pattern once the
    /// window holds at least `n_plus_one_threshold` occurrences. Every call at
    /// or above the threshold reports again.
    pub fn analyze_at(&self, execution: &QueryExecution, now: Instant) -> Vec<QueryPattern> {
        let config = self.config.current();
        let window = config.n_plus_one_time_window;
        let threshold = config.n_plus_one_threshold;

        let mut state = self.state();
        let occurrences = state
            .occurrences
            .entry(execution.query_hash.clone())
            .or_default();

        while let Some((seen, _)) = occurrences.front() {
            if now.saturating_duration_since(*seen) > window {
                occurrences.pop_front();
            } else {
                break;
            }
        }
        occurrences.push_back((now, Utc::now()));

        let count = occurrences.len();
        if count < threshold {
            return Vec::new();
        }

        let first = occurrences.front().map(|(_, at)| *at).unwrap_or_else(Utc::now);
        let last = occurrences.back().map(|(_, at)| *at).unwrap_or_else(Utc::now);

        let pattern = QueryPattern {
            pattern_type: PatternType::NPlusOne,
            query_hash: execution.query_hash.clone(),
            table_name: execution.table_name.clone(),
            occurrence_count: count,
            time_window: window,
            first_occurrence: first,
            last_occurrence: last,
            severity: AlertSeverity::Warning,
            sample_query: execution.query_text.clone(),
        };
        state
            .patterns
            .insert(execution.query_hash.clone(), pattern.clone());
        drop(state);

        warn!(
            table = execution.table_label(),
            occurrences = count,
            "Potential N+1 query pattern detected"
        );
        vec![pattern]
    }

    /// Latest pattern per query hash, most recently seen first
    pub fn get_patterns(&self) -> Vec<QueryPattern> {
        let mut patterns: Vec<QueryPattern> = self.state().patterns.values().cloned().collect();
        patterns.sort_by(|a, b| b.last_occurrence.cmp(&a.last_occurrence));
        patterns
    }

    pub fn prune(&self) {
        self.prune_at(Instant::now());
    }

    /// Drop occurrences older than the window as of `now`, along with the
    /// patterns of query shapes that have no occurrence left
    pub fn prune_at(&self, now: Instant) {
        let window = self.config.current().n_plus_one_time_window;
        let mut state = self.state();
        let DetectorState {
            occurrences,
            patterns,
        } = &mut *state;

        occurrences.retain(|_, seen| {
            seen.retain(|(at, _)| now.saturating_duration_since(*at) <= window);
            !seen.is_empty()
        });
        patterns.retain(|hash, _| occurrences.contains_key(hash));
        debug!(
            "Pattern detector tracking {} query shapes, {} active patterns",
            occurrences.len(),
            patterns.len()
        );
    }

    pub fn clear(&self) {
        let mut state = self.state();
        state.occurrences.clear();
        state.patterns.clear();
    }
}
