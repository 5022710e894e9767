use super::QueryExecution;
use crate::config::SharedConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, warn};

/// Key of the single global trend series
pub const OVERALL_SERIES: &str = "overall";

/// Counts and averages for one table or one operation type
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BreakdownStats {
    pub query_count: usize,
    pub error_count: usize,
    pub avg_duration: Duration,
    pub error_rate: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PerformanceMetrics {
    pub total_queries: usize,
    pub successful_queries: usize,
    pub failed_queries: usize,
    pub error_rate: f64,
    pub slow_queries: usize,
    pub avg_duration: Duration,
    pub max_duration: Duration,
    pub p95_duration: Duration,
    pub p99_duration: Duration,
    pub table_stats: BTreeMap<String, BreakdownStats>,
    pub operation_stats: BTreeMap<String, BreakdownStats>,
}

impl PerformanceMetrics {
    pub fn slow_query_rate(&self) -> f64 {
        if self.total_queries == 0 {
            0.0
        } else {
            self.slow_queries as f64 / self.total_queries as f64
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrendPoint {
    pub timestamp: DateTime<Utc>,
    pub avg_duration: Duration,
    pub error_rate: f64,
    pub slow_query_rate: f64,
}

/// Value at exact rank `ceil(p * n) - 1` of an ascending list
pub fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let rank = (p * sorted.len() as f64).ceil() as usize;
    let index = rank.saturating_sub(1).min(sorted.len() - 1);
    sorted[index]
}

fn mean(durations: &[Duration]) -> Duration {
    if durations.is_empty() {
        return Duration::ZERO;
    }
    durations.iter().sum::<Duration>() / durations.len() as u32
}

#[derive(Default)]
struct Accumulator {
    count: usize,
    errors: usize,
    durations: Vec<Duration>,
}

impl Accumulator {
    fn push(&mut self, execution: &QueryExecution) {
        self.count += 1;
        if execution.is_failure() {
            self.errors += 1;
        }
        if let Some(d) = execution.duration {
            self.durations.push(d);
        }
    }

    fn stats(&self) -> BreakdownStats {
        BreakdownStats {
            query_count: self.count,
            error_count: self.errors,
            avg_duration: mean(&self.durations),
            error_rate: if self.count == 0 {
                0.0
            } else {
                self.errors as f64 / self.count as f64
            },
        }
    }
}

/// Aggregated statistics and trend-based degradation detection
#[derive(Debug)]
pub struct PerformanceAnalytics {
    config: SharedConfig,
    trends: RwLock<HashMap<String, VecDeque<TrendPoint>>>,
}

impl PerformanceAnalytics {
    pub fn new(config: SharedConfig) -> Self {
        Self {
            config,
            trends: RwLock::new(HashMap::new()),
        }
    }

    /// Aggregate finished executions; unfinished ones are ignored
    pub fn calculate_metrics(&self, executions: &[QueryExecution]) -> PerformanceMetrics {
        let slow_threshold = self.config.current().slow_query_threshold;

        let finished: Vec<&QueryExecution> =
            executions.iter().filter(|e| e.is_finished()).collect();
        let total = finished.len();
        if total == 0 {
            return PerformanceMetrics::default();
        }

        let failed = finished.iter().filter(|e| e.is_failure()).count();
        let slow = finished
            .iter()
            .filter(|e| e.duration.map(|d| d > slow_threshold).unwrap_or(false))
            .count();

        let mut durations: Vec<Duration> = finished.iter().filter_map(|e| e.duration).collect();
        durations.sort();

        let mut tables: BTreeMap<String, Accumulator> = BTreeMap::new();
        let mut operations: BTreeMap<String, Accumulator> = BTreeMap::new();
        for execution in &finished {
            tables
                .entry(execution.table_label().to_string())
                .or_default()
                .push(execution);
            operations
                .entry(execution.query_type.as_str().to_string())
                .or_default()
                .push(execution);
        }

        PerformanceMetrics {
            total_queries: total,
            successful_queries: total - failed,
            failed_queries: failed,
            error_rate: failed as f64 / total as f64,
            slow_queries: slow,
            avg_duration: mean(&durations),
            max_duration: durations.last().copied().unwrap_or_default(),
            p95_duration: percentile(&durations, 0.95),
            p99_duration: percentile(&durations, 0.99),
            table_stats: tables.into_iter().map(|(k, v)| (k, v.stats())).collect(),
            operation_stats: operations.into_iter().map(|(k, v)| (k, v.stats())).collect(),
        }
    }

    pub fn update_trending_data(&self, metrics: &PerformanceMetrics) {
        self.update_trending_data_at(metrics, Utc::now());
    }

    /// Append a trend point stamped `timestamp` to the overall series
    pub fn update_trending_data_at(&self, metrics: &PerformanceMetrics, timestamp: DateTime<Utc>) {
        let max_points = self.config.current().max_trend_points;
        let point = TrendPoint {
            timestamp,
            avg_duration: metrics.avg_duration,
            error_rate: metrics.error_rate,
            slow_query_rate: metrics.slow_query_rate(),
        };

        if let Ok(mut trends) = self.trends.write() {
            let series = trends.entry(OVERALL_SERIES.to_string()).or_default();
            series.push_back(point);
            while series.len() > max_points {
                series.pop_front();
            }
        }
    }

    pub fn trend(&self) -> Vec<TrendPoint> {
        self.trends
            .read()
            .ok()
            .and_then(|trends| trends.get(OVERALL_SERIES).map(|s| s.iter().cloned().collect()))
            .unwrap_or_default()
    }

    /// Whether `current.avg_duration` exceeds the trailing baseline mean by
    /// more than the configured ratio. Insufficient baseline data is never
    /// treated as degradation.
    pub fn detect_performance_degradation(&self, current: &PerformanceMetrics) -> bool {
        let config = self.config.current();
        let cutoff = chrono::Duration::from_std(config.baseline_window)
            .map(|window| Utc::now() - window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let baseline: Vec<Duration> = self
            .trend()
            .into_iter()
            .filter(|p| p.timestamp >= cutoff)
            .map(|p| p.avg_duration)
            .collect();

        if baseline.len() < config.min_baseline_points {
            debug!(
                "Not enough baseline points for degradation check ({} < {})",
                baseline.len(),
                config.min_baseline_points
            );
            return false;
        }

        let baseline_avg = mean(&baseline).as_secs_f64();
        if baseline_avg <= 0.0 {
            return false;
        }

        let increase = (current.avg_duration.as_secs_f64() - baseline_avg) / baseline_avg;
        let degraded = increase > config.degradation_ratio;
        if degraded {
            warn!(
                "Performance degradation: avg {:?} is {:.0}% above baseline {:.3}s",
                current.avg_duration,
                increase * 100.0,
                baseline_avg
            );
        }
        degraded
    }

    pub fn clear(&self) {
        if let Ok(mut trends) = self.trends.write() {
            trends.clear();
        }
    }
}
