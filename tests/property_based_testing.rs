//! Property-based tests for the monitoring invariants
//!
//! These use proptest to check history bounds, duration bookkeeping, slow
//! query tiering, N+1 thresholds, and error-rate arithmetic under randomly
//! generated inputs.

use db_monitor::monitoring::{
    slow_query_severity, PerformanceAnalytics, QueryExecution, QueryExecutionTracker,
    QueryPatternDetector, QueryRequest, QueryStatus, QueryType,
};
use db_monitor::{AlertSeverity, MonitoringConfig, SharedConfig};
use proptest::prelude::*;
use std::time::{Duration, Instant};

fn shared(config: MonitoringConfig) -> SharedConfig {
    SharedConfig::new(config)
}

fn run_query(tracker: &QueryExecutionTracker, request: QueryRequest, status: QueryStatus) -> QueryExecution {
    let handle = tracker.start_query(request).expect("tracking enabled");
    tracker
        .finish_query(&handle, status, None, None)
        .expect("query was active")
}

prop_compose! {
    fn arb_query_type()(index in 0usize..10) -> QueryType {
        [
            QueryType::Select,
            QueryType::Insert,
            QueryType::Update,
            QueryType::Delete,
            QueryType::Upsert,
            QueryType::VectorSearch,
            QueryType::Count,
            QueryType::Transaction,
            QueryType::FunctionCall,
            QueryType::RawSql,
        ][index]
    }
}

prop_compose! {
    fn arb_status()(index in 0usize..4) -> QueryStatus {
        [
            QueryStatus::Success,
            QueryStatus::Error,
            QueryStatus::Timeout,
            QueryStatus::Cancelled,
        ][index]
    }
}

proptest! {
    /// History never exceeds its capacity and keeps the newest completions
    #[test]
    fn history_is_bounded(total in 1usize..80, capacity in 1usize..25) {
        let config = MonitoringConfig::builder().max_query_history(capacity).build().unwrap();
        let tracker = QueryExecutionTracker::new(shared(config)).unwrap();

        for i in 0..total {
            run_query(
                &tracker,
                QueryRequest::new(QueryType::Select).tag("n", i.to_string()),
                QueryStatus::Success,
            );
        }

        let history = tracker.get_query_history(None);
        prop_assert_eq!(history.len(), total.min(capacity));

        let expected: Vec<String> = (total.saturating_sub(capacity)..total)
            .map(|i| i.to_string())
            .collect();
        let actual: Vec<String> = history.iter().map(|e| e.tags["n"].clone()).collect();
        prop_assert_eq!(actual, expected);
    }

    /// Durations are computed once at finish from the recorded instants
    #[test]
    fn duration_matches_instants(query_type in arb_query_type(), status in arb_status()) {
        let tracker = QueryExecutionTracker::new(shared(MonitoringConfig::default())).unwrap();
        let execution = run_query(&tracker, QueryRequest::new(query_type).table("trips"), status);

        let end = execution.end_time.unwrap();
        prop_assert!(end >= execution.start_time);
        prop_assert_eq!(execution.duration, Some(end - execution.start_time));
        prop_assert_eq!(execution.status, Some(status));
    }

    /// Slow-query tiers never decrease as duration grows
    #[test]
    fn slow_query_tiers_are_monotonic(a in 0u64..20_000, b in 0u64..20_000) {
        let config = MonitoringConfig::default();
        let (short, long) = if a <= b { (a, b) } else { (b, a) };

        let short_tier = slow_query_severity(Duration::from_millis(short), &config);
        let long_tier = slow_query_severity(Duration::from_millis(long), &config);

        prop_assert!(short_tier <= long_tier);
        if short_tier == Some(AlertSeverity::Critical) {
            prop_assert_eq!(long_tier, Some(AlertSeverity::Critical));
        }
    }

    /// Exactly T identical queries inside the window produce one pattern
    #[test]
    fn n_plus_one_threshold(threshold in 2usize..20, id_seed in 0u32..1000) {
        let config = shared(
            MonitoringConfig::builder()
                .n_plus_one(threshold, Duration::from_secs(10))
                .build()
                .unwrap(),
        );
        let tracker = QueryExecutionTracker::new(config.clone()).unwrap();

        let below = QueryPatternDetector::new(config.clone());
        let at = QueryPatternDetector::new(config);
        let now = Instant::now();

        for i in 0..threshold {
            let execution = run_query(
                &tracker,
                QueryRequest::new(QueryType::Select)
                    .table("comments")
                    .text(format!("SELECT * FROM comments WHERE post_id = {}", id_seed + i as u32)),
                QueryStatus::Success,
            );
            if i + 1 < threshold {
                below.analyze_at(&execution, now);
            }
            at.analyze_at(&execution, now);
        }

        prop_assert!(below.get_patterns().is_empty());
        let patterns = at.get_patterns();
        prop_assert_eq!(patterns.len(), 1);
        prop_assert!(patterns[0].occurrence_count >= threshold);
    }

    /// error_rate is exactly failed / total
    #[test]
    fn error_rate_is_exact(total in 0usize..60, failed_seed in 0usize..60) {
        let failed = if total == 0 { 0 } else { failed_seed % (total + 1) };
        let config = shared(MonitoringConfig::default());
        let tracker = QueryExecutionTracker::new(config.clone()).unwrap();
        let analytics = PerformanceAnalytics::new(config);

        let executions: Vec<QueryExecution> = (0..total)
            .map(|i| {
                let status = if i < failed { QueryStatus::Error } else { QueryStatus::Success };
                run_query(&tracker, QueryRequest::new(QueryType::Insert).table("trips"), status)
            })
            .collect();

        let metrics = analytics.calculate_metrics(&executions);
        prop_assert_eq!(metrics.total_queries, total);
        prop_assert_eq!(metrics.failed_queries, failed);
        if total == 0 {
            prop_assert_eq!(metrics.error_rate, 0.0);
        } else {
            prop_assert_eq!(metrics.error_rate, failed as f64 / total as f64);
        }
    }
}
