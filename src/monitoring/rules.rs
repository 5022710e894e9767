use super::alerts::{connection_failure_draft, error_rate_draft, AlertDraft};
use super::{AlertSeverity, AlertType, PerformanceMetrics, QueryExecution};
use crate::config::MonitoringConfig;
use crate::error::Result;
use regex::Regex;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// State gathered by one security sweep
#[derive(Debug, Clone, Default)]
pub struct SweepSnapshot {
    /// Look-back window the metrics were computed over
    pub window: Duration,
    pub metrics: PerformanceMetrics,
    pub slow_queries: usize,
    pub connection_failures: u32,
    /// Queries finished since the previous sweep
    pub new_queries: Vec<QueryExecution>,
    /// Queries finished in the last minute
    pub recent_minute: Vec<QueryExecution>,
    pub degraded: bool,
}

/// SQL-injection signatures matched against recorded query text
#[derive(Debug, Clone)]
pub struct InjectionSignatures {
    patterns: Vec<Regex>,
}

impl InjectionSignatures {
    pub fn new() -> Result<Self> {
        let sources = [
            r"(?i)union\s+(all\s+)?select",
            r"(?i)'\s*or\s*'[^']*'\s*=\s*'",
            r"(?i)'\s*or\s*1\s*=\s*1",
            r"(?i)'\s*;\s*drop",
            r"(?i);\s*(drop|delete|truncate)\s",
            r"(?i)'\s*--",
            r"(?i)xp_cmdshell",
            r"(?i)sp_executesql",
        ];

        let patterns = sources
            .iter()
            .map(|source| Regex::new(source))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// The first signature the text matches
    pub fn matches(&self, text: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|p| p.is_match(text))
            .map(|p| p.as_str())
    }
}

pub struct RuleContext<'a> {
    pub snapshot: &'a SweepSnapshot,
    pub config: &'a MonitoringConfig,
    pub signatures: &'a InjectionSignatures,
}

/// One row of the rule table: a named predicate that may produce an alert
#[derive(Clone, Copy)]
pub struct SecurityRule {
    pub name: &'static str,
    pub evaluate: fn(&RuleContext<'_>) -> Option<AlertDraft>,
}

impl std::fmt::Debug for SecurityRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityRule").field("name", &self.name).finish()
    }
}

pub const SECURITY_RULES: &[SecurityRule] = &[
    SecurityRule {
        name: "high_error_rate",
        evaluate: high_error_rate,
    },
    SecurityRule {
        name: "slow_query_burst",
        evaluate: slow_query_burst,
    },
    SecurityRule {
        name: "connection_failures",
        evaluate: connection_failures,
    },
    SecurityRule {
        name: "suspicious_queries",
        evaluate: suspicious_queries,
    },
    SecurityRule {
        name: "rate_limit_exceeded",
        evaluate: rate_limit_exceeded,
    },
    SecurityRule {
        name: "performance_degradation",
        evaluate: performance_degradation,
    },
];

fn high_error_rate(ctx: &RuleContext<'_>) -> Option<AlertDraft> {
    error_rate_draft(&ctx.snapshot.metrics, ctx.config.error_rate_threshold)
}

fn slow_query_burst(ctx: &RuleContext<'_>) -> Option<AlertDraft> {
    let count = ctx.snapshot.slow_queries;
    if count < ctx.config.slow_query_burst_threshold {
        return None;
    }
    Some(
        AlertDraft::new(
            AlertType::SlowQuery,
            AlertSeverity::Warning,
            format!(
                "{} slow queries in the last {:?}",
                count, ctx.snapshot.window
            ),
        )
        .with_details(json!({
            "slow_queries": count,
            "threshold": ctx.config.slow_query_burst_threshold,
            "window_secs": ctx.snapshot.window.as_secs_f64(),
        })),
    )
}

fn connection_failures(ctx: &RuleContext<'_>) -> Option<AlertDraft> {
    connection_failure_draft(
        ctx.snapshot.connection_failures,
        ctx.config.connection_failure_threshold,
    )
}

fn suspicious_queries(ctx: &RuleContext<'_>) -> Option<AlertDraft> {
    let hits: Vec<serde_json::Value> = ctx
        .snapshot
        .new_queries
        .iter()
        .filter_map(|execution| {
            let text = execution.query_text.as_deref()?;
            let signature = ctx.signatures.matches(text)?;
            Some(json!({
                "query_id": execution.query_id,
                "user_id": execution.user_id,
                "table_name": execution.table_name,
                "signature": signature,
            }))
        })
        .collect();

    if hits.is_empty() {
        return None;
    }
    Some(
        AlertDraft::new(
            AlertType::SuspiciousQuery,
            AlertSeverity::Warning,
            format!("{} queries matched SQL injection signatures", hits.len()),
        )
        .with_details(json!({ "queries": hits })),
    )
}

fn rate_limit_exceeded(ctx: &RuleContext<'_>) -> Option<AlertDraft> {
    let mut per_user: BTreeMap<&str, usize> = BTreeMap::new();
    for execution in &ctx.snapshot.recent_minute {
        if let Some(user) = execution.user_id.as_deref() {
            *per_user.entry(user).or_default() += 1;
        }
    }

    let limit = ctx.config.max_queries_per_minute;
    let offenders: BTreeMap<&str, usize> = per_user
        .into_iter()
        .filter(|(_, count)| *count > limit)
        .collect();
    if offenders.is_empty() {
        return None;
    }

    Some(
        AlertDraft::new(
            AlertType::RateLimitExceeded,
            AlertSeverity::Warning,
            format!(
                "{} users exceeded {} queries per minute",
                offenders.len(),
                limit
            ),
        )
        .with_details(json!({ "users": offenders, "limit": limit })),
    )
}

fn performance_degradation(ctx: &RuleContext<'_>) -> Option<AlertDraft> {
    if !ctx.snapshot.degraded {
        return None;
    }
    let avg_ms = ctx.snapshot.metrics.avg_duration.as_secs_f64() * 1000.0;
    Some(
        AlertDraft::new(
            AlertType::PerformanceDegradation,
            AlertSeverity::Warning,
            format!("Average query duration {avg_ms:.1}ms is above the trailing baseline"),
        )
        .with_details(json!({
            "avg_duration_ms": avg_ms,
            "degradation_ratio": ctx.config.degradation_ratio,
        })),
    )
}

/// Evaluates the rule table against a sweep snapshot
#[derive(Debug, Clone)]
pub struct RuleEngine {
    signatures: InjectionSignatures,
    rules: Vec<SecurityRule>,
}

impl RuleEngine {
    pub fn new() -> Result<Self> {
        Ok(Self {
            signatures: InjectionSignatures::new()?,
            rules: SECURITY_RULES.to_vec(),
        })
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name).collect()
    }

    /// Drafts produced by each rule, in table order
    pub fn evaluate(
        &self,
        snapshot: &SweepSnapshot,
        config: &MonitoringConfig,
    ) -> Vec<(&'static str, AlertDraft)> {
        let ctx = RuleContext {
            snapshot,
            config,
            signatures: &self.signatures,
        };

        self.rules
            .iter()
            .filter_map(|rule| {
                let draft = (rule.evaluate)(&ctx)?;
                debug!(rule = rule.name, "Security rule fired");
                Some((rule.name, draft))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SharedConfig;
    use crate::monitoring::{QueryExecutionTracker, QueryRequest, QueryStatus, QueryType};

    fn executions(texts: &[(&str, Option<&str>)]) -> Vec<QueryExecution> {
        let tracker =
            QueryExecutionTracker::new(SharedConfig::new(MonitoringConfig::default())).unwrap();
        texts
            .iter()
            .map(|(text, user)| {
                let mut request = QueryRequest::new(QueryType::RawSql).text(*text);
                if let Some(user) = user {
                    request = request.user(*user);
                }
                let handle = tracker.start_query(request).unwrap();
                tracker
                    .finish_query(&handle, QueryStatus::Success, None, None)
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_signatures() {
        let signatures = InjectionSignatures::new().unwrap();
        assert!(signatures
            .matches("SELECT * FROM users WHERE id = 1 UNION SELECT password FROM admins")
            .is_some());
        assert!(signatures
            .matches("SELECT * FROM users WHERE name = '' OR 1=1")
            .is_some());
        assert!(signatures.matches("SELECT 1; DROP TABLE trips").is_some());
        assert!(signatures
            .matches("DELETE FROM sessions WHERE expires_at < now()")
            .is_none());
        assert!(signatures
            .matches("SELECT * FROM trips WHERE owner = $1")
            .is_none());
    }

    #[test]
    fn test_quiet_snapshot_fires_nothing() {
        let engine = RuleEngine::new().unwrap();
        let config = MonitoringConfig::default();
        assert!(engine
            .evaluate(&SweepSnapshot::default(), &config)
            .is_empty());
        assert_eq!(engine.rule_names().len(), 6);
    }

    #[test]
    fn test_rules_fire_in_table_order() {
        let engine = RuleEngine::new().unwrap();
        let config = MonitoringConfig::builder()
            .max_queries_per_minute(2)
            .build()
            .unwrap();

        let new_queries = executions(&[
            ("SELECT * FROM trips WHERE id = 1", Some("alice")),
            ("SELECT * FROM users WHERE name = '' OR 1=1", Some("alice")),
            ("SELECT * FROM trips WHERE id = 2", Some("alice")),
        ]);

        let snapshot = SweepSnapshot {
            window: Duration::from_secs(300),
            metrics: PerformanceMetrics {
                total_queries: 10,
                failed_queries: 10,
                error_rate: 1.0,
                ..Default::default()
            },
            slow_queries: 12,
            connection_failures: 3,
            recent_minute: new_queries.clone(),
            new_queries,
            degraded: true,
        };

        let fired = engine.evaluate(&snapshot, &config);
        let names: Vec<&str> = fired.iter().map(|(name, _)| *name).collect();
        assert_eq!(
            names,
            vec![
                "high_error_rate",
                "slow_query_burst",
                "connection_failures",
                "suspicious_queries",
                "rate_limit_exceeded",
                "performance_degradation",
            ]
        );

        assert_eq!(fired[0].1.severity, AlertSeverity::Critical);
        assert_eq!(fired[2].1.severity, AlertSeverity::Error);
        assert_eq!(fired[3].1.details["queries"].as_array().unwrap().len(), 1);
        assert_eq!(fired[4].1.details["users"]["alice"], 3);
    }
}
