use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use db_monitor::monitoring::{
    AlertSeverity, ConsolidatedMonitor, DataService, MockDataService, PostgresDataService,
    QueryRequest, QueryType,
};
use db_monitor::MonitoringConfig;
use rand::Rng;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "db-monitor")]
#[command(about = "Database health, query performance, and security monitoring")]
#[command(version)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Monitor a PostgreSQL database until interrupted
    Watch {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
        #[arg(long, default_value_t = 5)]
        max_connections: u32,
        /// Seconds between status reports
        #[arg(long, default_value_t = 60)]
        status_interval: u64,
    },
    /// Run one health and security check and print the result as JSON
    Check {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
        #[arg(long, default_value_t = 2)]
        max_connections: u32,
    },
    /// Drive the monitor with synthetic traffic against an in-memory service
    Simulate {
        /// Number of synthetic queries
        #[arg(long, default_value_t = 200)]
        queries: usize,
        /// Fraction of queries that fail (0.0 - 1.0)
        #[arg(long, default_value_t = 0.05, value_parser = parse_fraction)]
        failure_rate: f64,
        /// Emit a burst of identical per-row lookups
        #[arg(long)]
        n_plus_one: bool,
        /// Print the Prometheus exposition after the run
        #[arg(long)]
        metrics: bool,
    },
    /// Print the effective configuration from the environment
    Config,
}

fn parse_fraction(raw: &str) -> std::result::Result<f64, String> {
    let value: f64 = raw
        .trim()
        .parse()
        .map_err(|e| format!("`{raw}` is not a number: {e}"))?;
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(format!("`{raw}` is not between 0.0 and 1.0"))
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    match cli.command {
        Commands::Watch {
            database_url,
            max_connections,
            status_interval,
        } => watch(&database_url, max_connections, status_interval).await,
        Commands::Check {
            database_url,
            max_connections,
        } => check(&database_url, max_connections).await,
        Commands::Simulate {
            queries,
            failure_rate,
            n_plus_one,
            metrics,
        } => simulate(queries, failure_rate, n_plus_one, metrics).await,
        Commands::Config => {
            let config = MonitoringConfig::from_env()?;
            println!("{}", config.diagnostic_report());
            Ok(())
        }
    }
}

async fn postgres(database_url: &str, max_connections: u32) -> Arc<PostgresDataService> {
    let service = Arc::new(PostgresDataService::new(database_url, max_connections));
    // Start monitoring even when the first connect fails; recovery retries it
    if let Err(e) = service.connect().await {
        warn!("Initial database connection failed: {}", e);
    }
    service
}

async fn watch(database_url: &str, max_connections: u32, status_interval: u64) -> Result<()> {
    let config = MonitoringConfig::from_env()?;
    let service = postgres(database_url, max_connections).await;
    let monitor = ConsolidatedMonitor::new(service, config)?;

    monitor.add_alert_callback(Arc::new(|alert: &db_monitor::Alert| -> Result<()> {
        if alert.severity >= AlertSeverity::Error {
            println!("{}", serde_json::to_string(alert)?);
        }
        Ok(())
    }));

    monitor.start_monitoring();
    let mut report = tokio::time::interval(Duration::from_secs(status_interval.max(1)));
    report.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, shutting down");
                break;
            }
            _ = report.tick() => {
                let status = monitor.get_monitoring_status();
                match serde_json::to_string(&status) {
                    Ok(line) => info!(status = %line, "Monitoring status"),
                    Err(e) => error!("Failed to serialize monitoring status: {}", e),
                }
            }
        }
    }

    monitor.stop_monitoring().await;
    Ok(())
}

async fn check(database_url: &str, max_connections: u32) -> Result<()> {
    let config = MonitoringConfig::builder()
        .recovery(false, 1, Duration::from_secs(1))
        .build()?;
    let service = postgres(database_url, max_connections).await;
    let monitor = ConsolidatedMonitor::new(service.clone(), config)?;

    let health = monitor.manual_health_check().await;
    let alerts = monitor.manual_security_check().await;

    let output = json!({
        "health": health,
        "alerts": alerts,
        "active_connections": service.active_connections(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    service.close().await?;
    Ok(())
}

struct SyntheticQuery {
    request: QueryRequest,
    latency: Duration,
    fails: bool,
}

fn synthetic_plan(count: usize, failure_rate: f64, n_plus_one: bool) -> Vec<SyntheticQuery> {
    let mut rng = rand::thread_rng();
    let tables = ["trips", "users", "itineraries", "comments"];
    let mut plan = Vec::with_capacity(count);

    for i in 0..count {
        let table = tables[rng.gen_range(0..tables.len())];
        let query_type = match rng.gen_range(0..10) {
            0..=5 => QueryType::Select,
            6 | 7 => QueryType::Insert,
            8 => QueryType::Update,
            _ => QueryType::Delete,
        };
        plan.push(SyntheticQuery {
            request: QueryRequest::new(query_type)
                .table(table)
                .text(format!("{} FROM {table} WHERE id = {i}", query_type.as_str()))
                .user(format!("user-{}", rng.gen_range(0..5))),
            latency: Duration::from_millis(rng.gen_range(1..30)),
            fails: rng.gen_bool(failure_rate),
        });
    }

    if n_plus_one {
        for post_id in 0..25 {
            plan.push(SyntheticQuery {
                request: QueryRequest::new(QueryType::Select)
                    .table("comments")
                    .text(format!("SELECT * FROM comments WHERE post_id = {post_id}")),
                latency: Duration::from_millis(2),
                fails: false,
            });
        }
    }

    plan
}

async fn simulate(count: usize, failure_rate: f64, n_plus_one: bool, metrics: bool) -> Result<()> {
    let config = MonitoringConfig::builder()
        .health_check_interval(Duration::from_millis(250))
        .security_check_interval(Duration::from_secs(1))
        .slow_query_threshold(Duration::from_millis(25))
        .build()?;

    let service = Arc::new(MockDataService::new().named("simulated"));
    let monitor = ConsolidatedMonitor::new(service.clone(), config)?;
    let data = monitor.instrument(service);
    monitor.start_monitoring();

    let plan = synthetic_plan(count, failure_rate, n_plus_one);
    let tasks = plan.into_iter().map(|query| {
        let data = data.clone();
        let SyntheticQuery {
            request,
            latency,
            fails,
        } = query;
        async move {
            let rows = data
                .track_with_rows(
                    request,
                    async move {
                        tokio::time::sleep(latency).await;
                        if fails {
                            Err(anyhow::anyhow!("simulated failure"))
                        } else {
                            Ok(1u64)
                        }
                    },
                    |rows| Some(*rows),
                )
                .await;
            rows.is_ok()
        }
    });
    let succeeded = futures::future::join_all(tasks)
        .await
        .into_iter()
        .filter(|ok| *ok)
        .count();
    info!("Synthetic traffic finished: {} succeeded", succeeded);

    monitor.manual_health_check().await;
    monitor.manual_security_check().await;
    monitor.stop_monitoring().await;

    let output = json!({
        "status": monitor.get_monitoring_status(),
        "performance": monitor.get_performance_metrics(),
        "patterns": monitor.get_query_patterns(),
        "security_alerts": monitor.get_security_alerts(Some(20)),
        "performance_alerts": monitor.get_performance_alerts(Some(20)),
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&output).context("serializing simulation report")?
    );

    if metrics {
        println!("{}", monitor.gather_metrics());
    }
    Ok(())
}
