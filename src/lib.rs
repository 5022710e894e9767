pub mod config;
pub mod error;
pub mod monitoring;

pub use config::{MonitoringConfig, MonitoringConfigBuilder, MonitoringUpdate, SharedConfig};
pub use error::{MonitorError, Result};

// Re-export the main monitoring types
pub use monitoring::{
    Alert, AlertCallback, AlertCategory, AlertSeverity, AlertType, AlertingSystem, CallbackId,
    ConsolidatedMonitor, DataService, HealthProbe, HealthSnapshot, HealthStatus, MetricsCollector,
    MockDataService, MonitoredDataService, MonitoringStatus, PerformanceAnalytics,
    PerformanceMetrics, PostgresDataService, QueryExecution, QueryExecutionTracker, QueryHandle,
    QueryPattern, QueryPatternDetector, QueryPerformanceMonitor, QueryRequest, QueryStatus,
    QueryType, RecoveryOrchestrator, RecoveryState,
};
