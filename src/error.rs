use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    #[error("Invalid query thresholds: slow ({slow:?}) < very slow ({very_slow:?}) < critical ({critical:?}) must hold")]
    InvalidThresholds {
        slow: std::time::Duration,
        very_slow: std::time::Duration,
        critical: std::time::Duration,
    },

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Pattern compilation error: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Data service error: {0}")]
    DataService(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MonitorError {
    pub fn config(message: impl Into<String>) -> Self {
        MonitorError::InvalidConfiguration {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MonitorError>;
