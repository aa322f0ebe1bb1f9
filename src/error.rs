use thiserror::Error;

/// Main error type for AutoDelete
#[derive(Error, Debug)]
pub enum AutodeleteError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid retention policy for channel {channel_id}: {reason}")]
    InvalidPolicy { channel_id: String, reason: String },

    #[error("Platform error: {0}")]
    PlatformError(String),

    #[error("Worker for channel {0} has stopped")]
    WorkerGone(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Convenience Result type
pub type Result<T> = std::result::Result<T, AutodeleteError>;
