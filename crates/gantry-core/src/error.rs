//! Error types for pipeline orchestration

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Authentication rejected by {host}")]
    AuthFailure { host: String },

    #[error("Network failure reaching {host}: {detail}")]
    NetworkFailure { host: String, detail: String },

    #[error("Stage '{stage}' command failed with exit code {exit_code}")]
    CommandFailure { stage: String, exit_code: i32 },

    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("Log source missing: {0}")]
    SourceMissing(String),

    #[error("Invalid run state transition: {current} -> {requested}")]
    InvalidStateTransition { current: String, requested: String },

    #[error("Result out of order: expected ordinal {expected}, got {got}")]
    ResultOutOfOrder { expected: usize, got: usize },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;
