//! Error types for Posse

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PosseError>;

#[derive(Error, Debug)]
pub enum PosseError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl PosseError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            PosseError::InvalidInput(_) => 3,
            PosseError::Platform(PlatformError::Authentication(_)) => 2,
            PosseError::Dispatch(DispatchError::Platform(PlatformError::Authentication(_))) => 2,
            PosseError::Platform(_) => 1,
            PosseError::Dispatch(_) => 1,
            PosseError::Config(_) => 1,
            PosseError::Ledger(_) => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse YAML config: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse TOML config: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize ledger: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to replace ledger file: {0}")]
    Persist(#[from] tempfile::PersistError),

    #[error("Ledger write task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Failure raised by a platform collaborator
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlatformError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Content validation failed: {0}")]
    Validation(String),

    #[error("Posting failed: {0}")]
    Posting(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),
}

/// Discriminant of [`PlatformError`], used to configure which failures are retried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformErrorKind {
    Authentication,
    Validation,
    Posting,
    Network,
    RateLimit,
}

impl PlatformError {
    pub fn kind(&self) -> PlatformErrorKind {
        match self {
            PlatformError::Authentication(_) => PlatformErrorKind::Authentication,
            PlatformError::Validation(_) => PlatformErrorKind::Validation,
            PlatformError::Posting(_) => PlatformErrorKind::Posting,
            PlatformError::Network(_) => PlatformErrorKind::Network,
            PlatformError::RateLimit(_) => PlatformErrorKind::RateLimit,
        }
    }
}

impl std::fmt::Display for PlatformErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlatformErrorKind::Authentication => write!(f, "authentication"),
            PlatformErrorKind::Validation => write!(f, "validation"),
            PlatformErrorKind::Posting => write!(f, "posting"),
            PlatformErrorKind::Network => write!(f, "network"),
            PlatformErrorKind::RateLimit => write!(f, "rate_limit"),
        }
    }
}

/// Failures produced by the resilience layer around a platform call
///
/// `retry_after` and `reset_at` are offsets on the dispatcher's monotonic clock.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("Rate limit exceeded, retry after {:.1}s", .retry_after.as_secs_f64())]
    RateLimitExceeded { retry_after: Duration },

    #[error("Circuit is OPEN, resets at {:.1}", .reset_at.as_secs_f64())]
    CircuitOpen { reset_at: Duration },

    #[error("Failed after {attempts} attempts: {last_error}")]
    RetryExhausted {
        attempts: u32,
        last_error: PlatformError,
    },

    #[error(transparent)]
    Platform(#[from] PlatformError),
}
