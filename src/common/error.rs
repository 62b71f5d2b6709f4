//! Error types for chronocoord

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Repository Errors ===
    #[error("Key not exist: {0}")]
    NotExist(String),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Repository closed")]
    RepositoryClosed,

    #[error("Someone else changed key: {0}")]
    ConcurrentModification(String),

    #[error("Too many operations in transaction: {count}, max {max}")]
    TooManyTxnOps { count: usize, max: usize },

    // === Placement Errors ===
    #[error("Invalid number of shards: {0}")]
    InvalidShardCount(i64),

    #[error("Invalid replica factor: {0}")]
    InvalidReplicaFactor(i64),

    #[error("Insufficient nodes: need {needed}, have {available}")]
    InsufficientNodes { needed: usize, available: usize },

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    // === Task Errors ===
    #[error("Task name already exists: {0}")]
    TaskNameExists(String),

    #[error("Too many tasks: {count}, max {max}")]
    TooManyTasks { count: usize, max: usize },

    #[error("Unsupported task kind: {0}")]
    UnsupportedTaskKind(String),

    // === Serialization Errors ===
    #[error("Serde error: {0}")]
    Serde(#[from] serde_json::Error),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Lifecycle Errors ===
    #[error("Closed: {0}")]
    Closed(String),

    #[error("Already attached")]
    AlreadyAttached,

    // === Generic ===
    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Key absent: an expected outcome, not a failure worth an error log.
    pub fn is_not_exist(&self) -> bool {
        matches!(self, Error::NotExist(_))
    }

    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Repository(_) | Error::Timeout(_) | Error::ConcurrentModification(_)
        )
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

impl From<::config::ConfigError> for Error {
    fn from(e: ::config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}
