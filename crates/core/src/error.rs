//! Error types for objsync-core
//!
//! Backend failures, configuration problems and cancellation are kept in
//! separate variants so callers can tell "gave up" from "backend rejected".

use thiserror::Error;

/// Result type alias for objsync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for objsync operations
#[derive(Debug, Error)]
pub enum Error {
    /// Transport-level failure talking to the backend
    #[error("Network error: {0}")]
    Network(String),

    /// Credentials rejected or access denied
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Bucket or object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Alias lookup failed
    #[error("Alias not found: {0}")]
    AliasNotFound(String),

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Path could not be parsed
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Operation called in a state that does not permit it
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Multipart upload protocol failure
    #[error("Multipart upload error: {0}")]
    Multipart(String),

    /// Local I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// The operation ran past its deadline
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// Anything else
    #[error("{0}")]
    General(String),
}

impl Error {
    /// True for `Cancelled` and `DeadlineExceeded`
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::DeadlineExceeded)
    }

    /// Short machine-readable code for output and logs
    pub fn code(&self) -> &'static str {
        match self {
            Error::Network(_) => "network",
            Error::Auth(_) => "auth",
            Error::NotFound(_) | Error::AliasNotFound(_) => "not_found",
            Error::Config(_) => "config",
            Error::InvalidPath(_) => "invalid_path",
            Error::InvalidState(_) => "invalid_state",
            Error::Multipart(_) => "multipart",
            Error::Io(_) => "io",
            Error::Cancelled => "cancelled",
            Error::DeadlineExceeded => "deadline_exceeded",
            Error::General(_) => "general",
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(e: toml::ser::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            Error::Cancelled
        } else {
            Error::General(format!("worker task failed: {e}"))
        }
    }
}
