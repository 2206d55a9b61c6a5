//! Error types for the watch session.

use thiserror::Error;

/// Result type alias for watch session operations.
pub type Result<T> = std::result::Result<T, WatcherError>;

/// Errors returned synchronously to the caller.
///
/// Runtime problems after a session is open (overflow, handler faults,
/// backend errors) are never returned here; they travel through the
/// session's error stream as [`crate::WatchFault`].
#[derive(Error, Debug)]
pub enum WatcherError {
    /// Root path is missing or is not a directory.
    #[error("invalid watch path: {0}")]
    InvalidPath(String),

    /// Operation attempted after the session was closed.
    #[error("watch session is closed")]
    SessionClosed,

    /// Configuration value out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Notify error.
    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed.
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}
