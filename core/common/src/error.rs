//! Common error types for fieldsync.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classified geolocation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationErrorKind {
    /// The agent (or the platform) refused location access.
    PermissionDenied,
    /// No fix could be obtained.
    Unavailable,
    /// The request did not complete within its timeout.
    Timeout,
    /// Anything the platform could not classify.
    Unknown,
}

impl LocationErrorKind {
    /// Short, actionable message shown to the agent.
    pub fn message(&self) -> &'static str {
        match self {
            Self::PermissionDenied => {
                "Location permission denied. Please enable location access."
            }
            Self::Unavailable => {
                "Location information unavailable. Please check your GPS settings."
            }
            Self::Timeout => "Location request timed out. Please try again.",
            Self::Unknown => "An unknown error occurred.",
        }
    }
}

impl std::fmt::Display for LocationErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

/// Top-level error type for fieldsync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Transient remote failure (network error, ledger timeout).
    #[error("Network error: {0}")]
    Network(String),

    /// The remote ledger rejected the request.
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// The device is offline and the call was not attempted.
    #[error("Offline: {0}")]
    Offline(String),

    /// Durable local store operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Another transition for the same activity is still in flight.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Geolocation failed.
    #[error("{0}")]
    Location(LocationErrorKind),

    /// Image decode or re-encode failed.
    #[error("Compression error: {0}")]
    Compression(String),
}

impl Error {
    /// Whether a later attempt may succeed without any change from the agent.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::Offline(_) | Error::Io(_) | Error::Storage(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
