//! Error types for BlockFetch
//!
//! This module defines error types using thiserror for ergonomic error handling.
//! Errors are grouped by where they surface:
//!
//! ### Caller errors (returned synchronously)
//! - `InvalidArgument` - empty name / url / location on mission creation
//! - `TooManyCandidates` - unique file name search exhausted
//! - `InvalidState` - operation not allowed in the mission's current state
//!
//! ### Mission-fatal errors (recorded on the mission, reported via events)
//! - `ServerUnsupported` - no advertised length, or a range request was not
//!   answered with partial content
//! - `UnexpectedStatusCode` - any other non-success status
//!
//! ### Worker-local errors (retried, never surfaced)
//! - `NetworkError { is_transient: true }` and plain `IoError`s while a block
//!   is being streamed
//!
//! ### Storage errors
//! - `PermissionDenied` - destination not writable during allocation
//! - `DatabaseError`, `SqlxError` - finished-download catalog
//! - `InvalidData`, `SerdeJsonError` - unreadable checkpoint files

use thiserror::Error;

/// Result type alias using [`FetchError`]
pub type Result<T> = std::result::Result<T, FetchError>;

/// Main error type for BlockFetch
#[derive(Error, Debug)]
pub enum FetchError {
    // ===== Caller Errors =====

    /// Mission creation parameter was empty or malformed
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No free "name (n).ext" candidate left in the destination directory
    #[error("Too many existing files named like '{name}' ({attempts} candidates tried)")]
    TooManyCandidates {
        name: String,
        attempts: u32,
    },

    /// Operation is not valid for the mission's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    // ===== Server / Network Errors =====

    /// Server cannot be downloaded from in the way the engine needs
    #[error("Server unsupported for {url}: {reason}")]
    ServerUnsupported {
        url: String,
        reason: String,
    },

    /// Network connectivity error
    #[error("Network error: {message}")]
    NetworkError {
        message: String,
        /// Whether this error might be transient
        is_transient: bool,
    },

    /// Server responded with a status the request did not expect
    #[error("Server responded with unexpected status code: {status_code}")]
    UnexpectedStatusCode {
        status_code: u16,
        url: String,
    },

    // ===== File / Storage Errors =====

    /// Destination is not writable
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Checkpoint or record content is unusable
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Catalog database error
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Configuration file error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    // ===== External Library Errors =====

    /// HTTP client error from reqwest
    #[error("HTTP client error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    /// Database driver error from sqlx
    #[error("Database error: {0}")]
    SqlxError(#[from] sqlx::Error),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl FetchError {
    /// Create an InvalidArgument error with a message
    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        FetchError::InvalidArgument(message.into())
    }

    /// Create a ServerUnsupported error
    pub fn server_unsupported<U: Into<String>, R: Into<String>>(url: U, reason: R) -> Self {
        FetchError::ServerUnsupported {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Create a NetworkError
    pub fn network_error<S: Into<String>>(message: S, is_transient: bool) -> Self {
        FetchError::NetworkError {
            message: message.into(),
            is_transient,
        }
    }

    /// Whether a worker may retry the block after this error
    ///
    /// Returns `true` for transport level failures: dropped connections,
    /// timeouts, short bodies and local write failures. Status code problems
    /// are never retried, the server answered and will answer the same way.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::NetworkError { is_transient, .. } => *is_transient,
            FetchError::IoError(_) => true,
            FetchError::ReqwestError(e) => e.status().is_none(),
            _ => false,
        }
    }

    /// Message fit for showing to a user
    pub fn user_message(&self) -> String {
        match self {
            FetchError::ServerUnsupported { .. } => {
                "The server does not support this download. Try again later or use another source.".to_string()
            }
            FetchError::PermissionDenied(path) => {
                format!("Cannot write to '{}'. Please choose another download location.", path)
            }
            FetchError::TooManyCandidates { name, .. } => {
                format!("Too many files named like '{}' already exist. Please choose another name.", name)
            }
            FetchError::NetworkError { .. } | FetchError::ReqwestError(_) => {
                "Network connection failed. Please check your connection and try again.".to_string()
            }
            _ => self.to_string(),
        }
    }
}
