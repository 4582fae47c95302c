//! Error types shared across the crystal-guide core.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Local persistence failure.
///
/// Writes surface this to the caller; reads never do (see `store::Lookup`).
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage worker failed: {0}")]
    Worker(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Failure of a single provider call. Every variant is eligible for retry.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API request failed: {status} {reason}")]
    Status { status: u16, reason: String },

    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Response decode failed: {0}")]
    Decode(String),
}

/// Stable error codes reported in response envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NoApiKey,
    RateLimitExceeded,
    NetworkError,
    Timeout,
    ParseError,
    StorageError,
    InvalidImage,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NoApiKey => "NO_API_KEY",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::ParseError => "PARSE_ERROR",
            ErrorCode::StorageError => "STORAGE_ERROR",
            ErrorCode::InvalidImage => "INVALID_IMAGE",
        }
    }
}

/// Terminal outcome of a stone analysis that did not produce a result.
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("API key not configured")]
    NoApiKey,

    #[error("{0}")]
    RateLimitExceeded(String),

    #[error(transparent)]
    Transport(TransportError),

    #[error("Failed to parse analysis response")]
    Parse(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("{0}")]
    InvalidImage(String),
}

impl AnalysisError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AnalysisError::NoApiKey => ErrorCode::NoApiKey,
            AnalysisError::RateLimitExceeded(_) => ErrorCode::RateLimitExceeded,
            AnalysisError::Transport(TransportError::Timeout { .. }) => ErrorCode::Timeout,
            AnalysisError::Transport(_) => ErrorCode::NetworkError,
            AnalysisError::Parse(_) => ErrorCode::ParseError,
            AnalysisError::Storage(_) => ErrorCode::StorageError,
            AnalysisError::InvalidImage(_) => ErrorCode::InvalidImage,
        }
    }

    /// Errors raised before any network attempt. These never count as usage.
    pub fn is_fail_fast(&self) -> bool {
        matches!(
            self,
            AnalysisError::NoApiKey
                | AnalysisError::RateLimitExceeded(_)
                | AnalysisError::InvalidImage(_)
        )
    }
}

impl From<TransportError> for AnalysisError {
    fn from(err: TransportError) -> Self {
        AnalysisError::Transport(err)
    }
}

/// Local account failures.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid email address")]
    InvalidEmail,

    #[error("Password must be at least {0} characters")]
    WeakPassword(usize),

    #[error("Name must be at least {0} characters")]
    InvalidName(usize),

    #[error("An account with this email already exists")]
    AlreadyRegistered,

    #[error("Email or password is incorrect")]
    InvalidCredentials,

    #[error("No user is signed in")]
    NotSignedIn,

    #[error("Stored accounts could not be read: {0}")]
    AccountsUnreadable(String),

    #[error("Password hashing failed: {0}")]
    Crypto(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}
