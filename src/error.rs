//! Error types for DealerSync
//!
//! Defines one error enum covering every failure mode of the sync engine, and the
//! [`ErrorCode`] taxonomy that is persisted in the sync ledger and the API call log.
//! Uses thiserror for ergonomic error handling.

use crate::remote::retry::{RetryDecision, RetryableError};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for DealerSync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Comprehensive error type for DealerSync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// No active CRM account (credentials) for the tenant
    #[error("No active CRM account for tenant {0}")]
    NoAccount(String),

    /// 401 persisted after one token refresh, or credentials were rejected
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// 429 persisted after the retry budget was spent
    #[error("Rate limited, retry after {0} seconds")]
    RateLimited(u64),

    /// Transport failure persisted after the retry budget was spent
    #[error("Network error: {0}")]
    Network(String),

    /// Any other non-success HTTP status from the remote CRM
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Local data cannot be synced until it is corrected
    #[error("Validation error: {0}")]
    Validation(String),

    /// The tenant has this kind of sync switched off
    #[error("{0} sync is not enabled")]
    NotEnabled(&'static str),

    /// The paired contact has no verified remote link yet
    #[error("Contact not synced: {0}")]
    ContactNotSynced(String),

    /// DMS adapter reported a failure
    #[error("DMS error: {0}")]
    Dms(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage/ledger errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// SQLite database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// HTTP client errors (outside the resilient client)
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    /// Other errors
    #[error("{0}")]
    Other(String),

    /// Anyhow errors (for more context)
    #[error("{0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Error taxonomy shared by the client, the reconcilers and the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NoAccount,
    AuthFailed,
    RateLimited,
    NetworkError,
    Http(u16),
    Validation,
    NotEnabled,
    ContactNotSynced,
    DmsError,
    Config,
    Storage,
    Internal,
}

impl ErrorCode {
    /// Transient failures leave the ledger row pending for the next pass
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCode::RateLimited | ErrorCode::NetworkError | ErrorCode::ContactNotSynced
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::NoAccount => write!(f, "NO_ACCOUNT"),
            ErrorCode::AuthFailed => write!(f, "AUTH_FAILED"),
            ErrorCode::RateLimited => write!(f, "RATE_LIMITED"),
            ErrorCode::NetworkError => write!(f, "NETWORK_ERROR"),
            ErrorCode::Http(status) => write!(f, "HTTP_{}", status),
            ErrorCode::Validation => write!(f, "VALIDATION"),
            ErrorCode::NotEnabled => write!(f, "NOT_ENABLED"),
            ErrorCode::ContactNotSynced => write!(f, "CONTACT_NOT_SYNCED"),
            ErrorCode::DmsError => write!(f, "DMS_ERROR"),
            ErrorCode::Config => write!(f, "CONFIG"),
            ErrorCode::Storage => write!(f, "STORAGE"),
            ErrorCode::Internal => write!(f, "INTERNAL"),
        }
    }
}

impl SyncError {
    /// Map this error onto the shared taxonomy
    pub fn code(&self) -> ErrorCode {
        match self {
            SyncError::NoAccount(_) => ErrorCode::NoAccount,
            SyncError::AuthFailed(_) => ErrorCode::AuthFailed,
            SyncError::RateLimited(_) => ErrorCode::RateLimited,
            SyncError::Network(_) => ErrorCode::NetworkError,
            SyncError::Http { status, .. } => ErrorCode::Http(*status),
            SyncError::Validation(_) => ErrorCode::Validation,
            SyncError::NotEnabled(_) => ErrorCode::NotEnabled,
            SyncError::ContactNotSynced(_) => ErrorCode::ContactNotSynced,
            SyncError::Dms(_) => ErrorCode::DmsError,
            SyncError::Config(_) | SyncError::Yaml(_) => ErrorCode::Config,
            SyncError::Storage(_) | SyncError::Database(_) => ErrorCode::Storage,
            SyncError::Client(e) if e.is_connect() || e.is_timeout() => ErrorCode::NetworkError,
            SyncError::Io(_)
            | SyncError::Json(_)
            | SyncError::Client(_)
            | SyncError::Other(_)
            | SyncError::Anyhow(_) => ErrorCode::Internal,
        }
    }

    /// The remote record behind a stored id no longer exists
    pub fn is_gone(&self) -> bool {
        matches!(self, SyncError::Http { status: 404 | 410, .. })
    }
}

impl RetryableError for SyncError {
    fn retry_decision(&self) -> RetryDecision {
        match self {
            SyncError::Network(_) => RetryDecision::Retry,
            SyncError::RateLimited(secs) => RetryDecision::RetryAfter(Duration::from_secs(*secs)),
            SyncError::Client(e) => {
                if e.is_connect() || e.is_timeout() {
                    RetryDecision::Retry
                } else if let Some(status) = e.status() {
                    match status.as_u16() {
                        429 => RetryDecision::RetryAfter(Duration::from_secs(60)),
                        _ => RetryDecision::NoRetry,
                    }
                } else {
                    RetryDecision::NoRetry
                }
            }
            // Any other status, 5xx included, is surfaced as HTTP_{status}
            _ => RetryDecision::NoRetry,
        }
    }
}
