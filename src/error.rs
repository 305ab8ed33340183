//! Typed error surfaces for the core's external-facing contracts.
//!
//! `thiserror` enums at each component boundary; `anyhow::Result` is
//! used at the composition edge (`main.rs`, `PoolCoordinator`) where
//! errors are only ever logged, never matched on.

use thiserror::Error;

/// Errors surfaced by [`crate::auth::Authenticator::authenticate`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid worker name")]
    InvalidWorkerName,
    #[error("user not found")]
    UserNotFound,
    #[error("user disabled")]
    UserDisabled,
    #[error("directory error: {0}")]
    Directory(String),
}

/// Errors from [`crate::connection::manager::ConnectionManager::add_connection`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("maximum connections reached")]
    MaxConnectionsReached,
    #[error("per-IP connection limit reached")]
    IpLimitReached,
}

/// Reasons a submitted share did not produce an accepted result.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("job not found")]
    StaleJob,
    #[error("duplicate share")]
    Duplicate,
    #[error("share difficulty too low")]
    LowDifficulty,
    #[error("invalid hash encoding")]
    InvalidHash,
    #[error("not subscribed")]
    NotSubscribed,
    #[error("unauthorized")]
    Unauthorized,
    #[error("share queue full")]
    QueueFull,
    #[error("rate limited")]
    RateLimited,
    #[error("submit timed out waiting on the share pipeline")]
    Timeout,
    #[error("internal error: {0}")]
    Internal(String),
}

impl SubmitError {
    /// Stratum V1 numeric error code returned in the JSON-RPC error triple.
    pub fn code(&self) -> i32 {
        match self {
            SubmitError::StaleJob => 21,
            SubmitError::Duplicate => 22,
            SubmitError::LowDifficulty => 23,
            SubmitError::Unauthorized => 24,
            SubmitError::NotSubscribed => 25,
            SubmitError::InvalidHash
            | SubmitError::QueueFull
            | SubmitError::RateLimited
            | SubmitError::Timeout
            | SubmitError::Internal(_) => 20,
        }
    }
}

/// Errors from [`crate::pool::PoolCoordinator::start`].
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to bind listener on {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("pool coordinator already started")]
    StartTwice,
}
