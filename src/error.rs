//! Error types for windowgate.

use thiserror::Error;

/// Status code attached to rejections unless the caller supplies one.
pub const DEFAULT_REJECTION_STATUS: u16 = 429;

/// Message used for rejections unless the caller supplies one.
pub const DEFAULT_REJECTION_MESSAGE: &str = "Too Many Requests";

/// Main error type for limiter operations.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// Invalid construction options or per-call arguments
    #[error("Configuration error: {0}")]
    Config(String),

    /// The window store failed while executing a batch
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The admission policy or interval guard rejected the batch
    #[error(transparent)]
    LimitExceeded(#[from] LimitExceeded),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LimiterError {
    /// Whether this error is a quota rejection rather than a failure.
    pub fn is_limit_exceeded(&self) -> bool {
        matches!(self, LimiterError::LimitExceeded(_))
    }
}

/// Errors surfaced by a [`WindowStore`](crate::store::WindowStore).
#[derive(Error, Debug)]
pub enum StoreError {
    /// Redis returned an error for the batch or one of its commands
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A reply did not have the shape the issuing operation expects
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    /// Any other backend failure
    #[error("{0}")]
    Backend(String),
}

/// The rejection raised when a batch is not admitted.
///
/// A fresh value is produced for every rejection from the limiter's
/// immutable template, so callers may keep or mutate it freely.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct LimitExceeded {
    /// Human readable message
    pub message: String,
    /// HTTP-style status
    pub status: u16,
    /// HTTP-style status code, kept separately for frameworks that read either field
    pub status_code: u16,
}

impl LimitExceeded {
    /// Build a rejection, defaulting missing codes to 429.
    pub fn new(message: impl Into<String>, status: Option<u16>, status_code: Option<u16>) -> Self {
        Self {
            message: message.into(),
            status: status.unwrap_or(DEFAULT_REJECTION_STATUS),
            status_code: status_code.unwrap_or(DEFAULT_REJECTION_STATUS),
        }
    }
}

impl Default for LimitExceeded {
    fn default() -> Self {
        Self::new(DEFAULT_REJECTION_MESSAGE, None, None)
    }
}

/// Result type alias for limiter operations.
pub type Result<T> = std::result::Result<T, LimiterError>;
