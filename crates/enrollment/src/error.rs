//! Enrollment error types

use coursebridge_shared::StoreError;

use crate::moodle::MoodleError;

/// Coarse classification used for logging and retry decisions.
///
/// The job runner spends the same bounded retry budget on transient and
/// permanent failures; the kind only changes how loudly a failure is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Work was already accepted; not a failure.
    Duplicate,
    /// Connection failures, timeouts, storage hiccups.
    Transient,
    /// The same input will keep failing until someone changes data or config.
    Permanent,
    /// The outbound Moodle throttle is saturated.
    RateLimited,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Duplicate => write!(f, "duplicate"),
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Permanent => write!(f, "permanent"),
            ErrorKind::RateLimited => write!(f, "rate_limited"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnrollmentError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Key-value store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Moodle(#[from] MoodleError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid workflow transition for order {order_id}: {from} -> {to}")]
    InvalidTransition {
        order_id: String,
        from: String,
        to: String,
    },

    #[error("Job attempt timed out after {0} seconds")]
    Timeout(u64),

    #[error("Attempt budget of {0} exhausted")]
    AttemptsExhausted(u32),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl EnrollmentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EnrollmentError::Moodle(e) => e.kind(),
            EnrollmentError::Database(_)
            | EnrollmentError::Store(_)
            | EnrollmentError::Timeout(_) => ErrorKind::Transient,
            EnrollmentError::InvalidInput(_)
            | EnrollmentError::Config(_)
            | EnrollmentError::Serialization(_)
            | EnrollmentError::InvalidTransition { .. }
            | EnrollmentError::AttemptsExhausted(_)
            | EnrollmentError::NotFound(_) => ErrorKind::Permanent,
        }
    }
}

impl From<serde_json::Error> for EnrollmentError {
    fn from(e: serde_json::Error) -> Self {
        EnrollmentError::Serialization(e.to_string())
    }
}

pub type EnrollmentResult<T> = Result<T, EnrollmentError>;
