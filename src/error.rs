// Error taxonomy for the memory service. Every public component operation returns
// `Result<T, MemoryError>`; the stdio and HTTP surfaces map these to opaque codes
// and never leak raw stack traces or provider error text.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no model provider available for task: {0}")]
    ProviderUnavailable(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("consistency violation for unit {unit_id}: {detail}")]
    ConsistencyViolation { unit_id: String, detail: String },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded after {0:?}")]
    DeadlineExceeded(std::time::Duration),

    #[error("internal error")]
    Internal(#[source] anyhow::Error),
}

impl MemoryError {
    /// Opaque wire code per spec §7. Human text travels in the Display impl, kept
    /// local to logs; callers only see `code()` + a short message.
    pub fn code(&self) -> &'static str {
        match self {
            MemoryError::Validation(_) => "VALIDATION",
            MemoryError::NotFound(_) => "NOT_FOUND",
            MemoryError::ProviderUnavailable(_) => "PROVIDER_UNAVAILABLE",
            MemoryError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            MemoryError::ConsistencyViolation { .. } => "CONSISTENCY_VIOLATION",
            MemoryError::PermissionDenied(_) => "PERMISSION_DENIED",
            MemoryError::Cancelled => "CANCELLED",
            MemoryError::DeadlineExceeded(_) => "DEADLINE_EXCEEDED",
            MemoryError::Internal(_) => "INTERNAL",
        }
    }

    /// Message safe to return to callers: never the inner `anyhow` chain for
    /// `Internal`, since that may carry provider/connection-string detail.
    pub fn public_message(&self) -> String {
        match self {
            MemoryError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }

    pub fn internal(err: impl Into<anyhow::Error>) -> Self {
        MemoryError::Internal(err.into())
    }
}

impl From<sqlx::Error> for MemoryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => MemoryError::NotFound("row not found".to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                MemoryError::StoreUnavailable(err.to_string())
            }
            other => MemoryError::Internal(other.into()),
        }
    }
}

impl From<qdrant_client::QdrantError> for MemoryError {
    fn from(err: qdrant_client::QdrantError) -> Self {
        MemoryError::StoreUnavailable(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MemoryError>;
