use postgres_unit_of_work::TransactionError;

use crate::scope::Scope;

/// Error type for ordering and cache operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} not found in {scope}")]
    NotFound { entity: String, scope: String },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Store operation timed out: {0}")]
    Timeout(String),

    #[error("Ordering invariant violated in {scope}: {detail}")]
    InvariantViolation { scope: String, detail: String },

    #[error("Invalid key pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Transaction participant failed: {0}")]
    Transaction(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[source] sqlx::Error),

    #[cfg(feature = "redis")]
    #[error("Key-value store error: {0}")]
    KeyValue(#[source] redis::RedisError),
}

/// Result type for ordering and cache operations
pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub(crate) fn entity_not_found(scope: &Scope, id: uuid::Uuid) -> Self {
        StoreError::NotFound {
            entity: format!("entity {id}"),
            scope: scope.to_string(),
        }
    }

    pub(crate) fn index_not_found(scope: &Scope, index: i32) -> Self {
        StoreError::NotFound {
            entity: format!("sibling at index {index}"),
            scope: scope.to_string(),
        }
    }

    pub(crate) fn invariant(scope: &Scope, detail: impl Into<String>) -> Self {
        StoreError::InvariantViolation {
            scope: scope.to_string(),
            detail: detail.into(),
        }
    }

    /// True when the referenced entity or positional target does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// True when a backing store could not be reached or did not answer in time.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::StoreUnavailable(_) | StoreError::Timeout(_))
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => StoreError::Timeout("database pool acquire".to_string()),
            sqlx::Error::PoolClosed | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
                StoreError::StoreUnavailable(err.to_string())
            }
            other => StoreError::Database(other),
        }
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            StoreError::Timeout(err.to_string())
        } else if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
            StoreError::StoreUnavailable(err.to_string())
        } else {
            StoreError::KeyValue(err)
        }
    }
}

/// Conversion from StoreError to TransactionError
impl From<StoreError> for TransactionError {
    fn from(err: StoreError) -> Self {
        TransactionError::CommitFailed(format!("Store error: {err}"))
    }
}

impl From<TransactionError> for StoreError {
    fn from(err: TransactionError) -> Self {
        match err {
            TransactionError::CommitFailed(msg) | TransactionError::RollbackFailed(msg) => {
                StoreError::Transaction(msg)
            }
            #[allow(unreachable_patterns)]
            _ => StoreError::Transaction("unit of work participant failed".to_string()),
        }
    }
}
