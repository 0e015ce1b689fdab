// ferrodb-core/src/error.rs
// Unified error type for the engine

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, FerroError>;

/// All engine error kinds.
///
/// Every variant maps to a stable wire code via [`FerroError::code`]; the
/// command router ships `{code, message, details?, request_id}` and never a
/// backtrace or an internal path.
#[derive(Error, Debug)]
pub enum FerroError {
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("collection already exists: {0}")]
    CollectionExists(String),

    #[error("duplicate document id: {0}")]
    DuplicateId(String),

    #[error("duplicate key in unique index '{index}': {key}")]
    DuplicateKey { index: String, key: String },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("aggregation error: {0}")]
    Aggregation(String),

    #[error("index error: {0}")]
    IndexError(String),

    #[error("transaction conflict: {0}")]
    TransactionConflict(String),

    #[error("transaction {0} not found or not active")]
    TransactionInactive(u64),

    #[error("transaction {0} aborted as deadlock victim")]
    Deadlock(u64),

    #[error("lock acquisition timed out on {0}")]
    LockTimeout(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("regex evaluation exceeded its time budget")]
    RegexTimeout,

    #[error("write-ahead log corrupted: {0}")]
    CorruptedLog(String),

    #[error("data corruption: {0}")]
    Corruption(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl FerroError {
    /// Stable code surfaced on the wire.
    pub fn code(&self) -> &'static str {
        use FerroError::*;
        match self {
            AuthFailed(_) => "AUTH_FAILED",
            AccessDenied(_) => "ACCESS_DENIED",
            CollectionNotFound(_) | DocumentNotFound(_) => "NOT_FOUND",
            CollectionExists(_) => "DUPLICATE_KEY",
            DuplicateId(_) | DuplicateKey { .. } => "DUPLICATE_KEY",
            Validation(_) | InvalidQuery(_) | Aggregation(_) | IndexError(_) => "VALIDATION_ERROR",
            TransactionConflict(_) | TransactionInactive(_) => "TRANSACTION_CONFLICT",
            Deadlock(_) => "DEADLOCK",
            LockTimeout(_) => "LOCK_TIMEOUT",
            Timeout(_) | RegexTimeout => "TIMEOUT",
            CorruptedLog(_) => "CORRUPTED_LOG",
            Corruption(_) | Serialization(_) | Io(_) | Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether a client may retry the operation as-is.
    ///
    /// Deadlock victims and lock timeouts leave the database healthy; the
    /// losing side can simply run again.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            FerroError::Deadlock(_)
                | FerroError::LockTimeout(_)
                | FerroError::TransactionConflict(_)
        )
    }
}
