use observer_common::types::{InvalidMetric, MetricKind};
use rusqlite::ErrorCode;
use std::path::PathBuf;

/// Errors that can occur within the storage layer.
///
/// Callers at the HTTP edge only need the coarse classes: [`NotFound`],
/// client-side data problems ([`InvalidMetric`], [`CounterOverflow`],
/// [`Integrity`]) and backend trouble (everything else).
///
/// # Examples
///
/// ```rust
/// use observer_common::types::MetricKind;
/// use observer_storage::error::StorageError;
///
/// let err = StorageError::NotFound {
///     name: "PollCount".to_string(),
///     kind: MetricKind::Counter,
/// };
/// assert!(err.to_string().contains("PollCount"));
/// ```
///
/// [`NotFound`]: StorageError::NotFound
/// [`InvalidMetric`]: StorageError::InvalidMetric
/// [`CounterOverflow`]: StorageError::CounterOverflow
/// [`Integrity`]: StorageError::Integrity
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// No metric of this kind has been stored under the name.
    #[error("Storage: {kind} metric '{name}' not found")]
    NotFound { name: String, kind: MetricKind },

    /// The submitted metric breaks the payload rules.
    #[error("Storage: invalid metric: {0}")]
    InvalidMetric(#[from] InvalidMetric),

    /// Folding the delta would overflow the 64-bit counter.
    #[error("Storage: counter '{name}' would overflow")]
    CounterOverflow { name: String },

    /// A database constraint rejected the write, or stored data is unreadable.
    #[error("Storage: integrity violation: {0}")]
    Integrity(String),

    /// The backend could not be reached.
    #[error("Storage: backend unavailable: {0}")]
    Connection(String),

    /// The caller's cancellation token fired.
    #[error("Storage: operation cancelled")]
    Cancelled,

    #[error("Storage: I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Storage: JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Any other SQLite failure.
    #[error("Storage: SQLite error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("Storage: {0}")]
    Other(String),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Connection(_))
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        let code = match &err {
            rusqlite::Error::SqliteFailure(failure, _) => failure.code,
            _ => return StorageError::Sqlite(err),
        };
        match code {
            ErrorCode::ConstraintViolation => StorageError::Integrity(err.to_string()),
            ErrorCode::OperationInterrupted => StorageError::Cancelled,
            ErrorCode::CannotOpen
            | ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::NotADatabase
            | ErrorCode::PermissionDenied
            | ErrorCode::SystemIoFailure => StorageError::Connection(err.to_string()),
            _ => StorageError::Sqlite(err),
        }
    }
}

/// Convenience `Result` alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
