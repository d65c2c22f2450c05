//! Error types for txscope-core
//!
//! `DbError` is what a backend reports for a single operation.
//! `TxError` is what a unit of work reports, tagged with the phase that failed.

use std::any::Any;
use std::fmt;

use thiserror::Error;

use crate::context::Cancelled;

/// Backend error for a single transactional operation
#[derive(Error, Debug)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("no rows in result set")]
    NoRows,

    /// A repository needed a transaction but none was attached to the context
    #[error("no active transaction in context")]
    NoTransaction,

    /// The transaction was already committed or rolled back
    #[error("transaction is closed")]
    TxClosed,

    #[error("{0}")]
    Cancelled(#[from] Cancelled),

    /// An earlier statement of the same batch failed
    #[error("batch aborted by a previous statement")]
    BatchAborted,

    #[error("column '{column}': {reason}")]
    Decode { column: String, reason: String },

    #[error("column not found: {0}")]
    ColumnNotFound(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl DbError {
    /// Create a decode error for a column
    pub fn decode(column: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Decode {
            column: column.into(),
            reason: reason.into(),
        }
    }

    /// Create an opaque backend error
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    /// True when the failure was caused by context cancellation or deadline
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

/// Payload of a panic caught inside a unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanicPayload(String);

impl PanicPayload {
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl From<Box<dyn Any + Send>> for PanicPayload {
    fn from(payload: Box<dyn Any + Send>) -> Self {
        let message = match payload.downcast::<String>() {
            Ok(s) => *s,
            Err(payload) => match payload.downcast::<&'static str>() {
                Ok(s) => (*s).to_owned(),
                Err(_) => "(non-string panic)".to_owned(),
            },
        };
        Self(message)
    }
}

impl fmt::Display for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a unit of work did not commit
#[derive(Error, Debug)]
pub enum Abort<E> {
    /// The work returned an error
    #[error(transparent)]
    Work(E),

    /// The work panicked; the panic was caught and not re-raised
    #[error("panic: {0}")]
    Panic(PanicPayload),

    /// A nested unit of work failed, so the shared transaction may only roll back
    #[error("transaction marked rollback-only by a nested unit of work")]
    RollbackOnly,
}

/// Error returned by `TxManager::run` and `TxManager::run_with_settings`
#[derive(Error, Debug)]
pub enum TxError<E> {
    /// The transaction could not be started; the work never ran
    #[error("begin tx: {0}")]
    Begin(#[source] DbError),

    /// The work succeeded but the commit failed
    #[error("commit tx: {0}")]
    Commit(#[source] DbError),

    /// The work failed and the transaction was rolled back
    #[error("unit of work aborted: {0}")]
    Aborted(#[source] Abort<E>),

    /// The work failed and the rollback failed as well
    #[error("unit of work aborted: {cause}; rollback tx: {rollback}")]
    RollbackFailed {
        cause: Abort<E>,
        #[source]
        rollback: DbError,
    },
}

impl<E> TxError<E> {
    /// The cause of the abort, if the work did not commit
    pub fn abort(&self) -> Option<&Abort<E>> {
        match self {
            Self::Aborted(cause) | Self::RollbackFailed { cause, .. } => Some(cause),
            Self::Begin(_) | Self::Commit(_) => None,
        }
    }

    /// The error returned by the work itself, if that is why it failed
    pub fn work_error(&self) -> Option<&E> {
        match self.abort() {
            Some(Abort::Work(e)) => Some(e),
            _ => None,
        }
    }

    pub fn into_work_error(self) -> Option<E> {
        match self {
            Self::Aborted(Abort::Work(e)) | Self::RollbackFailed { cause: Abort::Work(e), .. } => {
                Some(e)
            }
            _ => None,
        }
    }

    pub fn is_panic(&self) -> bool {
        matches!(self.abort(), Some(Abort::Panic(_)))
    }

    /// The rollback failure joined to the original cause, if any
    pub fn rollback_error(&self) -> Option<&DbError> {
        match self {
            Self::RollbackFailed { rollback, .. } => Some(rollback),
            _ => None,
        }
    }
}

/// Result type alias for single transactional operations
pub type DbResult<T> = std::result::Result<T, DbError>;
