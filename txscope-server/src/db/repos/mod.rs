//! Repository implementations for database access
//!
//! Repositories never begin or end transactions. They look up the one the
//! service started with `TxGetter` and fail fast when there is none.

pub mod example;

pub use example::{ExampleRepo, ExampleRepository};

use txscope_core::DbError;

/// Repository error type
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error("not found: {resource} '{id}'")]
    NotFound { resource: &'static str, id: String },
}
