//! txscope-core: ambient transactions for service code
//!
//! A service runs a closure with `TxManager::run`; repositories called from
//! inside it find the active transaction with `TxGetter::get_tx` on the
//! `Context` they were handed, without the transaction appearing in their
//! signatures.
//!
//! ```ignore
//! let manager = TxManager::new(Arc::new(db));
//! manager.run(&ctx, |ctx| async move {
//!     repo.create(&ctx, first).await?;
//!     repo.create(&ctx, second).await?;
//!     Ok::<_, RepoError>(())
//! }).await?;
//! ```

pub mod context;
pub mod error;
pub mod getter;
pub mod manager;
pub mod postgres;
pub mod tx;
pub mod value;

mod carrier;

#[cfg(any(test, feature = "fake"))]
pub mod fake;

pub use context::{CancelHandle, Cancelled, Context, ContextKey};
pub use error::{Abort, DbError, DbResult, PanicPayload, TxError};
pub use getter::TxGetter;
pub use manager::TxManager;
pub use postgres::{PgDatabase, PgTransaction};
pub use tx::{
    AccessMode, Batch, BatchResults, CopyFromIter, CopyFromRows, CopySource, Database, Identifier,
    IsolationLevel, Transaction, Tx, TxSettings,
};
pub use value::{FromRow, FromValue, Row, Rows, Value};
