//! Unit-of-work executor
//!
//! `TxManager::run` begins a transaction, publishes it on a child context,
//! runs the caller's work with that context and resolves the transaction:
//! - work returned `Ok`  -> commit
//! - work returned `Err` -> rollback
//! - work panicked       -> panic caught, rollback, returned as `Abort::Panic`
//!
//! Every path ends in exactly one commit or one rollback before `run` returns.
//! Errors are returned to the caller, never logged here.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::FutureExt;
use tracing::debug;

use crate::carrier::{self, ActiveTx};
use crate::context::Context;
use crate::error::{Abort, TxError};
use crate::tx::{Database, Transaction, Tx, TxSettings};

/// Runs closures as atomic units of work against a `Database`
pub struct TxManager<D> {
    db: Arc<D>,
}

impl<D> Clone for TxManager<D> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
        }
    }
}

impl<D: Database> TxManager<D> {
    pub fn new(db: Arc<D>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Arc<D> {
        &self.db
    }

    /// Identity of the database this manager begins transactions on
    fn owner(&self) -> usize {
        Arc::as_ptr(&self.db) as *const () as usize
    }

    /// Run `work` in a transaction with server-default settings
    pub async fn run<T, E, F, Fut>(&self, ctx: &Context, work: F) -> Result<T, TxError<E>>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_with_settings(ctx, TxSettings::default(), work).await
    }

    /// Run `work` in a transaction started with `settings`.
    ///
    /// If `ctx` already carries a transaction begun on this manager's
    /// database, `work` joins it instead of starting a new one; see `join`.
    /// Transactions of other databases are never joined: `work` gets its own
    /// transaction, which shadows theirs on the context it receives.
    pub async fn run_with_settings<T, E, F, Fut>(
        &self,
        ctx: &Context,
        settings: TxSettings,
        work: F,
    ) -> Result<T, TxError<E>>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let owner = self.owner();
        if let Some(active) = carrier::lookup_owned(ctx, owner) {
            if active.settings() != settings {
                debug!(
                    outer = ?active.settings(),
                    requested = ?settings,
                    "nested unit of work joins outer transaction, requested settings ignored"
                );
            }
            return Self::join(ctx, active, work).await;
        }
        if carrier::lookup(ctx).is_some() {
            debug!("outer transaction belongs to another database, starting a new one");
        }

        let tx = Arc::new(self.db.begin(ctx, &settings).await.map_err(TxError::Begin)?);
        debug!(?settings, "transaction started");

        let entry = ActiveTx::new(tx.clone() as Arc<dyn Tx>, owner, settings);
        let rollback_only = entry.rollback_only_flag();
        let tx_ctx = carrier::attach(ctx, entry);

        let outcome = AssertUnwindSafe(async move { work(tx_ctx).await })
            .catch_unwind()
            .await;

        let cause = match outcome {
            Ok(Ok(value)) if !rollback_only.load(Ordering::SeqCst) => {
                tx.commit(ctx).await.map_err(TxError::Commit)?;
                debug!("transaction committed");
                return Ok(value);
            }
            Ok(Ok(_)) => Abort::RollbackOnly,
            Ok(Err(e)) => Abort::Work(e),
            Err(payload) => Abort::Panic(payload.into()),
        };

        // Rollback must happen even if the request context was cancelled.
        match tx.rollback(&ctx.without_cancel()).await {
            Ok(()) => {
                debug!("transaction rolled back");
                Err(TxError::Aborted(cause))
            }
            Err(rollback) => Err(TxError::RollbackFailed { cause, rollback }),
        }
    }

    /// Nested unit of work: reuse the outer transaction.
    ///
    /// Nothing is committed or rolled back here. A failure marks the outer
    /// transaction rollback-only, so the outermost `run` cannot commit it.
    async fn join<T, E, F, Fut>(ctx: &Context, active: &ActiveTx, work: F) -> Result<T, TxError<E>>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        // Re-attach so the joined transaction is the innermost one even when a
        // transaction from another database was carried in between.
        let inner_ctx = carrier::attach(ctx, active.clone());
        let outcome = AssertUnwindSafe(async move { work(inner_ctx).await })
            .catch_unwind()
            .await;

        let cause = match outcome {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => Abort::Work(e),
            Err(payload) => Abort::Panic(payload.into()),
        };
        active.mark_rollback_only();
        debug!("nested unit of work failed, outer transaction marked rollback-only");
        Err(TxError::Aborted(cause))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeCall, FakeDatabase};
    use crate::getter::TxGetter;
    use crate::params;

    #[derive(Debug, thiserror::Error)]
    #[error("work failed")]
    struct WorkFailed;

    #[tokio::test]
    async fn run_returns_work_value_on_commit() {
        let db = FakeDatabase::new();
        let manager = TxManager::new(Arc::new(db.clone()));

        let value = manager
            .run(&Context::background(), |_ctx| async { Ok::<_, WorkFailed>(42) })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(db.commit_count(), 1);
        assert_eq!(db.rollback_count(), 0);
    }

    #[tokio::test]
    async fn begin_failure_skips_work() {
        let db = FakeDatabase::new();
        db.fail_begin(true);
        let manager = TxManager::new(Arc::new(db.clone()));
        let mut ran = false;

        let err = manager
            .run(&Context::background(), |_ctx| {
                ran = true;
                async { Ok::<_, WorkFailed>(()) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, TxError::Begin(_)));
        assert!(!ran);
        assert!(db.calls().is_empty());
    }

    #[tokio::test]
    async fn panic_while_building_future_is_caught() {
        let db = FakeDatabase::new();
        let manager = TxManager::new(Arc::new(db.clone()));

        let err = manager
            .run(&Context::background(), |_ctx| -> std::future::Ready<Result<(), WorkFailed>> {
                panic!("before the future existed")
            })
            .await
            .unwrap_err();

        assert!(err.is_panic());
        assert_eq!(db.rollback_count(), 1);
    }

    #[tokio::test]
    async fn carried_tx_is_gone_after_run() {
        let db = FakeDatabase::new();
        let manager = TxManager::new(Arc::new(db.clone()));
        let ctx = Context::background();

        manager
            .run(&ctx, |tx_ctx| async move {
                assert!(TxGetter::new().get_tx(&tx_ctx).is_some());
                Ok::<_, WorkFailed>(())
            })
            .await
            .unwrap();

        assert!(TxGetter::new().get_tx(&ctx).is_none());
    }

    #[tokio::test]
    async fn leaked_context_cannot_reuse_resolved_tx() {
        let db = FakeDatabase::new();
        let manager = TxManager::new(Arc::new(db.clone()));

        let leaked = manager
            .run(&Context::background(), |tx_ctx| async move { Ok::<_, WorkFailed>(tx_ctx) })
            .await
            .unwrap();

        let tx = TxGetter::new().get_tx(&leaked).unwrap();
        let err = tx
            .execute(&leaked, "INSERT INTO example VALUES ($1)", &params![1])
            .await
            .unwrap_err();
        assert!(matches!(err, crate::DbError::TxClosed));
        assert_eq!(db.calls(), vec![FakeCall::Commit]);
    }
}
