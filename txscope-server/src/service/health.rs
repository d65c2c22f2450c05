//! Readiness checks behind `GET /health`

use async_trait::async_trait;
use txscope_core::{Context, Database, DbError, TxError, TxGetter, TxManager, TxSettings};

/// Probe the backing services
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Round trip to the database inside a read-only unit of work
    async fn check_database(&self, ctx: &Context) -> Result<(), TxError<DbError>>;
}

pub struct DatabaseHealth<D> {
    manager: TxManager<D>,
}

impl<D: Database> DatabaseHealth<D> {
    pub fn new(manager: TxManager<D>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl<D: Database> HealthCheck for DatabaseHealth<D> {
    async fn check_database(&self, ctx: &Context) -> Result<(), TxError<DbError>> {
        self.manager
            .run_with_settings(ctx, TxSettings::read_only(), |ctx| async move {
                TxGetter::new()
                    .require_tx(&ctx)?
                    .execute(&ctx, "SELECT 1", &[])
                    .await?;
                Ok::<_, DbError>(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use txscope_core::fake::{FakeCall, FakeDatabase};

    #[tokio::test]
    async fn database_check_runs_in_read_only_transaction() {
        let db = FakeDatabase::new();
        let health = DatabaseHealth::new(TxManager::new(Arc::new(db.clone())));

        health.check_database(&Context::background()).await.unwrap();

        assert_eq!(db.begun_settings(), vec![TxSettings::read_only()]);
        assert_eq!(
            db.calls(),
            vec![
                FakeCall::Execute {
                    tx: 1,
                    sql: "SELECT 1".into(),
                    params: Vec::new(),
                },
                FakeCall::Commit,
            ]
        );
    }

    #[tokio::test]
    async fn unreachable_database_fails_check() {
        let db = FakeDatabase::new();
        db.fail_begin(true);
        let health = DatabaseHealth::new(TxManager::new(Arc::new(db)));

        let err = health
            .check_database(&Context::background())
            .await
            .unwrap_err();
        assert!(matches!(err, TxError::Begin(_)));
    }
}
