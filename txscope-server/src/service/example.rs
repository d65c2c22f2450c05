//! Example service
//!
//! Each operation is one unit of work. Reads run in read-only transactions so
//! the repository always has a transaction to find.

use std::sync::Arc;

use async_trait::async_trait;
use txscope_core::{Context, Database, TxError, TxManager, TxSettings};

use crate::db::{ExampleRepository, RepoError};
use crate::models::{Example, ExampleName};

pub type ServiceError = TxError<RepoError>;

/// Operations exposed to HTTP handlers
#[async_trait]
pub trait ExampleApi: Send + Sync {
    async fn get(&self, ctx: &Context, id: i32) -> Result<Example, ServiceError>;

    async fn list(&self, ctx: &Context) -> Result<Vec<Example>, ServiceError>;

    async fn create(&self, ctx: &Context, name: ExampleName) -> Result<Example, ServiceError>;

    /// Rename an existing example; read and write happen in one transaction
    async fn update(&self, ctx: &Context, id: i32, name: ExampleName)
        -> Result<Example, ServiceError>;

    /// All names are inserted, or none
    async fn import(&self, ctx: &Context, names: Vec<ExampleName>) -> Result<u64, ServiceError>;

    /// All renames apply, or none
    async fn rename_many(
        &self,
        ctx: &Context,
        renames: Vec<(i32, ExampleName)>,
    ) -> Result<u64, ServiceError>;
}

pub struct ExampleService<R, D> {
    repo: Arc<R>,
    manager: TxManager<D>,
}

impl<R, D> ExampleService<R, D>
where
    R: ExampleRepository,
    D: Database,
{
    pub fn new(repo: Arc<R>, manager: TxManager<D>) -> Self {
        Self { repo, manager }
    }
}

#[async_trait]
impl<R, D> ExampleApi for ExampleService<R, D>
where
    R: ExampleRepository + 'static,
    D: Database,
{
    async fn get(&self, ctx: &Context, id: i32) -> Result<Example, ServiceError> {
        let repo = &self.repo;
        self.manager
            .run_with_settings(ctx, TxSettings::read_only(), |ctx| async move {
                repo.get(&ctx, id).await
            })
            .await
    }

    async fn list(&self, ctx: &Context) -> Result<Vec<Example>, ServiceError> {
        let repo = &self.repo;
        self.manager
            .run_with_settings(ctx, TxSettings::read_only(), |ctx| async move {
                repo.list(&ctx).await
            })
            .await
    }

    async fn create(&self, ctx: &Context, name: ExampleName) -> Result<Example, ServiceError> {
        let repo = &self.repo;
        let created = self
            .manager
            .run(ctx, |ctx| async move { repo.create(&ctx, &name).await })
            .await?;

        tracing::info!(id = created.id, "example created");
        Ok(created)
    }

    async fn update(
        &self,
        ctx: &Context,
        id: i32,
        name: ExampleName,
    ) -> Result<Example, ServiceError> {
        let repo = &self.repo;
        self.manager
            .run(ctx, |ctx| async move {
                let mut example = repo.get(&ctx, id).await?;
                example.name = name.into_inner();
                repo.update(&ctx, &example).await?;
                Ok(example)
            })
            .await
    }

    async fn import(&self, ctx: &Context, names: Vec<ExampleName>) -> Result<u64, ServiceError> {
        let repo = &self.repo;
        let copied = self
            .manager
            .run(ctx, |ctx| async move { repo.import(&ctx, names).await })
            .await?;

        tracing::info!(copied, "examples imported");
        Ok(copied)
    }

    async fn rename_many(
        &self,
        ctx: &Context,
        renames: Vec<(i32, ExampleName)>,
    ) -> Result<u64, ServiceError> {
        let repo = &self.repo;
        self.manager
            .run(ctx, |ctx| async move { repo.rename_many(&ctx, renames).await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ExampleRepo;
    use txscope_core::fake::{FakeCall, FakeDatabase};
    use txscope_core::{params, Abort, Rows, TxGetter};

    fn service() -> (FakeDatabase, ExampleService<ExampleRepo, FakeDatabase>) {
        let db = FakeDatabase::new();
        let service = ExampleService::new(
            Arc::new(ExampleRepo::new(TxGetter::new())),
            TxManager::new(Arc::new(db.clone())),
        );
        (db, service)
    }

    fn example_rows(rows: Vec<(i32, &str)>) -> Rows {
        Rows::from_values(
            &["id", "name"],
            rows.into_iter().map(|(id, name)| params![id, name]).collect(),
        )
    }

    #[tokio::test]
    async fn reads_use_read_only_transactions() {
        let (db, service) = service();
        db.push_rows(example_rows(vec![(1, "a")]));
        db.push_rows(example_rows(vec![(1, "a"), (2, "b")]));

        let one = service.get(&Context::background(), 1).await.unwrap();
        let all = service.list(&Context::background()).await.unwrap();

        assert_eq!(one.name, "a");
        assert_eq!(all.len(), 2);
        assert_eq!(
            db.begun_settings(),
            vec![TxSettings::read_only(), TxSettings::read_only()]
        );
        assert_eq!(db.commit_count(), 2);
    }

    #[tokio::test]
    async fn update_reads_then_writes_in_one_transaction() {
        let (db, service) = service();
        db.push_rows(example_rows(vec![(4, "old")]));

        let updated = service
            .update(&Context::background(), 4, ExampleName::new("new").unwrap())
            .await
            .unwrap();

        assert_eq!(updated, Example { id: 4, name: "new".into() });
        assert_eq!(db.begun_settings(), vec![TxSettings::default()]);
        let calls = db.calls();
        assert!(matches!(calls[0], FakeCall::QueryRow { tx: 1, .. }));
        assert!(matches!(
            &calls[1],
            FakeCall::Execute { tx: 1, params, .. } if params == &params!["new", 4]
        ));
        assert_eq!(calls[2], FakeCall::Commit);
    }

    #[tokio::test]
    async fn update_of_missing_example_writes_nothing() {
        let (db, service) = service();

        let err = service
            .update(&Context::background(), 99, ExampleName::new("x").unwrap())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            TxError::Aborted(Abort::Work(RepoError::NotFound { .. }))
        ));
        assert!(db.executed().is_empty());
        assert_eq!(db.rollback_count(), 1);
    }

    #[tokio::test]
    async fn failed_import_leaves_nothing_behind() {
        let (db, service) = service();
        db.fail_statements_containing("COPY");

        let err = service
            .import(
                &Context::background(),
                vec![ExampleName::new("a").unwrap()],
            )
            .await
            .unwrap_err();

        assert!(err.work_error().is_some());
        assert_eq!(db.commit_count(), 0);
        assert_eq!(db.rollback_count(), 1);
    }

    #[tokio::test]
    async fn failing_rename_aborts_whole_batch() {
        let (db, service) = service();
        db.fail_statements_containing("UPDATE");

        let err = service
            .rename_many(
                &Context::background(),
                vec![
                    (1, ExampleName::new("a").unwrap()),
                    (2, ExampleName::new("b").unwrap()),
                ],
            )
            .await
            .unwrap_err();

        assert!(err.work_error().is_some());
        assert_eq!(db.rollback_count(), 1);
    }

    #[tokio::test]
    async fn create_commits() {
        let (db, service) = service();
        db.push_rows(example_rows(vec![(10, "fresh")]));

        let created = service
            .create(&Context::background(), ExampleName::new("fresh").unwrap())
            .await
            .unwrap();

        assert_eq!(created.id, 10);
        assert_eq!(db.commit_count(), 1);
    }
}
