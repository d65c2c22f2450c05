//! Example repository
//!
//! Every method runs on the transaction carried by the context it is given;
//! calling one outside a unit of work fails with `DbError::NoTransaction`.

use async_trait::async_trait;
use txscope_core::{
    params, Batch, Context, CopyFromRows, DbError, FromRow, Identifier, TxGetter,
};

use super::RepoError;
use crate::models::{Example, ExampleName};

const RESOURCE: &str = "example";

/// Persistence operations the example service needs
#[async_trait]
pub trait ExampleRepository: Send + Sync {
    async fn get(&self, ctx: &Context, id: i32) -> Result<Example, RepoError>;

    async fn list(&self, ctx: &Context) -> Result<Vec<Example>, RepoError>;

    async fn create(&self, ctx: &Context, name: &ExampleName) -> Result<Example, RepoError>;

    /// Fails with `NotFound` when no row has `example.id`
    async fn update(&self, ctx: &Context, example: &Example) -> Result<(), RepoError>;

    /// Bulk insert; returns the number of rows copied
    async fn import(&self, ctx: &Context, names: Vec<ExampleName>) -> Result<u64, RepoError>;

    /// Rename several rows in one round trip; returns the rows changed
    async fn rename_many(
        &self,
        ctx: &Context,
        renames: Vec<(i32, ExampleName)>,
    ) -> Result<u64, RepoError>;
}

/// Postgres-backed `ExampleRepository`
#[derive(Debug, Clone, Copy, Default)]
pub struct ExampleRepo {
    getter: TxGetter,
}

impl ExampleRepo {
    pub fn new(getter: TxGetter) -> Self {
        Self { getter }
    }
}

fn not_found(id: i32) -> RepoError {
    RepoError::NotFound {
        resource: RESOURCE,
        id: id.to_string(),
    }
}

#[async_trait]
impl ExampleRepository for ExampleRepo {
    async fn get(&self, ctx: &Context, id: i32) -> Result<Example, RepoError> {
        let tx = self.getter.require_tx(ctx)?;

        let row = tx
            .query_row(ctx, "SELECT id, name FROM example WHERE id = $1", &params![id])
            .await
            .map_err(|e| match e {
                DbError::NoRows => not_found(id),
                e => e.into(),
            })?;

        Ok(Example::from_row(&row)?)
    }

    async fn list(&self, ctx: &Context) -> Result<Vec<Example>, RepoError> {
        let tx = self.getter.require_tx(ctx)?;

        let rows = tx
            .query(ctx, "SELECT id, name FROM example ORDER BY id", &[])
            .await?;

        Ok(rows.collect_as()?)
    }

    async fn create(&self, ctx: &Context, name: &ExampleName) -> Result<Example, RepoError> {
        let tx = self.getter.require_tx(ctx)?;

        let row = tx
            .query_row(
                ctx,
                "INSERT INTO example (name) VALUES ($1) RETURNING id, name",
                &params![name.as_str()],
            )
            .await?;

        Ok(Example::from_row(&row)?)
    }

    async fn update(&self, ctx: &Context, example: &Example) -> Result<(), RepoError> {
        let tx = self.getter.require_tx(ctx)?;

        let affected = tx
            .execute(
                ctx,
                "UPDATE example SET name = $1 WHERE id = $2",
                &params![example.name.as_str(), example.id],
            )
            .await?;

        if affected == 0 {
            return Err(not_found(example.id));
        }
        Ok(())
    }

    async fn import(&self, ctx: &Context, names: Vec<ExampleName>) -> Result<u64, RepoError> {
        let tx = self.getter.require_tx(ctx)?;

        let mut source = CopyFromRows::new(
            names
                .into_iter()
                .map(|name| params![name.into_inner()])
                .collect(),
        );
        let copied = tx
            .copy_from(ctx, &Identifier::from(RESOURCE), &["name"], &mut source)
            .await?;

        Ok(copied)
    }

    async fn rename_many(
        &self,
        ctx: &Context,
        renames: Vec<(i32, ExampleName)>,
    ) -> Result<u64, RepoError> {
        let tx = self.getter.require_tx(ctx)?;

        let mut batch = Batch::new();
        for (id, name) in &renames {
            batch.queue(
                "UPDATE example SET name = $1 WHERE id = $2",
                params![name.as_str(), *id],
            );
        }

        let mut results = tx.send_batch(ctx, batch).await;
        let mut changed = 0;
        for _ in &renames {
            changed += results.exec()?;
        }
        results.close()?;

        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use txscope_core::fake::{FakeCall, FakeDatabase};
    use txscope_core::{Rows, TxManager};

    fn setup() -> (FakeDatabase, TxManager<FakeDatabase>, ExampleRepo) {
        let db = FakeDatabase::new();
        let manager = TxManager::new(Arc::new(db.clone()));
        (db, manager, ExampleRepo::new(TxGetter::new()))
    }

    #[tokio::test]
    async fn fails_outside_unit_of_work() {
        let repo = ExampleRepo::default();

        let err = repo.get(&Context::background(), 1).await.unwrap_err();
        assert!(matches!(err, RepoError::Db(DbError::NoTransaction)));
    }

    #[tokio::test]
    async fn get_maps_no_rows_to_not_found() {
        let (_db, manager, repo) = setup();

        let err = manager
            .run(&Context::background(), |ctx| async move { repo.get(&ctx, 9).await })
            .await
            .unwrap_err()
            .into_work_error()
            .unwrap();

        assert!(matches!(err, RepoError::NotFound { resource: "example", ref id } if id == "9"));
    }

    #[tokio::test]
    async fn get_decodes_row() {
        let (db, manager, repo) = setup();
        db.push_rows(Rows::from_values(&["id", "name"], vec![params![3, "gear"]]));

        let example = manager
            .run(&Context::background(), |ctx| async move { repo.get(&ctx, 3).await })
            .await
            .unwrap();

        assert_eq!(example, Example { id: 3, name: "gear".into() });
        assert!(matches!(
            &db.calls()[0],
            FakeCall::QueryRow { sql, .. } if sql.contains("WHERE id = $1")
        ));
    }

    #[tokio::test]
    async fn update_without_match_is_not_found() {
        let (db, manager, repo) = setup();
        db.set_rows_affected(0);

        let err = manager
            .run(&Context::background(), |ctx| async move {
                repo.update(&ctx, &Example { id: 1, name: "x".into() }).await
            })
            .await
            .unwrap_err();

        assert!(matches!(err.work_error(), Some(RepoError::NotFound { .. })));
        assert_eq!(db.rollback_count(), 1);
    }

    #[tokio::test]
    async fn import_copies_names() {
        let (db, manager, repo) = setup();
        let names = vec![
            ExampleName::new("a").unwrap(),
            ExampleName::new("b").unwrap(),
        ];

        let copied = manager
            .run(&Context::background(), |ctx| async move { repo.import(&ctx, names).await })
            .await
            .unwrap();

        assert_eq!(copied, 2);
        assert!(db.calls().contains(&FakeCall::CopyFrom {
            tx: 1,
            table: "\"example\"".into(),
            columns: vec!["name".into()],
            rows: 2,
        }));
    }

    #[tokio::test]
    async fn rename_many_sends_one_batch() {
        let (db, manager, repo) = setup();
        let renames = vec![
            (1, ExampleName::new("one").unwrap()),
            (2, ExampleName::new("two").unwrap()),
        ];

        let changed = manager
            .run(&Context::background(), |ctx| async move {
                repo.rename_many(&ctx, renames).await
            })
            .await
            .unwrap();

        assert_eq!(changed, 2);
        assert!(db
            .calls()
            .contains(&FakeCall::SendBatch { tx: 1, statements: 2 }));
    }

    #[tokio::test]
    async fn create_binds_name() {
        let (db, manager, repo) = setup();
        db.push_rows(Rows::from_values(&["id", "name"], vec![params![1, "fresh"]]));
        let name = ExampleName::new("fresh").unwrap();

        let created = manager
            .run(&Context::background(), |ctx| async move { repo.create(&ctx, &name).await })
            .await
            .unwrap();

        assert_eq!(created.id, 1);
        assert_eq!(db.commit_count(), 1);
        assert!(matches!(
            &db.calls()[0],
            FakeCall::QueryRow { sql, .. } if sql.starts_with("INSERT INTO example")
        ));
    }
}
