//! Schema setup, applied atomically at startup

use txscope_core::{Context, Database, DbError, TxError, TxGetter, TxManager};

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS example (
        id SERIAL PRIMARY KEY,
        name TEXT NOT NULL CHECK (char_length(name) BETWEEN 1 AND 256)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS example_name_idx ON example (name)",
];

/// Run all migrations in one transaction
pub async fn run<D: Database>(
    ctx: &Context,
    manager: &TxManager<D>,
) -> Result<(), TxError<DbError>> {
    tracing::info!("Running migrations...");

    manager
        .run(ctx, |ctx| async move {
            let tx = TxGetter::new().require_tx(&ctx)?;
            for sql in STATEMENTS {
                tx.execute(&ctx, sql, &[]).await?;
            }
            Ok::<_, DbError>(())
        })
        .await?;

    tracing::info!(count = STATEMENTS.len(), "migrations applied");
    Ok(())
}
