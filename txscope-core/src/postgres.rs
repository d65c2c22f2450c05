//! PostgreSQL backend over sqlx
//!
//! - `PgDatabase` wraps a `PgPool` and begins transactions with `TxSettings`
//! - `PgTransaction` implements `Tx` over one pooled connection
//! - every driver call is raced against the caller's `Context`; a call cut
//!   short by cancellation is also cancelled on the server

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use futures::TryStreamExt;
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{
    PgArgumentBuffer, PgArguments, PgConnection, PgPoolOptions, PgRow, PgTypeInfo,
};
use sqlx::query::Query;
use sqlx::{Column, Connection, Either, Executor, PgPool, Postgres, Row as _, TypeInfo, ValueRef};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::context::{Cancelled, Context};
use crate::error::DbError;
use crate::tx::{
    quote_ident, Batch, BatchResults, CopySource, Database, Identifier, Transaction, Tx, TxSettings,
};
use crate::value::{Row, Rows, Value};

/// Default maximum connections for the pool.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// COPY data is flushed to the server in chunks of about this size
const COPY_CHUNK_BYTES: usize = 64 * 1024;

/// Upper bound on asking the server to cancel an abandoned statement
const CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a PostgreSQL connection pool with the default connection limit.
pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    create_pool_with_options(database_url, DEFAULT_MAX_CONNECTIONS).await
}

/// Create a PostgreSQL connection pool.
///
/// # Arguments
///
/// * `database_url` - PostgreSQL connection string
/// * `max_connections` - Maximum number of connections in the pool
pub async fn create_pool_with_options(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

/// Transaction source backed by a `PgPool`
#[derive(Debug, Clone)]
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and verify the server answers a ping.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let db = PgDatabase::connect(&ctx, "postgres://localhost/app", 5).await?;
    /// ```
    pub async fn connect(
        ctx: &Context,
        database_url: &str,
        max_connections: u32,
    ) -> Result<Self, DbError> {
        let pool = ctx
            .run(create_pool_with_options(database_url, max_connections))
            .await??;
        ctx.run(ping(&pool)).await??;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn ping(pool: &PgPool) -> Result<(), sqlx::Error> {
    let mut conn = pool.acquire().await?;
    conn.ping().await
}

#[async_trait]
impl Database for PgDatabase {
    type Transaction = PgTransaction;

    async fn begin(&self, ctx: &Context, settings: &TxSettings) -> Result<PgTransaction, DbError> {
        let mut tx = ctx.run(self.pool.begin()).await??;
        // Dropping `tx` on failure rolls it back.
        if let Some(sql) = settings.set_transaction_sql() {
            ctx.run(sqlx::query(&sql).execute(&mut *tx)).await??;
        }
        let backend_pid: i32 = ctx
            .run(sqlx::query_scalar("SELECT pg_backend_pid()").fetch_one(&mut *tx))
            .await??;
        Ok(PgTransaction {
            inner: Mutex::new(Some(tx)),
            pool: self.pool.clone(),
            backend_pid,
        })
    }
}

type Inner = Option<sqlx::Transaction<'static, Postgres>>;

/// One in-flight Postgres transaction.
///
/// The connection is returned to the pool when the transaction is committed
/// or rolled back; afterwards every call fails with `DbError::TxClosed`.
pub struct PgTransaction {
    inner: Mutex<Inner>,
    /// Used to cancel a statement on the server from another connection
    pool: PgPool,
    backend_pid: i32,
}

impl PgTransaction {
    /// Server process serving this transaction
    pub fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    /// Finish a driver call raced against a context.
    ///
    /// If the context ended first, the statement may still be running on the
    /// server; it is cancelled there so the connection is free for the
    /// rollback that follows.
    async fn settle<T>(
        &self,
        conn: &mut PgConnection,
        outcome: Result<T, Cancelled>,
    ) -> Result<T, DbError> {
        match outcome {
            Ok(out) => Ok(out),
            Err(reason) => {
                self.interrupt(conn).await;
                Err(reason.into())
            }
        }
    }

    async fn interrupt(&self, conn: &mut PgConnection) {
        let cancel = sqlx::query("SELECT pg_cancel_backend($1)")
            .bind(self.backend_pid)
            .execute(&self.pool);
        match tokio::time::timeout(CANCEL_TIMEOUT, cancel).await {
            Ok(Ok(_)) => debug!(pid = self.backend_pid, "statement cancelled on server"),
            Ok(Err(err)) => {
                warn!(pid = self.backend_pid, %err, "failed to cancel statement on server");
                return;
            }
            Err(_) => {
                warn!(pid = self.backend_pid, "timed out cancelling statement on server");
                return;
            }
        }
        // The cancelled statement's error is still queued on the connection;
        // the first ping may surface it, the next one finds the connection idle.
        for _ in 0..2 {
            if conn.ping().await.is_ok() {
                break;
            }
        }
    }
}

/// Live context check before a driver call starts
fn live(ctx: &Context) -> Result<(), DbError> {
    match ctx.err() {
        Some(reason) => Err(reason.into()),
        None => Ok(()),
    }
}

fn open<'a>(guard: &'a mut MutexGuard<'_, Inner>) -> Result<&'a mut PgConnection, DbError> {
    (**guard).as_mut().map(|tx| &mut **tx).ok_or(DbError::TxClosed)
}

#[async_trait]
impl Tx for PgTransaction {
    async fn execute(&self, ctx: &Context, sql: &str, params: &[Value]) -> Result<u64, DbError> {
        debug!(sql, "execute");
        live(ctx)?;
        let mut guard = self.inner.lock().await;
        let conn = open(&mut guard)?;
        let outcome = ctx
            .run(bind_params(sqlx::query(sql), params).execute(&mut *conn))
            .await;
        let done = self.settle(conn, outcome).await??;
        Ok(done.rows_affected())
    }

    async fn query(&self, ctx: &Context, sql: &str, params: &[Value]) -> Result<Rows, DbError> {
        debug!(sql, "query");
        live(ctx)?;
        let mut guard = self.inner.lock().await;
        let conn = open(&mut guard)?;
        let outcome = ctx.run(fetch_rows(&mut *conn, sql, params)).await;
        self.settle(conn, outcome).await?
    }

    async fn query_row(&self, ctx: &Context, sql: &str, params: &[Value]) -> Result<Row, DbError> {
        debug!(sql, "query row");
        live(ctx)?;
        let mut guard = self.inner.lock().await;
        let conn = open(&mut guard)?;
        let outcome = ctx
            .run(bind_params(sqlx::query(sql), params).fetch_optional(&mut *conn))
            .await;
        let row = self.settle(conn, outcome).await??.ok_or(DbError::NoRows)?;
        Ok(Row::new(column_names(&row), decode_row(&row)?))
    }

    async fn copy_from(
        &self,
        ctx: &Context,
        table: &Identifier,
        columns: &[&str],
        source: &mut (dyn CopySource + Send),
    ) -> Result<u64, DbError> {
        let statement = format!(
            "COPY {} ({}) FROM STDIN",
            table.sanitize(),
            columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ")
        );
        debug!(sql = %statement, "copy");
        live(ctx)?;
        let mut guard = self.inner.lock().await;
        let conn = open(&mut guard)?;
        let outcome = ctx
            .run(copy_rows(&mut *conn, &statement, columns.len(), source))
            .await;
        self.settle(conn, outcome).await?
    }

    async fn send_batch(&self, ctx: &Context, batch: Batch) -> BatchResults {
        let len = batch.len();
        debug!(statements = len, "send batch");
        let mut guard = self.inner.lock().await;
        let conn = match open(&mut guard) {
            Ok(conn) => conn,
            Err(_) => return BatchResults::failed(len, || DbError::TxClosed),
        };

        let mut results = Vec::with_capacity(len);
        let mut statements = batch.into_statements().into_iter();
        for stmt in statements.by_ref() {
            let result = match live(ctx) {
                Ok(()) => {
                    let outcome = ctx.run(fetch_rows(&mut *conn, &stmt.sql, &stmt.params)).await;
                    self.settle(&mut *conn, outcome).await.and_then(|r| r)
                }
                Err(e) => Err(e),
            };
            let failed = result.is_err();
            results.push(result);
            if failed {
                break;
            }
        }
        results.extend(statements.map(|_| Err(DbError::BatchAborted)));
        BatchResults::new(results)
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn commit(&self, ctx: &Context) -> Result<(), DbError> {
        let tx = self.inner.lock().await.take().ok_or(DbError::TxClosed)?;
        ctx.run(tx.commit()).await??;
        Ok(())
    }

    async fn rollback(&self, ctx: &Context) -> Result<(), DbError> {
        let tx = self.inner.lock().await.take().ok_or(DbError::TxClosed)?;
        ctx.run(tx.rollback()).await??;
        Ok(())
    }
}

fn bind_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &[Value],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param.clone() {
            Value::Null => query.bind(UntypedNull),
            Value::Bool(b) => query.bind(b),
            Value::Int(i) => query.bind(i),
            Value::Float(f) => query.bind(f),
            Value::Text(s) => query.bind(s),
            Value::Bytes(b) => query.bind(b),
            Value::Uuid(u) => query.bind(u),
            Value::Timestamp(t) => query.bind(t),
            Value::Json(j) => query.bind(sqlx::types::Json(j)),
        };
    }
    query
}

/// NULL parameter sent with an unspecified type, so the server infers it
/// from the statement like an untyped literal.
struct UntypedNull;

impl sqlx::Type<Postgres> for UntypedNull {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(0))
    }
}

impl sqlx::Encode<'_, Postgres> for UntypedNull {
    fn encode_by_ref(&self, _buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        Ok(IsNull::Yes)
    }
}

async fn fetch_rows(conn: &mut PgConnection, sql: &str, params: &[Value]) -> Result<Rows, DbError> {
    let query = bind_params(sqlx::query(sql), params);
    let mut stream = conn.fetch_many(query);

    let mut columns = None;
    let mut rows = Vec::new();
    let mut rows_affected = 0;
    while let Some(item) = stream.try_next().await? {
        match item {
            Either::Left(done) => rows_affected += done.rows_affected(),
            Either::Right(row) => {
                if columns.is_none() {
                    columns = Some(column_names(&row));
                }
                rows.push(decode_row(&row)?);
            }
        }
    }

    let columns = columns.unwrap_or_else(|| Arc::from(Vec::<String>::new()));
    Ok(Rows::new(columns, rows, rows_affected))
}

async fn copy_rows(
    conn: &mut PgConnection,
    statement: &str,
    width: usize,
    source: &mut (dyn CopySource + Send),
) -> Result<u64, DbError> {
    let mut copy = conn.copy_in_raw(statement).await?;
    let mut buf = Vec::with_capacity(COPY_CHUNK_BYTES);

    loop {
        let row = match source.next_row() {
            Ok(Some(row)) if row.len() == width => row,
            Ok(Some(row)) => {
                copy.abort("row width mismatch").await?;
                return Err(DbError::backend(format!(
                    "copy row has {} values for {} columns",
                    row.len(),
                    width
                )));
            }
            Ok(None) => break,
            Err(e) => {
                copy.abort("row source failed").await?;
                return Err(e);
            }
        };
        encode_copy_row(&mut buf, &row);
        if buf.len() >= COPY_CHUNK_BYTES {
            copy.send(std::mem::take(&mut buf)).await?;
        }
    }

    if !buf.is_empty() {
        copy.send(buf).await?;
    }
    Ok(copy.finish().await?)
}

fn column_names(row: &PgRow) -> Arc<[String]> {
    row.columns().iter().map(|c| c.name().to_owned()).collect()
}

fn decode_row(row: &PgRow) -> Result<Vec<Value>, DbError> {
    row.columns()
        .iter()
        .map(|col| decode_cell(row, col.ordinal(), col.name(), col.type_info().name()))
        .collect()
}

fn decode_cell(row: &PgRow, idx: usize, column: &str, type_name: &str) -> Result<Value, DbError> {
    if row.try_get_raw(idx)?.is_null() {
        return Ok(Value::Null);
    }
    let value = match type_name {
        "BOOL" => Value::Bool(row.try_get(idx)?),
        "INT2" => Value::Int(row.try_get::<i16, _>(idx)?.into()),
        "INT4" => Value::Int(row.try_get::<i32, _>(idx)?.into()),
        "INT8" => Value::Int(row.try_get(idx)?),
        "FLOAT4" => Value::Float(row.try_get::<f32, _>(idx)?.into()),
        "FLOAT8" => Value::Float(row.try_get(idx)?),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => Value::Text(row.try_get(idx)?),
        "BYTEA" => Value::Bytes(row.try_get(idx)?),
        "UUID" => Value::Uuid(row.try_get(idx)?),
        "TIMESTAMPTZ" => Value::Timestamp(row.try_get(idx)?),
        "TIMESTAMP" => Value::Timestamp(row.try_get::<NaiveDateTime, _>(idx)?.and_utc()),
        "JSON" | "JSONB" => Value::Json(row.try_get(idx)?),
        other => {
            return Err(DbError::decode(
                column,
                format!("unsupported column type {other}"),
            ))
        }
    };
    Ok(value)
}

const HEX: &[u8; 16] = b"0123456789abcdef";

/// Append one row in COPY text format
fn encode_copy_row(buf: &mut Vec<u8>, row: &[Value]) {
    for (i, value) in row.iter().enumerate() {
        if i > 0 {
            buf.push(b'\t');
        }
        match value {
            Value::Null => buf.extend_from_slice(b"\\N"),
            Value::Bool(b) => buf.push(if *b { b't' } else { b'f' }),
            Value::Int(n) => buf.extend_from_slice(n.to_string().as_bytes()),
            Value::Float(f) => buf.extend_from_slice(f.to_string().as_bytes()),
            Value::Text(s) => escape_copy_text(buf, s),
            Value::Bytes(bytes) => {
                // bytea hex input, backslash doubled for the COPY layer
                buf.extend_from_slice(b"\\\\x");
                for b in bytes {
                    buf.push(HEX[(b >> 4) as usize]);
                    buf.push(HEX[(b & 0x0f) as usize]);
                }
            }
            Value::Uuid(u) => buf.extend_from_slice(u.to_string().as_bytes()),
            Value::Timestamp(t) => buf.extend_from_slice(t.to_rfc3339().as_bytes()),
            Value::Json(j) => escape_copy_text(buf, &j.to_string()),
        }
    }
    buf.push(b'\n');
}

fn escape_copy_text(buf: &mut Vec<u8>, s: &str) {
    for b in s.bytes() {
        match b {
            b'\\' => buf.extend_from_slice(b"\\\\"),
            b'\t' => buf.extend_from_slice(b"\\t"),
            b'\n' => buf.extend_from_slice(b"\\n"),
            b'\r' => buf.extend_from_slice(b"\\r"),
            _ => buf.push(b),
        }
    }
}
