//! Transactional capability surface
//!
//! `Tx` is the narrow set of operations repositories need. It deliberately
//! leaves out prepared-statement caching and named statements so that other
//! backends and in-memory fakes can implement it.

use std::collections::VecDeque;
use std::fmt;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::DbError;
use crate::value::{Row, Rows, Value};

/// Operations available on an active transaction
#[async_trait]
pub trait Tx: Send + Sync {
    /// Execute a statement, returning the number of affected rows
    async fn execute(&self, ctx: &Context, sql: &str, params: &[Value]) -> Result<u64, DbError>;

    /// Run a query. Each call opens a new server-side cursor.
    async fn query(&self, ctx: &Context, sql: &str, params: &[Value]) -> Result<Rows, DbError>;

    /// Run a query expected to return at least one row; extra rows are ignored.
    ///
    /// An empty result is `DbError::NoRows`.
    async fn query_row(&self, ctx: &Context, sql: &str, params: &[Value]) -> Result<Row, DbError>;

    /// Bulk-load rows into `table`, returning the number of rows copied
    async fn copy_from(
        &self,
        ctx: &Context,
        table: &Identifier,
        columns: &[&str],
        source: &mut (dyn CopySource + Send),
    ) -> Result<u64, DbError>;

    /// Submit queued statements in order
    async fn send_batch(&self, ctx: &Context, batch: Batch) -> BatchResults;
}

/// A transaction that can be resolved. Held only by the manager.
#[async_trait]
pub trait Transaction: Tx {
    async fn commit(&self, ctx: &Context) -> Result<(), DbError>;

    async fn rollback(&self, ctx: &Context) -> Result<(), DbError>;
}

/// Source of new transactions (the connection pool side)
#[async_trait]
pub trait Database: Send + Sync + 'static {
    type Transaction: Transaction + 'static;

    async fn begin(&self, ctx: &Context, settings: &TxSettings) -> Result<Self::Transaction, DbError>;
}

/// Transaction isolation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    ReadWrite,
    ReadOnly,
}

impl AccessMode {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::ReadWrite => "READ WRITE",
            Self::ReadOnly => "READ ONLY",
        }
    }
}

/// Settings for starting a transaction. `Default` leaves everything to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TxSettings {
    pub isolation: Option<IsolationLevel>,
    pub access_mode: Option<AccessMode>,
    pub deferrable: bool,
}

impl TxSettings {
    pub fn read_only() -> Self {
        Self {
            access_mode: Some(AccessMode::ReadOnly),
            ..Self::default()
        }
    }

    pub fn read_write() -> Self {
        Self {
            access_mode: Some(AccessMode::ReadWrite),
            ..Self::default()
        }
    }

    pub fn with_isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = Some(level);
        self
    }

    pub fn deferrable(mut self) -> Self {
        self.deferrable = true;
        self
    }

    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }

    /// `SET TRANSACTION` statement applying these settings, or `None` for server defaults
    pub fn set_transaction_sql(&self) -> Option<String> {
        let mut modes = Vec::with_capacity(3);
        if let Some(level) = self.isolation {
            modes.push(format!("ISOLATION LEVEL {}", level.as_sql()));
        }
        if let Some(mode) = self.access_mode {
            modes.push(mode.as_sql().to_owned());
        }
        if self.deferrable {
            modes.push("DEFERRABLE".to_owned());
        }
        if modes.is_empty() {
            None
        } else {
            Some(format!("SET TRANSACTION {}", modes.join(", ")))
        }
    }
}

/// Possibly schema-qualified identifier, e.g. `public.example`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier(Vec<String>);

impl Identifier {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }

    /// Quoted form safe to splice into SQL: `"public"."example"`
    pub fn sanitize(&self) -> String {
        self.0
            .iter()
            .map(|part| quote_ident(part))
            .collect::<Vec<_>>()
            .join(".")
    }
}

impl From<&str> for Identifier {
    fn from(name: &str) -> Self {
        Self(vec![name.to_owned()])
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sanitize())
    }
}

/// Double-quote an identifier, doubling embedded quotes and dropping NULs
pub fn quote_ident(name: &str) -> String {
    let escaped = name.replace('"', "\"\"").replace('\0', "");
    format!("\"{escaped}\"")
}

/// Rows fed to `Tx::copy_from`
pub trait CopySource {
    /// Next row, `Ok(None)` when exhausted
    fn next_row(&mut self) -> Result<Option<Vec<Value>>, DbError>;
}

/// Copy source over an in-memory list of rows
#[derive(Debug)]
pub struct CopyFromRows {
    rows: std::vec::IntoIter<Vec<Value>>,
}

impl CopyFromRows {
    pub fn new(rows: Vec<Vec<Value>>) -> Self {
        Self {
            rows: rows.into_iter(),
        }
    }
}

impl CopySource for CopyFromRows {
    fn next_row(&mut self) -> Result<Option<Vec<Value>>, DbError> {
        Ok(self.rows.next())
    }
}

/// Copy source over any iterator of fallible rows
pub struct CopyFromIter<I>(pub I);

impl<I> CopySource for CopyFromIter<I>
where
    I: Iterator<Item = Result<Vec<Value>, DbError>>,
{
    fn next_row(&mut self) -> Result<Option<Vec<Value>>, DbError> {
        self.0.next().transpose()
    }
}

/// Statement queued in a `Batch`
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Statements submitted together with `Tx::send_batch`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    statements: Vec<QueuedStatement>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&mut self, sql: impl Into<String>, params: Vec<Value>) -> &mut Self {
        self.statements.push(QueuedStatement {
            sql: sql.into(),
            params,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn statements(&self) -> &[QueuedStatement] {
        &self.statements
    }

    pub fn into_statements(self) -> Vec<QueuedStatement> {
        self.statements
    }
}

/// Results of a batch, read back in submission order
#[derive(Debug)]
pub struct BatchResults {
    results: VecDeque<Result<Rows, DbError>>,
}

impl BatchResults {
    pub fn new(results: Vec<Result<Rows, DbError>>) -> Self {
        Self {
            results: results.into(),
        }
    }

    /// Every statement fails with a copy of the same cause (e.g. closed transaction)
    pub fn failed(len: usize, cause: impl Fn() -> DbError) -> Self {
        Self::new((0..len).map(|_| Err(cause())).collect())
    }

    /// Remaining unread results
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Affected-row count of the next statement
    pub fn exec(&mut self) -> Result<u64, DbError> {
        self.query().map(|rows| rows.rows_affected())
    }

    /// Rows of the next statement
    pub fn query(&mut self) -> Result<Rows, DbError> {
        self.results
            .pop_front()
            .unwrap_or_else(|| Err(DbError::backend("no more batch results")))
    }

    /// Discard unread results, returning the first error among them
    pub fn close(self) -> Result<(), DbError> {
        self.results
            .into_iter()
            .find_map(Result::err)
            .map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params;

    #[test]
    fn default_settings_emit_nothing() {
        assert!(TxSettings::default().is_default());
        assert_eq!(TxSettings::default().set_transaction_sql(), None);
    }

    #[test]
    fn settings_render_set_transaction() {
        let settings = TxSettings::read_only()
            .with_isolation(IsolationLevel::Serializable)
            .deferrable();
        assert_eq!(
            settings.set_transaction_sql().as_deref(),
            Some("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE, READ ONLY, DEFERRABLE")
        );
    }

    #[test]
    fn identifier_quotes_each_part() {
        let id = Identifier::new(["public", "odd\"name"]);
        assert_eq!(id.sanitize(), r#""public"."odd""name""#);
        assert_eq!(Identifier::from("example").to_string(), r#""example""#);
    }

    #[test]
    fn copy_from_iter_stops_on_error() {
        let rows = vec![Ok(params![1]), Err(DbError::backend("bad row"))];
        let mut source = CopyFromIter(rows.into_iter());
        assert!(source.next_row().unwrap().is_some());
        assert!(source.next_row().is_err());
        assert!(source.next_row().unwrap().is_none());
    }

    #[test]
    fn batch_results_close_reports_first_error() {
        let results = BatchResults::new(vec![
            Ok(Rows::from_values(&["n"], vec![])),
            Err(DbError::backend("duplicate key")),
            Err(DbError::BatchAborted),
        ]);
        let err = results.close().unwrap_err();
        assert_eq!(err.to_string(), "backend error: duplicate key");
    }

    #[test]
    fn batch_results_past_end_is_an_error() {
        let mut results = BatchResults::new(vec![]);
        assert!(results.exec().is_err());
    }
}
