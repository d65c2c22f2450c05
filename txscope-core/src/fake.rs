//! In-memory `Database` for tests
//!
//! Records every begin, statement, commit and rollback, and can be told to
//! fail or delay specific operations. Enabled with the `fake` feature.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::DbError;
use crate::tx::{Batch, BatchResults, CopySource, Database, Identifier, Transaction, Tx, TxSettings};
use crate::value::{Row, Rows, Value};

/// One recorded operation on a fake transaction
#[derive(Debug, Clone, PartialEq)]
pub enum FakeCall {
    Execute { tx: usize, sql: String, params: Vec<Value> },
    Query { tx: usize, sql: String },
    QueryRow { tx: usize, sql: String },
    CopyFrom { tx: usize, table: String, columns: Vec<String>, rows: usize },
    SendBatch { tx: usize, statements: usize },
    Commit,
    Rollback,
}

#[derive(Default)]
struct FakeState {
    fail_begin: bool,
    fail_commit: bool,
    fail_rollback: bool,
    fail_statements: Vec<String>,
    statement_delay: Option<Duration>,
    rows_affected: Option<u64>,
    scripted_rows: VecDeque<Rows>,
    begun: Vec<TxSettings>,
    calls: Vec<FakeCall>,
}

/// Shared handle to the fake's state. Clones observe the same recordings.
#[derive(Clone, Default)]
pub struct FakeDatabase {
    state: Arc<Mutex<FakeState>>,
}

impl FakeDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fail_begin(&self, fail: bool) {
        self.state().fail_begin = fail;
    }

    pub fn fail_commit(&self, fail: bool) {
        self.state().fail_commit = fail;
    }

    pub fn fail_rollback(&self, fail: bool) {
        self.state().fail_rollback = fail;
    }

    /// Statements containing `pattern` fail with a backend error
    pub fn fail_statements_containing(&self, pattern: impl Into<String>) {
        self.state().fail_statements.push(pattern.into());
    }

    /// Every statement waits this long (subject to context cancellation)
    pub fn delay_statements(&self, delay: Duration) {
        self.state().statement_delay = Some(delay);
    }

    /// Affected-row count reported by every `execute` (default 1)
    pub fn set_rows_affected(&self, rows: u64) {
        self.state().rows_affected = Some(rows);
    }

    /// Queue a result for the next `query` or `query_row`.
    ///
    /// Without queued results queries return no rows.
    pub fn push_rows(&self, rows: Rows) {
        self.state().scripted_rows.push_back(rows);
    }

    /// Settings passed to each `begin`, in order
    pub fn begun_settings(&self) -> Vec<TxSettings> {
        self.state().begun.clone()
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.state().calls.clone()
    }

    pub fn commit_count(&self) -> usize {
        self.count(|c| matches!(c, FakeCall::Commit))
    }

    pub fn rollback_count(&self) -> usize {
        self.count(|c| matches!(c, FakeCall::Rollback))
    }

    /// Statements executed, in order, across all transactions
    pub fn executed(&self) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                FakeCall::Execute { sql, .. } => Some(sql.clone()),
                _ => None,
            })
            .collect()
    }

    fn count(&self, pred: impl Fn(&FakeCall) -> bool) -> usize {
        self.state().calls.iter().filter(|c| pred(c)).count()
    }
}

#[async_trait]
impl Database for FakeDatabase {
    type Transaction = FakeTx;

    async fn begin(&self, ctx: &Context, settings: &TxSettings) -> Result<FakeTx, DbError> {
        if let Some(reason) = ctx.err() {
            return Err(reason.into());
        }
        let mut state = self.state();
        if state.fail_begin {
            return Err(DbError::backend("fake: connection refused"));
        }
        state.begun.push(*settings);
        let id = state.begun.len();
        drop(state);

        Ok(FakeTx {
            id,
            db: self.clone(),
            closed: Mutex::new(false),
        })
    }
}

/// Transaction handed out by `FakeDatabase`
pub struct FakeTx {
    id: usize,
    db: FakeDatabase,
    closed: Mutex<bool>,
}

impl FakeTx {
    /// 1-based sequence number of this transaction within its database
    pub fn id(&self) -> usize {
        self.id
    }

    fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self) -> Result<(), DbError> {
        let mut closed = self.closed.lock().unwrap_or_else(PoisonError::into_inner);
        if *closed {
            return Err(DbError::TxClosed);
        }
        *closed = true;
        Ok(())
    }

    /// Shared checks for every statement: open, not cancelled, delay, scripted failure
    async fn statement(&self, ctx: &Context, sql: &str) -> Result<(), DbError> {
        if self.is_closed() {
            return Err(DbError::TxClosed);
        }
        let delay = self.db.state().statement_delay;
        if let Some(delay) = delay {
            ctx.run(tokio::time::sleep(delay)).await?;
        }
        if let Some(reason) = ctx.err() {
            return Err(reason.into());
        }
        let failing = self
            .db
            .state()
            .fail_statements
            .iter()
            .any(|p| sql.contains(p.as_str()));
        if failing {
            return Err(DbError::backend(format!("fake: statement failed: {sql}")));
        }
        Ok(())
    }

    fn record(&self, call: FakeCall) {
        self.db.state().calls.push(call);
    }

    fn next_rows(&self) -> Rows {
        self.db
            .state()
            .scripted_rows
            .pop_front()
            .unwrap_or_else(|| Rows::from_values::<&str>(&[], Vec::new()))
    }
}

#[async_trait]
impl Tx for FakeTx {
    async fn execute(&self, ctx: &Context, sql: &str, params: &[Value]) -> Result<u64, DbError> {
        self.statement(ctx, sql).await?;
        self.record(FakeCall::Execute {
            tx: self.id,
            sql: sql.to_owned(),
            params: params.to_vec(),
        });
        Ok(self.db.state().rows_affected.unwrap_or(1))
    }

    async fn query(&self, ctx: &Context, sql: &str, _params: &[Value]) -> Result<Rows, DbError> {
        self.statement(ctx, sql).await?;
        self.record(FakeCall::Query {
            tx: self.id,
            sql: sql.to_owned(),
        });
        Ok(self.next_rows())
    }

    async fn query_row(&self, ctx: &Context, sql: &str, _params: &[Value]) -> Result<Row, DbError> {
        self.statement(ctx, sql).await?;
        self.record(FakeCall::QueryRow {
            tx: self.id,
            sql: sql.to_owned(),
        });
        self.next_rows().next().ok_or(DbError::NoRows)
    }

    async fn copy_from(
        &self,
        ctx: &Context,
        table: &Identifier,
        columns: &[&str],
        source: &mut (dyn CopySource + Send),
    ) -> Result<u64, DbError> {
        self.statement(ctx, "COPY").await?;
        let mut rows = 0;
        while let Some(row) = source.next_row()? {
            if row.len() != columns.len() {
                return Err(DbError::backend(format!(
                    "fake: copy row has {} values for {} columns",
                    row.len(),
                    columns.len()
                )));
            }
            rows += 1;
        }
        self.record(FakeCall::CopyFrom {
            tx: self.id,
            table: table.sanitize(),
            columns: columns.iter().map(|c| (*c).to_owned()).collect(),
            rows,
        });
        Ok(rows as u64)
    }

    async fn send_batch(&self, ctx: &Context, batch: Batch) -> BatchResults {
        let len = batch.len();
        let mut results = Vec::with_capacity(len);
        let mut aborted = false;
        for stmt in batch.statements() {
            if aborted {
                results.push(Err(DbError::BatchAborted));
                continue;
            }
            match self.statement(ctx, &stmt.sql).await {
                Ok(()) => {
                    let mut rows = self.next_rows();
                    if rows.columns().is_empty() {
                        rows = Rows::new(rows.columns().into(), Vec::new(), 1);
                    }
                    results.push(Ok(rows));
                }
                Err(e) => {
                    aborted = true;
                    results.push(Err(e));
                }
            }
        }
        self.record(FakeCall::SendBatch {
            tx: self.id,
            statements: len,
        });
        BatchResults::new(results)
    }
}

#[async_trait]
impl Transaction for FakeTx {
    async fn commit(&self, _ctx: &Context) -> Result<(), DbError> {
        self.close()?;
        self.record(FakeCall::Commit);
        if self.db.state().fail_commit {
            return Err(DbError::backend("fake: commit failed"));
        }
        Ok(())
    }

    async fn rollback(&self, _ctx: &Context) -> Result<(), DbError> {
        self.close()?;
        self.record(FakeCall::Rollback);
        if self.db.state().fail_rollback {
            return Err(DbError::backend("fake: rollback failed"));
        }
        Ok(())
    }
}
