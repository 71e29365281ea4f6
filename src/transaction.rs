//! Transactions with trace-id correlation.
//!
//! Every transaction carries a generated trace id that is attached to
//! the log records and errors of all statements run through it, so a
//! multi-statement unit of work can be followed across the op log.

use std::time::Duration;

use sqlx::MySql;

use crate::db::{self, Db, ExecResult};
use crate::error::{DbError, DbResult};
use crate::params::{Row, SqlValue};

/// Builds a fresh correlation id, e.g. `tx_9f8a61c2d4e04b7fa1b2c3d4e5f60718`.
pub(crate) fn generate_trace_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}

/// An open MySQL transaction.
///
/// Obtained from [`Db::begin`]. Must be finished explicitly with
/// [`Transaction::commit`] or [`Transaction::rollback`]; dropping an
/// unfinished transaction rolls it back on the driver side.
pub struct Transaction {
    inner: sqlx::Transaction<'static, MySql>,
    trace_id: String,
    db: Db,
}

impl Transaction {
    pub(crate) fn new(inner: sqlx::Transaction<'static, MySql>, trace_id: String, db: Db) -> Self {
        Self {
            inner,
            trace_id,
            db,
        }
    }

    /// Correlation id attached to everything this transaction logs.
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Runs a statement that returns no rows inside the transaction.
    pub async fn execute(&mut self, sql: &str, args: Vec<SqlValue>) -> DbResult<ExecResult> {
        self.run_execute(sql, args, None).await
    }

    /// Like [`Transaction::execute`] with an upper bound on runtime. The
    /// statement future is dropped on expiry; the transaction itself
    /// stays open and can still be rolled back.
    pub async fn execute_with_timeout(
        &mut self,
        sql: &str,
        args: Vec<SqlValue>,
        limit: Duration,
    ) -> DbResult<ExecResult> {
        self.run_execute(sql, args, Some(limit)).await
    }

    /// Runs a row-returning statement inside the transaction.
    pub async fn query(&mut self, sql: &str, args: Vec<SqlValue>) -> DbResult<Vec<Row>> {
        self.run_query(sql, args, None).await
    }

    /// Like [`Transaction::query`] with an upper bound on runtime.
    pub async fn query_with_timeout(
        &mut self,
        sql: &str,
        args: Vec<SqlValue>,
        limit: Duration,
    ) -> DbResult<Vec<Row>> {
        self.run_query(sql, args, Some(limit)).await
    }

    async fn run_execute(
        &mut self,
        sql: &str,
        args: Vec<SqlValue>,
        limit: Option<Duration>,
    ) -> DbResult<ExecResult> {
        let sql = sql.trim();
        if sql.is_empty() {
            return Err(DbError::statement("empty statement"));
        }
        let engine = self.db.inner();
        engine.trace_statement("exec", sql, &args, Some(&self.trace_id));
        let result = engine
            .observe(
                "exec",
                sql,
                Some(&self.trace_id),
                limit,
                db::execute_on(&mut *self.inner, sql, &args),
            )
            .await?;
        engine.metrics.record_affected_rows(result.rows_affected as i64);
        Ok(result)
    }

    async fn run_query(
        &mut self,
        sql: &str,
        args: Vec<SqlValue>,
        limit: Option<Duration>,
    ) -> DbResult<Vec<Row>> {
        let sql = sql.trim();
        if sql.is_empty() {
            return Err(DbError::statement("empty statement"));
        }
        let engine = self.db.inner();
        engine.trace_statement("query", sql, &args, Some(&self.trace_id));
        engine
            .observe(
                "query",
                sql,
                Some(&self.trace_id),
                limit,
                db::query_on(&mut *self.inner, sql, &args),
            )
            .await
    }

    /// Commits the transaction.
    pub async fn commit(self) -> DbResult<()> {
        let Self {
            inner,
            trace_id,
            db,
        } = self;
        let engine = db.inner();
        let started = std::time::Instant::now();
        match inner.commit().await {
            Ok(()) => {
                engine
                    .metrics
                    .record_query_duration("commit_transaction", started.elapsed());
                engine.trace_statement("commit_transaction", "COMMIT", &[], Some(&trace_id));
                Ok(())
            }
            Err(err) => {
                engine.metrics.record_error();
                Err(DbError::transaction(
                    format!("commit failed: {err}"),
                    trace_id,
                ))
            }
        }
    }

    /// Rolls the transaction back.
    pub async fn rollback(self) -> DbResult<()> {
        let Self {
            inner,
            trace_id,
            db,
        } = self;
        let engine = db.inner();
        let started = std::time::Instant::now();
        match inner.rollback().await {
            Ok(()) => {
                engine
                    .metrics
                    .record_query_duration("rollback_transaction", started.elapsed());
                engine.trace_statement("rollback_transaction", "ROLLBACK", &[], Some(&trace_id));
                Ok(())
            }
            Err(err) => {
                engine.metrics.record_error();
                Err(DbError::transaction(
                    format!("rollback failed: {err}"),
                    trace_id,
                ))
            }
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("trace_id", &self.trace_id)
            .finish_non_exhaustive()
    }
}
