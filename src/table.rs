//! Table accessor: per-table fluent reads and writes.
//!
//! A [`Table`] is obtained from [`Db::table`] and carries the same
//! condition-composition surface as [`QueryBuilder`] plus terminal
//! operations that execute against the engine. Chain methods consume
//! and return the accessor; terminal operations consume it.
//!
//! Unscoped writes are rejected: `update` and `delete` require at least
//! one accumulated WHERE condition.

use std::time::Duration;

use futures_util::TryStreamExt;

use crate::builder::QueryBuilder;
use crate::cache::ShardedCache;
use crate::db::{self, Db};
use crate::error::{DbError, DbResult};
use crate::params::{self, Record, Row, SqlValue};
use crate::sanitize;

/// Fluent accessor for one table.
#[derive(Debug)]
pub struct Table {
    pub(crate) db: Db,
    pub(crate) builder: QueryBuilder,
    pub(crate) timeout: Option<Duration>,
}

impl Table {
    pub(crate) fn new(db: Db, table_name: String) -> Self {
        Self {
            db,
            builder: QueryBuilder::new(table_name),
            timeout: None,
        }
    }

    /// The prefixed, quoted name this accessor writes into statements.
    pub fn name(&self) -> &str {
        self.builder.table_name()
    }

    /// Set the projected fields for reads. Empty selects `*`.
    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.builder = self.builder.fields(fields);
        self
    }

    /// Add a condition joined with AND (subject to the tie-break policy).
    pub fn where_(mut self, condition: impl Into<String>, args: Vec<SqlValue>) -> Self {
        self.builder = self.builder.where_(condition, args);
        self
    }

    /// Add a condition joined with OR.
    pub fn or_where(mut self, condition: impl Into<String>, args: Vec<SqlValue>) -> Self {
        self.builder = self.builder.or_where(condition, args);
        self
    }

    /// Add a negated condition.
    pub fn not_where(mut self, condition: impl Into<String>, args: Vec<SqlValue>) -> Self {
        self.builder = self.builder.not_where(condition, args);
        self
    }

    /// Add a join clause, written verbatim after the table name.
    pub fn join(mut self, join: impl Into<String>) -> Self {
        self.builder = self.builder.join(join);
        self
    }

    pub fn group_by(mut self, group_by: impl Into<String>) -> Self {
        self.builder = self.builder.group_by(group_by);
        self
    }

    pub fn having(mut self, having: impl Into<String>) -> Self {
        self.builder = self.builder.having(having);
        self
    }

    pub fn order_by(mut self, order_by: impl Into<String>) -> Self {
        self.builder = self.builder.order_by(order_by);
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.builder = self.builder.limit(limit);
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.builder = self.builder.offset(offset);
        self
    }

    /// 1-based pagination, see [`QueryBuilder::page`].
    pub fn page(mut self, page: i64, page_size: i64) -> Self {
        self.builder = self.builder.page(page, page_size);
        self
    }

    /// Append `FOR UPDATE` to reads.
    pub fn for_update(mut self) -> Self {
        self.builder = self.builder.for_update();
        self
    }

    /// Bound the terminal operation's execution time. On expiry the
    /// operation aborts with a timeout error.
    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    /// Fetch the first matching row. `None` means no row matched;
    /// failures surface as errors.
    pub async fn find(self) -> DbResult<Option<Row>> {
        let Self {
            db,
            builder,
            timeout,
        } = self;
        let (sql, args) = builder.limit(1).build();
        let inner = db.inner();
        inner.ensure_open()?;
        inner.trace_statement("query", &sql, &args, None);
        inner
            .observe(
                "query",
                &sql,
                None,
                timeout,
                db::query_optional_on(&inner.pool, &sql, &args),
            )
            .await
    }

    /// Fetch all matching rows.
    pub async fn find_all(self) -> DbResult<Vec<Row>> {
        let Self {
            db,
            builder,
            timeout,
        } = self;
        let (sql, args) = builder.build();
        let inner = db.inner();
        inner.ensure_open()?;
        inner.trace_statement("query", &sql, &args, None);
        inner
            .observe(
                "query",
                &sql,
                None,
                timeout,
                db::query_on(&inner.pool, &sql, &args),
            )
            .await
    }

    /// Fetch all matching rows together with the unpaginated total, for
    /// paged listings that need both.
    pub async fn find_all_and_count(self) -> DbResult<(Vec<Row>, u64)> {
        let Self {
            db,
            builder,
            timeout,
        } = self;
        let (count_sql, count_args) = builder.build_count();
        let (sql, args) = builder.build();
        let inner = db.inner();
        inner.ensure_open()?;

        inner.trace_statement("query", &sql, &args, None);
        let rows = inner
            .observe(
                "query",
                &sql,
                None,
                timeout,
                db::query_on(&inner.pool, &sql, &args),
            )
            .await?;

        inner.trace_statement("query", &count_sql, &count_args, None);
        let total = inner
            .observe(
                "query",
                &count_sql,
                None,
                timeout,
                db::count_on(&inner.pool, &count_sql, &count_args),
            )
            .await?;
        Ok((rows, total))
    }

    /// Count matching rows, ignoring projection, ordering, and
    /// pagination.
    pub async fn count(self) -> DbResult<u64> {
        let Self {
            db,
            builder,
            timeout,
        } = self;
        let (sql, args) = builder.build_count();
        let inner = db.inner();
        inner.ensure_open()?;
        inner.trace_statement("query", &sql, &args, None);
        inner
            .observe(
                "query",
                &sql,
                None,
                timeout,
                db::count_on(&inner.pool, &sql, &args),
            )
            .await
    }

    /// Stream matching rows one at a time to `handler` without
    /// materializing the result set. Stops at the first handler error
    /// and propagates it. Returns the number of rows delivered.
    pub async fn find_each<F>(self, mut handler: F) -> DbResult<u64>
    where
        F: FnMut(Row) -> DbResult<()>,
    {
        let Self {
            db,
            builder,
            timeout,
        } = self;
        let (sql, args) = builder.build();
        let inner = db.inner();
        inner.ensure_open()?;
        inner.trace_statement("query", &sql, &args, None);

        let started = std::time::Instant::now();
        let drive = async {
            let mut stream = params::bind_values(sqlx::query(&sql), &args).fetch(&inner.pool);
            let mut delivered = 0u64;
            while let Some(row) = stream
                .try_next()
                .await
                .map_err(|e| DbError::execution("query", e))?
            {
                handler(params::row_to_map(&row))?;
                delivered += 1;
            }
            Ok::<u64, DbError>(delivered)
        };
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, drive).await {
                Ok(result) => result,
                Err(_) => {
                    inner.observe_err("query", &sql, "statement timed out", None);
                    return Err(DbError::timeout("query", limit.as_secs()));
                }
            },
            None => drive.await,
        };
        match outcome {
            Ok(delivered) => {
                inner.observe_ok("query", &sql, started.elapsed(), None);
                Ok(delivered)
            }
            Err(err) => {
                inner.observe_err("query", &sql, &err.to_string(), None);
                Err(err)
            }
        }
    }

    /// Insert one row. Field names are escaped; field order is the
    /// record's deterministic key order. Returns the id the server
    /// assigned, 0 when the table has no auto-increment column.
    pub async fn insert(self, record: Record) -> DbResult<u64> {
        let Self {
            db,
            builder,
            timeout,
        } = self;
        let inner = db.inner();
        inner.ensure_open()?;
        if record.is_empty() {
            return Err(DbError::statement("empty record"));
        }

        let (sql, args) =
            insert_statement(builder.table_name(), &record, &inner.placeholder_cache);
        inner.trace_statement("exec", &sql, &args, None);
        let result = inner
            .observe(
                "exec",
                &sql,
                None,
                timeout,
                db::execute_on(&inner.pool, &sql, &args),
            )
            .await?;
        inner.metrics.record_affected_rows(result.rows_affected as i64);
        Ok(result.last_insert_id)
    }

    /// Update matching rows. Requires at least one WHERE condition;
    /// an unscoped update is rejected. Returns affected rows.
    pub async fn update(self, record: Record) -> DbResult<u64> {
        let Self {
            db,
            builder,
            timeout,
        } = self;
        let inner = db.inner();
        inner.ensure_open()?;
        if record.is_empty() {
            return Err(DbError::statement("empty record"));
        }
        if !builder.has_conditions() {
            return Err(DbError::statement(
                "unscoped update rejected: add a where condition first",
            ));
        }

        let (where_clause, where_args) = builder.where_parts();
        let (sql, args) =
            update_statement(builder.table_name(), &record, &where_clause, where_args);
        inner.trace_statement("exec", &sql, &args, None);
        let result = inner
            .observe(
                "exec",
                &sql,
                None,
                timeout,
                db::execute_on(&inner.pool, &sql, &args),
            )
            .await?;
        inner.metrics.record_affected_rows(result.rows_affected as i64);
        Ok(result.rows_affected)
    }

    /// Delete matching rows. Requires at least one WHERE condition;
    /// an unscoped delete is rejected. Returns affected rows.
    pub async fn delete(self) -> DbResult<u64> {
        let Self {
            db,
            builder,
            timeout,
        } = self;
        let inner = db.inner();
        inner.ensure_open()?;
        if !builder.has_conditions() {
            return Err(DbError::statement(
                "unscoped delete rejected: add a where condition first",
            ));
        }

        let (where_clause, where_args) = builder.where_parts();
        let sql = format!(
            "DELETE FROM {} WHERE {}",
            builder.table_name(),
            where_clause
        );
        inner.trace_statement("exec", &sql, &where_args, None);
        let result = inner
            .observe(
                "exec",
                &sql,
                None,
                timeout,
                db::execute_on(&inner.pool, &sql, &where_args),
            )
            .await?;
        inner.metrics.record_affected_rows(result.rows_affected as i64);
        Ok(result.rows_affected)
    }
}

/// Assembles a single-row INSERT from a record, escaping field names and
/// pulling the placeholder group from the cache.
pub(crate) fn insert_statement(
    table: &str,
    record: &Record,
    cache: &ShardedCache,
) -> (String, Vec<SqlValue>) {
    let fields: Vec<String> = record
        .keys()
        .map(|k| sanitize::escape_identifier(k))
        .collect();
    let placeholder = sanitize::cached_placeholder(record.len(), cache);
    let sql = format!(
        "INSERT INTO {} ({}) VALUES {}",
        table,
        fields.join(", "),
        placeholder
    );
    (sql, record.values().cloned().collect())
}

/// Assembles an UPDATE from a record and a rendered WHERE clause. The
/// record's values come first in the argument list, then the WHERE
/// arguments, matching placeholder order.
pub(crate) fn update_statement(
    table: &str,
    record: &Record,
    where_clause: &str,
    where_args: Vec<SqlValue>,
) -> (String, Vec<SqlValue>) {
    let assignments: Vec<String> = record
        .keys()
        .map(|k| format!("{} = ?", sanitize::escape_identifier(k)))
        .collect();
    let sql = format!(
        "UPDATE {} SET {} WHERE {}",
        table,
        assignments.join(", "),
        where_clause
    );
    let mut args: Vec<SqlValue> = record.values().cloned().collect();
    args.extend(where_args);
    (sql, args)
}
