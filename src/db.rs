//! Connection engine.
//!
//! [`Db`] owns the MySQL pool together with the observability pipelines
//! (async metrics, async log writer, statement-fragment caches) and the
//! background samplers that keep idle connections alive and pool gauges
//! fresh. The handle is cheap to clone; all clones share one engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value as JsonValue;
use sqlx::Connection;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at, timeout};
use tracing::{info, warn};

use crate::cache::{CacheStats, ShardedCache};
use crate::config::Config;
use crate::error::{DbError, DbResult};
use crate::logging::{AsyncLogger, LogLevel, LogRecord, RotatingFileWriter};
use crate::metrics::{AsyncMetrics, MetricsSnapshot};
use crate::params::{self, Row, SqlValue};
use crate::sanitize;
use crate::table::Table;
use crate::transaction::{self, Transaction};

/// Interval between background keepalive pings.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Upper bound on a single keepalive acquire-and-ping round.
const KEEPALIVE_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a statement that does not return rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub rows_affected: u64,
    /// Auto-increment id assigned by the server, 0 when none was generated.
    pub last_insert_id: u64,
}

/// Point-in-time connection pool gauges.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct PoolStats {
    pub max_open: u32,
    pub open: u32,
    pub in_use: u32,
    pub idle: u32,
}

/// Hit/miss counters for the two statement-fragment caches.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DbCacheStats {
    pub placeholder: CacheStats,
    pub table_name: CacheStats,
}

/// Shared state behind a [`Db`] handle.
pub(crate) struct DbInner {
    pub(crate) pool: MySqlPool,
    pub(crate) db_name: String,
    pub(crate) table_prefix: String,
    pub(crate) slow_query_threshold: Duration,
    pub(crate) debug: bool,
    max_connections: u32,
    pub(crate) metrics: AsyncMetrics,
    pub(crate) logger: AsyncLogger,
    pub(crate) placeholder_cache: ShardedCache,
    pub(crate) table_cache: ShardedCache,
    pool_stats: RwLock<PoolStats>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl DbInner {
    pub(crate) fn ensure_open(&self) -> DbResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::connection("database handle is closed"));
        }
        Ok(())
    }

    /// Emits a debug record carrying the statement text and rendered
    /// arguments. Active only when the engine runs in debug mode.
    pub(crate) fn trace_statement(
        &self,
        operation: &str,
        sql: &str,
        args: &[SqlValue],
        trace_id: Option<&str>,
    ) {
        if !self.debug || !self.logger.enabled(LogLevel::Debug) {
            return;
        }
        let rendered: Vec<JsonValue> = args.iter().map(SqlValue::to_json).collect();
        let mut record = LogRecord::new(LogLevel::Debug, operation)
            .with_field("sql", sql)
            .with_field("args", JsonValue::Array(rendered));
        if let Some(id) = trace_id {
            record = record.with_field("trace_id", id);
        }
        self.logger.log(record);
    }

    /// Records the duration of a finished statement and flags it as slow
    /// when it ran past the configured threshold.
    pub(crate) fn observe_ok(
        &self,
        operation: &str,
        sql: &str,
        duration: Duration,
        trace_id: Option<&str>,
    ) {
        self.metrics.record_query_duration(operation, duration);
        if duration > self.slow_query_threshold {
            self.metrics.record_slow_query();
            let mut record = LogRecord::new(LogLevel::Warn, "slow query")
                .with_field("operation", operation)
                .with_field("sql", sql)
                .with_field("duration_ms", duration.as_millis() as u64);
            if let Some(id) = trace_id {
                record = record.with_field("trace_id", id);
            }
            self.logger.log(record);
            warn!(
                database = %self.db_name,
                operation,
                duration_ms = duration.as_millis() as u64,
                "slow query"
            );
        }
    }

    pub(crate) fn observe_err(
        &self,
        operation: &str,
        sql: &str,
        message: &str,
        trace_id: Option<&str>,
    ) {
        self.metrics.record_error();
        let mut record = LogRecord::new(LogLevel::Error, "statement failed")
            .with_field("operation", operation)
            .with_field("sql", sql)
            .with_field("error", message);
        if let Some(id) = trace_id {
            record = record.with_field("trace_id", id);
        }
        self.logger.log(record);
    }

    /// Drives a driver call with the standard observation wrapping:
    /// optional deadline, duration metric, slow-query detection, and
    /// error accounting. `fut` is the not-yet-awaited driver future.
    pub(crate) async fn observe<T, Fut>(
        &self,
        operation: &str,
        sql: &str,
        trace_id: Option<&str>,
        limit: Option<Duration>,
        fut: Fut,
    ) -> DbResult<T>
    where
        Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        let started = std::time::Instant::now();
        let outcome = match limit {
            Some(limit) => match timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => {
                    self.observe_err(operation, sql, "statement timed out", trace_id);
                    return Err(DbError::timeout(operation, limit.as_secs()));
                }
            },
            None => fut.await,
        };
        match outcome {
            Ok(value) => {
                self.observe_ok(operation, sql, started.elapsed(), trace_id);
                Ok(value)
            }
            Err(err) => {
                self.observe_err(operation, sql, &err.to_string(), trace_id);
                Err(DbError::execution(operation, err))
            }
        }
    }

    fn sample_pool_stats(&self) -> PoolStats {
        let open = self.pool.size();
        let idle = self.pool.num_idle() as u32;
        let stats = PoolStats {
            max_open: self.max_connections,
            open,
            in_use: open.saturating_sub(idle),
            idle,
        };
        if let Ok(mut slot) = self.pool_stats.write() {
            *slot = stats;
        }
        stats
    }
}

/// Runs a non-returning statement on any executor and normalizes the
/// driver result. Shared by the pool-level, table-level, and
/// transaction-level execute paths.
pub(crate) async fn execute_on<'e, E>(
    executor: E,
    sql: &str,
    args: &[SqlValue],
) -> Result<ExecResult, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::MySql>,
{
    let done = params::bind_values(sqlx::query(sql), args)
        .execute(executor)
        .await?;
    Ok(ExecResult {
        rows_affected: done.rows_affected(),
        last_insert_id: done.last_insert_id(),
    })
}

/// Runs a row-returning statement and decodes every row into an ordered
/// field map.
pub(crate) async fn query_on<'e, E>(
    executor: E,
    sql: &str,
    args: &[SqlValue],
) -> Result<Vec<Row>, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::MySql>,
{
    let rows = params::bind_values(sqlx::query(sql), args)
        .fetch_all(executor)
        .await?;
    Ok(rows.iter().map(params::row_to_map).collect())
}

/// Like [`query_on`] but stops at the first row.
pub(crate) async fn query_optional_on<'e, E>(
    executor: E,
    sql: &str,
    args: &[SqlValue],
) -> Result<Option<Row>, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::MySql>,
{
    let row = params::bind_values(sqlx::query(sql), args)
        .fetch_optional(executor)
        .await?;
    Ok(row.as_ref().map(params::row_to_map))
}

/// Runs a statement whose first column is a COUNT aggregate.
pub(crate) async fn count_on<'e, E>(
    executor: E,
    sql: &str,
    args: &[SqlValue],
) -> Result<u64, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::MySql>,
{
    use sqlx::Row as _;
    let row = params::bind_values(sqlx::query(sql), args)
        .fetch_one(executor)
        .await?;
    let count: i64 = row.try_get(0)?;
    Ok(count.max(0) as u64)
}

/// Handle to a MySQL database engine.
#[derive(Clone)]
pub struct Db {
    inner: Arc<DbInner>,
}

impl Db {
    /// Opens the connection pool described by `config`, verifies
    /// connectivity with a bounded ping, and starts the observability
    /// pipelines and background samplers.
    pub async fn connect(config: Config) -> DbResult<Self> {
        config.validate()?;

        let connect_options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.username)
            .password(&config.password)
            .database(&config.database)
            .charset(config.charset_or_default());

        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_connections_or_default())
            .min_connections(config.min_connections_or_default())
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .max_lifetime(Some(config.max_lifetime()))
            .test_before_acquire(false)
            .connect_with(connect_options)
            .await
            .map_err(|e| {
                DbError::connection(format!("cannot open pool for {}: {}", config.database, e))
            })?;

        let connect_timeout = config.connect_timeout();
        let verified = timeout(connect_timeout, async {
            let mut conn = pool.acquire().await?;
            conn.ping().await
        })
        .await;
        match verified {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                pool.close().await;
                return Err(DbError::connection(format!("initial ping failed: {err}")));
            }
            Err(_) => {
                pool.close().await;
                return Err(DbError::timeout("connect", connect_timeout.as_secs()));
            }
        }

        let sink = match RotatingFileWriter::open(
            config.log_dir_or_default(),
            &config.database,
            config.log_rotation_enabled_or_default(),
            config.log_max_age(),
        )
        .await
        {
            Ok(sink) => sink,
            Err(err) => {
                pool.close().await;
                return Err(err);
            }
        };
        let logger = AsyncLogger::new(
            sink,
            config.log_buffer_size_or_default(),
            config.log_level_or_default(),
        );
        let metrics = AsyncMetrics::new(
            config.database.clone(),
            config.metrics_buffer_size_or_default(),
        );

        let (shutdown_tx, _) = watch::channel(false);
        let max_connections = config.max_connections_or_default();
        let inner = Arc::new(DbInner {
            pool,
            db_name: config.database.clone(),
            table_prefix: config.table_prefix_or_default().to_string(),
            slow_query_threshold: config.slow_query_threshold(),
            debug: config.debug,
            max_connections,
            metrics,
            logger,
            placeholder_cache: ShardedCache::new(),
            table_cache: ShardedCache::new(),
            pool_stats: RwLock::new(PoolStats {
                max_open: max_connections,
                ..PoolStats::default()
            }),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        let mut tasks = vec![spawn_keepalive(
            Arc::downgrade(&inner),
            inner.shutdown_tx.subscribe(),
        )];
        if config.pool_stats_enabled_or_default() {
            tasks.push(spawn_pool_stats(
                Arc::downgrade(&inner),
                inner.shutdown_tx.subscribe(),
                config.pool_stats_interval(),
            ));
        }
        if let Ok(mut slot) = inner.tasks.lock() {
            *slot = tasks;
        }

        info!(
            database = %inner.db_name,
            max_connections,
            debug = inner.debug,
            "database engine started"
        );
        Ok(Self { inner })
    }

    /// Opens an engine from a `mysql://` URL, see [`Config::from_url`].
    pub async fn connect_url(url: &str) -> DbResult<Self> {
        Self::connect(Config::from_url(url)?).await
    }

    pub(crate) fn inner(&self) -> &DbInner {
        &self.inner
    }

    /// Returns an accessor for `name`, resolved through the table-name
    /// cache with the configured prefix applied.
    pub fn table(&self, name: &str) -> Table {
        let resolved =
            sanitize::cached_table_name(name, &self.inner.table_prefix, &self.inner.table_cache);
        Table::new(self.clone(), resolved)
    }

    /// Runs a statement that returns no rows against the pool.
    pub async fn execute(&self, sql: &str, args: Vec<SqlValue>) -> DbResult<ExecResult> {
        self.run_execute(sql, args, None).await
    }

    /// Like [`Db::execute`] with an upper bound on total runtime.
    pub async fn execute_with_timeout(
        &self,
        sql: &str,
        args: Vec<SqlValue>,
        limit: Duration,
    ) -> DbResult<ExecResult> {
        self.run_execute(sql, args, Some(limit)).await
    }

    /// Runs a row-returning statement against the pool.
    pub async fn query(&self, sql: &str, args: Vec<SqlValue>) -> DbResult<Vec<Row>> {
        self.run_query(sql, args, None).await
    }

    /// Like [`Db::query`] with an upper bound on total runtime.
    pub async fn query_with_timeout(
        &self,
        sql: &str,
        args: Vec<SqlValue>,
        limit: Duration,
    ) -> DbResult<Vec<Row>> {
        self.run_query(sql, args, Some(limit)).await
    }

    async fn run_execute(
        &self,
        sql: &str,
        args: Vec<SqlValue>,
        limit: Option<Duration>,
    ) -> DbResult<ExecResult> {
        let inner = &self.inner;
        inner.ensure_open()?;
        let sql = sql.trim();
        if sql.is_empty() {
            return Err(DbError::statement("empty statement"));
        }
        inner.trace_statement("exec", sql, &args, None);
        let result = inner
            .observe("exec", sql, None, limit, execute_on(&inner.pool, sql, &args))
            .await?;
        inner.metrics.record_affected_rows(result.rows_affected as i64);
        Ok(result)
    }

    async fn run_query(
        &self,
        sql: &str,
        args: Vec<SqlValue>,
        limit: Option<Duration>,
    ) -> DbResult<Vec<Row>> {
        let inner = &self.inner;
        inner.ensure_open()?;
        let sql = sql.trim();
        if sql.is_empty() {
            return Err(DbError::statement("empty statement"));
        }
        inner.trace_statement("query", sql, &args, None);
        inner
            .observe("query", sql, None, limit, query_on(&inner.pool, sql, &args))
            .await
    }

    /// Opens a transaction with a fresh trace id.
    pub async fn begin(&self) -> DbResult<Transaction> {
        self.inner.ensure_open()?;
        let trace_id = transaction::generate_trace_id();
        let started = std::time::Instant::now();
        match self.inner.pool.begin().await {
            Ok(tx) => {
                self.inner
                    .metrics
                    .record_query_duration("begin_transaction", started.elapsed());
                self.inner
                    .trace_statement("begin_transaction", "BEGIN", &[], Some(&trace_id));
                Ok(Transaction::new(tx, trace_id, self.clone()))
            }
            Err(err) => {
                self.inner.metrics.record_error();
                Err(DbError::transaction(
                    format!("begin failed: {err}"),
                    trace_id,
                ))
            }
        }
    }

    /// Runs `f` inside a transaction, committing on success and rolling
    /// back on failure. When both the closure and the rollback fail, the
    /// returned error carries both causes.
    ///
    /// A panic inside `f` unwinds through this call; the dropped
    /// transaction rolls back on its way out.
    pub async fn with_transaction<T, F>(&self, f: F) -> DbResult<T>
    where
        F: for<'t> FnOnce(&'t mut Transaction) -> BoxFuture<'t, DbResult<T>>,
    {
        let mut tx = self.begin().await?;
        match f(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                let trace_id = tx.trace_id().to_string();
                match tx.rollback().await {
                    Ok(()) => Err(err),
                    Err(rollback_err) => Err(DbError::transaction(
                        format!("operation failed: {err}; rollback also failed: {rollback_err}"),
                        trace_id,
                    )),
                }
            }
        }
    }

    /// Checks connectivity on a pooled connection.
    pub async fn ping(&self) -> DbResult<()> {
        self.inner.ensure_open()?;
        let mut conn = self
            .inner
            .pool
            .acquire()
            .await
            .map_err(|e| DbError::connection(format!("acquire failed: {e}")))?;
        conn.ping()
            .await
            .map_err(|e| DbError::connection(format!("ping failed: {e}")))
    }

    /// Shuts the engine down. Signals and awaits the background samplers,
    /// drains the metrics and log pipelines, clears the caches, and closes
    /// the pool. Repeated calls are no-ops.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.shutdown_tx.send(true);
        let handles = match self.inner.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            let _ = handle.await;
        }
        self.inner.metrics.stop().await;
        self.inner.logger.close().await;
        self.inner.placeholder_cache.clear();
        self.inner.table_cache.clear();
        self.inner.pool.close().await;
        info!(database = %self.inner.db_name, "database engine closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Aggregated per-operation metrics since startup or the last reset.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.inner.metrics.reset();
    }

    /// Hit/miss counters for the placeholder and table-name caches.
    pub fn cache_stats(&self) -> DbCacheStats {
        DbCacheStats {
            placeholder: self.inner.placeholder_cache.stats(),
            table_name: self.inner.table_cache.stats(),
        }
    }

    /// Current pool gauges, sampled on call.
    pub fn pool_stats(&self) -> PoolStats {
        self.inner.sample_pool_stats()
    }

    pub fn logger(&self) -> &AsyncLogger {
        &self.inner.logger
    }

    /// Changes the minimum level of the file log pipeline at runtime.
    pub fn set_log_level(&self, level: LogLevel) {
        self.inner.logger.set_level(level);
    }

    pub fn log_level(&self) -> LogLevel {
        self.inner.logger.level()
    }

    pub fn is_debug(&self) -> bool {
        self.inner.debug
    }

    pub fn db_name(&self) -> &str {
        &self.inner.db_name
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("database", &self.inner.db_name)
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Pings an idle connection every 30s so the server does not reap the
/// pool during quiet periods. Holds only a weak reference; exits once
/// the engine is dropped or shut down.
fn spawn_keepalive(inner: Weak<DbInner>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + KEEPALIVE_INTERVAL, KEEPALIVE_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(inner) = inner.upgrade() else { break };
                    let outcome = timeout(KEEPALIVE_PING_TIMEOUT, async {
                        let mut conn = inner.pool.acquire().await?;
                        conn.ping().await
                    })
                    .await;
                    match outcome {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            inner.logger.log(
                                LogRecord::new(LogLevel::Error, "keepalive ping failed")
                                    .with_field("error", err.to_string()),
                            );
                            warn!(database = %inner.db_name, error = %err, "keepalive ping failed");
                        }
                        Err(_) => {
                            inner.logger.log(LogRecord::new(
                                LogLevel::Error,
                                "keepalive ping timed out",
                            ));
                            warn!(database = %inner.db_name, "keepalive ping timed out");
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

/// Samples pool gauges on a fixed period and mirrors them into the
/// shared snapshot slot.
fn spawn_pool_stats(
    inner: Weak<DbInner>,
    mut shutdown: watch::Receiver<bool>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(inner) = inner.upgrade() else { break };
                    let stats = inner.sample_pool_stats();
                    if inner.logger.enabled(LogLevel::Debug) {
                        inner.logger.log(
                            LogRecord::new(LogLevel::Debug, "pool stats")
                                .with_field("max_open", stats.max_open)
                                .with_field("open", stats.open)
                                .with_field("in_use", stats.in_use)
                                .with_field("idle", stats.idle),
                        );
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}
