//! Asynchronous operation log pipeline.
//!
//! The engine writes its durable operation log (query traces, slow-query
//! warnings, transaction lifecycle) through a bounded queue drained by a
//! single background worker into a rotating file sink. Producers never
//! block: a full queue drops the record and counts the drop. `close()`
//! drains whatever is queued, bounded by a deadline — records still queued
//! when the deadline expires are discarded, an accepted trade-off for a
//! shutdown that cannot hang.
//!
//! In-process diagnostics (sink failures, pruning problems) go through
//! `tracing` instead so the pipeline never feeds itself.

use crate::error::{DbError, DbResult};
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value as JsonValue;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;

/// How long `close()` lets the worker drain queued records before the
/// remainder is discarded.
pub const SHUTDOWN_DRAIN_DEADLINE: Duration = Duration::from_secs(5);

/// Minimum severity for a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Debug,
            1 => Self::Info,
            2 => Self::Warn,
            _ => Self::Error,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Debug => 0,
            Self::Info => 1,
            Self::Warn => 2,
            Self::Error => 3,
        }
    }
}

impl FromStr for LogLevel {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(DbError::config(format!("unknown log level '{}'", s))),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One structured log record, serialized as a single JSON line.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LogRecord {
    #[serde(rename = "time")]
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    #[serde(rename = "msg")]
    pub message: String,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, JsonValue>,
}

impl LogRecord {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            fields: serde_json::Map::new(),
        }
    }

    /// Attach a structured field to the record.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// Rotating, date-suffixed file sink.
///
/// With rotation enabled the current file is `<base>_<YYYY-MM-DD>.log` and a
/// new file opens on the first write after a date change. Rotated files whose
/// name encodes a date older than the retention cutoff are pruned; files with
/// an unparseable date suffix are left untouched.
pub struct RotatingFileWriter {
    dir: PathBuf,
    base_name: String,
    rotation_enabled: bool,
    max_age_days: u64,
    current_date: Option<NaiveDate>,
    file: Option<File>,
}

impl RotatingFileWriter {
    /// Create the log directory if needed and open today's file.
    pub async fn open(
        dir: impl Into<PathBuf>,
        base_name: impl Into<String>,
        rotation_enabled: bool,
        max_age: Duration,
    ) -> DbResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            DbError::config(format!("cannot create log directory {}: {}", dir.display(), e))
        })?;

        let mut writer = Self {
            dir,
            base_name: base_name.into(),
            rotation_enabled,
            max_age_days: max_age.as_secs() / 86_400,
            current_date: None,
            file: None,
        };
        writer.rotate_to(Utc::now().date_naive()).await.map_err(|e| {
            DbError::config(format!(
                "cannot open log file in {}: {}",
                writer.dir.display(),
                e
            ))
        })?;
        Ok(writer)
    }

    fn path_for(&self, date: NaiveDate) -> PathBuf {
        let name = if self.rotation_enabled {
            format!("{}_{}.log", self.base_name, date.format("%Y-%m-%d"))
        } else {
            format!("{}.log", self.base_name)
        };
        self.dir.join(name)
    }

    async fn rotate_to(&mut self, date: NaiveDate) -> std::io::Result<()> {
        if let Some(mut old) = self.file.take() {
            let _ = old.flush().await;
        }
        if self.rotation_enabled {
            self.prune_old_files(date).await;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(date))
            .await?;
        self.file = Some(file);
        self.current_date = Some(date);
        Ok(())
    }

    /// Remove rotated files whose name-encoded date is older than the
    /// retention cutoff. Runs at open and on each date rollover.
    async fn prune_old_files(&self, today: NaiveDate) {
        let Some(cutoff) = today.checked_sub_days(chrono::Days::new(self.max_age_days)) else {
            return;
        };
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "cannot scan log directory");
                return;
            }
        };

        let prefix = format!("{}_", self.base_name);
        while let Ok(Some(entry)) = entries.next_entry().await.map_err(|e| {
            warn!(dir = %self.dir.display(), error = %e, "error scanning log directory");
        }) {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(date) = parse_dated_log_name(name, &prefix) else {
                continue;
            };
            if date < cutoff {
                if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                    warn!(file = %name, error = %e, "cannot prune expired log file");
                }
            }
        }
    }

    /// Serialize a record as one JSON line and append it, rotating first if
    /// the date rolled over.
    pub async fn write_record(&mut self, record: &LogRecord) -> std::io::Result<()> {
        let today = Utc::now().date_naive();
        if self.file.is_none() || (self.rotation_enabled && self.current_date != Some(today)) {
            self.rotate_to(today).await?;
        }
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        match self.file.as_mut() {
            Some(file) => file.write_all(&line).await,
            None => Ok(()),
        }
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush().await,
            None => Ok(()),
        }
    }

    /// Path of the file records are currently appended to.
    pub fn current_path(&self) -> PathBuf {
        self.path_for(self.current_date.unwrap_or_else(|| Utc::now().date_naive()))
    }
}

/// Extract the date from `<prefix><YYYY-MM-DD>.log`, if it parses.
fn parse_dated_log_name(name: &str, prefix: &str) -> Option<NaiveDate> {
    let rest = name.strip_prefix(prefix)?;
    let stem = rest.strip_suffix(".log")?;
    NaiveDate::parse_from_str(stem, "%Y-%m-%d").ok()
}

struct LoggerCounters {
    processed: AtomicU64,
    dropped: AtomicU64,
    sink_errors: AtomicU64,
}

/// Bounded-queue asynchronous logger with a single consumer worker.
pub struct AsyncLogger {
    tx: mpsc::Sender<LogRecord>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    min_level: AtomicU8,
    counters: Arc<LoggerCounters>,
}

impl AsyncLogger {
    /// Spawn the worker draining into `sink`. `capacity` bounds the queue;
    /// records below `min_level` are rejected at enqueue.
    pub fn new(sink: RotatingFileWriter, capacity: usize, min_level: LogLevel) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let counters = Arc::new(LoggerCounters {
            processed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            sink_errors: AtomicU64::new(0),
        });

        let handle = tokio::spawn(Self::run(rx, shutdown_rx, sink, Arc::clone(&counters)));

        Self {
            tx,
            shutdown_tx,
            worker: Mutex::new(Some(handle)),
            closed: AtomicBool::new(false),
            min_level: AtomicU8::new(min_level.as_u8()),
            counters,
        }
    }

    async fn run(
        mut rx: mpsc::Receiver<LogRecord>,
        mut shutdown_rx: watch::Receiver<bool>,
        mut sink: RotatingFileWriter,
        counters: Arc<LoggerCounters>,
    ) {
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(record) => Self::process(&mut sink, &counters, &record).await,
                    None => break,
                },
                _ = shutdown_rx.changed() => break,
            }
        }

        // Final drain, bounded by the shutdown deadline. Whatever is still
        // queued when the deadline passes is discarded unprocessed.
        let deadline = Instant::now() + SHUTDOWN_DRAIN_DEADLINE;
        while let Ok(record) = rx.try_recv() {
            if Instant::now() < deadline {
                Self::process(&mut sink, &counters, &record).await;
            }
        }
        if let Err(e) = sink.flush().await {
            warn!(error = %e, "log sink flush failed on shutdown");
        }
    }

    async fn process(
        sink: &mut RotatingFileWriter,
        counters: &LoggerCounters,
        record: &LogRecord,
    ) {
        match sink.write_record(record).await {
            Ok(()) => {
                counters.processed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.sink_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "log sink write failed");
            }
        }
    }

    /// Check whether a record at `level` would be accepted.
    pub fn enabled(&self, level: LogLevel) -> bool {
        !self.closed.load(Ordering::Acquire) && level >= self.level()
    }

    /// Enqueue a record. Never blocks: a full queue drops the record and
    /// increments the dropped counter; a closed logger rejects it outright.
    pub fn log(&self, record: LogRecord) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if record.level < self.level() {
            return;
        }
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) | Err(mpsc::error::TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Current minimum level.
    pub fn level(&self) -> LogLevel {
        LogLevel::from_u8(self.min_level.load(Ordering::Relaxed))
    }

    /// Adjust the minimum level at runtime.
    pub fn set_level(&self, level: LogLevel) {
        self.min_level.store(level.as_u8(), Ordering::Relaxed);
    }

    /// Records written through the sink so far.
    pub fn processed(&self) -> u64 {
        self.counters.processed.load(Ordering::Relaxed)
    }

    /// Records dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    /// Sink write failures observed by the worker.
    pub fn sink_errors(&self) -> u64 {
        self.counters.sink_errors.load(Ordering::Relaxed)
    }

    /// Stop accepting records, drain the queue through the sink (bounded by
    /// the shutdown deadline) and wait for the worker to exit. Idempotent:
    /// only the first call does any work, and completion is reported
    /// regardless of whether every queued record made it to the sink.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.send(true);

        let handle = match self.worker.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(mut handle) = handle {
            // The worker bounds its own drain; the extra second covers
            // scheduling slack before we give up and abort.
            let grace = SHUTDOWN_DRAIN_DEADLINE + Duration::from_secs(1);
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                handle.abort();
            }
        }
    }
}
