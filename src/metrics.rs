//! Engine performance metrics with an asynchronous recording pipeline.
//!
//! Hot paths never touch the aggregate directly: they enqueue a
//! [`MetricEvent`] onto a bounded queue drained by a single worker. A full
//! queue drops the event and counts the drop — dropping is the only lossy
//! path. Per-operation durations aggregate as a running count and total, so
//! memory stays flat no matter how many statements run.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// One recorded observation, applied to the aggregate by the worker.
#[derive(Debug, Clone)]
pub enum MetricEvent {
    QueryDuration { operation: String, duration: Duration },
    AffectedRows(i64),
    SlowQuery,
    Error,
}

#[derive(Debug, Default)]
struct DurationStat {
    count: u64,
    total: Duration,
}

/// Aggregated per-operation timing, reported in snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryStat {
    pub count: u64,
    pub total_time: Duration,
    pub average_time: Duration,
}

/// Point-in-time view of the aggregate.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub db_name: String,
    pub query_stats: BTreeMap<String, QueryStat>,
    pub total_queries: i64,
    pub total_affected_rows: i64,
    pub slow_queries: i64,
    pub total_errors: i64,
    /// Events lost to queue overflow since construction (never reset).
    pub dropped_events: u64,
}

/// The base aggregate. All counters are atomics; the per-operation map is
/// behind a mutex written only by the pipeline worker.
pub struct Metrics {
    db_name: String,
    query_durations: Mutex<HashMap<String, DurationStat>>,
    affected_rows: AtomicI64,
    total_queries: AtomicI64,
    slow_queries: AtomicI64,
    errors: AtomicI64,
}

impl Metrics {
    pub fn new(db_name: impl Into<String>) -> Self {
        Self {
            db_name: db_name.into(),
            query_durations: Mutex::new(HashMap::new()),
            affected_rows: AtomicI64::new(0),
            total_queries: AtomicI64::new(0),
            slow_queries: AtomicI64::new(0),
            errors: AtomicI64::new(0),
        }
    }

    /// Record one statement execution. An empty operation name is bucketed
    /// as `unknown`.
    pub fn record_query_duration(&self, operation: impl Into<String>, duration: Duration) {
        let mut operation = operation.into();
        if operation.is_empty() {
            operation = "unknown".to_string();
        }
        self.total_queries.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut durations) = self.query_durations.lock() {
            let stat = durations.entry(operation).or_default();
            stat.count += 1;
            stat.total += duration;
        }
    }

    pub fn record_affected_rows(&self, rows: i64) {
        self.affected_rows.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn record_slow_query(&self) {
        self.slow_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot_with_drops(&self, dropped_events: u64) -> MetricsSnapshot {
        let query_stats = match self.query_durations.lock() {
            Ok(durations) => durations
                .iter()
                .map(|(operation, stat)| {
                    let average = if stat.count == 0 {
                        Duration::ZERO
                    } else {
                        Duration::from_nanos((stat.total.as_nanos() / u128::from(stat.count)) as u64)
                    };
                    (
                        operation.clone(),
                        QueryStat {
                            count: stat.count,
                            total_time: stat.total,
                            average_time: average,
                        },
                    )
                })
                .collect(),
            Err(_) => BTreeMap::new(),
        };

        MetricsSnapshot {
            db_name: self.db_name.clone(),
            query_stats,
            total_queries: self.total_queries.load(Ordering::Relaxed),
            total_affected_rows: self.affected_rows.load(Ordering::Relaxed),
            slow_queries: self.slow_queries.load(Ordering::Relaxed),
            total_errors: self.errors.load(Ordering::Relaxed),
            dropped_events,
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.snapshot_with_drops(0)
    }

    /// Zero every counter and forget per-operation history.
    pub fn reset(&self) {
        if let Ok(mut durations) = self.query_durations.lock() {
            durations.clear();
        }
        self.affected_rows.store(0, Ordering::Relaxed);
        self.total_queries.store(0, Ordering::Relaxed);
        self.slow_queries.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
    }
}

/// Bounded-queue recording front for [`Metrics`].
pub struct AsyncMetrics {
    tx: mpsc::Sender<MetricEvent>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
    metrics: Arc<Metrics>,
    dropped: AtomicU64,
}

impl AsyncMetrics {
    /// Spawn the aggregation worker. `capacity` bounds the pending-event
    /// queue.
    pub fn new(db_name: impl Into<String>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let metrics = Arc::new(Metrics::new(db_name));

        let handle = tokio::spawn(Self::run(rx, shutdown_rx, Arc::clone(&metrics)));

        Self {
            tx,
            shutdown_tx,
            worker: Mutex::new(Some(handle)),
            stopped: AtomicBool::new(false),
            metrics,
            dropped: AtomicU64::new(0),
        }
    }

    async fn run(
        mut rx: mpsc::Receiver<MetricEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
        metrics: Arc<Metrics>,
    ) {
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(event) => Self::apply(&metrics, event),
                    None => return,
                },
                _ = shutdown_rx.changed() => break,
            }
        }
        // Applying an event is pure memory work, so the final drain is
        // unbounded: everything accepted before stop is reflected.
        while let Ok(event) = rx.try_recv() {
            Self::apply(&metrics, event);
        }
    }

    fn apply(metrics: &Metrics, event: MetricEvent) {
        match event {
            MetricEvent::QueryDuration {
                operation,
                duration,
            } => metrics.record_query_duration(operation, duration),
            MetricEvent::AffectedRows(rows) => metrics.record_affected_rows(rows),
            MetricEvent::SlowQuery => metrics.record_slow_query(),
            MetricEvent::Error => metrics.record_error(),
        }
    }

    fn record(&self, event: MetricEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_))
            | Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn record_query_duration(&self, operation: impl Into<String>, duration: Duration) {
        self.record(MetricEvent::QueryDuration {
            operation: operation.into(),
            duration,
        });
    }

    pub fn record_affected_rows(&self, rows: i64) {
        self.record(MetricEvent::AffectedRows(rows));
    }

    pub fn record_slow_query(&self) {
        self.record(MetricEvent::SlowQuery);
    }

    pub fn record_error(&self) {
        self.record(MetricEvent::Error);
    }

    /// Events lost to queue overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.metrics
            .snapshot_with_drops(self.dropped.load(Ordering::Relaxed))
    }

    pub fn reset(&self) {
        self.metrics.reset();
    }

    /// Stop the worker after it applies everything already queued.
    /// Idempotent; recording after stop counts as dropped.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.send(true);

        let handle = match self.worker.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_aggregation() {
        let metrics = Metrics::new("testdb");
        metrics.record_query_duration("query", Duration::from_millis(10));
        metrics.record_query_duration("query", Duration::from_millis(30));
        metrics.record_query_duration("insert", Duration::from_millis(5));
        metrics.record_affected_rows(7);
        metrics.record_slow_query();
        metrics.record_error();

        let snap = metrics.snapshot();
        assert_eq!(snap.db_name, "testdb");
        assert_eq!(snap.total_queries, 3);
        assert_eq!(snap.total_affected_rows, 7);
        assert_eq!(snap.slow_queries, 1);
        assert_eq!(snap.total_errors, 1);

        let query = &snap.query_stats["query"];
        assert_eq!(query.count, 2);
        assert_eq!(query.total_time, Duration::from_millis(40));
        assert_eq!(query.average_time, Duration::from_millis(20));
        assert_eq!(snap.query_stats["insert"].count, 1);
    }

    #[test]
    fn test_empty_operation_buckets_as_unknown() {
        let metrics = Metrics::new("testdb");
        metrics.record_query_duration("", Duration::from_millis(1));
        let snap = metrics.snapshot();
        assert!(snap.query_stats.contains_key("unknown"));
    }

    #[test]
    fn test_reset_zeroes_everything() {
        let metrics = Metrics::new("testdb");
        metrics.record_query_duration("query", Duration::from_millis(10));
        metrics.record_affected_rows(3);
        metrics.reset();

        let snap = metrics.snapshot();
        assert_eq!(snap.total_queries, 0);
        assert_eq!(snap.total_affected_rows, 0);
        assert!(snap.query_stats.is_empty());
    }

    #[tokio::test]
    async fn test_pipeline_applies_events() {
        let async_metrics = AsyncMetrics::new("testdb", 100);
        async_metrics.record_query_duration("query", Duration::from_millis(10));
        async_metrics.record_affected_rows(2);
        async_metrics.record_slow_query();
        async_metrics.stop().await;

        let snap = async_metrics.snapshot();
        assert_eq!(snap.total_queries, 1);
        assert_eq!(snap.total_affected_rows, 2);
        assert_eq!(snap.slow_queries, 1);
        assert_eq!(snap.dropped_events, 0);
    }

    #[tokio::test]
    async fn test_overflow_counts_exact_drops() {
        // Single-threaded test runtime: the worker cannot run between
        // try_sends, so everything past capacity must be dropped.
        let async_metrics = AsyncMetrics::new("testdb", 8);
        for _ in 0..11 {
            async_metrics.record_query_duration("query", Duration::from_millis(1));
        }
        assert_eq!(async_metrics.dropped(), 3);

        async_metrics.stop().await;
        let snap = async_metrics.snapshot();
        assert_eq!(snap.total_queries, 8);
        assert_eq!(snap.dropped_events, 3);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let async_metrics = AsyncMetrics::new("testdb", 10);
        async_metrics.stop().await;
        async_metrics.stop().await;
        assert_eq!(async_metrics.snapshot().total_queries, 0);
    }
}
