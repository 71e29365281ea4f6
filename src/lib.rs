//! joist: async MySQL data-access engine.
//!
//! Wraps a sqlx connection pool with a fluent per-table accessor, a
//! statement builder, chunked batch writes, trace-id tagged
//! transactions, and non-blocking metrics and log pipelines.

pub mod builder;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod params;
pub mod sanitize;
pub mod table;
pub mod transaction;

mod batch;

pub use builder::QueryBuilder;
pub use config::Config;
pub use db::{Db, DbCacheStats, ExecResult, PoolStats};
pub use error::{DbError, DbResult};
pub use logging::LogLevel;
pub use metrics::MetricsSnapshot;
pub use params::{Record, Row, SqlValue};
pub use table::Table;
pub use transaction::Transaction;
