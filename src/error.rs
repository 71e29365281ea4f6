//! Error types for the data-access engine.
//!
//! This module defines all error types using `thiserror`. Variants follow the
//! engine's failure taxonomy: configuration and connectivity problems fail
//! construction, statement problems abort the offending call, and driver
//! failures are wrapped with the operation that issued them.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    #[error("Connection failed: {message}")]
    Connection { message: String },

    #[error("Invalid statement: {message}")]
    Statement { message: String },

    #[error("Execution failed ({operation}): {message}")]
    Execution {
        operation: String,
        message: String,
        /// Driver-reported SQLSTATE, e.g. "23000" for a constraint violation
        code: Option<String>,
    },

    #[error("Transaction error: {message} (trace: {trace_id})")]
    Transaction { message: String, trace_id: String },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u64,
    },

    #[error("Batch aborted after {rows_affected} affected rows: {message}")]
    Batch {
        /// Rows written by chunks that committed before the abort.
        rows_affected: u64,
        message: String,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a statement error.
    pub fn statement(message: impl Into<String>) -> Self {
        Self::Statement {
            message: message.into(),
        }
    }

    /// Wrap a driver error with the operation that issued it.
    pub fn execution(operation: impl Into<String>, err: sqlx::Error) -> Self {
        let code = match &err {
            sqlx::Error::Database(db_err) => db_err.code().map(|c| c.to_string()),
            _ => None,
        };
        Self::Execution {
            operation: operation.into(),
            message: err.to_string(),
            code,
        }
    }

    /// Create a transaction error tagged with its trace id.
    pub fn transaction(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            trace_id: trace_id.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create a batch abort error carrying the rows already written by
    /// chunks that committed before the failure.
    pub fn batch(rows_affected: u64, message: impl Into<String>) -> Self {
        Self::Batch {
            rows_affected,
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::config(msg.to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::Execution {
                    operation: "statement".to_string(),
                    message: db_err.message().to_string(),
                    code,
                }
            }
            sqlx::Error::RowNotFound => DbError::Execution {
                operation: "fetch".to_string(),
                message: "no rows returned".to_string(),
                code: None,
            },
            sqlx::Error::PoolTimedOut => DbError::timeout("connection pool acquire", 30),
            sqlx::Error::PoolClosed => DbError::connection("connection pool is closed"),
            sqlx::Error::Io(io_err) => DbError::connection(format!("I/O error: {}", io_err)),
            sqlx::Error::Tls(tls_err) => DbError::connection(format!("TLS error: {}", tls_err)),
            sqlx::Error::Protocol(msg) => {
                DbError::connection(format!("protocol error: {}", msg))
            }
            sqlx::Error::TypeNotFound { type_name } => {
                DbError::internal(format!("type not found: {}", type_name))
            }
            sqlx::Error::ColumnNotFound(col) => {
                DbError::internal(format!("column not found: {}", col))
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::internal("database worker crashed"),
            _ => DbError::internal(format!("unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
