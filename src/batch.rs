//! Batch write engine.
//!
//! `batch_insert` partitions records into chunks and writes each chunk
//! as one multi-row INSERT inside its own transaction; the call aborts
//! on the first failed chunk and the error carries the rows written by
//! the chunks that already committed. `batch_update` runs every chunk
//! inside a single outer transaction and compiles each chunk into one
//! CASE-per-field statement, so either all records update or none do.

use std::time::Duration;

use crate::cache::ShardedCache;
use crate::error::{DbError, DbResult};
use crate::logging::{LogLevel, LogRecord};
use crate::params::{Record, SqlValue};
use crate::sanitize;
use crate::table::Table;
use crate::transaction::Transaction;

/// Rows per chunk when the caller passes zero.
const DEFAULT_BATCH_SIZE: usize = 1000;

/// Deadline for one CASE-update statement inside the outer transaction.
const UPDATE_CHUNK_TIMEOUT: Duration = Duration::from_secs(30);

impl Table {
    /// Insert `records` in chunks of `batch_size` rows (default 1000
    /// when zero), each chunk in its own transaction.
    ///
    /// All records must carry the same number of fields as the first
    /// one; the first mismatch fails the whole call before any chunk is
    /// written. A record missing one of the first record's fields
    /// inserts NULL for it. On a failed chunk the call aborts and the
    /// returned [`DbError::Batch`] carries the rows written by the
    /// chunks that already committed.
    pub async fn batch_insert(self, records: &[Record], batch_size: usize) -> DbResult<u64> {
        let inner = self.db.inner();
        inner.ensure_open()?;
        if records.is_empty() {
            return Ok(0);
        }
        let batch_size = if batch_size == 0 {
            DEFAULT_BATCH_SIZE
        } else {
            batch_size
        };
        let (keys, fields) = batch_fields(records)?;

        if inner.debug {
            inner.logger.log(
                LogRecord::new(LogLevel::Debug, "batch insert started")
                    .with_field("table", self.name())
                    .with_field("records", records.len()),
            );
        }

        let started = std::time::Instant::now();
        let mut total: u64 = 0;
        for (chunk_index, chunk) in records.chunks(batch_size).enumerate() {
            let start = chunk_index * batch_size;
            let end = start + chunk.len();
            let (sql, args) =
                batch_insert_statement(self.name(), &keys, &fields, chunk, &inner.placeholder_cache);

            let mut tx = self.db.begin().await.map_err(|err| {
                DbError::batch(
                    total,
                    format!("begin failed for insert chunk {start}-{end}: {err}"),
                )
            })?;
            let chunk_rows = match tx.execute(&sql, args).await {
                Ok(result) => result.rows_affected,
                Err(err) => {
                    let message = format!("insert chunk {start}-{end} failed: {err}");
                    return Err(abort(tx, total, message).await);
                }
            };
            if let Err(err) = tx.commit().await {
                return Err(DbError::batch(
                    total,
                    format!("commit failed for insert chunk {start}-{end}: {err}"),
                ));
            }
            total += chunk_rows;
        }
        let duration = started.elapsed();
        inner.metrics.record_query_duration("batch_insert", duration);

        if inner.debug {
            inner.logger.log(
                LogRecord::new(LogLevel::Debug, "batch insert finished")
                    .with_field("table", self.name())
                    .with_field("records", records.len())
                    .with_field("affected", total)
                    .with_field("duration_ms", duration.as_millis() as u64),
            );
        }
        Ok(total)
    }

    /// Update `records` in chunks of `batch_size` rows (default 1000
    /// when zero), matching rows by `key_field`, inside one outer
    /// transaction.
    ///
    /// Each chunk compiles to a single statement with one
    /// `field = CASE key WHEN ? THEN ? ... END` arm per non-key field
    /// and a `WHERE key IN (...)` covering the chunk's keys. A record
    /// missing the key field or one of the first record's fields is a
    /// hard error that rolls the whole call back. Each chunk statement
    /// runs under a 30s deadline.
    pub async fn batch_update(
        self,
        records: &[Record],
        key_field: &str,
        batch_size: usize,
    ) -> DbResult<u64> {
        let inner = self.db.inner();
        inner.ensure_open()?;
        if records.is_empty() {
            return Ok(0);
        }
        if key_field.is_empty() {
            return Err(DbError::statement("batch update requires a key field"));
        }
        let batch_size = if batch_size == 0 {
            DEFAULT_BATCH_SIZE
        } else {
            batch_size
        };

        if inner.debug {
            inner.logger.log(
                LogRecord::new(LogLevel::Debug, "batch update started")
                    .with_field("table", self.name())
                    .with_field("records", records.len()),
            );
        }

        let started = std::time::Instant::now();
        let mut tx = self.db.begin().await?;
        let mut total: u64 = 0;
        for chunk in records.chunks(batch_size) {
            let (sql, args) = match batch_update_statement(self.name(), chunk, key_field) {
                Ok(parts) => parts,
                Err(err) => return Err(abort(tx, total, err.to_string()).await),
            };
            match tx
                .execute_with_timeout(&sql, args, UPDATE_CHUNK_TIMEOUT)
                .await
            {
                Ok(result) => total += result.rows_affected,
                Err(err) => {
                    let message = format!("update chunk failed: {err}");
                    return Err(abort(tx, total, message).await);
                }
            }
        }
        if let Err(err) = tx.commit().await {
            return Err(DbError::batch(total, format!("commit failed: {err}")));
        }
        let duration = started.elapsed();
        inner.metrics.record_query_duration("batch_update", duration);

        if inner.debug {
            inner.logger.log(
                LogRecord::new(LogLevel::Debug, "batch update finished")
                    .with_field("table", self.name())
                    .with_field("records", records.len())
                    .with_field("affected", total)
                    .with_field("duration_ms", duration.as_millis() as u64),
            );
        }
        Ok(total)
    }
}

/// Rolls `tx` back and folds a rollback failure into the batch error.
async fn abort(tx: Transaction, rows_affected: u64, message: String) -> DbError {
    match tx.rollback().await {
        Ok(()) => DbError::batch(rows_affected, message),
        Err(rollback_err) => DbError::batch(
            rows_affected,
            format!("{message}; rollback also failed: {rollback_err}"),
        ),
    }
}

/// Field names from the first record, raw and escaped, in deterministic
/// key order. Every later record must carry the same number of fields.
fn batch_fields(records: &[Record]) -> DbResult<(Vec<String>, Vec<String>)> {
    let Some(first) = records.first() else {
        return Err(DbError::statement("empty batch"));
    };
    if first.is_empty() {
        return Err(DbError::statement("batch records have no fields"));
    }
    let keys: Vec<String> = first.keys().cloned().collect();
    let fields: Vec<String> = keys
        .iter()
        .map(|k| sanitize::escape_identifier(k))
        .collect();
    for (index, record) in records.iter().enumerate().skip(1) {
        if record.len() != keys.len() {
            return Err(DbError::statement(format!(
                "inconsistent batch fields: record 0 has {} fields, record {} has {}",
                keys.len(),
                index,
                record.len()
            )));
        }
    }
    Ok((keys, fields))
}

/// Assembles one multi-row INSERT for a chunk: the cached placeholder
/// group repeated per row, arguments in field order per record.
fn batch_insert_statement(
    table: &str,
    keys: &[String],
    fields: &[String],
    chunk: &[Record],
    cache: &ShardedCache,
) -> (String, Vec<SqlValue>) {
    let group = sanitize::cached_placeholder(keys.len(), cache);
    let groups = vec![group.as_str(); chunk.len()].join(",");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES {}",
        table,
        fields.join(", "),
        groups
    );

    let mut args = Vec::with_capacity(chunk.len() * keys.len());
    for record in chunk {
        for key in keys {
            args.push(record.get(key).cloned().unwrap_or(SqlValue::Null));
        }
    }
    (sql, args)
}

/// Assembles one CASE-based UPDATE for a chunk. Argument order: per
/// non-key field, a (key, value) pair per record; then the chunk's keys
/// for the IN clause.
fn batch_update_statement(
    table: &str,
    chunk: &[Record],
    key_field: &str,
) -> DbResult<(String, Vec<SqlValue>)> {
    let Some(first) = chunk.first() else {
        return Err(DbError::statement("empty batch"));
    };
    let update_fields: Vec<&String> = first
        .keys()
        .filter(|k| k.as_str() != key_field)
        .collect();
    if update_fields.is_empty() {
        return Err(DbError::statement("no fields to update besides the key"));
    }
    let escaped_key = sanitize::escape_identifier(key_field);

    let mut sql = format!("UPDATE {table} SET ");
    let mut args: Vec<SqlValue> =
        Vec::with_capacity(chunk.len() * (update_fields.len() * 2 + 1));
    for (i, field) in update_fields.iter().enumerate() {
        if i > 0 {
            sql.push_str(", ");
        }
        sql.push_str(&sanitize::escape_identifier(field));
        sql.push_str(" = CASE ");
        sql.push_str(&escaped_key);
        sql.push(' ');
        for record in chunk {
            let Some(key_value) = record.get(key_field) else {
                return Err(DbError::statement(format!(
                    "record missing key field: {key_field}"
                )));
            };
            let Some(value) = record.get(field.as_str()) else {
                return Err(DbError::statement(format!(
                    "record missing update field: {field}"
                )));
            };
            sql.push_str("WHEN ? THEN ? ");
            args.push(key_value.clone());
            args.push(value.clone());
        }
        sql.push_str("END");
    }

    sql.push_str(" WHERE ");
    sql.push_str(&escaped_key);
    sql.push_str(" IN (");
    for (i, record) in chunk.iter().enumerate() {
        let Some(key_value) = record.get(key_field) else {
            return Err(DbError::statement(format!(
                "record missing key field: {key_field}"
            )));
        };
        if i > 0 {
            sql.push(',');
        }
        sql.push('?');
        args.push(key_value.clone());
    }
    sql.push(')');
    Ok((sql, args))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{params, record};

    #[test]
    fn batch_fields_accepts_matching_counts() {
        let records = vec![
            record! { "id" => 1, "name" => "a" },
            record! { "id" => 2, "name" => "b" },
        ];
        let (keys, fields) = batch_fields(&records).unwrap();
        assert_eq!(keys, ["id", "name"]);
        assert_eq!(fields, ["`id`", "`name`"]);
    }

    #[test]
    fn batch_fields_rejects_count_mismatch() {
        let records = vec![
            record! { "id" => 1, "name" => "a" },
            record! { "id" => 2 },
        ];
        let err = batch_fields(&records).unwrap_err();
        assert!(err.to_string().contains("record 1 has 1"));
    }

    #[test]
    fn batch_fields_rejects_empty_record() {
        let records = vec![Record::new()];
        assert!(batch_fields(&records).is_err());
    }

    #[test]
    fn insert_chunk_repeats_placeholder_group() {
        let cache = ShardedCache::new();
        let records = vec![
            record! { "age" => 25, "name" => "user1" },
            record! { "age" => 30, "name" => "user2" },
        ];
        let (keys, fields) = batch_fields(&records).unwrap();
        let (sql, args) = batch_insert_statement("`users`", &keys, &fields, &records, &cache);
        assert_eq!(
            sql,
            "INSERT INTO `users` (`age`, `name`) VALUES (?,?),(?,?)"
        );
        assert_eq!(args, params![25, "user1", 30, "user2"]);
    }

    #[test]
    fn insert_chunk_fills_missing_fields_with_null() {
        let cache = ShardedCache::new();
        let keys = vec!["age".to_string(), "name".to_string()];
        let fields = vec!["`age`".to_string(), "`name`".to_string()];
        let records = vec![record! { "age" => 25, "status" => 1 }];
        let (_, args) = batch_insert_statement("`users`", &keys, &fields, &records, &cache);
        assert_eq!(args, vec![SqlValue::from(25), SqlValue::Null]);
    }

    #[test]
    fn update_chunk_builds_case_per_field() {
        let records = vec![
            record! { "id" => 1, "name" => "a", "status" => 10 },
            record! { "id" => 2, "name" => "b", "status" => 20 },
        ];
        let (sql, args) = batch_update_statement("`users`", &records, "id").unwrap();
        assert_eq!(
            sql,
            "UPDATE `users` SET \
             `name` = CASE `id` WHEN ? THEN ? WHEN ? THEN ? END, \
             `status` = CASE `id` WHEN ? THEN ? WHEN ? THEN ? END \
             WHERE `id` IN (?,?)"
        );
        assert_eq!(
            args,
            params![1, "a", 2, "b", 1, 10, 2, 20, 1, 2]
        );
    }

    #[test]
    fn update_chunk_requires_key_in_every_record() {
        let records = vec![
            record! { "id" => 1, "name" => "a" },
            record! { "name" => "b", "status" => 1 },
        ];
        let err = batch_update_statement("`users`", &records, "id").unwrap_err();
        assert!(err.to_string().contains("missing key field"));
    }

    #[test]
    fn update_chunk_requires_every_update_field() {
        let records = vec![
            record! { "id" => 1, "name" => "a" },
            record! { "id" => 2, "age" => 30 },
        ];
        let err = batch_update_statement("`users`", &records, "id").unwrap_err();
        assert!(err.to_string().contains("missing update field"));
    }

    #[test]
    fn update_chunk_rejects_key_only_records() {
        let records = vec![record! { "id" => 1 }];
        let err = batch_update_statement("`users`", &records, "id").unwrap_err();
        assert!(err.to_string().contains("no fields to update"));
    }
}
