//! Parameter binding.
//!
//! Every setter validates the 1-based index, binds the value natively
//! (unless the statement is collecting a batch) and records it so that
//! executing with an unbound marker is rejected and batch entries can be
//! replayed.
//!
//! | `Value` | Native call |
//! |---------|-------------|
//! | `Null` | `sqlite3_bind_null` |
//! | `Bool` | `sqlite3_bind_int` (0/1) |
//! | `Int` | `sqlite3_bind_int` |
//! | `BigInt` | `sqlite3_bind_int64` |
//! | `Float`, `Double` | `sqlite3_bind_double` |
//! | `Decimal`, `Text` | `sqlite3_bind_text` |
//! | `Bytes` | `sqlite3_bind_blob` |
//! | `ZeroBlob` | `sqlite3_bind_zeroblob` |
//! | `Date`, `Time`, `Timestamp` | int64, double or text per the connection's formats |

#![allow(clippy::cast_possible_truncation)]

use std::ffi::c_int;
use std::io::{self, Read};
use std::sync::Arc;

use litebridge_core::error::{BatchError, BatchStatus, StatementErrorKind};
use litebridge_core::{DateTimeConfig, Error, MisuseErrorKind, Result, StoredDateTime, Value};

use crate::blob::Blob;
use crate::ffi;
use crate::result_code;
use crate::statement::{Statement, StatementState};

/// Recorded state of one parameter marker.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Slot {
    Unbound,
    Value(Value),
    /// Supplied by writing a stream into a blob; the native binding is left alone.
    Streamed,
}

/// The cell a [`Statement::set_blob_stream`] writes into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobTarget {
    pub database: String,
    pub table: String,
    pub column: String,
}

impl BlobTarget {
    /// A column of a table in the `main` schema.
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            database: "main".to_string(),
            table: table.into(),
            column: column.into(),
        }
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }
}

/// Write handle kept by a parameter between [`Statement::set_blob_stream`] calls.
pub(crate) struct StreamBlob {
    target: BlobTarget,
    blob: Blob<'static>,
}

/// Bind a Value to a prepared statement parameter.
///
/// # Safety
/// - `stmt` must be a valid, non-null prepared statement handle
/// - the connection lock must be held
pub(crate) unsafe fn bind_value(
    stmt: *mut ffi::sqlite3_stmt,
    index: c_int,
    value: &Value,
    date_time: &DateTimeConfig,
) -> c_int {
    // SAFETY: guaranteed by the caller
    unsafe {
        match value {
            Value::Null => ffi::sqlite3_bind_null(stmt, index),
            Value::Bool(b) => ffi::sqlite3_bind_int(stmt, index, c_int::from(*b)),
            Value::Int(v) => ffi::sqlite3_bind_int(stmt, index, *v),
            Value::BigInt(v) => ffi::sqlite3_bind_int64(stmt, index, *v),
            Value::Float(v) => ffi::sqlite3_bind_double(stmt, index, f64::from(*v)),
            Value::Double(v) => ffi::sqlite3_bind_double(stmt, index, *v),
            Value::Decimal(s) | Value::Text(s) => bind_text(stmt, index, s),
            Value::Bytes(b) => match c_int::try_from(b.len()) {
                Ok(len) => ffi::sqlite3_bind_blob(
                    stmt,
                    index,
                    b.as_ptr().cast(),
                    len,
                    ffi::sqlite_transient(),
                ),
                Err(_) => ffi::SQLITE_TOOBIG,
            },
            Value::ZeroBlob(n) => match c_int::try_from(*n) {
                Ok(n) => ffi::sqlite3_bind_zeroblob(stmt, index, n),
                Err(_) => ffi::SQLITE_TOOBIG,
            },
            Value::Date(_) | Value::Time(_) | Value::Timestamp(_) => {
                match date_time.encode(value) {
                    Some(StoredDateTime::Integer(v)) => ffi::sqlite3_bind_int64(stmt, index, v),
                    Some(StoredDateTime::Real(v)) => ffi::sqlite3_bind_double(stmt, index, v),
                    Some(StoredDateTime::Text(s)) => bind_text(stmt, index, &s),
                    None => ffi::sqlite3_bind_null(stmt, index),
                }
            }
        }
    }
}

unsafe fn bind_text(stmt: *mut ffi::sqlite3_stmt, index: c_int, text: &str) -> c_int {
    match c_int::try_from(text.len()) {
        // SAFETY: the engine copies the text (transient)
        Ok(len) => unsafe {
            ffi::sqlite3_bind_text(
                stmt,
                index,
                text.as_ptr().cast(),
                len,
                ffi::sqlite_transient(),
            )
        },
        Err(_) => ffi::SQLITE_TOOBIG,
    }
}

impl Statement {
    /// Bind `value` to the 1-based parameter `index`.
    pub fn set(&mut self, index: usize, value: impl Into<Value>) -> Result<()> {
        self.check_index(index)?;
        let value = value.into();
        if !self.batching {
            self.bind_native(index, &value)?;
        }
        self.params[index - 1] = Slot::Value(value);
        Ok(())
    }

    /// Bind `value` to a named parameter (`:name`, `@name`, `$name` or a bare name).
    pub fn set_named(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        let index = self.parameter_index(name)?.ok_or_else(|| {
            Error::misuse(
                MisuseErrorKind::UnknownParameter,
                format!("no parameter named '{}'", name),
            )
        })?;
        self.set(index, value)
    }

    /// Bind `params` to markers `1..=params.len()`.
    pub fn bind_all(&mut self, params: &[Value]) -> Result<()> {
        for (i, value) in params.iter().enumerate() {
            self.set(i + 1, value.clone())?;
        }
        Ok(())
    }

    pub fn set_null(&mut self, index: usize) -> Result<()> {
        self.set(index, Value::Null)
    }

    pub fn set_bool(&mut self, index: usize, value: bool) -> Result<()> {
        self.set(index, Value::Bool(value))
    }

    pub fn set_int(&mut self, index: usize, value: i32) -> Result<()> {
        self.set(index, Value::Int(value))
    }

    pub fn set_long(&mut self, index: usize, value: i64) -> Result<()> {
        self.set(index, Value::BigInt(value))
    }

    pub fn set_double(&mut self, index: usize, value: f64) -> Result<()> {
        self.set(index, Value::Double(value))
    }

    pub fn set_text(&mut self, index: usize, value: &str) -> Result<()> {
        self.set(index, Value::Text(value.to_string()))
    }

    pub fn set_bytes(&mut self, index: usize, value: &[u8]) -> Result<()> {
        self.set(index, Value::Bytes(value.to_vec()))
    }

    /// Bind a blob of `len` zero bytes, to be filled later through a [`Blob`].
    pub fn set_zero_blob(&mut self, index: usize, len: u32) -> Result<()> {
        self.set(index, Value::ZeroBlob(len))
    }

    /// Bind a date given as days since 1970-01-01.
    pub fn set_date(&mut self, index: usize, days: i32) -> Result<()> {
        self.set(index, Value::Date(days))
    }

    /// Bind a time of day given as microseconds since midnight.
    pub fn set_time(&mut self, index: usize, micros: i64) -> Result<()> {
        self.set(index, Value::Time(micros))
    }

    /// Bind a timestamp given as microseconds since the Unix epoch.
    pub fn set_timestamp(&mut self, index: usize, micros: i64) -> Result<()> {
        self.set(index, Value::Timestamp(micros))
    }

    /// Bind a row id and remember it as the target row for
    /// [`set_blob_stream`](Statement::set_blob_stream).
    pub fn set_row_id(&mut self, index: usize, row_id: i64) -> Result<()> {
        self.set(index, Value::BigInt(row_id))?;
        self.row_id = Some(row_id);
        Ok(())
    }

    /// Read at most `len` bytes from `reader` and bind them as a blob.
    pub fn set_binary_stream<R: Read>(&mut self, index: usize, reader: R, len: usize) -> Result<()> {
        self.check_index(index)?;
        let mut buf = Vec::with_capacity(len.min(64 * 1024));
        reader.take(len as u64).read_to_end(&mut buf)?;
        self.set(index, Value::Bytes(buf))
    }

    /// Stream `reader` into `target` at the row given by
    /// [`set_row_id`](Statement::set_row_id).
    ///
    /// Without a row id this behaves like
    /// [`set_binary_stream`](Statement::set_binary_stream). With one, the
    /// target cell must already hold a blob large enough for the data (e.g.
    /// from [`set_zero_blob`](Statement::set_zero_blob)). The write handle
    /// stays with the parameter and later calls for the same target only
    /// move it to the new row; it is closed when the statement next
    /// executes, its parameters are cleared or it is closed.
    pub fn set_blob_stream<R: Read>(
        &mut self,
        index: usize,
        target: &BlobTarget,
        reader: R,
        len: usize,
    ) -> Result<()> {
        let Some(row_id) = self.row_id else {
            return self.set_binary_stream(index, reader, len);
        };
        self.check_index(index)?;
        if self.blob_streams.len() < self.parameter_count() {
            self.blob_streams.resize_with(self.parameter_count(), || None);
        }

        let cached = self.blob_streams[index - 1]
            .take()
            .filter(|stream| stream.target == *target);
        let mut stream = match cached {
            Some(mut stream) => {
                stream.blob.reopen(row_id)?;
                stream
            }
            None => StreamBlob {
                target: target.clone(),
                blob: Blob::open(
                    &self.conn,
                    &target.database,
                    &target.table,
                    &target.column,
                    row_id,
                    true,
                )?,
            },
        };
        let copied = io::copy(&mut reader.take(len as u64), &mut stream.blob)?;
        self.blob_streams[index - 1] = Some(stream);
        tracing::debug!(
            table = %target.table,
            column = %target.column,
            row_id,
            bytes = copied,
            "streamed parameter into blob"
        );
        self.params[index - 1] = Slot::Streamed;
        Ok(())
    }

    /// Close the write handles kept by [`set_blob_stream`](Statement::set_blob_stream).
    pub(crate) fn release_blob_streams(&mut self) {
        for stream in self.blob_streams.iter_mut().filter_map(Option::take) {
            if let Err(e) = stream.blob.close() {
                tracing::debug!(table = %stream.target.table, error = %e, "blob stream close failed");
            }
        }
    }

    /// Null every binding and forget recorded values and the row id.
    pub fn clear_parameters(&mut self) -> Result<()> {
        self.release_blob_streams();
        self.clear_bindings()?;
        self.params.fill(Slot::Unbound);
        self.bound_checked = false;
        self.row_id = None;
        Ok(())
    }

    /// Fail unless every marker has been given a value.
    pub(crate) fn check_parameters(&mut self) -> Result<()> {
        if self.bound_checked {
            return Ok(());
        }
        if self.params.iter().any(|slot| *slot == Slot::Unbound) {
            return Err(Error::misuse(
                MisuseErrorKind::UnboundParameter,
                "a value must be provided for each parameter marker",
            ));
        }
        self.bound_checked = true;
        Ok(())
    }

    fn bind_native(&mut self, index: usize, value: &Value) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let state = conn.lock_open()?;
        let stmt = self.live_handle()?;
        if self.state != StatementState::Prepared {
            // Bindings can only change while the statement is reset.
            self.reset_locked()?;
        }
        // SAFETY: stmt is live, index was validated and the lock is held
        let rc = unsafe { bind_value(stmt, index as c_int, value, &state.date_time) };
        result_code::check(state.db, StatementErrorKind::Bind, rc, Some(self.sql()))
    }

    // ==================== Batching ====================

    /// Snapshot the current parameter values as one batch entry.
    ///
    /// From now on setters only record values until the batch is executed.
    pub fn add_batch(&mut self) -> Result<()> {
        self.live_handle()?;
        self.check_parameters()?;
        self.batching = true;
        self.batch.push(self.params.clone());
        Ok(())
    }

    pub fn batch_len(&self) -> usize {
        self.batch.len()
    }

    /// Drop every pending batch entry and leave batching mode.
    pub fn clear_batch(&mut self) {
        self.batch.clear();
        self.batching = false;
    }

    /// Execute every batch entry as an update, continuing past failures.
    ///
    /// Returns the change count of each entry, or [`Error::Batch`] carrying
    /// every entry's status and the errors of the failed ones.
    #[tracing::instrument(level = "debug", skip(self), fields(entries = self.batch.len()))]
    pub fn execute_batch(&mut self) -> Result<Vec<u64>> {
        self.batching = false;
        let entries = std::mem::take(&mut self.batch);
        let mut statuses = Vec::with_capacity(entries.len());
        let mut errors = Vec::new();

        for (i, entry) in entries.into_iter().enumerate() {
            match self.rebind(&entry).and_then(|()| self.execute_update()) {
                Ok(count) => statuses.push(BatchStatus::Updated(count)),
                Err(e) => {
                    tracing::warn!(entry = i, error = %e, "batch entry failed");
                    statuses.push(BatchStatus::Failed);
                    errors.push((i, e));
                }
            }
            self.params = entry;
        }
        self.clear_batch();

        if errors.is_empty() {
            Ok(statuses
                .into_iter()
                .map(|s| match s {
                    BatchStatus::Updated(n) => n,
                    BatchStatus::Failed => 0,
                })
                .collect())
        } else {
            Err(Error::Batch(BatchError { statuses, errors }))
        }
    }

    fn rebind(&mut self, entry: &[Slot]) -> Result<()> {
        for (i, slot) in entry.iter().enumerate() {
            if let Slot::Value(value) = slot {
                self.bind_native(i + 1, value)?;
            }
        }
        Ok(())
    }
}
