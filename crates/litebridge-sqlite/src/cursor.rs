//! Row cursor over a running query.
//!
//! Column getters use 0-based indexes and read straight from the current
//! native row. Integer and real getters follow the usual driver convention
//! of returning zero for NULL; use [`Rows::is_null`] or the `Option`
//! returning getters to tell the difference.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use std::ffi::{c_char, c_int};
use std::sync::{Arc, MutexGuard};

use litebridge_core::error::{ResourceErrorKind, TypeError};
use litebridge_core::{
    Affinity, ColumnInfo, DateTimeFormat, DateTimeKind, Error, MisuseErrorKind, Result, Row,
    StorageClass, StoredDateTime, Value,
};

use crate::blob::Blob;
use crate::connection::DbState;
use crate::ffi;
use crate::statement::{Statement, StatementState, StepResult};

/// Cursor returned by [`Statement::execute_query`].
///
/// The statement is reset when the cursor is dropped.
pub struct Rows<'stmt> {
    stmt: &'stmt mut Statement,
    /// First row already fetched by `execute_query`.
    pending: bool,
    on_row: bool,
    columns: Option<Arc<ColumnInfo>>,
}

impl<'stmt> Rows<'stmt> {
    pub(crate) fn new(stmt: &'stmt mut Statement, has_first_row: bool) -> Self {
        Self {
            stmt,
            pending: has_first_row,
            on_row: false,
            columns: None,
        }
    }

    /// Advance to the next row; `false` once the rows are exhausted.
    pub fn next(&mut self) -> Result<bool> {
        if self.pending {
            self.pending = false;
            self.on_row = true;
            return Ok(true);
        }
        if self.stmt.state() != StatementState::Row {
            self.on_row = false;
            return Ok(false);
        }
        self.on_row = false;
        let more = self.stmt.step()? == StepResult::Row;
        self.on_row = more;
        Ok(more)
    }

    pub fn column_count(&self) -> usize {
        self.stmt.column_count()
    }

    /// Lock the connection and check that `column` of the current row can be read.
    fn current(
        &self,
        column: usize,
    ) -> Result<(MutexGuard<'_, DbState>, *mut ffi::sqlite3_stmt, c_int)> {
        self.stmt.check_column(column)?;
        let state = self.stmt.conn.lock_open()?;
        let stmt = self.stmt.live_handle()?;
        if !self.on_row || stmt.is_null() {
            return Err(Error::misuse(
                MisuseErrorKind::InvalidState,
                "no current row",
            ));
        }
        Ok((state, stmt, column as c_int))
    }

    /// Runtime storage class of a column in the current row.
    pub fn column_type(&self, column: usize) -> Result<StorageClass> {
        let (_state, stmt, col) = self.current(column)?;
        // SAFETY: stmt is positioned on a row and the lock is held
        Ok(StorageClass::from_code(unsafe { ffi::sqlite3_column_type(stmt, col) }))
    }

    pub fn is_null(&self, column: usize) -> Result<bool> {
        Ok(self.column_type(column)? == StorageClass::Null)
    }

    /// Read a column converted by the affinity of its declared type.
    pub fn get_value(&self, column: usize) -> Result<Value> {
        let (_state, stmt, col) = self.current(column)?;
        // SAFETY: stmt is positioned on a row and the lock is held
        unsafe {
            let class = StorageClass::from_code(ffi::sqlite3_column_type(stmt, col));
            if class == StorageClass::Null {
                return Ok(Value::Null);
            }
            let decl = ffi::to_owned_string(ffi::sqlite3_column_decltype(stmt, col));
            // Values the engine kept in another class are returned as stored.
            Ok(match (Affinity::from_decl_type(decl.as_deref()), class) {
                (Affinity::Integer, StorageClass::Integer) => {
                    Value::BigInt(ffi::sqlite3_column_int64(stmt, col))
                }
                (Affinity::Integer, StorageClass::Float) => {
                    let real = ffi::sqlite3_column_double(stmt, col);
                    integral(real).map_or(Value::Double(real), Value::BigInt)
                }
                (Affinity::Real, StorageClass::Integer | StorageClass::Float) => {
                    Value::Double(ffi::sqlite3_column_double(stmt, col))
                }
                (Affinity::Text, StorageClass::Integer | StorageClass::Float | StorageClass::Text) => {
                    Value::Text(column_text(stmt, col))
                }
                _ => read_storage(stmt, col, class),
            })
        }
    }

    /// Read a column through [`FromColumn`].
    pub fn get<T: FromColumn>(&self, column: usize) -> Result<T> {
        T::from_column(self, column)
    }

    /// 32-bit integer value; 0 for NULL.
    pub fn get_i32(&self, column: usize) -> Result<i32> {
        let (_state, stmt, col) = self.current(column)?;
        // SAFETY: stmt is positioned on a row and the lock is held
        Ok(unsafe { ffi::sqlite3_column_int(stmt, col) })
    }

    /// 64-bit integer value; 0 for NULL.
    pub fn get_i64(&self, column: usize) -> Result<i64> {
        let (_state, stmt, col) = self.current(column)?;
        // SAFETY: stmt is positioned on a row and the lock is held
        Ok(unsafe { ffi::sqlite3_column_int64(stmt, col) })
    }

    /// Real value; 0.0 for NULL.
    pub fn get_f64(&self, column: usize) -> Result<f64> {
        let (_state, stmt, col) = self.current(column)?;
        // SAFETY: stmt is positioned on a row and the lock is held
        Ok(unsafe { ffi::sqlite3_column_double(stmt, col) })
    }

    /// Non-zero integer value; `false` for NULL.
    pub fn get_bool(&self, column: usize) -> Result<bool> {
        Ok(self.get_i64(column)? != 0)
    }

    pub fn get_string(&self, column: usize) -> Result<Option<String>> {
        let (_state, stmt, col) = self.current(column)?;
        // SAFETY: stmt is positioned on a row and the lock is held
        unsafe {
            if ffi::sqlite3_column_type(stmt, col) == ffi::SQLITE_NULL {
                return Ok(None);
            }
            Ok(Some(column_text(stmt, col)))
        }
    }

    pub fn get_bytes(&self, column: usize) -> Result<Option<Vec<u8>>> {
        let (_state, stmt, col) = self.current(column)?;
        // SAFETY: stmt is positioned on a row and the lock is held
        unsafe {
            if ffi::sqlite3_column_type(stmt, col) == ffi::SQLITE_NULL {
                return Ok(None);
            }
            Ok(Some(column_blob(stmt, col)))
        }
    }

    /// `Value::Date`, or `Value::Null`, decoded with the connection's date format.
    pub fn get_date(&self, column: usize) -> Result<Value> {
        self.get_date_time(column, DateTimeKind::Date)
    }

    /// `Value::Time`, or `Value::Null`, decoded with the connection's time format.
    pub fn get_time(&self, column: usize) -> Result<Value> {
        self.get_date_time(column, DateTimeKind::Time)
    }

    /// `Value::Timestamp`, or `Value::Null`, decoded with the connection's timestamp format.
    pub fn get_timestamp(&self, column: usize) -> Result<Value> {
        self.get_date_time(column, DateTimeKind::Timestamp)
    }

    fn get_date_time(&self, column: usize, kind: DateTimeKind) -> Result<Value> {
        let (state, stmt, col) = self.current(column)?;
        let config = state.date_time;
        // SAFETY: stmt is positioned on a row and the lock is held
        let stored = unsafe {
            if ffi::sqlite3_column_type(stmt, col) == ffi::SQLITE_NULL {
                return Ok(Value::Null);
            }
            match config.format_for(kind) {
                DateTimeFormat::UnixEpoch => {
                    StoredDateTime::Integer(ffi::sqlite3_column_int64(stmt, col))
                }
                DateTimeFormat::JulianDay => {
                    StoredDateTime::Real(ffi::sqlite3_column_double(stmt, col))
                }
                DateTimeFormat::Text => StoredDateTime::Text(column_text(stmt, col)),
            }
        };
        drop(state);
        config.decode(kind, &stored).map_err(|e| match e {
            Error::Type(mut te) => {
                te.column = self.column_name(column).ok().flatten();
                Error::Type(te)
            }
            e => e,
        })
    }

    /// 0-based index of the first column named `name` (ASCII case-insensitive).
    pub fn find_column(&self, name: &str) -> Result<Option<usize>> {
        for i in 0..self.column_count() {
            if let Some(column) = self.column_name(i)? {
                if column.eq_ignore_ascii_case(name) {
                    return Ok(Some(i));
                }
            }
        }
        Ok(None)
    }

    // ==================== Metadata ====================

    pub fn column_name(&self, column: usize) -> Result<Option<String>> {
        self.stmt.column_text(column, ffi::sqlite3_column_name)
    }

    pub fn column_decl_type(&self, column: usize) -> Result<Option<String>> {
        self.stmt.column_text(column, ffi::sqlite3_column_decltype)
    }

    /// Table the column's value originates from; `None` for expressions.
    pub fn column_table_name(&self, column: usize) -> Result<Option<String>> {
        self.stmt.column_text(column, ffi::sqlite3_column_table_name)
    }

    /// Underlying table column of an aliased result column.
    pub fn column_origin_name(&self, column: usize) -> Result<Option<String>> {
        self.stmt.column_text(column, ffi::sqlite3_column_origin_name)
    }

    pub fn column_database_name(&self, column: usize) -> Result<Option<String>> {
        self.stmt.column_text(column, ffi::sqlite3_column_database_name)
    }

    /// Snapshot the current row.
    pub fn to_row(&mut self) -> Result<Row> {
        let columns = match &self.columns {
            Some(columns) => Arc::clone(columns),
            None => {
                let names = (0..self.column_count())
                    .map(|i| self.column_name(i).map(Option::unwrap_or_default))
                    .collect::<Result<Vec<_>>>()?;
                let columns = Arc::new(ColumnInfo::new(names));
                self.columns = Some(Arc::clone(&columns));
                columns
            }
        };
        let values = (0..self.column_count())
            .map(|i| self.get_value(i))
            .collect::<Result<Vec<_>>>()?;
        Ok(Row::with_columns(columns, values))
    }

    /// Open a streaming handle on the table cell behind `column` at `rowid`.
    ///
    /// The cursor cannot move while the handle is alive.
    pub fn open_blob(&mut self, column: usize, rowid: i64, write: bool) -> Result<Blob<'_>> {
        let db = self.column_database_name(column)?;
        let table = self.column_table_name(column)?;
        let origin = self.column_origin_name(column)?;
        let (Some(db), Some(table), Some(origin)) = (db, table, origin) else {
            return Err(Error::resource(
                ResourceErrorKind::BlobOpen,
                format!("result column {} does not come from a table column", column),
            ));
        };
        Blob::open(&self.stmt.conn, &db, &table, &origin, rowid, write)
    }
}

impl Drop for Rows<'_> {
    fn drop(&mut self) {
        self.stmt.reset_quietly();
    }
}

/// Copy the text of a column.
///
/// # Safety
/// `stmt` must be positioned on a row and `col` in range.
unsafe fn column_text(stmt: *mut ffi::sqlite3_stmt, col: c_int) -> String {
    // SAFETY: column_text before column_bytes, per the engine's conversion rules
    unsafe {
        let ptr: *const c_char = ffi::sqlite3_column_text(stmt, col);
        let len = ffi::sqlite3_column_bytes(stmt, col).max(0) as usize;
        if ptr.is_null() || len == 0 {
            return String::new();
        }
        let bytes = std::slice::from_raw_parts(ptr.cast::<u8>(), len);
        String::from_utf8_lossy(bytes).into_owned()
    }
}

/// Copy the bytes of a column.
///
/// # Safety
/// `stmt` must be positioned on a row and `col` in range.
unsafe fn column_blob(stmt: *mut ffi::sqlite3_stmt, col: c_int) -> Vec<u8> {
    // SAFETY: column_blob before column_bytes
    unsafe {
        let ptr = ffi::sqlite3_column_blob(stmt, col);
        let len = ffi::sqlite3_column_bytes(stmt, col).max(0) as usize;
        if ptr.is_null() || len == 0 {
            return Vec::new();
        }
        std::slice::from_raw_parts(ptr.cast::<u8>(), len).to_vec()
    }
}

/// `real` as an `i64` when the conversion is exact.
fn integral(real: f64) -> Option<i64> {
    // 2^63 is exactly representable; anything at or above it overflows
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    if real.fract() == 0.0 && (-LIMIT..LIMIT).contains(&real) {
        Some(real as i64)
    } else {
        None
    }
}

/// Read a column as its runtime storage class.
///
/// # Safety
/// `stmt` must be positioned on a row and `col` in range.
unsafe fn read_storage(stmt: *mut ffi::sqlite3_stmt, col: c_int, class: StorageClass) -> Value {
    // SAFETY: guaranteed by the caller
    unsafe {
        match class {
            StorageClass::Integer => Value::BigInt(ffi::sqlite3_column_int64(stmt, col)),
            StorageClass::Float => Value::Double(ffi::sqlite3_column_double(stmt, col)),
            StorageClass::Text => Value::Text(column_text(stmt, col)),
            StorageClass::Blob => Value::Bytes(column_blob(stmt, col)),
            StorageClass::Null => Value::Null,
        }
    }
}

/// Types that can be read from a cursor column.
pub trait FromColumn: Sized {
    fn from_column(rows: &Rows<'_>, column: usize) -> Result<Self>;
}

impl FromColumn for i32 {
    fn from_column(rows: &Rows<'_>, column: usize) -> Result<Self> {
        rows.get_i32(column)
    }
}

impl FromColumn for i64 {
    fn from_column(rows: &Rows<'_>, column: usize) -> Result<Self> {
        rows.get_i64(column)
    }
}

impl FromColumn for f64 {
    fn from_column(rows: &Rows<'_>, column: usize) -> Result<Self> {
        rows.get_f64(column)
    }
}

impl FromColumn for bool {
    fn from_column(rows: &Rows<'_>, column: usize) -> Result<Self> {
        rows.get_bool(column)
    }
}

impl FromColumn for String {
    fn from_column(rows: &Rows<'_>, column: usize) -> Result<Self> {
        rows.get_string(column)?
            .ok_or_else(|| null_error(rows, column, "String"))
    }
}

impl FromColumn for Vec<u8> {
    fn from_column(rows: &Rows<'_>, column: usize) -> Result<Self> {
        rows.get_bytes(column)?
            .ok_or_else(|| null_error(rows, column, "Vec<u8>"))
    }
}

impl FromColumn for Value {
    fn from_column(rows: &Rows<'_>, column: usize) -> Result<Self> {
        rows.get_value(column)
    }
}

impl<T: FromColumn> FromColumn for Option<T> {
    fn from_column(rows: &Rows<'_>, column: usize) -> Result<Self> {
        if rows.is_null(column)? {
            Ok(None)
        } else {
            T::from_column(rows, column).map(Some)
        }
    }
}

fn null_error(rows: &Rows<'_>, column: usize, expected: &'static str) -> Error {
    Error::Type(TypeError {
        expected,
        actual: "NULL".to_string(),
        column: rows.column_name(column).ok().flatten(),
    })
}
