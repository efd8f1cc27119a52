//! Prepared statements.
//!
//! A [`Statement`] moves through `Prepared → Row* → Done`, back to
//! `Prepared` on [`reset`](Statement::reset), and ends in `Finalized`.
//! SQL that compiles to nothing (whitespace, comments) yields a "dumb"
//! statement without a native handle which steps straight to `Done`.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use std::ffi::{CString, c_char, c_int};
use std::ptr;
use std::sync::Arc;

use litebridge_core::error::StatementErrorKind;
use litebridge_core::{Error, MisuseErrorKind, Result};

use crate::binder::{Slot, StreamBlob};
use crate::connection::{ConnInner, DbState};
use crate::cursor::Rows;
use crate::ffi;
use crate::result_code;

/// Outcome of a single [`Statement::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// A result row is available.
    Row,
    /// The statement has run to completion.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementState {
    /// Ready to step; bindings may be changed.
    Prepared,
    /// Positioned on a result row.
    Row,
    /// Ran to completion; must be reset before it runs again.
    Done,
    /// The native handle has been released.
    Finalized,
}

/// Direction of a parameter. SQLite only has input parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterMode {
    In,
}

/// Parameter description of a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterMetadata {
    names: Vec<Option<String>>,
}

impl ParameterMetadata {
    pub fn parameter_count(&self) -> usize {
        self.names.len()
    }

    /// Name of the 1-based parameter, `None` for anonymous `?` markers.
    pub fn name(&self, index: usize) -> Option<&str> {
        index
            .checked_sub(1)
            .and_then(|i| self.names.get(i))
            .and_then(Option::as_deref)
    }

    /// Nullability is never known in advance.
    pub fn is_nullable(&self, _index: usize) -> Option<bool> {
        None
    }

    pub fn mode(&self, _index: usize) -> ParameterMode {
        ParameterMode::In
    }
}

/// A compiled SQL statement bound to its connection.
pub struct Statement {
    pub(crate) conn: Arc<ConnInner>,
    /// Null for dumb and finalized statements.
    pub(crate) stmt: *mut ffi::sqlite3_stmt,
    sql: String,
    tail: String,
    column_count: usize,
    param_count: usize,
    pub(crate) state: StatementState,
    /// One slot per parameter marker, in index order.
    pub(crate) params: Vec<Slot>,
    /// Set once every slot was seen bound; cleared by `clear_parameters`.
    pub(crate) bound_checked: bool,
    pub(crate) batching: bool,
    pub(crate) batch: Vec<Vec<Slot>>,
    pub(crate) row_id: Option<i64>,
    /// Cached write handles of `set_blob_stream`, by parameter index.
    pub(crate) blob_streams: Vec<Option<StreamBlob>>,
    /// Connection sweep count at prepare time.
    sweep: u64,
}

// SAFETY: every use of the statement handle happens while holding the
// connection mutex.
unsafe impl Send for Statement {}

impl Statement {
    pub(crate) fn prepare(conn: Arc<ConnInner>, sql: &str) -> Result<Self> {
        let (stmt, consumed, sweep) = {
            let state = conn.lock_open()?;
            let (stmt, consumed) = prepare_raw(state.db, sql)?;
            (stmt, consumed, conn.sweeps())
        };

        let (column_count, param_count) = if stmt.is_null() {
            (0, 0)
        } else {
            // SAFETY: stmt was just prepared
            unsafe {
                (
                    ffi::sqlite3_column_count(stmt).max(0) as usize,
                    ffi::sqlite3_bind_parameter_count(stmt).max(0) as usize,
                )
            }
        };
        tracing::trace!(sql, column_count, param_count, dumb = stmt.is_null(), "prepared");

        Ok(Self {
            conn,
            stmt,
            sql: sql.to_string(),
            tail: sql.get(consumed..).unwrap_or("").to_string(),
            column_count,
            param_count,
            state: StatementState::Prepared,
            params: vec![Slot::Unbound; param_count],
            bound_checked: false,
            batching: false,
            batch: Vec::new(),
            row_id: None,
            blob_streams: Vec::new(),
            sweep,
        })
    }

    /// The SQL text this statement was prepared from.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// The unparsed remainder after the first statement.
    pub fn tail(&self) -> &str {
        &self.tail
    }

    pub fn column_count(&self) -> usize {
        self.column_count
    }

    pub fn parameter_count(&self) -> usize {
        self.param_count
    }

    /// Whether the SQL compiled to no statement at all.
    pub fn is_dumb(&self) -> bool {
        self.stmt.is_null() && self.state != StatementState::Finalized
    }

    pub fn state(&self) -> StatementState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == StatementState::Finalized || self.swept()
    }

    /// Whether the connection finalized the native handle behind our back.
    fn swept(&self) -> bool {
        self.conn.sweeps() != self.sweep
    }

    /// The native handle, or a closed error once finalized.
    pub(crate) fn live_handle(&self) -> Result<*mut ffi::sqlite3_stmt> {
        if self.state == StatementState::Finalized || self.swept() {
            return Err(Error::misuse(
                MisuseErrorKind::StatementClosed,
                "statement is closed",
            ));
        }
        Ok(self.stmt)
    }

    /// Lock the connection for a native call on this statement.
    fn lock(&self) -> Result<(std::sync::MutexGuard<'_, DbState>, *mut ffi::sqlite3_stmt)> {
        let state = self.conn.lock_open()?;
        let stmt = self.live_handle()?;
        Ok((state, stmt))
    }

    // ==================== Stepping ====================

    /// Advance to the next row.
    pub fn step(&mut self) -> Result<StepResult> {
        let conn = Arc::clone(&self.conn);
        let state = conn.lock_open()?;
        self.step_locked(&state)
    }

    pub(crate) fn step_locked(&mut self, state: &DbState) -> Result<StepResult> {
        let stmt = self.live_handle()?;
        if stmt.is_null() || self.state == StatementState::Done {
            self.state = StatementState::Done;
            return Ok(StepResult::Done);
        }
        // SAFETY: stmt is live and the connection lock is held
        let rc = unsafe { ffi::sqlite3_step(stmt) };
        match rc {
            ffi::SQLITE_ROW => {
                self.state = StatementState::Row;
                Ok(StepResult::Row)
            }
            ffi::SQLITE_DONE => {
                self.state = StatementState::Done;
                Ok(StepResult::Done)
            }
            _ => {
                self.state = StatementState::Prepared;
                Err(result_code::statement_error(
                    state.db,
                    StatementErrorKind::Step,
                    rc,
                    Some(&self.sql),
                ))
            }
        }
    }

    /// Return to the prepared state, keeping bindings.
    pub fn reset(&mut self) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let _state = conn.lock_open()?;
        self.reset_locked()
    }

    pub(crate) fn reset_locked(&mut self) -> Result<()> {
        let stmt = self.live_handle()?;
        if !stmt.is_null() {
            // The return value repeats the last step error, already reported.
            // SAFETY: stmt is live and the connection lock is held
            unsafe { ffi::sqlite3_reset(stmt) };
        }
        self.state = StatementState::Prepared;
        Ok(())
    }

    /// Reset without reporting anything; used when a cursor goes away.
    pub(crate) fn reset_quietly(&mut self) {
        let state = self.conn.lock();
        if !state.db.is_null() && !self.stmt.is_null() && !self.swept() {
            // SAFETY: the connection is open and has not swept the statement
            unsafe { ffi::sqlite3_reset(self.stmt) };
            self.state = StatementState::Prepared;
        }
    }

    /// Set every native binding to NULL.
    pub fn clear_bindings(&mut self) -> Result<()> {
        let (state, stmt) = self.lock()?;
        if !stmt.is_null() {
            // SAFETY: stmt is live
            let rc = unsafe { ffi::sqlite3_clear_bindings(stmt) };
            result_code::check(state.db, StatementErrorKind::Bind, rc, Some(&self.sql))?;
        }
        Ok(())
    }

    /// Release the native handle. Calling it again does nothing.
    pub fn close(&mut self) {
        if self.state == StatementState::Finalized {
            return;
        }
        self.release_blob_streams();
        let conn = Arc::clone(&self.conn);
        let state = conn.lock();
        // A closing connection finalizes every statement it still knows of.
        if !state.db.is_null() && !self.stmt.is_null() && !self.swept() {
            // SAFETY: stmt is live and released exactly once
            let rc = unsafe { ffi::sqlite3_finalize(self.stmt) };
            if rc != ffi::SQLITE_OK {
                tracing::debug!(rc, sql = %self.sql, "finalize reported last step error");
            }
        }
        self.stmt = ptr::null_mut();
        self.state = StatementState::Finalized;
    }

    /// Alias for [`close`](Statement::close).
    pub fn finalize(&mut self) {
        self.close();
    }

    // ==================== Metadata ====================

    /// Name of the 1-based parameter, `None` for anonymous markers.
    pub fn parameter_name(&self, index: usize) -> Result<Option<String>> {
        self.check_index(index)?;
        let (_state, stmt) = self.lock()?;
        // SAFETY: stmt is live and the index is in range
        Ok(unsafe { ffi::to_owned_string(ffi::sqlite3_bind_parameter_name(stmt, index as c_int)) })
    }

    /// 1-based index of a named parameter (`:name`, `@name`, `$name`).
    ///
    /// The name is tried as written first; a bare name is then also tried
    /// with each of those prefixes.
    pub fn parameter_index(&self, name: &str) -> Result<Option<usize>> {
        let (_state, stmt) = self.lock()?;
        if stmt.is_null() {
            return Ok(None);
        }
        let mut candidates = vec![name.to_string()];
        if !name.starts_with([':', '@', '$', '?']) {
            candidates.extend([':', '@', '$'].iter().map(|p| format!("{p}{name}")));
        }
        for candidate in candidates {
            let Ok(c_name) = CString::new(candidate) else {
                return Ok(None);
            };
            // SAFETY: stmt is live, c_name is NUL-terminated
            let index = unsafe { ffi::sqlite3_bind_parameter_index(stmt, c_name.as_ptr()) };
            if index > 0 {
                return Ok(Some(index as usize));
            }
        }
        Ok(None)
    }

    pub fn parameter_metadata(&self) -> Result<ParameterMetadata> {
        let names = (1..=self.param_count)
            .map(|i| self.parameter_name(i))
            .collect::<Result<Vec<_>>>()?;
        Ok(ParameterMetadata { names })
    }

    /// Whether the statement makes no direct changes to the database.
    pub fn is_read_only(&self) -> Result<bool> {
        let (_state, stmt) = self.lock()?;
        if stmt.is_null() {
            return Ok(true);
        }
        // SAFETY: stmt is live
        Ok(unsafe { ffi::sqlite3_stmt_readonly(stmt) } != 0)
    }

    /// Whether the statement has been stepped but not run to completion or reset.
    pub fn is_busy(&self) -> Result<bool> {
        let (_state, stmt) = self.lock()?;
        if stmt.is_null() {
            return Ok(false);
        }
        // SAFETY: stmt is live
        Ok(unsafe { ffi::sqlite3_stmt_busy(stmt) } != 0)
    }

    /// Name of the 0-based result column.
    pub fn column_name(&self, column: usize) -> Result<Option<String>> {
        self.column_text(column, ffi::sqlite3_column_name)
    }

    /// Declared type of the 0-based result column; `None` for expressions.
    pub fn column_decl_type(&self, column: usize) -> Result<Option<String>> {
        self.column_text(column, ffi::sqlite3_column_decltype)
    }

    /// Fetch and copy one piece of column metadata.
    pub(crate) fn column_text(
        &self,
        column: usize,
        getter: unsafe extern "C" fn(*mut ffi::sqlite3_stmt, c_int) -> *const c_char,
    ) -> Result<Option<String>> {
        self.check_column(column)?;
        let (_state, stmt) = self.lock()?;
        // SAFETY: stmt is live, column is in range, and the string is copied
        // before the lock is released
        Ok(unsafe { ffi::to_owned_string(getter(stmt, column as c_int)) })
    }

    pub(crate) fn check_column(&self, column: usize) -> Result<()> {
        if column >= self.column_count {
            return Err(Error::misuse(
                MisuseErrorKind::ColumnIndex,
                format!(
                    "column index {} out of range (statement has {} columns)",
                    column, self.column_count
                ),
            ));
        }
        Ok(())
    }

    pub(crate) fn check_index(&self, index: usize) -> Result<()> {
        self.live_handle()?;
        if index == 0 || index > self.param_count {
            return Err(Error::misuse(
                MisuseErrorKind::ParameterIndex,
                format!(
                    "parameter index out of range: {} (statement has {} parameters)",
                    index, self.param_count
                ),
            ));
        }
        Ok(())
    }

    // ==================== Execution ====================

    /// Run the statement; `true` when it produces a result set.
    #[tracing::instrument(level = "debug", skip(self), fields(sql = %self.sql))]
    pub fn execute(&mut self) -> Result<bool> {
        self.release_blob_streams();
        let conn = Arc::clone(&self.conn);
        let state = conn.lock_open()?;
        self.reset_locked()?;
        self.check_parameters()?;
        let result = self.step_locked(&state)?;
        Ok(result == StepResult::Row || self.column_count > 0)
    }

    /// Run a query and return a cursor over its rows.
    #[tracing::instrument(level = "debug", skip(self), fields(sql = %self.sql))]
    pub fn execute_query(&mut self) -> Result<Rows<'_>> {
        self.release_blob_streams();
        let first = {
            let conn = Arc::clone(&self.conn);
            let state = conn.lock_open()?;
            self.reset_locked()?;
            self.check_parameters()?;
            let result = self.step_locked(&state)?;
            if result == StepResult::Done && self.column_count == 0 {
                let read_only = self.stmt.is_null()
                    // SAFETY: stmt is live
                    || unsafe { ffi::sqlite3_stmt_readonly(self.stmt) } != 0;
                return Err(if read_only {
                    Error::misuse(
                        MisuseErrorKind::NoResultSet,
                        "query does not return a result set",
                    )
                } else {
                    Error::misuse(MisuseErrorKind::UpdateStatement, "update statement")
                });
            }
            result == StepResult::Row
        };
        Ok(Rows::new(self, first))
    }

    /// Run a data-modifying statement and return the number of changed rows.
    ///
    /// Statements that change nothing directly (DDL, dumb statements) report 0.
    #[tracing::instrument(level = "debug", skip(self), fields(sql = %self.sql))]
    pub fn execute_update(&mut self) -> Result<u64> {
        self.release_blob_streams();
        let conn = Arc::clone(&self.conn);
        let state = conn.lock_open()?;
        self.reset_locked()?;
        self.check_parameters()?;
        if self.stmt.is_null() {
            self.state = StatementState::Done;
            return Ok(0);
        }
        // SAFETY: the connection is open
        let before = unsafe { ffi::sqlite3_total_changes(state.db) };
        match self.step_locked(&state)? {
            StepResult::Row => {
                self.reset_locked()?;
                Err(Error::misuse(
                    MisuseErrorKind::ReturnsRows,
                    "statement returns rows",
                ))
            }
            StepResult::Done => {
                // SAFETY: the connection is open
                let (after, changes) = unsafe {
                    (
                        ffi::sqlite3_total_changes(state.db),
                        ffi::sqlite3_changes(state.db),
                    )
                };
                let count = if after == before { 0 } else { changes.max(0) as u64 };
                tracing::debug!(count, "update executed");
                Ok(count)
            }
        }
    }

    /// Bind `params` to markers `1..=params.len()` and run the query.
    pub fn query(&mut self, params: &[litebridge_core::Value]) -> Result<Rows<'_>> {
        self.bind_all(params)?;
        self.execute_query()
    }
}

impl Drop for Statement {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement")
            .field("sql", &self.sql)
            .field("state", &self.state)
            .field("column_count", &self.column_count)
            .field("parameter_count", &self.param_count)
            .finish_non_exhaustive()
    }
}

/// Compile the first statement of `sql`.
///
/// Returns the handle (null when the text holds no statement) and the
/// number of bytes consumed.
pub(crate) fn prepare_raw(db: *mut ffi::sqlite3, sql: &str) -> Result<(*mut ffi::sqlite3_stmt, usize)> {
    let c_sql = CString::new(sql).map_err(|_| {
        Error::misuse(
            MisuseErrorKind::UnsupportedValue,
            "SQL contains a null byte",
        )
    })?;
    let len = c_int::try_from(sql.len() + 1).map_err(|_| {
        Error::misuse(MisuseErrorKind::UnsupportedValue, "SQL text too large")
    })?;
    let mut stmt: *mut ffi::sqlite3_stmt = ptr::null_mut();
    let mut tail: *const c_char = ptr::null();

    // SAFETY: db is live and c_sql is NUL-terminated with `len` bytes
    let rc = unsafe { ffi::sqlite3_prepare_v2(db, c_sql.as_ptr(), len, &mut stmt, &mut tail) };
    if rc != ffi::SQLITE_OK {
        return Err(result_code::statement_error(
            db,
            StatementErrorKind::Prepare,
            rc,
            Some(sql),
        ));
    }

    let consumed = if tail.is_null() {
        sql.len()
    } else {
        // SAFETY: tail points into c_sql
        let offset = unsafe { tail.offset_from(c_sql.as_ptr()) };
        (offset.max(0) as usize).min(sql.len())
    };
    Ok((stmt, consumed))
}

/// Run every statement in `sql` to completion, discarding rows.
pub(crate) fn execute_script(db: *mut ffi::sqlite3, sql: &str) -> Result<()> {
    let mut rest = sql;
    while !rest.trim().is_empty() {
        let (stmt, consumed) = prepare_raw(db, rest)?;
        if !stmt.is_null() {
            let result = run_to_completion(db, stmt, rest);
            // SAFETY: stmt was prepared above and is finalized exactly once
            unsafe { ffi::sqlite3_finalize(stmt) };
            result?;
        }
        if consumed == 0 {
            break;
        }
        rest = rest.get(consumed..).unwrap_or("");
    }
    Ok(())
}

fn run_to_completion(db: *mut ffi::sqlite3, stmt: *mut ffi::sqlite3_stmt, sql: &str) -> Result<()> {
    loop {
        // SAFETY: stmt is live
        match unsafe { ffi::sqlite3_step(stmt) } {
            ffi::SQLITE_ROW => {}
            ffi::SQLITE_DONE => return Ok(()),
            rc => {
                return Err(result_code::statement_error(
                    db,
                    StatementErrorKind::Step,
                    rc,
                    Some(sql),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::connection::Connection;

    use super::*;

    fn conn_with_table() -> Connection {
        let conn = Connection::open_memory().unwrap();
        conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)")
            .unwrap();
        conn
    }

    #[test]
    fn test_prepare_records_tail_and_counts() {
        let conn = conn_with_table();
        let stmt = conn
            .prepare("SELECT id, name FROM t WHERE id = ?; SELECT 2")
            .unwrap();
        assert_eq!(stmt.column_count(), 2);
        assert_eq!(stmt.parameter_count(), 1);
        assert_eq!(stmt.tail().trim(), "SELECT 2");
        assert!(stmt.is_read_only().unwrap());
        assert!(!stmt.is_dumb());
    }

    #[test]
    fn test_dumb_statement_steps_to_done() {
        let conn = conn_with_table();
        let mut stmt = conn.prepare("  -- nothing here\n").unwrap();
        assert!(stmt.is_dumb());
        assert_eq!(stmt.step().unwrap(), StepResult::Done);
        assert_eq!(stmt.execute_update().unwrap(), 0);
        match stmt.execute_query() {
            Err(Error::Misuse(m)) => assert_eq!(m.kind, MisuseErrorKind::NoResultSet),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_prepare_error_carries_sql() {
        let conn = conn_with_table();
        let err = conn.prepare("SELECT * FROM missing").unwrap_err();
        assert_eq!(err.sql(), Some("SELECT * FROM missing"));
        assert!(err.to_string().contains("no such table"));
    }

    #[test]
    fn test_step_and_reset() {
        let conn = conn_with_table();
        conn.execute("INSERT INTO t (name) VALUES ('a'), ('b')").unwrap();
        let mut stmt = conn.prepare("SELECT name FROM t ORDER BY id").unwrap();
        assert_eq!(stmt.step().unwrap(), StepResult::Row);
        assert!(stmt.is_busy().unwrap());
        assert_eq!(stmt.step().unwrap(), StepResult::Row);
        assert_eq!(stmt.step().unwrap(), StepResult::Done);
        // Done stays Done until reset
        assert_eq!(stmt.step().unwrap(), StepResult::Done);
        stmt.reset().unwrap();
        assert_eq!(stmt.state(), StatementState::Prepared);
        assert_eq!(stmt.step().unwrap(), StepResult::Row);
    }

    #[test]
    fn test_execute_update_rejects_rows() {
        let conn = conn_with_table();
        let mut stmt = conn.prepare("SELECT 1").unwrap();
        match stmt.execute_update() {
            Err(Error::Misuse(m)) => assert_eq!(m.kind, MisuseErrorKind::ReturnsRows),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_execute_query_on_update_statement() {
        let conn = conn_with_table();
        let mut stmt = conn.prepare("DELETE FROM t").unwrap();
        match stmt.execute_query() {
            Err(Error::Misuse(m)) => {
                assert_eq!(m.kind, MisuseErrorKind::UpdateStatement);
                assert_eq!(m.message, "update statement");
            }
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_execute_reports_result_set() {
        let conn = conn_with_table();
        assert!(conn.prepare("SELECT * FROM t").unwrap().execute().unwrap());
        assert!(!conn
            .prepare("INSERT INTO t (name) VALUES ('x')")
            .unwrap()
            .execute()
            .unwrap());
    }

    #[test]
    fn test_ddl_reports_zero_changes() {
        let conn = conn_with_table();
        conn.execute("INSERT INTO t (name) VALUES ('a')").unwrap();
        let mut stmt = conn.prepare("CREATE TABLE u (x)").unwrap();
        assert_eq!(stmt.execute_update().unwrap(), 0);
    }

    #[test]
    fn test_close_is_idempotent() {
        let conn = conn_with_table();
        let mut stmt = conn.prepare("SELECT 1").unwrap();
        stmt.close();
        stmt.finalize();
        assert!(stmt.is_closed());
        match stmt.step() {
            Err(e) => assert!(e.is_closed()),
            Ok(r) => panic!("stepped a closed statement: {:?}", r),
        }
    }

    #[test]
    fn test_parameter_metadata() {
        let conn = conn_with_table();
        let stmt = conn
            .prepare("SELECT * FROM t WHERE id = :id AND name = ?")
            .unwrap();
        assert_eq!(stmt.parameter_name(1).unwrap().as_deref(), Some(":id"));
        assert_eq!(stmt.parameter_name(2).unwrap(), None);
        assert_eq!(stmt.parameter_index(":id").unwrap(), Some(1));
        assert_eq!(stmt.parameter_index("id").unwrap(), Some(1));
        assert_eq!(stmt.parameter_index("nope").unwrap(), None);
        let meta = stmt.parameter_metadata().unwrap();
        assert_eq!(meta.parameter_count(), 2);
        assert_eq!(meta.name(1), Some(":id"));
        assert_eq!(meta.is_nullable(1), None);
        assert_eq!(meta.mode(2), ParameterMode::In);
        assert!(stmt.parameter_name(3).is_err());
    }

    #[test]
    fn test_column_metadata() {
        let conn = conn_with_table();
        let stmt = conn.prepare("SELECT id, name, 1 + 1 AS two FROM t").unwrap();
        assert_eq!(stmt.column_name(1).unwrap().as_deref(), Some("name"));
        assert_eq!(stmt.column_decl_type(0).unwrap().as_deref(), Some("INTEGER"));
        assert_eq!(stmt.column_decl_type(2).unwrap(), None);
        match stmt.column_name(3) {
            Err(Error::Misuse(m)) => assert_eq!(m.kind, MisuseErrorKind::ColumnIndex),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_execute_script_stops_at_first_error() {
        let conn = conn_with_table();
        let err = conn
            .execute("INSERT INTO t (name) VALUES ('a'); INSERT INTO nope VALUES (1); INSERT INTO t (name) VALUES ('c')")
            .unwrap_err();
        assert!(matches!(err, Error::Statement(_)));
        let rows = conn.query_rows("SELECT count(*) FROM t", &[]).unwrap();
        assert_eq!(rows[0].get_as::<i64>(0).unwrap(), 1);
    }

    #[test]
    fn test_parameter_index_tries_name_as_written() {
        let conn = conn_with_table();
        let stmt = conn
            .prepare("SELECT * FROM t WHERE id = ?7 AND name = @name OR name = $alt")
            .unwrap();
        assert_eq!(stmt.parameter_index("?7").unwrap(), Some(7));
        assert_eq!(stmt.parameter_index("@name").unwrap(), Some(8));
        assert_eq!(stmt.parameter_index("name").unwrap(), Some(8));
        assert_eq!(stmt.parameter_index("alt").unwrap(), Some(9));
        assert_eq!(stmt.parameter_index(":alt").unwrap(), None);
    }

    #[test]
    fn test_statements_swept_by_connection_are_closed() {
        let conn = conn_with_table();
        let mut stmt = conn.prepare("SELECT id FROM t").unwrap();
        {
            let inner = Arc::clone(&stmt.conn);
            let state = inner.lock();
            inner.finalize_dangling(state.db);
        }
        assert!(stmt.is_closed());
        match stmt.step() {
            Err(Error::Misuse(m)) => assert_eq!(m.kind, MisuseErrorKind::StatementClosed),
            other => panic!("unexpected: {:?}", other),
        }
        // must not finalize the released handle a second time
        stmt.close();
        assert!(stmt.is_closed());
        let mut fresh = conn.prepare("SELECT count(*) FROM t").unwrap();
        assert_eq!(fresh.step().unwrap(), StepResult::Row);
    }
}
