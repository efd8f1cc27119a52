//! SQLite connection.
//!
//! A [`Connection`] exclusively owns one native database handle. Statements
//! and blob handles created from it share its inner state so every native
//! call is serialized by the same mutex and can detect a closed connection.

// Allow casts in FFI code where we need to match C types exactly
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::borrow_as_ptr)]

use std::ffi::{CString, c_char, c_int};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use litebridge_core::error::{ConnectionError, ConnectionErrorKind, StatementErrorKind};
use litebridge_core::{DateTimeConfig, Error, MisuseErrorKind, Result, Row, Value};

use crate::blob::Blob;
use crate::ffi;
use crate::hooks::{self, Hook, HookKind, HookSlots};
use crate::result_code;
use crate::statement::{self, Statement};

/// Path of a private in-memory database.
pub const MEMORY: &str = ":memory:";
/// Path of a private temporary on-disk database.
pub const TEMP_FILE: &str = "";

/// Configuration for opening SQLite connections.
///
/// Deserializes from partial documents; missing fields take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    /// Path to the database file, `":memory:"` or `""` for a temporary file.
    pub path: String,
    /// Open flags (read-only, read-write, create, etc.)
    pub flags: OpenFlags,
    /// Name of the VFS module to use, `None` for the default.
    pub vfs: Option<String>,
    /// Busy timeout in milliseconds; 0 disables the busy handler.
    pub busy_timeout_ms: u32,
    /// Report extended result codes from the engine.
    pub extended_result_codes: bool,
    /// Storage formats for DATE, TIME and TIMESTAMP values.
    pub date_time: DateTimeConfig,
}

/// Flags controlling how the database is opened.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenFlags {
    /// Open for reading only.
    pub read_only: bool,
    /// Open for reading and writing.
    pub read_write: bool,
    /// Create the database if it doesn't exist.
    pub create: bool,
    /// Enable URI filename interpretation.
    pub uri: bool,
    /// Open a named in-memory database.
    pub memory: bool,
    /// Open in multi-thread mode (connections not shared between threads).
    pub no_mutex: bool,
    /// Open in serialized mode (connections can be shared).
    pub full_mutex: bool,
    /// Enable shared cache mode.
    pub shared_cache: bool,
    /// Disable shared cache mode.
    pub private_cache: bool,
}

impl OpenFlags {
    /// Create flags for read-only access.
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Default::default()
        }
    }

    /// Create flags for read-write access (database must exist).
    pub fn read_write() -> Self {
        Self {
            read_write: true,
            ..Default::default()
        }
    }

    /// Create flags for read-write access with creation if needed.
    pub fn create_read_write() -> Self {
        Self {
            read_write: true,
            create: true,
            ..Default::default()
        }
    }

    pub fn uri(mut self) -> Self {
        self.uri = true;
        self
    }

    pub fn memory(mut self) -> Self {
        self.memory = true;
        self
    }

    pub fn no_mutex(mut self) -> Self {
        self.no_mutex = true;
        self
    }

    pub fn full_mutex(mut self) -> Self {
        self.full_mutex = true;
        self
    }

    pub fn shared_cache(mut self) -> Self {
        self.shared_cache = true;
        self
    }

    pub fn private_cache(mut self) -> Self {
        self.private_cache = true;
        self
    }

    pub(crate) fn to_sqlite_flags(self) -> c_int {
        let mut flags = 0;

        if self.read_only {
            flags |= ffi::SQLITE_OPEN_READONLY;
        }
        if self.read_write {
            flags |= ffi::SQLITE_OPEN_READWRITE;
        }
        if self.create {
            flags |= ffi::SQLITE_OPEN_CREATE;
        }
        if self.uri {
            flags |= ffi::SQLITE_OPEN_URI;
        }
        if self.memory {
            flags |= ffi::SQLITE_OPEN_MEMORY;
        }
        if self.no_mutex {
            flags |= ffi::SQLITE_OPEN_NOMUTEX;
        }
        if self.full_mutex {
            flags |= ffi::SQLITE_OPEN_FULLMUTEX;
        }
        if self.shared_cache {
            flags |= ffi::SQLITE_OPEN_SHAREDCACHE;
        }
        if self.private_cache {
            flags |= ffi::SQLITE_OPEN_PRIVATECACHE;
        }

        // Default to read-write if no mode specified
        if flags & (ffi::SQLITE_OPEN_READONLY | ffi::SQLITE_OPEN_READWRITE) == 0 {
            flags |= ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE;
        }

        flags
    }
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: MEMORY.to_string(),
            flags: OpenFlags::create_read_write(),
            vfs: None,
            busy_timeout_ms: 5000,
            extended_result_codes: false,
            date_time: DateTimeConfig::default(),
        }
    }
}

impl SqliteConfig {
    /// Create a new config for a file-based database.
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create a new config for an in-memory database.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Set open flags.
    pub fn flags(mut self, flags: OpenFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn vfs(mut self, vfs: impl Into<String>) -> Self {
        self.vfs = Some(vfs.into());
        self
    }

    /// Set busy timeout.
    pub fn busy_timeout(mut self, ms: u32) -> Self {
        self.busy_timeout_ms = ms;
        self
    }

    pub fn extended_result_codes(mut self, on: bool) -> Self {
        self.extended_result_codes = on;
        self
    }

    pub fn date_time(mut self, config: DateTimeConfig) -> Self {
        self.date_time = config;
        self
    }
}

/// Mutable connection state, protected by the connection mutex.
pub(crate) struct DbState {
    /// Null once the connection is closed.
    pub(crate) db: *mut ffi::sqlite3,
    auto_commit: bool,
    savepoint_id: u64,
    pub(crate) date_time: DateTimeConfig,
    hooks: HookSlots,
}

// SAFETY: the engine is compiled thread-safe and every access to the handle
// goes through the connection Mutex.
unsafe impl Send for DbState {}

impl Drop for DbState {
    fn drop(&mut self) {
        // Only reached when a close failed; release the handle once nothing
        // refers to it anymore.
        if !self.db.is_null() {
            self.hooks.clear(self.db);
            // SAFETY: db is live and no statement or blob can use it after this
            unsafe { ffi::sqlite3_close_v2(self.db) };
            self.db = ptr::null_mut();
        }
    }
}

/// Handle slot shared with [`InterruptHandle`]s, nulled on close.
struct InterruptCell(Mutex<*mut ffi::sqlite3>);

// SAFETY: only sqlite3_interrupt is called through this pointer, which is
// safe from any thread while the handle is open; close nulls the pointer
// while holding the same lock.
unsafe impl Send for InterruptCell {}
unsafe impl Sync for InterruptCell {}

pub(crate) struct ConnInner {
    state: Mutex<DbState>,
    interrupt: Arc<InterruptCell>,
    /// Bumped each time the connection finalizes outstanding statements.
    sweeps: AtomicU64,
    path: String,
    read_only: bool,
}

impl ConnInner {
    /// Lock the connection state, recovering from a poisoned lock.
    pub(crate) fn lock(&self) -> MutexGuard<'_, DbState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock the connection state, failing if the connection is closed.
    pub(crate) fn lock_open(&self) -> Result<MutexGuard<'_, DbState>> {
        let guard = self.lock();
        if guard.db.is_null() {
            return Err(Error::connection_closed(&self.path));
        }
        Ok(guard)
    }

    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::Acquire)
    }

    /// Finalize every statement still open on `db`.
    ///
    /// Statements prepared before the sweep treat their handle as released.
    pub(crate) fn finalize_dangling(&self, db: *mut ffi::sqlite3) {
        self.sweeps.fetch_add(1, Ordering::AcqRel);
        // SAFETY: db is valid and the state lock is held by the caller; each
        // statement is finalized exactly once here and its owner skips the
        // handle once it sees the sweep.
        unsafe {
            let mut stmt = ffi::sqlite3_next_stmt(db, ptr::null_mut());
            while !stmt.is_null() {
                let sql = ffi::to_owned_string(ffi::sqlite3_sql(stmt));
                tracing::warn!(sql = sql.as_deref().unwrap_or(""), "Dangling statement");
                ffi::sqlite3_finalize(stmt);
                stmt = ffi::sqlite3_next_stmt(db, ptr::null_mut());
            }
        }
    }
}

/// Cancels long-running statements of a connection from another thread.
///
/// Calling [`interrupt`](InterruptHandle::interrupt) after the connection
/// has been closed does nothing.
#[derive(Clone)]
pub struct InterruptHandle {
    cell: Arc<InterruptCell>,
}

impl InterruptHandle {
    pub fn interrupt(&self) {
        let db = self.cell.0.lock().unwrap_or_else(PoisonError::into_inner);
        if !db.is_null() {
            // SAFETY: the handle stays open while we hold the lock
            unsafe { ffi::sqlite3_interrupt(*db) };
        }
    }
}

/// A named transaction savepoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Savepoint {
    id: Option<u64>,
    name: String,
}

impl Savepoint {
    /// Counter value for auto-named savepoints.
    pub fn id(&self) -> Option<u64> {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Declared properties of a table column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMetadata {
    pub declared_type: Option<String>,
    pub collation: Option<String>,
    pub not_null: bool,
    pub primary_key: bool,
    pub auto_increment: bool,
}

/// A connection to a SQLite database.
///
/// `Connection` is `Send` and `Sync`; all native calls are serialized by an
/// internal mutex.
pub struct Connection {
    inner: Arc<ConnInner>,
}

impl Connection {
    /// Open a new SQLite connection with the given configuration.
    #[tracing::instrument(level = "debug", skip(config), fields(path = %config.path))]
    pub fn open(config: &SqliteConfig) -> Result<Self> {
        if !ffi::threadsafe() {
            return Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Open,
                message: "sqlite library was not compiled for thread-safe operation".to_string(),
                code: None,
            }));
        }

        let c_path = CString::new(config.path.as_str())
            .map_err(|_| config_error("Invalid path: contains null byte"))?;
        let c_vfs = config
            .vfs
            .as_deref()
            .map(CString::new)
            .transpose()
            .map_err(|_| config_error("Invalid VFS name: contains null byte"))?;

        let mut db: *mut ffi::sqlite3 = ptr::null_mut();
        let flags = config.flags.to_sqlite_flags();

        // SAFETY: We pass valid pointers and check the return value
        let rc = unsafe {
            ffi::sqlite3_open_v2(
                c_path.as_ptr(),
                &mut db,
                flags,
                c_vfs.as_ref().map_or(ptr::null(), |v| v.as_ptr()),
            )
        };

        if rc != ffi::SQLITE_OK {
            let err = result_code::connection_error(
                db,
                ConnectionErrorKind::Open,
                rc,
                format!(
                    "error while opening a database connection to '{}'",
                    config.path
                ),
            );
            if !db.is_null() {
                // SAFETY: the partially opened handle must still be released
                unsafe { ffi::sqlite3_close(db) };
            }
            tracing::debug!(rc, "open failed");
            return Err(err);
        }

        // SAFETY: db is valid; "main" is a static C string
        let db_read_only = unsafe { ffi::sqlite3_db_readonly(db, c"main".as_ptr()) } == 1;

        let conn = Self {
            inner: Arc::new(ConnInner {
                state: Mutex::new(DbState {
                    db,
                    auto_commit: true,
                    savepoint_id: 0,
                    date_time: config.date_time,
                    hooks: HookSlots::default(),
                }),
                interrupt: Arc::new(InterruptCell(Mutex::new(db))),
                sweeps: AtomicU64::new(0),
                path: config.path.clone(),
                read_only: flags & ffi::SQLITE_OPEN_READONLY != 0 || db_read_only,
            }),
        };

        if config.busy_timeout_ms > 0 {
            conn.set_busy_timeout(config.busy_timeout_ms)?;
        }
        if config.extended_result_codes {
            conn.set_extended_result_codes(true)?;
        }

        tracing::debug!(read_only = conn.inner.read_only, "connection opened");
        Ok(conn)
    }

    /// Open an in-memory database.
    pub fn open_memory() -> Result<Self> {
        Self::open(&SqliteConfig::memory())
    }

    /// Open a file-based database.
    pub fn open_file(path: impl Into<String>) -> Result<Self> {
        Self::open(&SqliteConfig::file(path))
    }

    /// Get the database path.
    pub fn path(&self) -> &str {
        self.inner.path()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().db.is_null()
    }

    /// Whether the connection was opened read-only or the main database is read-only.
    pub fn is_read_only(&self) -> bool {
        self.inner.read_only
    }

    /// Execute one or more `;`-separated SQL statements, discarding any rows.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn execute(&self, sql: &str) -> Result<()> {
        let state = self.inner.lock_open()?;
        statement::execute_script(state.db, sql)
    }

    /// Compile the first statement of `sql`.
    pub fn prepare(&self, sql: &str) -> Result<Statement> {
        Statement::prepare(Arc::clone(&self.inner), sql)
    }

    /// Run a query with positional parameters and collect every row.
    #[tracing::instrument(level = "debug", skip(self, params))]
    pub fn query_rows(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let mut stmt = self.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        let mut out = Vec::new();
        while rows.next()? {
            out.push(rows.to_row()?);
        }
        Ok(out)
    }

    /// Run a data-modifying statement with positional parameters and return
    /// the number of changed rows.
    #[tracing::instrument(level = "debug", skip(self, params))]
    pub fn execute_update(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let mut stmt = self.prepare(sql)?;
        stmt.bind_all(params)?;
        stmt.execute_update()
    }

    // ==================== Transactions ====================

    /// Client-side autocommit flag.
    pub fn auto_commit(&self) -> bool {
        self.inner.lock().auto_commit
    }

    /// The engine's own view of autocommit mode.
    pub fn engine_auto_commit(&self) -> Result<bool> {
        let state = self.inner.lock_open()?;
        // SAFETY: db is valid while the lock is held
        Ok(unsafe { ffi::sqlite3_get_autocommit(state.db) } != 0)
    }

    /// Switch autocommit mode: `false` opens a transaction, `true` commits it.
    pub fn set_auto_commit(&self, auto_commit: bool) -> Result<()> {
        let mut state = self.inner.lock_open()?;
        if state.auto_commit == auto_commit {
            return Ok(());
        }
        statement::execute_script(state.db, if auto_commit { "COMMIT" } else { "BEGIN" })?;
        state.auto_commit = auto_commit;
        tracing::debug!(auto_commit, "autocommit changed");
        Ok(())
    }

    /// Commit the current transaction and immediately begin a new one.
    pub fn commit(&self) -> Result<()> {
        self.end_transaction("COMMIT; BEGIN")
    }

    /// Roll back the current transaction and immediately begin a new one.
    pub fn rollback(&self) -> Result<()> {
        self.end_transaction("ROLLBACK; BEGIN")
    }

    fn end_transaction(&self, sql: &str) -> Result<()> {
        let state = self.inner.lock_open()?;
        if state.auto_commit {
            return Err(Error::misuse(
                MisuseErrorKind::InvalidState,
                "database in auto-commit mode",
            ));
        }
        tracing::debug!(sql, "ending transaction");
        statement::execute_script(state.db, sql)
    }

    /// Create a savepoint named from the connection's counter.
    pub fn savepoint(&self) -> Result<Savepoint> {
        let mut state = self.inner.lock_open()?;
        let id = state.savepoint_id;
        let savepoint = Savepoint {
            id: Some(id),
            name: id.to_string(),
        };
        statement::execute_script(state.db, &format!("SAVEPOINT {}", quote(&savepoint.name)))?;
        state.savepoint_id += 1;
        Ok(savepoint)
    }

    pub fn savepoint_named(&self, name: &str) -> Result<Savepoint> {
        let state = self.inner.lock_open()?;
        statement::execute_script(state.db, &format!("SAVEPOINT {}", quote(name)))?;
        Ok(Savepoint {
            id: None,
            name: name.to_string(),
        })
    }

    pub fn rollback_to(&self, savepoint: &Savepoint) -> Result<()> {
        let state = self.inner.lock_open()?;
        statement::execute_script(
            state.db,
            &format!("ROLLBACK TO SAVEPOINT {}", quote(&savepoint.name)),
        )
    }

    pub fn release(&self, savepoint: &Savepoint) -> Result<()> {
        let state = self.inner.lock_open()?;
        statement::execute_script(
            state.db,
            &format!("RELEASE SAVEPOINT {}", quote(&savepoint.name)),
        )
    }

    // ==================== Status ====================

    /// Rows changed by the most recent INSERT, UPDATE or DELETE.
    pub fn changes(&self) -> Result<u64> {
        let state = self.inner.lock_open()?;
        // SAFETY: db is valid
        Ok(unsafe { ffi::sqlite3_changes(state.db) }.max(0) as u64)
    }

    /// Rows changed since the connection was opened.
    pub fn total_changes(&self) -> Result<u64> {
        let state = self.inner.lock_open()?;
        // SAFETY: db is valid
        Ok(unsafe { ffi::sqlite3_total_changes(state.db) }.max(0) as u64)
    }

    /// Get the last insert rowid.
    pub fn last_insert_rowid(&self) -> Result<i64> {
        let state = self.inner.lock_open()?;
        // SAFETY: db is valid
        Ok(unsafe { ffi::sqlite3_last_insert_rowid(state.db) })
    }

    pub fn set_busy_timeout(&self, ms: u32) -> Result<()> {
        let state = self.inner.lock_open()?;
        let ms = c_int::try_from(ms).map_err(|_| config_error("busy timeout out of range"))?;
        // SAFETY: db is valid
        let rc = unsafe { ffi::sqlite3_busy_timeout(state.db, ms) };
        if rc != ffi::SQLITE_OK {
            return Err(result_code::connection_error(
                state.db,
                ConnectionErrorKind::Config,
                rc,
                format!("error while setting busy timeout on '{}'", self.path()),
            ));
        }
        Ok(())
    }

    pub fn set_extended_result_codes(&self, on: bool) -> Result<()> {
        let state = self.inner.lock_open()?;
        // SAFETY: db is valid
        let rc = unsafe { ffi::sqlite3_extended_result_codes(state.db, c_int::from(on)) };
        if rc != ffi::SQLITE_OK {
            return Err(result_code::connection_error(
                state.db,
                ConnectionErrorKind::Config,
                rc,
                format!(
                    "error while enabling extended result codes on '{}'",
                    self.path()
                ),
            ));
        }
        Ok(())
    }

    /// Primary result code of the most recent failed call.
    pub fn error_code(&self) -> Result<i32> {
        let state = self.inner.lock_open()?;
        // SAFETY: db is valid
        Ok(unsafe { ffi::sqlite3_errcode(state.db) })
    }

    pub fn extended_error_code(&self) -> Result<i32> {
        let state = self.inner.lock_open()?;
        // SAFETY: db is valid
        Ok(unsafe { ffi::sqlite3_extended_errcode(state.db) })
    }

    pub fn error_message(&self) -> Result<String> {
        let state = self.inner.lock_open()?;
        // SAFETY: db is valid; the message is copied immediately
        Ok(unsafe { ffi::to_owned_string(ffi::sqlite3_errmsg(state.db)) }.unwrap_or_default())
    }

    /// Interrupt any statement currently running on this connection.
    pub fn interrupt(&self) {
        self.interrupt_handle().interrupt();
    }

    /// A handle that can interrupt this connection from another thread.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            cell: Arc::clone(&self.inner.interrupt),
        }
    }

    /// Declared type, collation and constraints of `table.column`.
    ///
    /// `db` is the schema name (`"main"`, `"temp"`, an attached name) or
    /// `None` to search all schemas.
    pub fn table_column_metadata(
        &self,
        db: Option<&str>,
        table: &str,
        column: &str,
    ) -> Result<ColumnMetadata> {
        let c_db = db
            .map(CString::new)
            .transpose()
            .map_err(|_| config_error("schema name contains null byte"))?;
        let c_table =
            CString::new(table).map_err(|_| config_error("table name contains null byte"))?;
        let c_column =
            CString::new(column).map_err(|_| config_error("column name contains null byte"))?;

        let state = self.inner.lock_open()?;
        let mut data_type: *const c_char = ptr::null();
        let mut coll_seq: *const c_char = ptr::null();
        let (mut not_null, mut primary_key, mut auto_inc): (c_int, c_int, c_int) = (0, 0, 0);
        // SAFETY: all out-pointers are valid locals
        let rc = unsafe {
            ffi::sqlite3_table_column_metadata(
                state.db,
                c_db.as_ref().map_or(ptr::null(), |d| d.as_ptr()),
                c_table.as_ptr(),
                c_column.as_ptr(),
                &mut data_type,
                &mut coll_seq,
                &mut not_null,
                &mut primary_key,
                &mut auto_inc,
            )
        };
        if rc != ffi::SQLITE_OK {
            return Err(result_code::statement_error(
                state.db,
                StatementErrorKind::Engine,
                rc,
                None,
            ));
        }
        // SAFETY: the strings are owned by the engine and valid until the next call
        let (declared_type, collation) = unsafe {
            (
                ffi::to_owned_string(data_type),
                ffi::to_owned_string(coll_seq),
            )
        };
        Ok(ColumnMetadata {
            declared_type,
            collation,
            not_null: not_null != 0,
            primary_key: primary_key != 0,
            auto_increment: auto_inc != 0,
        })
    }

    /// Open a streaming handle on one blob or text cell.
    pub fn open_blob(
        &self,
        db: &str,
        table: &str,
        column: &str,
        rowid: i64,
        write: bool,
    ) -> Result<Blob<'_>> {
        Blob::open(&self.inner, db, table, column, rowid, write)
    }

    pub fn date_time_config(&self) -> DateTimeConfig {
        self.inner.lock().date_time
    }

    /// Change the date/time storage formats used by subsequent binds and reads.
    pub fn set_date_time_config(&self, config: DateTimeConfig) {
        self.inner.lock().date_time = config;
    }

    // ==================== Hooks ====================

    /// Install a callback, replacing any active callback of the same kind.
    pub fn set_hook(&self, hook: Hook) -> Result<()> {
        let mut state = self.inner.lock_open()?;
        let kind = hook.kind();
        let db = state.db;
        state.hooks.set(db, hook);
        tracing::debug!(?kind, "hook installed");
        Ok(())
    }

    pub fn remove_hook(&self, kind: HookKind) -> Result<()> {
        let mut state = self.inner.lock_open()?;
        let db = state.db;
        state.hooks.remove(db, kind);
        Ok(())
    }

    pub fn has_hook(&self, kind: HookKind) -> bool {
        self.inner.lock().hooks.is_set(kind)
    }

    /// Register a scalar SQL function.
    ///
    /// `n_args` of -1 accepts any number of arguments. Date/time results are
    /// stored with the connection's current date/time formats.
    pub fn create_scalar_function<F>(
        &self,
        name: &str,
        n_args: i32,
        deterministic: bool,
        f: F,
    ) -> Result<()>
    where
        F: FnMut(&[Value]) -> Result<Value> + Send + 'static,
    {
        let state = self.inner.lock_open()?;
        hooks::create_scalar_function(
            state.db,
            name,
            n_args,
            deterministic,
            state.date_time,
            Box::new(f),
        )
    }

    // ==================== Close ====================

    /// Close the connection.
    ///
    /// Outstanding statements are finalized first. If blob handles are still
    /// open the native handle is released when the last of them closes.
    /// Closing an already closed connection succeeds.
    #[tracing::instrument(level = "debug", skip(self), fields(path = %self.inner.path))]
    pub fn close(&mut self) -> Result<()> {
        let mut state = self.inner.lock();
        if state.db.is_null() {
            return Ok(());
        }
        let db = state.db;
        let mut interrupt = self.inner.interrupt.0.lock().unwrap_or_else(PoisonError::into_inner);

        self.inner.finalize_dangling(db);

        state.hooks.clear(db);

        // SAFETY: db is valid and no statement remains
        let rc = unsafe { ffi::sqlite3_close(db) };
        if rc == ffi::SQLITE_OK {
            state.db = ptr::null_mut();
            *interrupt = ptr::null_mut();
            tracing::debug!("connection closed");
            return Ok(());
        }
        if result_code::primary_code(rc) == ffi::SQLITE_BUSY {
            // Open blob handles keep the database busy; defer the release
            // until the last of them is closed.
            tracing::warn!("blob handles still open; deferring close");
            // SAFETY: db is valid; close_v2 turns it into a zombie handle
            let rc = unsafe { ffi::sqlite3_close_v2(db) };
            state.db = ptr::null_mut();
            *interrupt = ptr::null_mut();
            if rc == ffi::SQLITE_OK {
                return Ok(());
            }
            return Err(result_code::connection_error(
                ptr::null_mut(),
                ConnectionErrorKind::Close,
                rc,
                format!("error while closing connection to '{}'", self.inner.path),
            ));
        }
        Err(result_code::connection_error(
            db,
            ConnectionErrorKind::Close,
            rc,
            format!("error while closing connection to '{}'", self.inner.path),
        ))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "failed to close connection on drop");
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("path", &self.inner.path)
            .field("read_only", &self.inner.read_only)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn config_error(message: &str) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Config,
        message: message.to_string(),
        code: None,
    })
}

/// Quote `s` as an SQL string literal.
pub(crate) fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Run-time library version, e.g. `"3.46.0"`.
pub fn lib_version() -> &'static str {
    ffi::version()
}

/// Run-time library version number, e.g. `3046000`.
pub fn lib_version_number() -> i32 {
    ffi::version_number()
}

/// Whether the engine was compiled thread-safe.
pub fn threadsafe() -> bool {
    ffi::threadsafe()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_memory() {
        let conn = Connection::open_memory().unwrap();
        assert_eq!(conn.path(), ":memory:");
        assert!(!conn.is_closed());
        assert!(!conn.is_read_only());
    }

    #[test]
    fn test_open_flags() {
        let flags = OpenFlags::read_only().to_sqlite_flags();
        assert_eq!(flags, ffi::SQLITE_OPEN_READONLY);
        let flags = OpenFlags::default().to_sqlite_flags();
        assert_eq!(flags, ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE);
        let flags = OpenFlags::create_read_write().uri().shared_cache().to_sqlite_flags();
        assert_ne!(flags & ffi::SQLITE_OPEN_URI, 0);
        assert_ne!(flags & ffi::SQLITE_OPEN_SHAREDCACHE, 0);
    }

    #[test]
    fn test_path_with_nul_is_rejected() {
        let err = Connection::open(&SqliteConfig::file("bad\0path")).unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Config,
                ..
            })
        ));
    }

    #[test]
    fn test_config_from_json() {
        let config: SqliteConfig = serde_json::from_str(
            r#"{"path": "app.db", "flags": {"read_only": true}, "date_time": {"date": "text"}}"#,
        )
        .unwrap();
        assert_eq!(config.path, "app.db");
        assert!(config.flags.read_only);
        assert_eq!(config.busy_timeout_ms, 5000);
        assert_eq!(config.date_time.date, litebridge_core::DateTimeFormat::Text);
        assert_eq!(
            config.date_time.timestamp,
            litebridge_core::DateTimeFormat::UnixEpoch
        );
    }

    #[test]
    fn test_quote_doubles_single_quotes() {
        assert_eq!(quote("sp"), "'sp'");
        assert_eq!(quote("it's"), "'it''s'");
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut conn = Connection::open_memory().unwrap();
        conn.close().unwrap();
        conn.close().unwrap();
        assert!(conn.is_closed());
        assert!(conn.execute("SELECT 1").unwrap_err().is_closed());
        assert!(conn.changes().unwrap_err().is_closed());
    }

    #[test]
    fn test_changes_and_rowid() {
        let conn = Connection::open_memory().unwrap();
        conn.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)")
            .unwrap();
        conn.execute("INSERT INTO t (v) VALUES ('a'); INSERT INTO t (v) VALUES ('b')")
            .unwrap();
        assert_eq!(conn.last_insert_rowid().unwrap(), 2);
        assert_eq!(conn.changes().unwrap(), 1);
        assert_eq!(conn.total_changes().unwrap(), 2);
        let n = conn
            .execute_update("UPDATE t SET v = ?", &[Value::from("z")])
            .unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn test_auto_commit_transitions() {
        let conn = Connection::open_memory().unwrap();
        assert!(conn.auto_commit());
        assert!(conn.engine_auto_commit().unwrap());
        conn.set_auto_commit(false).unwrap();
        assert!(!conn.engine_auto_commit().unwrap());
        // unchanged: no-op
        conn.set_auto_commit(false).unwrap();
        conn.commit().unwrap();
        // commit re-opens a transaction
        assert!(!conn.engine_auto_commit().unwrap());
        conn.set_auto_commit(true).unwrap();
        assert!(conn.engine_auto_commit().unwrap());
    }

    #[test]
    fn test_commit_in_auto_commit_mode_is_misuse() {
        let conn = Connection::open_memory().unwrap();
        for result in [conn.commit(), conn.rollback()] {
            match result {
                Err(Error::Misuse(m)) => assert_eq!(m.kind, MisuseErrorKind::InvalidState),
                other => panic!("unexpected: {:?}", other),
            }
        }
    }

    #[test]
    fn test_table_column_metadata() {
        let conn = Connection::open_memory().unwrap();
        conn.execute(
            "CREATE TABLE m (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL COLLATE NOCASE)",
        )
        .unwrap();
        let id = conn.table_column_metadata(None, "m", "id").unwrap();
        assert!(id.primary_key);
        assert!(id.auto_increment);
        assert_eq!(id.declared_type.as_deref(), Some("INTEGER"));
        let name = conn.table_column_metadata(Some("main"), "m", "name").unwrap();
        assert!(name.not_null);
        assert_eq!(name.collation.as_deref(), Some("NOCASE"));
        assert!(conn.table_column_metadata(None, "m", "missing").is_err());
    }

    #[test]
    fn test_error_accessors() {
        let conn = Connection::open_memory().unwrap();
        assert!(conn.prepare("SELEC 1").is_err());
        assert_eq!(conn.error_code().unwrap(), ffi::SQLITE_ERROR);
        assert!(conn.error_message().unwrap().contains("syntax error"));
    }

    #[test]
    fn test_library_info() {
        assert!(lib_version().starts_with('3'));
        assert!(lib_version_number() >= 3_000_000);
        assert!(threadsafe());
    }
}
