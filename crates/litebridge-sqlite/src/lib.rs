//! SQLite driver for litebridge.
//!
// FFI bindings require unsafe code - this is expected for database drivers
#![allow(unsafe_code)]
//!
//! This crate wraps the native SQLite library (statically bundled through
//! `libsqlite3-sys`) behind a small JDBC-style surface: a [`Connection`]
//! owning one database handle, [`Statement`]s with typed parameter
//! binding and batching, a [`Rows`] cursor and streaming [`Blob`] handles.
//!
//! # Example
//!
//! ```rust,no_run
//! use litebridge_sqlite::{Connection, Value};
//!
//! let conn = Connection::open_memory()?;
//! conn.execute("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)")?;
//!
//! let mut insert = conn.prepare("INSERT INTO users (name) VALUES (?)")?;
//! insert.set_text(1, "Alice")?;
//! assert_eq!(insert.execute_update()?, 1);
//!
//! let rows = conn.query_rows("SELECT name FROM users WHERE id = ?", &[Value::BigInt(1)])?;
//! assert_eq!(rows[0].get_named::<String>("name")?, "Alice");
//! # Ok::<(), litebridge_sqlite::Error>(())
//! ```
//!
//! # Type Mapping
//!
//! | Rust / `Value` | SQLite storage |
//! |----------------|----------------|
//! | `bool` | INTEGER (0/1) |
//! | `i32`, `i64` | INTEGER |
//! | `f32`, `f64` | REAL |
//! | `String`, decimal text | TEXT |
//! | `Vec<u8>`, zero blob | BLOB |
//! | `Date`, `Time`, `Timestamp` | INTEGER ms, REAL Julian day or TEXT, per [`DateTimeConfig`] |
//!
//! # Thread Safety
//!
//! `Connection` is both `Send` and `Sync`; an internal mutex serializes
//! every native call. Statements and blobs are `Send`. Long-running steps
//! can be cancelled from another thread through an [`InterruptHandle`].
//! Hook callbacks and scalar functions run while that mutex is held and
//! must not call back into the same connection.

pub mod binder;
pub mod blob;
pub mod connection;
pub mod cursor;
pub mod ffi;
pub mod hooks;
pub mod result_code;
pub mod statement;

pub use binder::BlobTarget;
pub use blob::Blob;
pub use connection::{
    ColumnMetadata, Connection, InterruptHandle, MEMORY, OpenFlags, Savepoint, SqliteConfig,
    TEMP_FILE, lib_version, lib_version_number, threadsafe,
};
pub use cursor::{FromColumn, Rows};
pub use hooks::{Hook, HookKind, UpdateAction};
pub use result_code::{ResultClass, error_string, result_code_name};
pub use statement::{ParameterMetadata, ParameterMode, StatementState, Statement, StepResult};

pub use litebridge_core::{
    Affinity, BatchError, BatchStatus, DateTimeConfig, DateTimeFormat, Error, Result, Row,
    StorageClass, Value,
};
