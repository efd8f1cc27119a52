//! Core types for the litebridge SQLite driver.
//!
//! This crate holds everything that does not touch the native engine:
//!
//! - `Value`, the tagged union of bindable and readable SQL values
//! - `Row` and `ColumnInfo`, materialized snapshots of result rows
//! - `Affinity` and `StorageClass`, the engine's type-affinity rules
//! - `DateTimeConfig`, the per-connection date/time storage formats
//! - `Error`, the driver-wide error taxonomy

pub mod datetime;
pub mod error;
pub mod row;
pub mod types;
pub mod value;

pub use datetime::{DateTimeConfig, DateTimeFormat, DateTimeKind, StoredDateTime};
pub use error::{
    BatchError, BatchStatus, ConnectionError, ConnectionErrorKind, EngineErrorClass, Error,
    MisuseError, MisuseErrorKind, ResourceError, ResourceErrorKind, Result, StatementError,
    StatementErrorKind, TypeError,
};
pub use row::{ColumnInfo, FromValue, Row};
pub use types::{Affinity, StorageClass};
pub use value::Value;
