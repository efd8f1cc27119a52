//! Result-code translation.
//!
//! Every native call site funnels its return code through here: codes are
//! classified by their primary code (`code & 0xff`) and failures become
//! `litebridge_core::Error` values carrying a copy of the engine message.

use std::ffi::c_int;

use litebridge_core::error::{
    ConnectionError, ConnectionErrorKind, ResourceError, ResourceErrorKind, StatementError,
    StatementErrorKind,
};
use litebridge_core::{EngineErrorClass, Error, Result};

use crate::ffi;

/// Classification of a native result code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultClass {
    Ok,
    /// `sqlite3_step` produced a row
    Row,
    /// `sqlite3_step` finished
    Done,
    /// BUSY or LOCKED; retrying may succeed
    Busy,
    Constraint,
    /// MISUSE or RANGE
    Misuse,
    Error,
}

impl ResultClass {
    /// Classify a primary or extended result code.
    pub const fn of(code: c_int) -> Self {
        match primary_code(code) {
            ffi::SQLITE_OK => ResultClass::Ok,
            ffi::SQLITE_ROW => ResultClass::Row,
            ffi::SQLITE_DONE => ResultClass::Done,
            ffi::SQLITE_BUSY | ffi::SQLITE_LOCKED => ResultClass::Busy,
            ffi::SQLITE_CONSTRAINT => ResultClass::Constraint,
            ffi::SQLITE_MISUSE | ffi::SQLITE_RANGE => ResultClass::Misuse,
            _ => ResultClass::Error,
        }
    }

    /// OK, ROW and DONE are not failures.
    pub const fn is_success(self) -> bool {
        matches!(self, ResultClass::Ok | ResultClass::Row | ResultClass::Done)
    }

    pub const fn is_retryable(self) -> bool {
        matches!(self, ResultClass::Busy)
    }
}

/// Reduce an extended result code to its primary code.
pub const fn primary_code(code: c_int) -> c_int {
    code & 0xff
}

/// Symbolic name of a result code, e.g. `SQLITE_BUSY`.
///
/// Extended codes are named by their primary code.
pub const fn result_code_name(code: c_int) -> &'static str {
    match primary_code(code) {
        ffi::SQLITE_OK => "SQLITE_OK",
        ffi::SQLITE_ERROR => "SQLITE_ERROR",
        ffi::SQLITE_INTERNAL => "SQLITE_INTERNAL",
        ffi::SQLITE_PERM => "SQLITE_PERM",
        ffi::SQLITE_ABORT => "SQLITE_ABORT",
        ffi::SQLITE_BUSY => "SQLITE_BUSY",
        ffi::SQLITE_LOCKED => "SQLITE_LOCKED",
        ffi::SQLITE_NOMEM => "SQLITE_NOMEM",
        ffi::SQLITE_READONLY => "SQLITE_READONLY",
        ffi::SQLITE_INTERRUPT => "SQLITE_INTERRUPT",
        ffi::SQLITE_IOERR => "SQLITE_IOERR",
        ffi::SQLITE_CORRUPT => "SQLITE_CORRUPT",
        ffi::SQLITE_NOTFOUND => "SQLITE_NOTFOUND",
        ffi::SQLITE_FULL => "SQLITE_FULL",
        ffi::SQLITE_CANTOPEN => "SQLITE_CANTOPEN",
        ffi::SQLITE_PROTOCOL => "SQLITE_PROTOCOL",
        ffi::SQLITE_EMPTY => "SQLITE_EMPTY",
        ffi::SQLITE_SCHEMA => "SQLITE_SCHEMA",
        ffi::SQLITE_TOOBIG => "SQLITE_TOOBIG",
        ffi::SQLITE_CONSTRAINT => "SQLITE_CONSTRAINT",
        ffi::SQLITE_MISMATCH => "SQLITE_MISMATCH",
        ffi::SQLITE_MISUSE => "SQLITE_MISUSE",
        ffi::SQLITE_NOLFS => "SQLITE_NOLFS",
        ffi::SQLITE_AUTH => "SQLITE_AUTH",
        ffi::SQLITE_FORMAT => "SQLITE_FORMAT",
        ffi::SQLITE_RANGE => "SQLITE_RANGE",
        ffi::SQLITE_NOTADB => "SQLITE_NOTADB",
        ffi::SQLITE_NOTICE => "SQLITE_NOTICE",
        ffi::SQLITE_WARNING => "SQLITE_WARNING",
        ffi::SQLITE_ROW => "SQLITE_ROW",
        ffi::SQLITE_DONE => "SQLITE_DONE",
        _ => "SQLITE_UNKNOWN",
    }
}

/// English description of a result code from the engine.
pub fn error_string(code: c_int) -> &'static str {
    ffi::error_string(code)
}

/// The engine's current message and extended code for `db`, or the static
/// description of `rc` when there is no handle.
pub(crate) fn engine_message(db: *mut ffi::sqlite3, rc: c_int) -> (String, c_int) {
    if db.is_null() {
        return (ffi::error_string(rc).to_string(), rc);
    }
    // SAFETY: db is a live handle; the message is copied before returning
    let (msg, extended) = unsafe {
        (
            ffi::to_owned_string(ffi::sqlite3_errmsg(db)),
            ffi::sqlite3_extended_errcode(db),
        )
    };
    // The handle's last error may belong to another call when `rc` came from
    // an API that does not record its result on the connection.
    let extended = if primary_code(extended) == primary_code(rc) {
        extended
    } else {
        rc
    };
    (
        msg.unwrap_or_else(|| ffi::error_string(rc).to_string()),
        extended,
    )
}

/// Build a statement-level error for a failed native call.
pub(crate) fn statement_error(
    db: *mut ffi::sqlite3,
    kind: StatementErrorKind,
    rc: c_int,
    sql: Option<&str>,
) -> Error {
    let (message, extended_code) = engine_message(db, rc);
    let err = StatementError {
        kind,
        code: primary_code(rc),
        extended_code,
        message,
        sql: sql.map(str::to_string),
    };
    tracing::trace!(
        code = err.code,
        extended = err.extended_code,
        class = ?EngineErrorClass::from_code(err.code),
        "engine error: {}",
        err.message
    );
    Error::Statement(err)
}

/// `Ok(())` when `rc` is `SQLITE_OK`, a statement error otherwise.
pub(crate) fn check(
    db: *mut ffi::sqlite3,
    kind: StatementErrorKind,
    rc: c_int,
    sql: Option<&str>,
) -> Result<()> {
    if rc == ffi::SQLITE_OK {
        Ok(())
    } else {
        Err(statement_error(db, kind, rc, sql))
    }
}

pub(crate) fn connection_error(
    db: *mut ffi::sqlite3,
    kind: ConnectionErrorKind,
    rc: c_int,
    context: String,
) -> Error {
    let (message, _) = engine_message(db, rc);
    Error::Connection(ConnectionError {
        kind,
        message: format!("{}: {}", context, message),
        code: Some(primary_code(rc)),
    })
}

pub(crate) fn resource_error(
    db: *mut ffi::sqlite3,
    kind: ResourceErrorKind,
    rc: c_int,
    context: &str,
) -> Error {
    let (message, _) = engine_message(db, rc);
    Error::Resource(ResourceError {
        kind,
        message: format!("{}: {}", context, message),
        code: Some(primary_code(rc)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(ResultClass::of(ffi::SQLITE_OK), ResultClass::Ok);
        assert_eq!(ResultClass::of(ffi::SQLITE_ROW), ResultClass::Row);
        assert_eq!(ResultClass::of(ffi::SQLITE_DONE), ResultClass::Done);
        assert_eq!(ResultClass::of(ffi::SQLITE_BUSY), ResultClass::Busy);
        assert_eq!(ResultClass::of(ffi::SQLITE_LOCKED), ResultClass::Busy);
        assert_eq!(ResultClass::of(ffi::SQLITE_MISUSE), ResultClass::Misuse);
        assert_eq!(ResultClass::of(ffi::SQLITE_RANGE), ResultClass::Misuse);
        assert_eq!(ResultClass::of(ffi::SQLITE_IOERR), ResultClass::Error);
    }

    #[test]
    fn test_extended_codes_reduce_to_primary() {
        // SQLITE_CONSTRAINT_UNIQUE
        let unique = ffi::SQLITE_CONSTRAINT | (8 << 8);
        assert_eq!(primary_code(unique), ffi::SQLITE_CONSTRAINT);
        assert_eq!(ResultClass::of(unique), ResultClass::Constraint);
        // SQLITE_BUSY_SNAPSHOT
        assert!(ResultClass::of(ffi::SQLITE_BUSY | (2 << 8)).is_retryable());
        assert_eq!(result_code_name(unique), "SQLITE_CONSTRAINT");
    }

    #[test]
    fn test_success_classes() {
        assert!(ResultClass::Row.is_success());
        assert!(ResultClass::Done.is_success());
        assert!(!ResultClass::Busy.is_success());
    }

    #[test]
    fn test_error_without_handle_uses_static_message() {
        let err = statement_error(
            std::ptr::null_mut(),
            StatementErrorKind::Step,
            ffi::SQLITE_BUSY,
            Some("SELECT 1"),
        );
        assert!(err.is_retryable());
        assert!(err.to_string().contains("database is locked"));
        assert_eq!(error_string(ffi::SQLITE_MISUSE), "bad parameter or other API misuse");
    }
}
