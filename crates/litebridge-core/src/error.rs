//! Error types for litebridge operations.

use std::fmt;

/// The primary error type for all driver operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-level errors (open failure, operation on a closed connection)
    Connection(ConnectionError),
    /// Engine-reported errors from prepare/bind/step/reset
    Statement(StatementError),
    /// API used in the wrong state or with the wrong shape
    Misuse(MisuseError),
    /// Blob handle errors
    Resource(ResourceError),
    /// Aggregate failure of a batch execution
    Batch(BatchError),
    /// Client-side type conversion errors
    Type(TypeError),
    /// I/O errors from stream adapters
    Io(std::io::Error),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    /// Native result code, when the engine reported one.
    pub code: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// The native open call failed or the engine is not thread-safe
    Open,
    /// The connection has already been closed
    Closed,
    /// The native close call failed
    Close,
    /// Invalid configuration (NUL byte in a path, bad busy timeout, ...)
    Config,
}

#[derive(Debug)]
pub struct StatementError {
    pub kind: StatementErrorKind,
    /// Primary result code (`extended_code & 0xff`)
    pub code: i32,
    /// Extended result code as returned by the engine
    pub extended_code: i32,
    /// Copy of the engine's error message
    pub message: String,
    pub sql: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementErrorKind {
    /// Compilation failed (syntax or semantic error)
    Prepare,
    /// A bind call was rejected
    Bind,
    /// Execution failed while stepping
    Step,
    /// Resetting the statement failed
    Reset,
    /// Any other engine call on the connection
    Engine,
}

/// Coarse classification of an engine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorClass {
    /// BUSY or LOCKED; the caller may retry
    Busy,
    /// A constraint was violated
    Constraint,
    /// The engine detected API misuse (MISUSE, RANGE)
    Misuse,
    /// The operation was interrupted
    Interrupted,
    /// Any other failure
    Error,
}

#[derive(Debug)]
pub struct MisuseError {
    pub kind: MisuseErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MisuseErrorKind {
    /// Executed before every parameter marker was bound
    UnboundParameter,
    /// Parameter index outside `1..=parameter_count`
    ParameterIndex,
    /// Column index outside `0..column_count`, or no column with the given name
    ColumnIndex,
    /// No parameter with the given name
    UnknownParameter,
    /// `execute_query` on a read-only statement without result columns
    NoResultSet,
    /// `execute_query` on an update statement
    UpdateStatement,
    /// `execute_update` on a statement that produced rows
    ReturnsRows,
    /// Operation not valid in the current state (e.g. commit in autocommit mode)
    InvalidState,
    /// The statement has been finalized
    StatementClosed,
    /// A value that has no native mapping for this operation
    UnsupportedValue,
}

#[derive(Debug)]
pub struct ResourceError {
    pub kind: ResourceErrorKind,
    pub message: String,
    pub code: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceErrorKind {
    /// The cell could not be opened
    BlobOpen,
    /// Read/write window outside the blob
    OutOfRange,
    /// Write through a read-only handle
    ReadOnly,
    /// The handle has been closed or invalidated
    BlobClosed,
    /// The engine failed a blob read/write/reopen
    Io,
}

/// Per-entry outcome of a batch execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    /// The entry ran and changed this many rows
    Updated(u64),
    /// The entry failed; its error is in `BatchError::errors`
    Failed,
}

/// A batch that completed with at least one failed entry.
#[derive(Debug)]
pub struct BatchError {
    /// One status per batch entry, in submission order
    pub statuses: Vec<BatchStatus>,
    /// Errors of the failed entries, tagged with their batch index
    pub errors: Vec<(usize, Error)>,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

impl Error {
    /// Is this a busy/locked condition the caller may retry?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Statement(e) => e.class() == EngineErrorClass::Busy,
            _ => false,
        }
    }

    /// Did this error come from an operation on a closed connection or statement?
    pub fn is_closed(&self) -> bool {
        match self {
            Error::Connection(c) => c.kind == ConnectionErrorKind::Closed,
            Error::Misuse(m) => m.kind == MisuseErrorKind::StatementClosed,
            Error::Resource(r) => r.kind == ResourceErrorKind::BlobClosed,
            _ => false,
        }
    }

    /// Primary native result code, if the engine reported one.
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::Connection(e) => e.code,
            Error::Statement(e) => Some(e.code),
            Error::Resource(e) => e.code,
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Statement(e) => e.sql.as_deref(),
            _ => None,
        }
    }

    /// Build a misuse error.
    pub fn misuse(kind: MisuseErrorKind, message: impl Into<String>) -> Self {
        Error::Misuse(MisuseError {
            kind,
            message: message.into(),
        })
    }

    /// Build a resource error without a native code.
    pub fn resource(kind: ResourceErrorKind, message: impl Into<String>) -> Self {
        Error::Resource(ResourceError {
            kind,
            message: message.into(),
            code: None,
        })
    }

    /// Error returned by any operation on a closed connection.
    pub fn connection_closed(path: &str) -> Self {
        Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Closed,
            message: format!("connection to '{}' closed", path),
            code: None,
        })
    }
}

impl StatementError {
    /// Classify the primary code the way the driver's result-code translator does.
    pub fn class(&self) -> EngineErrorClass {
        EngineErrorClass::from_code(self.code)
    }
}

impl EngineErrorClass {
    /// Classify a (primary or extended) native result code.
    pub fn from_code(code: i32) -> Self {
        match code & 0xff {
            5 | 6 => EngineErrorClass::Busy,
            19 => EngineErrorClass::Constraint,
            21 | 25 => EngineErrorClass::Misuse,
            9 => EngineErrorClass::Interrupted,
            _ => EngineErrorClass::Error,
        }
    }
}

impl BatchError {
    /// Number of entries that failed.
    pub fn failed_count(&self) -> usize {
        self.errors.len()
    }

    /// Change counts with `None` for failed entries.
    pub fn update_counts(&self) -> Vec<Option<u64>> {
        self.statuses
            .iter()
            .map(|s| match s {
                BatchStatus::Updated(n) => Some(*n),
                BatchStatus::Failed => None,
            })
            .collect()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e),
            Error::Statement(e) => write!(f, "Statement error: {}", e),
            Error::Misuse(e) => write!(f, "Misuse: {}", e),
            Error::Resource(e) => write!(f, "Resource error: {}", e),
            Error::Batch(e) => write!(f, "Batch error: {}", e),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Batch(e) => e
                .errors
                .first()
                .map(|(_, err)| err as &(dyn std::error::Error + 'static)),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for StatementError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {}", self.message, self.code)?;
        if self.extended_code != self.code {
            write!(f, ", extended {}", self.extended_code)?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for MisuseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "batch failed: {} of {} entries failed",
            self.errors.len(),
            self.statuses.len()
        )?;
        for (index, err) in &self.errors {
            write!(f, "; [{}] {}", index, err)?;
        }
        Ok(())
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<StatementError> for Error {
    fn from(err: StatementError) -> Self {
        Error::Statement(err)
    }
}

impl From<MisuseError> for Error {
    fn from(err: MisuseError) -> Self {
        Error::Misuse(err)
    }
}

impl From<ResourceError> for Error {
    fn from(err: ResourceError) -> Self {
        Error::Resource(err)
    }
}

impl From<BatchError> for Error {
    fn from(err: BatchError) -> Self {
        Error::Batch(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, Error>;
