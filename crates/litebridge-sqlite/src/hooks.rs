//! Engine callbacks: trace, profile, progress and update hooks, and
//! user-defined scalar SQL functions.
//!
//! Each hook kind has at most one active implementation per connection.
//! Callbacks run on the thread that is stepping a statement, while that
//! thread holds the connection lock: a callback must not call back into the
//! same connection.

use std::ffi::{CString, c_char, c_int, c_uint, c_void};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr;
use std::time::Duration;

use litebridge_core::error::StatementErrorKind;
use litebridge_core::{DateTimeConfig, Error, Result, StoredDateTime, Value};

use crate::ffi;
use crate::result_code;

pub type TraceFn = Box<dyn FnMut(&str) + Send>;
pub type ProfileFn = Box<dyn FnMut(&str, Duration) + Send>;
/// Returns `true` to interrupt the running statement.
pub type ProgressFn = Box<dyn FnMut() -> bool + Send>;
pub type UpdateFn = Box<dyn FnMut(UpdateAction, &str, &str, i64) + Send>;

/// A callback to install on a connection.
pub enum Hook {
    /// Called with the SQL text of each statement as it starts running.
    Trace(TraceFn),
    /// Called with the SQL text and wall-clock duration of each finished statement.
    Profile(ProfileFn),
    /// Called every `period` virtual machine instructions during long-running statements.
    Progress { period: u32, handler: ProgressFn },
    /// Called for every row inserted, updated or deleted in a rowid table.
    Update(UpdateFn),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    Trace,
    Profile,
    Progress,
    Update,
}

/// The kind of row change reported to an update hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateAction {
    Insert,
    Update,
    Delete,
}

impl Hook {
    pub fn kind(&self) -> HookKind {
        match self {
            Hook::Trace(_) => HookKind::Trace,
            Hook::Profile(_) => HookKind::Profile,
            Hook::Progress { .. } => HookKind::Progress,
            Hook::Update(_) => HookKind::Update,
        }
    }
}

/// Trace and profile share the single `sqlite3_trace_v2` registration.
#[derive(Default)]
struct TraceState {
    trace: Option<TraceFn>,
    profile: Option<ProfileFn>,
}

impl TraceState {
    fn mask(&self) -> c_uint {
        let mut mask = 0;
        if self.trace.is_some() {
            mask |= ffi::SQLITE_TRACE_STMT;
        }
        if self.profile.is_some() {
            mask |= ffi::SQLITE_TRACE_PROFILE;
        }
        mask
    }
}

/// Hook state owned by a connection.
///
/// Closures live behind raw pointers handed to the engine; they are
/// reclaimed only after the engine registration is removed.
pub(crate) struct HookSlots {
    trace: *mut TraceState,
    progress: *mut ProgressFn,
    update: *mut UpdateFn,
}

impl Default for HookSlots {
    fn default() -> Self {
        Self {
            trace: ptr::null_mut(),
            progress: ptr::null_mut(),
            update: ptr::null_mut(),
        }
    }
}

impl HookSlots {
    /// Install `hook` on `db`, replacing any previous hook of the same kind.
    pub(crate) fn set(&mut self, db: *mut ffi::sqlite3, hook: Hook) {
        match hook {
            Hook::Trace(f) => self.update_trace(db, |state| state.trace = Some(f)),
            Hook::Profile(f) => self.update_trace(db, |state| state.profile = Some(f)),
            Hook::Progress { period, handler } => {
                let raw = Box::into_raw(Box::new(handler));
                let period = c_int::try_from(period).unwrap_or(c_int::MAX);
                // SAFETY: db is live; raw stays valid until unregistered below
                unsafe {
                    ffi::sqlite3_progress_handler(db, period, Some(progress_callback), raw.cast());
                }
                let old = std::mem::replace(&mut self.progress, raw);
                free(old);
            }
            Hook::Update(f) => {
                let raw = Box::into_raw(Box::new(f));
                // SAFETY: db is live; raw stays valid until unregistered below
                unsafe {
                    ffi::sqlite3_update_hook(db, Some(update_callback), raw.cast());
                }
                let old = std::mem::replace(&mut self.update, raw);
                free(old);
            }
        }
    }

    /// Unregister the hook of `kind`, if any.
    pub(crate) fn remove(&mut self, db: *mut ffi::sqlite3, kind: HookKind) {
        match kind {
            HookKind::Trace => self.update_trace(db, |state| state.trace = None),
            HookKind::Profile => self.update_trace(db, |state| state.profile = None),
            HookKind::Progress => {
                if !self.progress.is_null() {
                    // SAFETY: db is live
                    unsafe { ffi::sqlite3_progress_handler(db, 0, None, ptr::null_mut()) };
                    free(std::mem::replace(&mut self.progress, ptr::null_mut()));
                }
            }
            HookKind::Update => {
                if !self.update.is_null() {
                    // SAFETY: db is live
                    unsafe { ffi::sqlite3_update_hook(db, None, ptr::null_mut()) };
                    free(std::mem::replace(&mut self.update, ptr::null_mut()));
                }
            }
        }
    }

    /// Unregister every hook; called before the native close.
    pub(crate) fn clear(&mut self, db: *mut ffi::sqlite3) {
        for kind in [
            HookKind::Trace,
            HookKind::Profile,
            HookKind::Progress,
            HookKind::Update,
        ] {
            self.remove(db, kind);
        }
    }

    fn update_trace(&mut self, db: *mut ffi::sqlite3, change: impl FnOnce(&mut TraceState)) {
        if self.trace.is_null() {
            self.trace = Box::into_raw(Box::default());
        }
        // SAFETY: self.trace is a live allocation owned by this struct; the
        // engine only touches it from inside a native call made under the
        // connection lock, which the caller holds.
        let state = unsafe { &mut *self.trace };
        change(state);
        let mask = state.mask();
        if mask == 0 {
            // SAFETY: db is live
            unsafe { ffi::sqlite3_trace_v2(db, 0, None, ptr::null_mut()) };
            free(std::mem::replace(&mut self.trace, ptr::null_mut()));
        } else {
            // SAFETY: db is live; self.trace stays valid until unregistered
            unsafe { ffi::sqlite3_trace_v2(db, mask, Some(trace_callback), self.trace.cast()) };
        }
    }

    pub(crate) fn is_set(&self, kind: HookKind) -> bool {
        match kind {
            // SAFETY: non-null trace pointers are live allocations owned by self
            HookKind::Trace => !self.trace.is_null() && unsafe { (*self.trace).trace.is_some() },
            HookKind::Profile => {
                !self.trace.is_null() && unsafe { (*self.trace).profile.is_some() }
            }
            HookKind::Progress => !self.progress.is_null(),
            HookKind::Update => !self.update.is_null(),
        }
    }
}

impl Drop for HookSlots {
    fn drop(&mut self) {
        // Only reached after `clear` or when the handle is already gone.
        free(std::mem::replace(&mut self.trace, ptr::null_mut()));
        free(std::mem::replace(&mut self.progress, ptr::null_mut()));
        free(std::mem::replace(&mut self.update, ptr::null_mut()));
    }
}

fn free<T>(raw: *mut T) {
    if !raw.is_null() {
        // SAFETY: raw came from Box::into_raw and is no longer registered
        drop(unsafe { Box::from_raw(raw) });
    }
}

fn guarded<R>(what: &str, fallback: R, f: impl FnOnce() -> R) -> R {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(r) => r,
        Err(_) => {
            tracing::warn!(hook = what, "callback panicked; panic suppressed at the FFI boundary");
            fallback
        }
    }
}

unsafe extern "C" fn trace_callback(
    event: c_uint,
    ctx: *mut c_void,
    p: *mut c_void,
    x: *mut c_void,
) -> c_int {
    // SAFETY: ctx is the TraceState registered with sqlite3_trace_v2
    let state = unsafe { &mut *ctx.cast::<TraceState>() };
    match event {
        ffi::SQLITE_TRACE_STMT => {
            if let Some(f) = state.trace.as_mut() {
                // SAFETY: for STMT events x is the statement's SQL text
                let sql = unsafe { ffi::to_owned_string(x.cast::<c_char>().cast_const()) };
                guarded("trace", (), || f(sql.as_deref().unwrap_or("")));
            }
        }
        ffi::SQLITE_TRACE_PROFILE => {
            if let Some(f) = state.profile.as_mut() {
                // SAFETY: for PROFILE events p is the statement and x points
                // to the elapsed time in nanoseconds
                let (sql, nanos) = unsafe {
                    (
                        ffi::to_owned_string(ffi::sqlite3_sql(p.cast::<ffi::sqlite3_stmt>())),
                        *x.cast::<i64>(),
                    )
                };
                let elapsed = Duration::from_nanos(u64::try_from(nanos).unwrap_or(0));
                guarded("profile", (), || f(sql.as_deref().unwrap_or(""), elapsed));
            }
        }
        _ => {}
    }
    0
}

unsafe extern "C" fn progress_callback(ctx: *mut c_void) -> c_int {
    // SAFETY: ctx is the ProgressFn registered with sqlite3_progress_handler
    let f = unsafe { &mut *ctx.cast::<ProgressFn>() };
    c_int::from(guarded("progress", false, || f()))
}

unsafe extern "C" fn update_callback(
    ctx: *mut c_void,
    op: c_int,
    db_name: *const c_char,
    table: *const c_char,
    rowid: i64,
) {
    // SAFETY: ctx is the UpdateFn registered with sqlite3_update_hook
    let f = unsafe { &mut *ctx.cast::<UpdateFn>() };
    let action = match op {
        ffi::SQLITE_INSERT => UpdateAction::Insert,
        ffi::SQLITE_DELETE => UpdateAction::Delete,
        _ => UpdateAction::Update,
    };
    // SAFETY: both names are valid C strings for the duration of the call
    let (db_name, table) = unsafe { (ffi::to_owned_string(db_name), ffi::to_owned_string(table)) };
    guarded("update", (), || {
        f(
            action,
            db_name.as_deref().unwrap_or(""),
            table.as_deref().unwrap_or(""),
            rowid,
        );
    });
}

// ==================== Scalar functions ====================

type ScalarFn = Box<dyn FnMut(&[Value]) -> Result<Value> + Send>;

struct ScalarFunction {
    f: ScalarFn,
    date_time: DateTimeConfig,
}

/// Register a scalar SQL function on `db`.
///
/// The closure is owned by the engine from here on and released through
/// the destroy callback when the function is replaced or the connection
/// closes (or immediately, if registration fails).
pub(crate) fn create_scalar_function(
    db: *mut ffi::sqlite3,
    name: &str,
    n_args: i32,
    deterministic: bool,
    date_time: DateTimeConfig,
    f: ScalarFn,
) -> Result<()> {
    let c_name = CString::new(name).map_err(|_| {
        Error::misuse(
            litebridge_core::MisuseErrorKind::UnsupportedValue,
            format!("function name '{}' contains a null byte", name),
        )
    })?;
    let mut flags = ffi::SQLITE_UTF8;
    if deterministic {
        flags |= ffi::SQLITE_DETERMINISTIC;
    }
    let app = Box::into_raw(Box::new(ScalarFunction { f, date_time }));
    // SAFETY: db is live; ownership of `app` passes to the engine, which
    // calls destroy_scalar exactly once (also on failure)
    let rc = unsafe {
        ffi::sqlite3_create_function_v2(
            db,
            c_name.as_ptr(),
            n_args,
            flags,
            app.cast(),
            Some(call_scalar),
            None,
            None,
            Some(destroy_scalar),
        )
    };
    tracing::debug!(function = name, n_args, deterministic, rc, "registered scalar function");
    result_code::check(db, StatementErrorKind::Engine, rc, None)
}

unsafe extern "C" fn destroy_scalar(app: *mut c_void) {
    // SAFETY: app is the ScalarFunction leaked in create_scalar_function
    drop(unsafe { Box::from_raw(app.cast::<ScalarFunction>()) });
}

unsafe fn read_argument(value: *mut ffi::sqlite3_value) -> Value {
    // SAFETY: value is a live argument for the duration of the call
    unsafe {
        match ffi::sqlite3_value_type(value) {
            ffi::SQLITE_INTEGER => Value::BigInt(ffi::sqlite3_value_int64(value)),
            ffi::SQLITE_FLOAT => Value::Double(ffi::sqlite3_value_double(value)),
            ffi::SQLITE_TEXT => {
                let ptr = ffi::sqlite3_value_text(value);
                let len = usize::try_from(ffi::sqlite3_value_bytes(value)).unwrap_or(0);
                if ptr.is_null() {
                    Value::Text(String::new())
                } else {
                    let bytes = std::slice::from_raw_parts(ptr.cast::<u8>(), len);
                    Value::Text(String::from_utf8_lossy(bytes).into_owned())
                }
            }
            ffi::SQLITE_BLOB => {
                let ptr = ffi::sqlite3_value_blob(value);
                let len = usize::try_from(ffi::sqlite3_value_bytes(value)).unwrap_or(0);
                if ptr.is_null() || len == 0 {
                    Value::Bytes(Vec::new())
                } else {
                    Value::Bytes(std::slice::from_raw_parts(ptr.cast::<u8>(), len).to_vec())
                }
            }
            _ => Value::Null,
        }
    }
}

unsafe fn set_result_text(ctx: *mut ffi::sqlite3_context, text: &str) {
    match c_int::try_from(text.len()) {
        // SAFETY: ctx is live; the engine copies the text (transient)
        Ok(len) => unsafe {
            ffi::sqlite3_result_text(ctx, text.as_ptr().cast(), len, ffi::sqlite_transient());
        },
        Err(_) => unsafe { set_result_error(ctx, "result text too large") },
    }
}

unsafe fn set_result_error(ctx: *mut ffi::sqlite3_context, msg: &str) {
    let len = c_int::try_from(msg.len()).unwrap_or(c_int::MAX);
    // SAFETY: ctx is live; the engine copies the message
    unsafe { ffi::sqlite3_result_error(ctx, msg.as_ptr().cast(), len) };
}

unsafe fn set_result(ctx: *mut ffi::sqlite3_context, value: &Value, date_time: &DateTimeConfig) {
    // SAFETY: ctx is live for the duration of the function call
    unsafe {
        match value {
            Value::Null => ffi::sqlite3_result_null(ctx),
            Value::Bool(v) => ffi::sqlite3_result_int64(ctx, i64::from(*v)),
            Value::Int(v) => ffi::sqlite3_result_int64(ctx, i64::from(*v)),
            Value::BigInt(v) => ffi::sqlite3_result_int64(ctx, *v),
            Value::Float(v) => ffi::sqlite3_result_double(ctx, f64::from(*v)),
            Value::Double(v) => ffi::sqlite3_result_double(ctx, *v),
            Value::Decimal(s) | Value::Text(s) => set_result_text(ctx, s),
            Value::Bytes(b) => match c_int::try_from(b.len()) {
                Ok(len) => ffi::sqlite3_result_blob(
                    ctx,
                    b.as_ptr().cast(),
                    len,
                    ffi::sqlite_transient(),
                ),
                Err(_) => set_result_error(ctx, "result blob too large"),
            },
            Value::ZeroBlob(n) => {
                ffi::sqlite3_result_zeroblob(ctx, c_int::try_from(*n).unwrap_or(c_int::MAX));
            }
            Value::Date(_) | Value::Time(_) | Value::Timestamp(_) => {
                match date_time.encode(value) {
                    Some(StoredDateTime::Integer(v)) => ffi::sqlite3_result_int64(ctx, v),
                    Some(StoredDateTime::Real(v)) => ffi::sqlite3_result_double(ctx, v),
                    Some(StoredDateTime::Text(s)) => set_result_text(ctx, &s),
                    None => ffi::sqlite3_result_null(ctx),
                }
            }
        }
    }
}

unsafe extern "C" fn call_scalar(
    ctx: *mut ffi::sqlite3_context,
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
) {
    // SAFETY: user data is the ScalarFunction registered with this function
    let function = unsafe { &mut *ffi::sqlite3_user_data(ctx).cast::<ScalarFunction>() };
    let argc = usize::try_from(argc).unwrap_or(0);
    let args: Vec<Value> = (0..argc)
        // SAFETY: argv holds argc live values
        .map(|i| unsafe { read_argument(*argv.add(i)) })
        .collect();
    let outcome = guarded("scalar function", None, || Some((function.f)(&args)));
    // SAFETY: ctx is live for the duration of the call
    unsafe {
        match outcome {
            Some(Ok(value)) => set_result(ctx, &value, &function.date_time),
            Some(Err(e)) => set_result_error(ctx, &e.to_string()),
            None => set_result_error(ctx, "scalar function panicked"),
        }
    }
}
