//! Incremental blob I/O.
//!
//! A [`Blob`] streams one blob or text cell without loading it. It cannot
//! change the cell's size: reads and writes must stay inside `0..len()`.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]

use std::ffi::{CString, c_int};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::ptr;
use std::sync::Arc;

use litebridge_core::error::ResourceErrorKind;
use litebridge_core::{Error, Result};

use crate::connection::ConnInner;
use crate::ffi;
use crate::result_code;

/// Streaming handle on a single blob cell.
///
/// Borrows the connection or cursor that opened it. Dropping the handle
/// closes it.
pub struct Blob<'a> {
    conn: Arc<ConnInner>,
    blob: *mut ffi::sqlite3_blob,
    len: usize,
    pos: usize,
    read_only: bool,
    /// Set when a reopen failed; the engine aborts the handle.
    aborted: bool,
    _marker: PhantomData<&'a ()>,
}

// SAFETY: the blob handle is only used while holding the connection mutex.
unsafe impl Send for Blob<'_> {}

fn c_arg(what: &str, value: &str) -> Result<CString> {
    CString::new(value).map_err(|_| {
        Error::resource(
            ResourceErrorKind::BlobOpen,
            format!("{} '{}' contains a null byte", what, value.escape_default()),
        )
    })
}

impl<'a> Blob<'a> {
    pub(crate) fn open(
        conn: &Arc<ConnInner>,
        db: &str,
        table: &str,
        column: &str,
        rowid: i64,
        write: bool,
    ) -> Result<Blob<'a>> {
        let c_db = c_arg("database name", db)?;
        let c_table = c_arg("table name", table)?;
        let c_column = c_arg("column name", column)?;

        let state = conn.lock_open()?;
        let mut blob: *mut ffi::sqlite3_blob = ptr::null_mut();
        // SAFETY: all strings are NUL-terminated and the lock is held
        let rc = unsafe {
            ffi::sqlite3_blob_open(
                state.db,
                c_db.as_ptr(),
                c_table.as_ptr(),
                c_column.as_ptr(),
                rowid,
                c_int::from(write),
                &mut blob,
            )
        };
        if rc != ffi::SQLITE_OK {
            if !blob.is_null() {
                // SAFETY: release whatever the engine handed back
                unsafe { ffi::sqlite3_blob_close(blob) };
            }
            return Err(result_code::resource_error(
                state.db,
                ResourceErrorKind::BlobOpen,
                rc,
                &format!(
                    "error while opening blob {}.{}.{} at row {}",
                    db, table, column, rowid
                ),
            ));
        }
        // SAFETY: blob was just opened
        let len = unsafe { ffi::sqlite3_blob_bytes(blob) }.max(0) as usize;
        tracing::trace!(db, table, column, rowid, len, write, "blob opened");

        Ok(Blob {
            conn: Arc::clone(conn),
            blob,
            len,
            pos: 0,
            read_only: !write,
            aborted: false,
            _marker: PhantomData,
        })
    }

    /// Size of the cell in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn handle(&self) -> Result<*mut ffi::sqlite3_blob> {
        if self.blob.is_null() {
            return Err(Error::resource(ResourceErrorKind::BlobClosed, "blob is closed"));
        }
        if self.aborted {
            return Err(Error::resource(
                ResourceErrorKind::BlobClosed,
                "blob handle was aborted by a failed reopen",
            ));
        }
        Ok(self.blob)
    }

    fn check_window(&self, offset: usize, n: usize) -> Result<()> {
        match offset.checked_add(n) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(Error::resource(
                ResourceErrorKind::OutOfRange,
                format!(
                    "{} bytes at offset {} lie outside the blob of {} bytes",
                    n, offset, self.len
                ),
            )),
        }
    }

    /// Move the handle to another row of the same table and column.
    ///
    /// On failure the handle is unusable until closed.
    pub fn reopen(&mut self, rowid: i64) -> Result<()> {
        let blob = self.handle()?;
        let conn = Arc::clone(&self.conn);
        let state = conn.lock_open()?;
        // SAFETY: blob is live and the lock is held
        let rc = unsafe { ffi::sqlite3_blob_reopen(blob, rowid) };
        if rc != ffi::SQLITE_OK {
            self.aborted = true;
            return Err(result_code::resource_error(
                state.db,
                ResourceErrorKind::Io,
                rc,
                &format!("error while reopening blob at row {}", rowid),
            ));
        }
        // SAFETY: blob is live
        self.len = unsafe { ffi::sqlite3_blob_bytes(blob) }.max(0) as usize;
        self.pos = 0;
        Ok(())
    }

    /// Fill `buf` from the cell starting at `offset`.
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> Result<()> {
        let blob = self.handle()?;
        self.check_window(offset, buf.len())?;
        if buf.is_empty() {
            return Ok(());
        }
        let state = self.conn.lock_open()?;
        // SAFETY: window checked against the blob size; lock held
        let rc = unsafe {
            ffi::sqlite3_blob_read(
                blob,
                buf.as_mut_ptr().cast(),
                buf.len() as c_int,
                offset as c_int,
            )
        };
        if rc != ffi::SQLITE_OK {
            return Err(result_code::resource_error(
                state.db,
                ResourceErrorKind::Io,
                rc,
                "error while reading blob",
            ));
        }
        Ok(())
    }

    /// Overwrite the cell with `buf` starting at `offset`.
    pub fn write_at(&mut self, buf: &[u8], offset: usize) -> Result<()> {
        let blob = self.handle()?;
        if self.read_only {
            return Err(Error::resource(
                ResourceErrorKind::ReadOnly,
                "blob was opened read-only",
            ));
        }
        self.check_window(offset, buf.len())?;
        if buf.is_empty() {
            return Ok(());
        }
        let state = self.conn.lock_open()?;
        // SAFETY: window checked against the blob size; lock held
        let rc = unsafe {
            ffi::sqlite3_blob_write(blob, buf.as_ptr().cast(), buf.len() as c_int, offset as c_int)
        };
        if rc != ffi::SQLITE_OK {
            return Err(result_code::resource_error(
                state.db,
                ResourceErrorKind::Io,
                rc,
                "error while writing blob",
            ));
        }
        Ok(())
    }

    /// Close the handle and report the engine's status.
    pub fn close(mut self) -> Result<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<()> {
        if self.blob.is_null() {
            return Ok(());
        }
        // Close even when the connection is gone: the last blob releases a
        // deferred connection close.
        let state = self.conn.lock();
        // SAFETY: blob is live and closed exactly once
        let rc = unsafe { ffi::sqlite3_blob_close(self.blob) };
        self.blob = ptr::null_mut();
        if rc != ffi::SQLITE_OK {
            return Err(result_code::resource_error(
                state.db,
                ResourceErrorKind::Io,
                rc,
                "error while closing blob",
            ));
        }
        Ok(())
    }
}

impl Drop for Blob<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.close_inner() {
            tracing::debug!(error = %e, "blob close failed on drop");
        }
    }
}

impl std::fmt::Debug for Blob<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blob")
            .field("len", &self.len)
            .field("pos", &self.pos)
            .field("read_only", &self.read_only)
            .field("closed", &self.blob.is_null())
            .finish()
    }
}

fn into_io(err: Error) -> io::Error {
    match err {
        Error::Io(e) => e,
        e => io::Error::other(e),
    }
}

impl Read for Blob<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.len.saturating_sub(self.pos));
        if n == 0 {
            return Ok(0);
        }
        self.read_at(&mut buf[..n], self.pos).map_err(into_io)?;
        self.pos += n;
        Ok(n)
    }
}

impl Write for Blob<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = buf.len().min(self.len.saturating_sub(self.pos));
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "write past the end of the blob",
            ));
        }
        self.write_at(&buf[..n], self.pos).map_err(into_io)?;
        self.pos += n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for Blob<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => i128::from(n),
            SeekFrom::End(n) => self.len as i128 + i128::from(n),
            SeekFrom::Current(n) => self.pos as i128 + i128::from(n),
        };
        if target < 0 || target > self.len as i128 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek outside the blob",
            ));
        }
        self.pos = target as usize;
        Ok(self.pos as u64)
    }
}

#[cfg(test)]
mod tests {
    use crate::connection::Connection;

    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_memory().unwrap();
        conn.execute(
            "CREATE TABLE b (id INTEGER PRIMARY KEY, data BLOB);
             INSERT INTO b VALUES (1, x'00112233'), (2, zeroblob(8)), (3, x'AB');",
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_read_write_windows() {
        let conn = conn();
        let mut blob = conn.open_blob("main", "b", "data", 1, true).unwrap();
        assert_eq!(blob.len(), 4);
        let mut buf = [0u8; 2];
        blob.read_at(&mut buf, 2).unwrap();
        assert_eq!(buf, [0x22, 0x33]);
        blob.write_at(&[0xff], 0).unwrap();
        for (offset, n) in [(3, 2), (5, 0), (usize::MAX, 1)] {
            let mut buf = vec![0u8; n];
            match blob.read_at(&mut buf, offset) {
                Err(Error::Resource(r)) => assert_eq!(r.kind, ResourceErrorKind::OutOfRange),
                other => panic!("unexpected: {:?}", other),
            }
        }
        blob.close().unwrap();
        let rows = conn.query_rows("SELECT data FROM b WHERE id = 1", &[]).unwrap();
        assert_eq!(rows[0].get_as::<Vec<u8>>(0).unwrap(), vec![0xff, 0x11, 0x22, 0x33]);
    }

    #[test]
    fn test_read_only_handle_rejects_writes() {
        let conn = conn();
        let mut blob = conn.open_blob("main", "b", "data", 1, false).unwrap();
        match blob.write_at(&[1], 0) {
            Err(Error::Resource(r)) => assert_eq!(r.kind, ResourceErrorKind::ReadOnly),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_io_traits_do_not_grow_blob() {
        let conn = conn();
        let mut blob = conn.open_blob("main", "b", "data", 2, true).unwrap();
        assert_eq!(blob.write(&[1u8; 6]).unwrap(), 6);
        assert_eq!(blob.write(&[2u8; 6]).unwrap(), 2);
        assert_eq!(
            blob.write(&[3u8]).unwrap_err().kind(),
            io::ErrorKind::WriteZero
        );
        blob.seek(SeekFrom::Start(4)).unwrap();
        let mut out = Vec::new();
        blob.read_to_end(&mut out).unwrap();
        assert_eq!(out, vec![1, 1, 2, 2]);
        assert!(blob.seek(SeekFrom::End(1)).is_err());
        assert!(blob.seek(SeekFrom::Current(-100)).is_err());
    }

    #[test]
    fn test_reopen_moves_to_other_row() {
        let conn = conn();
        let mut blob = conn.open_blob("main", "b", "data", 1, false).unwrap();
        blob.reopen(3).unwrap();
        assert_eq!(blob.len(), 1);
        let mut buf = [0u8; 1];
        blob.read_at(&mut buf, 0).unwrap();
        assert_eq!(buf, [0xab]);

        assert!(blob.reopen(99).is_err());
        match blob.read_at(&mut buf, 0) {
            Err(e) => assert!(e.is_closed()),
            Ok(()) => panic!("read through an aborted handle"),
        }
    }

    #[test]
    fn test_open_errors() {
        let conn = conn();
        for result in [
            conn.open_blob("main", "b", "data", 42, false),
            conn.open_blob("main", "missing", "data", 1, false),
            conn.open_blob("main", "b\0", "data", 1, false),
        ] {
            match result {
                Err(Error::Resource(r)) => assert_eq!(r.kind, ResourceErrorKind::BlobOpen),
                other => panic!("unexpected: {:?}", other),
            }
        }
    }
}
