//! Safe libpq wrappers
//!
//! Provides a safe Rust interface to PostgreSQL's C library (libpq) for
//! replication operations: connection lifecycle, query execution, and the
//! non-blocking CopyBoth primitives the receive loop is built on.

use crate::errors::{ReplicationError, ReplicationResult};
use libpq_sys::*;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;

/// `PG_DIAG_SQLSTATE` field code for `PQresultErrorField`
const DIAG_SQLSTATE: c_int = 'C' as c_int;

/// Safe wrapper for a PostgreSQL connection
///
/// All calls must be serialised by the owner; the pipeline keeps the
/// connection behind a `Mutex` so the receive thread and the flush worker
/// never enter libpq concurrently.
pub struct PgConnection {
    conn: *mut PGconn,
}

// Safe to move across threads as long as calls are serialised, which the
// driver's Mutex guarantees.
unsafe impl Send for PgConnection {}

impl PgConnection {
    /// Establishes a connection using the provided conninfo string.
    ///
    /// # Arguments
    /// * `conninfo` - libpq connection parameters
    ///   (e.g., "host=localhost port=5432 dbname=test replication=database")
    pub fn connect(conninfo: &str) -> ReplicationResult<Self> {
        let c_conninfo = CString::new(conninfo)?;
        let conn = unsafe { PQconnectdb(c_conninfo.as_ptr()) };

        if conn.is_null() {
            return Err(ReplicationError::connection(
                "failed to allocate connection object",
            ));
        }

        let status = unsafe { PQstatus(conn) };
        if status != ConnStatusType::CONNECTION_OK {
            let error_msg = error_message_for(conn);
            unsafe { PQfinish(conn) };
            return Err(ReplicationError::connection(format!(
                "connection failed: {error_msg}"
            )));
        }

        Ok(Self { conn })
    }

    /// Executes a command on the connection and returns its result.
    ///
    /// A returned `PgQueryResult` may still describe a server-side failure;
    /// callers check `is_ok()` / `status()` / `sqlstate()`.
    pub fn exec(&self, query: &str) -> ReplicationResult<PgQueryResult> {
        let c_query = CString::new(query)?;
        let result = unsafe { PQexec(self.conn, c_query.as_ptr()) };

        if result.is_null() {
            return Err(ReplicationError::protocol(format!(
                "query execution failed: {}",
                self.error_message()
            )));
        }

        Ok(PgQueryResult { result })
    }

    /// File descriptor of the connection's socket, for readiness waits
    pub fn socket(&self) -> ReplicationResult<c_int> {
        let fd = unsafe { PQsocket(self.conn) };
        if fd < 0 {
            return Err(ReplicationError::connection("connection has no socket"));
        }
        Ok(fd)
    }

    /// Consume whatever input the kernel has buffered for this connection
    pub fn consume_input(&self) -> ReplicationResult<()> {
        if unsafe { PQconsumeInput(self.conn) } == 0 {
            return Err(ReplicationError::connection(self.error_message()));
        }
        Ok(())
    }

    /// Non-blocking read of one CopyBoth frame.
    ///
    /// Calls `PQgetCopyData` in async mode: a complete frame is returned as
    /// an owned vector, `None` means no complete frame is buffered yet (wait
    /// for read-readiness, `consume_input`, retry). The stream ending is an
    /// error here — replication is expected to run until we stop it.
    pub fn copy_data_nonblocking(&self) -> ReplicationResult<Option<Vec<u8>>> {
        let mut buffer: *mut c_char = ptr::null_mut();
        let len = unsafe { PQgetCopyData(self.conn, &mut buffer, 1) };

        match len {
            -2 => Err(ReplicationError::protocol(self.error_message())),
            -1 => {
                // Copy ended; drain the final command result for the message.
                let _result = PgQueryResult {
                    result: unsafe { PQgetResult(self.conn) },
                };
                Err(ReplicationError::protocol(format!(
                    "replication stream ended: {}",
                    self.error_message()
                )))
            }
            0 => Ok(None),
            len => {
                if buffer.is_null() {
                    return Err(ReplicationError::protocol("received null copy buffer"));
                }
                let data = unsafe {
                    std::slice::from_raw_parts(buffer as *const u8, len as usize).to_vec()
                };
                unsafe { PQfreemem(buffer as *mut c_void) };
                Ok(Some(data))
            }
        }
    }

    /// Sends data into the CopyBoth stream
    pub fn put_copy_data(&self, data: &[u8]) -> ReplicationResult<()> {
        let result = unsafe {
            PQputCopyData(self.conn, data.as_ptr() as *const c_char, data.len() as i32)
        };

        if result != 1 {
            return Err(ReplicationError::protocol(format!(
                "failed to send copy data: {}",
                self.error_message()
            )));
        }

        Ok(())
    }

    /// Signal end-of-copy to the server (CopyDone)
    pub fn put_copy_end(&self) -> ReplicationResult<()> {
        let result = unsafe { PQputCopyEnd(self.conn, ptr::null()) };

        if result != 1 {
            return Err(ReplicationError::protocol(format!(
                "failed to end copy: {}",
                self.error_message()
            )));
        }

        Ok(())
    }

    /// Drain pending command results until the connection is idle again.
    ///
    /// After CopyDone the server finishes its side of the stream and sends a
    /// final command result; consuming it returns the connection to idle so
    /// `PQfinish` is an orderly goodbye rather than an aborted copy.
    pub fn drain_results(&self) {
        loop {
            let result = unsafe { PQgetResult(self.conn) };
            if result.is_null() {
                break;
            }
            drop(PgQueryResult { result });
        }
    }

    /// Flushes any buffered output to the server
    pub fn flush(&self) -> ReplicationResult<()> {
        if unsafe { PQflush(self.conn) } != 0 {
            return Err(ReplicationError::protocol("failed to flush connection"));
        }
        Ok(())
    }

    /// Last error message recorded on the connection
    pub fn error_message(&self) -> String {
        error_message_for(self.conn)
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        if !self.conn.is_null() {
            unsafe { PQfinish(self.conn) };
        }
    }
}

fn error_message_for(conn: *const PGconn) -> String {
    unsafe {
        let error_ptr = PQerrorMessage(conn);
        if error_ptr.is_null() {
            "unknown error".to_string()
        } else {
            CStr::from_ptr(error_ptr).to_string_lossy().trim().to_string()
        }
    }
}

/// Safe wrapper for a PostgreSQL command result
pub struct PgQueryResult {
    result: *mut PGresult,
}

impl PgQueryResult {
    /// Execution status of the command that produced this result
    pub fn status(&self) -> ExecStatusType {
        unsafe { PQresultStatus(self.result) }
    }

    /// True for `PGRES_TUPLES_OK` and `PGRES_COMMAND_OK`
    pub fn is_ok(&self) -> bool {
        matches!(
            self.status(),
            ExecStatusType::PGRES_TUPLES_OK | ExecStatusType::PGRES_COMMAND_OK
        )
    }

    /// Number of tuples (rows) in the result
    #[allow(unused)]
    pub fn ntuples(&self) -> i32 {
        unsafe { PQntuples(self.result) }
    }

    /// Value at (row, col), if present
    pub fn getvalue(&self, row: i32, col: i32) -> Option<String> {
        let value_ptr = unsafe { PQgetvalue(self.result, row, col) };
        if value_ptr.is_null() {
            None
        } else {
            unsafe { Some(CStr::from_ptr(value_ptr).to_string_lossy().into_owned()) }
        }
    }

    /// SQLSTATE of a failed command, e.g. `42710` for duplicate_object
    pub fn sqlstate(&self) -> Option<String> {
        let state_ptr = unsafe { PQresultErrorField(self.result, DIAG_SQLSTATE) };
        if state_ptr.is_null() {
            None
        } else {
            unsafe { Some(CStr::from_ptr(state_ptr).to_string_lossy().into_owned()) }
        }
    }
}

impl Drop for PgQueryResult {
    fn drop(&mut self) {
        if !self.result.is_null() {
            unsafe { PQclear(self.result) };
        }
    }
}
