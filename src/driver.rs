//! Replication protocol driver
//!
//! Owns one replication-mode connection and provides framed message I/O over
//! the `CopyBoth` stream: `START_REPLICATION` setup, `XLogData` /
//! `PrimaryKeepalive` receive, and `StandbyStatusUpdate` feedback.
//!
//! The receive path never busy-waits: a non-blocking copy read is followed,
//! when empty, by a `poll(2)` on the connection's socket bounded by the
//! caller's timeout, one `PQconsumeInput`, and exactly one retry.
//!
//! Keepalives are returned to the caller instead of auto-replied. Replying
//! here would confirm an LSN before the sink has flushed it, which breaks
//! at-least-once; feedback belongs to the flush/commit worker, which reaches
//! the connection through a [`FeedbackSender`].

use crate::buffer::{BufferReader, BufferWriter};
use crate::errors::{ReplicationError, ReplicationResult};
use crate::lsn::Lsn;
use crate::pq::PgConnection;
use libpq_sys::ExecStatusType;
use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Seconds from the Unix epoch (1970) to the PostgreSQL epoch (2000)
const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800;

/// SQLSTATE for duplicate_object, raised when a publication or replication
/// slot already exists
const DUPLICATE_OBJECT: &str = "42710";

/// One framed message from the replication stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationMessage {
    /// Type `w`: a chunk of WAL carrying one pgoutput payload
    XLogData {
        wal_start: Lsn,
        server_wal_end: Lsn,
        server_time: i64,
        payload: Vec<u8>,
    },
    /// Type `k`: liveness probe; also advances the confirmed-position
    /// watermark
    PrimaryKeepalive {
        server_wal_end: Lsn,
        server_time: i64,
        reply_requested: bool,
    },
}

/// Driver for one logical replication session
///
/// `close` cancels the copy and drains the final command result, returning
/// the connection to idle; it runs at most once and `Drop` invokes it, so an
/// abandoned driver still tells the server the stream is over before the
/// connection itself is finished.
pub struct ReplicationDriver {
    conn: Arc<Mutex<PgConnection>>,
    socket: c_int,
    closed: AtomicBool,
}

impl ReplicationDriver {
    /// Open a connection in `replication=database` mode
    pub fn connect(conn_str: &str) -> ReplicationResult<Self> {
        let conninfo = if conn_str.contains("replication=") {
            conn_str.to_string()
        } else {
            format!("{conn_str} replication=database")
        };
        let conn = PgConnection::connect(&conninfo)?;
        let socket = conn.socket()?;
        info!("connected to PostgreSQL in replication mode");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            socket,
            closed: AtomicBool::new(false),
        })
    }

    fn conn(&self) -> ReplicationResult<MutexGuard<'_, PgConnection>> {
        lock_conn(&self.conn)
    }

    /// Verify the server is configured for logical replication
    pub fn check_wal_level(&self) -> ReplicationResult<()> {
        let result = self.conn()?.exec("SHOW wal_level;")?;
        if !result.is_ok() {
            return Err(ReplicationError::protocol(format!(
                "failed to check wal_level: {:?}",
                result.status()
            )));
        }
        match result.getvalue(0, 0) {
            Some(level) if level == "logical" => {
                debug!("wal_level is 'logical'");
                Ok(())
            }
            Some(level) => Err(ReplicationError::config(format!(
                "wal_level is '{level}'; logical replication requires wal_level = 'logical'"
            ))),
            None => Err(ReplicationError::protocol("could not read wal_level")),
        }
    }

    /// Run `IDENTIFY_SYSTEM` to verify the connection speaks the replication
    /// protocol; returns the server's current WAL position.
    pub fn identify_system(&self) -> ReplicationResult<Lsn> {
        let result = self.conn()?.exec("IDENTIFY_SYSTEM")?;
        if !result.is_ok() {
            return Err(ReplicationError::protocol(format!(
                "IDENTIFY_SYSTEM failed: {:?}",
                result.status()
            )));
        }

        let xlogpos: Lsn = result
            .getvalue(0, 2)
            .ok_or_else(|| ReplicationError::protocol("IDENTIFY_SYSTEM returned no xlogpos"))?
            .parse()?;
        info!(
            system_id = %result.getvalue(0, 0).unwrap_or_default(),
            timeline = %result.getvalue(0, 1).unwrap_or_default(),
            xlogpos = %xlogpos,
            "system identification successful"
        );
        Ok(xlogpos)
    }

    /// Idempotent `CREATE PUBLICATION … FOR TABLE …`
    pub fn ensure_publication(&self, name: &str, tables: &[String]) -> ReplicationResult<()> {
        let table_list = tables
            .iter()
            .map(|table| quote_qualified(table))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("CREATE PUBLICATION \"{name}\" FOR TABLE {table_list};");
        self.exec_idempotent(&sql, "publication", name)
    }

    /// Idempotent `CREATE_REPLICATION_SLOT … LOGICAL pgoutput`
    pub fn ensure_slot(&self, name: &str) -> ReplicationResult<()> {
        let sql = format!("CREATE_REPLICATION_SLOT \"{name}\" LOGICAL pgoutput");
        self.exec_idempotent(&sql, "replication slot", name)
    }

    fn exec_idempotent(&self, sql: &str, kind: &str, name: &str) -> ReplicationResult<()> {
        let conn = self.conn()?;
        let result = conn.exec(sql)?;
        if result.is_ok() {
            info!("created {kind} '{name}'");
            return Ok(());
        }
        if result.sqlstate().as_deref() == Some(DUPLICATE_OBJECT) {
            debug!("{kind} '{name}' already exists");
            return Ok(());
        }
        Err(ReplicationError::protocol(format!(
            "failed to create {kind} '{name}': {}",
            conn.error_message()
        )))
    }

    /// Start streaming; on success the connection is in `CopyBoth` mode.
    pub fn start_replication(
        &self,
        slot: &str,
        publication: &str,
        start_lsn: Lsn,
    ) -> ReplicationResult<()> {
        let sql = format!(
            "START_REPLICATION SLOT \"{slot}\" LOGICAL {start_lsn} \
             (proto_version '2', publication_names '{publication}', streaming 'off')"
        );
        info!(%start_lsn, slot, publication, "starting replication");

        let conn = self.conn()?;
        let result = conn.exec(&sql)?;
        if result.status() != ExecStatusType::PGRES_COPY_BOTH {
            return Err(ReplicationError::protocol(format!(
                "failed to start replication: {}",
                conn.error_message()
            )));
        }
        Ok(())
    }

    /// Receive one framed message, waiting at most `timeout_ms` for the
    /// socket to become readable. `None` means the timeout elapsed with no
    /// complete frame.
    pub fn receive_message(&self, timeout_ms: u64) -> ReplicationResult<Option<ReplicationMessage>> {
        if let Some(frame) = self.conn()?.copy_data_nonblocking()? {
            return parse_frame(&frame).map(Some);
        }

        if !wait_readable(self.socket, timeout_ms)? {
            return Ok(None);
        }

        let conn = self.conn()?;
        conn.consume_input()?;
        match conn.copy_data_nonblocking()? {
            Some(frame) => parse_frame(&frame).map(Some),
            None => Ok(None),
        }
    }

    /// Write a standby status update with write = flush = apply = `lsn` and
    /// flush the socket.
    pub fn send_status_update(&self, lsn: Lsn, reply_requested: bool) -> ReplicationResult<()> {
        send_status_update(&self.conn, lsn, reply_requested)
    }

    /// Handle through which the flush/commit worker sends feedback while the
    /// receive thread owns the driver.
    pub fn feedback_sender(&self) -> FeedbackSender {
        FeedbackSender {
            conn: Arc::clone(&self.conn),
        }
    }

    /// Cancel the copy and return the connection to idle: send CopyDone,
    /// flush it out, and drain the final command result. Runs at most once;
    /// subsequent calls are no-ops.
    pub fn close(&self) -> ReplicationResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let conn = self.conn()?;
        conn.put_copy_end()?;
        conn.flush()?;
        conn.drain_results();
        debug!("replication stream closed");
        Ok(())
    }
}

impl Drop for ReplicationDriver {
    fn drop(&mut self) {
        // Best effort: a connection that already died mid-stream has nothing
        // left to cancel.
        if let Err(err) = self.close() {
            debug!("error closing replication stream: {err}");
        }
    }
}

/// Cloneable feedback path into the replication connection
///
/// Shares the driver's connection mutex; each send holds the lock for a
/// single `PQputCopyData` + `PQflush` pair, so the receive thread's socket
/// waits (which happen outside the lock) are never blocked by feedback.
#[derive(Clone)]
pub struct FeedbackSender {
    conn: Arc<Mutex<PgConnection>>,
}

impl FeedbackSender {
    pub fn send(&self, lsn: Lsn) -> ReplicationResult<()> {
        send_status_update(&self.conn, lsn, false)
    }
}

fn lock_conn(conn: &Arc<Mutex<PgConnection>>) -> ReplicationResult<MutexGuard<'_, PgConnection>> {
    conn.lock()
        .map_err(|_| ReplicationError::connection("replication connection mutex poisoned"))
}

fn send_status_update(
    conn: &Arc<Mutex<PgConnection>>,
    lsn: Lsn,
    reply_requested: bool,
) -> ReplicationResult<()> {
    // 'r' + 3 × u64 LSN + i64 client time + reply flag
    let mut frame = [0u8; 34];
    let mut writer = BufferWriter::new(&mut frame);
    writer.write_u8(b'r')?;
    writer.write_u64(lsn.into())?; // written
    writer.write_u64(lsn.into())?; // flushed
    writer.write_u64(lsn.into())?; // applied
    writer.write_i64(postgres_timestamp_now())?;
    writer.write_u8(reply_requested as u8)?;
    debug_assert_eq!(writer.bytes_written(), frame.len());

    let guard = lock_conn(conn)?;
    guard.put_copy_data(&frame)?;
    guard.flush()?;
    debug!(%lsn, "sent standby status update");
    Ok(())
}

/// Block until the socket is readable or the timeout elapses; EINTR is
/// treated as an early timeout so the caller re-observes its deadline.
fn wait_readable(fd: c_int, timeout_ms: u64) -> ReplicationResult<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout = timeout_ms.min(c_int::MAX as u64) as c_int;
    let rc = unsafe { libc::poll(&mut pfd, 1, timeout) };
    match rc {
        -1 => {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                Ok(false)
            } else {
                Err(err.into())
            }
        }
        0 => Ok(false),
        _ => Ok(true),
    }
}

fn parse_frame(frame: &[u8]) -> ReplicationResult<ReplicationMessage> {
    let mut reader = BufferReader::new(frame);
    match reader.read_u8()? {
        b'w' => {
            let wal_start = Lsn(reader.read_u64()?);
            let server_wal_end = Lsn(reader.read_u64()?);
            let server_time = reader.read_i64()?;
            let payload = reader.read_bytes(reader.remaining())?;
            Ok(ReplicationMessage::XLogData {
                wal_start,
                server_wal_end,
                server_time,
                payload,
            })
        }
        b'k' => {
            let server_wal_end = Lsn(reader.read_u64()?);
            let server_time = reader.read_i64()?;
            let reply_requested = reader.read_u8()? != 0;
            Ok(ReplicationMessage::PrimaryKeepalive {
                server_wal_end,
                server_time,
                reply_requested,
            })
        }
        other => Err(ReplicationError::protocol(format!(
            "unknown copy stream message type '{}'",
            other as char
        ))),
    }
}

/// Quote a possibly schema-qualified relation name part by part, so
/// `public.users` becomes `"public"."users"`
fn quote_qualified(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{part}\""))
        .collect::<Vec<_>>()
        .join(".")
}

/// Current wall clock as a PostgreSQL timestamp (µs since 2000-01-01)
fn postgres_timestamp_now() -> i64 {
    let since_unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let unix_micros = since_unix.as_secs() as i64 * 1_000_000 + since_unix.subsec_micros() as i64;
    unix_micros - PG_EPOCH_OFFSET_SECS * 1_000_000
}
