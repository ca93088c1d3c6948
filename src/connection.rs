//! Low-level PostgreSQL replication connection using libpq-sys
//!
//! Safe wrappers around libpq for the physical replication protocol: the
//! `IDENTIFY_SYSTEM`, `BASE_BACKUP`, and `START_REPLICATION` commands plus
//! COPY OUT / COPY BOTH payload transport.
//!
//! # Async I/O architecture
//!
//! COPY payloads are read through tokio's `AsyncFd` wrapper around libpq's
//! socket descriptor. When no complete message is buffered the task is
//! suspended instead of blocking a thread; once the socket becomes readable
//! `PQconsumeInput` transfers data into libpq's buffer and every complete
//! message is drained before the ready flag is cleared, so edge-triggered
//! wakeups are never lost. The drain also gives the transport its
//! whole-frame guarantee: `PQgetCopyData` hands back either one complete
//! COPY payload or nothing.
//!
//! File I/O never happens here; engines receive whole frames and do their
//! own synchronous writes.

use crate::buffer::BufferWriter;
use crate::error::{Result, StreamError};
use crate::xlog::{format_lsn, parse_lsn, TimelineId, XLogRecPtr};
use libpq_sys::*;
use std::ffi::{CStr, CString};
use std::os::raw::c_void;
use std::os::unix::io::RawFd;
use std::{ptr, slice};
use tokio::io::unix::AsyncFd;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Escape single quotes in a value destined for a replication command
/// string literal (' becomes '').
#[inline]
fn sanitize_sql_string_value(value: &str) -> String {
    value.replace('\'', "''")
}

/// Escape a value and wrap it in single quotes for SQL
#[inline]
pub(crate) fn quote_sql_string_value(value: &str) -> String {
    format!("'{}'", sanitize_sql_string_value(value))
}

/// First server version whose walsender accepts a TIMELINE clause on
/// physical START_REPLICATION.
const TIMELINE_CLAUSE_MIN_VERSION: i32 = 90300;

/// One whole COPY payload, or the end of the stream.
///
/// The transport never yields partial frames: a `Frame` holds exactly the
/// payload of one CopyData message.
#[derive(Debug)]
pub enum CopyData {
    /// Payload of one CopyData message
    Frame(Vec<u8>),
    /// Server ended the COPY stream; the command status is still pending
    Done,
}

/// Result of attempting to read from libpq's internal buffer
#[derive(Debug)]
enum ReadResult {
    Data(Vec<u8>),
    WouldBlock,
    CopyDone,
}

/// Which COPY subprotocol the connection is currently inside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CopyMode {
    /// Server-to-client only (base backup)
    Out,
    /// Bidirectional (WAL streaming)
    Both,
}

/// Result row of `IDENTIFY_SYSTEM`
#[derive(Debug, Clone)]
pub struct SystemIdentity {
    /// Unique cluster identifier
    pub system_id: String,
    /// Timeline the server is currently writing
    pub timeline: TimelineId,
    /// Current WAL insert position
    pub xlog_pos: XLogRecPtr,
}

/// Options for the `BASE_BACKUP` replication command.
///
/// Boolean flags become space-separated tokens; the label is single-quoted
/// with embedded quotes escaped.
#[derive(Debug, Clone)]
pub struct BaseBackupCommand {
    /// Backup label recorded in the backup history
    pub label: String,
    /// Ask the server to report per-tablespace sizes up front
    pub progress: bool,
    /// Request an immediate (fast) checkpoint instead of a spread one
    pub fast_checkpoint: bool,
    /// Do not wait for WAL archiving to complete
    pub nowait: bool,
    /// Include the WAL segments needed for recovery in the backup
    pub include_wal: bool,
}

impl BaseBackupCommand {
    fn to_query(&self) -> String {
        let mut query = format!("BASE_BACKUP LABEL {}", quote_sql_string_value(&self.label));
        if self.progress {
            query.push_str(" PROGRESS");
        }
        if self.fast_checkpoint {
            query.push_str(" FAST");
        }
        if self.nowait {
            query.push_str(" NOWAIT");
        }
        if self.include_wal {
            query.push_str(" WAL");
        }
        query
    }
}

/// Safe wrapper around a PostgreSQL replication-mode connection
///
/// Owns the underlying `PGconn` and tears it down on drop, ending any COPY
/// BOTH stream gracefully first.
///
/// # Example
///
/// ```no_run
/// use pg_streamrecv::PgReplicationConnection;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let mut conn = PgReplicationConnection::connect(
///     "host=localhost port=5432 user=postgres dbname=replication replication=true",
/// )?;
/// let identity = conn.identify_system()?;
/// println!("timeline {}", identity.timeline);
/// # Ok(())
/// # }
/// ```
pub struct PgReplicationConnection {
    conn: *mut PGconn,
    copy_mode: Option<CopyMode>,
    async_fd: Option<AsyncFd<RawFd>>,
}

impl PgReplicationConnection {
    /// Establish a replication-mode connection.
    ///
    /// The connection string must carry `replication=true` (physical
    /// replication); libpq fills in anything missing from the standard
    /// `PGHOST`/`PGPORT`/`PGUSER`/`PGPASSWORD` environment variables.
    ///
    /// # Errors
    ///
    /// Rejected credentials surface as `StreamError::Authentication`
    /// (see [`StreamError::is_auth_failure`]); every other failure to
    /// establish the connection is `StreamError::Connection`.
    pub fn connect(conninfo: &str) -> Result<Self> {
        unsafe {
            let library_version = PQlibVersion();
            debug!("Using libpq version: {}", library_version);
        }

        let c_conninfo = CString::new(conninfo)
            .map_err(|e| StreamError::connection(format!("Invalid connection string: {e}")))?;

        let conn = unsafe { PQconnectdb(c_conninfo.as_ptr()) };

        if conn.is_null() {
            return Err(StreamError::connection(
                "Failed to allocate PostgreSQL connection object".to_string(),
            ));
        }

        let status = unsafe { PQstatus(conn) };
        if status != ConnStatusType::CONNECTION_OK {
            let error_msg = last_error_message_raw(conn);
            unsafe { PQfinish(conn) };

            let lower = error_msg.to_lowercase();
            if lower.contains("authentication failed")
                || lower.contains("password authentication failed")
                || lower.contains("role does not exist")
            {
                return Err(StreamError::authentication(error_msg));
            }
            return Err(StreamError::connection(format!(
                "could not connect to server: {error_msg}"
            )));
        }

        debug!(
            "Connected to PostgreSQL server version: {}",
            unsafe { PQserverVersion(conn) }
        );

        Ok(Self {
            conn,
            copy_mode: None,
            async_fd: None,
        })
    }

    /// Execute a replication command and collect its single result
    pub fn exec(&self, query: &str) -> Result<PgResult> {
        let c_query = CString::new(query)
            .map_err(|e| StreamError::protocol(format!("Invalid query string: {e}")))?;

        let result = unsafe { PQexec(self.conn, c_query.as_ptr()) };

        if result.is_null() {
            return Err(StreamError::server(
                "Query execution failed - null result".to_string(),
            ));
        }

        let pg_result = PgResult::new(result);
        let status = pg_result.status();
        debug!("query: {} status: {:?}", query, status);
        if !matches!(
            status,
            ExecStatusType::PGRES_TUPLES_OK
                | ExecStatusType::PGRES_COMMAND_OK
                | ExecStatusType::PGRES_COPY_BOTH
                | ExecStatusType::PGRES_COPY_OUT
        ) {
            let error_msg = pg_result
                .error_message()
                .unwrap_or_else(|| "Unknown error".to_string());
            return Err(StreamError::server(format!("{query} failed: {error_msg}")));
        }

        Ok(pg_result)
    }

    /// Dispatch a command without collecting results.
    ///
    /// Used for `BASE_BACKUP`, which produces a result row-set followed by
    /// one COPY stream per tablespace; results are pulled one at a time via
    /// [`Self::get_result`].
    fn send_query(&self, query: &str) -> Result<()> {
        let c_query = CString::new(query)
            .map_err(|e| StreamError::protocol(format!("Invalid query string: {e}")))?;

        let sent = unsafe { PQsendQuery(self.conn, c_query.as_ptr()) };
        if sent != 1 {
            return Err(StreamError::server(format!(
                "could not send command: {}",
                self.last_error_message()
            )));
        }
        Ok(())
    }

    /// Pull the next pending result, if any
    pub(crate) fn get_result(&self) -> Option<PgResult> {
        let result = unsafe { PQgetResult(self.conn) };
        if result.is_null() {
            None
        } else {
            Some(PgResult::new(result))
        }
    }

    /// Run `IDENTIFY_SYSTEM` and parse the single expected row.
    ///
    /// # Errors
    ///
    /// A row count other than one, a non-positive timeline, or an
    /// unparseable WAL position are protocol errors.
    pub fn identify_system(&self) -> Result<SystemIdentity> {
        let result = self.exec("IDENTIFY_SYSTEM")?;

        if result.ntuples() != 1 {
            return Err(StreamError::protocol(format!(
                "could not identify system, got {} rows",
                result.ntuples()
            )));
        }

        let system_id = result
            .get_value(0, 0)
            .ok_or_else(|| StreamError::protocol("IDENTIFY_SYSTEM returned no system id"))?;
        let timeline: TimelineId = result
            .get_value(0, 1)
            .and_then(|v| v.parse().ok())
            .filter(|&tli| tli > 0)
            .ok_or_else(|| StreamError::protocol("IDENTIFY_SYSTEM returned bad timeline"))?;
        let xlog_pos = parse_lsn(
            &result
                .get_value(0, 2)
                .ok_or_else(|| StreamError::protocol("IDENTIFY_SYSTEM returned no position"))?,
        )?;

        debug!(
            "System identification: systemid={}, timeline={}, xlogpos={}",
            system_id,
            timeline,
            format_lsn(xlog_pos)
        );

        Ok(SystemIdentity {
            system_id,
            timeline,
            xlog_pos,
        })
    }

    /// Start physical replication at the given (segment-aligned) position.
    ///
    /// The TIMELINE clause is appended only when the server is new enough
    /// to accept it. Leaves the connection in COPY BOTH mode.
    pub fn start_replication(
        &mut self,
        start: XLogRecPtr,
        timeline: TimelineId,
    ) -> Result<()> {
        let mut query = format!("START_REPLICATION PHYSICAL {}", format_lsn(start));
        if self.server_version() >= TIMELINE_CLAUSE_MIN_VERSION {
            query.push_str(&format!(" TIMELINE {timeline}"));
        }

        debug!("Starting replication: {}", query);
        let result = self.exec(&query)?;
        if result.status() != ExecStatusType::PGRES_COPY_BOTH {
            return Err(StreamError::server(format!(
                "could not start replication: unexpected status {:?}",
                result.status()
            )));
        }

        self.copy_mode = Some(CopyMode::Both);
        self.initialize_async_socket()?;
        Ok(())
    }

    /// Issue `BASE_BACKUP` and return the tablespace header row-set.
    ///
    /// After this call the per-tablespace COPY streams are entered one at a
    /// time with [`Self::begin_copy_out`].
    pub fn send_base_backup(&mut self, command: &BaseBackupCommand) -> Result<PgResult> {
        let query = command.to_query();
        debug!("Starting base backup: {}", query);
        self.send_query(&query)?;

        let result = self
            .get_result()
            .ok_or_else(|| StreamError::server("no data returned from server"))?;
        if result.status() != ExecStatusType::PGRES_TUPLES_OK {
            let error_msg = result
                .error_message()
                .unwrap_or_else(|| "Unknown error".to_string());
            return Err(StreamError::server(format!(
                "could not initiate base backup: {error_msg}"
            )));
        }
        if result.ntuples() < 1 {
            return Err(StreamError::server("no tablespaces reported by server"));
        }

        Ok(result)
    }

    /// Enter the next COPY OUT stream of a multi-stream command.
    ///
    /// # Errors
    ///
    /// Any status other than `PGRES_COPY_OUT` is a server error (the caller
    /// knows how many streams to expect from the header row-set).
    pub fn begin_copy_out(&mut self) -> Result<()> {
        let result = self
            .get_result()
            .ok_or_else(|| StreamError::server("could not get COPY data stream: no result"))?;
        if result.status() != ExecStatusType::PGRES_COPY_OUT {
            let error_msg = result
                .error_message()
                .unwrap_or_else(|| "Unknown error".to_string());
            return Err(StreamError::server(format!(
                "could not get COPY data stream: {error_msg}"
            )));
        }

        self.copy_mode = Some(CopyMode::Out);
        if self.async_fd.is_none() {
            self.initialize_async_socket()?;
        }
        Ok(())
    }

    /// Verify the terminating command status after the last COPY stream.
    ///
    /// Drains every pending result and requires each to be `COMMAND_OK` or
    /// `TUPLES_OK`.
    pub fn finish_copy(&mut self) -> Result<()> {
        self.copy_mode = None;
        while let Some(result) = self.get_result() {
            match result.status() {
                ExecStatusType::PGRES_COMMAND_OK | ExecStatusType::PGRES_TUPLES_OK => {}
                _ => {
                    let error_msg = result
                        .error_message()
                        .unwrap_or_else(|| "Unknown error".to_string());
                    return Err(StreamError::server(format!(
                        "unexpected termination of replication stream: {error_msg}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Register the connection socket with the tokio reactor
    fn initialize_async_socket(&mut self) -> Result<()> {
        let sock: RawFd = unsafe { PQsocket(self.conn) };
        if sock < 0 {
            return Err(StreamError::connection(
                "Invalid PostgreSQL socket".to_string(),
            ));
        }

        let async_fd = AsyncFd::new(sock)
            .map_err(|e| StreamError::connection(format!("Failed to create AsyncFd: {e}")))?;

        self.async_fd = Some(async_fd);
        Ok(())
    }

    /// Receive the next whole COPY payload, yielding the task while no data
    /// is available.
    ///
    /// # Returns
    /// * `Ok(CopyData::Frame(bytes))` - one complete payload
    /// * `Ok(CopyData::Done)` - the server ended the stream; call
    ///   [`Self::finish_copy`] to check the command status
    /// * `Err(StreamError::Cancelled(_))` - the token fired between frames
    pub async fn get_copy_data_async(
        &mut self,
        cancellation_token: &CancellationToken,
    ) -> Result<CopyData> {
        self.ensure_copy_mode()?;

        let async_fd = self
            .async_fd
            .as_ref()
            .ok_or_else(|| StreamError::connection("AsyncFd not initialized".to_string()))?;

        loop {
            // Drain anything already buffered before touching the socket
            match self.try_read_buffered_data()? {
                ReadResult::Data(data) => return Ok(CopyData::Frame(data)),
                ReadResult::CopyDone => return Ok(CopyData::Done),
                ReadResult::WouldBlock => {}
            }

            tokio::select! {
                biased;

                _ = cancellation_token.cancelled() => {
                    // One last look at the buffer so a frame that raced the
                    // cancellation is not dropped
                    match self.try_read_buffered_data()? {
                        ReadResult::Data(data) => return Ok(CopyData::Frame(data)),
                        ReadResult::CopyDone => return Ok(CopyData::Done),
                        ReadResult::WouldBlock => {}
                    }
                    return Err(StreamError::cancelled("stopped between frames"));
                }

                guard_result = async_fd.readable() => {
                    let mut guard = guard_result.map_err(|e| {
                        StreamError::connection(format!(
                            "Failed to wait for socket readability: {e}"
                        ))
                    })?;

                    let consumed = unsafe { PQconsumeInput(self.conn) };
                    if consumed == 0 {
                        return Err(StreamError::connection(format!(
                            "could not read COPY data: {}",
                            self.last_error_message()
                        )));
                    }

                    match self.try_read_buffered_data()? {
                        ReadResult::Data(data) => return Ok(CopyData::Frame(data)),
                        ReadResult::CopyDone => return Ok(CopyData::Done),
                        ReadResult::WouldBlock => {
                            // No complete message yet; re-arm epoll
                            guard.clear_ready();
                        }
                    }
                }
            }
        }
    }

    /// Non-blocking read of one message from libpq's internal buffer.
    ///
    /// The buffer returned by `PQgetCopyData` is copied out and released on
    /// every path, including errors.
    #[inline]
    fn try_read_buffered_data(&self) -> Result<ReadResult> {
        let mut buffer: *mut std::os::raw::c_char = ptr::null_mut();
        let result = unsafe { PQgetCopyData(self.conn, &mut buffer, 1) };

        match result {
            len if len > 0 => {
                if buffer.is_null() {
                    return Err(StreamError::protocol(
                        "Received null buffer from PQgetCopyData".to_string(),
                    ));
                }

                let data =
                    unsafe { slice::from_raw_parts(buffer as *const u8, len as usize).to_vec() };
                unsafe { PQfreemem(buffer as *mut c_void) };
                Ok(ReadResult::Data(data))
            }
            0 | -2 => Ok(ReadResult::WouldBlock),
            -1 => {
                debug!("COPY stream finished");
                Ok(ReadResult::CopyDone)
            }
            other => Err(StreamError::protocol(format!(
                "Unexpected PQgetCopyData result: {other}"
            ))),
        }
    }

    /// Get the last error message from the connection
    fn last_error_message(&self) -> String {
        last_error_message_raw(self.conn)
    }

    #[inline]
    fn ensure_copy_mode(&self) -> Result<()> {
        if self.copy_mode.is_none() {
            return Err(StreamError::protocol(
                "Connection is not inside a COPY stream".to_string(),
            ));
        }
        Ok(())
    }

    /// Send one message on the COPY BOTH channel and flush it.
    ///
    /// Used for standby status updates (keepalive replies).
    pub fn put_copy_data(&self, data: &[u8]) -> Result<()> {
        if self.copy_mode != Some(CopyMode::Both) {
            return Err(StreamError::protocol(
                "Connection is not in COPY BOTH mode".to_string(),
            ));
        }

        let result = unsafe {
            PQputCopyData(
                self.conn,
                data.as_ptr() as *const std::os::raw::c_char,
                data.len() as i32,
            )
        };
        if result != 1 {
            return Err(StreamError::connection(format!(
                "Failed to send data via COPY protocol: {}",
                self.last_error_message()
            )));
        }

        let flush_result = unsafe { PQflush(self.conn) };
        if flush_result != 0 {
            return Err(StreamError::connection(format!(
                "Failed to flush connection: {}",
                self.last_error_message()
            )));
        }

        Ok(())
    }

    /// Send a standby status update (`'r'` message) over the stream
    pub fn send_standby_status_update(
        &self,
        received: XLogRecPtr,
        flushed: XLogRecPtr,
        applied: XLogRecPtr,
        timestamp: i64,
        reply_requested: bool,
    ) -> Result<()> {
        let mut buffer = BufferWriter::with_capacity(34); // 1 + 8 + 8 + 8 + 8 + 1
        buffer.write_u8(b'r');
        buffer.write_u64(received);
        buffer.write_u64(flushed);
        buffer.write_u64(applied);
        buffer.write_i64(timestamp);
        buffer.write_u8(u8::from(reply_requested));

        self.put_copy_data(&buffer.freeze())?;

        debug!(
            "Sent standby status update: received={}, flushed={}, applied={}",
            format_lsn(received),
            format_lsn(flushed),
            format_lsn(applied)
        );
        Ok(())
    }

    /// Check if the connection is still alive
    pub fn is_alive(&self) -> bool {
        if self.conn.is_null() {
            return false;
        }
        unsafe { PQstatus(self.conn) == ConnStatusType::CONNECTION_OK }
    }

    /// Server version as reported by libpq (e.g. 90300)
    pub fn server_version(&self) -> i32 {
        unsafe { PQserverVersion(self.conn) }
    }

    fn close(&mut self) {
        if self.conn.is_null() {
            return;
        }

        if self.copy_mode == Some(CopyMode::Both) {
            debug!("Ending COPY mode before closing connection");
            unsafe {
                let result = PQputCopyEnd(self.conn, ptr::null());
                if result != 1 {
                    warn!(
                        "Failed to end COPY mode gracefully: {}",
                        self.last_error_message()
                    );
                }
            }
            self.copy_mode = None;
        }

        unsafe {
            PQfinish(self.conn);
        }
        self.conn = std::ptr::null_mut();
        self.async_fd = None;
        debug!("PostgreSQL replication connection closed");
    }
}

fn last_error_message_raw(conn: *mut PGconn) -> String {
    unsafe {
        let error_ptr = PQerrorMessage(conn);
        if error_ptr.is_null() {
            "Unknown error".to_string()
        } else {
            CStr::from_ptr(error_ptr).to_string_lossy().into_owned()
        }
    }
}

impl Drop for PgReplicationConnection {
    fn drop(&mut self) {
        self.close();
    }
}

// Exclusive access makes the raw pointer safe to move between threads
unsafe impl Send for PgReplicationConnection {}

/// Safe wrapper for a PostgreSQL result
pub struct PgResult {
    result: *mut PGresult,
}

impl PgResult {
    fn new(result: *mut PGresult) -> Self {
        Self { result }
    }

    /// Get the execution status
    pub fn status(&self) -> ExecStatusType {
        unsafe { PQresultStatus(self.result) }
    }

    /// Get number of tuples (rows)
    pub fn ntuples(&self) -> i32 {
        unsafe { PQntuples(self.result) }
    }

    /// Get number of fields (columns)
    pub fn nfields(&self) -> i32 {
        unsafe { PQnfields(self.result) }
    }

    /// True when the field holds SQL NULL
    pub fn is_null(&self, row: i32, col: i32) -> bool {
        if row >= self.ntuples() || col >= self.nfields() {
            return true;
        }
        unsafe { PQgetisnull(self.result, row, col) == 1 }
    }

    /// Get a field value as string
    pub fn get_value(&self, row: i32, col: i32) -> Option<String> {
        if row >= self.ntuples() || col >= self.nfields() || self.is_null(row, col) {
            return None;
        }

        let value_ptr = unsafe { PQgetvalue(self.result, row, col) };
        if value_ptr.is_null() {
            None
        } else {
            unsafe { Some(CStr::from_ptr(value_ptr).to_string_lossy().into_owned()) }
        }
    }

    /// Get error message if any
    pub fn error_message(&self) -> Option<String> {
        let error_ptr = unsafe { PQresultErrorMessage(self.result) };
        if error_ptr.is_null() {
            None
        } else {
            let msg = unsafe { CStr::from_ptr(error_ptr).to_string_lossy().into_owned() };
            if msg.is_empty() {
                None
            } else {
                Some(msg)
            }
        }
    }
}

impl Drop for PgResult {
    fn drop(&mut self) {
        if !self.result.is_null() {
            unsafe {
                PQclear(self.result);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_sql_string_value() {
        assert_eq!(sanitize_sql_string_value("nightly"), "nightly");
        assert_eq!(sanitize_sql_string_value("it's"), "it''s");
        assert_eq!(sanitize_sql_string_value("''"), "''''");
        assert_eq!(sanitize_sql_string_value(""), "");
    }

    #[test]
    fn test_quote_sql_string_value() {
        assert_eq!(quote_sql_string_value("nightly"), "'nightly'");
        assert_eq!(quote_sql_string_value("it's"), "'it''s'");
        assert_eq!(
            quote_sql_string_value("'; DROP TABLE users; --"),
            "'''; DROP TABLE users; --'"
        );
    }

    #[test]
    fn test_base_backup_command_minimal() {
        let cmd = BaseBackupCommand {
            label: "nightly".to_string(),
            progress: false,
            fast_checkpoint: false,
            nowait: false,
            include_wal: false,
        };
        assert_eq!(cmd.to_query(), "BASE_BACKUP LABEL 'nightly'");
    }

    #[test]
    fn test_base_backup_command_all_flags() {
        let cmd = BaseBackupCommand {
            label: "weekly".to_string(),
            progress: true,
            fast_checkpoint: true,
            nowait: true,
            include_wal: true,
        };
        assert_eq!(
            cmd.to_query(),
            "BASE_BACKUP LABEL 'weekly' PROGRESS FAST NOWAIT WAL"
        );
    }

    #[test]
    fn test_base_backup_command_label_escaping() {
        let cmd = BaseBackupCommand {
            label: "ops' snapshot".to_string(),
            progress: true,
            fast_checkpoint: false,
            nowait: false,
            include_wal: false,
        };
        assert_eq!(
            cmd.to_query(),
            "BASE_BACKUP LABEL 'ops'' snapshot' PROGRESS"
        );
    }
}
