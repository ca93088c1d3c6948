//! Replication stream frame parsing
//!
//! The COPY BOTH channel carries two message kinds from the server: WAL
//! data frames (`'w'`) and keepalives (`'k'`). Both headers use big-endian
//! integers and PostgreSQL-epoch timestamps. The transport below this
//! module guarantees whole frames, so parsing never sees a split header.

use crate::buffer::BufferReader;
use crate::error::{Result, StreamError};
use crate::xlog::XLogRecPtr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Size of the WAL data frame header: type(1) + startPos(8) + walEnd(8) +
/// sendTime(8)
pub const STREAMING_HEADER_SIZE: usize = 1 + 8 + 8 + 8;

/// Seconds from the Unix epoch (1970-01-01) to the PostgreSQL epoch
/// (2000-01-01)
pub const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800;

/// Convert a SystemTime to a PostgreSQL timestamp (microseconds since
/// 2000-01-01), as carried in standby status updates.
pub fn system_time_to_pg_timestamp(time: SystemTime) -> i64 {
    let since_unix = time
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);

    let unix_micros = since_unix.as_secs() as i64 * 1_000_000 + since_unix.subsec_micros() as i64;
    unix_micros - PG_EPOCH_OFFSET_SECS * 1_000_000
}

/// Convert a PostgreSQL timestamp into `chrono::DateTime<Utc>` for logging
pub fn pg_timestamp_to_chrono(ts: i64) -> Option<chrono::DateTime<chrono::Utc>> {
    use chrono::{TimeZone, Utc};

    let unix_micros = ts + PG_EPOCH_OFFSET_SECS * 1_000_000;
    let secs = unix_micros.div_euclid(1_000_000);
    let micros = unix_micros.rem_euclid(1_000_000) as u32;

    Utc.timestamp_opt(secs, micros * 1000).single()
}

/// One WAL data frame (`'w'`)
///
/// `start_pos` is the WAL position of the first byte of `body`; the body is
/// raw WAL, written to segment files verbatim.
#[derive(Debug, Clone)]
pub struct WalFrame {
    pub start_pos: XLogRecPtr,
    pub wal_end: XLogRecPtr,
    pub send_time: i64,
    pub body: Vec<u8>,
}

/// One keepalive frame (`'k'`)
#[derive(Debug, Clone, Copy)]
pub struct Keepalive {
    pub wal_end: XLogRecPtr,
    pub send_time: i64,
    pub reply_requested: bool,
}

/// A parsed message from the replication stream
#[derive(Debug)]
pub enum ReplicationFrame {
    WalData(WalFrame),
    Keepalive(Keepalive),
}

impl ReplicationFrame {
    /// Parse one COPY BOTH payload.
    ///
    /// # Errors
    ///
    /// Empty payloads, truncated headers, WAL frames without body bytes,
    /// and unknown type bytes are all protocol errors.
    pub fn parse(payload: Vec<u8>) -> Result<Self> {
        let Some(&frame_type) = payload.first() else {
            return Err(StreamError::protocol("empty replication frame"));
        };

        match frame_type {
            b'w' => {
                if payload.len() < STREAMING_HEADER_SIZE {
                    return Err(StreamError::protocol(format!(
                        "streaming header too small: {}",
                        payload.len()
                    )));
                }
                if payload.len() == STREAMING_HEADER_SIZE {
                    return Err(StreamError::protocol("WAL data frame carries no data"));
                }

                let mut reader = BufferReader::from_vec(payload);
                reader.skip(1)?;
                let start_pos = reader.read_u64()?;
                let wal_end = reader.read_u64()?;
                let send_time = reader.read_i64()?;
                let body = reader.read_rest();

                Ok(ReplicationFrame::WalData(WalFrame {
                    start_pos,
                    wal_end,
                    send_time,
                    body,
                }))
            }
            b'k' => {
                // type(1) + walEnd(8) + sendTime(8) + replyRequested(1)
                if payload.len() < 18 {
                    return Err(StreamError::protocol(format!(
                        "keepalive message too small: {}",
                        payload.len()
                    )));
                }

                let mut reader = BufferReader::from_vec(payload);
                reader.skip(1)?;
                let wal_end = reader.read_u64()?;
                let send_time = reader.read_i64()?;
                let reply_requested = reader.read_u8()? != 0;

                Ok(ReplicationFrame::Keepalive(Keepalive {
                    wal_end,
                    send_time,
                    reply_requested,
                }))
            }
            other => Err(StreamError::protocol(format!(
                "streaming header corrupt: \"{}\"",
                other as char
            ))),
        }
    }
}
