//! WAL streaming engine
//!
//! Receives the physical replication stream and materializes it as segment
//! files: discovers where to resume from the local directory, starts
//! replication at a segment boundary, routes frame payloads into the
//! current [`SegmentWriter`] (spanning segment boundaries inside one frame
//! when necessary), and invokes a caller-supplied [`SegmentHook`] after
//! every completed segment becomes durable.
//!
//! The engine is one task; frames are awaited, file writes and fsyncs run
//! synchronously in between. Every error is terminal for the session, and
//! whatever is on disk is picked up by the next run's discovery scan.

use crate::connection::{CopyData, PgReplicationConnection};
use crate::error::{Result, StreamError};
use crate::segment::{SegmentWriter, PARTIAL_SUFFIX};
use crate::wire::{system_time_to_pg_timestamp, ReplicationFrame, WalFrame};
use crate::xlog::{
    align_to_segment, format_lsn, SegmentName, TimelineId, XLogRecPtr, INVALID_XLOG_REC_PTR,
    WAL_SEG_SIZE,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What the engine should do after a segment completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    Continue,
    /// Terminate streaming cleanly; the engine returns the position of the
    /// boundary just reached
    Stop,
}

/// Caller-supplied policy invoked once per completed segment, strictly
/// after the segment is fsync'd, closed, and (in rename-partial mode)
/// renamed into place.
pub trait SegmentHook {
    fn segment_finished(&mut self, end_pos: XLogRecPtr, timeline: TimelineId)
        -> Result<HookAction>;
}

/// Hook that does nothing and never stops the stream
pub struct NoopHook;

impl SegmentHook for NoopHook {
    fn segment_finished(&mut self, _end_pos: XLogRecPtr, _timeline: TimelineId) -> Result<HookAction> {
        Ok(HookAction::Continue)
    }
}

/// Hook that removes the stale `.partial` file of the segment preceding
/// the one that just finished.
///
/// A finished segment means every byte before its end position has been
/// received again, so a `.partial` left behind by an earlier run carries
/// nothing the completed files do not. Removing a file that is not there
/// is a no-op, and completed segments are never touched.
pub struct PartialCleanupHook {
    basedir: PathBuf,
}

impl PartialCleanupHook {
    pub fn new(basedir: PathBuf) -> Self {
        Self { basedir }
    }
}

impl SegmentHook for PartialCleanupHook {
    fn segment_finished(&mut self, end_pos: XLogRecPtr, timeline: TimelineId) -> Result<HookAction> {
        let finished = SegmentName::from_position(timeline, end_pos - WAL_SEG_SIZE);
        if let Some(prev) = finished.prev() {
            let stale = self.basedir.join(format!("{prev}{PARTIAL_SUFFIX}"));
            match fs::remove_file(&stale) {
                Ok(()) => info!("removed stale file {}", stale.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(StreamError::Io(std::io::Error::new(
                        e.kind(),
                        format!("could not remove \"{}\": {e}", stale.display()),
                    )))
                }
            }
        }
        Ok(HookAction::Continue)
    }
}

/// Configuration for one WAL streaming session
#[derive(Debug, Clone)]
pub struct WalStreamConfig {
    /// Directory receiving the segment files
    pub basedir: PathBuf,
    /// Create segments as `<name>.partial` and rename them into place at
    /// completion
    pub rename_partial: bool,
    /// Read deadline on the stream. When it elapses once a standby status
    /// update is sent and reading resumes; a second consecutive expiry is
    /// fatal. `None` waits indefinitely.
    pub standby_timeout: Option<Duration>,
}

/// Find the position to resume streaming from.
///
/// Scans `basedir` for completed segments of the current timeline and
/// returns the position just past the highest one, or `current_pos` when
/// none exists. A file of less than segment size is a leftover from an
/// interrupted run: it is renamed to `<name>.partial` (we do not fsync
/// after every write, so its tail cannot be trusted) and the scan stops
/// there.
///
/// # Errors
///
/// Fails if the rename target already exists; two partial files for the
/// same segment need manual cleanup.
pub fn find_streaming_start(
    basedir: &Path,
    current_pos: XLogRecPtr,
    timeline: TimelineId,
) -> Result<XLogRecPtr> {
    let mut segments: Vec<(SegmentName, u64)> = Vec::new();

    for entry in fs::read_dir(basedir).map_err(|e| {
        StreamError::Io(std::io::Error::new(
            e.kind(),
            format!("could not open directory \"{}\": {e}", basedir.display()),
        ))
    })? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(name_str) = file_name.to_str() else {
            continue;
        };
        let Ok(name) = name_str.parse::<SegmentName>() else {
            continue;
        };

        if name.timeline != timeline {
            continue;
        }

        segments.push((name, entry.metadata()?.len()));
    }

    // Process in WAL order so a leftover short segment is seen after the
    // completed segments preceding it
    segments.sort_by_key(|(name, _)| *name);

    let mut high: Option<SegmentName> = None;
    for (name, size) in segments {
        if size == WAL_SEG_SIZE {
            high = Some(name);
        } else {
            // Interrupted segment; move it out of the way and restart the
            // stream before it
            let from = basedir.join(name.to_string());
            let to = basedir.join(format!("{name}{PARTIAL_SUFFIX}"));
            if to.exists() {
                return Err(StreamError::config(format!(
                    "file \"{}\" already exists. Check and clean up manually.",
                    to.display()
                )));
            }
            warn!("renaming partial file \"{name}\" to \"{name}.partial\"");
            fs::rename(&from, &to)?;
            break;
        }
    }

    match high {
        Some(name) => Ok(name.end_pos()),
        None => Ok(current_pos),
    }
}

/// Routes WAL frame payloads into segment files, tracking the write
/// position and handling frames that span a segment boundary.
struct WalWriter {
    basedir: PathBuf,
    timeline: TimelineId,
    rename_partial: bool,
    current: Option<SegmentWriter>,
    position: XLogRecPtr,
}

impl WalWriter {
    fn new(
        basedir: PathBuf,
        timeline: TimelineId,
        rename_partial: bool,
        start: XLogRecPtr,
    ) -> Self {
        Self {
            basedir,
            timeline,
            rename_partial,
            current: None,
            position: start,
        }
    }

    /// Position of the next byte to be written
    fn position(&self) -> XLogRecPtr {
        self.position
    }

    /// Highest position known durable: the end of the last finished
    /// segment. Bytes in the open segment are not fsync'd yet.
    fn flushed_position(&self) -> XLogRecPtr {
        align_to_segment(self.position)
    }

    /// Write one frame body, finishing segments (and firing the hook) at
    /// every boundary crossed.
    fn write_frame(&mut self, frame: &WalFrame, hook: &mut dyn SegmentHook) -> Result<HookAction> {
        match &self.current {
            None => {
                // A fresh stream must land on a segment boundary
                let offset = frame.start_pos % WAL_SEG_SIZE;
                if offset != 0 {
                    return Err(StreamError::protocol(format!(
                        "received WAL record for offset {offset} with no file open"
                    )));
                }
                self.position = frame.start_pos;
            }
            Some(writer) => {
                if frame.start_pos != self.position {
                    return Err(StreamError::protocol(format!(
                        "got WAL data offset {}, expected {} in segment {}",
                        format_lsn(frame.start_pos),
                        format_lsn(self.position),
                        writer.name()
                    )));
                }
            }
        }

        let mut body = frame.body.as_slice();
        while !body.is_empty() {
            if self.current.is_none() {
                let name = SegmentName::from_position(self.timeline, self.position);
                self.current = Some(SegmentWriter::open(
                    &self.basedir,
                    name,
                    self.rename_partial,
                )?);
            }
            let writer = self.current.as_mut().expect("segment was just opened");

            // Write only up to the segment boundary; the rest of the frame
            // belongs to the next segment
            let take = (writer.remaining() as usize).min(body.len());
            writer.write(&body[..take])?;
            body = &body[take..];
            self.position += take as u64;

            if writer.remaining() == 0 {
                let finished = self.current.take().expect("segment is open");
                let name = finished.name();
                finished.finish()?;
                debug!(
                    "finished segment {} at {} (timeline {})",
                    name,
                    format_lsn(self.position),
                    self.timeline
                );

                if hook.segment_finished(self.position, self.timeline)? == HookAction::Stop {
                    return Ok(HookAction::Stop);
                }
            }
        }

        Ok(HookAction::Continue)
    }

    /// Close the open segment without fsync on unexpected termination
    fn abort(&mut self) {
        if let Some(writer) = self.current.take() {
            writer.abort();
        }
    }
}

/// One WAL streaming session over an established replication connection
pub struct WalStreamEngine<H: SegmentHook> {
    config: WalStreamConfig,
    hook: H,
}

impl<H: SegmentHook> WalStreamEngine<H> {
    pub fn new(config: WalStreamConfig, hook: H) -> Self {
        Self { config, hook }
    }

    /// Stream WAL until the server ends the stream, the hook requests a
    /// stop, or a fatal error occurs.
    ///
    /// # Returns
    ///
    /// The position just past the last byte streamed. On cancellation the
    /// open segment is closed without fsync and
    /// `StreamError::Cancelled` is returned; completed segments remain
    /// valid.
    pub async fn run(
        &mut self,
        conn: &mut PgReplicationConnection,
        cancellation_token: &CancellationToken,
    ) -> Result<XLogRecPtr> {
        let identity = conn.identify_system()?;
        debug!(
            "system {} on timeline {} at {}",
            identity.system_id,
            identity.timeline,
            format_lsn(identity.xlog_pos)
        );

        let discovered =
            find_streaming_start(&self.config.basedir, identity.xlog_pos, identity.timeline)?;
        let start = align_to_segment(discovered);

        info!(
            "starting log streaming at {} (timeline {})",
            format_lsn(start),
            identity.timeline
        );
        conn.start_replication(start, identity.timeline)?;

        let mut writer = WalWriter::new(
            self.config.basedir.clone(),
            identity.timeline,
            self.config.rename_partial,
            start,
        );

        let result = self.stream_loop(conn, cancellation_token, &mut writer).await;
        match result {
            Ok(()) => Ok(writer.position()),
            Err(e) => {
                writer.abort();
                Err(e)
            }
        }
    }

    async fn stream_loop(
        &mut self,
        conn: &mut PgReplicationConnection,
        cancellation_token: &CancellationToken,
        writer: &mut WalWriter,
    ) -> Result<()> {
        // Set once the read deadline has elapsed without traffic; cleared by
        // any frame. A second consecutive expiry gives up on the server.
        let mut deadline_hit = false;

        loop {
            let copy = match self.config.standby_timeout {
                Some(interval) => {
                    match tokio::time::timeout(interval, conn.get_copy_data_async(cancellation_token))
                        .await
                    {
                        Ok(result) => result?,
                        Err(_) => {
                            if deadline_hit {
                                return Err(StreamError::timeout(format!(
                                    "no message from server for {}s",
                                    2 * interval.as_secs()
                                )));
                            }
                            deadline_hit = true;
                            debug!("read deadline elapsed, sending standby status update");
                            self.send_status(conn, writer, false)?;
                            continue;
                        }
                    }
                }
                None => conn.get_copy_data_async(cancellation_token).await?,
            };
            deadline_hit = false;

            match copy {
                CopyData::Done => {
                    // Controlled shutdown: the server ends the stream and
                    // reports its final command status
                    conn.finish_copy()?;
                    info!(
                        "replication stream ended at {}",
                        format_lsn(writer.position())
                    );
                    return Ok(());
                }
                CopyData::Frame(payload) => match ReplicationFrame::parse(payload)? {
                    ReplicationFrame::Keepalive(keepalive) => {
                        debug!(
                            "keepalive: wal_end={}, reply_requested={}",
                            format_lsn(keepalive.wal_end),
                            keepalive.reply_requested
                        );
                        if keepalive.reply_requested {
                            self.send_status(conn, writer, false)?;
                        }
                    }
                    ReplicationFrame::WalData(frame) => {
                        if writer.write_frame(&frame, &mut self.hook)? == HookAction::Stop {
                            info!(
                                "stopped by segment hook at {}",
                                format_lsn(writer.position())
                            );
                            return Ok(());
                        }
                    }
                },
            }
        }
    }

    fn send_status(
        &self,
        conn: &PgReplicationConnection,
        writer: &WalWriter,
        reply_requested: bool,
    ) -> Result<()> {
        conn.send_standby_status_update(
            writer.position(),
            writer.flushed_position(),
            INVALID_XLOG_REC_PTR,
            system_time_to_pg_timestamp(SystemTime::now()),
            reply_requested,
        )
    }
}
