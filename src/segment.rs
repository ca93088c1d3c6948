//! Durable WAL segment files
//!
//! One [`SegmentWriter`] exists per segment, from the first byte destined
//! for it until fsync and close; a segment is never reopened. Completed
//! segments are exactly [`WAL_SEG_SIZE`] bytes and are durable before they
//! become visible under their final name.
//!
//! In rename-partial mode the file is created as `<name>.partial` and
//! renamed to `<name>` only after fsync, so any file visible without the
//! suffix can be trusted by recovery. Without it, the file is created under
//! its final name directly and an interrupted run leaves a short file that
//! the next run's startup scan moves out of the way.

use crate::error::{Result, StreamError};
use crate::xlog::{SegmentName, WAL_SEG_SIZE};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Suffix carried by segment files that have not reached full size
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Append-only writer for one WAL segment
pub struct SegmentWriter {
    file: File,
    name: SegmentName,
    basedir: PathBuf,
    partial: bool,
    bytes_written: u64,
}

impl SegmentWriter {
    /// Create the segment file exclusively and return a writer positioned
    /// at offset zero.
    ///
    /// With `use_partial` the file is created as `<name>.partial` and only
    /// renamed into place by [`SegmentWriter::finish`].
    ///
    /// # Errors
    ///
    /// Fails if the target file already exists (the stream would otherwise
    /// silently overwrite WAL) or cannot be created.
    pub fn open(basedir: &Path, name: SegmentName, use_partial: bool) -> Result<Self> {
        let path = Self::file_path(basedir, name, use_partial);

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                StreamError::Io(std::io::Error::new(
                    e.kind(),
                    format!("could not open WAL segment {}: {e}", path.display()),
                ))
            })?;

        debug!("opened WAL segment file {}", path.display());

        Ok(Self {
            file,
            name,
            basedir: basedir.to_path_buf(),
            partial: use_partial,
            bytes_written: 0,
        })
    }

    fn file_path(basedir: &Path, name: SegmentName, partial: bool) -> PathBuf {
        if partial {
            basedir.join(format!("{name}{PARTIAL_SUFFIX}"))
        } else {
            basedir.join(name.to_string())
        }
    }

    /// Segment this writer belongs to
    pub fn name(&self) -> SegmentName {
        self.name
    }

    /// Bytes written so far; never exceeds [`WAL_SEG_SIZE`]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Room left before the segment is complete
    pub fn remaining(&self) -> u64 {
        WAL_SEG_SIZE - self.bytes_written
    }

    /// Append bytes at the tracked offset.
    ///
    /// Short writes are retried until the whole buffer is on its way to
    /// disk or an error surfaces.
    ///
    /// # Errors
    ///
    /// Writing past the segment end is a protocol error; the engine sizes
    /// every write with [`SegmentWriter::remaining`].
    pub fn write(&mut self, buf: &[u8]) -> Result<()> {
        if buf.len() as u64 > self.remaining() {
            return Err(StreamError::protocol(format!(
                "write of {} bytes would overrun segment {} at offset {}",
                buf.len(),
                self.name,
                self.bytes_written
            )));
        }

        self.file.write_all(buf).map_err(|e| {
            StreamError::Io(std::io::Error::new(
                e.kind(),
                format!(
                    "could not write {} bytes to WAL segment {}: {e}",
                    buf.len(),
                    self.name
                ),
            ))
        })?;
        self.bytes_written += buf.len() as u64;
        Ok(())
    }

    /// Make the completed segment durable: fsync, close, and in
    /// rename-partial mode move `<name>.partial` to `<name>` and fsync the
    /// directory so the rename itself survives a crash.
    ///
    /// # Errors
    ///
    /// Calling this before the segment is full is a protocol error.
    pub fn finish(self) -> Result<()> {
        if self.bytes_written != WAL_SEG_SIZE {
            return Err(StreamError::protocol(format!(
                "segment {} finished at {} of {} bytes",
                self.name, self.bytes_written, WAL_SEG_SIZE
            )));
        }

        self.file.sync_all()?;
        drop(self.file);

        if self.partial {
            let from = Self::file_path(&self.basedir, self.name, true);
            let to = Self::file_path(&self.basedir, self.name, false);
            std::fs::rename(&from, &to)?;
            File::open(&self.basedir)?.sync_all()?;
            debug!("renamed {} into place", to.display());
        }

        debug!("finished WAL segment {}", self.name);
        Ok(())
    }

    /// Close without fsync on unexpected termination. The file stays on
    /// disk under its current (short or `.partial`) name for the next run's
    /// startup scan.
    pub fn abort(self) {
        warn!(
            "abandoning WAL segment {} at {} bytes",
            self.name, self.bytes_written
        );
        drop(self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn segment_1() -> SegmentName {
        SegmentName {
            timeline: 1,
            log: 0,
            seg: 1,
        }
    }

    fn fill(writer: &mut SegmentWriter) {
        let chunk = vec![0xABu8; 1024 * 1024];
        while writer.remaining() > 0 {
            let take = (writer.remaining() as usize).min(chunk.len());
            writer.write(&chunk[..take]).unwrap();
        }
    }

    #[test]
    fn test_open_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let _writer = SegmentWriter::open(dir.path(), segment_1(), false).unwrap();
        let err = SegmentWriter::open(dir.path(), segment_1(), false).unwrap_err();
        assert!(err.to_string().contains("could not open WAL segment"));
    }

    #[test]
    fn test_complete_segment_without_rename() {
        let dir = TempDir::new().unwrap();
        let mut writer = SegmentWriter::open(dir.path(), segment_1(), false).unwrap();
        fill(&mut writer);
        assert_eq!(writer.bytes_written(), WAL_SEG_SIZE);
        writer.finish().unwrap();

        let path = dir.path().join("000000010000000000000001");
        assert_eq!(path.metadata().unwrap().len(), WAL_SEG_SIZE);
        assert!(!dir.path().join("000000010000000000000001.partial").exists());
    }

    #[test]
    fn test_rename_partial_mode() {
        let dir = TempDir::new().unwrap();
        let mut writer = SegmentWriter::open(dir.path(), segment_1(), true).unwrap();

        // While open, only the .partial name is visible
        assert!(dir.path().join("000000010000000000000001.partial").exists());
        assert!(!dir.path().join("000000010000000000000001").exists());

        fill(&mut writer);
        writer.finish().unwrap();

        assert!(!dir.path().join("000000010000000000000001.partial").exists());
        let path = dir.path().join("000000010000000000000001");
        assert_eq!(path.metadata().unwrap().len(), WAL_SEG_SIZE);
    }

    #[test]
    fn test_finish_short_segment_rejected() {
        let dir = TempDir::new().unwrap();
        let mut writer = SegmentWriter::open(dir.path(), segment_1(), false).unwrap();
        writer.write(&[1, 2, 3]).unwrap();
        let err = writer.finish().unwrap_err();
        assert!(err.to_string().contains("finished at 3"));
    }

    #[test]
    fn test_write_overrun_rejected() {
        let dir = TempDir::new().unwrap();
        let mut writer = SegmentWriter::open(dir.path(), segment_1(), false).unwrap();
        fill(&mut writer);
        let err = writer.write(&[0]).unwrap_err();
        assert!(err.to_string().contains("overrun"));
    }

    #[test]
    fn test_abort_leaves_partial_file() {
        let dir = TempDir::new().unwrap();
        let mut writer = SegmentWriter::open(dir.path(), segment_1(), true).unwrap();
        writer.write(&[5u8; 8192]).unwrap();
        writer.abort();

        let partial = dir.path().join("000000010000000000000001.partial");
        assert_eq!(partial.metadata().unwrap().len(), 8192);
        assert!(!dir.path().join("000000010000000000000001").exists());
    }

    #[test]
    fn test_offset_tracking() {
        let dir = TempDir::new().unwrap();
        let mut writer = SegmentWriter::open(dir.path(), segment_1(), false).unwrap();
        assert_eq!(writer.bytes_written(), 0);
        assert_eq!(writer.remaining(), WAL_SEG_SIZE);

        writer.write(&[0u8; 4096]).unwrap();
        assert_eq!(writer.bytes_written(), 4096);
        assert_eq!(writer.remaining(), WAL_SEG_SIZE - 4096);
    }
}
