//! Base backup engine
//!
//! Drives the `BASE_BACKUP` replication command: reads the tablespace
//! header row-set, then consumes one COPY OUT tar archive per tablespace,
//! routing the bytes either verbatim into per-tablespace tar files
//! (optionally gzip-compressed, or concatenated onto stdout) or through the
//! streaming tar parser into a directory tree.

use crate::connection::{BaseBackupCommand, CopyData, PgReplicationConnection, PgResult};
use crate::error::{Result, StreamError};
use crate::tar::{EntryKind, TarEntry, TarParser, TarSink};
use std::fs::{self, File};
use std::io::{IsTerminal, Write};
use std::os::unix::fs::{symlink, DirBuilderExt};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where tar-mode output goes
#[derive(Debug, Clone)]
pub enum TarTarget {
    /// One `<dir>/base.tar[.gz]` plus `<dir>/<oid>.tar[.gz]` per extra
    /// tablespace
    Directory(PathBuf),
    /// Single archive on standard output; only valid for single-tablespace
    /// clusters
    Stdout,
}

/// Output mode for a base backup
#[derive(Debug, Clone)]
pub enum BackupMode {
    /// Write the server's archives through as tar files
    Tar {
        target: TarTarget,
        /// gzip compression level (1..=9); `None` writes plain tar
        gzip_level: Option<u32>,
    },
    /// Unpack archives into a directory tree
    Unpack { basedir: PathBuf },
}

/// Configuration for one base backup session
#[derive(Debug, Clone)]
pub struct BaseBackupConfig {
    /// Backup label recorded by the server
    pub label: String,
    /// Request per-tablespace size estimates and report progress on stderr
    pub progress: bool,
    /// Request an immediate checkpoint
    pub fast_checkpoint: bool,
    /// Do not wait for WAL archiving
    pub nowait: bool,
    /// Include WAL segments in the backup
    pub include_wal: bool,
    pub mode: BackupMode,
}

impl BaseBackupConfig {
    /// Check option combinations that can be rejected before connecting.
    ///
    /// # Errors
    ///
    /// Compression is only supported when writing tar files to a
    /// directory; requesting it with stdout output or in unpack mode is a
    /// configuration error.
    pub fn validate(&self) -> Result<()> {
        match &self.mode {
            BackupMode::Tar {
                gzip_level: Some(level),
                target,
            } => {
                if !(1..=9).contains(level) {
                    return Err(StreamError::config(format!(
                        "invalid compression level {level} (must be 1..9)"
                    )));
                }
                if matches!(target, TarTarget::Stdout) {
                    return Err(StreamError::config(
                        "compression is not supported when writing to stdout",
                    ));
                }
                Ok(())
            }
            BackupMode::Tar { .. } => Ok(()),
            BackupMode::Unpack { .. } => Ok(()),
        }
    }
}

/// One row of the tablespace header row-set.
///
/// The first row describes the main data directory and carries NULL oid
/// and location; later rows name additional tablespaces.
#[derive(Debug, Clone)]
pub struct TablespaceInfo {
    pub oid: Option<u32>,
    pub location: Option<PathBuf>,
    /// Size estimate in kilobytes, present when PROGRESS was requested.
    /// Advisory only; the archive may grow while the backup runs.
    pub size_kb: Option<u64>,
}

impl TablespaceInfo {
    fn from_row(result: &PgResult, row: i32) -> Result<Self> {
        let oid = match result.get_value(row, 0) {
            Some(text) => Some(text.parse::<u32>().map_err(|e| {
                StreamError::protocol(format!("bad tablespace oid \"{text}\": {e}"))
            })?),
            None => None,
        };
        let location = result.get_value(row, 1).map(PathBuf::from);
        let size_kb = match result.get_value(row, 2) {
            Some(text) => Some(text.parse::<u64>().map_err(|e| {
                StreamError::protocol(format!("bad tablespace size \"{text}\": {e}"))
            })?),
            None => None,
        };

        Ok(Self {
            oid,
            location,
            size_kb,
        })
    }
}

/// Require a target directory to be absent (then create it) or empty.
///
/// # Errors
///
/// A present, non-empty directory is a configuration error; creating the
/// backup into live data would be destructive either way.
pub fn verify_dir_is_empty_or_create(dir: &Path) -> Result<()> {
    match fs::read_dir(dir) {
        Ok(mut entries) => {
            if entries.next().is_some() {
                return Err(StreamError::config(format!(
                    "directory \"{}\" exists but is not empty",
                    dir.display()
                )));
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(dir)
                .map_err(|e| {
                    StreamError::Io(std::io::Error::new(
                        e.kind(),
                        format!("could not create directory \"{}\": {e}", dir.display()),
                    ))
                })
        }
        Err(e) => Err(StreamError::Io(std::io::Error::new(
            e.kind(),
            format!("could not access directory \"{}\": {e}", dir.display()),
        ))),
    }
}

/// Write-through sink producing `base.tar[.gz]` / `<oid>.tar[.gz]`
///
/// Appends the two all-zero 512-byte end-of-archive blocks on close; the
/// server stops at the archive boundary without sending them.
pub struct TarFileSink {
    output: TarOutput,
    path: Option<PathBuf>,
}

enum TarOutput {
    Plain(File),
    Gzip(Box<flate2::write::GzEncoder<File>>),
    Stdout(std::io::Stdout),
}

impl TarFileSink {
    /// Open the archive file for one tablespace: `base.tar[.gz]` for the
    /// main data directory, `<oid>.tar[.gz]` for the rest.
    pub fn create(
        target: &TarTarget,
        tablespace: &TablespaceInfo,
        gzip_level: Option<u32>,
    ) -> Result<Self> {
        match target {
            TarTarget::Stdout => Ok(Self {
                output: TarOutput::Stdout(std::io::stdout()),
                path: None,
            }),
            TarTarget::Directory(dir) => {
                let stem = match tablespace.oid {
                    None => "base".to_string(),
                    Some(oid) => oid.to_string(),
                };
                let path = match gzip_level {
                    Some(_) => dir.join(format!("{stem}.tar.gz")),
                    None => dir.join(format!("{stem}.tar")),
                };

                let file = File::create(&path).map_err(|e| {
                    StreamError::Io(std::io::Error::new(
                        e.kind(),
                        format!("could not create file \"{}\": {e}", path.display()),
                    ))
                })?;
                let output = match gzip_level {
                    Some(level) => TarOutput::Gzip(Box::new(flate2::write::GzEncoder::new(
                        file,
                        flate2::Compression::new(level),
                    ))),
                    None => TarOutput::Plain(file),
                };

                debug!("writing tablespace archive to {}", path.display());
                Ok(Self {
                    output,
                    path: Some(path),
                })
            }
        }
    }

    /// Pass one COPY payload through verbatim
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        match &mut self.output {
            TarOutput::Plain(file) => file.write_all(data)?,
            TarOutput::Gzip(encoder) => encoder.write_all(data)?,
            TarOutput::Stdout(stdout) => stdout.write_all(data)?,
        }
        Ok(())
    }

    /// Append the end-of-archive sentinel and close the output
    pub fn close(mut self) -> Result<()> {
        let zeros = [0u8; 1024];
        self.write(&zeros)?;

        match self.output {
            TarOutput::Plain(mut file) => file.flush()?,
            TarOutput::Gzip(encoder) => {
                encoder.finish()?.flush()?;
            }
            TarOutput::Stdout(mut stdout) => stdout.flush()?,
        }

        if let Some(path) = &self.path {
            debug!("finished archive {}", path.display());
        }
        Ok(())
    }
}

/// Tar-event sink materializing entries under a target directory
pub struct TreeSink {
    target: PathBuf,
    current: Option<File>,
    files: u64,
}

impl TreeSink {
    pub fn new(target: PathBuf) -> Self {
        Self {
            target,
            current: None,
            files: 0,
        }
    }

    /// Regular files created so far
    pub fn files_created(&self) -> u64 {
        self.files
    }

    fn entry_path(&self, name: &str) -> PathBuf {
        self.target.join(name.trim_end_matches('/'))
    }
}

impl TarSink for TreeSink {
    fn entry_start(&mut self, entry: &TarEntry) -> Result<()> {
        let path = self.entry_path(&entry.name);
        match entry.kind {
            EntryKind::Regular => {
                let file = File::create(&path).map_err(|e| {
                    StreamError::Io(std::io::Error::new(
                        e.kind(),
                        format!("could not create file \"{}\": {e}", path.display()),
                    ))
                })?;
                self.current = Some(file);
                self.files += 1;
            }
            EntryKind::Directory => {
                fs::DirBuilder::new().mode(0o700).create(&path).map_err(|e| {
                    StreamError::Io(std::io::Error::new(
                        e.kind(),
                        format!("could not create directory \"{}\": {e}", path.display()),
                    ))
                })?;
            }
            EntryKind::DirectorySymlink => {
                let link_target = entry
                    .link_target
                    .as_deref()
                    .expect("parser guarantees a target for symlink entries");
                symlink(link_target, &path).map_err(|e| {
                    StreamError::Io(std::io::Error::new(
                        e.kind(),
                        format!(
                            "could not create symbolic link from \"{}\" to \"{link_target}\": {e}",
                            path.display()
                        ),
                    ))
                })?;
            }
        }
        Ok(())
    }

    fn entry_data(&mut self, data: &[u8]) -> Result<()> {
        let file = self
            .current
            .as_mut()
            .expect("parser emits entry_data only inside a regular entry");
        file.write_all(data)?;
        Ok(())
    }

    fn entry_end(&mut self) -> Result<()> {
        self.current = None;
        Ok(())
    }
}

/// Carriage-returned progress lines on stderr, suppressed when stderr is
/// not a terminal
struct ProgressReporter {
    enabled: bool,
    total_kb: u64,
    done_bytes: u64,
    tablespace_count: usize,
}

impl ProgressReporter {
    fn new(requested: bool, total_kb: u64, tablespace_count: usize) -> Self {
        Self {
            enabled: requested && std::io::stderr().is_terminal(),
            total_kb,
            done_bytes: 0,
            tablespace_count,
        }
    }

    fn advance(&mut self, bytes: u64, current: usize) {
        self.done_bytes += bytes;
        if !self.enabled {
            return;
        }

        let done_kb = self.done_bytes / 1024;
        // The estimate can lag the live cluster; clamp rather than report
        // more than 100%
        let percent = if self.total_kb > 0 {
            (done_kb * 100 / self.total_kb).min(100)
        } else {
            0
        };
        eprint!(
            "{}/{} kB ({}%), {}/{} tablespaces\r",
            done_kb, self.total_kb, percent, current, self.tablespace_count
        );
    }

    fn finish(&self) {
        if self.enabled {
            eprintln!();
        }
    }
}

/// One base-backup session over an established replication connection
pub struct BaseBackupEngine {
    config: BaseBackupConfig,
}

impl BaseBackupEngine {
    /// Validate the configuration and build an engine.
    ///
    /// # Errors
    ///
    /// Configuration conflicts (see [`BaseBackupConfig::validate`]) are
    /// reported before any connection work.
    pub fn new(config: BaseBackupConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Run the backup to completion.
    ///
    /// On success every archive has been fully received and the server
    /// reported a clean command status. On error partial output is left in
    /// place for diagnosis.
    pub async fn run(
        &self,
        conn: &mut PgReplicationConnection,
        cancellation_token: &CancellationToken,
    ) -> Result<()> {
        let command = BaseBackupCommand {
            label: self.config.label.clone(),
            progress: self.config.progress,
            fast_checkpoint: self.config.fast_checkpoint,
            nowait: self.config.nowait,
            include_wal: self.config.include_wal,
        };

        let header = conn.send_base_backup(&command)?;
        let tablespaces = self.parse_tablespaces(&header)?;
        drop(header);

        info!("backup starting with {} tablespace(s)", tablespaces.len());
        self.check_targets(&tablespaces)?;

        let total_kb: u64 = tablespaces.iter().filter_map(|ts| ts.size_kb).sum();
        let mut progress = ProgressReporter::new(self.config.progress, total_kb, tablespaces.len());

        for (index, tablespace) in tablespaces.iter().enumerate() {
            conn.begin_copy_out()?;
            match &self.config.mode {
                BackupMode::Tar { target, gzip_level } => {
                    self.receive_tar_stream(
                        conn,
                        cancellation_token,
                        target,
                        tablespace,
                        *gzip_level,
                        &mut progress,
                        index + 1,
                    )
                    .await?;
                }
                BackupMode::Unpack { basedir } => {
                    self.receive_and_unpack(
                        conn,
                        cancellation_token,
                        basedir,
                        tablespace,
                        &mut progress,
                        index + 1,
                    )
                    .await?;
                }
            }
        }

        conn.finish_copy()?;
        progress.finish();
        info!("base backup completed");
        Ok(())
    }

    fn parse_tablespaces(&self, header: &PgResult) -> Result<Vec<TablespaceInfo>> {
        let mut tablespaces = Vec::with_capacity(header.ntuples() as usize);
        for row in 0..header.ntuples() {
            tablespaces.push(TablespaceInfo::from_row(header, row)?);
        }

        // The first row is always the main data directory
        if tablespaces
            .first()
            .map(|ts| ts.oid.is_some())
            .unwrap_or(true)
        {
            return Err(StreamError::protocol(
                "first tablespace row does not describe the data directory",
            ));
        }

        Ok(tablespaces)
    }

    /// Per-mode target checks that need the tablespace row-set
    fn check_targets(&self, tablespaces: &[TablespaceInfo]) -> Result<()> {
        match &self.config.mode {
            BackupMode::Tar {
                target: TarTarget::Stdout,
                ..
            } => {
                if tablespaces.len() > 1 {
                    return Err(StreamError::config(format!(
                        "can only write single tablespace to stdout, database has {}",
                        tablespaces.len()
                    )));
                }
                Ok(())
            }
            BackupMode::Tar { .. } => Ok(()),
            BackupMode::Unpack { .. } => {
                // The main data directory was verified before connecting;
                // additional tablespaces unpack into their original paths.
                for tablespace in &tablespaces[1..] {
                    let location = tablespace.location.as_deref().ok_or_else(|| {
                        StreamError::protocol("tablespace row without a location")
                    })?;
                    verify_dir_is_empty_or_create(location)?;
                }
                Ok(())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn receive_tar_stream(
        &self,
        conn: &mut PgReplicationConnection,
        cancellation_token: &CancellationToken,
        target: &TarTarget,
        tablespace: &TablespaceInfo,
        gzip_level: Option<u32>,
        progress: &mut ProgressReporter,
        tablespace_index: usize,
    ) -> Result<()> {
        let mut sink = TarFileSink::create(target, tablespace, gzip_level)?;

        loop {
            match conn.get_copy_data_async(cancellation_token).await? {
                CopyData::Frame(data) => {
                    sink.write(&data)?;
                    progress.advance(data.len() as u64, tablespace_index);
                }
                CopyData::Done => break,
            }
        }

        sink.close()
    }

    async fn receive_and_unpack(
        &self,
        conn: &mut PgReplicationConnection,
        cancellation_token: &CancellationToken,
        basedir: &Path,
        tablespace: &TablespaceInfo,
        progress: &mut ProgressReporter,
        tablespace_index: usize,
    ) -> Result<()> {
        let target = match (&tablespace.oid, &tablespace.location) {
            (None, _) => basedir.to_path_buf(),
            (Some(_), Some(location)) => location.clone(),
            (Some(oid), None) => {
                return Err(StreamError::protocol(format!(
                    "tablespace {oid} has no location"
                )))
            }
        };
        debug!("unpacking tablespace into {}", target.display());

        let mut parser = TarParser::new();
        let mut sink = TreeSink::new(target);

        loop {
            match conn.get_copy_data_async(cancellation_token).await? {
                CopyData::Frame(data) => {
                    parser.feed(&data, &mut sink)?;
                    progress.advance(data.len() as u64, tablespace_index);
                }
                CopyData::Done => break,
            }
        }

        // A stream that stops mid-entry means the last file was never
        // finished
        parser.finish()?;
        if sink.files > 0 {
            debug!("unpacked {} file(s)", sink.files);
        } else {
            warn!("tablespace archive contained no regular files");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tar::TAR_BLOCK_SIZE;
    use std::io::Read;
    use tempfile::TempDir;

    fn make_header(name: &str, size: u64, typeflag: u8, link: &str) -> [u8; TAR_BLOCK_SIZE] {
        let mut block = [0u8; TAR_BLOCK_SIZE];
        block[..name.len()].copy_from_slice(name.as_bytes());
        block[100..107].copy_from_slice(b"0000600");
        let size_field = format!("{size:011o} ");
        block[124..136].copy_from_slice(size_field.as_bytes());
        block[136..147].copy_from_slice(b"14371573120");
        block[156] = typeflag;
        block[157..157 + link.len()].copy_from_slice(link.as_bytes());
        block
    }

    fn archive_entry(name: &str, body: &[u8], typeflag: u8, link: &str) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&make_header(name, body.len() as u64, typeflag, link));
        bytes.extend_from_slice(body);
        let padding = (body.len().wrapping_neg()) & (TAR_BLOCK_SIZE - 1);
        bytes.extend_from_slice(&vec![0u8; padding]);
        bytes
    }

    #[test]
    fn test_verify_dir_creates_missing() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("backup");
        verify_dir_is_empty_or_create(&target).unwrap();
        assert!(target.is_dir());
    }

    #[test]
    fn test_verify_dir_accepts_empty() {
        let dir = TempDir::new().unwrap();
        verify_dir_is_empty_or_create(dir.path()).unwrap();
    }

    #[test]
    fn test_verify_dir_rejects_non_empty() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("stale"), b"x").unwrap();
        let err = verify_dir_is_empty_or_create(dir.path()).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("not empty"));
    }

    #[test]
    fn test_config_rejects_gzip_to_stdout() {
        let config = BaseBackupConfig {
            label: "test".into(),
            progress: false,
            fast_checkpoint: false,
            nowait: false,
            include_wal: false,
            mode: BackupMode::Tar {
                target: TarTarget::Stdout,
                gzip_level: Some(6),
            },
        };
        let err = config.validate().unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_config_rejects_bad_gzip_level() {
        let dir = TempDir::new().unwrap();
        let config = BaseBackupConfig {
            label: "test".into(),
            progress: false,
            fast_checkpoint: false,
            nowait: false,
            include_wal: false,
            mode: BackupMode::Tar {
                target: TarTarget::Directory(dir.path().to_path_buf()),
                gzip_level: Some(12),
            },
        };
        assert!(config.validate().is_err());
    }

    fn main_tablespace() -> TablespaceInfo {
        TablespaceInfo {
            oid: None,
            location: None,
            size_kb: Some(1024),
        }
    }

    #[test]
    fn test_tar_file_sink_appends_terminator() {
        let dir = TempDir::new().unwrap();
        let target = TarTarget::Directory(dir.path().to_path_buf());
        let mut sink = TarFileSink::create(&target, &main_tablespace(), None).unwrap();

        let payload = archive_entry("postgresql.conf", b"port = 5432\n", b'0', "");
        sink.write(&payload).unwrap();
        sink.close().unwrap();

        let written = std::fs::read(dir.path().join("base.tar")).unwrap();
        assert_eq!(written.len(), payload.len() + 1024);
        assert_eq!(&written[..payload.len()], &payload[..]);
        assert!(written[payload.len()..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_tar_file_sink_names_tablespace_by_oid() {
        let dir = TempDir::new().unwrap();
        let target = TarTarget::Directory(dir.path().to_path_buf());
        let tablespace = TablespaceInfo {
            oid: Some(16385),
            location: Some(PathBuf::from("/mnt/space")),
            size_kb: None,
        };
        let sink = TarFileSink::create(&target, &tablespace, None).unwrap();
        sink.close().unwrap();
        assert!(dir.path().join("16385.tar").exists());
    }

    #[test]
    fn test_tar_file_sink_gzip_roundtrip() {
        let dir = TempDir::new().unwrap();
        let target = TarTarget::Directory(dir.path().to_path_buf());
        let mut sink = TarFileSink::create(&target, &main_tablespace(), Some(6)).unwrap();

        let payload = archive_entry("pg_hba.conf", b"local all all trust\n", b'0', "");
        sink.write(&payload).unwrap();
        sink.close().unwrap();

        let compressed = File::open(dir.path().join("base.tar.gz")).unwrap();
        let mut decoder = flate2::read::GzDecoder::new(compressed);
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed).unwrap();
        assert_eq!(decompressed.len(), payload.len() + 1024);
        assert_eq!(&decompressed[..payload.len()], &payload[..]);
    }

    #[test]
    fn test_tree_sink_materializes_entries() {
        let dir = TempDir::new().unwrap();
        let mut archive = Vec::new();
        archive.extend_from_slice(&archive_entry("global/", b"", b'5', ""));
        archive.extend_from_slice(&archive_entry("global/pg_control", &[9u8; 600], b'0', ""));
        archive.extend_from_slice(&archive_entry("pg_tblspc/", b"", b'5', ""));
        archive.extend_from_slice(&archive_entry("pg_tblspc/16385/", b"", b'2', "/mnt/space"));

        let mut parser = TarParser::new();
        let mut sink = TreeSink::new(dir.path().to_path_buf());
        parser.feed(&archive, &mut sink).unwrap();
        parser.finish().unwrap();

        assert!(dir.path().join("global").is_dir());
        let control = std::fs::read(dir.path().join("global/pg_control")).unwrap();
        assert_eq!(control, vec![9u8; 600]);

        let link = dir.path().join("pg_tblspc/16385");
        assert_eq!(
            std::fs::read_link(&link).unwrap(),
            PathBuf::from("/mnt/space")
        );
        assert_eq!(sink.files, 1);
    }

    #[test]
    fn test_tree_sink_unknown_type_leaves_partial_state() {
        let dir = TempDir::new().unwrap();
        let mut archive = Vec::new();
        archive.extend_from_slice(&archive_entry("good.conf", b"kept\n", b'0', ""));
        archive.extend_from_slice(&archive_entry("strange", b"data", b'x', ""));

        let mut parser = TarParser::new();
        let mut sink = TreeSink::new(dir.path().to_path_buf());
        let err = parser.feed(&archive, &mut sink).unwrap_err();
        assert!(matches!(err, StreamError::Protocol(_)));

        // The entry received before the failure stays on disk for diagnosis
        assert_eq!(
            std::fs::read(dir.path().join("good.conf")).unwrap(),
            b"kept\n"
        );
    }

    #[test]
    fn test_tree_sink_write_spans_chunks() {
        let dir = TempDir::new().unwrap();
        let body: Vec<u8> = (0..4096u32).map(|i| (i % 200) as u8).collect();
        let archive = archive_entry("base/16384/1249", &body, b'0', "");

        let mut parser = TarParser::new();
        let mut sink = TreeSink::new(dir.path().to_path_buf());
        std::fs::create_dir_all(dir.path().join("base/16384")).unwrap();
        for chunk in archive.chunks(777) {
            parser.feed(chunk, &mut sink).unwrap();
        }
        parser.finish().unwrap();

        assert_eq!(
            std::fs::read(dir.path().join("base/16384/1249")).unwrap(),
            body
        );
    }
}
