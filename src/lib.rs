//! # PostgreSQL Physical Replication Client Tools
//!
//! Client-side engines for the PostgreSQL physical replication protocol:
//! streaming base backups (`BASE_BACKUP` over COPY OUT) and continuous WAL
//! archiving (`START_REPLICATION` over COPY BOTH), built on libpq.
//!
//! Two binaries ship with the library:
//!
//! - `pg_recvbase` pulls a full cluster snapshot as tar archives, written
//!   through as `.tar[.gz]` files or unpacked into a directory tree.
//! - `pg_recvwal` follows the WAL stream and materializes 16 MiB segment
//!   files, fsync'ing at every segment boundary so recovery can trust
//!   whatever is on disk.
//!
//! ## Crash safety
//!
//! Completed segments are always exactly segment-sized and durable before
//! they become visible under their final name; interrupted runs leave
//! short or `.partial` files that the next run's discovery scan moves out
//! of the way before resuming at the last completed boundary.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use pg_streamrecv::{
//!     PgReplicationConnection, WalStreamConfig, WalStreamEngine, PartialCleanupHook,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! let mut conn = PgReplicationConnection::connect(
//!     "host=localhost user=postgres dbname=replication replication=true",
//! )?;
//! let config = WalStreamConfig {
//!     basedir: "./wal".into(),
//!     rename_partial: true,
//!     standby_timeout: Some(std::time::Duration::from_secs(10)),
//! };
//! let mut engine = WalStreamEngine::new(config, PartialCleanupHook::new("./wal".into()));
//! let last = engine.run(&mut conn, &CancellationToken::new()).await?;
//! ```

// Core modules
pub mod buffer;
pub mod error;
pub mod xlog;

// Protocol implementation
pub mod connection;
pub mod wire;

// On-disk formats
pub mod segment;
pub mod tar;

// High-level engines
pub mod basebackup;
pub mod walstream;

// Re-export main types for convenience
pub use buffer::{BufferReader, BufferWriter};
pub use error::{Result, StreamError};

pub use xlog::{
    align_to_segment, format_lsn, parse_lsn, SegmentName, TimelineId, XLogRecPtr,
    INVALID_XLOG_REC_PTR, WAL_SEG_SIZE,
};

pub use connection::{
    BaseBackupCommand, CopyData, PgReplicationConnection, PgResult, SystemIdentity,
};

pub use wire::{Keepalive, ReplicationFrame, WalFrame};

pub use segment::{SegmentWriter, PARTIAL_SUFFIX};
pub use tar::{EntryKind, TarEntry, TarParser, TarSink};

pub use basebackup::{
    verify_dir_is_empty_or_create, BackupMode, BaseBackupConfig, BaseBackupEngine, TablespaceInfo,
    TarFileSink, TarTarget, TreeSink,
};
pub use walstream::{
    find_streaming_start, HookAction, NoopHook, PartialCleanupHook, SegmentHook, WalStreamConfig,
    WalStreamEngine,
};

// Re-export tokio_util for CancellationToken
pub use tokio_util::sync::CancellationToken;
