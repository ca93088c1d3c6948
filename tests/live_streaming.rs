//! Live-server integration tests.
//!
//! These require a running PostgreSQL instance configured for physical
//! replication and are ignored by default.
//!
//! ## Prerequisites
//!
//! - PostgreSQL with `wal_level = replica` (or higher) and
//!   `max_wal_senders` > 0
//! - A user with replication privileges, allowed in `pg_hba.conf` for the
//!   `replication` pseudo-database
//! - Environment variable `REPLICATION_CONNINFO` pointing at the server,
//!   e.g. `host=localhost port=5432 user=postgres dbname=replication
//!   replication=true`
//!
//! ## Running locally
//!
//! ```bash
//! export REPLICATION_CONNINFO="host=localhost user=postgres dbname=replication replication=true"
//! cargo test --test live_streaming -- --ignored
//! ```

use pg_streamrecv::{
    HookAction, PgReplicationConnection, Result, SegmentHook, TimelineId, WalStreamConfig,
    WalStreamEngine, XLogRecPtr, WAL_SEG_SIZE,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn conninfo() -> String {
    std::env::var("REPLICATION_CONNINFO").unwrap_or_else(|_| {
        "host=localhost port=5432 user=postgres dbname=replication replication=true".to_string()
    })
}

/// Stop the stream at the first completed segment
struct StopAfterOneSegment {
    end_pos: Option<XLogRecPtr>,
}

impl SegmentHook for StopAfterOneSegment {
    fn segment_finished(
        &mut self,
        end_pos: XLogRecPtr,
        _timeline: TimelineId,
    ) -> Result<HookAction> {
        self.end_pos = Some(end_pos);
        Ok(HookAction::Stop)
    }
}

#[tokio::test]
#[ignore]
async fn identify_system_reports_sane_values() {
    let conn = PgReplicationConnection::connect(&conninfo()).expect("connect");
    let identity = conn.identify_system().expect("IDENTIFY_SYSTEM");

    assert!(!identity.system_id.is_empty());
    assert!(identity.timeline >= 1);
    assert!(identity.xlog_pos > 0);
}

#[tokio::test]
#[ignore]
async fn stream_one_segment_and_stop() {
    let dir = TempDir::new().unwrap();
    let mut conn = PgReplicationConnection::connect(&conninfo()).expect("connect");

    let config = WalStreamConfig {
        basedir: dir.path().to_path_buf(),
        rename_partial: false,
        standby_timeout: Some(std::time::Duration::from_secs(30)),
    };
    let hook = StopAfterOneSegment { end_pos: None };
    let mut engine = WalStreamEngine::new(config, hook);

    // Needs enough WAL traffic on the server to fill one segment; generate
    // some before or while running this test.
    let last = engine
        .run(&mut conn, &CancellationToken::new())
        .await
        .expect("stream");

    assert_eq!(last % WAL_SEG_SIZE, 0, "stopped at a segment boundary");
    let completed: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.metadata().map(|m| m.len()).unwrap_or(0) == WAL_SEG_SIZE)
        .collect();
    assert_eq!(completed.len(), 1);
}
