//! Integration tests for the base-backup sinks.
//!
//! These exercise the streaming tar path end to end without a server:
//! synthetic ustar archives are pushed through the parser into a
//! [`TreeSink`] (unpack mode) or a [`TarFileSink`] (tar mode), and the
//! resulting filesystem state is checked against the archive contents.

use pg_streamrecv::{
    BackupMode, BaseBackupConfig, BaseBackupEngine, StreamError, TablespaceInfo, TarFileSink,
    TarParser, TarTarget, TreeSink,
};
use std::io::Read;
use std::path::PathBuf;
use tempfile::TempDir;

const BLOCK: usize = 512;

fn make_header(name: &str, size: u64, typeflag: u8, link: &str) -> Vec<u8> {
    let mut block = vec![0u8; BLOCK];
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
    let mut bytes = make_header(name, body.len() as u64, typeflag, link);
    bytes.extend_from_slice(body);
    let padding = body.len().wrapping_neg() & (BLOCK - 1);
    bytes.extend_from_slice(&vec![0u8; padding]);
    bytes
}

/// A small but structurally realistic data-directory archive
fn cluster_archive() -> Vec<u8> {
    let mut archive = Vec::new();
    archive.extend_from_slice(&archive_entry("global/", b"", b'5', ""));
    archive.extend_from_slice(&archive_entry("global/pg_control", &[0xC0; 8192], b'0', ""));
    archive.extend_from_slice(&archive_entry("base/", b"", b'5', ""));
    archive.extend_from_slice(&archive_entry("base/1/", b"", b'5', ""));
    let table: Vec<u8> = (0..20000u32).map(|i| (i % 253) as u8).collect();
    archive.extend_from_slice(&archive_entry("base/1/1249", &table, b'0', ""));
    archive.extend_from_slice(&archive_entry("postgresql.conf", b"port = 5432\n", b'0', ""));
    archive.extend_from_slice(&archive_entry("pg_tblspc/", b"", b'5', ""));
    archive.extend_from_slice(&archive_entry("pg_tblspc/16385/", b"", b'2', "/mnt/fastdisk"));
    archive
}

#[test]
fn unpack_materializes_cluster_tree() {
    let dir = TempDir::new().unwrap();
    let archive = cluster_archive();

    let mut parser = TarParser::new();
    let mut sink = TreeSink::new(dir.path().to_path_buf());
    parser.feed(&archive, &mut sink).unwrap();
    parser.finish().unwrap();

    assert!(dir.path().join("global").is_dir());
    assert!(dir.path().join("base/1").is_dir());
    assert_eq!(
        std::fs::read(dir.path().join("global/pg_control")).unwrap(),
        vec![0xC0; 8192]
    );
    let table: Vec<u8> = (0..20000u32).map(|i| (i % 253) as u8).collect();
    assert_eq!(std::fs::read(dir.path().join("base/1/1249")).unwrap(), table);
    assert_eq!(
        std::fs::read(dir.path().join("postgresql.conf")).unwrap(),
        b"port = 5432\n"
    );
    assert_eq!(
        std::fs::read_link(dir.path().join("pg_tblspc/16385")).unwrap(),
        PathBuf::from("/mnt/fastdisk")
    );
    assert_eq!(sink.files_created(), 3);
}

#[test]
fn unpack_is_chunking_independent() {
    // The same archive, delivered at frame sizes that split headers,
    // bodies, and padding, produces the same tree
    let archive = cluster_archive();

    for chunk_size in [1usize, 200, 511, 512, 8192] {
        let dir = TempDir::new().unwrap();
        let mut parser = TarParser::new();
        let mut sink = TreeSink::new(dir.path().to_path_buf());
        for chunk in archive.chunks(chunk_size) {
            parser.feed(chunk, &mut sink).unwrap();
        }
        parser.finish().unwrap();

        assert_eq!(sink.files_created(), 3, "chunk size {chunk_size}");
        assert_eq!(
            std::fs::read(dir.path().join("global/pg_control")).unwrap(),
            vec![0xC0; 8192],
            "chunk size {chunk_size}"
        );
    }
}

#[test]
fn unpack_aborts_on_unknown_entry_type_leaving_partial_tree() {
    let dir = TempDir::new().unwrap();
    let mut archive = Vec::new();
    archive.extend_from_slice(&archive_entry("kept.conf", b"survives\n", b'0', ""));
    // Extended headers are not part of the subset the server emits
    archive.extend_from_slice(&archive_entry("pax_header", b"x=y\n", b'x', ""));
    archive.extend_from_slice(&archive_entry("never_written", b"lost", b'0', ""));

    let mut parser = TarParser::new();
    let mut sink = TreeSink::new(dir.path().to_path_buf());
    let err = parser.feed(&archive, &mut sink).unwrap_err();
    assert!(matches!(err, StreamError::Protocol(_)));

    // Everything received before the bad entry stays on disk for diagnosis
    assert_eq!(
        std::fs::read(dir.path().join("kept.conf")).unwrap(),
        b"survives\n"
    );
    assert!(!dir.path().join("never_written").exists());
}

#[test]
fn unpack_rejects_truncated_final_entry() {
    let dir = TempDir::new().unwrap();
    let mut archive = archive_entry("base/1/1249", &[1u8; 4096], b'0', "");
    archive.truncate(BLOCK + 1000);

    std::fs::create_dir_all(dir.path().join("base/1")).unwrap();
    let mut parser = TarParser::new();
    let mut sink = TreeSink::new(dir.path().to_path_buf());
    parser.feed(&archive, &mut sink).unwrap();
    let err = parser.finish().unwrap_err();
    assert!(err.to_string().contains("mid-entry"));
}

#[test]
fn tar_mode_writes_terminated_archives_per_tablespace() {
    // S5 shape: two tablespaces produce base.tar and <oid>.tar, each
    // ending in 1024 zero bytes
    let dir = TempDir::new().unwrap();
    let target = TarTarget::Directory(dir.path().to_path_buf());

    let main = TablespaceInfo {
        oid: None,
        location: None,
        size_kb: Some(64),
    };
    let extra = TablespaceInfo {
        oid: Some(16385),
        location: Some(PathBuf::from("/mnt/fastdisk")),
        size_kb: Some(32),
    };

    let main_payload = cluster_archive();
    let extra_payload = archive_entry("16385/", b"", b'5', "");

    let mut sink = TarFileSink::create(&target, &main, None).unwrap();
    // Feed in COPY-frame-sized pieces; the sink writes through verbatim
    for chunk in main_payload.chunks(4096) {
        sink.write(chunk).unwrap();
    }
    sink.close().unwrap();

    let mut sink = TarFileSink::create(&target, &extra, None).unwrap();
    sink.write(&extra_payload).unwrap();
    sink.close().unwrap();

    let base = std::fs::read(dir.path().join("base.tar")).unwrap();
    let spc = std::fs::read(dir.path().join("16385.tar")).unwrap();

    assert_eq!(base.len(), main_payload.len() + 1024);
    assert_eq!(spc.len(), extra_payload.len() + 1024);
    assert!(base[main_payload.len()..].iter().all(|&b| b == 0));
    assert!(spc[extra_payload.len()..].iter().all(|&b| b == 0));

    // Total bytes written = sum of payloads + 2048
    assert_eq!(
        base.len() + spc.len(),
        main_payload.len() + extra_payload.len() + 2048
    );
}

#[test]
fn tar_mode_gzip_output_decompresses_to_plain_archive() {
    let dir = TempDir::new().unwrap();
    let target = TarTarget::Directory(dir.path().to_path_buf());
    let main = TablespaceInfo {
        oid: None,
        location: None,
        size_kb: None,
    };

    let payload = cluster_archive();
    let mut sink = TarFileSink::create(&target, &main, Some(9)).unwrap();
    sink.write(&payload).unwrap();
    sink.close().unwrap();

    let file = std::fs::File::open(dir.path().join("base.tar.gz")).unwrap();
    let mut decompressed = Vec::new();
    flate2::read::GzDecoder::new(file)
        .read_to_end(&mut decompressed)
        .unwrap();
    assert_eq!(decompressed.len(), payload.len() + 1024);
    assert_eq!(&decompressed[..payload.len()], &payload[..]);
}

#[test]
fn engine_config_conflicts_surface_before_connecting() {
    let err = BaseBackupEngine::new(BaseBackupConfig {
        label: "bad".into(),
        progress: false,
        fast_checkpoint: false,
        nowait: false,
        include_wal: false,
        mode: BackupMode::Tar {
            target: TarTarget::Stdout,
            gzip_level: Some(6),
        },
    })
    .err()
    .expect("gzip to stdout must be rejected");
    assert!(err.is_config());
}
