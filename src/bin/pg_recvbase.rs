//! Take a base backup of a running PostgreSQL server.
//!
//! Streams the cluster contents over the replication protocol, either as
//! per-tablespace tar archives (`--tardir`, optionally gzip-compressed,
//! `-` for stdout) or unpacked into a directory tree (`--basedir`).

use clap::Parser;
use pg_streamrecv::{
    verify_dir_is_empty_or_create, BackupMode, BaseBackupConfig, BaseBackupEngine,
    PgReplicationConnection, Result, StreamError, TarTarget,
};
use std::io::BufRead;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

// -h is the server host, as in every PostgreSQL client; help keeps only
// its long form
#[derive(Debug, Parser)]
#[command(
    name = "pg_recvbase",
    version,
    about = "takes base backups of running PostgreSQL servers",
    disable_help_flag = true,
    group(clap::ArgGroup::new("output").required(true))
)]
struct Args {
    /// receive base backup into directory (unpacked)
    #[arg(short = 'd', long, value_name = "DIR", group = "output")]
    basedir: Option<PathBuf>,

    /// receive base backup into tar files stored in this directory
    /// ("-" writes a single tar stream to stdout)
    #[arg(short = 't', long, value_name = "DIR", group = "output")]
    tardir: Option<PathBuf>,

    /// gzip compression level for tar output (0 disables compression)
    #[arg(
        short = 'Z',
        long,
        value_name = "0-9",
        default_value_t = 0,
        value_parser = clap::value_parser!(u32).range(0..=9)
    )]
    compress: u32,

    /// set backup label
    #[arg(short, long, value_name = "LABEL", default_value = "pg_recvbase base backup")]
    label: String,

    /// show progress information
    #[arg(short = 'P', long)]
    progress: bool,

    /// output verbose messages
    #[arg(short, long)]
    verbose: bool,

    #[command(flatten)]
    connection: ConnectionOptions,

    /// show this help, then exit
    #[arg(long, action = clap::ArgAction::Help)]
    help: Option<bool>,
}

/// Connection flags shared with pg_recvwal. Anything not given here is
/// picked up by libpq from PGHOST/PGPORT/PGUSER/PGPASSWORD.
#[derive(Debug, clap::Args)]
struct ConnectionOptions {
    /// database server host or socket directory
    #[arg(short = 'h', long, value_name = "HOSTNAME")]
    host: Option<String>,

    /// database server port number
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// connect as specified database user
    #[arg(short = 'U', long, value_name = "NAME")]
    username: Option<String>,

    /// never prompt for password
    #[arg(short = 'w', long = "no-password")]
    no_password: bool,

    /// force password prompt
    #[arg(short = 'W', long = "password", conflicts_with = "no_password")]
    password: bool,
}

/// Quote a value for a keyword=value conninfo pair
fn quote_conninfo_value(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

impl ConnectionOptions {
    fn build_conninfo(&self) -> Result<String> {
        let mut parts = Vec::new();
        if let Some(host) = &self.host {
            parts.push(format!("host={}", quote_conninfo_value(host)));
        }
        if let Some(port) = self.port {
            parts.push(format!("port={port}"));
        }
        if let Some(user) = &self.username {
            parts.push(format!("user={}", quote_conninfo_value(user)));
        }
        if self.password {
            eprint!("Password: ");
            let mut line = String::new();
            std::io::stdin()
                .lock()
                .read_line(&mut line)
                .map_err(StreamError::Io)?;
            parts.push(format!(
                "password={}",
                quote_conninfo_value(line.trim_end_matches(['\r', '\n']))
            ));
        }
        parts.push("dbname=replication replication=true".to_string());
        Ok(parts.join(" "))
    }
}

fn backup_mode(args: &Args) -> Result<BackupMode> {
    let gzip_level = (args.compress > 0).then_some(args.compress);

    match (&args.basedir, &args.tardir) {
        (Some(basedir), None) => {
            if gzip_level.is_some() {
                return Err(StreamError::config(
                    "compression is only supported in tar mode",
                ));
            }
            Ok(BackupMode::Unpack {
                basedir: basedir.clone(),
            })
        }
        (None, Some(tardir)) => {
            let target = if tardir.as_os_str() == "-" {
                TarTarget::Stdout
            } else {
                TarTarget::Directory(tardir.clone())
            };
            Ok(BackupMode::Tar { target, gzip_level })
        }
        // clap's output group guarantees exactly one of the two
        _ => unreachable!("output mode is enforced by the argument parser"),
    }
}

async fn base_backup(args: &Args, cancellation_token: &CancellationToken) -> Result<()> {
    let mode = backup_mode(args)?;

    // The primary target directory is checked before any connection is
    // made; tablespace locations are checked against the server's header
    // row-set later.
    match &mode {
        BackupMode::Unpack { basedir } => verify_dir_is_empty_or_create(basedir)?,
        BackupMode::Tar {
            target: TarTarget::Directory(dir),
            ..
        } => verify_dir_is_empty_or_create(dir)?,
        BackupMode::Tar {
            target: TarTarget::Stdout,
            ..
        } => {}
    }

    let config = BaseBackupConfig {
        label: args.label.clone(),
        progress: args.progress,
        fast_checkpoint: false,
        nowait: false,
        include_wal: false,
        mode,
    };
    let engine = BaseBackupEngine::new(config)?;

    let conninfo = args.connection.build_conninfo()?;
    let mut conn = PgReplicationConnection::connect(&conninfo)?;

    engine.run(&mut conn, cancellation_token).await?;
    info!("base backup completed");
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // Usage problems and --help/--version both land here; only the
            // former is an error exit
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cancellation_token = CancellationToken::new();
    let signal_token = cancellation_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            error!("received interrupt, backup output will be incomplete");
            signal_token.cancel();
        }
    });

    match base_backup(&args, &cancellation_token).await {
        Ok(()) => {}
        Err(e) if e.is_cancelled() => {
            info!("stopped; partial backup output left in place");
        }
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    }
}
