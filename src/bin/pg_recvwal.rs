//! Receive streaming write-ahead log and write it to local segment files.
//!
//! Connects to a PostgreSQL server in replication mode, figures out where
//! to resume from the contents of the target directory, and follows the
//! WAL stream until interrupted. Completed segments are fsync'd and
//! leftover partial files from earlier runs are cleaned up as streaming
//! overtakes them.

use clap::Parser;
use pg_streamrecv::{
    PartialCleanupHook, PgReplicationConnection, Result, StreamError, WalStreamConfig,
    WalStreamEngine,
};
use std::io::BufRead;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

// -h is the server host, as in every PostgreSQL client; help keeps only
// its long form
#[derive(Debug, Parser)]
#[command(
    name = "pg_recvwal",
    version,
    about = "receives PostgreSQL streaming write-ahead logs",
    disable_help_flag = true
)]
struct Args {
    /// receive WAL segment files into this directory
    #[arg(short = 'D', long = "dir", value_name = "DIR")]
    dir: PathBuf,

    /// output verbose messages
    #[arg(short, long)]
    verbose: bool,

    #[command(flatten)]
    connection: ConnectionOptions,

    /// show this help, then exit
    #[arg(long, action = clap::ArgAction::Help)]
    help: Option<bool>,
}

/// Connection flags shared with pg_recvbase. Anything not given here is
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

async fn stream_log(args: &Args, cancellation_token: &CancellationToken) -> Result<()> {
    let conninfo = args.connection.build_conninfo()?;
    let mut conn = PgReplicationConnection::connect(&conninfo)?;

    let config = WalStreamConfig {
        basedir: args.dir.clone(),
        rename_partial: false,
        standby_timeout: None,
    };
    let hook = PartialCleanupHook::new(args.dir.clone());
    let mut engine = WalStreamEngine::new(config, hook);

    let last = engine.run(&mut conn, cancellation_token).await?;
    info!(
        "log streaming ended at {}",
        pg_streamrecv::format_lsn(last)
    );
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
            info!("received interrupt, stopping after the current frame");
            signal_token.cancel();
        }
    });

    match stream_log(&args, &cancellation_token).await {
        Ok(()) => {}
        Err(e) if e.is_cancelled() => {
            info!("stopped");
        }
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    }
}
