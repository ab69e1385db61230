mod config;
mod error;
mod probe;
mod status;
mod xmpp;

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::error::ErrorKind;
use clap::{Parser, ValueEnum};
use tracing_appender::non_blocking::WorkerGuard;

use config::{parse_duration, Jid, ProbeConfig, Secret};
use status::{Outcome, Status};

/// Monitoring check for XMPP servers.
///
/// Logs in with the given account, sends a message to itself and reports
/// whether it comes back before the timeout.
#[derive(Debug, Parser)]
#[command(name = "check_xmpp", version)]
struct Cli {
    /// XMPP ID, e.g. user@server.tld
    #[arg(long)]
    userid: String,

    /// Password for the XMPP ID
    #[arg(long)]
    password: String,

    /// Time allowed for the whole check (e.g. 5s, 1500ms)
    #[arg(long, value_parser = parse_duration, default_value = "5s")]
    timeout: Duration,

    /// Log to stderr; `--debug=xmpp` also logs stanza traffic
    #[arg(
        long,
        value_enum,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "default",
        value_name = "LEVEL"
    )]
    debug: Option<DebugLevel>,

    /// Connect here instead of resolving SRV records (host, host:port, tcp://host[:port])
    #[arg(long)]
    server: Option<String>,

    /// Accept any server certificate (self-signed test servers only)
    #[arg(long)]
    dangerous_insecure_tls: bool,

    /// Also write logs to this file
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DebugLevel {
    Default,
    Xmpp,
}

/// Stderr layer only with `--debug` or `RUST_LOG`; file layer only with
/// `--log-file`. Without either the check is silent apart from its status line.
fn init_tracing(debug: Option<DebugLevel>, log_file: Option<&Path>) -> Option<WorkerGuard> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let rust_log = std::env::var("RUST_LOG").is_ok();
    let filter = || {
        if rust_log {
            EnvFilter::from_default_env()
        } else if debug == Some(DebugLevel::Xmpp) {
            EnvFilter::new("check_xmpp=debug,check_xmpp::xmpp=trace,warn")
        } else {
            EnvFilter::new("check_xmpp=debug,warn")
        }
    };

    let stderr_layer = if debug.is_some() || rust_log {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(filter()),
        )
    } else {
        None
    };

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path.file_name().unwrap_or(path.as_os_str());
            let appender = tracing_appender::rolling::never(dir, name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();

    guard
}

/// First line of a clap error, without its `error: ` prefix.
fn usage_error(err: &clap::Error) -> String {
    let rendered = err.to_string();
    let first = rendered.lines().next().unwrap_or_default();
    first.strip_prefix("error: ").unwrap_or(first).to_string()
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            e.exit()
        }
        Err(e) => Outcome::new(Status::Unknown, usage_error(&e)).terminate(),
    };

    let log_guard = init_tracing(cli.debug, cli.log_file.as_deref());

    let jid = match Jid::parse(&cli.userid) {
        Ok(jid) => jid,
        Err(e) => Outcome::from(e).terminate(),
    };

    let mut config = ProbeConfig::new(jid, Secret::new(cli.password))
        .with_timeout(cli.timeout)
        .with_insecure_tls(cli.dangerous_insecure_tls);
    if let Some(server) = cli.server {
        config = config.with_server(server);
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        build = env!("GIT_HASH"),
        jid = %config.jid,
        timeout_ms = config.timeout.as_millis() as u64,
        "Starting XMPP check"
    );
    if config.insecure_tls {
        tracing::warn!("Certificate verification is disabled");
    }

    let outcome = probe::run(&config).await;

    // process::exit skips destructors; flush the log file first.
    drop(log_guard);
    outcome.terminate()
}
