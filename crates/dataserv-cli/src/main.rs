//! Data server command-line entry point (§6, §10.1, §10.3). Parses CLI
//! flags, installs a `tracing-subscriber` `fmt` layer (optionally a rolling
//! file sink via `tracing-appender`), binds the listener, and runs the
//! reactor until SIGINT/SIGTERM requests an orderly shutdown.

use std::{
    path::PathBuf,
    process::ExitCode,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use clap::{Parser, ValueEnum};
use dataserv_core::{DEFAULT_PORT, Server};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Verbosity {
    Debug,
    Info,
    Warning,
    Error,
}

impl Verbosity {
    fn filter_str(self) -> &'static str {
        match self {
            Verbosity::Debug => "debug",
            Verbosity::Info => "info",
            Verbosity::Warning => "warn",
            Verbosity::Error => "error",
        }
    }
}

/// Data server: length-prefixed, mio-driven dataset broker.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind the listener on. The service has no authentication
    /// (§1 non-goal), so this defaults to localhost rather than all
    /// interfaces; pass e.g. `0.0.0.0` to expose it on the network.
    #[arg(short = 'b', long = "host", default_value = "localhost")]
    host: String,

    /// TCP port to listen on.
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Write logs to this file (or, if it names an existing directory, a
    /// timestamped file created inside it).
    #[arg(short, long)]
    log: Option<PathBuf>,

    /// Minimum log level.
    #[arg(short, long, value_enum, default_value_t = Verbosity::Info)]
    verbosity: Verbosity,

    /// Suppress stdout logging. A log file, if given via `-l`, is still
    /// written - unlike the reference implementation, which this disables
    /// entirely (documented deviation, see DESIGN.md).
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    // `_guard` must stay alive for the life of the process: dropping it
    // flushes and stops the background file-writer thread.
    let _guard = init_logging(&args);

    let addr = match resolve_bind_addr(&args.host, args.port) {
        Ok(addr) => addr,
        Err(err) => {
            error!(host = %args.host, %err, "couldn't resolve bind address");
            return ExitCode::FAILURE;
        }
    };
    let server = match Server::bind(addr) {
        Ok(server) => server,
        Err(err) => {
            error!(%addr, %err, "failed to bind data server");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    install_signal_handlers(&shutdown);

    info!(%addr, "data server starting");
    server.run(&shutdown);
    info!("data server stopped cleanly");
    ExitCode::SUCCESS
}

/// Installs the `tracing-subscriber` layers per §10.1. Returns the
/// `tracing-appender` guard, if a file sink was configured.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = EnvFilter::try_new(args.verbosity.filter_str()).unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer_and_guard = args.log.as_ref().map(|path| {
        let (dir, prefix) = split_log_path(path);
        let appender = tracing_appender::rolling::never(dir, prefix);
        tracing_appender::non_blocking(appender)
    });

    let (file_writer, guard) = match file_layer_and_guard {
        Some((writer, guard)) => (Some(writer), Some(guard)),
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(env_filter);

    match (args.quiet, file_writer) {
        (false, Some(writer)) => {
            registry.with(fmt::layer()).with(fmt::layer().with_writer(writer).with_ansi(false)).init();
        }
        (true, Some(writer)) => {
            registry.with(fmt::layer().with_writer(writer).with_ansi(false)).init();
        }
        (false, None) => {
            registry.with(fmt::layer()).init();
        }
        (true, None) => {
            // Nothing requested: no subscriber installed, matching the
            // reference's behavior when quiet is set and no log path given.
        }
    }

    guard
}

/// Resolves `-b/--host` (a hostname or literal address) plus the port into a
/// bindable [`SocketAddr`], matching the reference's `(addr, port)` pair
/// passed straight to its listener setup.
fn resolve_bind_addr(host: &str, port: u16) -> std::io::Result<std::net::SocketAddr> {
    use std::net::ToSocketAddrs;
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| std::io::Error::other(format!("no address found for host {host:?}")))
}

fn install_signal_handlers(shutdown: &Arc<AtomicBool>) {
    let shutdown = shutdown.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        info!("received shutdown signal");
        shutdown.store(true, Ordering::Relaxed);
    }) {
        error!(%err, "failed to install signal handler, SIGINT/SIGTERM will not shut down cleanly");
    }
}

/// Splits a `-l/--log` argument into the directory `tracing_appender`
/// should write into and the file-name prefix within it: if `path` already
/// names an existing directory, files land inside it under a `dataserv`
/// prefix (mirroring the reference CLI's "log dir gets a timestamped file"
/// behavior); otherwise `path`'s parent/file-name are split directly.
fn split_log_path(path: &std::path::Path) -> (PathBuf, String) {
    if path.is_dir() {
        (path.to_path_buf(), "dataserv".to_string())
    } else {
        (
            path.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from(".")),
            path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "dataserv.log".into()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_bind_addr_defaults_to_loopback() {
        let addr = resolve_bind_addr("localhost", 0).unwrap();
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn resolve_bind_addr_accepts_a_literal_address() {
        let addr = resolve_bind_addr("0.0.0.0", 30000).unwrap();
        assert_eq!(addr.ip(), std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
        assert_eq!(addr.port(), 30000);
    }

    #[test]
    fn split_log_path_uses_dataserv_prefix_for_an_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let (split_dir, prefix) = split_log_path(dir.path());
        assert_eq!(split_dir, dir.path());
        assert_eq!(prefix, "dataserv");
    }

    #[test]
    fn split_log_path_splits_a_plain_file_path() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("server.log");
        let (split_dir, prefix) = split_log_path(&file_path);
        assert_eq!(split_dir, dir.path());
        assert_eq!(prefix, "server.log");
    }
}
