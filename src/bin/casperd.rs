//! casper daemon - TCP relay with log streaming
//!
//! Detaches into the background, then relays length-prefixed messages
//! between connected clients and streams the daemon log to all of them.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon with profile "casper" from casper.toml
//! casperd -c casper.toml -n casper
//!
//! # Stay attached to the terminal
//! casperd -c casper.toml -n casper -f
//!
//! # Stop it
//! kill -TERM "$(cat ~/.local/state/casper/casperd.pid)"
//! ```

use std::fs::File;
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::process::{self, ExitCode};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use casperd::config::Config;
use casperd::daemon::{
    detach, open_log, remove_pid_file, running_pid, write_pid_file, DetachOptions,
};
use casperd::server::DaemonServer;

/// casper daemon - relays messages between TCP clients
#[derive(Parser, Debug)]
#[command(name = "casperd", version, about)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: PathBuf,

    /// Profile to use from the configuration file
    #[arg(short = 'n', long = "name", value_name = "NAME")]
    name: String,

    /// Stay in the foreground instead of detaching
    #[arg(short = 'f', long)]
    foreground: bool,
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            // help and version are not failures
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match start(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("casperd: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn start(args: Args) -> Result<()> {
    let config = Config::load(&args.config, &args.name)
        .with_context(|| format!("Failed to load configuration '{}'", args.name))?;

    if let Some(pid) = running_pid(&config.pid_file) {
        bail!(
            "Daemon is already running (PID {pid}, pid file {})",
            config.pid_file.display()
        );
    }

    let log = config.log_path.as_deref().map(open_log).transpose()?;

    // A detached daemon logs through its redirected stdout; in the
    // foreground the subscriber writes to the log file directly.
    let foreground_log = if args.foreground {
        write_pid_file(&config.pid_file)?;
        log
    } else {
        detach(DetachOptions {
            work_dir: config.work_dir.clone(),
            pid_file: config.pid_file.clone(),
            log,
        })?;
        None
    };

    let result = run_daemon(&config, foreground_log, !args.foreground);

    remove_pid_file(&config.pid_file);

    result
}

#[tokio::main(flavor = "current_thread")]
async fn run_daemon(config: &Config, log: Option<File>, detached: bool) -> Result<()> {
    let level = config.log_level;
    let ansi = log.is_none() && !detached && io::stdout().is_terminal();
    let writer = match log {
        Some(file) => BoxMakeWriter::new(Mutex::new(file)),
        None => BoxMakeWriter::new(io::stdout),
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("casperd={level}").parse()?)
                .add_directive(format!("casper_protocol={level}").parse()?),
        )
        .with_writer(writer)
        .with_ansi(ansi)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        port = config.port,
        "casper daemon starting"
    );

    let cancel_token = CancellationToken::new();

    // Installed before the listener exists so an early SIGTERM is never fatal
    let signals = shutdown_signals().context("Failed to install signal handlers")?;
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal(signals).await;
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let server = DaemonServer::bind(config.server_config(), cancel_token)
        .await
        .context("Failed to start server")?;

    match server.run().await {
        Ok(report) => {
            info!(closed = report.closed, "casper daemon stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Server error");
            Err(e.into())
        }
    }
}

fn shutdown_signals() -> Result<(Signal, Signal)> {
    Ok((
        signal(SignalKind::terminate())?,
        signal(SignalKind::interrupt())?,
    ))
}

async fn wait_for_shutdown_signal((mut sigterm, mut sigint): (Signal, Signal)) {
    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }
}
