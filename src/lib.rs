//! Orchestrates startup of the multi-server SMTP receiver: loads
//! configuration, builds the `Daemon`, starts every enabled listener, and
//! waits for a shutdown signal.
//!
//! `MailLaser`'s `run()` drove one SMTP server and one health-check server
//! under a single `select!`. This generalizes that "run until a signal or
//! a fatal task error" shape to a daemon that can own any number of
//! listeners and reload them independently.

pub mod address;
pub mod backend;
pub mod bus;
pub mod config;
pub mod daemon;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod pidfile;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod session;
pub mod tls;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use config::AppConfig;
use daemon::Daemon;

/// Loads `config_path`, builds the daemon, starts every enabled server,
/// and blocks until `SIGINT`/`SIGTERM` requests a graceful shutdown.
/// `pid_file_override` takes precedence over the config document's
/// `pid_file` field; `verbose` forces debug-level logging regardless of
/// the configured log level.
pub async fn run(
    config_path: impl AsRef<Path>,
    pid_file_override: Option<String>,
    verbose: bool,
) -> Result<()> {
    let mut config = AppConfig::from_file(config_path)?;
    if verbose {
        config.log_level = config::LogLevel::Debug;
    }
    if let Some(pid_file) = pid_file_override {
        config.pid_file = pid_file;
    }

    log::info!(
        "starting {} v{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let daemon = Daemon::new(config)?;
    daemon.start().await?;

    wait_for_shutdown_signal().await;
    log::info!("shutdown signal received, draining active sessions");
    daemon.shutdown().await?;
    Ok(())
}

/// Resolves once `SIGINT` (Ctrl-C) or, on Unix, `SIGTERM` is received.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Forces a config reload from disk, for an externally triggered reload
/// (e.g. `SIGHUP` wired up by a caller).
pub async fn reload_from_file(daemon: &Arc<Daemon>, config_path: impl AsRef<Path>) -> Result<()> {
    let new_config = AppConfig::from_file(config_path)?;
    daemon.reload_config(new_config)?;
    Ok(())
}
