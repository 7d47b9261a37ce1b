//! rconsole Daemon
//!
//! Listens for TCP peers and relays each one to the stdin/stdout of a freshly
//! spawned command interpreter.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::{info, warn};

use rconsole_core::tracing_init::{LogFormat, init_tracing};
use rconsole_daemon::server::{RelayServer, ServerConfig};

// Settings flags have no env fallbacks here: `RCONSOLE_ADDR` and friends are
// applied by the config layer, and these flags override the result.
#[derive(Parser, Debug)]
#[command(name = "rconsole-daemon")]
#[command(version, about = "rconsole daemon - remote shell over a raw TCP stream")]
struct Args {
    /// TCP bind address
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Command interpreter to spawn for each peer (default: $SHELL or /bin/sh)
    #[arg(long)]
    shell: Option<PathBuf>,

    /// Argument passed to the shell; repeat for several
    #[arg(long = "shell-arg", allow_hyphen_values = true)]
    shell_args: Vec<String>,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Serve a single peer, then exit
    #[arg(long)]
    once: bool,

    /// Keep the shell in the daemon's process group
    #[arg(long)]
    no_detach: bool,

    /// Idle polling interval of the pump loops, in milliseconds
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Seconds to wait for a killed shell to be reaped
    #[arg(long)]
    terminate_timeout: Option<u64>,

    /// Extra settings file layered over the global one
    #[arg(long, env = "RCONSOLE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "RCONSOLE_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "RCONSOLE_LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// CLI flags win over every other configuration layer.
    fn apply(&self, config: &mut rconsole_core::Config) {
        if let Some(addr) = self.addr {
            config.server.addr = addr;
        }
        if let Some(shell) = &self.shell {
            config.shell.program.clone_from(shell);
        }
        if !self.shell_args.is_empty() {
            config.shell.args.clone_from(&self.shell_args);
        }
        if let Some(max) = self.max_sessions {
            config.server.max_sessions = max;
        }
        if self.once {
            config.server.once = true;
        }
        if self.no_detach {
            config.shell.detach = false;
        }
        if let Some(ms) = self.poll_interval_ms {
            config.relay.poll_interval_ms = ms;
        }
        if let Some(secs) = self.terminate_timeout {
            config.relay.terminate_timeout_secs = secs;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_filter = format!("rconsole_daemon={}", args.log_level);
    init_tracing(&log_filter, LogFormat::from_json_flag(args.log_json))?;

    let mut settings = rconsole_core::config::load_config(args.config.as_deref())?;
    args.apply(&mut settings);
    settings.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %settings.server.addr,
        shell = %settings.shell.program.display(),
        once = settings.server.once,
        "Starting rconsole-daemon"
    );

    let server = RelayServer::bind(ServerConfig::from_settings(&settings)).await?;
    let addr = server.local_addr()?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut server_task = tokio::spawn(server.run(shutdown_rx));

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // Notify systemd that the daemon is ready to serve (unix only).
    // The `true` parameter unsets $NOTIFY_SOCKET so spawned shells
    // don't accidentally notify systemd.
    #[cfg(unix)]
    if let Err(e) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        warn!(error = %e, "systemd readiness notification failed");
    }

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    info!(%addr, "Relay server ready");

    tokio::select! {
        result = &mut server_task => {
            result??;
            info!("Daemon stopped");
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    server_task.await??;

    info!("Daemon stopped");
    Ok(())
}
