//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

use rconsole_core::config::DEFAULT_PORT;

use crate::channel::{DEFAULT_TERMINATE_TIMEOUT, ShellCommand};
use crate::relay::RelayConfig;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP bind address.
    pub addr: SocketAddr,

    /// Maximum concurrent sessions; peers beyond it are disconnected.
    pub max_sessions: usize,

    /// Serve exactly one peer, then stop accepting.
    pub once: bool,

    /// What each session spawns and how it relays.
    pub session: SessionSettings,
}

/// Per-session settings handed to every blocking session worker.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub shell: ShellCommand,
    /// Spawn the shell in its own process group.
    pub detach: bool,
    pub relay: RelayConfig,
    pub terminate_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            shell: ShellCommand::new("/bin/sh"),
            detach: true,
            relay: RelayConfig::default(),
            terminate_timeout: DEFAULT_TERMINATE_TIMEOUT,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            max_sessions: 4,
            once: false,
            session: SessionSettings::default(),
        }
    }
}

impl ServerConfig {
    /// Create a new server config listening on `addr`.
    pub fn tcp(addr: SocketAddr) -> Self {
        Self {
            addr,
            ..Default::default()
        }
    }

    /// Build from resolved settings.
    pub fn from_settings(config: &rconsole_core::Config) -> Self {
        let mut shell = ShellCommand::new(config.shell.program.clone());
        shell.args.clone_from(&config.shell.args);
        Self {
            addr: config.server.addr,
            max_sessions: config.server.max_sessions,
            once: config.server.once,
            session: SessionSettings {
                shell,
                detach: config.shell.detach,
                relay: RelayConfig {
                    poll_interval: config.relay.poll_interval(),
                    read_chunk: config.relay.read_chunk_bytes,
                    ..RelayConfig::default()
                },
                terminate_timeout: config.relay.terminate_timeout(),
            },
        }
    }

    /// Set max sessions.
    #[must_use]
    pub const fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    /// Serve a single peer.
    #[must_use]
    pub const fn with_once(mut self, once: bool) -> Self {
        self.once = once;
        self
    }

    #[must_use]
    pub fn with_shell(mut self, shell: ShellCommand) -> Self {
        self.session.shell = shell;
        self
    }

    #[must_use]
    pub const fn with_relay(mut self, relay: RelayConfig) -> Self {
        self.session.relay = relay;
        self
    }
}
