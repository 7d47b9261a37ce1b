//! Configuration resolution for rconsole.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`rconsole/settings.json` in the platform config dir)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables (`RCONSOLE_*`)
//! 5. CLI arguments (applied by the binary, highest priority)
//!
//! Settings files may be partial: each layer is deep-merged into the JSON
//! form of the previous one, so a file that only sets `relay.poll_interval_ms`
//! leaves every other value alone.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};

/// Port the relay listens on when nothing else is configured.
pub const DEFAULT_PORT: u16 = 9999;

/// Complete rconsole configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub shell: ShellSettings,
    #[serde(default)]
    pub relay: RelaySettings,
}

/// Listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    /// Maximum concurrently relayed peers; extra peers are disconnected.
    pub max_sessions: usize,
    /// Accept a single peer, relay it, then exit.
    pub once: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            max_sessions: 4,
            once: false,
        }
    }
}

/// The command interpreter spawned for each session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellSettings {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Put the shell in its own process group, away from the host terminal.
    pub detach: bool,
}

impl Default for ShellSettings {
    fn default() -> Self {
        Self {
            program: default_shell(),
            args: Vec::new(),
            detach: true,
        }
    }
}

/// Pump loop tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub poll_interval_ms: u64,
    pub read_chunk_bytes: usize,
    pub terminate_timeout_secs: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            read_chunk_bytes: 4096,
            terminate_timeout_secs: 5,
        }
    }
}

impl RelaySettings {
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub const fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.terminate_timeout_secs)
    }
}

impl Config {
    /// Reject values the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.max_sessions == 0 {
            return Err(Error::Config("server.max_sessions must be at least 1".into()));
        }
        if self.shell.program.as_os_str().is_empty() {
            return Err(Error::Config("shell.program must not be empty".into()));
        }
        if self.relay.poll_interval_ms == 0 {
            return Err(Error::Config("relay.poll_interval_ms must be at least 1".into()));
        }
        if self.relay.read_chunk_bytes == 0 {
            return Err(Error::Config("relay.read_chunk_bytes must be at least 1".into()));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
///
/// `explicit` is an additional settings file that must exist when given.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            merge_values(&mut merged, read_config_value(&global_path)?);
            debug!(path = %global_path.display(), "Loaded global settings");
        }
    }

    if let Some(path) = explicit {
        merge_values(&mut merged, read_config_value(path)?);
        debug!(path = %path.display(), "Loaded explicit settings");
    }

    let mut config: Config = serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("rconsole").join("settings.json"))
}

fn default_shell() -> PathBuf {
    std::env::var_os("SHELL")
        .filter(|s| !s.is_empty())
        .map_or_else(|| PathBuf::from("/bin/sh"), PathBuf::from)
}

fn read_config_value(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Deep-merge `overlay` into `base`: objects merge key by key, anything
/// else replaces.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Apply `RCONSOLE_*` overrides. Unparseable values are ignored.
///
/// This is the only place settings are read from the environment; the
/// daemon's flags carry no env fallbacks of their own.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(addr) = lookup("RCONSOLE_ADDR").and_then(|v| v.parse().ok()) {
        config.server.addr = addr;
    }
    if let Some(n) = lookup("RCONSOLE_MAX_SESSIONS").and_then(|v| v.parse().ok()) {
        config.server.max_sessions = n;
    }
    if let Some(once) = lookup("RCONSOLE_ONCE").and_then(|v| parse_bool(&v)) {
        config.server.once = once;
    }
    if let Some(program) = lookup("RCONSOLE_SHELL").filter(|v| !v.is_empty()) {
        config.shell.program = PathBuf::from(program);
    }
    if let Some(args) = lookup("RCONSOLE_SHELL_ARGS") {
        config.shell.args = args
            .split(',')
            .filter(|arg| !arg.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(no_detach) = lookup("RCONSOLE_NO_DETACH").and_then(|v| parse_bool(&v)) {
        config.shell.detach = !no_detach;
    }
    if let Some(ms) = lookup("RCONSOLE_POLL_INTERVAL_MS").and_then(|v| v.parse().ok()) {
        config.relay.poll_interval_ms = ms;
    }
    if let Some(secs) = lookup("RCONSOLE_TERMINATE_TIMEOUT").and_then(|v| v.parse().ok()) {
        config.relay.terminate_timeout_secs = secs;
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
