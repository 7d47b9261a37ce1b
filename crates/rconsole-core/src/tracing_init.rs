//! Tracing/logging initialization for rconsole binaries.
//!
//! Installs a `tracing_subscriber` registry with an env-filter and either the
//! human-readable or the JSON formatter.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{Error, Result};

/// Output format of log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    pub const fn from_json_flag(log_json: bool) -> Self {
        if log_json { Self::Json } else { Self::Pretty }
    }
}

/// Build the filter used by [`init_tracing`].
///
/// `RUST_LOG` wins when it is set and parses; otherwise `default_filter`
/// (e.g. `"rconsole_daemon=info"`) is used.
pub fn build_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Install the global tracing subscriber.
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(default_filter: &str, format: LogFormat) -> Result<()> {
    let registry = tracing_subscriber::registry().with(build_filter(default_filter));
    let installed = match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .try_init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init(),
    };
    installed.map_err(|e| Error::Tracing(e.to_string()))
}
