//! Relay module types.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::channel::ChannelError;

/// Shared stop signal for one relay session. Once cancelled it stays
/// cancelled; clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Returns `true` if this call was the one that raised it.
    pub fn cancel(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Pump loop tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    /// Sleep between polls when a side has nothing to move. Also the
    /// worst-case cancellation latency, plus any in-flight I/O call.
    pub poll_interval: Duration,
    /// Largest chunk moved per read/receive.
    pub read_chunk: usize,
    /// After cancellation, how long a loop keeps trying to finish the chunk
    /// it is delivering before dropping the remainder.
    pub flush_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            read_chunk: 4096,
            flush_grace: Duration::from_millis(500),
        }
    }
}

/// Engine lifecycle: `Idle -> Running -> {Stopped, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Running,
    Stopped,
    Failed,
}

/// Why a session that did not fail came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The peer closed its side of the connection.
    PeerClosed,
    /// The child process exited and its output was drained.
    ProcessExited,
    /// The cancellation flag was raised from outside the pump loops.
    Cancelled,
}

/// Outcome of a session that reached `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySummary {
    pub stop_reason: StopReason,
    pub bytes_to_peer: u64,
    pub bytes_to_process: u64,
    pub elapsed: Duration,
}

/// Direction of the pump loop an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ProcessToPeer,
    PeerToProcess,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProcessToPeer => f.write_str("process->peer"),
            Self::PeerToProcess => f.write_str("peer->process"),
        }
    }
}

/// Errors from relay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Relay session already ran")]
    AlreadyRun,

    #[error("Relay I/O error ({direction}): {source}")]
    Io {
        direction: Direction,
        #[source]
        source: io::Error,
    },

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Pump loop panicked ({direction})")]
    PumpPanicked { direction: Direction },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_monotonic_and_shared() {
        let flag = CancellationFlag::new();
        let observer = flag.clone();
        assert!(!observer.is_cancelled());
        assert!(flag.cancel());
        assert!(!flag.cancel());
        assert!(observer.is_cancelled());
        assert!(flag.is_cancelled());
    }

    #[test]
    fn default_config_values() {
        let config = RelayConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(10));
        assert_eq!(config.read_chunk, 4096);
        assert_eq!(config.flush_grace, Duration::from_millis(500));
    }

    #[test]
    fn direction_shows_in_errors() {
        let err = RelayError::Io {
            direction: Direction::PeerToProcess,
            source: io::ErrorKind::ConnectionReset.into(),
        };
        assert!(err.to_string().contains("peer->process"));
    }
}
