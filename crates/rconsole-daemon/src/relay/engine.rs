//! The two-loop relay between a child process and a connection.
//!
//! `run` starts two scoped threads:
//!
//! ```text
//! loop A: channel stdout --read_stdout--> connection.send
//! loop B: connection.recv --write_stdin--> channel stdin
//! ```
//!
//! Each loop polls the shared [`CancellationFlag`] once per iteration and
//! raises it when it exits for any reason, so the other loop follows within
//! one poll interval, or within `flush_grace` if it is mid-chunk. Every write
//! is non-blocking. Both are joined before `run` returns, which is what lets
//! the engine borrow the channel and connection instead of owning them.

use std::io;
use std::sync::{Mutex, OnceLock, PoisonError};
use std::thread;
use std::time::Instant;

use tracing::{Span, debug, info, trace, warn};

use super::connection::Connection;
use super::types::{
    CancellationFlag, Direction, RelayConfig, RelayError, RelayState, RelaySummary, StopReason,
};
use crate::channel::{ChannelError, ChannelState, ChildProcessChannel};

/// How a single pump loop ended.
#[derive(Debug)]
enum PumpExit {
    Stopped(StopReason),
    Failed(RelayError),
}

#[derive(Debug)]
struct PumpReport {
    exit: PumpExit,
    bytes: u64,
}

/// Raises the flag when a pump loop leaves, unwinding included, so the
/// other loop can never wait on a sibling that died.
struct CancelOnExit<'f>(&'f CancellationFlag);

impl Drop for CancelOnExit<'_> {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Relays one connection to one child process until either side ends.
#[derive(Debug)]
pub struct RelayEngine<'a, C: Connection> {
    channel: &'a ChildProcessChannel,
    connection: &'a C,
    cancel: CancellationFlag,
    config: RelayConfig,
    state: Mutex<RelayState>,
    first_stop: OnceLock<StopReason>,
}

impl<'a, C: Connection> RelayEngine<'a, C> {
    pub fn new(channel: &'a ChildProcessChannel, connection: &'a C) -> Self {
        Self::with_config(channel, connection, RelayConfig::default())
    }

    pub fn with_config(
        channel: &'a ChildProcessChannel,
        connection: &'a C,
        config: RelayConfig,
    ) -> Self {
        Self {
            channel,
            connection,
            cancel: CancellationFlag::new(),
            config,
            state: Mutex::new(RelayState::Idle),
            first_stop: OnceLock::new(),
        }
    }

    /// Use an externally created flag, e.g. one a server registered before
    /// the session started.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> CancellationFlag {
        self.cancel.clone()
    }

    pub fn state(&self) -> RelayState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask both loops to stop. Safe to call from any thread, any number of
    /// times; handles are left for the caller to close after `run` returns.
    pub fn shutdown(&self) {
        if self.cancel.cancel() {
            debug!("Relay shutdown requested");
        }
    }

    /// Run the session to completion. Blocks until both pump loops exit.
    ///
    /// Returns the summary when the session reached `Stopped`, or the first
    /// loop error when it reached `Failed`. May only be called once.
    pub fn run(&self) -> Result<RelaySummary, RelayError> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != RelayState::Idle {
                return Err(RelayError::AlreadyRun);
            }
            if self.channel.state() == ChannelState::NotStarted {
                *state = RelayState::Failed;
                return Err(ChannelError::NotRunning.into());
            }
            *state = RelayState::Running;
        }

        let started = Instant::now();
        debug!(pid = self.channel.pid(), "Relay running");

        let span = Span::current();
        let (outbound, inbound) = thread::scope(|scope| {
            let out_span = span.clone();
            let outbound =
                scope.spawn(move || out_span.in_scope(|| self.pump_process_to_network()));
            let inbound = scope.spawn(|| span.in_scope(|| self.pump_network_to_process()));
            (
                join_report(outbound.join(), Direction::ProcessToPeer),
                join_report(inbound.join(), Direction::PeerToProcess),
            )
        });

        let elapsed = started.elapsed();
        let (bytes_to_peer, bytes_to_process) = (outbound.bytes, inbound.bytes);

        let failure = [outbound.exit, inbound.exit]
            .into_iter()
            .filter_map(|exit| match exit {
                PumpExit::Failed(e) => Some(e),
                PumpExit::Stopped(_) => None,
            })
            .reduce(|first, other| {
                warn!(error = %other, "Additional relay failure");
                first
            });

        if let Some(error) = failure {
            self.set_state(RelayState::Failed);
            warn!(
                error = %error,
                bytes_to_peer,
                bytes_to_process,
                ?elapsed,
                "Relay session failed"
            );
            return Err(error);
        }

        let stop_reason = self.first_stop.get().copied().unwrap_or(StopReason::Cancelled);
        self.set_state(RelayState::Stopped);
        info!(
            ?stop_reason,
            bytes_to_peer,
            bytes_to_process,
            ?elapsed,
            "Relay session stopped"
        );
        Ok(RelaySummary {
            stop_reason,
            bytes_to_peer,
            bytes_to_process,
            elapsed,
        })
    }

    fn set_state(&self, next: RelayState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// Record why a loop ended and wake the other one.
    fn finish(&self, exit: PumpExit, bytes: u64) -> PumpReport {
        if let PumpExit::Stopped(reason) = exit {
            let _ = self.first_stop.set(reason);
        }
        self.cancel.cancel();
        PumpReport { exit, bytes }
    }

    /// Loop A: child output to the peer.
    fn pump_process_to_network(&self) -> PumpReport {
        let _guard = CancelOnExit(&self.cancel);
        let mut sent: u64 = 0;
        let exit = loop {
            if self.cancel.is_cancelled() {
                break PumpExit::Stopped(StopReason::Cancelled);
            }

            let chunk = match self.channel.read_stdout(self.config.read_chunk) {
                Ok(chunk) => chunk,
                Err(e) => break PumpExit::Failed(e.into()),
            };

            if chunk.is_empty() {
                if !self.channel.is_running() {
                    // Output may have landed between the peek and the
                    // liveness check; drain it before calling it done.
                    match self.channel.bytes_available() {
                        Ok(0) => break PumpExit::Stopped(StopReason::ProcessExited),
                        Ok(_) => continue,
                        Err(e) => break PumpExit::Failed(e.into()),
                    }
                }
                thread::sleep(self.config.poll_interval);
                continue;
            }

            let delivery = self.deliver(&chunk, |bytes| self.connection.send(bytes));
            sent += delivery.written as u64;
            match delivery.outcome {
                Outcome::Complete => trace!(bytes = chunk.len(), "process -> peer"),
                Outcome::Abandoned => break PumpExit::Stopped(StopReason::Cancelled),
                Outcome::Failed(source) => {
                    break PumpExit::Failed(RelayError::Io {
                        direction: Direction::ProcessToPeer,
                        source,
                    });
                }
            }
        };

        if let PumpExit::Failed(e) = &exit {
            warn!(error = %e, "Process-to-peer loop failed");
        } else {
            debug!(?exit, sent, "Process-to-peer loop finished");
        }
        self.finish(exit, sent)
    }

    /// Loop B: peer input to the child.
    fn pump_network_to_process(&self) -> PumpReport {
        let _guard = CancelOnExit(&self.cancel);
        if let Err(source) = self.connection.set_nonblocking(true) {
            let exit = PumpExit::Failed(RelayError::Io {
                direction: Direction::PeerToProcess,
                source,
            });
            return self.finish(exit, 0);
        }

        let mut buf = vec![0u8; self.config.read_chunk.max(1)];
        let mut received: u64 = 0;
        let exit = loop {
            if self.cancel.is_cancelled() {
                break PumpExit::Stopped(StopReason::Cancelled);
            }

            match self.connection.recv(&mut buf) {
                Ok(0) => break PumpExit::Stopped(StopReason::PeerClosed),
                Ok(n) => {
                    let delivery = self.deliver(&buf[..n], |bytes| {
                        self.channel.write_stdin(bytes).map_err(io::Error::from)
                    });
                    received += delivery.written as u64;
                    match delivery.outcome {
                        Outcome::Complete => trace!(bytes = n, "peer -> process"),
                        Outcome::Abandoned => break PumpExit::Stopped(StopReason::Cancelled),
                        // The child is gone; that ends the session normally.
                        Outcome::Failed(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                            break PumpExit::Stopped(StopReason::ProcessExited);
                        }
                        Outcome::Failed(source) => {
                            break PumpExit::Failed(RelayError::Io {
                                direction: Direction::PeerToProcess,
                                source,
                            });
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(self.config.poll_interval);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(source) => {
                    break PumpExit::Failed(RelayError::Io {
                        direction: Direction::PeerToProcess,
                        source,
                    });
                }
            }
        };

        if let PumpExit::Failed(e) = &exit {
            warn!(error = %e, "Peer-to-process loop failed");
        } else {
            debug!(?exit, received, "Peer-to-process loop finished");
        }
        self.finish(exit, received)
    }

    /// Push all of `bytes` through a non-blocking `write`, sleeping one poll
    /// interval per `WouldBlock`.
    ///
    /// Cancellation does not cut a chunk short right away: the loop keeps
    /// trying for `flush_grace`, then drops whatever is left.
    fn deliver<W>(&self, bytes: &[u8], mut write: W) -> Delivery
    where
        W: FnMut(&[u8]) -> io::Result<usize>,
    {
        let mut remaining = bytes;
        let mut give_up_at: Option<Instant> = None;
        let outcome = loop {
            if remaining.is_empty() {
                break Outcome::Complete;
            }
            match write(remaining) {
                Ok(0) => break Outcome::Failed(io::ErrorKind::WriteZero.into()),
                Ok(n) => remaining = &remaining[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if self.cancel.is_cancelled() {
                        let deadline = *give_up_at
                            .get_or_insert_with(|| Instant::now() + self.config.flush_grace);
                        if Instant::now() >= deadline {
                            warn!(
                                dropped = remaining.len(),
                                "Abandoning partially delivered chunk after cancellation"
                            );
                            break Outcome::Abandoned;
                        }
                    }
                    thread::sleep(self.config.poll_interval);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => break Outcome::Failed(e),
            }
        };
        Delivery {
            written: bytes.len() - remaining.len(),
            outcome,
        }
    }
}

#[derive(Debug)]
enum Outcome {
    Complete,
    /// Cancelled and still blocked once the flush grace ran out.
    Abandoned,
    Failed(io::Error),
}

#[derive(Debug)]
struct Delivery {
    written: usize,
    outcome: Outcome,
}

fn join_report(joined: thread::Result<PumpReport>, direction: Direction) -> PumpReport {
    joined.unwrap_or_else(|_| PumpReport {
        exit: PumpExit::Failed(RelayError::PumpPanicked { direction }),
        bytes: 0,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    /// Accepts one byte per `send`, after refusing the first `stalls` calls.
    #[derive(Debug, Default)]
    struct TrickleConnection {
        stalls: AtomicUsize,
        stuck: bool,
        accepted: Mutex<Vec<u8>>,
    }

    impl TrickleConnection {
        fn stalling(stalls: usize) -> Self {
            Self {
                stalls: AtomicUsize::new(stalls),
                ..Self::default()
            }
        }

        fn stuck() -> Self {
            Self {
                stuck: true,
                ..Self::default()
            }
        }

        fn accepted(&self) -> Vec<u8> {
            self.accepted.lock().unwrap().clone()
        }
    }

    impl Connection for TrickleConnection {
        fn set_nonblocking(&self, _nonblocking: bool) -> io::Result<()> {
            Ok(())
        }

        fn recv(&self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        }

        fn send(&self, buf: &[u8]) -> io::Result<usize> {
            if self.stuck {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let stalled = self
                .stalls
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_ok();
            if stalled {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.accepted.lock().unwrap().push(buf[0]);
            Ok(1)
        }

        fn shutdown(&self) -> io::Result<()> {
            Ok(())
        }
    }

    fn config(flush_grace: Duration) -> RelayConfig {
        RelayConfig {
            poll_interval: Duration::from_millis(1),
            read_chunk: 4096,
            flush_grace,
        }
    }

    #[test]
    fn delivery_waits_out_would_block() {
        let channel = ChildProcessChannel::new();
        let conn = TrickleConnection::stalling(5);
        let engine = RelayEngine::with_config(&channel, &conn, config(Duration::from_secs(1)));

        let delivery = engine.deliver(b"abc", |bytes| conn.send(bytes));
        assert!(matches!(delivery.outcome, Outcome::Complete));
        assert_eq!(delivery.written, 3);
        assert_eq!(conn.accepted(), b"abc");
    }

    #[test]
    fn cancelled_delivery_still_finishes_its_chunk() {
        let channel = ChildProcessChannel::new();
        let conn = TrickleConnection::stalling(3);
        let engine = RelayEngine::with_config(&channel, &conn, config(Duration::from_secs(1)));
        engine.shutdown();

        let delivery = engine.deliver(b"hello", |bytes| conn.send(bytes));
        assert!(matches!(delivery.outcome, Outcome::Complete));
        assert_eq!(delivery.written, 5);
        assert_eq!(conn.accepted(), b"hello");
    }

    #[test]
    fn stuck_delivery_is_abandoned_after_grace() {
        let channel = ChildProcessChannel::new();
        let conn = TrickleConnection::stuck();
        let grace = Duration::from_millis(30);
        let engine = RelayEngine::with_config(&channel, &conn, config(grace));
        engine.shutdown();

        let begin = Instant::now();
        let delivery = engine.deliver(b"never", |bytes| conn.send(bytes));
        let elapsed = begin.elapsed();

        assert!(matches!(delivery.outcome, Outcome::Abandoned));
        assert_eq!(delivery.written, 0);
        assert!(elapsed >= grace);
        assert!(elapsed < Duration::from_secs(1), "took {elapsed:?}");
    }

    #[test]
    fn hard_errors_end_delivery() {
        let channel = ChildProcessChannel::new();
        let conn = TrickleConnection::default();
        let engine = RelayEngine::with_config(&channel, &conn, config(Duration::from_secs(1)));

        let delivery = engine.deliver(b"x", |_| Err(io::ErrorKind::BrokenPipe.into()));
        assert!(matches!(
            delivery.outcome,
            Outcome::Failed(e) if e.kind() == io::ErrorKind::BrokenPipe
        ));
    }
}
