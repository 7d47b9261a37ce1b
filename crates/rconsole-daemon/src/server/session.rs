//! One relay session: spawn the shell, relay, tear everything down.

use std::io;
use std::net::TcpStream;

use tracing::{debug, warn};

use super::config::SessionSettings;
use crate::channel::ChildProcessChannel;
use crate::relay::{CancellationFlag, Connection, RelayEngine, RelayError, RelaySummary};

/// Run a complete session on the calling (blocking) thread.
///
/// The child is terminated and the socket shut down on every exit path,
/// after the engine has joined both pump loops.
pub fn run_session(
    stream: &TcpStream,
    settings: &SessionSettings,
    cancel: CancellationFlag,
) -> Result<RelaySummary, RelayError> {
    let mut channel = ChildProcessChannel::with_terminate_timeout(settings.terminate_timeout);
    let result = match channel.start(&settings.shell, settings.detach) {
        Ok(()) => {
            let engine = RelayEngine::with_config(&channel, stream, settings.relay)
                .with_cancellation(cancel);
            engine.run()
        }
        Err(e) => Err(e.into()),
    };

    if let Err(e) = channel.terminate() {
        warn!(pid = channel.pid(), error = %e, "Failed to terminate session shell");
    }
    match Connection::shutdown(stream) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
        Err(e) => debug!(error = %e, "Socket shutdown failed"),
    }
    result
}
