//! TCP acceptor for the rconsole daemon.
//!
//! Accepts peers on a tokio listener and hands each one to a blocking worker
//! that spawns a shell and runs a [`RelayEngine`](crate::relay::RelayEngine)
//! session. Every session gets its own channel and cancellation flag, so
//! sessions are isolated from each other and can be stopped individually or
//! all at once on shutdown.

mod config;
mod session;

pub use config::{ServerConfig, SessionSettings};
pub use session::run_session;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::relay::{CancellationFlag, RelayError};

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

type SessionRegistry = Arc<RwLock<HashMap<Uuid, CancellationFlag>>>;

/// Relay server handle.
#[derive(Debug)]
pub struct RelayServer {
    listener: TcpListener,
    config: ServerConfig,
    sessions: SessionRegistry,
}

impl RelayServer {
    /// Bind the listener. Port 0 picks a free port; see [`Self::local_addr`].
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.addr,
                source,
            })?;
        Ok(Self {
            listener,
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Accept and relay peers until `shutdown` flips (or its sender is
    /// dropped), or, in once mode, until the single session ends.
    ///
    /// On shutdown every active session is cancelled and awaited.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ServerError> {
        let local_addr = self.local_addr()?;
        info!(
            addr = %local_addr,
            max_sessions = self.config.max_sessions,
            once = self.config.once,
            shell = %self.config.session.shell.display(),
            "Relay server accepting"
        );

        let mut tasks = JoinSet::new();
        let mut shutdown_requested = false;

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };

                    if self.active_sessions().await >= self.config.max_sessions {
                        warn!(%peer, max = self.config.max_sessions, "Session limit reached, rejecting peer");
                        drop(stream);
                        continue;
                    }

                    let stream = match stream.into_std() {
                        Ok(stream) => stream,
                        Err(e) => {
                            warn!(%peer, error = %e, "Failed to detach peer socket");
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nonblocking(false) {
                        warn!(%peer, error = %e, "Failed to configure peer socket");
                        continue;
                    }

                    self.spawn_session(&mut tasks, stream, peer).await;

                    if self.config.once {
                        debug!("Once mode: no further peers will be accepted");
                        break;
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    log_join(joined);
                }
                _ = shutdown.changed(), if !shutdown_requested => {
                    info!("Relay server shutting down");
                    shutdown_requested = true;
                    self.cancel_all().await;
                    break;
                }
            }
        }

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(joined) => log_join(joined),
                    None => break,
                },
                _ = shutdown.changed(), if !shutdown_requested => {
                    info!("Shutdown requested, cancelling remaining sessions");
                    shutdown_requested = true;
                    self.cancel_all().await;
                }
            }
        }

        info!("Relay server stopped");
        Ok(())
    }

    async fn spawn_session(
        &self,
        tasks: &mut JoinSet<()>,
        stream: std::net::TcpStream,
        peer: SocketAddr,
    ) {
        let session_id = Uuid::new_v4();
        let cancel = CancellationFlag::new();
        self.sessions
            .write()
            .await
            .insert(session_id, cancel.clone());

        let settings = self.config.session.clone();
        let sessions = Arc::clone(&self.sessions);
        let span = info_span!("session", %session_id, %peer);

        tasks.spawn(
            async move {
                info!("Peer connected");
                let worker_span = tracing::Span::current();
                let result = tokio::task::spawn_blocking(move || {
                    worker_span.in_scope(|| run_session(&stream, &settings, cancel))
                })
                .await;
                sessions.write().await.remove(&session_id);

                match result {
                    Ok(Ok(summary)) => info!(
                        stop_reason = ?summary.stop_reason,
                        bytes_to_peer = summary.bytes_to_peer,
                        bytes_to_process = summary.bytes_to_process,
                        "Session ended"
                    ),
                    Ok(Err(RelayError::Channel(e))) if e.is_spawn_error() => {
                        error!(error = %e, "Could not start session shell");
                    }
                    Ok(Err(e)) => warn!(error = %e, "Session ended with error"),
                    Err(e) => error!(error = %e, "Session worker panicked"),
                }
            }
            .instrument(span),
        );
    }

    async fn cancel_all(&self) {
        let sessions = self.sessions.read().await;
        for flag in sessions.values() {
            flag.cancel();
        }
        debug!(count = sessions.len(), "Cancelled active sessions");
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "Session task failed");
    }
}
