//! rconsole Daemon Library
//!
//! Core functionality for the rconsole daemon:
//! - Child process channel with redirected, peek-gated stdio pipes
//! - Two-loop relay engine between a channel and a socket
//! - TCP acceptor running one isolated relay session per peer

pub mod channel;
pub mod relay;
pub mod server;
