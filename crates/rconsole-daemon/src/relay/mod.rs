//! Relay module: pumps bytes between a child process and a connection.
//!
//! This is the "glue" that connects:
//! - ChildProcessChannel (peek-gated stdout reads, non-blocking stdin writes)
//! - a connected byte stream (TCP or Unix socket)
//! - a per-session cancellation flag shared by both pump loops

mod connection;
mod engine;
mod types;

pub use connection::Connection;
pub use engine::RelayEngine;
pub use types::*;
