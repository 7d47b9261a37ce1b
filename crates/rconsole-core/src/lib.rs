//! rconsole Core Library
//!
//! Shared functionality for rconsole components:
//! - Configuration resolution (defaults, settings files, environment)
//! - Tracing subscriber setup
//! - Common error types

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
