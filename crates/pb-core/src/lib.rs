//! Core infrastructure for pulsebridge
//!
//! Configuration, the error taxonomy shared by every crate, and logging setup.

pub mod config;
pub mod error;
pub mod logging;

pub use config::Config;
pub use error::{BackendError, ConfigError, StreamError, StreamId};
