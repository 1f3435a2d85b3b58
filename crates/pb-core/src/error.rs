//! Error types for pulsebridge

use std::io;
use thiserror::Error;

/// Identifier of an open stream. Assigned from 1 upwards and never reused.
pub type StreamId = u32;

/// Errors reported by stream operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Bad caller input, detected before any backend call
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A stream is already open
    #[error("Stream already open")]
    AlreadyOpen,
    /// Unknown stream id
    #[error("Stream {0} not open")]
    NotFound(StreamId),
    /// The audio backend reported a failure; the text is the backend's own
    #[error("{0}")]
    Backend(String),
}

impl StreamError {
    pub fn invalid(message: impl Into<String>) -> Self {
        StreamError::InvalidArgument(message.into())
    }
}

/// Failure reported by an audio backend primitive.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct BackendError {
    message: String,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Diagnostic text as reported by the backend
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<BackendError> for StreamError {
    fn from(err: BackendError) -> Self {
        StreamError::Backend(err.message)
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("No configuration directory available")]
    NoConfigDir,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_text_is_preserved_verbatim() {
        let err: StreamError = BackendError::new("Invalid number of channels").into();
        assert_eq!(err, StreamError::Backend("Invalid number of channels".into()));
        assert_eq!(err.to_string(), "Invalid number of channels");
    }

    #[test]
    fn not_found_names_the_stream() {
        assert_eq!(StreamError::NotFound(7).to_string(), "Stream 7 not open");
    }
}
