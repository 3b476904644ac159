//! Error types for streamguard-media.

use thiserror::Error;

/// Result type for streamguard-media operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for container parsing.
///
/// Every variant is recoverable: callers treat a parse failure as
/// "no scan this round" and let the bytes through.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid MP4 box structure.
    #[error("Invalid MP4: {0}")]
    InvalidMp4(String),

    /// Invalid EBML element structure.
    #[error("Invalid EBML: {0}")]
    InvalidEbml(String),

    /// Missing required box or element.
    #[error("Missing required element: {0}")]
    Missing(&'static str),

    /// Buffer too small for operation.
    #[error("Buffer underflow: need {need} bytes, have {have}")]
    BufferUnderflow { need: usize, have: usize },

    /// Container family could not be determined.
    #[error("Unsupported container: {0}")]
    Unsupported(String),
}

impl Error {
    /// Create an invalid MP4 error.
    pub fn invalid_mp4(msg: impl Into<String>) -> Self {
        Self::InvalidMp4(msg.into())
    }

    /// Create an invalid EBML error.
    pub fn invalid_ebml(msg: impl Into<String>) -> Self {
        Self::InvalidEbml(msg.into())
    }

    /// Create an unsupported error.
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }
}
