//! Error types for protocol operations

use thiserror::Error;

/// Protocol-specific errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid frame format
    #[error("Invalid frame format")]
    InvalidFrame,

    /// Frame too large
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Actual frame size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Envelope did not decode to a map
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Underlying stream failed or was closed
    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(error: rmp_serde::encode::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

impl From<rmpv::decode::Error> for ProtocolError {
    fn from(error: rmpv::decode::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}
