//! Error types for the wire protocol

use thiserror::Error;

/// Errors raised while framing or decoding wire messages.
///
/// All variants are fatal to the connection they occur on and harmless to
/// every other session in the process.
#[derive(Debug, Error)]
pub enum WireError {
    /// The peer sent something that is not part of the protocol, such as an
    /// unrecognized message type byte or an oversized frame.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A frame failed bounds or consistency checks while decoding.
    #[error("corrupt frame: {0}")]
    CorruptFrame(String),

    /// Transport-level I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    /// Create a protocol violation error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Create a corrupt frame error
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::CorruptFrame(message.into())
    }
}
