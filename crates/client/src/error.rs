//! Error types for protocol clients

use relay_wire::{ErrorCode, MessageType, WireError};
use thiserror::Error;

/// Errors surfaced by [`Publisher`](crate::Publisher) and
/// [`Subscriber`](crate::Subscriber).
#[derive(Debug, Error)]
pub enum ClientError {
    /// Framing or decoding failure
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The server reported a session error before closing
    #[error("server reported {code:?}: {message}")]
    Server {
        /// Error classification from the server
        code: ErrorCode,
        /// Server-provided detail
        message: String,
    },

    /// The server closed the connection
    #[error("connection closed by server")]
    Closed,

    /// The server sent a frame that makes no sense in this direction
    #[error("unexpected {0:?} frame from server")]
    Unexpected(MessageType),

    /// Transport-level I/O failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
