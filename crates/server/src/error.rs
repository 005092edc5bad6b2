//! Error types for the buffer server

use relay_storage::StorageError;
use relay_wire::{ErrorCode, WireError};
use thiserror::Error;

/// Errors terminating a single session. None of these affect other sessions
/// or the server process.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Framing or decoding failure on the connection
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Stream storage rejected an operation
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The publisher was superseded by a newer registration for the same
    /// identifier. Expected during failover.
    #[error("publisher for {identifier} superseded by a newer registration")]
    FencedOut {
        /// Stream the publisher was registered for
        identifier: String,
    },

    /// The subscriber's position is not replayable and it must re-register.
    #[error("stale cursor for {identifier}: {detail}")]
    StaleCursor {
        /// Stream the subscriber was registered for
        identifier: String,
        /// What went stale
        detail: String,
    },

    /// The session's outbound queue or writer task went away mid-delivery,
    /// which means the peer disconnected.
    #[error("subscriber outbound path closed")]
    OutboundClosed,

    /// Listener-level I/O failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// The wire error code reported to the peer before closing.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Wire(WireError::CorruptFrame(_)) => ErrorCode::CorruptFrame,
            Self::Wire(_) => ErrorCode::Protocol,
            Self::Storage(StorageError::CapacityExceeded { .. }) => ErrorCode::CapacityExceeded,
            Self::Storage(StorageError::StaleWindow { .. }) => ErrorCode::StaleCursor,
            Self::Storage(StorageError::NonMonotonicWindow { .. }) => ErrorCode::Protocol,
            Self::FencedOut { .. } => ErrorCode::FencedOut,
            Self::StaleCursor { .. } => ErrorCode::StaleCursor,
            Self::OutboundClosed => ErrorCode::Protocol,
            Self::Io(_) => ErrorCode::Protocol,
        }
    }
}
