//! Error types for stream storage

use thiserror::Error;

/// Errors raised by [`StreamLog`](crate::StreamLog) operations.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// The log cannot allocate another block. Propagated to the publisher as
    /// backpressure; retained data is never discarded to make room.
    #[error("stream storage at capacity: {blocks} blocks retained")]
    CapacityExceeded {
        /// Blocks currently retained
        blocks: usize,
    },

    /// The requested window is older than the retained backlog; the caller
    /// must re-register from a window that is still replayable.
    #[error("window {requested} is no longer replayable")]
    StaleWindow {
        /// Window the caller asked for
        requested: u64,
    },

    /// Window ids must be strictly increasing within a stream. A violation
    /// signals a buggy publisher, not a recoverable condition.
    #[error("window {window_id} is not after the last recorded window {last}")]
    NonMonotonicWindow {
        /// Window the publisher tried to record
        window_id: u64,
        /// Last window already recorded
        last: u64,
    },
}
