//! Decoded tuple variants
//!
//! A [`Tuple`] is one decoded frame. Windowing metadata accessors exist only
//! on the window-bearing variants, so calling them on a plain data tuple is
//! impossible rather than a runtime error.

use bytes::Bytes;

use crate::message_type::{ErrorCode, MessageType};

/// One framed unit exchanged over the buffer-server wire protocol, either a
/// data record or a control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tuple {
    /// Keepalive; carries nothing
    NoMessage,
    /// Opaque application payload
    Data(DataTuple),
    /// Start-of-window marker
    BeginWindow(WindowMarker),
    /// End-of-window marker
    EndWindow {
        /// Window being closed
        window_id: u64,
    },
    /// Checkpoint marker
    Checkpoint {
        /// Window the checkpoint covers
        window_id: u64,
    },
    /// Session control request
    Request(RequestTuple),
    /// Server-reported session error
    Error(ErrorTuple),
}

impl Tuple {
    /// The wire type byte this tuple decodes from
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::NoMessage => MessageType::NoMessage,
            Self::Data(_) => MessageType::Data,
            Self::BeginWindow(_) => MessageType::BeginWindow,
            Self::EndWindow { .. } => MessageType::EndWindow,
            Self::Checkpoint { .. } => MessageType::Checkpoint,
            Self::Request(request) => request.request_type,
            Self::Error(_) => MessageType::Error,
        }
    }
}

/// Opaque application payload: a sub-kind byte followed by application bytes.
///
/// The payload is a refcounted view into the connection's receive buffer;
/// cloning it never copies the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataTuple {
    payload: Bytes,
}

impl DataTuple {
    /// Wrap a raw payload. The first byte is the application sub-kind.
    ///
    /// Panics if the payload is empty; decoding validates this before
    /// construction, so an empty payload here is a programming error.
    pub fn new(payload: Bytes) -> Self {
        assert!(!payload.is_empty(), "data payload requires a sub-kind byte");
        Self { payload }
    }

    /// Application sub-kind byte
    pub fn kind(&self) -> u8 {
        self.payload[0]
    }

    /// Application bytes past the sub-kind byte, zero-copy
    pub fn data(&self) -> Bytes {
        self.payload.slice(1..)
    }

    /// Full payload including the sub-kind byte
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

/// Windowing metadata carried by a begin-window marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowMarker {
    /// Window id, strictly increasing per stream
    pub window_id: u64,
    /// Base time of the window in seconds
    pub base_seconds: u32,
    /// Window width in milliseconds
    pub window_width: u32,
}

/// Structured control message used for registration, purge and reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTuple {
    /// One of the `*Request` message types
    pub request_type: MessageType,
    /// Protocol version string
    pub version: String,
    /// Stream identifier the request names
    pub identifier: String,
    /// Starting position, by window id
    pub starting_window_id: u64,
}

/// Session error reported by the server before closing a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorTuple {
    /// Error classification
    pub code: ErrorCode,
    /// Human-readable detail
    pub message: String,
}
