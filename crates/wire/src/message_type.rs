//! Message type bytes

/// Leading type byte of every frame on the wire.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Keepalive; never stored and never delivered to subscribers
    NoMessage = 0,
    /// Opaque application payload
    Data = 1,
    /// Start-of-window marker carrying windowing metadata
    BeginWindow = 2,
    /// End-of-window marker
    EndWindow = 3,
    /// Checkpoint marker
    Checkpoint = 4,
    /// Publisher registration
    PublisherRequest = 5,
    /// Subscriber registration
    SubscriberRequest = 6,
    /// Explicit purge up to a window
    PurgeRequest = 7,
    /// Discard backlog from a window onward and rewind
    ResetRequest = 8,
    /// Server-reported session error
    Error = 9,
}

impl MessageType {
    /// Decode a type byte, `None` if unrecognized
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::NoMessage),
            1 => Some(Self::Data),
            2 => Some(Self::BeginWindow),
            3 => Some(Self::EndWindow),
            4 => Some(Self::Checkpoint),
            5 => Some(Self::PublisherRequest),
            6 => Some(Self::SubscriberRequest),
            7 => Some(Self::PurgeRequest),
            8 => Some(Self::ResetRequest),
            9 => Some(Self::Error),
            _ => None,
        }
    }

    /// The wire representation of this type
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether this type carries a structured request payload
    pub fn is_request(self) -> bool {
        matches!(
            self,
            Self::PublisherRequest | Self::SubscriberRequest | Self::PurgeRequest | Self::ResetRequest
        )
    }
}

/// Code carried by an `Error` frame.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Malformed or unrecognized frame
    Protocol = 0,
    /// Frame failed bounds checks while decoding
    CorruptFrame = 1,
    /// Publisher superseded by a newer registration
    FencedOut = 2,
    /// Requested or retained position is no longer replayable
    StaleCursor = 3,
    /// Stream storage is out of blocks
    CapacityExceeded = 4,
}

impl ErrorCode {
    /// Decode an error code byte, `None` if unrecognized
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Protocol),
            1 => Some(Self::CorruptFrame),
            2 => Some(Self::FencedOut),
            3 => Some(Self::StaleCursor),
            4 => Some(Self::CapacityExceeded),
            _ => None,
        }
    }

    /// The wire representation of this code
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}
