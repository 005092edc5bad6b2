//! Protocol clients for the relay buffer server
//!
//! Used by operator containers to publish and subscribe to stream edges,
//! and by the launcher's restart path to issue purge and reset requests.

pub mod error;
mod publisher;
mod subscriber;

use std::net::SocketAddr;

use relay_wire::{
    DEFAULT_MAX_FRAME, MessageType, Tuple, decode, encode_request, read_frame, write_frame,
};
use tokio::net::TcpStream;
use tracing::debug;

pub use error::ClientError;
pub use publisher::Publisher;
pub use subscriber::Subscriber;

/// Protocol version spoken by these clients.
pub const VERSION: &str = "1.0";

/// One-shot purge: ask the server to reclaim everything belonging to
/// windows at or before `through_window` on `identifier`.
pub async fn purge(
    addr: SocketAddr,
    version: &str,
    identifier: &str,
    through_window: u64,
) -> Result<(), ClientError> {
    one_shot(
        addr,
        MessageType::PurgeRequest,
        version,
        identifier,
        through_window,
    )
    .await
}

/// One-shot reset: ask the server to discard `identifier`'s backlog from
/// `from_window` onward and rewind its publish cursor.
pub async fn reset(
    addr: SocketAddr,
    version: &str,
    identifier: &str,
    from_window: u64,
) -> Result<(), ClientError> {
    one_shot(
        addr,
        MessageType::ResetRequest,
        version,
        identifier,
        from_window,
    )
    .await
}

async fn one_shot(
    addr: SocketAddr,
    request_type: MessageType,
    version: &str,
    identifier: &str,
    window_id: u64,
) -> Result<(), ClientError> {
    let stream = TcpStream::connect(addr).await?;
    let (mut reader, mut writer) = stream.into_split();
    let frame = encode_request(request_type, version, identifier, window_id)?;
    write_frame(&mut writer, &frame).await?;
    debug!(identifier, ?request_type, window_id, "control request sent");

    // the server answers only with an error report; a clean close is success
    match read_frame(&mut reader, DEFAULT_MAX_FRAME).await? {
        None => Ok(()),
        Some(frame) => match decode(frame)? {
            Tuple::Error(report) => Err(ClientError::Server {
                code: report.code,
                message: report.message,
            }),
            other => Err(ClientError::Unexpected(other.message_type())),
        },
    }
}
