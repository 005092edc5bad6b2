//! Subscriber protocol client

use std::net::SocketAddr;

use relay_wire::{
    DEFAULT_MAX_FRAME, MessageType, Tuple, decode, encode_no_message, encode_request, read_frame,
    write_frame,
};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

use crate::error::ClientError;

/// The consuming side of one stream: registers from a starting window and
/// receives the stored tuple stream in append order.
pub struct Subscriber {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    max_frame: usize,
}

impl Subscriber {
    /// Connect and register as a subscriber for `identifier`, starting at
    /// `starting_window_id`.
    pub async fn connect(
        addr: SocketAddr,
        version: &str,
        identifier: &str,
        starting_window_id: u64,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, mut writer) = stream.into_split();
        let frame = encode_request(
            MessageType::SubscriberRequest,
            version,
            identifier,
            starting_window_id,
        )?;
        write_frame(&mut writer, &frame).await?;
        debug!(identifier, starting_window_id, "subscriber registered");
        Ok(Self {
            reader,
            writer,
            max_frame: DEFAULT_MAX_FRAME,
        })
    }

    /// Receive the next tuple. Server-reported errors surface as
    /// [`ClientError::Server`]; a closed stream surfaces as
    /// [`ClientError::Closed`].
    pub async fn next(&mut self) -> Result<Tuple, ClientError> {
        match read_frame(&mut self.reader, self.max_frame).await? {
            None => Err(ClientError::Closed),
            Some(frame) => match decode(frame)? {
                Tuple::Error(report) => Err(ClientError::Server {
                    code: report.code,
                    message: report.message,
                }),
                tuple => Ok(tuple),
            },
        }
    }

    /// Send a keepalive.
    pub async fn heartbeat(&mut self) -> Result<(), ClientError> {
        write_frame(&mut self.writer, &encode_no_message()).await?;
        Ok(())
    }
}
