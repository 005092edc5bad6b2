//! Publisher protocol client

use std::net::SocketAddr;

use relay_wire::{
    DEFAULT_MAX_FRAME, ErrorTuple, MessageType, Tuple, WindowMarker, decode, encode_begin_window,
    encode_checkpoint, encode_data, encode_end_window, encode_no_message, encode_request,
    read_frame, write_frame,
};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

use crate::error::ClientError;

/// The producing side of one stream: registers with the buffer server and
/// appends windowed tuples.
pub struct Publisher {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    identifier: String,
    version: String,
    max_frame: usize,
}

impl Publisher {
    /// Connect and register as the publisher for `identifier`, intending to
    /// publish from `starting_window_id` onward.
    pub async fn connect(
        addr: SocketAddr,
        version: &str,
        identifier: &str,
        starting_window_id: u64,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, mut writer) = stream.into_split();
        let frame = encode_request(
            MessageType::PublisherRequest,
            version,
            identifier,
            starting_window_id,
        )?;
        write_frame(&mut writer, &frame).await?;
        debug!(identifier, starting_window_id, "publisher registered");
        Ok(Self {
            reader,
            writer,
            identifier: identifier.to_string(),
            version: version.to_string(),
            max_frame: DEFAULT_MAX_FRAME,
        })
    }

    /// Stream identifier this publisher feeds.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Open a window.
    pub async fn begin_window(&mut self, marker: WindowMarker) -> Result<(), ClientError> {
        write_frame(&mut self.writer, &encode_begin_window(&marker)).await?;
        Ok(())
    }

    /// Close a window.
    pub async fn end_window(&mut self, window_id: u64) -> Result<(), ClientError> {
        write_frame(&mut self.writer, &encode_end_window(window_id)).await?;
        Ok(())
    }

    /// Mark a committed checkpoint.
    pub async fn checkpoint(&mut self, window_id: u64) -> Result<(), ClientError> {
        write_frame(&mut self.writer, &encode_checkpoint(window_id)).await?;
        Ok(())
    }

    /// Publish one data tuple with an application sub-kind byte.
    pub async fn send(&mut self, kind: u8, data: &[u8]) -> Result<(), ClientError> {
        write_frame(&mut self.writer, &encode_data(kind, data)).await?;
        Ok(())
    }

    /// Send a keepalive; it is never stored and never delivered.
    pub async fn heartbeat(&mut self) -> Result<(), ClientError> {
        write_frame(&mut self.writer, &encode_no_message()).await?;
        Ok(())
    }

    /// Ask the server to discard buffered data from `from_window` onward
    /// and rewind, then continue publishing from that window.
    pub async fn reset(&mut self, from_window: u64) -> Result<(), ClientError> {
        let frame = encode_request(
            MessageType::ResetRequest,
            &self.version,
            &self.identifier,
            from_window,
        )?;
        write_frame(&mut self.writer, &frame).await?;
        Ok(())
    }

    /// Wait for a server-reported session error, `None` if the server
    /// closed the connection without one.
    pub async fn recv_error(&mut self) -> Result<Option<ErrorTuple>, ClientError> {
        match read_frame(&mut self.reader, self.max_frame).await? {
            None => Ok(None),
            Some(frame) => match decode(frame)? {
                Tuple::Error(report) => Ok(Some(report)),
                other => Err(ClientError::Unexpected(other.message_type())),
            },
        }
    }
}
