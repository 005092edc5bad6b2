//! Length-prefixed frame transport
//!
//! Every frame travels as a 4-byte big-endian length prefix followed by the
//! frame bytes. The length covers the type byte and payload, never itself.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::WireError;

/// Default upper bound on a single frame
pub const DEFAULT_MAX_FRAME: usize = 1024 * 1024;

/// Read one frame from the transport.
///
/// Returns `Ok(None)` on a clean close (EOF on a frame boundary); a close
/// mid-frame is a corrupt frame error.
pub async fn read_frame<R>(reader: &mut R, max_frame: usize) -> Result<Option<Bytes>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(WireError::corrupt("connection closed mid-frame"));
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Err(WireError::corrupt("zero-length frame"));
    }
    if len > max_frame {
        return Err(WireError::protocol(format!(
            "frame of {len} bytes exceeds limit of {max_frame}"
        )));
    }

    let mut data = vec![0u8; len];
    reader
        .read_exact(&mut data)
        .await
        .map_err(|_| WireError::corrupt("connection closed mid-frame"))?;
    Ok(Some(Bytes::from(data)))
}

/// Write one frame to the transport.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let len = frame.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}
