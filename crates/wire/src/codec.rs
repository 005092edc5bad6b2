//! Frame encoding and decoding
//!
//! Frames are `[type:1][payload...]`. Request payloads are
//! `[versionLen:varint][version][identifierLen:varint][identifier]
//! [startingWindowId:u64 BE][requestType:1]`, where the trailing request
//! type byte must match the frame's leading type byte. All offsets are
//! validated against the frame bounds before any field is read.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::WireError;
use crate::message_type::{ErrorCode, MessageType};
use crate::tuple::{DataTuple, ErrorTuple, RequestTuple, Tuple, WindowMarker};

/// Encode a u32 as a variable-length integer (LEB128).
pub(crate) fn encode_varint(mut value: u32, buf: &mut BytesMut) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

/// Encode a data frame: one type byte, the application sub-kind byte, then
/// the application bytes.
pub fn encode_data(kind: u8, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + data.len());
    buf.put_u8(MessageType::Data.as_u8());
    buf.put_u8(kind);
    buf.put_slice(data);
    buf.freeze()
}

/// Encode a begin-window marker frame.
pub fn encode_begin_window(marker: &WindowMarker) -> Bytes {
    let mut buf = BytesMut::with_capacity(17);
    buf.put_u8(MessageType::BeginWindow.as_u8());
    buf.put_u64(marker.window_id);
    buf.put_u32(marker.base_seconds);
    buf.put_u32(marker.window_width);
    buf.freeze()
}

/// Encode an end-window marker frame.
pub fn encode_end_window(window_id: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(9);
    buf.put_u8(MessageType::EndWindow.as_u8());
    buf.put_u64(window_id);
    buf.freeze()
}

/// Encode a checkpoint marker frame.
pub fn encode_checkpoint(window_id: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(9);
    buf.put_u8(MessageType::Checkpoint.as_u8());
    buf.put_u64(window_id);
    buf.freeze()
}

/// Encode a keepalive frame.
pub fn encode_no_message() -> Bytes {
    Bytes::from_static(&[MessageType::NoMessage as u8])
}

/// Encode a session control request frame.
///
/// Fails if `request_type` is not one of the `*Request` types; that is a
/// programming error on the caller's side, not a recoverable condition.
pub fn encode_request(
    request_type: MessageType,
    version: &str,
    identifier: &str,
    starting_window_id: u64,
) -> Result<Bytes, WireError> {
    if !request_type.is_request() {
        return Err(WireError::protocol(format!(
            "{request_type:?} is not a request type"
        )));
    }

    let mut buf = BytesMut::with_capacity(16 + version.len() + identifier.len());
    buf.put_u8(request_type.as_u8());
    encode_varint(version.len() as u32, &mut buf);
    buf.put_slice(version.as_bytes());
    encode_varint(identifier.len() as u32, &mut buf);
    buf.put_slice(identifier.as_bytes());
    buf.put_u64(starting_window_id);
    buf.put_u8(request_type.as_u8());
    Ok(buf.freeze())
}

/// Encode a server-side error report frame.
pub fn encode_error(code: ErrorCode, message: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(6 + message.len());
    buf.put_u8(MessageType::Error.as_u8());
    buf.put_u8(code.as_u8());
    encode_varint(message.len() as u32, &mut buf);
    buf.put_slice(message.as_bytes());
    buf.freeze()
}

/// Decode one frame into a [`Tuple`].
///
/// Data payloads in the result are zero-copy slices of `frame`.
pub fn decode(frame: Bytes) -> Result<Tuple, WireError> {
    let Some(&type_byte) = frame.first() else {
        return Err(WireError::corrupt("empty frame"));
    };
    let Some(message_type) = MessageType::from_u8(type_byte) else {
        return Err(WireError::protocol(format!(
            "unrecognized message type {type_byte:#04x}"
        )));
    };

    let mut reader = FrameReader::new(&frame, 1);
    match message_type {
        MessageType::NoMessage => {
            reader.finish()?;
            Ok(Tuple::NoMessage)
        }
        MessageType::Data => {
            if frame.len() < 2 {
                return Err(WireError::corrupt("data frame without sub-kind byte"));
            }
            Ok(Tuple::Data(DataTuple::new(frame.slice(1..))))
        }
        MessageType::BeginWindow => {
            let window_id = reader.read_u64()?;
            let base_seconds = reader.read_u32()?;
            let window_width = reader.read_u32()?;
            reader.finish()?;
            Ok(Tuple::BeginWindow(WindowMarker {
                window_id,
                base_seconds,
                window_width,
            }))
        }
        MessageType::EndWindow => {
            let window_id = reader.read_u64()?;
            reader.finish()?;
            Ok(Tuple::EndWindow { window_id })
        }
        MessageType::Checkpoint => {
            let window_id = reader.read_u64()?;
            reader.finish()?;
            Ok(Tuple::Checkpoint { window_id })
        }
        MessageType::PublisherRequest
        | MessageType::SubscriberRequest
        | MessageType::PurgeRequest
        | MessageType::ResetRequest => {
            let version = reader.read_string()?;
            let identifier = reader.read_string()?;
            let starting_window_id = reader.read_u64()?;
            let trailer = reader.read_u8()?;
            reader.finish()?;
            if trailer != type_byte {
                return Err(WireError::corrupt(format!(
                    "request type trailer {trailer:#04x} does not match frame type {type_byte:#04x}"
                )));
            }
            Ok(Tuple::Request(RequestTuple {
                request_type: message_type,
                version,
                identifier,
                starting_window_id,
            }))
        }
        MessageType::Error => {
            let code_byte = reader.read_u8()?;
            let Some(code) = ErrorCode::from_u8(code_byte) else {
                return Err(WireError::corrupt(format!(
                    "unrecognized error code {code_byte:#04x}"
                )));
            };
            let message = reader.read_string()?;
            reader.finish()?;
            Ok(Tuple::Error(ErrorTuple { code, message }))
        }
    }
}

/// Bounds-checked reader over a frame's payload.
struct FrameReader<'a> {
    frame: &'a [u8],
    position: usize,
}

impl<'a> FrameReader<'a> {
    fn new(frame: &'a Bytes, position: usize) -> Self {
        Self {
            frame: frame.as_ref(),
            position,
        }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        let end = self.position.checked_add(len).ok_or_else(|| {
            WireError::corrupt(format!("field length {len} overflows frame offset"))
        })?;
        if end > self.frame.len() {
            return Err(WireError::corrupt(format!(
                "field of {len} bytes at offset {} exceeds frame of {} bytes",
                self.position,
                self.frame.len()
            )));
        }
        let slice = &self.frame[self.position..end];
        self.position = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, WireError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes(bytes.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> Result<u64, WireError> {
        let bytes = self.take(8)?;
        Ok(u64::from_be_bytes(bytes.try_into().unwrap()))
    }

    /// Decode a LEB128 varint.
    fn read_varint(&mut self) -> Result<u32, WireError> {
        let mut value: u32 = 0;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            value |= ((byte & 0x7F) as u32) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift >= 35 {
                return Err(WireError::corrupt("varint overflows u32"));
            }
        }
    }

    /// Read a varint-length-delimited UTF-8 string.
    fn read_string(&mut self) -> Result<String, WireError> {
        let len = self.read_varint()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| WireError::corrupt("string field is not valid utf-8"))
    }

    /// Require that the whole frame was consumed.
    fn finish(&self) -> Result<(), WireError> {
        if self.position != self.frame.len() {
            return Err(WireError::corrupt(format!(
                "{} trailing bytes after payload",
                self.frame.len() - self.position
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_data_is_zero_copy() {
        let frame = encode_data(0x2A, b"payload bytes");
        let backing = frame.clone();
        let tuple = decode(frame).unwrap();
        let Tuple::Data(data) = tuple else {
            panic!("expected data tuple");
        };
        assert_eq!(data.kind(), 0x2A);
        assert_eq!(&data.data()[..], b"payload bytes");
        assert_eq!(data.payload().as_ptr(), unsafe { backing.as_ptr().add(1) });
    }

    #[test]
    fn test_request_round_trip() {
        let frame = encode_request(
            MessageType::PublisherRequest,
            "1.0",
            "edge.map-to-reduce.1",
            42,
        )
        .unwrap();
        let tuple = decode(frame).unwrap();
        assert_eq!(
            tuple,
            Tuple::Request(RequestTuple {
                request_type: MessageType::PublisherRequest,
                version: "1.0".to_string(),
                identifier: "edge.map-to-reduce.1".to_string(),
                starting_window_id: 42,
            })
        );
    }

    #[test]
    fn test_request_trailer_mismatch_is_corrupt() {
        let frame = encode_request(MessageType::SubscriberRequest, "1.0", "s", 0).unwrap();
        let mut bytes = frame.to_vec();
        let last = bytes.len() - 1;
        bytes[last] = MessageType::ResetRequest.as_u8();
        let err = decode(Bytes::from(bytes)).unwrap_err();
        assert!(matches!(err, WireError::CorruptFrame(_)), "got {err}");
    }

    #[test]
    fn test_unknown_type_byte_is_protocol_error() {
        let err = decode(Bytes::from_static(&[0xEE, 1, 2, 3])).unwrap_err();
        assert!(matches!(err, WireError::Protocol(_)), "got {err}");
    }

    #[test]
    fn test_truncated_request_is_corrupt() {
        let frame = encode_request(MessageType::SubscriberRequest, "1.0", "stream", 7).unwrap();
        for len in 1..frame.len() {
            let err = decode(frame.slice(..len)).unwrap_err();
            assert!(
                matches!(err, WireError::CorruptFrame(_)),
                "truncation to {len} gave {err}"
            );
        }
    }

    #[test]
    fn test_string_length_beyond_frame_is_corrupt() {
        // versionLen claims 200 bytes but the frame ends immediately
        let frame = Bytes::from(vec![MessageType::PublisherRequest.as_u8(), 200, 1]);
        let err = decode(frame).unwrap_err();
        assert!(matches!(err, WireError::CorruptFrame(_)), "got {err}");
    }

    #[test]
    fn test_window_markers_round_trip() {
        let marker = WindowMarker {
            window_id: (1_700_000_000u64 << 32) | 17,
            base_seconds: 1_700_000_000,
            window_width: 500,
        };
        assert_eq!(
            decode(encode_begin_window(&marker)).unwrap(),
            Tuple::BeginWindow(marker)
        );
        assert_eq!(
            decode(encode_end_window(9)).unwrap(),
            Tuple::EndWindow { window_id: 9 }
        );
        assert_eq!(
            decode(encode_checkpoint(9)).unwrap(),
            Tuple::Checkpoint { window_id: 9 }
        );
    }

    #[test]
    fn test_begin_window_with_trailing_bytes_is_corrupt() {
        let mut bytes = encode_begin_window(&WindowMarker {
            window_id: 1,
            base_seconds: 2,
            window_width: 3,
        })
        .to_vec();
        bytes.push(0);
        let err = decode(Bytes::from(bytes)).unwrap_err();
        assert!(matches!(err, WireError::CorruptFrame(_)), "got {err}");
    }

    #[test]
    fn test_error_frame_round_trip() {
        let frame = encode_error(ErrorCode::StaleCursor, "window 1 is gone");
        let tuple = decode(frame).unwrap();
        assert_eq!(
            tuple,
            Tuple::Error(ErrorTuple {
                code: ErrorCode::StaleCursor,
                message: "window 1 is gone".to_string(),
            })
        );
    }

    #[test]
    fn test_no_message_is_empty() {
        assert_eq!(decode(encode_no_message()).unwrap(), Tuple::NoMessage);
        let err = decode(Bytes::from_static(&[0, 1])).unwrap_err();
        assert!(matches!(err, WireError::CorruptFrame(_)));
    }

    #[test]
    fn test_varint_boundaries() {
        for value in [0u32, 1, 127, 128, 16_383, 16_384, u32::MAX] {
            let mut buf = BytesMut::new();
            encode_varint(value, &mut buf);
            let frame = buf.freeze();
            let mut reader = FrameReader::new(&frame, 0);
            assert_eq!(reader.read_varint().unwrap(), value);
            reader.finish().unwrap();
        }
    }
}
