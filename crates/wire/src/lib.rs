//! Wire protocol for the relay buffer server
//!
//! Every message on a connection is a length-prefixed frame holding one type
//! byte followed by a type-specific payload: raw tuple bytes for data, a
//! structured request for session control. Decoding produces a tagged
//! [`Tuple`] whose data payloads are zero-copy views into the receive buffer.

pub mod codec;
pub mod error;
pub mod framing;
pub mod message_type;
pub mod tuple;

pub use codec::{decode, encode_begin_window, encode_checkpoint, encode_data, encode_end_window,
    encode_error, encode_no_message, encode_request};
pub use error::WireError;
pub use framing::{DEFAULT_MAX_FRAME, read_frame, write_frame};
pub use message_type::{ErrorCode, MessageType};
pub use tuple::{DataTuple, ErrorTuple, RequestTuple, Tuple, WindowMarker};
