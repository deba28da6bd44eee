//! Vigil wire protocol — framed messages between fabric endpoints.
//!
//! All communication between Vigil endpoints uses JSON-framed messages
//! over mutually-authenticated TLS. Each message is prefixed with a
//! 4-byte big-endian length header.
//!
//! ## Message classification
//!
//! Classification is intrinsic to the payload, not to how a message is
//! delivered: a body carrying a `method` member is a [`RequestMessage`];
//! anything else must carry an `id` and is a [`ResponseMessage`]. A body
//! with neither is a protocol error.

pub mod frame;
pub mod message;

pub use frame::{
    encode_message, read_message, write_message, WireError, MAX_MESSAGE_SIZE,
};
pub use message::{decode_length, decode_message, Message, RequestMessage, ResponseMessage};
