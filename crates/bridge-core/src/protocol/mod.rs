//! IPC protocol: message types and the framed binary codec.

pub mod codec;
pub mod messages;

pub use codec::{decode_frame, encode_frame, ProtocolError};
pub use messages::*;
