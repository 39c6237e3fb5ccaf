//! Wire-level types shared by the ferry server and its clients.
//!
//! A frame on the wire is a 4-byte big-endian length followed by the payload.
//! The payload is a [`RequestFrame`] or [`ResponseFrame`] encoded with the
//! session's [`CodecType`]; the frame `body` carries the method argument or
//! reply encoded with the same codec.

pub mod codec;
pub mod frames;

pub use {
    codec::{CodecError, CodecType},
    frames::{ErrorShape, RequestFrame, ResponseFrame, error_codes},
};

/// Bumped whenever the frame layout changes incompatibly.
pub const PROTOCOL_VERSION: u32 = 1;
