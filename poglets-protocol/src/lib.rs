//! poglets wire protocol
//!
//! This crate defines the binary framing exchanged between a tunnel server
//! and client over the control connection.

pub mod codec;
pub mod constants;
pub mod error;
pub mod frame;
pub mod validation;

pub use codec::{decode, encode, TunnelCodec};
pub use error::ProtocolError;
pub use frame::{
    ErrorCode, Frame, FrameKind, HandshakeAckFrame, HandshakeFrame, RequestHead, ResponseHead,
    StreamId, WireHeaders,
};
