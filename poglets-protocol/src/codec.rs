//! Codec for encoding and decoding protocol frames
//!
//! Structured payloads (handshake and stream heads) are bincode-encoded;
//! data, window and error payloads are written as raw bytes.

use crate::constants::{FRAME_HEADER_LEN, MAX_FRAME_SIZE};
use crate::error::ProtocolError;
use crate::frame::{
    ErrorCode, Frame, FrameKind, HandshakeAckFrame, HandshakeFrame, RequestHead, ResponseHead,
    StreamId,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder};

const BINCODE_LIMIT: usize = MAX_FRAME_SIZE as usize;

fn bincode_config() -> impl bincode_next::config::Config {
    bincode_next::config::standard().with_limit::<BINCODE_LIMIT>()
}

/// Encode a single frame into a standalone buffer.
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(frame, &mut buf, MAX_FRAME_SIZE as usize)?;
    Ok(buf.freeze())
}

/// Decode exactly one frame from `bytes`.
///
/// Fails with `MalformedFrame` if the header is truncated or the declared
/// payload length differs from the bytes supplied.
pub fn decode(bytes: &[u8]) -> Result<Frame, ProtocolError> {
    if bytes.len() < FRAME_HEADER_LEN {
        return Err(ProtocolError::malformed(format!(
            "truncated header: {} of {FRAME_HEADER_LEN} bytes",
            bytes.len()
        )));
    }
    let (length, kind, stream_id) = read_header(bytes);
    if length > MAX_FRAME_SIZE as usize {
        return Err(ProtocolError::FrameTooLarge {
            size: length,
            limit: MAX_FRAME_SIZE as usize,
        });
    }
    let available = bytes.len() - FRAME_HEADER_LEN;
    if available != length {
        return Err(ProtocolError::malformed(format!(
            "declared payload length {length} does not match {available} available bytes"
        )));
    }
    decode_payload(
        kind,
        stream_id,
        Bytes::copy_from_slice(&bytes[FRAME_HEADER_LEN..]),
    )
}

/// Tunnel protocol codec
///
/// Frame format:
/// ```text
/// ┌──────────────┬──────────┬────────────────┬──────────────┐
/// │ Length (u32) │ Kind (u8)│ Stream id (u32)│ Payload      │
/// │ 4 bytes      │ 1 byte   │ 4 bytes        │ Length bytes │
/// └──────────────┴──────────┴────────────────┴──────────────┘
/// ```
#[derive(Debug, Clone, Copy)]
pub struct TunnelCodec {
    max_frame_size: usize,
}

impl Default for TunnelCodec {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE as usize,
        }
    }
}

impl TunnelCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Append a borrowed frame to `dst`.
    pub fn encode_frame(&self, frame: &Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        encode_into(frame, dst, self.max_frame_size)
    }
}

impl Decoder for TunnelCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let (length, kind, stream_id) = read_header(src);
        if length > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                limit: self.max_frame_size,
            });
        }

        if src.len() < FRAME_HEADER_LEN + length {
            src.reserve(FRAME_HEADER_LEN + length - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        let payload = src.split_to(length).freeze();
        decode_payload(kind, stream_id, payload).map(Some)
    }
}

impl Encoder<Frame> for TunnelCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_into(&frame, dst, self.max_frame_size)
    }
}

fn read_header(buf: &[u8]) -> (usize, u8, StreamId) {
    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let kind = buf[4];
    let stream_id = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]);
    (length, kind, stream_id)
}

fn encode_into(frame: &Frame, dst: &mut BytesMut, max: usize) -> Result<(), ProtocolError> {
    let start = dst.len();
    dst.put_u32(0);
    dst.put_u8(frame.kind().as_u8());
    dst.put_u32(frame.stream_id());

    let written = match frame {
        Frame::Handshake(handshake) => put_serialized(dst, handshake.as_ref()),
        Frame::HandshakeAck(ack) => put_serialized(dst, ack.as_ref()),
        Frame::Open { head, .. } => put_serialized(dst, head.as_ref()),
        Frame::Reply { head, .. } => put_serialized(dst, head.as_ref()),
        Frame::Data { data, .. } => {
            dst.put_slice(data);
            Ok(())
        }
        Frame::HalfClose { .. } => Ok(()),
        Frame::WindowUpdate { increment, .. } => {
            dst.put_u32(*increment);
            Ok(())
        }
        Frame::Error { code, message, .. } => {
            dst.put_u16(code.as_u16());
            dst.put_slice(message.as_bytes());
            Ok(())
        }
        Frame::Keepalive { timestamp } => {
            dst.put_u64(*timestamp);
            Ok(())
        }
        Frame::GoAway { last_stream_id } => {
            dst.put_u32(*last_stream_id);
            Ok(())
        }
    };
    if let Err(e) = written {
        dst.truncate(start);
        return Err(e);
    }

    let length = dst.len() - start - FRAME_HEADER_LEN;
    if length > max {
        dst.truncate(start);
        return Err(ProtocolError::FrameTooLarge {
            size: length,
            limit: max,
        });
    }
    let length = u32::try_from(length).map_err(|_| ProtocolError::FrameTooLarge {
        size: length,
        limit: max,
    })?;
    dst[start..start + 4].copy_from_slice(&length.to_be_bytes());
    Ok(())
}

fn put_serialized<T: Serialize>(dst: &mut BytesMut, value: &T) -> Result<(), ProtocolError> {
    let encoded = bincode_next::serde::encode_to_vec(value, bincode_config())?;
    dst.put_slice(&encoded);
    Ok(())
}

fn deserialize<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    let (value, used): (T, usize) =
        bincode_next::serde::decode_from_slice(payload, bincode_config())?;
    if used != payload.len() {
        return Err(ProtocolError::malformed(format!(
            "{} trailing bytes after payload",
            payload.len() - used
        )));
    }
    Ok(value)
}

fn fixed<const N: usize>(payload: &[u8], kind: FrameKind) -> Result<[u8; N], ProtocolError> {
    payload.try_into().map_err(|_| {
        ProtocolError::malformed(format!(
            "{kind:?} payload must be {N} bytes, got {}",
            payload.len()
        ))
    })
}

fn check_stream_class(kind: FrameKind, stream_id: StreamId) -> Result<(), ProtocolError> {
    match kind {
        FrameKind::Error => Ok(()),
        k if k.is_session_level() && stream_id != 0 => Err(ProtocolError::malformed(format!(
            "{k:?} frame on stream {stream_id}"
        ))),
        k if !k.is_session_level() && stream_id == 0 => Err(ProtocolError::malformed(format!(
            "{k:?} frame on session stream"
        ))),
        _ => Ok(()),
    }
}

fn decode_payload(kind: u8, stream_id: StreamId, payload: Bytes) -> Result<Frame, ProtocolError> {
    let kind = FrameKind::from_u8(kind)
        .ok_or_else(|| ProtocolError::malformed(format!("unknown frame kind 0x{kind:02x}")))?;
    check_stream_class(kind, stream_id)?;

    let frame = match kind {
        FrameKind::Handshake => Frame::Handshake(Box::new(deserialize::<HandshakeFrame>(&payload)?)),
        FrameKind::HandshakeAck => {
            Frame::HandshakeAck(Box::new(deserialize::<HandshakeAckFrame>(&payload)?))
        }
        FrameKind::Open => Frame::Open {
            stream_id,
            head: Box::new(deserialize::<RequestHead>(&payload)?),
        },
        FrameKind::Reply => Frame::Reply {
            stream_id,
            head: Box::new(deserialize::<ResponseHead>(&payload)?),
        },
        FrameKind::Data => Frame::Data {
            stream_id,
            data: payload,
        },
        FrameKind::HalfClose => {
            fixed::<0>(&payload, kind)?;
            Frame::HalfClose { stream_id }
        }
        FrameKind::WindowUpdate => {
            let increment = u32::from_be_bytes(fixed::<4>(&payload, kind)?);
            if increment == 0 {
                return Err(ProtocolError::malformed("zero window increment"));
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            }
        }
        FrameKind::Error => {
            if payload.len() < 2 {
                return Err(ProtocolError::malformed("error frame without code"));
            }
            let raw = u16::from_be_bytes([payload[0], payload[1]]);
            // Unknown codes from newer peers still terminate the stream.
            let code = ErrorCode::from_u16(raw).unwrap_or(ErrorCode::Internal);
            let message = std::str::from_utf8(&payload[2..])
                .map_err(|_| ProtocolError::malformed("error message is not UTF-8"))?
                .to_owned();
            Frame::Error {
                stream_id,
                code,
                message,
            }
        }
        FrameKind::Keepalive => Frame::Keepalive {
            timestamp: u64::from_be_bytes(fixed::<8>(&payload, kind)?),
        },
        FrameKind::GoAway => Frame::GoAway {
            last_stream_id: u32::from_be_bytes(fixed::<4>(&payload, kind)?),
        },
    };
    Ok(frame)
}
