//! Protocol frame definitions

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Identifier of a logical stream within one control session
pub type StreamId = u32;

/// Header map as carried on the wire: name plus raw value bytes
pub type WireHeaders = Vec<(String, Bytes)>;

/// Frame kind byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    Handshake = 0x01,
    HandshakeAck = 0x02,
    Open = 0x10,
    Reply = 0x11,
    Data = 0x12,
    HalfClose = 0x13,
    WindowUpdate = 0x14,
    Error = 0x20,
    Keepalive = 0x30,
    GoAway = 0x31,
}

impl FrameKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x01 => Self::Handshake,
            0x02 => Self::HandshakeAck,
            0x10 => Self::Open,
            0x11 => Self::Reply,
            0x12 => Self::Data,
            0x13 => Self::HalfClose,
            0x14 => Self::WindowUpdate,
            0x20 => Self::Error,
            0x30 => Self::Keepalive,
            0x31 => Self::GoAway,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Kinds that must travel on stream 0
    pub fn is_session_level(self) -> bool {
        matches!(
            self,
            Self::Handshake | Self::HandshakeAck | Self::Keepalive | Self::GoAway
        )
    }
}

/// First frame sent by the dialing side
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeFrame {
    pub token: String,
    pub version: u8,
    pub capabilities: Vec<String>,
    /// Route keys the client is able to serve
    pub routes: Vec<String>,
    /// Per-stream receive window of the sender
    pub window: u32,
}

/// Server reply to a successful handshake
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeAckFrame {
    pub session_id: Uuid,
    pub version: u8,
    pub capabilities: Vec<String>,
    pub window: u32,
}

/// Request metadata carried by an `Open` frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RequestHead {
    pub method: String,
    /// Path and query of the public request
    pub uri: String,
    pub route_key: String,
    pub headers: WireHeaders,
}

/// Response metadata carried by a `Reply` frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: WireHeaders,
}

/// Reason codes carried by `Error` frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    AuthenticationFailed = 1,
    MalformedFrame = 2,
    NoMatchingUpstream = 3,
    NoTunnelConnected = 4,
    StreamTimeout = 5,
    UpstreamTimeout = 6,
    SessionClosing = 7,
    UpstreamUnavailable = 8,
    FlowControl = 9,
    StreamRefused = 10,
    Cancelled = 11,
    Internal = 12,
}

impl ErrorCode {
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            1 => Self::AuthenticationFailed,
            2 => Self::MalformedFrame,
            3 => Self::NoMatchingUpstream,
            4 => Self::NoTunnelConnected,
            5 => Self::StreamTimeout,
            6 => Self::UpstreamTimeout,
            7 => Self::SessionClosing,
            8 => Self::UpstreamUnavailable,
            9 => Self::FlowControl,
            10 => Self::StreamRefused,
            11 => Self::Cancelled,
            12 => Self::Internal,
            _ => return None,
        })
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthenticationFailed => "AuthenticationFailed",
            Self::MalformedFrame => "MalformedFrame",
            Self::NoMatchingUpstream => "NoMatchingUpstream",
            Self::NoTunnelConnected => "NoTunnelConnected",
            Self::StreamTimeout => "StreamTimeout",
            Self::UpstreamTimeout => "UpstreamTimeout",
            Self::SessionClosing => "SessionClosing",
            Self::UpstreamUnavailable => "UpstreamUnavailable",
            Self::FlowControl => "FlowControl",
            Self::StreamRefused => "StreamRefused",
            Self::Cancelled => "Cancelled",
            Self::Internal => "Internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire protocol frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Handshake(Box<HandshakeFrame>),
    HandshakeAck(Box<HandshakeAckFrame>),

    /// Start of a request; allocated by the server
    Open {
        stream_id: StreamId,
        head: Box<RequestHead>,
    },

    /// Start of the response on an open stream
    Reply {
        stream_id: StreamId,
        head: Box<ResponseHead>,
    },

    Data {
        stream_id: StreamId,
        data: Bytes,
    },

    /// The sender will write no more data on this stream
    HalfClose {
        stream_id: StreamId,
    },

    /// Receive credit returned to the sender of data
    WindowUpdate {
        stream_id: StreamId,
        increment: u32,
    },

    /// Stream id 0 refers to the whole session
    Error {
        stream_id: StreamId,
        code: ErrorCode,
        message: String,
    },

    Keepalive {
        timestamp: u64,
    },

    /// The sender is draining and will accept no further streams
    GoAway {
        last_stream_id: StreamId,
    },
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Handshake(_) => FrameKind::Handshake,
            Frame::HandshakeAck(_) => FrameKind::HandshakeAck,
            Frame::Open { .. } => FrameKind::Open,
            Frame::Reply { .. } => FrameKind::Reply,
            Frame::Data { .. } => FrameKind::Data,
            Frame::HalfClose { .. } => FrameKind::HalfClose,
            Frame::WindowUpdate { .. } => FrameKind::WindowUpdate,
            Frame::Error { .. } => FrameKind::Error,
            Frame::Keepalive { .. } => FrameKind::Keepalive,
            Frame::GoAway { .. } => FrameKind::GoAway,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        match self {
            Frame::Open { stream_id, .. }
            | Frame::Reply { stream_id, .. }
            | Frame::Data { stream_id, .. }
            | Frame::HalfClose { stream_id }
            | Frame::WindowUpdate { stream_id, .. }
            | Frame::Error { stream_id, .. } => *stream_id,
            Frame::Handshake(_)
            | Frame::HandshakeAck(_)
            | Frame::Keepalive { .. }
            | Frame::GoAway { .. } => 0,
        }
    }

    /// Keepalive stamped with the current wall clock
    pub fn keepalive() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Frame::Keepalive { timestamp }
    }

    pub fn error(stream_id: StreamId, code: ErrorCode, message: impl Into<String>) -> Self {
        Frame::Error {
            stream_id,
            code,
            message: message.into(),
        }
    }
}
