//! Protocol constants

/// Current protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Minimum protocol version a server will accept
pub const MIN_PROTOCOL_VERSION: u8 = 1;

/// Size of the fixed frame header: length (4) + kind (1) + stream id (4)
pub const FRAME_HEADER_LEN: usize = 9;

/// Maximum payload size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Largest body chunk carried by a single data frame
pub const MAX_DATA_CHUNK: usize = 16 * 1024;

/// Default per-stream receive window advertised in the handshake (256 KiB)
pub const DEFAULT_STREAM_WINDOW: u32 = 256 * 1024;

/// Stream identifier reserved for session-control frames
pub const SESSION_STREAM_ID: u32 = 0;

/// Capability advertised by a client that only forwards explicitly configured routes
pub const CAP_STRICT_FORWARDING: &str = "strict-forwarding";

/// Capability advertised by a server that wants response headers normalised
pub const CAP_TRANSPORT_WRAPPING: &str = "transport-wrapping";
