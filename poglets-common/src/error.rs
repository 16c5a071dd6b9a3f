//! Error types for poglets

use poglets_protocol::{ErrorCode, ProtocolError};
use thiserror::Error;

/// Main error type for tunnel operations
#[derive(Error, Debug)]
pub enum TunnelError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed frame or protocol violation
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Configuration error, reported before any network activity
    #[error("Configuration error: {0}")]
    Config(String),

    /// No upstream is configured for the route key
    #[error("No matching upstream for route {0:?}")]
    NoMatchingUpstream(String),

    /// No control session is currently active
    #[error("No tunnel connected")]
    NoTunnelConnected,

    /// Stream saw no traffic within its idle timeout
    #[error("Stream timeout: {0}")]
    StreamTimeout(String),

    /// Response was not complete before the stream deadline
    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    /// The owning session is draining or has closed
    #[error("Session closing")]
    SessionClosing,

    /// Stream terminated by the peer
    #[error("Stream reset by peer ({code}): {message}")]
    StreamReset { code: ErrorCode, message: String },

    /// Connection error
    #[error("Connection failed: {0}")]
    Connection(String),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    /// Rebuild an error received in an `Error` frame.
    pub fn from_code(code: ErrorCode, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            ErrorCode::AuthenticationFailed => TunnelError::Authentication(message),
            ErrorCode::MalformedFrame => TunnelError::Protocol(message),
            ErrorCode::NoMatchingUpstream => TunnelError::NoMatchingUpstream(message),
            ErrorCode::NoTunnelConnected => TunnelError::NoTunnelConnected,
            ErrorCode::StreamTimeout => TunnelError::StreamTimeout(message),
            ErrorCode::UpstreamTimeout => TunnelError::UpstreamTimeout(message),
            ErrorCode::SessionClosing => TunnelError::SessionClosing,
            code => TunnelError::StreamReset { code, message },
        }
    }

    /// Wire code used when this error is reported to the peer.
    pub fn code(&self) -> ErrorCode {
        match self {
            TunnelError::Protocol(_) => ErrorCode::MalformedFrame,
            TunnelError::Authentication(_) => ErrorCode::AuthenticationFailed,
            TunnelError::NoMatchingUpstream(_) => ErrorCode::NoMatchingUpstream,
            TunnelError::NoTunnelConnected => ErrorCode::NoTunnelConnected,
            TunnelError::StreamTimeout(_) => ErrorCode::StreamTimeout,
            TunnelError::UpstreamTimeout(_) => ErrorCode::UpstreamTimeout,
            TunnelError::SessionClosing => ErrorCode::SessionClosing,
            TunnelError::StreamReset { code, .. } => *code,
            TunnelError::Connection(_) | TunnelError::Tls(_) => ErrorCode::UpstreamUnavailable,
            TunnelError::Io(_) | TunnelError::Config(_) | TunnelError::InvalidState(_) => {
                ErrorCode::Internal
            }
        }
    }

    /// Configuration errors are fatal; everything else is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TunnelError::Config(_))
    }
}

impl From<ProtocolError> for TunnelError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => TunnelError::Io(e),
            other => TunnelError::Protocol(other.to_string()),
        }
    }
}
