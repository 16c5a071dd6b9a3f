use std::io;

/// Errors raised while encoding or decoding frames
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("frame too large: {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        ProtocolError::MalformedFrame(reason.into())
    }
}

impl From<bincode_next::error::EncodeError> for ProtocolError {
    fn from(err: bincode_next::error::EncodeError) -> Self {
        ProtocolError::MalformedFrame(format!("encode error: {err}"))
    }
}

impl From<bincode_next::error::DecodeError> for ProtocolError {
    fn from(err: bincode_next::error::DecodeError) -> Self {
        ProtocolError::MalformedFrame(format!("decode error: {err}"))
    }
}
