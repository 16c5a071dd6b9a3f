//! Transport layer for the control connection
//!
//! A control connection is split into a [`FrameReceiver`] read by the
//! session driver and a [`FrameSink`] owned by the session's single writer
//! task. WebSocket is the production transport; raw IO streams are used
//! for embedding and tests.

use bytes::Bytes;
use futures::future::BoxFuture;
use poglets_common::Result;
use poglets_protocol::Frame;
use std::net::SocketAddr;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod io;
pub mod socket_tuning;
pub mod tls;
pub mod ws;
pub(crate) mod writer;

pub use io::{io_transport, IoFrameReceiver, IoFrameSink};

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Pin<Box<dyn AsyncStream>>;

/// Receives protocol frames from a connection.
pub trait FrameReceiver: Send {
    /// Receive the next frame. Returns `Ok(None)` on a clean close.
    ///
    /// Dropping the returned future must not lose buffered bytes.
    fn recv(&mut self) -> BoxFuture<'_, Result<Option<Frame>>>;
}

/// Writes already-encoded frames to a connection.
pub trait FrameSink: Send {
    /// Write one batch of whole frames.
    fn send_batch(&mut self, batch: Bytes) -> BoxFuture<'_, Result<()>>;

    fn close(&mut self) -> BoxFuture<'_, Result<()>>;
}

/// Both halves of one control connection.
pub struct Transport {
    pub receiver: Box<dyn FrameReceiver>,
    pub sink: Box<dyn FrameSink>,
    pub remote_addr: Option<SocketAddr>,
}

impl Transport {
    pub fn new(receiver: Box<dyn FrameReceiver>, sink: Box<dyn FrameSink>) -> Self {
        Self {
            receiver,
            sink,
            remote_addr: None,
        }
    }

    #[must_use]
    pub fn with_remote_addr(mut self, addr: Option<SocketAddr>) -> Self {
        self.remote_addr = addr;
        self
    }

    /// Encode and write a single frame, bypassing the writer task.
    ///
    /// Only used before the session driver takes over the connection.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let bytes = poglets_protocol::encode(frame)?;
        self.sink.send_batch(bytes).await
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}
