//! [`FrameReceiver`] and [`FrameSink`] over plain async IO.

use super::{FrameReceiver, FrameSink, Transport};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::StreamExt;
use poglets_common::Result;
use poglets_protocol::codec::TunnelCodec;
use poglets_protocol::Frame;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::FramedRead;

/// Receives frames from a framed read stream.
pub struct IoFrameReceiver<R> {
    stream: FramedRead<R, TunnelCodec>,
}

impl<R> IoFrameReceiver<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(reader: R) -> Self {
        Self {
            stream: FramedRead::new(reader, TunnelCodec::new()),
        }
    }
}

impl<R> FrameReceiver for IoFrameReceiver<R>
where
    R: AsyncRead + Unpin + Send,
{
    fn recv(&mut self) -> BoxFuture<'_, Result<Option<Frame>>> {
        Box::pin(async move {
            match self.stream.next().await {
                Some(Ok(frame)) => Ok(Some(frame)),
                Some(Err(e)) => Err(e.into()),
                None => Ok(None),
            }
        })
    }
}

/// Writes frame batches straight to the underlying writer.
pub struct IoFrameSink<W> {
    writer: W,
}

impl<W> IoFrameSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W> FrameSink for IoFrameSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn send_batch(&mut self, batch: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.writer.write_all(&batch).await?;
            self.writer.flush().await?;
            Ok(())
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.writer.shutdown().await?;
            Ok(())
        })
    }
}

/// Split any duplex byte stream into a frame transport.
pub fn io_transport<S>(io: S) -> Transport
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(io);
    Transport::new(
        Box::new(IoFrameReceiver::new(reader)),
        Box::new(IoFrameSink::new(writer)),
    )
}
