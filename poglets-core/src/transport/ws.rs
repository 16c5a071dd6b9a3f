//! WebSocket control transport
//!
//! Binary messages carry whole frames, possibly several per message. The
//! receiver treats them as one byte stream and decodes incrementally.

use super::{socket_tuning, tls, FrameReceiver, FrameSink, Transport};
use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use poglets_common::{Result, TunnelError};
use poglets_protocol::codec::TunnelCodec;
use poglets_protocol::Frame;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{Connector, WebSocketStream};
use tokio_util::codec::Decoder;
use tracing::debug;

pub struct WsFrameReceiver<S> {
    stream: SplitStream<WebSocketStream<S>>,
    buffer: BytesMut,
    codec: TunnelCodec,
}

impl<S> FrameReceiver for WsFrameReceiver<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn recv(&mut self) -> BoxFuture<'_, Result<Option<Frame>>> {
        Box::pin(async move {
            loop {
                if let Some(frame) = self.codec.decode(&mut self.buffer)? {
                    return Ok(Some(frame));
                }
                match self.stream.next().await {
                    Some(Ok(Message::Binary(data))) => self.buffer.extend_from_slice(&data),
                    Some(Ok(Message::Close(_))) | None => {
                        if self.buffer.is_empty() {
                            return Ok(None);
                        }
                        return Err(TunnelError::Protocol(format!(
                            "connection closed with {} bytes of a partial frame",
                            self.buffer.len()
                        )));
                    }
                    Some(Ok(Message::Text(_))) => {
                        return Err(TunnelError::Protocol(
                            "text message on control connection".to_string(),
                        ));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(ws_error(e)),
                }
            }
        })
    }
}

pub struct WsFrameSink<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

impl<S> FrameSink for WsFrameSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn send_batch(&mut self, batch: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.sink
                .send(Message::Binary(batch.into()))
                .await
                .map_err(ws_error)
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.sink.close().await.map_err(ws_error) })
    }
}

fn ws_error(err: tungstenite::Error) -> TunnelError {
    match err {
        tungstenite::Error::Io(e) => TunnelError::Io(e),
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TunnelError::Connection("websocket closed".to_string())
        }
        other => TunnelError::Connection(other.to_string()),
    }
}

/// Wrap an upgraded websocket as a frame transport.
pub fn ws_transport<S>(ws: WebSocketStream<S>, remote_addr: Option<SocketAddr>) -> Transport
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    Transport::new(
        Box::new(WsFrameReceiver {
            stream,
            buffer: BytesMut::with_capacity(64 * 1024),
            codec: TunnelCodec::new(),
        }),
        Box::new(WsFrameSink { sink }),
    )
    .with_remote_addr(remote_addr)
}

/// Dial the server's control endpoint (`ws://` or `wss://`).
pub async fn dial(url: &str) -> Result<Transport> {
    let connector = if url.starts_with("wss://") {
        Some(Connector::Rustls(tls::client_config()?))
    } else if url.starts_with("ws://") {
        None
    } else {
        return Err(TunnelError::Config(format!(
            "control url {url} must start with ws:// or wss://"
        )));
    };

    let (ws, response) =
        tokio_tungstenite::connect_async_tls_with_config(url, None, true, connector)
            .await
            .map_err(|e| match e {
                tungstenite::Error::Url(e) => {
                    TunnelError::Config(format!("invalid control url {url}: {e}"))
                }
                tungstenite::Error::HttpFormat(e) => {
                    TunnelError::Config(format!("invalid control url {url}: {e}"))
                }
                other => ws_error(other),
            })?;
    debug!("Control websocket established ({})", response.status());
    Ok(ws_transport(ws, None))
}

/// Upgrade an accepted control connection.
pub async fn accept(stream: TcpStream) -> Result<Transport> {
    let remote_addr = stream.peer_addr().ok();
    socket_tuning::configure_socket_silent(&stream);

    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| TunnelError::Connection(format!("websocket upgrade failed: {e}")))?;
    Ok(ws_transport(ws, remote_addr))
}
