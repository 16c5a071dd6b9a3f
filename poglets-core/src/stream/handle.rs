use super::{StreamEvent, StreamShared};
use crate::session::Command;
use bytes::Bytes;
use futures::Stream;
use kanal::AsyncReceiver;
use poglets_common::{Result, TunnelError};
use poglets_protocol::{ErrorCode, Frame, ResponseHead, StreamId};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Both directions of one stream.
pub struct StreamHandle {
    writer: StreamWriter,
    reader: StreamReader,
}

impl StreamHandle {
    pub(crate) fn new(
        shared: Arc<StreamShared>,
        frames: mpsc::Sender<Frame>,
        commands: mpsc::UnboundedSender<Command>,
        events: AsyncReceiver<StreamEvent>,
        max_chunk: usize,
    ) -> Self {
        let id = shared.id;
        Self {
            writer: StreamWriter {
                id,
                shared: shared.clone(),
                frames,
                commands: commands.clone(),
                max_chunk: max_chunk.max(1),
                closed: false,
            },
            reader: StreamReader {
                id,
                shared,
                events,
                commands,
                finished: false,
            },
        }
    }

    pub fn id(&self) -> StreamId {
        self.writer.id
    }

    pub fn split(self) -> (StreamWriter, StreamReader) {
        (self.writer, self.reader)
    }
}

/// Outbound half: body bytes limited by the peer's window.
pub struct StreamWriter {
    id: StreamId,
    shared: Arc<StreamShared>,
    frames: mpsc::Sender<Frame>,
    commands: mpsc::UnboundedSender<Command>,
    max_chunk: usize,
    closed: bool,
}

impl StreamWriter {
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Send the response head. Client side only.
    pub async fn reply(&mut self, head: ResponseHead) -> Result<()> {
        self.ensure_open()?;
        self.frames
            .send(Frame::Reply {
                stream_id: self.id,
                head: Box::new(head),
            })
            .await
            .map_err(|_| TunnelError::SessionClosing)?;
        self.shared.activity.touch();
        Ok(())
    }

    /// Send body bytes, waiting for window credit as needed.
    pub async fn write_body(&mut self, mut data: Bytes) -> Result<()> {
        self.ensure_open()?;
        while !data.is_empty() {
            let chunk = data.split_to(data.len().min(self.max_chunk));
            let permits = self
                .shared
                .send_window
                .acquire_many(chunk.len() as u32)
                .await
                .map_err(|_| self.shared.failure())?;
            permits.forget();

            self.frames
                .send(Frame::Data {
                    stream_id: self.id,
                    data: chunk,
                })
                .await
                .map_err(|_| TunnelError::SessionClosing)?;
            self.shared.activity.touch();
        }
        Ok(())
    }

    /// Signal the end of this direction. Further writes fail.
    pub fn close_write(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.commands.send(Command::CloseWrite { id: self.id });
        }
    }

    /// Abort the stream and report `err` to the peer.
    pub fn reset(mut self, err: &TunnelError) {
        self.closed = true;
        let _ = self.commands.send(Command::Reset {
            id: self.id,
            code: err.code(),
            message: err.to_string(),
        });
    }

    /// Cancelled when the stream fails for any reason.
    pub fn cancellation(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shared.cancel.is_cancelled() {
            return Err(self.shared.failure());
        }
        if self.closed {
            return Err(TunnelError::InvalidState(format!(
                "stream {} already closed for writing",
                self.id
            )));
        }
        Ok(())
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.commands.send(Command::Reset {
                id: self.id,
                code: ErrorCode::Cancelled,
                message: "stream writer dropped".to_string(),
            });
        }
    }
}

/// Inbound half: events in the order the peer wrote them.
pub struct StreamReader {
    id: StreamId,
    shared: Arc<StreamShared>,
    events: AsyncReceiver<StreamEvent>,
    commands: mpsc::UnboundedSender<Command>,
    finished: bool,
}

impl StreamReader {
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Next event, or `None` after `End` or `Failed` was returned.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        let event = match self.events.recv().await {
            Ok(event) => event,
            Err(_) => StreamEvent::Failed(self.shared.failure()),
        };
        match &event {
            StreamEvent::Data(data) => {
                self.shared.activity.touch();
                let _ = self.commands.send(Command::Consumed {
                    id: self.id,
                    bytes: data.len() as u32,
                });
            }
            StreamEvent::End | StreamEvent::Failed(_) => self.finished = true,
            StreamEvent::Reply(_) => self.shared.activity.touch(),
        }
        Some(event)
    }

    /// Wait for the response head. Server side only.
    pub async fn response_head(&mut self) -> Result<ResponseHead> {
        match self.next_event().await {
            Some(StreamEvent::Reply(head)) => Ok(head),
            Some(StreamEvent::Failed(err)) => Err(err),
            Some(StreamEvent::End) => Err(TunnelError::Protocol(format!(
                "stream {} ended before a response head",
                self.id
            ))),
            Some(StreamEvent::Data(_)) => Err(TunnelError::Protocol(format!(
                "stream {} sent data before a response head",
                self.id
            ))),
            None => Err(TunnelError::InvalidState(format!(
                "stream {} already finished",
                self.id
            ))),
        }
    }

    /// Next body chunk; `None` at end of stream.
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        match self.next_event().await? {
            StreamEvent::Data(data) => Some(Ok(data)),
            StreamEvent::End => None,
            StreamEvent::Failed(err) => Some(Err(err)),
            StreamEvent::Reply(_) => Some(Err(TunnelError::Protocol(format!(
                "unexpected response head on stream {}",
                self.id
            )))),
        }
    }

    /// Single-pass body sequence, terminated by end of stream or an error.
    pub fn into_body_stream(self) -> impl Stream<Item = Result<Bytes>> + Send + 'static {
        futures::stream::unfold(self, |mut reader| async move {
            let chunk = reader.next_chunk().await?;
            Some((chunk, reader))
        })
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle").field("id", &self.id()).finish()
    }
}

impl fmt::Debug for StreamWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamWriter")
            .field("id", &self.id)
            .field("closed", &self.closed)
            .finish()
    }
}

impl fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamReader")
            .field("id", &self.id)
            .field("finished", &self.finished)
            .finish()
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.commands.send(Command::ReaderDropped { id: self.id });
        }
    }
}
