//! Session driver
//!
//! One task per session owns the stream table. The reader loop, handles and
//! the public [`ControlSession`](super::ControlSession) reach it only through
//! the command channel, so the table needs no lock.
//!
//! The driver never waits for room on the outbound queue: frames it
//! originates go through a local outbox that is flushed as capacity frees
//! up, so inbound frames keep being read while the writer is backed up.

use super::state::{SessionState, StateCell};
use super::{IncomingStream, Role};
use crate::stream::{ActivityClock, StreamEvent, StreamHandle, StreamShared};
use crate::transport::FrameReceiver;
use kanal::AsyncSender;
use poglets_common::{Result, SessionConfig, TunnelError};
use poglets_protocol::constants::SESSION_STREAM_ID;
use poglets_protocol::{ErrorCode, Frame, RequestHead, ResponseHead, StreamId};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Requests from handles to the driver.
#[derive(Debug)]
pub(crate) enum Command {
    Open {
        head: RequestHead,
        reply: oneshot::Sender<Result<StreamHandle>>,
    },
    /// The reader took `bytes` of body out of its queue
    Consumed { id: StreamId, bytes: u32 },
    CloseWrite { id: StreamId },
    ReaderDropped { id: StreamId },
    Reset {
        id: StreamId,
        code: ErrorCode,
        message: String,
    },
    Drain,
    Close,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the connection
    PeerClosed,
    /// Drain finished or its deadline elapsed
    Drained,
    /// Closed through [`ControlSession::close`](super::ControlSession::close)
    LocalClose,
    KeepaliveTimeout,
    Transport(String),
    Protocol(String),
    /// The peer sent a session-level error
    PeerError(String),
}

impl CloseReason {
    /// Closed at the request of the local side.
    pub fn is_local(&self) -> bool {
        matches!(self, CloseReason::LocalClose)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => f.write_str("peer closed the connection"),
            CloseReason::Drained => f.write_str("drained"),
            CloseReason::LocalClose => f.write_str("closed locally"),
            CloseReason::KeepaliveTimeout => f.write_str("keepalive timeout"),
            CloseReason::Transport(msg) => write!(f, "transport error: {msg}"),
            CloseReason::Protocol(msg) => write!(f, "protocol violation: {msg}"),
            CloseReason::PeerError(msg) => write!(f, "peer error: {msg}"),
        }
    }
}

struct StreamSlot {
    shared: Arc<StreamShared>,
    events: AsyncSender<StreamEvent>,
    /// Delivered to the reader, not yet consumed
    buffered: u32,
    /// Consumed, not yet returned to the peer
    pending_credit: u32,
    remote_done: bool,
    local_done: bool,
    reader_gone: bool,
    reply_seen: bool,
    /// Complete response must arrive before this instant
    deadline: Option<Instant>,
}

impl StreamSlot {
    fn new(shared: Arc<StreamShared>, events: AsyncSender<StreamEvent>) -> Self {
        Self {
            shared,
            events,
            buffered: 0,
            pending_credit: 0,
            remote_done: false,
            local_done: false,
            reader_gone: false,
            reply_seen: false,
            deadline: None,
        }
    }

    fn unacked(&self) -> u64 {
        u64::from(self.buffered) + u64::from(self.pending_credit)
    }
}

/// Outcome of one handler: keep going or end the session.
type Step = std::result::Result<(), CloseReason>;

/// A frame waiting in the outbox. An `Open` carries the handle that is
/// released to the opener once the frame is queued ahead of any body data.
struct Outgoing {
    frame: Frame,
    opened: Option<(StreamHandle, oneshot::Sender<Result<StreamHandle>>)>,
}

impl Outgoing {
    /// Hand the frame to the writer queue and release the opener, if any.
    fn deliver(self, permit: mpsc::OwnedPermit<Frame>) {
        permit.send(self.frame);
        if let Some((handle, reply)) = self.opened {
            let _ = reply.send(Ok(handle));
        }
    }
}

pub(crate) struct Driver {
    role: Role,
    session_id: Uuid,
    config: SessionConfig,
    peer_window: u32,
    max_chunk: usize,
    state: StateCell,
    frames: mpsc::Sender<Frame>,
    commands: mpsc::UnboundedSender<Command>,
    incoming: Option<AsyncSender<IncomingStream>>,
    outbound: Arc<ActivityClock>,
    active_streams: Arc<AtomicUsize>,
    cancel: CancellationToken,
    streams: HashMap<StreamId, StreamSlot>,
    outbox: VecDeque<Outgoing>,
    next_stream_id: StreamId,
    last_remote_id: StreamId,
    last_inbound: Instant,
    drain_deadline: Option<Instant>,
}

impl Driver {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        role: Role,
        session_id: Uuid,
        config: SessionConfig,
        peer_window: u32,
        state: StateCell,
        frames: mpsc::Sender<Frame>,
        commands: mpsc::UnboundedSender<Command>,
        incoming: Option<AsyncSender<IncomingStream>>,
        outbound: Arc<ActivityClock>,
        active_streams: Arc<AtomicUsize>,
        cancel: CancellationToken,
    ) -> Self {
        let max_chunk = poglets_protocol::constants::MAX_DATA_CHUNK
            .min(peer_window as usize)
            .max(1);
        Self {
            role,
            session_id,
            config,
            peer_window,
            max_chunk,
            state,
            frames,
            commands,
            incoming,
            outbound,
            active_streams,
            cancel,
            streams: HashMap::new(),
            outbox: VecDeque::new(),
            next_stream_id: 1,
            last_remote_id: 0,
            last_inbound: Instant::now(),
            drain_deadline: None,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut receiver: Box<dyn FrameReceiver>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) -> CloseReason {
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            let step = tokio::select! {
                () = self.cancel.cancelled() => Err(CloseReason::Transport(
                    "control connection writer stopped".to_string(),
                )),
                frame = receiver.recv() => match frame {
                    Ok(Some(frame)) => {
                        self.last_inbound = Instant::now();
                        self.on_frame(frame)
                    }
                    Ok(None) => Err(CloseReason::PeerClosed),
                    Err(TunnelError::Protocol(msg)) => Err(CloseReason::Protocol(msg)),
                    Err(e) => Err(CloseReason::Transport(e.to_string())),
                },
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => Err(CloseReason::LocalClose),
                },
                permit = self.frames.clone().reserve_owned(), if !self.outbox.is_empty() => {
                    match permit {
                        Ok(permit) => {
                            if let Some(next) = self.outbox.pop_front() {
                                next.deliver(permit);
                            }
                            Ok(())
                        }
                        Err(_) => Err(CloseReason::Transport(
                            "control connection writer stopped".to_string(),
                        )),
                    }
                }
                _ = ticker.tick() => self.on_tick(),
            };

            if let Err(reason) = step {
                break reason;
            }
            self.flush_outbox();
            if self.state.get() == SessionState::Draining
                && self.streams.is_empty()
                && self.outbox.is_empty()
            {
                break CloseReason::Drained;
            }
        };

        self.shutdown(&reason);
        reason
    }

    fn on_frame(&mut self, frame: Frame) -> Step {
        match frame {
            Frame::Open { stream_id, head } => self.on_remote_open(stream_id, *head),
            Frame::Reply { stream_id, head } => self.on_reply(stream_id, *head),
            Frame::Data { stream_id, data } => {
                let Some(slot) = self.streams.get_mut(&stream_id) else {
                    warn!(
                        "Discarding {} bytes for unknown stream {stream_id}",
                        data.len()
                    );
                    return Ok(());
                };
                if slot.remote_done {
                    warn!(
                        "Discarding {} bytes for stream {stream_id} after the peer's half-close",
                        data.len()
                    );
                    return Ok(());
                }
                slot.shared.activity.touch();
                let len = data.len() as u64;
                if slot.unacked() + len > u64::from(self.config.stream_window) {
                    return self.fail_stream(
                        stream_id,
                        ErrorCode::FlowControl,
                        "peer exceeded the stream window",
                        true,
                    );
                }
                let len = len as u32;
                if slot.reader_gone {
                    slot.pending_credit += len;
                    return self.return_credit(stream_id);
                }
                slot.buffered += len;
                if slot.events.try_send(StreamEvent::Data(data)).is_err() {
                    slot.reader_gone = true;
                }
                Ok(())
            }
            Frame::HalfClose { stream_id } => {
                let Some(slot) = self.streams.get_mut(&stream_id) else {
                    debug!("Half-close for unknown stream {stream_id}");
                    return Ok(());
                };
                if slot.remote_done {
                    warn!("Ignoring duplicate half-close for stream {stream_id}");
                    return Ok(());
                }
                slot.shared.activity.touch();
                slot.remote_done = true;
                let _ = slot.events.try_send(StreamEvent::End);
                self.maybe_retire(stream_id)
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                let Some(slot) = self.streams.get(&stream_id) else {
                    return Ok(());
                };
                let available = slot.shared.send_window.available_permits() as u64;
                if available + u64::from(increment) > u64::from(self.peer_window) {
                    return self.fail_stream(
                        stream_id,
                        ErrorCode::FlowControl,
                        "window update beyond the advertised window",
                        true,
                    );
                }
                slot.shared.send_window.add_permits(increment as usize);
                Ok(())
            }
            Frame::Error {
                stream_id: SESSION_STREAM_ID,
                code,
                message,
            } => Err(CloseReason::PeerError(format!("{code}: {message}"))),
            Frame::Error {
                stream_id,
                code,
                message,
            } => {
                debug!("Stream {stream_id} reset by peer: {code} {message}");
                self.terminate(stream_id, code, &message);
                Ok(())
            }
            Frame::Keepalive { .. } => Ok(()),
            Frame::GoAway { last_stream_id } => {
                debug!("Peer is going away after stream {last_stream_id}");
                self.begin_drain(false);
                Ok(())
            }
            Frame::Handshake(_) | Frame::HandshakeAck(_) => Err(CloseReason::Protocol(
                "handshake frame on an established session".to_string(),
            )),
        }
    }

    fn on_remote_open(&mut self, id: StreamId, head: RequestHead) -> Step {
        if self.role == Role::Server {
            return Err(CloseReason::Protocol(
                "client attempted to open a stream".to_string(),
            ));
        }
        if id <= self.last_remote_id {
            return Err(CloseReason::Protocol(format!(
                "stream id {id} reused or out of order"
            )));
        }
        self.last_remote_id = id;

        if self.state.get() != SessionState::Active {
            self.send(Frame::error(
                id,
                ErrorCode::SessionClosing,
                "session is draining",
            ));
            return Ok(());
        }
        if self.streams.len() >= self.config.max_streams {
            self.send(Frame::error(
                id,
                ErrorCode::StreamRefused,
                "too many concurrent streams",
            ));
            return Ok(());
        }

        let handle = self.insert_stream(id, None);
        let accepted = match &self.incoming {
            Some(incoming) => incoming
                .try_send(IncomingStream {
                    head,
                    stream: handle,
                })
                .unwrap_or(false),
            None => false,
        };
        if !accepted {
            return self.fail_stream(id, ErrorCode::StreamRefused, "no stream acceptor", true);
        }
        debug!("Accepted stream {id}");
        Ok(())
    }

    fn on_reply(&mut self, id: StreamId, head: ResponseHead) -> Step {
        if self.role == Role::Client {
            return Err(CloseReason::Protocol(
                "server sent a response head".to_string(),
            ));
        }
        let Some(slot) = self.streams.get_mut(&id) else {
            debug!("Reply for unknown stream {id}");
            return Ok(());
        };
        if slot.reply_seen {
            return self.fail_stream(id, ErrorCode::MalformedFrame, "duplicate reply", true);
        }
        slot.reply_seen = true;
        slot.shared.activity.touch();
        let _ = slot.events.try_send(StreamEvent::Reply(head));
        Ok(())
    }

    fn on_command(&mut self, command: Command) -> Step {
        match command {
            Command::Open { head, reply } => {
                self.open_local(head, reply);
                Ok(())
            }
            Command::Consumed { id, bytes } => {
                let Some(slot) = self.streams.get_mut(&id) else {
                    return Ok(());
                };
                slot.buffered = slot.buffered.saturating_sub(bytes);
                slot.pending_credit += bytes;
                self.return_credit(id)
            }
            Command::CloseWrite { id } => {
                let Some(slot) = self.streams.get_mut(&id) else {
                    return Ok(());
                };
                if slot.local_done {
                    return Ok(());
                }
                slot.local_done = true;
                self.send(Frame::HalfClose { stream_id: id });
                self.maybe_retire(id)
            }
            Command::ReaderDropped { id } => {
                let Some(slot) = self.streams.get_mut(&id) else {
                    return Ok(());
                };
                slot.reader_gone = true;
                slot.pending_credit += slot.buffered;
                slot.buffered = 0;
                self.return_credit(id)?;
                self.maybe_retire(id)
            }
            Command::Reset { id, code, message } => {
                if self.streams.contains_key(&id) {
                    self.fail_stream(id, code, &message, true)?;
                }
                Ok(())
            }
            Command::Drain => {
                self.begin_drain(true);
                Ok(())
            }
            Command::Close => Err(CloseReason::LocalClose),
        }
    }

    /// Allocate a stream and queue its `Open`. The handle reaches the opener
    /// only once the frame is in the writer queue, so body data cannot
    /// overtake it.
    fn open_local(&mut self, head: RequestHead, reply: oneshot::Sender<Result<StreamHandle>>) {
        if self.role == Role::Client {
            let _ = reply.send(Err(TunnelError::InvalidState(
                "only the server opens streams".to_string(),
            )));
            return;
        }
        if self.state.get() != SessionState::Active {
            let _ = reply.send(Err(TunnelError::SessionClosing));
            return;
        }
        if self.streams.len() >= self.config.max_streams {
            let _ = reply.send(Err(TunnelError::StreamReset {
                code: ErrorCode::StreamRefused,
                message: "too many concurrent streams".to_string(),
            }));
            return;
        }

        let id = self.next_stream_id;
        let Some(next) = id.checked_add(1) else {
            warn!("Stream ids exhausted on session {}", self.session_id);
            self.begin_drain(true);
            let _ = reply.send(Err(TunnelError::SessionClosing));
            return;
        };
        self.next_stream_id = next;

        let deadline = Some(Instant::now() + self.config.response_deadline);
        let handle = self.insert_stream(id, deadline);
        debug!("Opened stream {id}");
        self.enqueue(Outgoing {
            frame: Frame::Open {
                stream_id: id,
                head: Box::new(head),
            },
            opened: Some((handle, reply)),
        });
    }

    fn insert_stream(&mut self, id: StreamId, deadline: Option<Instant>) -> StreamHandle {
        let shared = Arc::new(StreamShared::new(id, self.peer_window));
        shared.activity.touch();
        let (events_tx, events_rx) = kanal::unbounded_async();

        let mut slot = StreamSlot::new(shared.clone(), events_tx);
        slot.deadline = deadline;
        self.streams.insert(id, slot);
        self.active_streams
            .store(self.streams.len(), Ordering::Relaxed);

        StreamHandle::new(
            shared,
            self.frames.clone(),
            self.commands.clone(),
            events_rx,
            self.max_chunk,
        )
    }

    /// Send accumulated credit once half the window has been consumed.
    fn return_credit(&mut self, id: StreamId) -> Step {
        let threshold = (self.config.stream_window / 2).max(1);
        let Some(slot) = self.streams.get_mut(&id) else {
            return Ok(());
        };
        if slot.remote_done || slot.pending_credit < threshold {
            return Ok(());
        }
        let increment = std::mem::take(&mut slot.pending_credit);
        self.send(Frame::WindowUpdate {
            stream_id: id,
            increment,
        });
        Ok(())
    }

    fn maybe_retire(&mut self, id: StreamId) -> Step {
        let Some(slot) = self.streams.get(&id) else {
            return Ok(());
        };
        if slot.local_done && slot.remote_done {
            if let Some(slot) = self.streams.remove(&id) {
                self.active_streams
                    .store(self.streams.len(), Ordering::Relaxed);
                slot.shared.release();
            }
            debug!("Stream {id} complete");
            return Ok(());
        }
        if slot.local_done && slot.reader_gone {
            return self.fail_stream(id, ErrorCode::Cancelled, "reader went away", true);
        }
        Ok(())
    }

    /// Remove a stream, wake its handles with the failure and tell the peer.
    fn fail_stream(
        &mut self,
        id: StreamId,
        code: ErrorCode,
        message: &str,
        notify_peer: bool,
    ) -> Step {
        if self.terminate(id, code, message) && notify_peer {
            self.send(Frame::error(id, code, message));
        }
        Ok(())
    }

    fn terminate(&mut self, id: StreamId, code: ErrorCode, message: &str) -> bool {
        let Some(slot) = self.streams.remove(&id) else {
            return false;
        };
        self.active_streams
            .store(self.streams.len(), Ordering::Relaxed);
        slot.shared.fail(code, message);
        let _ = slot
            .events
            .try_send(StreamEvent::Failed(TunnelError::from_code(code, message)));
        debug!("Stream {id} failed: {code} {message}");
        true
    }

    fn begin_drain(&mut self, announce: bool) {
        if self.state.get() != SessionState::Active {
            return;
        }
        if self.state.advance(SessionState::Draining).is_err() {
            return;
        }
        info!(
            "Session {} draining with {} open streams",
            self.session_id,
            self.streams.len()
        );
        self.drain_deadline = Some(Instant::now() + self.config.drain_timeout);
        if announce {
            self.send(Frame::GoAway {
                last_stream_id: self.last_remote_id,
            });
        }
    }

    fn on_tick(&mut self) -> Step {
        let now = Instant::now();
        if now.duration_since(self.last_inbound) >= self.config.keepalive_timeout {
            return Err(CloseReason::KeepaliveTimeout);
        }
        if self.outbox.is_empty()
            && self.outbound.idle_for() >= self.config.keepalive_interval
            && self.frames.try_send(Frame::keepalive()).is_ok()
        {
            self.outbound.touch();
        }

        let mut expired = Vec::new();
        for (id, slot) in &self.streams {
            if slot.shared.activity.idle_for() >= self.config.stream_idle_timeout {
                expired.push((*id, ErrorCode::StreamTimeout, "stream idle timeout"));
            } else if !slot.remote_done && slot.deadline.is_some_and(|d| now >= d) {
                expired.push((*id, ErrorCode::UpstreamTimeout, "response deadline exceeded"));
            }
        }
        for (id, code, message) in expired {
            self.fail_stream(id, code, message, true)?;
        }

        if self.drain_deadline.is_some_and(|d| now >= d) {
            let remaining: Vec<StreamId> = self.streams.keys().copied().collect();
            for id in remaining {
                self.fail_stream(id, ErrorCode::SessionClosing, "drain deadline elapsed", true)?;
            }
            return Err(CloseReason::Drained);
        }
        Ok(())
    }

    /// Queue a driver-originated frame without waiting for the writer.
    fn send(&mut self, frame: Frame) {
        self.enqueue(Outgoing {
            frame,
            opened: None,
        });
    }

    fn enqueue(&mut self, outgoing: Outgoing) {
        self.outbox.push_back(outgoing);
        self.flush_outbox();
    }

    /// Move outbox frames into the writer queue while it has room.
    fn flush_outbox(&mut self) {
        while !self.outbox.is_empty() {
            match self.frames.clone().try_reserve_owned() {
                Ok(permit) => {
                    if let Some(next) = self.outbox.pop_front() {
                        next.deliver(permit);
                    }
                }
                Err(TrySendError::Full(_)) => return,
                Err(TrySendError::Closed(_)) => {
                    debug!("Writer gone; dropping {} queued frames", self.outbox.len());
                    self.outbox.clear();
                    return;
                }
            }
        }
    }

    fn shutdown(&mut self, reason: &CloseReason) {
        // Best effort: control frames still queued (GoAway, stream errors)
        // go out ahead of the writer's final flush. Unsent opens are dropped.
        for outgoing in std::mem::take(&mut self.outbox) {
            if outgoing.opened.is_none() && self.frames.try_send(outgoing.frame).is_err() {
                break;
            }
        }
        if let CloseReason::Protocol(msg) = reason {
            warn!("Session {} protocol violation: {msg}", self.session_id);
            let _ = self.frames.try_send(Frame::error(
                SESSION_STREAM_ID,
                ErrorCode::MalformedFrame,
                msg.clone(),
            ));
        }

        let in_flight = self.streams.len();
        self.active_streams.store(0, Ordering::Relaxed);
        for (_, slot) in self.streams.drain() {
            slot.shared.fail(ErrorCode::SessionClosing, "session closed");
            let _ = slot
                .events
                .try_send(StreamEvent::Failed(TunnelError::SessionClosing));
        }
        self.incoming = None;
        self.state.close();
        self.cancel.cancel();

        info!(
            "Session {} closed ({reason}); {in_flight} streams failed",
            self.session_id
        );
    }
}
