//! Control session: one authenticated control connection and its streams
//!
//! [`connect`] (client) and [`accept`] (server) run the transport setup and
//! the handshake, then spawn the session driver and its writer task. The
//! returned [`ControlSession`] is a cheap, cloneable handle to the driver.

mod driver;
mod handshake;
mod state;
mod store;

pub use driver::CloseReason;
pub(crate) use driver::Command;
pub use handshake::{AcceptPolicy, ClientHello};
pub use state::SessionState;
pub use store::SessionStore;

use crate::router::UpstreamRouter;
use crate::stream::{ActivityClock, StreamHandle};
use crate::transport::writer::run_frame_writer;
use crate::transport::Transport;
use driver::Driver;
use handshake::Negotiated;
use kanal::AsyncReceiver;
use poglets_common::{Result, SessionConfig, TunnelError};
use poglets_protocol::constants::{CAP_STRICT_FORWARDING, CAP_TRANSPORT_WRAPPING};
use poglets_protocol::RequestHead;
use state::StateCell;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepts control connections and opens streams
    Server,
    /// Dials the server and serves the streams it opens
    Client,
}

/// Capability flags negotiated in the handshake
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub strict_forwarding: bool,
    pub transport_wrapping: bool,
}

impl Capabilities {
    /// Unknown names are ignored.
    pub fn from_names(names: &[String]) -> Self {
        let has = |cap: &str| names.iter().any(|n| n == cap);
        Self {
            strict_forwarding: has(CAP_STRICT_FORWARDING),
            transport_wrapping: has(CAP_TRANSPORT_WRAPPING),
        }
    }

    pub fn to_names(self) -> Vec<String> {
        let mut names = Vec::new();
        if self.strict_forwarding {
            names.push(CAP_STRICT_FORWARDING.to_string());
        }
        if self.transport_wrapping {
            names.push(CAP_TRANSPORT_WRAPPING.to_string());
        }
        names
    }

    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self {
            strict_forwarding: self.strict_forwarding || other.strict_forwarding,
            transport_wrapping: self.transport_wrapping || other.transport_wrapping,
        }
    }
}

/// A stream opened by the server, as seen by the client.
#[derive(Debug)]
pub struct IncomingStream {
    pub head: RequestHead,
    pub stream: StreamHandle,
}

/// Lazy sequence of streams opened by the peer. Ends when the session closes.
pub struct IncomingStreams {
    rx: AsyncReceiver<IncomingStream>,
}

impl IncomingStreams {
    pub async fn accept(&mut self) -> Option<IncomingStream> {
        self.rx.recv().await.ok()
    }
}

impl std::fmt::Debug for IncomingStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingStreams").finish_non_exhaustive()
    }
}

/// Everything produced by a successful [`connect`] or [`accept`].
#[derive(Debug)]
pub struct Established {
    pub session: ControlSession,
    pub incoming: IncomingStreams,
    /// Resolves once the connection is closed and every stream has failed
    pub driver: JoinHandle<CloseReason>,
}

#[derive(Debug)]
struct SessionInner {
    id: Uuid,
    role: Role,
    token: String,
    capabilities: Capabilities,
    routes: UpstreamRouter<()>,
    state: watch::Receiver<SessionState>,
    commands: mpsc::UnboundedSender<Command>,
    active_streams: Arc<AtomicUsize>,
    connected_at: Instant,
    remote_addr: Option<SocketAddr>,
}

/// Handle to a running control session
#[derive(Debug, Clone)]
pub struct ControlSession {
    inner: Arc<SessionInner>,
}

impl ControlSession {
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Token the client presented
    pub fn token(&self) -> &str {
        &self.inner.token
    }

    pub fn capabilities(&self) -> Capabilities {
        self.inner.capabilities
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    pub fn connected_at(&self) -> Instant {
        self.inner.connected_at
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn stream_count(&self) -> usize {
        self.inner.active_streams.load(Ordering::Relaxed)
    }

    /// Check that some route advertised by the client accepts `key`.
    pub fn validate_route(&self, key: &str) -> Result<()> {
        self.inner.routes.resolve(key).map(|_| ())
    }

    /// Open a new stream carrying `head`. Server side only.
    pub async fn open_stream(&self, head: RequestHead) -> Result<StreamHandle> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .commands
            .send(Command::Open { head, reply })
            .map_err(|_| TunnelError::SessionClosing)?;
        rx.await.map_err(|_| TunnelError::SessionClosing)?
    }

    /// Stop accepting new streams and close once the open ones finish.
    pub fn drain(&self) {
        let _ = self.inner.commands.send(Command::Drain);
    }

    /// Close immediately, failing every open stream with `SessionClosing`.
    pub fn close(&self) {
        let _ = self.inner.commands.send(Command::Close);
    }

    /// Wait until the session reaches `Closed`.
    pub async fn closed(&self) {
        let mut state = self.inner.state.clone();
        let _ = state.wait_for(|s| s.is_terminal()).await;
    }
}

/// Dial with `dial`, authenticate, and start the client side of a session.
pub async fn connect<F>(dial: F, hello: &ClientHello, config: SessionConfig) -> Result<Established>
where
    F: Future<Output = Result<Transport>>,
{
    let state = StateCell::new();
    let mut transport = open_transport(dial, config.handshake_timeout).await?;
    state.advance(SessionState::Authenticating)?;
    let negotiated = handshake::client_handshake(&mut transport, hello, &config).await?;
    spawn_session(Role::Client, transport, negotiated, config, state)
}

/// Complete the transport upgrade and authenticate a dialing client.
pub async fn accept<F>(upgrade: F, policy: &AcceptPolicy, config: SessionConfig) -> Result<Established>
where
    F: Future<Output = Result<Transport>>,
{
    let state = StateCell::new();
    let mut transport = open_transport(upgrade, config.handshake_timeout).await?;
    state.advance(SessionState::Authenticating)?;
    let negotiated = handshake::server_handshake(&mut transport, policy, &config).await?;
    spawn_session(Role::Server, transport, negotiated, config, state)
}

/// The `Connecting` phase shares the handshake deadline, so a peer that
/// never completes the upgrade cannot hold a session slot.
async fn open_transport<F>(setup: F, limit: Duration) -> Result<Transport>
where
    F: Future<Output = Result<Transport>>,
{
    tokio::time::timeout(limit, setup).await.map_err(|_| {
        TunnelError::Connection(format!("transport not established within {limit:?}"))
    })?
}

fn spawn_session(
    role: Role,
    transport: Transport,
    negotiated: Negotiated,
    config: SessionConfig,
    state: StateCell,
) -> Result<Established> {
    state.advance(SessionState::Active)?;

    let (frames_tx, frames_rx) = mpsc::channel(config.outbound_queue.max(1));
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (incoming_tx, incoming_rx) = kanal::unbounded_async();
    let outbound = Arc::new(ActivityClock::new());
    outbound.touch();
    let active_streams = Arc::new(AtomicUsize::new(0));
    let cancel = CancellationToken::new();

    let writer = tokio::spawn(run_frame_writer(
        frames_rx,
        transport.sink,
        outbound.clone(),
        cancel.clone(),
    ));

    let inner = SessionInner {
        id: negotiated.session_id,
        role,
        token: negotiated.token,
        capabilities: negotiated.capabilities,
        routes: UpstreamRouter::from_keys(
            negotiated.routes,
            negotiated.capabilities.strict_forwarding,
        ),
        state: state.subscribe(),
        commands: commands_tx.clone(),
        active_streams: active_streams.clone(),
        connected_at: Instant::now(),
        remote_addr: transport.remote_addr,
    };
    info!(
        "Session {} active ({role:?}, peer {})",
        inner.id,
        inner
            .remote_addr
            .map_or_else(|| "unknown".to_string(), |a| a.to_string())
    );

    let driver = Driver::new(
        role,
        negotiated.session_id,
        config,
        negotiated.peer_window,
        state,
        frames_tx,
        commands_tx,
        (role == Role::Client).then_some(incoming_tx),
        outbound,
        active_streams,
        cancel,
    );
    let receiver = transport.receiver;
    let driver = tokio::spawn(async move {
        let reason = driver.run(receiver, commands_rx).await;
        let _ = writer.await;
        reason
    });

    Ok(Established {
        session: ControlSession {
            inner: Arc::new(inner),
        },
        incoming: IncomingStreams { rx: incoming_rx },
        driver,
    })
}
