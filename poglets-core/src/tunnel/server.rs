use crate::session::{self, AcceptPolicy, Established, SessionStore};
use crate::transport::ws;
use futures::future::join_all;
use poglets_common::{LimitsConfig, Result, SessionConfig};
use poglets_protocol::validation::ValidationLimits;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Accepts control connections and registers their sessions.
#[derive(Debug, Clone)]
pub struct TunnelServer {
    addr: SocketAddr,
    policy: AcceptPolicy,
    session_config: SessionConfig,
    max_sessions: usize,
    sessions: SessionStore,
}

impl TunnelServer {
    pub fn new(addr: SocketAddr, token: &str) -> Self {
        Self {
            addr,
            policy: AcceptPolicy::new(token),
            session_config: SessionConfig::default(),
            max_sessions: LimitsConfig::default().max_sessions,
            sessions: SessionStore::new(),
        }
    }

    #[must_use]
    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    #[must_use]
    pub fn with_limits(mut self, limits: &LimitsConfig) -> Self {
        self.max_sessions = limits.max_sessions.max(1);
        self.policy.limits = ValidationLimits {
            max_token_len: limits.max_token_len,
            max_capabilities: limits.max_capabilities,
            max_routes: limits.max_routes,
            max_payload_bytes: usize::try_from(limits.max_frame_bytes).unwrap_or(usize::MAX),
            ..ValidationLimits::default()
        };
        self
    }

    /// Advertise the transport-wrapping capability (on by default).
    #[must_use]
    pub fn with_transport_wrapping(mut self, enabled: bool) -> Self {
        self.policy.transport_wrapping = enabled;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Sessions registered by this server, shared with the data plane.
    pub fn sessions(&self) -> SessionStore {
        self.sessions.clone()
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        self.run_with_listener(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` is cancelled,
    /// then drain every session.
    pub async fn run_with_listener(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        info!("Control plane listening on {}", listener.local_addr()?);
        let permits = Arc::new(Semaphore::new(self.max_sessions));

        loop {
            let (stream, addr) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                },
                () = shutdown.cancelled() => break,
            };

            let Ok(permit) = permits.clone().try_acquire_owned() else {
                warn!(
                    "Rejecting control connection from {}: maximum sessions reached ({})",
                    addr, self.max_sessions
                );
                continue;
            };

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr, permit).await {
                    warn!("Control connection from {} failed: {}", addr, e);
                }
            });
        }

        self.shutdown_sessions().await;
        Ok(())
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        _permit: OwnedSemaphorePermit,
    ) -> Result<()> {
        let Established {
            session, driver, ..
        } = session::accept(ws::accept(stream), &self.policy, self.session_config.clone())
            .await?;

        let id = session.id();
        self.sessions.add(session);
        info!("Client {} authenticated, session {}", addr, id);

        let reason = driver.await.map_or_else(
            |e| format!("session task failed: {e}"),
            |reason| reason.to_string(),
        );
        self.sessions.remove(&id);
        info!("Session {} from {} ended: {}", id, addr, reason);
        Ok(())
    }

    async fn shutdown_sessions(&self) {
        let sessions = self.sessions.sessions();
        if sessions.is_empty() {
            return;
        }
        info!("Draining {} sessions", sessions.len());
        self.sessions.drain_all();

        // The driver enforces the drain deadline; the margin covers its tick.
        let grace = self.session_config.drain_timeout + Duration::from_secs(1);
        let all_closed = join_all(sessions.iter().map(|s| s.closed()));
        if tokio::time::timeout(grace, all_closed).await.is_err() {
            warn!("Sessions still open after drain; closing them");
            self.sessions.close_all();
        }
    }
}
