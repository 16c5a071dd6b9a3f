//! Embeddable tunnel server with builder pattern.
//!
//! # Example
//!
//! ```rust,no_run
//! use poglets::Server;
//!
//! # async fn example() -> poglets::Result<()> {
//! let mut server = Server::builder()
//!     .data_addr("0.0.0.0:8000".parse().unwrap())
//!     .control_addr("0.0.0.0:8001".parse().unwrap())
//!     .token("my-secret-token")
//!     .build()?;
//!
//! server.start().await?;
//! tokio::signal::ctrl_c().await?;
//! server.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use crate::config::ServerConfig;
use poglets_common::{LimitsConfig, Result, SessionConfig, TunnelError};
use poglets_core::{SessionStore, TunnelServer};
use poglets_http::{HttpIngress, IngressConfig, RouteScheme};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// A tunnel server that can be embedded in your application.
///
/// Use [`Server::builder()`] to create a new server with the builder pattern.
#[derive(Debug)]
pub struct Server {
    config: ServerConfig,
    sessions: Option<SessionStore>,
    local_addrs: Option<(SocketAddr, SocketAddr)>,
    shutdown: Option<CancellationToken>,
    task: Option<JoinHandle<Result<()>>>,
}

/// Builder for constructing a [`Server`] with ergonomic configuration.
#[derive(Debug, Default)]
pub struct ServerBuilder {
    config: ServerConfig,
}

impl Server {
    /// Create a new server builder.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// Bind both listeners and start serving in the background.
    ///
    /// Returns once the sockets are bound; use [`wait()`](Self::wait) to
    /// block until the server stops and [`shutdown()`](Self::shutdown) to
    /// stop it.
    ///
    /// # Errors
    ///
    /// Returns an error if the server is already running or a listener
    /// cannot be bound.
    pub async fn start(&mut self) -> Result<()> {
        if self.task.is_some() {
            return Err(TunnelError::InvalidState("server already started".into()));
        }

        let config = self.config.clone();
        let control_listener = TcpListener::bind(config.control_addr).await?;
        let data_listener = TcpListener::bind(config.data_addr).await?;
        let control_addr = control_listener.local_addr()?;
        let data_addr = data_listener.local_addr()?;

        info!("Starting poglets server v{}", env!("CARGO_PKG_VERSION"));
        info!("  Data plane: {}", data_addr);
        info!("  Control plane: {}", control_addr);
        info!("  Transport wrapping: {}", config.transport_wrapping);
        if config.token.is_empty() {
            info!("  Authentication disabled: no token configured");
        }

        let tunnel_server = TunnelServer::new(control_addr, &config.token)
            .with_session_config(config.session)
            .with_limits(&config.limits)
            .with_transport_wrapping(config.transport_wrapping);
        let sessions = tunnel_server.sessions();
        let ingress = HttpIngress::with_config(
            sessions.clone(),
            IngressConfig {
                route_scheme: config.route_scheme,
                ..IngressConfig::default()
            },
        );

        let shutdown = CancellationToken::new();
        let task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                // Either plane stopping takes the other down with it
                let (control, data) = tokio::join!(
                    async {
                        let result = tunnel_server
                            .run_with_listener(control_listener, shutdown.clone())
                            .await;
                        shutdown.cancel();
                        result
                    },
                    async {
                        let result = ingress.start(data_listener, shutdown.clone()).await;
                        shutdown.cancel();
                        result
                    },
                );
                control.and(data)
            })
        };

        self.sessions = Some(sessions);
        self.local_addrs = Some((data_addr, control_addr));
        self.shutdown = Some(shutdown);
        self.task = Some(task);
        Ok(())
    }

    /// Wait until the server stops, either through
    /// [`stop()`](Self::stop) or because a listener failed.
    ///
    /// Cancel safe: dropping the future keeps the server running.
    pub async fn wait(&mut self) -> Result<()> {
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };
        let joined = task.await;
        self.task = None;
        joined.map_err(|e| TunnelError::Connection(format!("server task failed: {e}")))?
    }

    /// Stop accepting, drain every session and wait for cleanup.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Server shutdown requested");
        self.stop();
        self.wait().await
    }

    /// Signal the server to stop (non-blocking).
    ///
    /// Use [`shutdown()`](Self::shutdown) if you need to wait for cleanup.
    pub fn stop(&mut self) {
        if let Some(token) = self.shutdown.take() {
            token.cancel();
        }
    }

    /// Check if the server is currently running.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Bound address of the public HTTP listener, once started.
    pub fn data_addr(&self) -> Option<SocketAddr> {
        self.local_addrs.map(|(data, _)| data)
    }

    /// Bound address of the control listener, once started.
    pub fn control_addr(&self) -> Option<SocketAddr> {
        self.local_addrs.map(|(_, control)| control)
    }

    /// Registered client sessions, once started.
    pub fn sessions(&self) -> Option<&SessionStore> {
        self.sessions.as_ref()
    }

    /// Get the current configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

impl ServerBuilder {
    /// Address of the public HTTP listener.
    ///
    /// Default: `0.0.0.0:8000`
    #[must_use]
    pub fn data_addr(mut self, addr: SocketAddr) -> Self {
        self.config.data_addr = addr;
        self
    }

    /// Address of the control listener clients dial.
    ///
    /// Default: `0.0.0.0:8001`
    #[must_use]
    pub fn control_addr(mut self, addr: SocketAddr) -> Self {
        self.config.control_addr = addr;
        self
    }

    /// Set the authentication token.
    ///
    /// Clients must provide this token to connect.
    #[must_use]
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.token = token.into();
        self
    }

    /// Advertise transport wrapping to clients.
    ///
    /// Default: `true`
    #[must_use]
    pub fn transport_wrapping(mut self, enabled: bool) -> Self {
        self.config.transport_wrapping = enabled;
        self
    }

    /// How public requests are mapped to route keys.
    ///
    /// Default: [`RouteScheme::None`]
    #[must_use]
    pub fn route_scheme(mut self, scheme: RouteScheme) -> Self {
        self.config.route_scheme = scheme;
        self
    }

    #[must_use]
    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.config.session = config;
        self
    }

    #[must_use]
    pub fn limits(mut self, limits: LimitsConfig) -> Self {
        self.config.limits = limits;
        self
    }

    /// Build the server with the configured options.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Config`] if the data and control ports are
    /// equal or the token is malformed.
    pub fn build(self) -> Result<Server> {
        self.config.validate()?;
        Ok(Server {
            config: self.config,
            sessions: None,
            local_addrs: None,
            shutdown: None,
            task: None,
        })
    }
}
