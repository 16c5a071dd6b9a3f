//! Embeddable tunnel client with builder pattern.
//!
//! # Example
//!
//! ```rust,no_run
//! use poglets::Client;
//!
//! # async fn example() -> poglets::Result<()> {
//! let mut client = Client::builder()
//!     .url("wss://tunnel.example.com")
//!     .token("my-secret-token")
//!     .upstream("127.0.0.1:3000")
//!     .build()?;
//!
//! let info = client.start().await?;
//! println!("Connected! Session: {}", info.session_id);
//! # Ok(())
//! # }
//! ```

use crate::config::{ClientConfig, TunnelInfo};
use poglets_common::{ResilienceConfig, Result, SessionConfig, TunnelError};
use poglets_core::reconnect::BackoffConfig;
use poglets_core::{ControlSession, IncomingStream, TunnelClient};
use poglets_http::{HeaderPolicy, HttpForwarder, PoolConfig};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A tunnel client that can be embedded in your application.
///
/// Use [`Client::builder()`] to create a new client with the builder pattern.
#[derive(Debug)]
pub struct Client {
    config: ClientConfig,
    header_policy: HeaderPolicy,
    max_attempts: Option<u32>,
    shutdown: Option<CancellationToken>,
    task: Option<JoinHandle<Result<()>>>,
}

/// Builder for constructing a [`Client`] with ergonomic configuration.
#[derive(Debug, Default)]
pub struct ClientBuilder {
    config: ClientConfig,
    header_policy: HeaderPolicy,
    max_attempts: Option<u32>,
}

impl Client {
    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Connect to the server and start forwarding.
    ///
    /// Resolves with [`TunnelInfo`] once the first session is established.
    /// The client then keeps running, reconnecting with backoff whenever
    /// the session is lost, until [`shutdown()`](Self::shutdown) is called.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is already running, or if the
    /// connect loop gives up before the first session comes up.
    pub async fn start(&mut self) -> Result<TunnelInfo> {
        if self.task.is_some() {
            return Err(TunnelError::InvalidState("client already started".into()));
        }

        let routes = self.config.routes()?;
        let forwarder = Arc::new(
            HttpForwarder::new(&routes, &self.config.pool)?
                .with_header_policy(self.header_policy.clone()),
        );

        let tunnel = TunnelClient::new(self.config.url.clone(), self.config.token.clone())
            .with_routes(
                routes.keys().map(ToString::to_string).collect(),
                self.config.strict_forwarding,
            )
            .with_session_config(self.config.session.clone())
            .with_backoff(BackoffConfig::from(self.config.resilience.clone()))
            .with_max_attempts(self.max_attempts);

        for (key, target) in routes.iter() {
            info!("Upstream: {} => {}", display_key(key), target);
        }

        let shutdown = CancellationToken::new();
        self.shutdown = Some(shutdown.clone());

        let (info_tx, info_rx) = oneshot::channel();
        let mut info_tx = Some(info_tx);

        let task = tokio::spawn(async move {
            let handler = move |session: ControlSession, incoming: IncomingStream| {
                forwarder.clone().handle(session, incoming)
            };
            let on_connected = move |session: &ControlSession| {
                // Only the first session answers `start()`
                if let Some(tx) = info_tx.take() {
                    let _ = tx.send(TunnelInfo {
                        session_id: session.id(),
                        transport_wrapping: session.capabilities().transport_wrapping,
                    });
                }
            };

            let result = tunnel.run(handler, on_connected, shutdown).await;
            match &result {
                Ok(()) => info!("Client stopped"),
                Err(e) => error!("Client stopped: {}", e),
            }
            result
        });
        self.task = Some(task);

        if let Ok(info) = info_rx.await {
            return Ok(info);
        }

        // The loop ended before any session came up
        let Some(task) = self.task.take() else {
            return Err(TunnelError::InvalidState("client task missing".into()));
        };
        match task.await {
            Ok(Err(e)) => Err(e),
            Ok(Ok(())) => Err(TunnelError::Connection(
                "client stopped before connecting".into(),
            )),
            Err(e) => Err(TunnelError::Connection(format!("client task failed: {e}"))),
        }
    }

    /// Wait until the client stops: after [`stop()`](Self::stop), or when
    /// reconnecting gives up.
    ///
    /// Cancel safe: dropping the future keeps the client running.
    pub async fn wait(&mut self) -> Result<()> {
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };
        let joined = task.await;
        self.task = None;
        joined.map_err(|e| TunnelError::Connection(format!("client task failed: {e}")))?
    }

    /// Shutdown the tunnel client and wait for cleanup.
    ///
    /// The current session is drained: in-flight requests finish, new ones
    /// are refused.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stop();
        self.wait().await
    }

    /// Signal the client to stop (non-blocking).
    ///
    /// Use [`shutdown()`](Self::shutdown) if you need to wait for cleanup.
    pub fn stop(&mut self) {
        if let Some(token) = self.shutdown.take() {
            token.cancel();
        }
    }

    /// Check if the client is currently running.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Get the current configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.stop();
    }
}

fn display_key(key: &str) -> &str {
    if key.is_empty() {
        "(default)"
    } else {
        key
    }
}

impl ClientBuilder {
    /// Control endpoint, e.g. `wss://tunnel.example.com`.
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.url = url.into();
        self
    }

    /// Set the authentication token.
    #[must_use]
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.token = token.into();
        self
    }

    /// Upstream to forward to: `127.0.0.1:3000`, `https://host`, or
    /// `key=target` to serve a single route key.
    #[must_use]
    pub fn upstream(mut self, spec: impl Into<String>) -> Self {
        self.config.upstream = spec.into();
        self
    }

    /// Serve only the advertised route keys.
    ///
    /// Default: `true`
    #[must_use]
    pub fn strict_forwarding(mut self, enabled: bool) -> Self {
        self.config.strict_forwarding = enabled;
        self
    }

    /// Permit `ws://` control URLs.
    #[must_use]
    pub fn insecure(mut self, enabled: bool) -> Self {
        self.config.insecure = enabled;
        self
    }

    #[must_use]
    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.config.session = config;
        self
    }

    /// Reconnect backoff settings.
    #[must_use]
    pub fn resilience(mut self, config: ResilienceConfig) -> Self {
        self.config.resilience = config;
        self
    }

    #[must_use]
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.config.pool = config;
        self
    }

    /// Headers stripped from upstream responses when the server asks for
    /// transport wrapping.
    #[must_use]
    pub fn header_policy(mut self, policy: HeaderPolicy) -> Self {
        self.header_policy = policy;
        self
    }

    /// Give up after this many consecutive failed attempts.
    ///
    /// Default: retry forever
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Build the client with the configured options.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Config`] if the URL, token or upstream spec
    /// is invalid.
    pub fn build(self) -> Result<Client> {
        self.config.validate()?;
        Ok(Client {
            config: self.config,
            header_policy: self.header_policy,
            max_attempts: self.max_attempts,
            shutdown: None,
            task: None,
        })
    }
}
