//! Connection pooling for upstream HTTP/1.1 connections
//!
//! One pool per configured upstream. Idle senders are kept in a LIFO queue
//! so the most recently used (warmest) connection is reused first.

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use hyper::client::conn::http1;
use hyper::Uri;
use hyper_util::rt::TokioIo;
use poglets_common::{Result, TunnelError};
use poglets_core::transport::socket_tuning::configure_socket_silent;
use poglets_core::transport::{tls, BoxedStream};
use rustls::ClientConfig;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type sent to upstreams and returned to public callers.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// Connection pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per upstream (default: 32)
    pub max_idle: usize,
    /// Idle timeout for connections (default: 90s)
    pub idle_timeout: Duration,
    /// Timeout for TCP connect plus TLS and HTTP handshakes (default: 10s)
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: 32,
            idle_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Connection pool errors
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Connection to {addr} failed: {message}")]
    Connection { addr: String, message: String },
    #[error("Handshake with {addr} failed: {message}")]
    Handshake { addr: String, message: String },
    #[error("Connecting to {0} timed out")]
    Timeout(String),
    #[error(transparent)]
    Tls(TunnelError),
}

impl From<PoolError> for TunnelError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Tls(e) => e,
            other => TunnelError::Connection(other.to_string()),
        }
    }
}

/// Where a route's requests are sent, parsed from its upstream URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    tls: bool,
    host: String,
    port: u16,
    base_path: String,
}

impl Upstream {
    pub fn parse(url: &str) -> Result<Self> {
        let uri: Uri = url
            .parse()
            .map_err(|e| TunnelError::Config(format!("invalid upstream URL {url:?}: {e}")))?;

        let tls = match uri.scheme_str() {
            Some("http") => false,
            Some("https") => true,
            _ => {
                return Err(TunnelError::Config(format!(
                    "upstream URL {url:?} must use http:// or https://"
                )))
            }
        };
        let host = match uri.host() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => {
                return Err(TunnelError::Config(format!(
                    "upstream URL {url:?} has no host"
                )))
            }
        };
        let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
        let base_path = uri.path().trim_end_matches('/').to_string();

        Ok(Self {
            tls,
            host,
            port,
            base_path,
        })
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// `host:port` suitable for connecting.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Value for the `Host` header; the port is omitted when it is the
    /// scheme default.
    pub fn authority(&self) -> String {
        let default_port = if self.tls { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            self.addr()
        }
    }

    /// Host name without IPv6 brackets, as used for TLS.
    pub fn server_name(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }

    /// Origin-form target for a forwarded path, below the URL's base path.
    pub fn request_target(&self, path_and_query: &str) -> String {
        if path_and_query.starts_with('/') {
            format!("{}{path_and_query}", self.base_path)
        } else {
            format!("{}/{path_and_query}", self.base_path)
        }
    }
}

struct IdleConnection {
    sender: http1::SendRequest<ProxyBody>,
    last_used: Instant,
}

type IdleQueue = Mutex<VecDeque<IdleConnection>>;

/// Connection pool for one upstream
pub struct ConnectionPool {
    upstream: Upstream,
    config: PoolConfig,
    tls: Option<Arc<ClientConfig>>,
    idle: Arc<IdleQueue>,
}

impl ConnectionPool {
    /// Create a pool. Must be called inside a tokio runtime; the eviction
    /// task ends when the pool is dropped.
    pub fn new(upstream: Upstream, config: PoolConfig) -> Result<Self> {
        let tls = if upstream.is_tls() {
            Some(tls::client_config()?)
        } else {
            None
        };
        let idle = Arc::new(Mutex::new(VecDeque::new()));

        tokio::spawn(evict_loop(Arc::downgrade(&idle), config.idle_timeout));

        Ok(Self {
            upstream,
            config,
            tls,
            idle,
        })
    }

    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    /// Reuse an idle connection or open a new one.
    pub async fn acquire(&self) -> std::result::Result<http1::SendRequest<ProxyBody>, PoolError> {
        loop {
            let candidate = self.idle.lock().await.pop_back();
            let Some(mut conn) = candidate else {
                break;
            };
            if conn.sender.is_closed() || conn.last_used.elapsed() >= self.config.idle_timeout {
                debug!("Discarding expired connection to {}", self.upstream.addr());
                continue;
            }
            if conn.sender.ready().await.is_ok() {
                debug!("Reusing connection to {}", self.upstream.addr());
                return Ok(conn.sender);
            }
        }

        let addr = self.upstream.addr();
        tokio::time::timeout(self.config.connect_timeout, self.connect())
            .await
            .map_err(|_| PoolError::Timeout(addr))?
    }

    /// Return a connection whose last response was read to completion.
    pub async fn release(&self, sender: http1::SendRequest<ProxyBody>) {
        if sender.is_closed() {
            return;
        }

        let mut idle = self.idle.lock().await;
        if idle.len() >= self.config.max_idle {
            debug!("Pool for {} full, dropping connection", self.upstream.addr());
            return;
        }
        idle.push_back(IdleConnection {
            sender,
            last_used: Instant::now(),
        });
    }

    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }

    async fn connect(&self) -> std::result::Result<http1::SendRequest<ProxyBody>, PoolError> {
        let addr = self.upstream.addr();
        debug!("Opening connection to {addr}");

        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| PoolError::Connection {
                addr: addr.clone(),
                message: e.to_string(),
            })?;
        configure_socket_silent(&stream);

        let io: BoxedStream = match &self.tls {
            Some(config) => Box::pin(
                tls::connect(stream, self.upstream.server_name(), config.clone())
                    .await
                    .map_err(PoolError::Tls)?,
            ),
            None => Box::pin(stream),
        };

        let (sender, conn) = http1::handshake(TokioIo::new(io))
            .await
            .map_err(|e| PoolError::Handshake {
                addr: addr.clone(),
                message: e.to_string(),
            })?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Upstream connection to {addr} ended: {e}");
            }
        });

        Ok(sender)
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("upstream", &self.upstream)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

async fn evict_loop(idle: Weak<IdleQueue>, timeout: Duration) {
    let period = (timeout / 3).max(Duration::from_secs(1));
    loop {
        tokio::time::sleep(period).await;
        let Some(idle) = idle.upgrade() else {
            return;
        };
        let mut idle = idle.lock().await;
        let before = idle.len();
        idle.retain(|conn| !conn.sender.is_closed() && conn.last_used.elapsed() < timeout);
        let evicted = before - idle.len();
        if evicted > 0 {
            debug!("Evicted {evicted} idle upstream connections");
        }
    }
}
