//! Configuration types for the poglets client and server.
//!
//! Both are validated by their builders before any socket is opened, so
//! a misconfiguration surfaces as [`TunnelError::Config`] instead of a
//! failed dial.

use poglets_common::{
    LimitsConfig, ResilienceConfig, Result, SessionConfig, TunnelError, DEFAULT_BIND_ADDR,
    DEFAULT_CONTROL_PORT, DEFAULT_DATA_PORT,
};
use poglets_core::auth::validate_token_format;
use poglets_core::UpstreamRouter;
use poglets_http::{PoolConfig, RouteScheme};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use uuid::Uuid;

/// Configuration for the tunnel client.
///
/// Use [`ClientBuilder`](crate::ClientBuilder) for ergonomic construction.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Control endpoint, `ws://` or `wss://`
    pub url: String,

    /// Shared secret presented in the handshake
    pub token: String,

    /// Upstream spec: `key=target` or a bare `target`
    pub upstream: String,

    /// Serve only the advertised route keys
    pub strict_forwarding: bool,

    /// Allow a plaintext `ws://` control connection
    pub insecure: bool,

    pub session: SessionConfig,
    pub resilience: ResilienceConfig,
    pub pool: PoolConfig,
}

impl ClientConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(TunnelError::Config("--url is required".into()));
        }
        if !self.url.starts_with("ws://") && !self.url.starts_with("wss://") {
            return Err(TunnelError::Config(
                "--url should be prefixed with ws:// (insecure) or wss:// (secure)".into(),
            ));
        }
        if self.url.starts_with("ws://") && !self.insecure {
            return Err(TunnelError::Config(
                "ws:// carries traffic without encryption; use wss:// or enable insecure mode"
                    .into(),
            ));
        }
        validate_token_format(&self.token, LimitsConfig::default().max_token_len)?;
        self.routes()?;
        Ok(())
    }

    /// Route table parsed from [`upstream`](Self::upstream).
    pub fn routes(&self) -> Result<UpstreamRouter<String>> {
        UpstreamRouter::from_spec(&self.upstream, self.strict_forwarding)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: String::new(),
            upstream: String::new(),
            strict_forwarding: true,
            insecure: false,
            session: SessionConfig::default(),
            resilience: ResilienceConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

/// Configuration for the tunnel server.
///
/// Use [`ServerBuilder`](crate::ServerBuilder) for ergonomic construction.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Public HTTP listener
    pub data_addr: SocketAddr,

    /// Control (WebSocket) listener
    pub control_addr: SocketAddr,

    /// Token clients must present; empty disables authentication
    pub token: String,

    /// Ask clients to normalise response headers
    pub transport_wrapping: bool,

    pub route_scheme: RouteScheme,
    pub session: SessionConfig,
    pub limits: LimitsConfig,
}

impl ServerConfig {
    /// Validate the configuration.
    ///
    /// Port 0 asks the OS for a free port and never collides.
    pub fn validate(&self) -> Result<()> {
        let (data, control) = (self.data_addr.port(), self.control_addr.port());
        if data != 0 && data == control {
            return Err(TunnelError::Config(format!(
                "data port and control port must differ (both {data})"
            )));
        }
        validate_token_format(&self.token, self.limits.max_token_len)?;
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        let ip = DEFAULT_BIND_ADDR
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        Self {
            data_addr: SocketAddr::new(ip, DEFAULT_DATA_PORT),
            control_addr: SocketAddr::new(ip, DEFAULT_CONTROL_PORT),
            token: String::new(),
            transport_wrapping: true,
            route_scheme: RouteScheme::default(),
            session: SessionConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

/// Information about an established tunnel connection.
#[derive(Debug, Clone)]
pub struct TunnelInfo {
    /// Session ID assigned by the server in the handshake
    pub session_id: Uuid,

    /// Whether the server asked for transport wrapping
    pub transport_wrapping: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(url: &str, insecure: bool) -> ClientConfig {
        ClientConfig {
            url: url.to_string(),
            upstream: "127.0.0.1:3000".to_string(),
            insecure,
            ..ClientConfig::default()
        }
    }

    #[test]
    fn test_client_url_rules() {
        assert!(client("wss://tunnel.example.com", false).validate().is_ok());
        assert!(client("ws://127.0.0.1:8001", true).validate().is_ok());

        let err = client("", false).validate().unwrap_err();
        assert!(err.to_string().contains("--url is required"));

        let err = client("http://127.0.0.1:8001", true).validate().unwrap_err();
        assert!(err.to_string().contains("ws://"));

        let err = client("ws://127.0.0.1:8001", false).validate().unwrap_err();
        assert!(matches!(err, TunnelError::Config(_)));
    }

    #[test]
    fn test_client_upstream_rules() {
        let mut config = client("wss://tunnel.example.com", false);
        config.upstream = String::new();
        assert!(config.validate().is_err());

        config.upstream = "a=127.0.0.1:1,b=127.0.0.1:2".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("multiple upstream"));

        config.upstream = "api=127.0.0.1:3000".to_string();
        let routes = config.routes().unwrap();
        assert!(routes.is_strict());
        assert_eq!(routes.resolve("api").unwrap(), "http://127.0.0.1:3000");
    }

    #[test]
    fn test_client_token_rejects_control_characters() {
        let mut config = client("wss://tunnel.example.com", false);
        config.token = "line\nbreak".to_string();
        assert!(matches!(config.validate(), Err(TunnelError::Config(_))));
    }

    #[test]
    fn test_server_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.data_addr.port(), DEFAULT_DATA_PORT);
        assert_eq!(config.control_addr.port(), DEFAULT_CONTROL_PORT);
        assert!(config.transport_wrapping);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_server_equal_ports_rejected() {
        let config = ServerConfig {
            data_addr: "127.0.0.1:9000".parse().unwrap(),
            control_addr: "0.0.0.0:9000".parse().unwrap(),
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(TunnelError::Config(_))));

        let ephemeral = ServerConfig {
            data_addr: "127.0.0.1:0".parse().unwrap(),
            control_addr: "127.0.0.1:0".parse().unwrap(),
            ..ServerConfig::default()
        };
        assert!(ephemeral.validate().is_ok());
    }
}
