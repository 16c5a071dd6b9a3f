//! Client-side TLS for `wss://` control connections and `https://` upstreams

use poglets_common::{Result, TunnelError};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// Client config trusting the bundled web PKI roots.
///
/// The ring provider is selected explicitly so the config does not depend
/// on a process-wide default being installed.
pub fn client_config() -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config =
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| TunnelError::Tls(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Wrap an established TCP connection in TLS for `host`.
pub async fn connect(
    stream: TcpStream,
    host: &str,
    config: Arc<ClientConfig>,
) -> Result<TlsStream<TcpStream>> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| TunnelError::Tls(format!("invalid server name {host:?}")))?;
    TlsConnector::from(config)
        .connect(server_name, stream)
        .await
        .map_err(|e| TunnelError::Tls(format!("handshake with {host} failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_builds() {
        let config = client_config().unwrap();
        assert!(config.alpn_protocols.is_empty());
    }
}
