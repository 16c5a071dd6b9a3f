//! Server data plane: public HTTP requests in, tunnel streams out

use crate::head;
use crate::pool::{BoxError, ProxyBody};
use bytes::Bytes;
use futures::TryStreamExt;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Body, Frame};
use hyper::header::HeaderValue;
use hyper::http::request::Parts;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use poglets_common::{Result, TunnelError};
use poglets_core::{SessionStore, StreamWriter};
use poglets_protocol::ErrorCode;
use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How the route key of a public request is derived
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RouteScheme {
    /// Every request uses the default (empty) key
    #[default]
    None,
    /// Lowercased `Host` header without port
    Host,
    /// First path segment
    Path,
}

impl RouteScheme {
    pub fn route_key(self, parts: &Parts) -> std::result::Result<String, &'static str> {
        match self {
            RouteScheme::None => Ok(String::new()),
            RouteScheme::Host => parse_and_normalize_host(parts.headers.get(hyper::header::HOST)),
            RouteScheme::Path => Ok(parts
                .uri
                .path()
                .trim_start_matches('/')
                .split('/')
                .next()
                .unwrap_or_default()
                .to_string()),
        }
    }
}

impl FromStr for RouteScheme {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(RouteScheme::None),
            "host" => Ok(RouteScheme::Host),
            "path" => Ok(RouteScheme::Path),
            other => Err(format!(
                "unknown route scheme {other:?} (expected none, host or path)"
            )),
        }
    }
}

impl fmt::Display for RouteScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RouteScheme::None => "none",
            RouteScheme::Host => "host",
            RouteScheme::Path => "path",
        })
    }
}

/// Configuration for the public listener
#[derive(Debug, Clone)]
pub struct IngressConfig {
    /// Maximum concurrent connections (default: 10000)
    pub max_connections: usize,
    pub route_scheme: RouteScheme,
    /// How long open connections may finish after shutdown (default: 10s)
    pub shutdown_grace: Duration,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            max_connections: 10000,
            route_scheme: RouteScheme::None,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

pub struct HttpIngress {
    sessions: SessionStore,
    config: IngressConfig,
    connection_semaphore: Arc<Semaphore>,
}

impl HttpIngress {
    pub fn new(sessions: SessionStore) -> Self {
        Self::with_config(sessions, IngressConfig::default())
    }

    pub fn with_config(sessions: SessionStore, config: IngressConfig) -> Self {
        let connection_semaphore = Arc::new(Semaphore::new(config.max_connections));
        Self {
            sessions,
            config,
            connection_semaphore,
        }
    }

    /// Serve public connections from `listener` until `shutdown` fires.
    pub async fn start(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        info!("HTTP ingress listening on {}", listener.local_addr()?);
        let graceful = GracefulShutdown::new();

        loop {
            let (stream, peer_addr) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept public connection: {e}");
                        continue;
                    }
                },
                () = shutdown.cancelled() => break,
            };

            let Ok(permit) = self.connection_semaphore.clone().try_acquire_owned() else {
                warn!("Max connections reached, rejecting connection from {peer_addr}");
                drop(stream);
                continue;
            };

            let sessions = self.sessions.clone();
            let scheme = self.config.route_scheme;
            let service = service_fn(move |req| {
                handle_request(req, sessions.clone(), scheme, peer_addr)
            });
            let conn = graceful.watch(
                http1::Builder::new().serve_connection(TokioIo::new(stream), service),
            );

            tokio::spawn(async move {
                let _permit = permit;
                if let Err(err) = conn.await {
                    debug!("Error serving connection from {peer_addr}: {err}");
                }
            });
        }

        drop(listener);
        tokio::select! {
            () = graceful.shutdown() => info!("HTTP ingress stopped"),
            () = tokio::time::sleep(self.config.shutdown_grace) => {
                warn!("HTTP ingress stopped with connections still open");
            }
        }
        Ok(())
    }
}

/// Relay one public request through the current tunnel session.
pub(crate) async fn handle_request<B>(
    req: Request<B>,
    sessions: SessionStore,
    scheme: RouteScheme,
    peer_addr: SocketAddr,
) -> std::result::Result<Response<ProxyBody>, Infallible>
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: fmt::Display + Send,
{
    let Some(session) = sessions.current_active() else {
        return Ok(error_response(&TunnelError::NoTunnelConnected));
    };

    let (parts, body) = req.into_parts();
    let route_key = match scheme.route_key(&parts) {
        Ok(key) => key,
        Err(msg) => return Ok(full_response(StatusCode::BAD_REQUEST, msg)),
    };
    if let Err(e) = session.validate_route(&route_key) {
        debug!("Rejecting {} {}: {e}", parts.method, parts.uri);
        return Ok(error_response(&e));
    }

    let has_body = !body.is_end_stream();
    let request_head = head::request_head(&parts, route_key, peer_addr, has_body);
    let stream = match session.open_stream(request_head).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Failed to open stream: {e}");
            return Ok(error_response(&e));
        }
    };
    let id = stream.id();
    debug!("Stream {id}: {} {} from {peer_addr}", parts.method, parts.uri);

    let (writer, mut reader) = stream.split();
    tokio::spawn(pump_request_body(body, writer));

    let response_head = match reader.response_head().await {
        Ok(head) => head,
        Err(e) => {
            debug!("Stream {id} failed before a response: {e}");
            return Ok(error_response(&e));
        }
    };

    let body = StreamBody::new(
        reader
            .into_body_stream()
            .map_ok(Frame::data)
            .map_err(|e| Box::new(e) as BoxError),
    );
    let mut response = Response::new(body.boxed_unsync());
    *response.status_mut() =
        StatusCode::from_u16(response_head.status).unwrap_or(StatusCode::BAD_GATEWAY);
    *response.headers_mut() = head::from_wire(&response_head.headers);
    Ok(response)
}

/// Copy the public request body into the stream until it ends or the
/// stream fails.
async fn pump_request_body<B>(mut body: B, mut writer: StreamWriter)
where
    B: Body<Data = Bytes> + Send + Unpin,
    B::Error: fmt::Display + Send,
{
    let cancel = writer.cancellation();
    loop {
        let frame = tokio::select! {
            frame = body.frame() => frame,
            () = cancel.cancelled() => return,
        };
        match frame {
            None => {
                writer.close_write();
                return;
            }
            Some(Ok(frame)) => {
                let Ok(data) = frame.into_data() else {
                    continue;
                };
                if let Err(e) = writer.write_body(data).await {
                    debug!("Stream {}: request body not relayed: {e}", writer.id());
                    return;
                }
            }
            Some(Err(e)) => {
                let err = TunnelError::Connection(format!("public request body failed: {e}"));
                warn!("Stream {}: {err}", writer.id());
                writer.reset(&err);
                return;
            }
        }
    }
}

/// Status returned to the public caller for a failed request.
pub fn status_for(err: &TunnelError) -> StatusCode {
    match err.code() {
        ErrorCode::NoMatchingUpstream => StatusCode::NOT_FOUND,
        ErrorCode::StreamTimeout | ErrorCode::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_GATEWAY,
    }
}

fn error_response(err: &TunnelError) -> Response<ProxyBody> {
    full_response(status_for(err), &err.to_string())
}

fn full_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    let body = Full::new(Bytes::copy_from_slice(body.as_bytes()))
        .map_err(|never| match never {})
        .boxed_unsync();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Parse and normalize the Host header for host-based routing.
/// Handles IPv6 addresses, port stripping, and case normalization.
fn parse_and_normalize_host(
    host_header: Option<&HeaderValue>,
) -> std::result::Result<String, &'static str> {
    let host_str = host_header
        .and_then(|h| h.to_str().ok())
        .ok_or("Missing or invalid Host header")?;

    let host = host_str.trim();
    if host.is_empty() {
        return Err("Empty Host header");
    }

    // [::1]:8080 -> ::1
    let normalized = if let Some(rest) = host.strip_prefix('[') {
        match rest.find(']') {
            Some(end) => &rest[..end],
            None => return Err("Invalid IPv6 Host header format"),
        }
    } else if host.matches(':').count() > 1 {
        host
    } else {
        host.split(':').next().unwrap_or(host)
    };

    let normalized = normalized.to_lowercase();
    let normalized = normalized.strip_suffix('.').unwrap_or(&normalized);

    if normalized.is_empty() {
        return Err("Empty host after normalization");
    }

    Ok(normalized.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::session_pair;
    use poglets_core::IncomingStream;
    use poglets_protocol::ResponseHead;

    const PEER: &str = "203.0.113.9:40000";

    fn parts(req: hyper::http::request::Builder) -> Parts {
        req.body(()).unwrap().into_parts().0
    }

    fn request(host: &str, path: &str, body: &'static str) -> Request<Full<Bytes>> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header("host", host)
            .body(Full::new(Bytes::from_static(body.as_bytes())))
            .unwrap()
    }

    async fn body_text(response: Response<ProxyBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    /// Client side that answers every stream with its route key and body.
    fn spawn_echo_client(mut client: poglets_core::session::Established) {
        tokio::spawn(async move {
            while let Some(IncomingStream { head, stream }) = client.incoming.accept().await {
                tokio::spawn(async move {
                    let (mut writer, mut reader) = stream.split();
                    let mut body = Vec::new();
                    while let Some(chunk) = reader.next_chunk().await {
                        body.extend_from_slice(&chunk.unwrap());
                    }
                    writer
                        .reply(ResponseHead {
                            status: 201,
                            headers: vec![("x-route".to_string(), Bytes::from(head.route_key))],
                        })
                        .await
                        .unwrap();
                    writer.write_body(Bytes::from(body)).await.unwrap();
                    writer.close_write();
                });
            }
        });
    }

    #[test]
    fn test_parse_host_simple() {
        let hv = HeaderValue::from_static("example.com");
        assert_eq!(parse_and_normalize_host(Some(&hv)).unwrap(), "example.com");
    }

    #[test]
    fn test_parse_host_with_port() {
        let hv = HeaderValue::from_static("example.com:8080");
        assert_eq!(parse_and_normalize_host(Some(&hv)).unwrap(), "example.com");
    }

    #[test]
    fn test_parse_host_uppercase() {
        let hv = HeaderValue::from_static("EXAMPLE.COM");
        assert_eq!(parse_and_normalize_host(Some(&hv)).unwrap(), "example.com");
    }

    #[test]
    fn test_parse_host_trailing_dot() {
        let hv = HeaderValue::from_static("example.com.");
        assert_eq!(parse_and_normalize_host(Some(&hv)).unwrap(), "example.com");
    }

    #[test]
    fn test_parse_host_ipv6() {
        let hv = HeaderValue::from_static("[::1]:8080");
        assert_eq!(parse_and_normalize_host(Some(&hv)).unwrap(), "::1");
    }

    #[test]
    fn test_parse_host_empty() {
        let hv = HeaderValue::from_static("");
        assert!(parse_and_normalize_host(Some(&hv)).is_err());
        assert!(parse_and_normalize_host(None).is_err());
    }

    #[test]
    fn test_route_keys() {
        let req = parts(
            Request::builder()
                .uri("/api/v1/items")
                .header("host", "Demo.Example.com:8000"),
        );
        assert_eq!(RouteScheme::None.route_key(&req).unwrap(), "");
        assert_eq!(RouteScheme::Host.route_key(&req).unwrap(), "demo.example.com");
        assert_eq!(RouteScheme::Path.route_key(&req).unwrap(), "api");

        let root = parts(Request::builder().uri("/"));
        assert_eq!(RouteScheme::Path.route_key(&root).unwrap(), "");
        assert!(RouteScheme::Host.route_key(&root).is_err());
    }

    #[test]
    fn test_route_scheme_from_str() {
        assert_eq!("HOST".parse::<RouteScheme>().unwrap(), RouteScheme::Host);
        assert_eq!("path".parse::<RouteScheme>().unwrap(), RouteScheme::Path);
        assert_eq!(RouteScheme::default().to_string(), "none");
        assert!("subdomain".parse::<RouteScheme>().is_err());
    }

    #[test]
    fn test_status_mapping() {
        let cases = [
            (TunnelError::NoMatchingUpstream("x".into()), 404),
            (TunnelError::NoTunnelConnected, 502),
            (TunnelError::SessionClosing, 502),
            (TunnelError::Connection("refused".into()), 502),
            (TunnelError::StreamTimeout("idle".into()), 504),
            (TunnelError::UpstreamTimeout("slow".into()), 504),
            (
                TunnelError::StreamReset {
                    code: ErrorCode::UpstreamUnavailable,
                    message: "down".into(),
                },
                502,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(status_for(&err).as_u16(), status, "{err}");
        }
    }

    #[tokio::test]
    async fn test_no_active_session_is_bad_gateway() {
        let response = handle_request(
            request("example.com", "/", "hi"),
            SessionStore::new(),
            RouteScheme::None,
            PEER.parse().unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(body_text(response).await.contains("No tunnel connected"));
    }

    #[tokio::test]
    async fn test_request_relayed_through_session() {
        let (server, client) = session_pair(&[""], true).await;
        spawn_echo_client(client);
        let store = SessionStore::new();
        store.add(server.session.clone());

        let response = handle_request(
            request("example.com", "/hello", "ping"),
            store,
            RouteScheme::None,
            PEER.parse().unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-route"], "");
        assert_eq!(body_text(response).await, "ping");
    }

    #[tokio::test]
    async fn test_strict_route_mismatch_is_not_found() {
        let (server, client) = session_pair(&[""], true).await;
        spawn_echo_client(client);
        let store = SessionStore::new();
        store.add(server.session.clone());

        let response = handle_request(
            request("other.example.com", "/", ""),
            store.clone(),
            RouteScheme::Host,
            PEER.parse().unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(server.session.stream_count(), 0);
    }

    #[tokio::test]
    async fn test_host_routing_passes_key() {
        let (server, client) = session_pair(&["demo.example.com"], true).await;
        spawn_echo_client(client);
        let store = SessionStore::new();
        store.add(server.session.clone());

        let response = handle_request(
            request("DEMO.example.com:8000", "/", "x"),
            store,
            RouteScheme::Host,
            PEER.parse().unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-route"], "demo.example.com");
    }
}
