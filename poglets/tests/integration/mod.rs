#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Integration tests for poglets
//!
//! Every test runs a real server on loopback, a client dialing its control
//! port, and a hyper upstream behind the client. Public requests are sent
//! with reqwest.

mod concurrent_test;
mod error_test;
mod reconnect_test;
mod routing_test;
mod tunnel_test;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use poglets::{Client, ClientBuilder, Server, ServerBuilder};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::sleep;

pub const TOKEN: &str = "test-secret-token";

static NEXT_PORT: std::sync::atomic::AtomicU16 = std::sync::atomic::AtomicU16::new(30000);

pub fn get_free_port() -> u16 {
    use std::sync::atomic::Ordering;
    loop {
        let port = NEXT_PORT.fetch_add(1, Ordering::Relaxed);
        if std::net::TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return port;
        }
    }
}

/// Server builder on ephemeral loopback ports with the test token
pub fn server_builder() -> ServerBuilder {
    Server::builder()
        .data_addr("127.0.0.1:0".parse().unwrap())
        .control_addr("127.0.0.1:0".parse().unwrap())
        .token(TOKEN)
}

pub async fn start_server(builder: ServerBuilder) -> Server {
    let mut server = builder.build().expect("Failed to build server");
    server.start().await.expect("Failed to start server");
    server
}

/// Client builder pointed at `server` with a fast reconnect policy
pub fn client_builder(server: &Server, upstream: &str) -> ClientBuilder {
    let control = server.control_addr().expect("server not started");
    Client::builder()
        .url(format!("ws://{control}"))
        .insecure(true)
        .token(TOKEN)
        .upstream(upstream)
        .resilience(poglets::common::ResilienceConfig {
            reconnect_base: Duration::from_millis(50),
            reconnect_max: Duration::from_millis(200),
            jitter_factor: 0.0,
        })
}

/// Start a client and wait until the server has registered its session
pub async fn start_client(server: &Server, builder: ClientBuilder) -> Client {
    let mut client = builder.build().expect("Failed to build client");
    client.start().await.expect("Client failed to connect");
    assert!(
        wait_for_sessions(server, 1, Duration::from_secs(5)).await,
        "Session was not registered in time"
    );
    client
}

/// Wait until the server holds exactly `count` sessions
pub async fn wait_for_sessions(server: &Server, count: usize, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if server.sessions().map(poglets::core::SessionStore::count) == Some(count) {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Wait for a server to start listening
pub async fn wait_for_server(addr: SocketAddr, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if tokio::net::TcpStream::connect(addr).await.is_ok() {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}

/// HTTP upstream that answers `Hello, World!` to GET and echoes the body of
/// anything else. The request path, method and a caller-chosen tag are
/// reported in `x-path`, `x-method` and `x-upstream`.
pub async fn start_echo_server(tag: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind echo server");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                continue;
            };
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| async move {
                    let path = req.uri().to_string();
                    let method = req.method().clone();
                    let body = req.into_body().collect().await?.to_bytes();
                    let body = if method == hyper::Method::GET {
                        Bytes::from_static(b"Hello, World!")
                    } else {
                        body
                    };
                    let response = Response::builder()
                        .header("content-type", "text/plain")
                        .header("x-path", path)
                        .header("x-method", method.as_str())
                        .header("x-upstream", tag)
                        .header("access-control-allow-origin", "*")
                        .body(Full::new(body))
                        .unwrap();
                    Ok::<_, hyper::Error>(response)
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

pub fn make_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}
