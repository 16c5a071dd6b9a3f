use poglets_common::SessionConfig;
use poglets_core::session::{accept, connect, AcceptPolicy, ClientHello, Established};
use poglets_core::transport::io_transport;
use poglets_core::StreamReader;

const TOKEN: &str = "http-test-token";

pub(crate) async fn session_pair(routes: &[&str], strict: bool) -> (Established, Established) {
    session_pair_with(routes, strict, true).await
}

/// Server and client sessions over an in-memory pipe.
pub(crate) async fn session_pair_with(
    routes: &[&str],
    strict: bool,
    transport_wrapping: bool,
) -> (Established, Established) {
    let (a, b) = tokio::io::duplex(1 << 20);
    let mut policy = AcceptPolicy::new(TOKEN);
    policy.transport_wrapping = transport_wrapping;
    let hello = ClientHello {
        token: TOKEN.to_string(),
        routes: routes.iter().map(ToString::to_string).collect(),
        strict_forwarding: strict,
    };
    let config = SessionConfig::default();

    let (server, client) = tokio::join!(
        accept(async { Ok(io_transport(a)) }, &policy, config.clone()),
        connect(async { Ok(io_transport(b)) }, &hello, config),
    );
    (server.unwrap(), client.unwrap())
}

pub(crate) async fn read_body(reader: &mut StreamReader) -> Vec<u8> {
    let mut body = Vec::new();
    while let Some(chunk) = reader.next_chunk().await {
        body.extend_from_slice(&chunk.unwrap());
    }
    body
}
