//! Error scenario integration tests

use super::{
    client_builder, get_free_port, make_client, server_builder, start_client, start_echo_server,
    start_server,
};
use poglets::http::RouteScheme;

/// Test upstream connection refused (tunnel -> local service fails)
#[tokio::test]
async fn test_upstream_connection_refused() {
    let server = start_server(server_builder()).await;

    // Nothing listens on this port -> connection refused
    let dead = format!("127.0.0.1:{}", get_free_port());
    let mut client = start_client(&server, client_builder(&server, &dead)).await;

    let response = make_client()
        .get(format!("http://{}/", server.data_addr().unwrap()))
        .send()
        .await
        .expect("Failed to send request");

    // Expect 502 Bad Gateway
    assert_eq!(response.status(), 502);

    let _ = client.shutdown().await;
}

/// Test a public request with no client connected
#[tokio::test]
async fn test_no_tunnel_connected() {
    let server = start_server(server_builder()).await;

    let response = make_client()
        .get(format!("http://{}/", server.data_addr().unwrap()))
        .send()
        .await
        .expect("Failed to send request");

    assert_eq!(response.status(), 502);
    assert!(response.text().await.unwrap().contains("tunnel"));
}

/// Test a strict client only receives its advertised route key
#[tokio::test]
async fn test_strict_route_mismatch() {
    let upstream = start_echo_server("api").await;
    let server = start_server(server_builder().route_scheme(RouteScheme::Path)).await;
    let mut client = start_client(
        &server,
        client_builder(&server, &format!("api={upstream}")),
    )
    .await;
    let base = format!("http://{}", server.data_addr().unwrap());

    let response = make_client()
        .get(format!("{base}/web/index.html"))
        .send()
        .await
        .expect("Failed to send request");
    assert_eq!(response.status(), 404);
    assert_eq!(server.sessions().unwrap().sessions()[0].stream_count(), 0);

    let response = make_client()
        .get(format!("{base}/api/users"))
        .send()
        .await
        .expect("Failed to send request");
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-upstream"], "api");
    assert_eq!(response.headers()["x-path"], "/api/users");

    let _ = client.shutdown().await;
}

/// Test a client with the wrong token never gets a session
#[tokio::test]
async fn test_wrong_token_rejected() {
    let upstream = start_echo_server("echo").await;
    let server = start_server(server_builder()).await;

    let mut client = client_builder(&server, &upstream.to_string())
        .token("not-the-token")
        .max_attempts(1)
        .build()
        .expect("Failed to build client");

    assert!(client.start().await.is_err());
    assert_eq!(server.sessions().unwrap().count(), 0);
}
