//! Route key derivation and upstream selection

use super::{client_builder, make_client, server_builder, start_client, start_echo_server, start_server};
use poglets::http::RouteScheme;

/// Host routing: the key is the lowercased Host without its port
#[tokio::test]
async fn test_route_by_host() {
    let upstream = start_echo_server("app").await;
    let server = start_server(server_builder().route_scheme(RouteScheme::Host)).await;
    let mut client = start_client(
        &server,
        client_builder(&server, &format!("app.example.com={upstream}")),
    )
    .await;
    let url = format!("http://{}/", server.data_addr().unwrap());

    let response = make_client()
        .get(&url)
        .header("Host", "App.Example.com:8000")
        .send()
        .await
        .expect("Failed to send request");
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-upstream"], "app");

    let response = make_client()
        .get(&url)
        .header("Host", "other.example.com")
        .send()
        .await
        .expect("Failed to send request");
    assert_eq!(response.status(), 404);

    let _ = client.shutdown().await;
}

/// A non-strict client takes every key and falls back to its only upstream
#[tokio::test]
async fn test_non_strict_fallback() {
    let upstream = start_echo_server("api").await;
    let server = start_server(server_builder().route_scheme(RouteScheme::Path)).await;
    let mut client = start_client(
        &server,
        client_builder(&server, &format!("api={upstream}")).strict_forwarding(false),
    )
    .await;

    let response = make_client()
        .get(format!("http://{}/anything/else", server.data_addr().unwrap()))
        .send()
        .await
        .expect("Failed to send request");
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-upstream"], "api");
    assert_eq!(response.headers()["x-path"], "/anything/else");

    let _ = client.shutdown().await;
}

/// Without a route scheme every request carries the default key, which a
/// strict keyed client does not serve
#[tokio::test]
async fn test_default_key_against_keyed_strict_client() {
    let upstream = start_echo_server("api").await;
    let server = start_server(server_builder()).await;
    let mut client = start_client(
        &server,
        client_builder(&server, &format!("api={upstream}")),
    )
    .await;

    let response = make_client()
        .get(format!("http://{}/api", server.data_addr().unwrap()))
        .send()
        .await
        .expect("Failed to send request");
    assert_eq!(response.status(), 404);

    let _ = client.shutdown().await;
}
