//! End-to-end tunnel tests
//!
//! Tests basic tunnel functionality: server, client, HTTP relaying

use super::{
    client_builder, make_client, server_builder, start_client, start_echo_server, start_server,
    wait_for_server, wait_for_sessions,
};
use std::time::Duration;

/// Test that server starts and accepts connections
#[tokio::test]
async fn test_server_starts() {
    let mut server = start_server(server_builder()).await;

    assert!(
        wait_for_server(server.control_addr().unwrap(), Duration::from_secs(5)).await,
        "Control plane did not start in time"
    );
    assert!(
        wait_for_server(server.data_addr().unwrap(), Duration::from_secs(5)).await,
        "Data plane did not start in time"
    );

    server.shutdown().await.expect("clean shutdown");
}

/// Test that client connects and the server registers its session
#[tokio::test]
async fn test_client_connects() {
    let upstream = start_echo_server("echo").await;
    let server = start_server(server_builder()).await;

    let mut client = client_builder(&server, &upstream.to_string())
        .build()
        .expect("Failed to build client");
    let info = client.start().await.expect("Client failed to connect");
    assert!(info.transport_wrapping);

    assert!(wait_for_sessions(&server, 1, Duration::from_secs(5)).await);
    let session = server
        .sessions()
        .unwrap()
        .get(&info.session_id)
        .expect("server should know the session id handed to the client");
    assert!(session.is_active());

    client.shutdown().await.expect("client shutdown");
}

/// Test full HTTP request through tunnel
#[tokio::test]
async fn test_http_through_tunnel() {
    let upstream = start_echo_server("echo").await;
    let server = start_server(server_builder()).await;
    let mut client = start_client(&server, client_builder(&server, &upstream.to_string())).await;

    let url = format!("http://{}/hello?x=1", server.data_addr().unwrap());
    let response = make_client()
        .get(&url)
        .send()
        .await
        .expect("Failed to send request");

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-path"], "/hello?x=1");
    assert_eq!(response.headers()["x-method"], "GET");
    assert_eq!(response.text().await.unwrap(), "Hello, World!");

    let _ = client.shutdown().await;
}

/// Test a large request body is streamed both ways intact
#[tokio::test]
async fn test_post_body_round_trip() {
    let upstream = start_echo_server("echo").await;
    let server = start_server(server_builder()).await;
    let mut client = start_client(&server, client_builder(&server, &upstream.to_string())).await;

    let payload: Vec<u8> = (0..600_000u32).map(|i| (i % 251) as u8).collect();
    let url = format!("http://{}/upload", server.data_addr().unwrap());
    let response = make_client()
        .post(&url)
        .body(payload.clone())
        .send()
        .await
        .expect("Failed to send request");

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-method"], "POST");
    let body = response.bytes().await.unwrap();
    assert_eq!(body.len(), payload.len());
    assert_eq!(body.as_ref(), payload.as_slice());

    let _ = client.shutdown().await;
}

/// Test cross-origin headers are stripped only while wrapping is enabled
#[tokio::test]
async fn test_transport_wrapping() {
    let upstream = start_echo_server("echo").await;

    let wrapped = start_server(server_builder()).await;
    let mut client = start_client(&wrapped, client_builder(&wrapped, &upstream.to_string())).await;
    let response = make_client()
        .get(format!("http://{}/", wrapped.data_addr().unwrap()))
        .send()
        .await
        .expect("Failed to send request");
    assert_eq!(response.status(), 200);
    assert!(!response
        .headers()
        .contains_key("access-control-allow-origin"));
    let _ = client.shutdown().await;

    let plain = start_server(server_builder().transport_wrapping(false)).await;
    let mut client = start_client(&plain, client_builder(&plain, &upstream.to_string())).await;
    let response = make_client()
        .get(format!("http://{}/", plain.data_addr().unwrap()))
        .send()
        .await
        .expect("Failed to send request");
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["access-control-allow-origin"], "*");
    let _ = client.shutdown().await;
}

/// Test client shutdown releases its session on the server
#[tokio::test]
async fn test_client_shutdown_unregisters_session() {
    let upstream = start_echo_server("echo").await;
    let mut server = start_server(server_builder()).await;
    let mut client = start_client(&server, client_builder(&server, &upstream.to_string())).await;

    assert!(client.is_running());
    client.shutdown().await.expect("client shutdown");
    assert!(!client.is_running());

    assert!(
        wait_for_sessions(&server, 0, Duration::from_secs(5)).await,
        "Session should be removed after the client leaves"
    );
    server.shutdown().await.expect("server shutdown");
}
