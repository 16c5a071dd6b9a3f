//! Session loss and reconnection

use super::{
    client_builder, get_free_port, make_client, server_builder, start_client, start_echo_server,
    start_server, wait_for_sessions,
};
use poglets::Server;
use std::time::Duration;

/// Wait until the server holds a session other than `old`
async fn wait_for_new_session(server: &Server, old: uuid::Uuid) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < Duration::from_secs(10) {
        let sessions = server.sessions().unwrap().sessions();
        if sessions.iter().any(|s| s.id() != old && s.is_active()) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Test the client comes back after the server drops its session
#[tokio::test]
async fn test_reconnect_after_session_closed() {
    let upstream = start_echo_server("echo").await;
    let server = start_server(server_builder()).await;
    let mut client = start_client(&server, client_builder(&server, &upstream.to_string())).await;

    let old = server.sessions().unwrap().sessions()[0].id();
    server.sessions().unwrap().close_all();

    assert!(
        wait_for_new_session(&server, old).await,
        "Client did not reconnect"
    );
    assert!(client.is_running());

    let response = make_client()
        .get(format!("http://{}/again", server.data_addr().unwrap()))
        .send()
        .await
        .expect("Failed to send request");
    assert_eq!(response.status(), 200);

    let _ = client.shutdown().await;
}

/// Test the client survives a server restart on the same control port
#[tokio::test]
async fn test_reconnect_after_server_restart() {
    let upstream = start_echo_server("echo").await;
    let control_addr = format!("127.0.0.1:{}", get_free_port()).parse().unwrap();

    let mut first = start_server(server_builder().control_addr(control_addr)).await;
    let mut client = start_client(&first, client_builder(&first, &upstream.to_string())).await;
    first.shutdown().await.expect("first server shutdown");

    // While no server is up the client keeps retrying
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(client.is_running());

    let second = start_server(server_builder().control_addr(control_addr)).await;
    assert!(
        wait_for_sessions(&second, 1, Duration::from_secs(10)).await,
        "Client did not reconnect to the restarted server"
    );

    let response = make_client()
        .get(format!("http://{}/", second.data_addr().unwrap()))
        .send()
        .await
        .expect("Failed to send request");
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "Hello, World!");

    let _ = client.shutdown().await;
}
