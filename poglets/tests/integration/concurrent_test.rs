//! Concurrency integration tests

use super::{client_builder, server_builder, start_client, start_echo_server, start_server};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// Test multiple concurrent requests through a single tunnel
#[tokio::test]
async fn test_concurrent_requests() {
    let upstream = start_echo_server("echo").await;
    let server = start_server(server_builder()).await;
    let mut client = start_client(&server, client_builder(&server, &upstream.to_string())).await;
    let data_addr = server.data_addr().unwrap();

    let success_count = Arc::new(AtomicUsize::new(0));
    let mut handles = vec![];

    // Spawn 50 concurrent requests
    for i in 0..50 {
        let counter = success_count.clone();

        handles.push(tokio::spawn(async move {
            let http_client = super::make_client();
            let url = format!("http://{data_addr}/?req={i}");

            match http_client.get(&url).send().await {
                Ok(resp) if resp.status() == 200 => {
                    let path_ok = resp.headers()["x-path"] == format!("/?req={i}").as_str();
                    if let Ok(text) = resp.text().await {
                        if path_ok && text.contains("Hello, World!") {
                            counter.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                _ => {}
            }
        }));
    }

    // Wait for all requests
    for h in handles {
        let _ = h.await;
    }

    assert_eq!(
        success_count.load(Ordering::Relaxed),
        50,
        "All 50 requests should succeed"
    );

    let _ = client.shutdown().await;
}

/// Test interleaved uploads keep their bodies separate
#[tokio::test]
async fn test_concurrent_uploads_do_not_mix() {
    let upstream = start_echo_server("echo").await;
    let server = start_server(server_builder()).await;
    let mut client = start_client(&server, client_builder(&server, &upstream.to_string())).await;
    let data_addr = server.data_addr().unwrap();

    let mut handles = vec![];
    for i in 0..8u8 {
        handles.push(tokio::spawn(async move {
            let payload = vec![b'a' + i; 300_000];
            let response = super::make_client()
                .put(format!("http://{data_addr}/blob/{i}"))
                .body(payload.clone())
                .send()
                .await
                .expect("Failed to send request");
            assert_eq!(response.status(), 200);
            let body = response.bytes().await.unwrap();
            assert_eq!(body.as_ref(), payload.as_slice());
        }));
    }
    for h in handles {
        h.await.expect("upload task panicked");
    }

    let _ = client.shutdown().await;
}
