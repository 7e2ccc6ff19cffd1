//! Tests for health endpoints

use super::*;
use std::time::Duration;

/// Poll /healthz with backoff until the listener accepts connections
async fn wait_for_server(port: u16, max_retries: u32) -> reqwest::Client {
    let client = reqwest::Client::new();
    let mut delay = Duration::from_millis(10);

    for attempt in 1..=max_retries {
        match client
            .get(format!("http://127.0.0.1:{}/healthz", port))
            .timeout(Duration::from_millis(100))
            .send()
            .await
        {
            Ok(_) => return client,
            Err(_) if attempt < max_retries => {
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, Duration::from_millis(200));
            }
            Err(e) => panic!("Server not ready after {} attempts: {}", max_retries, e),
        }
    }
    client
}

async fn status(client: &reqwest::Client, port: u16, path: &str) -> u16 {
    client
        .get(format!("http://127.0.0.1:{}{}", port, path))
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .expect("Failed to connect to health server")
        .status()
        .as_u16()
}

/// Startup: live immediately, ready only once the watcher is running
#[tokio::test]
async fn test_readyz_follows_watcher_startup() {
    let readiness = ReadinessState::new();
    let port = 18180;
    let server_readiness = readiness.clone();
    let server_handle =
        tokio::spawn(async move { run_health_server(port, server_readiness).await });
    let client = wait_for_server(port, 10).await;

    assert_eq!(status(&client, port, "/healthz").await, 200);
    assert_eq!(status(&client, port, "/readyz").await, 503);

    readiness.set_ready();

    assert_eq!(status(&client, port, "/readyz").await, 200);

    server_handle.abort();
}

/// /readyz flips back to 503 once shutdown marks the controller not ready
#[tokio::test]
async fn test_readyz_returns_503_after_set_not_ready() {
    let readiness = ReadinessState::new();
    readiness.set_ready();

    let port = 18181;
    let server_readiness = readiness.clone();
    let server_handle =
        tokio::spawn(async move { run_health_server(port, server_readiness).await });
    let client = wait_for_server(port, 10).await;

    readiness.set_not_ready();

    assert_eq!(status(&client, port, "/readyz").await, 503);
    assert_eq!(status(&client, port, "/healthz").await, 200);

    server_handle.abort();
}

#[test]
fn test_readiness_state_transitions() {
    let state = ReadinessState::new();
    assert!(!state.is_ready());

    state.set_ready();
    assert!(state.is_ready());

    // Clone should share state
    let cloned = state.clone();
    cloned.set_not_ready();
    assert!(!state.is_ready());
}
