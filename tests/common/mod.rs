#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use session_ws::testing::{MockServer, MockTransport};
use session_ws::{SessionClient, SessionConfig, SessionStatus, TokenProvider};

pub const TOKEN: &str = "secret-token";

/// Fast backoff, heartbeat off unless a test turns it on.
pub fn test_config() -> SessionConfig {
    SessionConfig::new("ws://mock.local/client-ws")
        .expect("valid url")
        .with_backoff(Duration::from_millis(20), Duration::from_millis(200))
        .with_max_reconnect_attempts(5)
        .with_heartbeat_interval(Duration::ZERO)
}

pub fn mock_client(config: SessionConfig) -> (SessionClient, MockTransport, MockServer) {
    mock_client_with(config, || async { Some(TOKEN.to_string()) })
}

pub fn mock_client_with(
    config: SessionConfig,
    provider: impl TokenProvider,
) -> (SessionClient, MockTransport, MockServer) {
    let (transport, server) = MockTransport::channel_pair();
    let client = SessionClient::with_transport(config, provider, transport.clone())
        .expect("client should build");
    (client, transport, server)
}

/// Token provider that counts how often it was asked.
pub fn counting_provider() -> (impl TokenProvider, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let provider = move || {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Some(TOKEN.to_string()) }
    };
    (provider, calls)
}

pub async fn wait_for_status(client: &SessionClient, expected: SessionStatus, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let status = client.status().await.expect("session status");
        if status == expected {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {expected}, last status {status}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
