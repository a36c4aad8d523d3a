use crate::crypto::{LocalIdentity, MemoryKeyStore};
use crate::server::{Node, Settings};

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Settings for a node on an ephemeral local port with short timers.
pub fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.listener_ip = "127.0.0.1:0".to_string();
    settings.bootstrap_delta_ms = 50;
    settings.rpc_timeout_ms = 1_000;
    settings.connection.heartbeat_interval_ms = 200;
    settings.discovery.refresh_interval_ms = 0;
    settings.sync.propagation_interval_ms = 200;
    settings
}

pub async fn start_node(settings: Settings) -> Node {
    Node::start(settings, LocalIdentity::generate(), Arc::new(MemoryKeyStore::new())).await.unwrap()
}

/// Starts a node that bootstraps from `peers`.
pub async fn start_joining(mut settings: Settings, peers: &[SocketAddr]) -> Node {
    settings.bootstrap_peers = peers.iter().map(|p| p.to_string()).collect();
    start_node(settings).await
}

/// Polls `check` until it holds or `timeout` passes; returns the last result.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check().await
}
