//! Shared scenario helpers
#![allow(dead_code)]

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::task::JoinHandle;

use slidebolt::Gateway;
use slidebolt::command::Router;
use slidebolt::config::GatewayConfig;
use slidebolt::slidebolt_types::PluginManifest;

/// Short timings so scenarios settle quickly
pub fn test_config(dir: &Path) -> GatewayConfig {
    let mut config = GatewayConfig::default().with_data_dir(dir);
    config.registry.sweep_interval_ms = 100;
    config.commands.ack_timeout_ms = 400;
    config.commands.reap_interval_ms = 50;
    config.automation.heartbeat_interval_ms = 100;
    config.automation.restart.initial_backoff_ms = 10;
    config.automation.restart.max_backoff_ms = 50;
    config
}

/// A started gateway over a fresh data directory
pub async fn started_gateway() -> (Gateway, TempDir) {
    let dir = TempDir::new().unwrap();
    let gateway = Gateway::open(test_config(dir.path())).await.unwrap();
    gateway.start().await.unwrap();
    (gateway, dir)
}

pub fn register(gateway: &Gateway, plugin_id: &str) {
    gateway
        .registry()
        .register(plugin_id, PluginManifest::new(plugin_id, plugin_id))
        .unwrap();
}

/// Connect a plugin that accepts and completes every command it receives
pub fn spawn_responder(gateway: &Gateway, plugin_id: &str) -> JoinHandle<Vec<String>> {
    let mut inbox = gateway.bus().connect(plugin_id, 64);
    let router: Arc<Router> = gateway.router().clone();
    tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(envelope) = inbox.recv().await {
            seen.push(envelope.command_type.clone());
            let _ = router.ack(envelope.command_id, true, None).await;
            let _ = router.complete(envelope.command_id, true, None).await;
        }
        seen
    })
}

/// Poll `check` until it holds or the timeout passes
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
