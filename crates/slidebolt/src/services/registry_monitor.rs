//! Registry Monitor
//!
//! Keeps the gateway's own registration alive and expires plugins that
//! stopped heartbeating.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::registry::Registry;
use crate::runtime::{GatewaySignal, Worker, WorkerContext, WorkerResult, WorkerSpec};

pub struct RegistryMonitor {
    registry: Arc<Registry>,
    gateway_plugin: String,
    interval: Duration,
}

impl RegistryMonitor {
    pub fn new(registry: Arc<Registry>, gateway_plugin: impl Into<String>, interval: Duration) -> Self {
        Self {
            registry,
            gateway_plugin: gateway_plugin.into(),
            interval,
        }
    }

    /// One supervision pass; returns the expired plugin ids
    pub fn run_once(&self, ctx: &WorkerContext) -> Vec<String> {
        if let Err(e) = self.registry.heartbeat(&self.gateway_plugin) {
            tracing::warn!(plugin_id = %self.gateway_plugin, error = %e, "Gateway self-heartbeat failed");
        }

        let expired = self.registry.sweep(Utc::now());
        for plugin_id in &expired {
            ctx.publish(GatewaySignal::PluginExpired {
                plugin_id: plugin_id.clone(),
            });
        }
        expired
    }
}

#[async_trait]
impl Worker for RegistryMonitor {
    fn spec(&self) -> WorkerSpec {
        WorkerSpec::new("registry-monitor", "Registry Monitor").with_tick_interval(self.interval)
    }

    async fn on_start(&mut self, _ctx: &WorkerContext) -> WorkerResult<()> {
        tracing::debug!(interval = ?self.interval, "Registry monitor started");
        Ok(())
    }

    async fn on_tick(&mut self, ctx: &WorkerContext) -> WorkerResult<()> {
        self.run_once(ctx);
        Ok(())
    }
}
