//! Automation worker
//!
//! Runs the bridge under the worker manager: attaches on start, heartbeats
//! the host plugin on every tick and routes journal signals to scripts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::AutomationBridge;
use crate::runtime::{GatewaySignal, Worker, WorkerContext, WorkerResult, WorkerSpec};

pub struct AutomationWorker {
    bridge: Arc<AutomationBridge>,
    heartbeat_interval: Duration,
}

impl AutomationWorker {
    pub fn new(bridge: Arc<AutomationBridge>, heartbeat_interval: Duration) -> Self {
        Self {
            bridge,
            heartbeat_interval,
        }
    }
}

#[async_trait]
impl Worker for AutomationWorker {
    fn spec(&self) -> WorkerSpec {
        WorkerSpec::new("automation", "Automation Bridge")
            .with_tick_interval(self.heartbeat_interval)
            .subscribe("journal/appended")
    }

    async fn on_start(&mut self, _ctx: &WorkerContext) -> WorkerResult<()> {
        self.bridge.attach()?;
        Ok(())
    }

    async fn on_stop(&mut self, _ctx: &WorkerContext) -> WorkerResult<()> {
        self.bridge.detach();
        Ok(())
    }

    async fn on_signal(&mut self, _ctx: &WorkerContext, signal: GatewaySignal) -> WorkerResult<()> {
        if let GatewaySignal::JournalAppended(event) = signal {
            self.bridge.route_event(&event);
        }
        Ok(())
    }

    async fn on_tick(&mut self, _ctx: &WorkerContext) -> WorkerResult<()> {
        self.bridge.heartbeat()?;
        Ok(())
    }
}
