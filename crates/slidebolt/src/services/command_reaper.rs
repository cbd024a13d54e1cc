//! Command Reaper
//!
//! Fails commands that were never acknowledged or completed and prunes
//! settled statuses once their retention runs out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::command::Router;
use crate::runtime::{Worker, WorkerContext, WorkerResult, WorkerSpec};

pub struct CommandReaper {
    router: Arc<Router>,
    interval: Duration,
}

impl CommandReaper {
    pub fn new(router: Arc<Router>, interval: Duration) -> Self {
        Self { router, interval }
    }
}

#[async_trait]
impl Worker for CommandReaper {
    fn spec(&self) -> WorkerSpec {
        WorkerSpec::new("command-reaper", "Command Reaper").with_tick_interval(self.interval)
    }

    async fn on_tick(&mut self, _ctx: &WorkerContext) -> WorkerResult<()> {
        let report = self.router.reap(Utc::now()).await;
        if !report.timed_out.is_empty() {
            tracing::info!(timed_out = report.timed_out.len(), "Reaped overdue commands");
        }
        Ok(())
    }
}
