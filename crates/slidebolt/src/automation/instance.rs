//! Script instance task
//!
//! One tokio task per installed script. Triggers arrive on a bounded inbox
//! and run one at a time, so a handler always finishes before the next
//! trigger for the same entity starts. A panicking handler is caught and the
//! script is rebuilt from its factory under the restart policy.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::json;
use tokio::sync::mpsc;

use super::{Script, ScriptContext, ScriptFactory, ScriptServices, Trigger, TriggerTable, instantiate, panic_message};
use crate::store::DocumentStorage;
use crate::supervisor::{RestartPolicy, Supervisor};

/// Journal event name for handler failures
pub const SCRIPT_ERROR_EVENT: &str = "script_error";

/// How one handler invocation ended
enum Outcome {
    Ok,
    Failed(String),
    Panicked(String),
}

pub(crate) struct ScriptInstance {
    factory: Arc<dyn ScriptFactory>,
    script: Option<Box<dyn Script>>,
    table: Arc<RwLock<TriggerTable>>,
    ctx: ScriptContext,
    services: ScriptServices,
    storage: Arc<dyn DocumentStorage>,
    supervisor: Supervisor,
}

impl ScriptInstance {
    pub(crate) fn new(
        factory: Arc<dyn ScriptFactory>,
        script: Box<dyn Script>,
        table: Arc<RwLock<TriggerTable>>,
        ctx: ScriptContext,
        services: ScriptServices,
        storage: Arc<dyn DocumentStorage>,
        policy: RestartPolicy,
    ) -> Self {
        let mut supervisor = Supervisor::new(policy);
        supervisor.on_start();
        Self {
            factory,
            script: Some(script),
            table,
            ctx,
            services,
            storage,
            supervisor,
        }
    }

    /// Drain the inbox until every sender is gone
    pub(crate) async fn run(mut self, mut inbox: mpsc::Receiver<Trigger>) {
        while let Some(trigger) = inbox.recv().await {
            self.handle(trigger).await;
        }
        tracing::debug!(entity_id = %self.ctx.entity_id(), "Script instance stopped");
    }

    async fn handle(&mut self, trigger: Trigger) {
        let handlers = self.table.read().handlers_for(&trigger);
        let mut failure: Option<String> = None;

        for handler in handlers {
            let outcome = match self.script.as_mut() {
                Some(script) => {
                    let call = script.invoke(&handler, &mut self.ctx, &trigger);
                    match AssertUnwindSafe(call).catch_unwind().await {
                        Ok(Ok(())) => Outcome::Ok,
                        Ok(Err(e)) => Outcome::Failed(e.to_string()),
                        Err(panic) => Outcome::Panicked(panic_message(panic.as_ref())),
                    }
                }
                None => Outcome::Failed("script disabled after repeated crashes".to_string()),
            };

            match outcome {
                Outcome::Ok => {}
                Outcome::Failed(error) => {
                    tracing::warn!(
                        entity_id = %self.ctx.entity_id(),
                        handler = %handler,
                        error = %error,
                        "Script handler failed"
                    );
                    self.report(&handler, &error).await;
                    failure = Some(error);
                }
                Outcome::Panicked(error) => {
                    tracing::error!(
                        entity_id = %self.ctx.entity_id(),
                        handler = %handler,
                        error = %error,
                        "Script handler panicked"
                    );
                    self.report(&handler, &error).await;
                    failure = Some(format!("handler panicked: {error}"));
                    self.restart().await;
                    break;
                }
            }
        }

        // A command only succeeds once the state it wrote is durable
        if let Err(e) = self.flush().await {
            let error = format!("script state not persisted: {e}");
            tracing::error!(entity_id = %self.ctx.entity_id(), error = %e, "Failed to persist script state");
            self.report("flush", &error).await;
            failure.get_or_insert(error);
        }

        if let Trigger::Command(envelope) = &trigger {
            let succeeded = failure.is_none();
            if let Err(e) = self
                .services
                .router
                .complete(envelope.command_id, succeeded, failure)
                .await
            {
                tracing::debug!(command_id = %envelope.command_id, error = %e, "Command completion ignored");
            }
        }
    }

    /// Journal a handler failure on the hosting entity
    async fn report(&mut self, handler: &str, error: &str) {
        let payload = json!({
            "type": SCRIPT_ERROR_EVENT,
            "handler": handler,
            "error": error,
        });
        if let Err(e) = self
            .services
            .journal
            .record(
                self.ctx.plugin_id(),
                self.ctx.device_id(),
                self.ctx.entity_id(),
                payload,
                Utc::now(),
            )
            .await
        {
            tracing::warn!(entity_id = %self.ctx.entity_id(), error = %e, "Failed to journal script error");
        }
    }

    /// Rebuild the script after a crash, or disable it
    ///
    /// A rebuild that panics in `on_init` counts as another crash.
    async fn restart(&mut self) {
        self.script = None;
        loop {
            let Some(delay) = self.supervisor.on_crash() else {
                tracing::error!(
                    entity_id = %self.ctx.entity_id(),
                    restarts = self.supervisor.restart_count(),
                    "Script disabled after repeated crashes"
                );
                return;
            };

            tokio::time::sleep(delay).await;
            match instantiate(
                &self.factory,
                self.ctx.plugin_id(),
                self.ctx.device_id(),
                self.ctx.entity_id(),
            ) {
                Ok((script, table)) => {
                    *self.table.write() = table;
                    self.script = Some(script);
                    self.supervisor.on_start();
                    tracing::info!(
                        entity_id = %self.ctx.entity_id(),
                        attempt = self.supervisor.restart_count(),
                        "Script restarted"
                    );
                    return;
                }
                Err(e) => {
                    tracing::error!(entity_id = %self.ctx.entity_id(), error = %e, "Script rebuild failed");
                    self.report("on_init", &e.to_string()).await;
                }
            }
        }
    }

    /// Write dirty state; it stays dirty until a write succeeds
    async fn flush(&mut self) -> crate::Result<()> {
        if !self.ctx.is_dirty() {
            return Ok(());
        }
        self.storage.put_script_state(self.ctx.state()).await?;
        self.ctx.mark_clean();
        Ok(())
    }
}
