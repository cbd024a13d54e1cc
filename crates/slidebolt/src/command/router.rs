//! Command Router
//!
//! Validates and records commands, hands them to the plugin transport and
//! tracks acknowledgements. Dispatch returns as soon as the command is
//! `Pending`; delivery runs on its own task so no caller waits on a plugin.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::{Value, json};
use uuid::Uuid;

use slidebolt_types::{CommandEnvelope, CommandState, CommandStatus, Transition, command_type};

use super::PluginTransport;
use crate::config::CommandConfig;
use crate::journal::Journal;
use crate::registry::Registry;
use crate::runtime::{GatewaySignal, SignalBus};
use crate::store::StateStore;
use crate::{GatewayError, Result};

/// Journal event name for settled commands
pub const COMMAND_RESULT_EVENT: &str = "command_result";

fn elapsed(now: DateTime<Utc>, since: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

/// What one reaper pass did
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReapReport {
    /// Commands failed for lack of an ack or a completion
    pub timed_out: Vec<Uuid>,
    /// Terminal statuses dropped after the retention period
    pub pruned: usize,
}

/// Async command dispatcher and status tracker
pub struct Router {
    config: CommandConfig,
    registry: Arc<Registry>,
    store: Arc<StateStore>,
    journal: Arc<Journal>,
    transport: Arc<dyn PluginTransport>,
    signals: SignalBus,
    commands: DashMap<Uuid, CommandStatus>,
    /// (target plugin, caller key) -> command
    idempotency: DashMap<(String, String), Uuid>,
}

impl Router {
    pub fn new(
        config: CommandConfig,
        registry: Arc<Registry>,
        store: Arc<StateStore>,
        journal: Arc<Journal>,
        transport: Arc<dyn PluginTransport>,
        signals: SignalBus,
    ) -> Self {
        Self {
            config,
            registry,
            store,
            journal,
            transport,
            signals,
            commands: DashMap::new(),
            idempotency: DashMap::new(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Dispatch
    // ─────────────────────────────────────────────────────────────────────────

    /// Queue a command for a plugin's entity
    pub async fn dispatch(
        self: &Arc<Self>,
        plugin_id: &str,
        device_id: &str,
        entity_id: &str,
        payload: Value,
    ) -> Result<CommandStatus> {
        self.dispatch_with_key(plugin_id, device_id, entity_id, payload, None)
            .await
    }

    /// Dispatch; a repeated `idempotency_key` returns the existing status
    pub async fn dispatch_with_key(
        self: &Arc<Self>,
        plugin_id: &str,
        device_id: &str,
        entity_id: &str,
        payload: Value,
        idempotency_key: Option<&str>,
    ) -> Result<CommandStatus> {
        self.registry.require_healthy(plugin_id)?;
        let kind = command_type(&payload)?;
        if !self.store.entity_exists(plugin_id, device_id, entity_id).await {
            return Err(GatewayError::unknown_entity(plugin_id, device_id, entity_id));
        }

        let status = CommandStatus::pending(plugin_id, device_id, entity_id, kind, Utc::now());
        let status = match idempotency_key {
            Some(key) => match self.idempotency.entry((plugin_id.to_string(), key.to_string())) {
                Entry::Occupied(existing) => {
                    if let Some(known) = self.commands.get(existing.get()) {
                        tracing::debug!(
                            plugin_id,
                            idempotency_key = key,
                            command_id = %known.command_id,
                            "Duplicate dispatch collapsed"
                        );
                        return Ok(known.clone());
                    }
                    // The status was pruned; the key starts over
                    let mut existing = existing;
                    existing.insert(status.command_id);
                    self.commands.insert(status.command_id, status.clone());
                    status
                }
                Entry::Vacant(slot) => {
                    self.commands.insert(status.command_id, status.clone());
                    slot.insert(status.command_id);
                    status
                }
            },
            None => {
                self.commands.insert(status.command_id, status.clone());
                status
            }
        };

        tracing::info!(
            plugin_id,
            device_id,
            entity_id,
            command_id = %status.command_id,
            command_type = %status.command_type,
            "Command dispatched"
        );
        self.signals
            .publish(GatewaySignal::CommandDispatched(status.clone()));

        let envelope = CommandEnvelope::new(&status, payload);
        let router = Arc::clone(self);
        tokio::spawn(async move {
            let command_id = envelope.command_id;
            if let Err(e) = router.transport.deliver(envelope).await {
                tracing::warn!(%command_id, error = %e, "Command delivery failed");
                router.fail(command_id, e.to_string()).await;
            }
        });

        Ok(status)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Plugin callbacks
    // ─────────────────────────────────────────────────────────────────────────

    /// Record a plugin's acknowledgement
    pub async fn ack(
        &self,
        command_id: Uuid,
        accepted: bool,
        error: Option<String>,
    ) -> Result<CommandStatus> {
        let (status, transition) = {
            let mut entry = self
                .commands
                .get_mut(&command_id)
                .ok_or(GatewayError::UnknownCommand(command_id))?;
            let transition = entry.acknowledge(accepted, error, Utc::now())?;
            (entry.clone(), transition)
        };

        self.after_transition(&status, transition).await;
        Ok(status)
    }

    /// Record a plugin's completion result
    pub async fn complete(
        &self,
        command_id: Uuid,
        succeeded: bool,
        error: Option<String>,
    ) -> Result<CommandStatus> {
        let (status, transition) = {
            let mut entry = self
                .commands
                .get_mut(&command_id)
                .ok_or(GatewayError::UnknownCommand(command_id))?;
            let transition = entry.complete(succeeded, error, Utc::now())?;
            (entry.clone(), transition)
        };

        self.after_transition(&status, transition).await;
        Ok(status)
    }

    async fn fail(&self, command_id: Uuid, error: String) -> Option<CommandStatus> {
        let (status, transition) = {
            let mut entry = self.commands.get_mut(&command_id)?;
            let transition = entry.fail(error, Utc::now());
            (entry.clone(), transition)
        };
        self.after_transition(&status, transition).await;
        Some(status)
    }

    async fn after_transition(&self, status: &CommandStatus, transition: Transition) {
        match transition {
            Transition::Unchanged => {}
            Transition::Moved { terminal: false } => {
                tracing::debug!(command_id = %status.command_id, state = %status.state, "Command acknowledged");
            }
            Transition::Moved { terminal: true } => self.settled(status).await,
        }
    }

    /// Journal and announce a terminal status
    async fn settled(&self, status: &CommandStatus) {
        match status.state {
            CommandState::Failed => tracing::warn!(
                command_id = %status.command_id,
                plugin_id = %status.plugin_id,
                error = status.error.as_deref().unwrap_or_default(),
                "Command failed"
            ),
            _ => tracing::info!(
                command_id = %status.command_id,
                plugin_id = %status.plugin_id,
                state = %status.state,
                "Command settled"
            ),
        }

        // The entity may have been deleted while the command was in flight
        if self
            .store
            .entity_exists(&status.plugin_id, &status.device_id, &status.entity_id)
            .await
        {
            let payload = json!({
                "type": COMMAND_RESULT_EVENT,
                "command_id": status.command_id,
                "command_type": status.command_type,
                "state": status.state,
                "error": status.error,
            });
            let now = status.completed_at.unwrap_or_else(Utc::now);
            if let Err(e) = self
                .journal
                .record(&status.plugin_id, &status.device_id, &status.entity_id, payload, now)
                .await
            {
                tracing::warn!(command_id = %status.command_id, error = %e, "Failed to journal command result");
            }
        }

        self.signals
            .publish(GatewaySignal::CommandSettled(status.clone()));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    pub fn get_status(&self, command_id: Uuid) -> Result<CommandStatus> {
        self.commands
            .get(&command_id)
            .map(|s| s.clone())
            .ok_or(GatewayError::UnknownCommand(command_id))
    }

    /// Known statuses targeting a plugin, oldest first
    pub fn list(&self, plugin_id: &str) -> Vec<CommandStatus> {
        let mut statuses: Vec<CommandStatus> = self
            .commands
            .iter()
            .filter(|s| s.plugin_id == plugin_id)
            .map(|s| s.clone())
            .collect();
        statuses.sort_by_key(|s| (s.created_at, s.command_id));
        statuses
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reaping
    // ─────────────────────────────────────────────────────────────────────────

    /// Fail overdue commands and drop expired terminal statuses
    pub async fn reap(&self, now: DateTime<Utc>) -> ReapReport {
        let ack_timeout = self.config.ack_timeout();
        let completion_timeout = self.config.completion_timeout();
        let retention = self.config.retention();

        let overdue: Vec<(Uuid, &'static str)> = self
            .commands
            .iter()
            .filter_map(|s| match s.state {
                CommandState::Pending if elapsed(now, s.created_at) > ack_timeout => {
                    Some((s.command_id, "no acknowledgement"))
                }
                CommandState::Accepted if elapsed(now, s.updated_at) > completion_timeout => {
                    Some((s.command_id, "no completion"))
                }
                _ => None,
            })
            .collect();

        let mut report = ReapReport::default();
        for (command_id, reason) in overdue {
            let (status, transition) = {
                let Some(mut entry) = self.commands.get_mut(&command_id) else {
                    continue;
                };
                let transition = entry.fail(format!("timeout: {reason}"), now);
                (entry.clone(), transition)
            };
            if transition != Transition::Unchanged {
                report.timed_out.push(command_id);
                self.after_transition(&status, transition).await;
            }
        }

        let before = self.commands.len();
        self.commands.retain(|_, s| {
            !(s.state.is_terminal()
                && s.completed_at
                    .is_some_and(|done| elapsed(now, done) > retention))
        });
        report.pruned = before.saturating_sub(self.commands.len());
        if report.pruned > 0 {
            self.idempotency
                .retain(|_, command_id| self.commands.contains_key(command_id));
            tracing::debug!(pruned = report.pruned, "Pruned settled commands");
        }

        report
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ChannelBus;
    use crate::config::RegistryConfig;
    use crate::store::MemoryStorage;
    use chrono::TimeDelta;
    use slidebolt_types::{EntityPatch, JournalFilter, PluginManifest};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Harness {
        router: Arc<Router>,
        journal: Arc<Journal>,
        registry: Arc<Registry>,
        inbox: mpsc::Receiver<CommandEnvelope>,
        _dir: TempDir,
    }

    async fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let signals = SignalBus::default();
        let registry = Arc::new(Registry::new(&RegistryConfig::default(), signals.clone()));
        registry
            .register("plugin-test", PluginManifest::new("plugin-test", "Test"))
            .unwrap();
        let store = Arc::new(
            StateStore::open(registry.clone(), Arc::new(MemoryStorage::new()))
                .await
                .unwrap(),
        );
        store
            .upsert_entity("plugin-test", "dev1", EntityPatch::new("light1").with_domain("light"))
            .await
            .unwrap();
        let journal = Arc::new(
            Journal::open(
                dir.path().join("journal.redb"),
                registry.clone(),
                store.clone(),
                signals.clone(),
            )
            .unwrap(),
        );
        let bus = Arc::new(ChannelBus::new());
        let inbox = bus.connect("plugin-test", 16);
        let router = Arc::new(Router::new(
            CommandConfig::default(),
            registry.clone(),
            store,
            journal.clone(),
            bus,
            signals,
        ));

        Harness {
            router,
            journal,
            registry,
            inbox,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_command_lifecycle() {
        let mut h = harness().await;

        let status = h
            .router
            .dispatch("plugin-test", "dev1", "light1", json!({"type": "turn_on"}))
            .await
            .unwrap();
        assert_eq!(status.state, CommandState::Pending);

        let envelope = h.inbox.recv().await.unwrap();
        assert_eq!(envelope.command_id, status.command_id);
        assert_eq!(envelope.payload["type"], "turn_on");

        let accepted = h.router.ack(status.command_id, true, None).await.unwrap();
        assert_eq!(accepted.state, CommandState::Accepted);

        let done = h.router.complete(status.command_id, true, None).await.unwrap();
        assert_eq!(done.state, CommandState::Succeeded);
        assert!(done.completed_at.is_some());

        // Terminal states never regress
        assert!(matches!(
            h.router.ack(status.command_id, false, None).await,
            Err(GatewayError::Conflict(_))
        ));
        assert_eq!(
            h.router.get_status(status.command_id).unwrap().state,
            CommandState::Succeeded
        );

        let events = h
            .journal
            .query(&JournalFilter::for_entity("plugin-test", "dev1", "light1"), None)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, COMMAND_RESULT_EVENT);
        assert_eq!(events[0].payload["state"], "succeeded");
    }

    #[tokio::test]
    async fn test_dispatch_rejections_create_nothing() {
        let h = harness().await;

        assert!(matches!(
            h.router
                .dispatch("plugin-ghost", "dev1", "light1", json!({"type": "turn_on"}))
                .await,
            Err(GatewayError::UnknownPlugin(_))
        ));
        assert!(matches!(
            h.router
                .dispatch("plugin-test", "dev1", "missing", json!({"type": "turn_on"}))
                .await,
            Err(GatewayError::UnknownEntity { .. })
        ));
        assert!(matches!(
            h.router
                .dispatch("plugin-test", "dev1", "light1", json!("turn_on"))
                .await,
            Err(GatewayError::InvalidPayload(_))
        ));
        assert!(matches!(
            h.router
                .dispatch("plugin-test", "dev1", "light1", json!({"type": 3}))
                .await,
            Err(GatewayError::InvalidPayload(_))
        ));
        assert!(h.router.is_empty());
    }

    #[tokio::test]
    async fn test_stale_plugin_is_unavailable() {
        let h = harness().await;
        let old = Utc::now() - TimeDelta::seconds(30);
        h.registry.unregister("plugin-test");
        h.registry
            .register_at("plugin-test", PluginManifest::new("plugin-test", "Test"), old)
            .unwrap();

        let err = h
            .router
            .dispatch("plugin-test", "dev1", "light1", json!({"type": "turn_on"}))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(h.router.is_empty());
    }

    #[tokio::test]
    async fn test_idempotency_key_returns_existing_status() {
        let h = harness().await;

        let first = h
            .router
            .dispatch_with_key(
                "plugin-test",
                "dev1",
                "light1",
                json!({"type": "turn_on"}),
                Some("retry-1"),
            )
            .await
            .unwrap();
        let second = h
            .router
            .dispatch_with_key(
                "plugin-test",
                "dev1",
                "light1",
                json!({"type": "turn_on"}),
                Some("retry-1"),
            )
            .await
            .unwrap();

        assert_eq!(first.command_id, second.command_id);
        assert_eq!(h.router.list("plugin-test").len(), 1);
    }

    #[tokio::test]
    async fn test_undeliverable_command_fails() {
        let mut h = harness().await;
        h.inbox.close();

        let status = h
            .router
            .dispatch("plugin-test", "dev1", "light1", json!({"type": "turn_on"}))
            .await
            .unwrap();

        let router = h.router.clone();
        let failed = tokio::time::timeout(Duration::from_secs(2), async move {
            loop {
                let current = router.get_status(status.command_id).unwrap();
                if current.state.is_terminal() {
                    return current;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(failed.state, CommandState::Failed);
        assert!(failed.error.unwrap().contains("plugin-test"));
    }

    #[tokio::test]
    async fn test_complete_from_pending_and_duplicate_ack() {
        let h = harness().await;
        let status = h
            .router
            .dispatch("plugin-test", "dev1", "light1", json!({"type": "toggle"}))
            .await
            .unwrap();

        h.router.ack(status.command_id, true, None).await.unwrap();
        let again = h.router.ack(status.command_id, true, None).await.unwrap();
        assert_eq!(again.state, CommandState::Accepted);

        let other = h
            .router
            .dispatch("plugin-test", "dev1", "light1", json!({"type": "toggle"}))
            .await
            .unwrap();
        let failed = h
            .router
            .complete(other.command_id, false, Some("relay stuck".into()))
            .await
            .unwrap();
        assert_eq!(failed.state, CommandState::Failed);
        assert_eq!(failed.error.as_deref(), Some("relay stuck"));

        assert!(matches!(
            h.router.get_status(Uuid::new_v4()),
            Err(GatewayError::UnknownCommand(_))
        ));
    }

    #[tokio::test]
    async fn test_reap_times_out_and_prunes() {
        let h = harness().await;
        let pending = h
            .router
            .dispatch("plugin-test", "dev1", "light1", json!({"type": "turn_on"}))
            .await
            .unwrap();
        let accepted = h
            .router
            .dispatch_with_key(
                "plugin-test",
                "dev1",
                "light1",
                json!({"type": "turn_off"}),
                Some("k"),
            )
            .await
            .unwrap();
        h.router.ack(accepted.command_id, true, None).await.unwrap();

        // Inside both timeouts nothing moves
        let report = h.router.reap(Utc::now()).await;
        assert!(report.timed_out.is_empty());

        let later = Utc::now() + TimeDelta::seconds(6);
        let report = h.router.reap(later).await;
        assert_eq!(report.timed_out, vec![pending.command_id]);
        let failed = h.router.get_status(pending.command_id).unwrap();
        assert!(failed.error.unwrap().starts_with("timeout"));

        let report = h.router.reap(Utc::now() + TimeDelta::seconds(31)).await;
        assert_eq!(report.timed_out, vec![accepted.command_id]);

        let report = h.router.reap(Utc::now() + TimeDelta::seconds(400)).await;
        assert_eq!(report.pruned, 2);
        assert!(h.router.is_empty());

        // The pruned key no longer collapses dispatches
        let fresh = h
            .router
            .dispatch_with_key(
                "plugin-test",
                "dev1",
                "light1",
                json!({"type": "turn_off"}),
                Some("k"),
            )
            .await
            .unwrap();
        assert_ne!(fresh.command_id, accepted.command_id);
    }
}
