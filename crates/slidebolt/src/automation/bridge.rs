//! Automation Bridge
//!
//! Hosts scripts on entities and feeds them triggers. The bridge is a plugin
//! like any other: it registers as the host plugin, heartbeats, and receives
//! commands for its entities over the message bus. Journal events from every
//! plugin are matched against each script's event patterns.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use slidebolt_types::{CommandEnvelope, JournalEvent, PluginManifest, ScriptState};

use super::instance::{SCRIPT_ERROR_EVENT, ScriptInstance};
use super::{ScriptContext, ScriptFactory, ScriptServices, Trigger, TriggerTable, instantiate};
use crate::command::ChannelBus;
use crate::config::AutomationConfig;
use crate::registry::Registry;
use crate::{GatewayError, Result};

type EntityKey = (String, String, String);

fn entity_key(plugin_id: &str, device_id: &str, entity_id: &str) -> EntityKey {
    (
        plugin_id.to_string(),
        device_id.to_string(),
        entity_id.to_string(),
    )
}

/// Live handle on an installed script
struct Installed {
    inbox: mpsc::Sender<Trigger>,
    table: Arc<RwLock<TriggerTable>>,
    task: JoinHandle<()>,
}

/// Script host attached to the message bus
pub struct AutomationBridge {
    config: AutomationConfig,
    registry: Arc<Registry>,
    bus: Arc<ChannelBus>,
    services: ScriptServices,
    scripts: DashMap<EntityKey, Installed>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl AutomationBridge {
    pub fn new(
        config: AutomationConfig,
        registry: Arc<Registry>,
        bus: Arc<ChannelBus>,
        services: ScriptServices,
    ) -> Self {
        Self {
            config,
            registry,
            bus,
            services,
            scripts: DashMap::new(),
            receiver: Mutex::new(None),
        }
    }

    pub fn host_plugin(&self) -> &str {
        &self.config.host_plugin
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Bus attachment
    // ─────────────────────────────────────────────────────────────────────────

    /// Register the host plugin and start receiving its commands
    pub fn attach(self: &Arc<Self>) -> Result<()> {
        let host = self.config.host_plugin.clone();
        self.registry.register(
            &host,
            PluginManifest::new(&host, "Automation")
                .with_description("Hosts entity scripts")
                .with_domains(vec!["automation".to_string()]),
        )?;

        let mut inbox = self.bus.connect(&host, self.config.inbox_capacity);
        let bridge = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(envelope) = inbox.recv().await {
                bridge.route_command(envelope).await;
            }
            tracing::debug!("Automation inbox closed");
        });

        if let Some(previous) = self.receiver.lock().replace(task) {
            previous.abort();
        }
        tracing::info!(plugin_id = %host, "Automation bridge attached");
        Ok(())
    }

    /// Keep the host plugin inside its liveness window
    pub fn heartbeat(&self) -> Result<()> {
        self.registry.heartbeat(&self.config.host_plugin).map(|_| ())
    }

    /// Stop receiving and tear down every script
    pub fn detach(&self) {
        self.bus.disconnect(&self.config.host_plugin);
        if let Some(task) = self.receiver.lock().take() {
            task.abort();
        }
        let keys: Vec<EntityKey> = self.scripts.iter().map(|s| s.key().clone()).collect();
        for (plugin_id, device_id, entity_id) in keys {
            self.uninstall(&plugin_id, &device_id, &entity_id);
        }
        tracing::info!(plugin_id = %self.config.host_plugin, "Automation bridge detached");
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Installation
    // ─────────────────────────────────────────────────────────────────────────

    /// Load a script onto an existing entity, replacing any previous one
    ///
    /// Only entities of the host plugin can carry scripts, since commands
    /// reach the bridge through the host plugin's channel.
    pub async fn install(
        &self,
        plugin_id: &str,
        device_id: &str,
        entity_id: &str,
        factory: Arc<dyn ScriptFactory>,
    ) -> Result<()> {
        if plugin_id != self.config.host_plugin {
            return Err(GatewayError::ScriptRejected(format!(
                "scripts are hosted by {}, not {plugin_id}",
                self.config.host_plugin
            )));
        }
        if !self
            .services
            .store
            .entity_exists(plugin_id, device_id, entity_id)
            .await
        {
            return Err(GatewayError::unknown_entity(plugin_id, device_id, entity_id));
        }

        let storage = Arc::clone(self.services.store.storage());
        let mut state = ScriptState::new(plugin_id, device_id, entity_id);
        if let Some(saved) = storage
            .load_script_state(plugin_id, device_id, entity_id)
            .await?
        {
            state.key_values = saved;
        }

        let (script, table) = instantiate(&factory, plugin_id, device_id, entity_id)
            .map_err(|e| GatewayError::ScriptRejected(e.to_string()))?;
        let table = Arc::new(RwLock::new(table));
        let ctx = ScriptContext::new(self.services.clone(), state);
        let instance = ScriptInstance::new(
            factory,
            script,
            Arc::clone(&table),
            ctx,
            self.services.clone(),
            storage,
            self.config.restart_policy(),
        );

        let (tx, rx) = mpsc::channel(self.config.inbox_capacity.max(1));
        let task = tokio::spawn(instance.run(rx));
        let installed = Installed {
            inbox: tx,
            table,
            task,
        };

        if let Some(previous) = self
            .scripts
            .insert(entity_key(plugin_id, device_id, entity_id), installed)
        {
            previous.task.abort();
        }
        tracing::info!(plugin_id, device_id, entity_id, "Script installed");
        Ok(())
    }

    /// Stop and remove a script; queued triggers are dropped
    pub fn uninstall(&self, plugin_id: &str, device_id: &str, entity_id: &str) -> bool {
        match self
            .scripts
            .remove(&entity_key(plugin_id, device_id, entity_id))
        {
            Some((_, installed)) => {
                installed.task.abort();
                tracing::info!(plugin_id, device_id, entity_id, "Script uninstalled");
                true
            }
            None => false,
        }
    }

    /// Remove every script hosted under a device
    pub fn uninstall_device(&self, plugin_id: &str, device_id: &str) -> usize {
        let keys: Vec<EntityKey> = self
            .scripts
            .iter()
            .filter(|s| s.key().0 == plugin_id && s.key().1 == device_id)
            .map(|s| s.key().clone())
            .collect();
        let mut removed = 0;
        for (plugin_id, device_id, entity_id) in &keys {
            if self.uninstall(plugin_id, device_id, entity_id) {
                removed += 1;
            }
        }
        removed
    }

    pub fn is_installed(&self, plugin_id: &str, device_id: &str, entity_id: &str) -> bool {
        self.scripts
            .contains_key(&entity_key(plugin_id, device_id, entity_id))
    }

    /// Installed script locations, sorted
    pub fn installed(&self) -> Vec<(String, String, String)> {
        let mut keys: Vec<EntityKey> = self.scripts.iter().map(|s| s.key().clone()).collect();
        keys.sort();
        keys
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Routing
    // ─────────────────────────────────────────────────────────────────────────

    /// Ack a command on receipt and queue it for its script
    pub async fn route_command(&self, envelope: CommandEnvelope) {
        let router = &self.services.router;
        let command_id = envelope.command_id;
        let key = entity_key(&envelope.plugin_id, &envelope.device_id, &envelope.entity_id);
        let inbox = self.scripts.get(&key).map(|s| s.inbox.clone());

        let Some(inbox) = inbox else {
            // No script: accepted and done
            if let Err(e) = router.complete(command_id, true, None).await {
                tracing::debug!(%command_id, error = %e, "Command completion ignored");
            }
            return;
        };

        let permit = match inbox.try_reserve() {
            Ok(permit) => permit,
            Err(TrySendError::Full(())) => {
                tracing::warn!(%command_id, entity_id = %envelope.entity_id, "Script inbox full");
                if let Err(e) = router
                    .ack(command_id, false, Some("script inbox full".to_string()))
                    .await
                {
                    tracing::debug!(%command_id, error = %e, "Command rejection ignored");
                }
                return;
            }
            Err(TrySendError::Closed(())) => {
                if let Err(e) = router
                    .ack(command_id, false, Some("script stopped".to_string()))
                    .await
                {
                    tracing::debug!(%command_id, error = %e, "Command rejection ignored");
                }
                return;
            }
        };

        // Ack before the script can complete it
        if let Err(e) = router.ack(command_id, true, None).await {
            tracing::debug!(%command_id, error = %e, "Command ack ignored");
            return;
        }
        permit.send(Trigger::Command(envelope));
    }

    /// Offer a journal event to every script whose patterns match
    pub fn route_event(&self, event: &JournalEvent) -> usize {
        // Failure reports never trigger scripts
        if event.name == SCRIPT_ERROR_EVENT {
            return 0;
        }

        let trigger = Trigger::Event(event.clone());
        let mut delivered = 0;
        for script in self.scripts.iter() {
            if !script.table.read().wants(&trigger) {
                continue;
            }
            match script.inbox.try_send(trigger.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => tracing::warn!(
                    entity_id = %script.key().2,
                    sequence = event.sequence,
                    "Script inbox full, event dropped"
                ),
                Err(TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }
}
