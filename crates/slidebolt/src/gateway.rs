//! Gateway façade
//!
//! Wires the core components together and owns their lifetime. Operations
//! that span components (state journaling, cascade delete) live here so the
//! components themselves stay independent.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;

use slidebolt_types::{EntityPatch, HealthStatus, JournalFilter, PluginManifest};

use crate::automation::{AutomationBridge, AutomationWorker, ScriptServices};
use crate::command::{ChannelBus, Router};
use crate::config::GatewayConfig;
use crate::journal::Journal;
use crate::registry::Registry;
use crate::runtime::{SignalBus, WorkerManager, WorkerState};
use crate::services::{CommandReaper, RegistryMonitor};
use crate::store::{DeletedDevice, DocumentStorage, EntityWrite, FileStorage, StateStore};
use crate::{GatewayError, Result};

/// Journal event name for reported-state changes
pub const STATE_EVENT: &str = "state";

/// Overall gateway status
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewayHealth {
    pub plugin_id: String,
    pub status: HealthStatus,
    /// Registered plugins, the gateway included
    pub plugins: usize,
    pub workers: Vec<(String, WorkerState)>,
}

/// The Gateway Core
pub struct Gateway {
    config: GatewayConfig,
    signals: SignalBus,
    registry: Arc<Registry>,
    store: Arc<StateStore>,
    journal: Arc<Journal>,
    bus: Arc<ChannelBus>,
    router: Arc<Router>,
    bridge: Arc<AutomationBridge>,
    workers: WorkerManager,
}

impl Gateway {
    /// Open the gateway over documents in `data_dir`
    pub async fn open(config: GatewayConfig) -> Result<Self> {
        let storage = Arc::new(FileStorage::new(config.data_dir.clone()));
        Self::open_with_storage(config, storage).await
    }

    /// Open with an explicit document storage
    pub async fn open_with_storage(
        config: GatewayConfig,
        storage: Arc<dyn DocumentStorage>,
    ) -> Result<Self> {
        let signals = SignalBus::default();
        let registry = Arc::new(Registry::new(&config.registry, signals.clone()));
        let store = Arc::new(StateStore::open(registry.clone(), storage).await?);
        let journal = Arc::new(Journal::open(
            config.journal_path(),
            registry.clone(),
            store.clone(),
            signals.clone(),
        )?);
        let bus = Arc::new(ChannelBus::new());
        let router = Arc::new(Router::new(
            config.commands.clone(),
            registry.clone(),
            store.clone(),
            journal.clone(),
            bus.clone(),
            signals.clone(),
        ));
        let bridge = Arc::new(AutomationBridge::new(
            config.automation.clone(),
            registry.clone(),
            bus.clone(),
            ScriptServices {
                store: store.clone(),
                journal: journal.clone(),
                router: router.clone(),
            },
        ));
        let workers = WorkerManager::new(signals.clone());

        tracing::info!(data_dir = %config.data_dir.display(), "Gateway opened");

        Ok(Self {
            config,
            signals,
            registry,
            store,
            journal,
            bus,
            router,
            bridge,
            workers,
        })
    }

    /// Register the gateway plugin and start the background workers
    pub async fn start(&self) -> Result<()> {
        let plugin_id = &self.config.gateway.plugin_id;
        self.registry.register(
            plugin_id,
            PluginManifest::new(plugin_id, "Gateway")
                .with_version(env!("CARGO_PKG_VERSION"))
                .with_description("Slidebolt gateway core"),
        )?;

        let spawn_err = |e| GatewayError::Runtime(format!("worker failed to start: {e}"));
        self.workers
            .spawn(RegistryMonitor::new(
                self.registry.clone(),
                plugin_id.clone(),
                self.config.registry.sweep_interval(),
            ))
            .map_err(spawn_err)?;
        self.workers
            .spawn(CommandReaper::new(
                self.router.clone(),
                self.config.commands.reap_interval(),
            ))
            .map_err(spawn_err)?;
        let automation = self
            .workers
            .spawn(AutomationWorker::new(
                self.bridge.clone(),
                self.config.automation.heartbeat_interval(),
            ))
            .map_err(spawn_err)?;

        // The host plugin is registered once the worker reports its state
        let state = automation.request_state().await.map_err(spawn_err)?;
        if state != WorkerState::Running {
            return Err(GatewayError::Runtime(format!(
                "automation worker is {state:?}"
            )));
        }

        tracing::info!(plugin_id = %plugin_id, workers = self.workers.len(), "Gateway started");
        Ok(())
    }

    /// Stop every worker
    pub async fn shutdown(&self) -> Result<()> {
        self.workers
            .shutdown_all()
            .await
            .map_err(|e| GatewayError::Timeout(e.to_string()))?;
        tracing::info!("Gateway stopped");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Cross-component operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Upsert an entity and journal a `state` event when its reported data changed
    pub async fn report_entity(
        &self,
        plugin_id: &str,
        device_id: &str,
        patch: EntityPatch,
    ) -> Result<EntityWrite> {
        let write = self.store.write_entity(plugin_id, device_id, patch).await?;
        if write.outcome.reported_changed {
            self.journal
                .append(
                    plugin_id,
                    device_id,
                    &write.entity.id,
                    json!({
                        "type": STATE_EVENT,
                        "reported": write.entity.data.reported,
                    }),
                )
                .await?;
        }
        Ok(write)
    }

    /// Delete a device with its entities, journals and scripts
    pub async fn delete_device(&self, plugin_id: &str, device_id: &str) -> Result<DeletedDevice> {
        let deleted = self.store.delete_device(plugin_id, device_id).await?;
        let scripts = self.bridge.uninstall_device(plugin_id, device_id);
        let events = self
            .journal
            .purge(&JournalFilter::plugin(plugin_id).device(device_id))
            .await?;
        tracing::info!(plugin_id, device_id, scripts, events, "Device cascade complete");
        Ok(deleted)
    }

    /// Delete one entity with its journal and script
    pub async fn delete_entity(
        &self,
        plugin_id: &str,
        device_id: &str,
        entity_id: &str,
    ) -> Result<()> {
        self.store
            .delete_entity(plugin_id, device_id, entity_id)
            .await?;
        self.bridge.uninstall(plugin_id, device_id, entity_id);
        self.journal
            .purge(&JournalFilter::for_entity(plugin_id, device_id, entity_id))
            .await?;
        Ok(())
    }

    pub fn health(&self) -> GatewayHealth {
        let plugin_id = self.config.gateway.plugin_id.clone();
        let status = self
            .registry
            .health(&plugin_id)
            .map(|h| h.status)
            .unwrap_or(HealthStatus::Stale);

        GatewayHealth {
            plugin_id,
            status,
            plugins: self.registry.plugin_ids().len(),
            workers: self.workers.list(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Components
    // ─────────────────────────────────────────────────────────────────────────

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn signals(&self) -> &SignalBus {
        &self.signals
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    pub fn bus(&self) -> &Arc<ChannelBus> {
        &self.bus
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn bridge(&self) -> &Arc<AutomationBridge> {
        &self.bridge
    }
}
