//! State Store
//!
//! Owns device and entity documents. Writes are merged with walled-garden
//! semantics, serialized per device and persisted before they become
//! visible. Unrelated devices proceed in parallel.

mod search;
mod storage;

pub use search::*;
pub use storage::*;

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use slidebolt_types::{
    Device, DevicePatch, Entity, EntityPatch, MergeOutcome, ValidationError, validate_id,
};

use crate::registry::Registry;
use crate::{GatewayError, Result};

type DeviceKey = (String, String);

/// One device and its entities, guarded together
struct DeviceSlot {
    device: Device,
    entities: BTreeMap<String, Entity>,
    /// The device document has been written at least once
    persisted: bool,
    /// The slot was deleted; writers holding a stale handle must retry
    removed: bool,
}

impl DeviceSlot {
    fn new(plugin_id: &str, device_id: &str) -> Self {
        Self {
            device: Device::new(plugin_id, device_id),
            entities: BTreeMap::new(),
            persisted: false,
            removed: false,
        }
    }
}

/// Result of an entity upsert
#[derive(Debug, Clone, PartialEq)]
pub struct EntityWrite {
    pub entity: Entity,
    pub outcome: MergeOutcome,
    /// The parent device was synthesized by this write
    pub created_device: bool,
}

/// What a device deletion removed
#[derive(Debug, Clone, PartialEq)]
pub struct DeletedDevice {
    pub device: Device,
    pub entities: Vec<Entity>,
}

/// Device and entity documents for every plugin namespace
pub struct StateStore {
    registry: Arc<Registry>,
    storage: Arc<dyn DocumentStorage>,
    devices: DashMap<DeviceKey, Arc<Mutex<DeviceSlot>>>,
}

fn validate_entity_id(entity_id: &str) -> std::result::Result<(), ValidationError> {
    validate_id("entity", entity_id)?;
    // `<entity>.state.json` is reserved for script state
    if entity_id.ends_with(".state") {
        return Err(ValidationError::UnsafeId {
            kind: "entity",
            id: entity_id.to_string(),
        });
    }
    Ok(())
}

impl StateStore {
    /// Open the store and load every persisted document
    pub async fn open(registry: Arc<Registry>, storage: Arc<dyn DocumentStorage>) -> Result<Self> {
        let store = Self {
            registry,
            storage,
            devices: DashMap::new(),
        };

        let loaded = store.storage.load_all().await?;
        let mut entity_count = 0;
        for stored in loaded {
            entity_count += stored.entities.len();
            let key = (stored.device.plugin_id.clone(), stored.device.id.clone());
            let slot = DeviceSlot {
                entities: stored
                    .entities
                    .into_iter()
                    .map(|e| (e.id.clone(), e))
                    .collect(),
                device: stored.device,
                persisted: true,
                removed: false,
            };
            store.devices.insert(key, Arc::new(Mutex::new(slot)));
        }

        tracing::info!(
            devices = store.devices.len(),
            entities = entity_count,
            "State store loaded"
        );
        Ok(store)
    }

    pub fn storage(&self) -> &Arc<dyn DocumentStorage> {
        &self.storage
    }

    fn slot(&self, plugin_id: &str, device_id: &str) -> Option<Arc<Mutex<DeviceSlot>>> {
        self.devices
            .get(&(plugin_id.to_string(), device_id.to_string()))
            .map(|s| Arc::clone(&s))
    }

    /// Live slots of one plugin, ordered by device id
    fn plugin_slots(&self, plugin_id: &str) -> Vec<(String, Arc<Mutex<DeviceSlot>>)> {
        let mut slots: Vec<_> = self
            .devices
            .iter()
            .filter(|s| s.key().0 == plugin_id)
            .map(|s| (s.key().1.clone(), Arc::clone(s.value())))
            .collect();
        slots.sort_by(|a, b| a.0.cmp(&b.0));
        slots
    }

    /// Lock the slot for a device, creating it if needed
    async fn lock_slot(&self, key: &DeviceKey) -> (Arc<Mutex<DeviceSlot>>, OwnedMutexGuard<DeviceSlot>) {
        loop {
            let slot = Arc::clone(
                self.devices
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(DeviceSlot::new(&key.0, &key.1))))
                    .value(),
            );

            let guard = Arc::clone(&slot).lock_owned().await;
            if !guard.removed {
                return (slot, guard);
            }
        }
    }

    /// Unlock a slot; a device that never reached storage is dropped
    fn release(&self, key: &DeviceKey, slot: &Arc<Mutex<DeviceSlot>>, mut guard: OwnedMutexGuard<DeviceSlot>) {
        if !guard.persisted {
            guard.removed = true;
            self.devices.remove_if(key, |_, s| Arc::ptr_eq(s, slot));
        }
    }

    async fn persist_device(&self, slot: &mut DeviceSlot) -> Result<()> {
        self.storage.put_device(&slot.device).await?;
        slot.persisted = true;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Writes
    // ─────────────────────────────────────────────────────────────────────────

    /// Merge a partial device into the plugin's namespace
    pub async fn upsert_device(&self, plugin_id: &str, patch: DevicePatch) -> Result<Device> {
        self.registry.require_healthy(plugin_id)?;
        validate_id("device", &patch.id)?;
        let key = (plugin_id.to_string(), patch.id.clone());

        let (slot, mut guard) = self.lock_slot(&key).await;
        let result = self.merge_device(&mut guard, patch).await;
        self.release(&key, &slot, guard);
        result
    }

    async fn merge_device(&self, slot: &mut DeviceSlot, patch: DevicePatch) -> Result<Device> {
        let before = slot.device.clone();
        let outcome = slot.device.merge(patch);

        if outcome.changed || !slot.persisted {
            if let Err(e) = self.persist_device(slot).await {
                slot.device = before;
                return Err(e);
            }
            tracing::debug!(
                plugin_id = %slot.device.plugin_id,
                device_id = %slot.device.id,
                "Device stored"
            );
        }
        Ok(slot.device.clone())
    }

    /// Merge a partial entity, creating its parent device first if needed
    pub async fn upsert_entity(
        &self,
        plugin_id: &str,
        device_id: &str,
        patch: EntityPatch,
    ) -> Result<Entity> {
        Ok(self.write_entity(plugin_id, device_id, patch).await?.entity)
    }

    /// [`upsert_entity`](Self::upsert_entity) that also reports what changed
    pub async fn write_entity(
        &self,
        plugin_id: &str,
        device_id: &str,
        patch: EntityPatch,
    ) -> Result<EntityWrite> {
        self.registry.require_healthy(plugin_id)?;
        validate_id("device", device_id)?;
        validate_entity_id(&patch.id)?;
        patch.check_device(device_id)?;
        let key = (plugin_id.to_string(), device_id.to_string());

        let (slot, mut guard) = self.lock_slot(&key).await;
        let result = self.merge_entity(&mut guard, patch).await;
        self.release(&key, &slot, guard);
        result
    }

    async fn merge_entity(&self, slot: &mut DeviceSlot, patch: EntityPatch) -> Result<EntityWrite> {
        let plugin_id = slot.device.plugin_id.clone();
        let device_id = slot.device.id.clone();

        let created_device = !slot.persisted;
        if created_device {
            self.persist_device(slot).await?;
            tracing::info!(%plugin_id, %device_id, "Parent device created implicitly");
        }

        let existing = slot.entities.get(&patch.id).cloned();
        let is_new = existing.is_none();
        let mut entity = existing.unwrap_or_else(|| Entity::new(&plugin_id, &device_id, &patch.id));
        let outcome = entity.merge(patch);

        if outcome.changed || is_new {
            self.storage.put_entity(&entity).await?;
            tracing::debug!(
                %plugin_id,
                %device_id,
                entity_id = %entity.id,
                reported_changed = outcome.reported_changed,
                "Entity stored"
            );
            slot.entities.insert(entity.id.clone(), entity.clone());
        }

        Ok(EntityWrite {
            entity,
            outcome,
            created_device,
        })
    }

    /// Delete a device and every entity under it
    pub async fn delete_device(&self, plugin_id: &str, device_id: &str) -> Result<DeletedDevice> {
        self.registry.require_healthy(plugin_id)?;
        let key = (plugin_id.to_string(), device_id.to_string());
        let slot = self
            .slot(plugin_id, device_id)
            .ok_or_else(|| GatewayError::unknown_device(plugin_id, device_id))?;

        // The slot stays mapped until storage agrees, so a failed delete
        // leaves memory and disk in step
        let mut guard = slot.lock().await;
        if guard.removed || !guard.persisted {
            return Err(GatewayError::unknown_device(plugin_id, device_id));
        }
        self.storage.remove_device(plugin_id, device_id).await?;
        guard.removed = true;
        self.devices.remove_if(&key, |_, s| Arc::ptr_eq(s, &slot));

        let entities: Vec<Entity> = std::mem::take(&mut guard.entities).into_values().collect();
        tracing::info!(plugin_id, device_id, entities = entities.len(), "Device deleted");

        Ok(DeletedDevice {
            device: guard.device.clone(),
            entities,
        })
    }

    /// Delete one entity
    pub async fn delete_entity(
        &self,
        plugin_id: &str,
        device_id: &str,
        entity_id: &str,
    ) -> Result<Entity> {
        self.registry.require_healthy(plugin_id)?;
        let slot = self
            .slot(plugin_id, device_id)
            .ok_or_else(|| GatewayError::unknown_device(plugin_id, device_id))?;

        let mut guard = slot.lock().await;
        if guard.removed || !guard.entities.contains_key(entity_id) {
            return Err(GatewayError::unknown_entity(plugin_id, device_id, entity_id));
        }
        self.storage
            .remove_entity(plugin_id, device_id, entity_id)
            .await?;
        let entity = guard
            .entities
            .remove(entity_id)
            .ok_or_else(|| GatewayError::unknown_entity(plugin_id, device_id, entity_id))?;

        tracing::info!(plugin_id, device_id, entity_id, "Entity deleted");
        Ok(entity)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn get_device(&self, plugin_id: &str, device_id: &str) -> Result<Device> {
        self.registry.require_registered(plugin_id)?;
        let slot = self
            .slot(plugin_id, device_id)
            .ok_or_else(|| GatewayError::unknown_device(plugin_id, device_id))?;
        let guard = slot.lock().await;
        if guard.removed || !guard.persisted {
            return Err(GatewayError::unknown_device(plugin_id, device_id));
        }
        Ok(guard.device.clone())
    }

    pub async fn get_entity(
        &self,
        plugin_id: &str,
        device_id: &str,
        entity_id: &str,
    ) -> Result<Entity> {
        self.registry.require_registered(plugin_id)?;
        let slot = self
            .slot(plugin_id, device_id)
            .ok_or_else(|| GatewayError::unknown_device(plugin_id, device_id))?;
        let guard = slot.lock().await;
        if guard.removed {
            return Err(GatewayError::unknown_device(plugin_id, device_id));
        }
        guard
            .entities
            .get(entity_id)
            .cloned()
            .ok_or_else(|| GatewayError::unknown_entity(plugin_id, device_id, entity_id))
    }

    /// Whether an entity exists (no registration check)
    pub async fn entity_exists(&self, plugin_id: &str, device_id: &str, entity_id: &str) -> bool {
        match self.slot(plugin_id, device_id) {
            Some(slot) => {
                let guard = slot.lock().await;
                !guard.removed && guard.entities.contains_key(entity_id)
            }
            None => false,
        }
    }

    /// Devices of a plugin, ordered by id
    pub async fn list_devices(&self, plugin_id: &str) -> Result<Vec<Device>> {
        self.registry.require_registered(plugin_id)?;
        let mut devices = Vec::new();
        for (_, slot) in self.plugin_slots(plugin_id) {
            let guard = slot.lock().await;
            if !guard.removed && guard.persisted {
                devices.push(guard.device.clone());
            }
        }
        Ok(devices)
    }

    /// Entities of a plugin, optionally of one device, ordered by (device, id)
    pub async fn list_entities(
        &self,
        plugin_id: &str,
        device_id: Option<&str>,
    ) -> Result<Vec<Entity>> {
        self.registry.require_registered(plugin_id)?;

        if let Some(device_id) = device_id {
            let slot = self
                .slot(plugin_id, device_id)
                .ok_or_else(|| GatewayError::unknown_device(plugin_id, device_id))?;
            let guard = slot.lock().await;
            if guard.removed {
                return Err(GatewayError::unknown_device(plugin_id, device_id));
            }
            return Ok(guard.entities.values().cloned().collect());
        }

        let mut entities = Vec::new();
        for (_, slot) in self.plugin_slots(plugin_id) {
            let guard = slot.lock().await;
            if !guard.removed {
                entities.extend(guard.entities.values().cloned());
            }
        }
        Ok(entities)
    }

    /// Plugins to scan for a search: one if restricted, else all registered
    fn search_scope(&self, query: &SearchQuery) -> Result<Vec<String>> {
        match &query.plugin_id {
            Some(plugin_id) => {
                self.registry.require_registered(plugin_id)?;
                Ok(vec![plugin_id.clone()])
            }
            None => Ok(self.registry.plugin_ids()),
        }
    }

    /// Devices matching a search query, ordered by (plugin, id)
    pub async fn search_devices(&self, query: &SearchQuery) -> Result<Vec<Device>> {
        let scope = self.search_scope(query)?;
        self.search_devices_in(scope, query).await
    }

    async fn search_devices_in(&self, scope: Vec<String>, query: &SearchQuery) -> Result<Vec<Device>> {
        let mut found = Vec::new();
        for plugin_id in scope {
            // Unregistered since the scope was taken
            let devices = match self.list_devices(&plugin_id).await {
                Err(GatewayError::UnknownPlugin(_)) => continue,
                devices => devices?,
            };
            for device in devices {
                if query.limit.is_some_and(|limit| found.len() >= limit) {
                    return Ok(found);
                }
                if query.matches_device(&device) {
                    found.push(device);
                }
            }
        }
        Ok(found)
    }

    /// Entities matching a search query, ordered by (plugin, device, id)
    pub async fn search_entities(&self, query: &SearchQuery) -> Result<Vec<Entity>> {
        let scope = self.search_scope(query)?;
        self.search_entities_in(scope, query).await
    }

    async fn search_entities_in(&self, scope: Vec<String>, query: &SearchQuery) -> Result<Vec<Entity>> {
        let mut found = Vec::new();
        for plugin_id in scope {
            let entities = match self.list_entities(&plugin_id, None).await {
                Err(GatewayError::UnknownPlugin(_)) => continue,
                entities => entities?,
            };
            for entity in entities {
                if query.limit.is_some_and(|limit| found.len() >= limit) {
                    return Ok(found);
                }
                if query.matches_entity(&entity) {
                    found.push(entity);
                }
            }
        }
        Ok(found)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use crate::runtime::SignalBus;
    use serde_json::json;
    use slidebolt_types::PluginManifest;
    use tempfile::TempDir;

    fn registry(plugins: &[&str]) -> Arc<Registry> {
        let registry = Arc::new(Registry::new(&RegistryConfig::default(), SignalBus::default()));
        for id in plugins {
            registry.register(id, PluginManifest::new(*id, *id)).unwrap();
        }
        registry
    }

    async fn memory_store(plugins: &[&str]) -> (StateStore, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let store = StateStore::open(registry(plugins), storage.clone())
            .await
            .unwrap();
        (store, storage)
    }

    #[tokio::test]
    async fn test_unregistered_plugin_is_rejected() {
        let (store, _) = memory_store(&[]).await;

        assert!(matches!(
            store.upsert_device("plugin-ghost", DevicePatch::new("d1")).await,
            Err(GatewayError::UnknownPlugin(_))
        ));
        assert!(matches!(
            store.list_devices("plugin-ghost").await,
            Err(GatewayError::UnknownPlugin(_))
        ));
    }

    #[tokio::test]
    async fn test_walled_garden_through_store() {
        let (store, _) = memory_store(&["plugin-test"]).await;

        store
            .upsert_device("plugin-test", DevicePatch::new("d1").with_source_id("src-001"))
            .await
            .unwrap();
        store
            .upsert_device("plugin-test", DevicePatch::new("d1").with_local_name("User Name"))
            .await
            .unwrap();
        let device = store
            .upsert_device("plugin-test", DevicePatch::new("d1").with_source_name("Updated"))
            .await
            .unwrap();

        assert_eq!(device.local_name, "User Name");
        assert_eq!(device.source_name, "Updated");
        assert_eq!(device.source_id, "src-001");
        assert_eq!(store.get_device("plugin-test", "d1").await.unwrap(), device);
    }

    #[tokio::test]
    async fn test_entity_creates_parent_device() {
        let (store, _) = memory_store(&["plugin-test"]).await;

        let write = store
            .write_entity(
                "plugin-test",
                "implicit-device-001",
                EntityPatch::new("implicit-entity-001").with_domain("switch"),
            )
            .await
            .unwrap();
        assert!(write.created_device);

        let devices = store.list_devices("plugin-test").await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, "implicit-device-001");
        assert_eq!(devices[0].plugin_id, "plugin-test");
    }

    #[tokio::test]
    async fn test_invalid_input_changes_nothing() {
        let (store, _) = memory_store(&["p"]).await;

        let mismatch = EntityPatch {
            device_id: Some("other".into()),
            ..EntityPatch::new("e1")
        };
        assert!(matches!(
            store.upsert_entity("p", "d1", mismatch).await,
            Err(GatewayError::InvalidPayload(_))
        ));
        assert!(matches!(
            store.upsert_device("p", DevicePatch::new("")).await,
            Err(GatewayError::InvalidPayload(_))
        ));
        assert!(matches!(
            store.upsert_entity("p", "d1", EntityPatch::new("bad.state")).await,
            Err(GatewayError::InvalidPayload(_))
        ));
        assert!(store.list_devices("p").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_persist_leaves_no_phantom() {
        let (store, storage) = memory_store(&["p"]).await;
        storage.set_fail_writes(true);

        assert!(store.upsert_device("p", DevicePatch::new("d1")).await.is_err());
        assert!(store.upsert_entity("p", "d2", EntityPatch::new("e")).await.is_err());
        assert!(store.list_devices("p").await.unwrap().is_empty());

        storage.set_fail_writes(false);
        store
            .upsert_device("p", DevicePatch::new("d1").with_source_name("A"))
            .await
            .unwrap();
        storage.set_fail_writes(true);
        assert!(
            store
                .upsert_device("p", DevicePatch::new("d1").with_source_name("B"))
                .await
                .is_err()
        );
        assert_eq!(store.get_device("p", "d1").await.unwrap().source_name, "A");
    }

    #[tokio::test]
    async fn test_cascade_delete() {
        let (store, _) = memory_store(&["p"]).await;
        store.upsert_device("p", DevicePatch::new("d1")).await.unwrap();
        for id in ["e1", "e2"] {
            store.upsert_entity("p", "d1", EntityPatch::new(id)).await.unwrap();
        }

        let deleted = store.delete_device("p", "d1").await.unwrap();
        assert_eq!(deleted.entities.len(), 2);

        assert!(matches!(
            store.get_device("p", "d1").await,
            Err(GatewayError::UnknownDevice { .. })
        ));
        assert!(store.get_entity("p", "d1", "e1").await.is_err());
        assert!(store.list_entities("p", None).await.unwrap().is_empty());
        assert!(matches!(
            store.delete_device("p", "d1").await,
            Err(GatewayError::UnknownDevice { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_device() {
        let (store, storage) = memory_store(&["p"]).await;
        store.upsert_entity("p", "d1", EntityPatch::new("e1")).await.unwrap();

        storage.set_fail_writes(true);
        assert!(matches!(
            store.delete_device("p", "d1").await,
            Err(GatewayError::Io(_))
        ));
        assert!(store.get_device("p", "d1").await.is_ok());
        assert!(store.entity_exists("p", "d1", "e1").await);

        // Storage still holds it too
        let reopened = StateStore::open(registry(&["p"]), storage.clone())
            .await
            .unwrap();
        assert!(reopened.get_device("p", "d1").await.is_ok());

        storage.set_fail_writes(false);
        store.delete_device("p", "d1").await.unwrap();
        assert!(store.get_device("p", "d1").await.is_err());
    }

    #[tokio::test]
    async fn test_search_skips_vanished_plugins() {
        let (store, _) = memory_store(&["p"]).await;
        store.upsert_entity("p", "d1", EntityPatch::new("e1")).await.unwrap();

        let scope = vec!["gone".to_string(), "p".to_string()];
        let query = SearchQuery::new("*");
        let devices = store.search_devices_in(scope.clone(), &query).await.unwrap();
        assert_eq!(devices.len(), 1);
        let entities = store.search_entities_in(scope, &query).await.unwrap();
        assert_eq!(entities.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_entity() {
        let (store, _) = memory_store(&["p"]).await;
        store.upsert_entity("p", "d1", EntityPatch::new("e1")).await.unwrap();

        store.delete_entity("p", "d1", "e1").await.unwrap();
        assert!(!store.entity_exists("p", "d1", "e1").await);
        assert!(store.get_device("p", "d1").await.is_ok());
        assert!(matches!(
            store.delete_entity("p", "d1", "e1").await,
            Err(GatewayError::UnknownEntity { .. })
        ));
    }

    #[tokio::test]
    async fn test_reported_change_is_reported() {
        let (store, _) = memory_store(&["p"]).await;
        let first = store
            .write_entity("p", "d1", EntityPatch::new("e1").with_reported(json!({"on": true})))
            .await
            .unwrap();
        let again = store
            .write_entity("p", "d1", EntityPatch::new("e1").with_reported(json!({"on": true})))
            .await
            .unwrap();

        assert!(first.outcome.reported_changed);
        assert!(!again.outcome.reported_changed);
    }

    #[tokio::test]
    async fn test_store_reloads_from_disk() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&["plugin-test"]);

        {
            let store = StateStore::open(registry.clone(), Arc::new(FileStorage::new(dir.path())))
                .await
                .unwrap();
            store
                .upsert_device("plugin-test", DevicePatch::new("d1").with_local_name("Lamp"))
                .await
                .unwrap();
            store
                .upsert_entity("plugin-test", "d1", EntityPatch::new("light").with_domain("light"))
                .await
                .unwrap();
        }

        let store = StateStore::open(registry, Arc::new(FileStorage::new(dir.path())))
            .await
            .unwrap();
        let device = store.get_device("plugin-test", "d1").await.unwrap();
        assert_eq!(device.derived_name, "Lamp");
        let entity = store.get_entity("plugin-test", "d1", "light").await.unwrap();
        assert_eq!(entity.domain, "light");
    }

    #[tokio::test]
    async fn test_concurrent_merges_same_device() {
        let (store, _) = memory_store(&["p"]).await;
        let store = Arc::new(store);

        let mut tasks = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .upsert_device("p", DevicePatch::new("d1").with_label(format!("k{i}"), "v"))
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let device = store.get_device("p", "d1").await.unwrap();
        assert_eq!(device.labels.len(), 16);
    }
}
