//! Document Storage
//!
//! Durable records, one per device, one per entity and one per script state:
//!
//! ```text
//! <root>/<plugin>/devices/<device>.json
//! <root>/<plugin>/devices/<device>/entities/<entity>.json
//! <root>/<plugin>/devices/<device>/entities/<entity>.state.json
//! ```

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use slidebolt_types::{Device, Entity, ScriptState};

use crate::{GatewayError, Result};

const STATE_SUFFIX: &str = ".state.json";

/// A device together with its entities, as read back from storage
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDevice {
    pub device: Device,
    pub entities: Vec<Entity>,
}

/// Persistence medium for device, entity and script-state documents
#[async_trait]
pub trait DocumentStorage: Send + Sync + 'static {
    async fn put_device(&self, device: &Device) -> Result<()>;

    async fn put_entity(&self, entity: &Entity) -> Result<()>;

    /// Remove a device with all of its entities and script states
    async fn remove_device(&self, plugin_id: &str, device_id: &str) -> Result<()>;

    /// Remove an entity and its script state
    async fn remove_entity(&self, plugin_id: &str, device_id: &str, entity_id: &str) -> Result<()>;

    async fn load_all(&self) -> Result<Vec<StoredDevice>>;

    async fn load_script_state(
        &self,
        plugin_id: &str,
        device_id: &str,
        entity_id: &str,
    ) -> Result<Option<Map<String, Value>>>;

    async fn put_script_state(&self, state: &ScriptState) -> Result<()>;
}

// ─────────────────────────────────────────────────────────────────────────────
// File Storage
// ─────────────────────────────────────────────────────────────────────────────

/// JSON documents under a data directory
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn devices_dir(&self, plugin_id: &str) -> PathBuf {
        self.root.join(plugin_id).join("devices")
    }

    fn device_file(&self, plugin_id: &str, device_id: &str) -> PathBuf {
        self.devices_dir(plugin_id).join(format!("{device_id}.json"))
    }

    fn entities_dir(&self, plugin_id: &str, device_id: &str) -> PathBuf {
        self.devices_dir(plugin_id).join(device_id).join("entities")
    }

    fn entity_file(&self, plugin_id: &str, device_id: &str, entity_id: &str) -> PathBuf {
        self.entities_dir(plugin_id, device_id)
            .join(format!("{entity_id}.json"))
    }

    fn state_file(&self, plugin_id: &str, device_id: &str, entity_id: &str) -> PathBuf {
        self.entities_dir(plugin_id, device_id)
            .join(format!("{entity_id}{STATE_SUFFIX}"))
    }

    /// Write through a temp file so readers never see a torn document
    async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(value)?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_file(path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Directory entries, or nothing if the directory does not exist
    async fn list_dir(path: &Path) -> Result<Vec<(String, PathBuf, bool)>> {
        let mut read_dir = match tokio::fs::read_dir(path).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let is_dir = entry.file_type().await?.is_dir();
            let name = entry.file_name().to_string_lossy().into_owned();
            entries.push((name, entry.path(), is_dir));
        }
        entries.sort();
        Ok(entries)
    }

    async fn load_entities(&self, plugin_id: &str, device_id: &str) -> Result<Vec<Entity>> {
        let mut entities = Vec::new();
        for (name, path, is_dir) in Self::list_dir(&self.entities_dir(plugin_id, device_id)).await? {
            if is_dir || !name.ends_with(".json") || name.ends_with(STATE_SUFFIX) {
                continue;
            }
            match Self::read_json::<Entity>(&path).await {
                Ok(Some(mut entity)) => {
                    entity.plugin_id = plugin_id.to_string();
                    entity.device_id = device_id.to_string();
                    entities.push(entity);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable entity document");
                }
            }
        }
        Ok(entities)
    }
}

#[async_trait]
impl DocumentStorage for FileStorage {
    async fn put_device(&self, device: &Device) -> Result<()> {
        Self::write_json(&self.device_file(&device.plugin_id, &device.id), device).await
    }

    async fn put_entity(&self, entity: &Entity) -> Result<()> {
        let path = self.entity_file(&entity.plugin_id, &entity.device_id, &entity.id);
        Self::write_json(&path, entity).await
    }

    async fn remove_device(&self, plugin_id: &str, device_id: &str) -> Result<()> {
        Self::remove_file(&self.device_file(plugin_id, device_id)).await?;
        let dir = self.devices_dir(plugin_id).join(device_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn remove_entity(&self, plugin_id: &str, device_id: &str, entity_id: &str) -> Result<()> {
        Self::remove_file(&self.entity_file(plugin_id, device_id, entity_id)).await?;
        Self::remove_file(&self.state_file(plugin_id, device_id, entity_id)).await
    }

    async fn load_all(&self) -> Result<Vec<StoredDevice>> {
        let mut loaded = Vec::new();

        for (plugin_id, _, is_dir) in Self::list_dir(&self.root).await? {
            if !is_dir {
                continue;
            }

            let mut devices: BTreeMap<String, Option<Device>> = BTreeMap::new();
            for (name, path, is_dir) in Self::list_dir(&self.devices_dir(&plugin_id)).await? {
                if is_dir {
                    devices.entry(name).or_insert(None);
                } else if let Some(device_id) = name.strip_suffix(".json") {
                    match Self::read_json::<Device>(&path).await {
                        Ok(device) => {
                            devices.insert(device_id.to_string(), device);
                        }
                        Err(e) => {
                            tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable device document");
                        }
                    }
                }
            }

            for (device_id, device) in devices {
                let entities = self.load_entities(&plugin_id, &device_id).await?;
                let mut device = match device {
                    Some(device) => device,
                    // An entity directory without a device document still
                    // yields a discoverable parent.
                    None if !entities.is_empty() => Device::new(plugin_id.clone(), device_id.clone()),
                    None => continue,
                };
                device.id = device_id;
                device.plugin_id = plugin_id.clone();
                device.refresh_derived_name();
                loaded.push(StoredDevice { device, entities });
            }
        }

        Ok(loaded)
    }

    async fn load_script_state(
        &self,
        plugin_id: &str,
        device_id: &str,
        entity_id: &str,
    ) -> Result<Option<Map<String, Value>>> {
        Self::read_json(&self.state_file(plugin_id, device_id, entity_id)).await
    }

    async fn put_script_state(&self, state: &ScriptState) -> Result<()> {
        let path = self.state_file(&state.plugin_id, &state.device_id, &state.entity_id);
        Self::write_json(&path, &state.key_values).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Memory Storage
// ─────────────────────────────────────────────────────────────────────────────

type EntityKey = (String, String, String);

#[derive(Default)]
struct MemoryInner {
    devices: BTreeMap<(String, String), Device>,
    entities: BTreeMap<EntityKey, Entity>,
    states: BTreeMap<EntityKey, Map<String, Value>>,
}

/// Volatile storage for tests and ephemeral gateways
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<MemoryInner>,
    fail_writes: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with an I/O error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(GatewayError::Io(std::io::Error::other("storage is read-only")));
        }
        Ok(())
    }

    fn key(plugin_id: &str, device_id: &str, entity_id: &str) -> EntityKey {
        (plugin_id.to_string(), device_id.to_string(), entity_id.to_string())
    }
}

#[async_trait]
impl DocumentStorage for MemoryStorage {
    async fn put_device(&self, device: &Device) -> Result<()> {
        self.check_writable()?;
        self.inner
            .lock()
            .devices
            .insert((device.plugin_id.clone(), device.id.clone()), device.clone());
        Ok(())
    }

    async fn put_entity(&self, entity: &Entity) -> Result<()> {
        self.check_writable()?;
        self.inner.lock().entities.insert(
            Self::key(&entity.plugin_id, &entity.device_id, &entity.id),
            entity.clone(),
        );
        Ok(())
    }

    async fn remove_device(&self, plugin_id: &str, device_id: &str) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        inner
            .devices
            .remove(&(plugin_id.to_string(), device_id.to_string()));
        let owned = |k: &EntityKey| k.0 == plugin_id && k.1 == device_id;
        inner.entities.retain(|k, _| !owned(k));
        inner.states.retain(|k, _| !owned(k));
        Ok(())
    }

    async fn remove_entity(&self, plugin_id: &str, device_id: &str, entity_id: &str) -> Result<()> {
        self.check_writable()?;
        let key = Self::key(plugin_id, device_id, entity_id);
        let mut inner = self.inner.lock();
        inner.entities.remove(&key);
        inner.states.remove(&key);
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<StoredDevice>> {
        let inner = self.inner.lock();
        Ok(inner
            .devices
            .iter()
            .map(|((plugin_id, device_id), device)| StoredDevice {
                device: device.clone(),
                entities: inner
                    .entities
                    .iter()
                    .filter(|(k, _)| &k.0 == plugin_id && &k.1 == device_id)
                    .map(|(_, e)| e.clone())
                    .collect(),
            })
            .collect())
    }

    async fn load_script_state(
        &self,
        plugin_id: &str,
        device_id: &str,
        entity_id: &str,
    ) -> Result<Option<Map<String, Value>>> {
        Ok(self
            .inner
            .lock()
            .states
            .get(&Self::key(plugin_id, device_id, entity_id))
            .cloned())
    }

    async fn put_script_state(&self, state: &ScriptState) -> Result<()> {
        self.check_writable()?;
        self.inner.lock().states.insert(
            Self::key(&state.plugin_id, &state.device_id, &state.entity_id),
            state.key_values.clone(),
        );
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
