// Device and entity documents
//
// Every field belongs to one of two provenance groups. Source fields are pushed
// by the integration (source_id, source_name, config, domain, actions,
// data.reported). Local fields are set by users (local_name, labels,
// data.desired). Patches carry `Option` fields: `None` means the field was
// omitted and the stored value is kept, `Some` overwrites it. That rule alone
// keeps the two groups from clobbering each other.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ValidationError;

/// Label set attached to a device or entity
pub type Labels = BTreeMap<String, String>;

/// What a merge did to the stored document
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Any stored field changed
    pub changed: bool,
    /// `data.reported` changed (entities only)
    pub reported_changed: bool,
}

fn assign<T: PartialEq>(slot: &mut T, value: Option<T>) -> bool {
    match value {
        Some(value) if *slot != value => {
            *slot = value;
            true
        }
        _ => false,
    }
}

fn merge_labels(stored: &mut Labels, incoming: Option<Labels>) -> bool {
    let mut changed = false;
    for (key, value) in incoming.into_iter().flatten() {
        if stored.get(&key) != Some(&value) {
            stored.insert(key, value);
            changed = true;
        }
    }
    changed
}

fn merge_object(stored: &mut Map<String, Value>, incoming: Option<Map<String, Value>>) -> bool {
    let mut changed = false;
    for (key, value) in incoming.into_iter().flatten() {
        if stored.get(&key) != Some(&value) {
            stored.insert(key, value);
            changed = true;
        }
    }
    changed
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ValidationError> {
    serde_json::from_slice(bytes).map_err(|e| ValidationError::Malformed(e.to_string()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Device
// ─────────────────────────────────────────────────────────────────────────────

/// A device inside one plugin's namespace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Unique within the owning plugin
    pub id: String,
    pub plugin_id: String,

    #[serde(default)]
    pub source_id: String,
    #[serde(default)]
    pub source_name: String,
    #[serde(default)]
    pub local_name: String,

    #[serde(default)]
    pub labels: Labels,

    /// Opaque integration settings
    #[serde(default)]
    pub config: Map<String, Value>,

    /// `local_name`, else `source_name`, else `id`. Recomputed, never read back.
    #[serde(default, skip_deserializing)]
    pub derived_name: String,
}

impl Device {
    /// Create the minimal record `{id, plugin_id}`
    pub fn new(plugin_id: impl Into<String>, id: impl Into<String>) -> Self {
        let mut device = Self {
            id: id.into(),
            plugin_id: plugin_id.into(),
            source_id: String::new(),
            source_name: String::new(),
            local_name: String::new(),
            labels: Labels::new(),
            config: Map::new(),
            derived_name: String::new(),
        };
        device.refresh_derived_name();
        device
    }

    /// Recompute `derived_name` from the name fields
    pub fn refresh_derived_name(&mut self) {
        self.derived_name = if !self.local_name.is_empty() {
            self.local_name.clone()
        } else if !self.source_name.is_empty() {
            self.source_name.clone()
        } else {
            self.id.clone()
        };
    }

    /// Apply a partial update with walled-garden semantics
    pub fn merge(&mut self, patch: DevicePatch) -> MergeOutcome {
        let mut changed = false;
        changed |= assign(&mut self.source_id, patch.source_id);
        changed |= assign(&mut self.source_name, patch.source_name);
        changed |= assign(&mut self.local_name, patch.local_name);
        changed |= merge_labels(&mut self.labels, patch.labels);
        changed |= merge_object(&mut self.config, patch.config);
        self.refresh_derived_name();

        MergeOutcome {
            changed,
            reported_changed: false,
        }
    }

    /// Whether every `(key, value)` pair is present in the labels
    pub fn has_labels(&self, filters: &[(String, String)]) -> bool {
        filters
            .iter()
            .all(|(k, v)| self.labels.get(k).is_some_and(|stored| stored == v))
    }
}

/// Partial device document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DevicePatch {
    #[serde(default)]
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Labels>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Map<String, Value>>,
}

impl DevicePatch {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Decode a patch from raw JSON
    pub fn from_json(bytes: &[u8]) -> Result<Self, ValidationError> {
        decode(bytes)
    }

    pub fn with_source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn with_source_name(mut self, source_name: impl Into<String>) -> Self {
        self.source_name = Some(source_name.into());
        self
    }

    pub fn with_local_name(mut self, local_name: impl Into<String>) -> Self {
        self.local_name = Some(local_name.into());
        self
    }

    /// Add one label to the patch
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels
            .get_or_insert_with(Labels::new)
            .insert(key.into(), value.into());
        self
    }

    /// Add one config key to the patch
    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Entity
// ─────────────────────────────────────────────────────────────────────────────

/// Reported (source) and desired (local) state of an entity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityData {
    #[serde(default)]
    pub reported: Value,
    #[serde(default)]
    pub desired: Value,
}

/// An addressable capability of a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub device_id: String,
    pub plugin_id: String,

    /// Taxonomy such as `switch` or `automation`; source-owned once set
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub local_name: String,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub data: EntityData,
}

impl Entity {
    pub fn new(
        plugin_id: impl Into<String>,
        device_id: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            device_id: device_id.into(),
            plugin_id: plugin_id.into(),
            domain: String::new(),
            local_name: String::new(),
            actions: Vec::new(),
            labels: Labels::new(),
            data: EntityData::default(),
        }
    }

    /// Apply a partial update with walled-garden semantics
    ///
    /// An empty `domain` is ignored once a domain has been set.
    pub fn merge(&mut self, patch: EntityPatch) -> MergeOutcome {
        let mut changed = false;

        let domain = patch
            .domain
            .filter(|d| !d.is_empty() || self.domain.is_empty());
        changed |= assign(&mut self.domain, domain);
        changed |= assign(&mut self.local_name, patch.local_name);
        changed |= assign(&mut self.actions, patch.actions);
        changed |= merge_labels(&mut self.labels, patch.labels);

        let mut reported_changed = false;
        if let Some(data) = patch.data {
            reported_changed = assign(&mut self.data.reported, data.reported);
            changed |= reported_changed;
            changed |= assign(&mut self.data.desired, data.desired);
        }

        MergeOutcome {
            changed,
            reported_changed,
        }
    }

    /// Whether every `(key, value)` pair is present in the labels
    pub fn has_labels(&self, filters: &[(String, String)]) -> bool {
        filters
            .iter()
            .all(|(k, v)| self.labels.get(k).is_some_and(|stored| stored == v))
    }
}

/// Partial `data` block of an entity patch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityDataPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired: Option<Value>,
}

/// Partial entity document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityPatch {
    #[serde(default)]
    pub id: String,

    /// Optional echo of the parent device; must match the addressed device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Labels>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<EntityDataPatch>,
}

impl EntityPatch {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Decode a patch from raw JSON
    pub fn from_json(bytes: &[u8]) -> Result<Self, ValidationError> {
        decode(bytes)
    }

    /// Reject a patch whose `device_id` disagrees with the addressed device
    pub fn check_device(&self, device_id: &str) -> Result<(), ValidationError> {
        match &self.device_id {
            Some(payload) if !payload.is_empty() && payload != device_id => {
                Err(ValidationError::DeviceMismatch {
                    payload: payload.clone(),
                    path: device_id.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_local_name(mut self, local_name: impl Into<String>) -> Self {
        self.local_name = Some(local_name.into());
        self
    }

    pub fn with_actions(mut self, actions: Vec<String>) -> Self {
        self.actions = Some(actions);
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels
            .get_or_insert_with(Labels::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn with_reported(mut self, reported: Value) -> Self {
        self.data.get_or_insert_with(Default::default).reported = Some(reported);
        self
    }

    pub fn with_desired(mut self, desired: Value) -> Self {
        self.data.get_or_insert_with(Default::default).desired = Some(desired);
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_source_update_keeps_local_name() {
        let mut device = Device::new("plugin-test", "dev-1");
        device.merge(DevicePatch::new("dev-1").with_source_id("src-001"));
        device.merge(DevicePatch::new("dev-1").with_local_name("User Name"));
        device.merge(DevicePatch::new("dev-1").with_source_name("Updated"));

        assert_eq!(device.local_name, "User Name");
        assert_eq!(device.source_name, "Updated");
        assert_eq!(device.source_id, "src-001");
        assert_eq!(device.derived_name, "User Name");
    }

    #[test]
    fn test_local_update_keeps_source_fields() {
        let mut entity = Entity::new("plugin-test", "dev-1", "light");
        entity.merge(
            EntityPatch::new("light")
                .with_domain("switch")
                .with_actions(vec!["turn_on".into(), "turn_off".into()]),
        );
        entity.merge(EntityPatch::new("light").with_local_name("Desk Lamp"));

        assert_eq!(entity.domain, "switch");
        assert_eq!(entity.actions, vec!["turn_on", "turn_off"]);
        assert_eq!(entity.local_name, "Desk Lamp");
    }

    #[test]
    fn test_derived_name_fallbacks() {
        let mut device = Device::new("p", "dev-1");
        assert_eq!(device.derived_name, "dev-1");

        device.merge(DevicePatch::new("dev-1").with_source_name("Kitchen Plug"));
        assert_eq!(device.derived_name, "Kitchen Plug");

        device.merge(DevicePatch::new("dev-1").with_local_name(""));
        assert_eq!(device.derived_name, "Kitchen Plug");
    }

    #[test]
    fn test_merge_is_idempotent() {
        let patch = DevicePatch::new("dev-1")
            .with_source_name("Plug")
            .with_label("room", "kitchen")
            .with_config("ip", json!("10.0.0.2"));

        let mut once = Device::new("p", "dev-1");
        let first = once.merge(patch.clone());
        let mut twice = once.clone();
        let second = twice.merge(patch);

        assert!(first.changed);
        assert!(!second.changed);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_labels_and_config_merge_by_key() {
        let mut device = Device::new("p", "dev-1");
        device.merge(
            DevicePatch::new("dev-1")
                .with_label("room", "living-room")
                .with_config("ip", json!("10.0.0.2")),
        );
        device.merge(
            DevicePatch::new("dev-1")
                .with_label("floor", "ground")
                .with_config("port", json!(6053)),
        );

        assert_eq!(device.labels.len(), 2);
        assert_eq!(device.config.get("ip"), Some(&json!("10.0.0.2")));
        assert_eq!(device.config.get("port"), Some(&json!(6053)));
    }

    #[test]
    fn test_label_filters_are_conjunctive() {
        let mut device = Device::new("p", "dev-1");
        device.merge(
            DevicePatch::new("dev-1")
                .with_label("room", "living-room")
                .with_label("floor", "ground"),
        );

        let both = vec![
            ("room".to_string(), "living-room".to_string()),
            ("floor".to_string(), "ground".to_string()),
        ];
        let one_wrong = vec![
            ("room".to_string(), "living-room".to_string()),
            ("floor".to_string(), "first".to_string()),
        ];

        assert!(device.has_labels(&both));
        assert!(!device.has_labels(&one_wrong));
        assert!(device.has_labels(&[]));
    }

    #[test]
    fn test_empty_domain_never_clears() {
        let mut entity = Entity::new("p", "d", "e");
        entity.merge(EntityPatch::new("e").with_domain("automation"));
        let outcome = entity.merge(EntityPatch::new("e").with_domain(""));

        assert_eq!(entity.domain, "automation");
        assert!(!outcome.changed);
    }

    #[test]
    fn test_reported_change_tracking() {
        let mut entity = Entity::new("p", "d", "e");
        let outcome = entity.merge(EntityPatch::new("e").with_reported(json!({"power": true})));
        assert!(outcome.reported_changed);

        let outcome = entity.merge(EntityPatch::new("e").with_desired(json!({"power": false})));
        assert!(outcome.changed);
        assert!(!outcome.reported_changed);
        assert_eq!(entity.data.reported, json!({"power": true}));
    }

    #[test]
    fn test_patch_presence_from_json() {
        let patch = DevicePatch::from_json(br#"{"id":"dev-1","source_name":"Updated"}"#).unwrap();
        assert_eq!(patch.source_name.as_deref(), Some("Updated"));
        assert!(patch.local_name.is_none());

        let patch = DevicePatch::from_json(br#"{"id":"dev-1","local_name":""}"#).unwrap();
        assert_eq!(patch.local_name.as_deref(), Some(""));

        assert!(matches!(
            DevicePatch::from_json(b"{not json"),
            Err(ValidationError::Malformed(_))
        ));
    }

    #[test]
    fn test_entity_device_mismatch() {
        let patch = EntityPatch::from_json(br#"{"id":"e","device_id":"other"}"#).unwrap();
        assert!(patch.check_device("dev-1").is_err());
        assert!(patch.check_device("other").is_ok());
        assert!(EntityPatch::new("e").check_device("dev-1").is_ok());
    }

    #[test]
    fn test_derived_name_not_read_back() {
        let device: Device = serde_json::from_value(json!({
            "id": "dev-1",
            "plugin_id": "p",
            "derived_name": "stale"
        }))
        .unwrap();
        assert_eq!(device.derived_name, "");
    }
}
