// Script state and domain descriptors

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Durable key/value state of the script hosted on one entity
///
/// Persisted as the bare `key_values` map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptState {
    pub plugin_id: String,
    pub device_id: String,
    pub entity_id: String,
    #[serde(default)]
    pub key_values: Map<String, Value>,
}

impl ScriptState {
    pub fn new(
        plugin_id: impl Into<String>,
        device_id: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            device_id: device_id.into(),
            entity_id: entity_id.into(),
            key_values: Map::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.key_values.get(key)
    }

    /// Set a key; returns whether the stored value changed
    pub fn set(&mut self, key: impl Into<String>, value: Value) -> bool {
        let key = key.into();
        if self.key_values.get(&key) == Some(&value) {
            return false;
        }
        self.key_values.insert(key, value);
        true
    }
}

/// Commands and events an entity domain understands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainDescriptor {
    pub domain: String,
    pub commands: Vec<String>,
    pub events: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_reports_change() {
        let mut state = ScriptState::new("p", "d", "e");
        assert!(state.set("count", json!(1)));
        assert!(!state.set("count", json!(1)));
        assert!(state.set("count", json!(2)));
        assert_eq!(state.get("count"), Some(&json!(2)));
        assert_eq!(state.get("missing"), None);
    }
}
