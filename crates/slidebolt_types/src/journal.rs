// Journal event types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Name used when a payload carries no `type`
pub const DEFAULT_EVENT_NAME: &str = "event";

/// An immutable record of something that happened to an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEvent {
    /// Unique process-wide
    pub event_id: Uuid,
    /// Global append order
    pub sequence: u64,
    pub name: String,
    pub plugin_id: String,
    pub device_id: String,
    pub entity_id: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl JournalEvent {
    /// The `pluginID.eventName` address scripts subscribe to
    pub fn address(&self) -> String {
        format!("{}.{}", self.plugin_id, self.name)
    }
}

/// Derive an event name from its payload
pub fn event_name(payload: &Value) -> String {
    payload
        .get("type")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_EVENT_NAME)
        .to_string()
}

/// Selects a plugin's events, optionally narrowed to a device or entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalFilter {
    pub plugin_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
}

impl JournalFilter {
    pub fn plugin(plugin_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            device_id: None,
            entity_id: None,
        }
    }

    pub fn device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Narrow to an entity (only meaningful together with a device)
    pub fn entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    /// Exact-entity filter
    pub fn for_entity(
        plugin_id: impl Into<String>,
        device_id: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        Self::plugin(plugin_id).device(device_id).entity(entity_id)
    }

    pub fn matches(&self, event: &JournalEvent) -> bool {
        event.plugin_id == self.plugin_id
            && self.device_id.as_ref().is_none_or(|d| *d == event.device_id)
            && self.entity_id.as_ref().is_none_or(|e| *e == event.entity_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_name_from_payload() {
        assert_eq!(event_name(&json!({"type": "motion"})), "motion");
        assert_eq!(event_name(&json!({"value": 1})), "event");
        assert_eq!(event_name(&json!({"type": ""})), "event");
        assert_eq!(event_name(&json!(42)), "event");
    }

    #[test]
    fn test_filter_matching() {
        let event = JournalEvent {
            event_id: Uuid::new_v4(),
            sequence: 1,
            name: "tick".into(),
            plugin_id: "plugin-system".into(),
            device_id: "system".into(),
            entity_id: "clock".into(),
            payload: json!({}),
            created_at: Utc::now(),
        };

        assert!(JournalFilter::plugin("plugin-system").matches(&event));
        assert!(JournalFilter::for_entity("plugin-system", "system", "clock").matches(&event));
        assert!(!JournalFilter::plugin("plugin-system").device("other").matches(&event));
        assert!(!JournalFilter::plugin("plugin-x").matches(&event));
        assert_eq!(event.address(), "plugin-system.tick");
    }
}
