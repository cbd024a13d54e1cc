//! Search Queries
//!
//! A wildcard on the identifier plus conjunctive label equality filters.

use wildmatch::WildMatch;

use slidebolt_types::{Device, Entity, ValidationError};

/// Device or entity search
#[derive(Debug, Clone)]
pub struct SearchQuery {
    /// Wildcard matched against the device or entity id (`*`, `?`)
    pub pattern: String,
    /// Every `(key, value)` pair must match exactly
    pub labels: Vec<(String, String)>,
    /// Restrict to one plugin namespace
    pub plugin_id: Option<String>,
    /// Exact device id
    pub device_id: Option<String>,
    /// Exact entity id (entity searches only)
    pub entity_id: Option<String>,
    /// Entity domain (entity searches only)
    pub domain: Option<String>,
    pub limit: Option<usize>,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self::new("*")
    }
}

impl SearchQuery {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            labels: Vec::new(),
            plugin_id: None,
            device_id: None,
            entity_id: None,
            domain: None,
            limit: None,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((key.into(), value.into()));
        self
    }

    /// Add a `key:value` label filter as it appears in a query string
    pub fn with_label_filter(self, filter: &str) -> Result<Self, ValidationError> {
        match filter.split_once(':') {
            Some((key, value)) if !key.is_empty() => Ok(self.with_label(key, value)),
            _ => Err(ValidationError::Malformed(format!(
                "label filter {filter:?} is not key:value"
            ))),
        }
    }

    pub fn in_plugin(mut self, plugin_id: impl Into<String>) -> Self {
        self.plugin_id = Some(plugin_id.into());
        self
    }

    pub fn for_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn for_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn in_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn pattern_matches(&self, id: &str) -> bool {
        self.pattern.is_empty() || WildMatch::new(&self.pattern).matches(id)
    }

    pub fn matches_device(&self, device: &Device) -> bool {
        self.pattern_matches(&device.id)
            && self.device_id.as_ref().is_none_or(|d| *d == device.id)
            && device.has_labels(&self.labels)
    }

    pub fn matches_entity(&self, entity: &Entity) -> bool {
        self.pattern_matches(&entity.id)
            && self.device_id.as_ref().is_none_or(|d| *d == entity.device_id)
            && self.entity_id.as_ref().is_none_or(|e| *e == entity.id)
            && self.domain.as_ref().is_none_or(|d| *d == entity.domain)
            && entity.has_labels(&self.labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slidebolt_types::{DevicePatch, EntityPatch};

    #[test]
    fn test_label_filter_parsing() {
        let query = SearchQuery::new("*")
            .with_label_filter("room:living-room")
            .unwrap()
            .with_label_filter("url:http://x")
            .unwrap();
        assert_eq!(query.labels[0], ("room".into(), "living-room".into()));
        assert_eq!(query.labels[1], ("url".into(), "http://x".into()));

        assert!(SearchQuery::new("*").with_label_filter("novalue").is_err());
        assert!(SearchQuery::new("*").with_label_filter(":x").is_err());
    }

    #[test]
    fn test_device_matching() {
        let mut device = Device::new("p", "kitchen-plug");
        device.merge(DevicePatch::new("kitchen-plug").with_label("room", "kitchen"));

        assert!(SearchQuery::new("kitchen-*").matches_device(&device));
        assert!(!SearchQuery::new("bath-*").matches_device(&device));
        assert!(
            SearchQuery::new("*")
                .with_label("room", "kitchen")
                .matches_device(&device)
        );
        assert!(
            !SearchQuery::new("*")
                .with_label("room", "kitchen")
                .with_label("floor", "ground")
                .matches_device(&device)
        );
    }

    #[test]
    fn test_entity_matching() {
        let mut entity = Entity::new("p", "d1", "relay");
        entity.merge(EntityPatch::new("relay").with_domain("switch"));

        assert!(SearchQuery::new("*").in_domain("switch").matches_entity(&entity));
        assert!(!SearchQuery::new("*").in_domain("light").matches_entity(&entity));
        assert!(
            SearchQuery::new("*")
                .for_device("d1")
                .for_entity("relay")
                .matches_entity(&entity)
        );
        assert!(!SearchQuery::new("*").for_device("d2").matches_entity(&entity));
    }
}
