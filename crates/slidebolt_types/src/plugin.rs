// Plugin registration types
//
// A plugin announces itself with a manifest and keeps its registration alive
// with heartbeats. The registry owns these records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Static description a plugin sends when it registers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Plugin identifier (unique process-wide)
    pub id: String,

    /// Human-readable name
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Entity domains this plugin exposes (e.g. "switch", "sensor")
    #[serde(default)]
    pub domains: Vec<String>,
}

impl PluginManifest {
    /// Create a manifest with just an id and name
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: String::new(),
            description: None,
            domains: Vec::new(),
        }
    }

    /// Set the version string
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Declare the domains this plugin serves
    pub fn with_domains(mut self, domains: Vec<String>) -> Self {
        self.domains = domains;
        self
    }
}

/// A live plugin registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginRegistration {
    pub id: String,
    pub manifest: PluginManifest,
    /// First registration time; never reset by re-registration
    pub registered_at: DateTime<Utc>,
    /// Most recent heartbeat; never moves backwards
    pub last_heartbeat: DateTime<Utc>,
}

/// Liveness classification of a registered plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Heartbeat seen within the liveness window
    Perfect,
    /// Registered, but the last heartbeat is older than the liveness window
    Stale,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        *self == HealthStatus::Perfect
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Perfect => write!(f, "perfect"),
            HealthStatus::Stale => write!(f, "stale"),
        }
    }
}

/// Health report for one plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginHealth {
    pub plugin_id: String,
    pub status: HealthStatus,
    pub last_heartbeat: DateTime<Utc>,
    /// Milliseconds since the last heartbeat at the time of the check
    pub age_ms: u64,
}
