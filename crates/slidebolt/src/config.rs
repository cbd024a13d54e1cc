//! Gateway Configuration
//!
//! Layered with figment: built-in defaults, then an optional TOML file, then
//! `SLIDEBOLT_` environment variables (`__` separates nested keys, e.g.
//! `SLIDEBOLT_REGISTRY__TTL_MS=30000`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::supervisor::RestartPolicy;

/// Configuration loading and validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),
}

// ─────────────────────────────────────────────────────────────────────────────
// Sections
// ─────────────────────────────────────────────────────────────────────────────

/// The gateway's own plugin identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    pub plugin_id: String,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            plugin_id: "gateway".to_string(),
        }
    }
}

/// Plugin liveness rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// A heartbeat older than this marks the plugin stale
    pub liveness_window_ms: u64,
    /// A heartbeat older than this expires the registration
    pub ttl_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            liveness_window_ms: 15_000,
            ttl_ms: 60_000,
            sweep_interval_ms: 1_000,
        }
    }
}

impl RegistryConfig {
    pub fn liveness_window(&self) -> Duration {
        Duration::from_millis(self.liveness_window_ms)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Command router timeouts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Pending commands fail after this long without an ack
    pub ack_timeout_ms: u64,
    /// Accepted commands fail after this long without a completion
    pub completion_timeout_ms: u64,
    /// Terminal statuses are forgotten after this long
    pub retention_ms: u64,
    pub reap_interval_ms: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 5_000,
            completion_timeout_ms: 30_000,
            retention_ms: 300_000,
            reap_interval_ms: 500,
        }
    }
}

impl CommandConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }
}

/// Event journal location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// Database file, relative to `data_dir` unless absolute
    pub file: PathBuf,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from("journal.redb"),
        }
    }
}

/// Restart policy for crashed script instances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    pub max_restarts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 10_000,
        }
    }
}

/// Automation bridge settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    /// Plugin id the bridge registers as
    pub host_plugin: String,
    /// Per-script trigger queue
    pub inbox_capacity: usize,
    pub heartbeat_interval_ms: u64,
    pub restart: RestartConfig,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            host_plugin: "plugin-automation".to_string(),
            inbox_capacity: 256,
            heartbeat_interval_ms: 1_000,
            restart: RestartConfig::default(),
        }
    }
}

impl AutomationConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            max_restarts: self.restart.max_restarts,
            initial_backoff: Duration::from_millis(self.restart.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.restart.max_backoff_ms),
            ..RestartPolicy::default()
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Gateway Config
// ─────────────────────────────────────────────────────────────────────────────

/// Complete gateway configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Root of the persisted device/entity documents
    pub data_dir: PathBuf,
    pub gateway: GatewaySection,
    pub registry: RegistryConfig,
    pub commands: CommandConfig,
    pub journal: JournalConfig,
    pub automation: AutomationConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            gateway: GatewaySection::default(),
            registry: RegistryConfig::default(),
            commands: CommandConfig::default(),
            journal: JournalConfig::default(),
            automation: AutomationConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Layered figment: defaults, optional TOML file, environment
    pub fn figment(file: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(GatewayConfig::default()));
        if let Some(path) = file {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed("SLIDEBOLT_").split("__"))
    }

    /// Load and validate the configuration
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment(file))
    }

    /// Extract and validate from an already assembled figment
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: GatewayConfig = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration rooted at a directory, defaults otherwise
    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("registry.liveness_window_ms", self.registry.liveness_window_ms),
            ("registry.ttl_ms", self.registry.ttl_ms),
            ("registry.sweep_interval_ms", self.registry.sweep_interval_ms),
            ("commands.ack_timeout_ms", self.commands.ack_timeout_ms),
            ("commands.completion_timeout_ms", self.commands.completion_timeout_ms),
            ("commands.reap_interval_ms", self.commands.reap_interval_ms),
            ("automation.heartbeat_interval_ms", self.automation.heartbeat_interval_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
        }

        if self.registry.ttl_ms < self.registry.liveness_window_ms {
            return Err(ConfigError::Invalid(
                "registry.ttl_ms must not be shorter than registry.liveness_window_ms".into(),
            ));
        }

        if self.automation.inbox_capacity == 0 {
            return Err(ConfigError::Invalid(
                "automation.inbox_capacity must be non-zero".into(),
            ));
        }

        if self.gateway.plugin_id.is_empty() || self.automation.host_plugin.is_empty() {
            return Err(ConfigError::Invalid("plugin ids must not be empty".into()));
        }

        Ok(())
    }

    /// Journal database path
    pub fn journal_path(&self) -> PathBuf {
        if self.journal.file.is_absolute() {
            self.journal.file.clone()
        } else {
            self.data_dir.join(&self.journal.file)
        }
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.gateway.plugin_id, "gateway");
        assert_eq!(config.journal_path(), PathBuf::from("./data/journal.redb"));
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let figment = Figment::from(Serialized::defaults(GatewayConfig::default())).merge(
            Toml::string(
                r#"
                data_dir = "/var/lib/slidebolt"

                [registry]
                liveness_window_ms = 2000
                ttl_ms = 4000

                [automation.restart]
                max_restarts = 2
                "#,
            ),
        );

        let config = GatewayConfig::from_figment(figment).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/slidebolt"));
        assert_eq!(config.registry.liveness_window(), Duration::from_secs(2));
        assert_eq!(config.registry.sweep_interval_ms, 1_000);
        assert_eq!(config.automation.restart_policy().max_restarts, 2);
        assert_eq!(config.commands.ack_timeout_ms, 5_000);
    }

    #[test]
    fn test_ttl_shorter_than_window_rejected() {
        let figment = Figment::from(Serialized::defaults(GatewayConfig::default())).merge(
            Toml::string("[registry]\nliveness_window_ms = 5000\nttl_ms = 1000\n"),
        );
        assert!(matches!(
            GatewayConfig::from_figment(figment),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut config = GatewayConfig::default();
        config.commands.reap_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_renders_toml() {
        let rendered = GatewayConfig::default().to_toml().unwrap();
        assert!(rendered.contains("[registry]"));
        assert!(rendered.contains("host_plugin = \"plugin-automation\""));
    }
}
