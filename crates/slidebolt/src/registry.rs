//! Plugin Registry
//!
//! Tracks plugin registrations and their liveness. Every other component asks
//! the registry before touching a plugin's namespace: reads need the plugin to
//! be registered, writes and dispatches need it to be healthy.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use wildmatch::WildMatch;

use slidebolt_types::{
    HealthStatus, PluginHealth, PluginManifest, PluginRegistration, ValidationError, validate_id,
};

use crate::config::RegistryConfig;
use crate::runtime::{GatewaySignal, SignalBus};
use crate::{GatewayError, Result};

/// How often `wait_healthy` re-reads the registry
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Live plugin registrations
pub struct Registry {
    plugins: DashMap<String, PluginRegistration>,
    liveness_window: Duration,
    ttl: Duration,
    signals: SignalBus,
}

fn age(now: DateTime<Utc>, then: DateTime<Utc>) -> Duration {
    (now - then).to_std().unwrap_or(Duration::ZERO)
}

impl Registry {
    pub fn new(config: &RegistryConfig, signals: SignalBus) -> Self {
        Self {
            plugins: DashMap::new(),
            liveness_window: config.liveness_window(),
            ttl: config.ttl(),
            signals,
        }
    }

    pub fn liveness_window(&self) -> Duration {
        self.liveness_window
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Registration
    // ─────────────────────────────────────────────────────────────────────────

    /// Register (or re-register) a plugin; counts as a heartbeat
    pub fn register(&self, plugin_id: &str, manifest: PluginManifest) -> Result<PluginRegistration> {
        self.register_at(plugin_id, manifest, Utc::now())
    }

    /// Register at an explicit time
    ///
    /// Re-registration replaces the manifest but keeps `registered_at`.
    pub fn register_at(
        &self,
        plugin_id: &str,
        mut manifest: PluginManifest,
        now: DateTime<Utc>,
    ) -> Result<PluginRegistration> {
        validate_id("plugin", plugin_id)?;
        if manifest.id.is_empty() {
            manifest.id = plugin_id.to_string();
        } else if manifest.id != plugin_id {
            return Err(ValidationError::Malformed(format!(
                "manifest id {:?} does not match plugin {:?}",
                manifest.id, plugin_id
            ))
            .into());
        }

        let (registration, is_new) = match self.plugins.entry(plugin_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get_mut();
                existing.manifest = manifest;
                existing.last_heartbeat = existing.last_heartbeat.max(now);
                (existing.clone(), false)
            }
            Entry::Vacant(entry) => {
                let registration = PluginRegistration {
                    id: plugin_id.to_string(),
                    manifest,
                    registered_at: now,
                    last_heartbeat: now,
                };
                (entry.insert(registration).clone(), true)
            }
        };

        if is_new {
            tracing::info!(plugin_id, "Plugin registered");
            self.signals.publish(GatewaySignal::PluginRegistered {
                plugin_id: plugin_id.to_string(),
            });
        } else {
            tracing::debug!(plugin_id, "Plugin re-registered");
        }

        Ok(registration)
    }

    /// Remove a registration explicitly
    pub fn unregister(&self, plugin_id: &str) -> Option<PluginRegistration> {
        let removed = self.plugins.remove(plugin_id).map(|(_, r)| r);
        if removed.is_some() {
            tracing::info!(plugin_id, "Plugin unregistered");
        }
        removed
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Liveness
    // ─────────────────────────────────────────────────────────────────────────

    pub fn heartbeat(&self, plugin_id: &str) -> Result<PluginHealth> {
        self.heartbeat_at(plugin_id, Utc::now())
    }

    /// Record a heartbeat; an older timestamp never moves `last_heartbeat` back
    pub fn heartbeat_at(&self, plugin_id: &str, at: DateTime<Utc>) -> Result<PluginHealth> {
        let mut entry = self
            .plugins
            .get_mut(plugin_id)
            .ok_or_else(|| GatewayError::UnknownPlugin(plugin_id.to_string()))?;

        entry.last_heartbeat = entry.last_heartbeat.max(at);
        let last_heartbeat = entry.last_heartbeat;
        drop(entry);

        Ok(self.classify(plugin_id, last_heartbeat, Utc::now().max(at)))
    }

    pub fn health(&self, plugin_id: &str) -> Result<PluginHealth> {
        self.health_at(plugin_id, Utc::now())
    }

    pub fn health_at(&self, plugin_id: &str, now: DateTime<Utc>) -> Result<PluginHealth> {
        let last_heartbeat = self
            .plugins
            .get(plugin_id)
            .map(|r| r.last_heartbeat)
            .ok_or_else(|| GatewayError::UnknownPlugin(plugin_id.to_string()))?;
        Ok(self.classify(plugin_id, last_heartbeat, now))
    }

    fn classify(&self, plugin_id: &str, last_heartbeat: DateTime<Utc>, now: DateTime<Utc>) -> PluginHealth {
        let age = age(now, last_heartbeat);
        let status = if age <= self.liveness_window {
            HealthStatus::Perfect
        } else {
            HealthStatus::Stale
        };

        PluginHealth {
            plugin_id: plugin_id.to_string(),
            status,
            last_heartbeat,
            age_ms: age.as_millis() as u64,
        }
    }

    pub fn is_healthy(&self, plugin_id: &str) -> bool {
        self.health(plugin_id)
            .map(|h| h.status.is_healthy())
            .unwrap_or(false)
    }

    /// Fail with `UnknownPlugin` unless the plugin is registered
    pub fn require_registered(&self, plugin_id: &str) -> Result<()> {
        if self.plugins.contains_key(plugin_id) {
            Ok(())
        } else {
            Err(GatewayError::UnknownPlugin(plugin_id.to_string()))
        }
    }

    /// Fail unless the plugin is registered and inside its liveness window
    pub fn require_healthy(&self, plugin_id: &str) -> Result<()> {
        self.require_healthy_at(plugin_id, Utc::now())
    }

    pub fn require_healthy_at(&self, plugin_id: &str, now: DateTime<Utc>) -> Result<()> {
        let health = self.health_at(plugin_id, now)?;
        if health.status.is_healthy() {
            Ok(())
        } else {
            Err(GatewayError::unavailable(
                plugin_id,
                format!("no heartbeat for {}ms", health.age_ms),
            ))
        }
    }

    /// Poll until the plugin is healthy or the timeout elapses
    pub async fn wait_healthy(&self, plugin_id: &str, timeout: Duration) -> Result<PluginHealth> {
        let poll = async {
            loop {
                if let Ok(health) = self.health(plugin_id) {
                    if health.status.is_healthy() {
                        return health;
                    }
                }
                tokio::time::sleep(WAIT_POLL_INTERVAL).await;
            }
        };

        tokio::time::timeout(timeout, poll).await.map_err(|_| {
            GatewayError::Timeout(format!("plugin {plugin_id} not healthy after {timeout:?}"))
        })
    }

    /// Expire registrations whose last heartbeat is older than the TTL
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<String> {
        let candidates: Vec<String> = self
            .plugins
            .iter()
            .filter(|r| age(now, r.last_heartbeat) > self.ttl)
            .map(|r| r.key().clone())
            .collect();

        let mut expired = Vec::new();
        for plugin_id in candidates {
            let removed = self
                .plugins
                .remove_if(&plugin_id, |_, r| age(now, r.last_heartbeat) > self.ttl);
            if removed.is_some() {
                tracing::warn!(plugin_id = %plugin_id, "Plugin registration expired");
                expired.push(plugin_id);
            }
        }
        expired
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    pub fn lookup(&self, plugin_id: &str) -> Option<PluginRegistration> {
        self.plugins.get(plugin_id).map(|r| r.clone())
    }

    pub fn list(&self) -> BTreeMap<String, PluginRegistration> {
        self.plugins
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect()
    }

    /// Registered plugin ids, sorted
    pub fn plugin_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.plugins.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Manifests whose plugin id matches a wildcard pattern, sorted by id
    pub fn search(&self, pattern: &str) -> Vec<PluginManifest> {
        let matcher = WildMatch::new(pattern);
        let mut found: Vec<PluginManifest> = self
            .plugins
            .iter()
            .filter(|r| matcher.matches(r.key()))
            .map(|r| r.manifest.clone())
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        found
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
