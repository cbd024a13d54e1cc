//! Script context
//!
//! The only way a script touches the gateway. Reads go to the State Store,
//! commands to the router and events to the journal. State writes are kept
//! in memory and flushed by the instance after every invocation.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use slidebolt_types::{CommandState, Device, Entity, ScriptState};

use crate::Result;
use crate::command::Router;
use crate::journal::Journal;
use crate::store::{SearchQuery, StateStore};

/// Upper bound on find results when the script gives none
pub const DEFAULT_FIND_LIMIT: usize = 100;

/// Components a script may call into
#[derive(Clone)]
pub struct ScriptServices {
    pub store: Arc<StateStore>,
    pub journal: Arc<Journal>,
    pub router: Arc<Router>,
}

/// Command a script wants sent
#[derive(Debug, Clone, PartialEq)]
pub struct CommandTarget {
    pub plugin_id: String,
    pub device_id: String,
    pub entity_id: String,
    pub payload: Value,
    /// Retries with the same key collapse onto one command
    pub idempotency_key: Option<String>,
}

impl CommandTarget {
    pub fn new(
        plugin_id: impl Into<String>,
        device_id: impl Into<String>,
        entity_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            device_id: device_id.into(),
            entity_id: entity_id.into(),
            payload,
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// What `send_command` hands back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandAck {
    pub command_id: Uuid,
    pub state: CommandState,
}

/// Event a script wants journaled under the hosting plugin
#[derive(Debug, Clone, PartialEq)]
pub struct EventTarget {
    pub device_id: String,
    pub entity_id: String,
    pub payload: Value,
}

impl EventTarget {
    pub fn new(device_id: impl Into<String>, entity_id: impl Into<String>, payload: Value) -> Self {
        Self {
            device_id: device_id.into(),
            entity_id: entity_id.into(),
            payload,
        }
    }
}

/// Per-entity scripting context
pub struct ScriptContext {
    services: ScriptServices,
    state: ScriptState,
    dirty: bool,
}

impl ScriptContext {
    pub(crate) fn new(services: ScriptServices, state: ScriptState) -> Self {
        Self {
            services,
            state,
            dirty: false,
        }
    }

    /// Plugin hosting this script
    pub fn plugin_id(&self) -> &str {
        &self.state.plugin_id
    }

    pub fn device_id(&self) -> &str {
        &self.state.device_id
    }

    pub fn entity_id(&self) -> &str {
        &self.state.entity_id
    }

    // ─────────────────────────────────────────────────────────────────────────
    // State
    // ─────────────────────────────────────────────────────────────────────────

    pub fn get_state(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }

    pub fn set_state(&mut self, key: impl Into<String>, value: Value) {
        if self.state.set(key, value) {
            self.dirty = true;
        }
    }

    pub(crate) fn state(&self) -> &ScriptState {
        &self.state
    }

    /// State changed since the last successful flush
    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn find_devices(&self, query: SearchQuery) -> Result<Vec<Device>> {
        let query = bounded(query);
        self.services.store.search_devices(&query).await
    }

    pub async fn find_entities(&self, query: SearchQuery) -> Result<Vec<Entity>> {
        let query = bounded(query);
        self.services.store.search_entities(&query).await
    }

    pub async fn get_device(&self, plugin_id: &str, device_id: &str) -> Result<Device> {
        self.services.store.get_device(plugin_id, device_id).await
    }

    pub async fn get_entity(&self, plugin_id: &str, device_id: &str, entity_id: &str) -> Result<Entity> {
        self.services
            .store
            .get_entity(plugin_id, device_id, entity_id)
            .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Effects
    // ─────────────────────────────────────────────────────────────────────────

    /// Dispatch a command; returns once it is queued, not when it completes
    pub async fn send_command(&self, target: CommandTarget) -> Result<CommandAck> {
        let status = self
            .services
            .router
            .dispatch_with_key(
                &target.plugin_id,
                &target.device_id,
                &target.entity_id,
                target.payload,
                target.idempotency_key.as_deref(),
            )
            .await?;

        tracing::debug!(
            host = %self.state.entity_id,
            command_id = %status.command_id,
            target_plugin = %status.plugin_id,
            "Script sent command"
        );
        Ok(CommandAck {
            command_id: status.command_id,
            state: status.state,
        })
    }

    /// Append an event on behalf of the hosting plugin
    pub async fn emit_event(&self, target: EventTarget) -> Result<bool> {
        self.services
            .journal
            .append(
                &self.state.plugin_id,
                &target.device_id,
                &target.entity_id,
                target.payload,
            )
            .await?;
        Ok(true)
    }
}

fn bounded(query: SearchQuery) -> SearchQuery {
    match query.limit {
        Some(_) => query,
        None => query.with_limit(DEFAULT_FIND_LIMIT),
    }
}
