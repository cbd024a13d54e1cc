//! Script contract
//!
//! A script declares its triggers once in `on_init` and is then invoked by
//! handler name. Triggers are resolved against a pattern table at delivery
//! time.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use wildmatch::WildMatch;

use slidebolt_types::{CommandEnvelope, JournalEvent};

use super::ScriptContext;
use crate::GatewayError;

/// Errors a handler reports back to the bridge
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("no handler named {0}")]
    UnknownHandler(String),

    #[error("{0}")]
    Handler(String),

    #[error("script panicked during init: {0}")]
    InitPanicked(String),
}

impl ScriptError {
    pub fn handler(message: impl Into<String>) -> Self {
        ScriptError::Handler(message.into())
    }
}

pub type ScriptResult = std::result::Result<(), ScriptError>;

// ─────────────────────────────────────────────────────────────────────────────
// Triggers
// ─────────────────────────────────────────────────────────────────────────────

/// What woke a script up
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// A command addressed to the hosting entity
    Command(CommandEnvelope),
    /// A journal event from any plugin
    Event(JournalEvent),
}

impl Trigger {
    /// `plugin.device.entity.commandType` or `plugin.eventName`
    pub fn address(&self) -> String {
        match self {
            Trigger::Command(c) => format!(
                "{}.{}.{}.{}",
                c.plugin_id, c.device_id, c.entity_id, c.command_type
            ),
            Trigger::Event(e) => e.address(),
        }
    }

    pub fn kind(&self) -> TriggerKind {
        match self {
            Trigger::Command(_) => TriggerKind::Command,
            Trigger::Event(_) => TriggerKind::Event,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Command,
    Event,
}

#[derive(Debug, Clone)]
struct Binding {
    kind: TriggerKind,
    pattern: String,
    matcher: WildMatch,
    handler: String,
}

/// Pattern -> handler table filled during `on_init`
#[derive(Debug, Clone, Default)]
pub struct TriggerTable {
    bindings: Vec<Binding>,
}

impl TriggerTable {
    fn bind(&mut self, kind: TriggerKind, pattern: String, handler: String) {
        self.bindings.push(Binding {
            kind,
            matcher: WildMatch::new(&pattern),
            pattern,
            handler,
        });
    }

    /// Handlers for a trigger, in registration order
    pub fn handlers_for(&self, trigger: &Trigger) -> Vec<String> {
        let kind = trigger.kind();
        let address = trigger.address();
        self.bindings
            .iter()
            .filter(|b| b.kind == kind && b.matcher.matches(&address))
            .map(|b| b.handler.clone())
            .collect()
    }

    pub fn wants(&self, trigger: &Trigger) -> bool {
        let kind = trigger.kind();
        let address = trigger.address();
        self.bindings
            .iter()
            .any(|b| b.kind == kind && b.matcher.matches(&address))
    }

    /// `(kind, pattern, handler)` for every binding
    pub fn entries(&self) -> Vec<(TriggerKind, String, String)> {
        self.bindings
            .iter()
            .map(|b| (b.kind, b.pattern.clone(), b.handler.clone()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Registration surface handed to `on_init`
pub struct InitContext {
    pub plugin_id: String,
    pub device_id: String,
    pub entity_id: String,
    table: TriggerTable,
}

impl InitContext {
    pub(crate) fn new(plugin_id: &str, device_id: &str, entity_id: &str) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            device_id: device_id.to_string(),
            entity_id: entity_id.to_string(),
            table: TriggerTable::default(),
        }
    }

    /// Run `handler` for commands matching `plugin.device.entity.commandType`
    pub fn on_command(&mut self, pattern: impl Into<String>, handler: impl Into<String>) {
        self.table
            .bind(TriggerKind::Command, pattern.into(), handler.into());
    }

    /// Run `handler` for journal events matching `plugin.eventName`
    pub fn on_event(&mut self, pattern: impl Into<String>, handler: impl Into<String>) {
        self.table
            .bind(TriggerKind::Event, pattern.into(), handler.into());
    }

    pub(crate) fn into_table(self) -> TriggerTable {
        self.table
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Script
// ─────────────────────────────────────────────────────────────────────────────

/// Automation hosted on one entity
#[async_trait]
pub trait Script: Send + 'static {
    /// Register triggers; called once per instance
    fn on_init(&mut self, ctx: &mut InitContext);

    /// Run the named handler to completion
    async fn invoke(
        &mut self,
        handler: &str,
        ctx: &mut ScriptContext,
        trigger: &Trigger,
    ) -> ScriptResult;
}

/// Builds fresh script instances (on install and after a crash)
pub trait ScriptFactory: Send + Sync + 'static {
    fn create(&self) -> Box<dyn Script>;
}

impl<F> ScriptFactory for F
where
    F: Fn() -> Box<dyn Script> + Send + Sync + 'static,
{
    fn create(&self) -> Box<dyn Script> {
        self()
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "script panicked".to_string()
    }
}

/// Build an instance and collect its triggers
///
/// A panic in the factory or in `on_init` is caught and reported as
/// [`ScriptError::InitPanicked`].
pub(crate) fn instantiate(
    factory: &Arc<dyn ScriptFactory>,
    plugin_id: &str,
    device_id: &str,
    entity_id: &str,
) -> Result<(Box<dyn Script>, TriggerTable), ScriptError> {
    std::panic::catch_unwind(AssertUnwindSafe(|| {
        let mut script = factory.create();
        let mut init = InitContext::new(plugin_id, device_id, entity_id);
        script.on_init(&mut init);
        (script, init.into_table())
    }))
    .map_err(|panic| ScriptError::InitPanicked(panic_message(panic.as_ref())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use slidebolt_types::CommandStatus;
    use uuid::Uuid;

    fn command(kind: &str) -> Trigger {
        let status = CommandStatus::pending("plugin-automation", "dev", "ent", kind, Utc::now());
        Trigger::Command(CommandEnvelope::new(&status, json!({"type": kind})))
    }

    fn event(plugin_id: &str, name: &str) -> Trigger {
        Trigger::Event(JournalEvent {
            event_id: Uuid::new_v4(),
            sequence: 1,
            name: name.to_string(),
            plugin_id: plugin_id.to_string(),
            device_id: "d".to_string(),
            entity_id: "e".to_string(),
            payload: json!({"type": name}),
            created_at: Utc::now(),
        })
    }

    #[test]
    fn test_trigger_addresses() {
        assert_eq!(command("PowerOn").address(), "plugin-automation.dev.ent.PowerOn");
        assert_eq!(event("plugin-system", "tick").address(), "plugin-system.tick");
    }

    #[test]
    fn test_table_resolves_by_kind_and_pattern() {
        let mut init = InitContext::new("plugin-automation", "dev", "ent");
        init.on_command("plugin-automation.dev.ent.PowerOn", "DoPowerOn");
        init.on_command("plugin-automation.dev.ent.*", "Audit");
        init.on_event("plugin-system.tick", "OnTick");
        let table = init.into_table();

        assert_eq!(table.handlers_for(&command("PowerOn")), vec!["DoPowerOn", "Audit"]);
        assert_eq!(table.handlers_for(&command("PowerOff")), vec!["Audit"]);
        assert_eq!(table.handlers_for(&event("plugin-system", "tick")), vec!["OnTick"]);
        assert!(!table.wants(&event("plugin-other", "tick")));
        assert_eq!(table.entries().len(), 3);
    }
}
