//! Gateway Signals
//!
//! In-process notifications that let workers react to what the core does.

use slidebolt_types::{CommandStatus, JournalEvent};
use tokio::sync::broadcast;

// ─────────────────────────────────────────────────────────────────────────────
// Signal
// ─────────────────────────────────────────────────────────────────────────────

/// Something that happened inside the gateway
#[derive(Debug, Clone)]
pub enum GatewaySignal {
    PluginRegistered { plugin_id: String },
    PluginExpired { plugin_id: String },
    JournalAppended(JournalEvent),
    CommandDispatched(CommandStatus),
    CommandSettled(CommandStatus),
}

impl GatewaySignal {
    /// Topic used for subscription matching
    pub fn topic(&self) -> &'static str {
        match self {
            GatewaySignal::PluginRegistered { .. } => "plugin/registered",
            GatewaySignal::PluginExpired { .. } => "plugin/expired",
            GatewaySignal::JournalAppended(_) => "journal/appended",
            GatewaySignal::CommandDispatched(_) => "command/dispatched",
            GatewaySignal::CommandSettled(_) => "command/settled",
        }
    }

    /// Check the topic against a subscription pattern
    ///
    /// Patterns support `*`, a `prefix/*` suffix wildcard and exact topics.
    pub fn matches(&self, pattern: &str) -> bool {
        if pattern == "*" {
            return true;
        }

        let topic = self.topic();
        if let Some(prefix) = pattern.strip_suffix('*') {
            if prefix.ends_with('/') {
                return topic.starts_with(prefix);
            }
        }

        topic == pattern
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Signal Bus
// ─────────────────────────────────────────────────────────────────────────────

/// Cloneable broadcast handle for gateway signals
#[derive(Clone)]
pub struct SignalBus {
    tx: broadcast::Sender<GatewaySignal>,
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl SignalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish a signal; having no subscribers is fine
    pub fn publish(&self, signal: GatewaySignal) {
        tracing::trace!(topic = signal.topic(), "Publishing signal");
        let _ = self.tx.send(signal);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewaySignal> {
        self.tx.subscribe()
    }
}
