//! Plugin Message Bus
//!
//! The router never reaches into a plugin directly: envelopes are handed to a
//! [`PluginTransport`] keyed by plugin id. [`ChannelBus`] is the in-process
//! implementation with one bounded inbox per connected plugin.

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use slidebolt_types::CommandEnvelope;

use crate::{GatewayError, Result};

/// Delivery seam between the router and plugins
#[async_trait]
pub trait PluginTransport: Send + Sync + 'static {
    /// Hand an envelope to the target plugin. Success means queued, not acked.
    async fn deliver(&self, envelope: CommandEnvelope) -> Result<()>;
}

/// In-process bus with one bounded inbox per plugin
#[derive(Default)]
pub struct ChannelBus {
    inboxes: DashMap<String, mpsc::Sender<CommandEnvelope>>,
}

impl ChannelBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a plugin; replaces any previous inbox for the same id
    pub fn connect(&self, plugin_id: &str, capacity: usize) -> mpsc::Receiver<CommandEnvelope> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        if self.inboxes.insert(plugin_id.to_string(), tx).is_some() {
            tracing::debug!(plugin_id, "Plugin inbox replaced");
        } else {
            tracing::debug!(plugin_id, "Plugin connected to bus");
        }
        rx
    }

    pub fn disconnect(&self, plugin_id: &str) -> bool {
        self.inboxes.remove(plugin_id).is_some()
    }

    pub fn is_connected(&self, plugin_id: &str) -> bool {
        self.inboxes
            .get(plugin_id)
            .is_some_and(|tx| !tx.is_closed())
    }
}

#[async_trait]
impl PluginTransport for ChannelBus {
    async fn deliver(&self, envelope: CommandEnvelope) -> Result<()> {
        let plugin_id = envelope.plugin_id.clone();
        let tx = self
            .inboxes
            .get(&plugin_id)
            .map(|tx| tx.clone())
            .ok_or_else(|| GatewayError::unavailable(&plugin_id, "no inbox connected"))?;

        match tx.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                Err(GatewayError::unavailable(&plugin_id, "inbox full"))
            }
            Err(TrySendError::Closed(_)) => {
                self.inboxes.remove_if(&plugin_id, |_, tx| tx.is_closed());
                Err(GatewayError::unavailable(&plugin_id, "inbox closed"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use slidebolt_types::CommandStatus;
    use tokio_test::{assert_err, assert_ok};

    fn envelope(plugin_id: &str) -> CommandEnvelope {
        let status = CommandStatus::pending(plugin_id, "d", "e", "turn_on", Utc::now());
        CommandEnvelope::new(&status, json!({"type": "turn_on"}))
    }

    #[tokio::test]
    async fn test_deliver_to_connected_plugin() {
        let bus = ChannelBus::new();
        let mut rx = bus.connect("plugin-a", 4);

        assert_ok!(bus.deliver(envelope("plugin-a")).await);
        let received = rx.recv().await.unwrap();
        assert_eq!(received.command_type, "turn_on");
        assert!(bus.is_connected("plugin-a"));
    }

    #[tokio::test]
    async fn test_deliver_without_inbox_is_unavailable() {
        let bus = ChannelBus::new();
        let err = bus.deliver(envelope("plugin-a")).await.unwrap_err();
        assert!(matches!(err, GatewayError::PluginUnavailable { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_full_and_closed_inboxes() {
        let bus = ChannelBus::new();
        let rx = bus.connect("plugin-a", 1);

        assert_ok!(bus.deliver(envelope("plugin-a")).await);
        assert!(matches!(
            bus.deliver(envelope("plugin-a")).await,
            Err(GatewayError::PluginUnavailable { .. })
        ));

        drop(rx);
        assert!(!bus.is_connected("plugin-a"));
        assert_err!(bus.deliver(envelope("plugin-a")).await);
        assert!(!bus.disconnect("plugin-a"));
    }
}
