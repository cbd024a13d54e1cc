//! Event Journal
//!
//! Append-only per-entity event log in redb. Keys are
//! `plugin␟device␟entity␟sequence`, so a prefix range yields one entity's (or
//! device's, or plugin's) log in append order. The sequence counter and the
//! `created_at` clamp are read and written inside the write transaction,
//! which redb serializes.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde_json::Value;
use uuid::Uuid;

use slidebolt_types::{JournalEvent, JournalFilter, event_name};

use crate::registry::Registry;
use crate::runtime::{GatewaySignal, SignalBus};
use crate::store::StateStore;
use crate::{GatewayError, Result};

// key is "plugin\x1fdevice\x1fentity\x1f<sequence:020>", value is the JSON event
const EVENTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("journal_events");
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("journal_meta");
const SEQUENCE_KEY: &str = "sequence";

const SEP: char = '\u{1f}';
// First character after SEP; closes a prefix range
const SEP_END: char = '\u{20}';

fn event_key(event: &JournalEvent) -> String {
    format!(
        "{}{SEP}{}{SEP}{}{SEP}{:020}",
        event.plugin_id, event.device_id, event.entity_id, event.sequence
    )
}

/// Key range covering everything the filter selects
fn filter_range(filter: &JournalFilter) -> (String, String) {
    let mut prefix = filter.plugin_id.clone();
    if let Some(device_id) = &filter.device_id {
        prefix.push(SEP);
        prefix.push_str(device_id);
        if let Some(entity_id) = &filter.entity_id {
            prefix.push(SEP);
            prefix.push_str(entity_id);
        }
    }
    (format!("{prefix}{SEP}"), format!("{prefix}{SEP_END}"))
}

fn storage_err(e: impl std::fmt::Display) -> GatewayError {
    GatewayError::Storage(e.to_string())
}

/// Append-only event log
pub struct Journal {
    db: Arc<Database>,
    registry: Arc<Registry>,
    store: Arc<StateStore>,
    signals: SignalBus,
}

impl Journal {
    /// Open (or create) the journal database
    pub fn open(
        path: impl AsRef<Path>,
        registry: Arc<Registry>,
        store: Arc<StateStore>,
        signals: SignalBus,
    ) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;
        let write_txn = db.begin_write()?;
        let sequence = {
            write_txn.open_table(EVENTS_TABLE)?;
            let meta = write_txn.open_table(META_TABLE)?;
            meta.get(SEQUENCE_KEY)?.map(|g| g.value()).unwrap_or(0)
        };
        write_txn.commit()?;

        tracing::info!(path = %path.display(), sequence, "Journal opened");

        Ok(Self {
            db: Arc::new(db),
            registry,
            store,
            signals,
        })
    }

    /// Append an event on behalf of a healthy plugin
    pub async fn append(
        &self,
        plugin_id: &str,
        device_id: &str,
        entity_id: &str,
        payload: Value,
    ) -> Result<JournalEvent> {
        self.append_at(plugin_id, device_id, entity_id, payload, Utc::now())
            .await
    }

    /// Append with an explicit arrival time
    pub async fn append_at(
        &self,
        plugin_id: &str,
        device_id: &str,
        entity_id: &str,
        payload: Value,
        now: DateTime<Utc>,
    ) -> Result<JournalEvent> {
        self.registry.require_healthy(plugin_id)?;
        if !self.store.entity_exists(plugin_id, device_id, entity_id).await {
            return Err(GatewayError::unknown_entity(plugin_id, device_id, entity_id));
        }
        self.record(plugin_id, device_id, entity_id, payload, now)
            .await
    }

    /// Append without the liveness gate (gateway-originated events)
    pub(crate) async fn record(
        &self,
        plugin_id: &str,
        device_id: &str,
        entity_id: &str,
        payload: Value,
        now: DateTime<Utc>,
    ) -> Result<JournalEvent> {
        let event = JournalEvent {
            event_id: Uuid::new_v4(),
            sequence: 0,
            name: event_name(&payload),
            plugin_id: plugin_id.to_string(),
            device_id: device_id.to_string(),
            entity_id: entity_id.to_string(),
            payload,
            created_at: now,
        };

        let db = Arc::clone(&self.db);
        let event = tokio::task::spawn_blocking(move || write_event(&db, event))
            .await
            .map_err(storage_err)??;

        tracing::debug!(
            plugin_id,
            device_id,
            entity_id,
            sequence = event.sequence,
            name = %event.name,
            "Journal event appended"
        );
        self.signals
            .publish(GatewaySignal::JournalAppended(event.clone()));
        Ok(event)
    }

    /// Events selected by the filter, oldest first; `limit` keeps the newest
    pub async fn query(&self, filter: &JournalFilter, limit: Option<usize>) -> Result<Vec<JournalEvent>> {
        self.registry.require_registered(&filter.plugin_id)?;
        let mut events = self.scan(filter.clone(), 0).await?;
        if let Some(limit) = limit {
            let skip = events.len().saturating_sub(limit);
            events.drain(..skip);
        }
        Ok(events)
    }

    /// Events after a sequence number, oldest first (restartable cursor)
    pub async fn since(
        &self,
        filter: &JournalFilter,
        sequence: u64,
        limit: Option<usize>,
    ) -> Result<Vec<JournalEvent>> {
        self.registry.require_registered(&filter.plugin_id)?;
        let mut events = self.scan(filter.clone(), sequence).await?;
        if let Some(limit) = limit {
            events.truncate(limit);
        }
        Ok(events)
    }

    /// Delete every event the filter selects; returns how many went
    pub async fn purge(&self, filter: &JournalFilter) -> Result<usize> {
        let db = Arc::clone(&self.db);
        let (start, end) = filter_range(filter);
        let selected = filter.clone();

        let removed = tokio::task::spawn_blocking(move || -> Result<usize> {
            let filter = selected;
            let write_txn = db.begin_write()?;
            let removed = {
                let mut table = write_txn.open_table(EVENTS_TABLE)?;
                let mut keys = Vec::new();
                for entry in table.range(start.as_str()..end.as_str())? {
                    let (key, value) = entry?;
                    let event: JournalEvent = serde_json::from_slice(value.value())?;
                    if filter.matches(&event) {
                        keys.push(key.value().to_string());
                    }
                }
                for key in &keys {
                    table.remove(key.as_str())?;
                }
                keys.len()
            };
            write_txn.commit()?;
            Ok(removed)
        })
        .await
        .map_err(storage_err)??;

        tracing::info!(plugin_id = %filter.plugin_id, removed, "Journal purged");
        Ok(removed)
    }

    /// Highest sequence handed out so far
    pub async fn last_sequence(&self) -> Result<u64> {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || -> Result<u64> {
            let read_txn = db.begin_read()?;
            let meta = read_txn.open_table(META_TABLE)?;
            Ok(meta.get(SEQUENCE_KEY)?.map(|g| g.value()).unwrap_or(0))
        })
        .await
        .map_err(storage_err)?
    }

    async fn scan(&self, filter: JournalFilter, after: u64) -> Result<Vec<JournalEvent>> {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || -> Result<Vec<JournalEvent>> {
            let (start, end) = filter_range(&filter);
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(EVENTS_TABLE)?;

            let mut events = Vec::new();
            for entry in table.range(start.as_str()..end.as_str())? {
                let (_, value) = entry?;
                let event: JournalEvent = serde_json::from_slice(value.value())?;
                // The key range only narrows by entity when a device is set
                if event.sequence > after && filter.matches(&event) {
                    events.push(event);
                }
            }
            events.sort_by_key(|e| e.sequence);
            Ok(events)
        })
        .await
        .map_err(storage_err)?
    }
}

/// Assign the sequence, clamp created_at and commit one event
fn write_event(db: &Database, mut event: JournalEvent) -> Result<JournalEvent> {
    let write_txn = db.begin_write()?;
    {
        let mut meta = write_txn.open_table(META_TABLE)?;
        let sequence = meta.get(SEQUENCE_KEY)?.map(|g| g.value()).unwrap_or(0) + 1;
        meta.insert(SEQUENCE_KEY, sequence)?;
        event.sequence = sequence;

        let mut table = write_txn.open_table(EVENTS_TABLE)?;
        let (start, end) = filter_range(&JournalFilter::for_entity(
            &event.plugin_id,
            &event.device_id,
            &event.entity_id,
        ));
        let previous = match table.range(start.as_str()..end.as_str())?.next_back() {
            Some(entry) => {
                let (_, value) = entry?;
                Some(serde_json::from_slice::<JournalEvent>(value.value())?.created_at)
            }
            None => None,
        };
        if let Some(previous) = previous {
            event.created_at = event.created_at.max(previous);
        }

        let bytes = serde_json::to_vec(&event)?;
        table.insert(event_key(&event).as_str(), bytes.as_slice())?;
    }
    write_txn.commit()?;
    Ok(event)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
