//! Gateway error taxonomy
//!
//! Every rejected operation returns one of these. The HTTP layer in front of
//! the core maps them to status codes with [`GatewayError::status_code`].

use slidebolt_types::{TransitionError, ValidationError};
use uuid::Uuid;

/// Errors surfaced by gateway operations
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The target plugin is not registered
    #[error("unknown plugin: {0}")]
    UnknownPlugin(String),

    /// The plugin is registered but stale, or its channel is gone. Retryable.
    #[error("plugin unavailable: {plugin_id}: {reason}")]
    PluginUnavailable { plugin_id: String, reason: String },

    #[error("unknown device: {plugin_id}/{device_id}")]
    UnknownDevice { plugin_id: String, device_id: String },

    #[error("unknown entity: {plugin_id}/{device_id}/{entity_id}")]
    UnknownEntity {
        plugin_id: String,
        device_id: String,
        entity_id: String,
    },

    #[error("unknown command: {0}")]
    UnknownCommand(Uuid),

    #[error("unknown domain: {0}")]
    UnknownDomain(String),

    /// Malformed input, rejected before any state changed
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] ValidationError),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// A script could not be loaded onto an entity
    #[error("script rejected: {0}")]
    ScriptRejected(String),

    /// A background worker could not be started or reached
    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    pub fn unavailable(plugin_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PluginUnavailable {
            plugin_id: plugin_id.into(),
            reason: reason.into(),
        }
    }

    pub fn unknown_device(plugin_id: &str, device_id: &str) -> Self {
        Self::UnknownDevice {
            plugin_id: plugin_id.to_string(),
            device_id: device_id.to_string(),
        }
    }

    pub fn unknown_entity(plugin_id: &str, device_id: &str, entity_id: &str) -> Self {
        Self::UnknownEntity {
            plugin_id: plugin_id.to_string(),
            device_id: device_id.to_string(),
            entity_id: entity_id.to_string(),
        }
    }

    /// HTTP status the façade reports for this error
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::UnknownPlugin(_) => 403,
            GatewayError::InvalidPayload(_) | GatewayError::ScriptRejected(_) => 400,
            GatewayError::UnknownDevice { .. }
            | GatewayError::UnknownEntity { .. }
            | GatewayError::UnknownCommand(_)
            | GatewayError::UnknownDomain(_) => 404,
            GatewayError::PluginUnavailable { .. } => 502,
            GatewayError::Timeout(_) => 504,
            GatewayError::Conflict(_) => 409,
            GatewayError::Io(_)
            | GatewayError::Storage(_)
            | GatewayError::Serialization(_)
            | GatewayError::Runtime(_) => 500,
        }
    }

    /// Whether a caller may retry the same operation later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::PluginUnavailable { .. } | GatewayError::Timeout(_)
        )
    }
}

impl From<TransitionError> for GatewayError {
    fn from(err: TransitionError) -> Self {
        GatewayError::Conflict(err.to_string())
    }
}

impl From<redb::Error> for GatewayError {
    fn from(err: redb::Error) -> Self {
        GatewayError::Storage(err.to_string())
    }
}

impl From<redb::DatabaseError> for GatewayError {
    fn from(err: redb::DatabaseError) -> Self {
        GatewayError::Storage(err.to_string())
    }
}

impl From<redb::TransactionError> for GatewayError {
    fn from(err: redb::TransactionError) -> Self {
        GatewayError::Storage(err.to_string())
    }
}

impl From<redb::TableError> for GatewayError {
    fn from(err: redb::TableError) -> Self {
        GatewayError::Storage(err.to_string())
    }
}

impl From<redb::StorageError> for GatewayError {
    fn from(err: redb::StorageError) -> Self {
        GatewayError::Storage(err.to_string())
    }
}

impl From<redb::CommitError> for GatewayError {
    fn from(err: redb::CommitError) -> Self {
        GatewayError::Storage(err.to_string())
    }
}
