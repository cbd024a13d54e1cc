// Command status and its state machine
//
//   Pending --ack(ok)--> Accepted --complete(ok)--> Succeeded
//   Pending --ack(fail)--> Failed     Accepted --complete(fail)--> Failed
//
// Succeeded and Failed are terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::ValidationError;

/// Lifecycle state of a dispatched command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    Pending,
    Accepted,
    Succeeded,
    Failed,
}

impl CommandState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandState::Succeeded | CommandState::Failed)
    }
}

impl std::fmt::Display for CommandState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandState::Pending => write!(f, "pending"),
            CommandState::Accepted => write!(f, "accepted"),
            CommandState::Succeeded => write!(f, "succeeded"),
            CommandState::Failed => write!(f, "failed"),
        }
    }
}

/// Rejected state transition
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("command {command_id} is already {state}")]
    Terminal { command_id: Uuid, state: CommandState },

    #[error("command {command_id} cannot be rejected once {state}")]
    Invalid { command_id: Uuid, state: CommandState },
}

/// Result of applying an event to a status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// State moved; `terminal` is set when it reached Succeeded/Failed
    Moved { terminal: bool },
    /// Duplicate event, nothing changed
    Unchanged,
}

/// Trackable status of one command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandStatus {
    pub command_id: Uuid,
    pub plugin_id: String,
    pub device_id: String,
    pub entity_id: String,
    /// The payload's `type`
    pub command_type: String,
    pub state: CommandState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandStatus {
    /// Create a fresh `Pending` status
    pub fn pending(
        plugin_id: impl Into<String>,
        device_id: impl Into<String>,
        entity_id: impl Into<String>,
        command_type: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            command_id: Uuid::new_v4(),
            plugin_id: plugin_id.into(),
            device_id: device_id.into(),
            entity_id: entity_id.into(),
            command_type: command_type.into(),
            state: CommandState::Pending,
            created_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
        }
    }

    /// Apply a plugin acknowledgement
    pub fn acknowledge(
        &mut self,
        accepted: bool,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Transition, TransitionError> {
        match (self.state, accepted) {
            (CommandState::Pending, true) => {
                self.state = CommandState::Accepted;
                self.updated_at = now;
                Ok(Transition::Moved { terminal: false })
            }
            (CommandState::Pending, false) => {
                Ok(self.settle(CommandState::Failed, error, now))
            }
            (CommandState::Accepted, true) => Ok(Transition::Unchanged),
            (CommandState::Accepted, false) => Err(TransitionError::Invalid {
                command_id: self.command_id,
                state: self.state,
            }),
            (state, _) => Err(TransitionError::Terminal {
                command_id: self.command_id,
                state,
            }),
        }
    }

    /// Apply a plugin completion result
    ///
    /// Completing a still-pending command counts as an implicit acknowledgement.
    pub fn complete(
        &mut self,
        succeeded: bool,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Transition, TransitionError> {
        if self.state.is_terminal() {
            return Err(TransitionError::Terminal {
                command_id: self.command_id,
                state: self.state,
            });
        }

        let target = if succeeded {
            CommandState::Succeeded
        } else {
            CommandState::Failed
        };
        Ok(self.settle(target, error, now))
    }

    /// Fail a non-terminal command unilaterally (timeouts, delivery errors)
    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> Transition {
        if self.state.is_terminal() {
            return Transition::Unchanged;
        }
        self.settle(CommandState::Failed, Some(error.into()), now)
    }

    fn settle(
        &mut self,
        state: CommandState,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Transition {
        self.state = state;
        self.updated_at = now;
        self.completed_at = Some(now);
        self.error = match state {
            CommandState::Failed => Some(error.unwrap_or_else(|| "command failed".to_string())),
            _ => None,
        };
        Transition::Moved { terminal: true }
    }
}

/// Command type of a payload without a `type` field
pub const DEFAULT_COMMAND_TYPE: &str = "command";

/// Extract the command type from a payload
///
/// Any JSON object is a command. Its type is the `type` field when present,
/// which must then be a non-empty string, else [`DEFAULT_COMMAND_TYPE`].
pub fn command_type(payload: &Value) -> Result<String, ValidationError> {
    let object = payload
        .as_object()
        .ok_or(ValidationError::PayloadNotObject)?;

    match object.get("type") {
        None => Ok(DEFAULT_COMMAND_TYPE.to_string()),
        Some(Value::String(kind)) if !kind.is_empty() => Ok(kind.clone()),
        Some(_) => Err(ValidationError::InvalidCommandType),
    }
}

/// What a plugin receives on its inbox for each dispatched command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub command_id: Uuid,
    pub plugin_id: String,
    pub device_id: String,
    pub entity_id: String,
    pub command_type: String,
    pub payload: Value,
}

impl CommandEnvelope {
    pub fn new(status: &CommandStatus, payload: Value) -> Self {
        Self {
            command_id: status.command_id,
            plugin_id: status.plugin_id.clone(),
            device_id: status.device_id.clone(),
            entity_id: status.entity_id.clone(),
            command_type: status.command_type.clone(),
            payload,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
