//! Worker Handle

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::{mpsc, oneshot};

use super::{WorkerError, WorkerResult};

// ─────────────────────────────────────────────────────────────────────────────
// Worker State
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum WorkerState {
    Starting = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
    Failed = 4,
}

impl WorkerState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Starting,
            1 => Self::Running,
            2 => Self::Stopping,
            3 => Self::Stopped,
            _ => Self::Failed,
        }
    }

    pub fn is_running(&self) -> bool {
        *self == WorkerState::Running
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker Command
// ─────────────────────────────────────────────────────────────────────────────

/// Direct instructions to one running worker
pub enum WorkerCommand {
    /// Run `on_tick` now
    Tick,
    Shutdown,
    GetState(oneshot::Sender<WorkerState>),
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker Handle
// ─────────────────────────────────────────────────────────────────────────────

/// Cloneable handle to a running worker
#[derive(Clone)]
pub struct WorkerHandle {
    pub worker_id: String,
    command_tx: mpsc::Sender<WorkerCommand>,
    state: Arc<AtomicU8>,
}

impl WorkerHandle {
    pub(crate) fn new(
        worker_id: String,
        command_tx: mpsc::Sender<WorkerCommand>,
        state: Arc<AtomicU8>,
    ) -> Self {
        Self {
            worker_id,
            command_tx,
            state,
        }
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    async fn send(&self, command: WorkerCommand) -> WorkerResult<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| WorkerError::NotRunning(self.worker_id.clone()))
    }

    /// Force an immediate `on_tick`
    pub async fn tick(&self) -> WorkerResult<()> {
        self.send(WorkerCommand::Tick).await
    }

    pub async fn shutdown(&self) -> WorkerResult<()> {
        self.send(WorkerCommand::Shutdown).await
    }

    /// Ask the worker loop for its state (waits for the loop to answer)
    pub async fn request_state(&self) -> WorkerResult<WorkerState> {
        let (tx, rx) = oneshot::channel();
        self.send(WorkerCommand::GetState(tx)).await?;
        rx.await.map_err(|_| WorkerError::ChannelClosed)
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("worker_id", &self.worker_id)
            .field("state", &self.state())
            .finish()
    }
}
