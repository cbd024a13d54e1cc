//! Background Workers
//!
//! Long-running gateway components (registry supervision, command reaping,
//! script hosting) run as workers. Each worker gets its own tokio task.
//!
//! # Lifecycle
//!
//! - `on_start`: called once before the loop starts
//! - `on_stop`: called on shutdown, bounded by `WorkerSpec::shutdown_timeout`
//! - `on_signal`: called for gateway signals matching the subscriptions
//! - `on_tick`: called periodically if `tick_interval` is set

mod handle;
mod manager;
mod signal;

pub use handle::*;
pub use manager::*;
pub use signal::*;

use std::time::Duration;

use async_trait::async_trait;

// ─────────────────────────────────────────────────────────────────────────────
// Worker Error
// ─────────────────────────────────────────────────────────────────────────────

/// Errors from the worker lifecycle
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkerError {
    #[error("worker already running: {0}")]
    AlreadyRunning(String),

    #[error("worker not running: {0}")]
    NotRunning(String),

    #[error("worker operation failed: {0}")]
    Failed(String),

    #[error("shutdown timeout")]
    ShutdownTimeout,

    #[error("channel closed")]
    ChannelClosed,
}

impl From<crate::GatewayError> for WorkerError {
    fn from(err: crate::GatewayError) -> Self {
        WorkerError::Failed(err.to_string())
    }
}

pub type WorkerResult<T> = Result<T, WorkerError>;

// ─────────────────────────────────────────────────────────────────────────────
// Worker Spec
// ─────────────────────────────────────────────────────────────────────────────

/// Static configuration of a worker
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    /// Unique worker identifier
    pub id: String,

    pub name: String,

    /// Optional interval for `on_tick`
    pub tick_interval: Option<Duration>,

    /// Signal topic patterns (`*`, `prefix/*`, exact)
    pub subscriptions: Vec<String>,

    /// Bound on `on_stop`
    pub shutdown_timeout: Duration,
}

impl WorkerSpec {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tick_interval: None,
            subscriptions: Vec::new(),
            shutdown_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = Some(interval);
        self
    }

    /// Add a single subscription
    pub fn subscribe(mut self, pattern: impl Into<String>) -> Self {
        self.subscriptions.push(pattern.into());
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker Context
// ─────────────────────────────────────────────────────────────────────────────

/// Context passed to worker lifecycle methods
pub struct WorkerContext {
    pub worker_id: String,
    signals: SignalBus,
}

impl WorkerContext {
    pub fn new(worker_id: String, signals: SignalBus) -> Self {
        Self { worker_id, signals }
    }

    /// Publish a gateway signal
    pub fn publish(&self, signal: GatewaySignal) {
        self.signals.publish(signal);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker Trait
// ─────────────────────────────────────────────────────────────────────────────

/// A long-running component managed by the [`WorkerManager`]
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    fn spec(&self) -> WorkerSpec;

    /// Called before the loop starts. An error keeps the worker from running.
    async fn on_start(&mut self, _ctx: &WorkerContext) -> WorkerResult<()> {
        Ok(())
    }

    /// Called on shutdown. The worker stops even if this fails.
    async fn on_stop(&mut self, _ctx: &WorkerContext) -> WorkerResult<()> {
        Ok(())
    }

    async fn on_signal(&mut self, _ctx: &WorkerContext, _signal: GatewaySignal) -> WorkerResult<()> {
        Ok(())
    }

    async fn on_tick(&mut self, _ctx: &WorkerContext) -> WorkerResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_spec_builder() {
        let spec = WorkerSpec::new("reaper", "Command Reaper")
            .with_tick_interval(Duration::from_millis(500))
            .subscribe("command/*")
            .subscribe("plugin/expired")
            .with_shutdown_timeout(Duration::from_secs(1));

        assert_eq!(spec.id, "reaper");
        assert_eq!(spec.tick_interval, Some(Duration::from_millis(500)));
        assert_eq!(spec.subscriptions, vec!["command/*", "plugin/expired"]);
        assert_eq!(spec.shutdown_timeout, Duration::from_secs(1));
    }
}
