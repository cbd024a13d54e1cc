//! Worker Manager
//!
//! Spawns workers, routes gateway signals to them and stops them on shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::{
    GatewaySignal, SignalBus, Worker, WorkerCommand, WorkerContext, WorkerError, WorkerHandle,
    WorkerResult, WorkerSpec, WorkerState,
};

struct RunningWorker {
    handle: WorkerHandle,
    join_handle: JoinHandle<WorkerResult<()>>,
    spec: WorkerSpec,
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker Manager
// ─────────────────────────────────────────────────────────────────────────────

/// Owns every running worker
pub struct WorkerManager {
    workers: DashMap<String, RunningWorker>,
    shutdown_tx: broadcast::Sender<()>,
    signals: SignalBus,
    shutdown_timeout: Duration,
}

impl WorkerManager {
    pub fn new(signals: SignalBus) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            workers: DashMap::new(),
            shutdown_tx,
            signals,
            shutdown_timeout: Duration::from_secs(10),
        }
    }

    /// Spawn a worker on its own task
    pub fn spawn<W: Worker>(&self, worker: W) -> WorkerResult<WorkerHandle> {
        let spec = worker.spec();
        let worker_id = spec.id.clone();

        if self.workers.contains_key(&worker_id) {
            return Err(WorkerError::AlreadyRunning(worker_id));
        }

        let (command_tx, command_rx) = mpsc::channel(64);
        let state = Arc::new(AtomicU8::new(WorkerState::Starting as u8));
        let handle = WorkerHandle::new(worker_id.clone(), command_tx, Arc::clone(&state));

        let ctx = WorkerContext::new(worker_id.clone(), self.signals.clone());
        let shutdown_rx = self.shutdown_tx.subscribe();
        let signal_rx = self.signals.subscribe();
        let loop_spec = spec.clone();

        let join_handle = tokio::spawn(async move {
            run_worker_loop(worker, ctx, loop_spec, command_rx, shutdown_rx, signal_rx, state).await
        });

        self.workers.insert(
            worker_id,
            RunningWorker {
                handle: handle.clone(),
                join_handle,
                spec,
            },
        );

        Ok(handle)
    }

    /// Stop one worker and wait for its task
    pub async fn stop(&self, worker_id: &str) -> WorkerResult<()> {
        let (_, running) = self
            .workers
            .remove(worker_id)
            .ok_or_else(|| WorkerError::NotRunning(worker_id.to_string()))?;

        let _ = running.handle.shutdown().await;
        let timeout = running.spec.shutdown_timeout + Duration::from_secs(1);
        join_worker(worker_id, running.join_handle, timeout).await
    }

    /// Stop every worker within the manager's shutdown timeout
    pub async fn shutdown_all(&self) -> WorkerResult<()> {
        tracing::info!(workers = self.workers.len(), "Stopping all workers");
        let _ = self.shutdown_tx.send(());

        let ids: Vec<String> = self.workers.iter().map(|w| w.key().clone()).collect();
        let running: Vec<(String, RunningWorker)> = ids
            .into_iter()
            .filter_map(|id| self.workers.remove(&id))
            .collect();

        let timeout = self.shutdown_timeout;
        let joins = running
            .into_iter()
            .map(|(id, w)| async move { join_worker(&id, w.join_handle, timeout).await });
        let results = futures::future::join_all(joins).await;

        if results
            .iter()
            .any(|r| matches!(r, Err(WorkerError::ShutdownTimeout)))
        {
            tracing::warn!("Some workers did not stop within timeout");
            return Err(WorkerError::ShutdownTimeout);
        }
        Ok(())
    }

    pub fn list(&self) -> Vec<(String, WorkerState)> {
        self.workers
            .iter()
            .map(|w| (w.key().clone(), w.value().handle.state()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

async fn join_worker(
    worker_id: &str,
    join_handle: JoinHandle<WorkerResult<()>>,
    timeout: Duration,
) -> WorkerResult<()> {
    match tokio::time::timeout(timeout, join_handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            tracing::error!(worker_id, error = ?e, "Worker task panicked");
            Err(WorkerError::Failed(format!("task panicked: {e}")))
        }
        Err(_) => {
            tracing::warn!(worker_id, "Worker shutdown timed out");
            Err(WorkerError::ShutdownTimeout)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker Task Loop
// ─────────────────────────────────────────────────────────────────────────────

async fn run_worker_loop<W: Worker>(
    mut worker: W,
    ctx: WorkerContext,
    spec: WorkerSpec,
    mut command_rx: mpsc::Receiver<WorkerCommand>,
    mut shutdown_rx: broadcast::Receiver<()>,
    mut signal_rx: broadcast::Receiver<GatewaySignal>,
    state: Arc<AtomicU8>,
) -> WorkerResult<()> {
    if let Err(e) = worker.on_start(&ctx).await {
        tracing::error!(worker_id = %ctx.worker_id, error = %e, "Worker failed to start");
        state.store(WorkerState::Failed as u8, Ordering::SeqCst);
        return Err(e);
    }

    state.store(WorkerState::Running as u8, Ordering::SeqCst);
    tracing::info!(worker_id = %ctx.worker_id, name = %spec.name, "Worker started");

    let mut tick_timer = spec.tick_interval.map(|period| {
        let mut timer = tokio::time::interval(period);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        timer
    });

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                tracing::debug!(worker_id = %ctx.worker_id, "Received global shutdown signal");
                break;
            }

            cmd = command_rx.recv() => {
                match cmd {
                    None | Some(WorkerCommand::Shutdown) => break,
                    Some(WorkerCommand::Tick) => {
                        if let Err(e) = worker.on_tick(&ctx).await {
                            tracing::warn!(worker_id = %ctx.worker_id, error = %e, "Error during forced tick");
                        }
                    }
                    Some(WorkerCommand::GetState(tx)) => {
                        let _ = tx.send(WorkerState::from_u8(state.load(Ordering::SeqCst)));
                    }
                }
            }

            received = signal_rx.recv() => {
                match received {
                    Ok(signal) => {
                        if spec.subscriptions.iter().any(|p| signal.matches(p)) {
                            if let Err(e) = worker.on_signal(&ctx, signal).await {
                                tracing::warn!(worker_id = %ctx.worker_id, error = %e, "Error handling signal");
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(worker_id = %ctx.worker_id, skipped, "Worker lagged behind signal bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            _ = async {
                match tick_timer.as_mut() {
                    Some(timer) => timer.tick().await,
                    None => std::future::pending::<tokio::time::Instant>().await,
                }
            } => {
                if let Err(e) = worker.on_tick(&ctx).await {
                    tracing::warn!(worker_id = %ctx.worker_id, error = %e, "Error during tick");
                }
            }
        }
    }

    state.store(WorkerState::Stopping as u8, Ordering::SeqCst);
    tracing::debug!(worker_id = %ctx.worker_id, "Worker stopping");

    match tokio::time::timeout(spec.shutdown_timeout, worker.on_stop(&ctx)).await {
        Ok(Ok(())) => {
            state.store(WorkerState::Stopped as u8, Ordering::SeqCst);
            tracing::info!(worker_id = %ctx.worker_id, "Worker stopped");
            Ok(())
        }
        Ok(Err(e)) => {
            state.store(WorkerState::Failed as u8, Ordering::SeqCst);
            tracing::error!(worker_id = %ctx.worker_id, error = %e, "Worker stop failed");
            Err(e)
        }
        Err(_) => {
            state.store(WorkerState::Failed as u8, Ordering::SeqCst);
            tracing::error!(worker_id = %ctx.worker_id, "Worker stop timed out");
            Err(WorkerError::ShutdownTimeout)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
