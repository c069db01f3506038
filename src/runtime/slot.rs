//! A single execution slot: one listener, one task process at a time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::client::Client;
use crate::error::RuntimeError;
use crate::listener::{Listener, ListenerId};
use crate::task::{Task, TaskStatus};

use super::executor::Executor;
use super::pool::RuntimeConfig;

/// Counters shared by every slot of a runtime.
#[derive(Default)]
pub(crate) struct SharedRuntimeStats {
    pub(crate) tasks_executed: AtomicU64,
    pub(crate) abnormal_exits: AtomicU64,
    pub(crate) orphans_reclaimed: AtomicU64,
    pub(crate) orphans_awaited: AtomicU64,
    pub(crate) slot_restarts: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl SharedRuntimeStats {
    fn record_execution(&self, duration: Duration, clean: bool) {
        self.tasks_executed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
        if !clean {
            self.abnormal_exits.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn average_duration(&self) -> Duration {
        let executed = self.tasks_executed.load(Ordering::SeqCst);
        if executed == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.total_duration_ms.load(Ordering::SeqCst) / executed)
    }
}

pub(crate) struct Slot {
    index: u32,
    client: Client,
    config: Arc<RuntimeConfig>,
    executor: Arc<dyn Executor>,
    shutdown_rx: broadcast::Receiver<()>,
    stats: Arc<SharedRuntimeStats>,
}

impl Slot {
    pub(crate) fn new(
        index: u32,
        client: Client,
        config: Arc<RuntimeConfig>,
        executor: Arc<dyn Executor>,
        shutdown_rx: broadcast::Receiver<()>,
        stats: Arc<SharedRuntimeStats>,
    ) -> Self {
        Self {
            index,
            client,
            config,
            executor,
            shutdown_rx,
            stats,
        }
    }

    /// Binds the slot's listener, drains orphans, then executes tasks until
    /// shutdown. The listener is unregistered only on a graceful stop.
    pub(crate) async fn run(mut self) -> Result<(), RuntimeError> {
        let id = ListenerId::local().with_slot(self.index);
        let listener = self
            .client
            .listener_with_id(&self.config.queue_name, id)
            .await?
            .with_poll_interval(self.config.poll_interval);

        info!(slot = self.index, listener = %listener.id(), "Slot started");

        self.resume_interrupted(&listener).await?;
        self.drain_orphans(&listener).await?;

        loop {
            if self.shutdown_requested() {
                info!(slot = self.index, "Slot received shutdown signal");
                break;
            }

            match listener.poll().await? {
                Some(task) => self.run_task(&listener, &task).await?,
                None => {
                    debug!(slot = self.index, "No tasks available");
                    tokio::select! {
                        _ = self.shutdown_rx.recv() => {
                            info!(slot = self.index, "Slot received shutdown signal");
                            break;
                        }
                        _ = tokio::time::sleep(listener.poll_interval()) => {}
                    }
                }
            }
        }

        listener.close().await?;
        info!(slot = self.index, "Slot stopped");
        Ok(())
    }

    fn shutdown_requested(&mut self) -> bool {
        match self.shutdown_rx.try_recv() {
            Ok(()) | Err(broadcast::error::TryRecvError::Closed) => true,
            Err(broadcast::error::TryRecvError::Lagged(_)) => true,
            Err(broadcast::error::TryRecvError::Empty) => false,
        }
    }

    /// Runs every task this slot reserved before it restarted but never
    /// started. Entries left behind by task processes that died after
    /// starting are skipped.
    async fn resume_interrupted(&self, listener: &Listener) -> Result<(), RuntimeError> {
        let queue = listener.queue();
        for task_id in queue.reserved_tasks(&listener.id().to_string()).await? {
            let task = queue.get_task(&task_id).await?;
            if task.status() == Some(TaskStatus::Reserved) {
                info!(slot = self.index, task_id = %task_id, "Resuming interrupted task");
                self.run_task(listener, &task).await?;
            }
        }
        Ok(())
    }

    /// Takes over the work of dead local listeners before accepting new work.
    ///
    /// A reclaimed reserved task is executed here. A reclaimed started task
    /// already has a process of its own; the slot waits for that process to
    /// exit and does not run the task again.
    async fn drain_orphans(&self, listener: &Listener) -> Result<(), RuntimeError> {
        while let Some(task) = listener.claim_orphan().await? {
            self.stats.orphans_reclaimed.fetch_add(1, Ordering::SeqCst);

            match task.status() {
                Some(TaskStatus::Reserved) => {
                    info!(slot = self.index, task_id = %task.id(), "Executing reclaimed task");
                    self.run_task(listener, &task).await?;
                }
                Some(TaskStatus::Started) => {
                    self.await_orphan_process(&task).await;
                }
                status => {
                    warn!(
                        slot = self.index,
                        task_id = %task.id(),
                        status = ?status,
                        "Reclaimed task has nothing left to run"
                    );
                }
            }
        }
        Ok(())
    }

    async fn await_orphan_process(&self, task: &Task) {
        let Some(pid) = task.pid() else {
            warn!(slot = self.index, task_id = %task.id(), "Started orphan has no pid");
            return;
        };

        info!(slot = self.index, task_id = %task.id(), pid, "Waiting for orphaned task process");
        let liveness = self.client.liveness();
        while liveness.is_alive(pid) {
            tokio::time::sleep(self.config.orphan_retry_interval).await;
        }
        self.stats.orphans_awaited.fetch_add(1, Ordering::SeqCst);
        debug!(slot = self.index, task_id = %task.id(), pid, "Orphaned task process exited");
    }

    async fn run_task(&self, listener: &Listener, task: &Task) -> Result<(), RuntimeError> {
        let started = Instant::now();

        let execution = match self.executor.execute(task, listener.id()).await {
            Ok(execution) => execution,
            Err(e) => {
                error!(
                    slot = self.index,
                    task_id = %task.id(),
                    error = %e,
                    "Failed to execute task"
                );
                return Err(e);
            }
        };

        let duration = started.elapsed();
        self.stats
            .record_execution(duration, execution.exited_cleanly());
        debug!(
            slot = self.index,
            task_id = %task.id(),
            duration_ms = duration.as_millis() as u64,
            exit_code = ?execution.exit_code,
            "Execution finished"
        );
        Ok(())
    }
}
