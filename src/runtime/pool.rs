//! Supervisor keeping a fixed number of execution slots alive.
//!
//! Each slot is an independent async task with its own listener. The
//! supervisor restarts any slot that stops, and on shutdown broadcasts a
//! signal so every slot finishes its current task and unregisters.

use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::client::Client;
use crate::error::RuntimeError;

use super::executor::Executor;
use super::slot::{SharedRuntimeStats, Slot};

/// Configuration for the execution runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Redis connection URL.
    pub redis_url: String,
    /// Name of the queue to consume.
    pub queue_name: String,
    /// Number of tasks executed at once, one listener per slot.
    pub concurrency: usize,
    /// How often to poll for new tasks when the queue is empty.
    pub poll_interval: Duration,
    /// How often the supervisor checks for stopped slots.
    pub supervise_interval: Duration,
    /// Pause between liveness probes of an orphaned task process.
    pub orphan_retry_interval: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            queue_name: "default".to_string(),
            concurrency: 1,
            poll_interval: Duration::from_secs(1),
            supervise_interval: Duration::from_secs(1),
            orphan_retry_interval: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl RuntimeConfig {
    /// Creates a configuration consuming `queue_name`.
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            ..Default::default()
        }
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Sets the number of slots. Zero is raised to one.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_supervise_interval(mut self, interval: Duration) -> Self {
        self.supervise_interval = interval;
        self
    }

    pub fn with_orphan_retry_interval(mut self, interval: Duration) -> Self {
        self.orphan_retry_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Statistics about the execution runtime.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeStats {
    pub concurrency: usize,
    /// Task processes run to exit, including reclaimed reserved tasks.
    pub tasks_executed: u64,
    /// Task processes that exited non-zero or were killed.
    pub abnormal_exits: u64,
    /// Tasks taken over from dead listeners.
    pub orphans_reclaimed: u64,
    /// Started orphans whose process was waited on instead of re-run.
    pub orphans_awaited: u64,
    /// Slots restarted by the supervisor.
    pub slot_restarts: u64,
    pub average_execution: Duration,
}

/// Runs `concurrency` slots against one queue until shut down.
pub struct ExecutionRuntime {
    config: Arc<RuntimeConfig>,
    client: Client,
    executor: Arc<dyn Executor>,
    shutdown_tx: broadcast::Sender<()>,
    stats: Arc<SharedRuntimeStats>,
}

impl ExecutionRuntime {
    pub fn new(config: RuntimeConfig, client: Client, executor: Arc<dyn Executor>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config: Arc::new(config),
            client,
            executor,
            shutdown_tx,
            stats: Arc::new(SharedRuntimeStats::default()),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Runs until Ctrl-C or SIGTERM.
    pub async fn run(&self) -> Result<(), RuntimeError> {
        self.run_until(shutdown_signal()).await
    }

    /// Runs until `shutdown` resolves, then stops every slot gracefully.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::ShutdownTimeout` if slots are still executing
    /// when the shutdown timeout elapses. Their task processes keep running
    /// and record their own outcome.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), RuntimeError>
    where
        F: Future<Output = ()>,
    {
        let concurrency = self.config.concurrency.max(1);
        let mut slots: Vec<JoinHandle<Result<(), RuntimeError>>> =
            (0..concurrency).map(|i| self.spawn_slot(i as u32)).collect();

        info!(
            queue = %self.config.queue_name,
            concurrency,
            "Execution runtime started"
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.config.supervise_interval) => {}
            }
            self.restart_stopped(&mut slots).await;
        }

        info!("Initiating execution runtime shutdown");

        // Slots that already stopped have no receiver; ignore the send error.
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(self.config.shutdown_timeout, join_all(slots)).await {
            Ok(results) => {
                for (index, result) in results.into_iter().enumerate() {
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            error!(slot = index, error = %e, "Slot failed during shutdown")
                        }
                        Err(e) => {
                            error!(slot = index, error = %e, "Slot panicked during shutdown")
                        }
                    }
                }
                info!("Execution runtime shutdown complete");
                Ok(())
            }
            Err(_) => Err(RuntimeError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Returns current runtime statistics.
    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            concurrency: self.config.concurrency,
            tasks_executed: self.stats.tasks_executed.load(Ordering::SeqCst),
            abnormal_exits: self.stats.abnormal_exits.load(Ordering::SeqCst),
            orphans_reclaimed: self.stats.orphans_reclaimed.load(Ordering::SeqCst),
            orphans_awaited: self.stats.orphans_awaited.load(Ordering::SeqCst),
            slot_restarts: self.stats.slot_restarts.load(Ordering::SeqCst),
            average_execution: self.stats.average_duration(),
        }
    }

    fn spawn_slot(&self, index: u32) -> JoinHandle<Result<(), RuntimeError>> {
        let slot = Slot::new(
            index,
            self.client.clone(),
            Arc::clone(&self.config),
            Arc::clone(&self.executor),
            self.shutdown_tx.subscribe(),
            Arc::clone(&self.stats),
        );
        tokio::spawn(slot.run())
    }

    async fn restart_stopped(&self, slots: &mut [JoinHandle<Result<(), RuntimeError>>]) {
        for (index, handle) in slots.iter_mut().enumerate() {
            if !handle.is_finished() {
                continue;
            }

            match (&mut *handle).await {
                Ok(Ok(())) => warn!(slot = index, "Slot stopped, restarting"),
                Ok(Err(e)) => error!(slot = index, error = %e, "Slot failed, restarting"),
                Err(e) => error!(slot = index, error = %e, "Slot panicked, restarting"),
            }

            self.stats.slot_restarts.fetch_add(1, Ordering::SeqCst);
            *handle = self.spawn_slot(index as u32);
        }
    }
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
