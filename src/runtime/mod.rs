//! Process-isolated execution runtime.
//!
//! A worker process runs [`ExecutionRuntime`]: a supervisor over a fixed
//! number of slots, each bound as its own listener. Every reserved task is
//! executed in a separate task process, so a crashing task never takes the
//! worker down and a dying worker leaves its running tasks alive.
//!
//! # Architecture
//!
//! ```text
//! worker process
//! ├── supervisor (restarts stopped slots)
//! ├── slot 0 ── listener {host}_{pid}.0 ── task process (re-exec)
//! └── slot N ── listener {host}_{pid}.N ── task process (re-exec)
//! ```
//!
//! The task process is the same binary started again with an
//! [`Assignment`] in its environment. [`run`] detects this and executes the
//! handler instead of starting a supervisor, so every binary using the
//! runtime must call [`run`] early in `main`.

mod child;
mod executor;
mod handler;
mod pool;
mod slot;

use std::sync::Arc;

use tracing::info;

pub use child::{execute, EXIT_RECORDED, EXIT_UNRECORDED};
pub use executor::{
    Assignment, Execution, Executor, ProcessExecutor, LISTENER_ID_ENV, QUEUE_ENV, TASK_ID_ENV,
};
pub use handler::{CommandHandler, TaskHandler, PARAMETERS_ENV};
pub use pool::{shutdown_signal, ExecutionRuntime, RuntimeConfig, RuntimeStats};

use crate::client::Client;
use crate::error::RuntimeError;

/// Entry point for worker binaries.
///
/// In a worker process this runs the supervisor until Ctrl-C or SIGTERM. In
/// a task process it executes the assigned task with `handler` and exits the
/// process without returning.
pub async fn run<H>(config: RuntimeConfig, handler: H) -> Result<(), RuntimeError>
where
    H: TaskHandler,
{
    let client = Client::connect(&config.redis_url).await?;

    if let Some(assignment) = Assignment::from_env()? {
        let code = child::run_assignment(&client, assignment, Arc::new(handler)).await;
        child::exit(code);
    }

    info!(queue = %config.queue_name, concurrency = config.concurrency, "Starting worker");
    let executor = ProcessExecutor::current()?;
    ExecutionRuntime::new(config, client, Arc::new(executor))
        .run()
        .await
}
