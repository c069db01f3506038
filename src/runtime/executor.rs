//! Running a reserved task in its own process.
//!
//! [`ProcessExecutor`] re-executes the current binary with the task
//! assignment in its environment. The child recognises the assignment in
//! [`run`](super::run), executes the handler, records the outcome, and exits.

use std::env;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitStatus;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::RuntimeError;
use crate::listener::ListenerId;
use crate::task::{Task, TaskId};

/// Queue the assigned task belongs to.
pub const QUEUE_ENV: &str = "RELAYQ_ASSIGNED_QUEUE";
/// Id of the assigned task.
pub const TASK_ID_ENV: &str = "RELAYQ_ASSIGNED_TASK";
/// Listener that reserved the assigned task.
pub const LISTENER_ID_ENV: &str = "RELAYQ_ASSIGNED_LISTENER";

pub(crate) const ASSIGNMENT_VARS: [&str; 3] = [QUEUE_ENV, TASK_ID_ENV, LISTENER_ID_ENV];

/// How a task process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Execution {
    /// Pid of the task process, if one was spawned.
    pub pid: Option<u32>,
    /// Exit code, `None` when killed by a signal.
    pub exit_code: Option<i32>,
}

impl Execution {
    pub fn from_status(pid: Option<u32>, status: ExitStatus) -> Self {
        Self {
            pid,
            exit_code: status.code(),
        }
    }

    /// Whether the task process exited normally.
    ///
    /// The task's own success or failure is recorded in the store, not here.
    pub fn exited_cleanly(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs one reserved task to its terminal state and waits for it.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, task: &Task, listener: &ListenerId) -> Result<Execution, RuntimeError>;
}

/// Work assigned to a task process through its environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub queue: String,
    pub task_id: TaskId,
    pub listener_id: String,
}

impl Assignment {
    /// Reads the assignment of this process.
    ///
    /// Returns `Ok(None)` for a worker process and an error when the
    /// environment holds only part of an assignment.
    pub fn from_env() -> Result<Option<Self>, RuntimeError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<Self>, RuntimeError> {
        let Some(task_id) = lookup(TASK_ID_ENV) else {
            return Ok(None);
        };
        let queue = lookup(QUEUE_ENV).ok_or(RuntimeError::MissingAssignment(QUEUE_ENV))?;
        let listener_id =
            lookup(LISTENER_ID_ENV).ok_or(RuntimeError::MissingAssignment(LISTENER_ID_ENV))?;

        Ok(Some(Self {
            queue,
            task_id: TaskId::from(task_id),
            listener_id,
        }))
    }
}

/// Spawns the current executable once per task.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessExecutor {
    /// Re-executes this binary with the arguments it was started with.
    pub fn current() -> Result<Self, RuntimeError> {
        Ok(Self {
            program: env::current_exe()?,
            args: env::args_os().skip(1).collect(),
        })
    }

    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    fn command(&self, queue: &str, task: &Task, listener: &ListenerId) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env(QUEUE_ENV, queue)
            .env(TASK_ID_ENV, task.id().as_str())
            .env(LISTENER_ID_ENV, listener.to_string());
        // Own process group: a signal to the worker's group leaves the task running.
        #[cfg(unix)]
        command.process_group(0);
        command
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    async fn execute(&self, task: &Task, listener: &ListenerId) -> Result<Execution, RuntimeError> {
        let queue = task
            .queue()
            .ok_or_else(|| crate::error::QueueError::TaskNotFound(task.id().clone()))?;

        let mut child = self.command(queue, task, listener).spawn()?;
        let pid = child.id();
        info!(listener = %listener, task_id = %task.id(), pid = ?pid, "Spawned task process");

        let status = child.wait().await?;
        let execution = Execution::from_status(pid, status);

        if execution.exited_cleanly() {
            debug!(listener = %listener, task_id = %task.id(), "Task process exited");
        } else {
            warn!(
                listener = %listener,
                task_id = %task.id(),
                status = %status,
                "Task process exited abnormally"
            );
        }

        Ok(execution)
    }
}
