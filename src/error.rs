//! Error types for relayq operations.
//!
//! Defines one error type per subsystem:
//! - Store access (Redis or the in-memory store)
//! - Queue engine state transitions
//! - Execution runtime supervision

use std::time::Duration;

use thiserror::Error;

use crate::task::{TaskId, TaskStatus};

/// Errors raised by a [`Store`](crate::store::Store) implementation.
///
/// Any of these means the backing store could not be reached or refused the
/// command. The core never retries them.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to connect to the store.
    #[error("Store connection failed: {0}")]
    ConnectionFailed(String),

    /// A Redis command failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Errors that can occur during queue engine operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The operation referenced a task that is not in the store.
    #[error("Task {0} not found")]
    TaskNotFound(TaskId),

    /// The task is not in a status that allows the operation.
    #[error("Cannot {operation} task {task} with status '{}'", status_label(.status))]
    InvalidState {
        task: TaskId,
        status: Option<TaskStatus>,
        operation: &'static str,
    },

    /// The task belongs to a different queue than the one operated on.
    #[error("Cannot {operation} task {task} of queue '{owner}' through queue '{queue}'")]
    WrongQueue {
        task: TaskId,
        owner: String,
        queue: String,
        operation: &'static str,
    },

    /// A listener id could not be parsed into host and pid.
    #[error("Invalid listener id '{0}'")]
    InvalidListenerId(String),

    /// The backing store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors that can occur in the execution runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A queue operation failed.
    #[error("Queue operation failed: {0}")]
    Queue(#[from] QueueError),

    /// The isolated task process could not be spawned or waited on.
    #[error("Failed to run task process: {0}")]
    Spawn(#[from] std::io::Error),

    /// A task process was started without a complete assignment.
    #[error("Task process assignment is missing {0}")]
    MissingAssignment(&'static str),

    /// Slots did not stop within the shutdown timeout.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

fn status_label(status: &Option<TaskStatus>) -> &'static str {
    status.map(|s| s.as_str()).unwrap_or("unset")
}

impl From<StoreError> for RuntimeError {
    fn from(err: StoreError) -> Self {
        RuntimeError::Queue(QueueError::Store(err))
    }
}
