//! Drives one task through start and its terminal transition.

use crate::error::QueueError;
use crate::queue::TaskQueue;
use crate::task::TaskId;

/// Bound to one (task, listener) pair; the pid is fixed by [`start`](Self::start).
///
/// There is no retry logic here: the caller decides what counts as failure.
pub struct Processor {
    queue: TaskQueue,
    task_id: TaskId,
    listener_id: String,
    pid: Option<u32>,
}

impl Processor {
    pub fn new(queue: TaskQueue, task_id: TaskId, listener_id: impl Into<String>) -> Self {
        Self {
            queue,
            task_id,
            listener_id: listener_id.into(),
            pid: None,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Marks the task started by `pid` and returns its parameters.
    pub async fn start(&mut self, pid: u32) -> Result<String, QueueError> {
        let parameters = self.queue.start(&self.task_id, &self.listener_id, pid).await?;
        self.pid = Some(pid);
        Ok(parameters)
    }

    pub async fn complete(&self, result: &str) -> Result<(), QueueError> {
        let pid = self.started_pid("complete")?;
        self.queue
            .complete(&self.task_id, &self.listener_id, pid, result)
            .await
    }

    pub async fn fail(&self, error: &str) -> Result<(), QueueError> {
        let pid = self.started_pid("fail")?;
        self.queue
            .fail(&self.task_id, &self.listener_id, pid, error)
            .await
    }

    fn started_pid(&self, operation: &'static str) -> Result<u32, QueueError> {
        self.pid.ok_or_else(|| QueueError::InvalidState {
            task: self.task_id.clone(),
            status: None,
            operation,
        })
    }
}
