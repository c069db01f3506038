//! Entry point tying a store, a clock, and a liveness probe together.

use std::sync::Arc;

use crate::admin::Admin;
use crate::clock::{Clock, SystemClock};
use crate::error::{QueueError, StoreError};
use crate::listener::{Listener, ListenerId};
use crate::liveness::{ProcessLiveness, SignalLiveness};
use crate::processor::Processor;
use crate::queue::TaskQueue;
use crate::store::{RedisStore, Store};
use crate::task::{Task, TaskId};

/// Shared handle for producers, workers, and operators.
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    liveness: Arc<dyn ProcessLiveness>,
}

impl Client {
    /// Connects to Redis with the system clock and signal-based liveness.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let store = RedisStore::connect(redis_url).await?;
        Ok(Self::new(Arc::new(store)))
    }

    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            liveness: Arc::new(SignalLiveness),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_liveness(mut self, liveness: Arc<dyn ProcessLiveness>) -> Self {
        self.liveness = liveness;
        self
    }

    pub fn queue(&self, name: &str) -> TaskQueue {
        TaskQueue::new(name, self.store.clone(), self.clock.clone())
    }

    /// Loads a task by id, from whichever queue it belongs to.
    pub async fn task(&self, task_id: &TaskId) -> Result<Task, QueueError> {
        let attributes = self.store.hgetall(&task_id.record_key()).await?;
        Ok(Task::from_attributes(task_id.clone(), attributes))
    }

    /// Binds this process as a listener on `queue_name`.
    pub async fn listener(&self, queue_name: &str) -> Result<Listener, QueueError> {
        self.listener_with_id(queue_name, ListenerId::local()).await
    }

    pub async fn listener_with_id(
        &self,
        queue_name: &str,
        id: ListenerId,
    ) -> Result<Listener, QueueError> {
        Listener::bind(id, self.queue(queue_name), self.liveness.clone()).await
    }

    /// Builds a processor for a task reserved by `listener_id`.
    ///
    /// Returns `TaskNotFound` when the task record has no queue.
    pub fn processor(&self, task: &Task, listener_id: &str) -> Result<Processor, QueueError> {
        let queue = task
            .queue()
            .ok_or_else(|| QueueError::TaskNotFound(task.id().clone()))?;
        Ok(Processor::new(
            self.queue(queue),
            task.id().clone(),
            listener_id,
        ))
    }

    pub fn admin(&self) -> Admin {
        Admin::new(self.store.clone())
    }

    pub fn liveness(&self) -> &Arc<dyn ProcessLiveness> {
        &self.liveness
    }
}
