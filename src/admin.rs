//! Read-only inspection of queues and tasks for operators.
//!
//! Nothing here writes to the store.

use std::sync::Arc;

use serde::Serialize;

use crate::error::QueueError;
use crate::queue::{QueueKeys, QUEUES_KEY};
use crate::store::{Read, Store};
use crate::task::{Task, TaskId, TaskStatus};

/// A known queue and how many listeners are bound to it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueSummary {
    pub name: String,
    pub listeners: u64,
}

/// Statistics about queue state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    /// Name of the queue.
    pub queue_name: String,
    /// Tasks waiting for their eta.
    pub scheduled: usize,
    /// Tasks waiting for a listener.
    pub pending: usize,
    /// Tasks reserved by registered listeners.
    pub reserved: usize,
    /// Tasks running in a task process.
    pub started: usize,
    pub complete: usize,
    pub failed: usize,
    /// Registered listener ids.
    pub listeners: Vec<String>,
}

impl QueueStats {
    /// Returns the number of tasks that have not reached a terminal state.
    pub fn in_flight(&self) -> usize {
        self.scheduled + self.pending + self.reserved + self.started
    }

    /// Returns the total number of tasks across all structures.
    pub fn total_tasks(&self) -> usize {
        self.in_flight() + self.complete + self.failed
    }
}

/// Operator view over every queue in a store.
pub struct Admin {
    store: Arc<dyn Store>,
}

impl Admin {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Every queue that has seen a task or a listener.
    pub async fn queues(&self) -> Result<Vec<QueueSummary>, QueueError> {
        let ranked = self.store.zrange_withscores(QUEUES_KEY).await?;
        Ok(ranked
            .into_iter()
            .map(|(name, count)| QueueSummary {
                name,
                listeners: count.max(0.0) as u64,
            })
            .collect())
    }

    pub fn queue(&self, name: &str) -> QueueAdmin {
        QueueAdmin {
            name: name.to_string(),
            keys: QueueKeys::new(name),
            store: self.store.clone(),
        }
    }
}

/// Operator view over a single queue.
pub struct QueueAdmin {
    name: String,
    keys: QueueKeys,
    store: Arc<dyn Store>,
}

impl QueueAdmin {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn listeners(&self) -> Result<Vec<String>, QueueError> {
        Ok(self
            .store
            .read(&Read::SMembers {
                key: self.keys.listeners.clone(),
            })
            .await?)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let listeners = self.listeners().await?;

        Ok(QueueStats {
            queue_name: self.name.clone(),
            scheduled: self.task_ids(TaskStatus::Scheduled).await?.len(),
            pending: self.task_ids(TaskStatus::Pending).await?.len(),
            reserved: self.task_ids(TaskStatus::Reserved).await?.len(),
            started: self.task_ids(TaskStatus::Started).await?.len(),
            complete: self.task_ids(TaskStatus::Complete).await?.len(),
            failed: self.task_ids(TaskStatus::Failed).await?.len(),
            listeners,
        })
    }

    /// Loads every task currently held in the structure for `status`.
    pub async fn tasks(&self, status: TaskStatus) -> Result<Vec<Task>, QueueError> {
        let mut tasks = Vec::new();
        for task_id in self.task_ids(status).await? {
            let attributes = self.store.hgetall(&task_id.record_key()).await?;
            tasks.push(Task::from_attributes(task_id, attributes));
        }
        Ok(tasks)
    }

    async fn task_ids(&self, status: TaskStatus) -> Result<Vec<TaskId>, QueueError> {
        let ids: Vec<String> = match status {
            TaskStatus::Scheduled => {
                self.store
                    .read(&Read::ZRangeByScore {
                        key: self.keys.scheduled.clone(),
                        min: f64::NEG_INFINITY,
                        max: f64::INFINITY,
                    })
                    .await?
            }
            TaskStatus::Pending => self.whole_list(&self.keys.pending).await?,
            TaskStatus::Reserved => {
                let mut ids = Vec::new();
                for listener in self.listeners().await? {
                    ids.extend(self.whole_list(&self.keys.reserved(&listener)).await?);
                }
                ids
            }
            TaskStatus::Started => self
                .store
                .read(&Read::SMembers {
                    key: self.keys.started.clone(),
                })
                .await?
                .into_iter()
                .filter_map(|entry| entry.rsplit(' ').next().map(str::to_string))
                .collect(),
            TaskStatus::Complete => self.whole_list(&self.keys.complete).await?,
            TaskStatus::Failed => self.whole_list(&self.keys.failed).await?,
        };
        Ok(ids.into_iter().map(TaskId::from).collect())
    }

    async fn whole_list(&self, key: &str) -> Result<Vec<String>, QueueError> {
        Ok(self
            .store
            .read(&Read::LRange {
                key: key.to_string(),
                start: 0,
                stop: -1,
            })
            .await?)
    }
}
