//! Queue engine: the task state machine and its atomic store operations.
//!
//! # Key layout
//!
//! For a queue named `{q}`:
//!
//! - `relayq:{q}:pending`: FIFO list, producers LPUSH, listeners RPOPLPUSH
//! - `relayq:{q}:reserved:{listener}`: tasks a listener has dequeued
//! - `relayq:{q}:scheduled`: sorted set of task ids scored by eta
//! - `relayq:{q}:started`: set of `"{listener} {pid} {task}"` entries
//! - `relayq:{q}:listeners`: set of live listener ids
//! - `relayq:{q}:complete` / `relayq:{q}:failed`: terminal histories
//!
//! plus `relayq:queues`, a sorted set of queue names scored by listener count,
//! and one `relayq:task:{id}` hash per task.
//!
//! # State machine
//!
//! ```text
//! scheduled --(eta)--> pending --dequeue--> reserved --start--> started --+--complete--> complete
//!                                                                        +--fail------> failed
//! ```
//!
//! Every transition is one transaction against the store. Transitions that
//! depend on the current status run as watched transactions, so a concurrent
//! writer makes them retry instead of interleaving.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::clock::{to_epoch_secs, Clock};
use crate::error::QueueError;
use crate::store::{Op, Read, Store};
use crate::task::{field, Task, TaskId, TaskStatus};

/// Sorted set of every known queue, scored by listener count.
pub(crate) const QUEUES_KEY: &str = "relayq:queues";

/// Store keys for one queue.
#[derive(Debug, Clone)]
pub(crate) struct QueueKeys {
    pub pending: String,
    pub scheduled: String,
    pub started: String,
    pub listeners: String,
    pub complete: String,
    pub failed: String,
    reserved_prefix: String,
}

impl QueueKeys {
    pub fn new(queue_name: &str) -> Self {
        let base = format!("relayq:{}", queue_name);
        Self {
            pending: format!("{}:pending", base),
            scheduled: format!("{}:scheduled", base),
            started: format!("{}:started", base),
            listeners: format!("{}:listeners", base),
            complete: format!("{}:complete", base),
            failed: format!("{}:failed", base),
            reserved_prefix: format!("{}:reserved:", base),
        }
    }

    pub fn reserved(&self, listener_id: &str) -> String {
        format!("{}{}", self.reserved_prefix, listener_id)
    }

    fn history(&self, status: TaskStatus) -> Option<&str> {
        match status {
            TaskStatus::Complete => Some(&self.complete),
            TaskStatus::Failed => Some(&self.failed),
            _ => None,
        }
    }
}

/// Entry recorded in the started set while a task process runs.
fn running_job(listener_id: &str, pid: u32, task_id: &TaskId) -> String {
    format!("{} {} {}", listener_id, pid, task_id)
}

fn stamp(now: DateTime<Utc>) -> String {
    to_epoch_secs(now).to_string()
}

fn fields(pairs: &[(&str, String)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

fn observed_status(observed: &[String]) -> Option<TaskStatus> {
    observed.first().and_then(|s| s.parse().ok())
}

/// A named queue on a shared store.
#[derive(Clone)]
pub struct TaskQueue {
    name: String,
    keys: QueueKeys,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl TaskQueue {
    pub fn new(name: impl Into<String>, store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        let name = name.into();
        Self {
            keys: QueueKeys::new(&name),
            name,
            store,
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a task to the tail of the pending FIFO.
    pub async fn enqueue(&self, parameters: &str) -> Result<TaskId, QueueError> {
        let task_id = TaskId::generate();
        let now = stamp(self.clock.now());

        info!(queue = %self.name, task_id = %task_id, parameters, "Adding task");

        self.store
            .exec(vec![
                Op::HSet {
                    key: task_id.record_key(),
                    fields: fields(&[
                        (field::STATUS, TaskStatus::Pending.to_string()),
                        (field::QUEUE, self.name.clone()),
                        (field::PARAMETERS, parameters.to_string()),
                        (field::CREATED, now.clone()),
                        (field::UPDATED, now),
                    ]),
                },
                self.register_queue(),
                Op::LPush {
                    key: self.keys.pending.clone(),
                    value: task_id.to_string(),
                },
            ])
            .await?;

        Ok(task_id)
    }

    /// Adds a task that becomes pending at `eta`. An eta that has already
    /// passed is the same as [`enqueue`](Self::enqueue).
    pub async fn schedule(
        &self,
        parameters: &str,
        eta: DateTime<Utc>,
    ) -> Result<TaskId, QueueError> {
        let now = self.clock.now();
        if eta <= now {
            return self.enqueue(parameters).await;
        }

        let task_id = TaskId::generate();
        let eta_secs = to_epoch_secs(eta);
        let now = stamp(now);

        info!(queue = %self.name, task_id = %task_id, eta = %eta, parameters, "Scheduling task");

        self.store
            .exec(vec![
                Op::HSet {
                    key: task_id.record_key(),
                    fields: fields(&[
                        (field::STATUS, TaskStatus::Scheduled.to_string()),
                        (field::QUEUE, self.name.clone()),
                        (field::PARAMETERS, parameters.to_string()),
                        (field::ETA, eta_secs.to_string()),
                        (field::CREATED, now.clone()),
                        (field::UPDATED, now),
                    ]),
                },
                self.register_queue(),
                Op::ZAdd {
                    key: self.keys.scheduled.clone(),
                    member: task_id.to_string(),
                    score: eta_secs,
                },
            ])
            .await?;

        Ok(task_id)
    }

    /// Moves every scheduled task whose eta has passed onto the pending FIFO,
    /// in eta order. Returns how many were promoted.
    pub async fn enqueue_due_tasks(&self) -> Result<usize, QueueError> {
        let now = self.clock.now();
        let now_secs = to_epoch_secs(now);
        let updated = stamp(now);

        let read = Read::ZRangeByScore {
            key: self.keys.scheduled.clone(),
            min: f64::NEG_INFINITY,
            max: now_secs,
        };

        let committed = self
            .store
            .watch_exec(&[self.keys.scheduled.clone()], &read, &|due| {
                if due.is_empty() {
                    return Vec::new();
                }

                let mut ops = vec![Op::ZRemRangeByScore {
                    key: self.keys.scheduled.clone(),
                    min: f64::NEG_INFINITY,
                    max: now_secs,
                }];
                for task_id in due {
                    let key = TaskId::from(task_id.as_str()).record_key();
                    ops.push(Op::LPush {
                        key: self.keys.pending.clone(),
                        value: task_id.clone(),
                    });
                    ops.push(Op::HSet {
                        key: key.clone(),
                        fields: fields(&[
                            (field::STATUS, TaskStatus::Pending.to_string()),
                            (field::UPDATED, updated.clone()),
                        ]),
                    });
                    ops.push(Op::HDel {
                        key,
                        fields: vec![field::ETA.to_string()],
                    });
                }
                ops
            })
            .await?;

        let promoted = committed.observed.len();
        if promoted > 0 {
            info!(queue = %self.name, promoted, "Promoted due tasks");
        }
        Ok(promoted)
    }

    /// Reserves the oldest pending task for `listener_id`. Returns `None`
    /// when nothing is pending.
    pub async fn dequeue(&self, listener_id: &str) -> Result<Option<TaskId>, QueueError> {
        debug!(queue = %self.name, listener = listener_id, "Reserving task");

        let reserved = self.keys.reserved(listener_id);
        let updated = stamp(self.clock.now());
        let read = Read::LRange {
            key: self.keys.pending.clone(),
            start: -1,
            stop: -1,
        };

        let committed = self
            .store
            .watch_exec(&[self.keys.pending.clone()], &read, &|head| {
                let Some(task_id) = head.first() else {
                    return Vec::new();
                };
                vec![
                    Op::RPopLPush {
                        src: self.keys.pending.clone(),
                        dst: reserved.clone(),
                    },
                    Op::HSet {
                        key: TaskId::from(task_id.as_str()).record_key(),
                        fields: fields(&[
                            (field::STATUS, TaskStatus::Reserved.to_string()),
                            (field::NODE, listener_id.to_string()),
                            (field::UPDATED, updated.clone()),
                        ]),
                    },
                ]
            })
            .await?;

        let task_id = committed.observed.into_iter().next().map(TaskId::from);
        if let Some(ref id) = task_id {
            info!(queue = %self.name, listener = listener_id, task_id = %id, "Reserved task");
        }
        Ok(task_id)
    }

    /// Registers a listener. Returns whether it was newly added; the
    /// listener count only moves on first insertion.
    pub async fn add_listener(&self, listener_id: &str) -> Result<bool, QueueError> {
        info!(queue = %self.name, listener = listener_id, "Adding listener");

        let read = Read::SIsMember {
            key: self.keys.listeners.clone(),
            member: listener_id.to_string(),
        };
        let committed = self
            .store
            .watch_exec(&[self.keys.listeners.clone()], &read, &|present| {
                if !present.is_empty() {
                    return Vec::new();
                }
                vec![
                    Op::SAdd {
                        key: self.keys.listeners.clone(),
                        member: listener_id.to_string(),
                    },
                    self.listener_count_delta(1.0),
                ]
            })
            .await?;

        Ok(committed.replies.first() == Some(&1))
    }

    /// Unregisters a listener. Of any number of concurrent calls for the same
    /// id, exactly one returns 1; the others return 0.
    pub async fn remove_listener(&self, listener_id: &str) -> Result<u64, QueueError> {
        info!(queue = %self.name, listener = listener_id, "Removing listener");

        let read = Read::SIsMember {
            key: self.keys.listeners.clone(),
            member: listener_id.to_string(),
        };
        let committed = self
            .store
            .watch_exec(&[self.keys.listeners.clone()], &read, &|present| {
                if present.is_empty() {
                    return Vec::new();
                }
                vec![
                    Op::SRem {
                        key: self.keys.listeners.clone(),
                        member: listener_id.to_string(),
                    },
                    self.listener_count_delta(-1.0),
                ]
            })
            .await?;

        Ok(committed.replies.first().copied().unwrap_or(0).max(0) as u64)
    }

    /// Snapshot of the registered listener ids.
    pub async fn get_listeners(&self) -> Result<Vec<String>, QueueError> {
        let listeners = self
            .store
            .read(&Read::SMembers {
                key: self.keys.listeners.clone(),
            })
            .await?;
        Ok(listeners)
    }

    /// Every task still held in `listener_id`'s reserved list, oldest first.
    pub async fn reserved_tasks(&self, listener_id: &str) -> Result<Vec<TaskId>, QueueError> {
        let reserved = self
            .store
            .read(&Read::LRange {
                key: self.keys.reserved(listener_id),
                start: 0,
                stop: -1,
            })
            .await?;
        Ok(reserved.into_iter().rev().map(TaskId::from).collect())
    }

    /// Marks the oldest task reserved by `old_listener` as reclaimed by
    /// `new_listener` and returns it. The task stays in the old reserved
    /// list, which is abandoned rather than merged.
    pub async fn reclaim_task(
        &self,
        old_listener: &str,
        new_listener: &str,
    ) -> Result<Option<TaskId>, QueueError> {
        let reserved = self.keys.reserved(old_listener);
        let updated = stamp(self.clock.now());
        let read = Read::LRange {
            key: reserved.clone(),
            start: -1,
            stop: -1,
        };

        let committed = self
            .store
            .watch_exec(&[reserved.clone()], &read, &|head| {
                let Some(task_id) = head.first() else {
                    return Vec::new();
                };
                vec![Op::HSet {
                    key: TaskId::from(task_id.as_str()).record_key(),
                    fields: fields(&[
                        (field::RECLAIMED_BY, new_listener.to_string()),
                        (field::UPDATED, updated.clone()),
                    ]),
                }]
            })
            .await?;

        let task_id = committed.observed.into_iter().next().map(TaskId::from);
        match task_id {
            Some(ref id) => info!(
                queue = %self.name,
                task_id = %id,
                from = old_listener,
                to = new_listener,
                "Reclaimed task"
            ),
            None => debug!(queue = %self.name, from = old_listener, "No reserved task to reclaim"),
        }
        Ok(task_id)
    }

    /// Marks a reserved task as running in process `pid` and returns its
    /// parameters.
    pub async fn start(
        &self,
        task_id: &TaskId,
        listener_id: &str,
        pid: u32,
    ) -> Result<String, QueueError> {
        info!(queue = %self.name, task_id = %task_id, listener = listener_id, pid, "Starting task");

        let updated = stamp(self.clock.now());
        self.transition(task_id, TaskStatus::Reserved, "start", || {
            vec![
                Op::SAdd {
                    key: self.keys.started.clone(),
                    member: running_job(listener_id, pid, task_id),
                },
                Op::HSet {
                    key: task_id.record_key(),
                    fields: fields(&[
                        (field::STATUS, TaskStatus::Started.to_string()),
                        (field::NODE, listener_id.to_string()),
                        (field::PID, pid.to_string()),
                        (field::UPDATED, updated.clone()),
                    ]),
                },
            ]
        })
        .await?;

        let task = self.get_task(task_id).await?;
        let parameters = task.parameters().unwrap_or_default().to_string();
        debug!(queue = %self.name, task_id = %task_id, parameters = %parameters, "Task parameters");
        Ok(parameters)
    }

    /// Records a successful result for a started task.
    pub async fn complete(
        &self,
        task_id: &TaskId,
        listener_id: &str,
        pid: u32,
        result: &str,
    ) -> Result<(), QueueError> {
        info!(
            queue = %self.name,
            task_id = %task_id,
            listener = listener_id,
            pid,
            result,
            "Completing task"
        );
        self.finish(task_id, listener_id, pid, TaskStatus::Complete, field::RESULT, result)
            .await
    }

    /// Records an error for a started task.
    pub async fn fail(
        &self,
        task_id: &TaskId,
        listener_id: &str,
        pid: u32,
        error: &str,
    ) -> Result<(), QueueError> {
        info!(
            queue = %self.name,
            task_id = %task_id,
            listener = listener_id,
            pid,
            error,
            "Failed task"
        );
        self.finish(task_id, listener_id, pid, TaskStatus::Failed, field::ERROR, error)
            .await
    }

    /// Deletes a terminal task and its history entry. `status` must be the
    /// task's current status and must be `complete` or `failed`.
    pub async fn delete_task(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
    ) -> Result<(), QueueError> {
        let Some(history) = self.keys.history(status).map(str::to_string) else {
            return Err(QueueError::InvalidState {
                task: task_id.clone(),
                status: Some(status),
                operation: "delete",
            });
        };

        info!(queue = %self.name, task_id = %task_id, status = %status, "Deleting task");

        self.transition(task_id, status, "delete", || {
            vec![
                Op::Del {
                    key: task_id.record_key(),
                },
                Op::LRem {
                    key: history.clone(),
                    count: 1,
                    value: task_id.to_string(),
                },
            ]
        })
        .await
    }

    /// Loads the current view of a task. Missing tasks yield an empty view.
    pub async fn get_task(&self, task_id: &TaskId) -> Result<Task, QueueError> {
        let attributes = self.store.hgetall(&task_id.record_key()).await?;
        Ok(Task::from_attributes(task_id.clone(), attributes))
    }

    async fn finish(
        &self,
        task_id: &TaskId,
        listener_id: &str,
        pid: u32,
        status: TaskStatus,
        outcome_field: &str,
        outcome: &str,
    ) -> Result<(), QueueError> {
        let updated = stamp(self.clock.now());
        let history = self.keys.history(status).unwrap_or_default().to_string();
        let operation = if status == TaskStatus::Complete {
            "complete"
        } else {
            "fail"
        };

        self.transition(task_id, TaskStatus::Started, operation, || {
            vec![
                Op::LRem {
                    key: self.keys.reserved(listener_id),
                    count: 1,
                    value: task_id.to_string(),
                },
                Op::SRem {
                    key: self.keys.started.clone(),
                    member: running_job(listener_id, pid, task_id),
                },
                Op::HSet {
                    key: task_id.record_key(),
                    fields: fields(&[
                        (field::STATUS, status.to_string()),
                        (outcome_field, outcome.to_string()),
                        (field::UPDATED, updated.clone()),
                    ]),
                },
                Op::LPush {
                    key: history.clone(),
                    value: task_id.to_string(),
                },
            ]
        })
        .await
    }

    /// Applies `ops` only if the task exists and currently has status
    /// `expected`, watching the task record.
    async fn transition<F>(
        &self,
        task_id: &TaskId,
        expected: TaskStatus,
        operation: &'static str,
        ops: F,
    ) -> Result<(), QueueError>
    where
        F: Fn() -> Vec<Op> + Send + Sync,
    {
        let key = task_id.record_key();
        let read = Read::HMGet {
            key: key.clone(),
            fields: vec![field::STATUS.to_string(), field::QUEUE.to_string()],
        };

        let committed = self
            .store
            .watch_exec(&[key], &read, &|observed| {
                if observed_status(observed) == Some(expected) && self.owns(observed) {
                    ops()
                } else {
                    Vec::new()
                }
            })
            .await?;

        let observed = &committed.observed;
        if observed.is_empty() {
            return Err(QueueError::TaskNotFound(task_id.clone()));
        }
        if !self.owns(observed) {
            return Err(QueueError::WrongQueue {
                task: task_id.clone(),
                owner: observed.get(1).cloned().unwrap_or_default(),
                queue: self.name.clone(),
                operation,
            });
        }
        let status = observed_status(observed);
        if status != Some(expected) {
            return Err(QueueError::InvalidState {
                task: task_id.clone(),
                status,
                operation,
            });
        }
        Ok(())
    }

    /// Whether a `[status, queue]` read names this queue.
    fn owns(&self, observed: &[String]) -> bool {
        observed.get(1).is_some_and(|queue| *queue == self.name)
    }

    fn register_queue(&self) -> Op {
        self.listener_count_delta(0.0)
    }

    fn listener_count_delta(&self, delta: f64) -> Op {
        Op::ZIncrBy {
            key: QUEUES_KEY.to_string(),
            member: self.name.clone(),
            delta,
        }
    }
}
