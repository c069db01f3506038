//! Task records and their read-only view.
//!
//! A task record is a flat hash of string attributes stored under
//! `relayq:task:{id}`. The queue engine is the only writer; everything else
//! reads a [`Task`] snapshot through [`Task::from_attributes`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::from_epoch_secs;

/// Attribute names used in a task record.
pub(crate) mod field {
    pub const STATUS: &str = "status";
    pub const QUEUE: &str = "queue";
    pub const PARAMETERS: &str = "parameters";
    pub const RESULT: &str = "result";
    pub const ERROR: &str = "error";
    pub const NODE: &str = "node";
    pub const PID: &str = "pid";
    pub const ETA: &str = "eta";
    pub const CREATED: &str = "created";
    pub const UPDATED: &str = "updated";
    pub const RECLAIMED_BY: &str = "reclaimed_by";
}

/// Globally unique task identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Generates a fresh identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key of the task record in the store.
    pub(crate) fn record_key(&self) -> String {
        format!("relayq:task:{}", self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for its eta.
    Scheduled,
    /// Waiting in the FIFO for a listener.
    Pending,
    /// Dequeued by a listener, not yet running.
    Reserved,
    /// Running in a task process.
    Started,
    /// Finished with a result. Terminal.
    Complete,
    /// Finished with an error. Terminal.
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Pending => "pending",
            TaskStatus::Reserved => "reserved",
            TaskStatus::Started => "started",
            TaskStatus::Complete => "complete",
            TaskStatus::Failed => "failed",
        }
    }

    /// Terminal tasks are the only ones that may be deleted.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(TaskStatus::Scheduled),
            "pending" => Ok(TaskStatus::Pending),
            "reserved" => Ok(TaskStatus::Reserved),
            "started" => Ok(TaskStatus::Started),
            "complete" => Ok(TaskStatus::Complete),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// Read-only snapshot of a task record.
///
/// Every accessor returns `None` when the attribute is absent (or
/// unparseable), including for tasks that no longer exist.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    id: TaskId,
    attributes: HashMap<String, String>,
}

impl Task {
    pub fn from_attributes(id: TaskId, attributes: HashMap<String, String>) -> Self {
        Self { id, attributes }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// True when the record had no attributes at all, e.g. after deletion.
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    pub fn status(&self) -> Option<TaskStatus> {
        self.get(field::STATUS).and_then(|s| s.parse().ok())
    }

    pub fn queue(&self) -> Option<&str> {
        self.get(field::QUEUE)
    }

    pub fn parameters(&self) -> Option<&str> {
        self.get(field::PARAMETERS)
    }

    pub fn result(&self) -> Option<&str> {
        self.get(field::RESULT)
    }

    pub fn error(&self) -> Option<&str> {
        self.get(field::ERROR)
    }

    /// Listener that owns the task once reserved.
    pub fn node(&self) -> Option<&str> {
        self.get(field::NODE)
    }

    /// Process running the task once started.
    pub fn pid(&self) -> Option<u32> {
        self.get(field::PID).and_then(|p| p.parse().ok())
    }

    pub fn eta(&self) -> Option<DateTime<Utc>> {
        self.timestamp(field::ETA)
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.timestamp(field::CREATED)
    }

    pub fn updated(&self) -> Option<DateTime<Utc>> {
        self.timestamp(field::UPDATED)
    }

    /// Listener that took the task over from a dead one.
    pub fn reclaimed_by(&self) -> Option<&str> {
        self.get(field::RECLAIMED_BY)
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    fn timestamp(&self, name: &str) -> Option<DateTime<Utc>> {
        self.get(name)
            .and_then(|s| s.parse::<f64>().ok())
            .and_then(from_epoch_secs)
    }
}

/// Serializable rendering of a [`Task`], used by the CLI and admin output.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub status: Option<TaskStatus>,
    pub queue: Option<String>,
    pub parameters: Option<String>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub node: Option<String>,
    pub pid: Option<u32>,
    pub eta: Option<DateTime<Utc>>,
    pub created: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub reclaimed_by: Option<String>,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            status: task.status(),
            queue: task.queue().map(str::to_string),
            parameters: task.parameters().map(str::to_string),
            result: task.result().map(str::to_string),
            error: task.error().map(str::to_string),
            node: task.node().map(str::to_string),
            pid: task.pid(),
            eta: task.eta(),
            created: task.created(),
            updated: task.updated(),
            reclaimed_by: task.reclaimed_by().map(str::to_string),
        }
    }
}
