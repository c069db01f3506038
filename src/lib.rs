//! relayq: distributed task queue on Redis.
//!
//! Producers submit opaque parameters to a named queue; workers reserve,
//! execute, and report them, with Redis as the only coordination medium.
//! Each task runs in its own process, and a worker that dies leaves its
//! in-flight task to be reclaimed by a surviving listener on the same host.

pub mod admin;
pub mod cli;
pub mod client;
pub mod clock;
pub mod error;
pub mod listener;
pub mod liveness;
pub mod processor;
pub mod queue;
pub mod runtime;
pub mod store;
pub mod task;

pub use admin::{Admin, QueueAdmin, QueueStats, QueueSummary};
pub use client::Client;
pub use error::{QueueError, RuntimeError, StoreError};
pub use listener::{Listener, ListenerId};
pub use processor::Processor;
pub use queue::TaskQueue;
pub use runtime::{ExecutionRuntime, RuntimeConfig, TaskHandler};
pub use task::{Task, TaskId, TaskStatus, TaskSummary};
