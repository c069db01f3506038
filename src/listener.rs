//! Listeners: per-worker identities bound to one queue.
//!
//! A listener registers itself in the queue's listener set when bound, pulls
//! work with [`Listener::listen`], and recovers the in-flight task of dead
//! listeners on the same host with [`Listener::claim_orphan`].
//!
//! # Orphan protocol
//!
//! Liveness can only be probed for local processes, so a listener only ever
//! considers ids from its own host. A candidate whose pid no longer exists is
//! removed from the listener set; the removal count decides which of several
//! scanning listeners wins. Only the winner reclaims the dead listener's
//! reserved task.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::QueueError;
use crate::liveness::ProcessLiveness;
use crate::queue::TaskQueue;
use crate::task::{Task, TaskId};

/// Default pause between polls of an empty queue.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Identity of a listener: `{host}_{pid}`, or `{host}_{pid}.{slot}` when one
/// process runs several listeners.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerId {
    host: String,
    pid: u32,
    slot: Option<u32>,
}

impl ListenerId {
    pub fn new(host: impl Into<String>, pid: u32) -> Self {
        Self {
            host: host.into(),
            pid,
            slot: None,
        }
    }

    /// Identity of this process on this host.
    pub fn local() -> Self {
        Self::new(local_hostname(), std::process::id())
    }

    pub fn with_slot(mut self, slot: u32) -> Self {
        self.slot = Some(slot);
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn slot(&self) -> Option<u32> {
        self.slot
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.host, self.pid)?;
        if let Some(slot) = self.slot {
            write!(f, ".{}", slot)?;
        }
        Ok(())
    }
}

impl FromStr for ListenerId {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || QueueError::InvalidListenerId(s.to_string());

        let (host, rest) = s.rsplit_once('_').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        let (pid, slot) = match rest.split_once('.') {
            Some((pid, slot)) => (pid, Some(slot.parse().map_err(|_| invalid())?)),
            None => (rest, None),
        };

        Ok(Self {
            host: host.to_string(),
            pid: pid.parse().map_err(|_| invalid())?,
            slot,
        })
    }
}

/// Name of this host as reported by `gethostname`, falling back to
/// "localhost". No DNS lookup is made.
pub fn local_hostname() -> String {
    #[cfg(unix)]
    {
        if let Ok(name) = nix::unistd::gethostname() {
            if let Some(name) = name.to_str() {
                if !name.is_empty() {
                    return name.to_string();
                }
            }
        }
    }
    "localhost".to_string()
}

/// What a single orphan candidate turned out to be.
enum Candidate {
    /// On another host, our own process, or not a listener id at all.
    NotProbeable,
    Alive,
    /// Another scanner removed the dead listener first.
    RaceLost,
    /// We removed the dead listener but it held no reserved task.
    NothingReserved,
    Reclaimed(TaskId),
}

/// A worker's registration on one queue.
pub struct Listener {
    id: ListenerId,
    queue: TaskQueue,
    liveness: Arc<dyn ProcessLiveness>,
    poll_interval: Duration,
}

impl Listener {
    /// Registers `id` on `queue`.
    pub async fn bind(
        id: ListenerId,
        queue: TaskQueue,
        liveness: Arc<dyn ProcessLiveness>,
    ) -> Result<Self, QueueError> {
        queue.add_listener(&id.to_string()).await?;
        Ok(Self {
            id,
            queue,
            liveness,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Sets the pause between polls of an empty queue.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn id(&self) -> &ListenerId {
        &self.id
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Waits until a task can be reserved and returns it.
    pub async fn listen(&self) -> Result<Task, QueueError> {
        loop {
            if let Some(task) = self.poll().await? {
                return Ok(task);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// One attempt: promotes due scheduled tasks, then tries to reserve one.
    pub async fn poll(&self) -> Result<Option<Task>, QueueError> {
        self.queue.enqueue_due_tasks().await?;

        match self.queue.dequeue(&self.id.to_string()).await? {
            Some(task_id) => Ok(Some(self.queue.get_task(&task_id).await?)),
            None => Ok(None),
        }
    }

    /// Scans the queue's listeners once for dead local ones and takes over
    /// the first reserved task found. Returns `None` if there was nothing to
    /// claim.
    pub async fn claim_orphan(&self) -> Result<Option<Task>, QueueError> {
        let me = self.id.to_string();

        for candidate in self.queue.get_listeners().await? {
            match self.inspect(&candidate, &me).await? {
                Candidate::Reclaimed(task_id) => {
                    return Ok(Some(self.queue.get_task(&task_id).await?));
                }
                Candidate::RaceLost => {
                    debug!(
                        listener = %me,
                        dead = %candidate,
                        "Another listener claimed orphan first"
                    );
                }
                Candidate::NothingReserved => {
                    debug!(listener = %me, dead = %candidate, "Dead listener had no reserved task");
                }
                Candidate::NotProbeable | Candidate::Alive => {}
            }
        }

        Ok(None)
    }

    async fn inspect(&self, candidate: &str, me: &str) -> Result<Candidate, QueueError> {
        let other = match candidate.parse::<ListenerId>() {
            Ok(other) => other,
            Err(_) => {
                warn!(listener = %me, candidate, "Skipping unparseable listener id");
                return Ok(Candidate::NotProbeable);
            }
        };

        if other.host != self.id.host || other.pid == self.id.pid {
            return Ok(Candidate::NotProbeable);
        }

        if self.liveness.is_alive(other.pid) {
            return Ok(Candidate::Alive);
        }

        info!(listener = %me, dead = %candidate, "Found dead listener");

        if self.queue.remove_listener(candidate).await? == 0 {
            return Ok(Candidate::RaceLost);
        }

        Ok(match self.queue.reclaim_task(candidate, me).await? {
            Some(task_id) => Candidate::Reclaimed(task_id),
            None => Candidate::NothingReserved,
        })
    }

    /// Unregisters the listener on graceful shutdown.
    pub async fn close(self) -> Result<(), QueueError> {
        self.queue.remove_listener(&self.id.to_string()).await?;
        Ok(())
    }
}
