//! Integration tests for the execution runtime, with tasks run in-process.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use relayq::listener::local_hostname;
use relayq::runtime::{self, Assignment, Execution, Executor, TaskHandler};
use relayq::{Client, ExecutionRuntime, ListenerId, RuntimeConfig, RuntimeError, Task, TaskStatus};

use common::client_at;

/// Runs the task-process side directly instead of spawning a process.
struct InlineExecutor {
    client: Client,
    handler: Arc<dyn TaskHandler>,
    next_pid: AtomicU32,
}

impl InlineExecutor {
    fn new(client: Client, handler: impl TaskHandler) -> Self {
        Self {
            client,
            handler: Arc::new(handler),
            next_pid: AtomicU32::new(50_000),
        }
    }
}

#[async_trait]
impl Executor for InlineExecutor {
    async fn execute(&self, task: &Task, listener: &ListenerId) -> Result<Execution, RuntimeError> {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let assignment = Assignment {
            queue: task.queue().unwrap_or_default().to_string(),
            task_id: task.id().clone(),
            listener_id: listener.to_string(),
        };
        runtime::execute(&self.client, &assignment, pid, self.handler.clone()).await?;
        Ok(Execution {
            pid: Some(pid),
            exit_code: Some(0),
        })
    }
}

fn fast_config(concurrency: usize) -> RuntimeConfig {
    RuntimeConfig::new("Q")
        .with_concurrency(concurrency)
        .with_poll_interval(Duration::from_millis(5))
        .with_supervise_interval(Duration::from_millis(5))
        .with_orphan_retry_interval(Duration::from_millis(5))
        .with_shutdown_timeout(Duration::from_secs(5))
}

fn echo_upper(parameters: &str) -> anyhow::Result<String> {
    if parameters == "explode" {
        anyhow::bail!("cannot handle {}", parameters);
    }
    Ok(parameters.to_uppercase())
}

/// Resolves once `count` tasks in queue "Q" have reached a terminal state.
async fn finished(client: Client, count: usize) {
    loop {
        let stats = client.admin().queue("Q").stats().await.unwrap();
        if stats.complete + stats.failed >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_runtime_executes_pending_tasks() {
    let (client, _, _) = client_at(1000);
    let queue = client.queue("Q");
    let ids = [
        queue.enqueue("a").await.unwrap(),
        queue.enqueue("b").await.unwrap(),
        queue.enqueue("explode").await.unwrap(),
    ];

    let executor = InlineExecutor::new(client.clone(), echo_upper);
    let runtime = ExecutionRuntime::new(fast_config(2), client.clone(), Arc::new(executor));

    tokio::time::timeout(
        Duration::from_secs(10),
        runtime.run_until(finished(client.clone(), 3)),
    )
    .await
    .expect("runtime did not finish")
    .unwrap();

    let a = client.task(&ids[0]).await.unwrap();
    assert_eq!(a.status(), Some(TaskStatus::Complete));
    assert_eq!(a.result(), Some("A"));

    let exploded = client.task(&ids[2]).await.unwrap();
    assert_eq!(exploded.status(), Some(TaskStatus::Failed));
    assert_eq!(exploded.error(), Some("cannot handle explode"));

    let stats = runtime.stats();
    assert_eq!(stats.tasks_executed, 3);
    assert_eq!(stats.abnormal_exits, 0);

    // Graceful shutdown unregisters every slot.
    assert!(queue.get_listeners().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_runtime_runs_reserved_orphan_first() {
    let (client, _, liveness) = client_at(1000);
    let queue = client.queue("Q");

    let dead_pid = 4_300_000;
    let dead = client
        .listener_with_id("Q", ListenerId::new(local_hostname(), dead_pid))
        .await
        .unwrap();
    let orphan_id = queue.enqueue("orphan").await.unwrap();
    dead.poll().await.unwrap().unwrap();
    liveness.kill(dead_pid);

    let executor = InlineExecutor::new(client.clone(), echo_upper);
    let runtime = ExecutionRuntime::new(fast_config(1), client.clone(), Arc::new(executor));

    tokio::time::timeout(
        Duration::from_secs(10),
        runtime.run_until(finished(client.clone(), 1)),
    )
    .await
    .expect("runtime did not finish")
    .unwrap();

    let task = client.task(&orphan_id).await.unwrap();
    assert_eq!(task.status(), Some(TaskStatus::Complete));
    assert_eq!(task.result(), Some("ORPHAN"));
    let slot_listener = ListenerId::local().with_slot(0).to_string();
    assert_eq!(task.reclaimed_by(), Some(slot_listener.as_str()));

    let stats = runtime.stats();
    assert_eq!(stats.orphans_reclaimed, 1);
    assert_eq!(stats.tasks_executed, 1);
}

#[tokio::test]
async fn test_runtime_waits_for_started_orphan_without_rerunning() {
    let (client, _, liveness) = client_at(1000);
    let queue = client.queue("Q");

    let dead_pid = 4_400_000;
    let task_pid = 4_400_001;
    let dead = ListenerId::new(local_hostname(), dead_pid);
    let listener = client.listener_with_id("Q", dead.clone()).await.unwrap();
    let orphan_id = queue.enqueue("side effects").await.unwrap();
    listener.poll().await.unwrap().unwrap();
    queue.start(&orphan_id, &dead.to_string(), task_pid).await.unwrap();

    liveness.kill(dead_pid);
    liveness.dies_after(task_pid, 3);

    let executor = InlineExecutor::new(client.clone(), echo_upper);
    let runtime = ExecutionRuntime::new(fast_config(1), client.clone(), Arc::new(executor));

    let probed_until_dead = async {
        while runtime.stats().orphans_awaited == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };

    tokio::time::timeout(Duration::from_secs(10), runtime.run_until(probed_until_dead))
        .await
        .expect("runtime did not finish")
        .unwrap();

    assert_eq!(liveness.probes_of(task_pid), 4);
    let stats = runtime.stats();
    assert_eq!(stats.orphans_reclaimed, 1);
    assert_eq!(stats.tasks_executed, 0);

    let task = client.task(&orphan_id).await.unwrap();
    assert_eq!(task.status(), Some(TaskStatus::Started));
    assert_eq!(task.pid(), Some(task_pid));
}

/// Fails on the first call, then behaves.
struct FlakyExecutor {
    inner: InlineExecutor,
    calls: AtomicU32,
}

#[async_trait]
impl Executor for FlakyExecutor {
    async fn execute(&self, task: &Task, listener: &ListenerId) -> Result<Execution, RuntimeError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(RuntimeError::Spawn(std::io::Error::new(
                std::io::ErrorKind::Other,
                "fork failed",
            )));
        }
        self.inner.execute(task, listener).await
    }
}

#[tokio::test]
async fn test_failed_slot_is_restarted_and_resumes_its_task() {
    let (client, _, _) = client_at(1000);
    let queue = client.queue("Q");
    let task_id = queue.enqueue("retry me").await.unwrap();

    let executor = FlakyExecutor {
        inner: InlineExecutor::new(client.clone(), echo_upper),
        calls: AtomicU32::new(0),
    };
    let runtime = ExecutionRuntime::new(fast_config(1), client.clone(), Arc::new(executor));

    tokio::time::timeout(
        Duration::from_secs(10),
        runtime.run_until(finished(client.clone(), 1)),
    )
    .await
    .expect("runtime did not finish")
    .unwrap();

    let task = client.task(&task_id).await.unwrap();
    assert_eq!(task.status(), Some(TaskStatus::Complete));
    assert_eq!(task.result(), Some("RETRY ME"));
    assert!(runtime.stats().slot_restarts >= 1);
}

/// Starts the first task and then loses its process, fails to spawn the
/// second, and behaves afterwards.
struct CrashingExecutor {
    inner: InlineExecutor,
    calls: AtomicU32,
}

#[async_trait]
impl Executor for CrashingExecutor {
    async fn execute(&self, task: &Task, listener: &ListenerId) -> Result<Execution, RuntimeError> {
        match self.calls.fetch_add(1, Ordering::SeqCst) {
            0 => {
                let queue = self.inner.client.queue(task.queue().unwrap_or_default());
                queue.start(task.id(), &listener.to_string(), 61_000).await?;
                Ok(Execution {
                    pid: Some(61_000),
                    exit_code: None,
                })
            }
            1 => Err(RuntimeError::Spawn(std::io::Error::new(
                std::io::ErrorKind::Other,
                "fork failed",
            ))),
            _ => self.inner.execute(task, listener).await,
        }
    }
}

#[tokio::test]
async fn test_restarted_slot_resumes_reserved_task_behind_a_started_one() {
    let (client, _, _) = client_at(1000);
    let queue = client.queue("Q");
    let killed = queue.enqueue("killed").await.unwrap();
    let interrupted = queue.enqueue("interrupted").await.unwrap();

    let executor = CrashingExecutor {
        inner: InlineExecutor::new(client.clone(), echo_upper),
        calls: AtomicU32::new(0),
    };
    let runtime = ExecutionRuntime::new(fast_config(1), client.clone(), Arc::new(executor));

    tokio::time::timeout(
        Duration::from_secs(10),
        runtime.run_until(finished(client.clone(), 1)),
    )
    .await
    .expect("runtime did not finish")
    .unwrap();

    let task = client.task(&interrupted).await.unwrap();
    assert_eq!(task.status(), Some(TaskStatus::Complete));
    assert_eq!(task.result(), Some("INTERRUPTED"));

    // The lost process is not re-run by its own slot.
    let task = client.task(&killed).await.unwrap();
    assert_eq!(task.status(), Some(TaskStatus::Started));
    assert_eq!(task.pid(), Some(61_000));

    let stats = runtime.stats();
    assert!(stats.slot_restarts >= 1);
    assert_eq!(stats.abnormal_exits, 1);
    assert_eq!(stats.tasks_executed, 2);
}
