//! The task-process side of an execution.

use std::any::Any;
use std::io::Write;
use std::sync::Arc;

use tracing::{error, info};

use crate::client::Client;
use crate::error::RuntimeError;
use crate::processor::Processor;

use super::executor::Assignment;
use super::handler::TaskHandler;

/// Exit code of a task process whose task reached a terminal state.
pub const EXIT_RECORDED: i32 = 0;
/// Exit code of a task process that could not record an outcome.
pub const EXIT_UNRECORDED: i32 = 1;

/// Starts the assigned task under `pid`, runs the handler, and records the
/// result or error. A panicking handler fails the task with the panic message.
pub async fn execute(
    client: &Client,
    assignment: &Assignment,
    pid: u32,
    handler: Arc<dyn TaskHandler>,
) -> Result<(), RuntimeError> {
    let mut processor = Processor::new(
        client.queue(&assignment.queue),
        assignment.task_id.clone(),
        &assignment.listener_id,
    );

    let parameters = processor.start(pid).await?;
    info!(task_id = %assignment.task_id, pid, "Task started");

    let outcome = tokio::spawn(async move { handler.handle(parameters).await }).await;

    match outcome {
        Ok(Ok(result)) => {
            processor.complete(&result).await?;
            info!(task_id = %assignment.task_id, "Task complete");
        }
        Ok(Err(e)) => {
            processor.fail(&format!("{:#}", e)).await?;
            info!(task_id = %assignment.task_id, error = %e, "Task failed");
        }
        Err(join_err) => {
            let message = if join_err.is_panic() {
                panic_message(join_err.into_panic())
            } else {
                join_err.to_string()
            };
            processor.fail(&message).await?;
            error!(task_id = %assignment.task_id, error = %message, "Task handler panicked");
        }
    }

    Ok(())
}

/// Runs the assignment of this process and returns the exit code to use.
pub(crate) async fn run_assignment(
    client: &Client,
    assignment: Assignment,
    handler: Arc<dyn TaskHandler>,
) -> i32 {
    match execute(client, &assignment, std::process::id(), handler).await {
        Ok(()) => EXIT_RECORDED,
        Err(e) => {
            error!(task_id = %assignment.task_id, error = %e, "Task outcome not recorded");
            EXIT_UNRECORDED
        }
    }
}

/// Flushes buffered output and terminates without running any further
/// cleanup of the worker.
pub(crate) fn exit(code: i32) -> ! {
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
    std::process::exit(code)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => message.to_string(),
            Err(_) => "task handler panicked".to_string(),
        },
    }
}
