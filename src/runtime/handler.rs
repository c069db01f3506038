//! User task callbacks.

use std::ffi::OsString;
use std::process::Stdio;

use anyhow::{bail, Context};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::executor::ASSIGNMENT_VARS;

/// Environment variable carrying the task parameters to external commands.
pub const PARAMETERS_ENV: &str = "RELAYQ_PARAMETERS";

/// Code run for each task, inside the isolated task process.
///
/// The returned string becomes the task result. Any error, and any panic,
/// fails the task with the error's message.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, parameters: String) -> anyhow::Result<String>;
}

#[async_trait]
impl<F> TaskHandler for F
where
    F: Fn(&str) -> anyhow::Result<String> + Send + Sync + 'static,
{
    async fn handle(&self, parameters: String) -> anyhow::Result<String> {
        self(&parameters)
    }
}

/// Runs an external program per task.
///
/// The parameters are written to the program's stdin and exported as
/// `RELAYQ_PARAMETERS`. Trimmed stdout is the result; a non-zero exit fails
/// the task with stderr.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    program: OsString,
    args: Vec<OsString>,
}

impl CommandHandler {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

#[async_trait]
impl TaskHandler for CommandHandler {
    async fn handle(&self, parameters: String) -> anyhow::Result<String> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env(PARAMETERS_ENV, &parameters)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for var in ASSIGNMENT_VARS {
            command.env_remove(var);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn {:?}", self.program))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A program that never reads stdin closes the pipe early.
            if let Err(e) = stdin.write_all(parameters.as_bytes()).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(e).context("failed to write parameters to stdin");
                }
            }
        }

        let output = child
            .wait_with_output()
            .await
            .context("failed to wait for command")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("command exited with {}: {}", output.status, stderr.trim());
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_closure_handler() {
        let handler = |parameters: &str| -> anyhow::Result<String> {
            Ok(parameters.to_uppercase())
        };

        let result = handler.handle("abc".to_string()).await.unwrap();
        assert_eq!(result, "ABC");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_handler_reads_stdin() {
        let handler = CommandHandler::new("sh").with_args(["-c", "tr a-z A-Z"]);

        let result = handler.handle("hello".to_string()).await.unwrap();
        assert_eq!(result, "HELLO");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_handler_exports_parameters() {
        let handler =
            CommandHandler::new("sh").with_args(["-c", "printf %s \"$RELAYQ_PARAMETERS\""]);

        let result = handler.handle("from env".to_string()).await.unwrap();
        assert_eq!(result, "from env");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_handler_fails_on_nonzero_exit() {
        let handler = CommandHandler::new("sh").with_args(["-c", "echo broken >&2; exit 3"]);

        let err = handler.handle(String::new()).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("broken"), "unexpected error: {message}");
    }
}
