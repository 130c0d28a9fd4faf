use std::{process::ExitStatus, sync::Arc};

use futures_util::{FutureExt, future::BoxFuture};
use syspulse_proto::msg::ControlAction;
use tokio::process::Command;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("no command configured for {0}")]
    EmptyCommand(ControlAction),
    #[error("failed to run `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{action} command exited with {status}: {stderr}")]
    Failed {
        action: ControlAction,
        status: ExitStatus,
        stderr: String,
    },
    #[error("{0} command was aborted")]
    Aborted(ControlAction),
}

/// Issues privileged host operations.
pub trait ControlExecutor: std::fmt::Debug + Send + Sync {
    fn execute(&self, action: ControlAction) -> BoxFuture<'static, Result<Ack, ExecError>>;
}

/// Runs a configured argv per action, each on its own task.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    restart: Arc<[String]>,
    shutdown: Arc<[String]>,
}

impl CommandExecutor {
    pub fn new(restart: Vec<String>, shutdown: Vec<String>) -> Self {
        Self {
            restart: restart.into(),
            shutdown: shutdown.into(),
        }
    }

    fn argv(&self, action: ControlAction) -> Arc<[String]> {
        match action {
            ControlAction::Restart => self.restart.clone(),
            ControlAction::Shutdown => self.shutdown.clone(),
        }
    }
}

impl ControlExecutor for CommandExecutor {
    fn execute(&self, action: ControlAction) -> BoxFuture<'static, Result<Ack, ExecError>> {
        let argv = self.argv(action);
        // off the caller's task so a hung command cannot stall anything else
        let task = tokio::spawn(run(action, argv));
        async move { task.await.map_err(|_| ExecError::Aborted(action))? }.boxed()
    }
}

async fn run(action: ControlAction, argv: Arc<[String]>) -> Result<Ack, ExecError> {
    let (program, args) = argv.split_first().ok_or(ExecError::EmptyCommand(action))?;
    info!(%action, %program, ?args, "executing control action");

    let output = Command::new(program)
        .args(args)
        .kill_on_drop(false)
        .output()
        .await
        .map_err(|source| ExecError::Spawn {
            program: program.clone(),
            source,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        warn!(%action, status = %output.status, %stderr, "control action failed");
        return Err(ExecError::Failed {
            action,
            status: output.status,
            stderr,
        });
    }

    Ok(Ack {
        message: ack_message(action).to_owned(),
    })
}

pub fn ack_message(action: ControlAction) -> &'static str {
    match action {
        ControlAction::Restart => "System is restarting...",
        ControlAction::Shutdown => "System is shutting down...",
    }
}


#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn argv(cmd: &[&str]) -> Vec<String> {
        cmd.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_successful_command_acks() {
        let executor = CommandExecutor::new(argv(&["true"]), argv(&["true"]));

        let ack = executor.execute(ControlAction::Restart).await.unwrap();
        assert_eq!(ack.message, "System is restarting...");
        let ack = executor.execute(ControlAction::Shutdown).await.unwrap();
        assert_eq!(ack.message, "System is shutting down...");
    }

    #[tokio::test]
    async fn test_runs_the_command_for_the_action() {
        let executor = CommandExecutor::new(
            argv(&["sh", "-c", "exit 0"]),
            argv(&["sh", "-c", "echo 'must be root' >&2; exit 3"]),
        );

        assert!(executor.execute(ControlAction::Restart).await.is_ok());
        let err = executor
            .execute(ControlAction::Shutdown)
            .await
            .unwrap_err();
        match err {
            ExecError::Failed {
                action,
                status,
                ref stderr,
            } => {
                assert_eq!(action, ControlAction::Shutdown);
                assert_eq!(status.code(), Some(3));
                assert_eq!(stderr, "must be root");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let executor = CommandExecutor::new(argv(&["/nonexistent/syspulse-reboot"]), argv(&[]));

        let err = executor.execute(ControlAction::Restart).await.unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }), "{err:?}");
        assert!(err.to_string().contains("/nonexistent/syspulse-reboot"));
    }

    #[tokio::test]
    async fn test_empty_command() {
        let executor = CommandExecutor::new(argv(&[]), argv(&[]));

        let err = executor.execute(ControlAction::Shutdown).await.unwrap_err();
        assert!(matches!(err, ExecError::EmptyCommand(ControlAction::Shutdown)));
    }
}
