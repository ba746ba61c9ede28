use std::time::Duration;

use derive_more::Display;

use super::{ContainerCommand, ContainerSession, RuntimeError};

/// How a non-zero exit code is treated.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FailurePolicy {
    /// A non-zero exit code is a failure.
    Fatal,
    /// A non-zero exit code is expected and harmless, e.g. for existence checks
    /// and best-effort cleanup.
    Tolerate,
}

/// Classified result of a remote command.
#[derive(Debug)]
pub enum ExecOutcome {
    /// The command exited with code 0.
    Succeeded,
    /// The command failed, but under [FailurePolicy::Tolerate].
    FailedTolerated { exit_code: i32 },
    /// The command failed or couldn't be run at all.
    Failed(ExecFailure),
}

impl ExecOutcome {
    /// Whether the caller may proceed as if the command succeeded.
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

/// Why a command [failed](ExecOutcome::Failed).
#[derive(Debug, Display)]
pub enum ExecFailure {
    #[display("exit code {exit_code}: {output}")]
    NonZeroExit { exit_code: i32, output: String },
    #[display("{_0}")]
    Runtime(RuntimeError),
}

/// Runs commands inside the container of a session.
///
/// Failures of the runtime never escape as errors, they are logged and turned
/// into [ExecOutcome::Failed].
pub struct RemoteExecutor<S> {
    session: S,
    timeout: Option<Duration>,
}

impl<S: ContainerSession> RemoteExecutor<S> {
    pub fn new(session: S, timeout: Option<Duration>) -> Self {
        Self { session, timeout }
    }

    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    pub fn execute(&mut self, command: &ContainerCommand, policy: FailurePolicy) -> ExecOutcome {
        log::debug!(target: "container::executor", "Executing: {command}");

        let output = match self.session.exec(command, self.timeout) {
            Ok(output) => output,
            Err(e) => {
                log::error!(target: "container::executor", "Running `{command}` in the container failed: {e}");
                return ExecOutcome::Failed(ExecFailure::Runtime(e));
            }
        };

        if output.success() {
            return ExecOutcome::Succeeded;
        }

        match policy {
            FailurePolicy::Tolerate => {
                log::trace!(
                    target: "container::executor",
                    "`{command}` exited with {}, tolerated",
                    output.exit_code
                );
                ExecOutcome::FailedTolerated {
                    exit_code: output.exit_code,
                }
            }
            FailurePolicy::Fatal => {
                let output_text = output.output_lossy();
                log::error!(
                    target: "container::executor",
                    "`{command}` failed with exit code {}: {output_text}",
                    output.exit_code
                );
                ExecOutcome::Failed(ExecFailure::NonZeroExit {
                    exit_code: output.exit_code,
                    output: output_text,
                })
            }
        }
    }
}
