//! Access to the container running the database.
//!
//! The [ContainerRuntime] looks up a container and opens a [ContainerSession]
//! on it. The session is released when dropped. On top of a session sit the
//! [RemoteExecutor] running commands and the [ArchiveRetriever] copying
//! artifacts out of the container.
//!
//! The concrete runtime is the [`docker` CLI](Docker).

use std::fmt;
use std::io::{self, Write};
use std::time::Duration;

use derive_more::{Display, Error, From};

mod docker;
mod executor;
mod retriever;

#[cfg(test)]
pub(crate) mod fake;

pub use docker::Docker;
pub use executor::{ExecFailure, ExecOutcome, FailurePolicy, RemoteExecutor};
pub use retriever::{ArchiveRetriever, Compression, RetrieveError};

/// A command executed inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerCommand {
    argv: Vec<String>,
    env: Vec<(String, String)>,
}

impl ContainerCommand {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            env: Vec::new(),
        }
    }

    /// Sets an environment variable of the command.
    ///
    /// Only the name shows up in logs and process listings.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn envs(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or_default()
    }
}

impl fmt::Display for ContainerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.argv.join(" "))
    }
}

/// Whether a path inside the container is a regular file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteKind {
    File,
    Directory,
}

/// A path inside the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteArtifact {
    pub path: &'static str,
    pub kind: RemoteKind,
}

impl RemoteArtifact {
    pub const fn file(path: &'static str) -> Self {
        Self {
            path,
            kind: RemoteKind::File,
        }
    }

    pub const fn directory(path: &'static str) -> Self {
        Self {
            path,
            kind: RemoteKind::Directory,
        }
    }

    /// Command whose exit status tells if the artifact exists.
    pub fn exists_command(&self) -> ContainerCommand {
        match self.kind {
            RemoteKind::File => ContainerCommand::new(["test", "-f", self.path]),
            RemoteKind::Directory => ContainerCommand::new(["test", "-d", self.path]),
        }
    }

    /// Command removing the artifact.
    pub fn remove_command(&self) -> ContainerCommand {
        match self.kind {
            RemoteKind::File => ContainerCommand::new(["rm", "-f", self.path]),
            RemoteKind::Directory => ContainerCommand::new(["rm", "-rf", self.path]),
        }
    }
}

impl fmt::Display for RemoteArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path)
    }
}

/// Result of a command that ran to completion inside the container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Captured stdout and stderr as text.
    pub fn output_lossy(&self) -> String {
        let stdout = String::from_utf8_lossy(&self.stdout);
        let stderr = String::from_utf8_lossy(&self.stderr);
        match (stdout.trim().is_empty(), stderr.trim().is_empty()) {
            (_, true) => stdout.trim_end().to_string(),
            (true, false) => stderr.trim_end().to_string(),
            (false, false) => format!("{}\n{}", stdout.trim_end(), stderr.trim_end()),
        }
    }
}

/// Errors talking to the container runtime.
#[derive(Debug, Display, Error, From)]
pub enum RuntimeError {
    /// No container with the configured name or id.
    #[display("Container not found: {_0}")]
    ContainerNotFound(#[error(ignore)] String),
    /// The runtime client couldn't be started.
    #[display("Starting the container runtime client failed: {_0}")]
    Spawn(io::Error),
    /// Reading or writing the transferred data failed.
    #[display("Transfer failed: {_0}")]
    #[from]
    Io(io::Error),
    /// The deadline passed before the command finished.
    #[display("Command exceeded its deadline of {}s", _0.as_secs())]
    TimedOut(#[error(ignore)] Duration),
    /// The runtime client was terminated by a signal.
    #[display("Container runtime client was terminated")]
    Terminated,
    /// Copying a path out of the container failed.
    #[display("Copying {path} out of the container failed (exit code {exit_code}): {message}")]
    CopyFailed {
        path: String,
        exit_code: i32,
        message: String,
    },
}

/// A container runtime able to look up containers.
pub trait ContainerRuntime {
    /// Session on a single container.
    type Session: ContainerSession;

    /// Looks up `container` by name or id and opens a session on it.
    fn connect(&self, container: &str) -> Result<Self::Session, RuntimeError>;
}

/// Primitives offered on a looked-up container.
pub trait ContainerSession {
    /// Runs `command` to completion and captures its output.
    ///
    /// A non-zero exit code is not an error; errors are reserved for
    /// failures of the runtime itself. If `timeout` passes, the command is
    /// stopped inside the container and [RuntimeError::TimedOut] is returned.
    fn exec(
        &mut self,
        command: &ContainerCommand,
        timeout: Option<Duration>,
    ) -> Result<ExecOutput, RuntimeError>;

    /// Streams `source` into `sink` and returns the number of bytes copied.
    ///
    /// Directories are streamed as a tar archive.
    fn copy_out(
        &mut self,
        source: &RemoteArtifact,
        sink: &mut dyn Write,
        timeout: Option<Duration>,
    ) -> Result<u64, RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_commands_follow_artifact_kind() {
        let file = RemoteArtifact::file("/tmp/backup.sql.gz");
        assert_eq!(file.exists_command().argv(), ["test", "-f", "/tmp/backup.sql.gz"]);
        assert_eq!(file.remove_command().argv(), ["rm", "-f", "/tmp/backup.sql.gz"]);

        let dir = RemoteArtifact::directory("/tmp/full_backup");
        assert_eq!(dir.exists_command().argv(), ["test", "-d", "/tmp/full_backup"]);
        assert_eq!(dir.remove_command().argv(), ["rm", "-rf", "/tmp/full_backup"]);
    }

    #[test]
    fn command_display_omits_environment() {
        let command = ContainerCommand::new(["pg_dump", "app"]).env("PGPASSWORD", "secret");
        assert_eq!(command.to_string(), "pg_dump app");
        assert_eq!(command.program(), "pg_dump");
    }

    #[test]
    fn output_combines_streams() {
        let output = ExecOutput {
            exit_code: 1,
            stdout: b"partial\n".to_vec(),
            stderr: b"pg_dump: error: connection refused\n".to_vec(),
        };
        assert_eq!(
            output.output_lossy(),
            "partial\npg_dump: error: connection refused"
        );
        assert!(!output.success());
    }
}
