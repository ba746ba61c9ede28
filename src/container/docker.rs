//! [ContainerRuntime] backed by the `docker` command line client.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use super::{
    ContainerCommand, ContainerRuntime, ContainerSession, ExecOutput, RemoteArtifact, RemoteKind,
    RuntimeError,
};

const DEFAULT_DOCKER_BIN: &str = "docker";

/// Time a remote command gets to exit after `SIGTERM` before it is killed.
const REMOTE_KILL_AFTER: Duration = Duration::from_secs(10);
/// Extra time given to the local client over the remote deadline.
const CLIENT_GRACE: Duration = Duration::from_secs(30);
/// Exit codes of `timeout` when the deadline passed.
const TIMEOUT_EXIT_CODES: [i32; 2] = [124, 137];
const WAIT_INTERVAL: Duration = Duration::from_millis(20);

/// The `docker` CLI.
#[derive(Debug, Clone)]
pub struct Docker {
    docker: PathBuf,
}

impl Default for Docker {
    fn default() -> Self {
        Self::with_binary(PathBuf::from(DEFAULT_DOCKER_BIN))
    }
}

impl Docker {
    pub fn with_binary(docker: PathBuf) -> Self {
        Self { docker }
    }
}

impl ContainerRuntime for Docker {
    type Session = DockerSession;

    fn connect(&self, container: &str) -> Result<Self::Session, RuntimeError> {
        let output = Command::new(&self.docker)
            .arg("inspect")
            .arg("--type")
            .arg("container")
            .arg("--format")
            .arg("{{.Id}}")
            .arg(container)
            .stdin(Stdio::null())
            .output()
            .map_err(RuntimeError::Spawn)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            log::debug!(target: "container::docker", "docker inspect {container}: {}", stderr.trim_end());
            return Err(RuntimeError::ContainerNotFound(container.to_string()));
        }

        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        log::debug!(target: "container::docker", "Opened session on container {container} ({id})");

        Ok(DockerSession {
            docker: self.docker.clone(),
            name: container.to_string(),
            id,
        })
    }
}

/// Session on a container, addressed by its resolved id.
#[derive(Debug)]
pub struct DockerSession {
    docker: PathBuf,
    name: String,
    id: String,
}

impl DockerSession {
    /// `docker exec` of `command`.
    ///
    /// With a `deadline` the command runs under `timeout` inside the
    /// container, so it is stopped there as well and not only the client.
    fn exec_command(&self, command: &ContainerCommand, deadline: Option<Duration>) -> Command {
        let mut docker = Command::new(&self.docker);
        docker.arg("exec");
        for (key, value) in command.envs() {
            // only the name is passed on the command line, docker reads the value from our env
            docker.arg("--env").arg(key);
            docker.env(key, value);
        }
        docker.arg(&self.id);
        if let Some(deadline) = deadline {
            docker
                .args(["timeout", "-s", "TERM", "-k"])
                .arg(whole_secs(REMOTE_KILL_AFTER))
                .arg(whole_secs(deadline));
        }
        docker.args(command.argv());
        docker
    }

    /// Runs `command` and returns its exit code.
    fn run(
        &self,
        command: &ContainerCommand,
        sink: &mut dyn Write,
        deadline: Option<Duration>,
    ) -> Result<(i32, Finished), RuntimeError> {
        log::trace!(target: "container::docker", "Running: docker exec {} {command}", self.name);

        let client_deadline = deadline.map(|deadline| deadline + REMOTE_KILL_AFTER + CLIENT_GRACE);
        let finished = run_with_deadline(self.exec_command(command, deadline), sink, client_deadline)?;
        let exit_code = finished.status.code().ok_or(RuntimeError::Terminated)?;

        match deadline {
            Some(deadline) if TIMEOUT_EXIT_CODES.contains(&exit_code) => {
                log::debug!(target: "container::docker", "{command} was stopped inside the container");
                Err(RuntimeError::TimedOut(deadline))
            }
            _ => Ok((exit_code, finished)),
        }
    }
}

fn whole_secs(duration: Duration) -> String {
    duration.as_secs().max(1).to_string()
}

impl ContainerSession for DockerSession {
    fn exec(
        &mut self,
        command: &ContainerCommand,
        timeout: Option<Duration>,
    ) -> Result<ExecOutput, RuntimeError> {
        let mut stdout = Vec::new();
        let (exit_code, finished) = self.run(command, &mut stdout, timeout)?;

        Ok(ExecOutput {
            exit_code,
            stdout,
            stderr: finished.stderr,
        })
    }

    fn copy_out(
        &mut self,
        source: &RemoteArtifact,
        sink: &mut dyn Write,
        timeout: Option<Duration>,
    ) -> Result<u64, RuntimeError> {
        let command = match source.kind {
            RemoteKind::File => ContainerCommand::new(["cat", "--", source.path]),
            RemoteKind::Directory => ContainerCommand::new(["tar", "-C", source.path, "-cf", "-", "."]),
        };
        let (exit_code, finished) = self.run(&command, sink, timeout)?;
        if exit_code != 0 {
            return Err(RuntimeError::CopyFailed {
                path: source.path.to_string(),
                exit_code,
                message: String::from_utf8_lossy(&finished.stderr).trim_end().to_string(),
            });
        }

        Ok(finished.copied)
    }
}

impl Drop for DockerSession {
    fn drop(&mut self) {
        log::debug!(target: "container::docker", "Released session on container {}", self.name);
    }
}

struct Finished {
    status: ExitStatus,
    stderr: Vec<u8>,
    copied: u64,
}

/// Runs `command`, streaming its stdout into `sink`.
///
/// If `timeout` passes before the process exits it is killed and
/// [RuntimeError::TimedOut] is returned.
fn run_with_deadline(
    mut command: Command,
    sink: &mut dyn Write,
    timeout: Option<Duration>,
) -> Result<Finished, RuntimeError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn().map_err(RuntimeError::Spawn)?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let stderr_reader = thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_end(&mut buf);
        }
        buf
    });

    let child = Arc::new(Mutex::new(child));
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let watchdog = timeout.map(|timeout| {
        let child = Arc::clone(&child);
        thread::spawn(move || match done_rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                let mut child = child.lock().unwrap_or_else(PoisonError::into_inner);
                if let Ok(Some(_)) = child.try_wait() {
                    // exited right at the deadline
                    return false;
                }
                if let Err(e) = child.kill() {
                    log::warn!(target: "container::docker", "Killing timed out command failed: {e}");
                }
                true
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => false,
        })
    });

    let copied = match stdout {
        Some(mut stdout) => io::copy(&mut stdout, sink),
        None => Ok(0),
    };
    if copied.is_err() {
        // the sink failed, the process would otherwise block on a full pipe
        let _ = child.lock().unwrap_or_else(PoisonError::into_inner).kill();
    }

    // polled so the watchdog can still kill a process that closed its stdout early
    let status = loop {
        let exited = child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_wait()
            .map_err(RuntimeError::Spawn)?;
        match exited {
            Some(status) => break status,
            None => thread::sleep(WAIT_INTERVAL),
        }
    };
    let _ = done_tx.send(());

    let timed_out = watchdog
        .map(|watchdog| watchdog.join().unwrap_or(false))
        .unwrap_or(false);
    let stderr = stderr_reader.join().unwrap_or_default();

    if timed_out {
        if let Some(timeout) = timeout {
            return Err(RuntimeError::TimedOut(timeout));
        }
    }
    let copied = copied?;

    Ok(Finished {
        status,
        stderr,
        copied,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    }

    #[test]
    fn output_and_status_are_captured() {
        let mut stdout = Vec::new();
        let finished = run_with_deadline(
            sh("printf hello; printf oops >&2; exit 3"),
            &mut stdout,
            Some(Duration::from_secs(30)),
        )
        .unwrap();

        assert_eq!(stdout, b"hello");
        assert_eq!(finished.stderr, b"oops");
        assert_eq!(finished.status.code(), Some(3));
        assert_eq!(finished.copied, 5);
    }

    #[test]
    fn deadline_kills_the_process() {
        let mut stdout = Vec::new();
        let result = run_with_deadline(sh("exec sleep 30"), &mut stdout, Some(Duration::from_millis(200)));

        assert!(matches!(result, Err(RuntimeError::TimedOut(_))));
    }

    #[test]
    fn process_closing_its_output_early_still_hits_the_deadline() {
        let mut stdout = Vec::new();
        let result = run_with_deadline(
            sh("exec 1>&- 2>&-; exec sleep 30"),
            &mut stdout,
            Some(Duration::from_millis(200)),
        );

        assert!(matches!(result, Err(RuntimeError::TimedOut(_))));
    }

    #[test]
    fn deadline_is_enforced_inside_the_container() {
        let session = DockerSession {
            docker: PathBuf::from("docker"),
            name: "postgres".into(),
            id: "4f1c".into(),
        };
        let command = ContainerCommand::new(["pg_dump", "app"]).env("PGPASSWORD", "secret");
        let args = |deadline| -> Vec<String> {
            session
                .exec_command(&command, deadline)
                .get_args()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect()
        };

        assert_eq!(
            args(Some(Duration::from_secs(90))),
            ["exec", "--env", "PGPASSWORD", "4f1c", "timeout", "-s", "TERM", "-k", "10", "90", "pg_dump", "app"]
        );
        assert_eq!(
            args(None),
            ["exec", "--env", "PGPASSWORD", "4f1c", "pg_dump", "app"]
        );
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let docker = Docker::with_binary(PathBuf::from("/nonexistent/docker"));
        assert!(matches!(
            docker.connect("postgres"),
            Err(RuntimeError::Spawn(_))
        ));
    }
}
