//! In-memory container for tests.
//!
//! Understands the handful of programs the backup issues: `pg_dump`,
//! `pg_basebackup`, `test` and `rm`.

use std::cell::{RefCell, RefMut};
use std::collections::{BTreeMap, HashSet};
use std::io::{self, Write};
use std::rc::Rc;
use std::time::Duration;

use super::{
    ContainerCommand, ContainerRuntime, ContainerSession, ExecOutput, RemoteArtifact, RuntimeError,
};

#[derive(Debug, Default)]
pub struct FakeContainer {
    /// Regular files by absolute path.
    pub files: BTreeMap<String, Vec<u8>>,
    /// Every command executed, in order.
    pub commands: Vec<ContainerCommand>,
    failing_programs: HashSet<String>,
    stalling_programs: HashSet<String>,
    unreachable: bool,
    broken_exec: bool,
    broken_transfer: bool,
    sessions_open: usize,
}

impl FakeContainer {
    fn is_dir(&self, path: &str) -> bool {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.files.keys().any(|file| file.starts_with(&prefix))
    }

    fn remove_dir(&mut self, path: &str) {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.files.retain(|file, _| !file.starts_with(&prefix));
    }

    pub fn count(&self, program: &str) -> usize {
        self.commands
            .iter()
            .filter(|command| command.program() == program)
            .count()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeRuntime {
    state: Rc<RefCell<FakeContainer>>,
}

impl FakeRuntime {
    pub fn state(&self) -> RefMut<'_, FakeContainer> {
        self.state.borrow_mut()
    }

    pub fn put_file(&self, path: &str, content: &[u8]) {
        self.state().files.insert(path.to_string(), content.to_vec());
    }

    /// Lets every invocation of `program` exit with code 1.
    pub fn fail_program(&self, program: &str) {
        self.state().failing_programs.insert(program.to_string());
    }

    /// Lets every invocation of `program` run into its deadline after writing
    /// part of its output.
    pub fn stall_program(&self, program: &str) {
        self.state().stalling_programs.insert(program.to_string());
    }

    /// Lets failing and stalling programs work again.
    pub fn reset_faults(&self) {
        let mut state = self.state();
        state.failing_programs.clear();
        state.stalling_programs.clear();
    }

    /// Makes the container lookup fail.
    pub fn unreachable(&self) {
        self.state().unreachable = true;
    }

    /// Makes every exec fail with a runtime error.
    pub fn break_exec(&self) {
        self.state().broken_exec = true;
    }

    /// Cuts every transfer off after half of the data.
    pub fn break_transfer(&self) {
        self.state().broken_transfer = true;
    }

    pub fn sessions_open(&self) -> usize {
        self.state.borrow().sessions_open
    }
}

impl ContainerRuntime for FakeRuntime {
    type Session = FakeSession;

    fn connect(&self, container: &str) -> Result<Self::Session, RuntimeError> {
        let mut state = self.state();
        if state.unreachable {
            return Err(RuntimeError::ContainerNotFound(container.to_string()));
        }
        state.sessions_open += 1;

        Ok(FakeSession {
            state: Rc::clone(&self.state),
        })
    }
}

#[derive(Debug)]
pub struct FakeSession {
    state: Rc<RefCell<FakeContainer>>,
}

fn exit(exit_code: i32, stderr: &str) -> ExecOutput {
    ExecOutput {
        exit_code,
        stdout: Vec::new(),
        stderr: stderr.as_bytes().to_vec(),
    }
}

/// Value following `flag` in `argv`.
fn flag_value<'a>(argv: &'a [String], flag: &str) -> Option<&'a str> {
    argv.iter()
        .position(|arg| arg == flag)
        .and_then(|index| argv.get(index + 1))
        .map(String::as_str)
}

impl ContainerSession for FakeSession {
    fn exec(
        &mut self,
        command: &ContainerCommand,
        timeout: Option<Duration>,
    ) -> Result<ExecOutput, RuntimeError> {
        let mut state = self.state.borrow_mut();
        if state.broken_exec {
            return Err(RuntimeError::Spawn(io::Error::other("runtime unavailable")));
        }
        state.commands.push(command.clone());

        let program = command.program().to_string();
        if state.failing_programs.contains(&program) {
            return Ok(exit(1, &format!("{program}: error: simulated failure")));
        }

        let argv = command.argv();
        if state.stalling_programs.contains(&program) {
            // stopped at the deadline, the partial output stays behind
            let partial = flag_value(argv, "-f")
                .map(str::to_string)
                .or_else(|| flag_value(argv, "-D").map(|dir| format!("{dir}/base.tar")));
            if let Some(path) = partial {
                state.files.insert(path, b"partial".to_vec());
            }
            return Err(RuntimeError::TimedOut(timeout.unwrap_or_default()));
        }

        let output = match program.as_str() {
            "pg_dump" => match flag_value(argv, "-f") {
                Some(path) => {
                    state.files.insert(path.to_string(), b"daily dump".to_vec());
                    exit(0, "")
                }
                None => exit(1, "pg_dump: no output file"),
            },
            "pg_basebackup" => match flag_value(argv, "-D") {
                Some(dir) if state.is_dir(dir) => {
                    exit(1, &format!("pg_basebackup: error: directory \"{dir}\" exists but is not empty"))
                }
                Some(dir) => {
                    state
                        .files
                        .insert(format!("{dir}/base.tar"), b"base backup".to_vec());
                    exit(0, "")
                }
                None => exit(1, "pg_basebackup: no target directory"),
            },
            "test" => {
                let exists = match (argv.get(1).map(String::as_str), argv.get(2)) {
                    (Some("-f"), Some(path)) => state.files.contains_key(path),
                    (Some("-d"), Some(path)) => state.is_dir(path),
                    _ => false,
                };
                exit(if exists { 0 } else { 1 }, "")
            }
            "rm" => {
                match (argv.get(1).map(String::as_str), argv.get(2)) {
                    (Some("-f"), Some(path)) => {
                        state.files.remove(path);
                    }
                    (Some("-rf"), Some(path)) => {
                        state.files.remove(path);
                        state.remove_dir(path);
                    }
                    _ => return Ok(exit(1, "rm: invalid usage")),
                }
                exit(0, "")
            }
            _ => exit(127, &format!("{program}: command not found")),
        };

        Ok(output)
    }

    fn copy_out(
        &mut self,
        source: &RemoteArtifact,
        sink: &mut dyn Write,
        _timeout: Option<Duration>,
    ) -> Result<u64, RuntimeError> {
        let state = self.state.borrow();
        let content = state
            .files
            .get(source.path)
            .ok_or_else(|| RuntimeError::CopyFailed {
                path: source.path.to_string(),
                exit_code: 1,
                message: format!("cat: {}: No such file or directory", source.path),
            })?;

        if state.broken_transfer {
            sink.write_all(&content[..content.len() / 2])?;
            return Err(RuntimeError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection reset",
            )));
        }

        sink.write_all(content)?;
        Ok(content.len() as u64)
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.state.borrow_mut().sessions_open -= 1;
    }
}
