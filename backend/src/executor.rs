//! Host command execution
//!
//! Every external program the service drives (`zfs`, `jail`, `jls`, `sysctl`,
//! `pw`, ...) is run through an [`Executor`]. In production this is a
//! [`HostExecutor`]; under test a [`FakeExecutor`] answers each invocation
//! from a handler without touching the host.

use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, ExitStatus, Output, Stdio};
use std::str::from_utf8;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, info};

use crate::chroot::HostRoot;

/// Errors raised while running an external command
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Failed to start '{command}': {err}")]
    ExecutionStart {
        command: String,
        #[source]
        err: std::io::Error,
    },

    #[error("Command '{command}' failed with status {status}: {stderr}")]
    CommandFailure {
        command: String,
        status: String,
        stdout: String,
        stderr: String,
    },
}

impl ExecutionError {
    /// Stderr of the failed command, if it ran at all
    pub fn stderr(&self) -> Option<&str> {
        match self {
            ExecutionError::CommandFailure { stderr, .. } => Some(stderr),
            ExecutionError::ExecutionStart { .. } => None,
        }
    }
}

/// Render a command as a shell-quoted line for logs and error messages
pub fn command_to_string(command: &Command) -> String {
    let mut words = vec![command.get_program().to_string_lossy().into_owned()];
    words.extend(command.get_args().map(|a| a.to_string_lossy().into_owned()));
    shell_words::join(words)
}

fn output_to_error(command: String, output: &Output) -> ExecutionError {
    ExecutionError::CommandFailure {
        command,
        status: output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".to_string()),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}

fn log_output(id: u64, output: &Output) {
    info!(
        id,
        result = if output.status.success() { "OK" } else { "ERROR" },
        status = ?output.status.code(),
        "finished running command"
    );
    if !output.stdout.is_empty() {
        debug!(id, stdout = from_utf8(&output.stdout).unwrap_or("<Not valid UTF-8>"), "command stdout");
    }
    if !output.stderr.is_empty() {
        debug!(id, stderr = from_utf8(&output.stderr).unwrap_or("<Not valid UTF-8>"), "command stderr");
    }
}

/// Shared handle to an executor
pub type BoxedExecutor = Arc<dyn Executor>;

/// Runs [`Command`]s to completion and returns their output.
///
/// A non-zero exit status is reported as [`ExecutionError::CommandFailure`].
pub trait Executor: Send + Sync {
    /// Run a command, feeding `input` to its stdin when given
    fn execute_with_input(
        &self,
        command: &mut Command,
        input: Option<&[u8]>,
    ) -> Result<Output, ExecutionError>;

    /// Run a command with an empty stdin
    fn execute(&self, command: &mut Command) -> Result<Output, ExecutionError> {
        self.execute_with_input(command, None)
    }
}

/// Executor that spawns real processes on the host
#[derive(Debug, Default)]
pub struct HostExecutor {
    counter: AtomicU64,
}

impl HostExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn as_executor(self: Arc<Self>) -> BoxedExecutor {
        self
    }
}

impl Executor for HostExecutor {
    fn execute_with_input(
        &self,
        command: &mut Command,
        input: Option<&[u8]>,
    ) -> Result<Output, ExecutionError> {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        let line = command_to_string(command);
        let _root = HostRoot::hold();
        info!(id, command = %line, "running command");

        let start_error = |err| ExecutionError::ExecutionStart {
            command: line.clone(),
            err,
        };

        command
            .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(start_error)?;
        if let (Some(bytes), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin.write_all(bytes).map_err(start_error)?;
        }
        let output = child.wait_with_output().map_err(start_error)?;
        log_output(id, &output);

        if !output.status.success() {
            return Err(output_to_error(line, &output));
        }
        Ok(output)
    }
}

/// A single command observed by a [`FakeExecutor`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub input: Option<Vec<u8>>,
}

impl Invocation {
    fn from_command(command: &Command, input: Option<&[u8]>) -> Self {
        Self {
            program: command.get_program().to_string_lossy().into_owned(),
            args: command
                .get_args()
                .map(|a| a.to_string_lossy().into_owned())
                .collect(),
            input: input.map(<[u8]>::to_vec),
        }
    }

    /// Arguments as string slices, handy for slice patterns
    pub fn args(&self) -> Vec<&str> {
        self.args.iter().map(String::as_str).collect()
    }

    pub fn command_line(&self) -> String {
        let mut words = vec![self.program.clone()];
        words.extend(self.args.iter().cloned());
        shell_words::join(words)
    }
}

/// Handler answering fake invocations
pub type HandlerFn = dyn FnMut(&Invocation) -> Output + Send;

/// Executor which records every invocation and answers from a handler
pub struct FakeExecutor {
    counter: AtomicU64,
    handler: Mutex<Box<HandlerFn>>,
    invocations: Mutex<Vec<Invocation>>,
}

impl FakeExecutor {
    /// A fake whose handler succeeds with empty output
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            counter: AtomicU64::new(0),
            handler: Mutex::new(Box::new(|_| success_output(""))),
            invocations: Mutex::new(Vec::new()),
        })
    }

    /// Replace the handler
    pub fn set_handler(&self, f: Box<HandlerFn>) {
        *self.handler.lock().unwrap_or_else(|e| e.into_inner()) = f;
    }

    /// Every invocation seen so far, in order
    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn as_executor(self: Arc<Self>) -> BoxedExecutor {
        self
    }
}

impl Executor for FakeExecutor {
    fn execute_with_input(
        &self,
        command: &mut Command,
        input: Option<&[u8]>,
    ) -> Result<Output, ExecutionError> {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        let invocation = Invocation::from_command(command, input);
        debug!(id, command = %invocation.command_line(), "running fake command");

        self.invocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(invocation.clone());

        let output = (self.handler.lock().unwrap_or_else(|e| e.into_inner()))(&invocation);
        log_output(id, &output);

        if !output.status.success() {
            return Err(output_to_error(invocation.command_line(), &output));
        }
        Ok(output)
    }
}

/// Successful output with the given stdout
pub fn success_output(stdout: impl Into<Vec<u8>>) -> Output {
    Output {
        status: ExitStatus::from_raw(0),
        stdout: stdout.into(),
        stderr: Vec::new(),
    }
}

/// Failed output with the given exit code and stderr
pub fn failure_output(code: i32, stderr: impl Into<Vec<u8>>) -> Output {
    Output {
        // Raw wait status: exit code lives in the second byte
        status: ExitStatus::from_raw((code & 0xff) << 8),
        stdout: Vec::new(),
        stderr: stderr.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_to_string_quotes_arguments() {
        let mut cmd = Command::new("jail");
        cmd.arg("-c").arg("exec.start=/bin/sh /etc/rc");
        assert_eq!(command_to_string(&cmd), "jail -c 'exec.start=/bin/sh /etc/rc'");
    }

    #[test]
    fn test_fake_executor_records_invocations() {
        let fake = FakeExecutor::new();
        let executor = fake.clone().as_executor();

        executor.execute(Command::new("zfs").args(["list", "-H"])).unwrap();
        executor
            .execute_with_input(Command::new("pw").args(["usermod", "root", "-h", "0"]), Some(b"secret"))
            .unwrap();

        let seen = fake.invocations();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].program, "zfs");
        assert_eq!(seen[0].args(), vec!["list", "-H"]);
        assert_eq!(seen[1].input.as_deref(), Some(&b"secret"[..]));
    }

    #[test]
    fn test_fake_executor_failure_maps_to_command_failure() {
        let fake = FakeExecutor::new();
        fake.set_handler(Box::new(|_| failure_output(1, "dataset does not exist")));
        let executor = fake.as_executor();

        let err = executor.execute(Command::new("zfs").arg("get")).unwrap_err();
        match &err {
            ExecutionError::CommandFailure { status, stderr, .. } => {
                assert_eq!(status, "1");
                assert_eq!(stderr, "dataset does not exist");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.stderr(), Some("dataset does not exist"));
    }

    #[test]
    fn test_host_executor_reports_missing_program() {
        let executor = HostExecutor::new().as_executor();
        let err = executor
            .execute(&mut Command::new("/nonexistent/jest-test-binary"))
            .unwrap_err();
        assert!(matches!(err, ExecutionError::ExecutionStart { .. }));
    }

    #[test]
    fn test_host_executor_feeds_stdin() {
        let executor = HostExecutor::new().as_executor();
        let output = executor
            .execute_with_input(&mut Command::new("cat"), Some(b"hello"))
            .unwrap();
        assert_eq!(output.stdout, b"hello");
    }
}
