//! Subprocess execution behind a trait seam.
//!
//! All host and container commands are described as argument vectors and
//! executed through a [`CommandRunner`]. Nothing is ever passed through a
//! shell, so node names and paths cannot inject extra commands.

use std::fmt;
use std::fs::File;
use std::path::Path;
use std::process::{Child, Command, Stdio};

use crate::error::{HarnessError, Result};

/// An argument-vector description of one subprocess invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Needs root on the host (bridges, iptables, LXC administration).
    pub privileged: bool,
    /// Extra environment for the child.
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            privileged: false,
            env: Vec::new(),
        }
    }

    /// Shorthand for a command that needs root on the host.
    pub fn privileged(program: impl Into<String>) -> Self {
        Self {
            privileged: true,
            ..Self::new(program)
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// The full argv, program first.
    pub fn argv(&self) -> Vec<&str> {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.argv().join(" "))
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Turns a non-zero exit into [`HarnessError::CommandFailed`].
    pub fn into_checked(self, spec: &CommandSpec) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(HarnessError::CommandFailed {
                command: spec.to_string(),
                status: self.status,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }

    /// First line of stdout with trailing CR/LF removed, `None` if empty.
    pub fn first_line(&self) -> Option<String> {
        let line = self.stdout.lines().next()?;
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            None
        } else {
            Some(line.to_string())
        }
    }
}

/// A detached child process (a daemon started inside a container).
pub trait ProcessHandle: Send {
    /// OS process id of the local side of the child.
    fn id(&self) -> u32;

    /// Whether the process has not exited yet.
    fn is_running(&mut self) -> bool;

    /// Exit code once the process has finished.
    fn exit_code(&mut self) -> Option<i32>;

    /// Kill the process and reap it.
    fn kill(&mut self) -> Result<()>;
}

/// Executes [`CommandSpec`]s. Implemented by [`SystemRunner`] for real hosts
/// and by [`crate::testing::FakeLxcHost`] in tests.
pub trait CommandRunner: Send + Sync {
    /// Run to completion and capture output. Only spawn failures are `Err`;
    /// non-zero exits are reported through [`CommandOutput::status`].
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Start detached, with stdout and stderr appended to `log_path`.
    fn spawn(&self, spec: &CommandSpec, log_path: &Path) -> Result<Box<dyn ProcessHandle>>;

    /// Run and fail on a non-zero exit.
    fn run_checked(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.run(spec)?.into_checked(spec)
    }
}

/// Runs commands on the local host with `std::process::Command`.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    /// Prefix privileged commands with `sudo`.
    pub use_sudo: bool,
}

impl SystemRunner {
    pub fn new(use_sudo: bool) -> Self {
        Self { use_sudo }
    }

    fn command(&self, spec: &CommandSpec) -> Command {
        let mut cmd = if spec.privileged && self.use_sudo {
            let mut cmd = Command::new("sudo");
            // sudo resets the environment, so pass ours through env(1)
            if !spec.env.is_empty() {
                cmd.arg("env");
                for (key, value) in &spec.env {
                    cmd.arg(format!("{key}={value}"));
                }
            }
            cmd.arg(&spec.program);
            cmd
        } else {
            let mut cmd = Command::new(&spec.program);
            cmd.envs(spec.env.iter().map(|(k, v)| (k, v)));
            cmd
        };
        cmd.args(&spec.args);
        cmd
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        tracing::debug!(command = %spec, "running");
        let output = self.command(spec).stdin(Stdio::null()).output()?;
        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn spawn(&self, spec: &CommandSpec, log_path: &Path) -> Result<Box<dyn ProcessHandle>> {
        tracing::debug!(command = %spec, log = %log_path.display(), "spawning");
        let log_file = File::options().create(true).append(true).open(log_path)?;
        let child = self
            .command(spec)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file.try_clone()?))
            .stderr(Stdio::from(log_file))
            .spawn()?;
        Ok(Box::new(LocalProcess {
            child,
            exit_code: None,
        }))
    }
}

struct LocalProcess {
    child: Child,
    exit_code: Option<Option<i32>>,
}

impl LocalProcess {
    fn poll(&mut self) {
        if self.exit_code.is_none() {
            if let Ok(Some(status)) = self.child.try_wait() {
                self.exit_code = Some(status.code());
            }
        }
    }
}

impl ProcessHandle for LocalProcess {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn is_running(&mut self) -> bool {
        self.poll();
        self.exit_code.is_none()
    }

    fn exit_code(&mut self) -> Option<i32> {
        self.poll();
        self.exit_code.flatten()
    }

    fn kill(&mut self) -> Result<()> {
        if self.is_running() {
            self.child.kill()?;
            let status = self.child.wait()?;
            self.exit_code = Some(status.code());
        }
        Ok(())
    }
}

impl Drop for LocalProcess {
    fn drop(&mut self) {
        let _ = self.kill();
    }
}
