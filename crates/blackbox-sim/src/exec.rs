//! Running commands and daemons inside containers.
//!
//! Daemons are never assumed to be up just because they were spawned: the
//! caller picks a [`Readiness`] signal and [`daemonize_in_container`] blocks
//! until it is observed, the daemon dies, or the ready deadline passes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::command::{CommandRunner, CommandSpec, ProcessHandle};
use crate::context::HarnessContext;
use crate::error::{HarnessError, Result};
use crate::poll::{poll_until, PollSettings};

/// Environment variable naming the marker file a daemon creates once ready.
pub const READY_FILE_ENV: &str = "MESHBOX_READY_FILE";

static DAEMON_SEQ: AtomicU32 = AtomicU32::new(0);

/// How a daemon announces that it finished starting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// The daemon creates the file named by `$MESHBOX_READY_FILE`.
    Marker,
    /// The daemon prints a line containing this text.
    LogLine(String),
    /// Spawned is good enough.
    None,
}

/// A program to run detached inside a container.
#[derive(Debug, Clone)]
pub struct DaemonSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub readiness: Readiness,
}

impl DaemonSpec {
    pub fn new(program: impl Into<String>, readiness: Readiness) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            readiness,
        }
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

    fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// `lxc-attach -P <store> -n <container> [-v K=V].. -- program args..`
pub fn attach_command<I, S>(
    ctx: &HarnessContext,
    container: &str,
    env: &[(String, String)],
    program: &str,
    args: I,
) -> CommandSpec
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut spec = CommandSpec::privileged(ctx.config().lxc.attach_program.as_str())
        .args([
            "-P".to_string(),
            ctx.config().paths.lxc_path.display().to_string(),
            "-n".to_string(),
            container.to_string(),
        ]);
    for (key, value) in env {
        spec = spec.arg("-v").arg(format!("{key}={value}"));
    }
    spec.arg("--").arg(program).args(args)
}

/// Runs a command in the container and returns the first line of its
/// output, or `None` if it printed nothing. A non-zero exit is an error.
pub fn run_in_container<I, S>(
    ctx: &HarnessContext,
    container: &str,
    program: &str,
    args: I,
) -> Result<Option<String>>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let spec = attach_command(ctx, container, &[], program, args);
    Ok(ctx.runner().run_checked(&spec)?.first_line())
}

/// Runs a command in the container and reports only whether it succeeded.
pub fn probe_in_container<I, S>(
    ctx: &HarnessContext,
    container: &str,
    program: &str,
    args: I,
) -> Result<bool>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let spec = attach_command(ctx, container, &[], program, args);
    Ok(ctx.runner().run(&spec)?.success())
}

/// A daemon running inside a container. Dropping the handle kills the
/// daemon in the container and the local attach process.
pub struct DaemonHandle {
    container: String,
    command: String,
    log_path: PathBuf,
    process: Box<dyn ProcessHandle>,
    runner: Arc<dyn CommandRunner>,
    /// `pkill -f <program>` inside the container.
    kill_in_container: CommandSpec,
}

impl DaemonHandle {
    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn is_running(&mut self) -> bool {
        self.process.is_running()
    }

    pub fn exit_code(&mut self) -> Option<i32> {
        self.process.exit_code()
    }

    /// Everything the daemon has written so far.
    pub fn read_log(&self) -> Result<String> {
        Ok(std::fs::read_to_string(&self.log_path)?)
    }

    /// Kills the daemon inside the container, then the attach process.
    pub fn stop(mut self) -> Result<()> {
        tracing::info!(container = %self.container, command = %self.command, "stopping daemon");
        self.terminate()
    }

    fn terminate(&mut self) -> Result<()> {
        if self.process.is_running() {
            match self.runner.run(&self.kill_in_container) {
                Ok(out) if !out.success() => {
                    tracing::debug!(container = %self.container, "pkill matched nothing");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(container = %self.container, error = %e, "failed to run pkill");
                }
            }
        }
        self.process.kill()
    }
}

impl Drop for DaemonHandle {
    fn drop(&mut self) {
        if let Err(e) = self.terminate() {
            tracing::warn!(container = %self.container, error = %e, "failed to kill daemon");
        }
    }
}

/// Starts `spec` detached inside the container and waits for it to
/// signal readiness.
pub fn daemonize_in_container(
    ctx: &HarnessContext,
    container: &str,
    spec: DaemonSpec,
) -> Result<DaemonHandle> {
    let seq = DAEMON_SEQ.fetch_add(1, Ordering::Relaxed);
    let log_dir = &ctx.config().log_dir;
    std::fs::create_dir_all(log_dir)?;
    let program_name = Path::new(&spec.program)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "daemon".into());
    let log_path = log_dir.join(format!("{container}-{program_name}-{seq}.log"));

    let mut env = spec.env.clone();
    let marker = format!("/tmp/meshbox-ready-{}-{seq}", std::process::id());
    if spec.readiness == Readiness::Marker {
        env.push((READY_FILE_ENV.to_string(), marker.clone()));
    }

    let attach = attach_command(ctx, container, &env, &spec.program, spec.args.iter().cloned());
    tracing::info!(container, command = %spec.display(), log = %log_path.display(), "starting daemon");
    let process = ctx.runner().spawn(&attach, &log_path)?;

    let mut handle = DaemonHandle {
        container: container.to_string(),
        command: spec.display(),
        log_path,
        process,
        runner: ctx.runner_handle(),
        kill_in_container: attach_command(
            ctx,
            container,
            &[],
            "pkill",
            ["-f", spec.program.as_str()],
        ),
    };

    if spec.readiness == Readiness::None {
        return Ok(handle);
    }

    let t = &ctx.config().timeouts;
    let settings = PollSettings::new(t.poll_interval, t.ready_wait);
    let what = format!("readiness of `{}` in {container}", handle.command);
    poll_until(&what, settings, || {
        if !handle.process.is_running() {
            return Err(HarnessError::DaemonExited {
                container: handle.container.clone(),
                command: handle.command.clone(),
                status: handle.process.exit_code(),
            });
        }
        let ready = match &spec.readiness {
            Readiness::Marker => probe_in_container(ctx, container, "test", ["-e", marker.as_str()])?,
            Readiness::LogLine(pattern) => std::fs::read_to_string(&handle.log_path)
                .map(|log| log.contains(pattern.as_str()))
                .unwrap_or(false),
            Readiness::None => true,
        };
        Ok(ready.then_some(()))
    })?;

    tracing::info!(container, command = %handle.command, "daemon ready");
    Ok(handle)
}
