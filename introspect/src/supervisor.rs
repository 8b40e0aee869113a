//! Worker supervisor - spawns the worker subprocess and owns its process handle.
//!
//! Flow:
//! 1. Spawn the worker with stdin/stdout/stderr piped
//! 2. Hand the three streams to the owner (the client)
//! 3. Report liveness and wait for exit
//!
//! Asking the worker to stop is done over the protocol by the owner. The
//! supervisor only kills the process when a bounded wait runs out, or when
//! startup failed and the half-started worker has to be reaped.

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// What to launch. The supervisor does not care what the program is, only that
/// it speaks the wire protocol on its standard streams.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub current_dir: Option<PathBuf>,
    pub env: Vec<(OsString, OsString)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            env: Vec::new(),
        }
    }

    /// `<entrypoint> runner <script> start`: run a worker script inside the
    /// application's own runtime.
    pub fn runner(entrypoint: impl Into<PathBuf>, script: impl Into<OsString>) -> Self {
        Self::new(entrypoint).arg("runner").arg(script).arg("start")
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Extension point for different worker spawn strategies.
///
/// Implementations must pipe all three standard streams.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, command: &WorkerCommand) -> Result<Child, SpawnError>;
}

/// Spawns the command directly, detached into its own session where possible.
pub struct CommandSpawner;

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, command: &WorkerCommand) -> Result<Child, SpawnError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref dir) = command.current_dir {
            cmd.current_dir(dir);
        }

        #[cfg(unix)]
        detach_session(&mut cmd);

        Ok(cmd.spawn()?)
    }
}

/// Best-effort `setsid` in the child before exec. A failure leaves the worker in
/// the controller's session, which `start` reports.
#[cfg(unix)]
fn detach_session(cmd: &mut Command) {
    // SAFETY: setsid(2) is async-signal-safe and the closure touches no parent state.
    unsafe {
        cmd.pre_exec(|| {
            let _ = nix::unistd::setsid();
            Ok(())
        });
    }
}

#[cfg(unix)]
fn log_session(pid: Option<u32>) {
    let Some(raw) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    let pid = nix::unistd::Pid::from_raw(raw);
    match nix::unistd::getsid(Some(pid)) {
        Ok(sid) if sid == pid => tracing::debug!(%pid, "Worker detached into its own session"),
        Ok(sid) => tracing::warn!(
            %pid,
            %sid,
            "Worker could not be detached into its own session, continuing"
        ),
        Err(e) => tracing::debug!(%pid, error = %e, "Could not read worker session"),
    }
}

/// A spawned worker: its process plus the three byte streams.
pub struct WorkerHandle {
    pub process: WorkerProcess,
    /// Controller to worker.
    pub stdin: ChildStdin,
    /// Worker to controller.
    pub stdout: ChildStdout,
    /// Worker diagnostics.
    pub stderr: ChildStderr,
}

/// Launch the worker and take ownership of its streams.
pub fn start(
    spawner: &dyn WorkerSpawner,
    command: &WorkerCommand,
) -> Result<WorkerHandle, SpawnError> {
    tracing::info!(program = %command.program.display(), "Spawning worker subprocess");

    let mut child = spawner.spawn(command)?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| SpawnError::Other("stdin not captured".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SpawnError::Other("stdout not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| SpawnError::Other("stderr not captured".to_string()))?;

    let process = WorkerProcess::new(child);
    tracing::debug!(pid = ?process.pid(), "Worker spawned");

    #[cfg(unix)]
    log_session(process.pid());

    Ok(WorkerHandle {
        process,
        stdin,
        stdout,
        stderr,
    })
}

/// Process side of a worker handle.
pub struct WorkerProcess {
    child: Child,
    pid: Option<u32>,
    exit_status: Option<ExitStatus>,
}

impl WorkerProcess {
    pub fn new(child: Child) -> Self {
        let pid = child.id();
        Self {
            child,
            pid,
            exit_status: None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit status, once the exit has been observed.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    pub fn has_exited(&self) -> bool {
        self.exit_status.is_some()
    }

    /// Non-blocking liveness check; records the exit when it has happened.
    pub fn is_alive(&mut self) -> bool {
        if self.exit_status.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.record_exit(status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                tracing::warn!(pid = ?self.pid, error = %e, "Failed to poll worker status");
                true
            }
        }
    }

    /// Block until the worker exits. If it is still running after `timeout`
    /// it is killed, so this always ends with a reaped process.
    pub async fn wait_for_exit(&mut self, timeout: Duration) -> io::Result<ExitStatus> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }

        let status = match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                tracing::warn!(
                    pid = ?self.pid,
                    timeout_secs = timeout.as_secs_f64(),
                    "Worker did not exit in time, killing it"
                );
                self.child.kill().await?;
                self.child.wait().await?
            }
        };

        self.record_exit(status);
        Ok(status)
    }

    /// Kill and reap. Used when the worker never became ready.
    pub async fn terminate(&mut self) -> io::Result<ExitStatus> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(pid = ?self.pid, error = %e, "Kill failed, worker already exited");
        }
        let status = self.child.wait().await?;
        self.record_exit(status);
        Ok(status)
    }

    fn record_exit(&mut self, status: ExitStatus) {
        tracing::debug!(pid = ?self.pid, %status, "Worker exited");
        self.exit_status = Some(status);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> WorkerCommand {
        WorkerCommand::new("/bin/sh").arg("-c").arg(script)
    }

    #[test]
    fn runner_command_layout() {
        let command = WorkerCommand::runner("bin/rails", "/tmp/server.rb");
        assert_eq!(command.program, PathBuf::from("bin/rails"));
        assert_eq!(
            command.args,
            vec![
                OsString::from("runner"),
                OsString::from("/tmp/server.rb"),
                OsString::from("start"),
            ]
        );
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let result = start(&CommandSpawner, &WorkerCommand::new("/nonexistent/worker-bin"));
        assert!(matches!(result, Err(SpawnError::Spawn(_))));
    }

    #[tokio::test]
    async fn worker_runs_in_its_own_session() {
        let mut handle = start(&CommandSpawner, &sh("sleep 5")).unwrap();
        let pid = nix::unistd::Pid::from_raw(handle.process.pid().unwrap() as i32);

        assert_eq!(nix::unistd::getsid(Some(pid)).unwrap(), pid);

        handle.process.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_exit_reports_status() {
        let mut handle = start(&CommandSpawner, &sh("exit 3")).unwrap();

        let status = handle
            .process
            .wait_for_exit(Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(status.code(), Some(3));
        assert!(!handle.process.is_alive());
        assert!(handle.process.has_exited());
    }

    #[tokio::test]
    async fn wait_for_exit_kills_after_timeout() {
        let mut handle = start(&CommandSpawner, &sh("sleep 30")).unwrap();
        assert!(handle.process.is_alive());

        let status = handle
            .process
            .wait_for_exit(Duration::from_millis(100))
            .await
            .unwrap();

        assert!(!status.success());
        assert!(!handle.process.is_alive());
    }

    #[tokio::test]
    async fn terminate_is_repeatable() {
        let mut handle = start(&CommandSpawner, &sh("sleep 30")).unwrap();

        let first = handle.process.terminate().await.unwrap();
        let second = handle.process.terminate().await.unwrap();

        assert_eq!(first, second);
        assert!(!handle.process.is_alive());
    }

    #[tokio::test]
    async fn environment_and_directory_are_applied() {
        use tokio::io::AsyncReadExt;

        let command = sh("printf '%s:%s' \"$WORKER_FLAVOR\" \"$(pwd)\"")
            .env("WORKER_FLAVOR", "test")
            .current_dir("/");
        let mut handle = start(&CommandSpawner, &command).unwrap();

        let mut out = String::new();
        handle.stdout.read_to_string(&mut out).await.unwrap();
        handle
            .process
            .wait_for_exit(Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(out, "test:/");
    }
}
