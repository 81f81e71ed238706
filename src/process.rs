//! Child process handles for the three radios.
//!
//! A [`CaptureProcess`] owns its `tokio` child, so every launched radio is tracked until it
//! has been reaped. Termination escalates from SIGTERM to SIGKILL after a grace period;
//! `kill_on_drop` is the last line if a handle is dropped early (e.g. an attempt future is
//! cancelled by an interrupt).

use crate::command::CaptureCommand;
use crate::config::DeviceRole;
use crate::error::AttemptFailure;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tracing::{debug, warn};

/// Lifecycle of one capture process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Launched, readiness not yet observed.
    Starting,
    /// Receiver reported that it is waiting for the trigger.
    Armed,
    /// Trigger issued (or transmitter running).
    Running,
    /// Exited on its own with this code.
    Exited(i32),
    /// Stopped by the controller.
    TerminatedByController,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::Starting => write!(f, "starting"),
            ProcessState::Armed => write!(f, "armed"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Exited(code) => write!(f, "exited({code})"),
            ProcessState::TerminatedByController => write!(f, "terminated"),
        }
    }
}

/// One running radio process.
#[derive(Debug)]
pub struct CaptureProcess {
    role: DeviceRole,
    pid: u32,
    child: Child,
    state: ProcessState,
    exit_code: Option<i32>,
    log_path: PathBuf,
    output_path: Option<PathBuf>,
    started: Instant,
}

impl CaptureProcess {
    /// Launch with stdout/stderr piped back to the controller (receivers).
    pub fn spawn_piped(
        command: &CaptureCommand,
        log_path: &Path,
        output_path: Option<&Path>,
    ) -> Result<Self, AttemptFailure> {
        let mut cmd = command.to_command();
        Self::launch(command, &mut cmd, log_path, output_path)
    }

    /// Launch with stdout and stderr written straight into `log_path` (transmitter).
    pub fn spawn_logged(command: &CaptureCommand, log_path: &Path) -> Result<Self, AttemptFailure> {
        let log = File::create(log_path)?;
        let log_err = log.try_clone()?;
        let mut cmd = command.to_command();
        cmd.stdout(Stdio::from(log)).stderr(Stdio::from(log_err));
        Self::launch(command, &mut cmd, log_path, None)
    }

    fn launch(
        command: &CaptureCommand,
        cmd: &mut tokio::process::Command,
        log_path: &Path,
        output_path: Option<&Path>,
    ) -> Result<Self, AttemptFailure> {
        let launch_err = |source: std::io::Error| AttemptFailure::Launch {
            role: command.role,
            program: command.program.clone(),
            source,
        };
        let child = cmd.spawn().map_err(launch_err)?;
        let pid = child.id().ok_or_else(|| {
            launch_err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "process exited before its pid could be read",
            ))
        })?;
        debug!(role = %command.role, pid, cmd = %command, "launched");
        Ok(Self {
            role: command.role,
            pid,
            child,
            state: ProcessState::Starting,
            exit_code: None,
            log_path: log_path.to_path_buf(),
            output_path: output_path.map(Path::to_path_buf),
            started: Instant::now(),
        })
    }

    /// Device role.
    pub fn role(&self) -> DeviceRole {
        self.role
    }

    /// OS process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Exit code once reaped. Signal deaths are reported as `128 + signo`.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Attempt-scoped log file.
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Attempt-scoped capture file, receivers only.
    pub fn output_path(&self) -> Option<&Path> {
        self.output_path.as_deref()
    }

    /// Time since launch.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Take the piped output streams. Only the first call returns them.
    pub fn take_output(&mut self) -> (Option<ChildStdout>, Option<ChildStderr>) {
        (self.child.stdout.take(), self.child.stderr.take())
    }

    /// Record that the receiver reported readiness.
    pub fn mark_armed(&mut self) {
        if self.state == ProcessState::Starting {
            self.state = ProcessState::Armed;
        }
    }

    /// Record that the trigger has been issued.
    pub fn mark_running(&mut self) {
        if matches!(self.state, ProcessState::Starting | ProcessState::Armed) {
            self.state = ProcessState::Running;
        }
    }

    /// Whether the process has been reaped.
    pub fn has_exited(&self) -> bool {
        self.exit_code.is_some()
    }

    /// Non-blocking exit check.
    pub fn try_exit(&mut self) -> std::io::Result<Option<i32>> {
        if let Some(code) = self.exit_code {
            return Ok(Some(code));
        }
        match self.child.try_wait()? {
            Some(status) => Ok(Some(self.record_exit(status))),
            None => Ok(None),
        }
    }

    /// Wait for the process to exit.
    pub async fn wait(&mut self) -> std::io::Result<i32> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        let status = self.child.wait().await?;
        Ok(self.record_exit(status))
    }

    /// Wait at most `limit`; `Ok(None)` means the process is still running.
    pub async fn wait_timeout(&mut self, limit: Duration) -> std::io::Result<Option<i32>> {
        match tokio::time::timeout(limit, self.wait()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Stop the process: SIGTERM, wait up to `grace`, then SIGKILL. Returns the exit code.
    ///
    /// A no-op for processes that already exited.
    pub async fn terminate(&mut self, grace: Duration) -> std::io::Result<i32> {
        if let Some(code) = self.try_exit()? {
            return Ok(code);
        }
        debug!(role = %self.role, pid = self.pid, "terminating");
        self.send_term();
        let code = match self.wait_timeout(grace).await? {
            Some(code) => code,
            None => {
                warn!(role = %self.role, pid = self.pid, ?grace, "ignored SIGTERM, killing");
                self.child.start_kill()?;
                self.wait().await?
            }
        };
        self.state = ProcessState::TerminatedByController;
        Ok(code)
    }

    #[cfg(unix)]
    fn send_term(&mut self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(self.pid) else {
            let _ = self.child.start_kill();
            return;
        };
        if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
            debug!(role = %self.role, pid = self.pid, error = %e, "SIGTERM failed, killing");
            let _ = self.child.start_kill();
        }
    }

    #[cfg(not(unix))]
    fn send_term(&mut self) {
        let _ = self.child.start_kill();
    }

    fn record_exit(&mut self, status: ExitStatus) -> i32 {
        let code = exit_code(status);
        self.exit_code = Some(code);
        if self.state != ProcessState::TerminatedByController {
            self.state = ProcessState::Exited(code);
        }
        debug!(role = %self.role, pid = self.pid, code, "exited");
        code
    }
}

/// Shell-style exit code: the status code, or `128 + signal` for signal deaths.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    -1
}
