//! Device Resource Guard.
//!
//! A radio can only be opened by one process at a time. Leftover capture processes from a
//! crashed attempt (or from another user) keep a device busy and make the next attempt
//! fail with a confusing "resource busy" error. The guard inspects the OS process table
//! (via `sysinfo`) for capture tool processes bound to a serial (`-d <serial>` on the
//! command line) and can terminate them.
//!
//! Busy devices are never an error. Before a run the guard waits briefly and warns; after
//! a run it waits briefly, warns and terminates the stragglers.

use crate::config::{DeviceRole, GuardSettings};
use std::path::Path;
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, Signal, System, UpdateKind};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// A capture process found holding a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundProcess {
    /// OS process id.
    pub pid: u32,
    /// Serial it was started with.
    pub serial: String,
    /// Full command line, space separated.
    pub cmdline: String,
}

/// Whether a command line runs `program` against device `serial`.
///
/// The program may appear anywhere before the device flag, so interpreter-launched tools
/// (`sh /path/to/tool -d X`) are recognised. Both `-d X` and `-dX` forms match; the serial
/// must match exactly.
pub fn cmdline_binds_serial<S: AsRef<str>>(tokens: &[S], program: &str, serial: &str) -> bool {
    let program = program_name(program);
    let mut seen_program = false;
    let mut iter = tokens.iter().flat_map(|t| t.as_ref().split_whitespace());

    while let Some(token) = iter.next() {
        if !seen_program {
            seen_program = program_name(token) == program;
            continue;
        }
        if token == "-d" {
            if iter.next() == Some(serial) {
                return true;
            }
        } else if let Some(rest) = token.strip_prefix("-d") {
            if rest == serial {
                return true;
            }
        }
    }
    false
}

fn program_name(token: &str) -> &str {
    Path::new(token)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(token)
}

/// Scans for and terminates capture processes by device serial.
#[derive(Debug, Clone)]
pub struct DeviceGuard {
    program: String,
    settings: GuardSettings,
}

impl DeviceGuard {
    /// Guard for processes running `program` (e.g. `hackrf_transfer`).
    pub fn new(program: impl Into<String>, settings: GuardSettings) -> Self {
        Self {
            program: program.into(),
            settings,
        }
    }

    /// Guard timings.
    pub fn settings(&self) -> &GuardSettings {
        &self.settings
    }

    /// Capture processes currently bound to `serial`.
    pub async fn bound_processes(&self, serial: &str) -> Vec<BoundProcess> {
        let program = self.program.clone();
        let serial = serial.to_string();
        match tokio::task::spawn_blocking(move || scan(&program, &serial)).await {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "process table scan failed");
                Vec::new()
            }
        }
    }

    /// Whether any capture process is bound to `serial`.
    pub async fn is_busy(&self, serial: &str) -> bool {
        !self.bound_processes(serial).await.is_empty()
    }

    /// Poll until `serial` is free or `timeout` elapses. Returns `true` if free.
    pub async fn wait_free(&self, serial: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_busy(serial).await {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(
                self.settings
                    .poll_interval
                    .min(deadline.saturating_duration_since(Instant::now())),
            )
            .await;
        }
    }

    /// SIGTERM every process bound to `serial`, wait up to the grace period, then SIGKILL
    /// the survivors. Returns the number of processes signalled.
    pub async fn terminate_serial(&self, serial: &str) -> usize {
        let bound = self.bound_processes(serial).await;
        if bound.is_empty() {
            return 0;
        }
        for proc in &bound {
            info!(%serial, pid = proc.pid, cmd = %proc.cmdline, "terminating process holding device");
        }
        let pids: Vec<u32> = bound.iter().map(|p| p.pid).collect();
        signal_pids(pids, Signal::Term).await;

        if self.wait_free(serial, self.settings.terminate_grace).await {
            return bound.len();
        }

        let survivors: Vec<u32> = self
            .bound_processes(serial)
            .await
            .into_iter()
            .map(|p| p.pid)
            .collect();
        warn!(%serial, pids = ?survivors, "processes ignored SIGTERM, killing");
        signal_pids(survivors, Signal::Kill).await;
        bound.len()
    }

    /// Terminate processes for every serial given.
    pub async fn terminate_all(&self, serials: &[(DeviceRole, String)]) -> usize {
        let mut total = 0;
        for (role, serial) in serials {
            let n = self.terminate_serial(serial).await;
            if n > 0 {
                debug!(%role, %serial, count = n, "terminated device holders");
            }
            total += n;
        }
        total
    }

    /// Pre-run check: wait briefly for each device, warn (but carry on) if still busy.
    pub async fn before_run(&self, serials: &[(DeviceRole, String)]) {
        for (role, serial) in serials {
            if !self.wait_free(serial, self.settings.pre_run_timeout).await {
                let pids: Vec<u32> = self.bound_processes(serial).await.iter().map(|p| p.pid).collect();
                warn!(
                    %role,
                    %serial,
                    ?pids,
                    timeout = ?self.settings.pre_run_timeout,
                    "device still busy before run, continuing"
                );
            }
        }
    }

    /// Post-run check: wait briefly for each device to be released, terminate stragglers.
    pub async fn after_run(&self, serials: &[(DeviceRole, String)]) {
        for (role, serial) in serials {
            if self.wait_free(serial, self.settings.post_run_timeout).await {
                continue;
            }
            warn!(
                %role,
                %serial,
                timeout = ?self.settings.post_run_timeout,
                "device still busy after run, cleaning up"
            );
            self.terminate_serial(serial).await;
        }
    }
}

fn refresh_processes() -> System {
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
    );
    system
}

fn scan(program: &str, serial: &str) -> Vec<BoundProcess> {
    let own_pid = std::process::id();
    let system = refresh_processes();

    system
        .processes()
        .iter()
        .filter(|(pid, proc)| {
            pid.as_u32() != own_pid
                && proc.thread_kind().is_none()
                && !matches!(proc.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
        })
        .filter_map(|(pid, proc)| {
            let tokens: Vec<String> = proc
                .cmd()
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect();
            cmdline_binds_serial(&tokens, program, serial).then(|| BoundProcess {
                pid: pid.as_u32(),
                serial: serial.to_string(),
                cmdline: tokens.join(" "),
            })
        })
        .collect()
}

async fn signal_pids(pids: Vec<u32>, signal: Signal) {
    let result = tokio::task::spawn_blocking(move || {
        let system = refresh_processes();
        for raw in pids {
            let Some(proc) = system.process(Pid::from_u32(raw)) else {
                continue;
            };
            let sent = match signal {
                Signal::Kill => proc.kill(),
                other => proc.kill_with(other).unwrap_or_else(|| proc.kill()),
            };
            if !sent {
                warn!(pid = raw, ?signal, "could not signal process");
            }
        }
    })
    .await;
    if let Err(e) = result {
        warn!(error = %e, "signalling task failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_separate_and_joined_flag() {
        let cmd = ["hackrf_transfer", "-r", "rx1.iq", "-d", "ABC123", "-H"];
        assert!(cmdline_binds_serial(&cmd, "hackrf_transfer", "ABC123"));

        let joined = ["/usr/bin/hackrf_transfer", "-t", "pilot.iq", "-dABC123"];
        assert!(cmdline_binds_serial(&joined, "hackrf_transfer", "ABC123"));
    }

    #[test]
    fn serial_must_match_exactly() {
        let cmd = ["hackrf_transfer", "-d", "ABC1234"];
        assert!(!cmdline_binds_serial(&cmd, "hackrf_transfer", "ABC123"));
        assert!(!cmdline_binds_serial(&cmd, "hackrf_transfer", "ABC12345"));
    }

    #[test]
    fn other_programs_are_ignored() {
        let cmd = ["vim", "notes-about-hackrf_transfer", "-d", "ABC123"];
        assert!(!cmdline_binds_serial(&cmd, "hackrf_transfer", "ABC123"));
        let cmd = ["grep", "-d", "ABC123", "hackrf_transfer"];
        assert!(!cmdline_binds_serial(&cmd, "hackrf_transfer", "ABC123"));
    }

    #[test]
    fn interpreter_launched_tool_matches() {
        let cmd = ["/bin/sh", "/tmp/x/fake_transfer", "-r", "out.iq", "-d", "SER"];
        assert!(cmdline_binds_serial(&cmd, "/tmp/x/fake_transfer", "SER"));
    }

    #[test]
    fn single_string_cmdline_is_tokenized() {
        let cmd = ["hackrf_transfer -r out.iq -d SER -H"];
        assert!(cmdline_binds_serial(&cmd, "hackrf_transfer", "SER"));
    }
}
