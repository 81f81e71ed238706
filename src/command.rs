//! Argument vectors for the capture tool.
//!
//! Builders are pure: they only look at the [`RunConfiguration`] and the paths chosen for
//! the current attempt, so the exact invocation is easy to test and to log.

use crate::config::{DeviceRole, RunConfiguration};
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::Path;
use std::process::Stdio;

/// A fully specified capture tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureCommand {
    /// Which radio this invocation drives.
    pub role: DeviceRole,
    /// Program name or path.
    pub program: String,
    /// Arguments, in order.
    pub args: Vec<OsString>,
}

impl CaptureCommand {
    fn new(role: DeviceRole, program: &str) -> Self {
        Self {
            role,
            program: program.to_string(),
            args: Vec::new(),
        }
    }

    fn arg(&mut self, flag: &str, value: impl AsRef<OsStr>) -> &mut Self {
        self.args.push(OsString::from(flag));
        self.args.push(value.as_ref().to_os_string());
        self
    }

    fn flag(&mut self, flag: &str) -> &mut Self {
        self.args.push(OsString::from(flag));
        self
    }

    /// Arguments as lossy strings, for logs and assertions.
    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    /// A `tokio` command with piped stdio and no inherited stdin.
    ///
    /// `kill_on_drop` is set so a child can never outlive a dropped handle.
    pub fn to_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl fmt::Display for CaptureCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Receive invocation: capture `num_samples` into `out_path`.
///
/// `-H` is appended when hardware triggering is enabled, so the receiver arms and waits for
/// the trigger edge instead of sampling immediately.
pub fn build_rx_command(
    config: &RunConfiguration,
    role: DeviceRole,
    out_path: &Path,
) -> CaptureCommand {
    let rx = config.receiver(role);
    let mut cmd = CaptureCommand::new(role, &config.tools.capture_program);
    cmd.arg("-r", out_path)
        .arg("-n", config.rf.num_samples.to_string())
        .arg("-f", config.rf.center_freq_hz.to_string())
        .arg("-s", config.rf.sample_rate_hz.to_string())
        .arg("-l", rx.lna_db.to_string())
        .arg("-g", rx.vga_db.to_string());
    if let Some(serial) = rx.serial.as_deref() {
        cmd.arg("-d", serial);
    }
    if config.hw_trigger {
        cmd.flag("-H");
    }
    cmd
}

/// Transmit invocation: replay the configured waveform once.
pub fn build_tx_command(config: &RunConfiguration) -> CaptureCommand {
    let tx = &config.tx;
    let mut cmd = CaptureCommand::new(DeviceRole::Tx, &config.tools.capture_program);
    cmd.arg("-t", &tx.waveform)
        .arg("-f", config.rf.center_freq_hz.to_string())
        .arg("-s", config.rf.sample_rate_hz.to_string())
        .arg("-x", tx.amp_db.to_string())
        .arg("-a", if tx.rf_amp { "1" } else { "0" })
        .arg("-p", if tx.antenna_power { "1" } else { "0" });
    if let Some(serial) = tx.serial.as_deref() {
        cmd.arg("-d", serial);
    }
    cmd
}
