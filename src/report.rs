//! Documents written next to the captures: the configuration snapshot taken when a run
//! starts, the run report written when it ends, and the session-level configuration.

use crate::config::{CollectConfig, DeviceRole, RunConfiguration};
use crate::error::AppResult;
use crate::layout::{RunPaths, SESSION_CONFIG_FILE};
use crate::retry::{AttemptRecord, RunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Host and software provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    /// Machine hostname.
    pub hostname: String,
    /// Controller version.
    pub software_version: String,
    /// Operating system family.
    pub os: String,
}

impl HostInfo {
    /// Describe the current host.
    pub fn current() -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            hostname,
            software_version: env!("CARGO_PKG_VERSION").to_string(),
            os: std::env::consts::OS.to_string(),
        }
    }
}

/// One canonical capture file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    /// Receiver role.
    pub role: DeviceRole,
    /// Canonical path.
    pub path: PathBuf,
    /// Size in bytes, `None` if the file is absent.
    pub bytes: Option<u64>,
    /// Hex SHA-256 of the contents, `None` if the file is absent or unreadable.
    #[serde(default)]
    pub sha256: Option<String>,
}

/// Outcome of one run, written as `run_report.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Run ordinal.
    pub run: u32,
    /// `run_0001` style name.
    pub run_name: String,
    /// Terminal status.
    pub status: RunStatus,
    /// Session directory.
    pub session_dir: PathBuf,
    /// Wall-clock start.
    pub started_at: DateTime<Utc>,
    /// Wall-clock end.
    pub finished_at: DateTime<Utc>,
    /// Attempt-by-attempt diagnostics.
    pub attempts: Vec<AttemptRecord>,
    /// Canonical capture files.
    pub outputs: Vec<OutputFile>,
    /// Provenance.
    pub host: HostInfo,
}

impl RunReport {
    /// Canonical captures that exist but are empty.
    pub fn empty_outputs(&self) -> Vec<&OutputFile> {
        self.outputs.iter().filter(|o| o.bytes == Some(0)).collect()
    }
}

/// Stat and hash the canonical capture files of `receivers`.
pub fn collect_outputs(run: &RunPaths, receivers: &[DeviceRole]) -> Vec<OutputFile> {
    receivers
        .iter()
        .map(|role| {
            let path = run.canonical_output(*role);
            let bytes = fs::metadata(&path).ok().filter(|m| m.is_file()).map(|m| m.len());
            let sha256 = match bytes {
                Some(_) => match file_sha256(&path) {
                    Ok(digest) => Some(digest),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "could not hash capture");
                        None
                    }
                },
                None => None,
            };
            OutputFile {
                role: *role,
                path,
                bytes,
                sha256,
            }
        })
        .collect()
}

/// Hex SHA-256 of a file, streamed.
pub fn file_sha256(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Write `run_config.toml`.
pub fn write_config_snapshot(run: &RunPaths, config: &RunConfiguration) -> AppResult<PathBuf> {
    let path = run.config_snapshot();
    let body = toml::to_string_pretty(config)?;
    fs::write(&path, body)?;
    Ok(path)
}

/// Write `run_report.json`.
pub fn write_run_report(run: &RunPaths, report: &RunReport) -> AppResult<PathBuf> {
    let path = run.report();
    fs::write(&path, serde_json::to_string_pretty(report)?)?;
    Ok(path)
}

/// Write `session_config.json` at the session root.
pub fn write_session_config(session_dir: &Path, config: &CollectConfig) -> AppResult<PathBuf> {
    let path = session_dir.join(SESSION_CONFIG_FILE);
    fs::write(&path, serde_json::to_string_pretty(config)?)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_round_trips_durations_and_serials() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunPaths::new(dir.path(), 1);
        run.create().unwrap();

        let mut config = RunConfiguration::default();
        config.rx1.serial = Some("RX1".into());
        config.timing.safety_margin = std::time::Duration::from_millis(150);

        let path = write_config_snapshot(&run, &config).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("sample_rate_hz = 20000000"));
        assert!(text.contains("150ms"));

        let back: RunConfiguration = toml::from_str(&text).unwrap();
        assert_eq!(back.rx1.serial.as_deref(), Some("RX1"));
        assert_eq!(back.timing.safety_margin, config.timing.safety_margin);
        assert_eq!(back.rf.num_samples, config.rf.num_samples);
    }

    #[test]
    fn report_flags_empty_captures() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunPaths::new(dir.path(), 2);
        run.create().unwrap();
        fs::write(run.canonical_output(DeviceRole::Rx1), b"").unwrap();
        fs::write(run.canonical_output(DeviceRole::Rx2), b"\x01\x02").unwrap();

        let report = RunReport {
            run: 2,
            run_name: run.name(),
            status: RunStatus::Succeeded,
            session_dir: dir.path().to_path_buf(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            attempts: Vec::new(),
            outputs: collect_outputs(&run, &DeviceRole::RECEIVERS),
            host: HostInfo::current(),
        };
        let empty = report.empty_outputs();
        assert_eq!(empty.len(), 1);
        assert_eq!(empty[0].role, DeviceRole::Rx1);

        let path = write_run_report(&run, &report).unwrap();
        let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(json["status"], "succeeded");
        assert_eq!(json["run_name"], "run_0002");
        assert_eq!(json["outputs"][1]["bytes"], 2);
        assert_eq!(
            json["outputs"][0]["sha256"],
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            json["outputs"][1]["sha256"],
            "a12871fee210fb8619291eaea194581cbd2531e4b23759d225f6806923f63222"
        );
    }

    #[test]
    fn missing_capture_has_no_digest() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunPaths::new(dir.path(), 3);
        run.create().unwrap();

        let outputs = collect_outputs(&run, &[DeviceRole::Rx1]);
        assert_eq!(outputs[0].bytes, None);
        assert_eq!(outputs[0].sha256, None);
    }

    #[test]
    fn session_config_is_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_session_config(dir.path(), &CollectConfig::default()).unwrap();
        let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(json["rf"]["num_samples"], 7000);
        assert_eq!(json["retry"]["backoff"], "250ms");
    }
}
