//! Configuration for the capture controller using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (`config/collect.toml` unless `--config` says otherwise)
//! 2. environment variables prefixed with `RF_COLLECT_`, nested keys separated by `__`
//!
//! Every section has defaults, so an empty or missing file yields a usable configuration.
//!
//! # Example
//! ```no_run
//! use rf_collect::config::CollectConfig;
//!
//! let config = CollectConfig::load_from("config/collect.toml")?;
//! config.validate()?;
//! println!("runs: {}", config.session.runs);
//! # Ok::<(), rf_collect::error::CollectError>(())
//! ```
//!
//! Environment example: `RF_COLLECT_RF__NUM_SAMPLES=14000`.

use crate::error::{AppResult, CollectError};
use crate::validation;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/collect.toml";

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "RF_COLLECT_";

/// One of the three radios taking part in a capture attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    /// First receiver.
    Rx1,
    /// Second receiver.
    Rx2,
    /// Transmitter.
    Tx,
}

impl DeviceRole {
    /// Both receiver roles in launch order.
    pub const RECEIVERS: [DeviceRole; 2] = [DeviceRole::Rx1, DeviceRole::Rx2];

    /// Short lowercase label used in file names and logs.
    pub fn label(self) -> &'static str {
        match self {
            DeviceRole::Rx1 => "rx1",
            DeviceRole::Rx2 => "rx2",
            DeviceRole::Tx => "tx",
        }
    }

    /// Whether this role captures samples.
    pub fn is_receiver(self) -> bool {
        !matches!(self, DeviceRole::Tx)
    }
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Top-level controller configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectConfig {
    /// Session-wide settings (run count, output location).
    pub session: SessionSettings,
    /// Per-run capture parameters. Flattened so `[rf]`, `[rx1]`, ... are top-level tables.
    #[serde(flatten)]
    pub capture: RunConfiguration,
    /// Device resource guard timings.
    pub guard: GuardSettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}

/// Session-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Number of runs to execute.
    pub runs: u32,
    /// Directory under which session directories are created.
    pub data_root: PathBuf,
    /// Optional tag appended to the session directory name.
    pub tag: Option<String>,
    /// Zip the session directory after the last run.
    pub archive: bool,
    /// Directory mirrored with the most recent completed run. Defaults to `<data_root>/Latest`.
    pub latest_dir: Option<PathBuf>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            runs: 1,
            data_root: PathBuf::from("Data"),
            tag: None,
            archive: false,
            latest_dir: None,
        }
    }
}

impl SessionSettings {
    /// Resolved location of the latest-run mirror.
    pub fn latest_dir(&self) -> PathBuf {
        self.latest_dir
            .clone()
            .unwrap_or_else(|| self.data_root.join("Latest"))
    }
}

/// Everything needed to execute one run. Treated as immutable once a session starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfiguration {
    /// Shared RF parameters.
    pub rf: RfSettings,
    /// First receiver.
    pub rx1: ReceiverSettings,
    /// Second receiver.
    pub rx2: ReceiverSettings,
    /// Transmitter.
    pub tx: TransmitterSettings,
    /// Receivers wait for an external hardware trigger edge before sampling.
    pub hw_trigger: bool,
    /// Timing budget for each attempt.
    pub timing: TimingBudget,
    /// Retry policy for failed attempts.
    pub retry: RetrySettings,
    /// Readiness detection.
    pub readiness: ReadinessSettings,
    /// External tool locations.
    pub tools: ToolSettings,
}

impl Default for RunConfiguration {
    fn default() -> Self {
        Self {
            rf: RfSettings::default(),
            rx1: ReceiverSettings::default(),
            rx2: ReceiverSettings {
                lna_db: 40,
                vga_db: 42,
                ..ReceiverSettings::default()
            },
            tx: TransmitterSettings::default(),
            hw_trigger: true,
            timing: TimingBudget::default(),
            retry: RetrySettings::default(),
            readiness: ReadinessSettings::default(),
            tools: ToolSettings::default(),
        }
    }
}

/// RF parameters shared by all three radios.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RfSettings {
    /// Sample rate in Hz.
    pub sample_rate_hz: u64,
    /// Center frequency in Hz.
    pub center_freq_hz: u64,
    /// Number of complex samples each receiver captures.
    pub num_samples: u64,
}

impl Default for RfSettings {
    fn default() -> Self {
        Self {
            sample_rate_hz: 20_000_000,
            center_freq_hz: 520_000_000,
            num_samples: 7000,
        }
    }
}

/// One receiver's settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverSettings {
    /// Whether the receiver takes part in the run.
    pub enabled: bool,
    /// Device serial; `None` lets the tool pick the first free device.
    pub serial: Option<String>,
    /// LNA (IF) gain in dB.
    pub lna_db: u32,
    /// Baseband VGA gain in dB.
    pub vga_db: u32,
}

impl Default for ReceiverSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            serial: None,
            lna_db: 8,
            vga_db: 8,
        }
    }
}

/// Transmitter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransmitterSettings {
    /// Device serial.
    pub serial: Option<String>,
    /// TX VGA gain in dB.
    pub amp_db: u32,
    /// Enable the front-end RF amplifier.
    pub rf_amp: bool,
    /// Enable antenna port power.
    pub antenna_power: bool,
    /// Waveform file replayed once per attempt.
    pub waveform: PathBuf,
}

impl Default for TransmitterSettings {
    fn default() -> Self {
        Self {
            serial: None,
            amp_db: 42,
            rf_amp: true,
            antenna_power: false,
            waveform: PathBuf::from("waveforms/pilot.iq"),
        }
    }
}

/// Time limits for one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingBudget {
    /// Declare a receiver ready after this long if no pattern matched.
    #[serde(with = "humantime_serde")]
    pub ready_fallback: Duration,
    /// Upper bound for all receivers becoming ready.
    #[serde(with = "humantime_serde")]
    pub joint_readiness_timeout: Duration,
    /// Upper bound for the transmitter to exit.
    #[serde(with = "humantime_serde")]
    pub transmit_timeout: Duration,
    /// Extra slack added to the nominal capture duration.
    #[serde(with = "humantime_serde")]
    pub safety_margin: Duration,
}

impl Default for TimingBudget {
    fn default() -> Self {
        Self {
            ready_fallback: Duration::from_millis(500),
            joint_readiness_timeout: Duration::from_secs(3),
            transmit_timeout: Duration::from_secs(3),
            safety_margin: Duration::ZERO,
        }
    }
}

/// Retry settings for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Attempts per run, including the first.
    pub max_attempts: u32,
    /// Pause between attempts.
    #[serde(with = "humantime_serde")]
    pub backoff: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(250),
        }
    }
}

/// Receiver output patterns that mean "armed and waiting for the trigger".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessSettings {
    /// Ordered regular expressions, matched case-insensitively per line.
    pub patterns: Vec<String>,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            patterns: vec![
                r"wait.*trigger".to_string(),
                r"waiting.*trigger".to_string(),
                r"trigger.*armed".to_string(),
                r"\barmed\b".to_string(),
                r"^\s*READY\s*$".to_string(),
            ],
        }
    }
}

/// External programs invoked by the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolSettings {
    /// Capture/transmit tool, resolved through `PATH` when not absolute.
    pub capture_program: String,
    /// Device enumeration tool used by preflight and `devices`.
    pub info_program: String,
    /// Check that configured serials are attached before the first run.
    pub preflight: bool,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            capture_program: "hackrf_transfer".to_string(),
            info_program: "hackrf_info".to_string(),
            preflight: true,
        }
    }
}

/// Device resource guard timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardSettings {
    /// How long to wait for devices to be free before a run.
    #[serde(with = "humantime_serde")]
    pub pre_run_timeout: Duration,
    /// How long to wait for devices to be released after a run.
    #[serde(with = "humantime_serde")]
    pub post_run_timeout: Duration,
    /// Process table polling interval.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Grace period between SIGTERM and SIGKILL for stray processes.
    #[serde(with = "humantime_serde")]
    pub terminate_grace: Duration,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            pre_run_timeout: Duration::from_millis(500),
            post_run_timeout: Duration::from_millis(800),
            poll_interval: Duration::from_millis(100),
            terminate_grace: Duration::from_secs(2),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,
    /// Output format (pretty, compact, json).
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl CollectConfig {
    /// Load configuration from [`DEFAULT_CONFIG_PATH`] and environment variables.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path plus `RF_COLLECT_` environment overrides.
    ///
    /// A missing file is not an error; defaults fill every gap.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Self::figment(path.as_ref())
            .extract()
            .map_err(CollectError::from)
    }

    /// The layered provider stack, exposed so callers can merge extra sources.
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| CollectError::Configuration(msg);

        validation::is_positive(u64::from(self.session.runs))
            .map_err(|e| invalid(format!("session.runs: {e}")))?;

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(invalid(format!(
                "Invalid logging.level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }
        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.to_lowercase().as_str()) {
            return Err(invalid(format!(
                "Invalid logging.format '{}'. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            )));
        }

        if self.guard.poll_interval.is_zero() {
            return Err(invalid("guard.poll_interval must be non-zero".to_string()));
        }

        self.capture.validate()
    }
}

impl RunConfiguration {
    /// Settings for a receiver role. `Tx` has no receiver settings and maps to `rx1`.
    pub fn receiver(&self, role: DeviceRole) -> &ReceiverSettings {
        match role {
            DeviceRole::Rx2 => &self.rx2,
            _ => &self.rx1,
        }
    }

    /// Receivers that take part in each attempt, in launch order.
    pub fn enabled_receivers(&self) -> Vec<DeviceRole> {
        DeviceRole::RECEIVERS
            .into_iter()
            .filter(|role| self.receiver(*role).enabled)
            .collect()
    }

    /// Serial configured for a role, if any.
    pub fn serial(&self, role: DeviceRole) -> Option<&str> {
        match role {
            DeviceRole::Tx => self.tx.serial.as_deref(),
            rx => self.receiver(rx).serial.as_deref(),
        }
    }

    /// Serials of every participating device (enabled receivers plus transmitter).
    pub fn device_serials(&self) -> Vec<(DeviceRole, String)> {
        let mut roles = self.enabled_receivers();
        roles.push(DeviceRole::Tx);
        roles
            .into_iter()
            .filter_map(|role| self.serial(role).map(|s| (role, s.to_string())))
            .collect()
    }

    /// Nominal capture time: `num_samples / sample_rate`.
    pub fn capture_duration(&self) -> Duration {
        if self.rf.sample_rate_hz == 0 {
            return Duration::ZERO;
        }
        let nanos =
            u128::from(self.rf.num_samples) * 1_000_000_000 / u128::from(self.rf.sample_rate_hz);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Validate the per-run parameters.
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| CollectError::Configuration(msg);

        validation::is_positive(self.rf.sample_rate_hz)
            .map_err(|e| invalid(format!("rf.sample_rate_hz: {e}")))?;
        validation::is_positive(self.rf.num_samples)
            .map_err(|e| invalid(format!("rf.num_samples: {e}")))?;
        validation::is_positive(self.rf.center_freq_hz)
            .map_err(|e| invalid(format!("rf.center_freq_hz: {e}")))?;
        validation::is_positive(u64::from(self.retry.max_attempts))
            .map_err(|e| invalid(format!("retry.max_attempts: {e}")))?;

        if self.enabled_receivers().is_empty() {
            return Err(invalid(
                "at least one of rx1/rx2 must be enabled".to_string(),
            ));
        }

        for role in self.enabled_receivers() {
            let rx = self.receiver(role);
            validation::check_rx_gains(rx.lna_db, rx.vga_db)
                .map_err(|e| invalid(format!("{role}: {e}")))?;
        }
        validation::check_tx_gain(self.tx.amp_db).map_err(|e| invalid(format!("tx: {e}")))?;

        validation::is_existing_file(&self.tx.waveform).map_err(|e| {
            invalid(format!(
                "tx.waveform '{}': {e}",
                self.tx.waveform.display()
            ))
        })?;

        validation::is_not_empty(&self.tools.capture_program)
            .map_err(|e| invalid(format!("tools.capture_program: {e}")))?;

        if self.readiness.patterns.is_empty() {
            return Err(invalid("readiness.patterns cannot be empty".to_string()));
        }
        for pattern in &self.readiness.patterns {
            regex::RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| invalid(format!("readiness pattern '{pattern}': {e}")))?;
        }

        if self.timing.joint_readiness_timeout.is_zero() {
            return Err(invalid(
                "timing.joint_readiness_timeout must be non-zero".to_string(),
            ));
        }
        if self.timing.transmit_timeout.is_zero() {
            return Err(invalid("timing.transmit_timeout must be non-zero".to_string()));
        }

        let mut seen: HashMap<&str, DeviceRole> = HashMap::new();
        let mut roles = self.enabled_receivers();
        roles.push(DeviceRole::Tx);
        for role in roles {
            if let Some(serial) = self.serial(role) {
                validation::is_not_empty(serial)
                    .map_err(|e| invalid(format!("{role}.serial: {e}")))?;
                if let Some(other) = seen.insert(serial, role) {
                    return Err(invalid(format!(
                        "Duplicate device serial {serial} used by {other} and {role}"
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid_capture(dir: &Path) -> RunConfiguration {
        let waveform = dir.join("pilot.iq");
        std::fs::File::create(&waveform)
            .and_then(|mut f| f.write_all(&[0u8; 64]))
            .unwrap();
        let mut capture = RunConfiguration::default();
        capture.tx.waveform = waveform;
        capture.rx1.serial = Some("0000000000000000a06063c82338145f".into());
        capture.rx2.serial = Some("0000000000000000a06063c8234e925f".into());
        capture.tx.serial = Some("0000000000000000a06063c8240d2b5f".into());
        capture
    }

    #[test]
    fn defaults_match_bench_setup() {
        let cfg = CollectConfig::default();
        assert_eq!(cfg.capture.rf.sample_rate_hz, 20_000_000);
        assert_eq!(cfg.capture.rf.num_samples, 7000);
        assert_eq!(cfg.capture.timing.ready_fallback, Duration::from_millis(500));
        assert_eq!(cfg.capture.retry.max_attempts, 3);
        assert!(cfg.capture.hw_trigger);
        assert_eq!(cfg.session.latest_dir(), PathBuf::from("Data/Latest"));
        assert_eq!(
            cfg.capture.enabled_receivers(),
            vec![DeviceRole::Rx1, DeviceRole::Rx2]
        );
    }

    #[test]
    fn capture_duration_is_samples_over_rate() {
        let mut capture = RunConfiguration::default();
        capture.rf.num_samples = 20_000_000;
        capture.rf.sample_rate_hz = 10_000_000;
        assert_eq!(capture.capture_duration(), Duration::from_secs(2));
    }

    #[test]
    fn loads_toml_file_with_humantime_durations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collect.toml");
        std::fs::write(
            &path,
            r#"
[session]
runs = 4
tag = "bench"

[rf]
num_samples = 14000

[rx2]
enabled = false

[timing]
ready_fallback = "750ms"
transmit_timeout = "5s"

[retry]
backoff = "1s"
"#,
        )
        .unwrap();

        let cfg = CollectConfig::load_from(&path).unwrap();
        assert_eq!(cfg.session.runs, 4);
        assert_eq!(cfg.session.tag.as_deref(), Some("bench"));
        assert_eq!(cfg.capture.rf.num_samples, 14000);
        assert_eq!(cfg.capture.rf.sample_rate_hz, 20_000_000);
        assert!(!cfg.capture.rx2.enabled);
        assert_eq!(cfg.capture.timing.ready_fallback, Duration::from_millis(750));
        assert_eq!(cfg.capture.timing.transmit_timeout, Duration::from_secs(5));
        assert_eq!(cfg.capture.retry.backoff, Duration::from_secs(1));
        assert_eq!(cfg.capture.enabled_receivers(), vec![DeviceRole::Rx1]);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = CollectConfig::load_from("/nonexistent/collect.toml").unwrap();
        assert_eq!(cfg.session.runs, 1);
        assert_eq!(cfg.capture.tools.capture_program, "hackrf_transfer");
    }

    #[test]
    fn validation_accepts_bench_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = CollectConfig {
            capture: valid_capture(dir.path()),
            ..CollectConfig::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validation_rejects_bad_values() {
        let dir = tempfile::tempdir().unwrap();

        let mut cfg = CollectConfig {
            capture: valid_capture(dir.path()),
            ..CollectConfig::default()
        };
        cfg.capture.rf.num_samples = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = CollectConfig {
            capture: valid_capture(dir.path()),
            ..CollectConfig::default()
        };
        cfg.capture.rx1.enabled = false;
        cfg.capture.rx2.enabled = false;
        assert!(cfg.validate().is_err());

        let mut cfg = CollectConfig {
            capture: valid_capture(dir.path()),
            ..CollectConfig::default()
        };
        cfg.capture.rx1.lna_db = 42;
        assert!(cfg.validate().is_err());

        let mut cfg = CollectConfig {
            capture: valid_capture(dir.path()),
            ..CollectConfig::default()
        };
        cfg.capture.tx.waveform = dir.path().join("missing.iq");
        assert!(cfg.validate().is_err());

        let mut cfg = CollectConfig {
            capture: valid_capture(dir.path()),
            ..CollectConfig::default()
        };
        cfg.capture.readiness.patterns = vec!["(unclosed".into()];
        assert!(cfg.validate().is_err());

        let mut cfg = CollectConfig {
            capture: valid_capture(dir.path()),
            ..CollectConfig::default()
        };
        cfg.capture.retry.max_attempts = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validation_rejects_shared_serials() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = CollectConfig {
            capture: valid_capture(dir.path()),
            ..CollectConfig::default()
        };
        cfg.capture.rx2.serial = cfg.capture.rx1.serial.clone();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate device serial"));
    }

    #[test]
    fn device_serials_skip_disabled_receivers() {
        let dir = tempfile::tempdir().unwrap();
        let mut capture = valid_capture(dir.path());
        capture.rx2.enabled = false;
        let roles: Vec<DeviceRole> = capture.device_serials().into_iter().map(|(r, _)| r).collect();
        assert_eq!(roles, vec![DeviceRole::Rx1, DeviceRole::Tx]);
    }
}
