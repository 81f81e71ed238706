//! Shared fixtures: a shell-script stand-in for the capture tool.
//!
//! The script is invoked exactly like the real tool. `-r <path>` selects receive mode and
//! the basename of `<path>` (`rx1_try1.iq`, `rx2_try1.iq`) tells it which receiver it is;
//! `-t <waveform>` selects transmit mode. Each role runs a caller-supplied shell snippet
//! with these helpers in scope:
//!
//! - `arm`: record that this receiver got far enough to arm (`armed_rx1` marker)
//! - `wait_trigger`: block until the transmitter has touched the trigger file
//! - `capture`: write a few bytes to the output path
//! - `count_launch`: bump a per-role launch counter and leave it in `$n`
//! - `require_armed`: fail the transmitter (exit 3) unless both receivers armed

#![allow(dead_code)]

use rf_collect::config::{CollectConfig, RunConfiguration};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// Receiver that prints a readiness line after 40 ms, waits for the trigger, captures.
pub const RX_ARMS: &str = r#"sleep 0.04; arm; echo "Waiting for trigger..."; wait_trigger; capture"#;
/// Receiver that never prints anything but still captures on trigger.
pub const RX_SILENT: &str = "arm; wait_trigger; capture";
/// Receiver that fails to open its device.
pub const RX_DIES: &str =
    r#"echo "hackrf_open() failed: HACKRF_ERROR_NOT_FOUND (-5)" >&2; exit 1"#;
/// Receiver that prints nothing and fails before a 500 ms fallback fires.
pub const RX_DIES_SILENTLY: &str = "sleep 0.3; exit 1";
/// Receiver that arms and then never finishes.
pub const RX_HANGS: &str =
    r#"arm; echo "Waiting for trigger..."; while true; do sleep 0.05; done"#;
/// Receiver whose first launch dies and later launches behave.
pub const RX_FLAKY: &str = r#"count_launch; if [ "$n" -eq 1 ]; then echo "hackrf_open() failed" >&2; exit 1; fi; sleep 0.04; arm; echo "Waiting for trigger..."; wait_trigger; capture"#;

/// Transmitter that fires the trigger once both receivers armed.
pub const TX_FIRES: &str = r#"require_armed; touch "$TRIGGER"; echo "Transmit complete""#;
/// Transmitter that fails.
pub const TX_FAILS: &str = r#"echo "hackrf_start_tx() failed" >&2; exit 2"#;
/// Transmitter that never exits.
pub const TX_HANGS: &str = "while true; do sleep 0.05; done";

/// A stand-in capture tool living in its own temporary directory.
pub struct FakeRadio {
    pub dir: TempDir,
    pub program: PathBuf,
    pub trigger: PathBuf,
    pub waveform: PathBuf,
}

impl FakeRadio {
    pub fn new(rx1: &str, rx2: &str, tx: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let program = dir.path().join("fake_hackrf_transfer");
        let trigger = dir.path().join("trigger");
        let waveform = dir.path().join("pilot.iq");
        fs::write(&waveform, [0u8; 64]).unwrap();

        let script = format!(
            r#"#!/bin/sh
DIR="{dir}"
TRIGGER="{trigger}"
mode="$1"
target="$2"
role=$(basename "$target" | cut -d_ -f1)

arm() {{ touch "$DIR/armed_$role"; }}
capture() {{ printf 'IQIQIQIQ' > "$target"; }}
count_launch() {{
    n=$(cat "$DIR/count_$role" 2>/dev/null || echo 0)
    n=$((n + 1))
    echo "$n" > "$DIR/count_$role"
}}
require_armed() {{
    if [ ! -e "$DIR/armed_rx1" ] || [ ! -e "$DIR/armed_rx2" ]; then
        echo "triggered before both receivers armed" >&2
        exit 3
    fi
}}
wait_trigger() {{
    i=0
    while [ ! -e "$TRIGGER" ]; do
        i=$((i + 1))
        if [ "$i" -gt 500 ]; then exit 9; fi
        sleep 0.01
    done
}}

case "$mode" in
    -t)
        {tx}
        ;;
    -r)
        case "$role" in
            rx1) {rx1} ;;
            *) {rx2} ;;
        esac
        ;;
esac
exit 0
"#,
            dir = dir.path().display(),
            trigger = trigger.display(),
        );
        fs::write(&program, script).unwrap();
        fs::set_permissions(&program, fs::Permissions::from_mode(0o755)).unwrap();

        Self {
            dir,
            program,
            trigger,
            waveform,
        }
    }

    pub fn triggered(&self) -> bool {
        self.trigger.exists()
    }

    pub fn launches(&self, role: &str) -> u32 {
        fs::read_to_string(self.dir.path().join(format!("count_{role}")))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Run configuration wired to this tool, without hardware trigger or serials.
    pub fn capture_config(&self) -> RunConfiguration {
        let mut cfg = RunConfiguration::default();
        cfg.tools.capture_program = self.program.to_string_lossy().into_owned();
        cfg.tools.preflight = false;
        cfg.hw_trigger = false;
        cfg.tx.waveform = self.waveform.clone();
        cfg.timing.ready_fallback = Duration::from_millis(500);
        cfg.timing.joint_readiness_timeout = Duration::from_secs(3);
        cfg.timing.transmit_timeout = Duration::from_secs(3);
        cfg.retry.backoff = Duration::from_millis(50);
        cfg
    }

    /// Full session configuration writing under `data_root`.
    pub fn session_config(&self, data_root: &Path) -> CollectConfig {
        let mut cfg = CollectConfig::default();
        cfg.capture = self.capture_config();
        cfg.session.data_root = data_root.to_path_buf();
        cfg.guard.pre_run_timeout = Duration::from_millis(100);
        cfg.guard.post_run_timeout = Duration::from_millis(100);
        cfg.guard.poll_interval = Duration::from_millis(20);
        cfg.guard.terminate_grace = Duration::from_millis(500);
        cfg
    }
}

/// The single session directory created under `data_root`.
pub fn only_session_dir(data_root: &Path) -> PathBuf {
    let sessions: Vec<PathBuf> = fs::read_dir(data_root)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| {
            p.is_dir()
                && p.file_name()
                    .map(|n| n.to_string_lossy().starts_with("collect_"))
                    .unwrap_or(false)
        })
        .collect();
    assert_eq!(sessions.len(), 1, "expected one session dir, got {sessions:?}");
    sessions.into_iter().next().unwrap()
}
