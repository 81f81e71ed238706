//! Configuration loading: shipped file, environment overrides and validation messages.

use rf_collect::config::{CollectConfig, DeviceRole};
use serial_test::serial;
use std::path::Path;
use std::time::Duration;

fn shipped_config() -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("config/collect.toml")
}

#[test]
#[serial]
fn shipped_config_matches_defaults() {
    let loaded = CollectConfig::load_from(shipped_config()).unwrap();
    let defaults = CollectConfig::default();

    assert_eq!(loaded.session.runs, defaults.session.runs);
    assert_eq!(loaded.session.data_root, defaults.session.data_root);
    assert_eq!(loaded.capture.rf.sample_rate_hz, 20_000_000);
    assert_eq!(loaded.capture.rf.center_freq_hz, 520_000_000);
    assert_eq!(loaded.capture.rf.num_samples, 7000);
    assert!(loaded.capture.hw_trigger);
    assert_eq!(loaded.capture.rx2.lna_db, defaults.capture.rx2.lna_db);
    assert_eq!(loaded.capture.rx2.vga_db, defaults.capture.rx2.vga_db);
    assert_eq!(loaded.capture.readiness.patterns, defaults.capture.readiness.patterns);
    assert_eq!(loaded.capture.timing.ready_fallback, Duration::from_millis(500));
    assert_eq!(loaded.guard.terminate_grace, Duration::from_secs(2));
}

#[test]
#[serial]
fn environment_overrides_file() {
    std::env::set_var("RF_COLLECT_SESSION__RUNS", "12");
    std::env::set_var("RF_COLLECT_RX1__SERIAL", "ENVSERIAL");
    let loaded = CollectConfig::load_from(shipped_config());
    std::env::remove_var("RF_COLLECT_SESSION__RUNS");
    std::env::remove_var("RF_COLLECT_RX1__SERIAL");

    let loaded = loaded.unwrap();
    assert_eq!(loaded.session.runs, 12);
    assert_eq!(loaded.capture.serial(DeviceRole::Rx1), Some("ENVSERIAL"));
}

#[test]
#[serial]
fn gain_off_step_is_rejected_with_role() {
    let waveform = tempfile::NamedTempFile::new().unwrap();
    let mut cfg = CollectConfig::default();
    cfg.capture.tx.waveform = waveform.path().to_path_buf();
    assert!(cfg.validate().is_ok());

    cfg.capture.rx2.lna_db = 12;
    let msg = cfg.validate().unwrap_err().to_string();
    assert!(msg.contains("rx2"), "{msg}");
}

#[test]
#[serial]
fn missing_waveform_is_rejected() {
    let mut cfg = CollectConfig::default();
    cfg.capture.tx.waveform = "/definitely/not/here.iq".into();
    let msg = cfg.validate().unwrap_err().to_string();
    assert!(msg.contains("tx.waveform"), "{msg}");
}
