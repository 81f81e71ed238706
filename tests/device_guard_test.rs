//! Device guard against real processes bound to a fake serial.
#![cfg(unix)]

mod common;

use common::*;
use rf_collect::config::{DeviceRole, GuardSettings};
use rf_collect::device_guard::DeviceGuard;
use serial_test::serial;
use std::process::{Child, Command};
use std::time::Duration;

fn settings() -> GuardSettings {
    GuardSettings {
        pre_run_timeout: Duration::from_millis(200),
        post_run_timeout: Duration::from_millis(200),
        poll_interval: Duration::from_millis(20),
        terminate_grace: Duration::from_millis(500),
    }
}

/// Launch the fake tool as a receiver stuck on `serial`.
fn stray_receiver(radio: &FakeRadio, serial: &str) -> Child {
    let out = radio.dir.path().join("rx1_stray.iq");
    Command::new(&radio.program)
        .arg("-r")
        .arg(&out)
        .args(["-d", serial])
        .spawn()
        .unwrap()
}

#[tokio::test]
#[serial]
async fn busy_device_is_terminated_and_freed() {
    let radio = FakeRadio::new(RX_HANGS, RX_HANGS, TX_FIRES);
    let guard = DeviceGuard::new(radio.program.to_string_lossy(), settings());
    let serial = format!("GUARD{}", std::process::id());
    let mut child = stray_receiver(&radio, &serial);

    assert!(wait_busy(&guard, &serial).await);
    let found = guard.bound_processes(&serial).await;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].pid, child.id());
    assert!(!guard.is_busy("SOME-OTHER-SERIAL").await);

    let signalled = guard.terminate_serial(&serial).await;
    assert_eq!(signalled, 1);
    child.wait().unwrap();
    assert!(guard.wait_free(&serial, Duration::from_secs(2)).await);
}

#[tokio::test]
#[serial]
async fn after_run_cleans_up_leftovers() {
    let radio = FakeRadio::new(RX_HANGS, RX_HANGS, TX_FIRES);
    let guard = DeviceGuard::new(radio.program.to_string_lossy(), settings());
    let serial = format!("AFTER{}", std::process::id());
    let mut child = stray_receiver(&radio, &serial);
    assert!(wait_busy(&guard, &serial).await);

    guard
        .after_run(&[(DeviceRole::Rx1, serial.clone())])
        .await;

    child.wait().unwrap();
    assert!(!guard.is_busy(&serial).await);
}

#[tokio::test]
#[serial]
async fn idle_device_is_free() {
    let guard = DeviceGuard::new("hackrf_transfer", settings());
    let serial = format!("IDLE{}", std::process::id());
    assert!(guard.wait_free(&serial, Duration::from_millis(100)).await);
    assert_eq!(guard.terminate_serial(&serial).await, 0);
}

/// The process table may lag the spawn slightly.
async fn wait_busy(guard: &DeviceGuard, serial: &str) -> bool {
    for _ in 0..100 {
        if guard.is_busy(serial).await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
