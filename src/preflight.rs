//! Checks run once before a session starts.
//!
//! The capture and device-info tools must be on `PATH`, and every configured serial must be
//! listed by the info tool. Failures here are reported before any radio is touched.

use crate::config::{DeviceRole, RunConfiguration};
use crate::error::{AppResult, CollectError};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, info};

/// Upper bound for one run of the device info tool.
pub const INFO_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolve a program on `PATH` (or validate an explicit path).
pub fn require_tool(program: &str) -> AppResult<PathBuf> {
    which::which(program)
        .map_err(|e| CollectError::Preflight(format!("required tool '{program}' not found: {e}")))
}

/// Run the device info tool and return its combined output.
pub async fn device_listing(info_program: &str) -> AppResult<String> {
    let path = require_tool(info_program)?;
    let child = tokio::process::Command::new(&path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(INFO_TIMEOUT, child)
        .await
        .map_err(|_| {
            CollectError::Preflight(format!(
                "{info_program} did not finish within {INFO_TIMEOUT:?}"
            ))
        })??;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    debug!(program = info_program, status = ?output.status, bytes = text.len(), "device listing");
    Ok(text)
}

/// Serials (with their roles) that do not appear in `listing`.
pub fn missing_serials<'a>(
    listing: &str,
    serials: &'a [(DeviceRole, String)],
) -> Vec<&'a (DeviceRole, String)> {
    serials
        .iter()
        .filter(|(_, serial)| !listing.contains(serial.as_str()))
        .collect()
}

/// Verify tools and devices for a run configuration.
pub async fn run_preflight(config: &RunConfiguration) -> AppResult<()> {
    let capture = require_tool(&config.tools.capture_program)?;
    debug!(path = %capture.display(), "capture tool");

    let serials = config.device_serials();
    if serials.is_empty() {
        info!("no device serials configured, skipping device check");
        return Ok(());
    }

    let listing = device_listing(&config.tools.info_program).await?;
    if listing.trim().is_empty() {
        return Err(CollectError::Preflight(format!(
            "{} returned no output; is the device tooling installed and accessible?",
            config.tools.info_program
        )));
    }

    let missing = missing_serials(&listing, &serials);
    if !missing.is_empty() {
        let detail = missing
            .iter()
            .map(|(role, serial)| format!("{role} serial {serial}"))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(CollectError::Preflight(format!(
            "not found by {}: {detail}. Check USB connections, permissions and serials",
            config.tools.info_program
        )));
    }

    info!(devices = serials.len(), "all configured devices present");
    Ok(())
}
