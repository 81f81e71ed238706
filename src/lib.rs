//! # rf_collect
//!
//! Synchronized capture controller for two receivers and one transmitter, each driven by
//! its own external capture process. The controller arms both receivers, fires the
//! transmitter only after both report ready, harvests the captures within a bounded
//! window, retries failed attempts without touching earlier results and keeps the radios
//! from being left busy between runs.
//!
//! ## Crate Structure
//!
//! - **`config`**: `CollectConfig` / `RunConfiguration`, loaded with figment from TOML and
//!   `RF_COLLECT_` environment variables, plus validation.
//! - **`command`**: Pure builders for the receive and transmit invocations.
//! - **`process`**: `CaptureProcess`, an owned child process with a lifecycle state and
//!   SIGTERM-then-SIGKILL termination.
//! - **`readiness`**: Drains receiver output into its log, detects the "armed" line, and
//!   falls back to a timer when nothing recognisable is printed.
//! - **`orchestrator`**: The per-attempt state machine
//!   (`Launching -> AwaitingReady -> Triggering -> AwaitingCompletion`).
//! - **`retry`**: Bounded retries with backoff and promotion of attempt files to the
//!   canonical run files.
//! - **`device_guard`**: Finds and terminates capture processes bound to a device serial.
//! - **`session`**: Runs a whole session, with interrupt-safe cleanup.
//! - **`layout`**, **`report`**: Directory naming, latest-run mirror, snapshots and reports.
//! - **`preflight`**: Tool and device presence checks.
//! - **`error`**, **`logging`**, **`validation`**: Ambient plumbing.

pub mod command;
pub mod config;
pub mod device_guard;
pub mod error;
pub mod layout;
pub mod logging;
pub mod orchestrator;
pub mod preflight;
pub mod process;
pub mod readiness;
pub mod report;
pub mod retry;
pub mod session;
pub mod validation;

#[cfg(feature = "archive")]
pub mod archive;

pub use config::{CollectConfig, DeviceRole, RunConfiguration};
pub use error::{AppResult, AttemptFailure, CollectError};
pub use orchestrator::CaptureOrchestrator;
pub use session::SessionRunner;
