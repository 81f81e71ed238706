//! Custom error types for the capture controller.
//!
//! Two layers of failure are modelled separately:
//!
//! - **`AttemptFailure`**: something went wrong inside one capture attempt (a receiver died
//!   before it armed, the transmitter returned non-zero, a receiver overran its harvest
//!   deadline, ...). These are always recoverable: the retry manager terminates whatever is
//!   still alive from the attempt, backs off and tries again.
//! - **`CollectError`**: errors that end the session. Configuration and preflight problems
//!   surface before any radio process is launched; `RetryExhausted` is raised when a run has
//!   used every attempt; `Interrupted` records that SIGINT/SIGTERM cut the session short.
//!
//! Device-busy conditions are deliberately absent from both enums. The device guard reports
//! them as warnings and cleans up, it never fails a run.

use crate::config::DeviceRole;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the controller error type.
pub type AppResult<T> = std::result::Result<T, CollectError>;

/// Coarse category of an attempt failure, used in diagnostics and run reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A capture process could not be started.
    Launch,
    /// Receivers did not all arm.
    Readiness,
    /// The transmitter failed or hung.
    Transmit,
    /// A receiver failed or overran its capture window after the trigger.
    Completion,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            FailureKind::Launch => "launch",
            FailureKind::Readiness => "readiness",
            FailureKind::Transmit => "transmit",
            FailureKind::Completion => "completion",
        };
        write!(f, "{}", label)
    }
}

/// Why a single capture attempt ended in `Failed`.
#[derive(Error, Debug)]
pub enum AttemptFailure {
    #[error("failed to launch {role} ({program}): {source}")]
    Launch {
        role: DeviceRole,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{role} died before armed (exit code {code}), see {}", .log.display())]
    DiedBeforeArmed {
        role: DeviceRole,
        code: i32,
        log: PathBuf,
    },

    #[error("readiness timeout after {timeout:?}, still waiting on: {}", format_roles(.pending))]
    ReadinessTimeout {
        timeout: Duration,
        pending: Vec<DeviceRole>,
    },

    #[error("transmit failure: transmitter exited with code {code}, see {}", .log.display())]
    TransmitFailed { code: i32, log: PathBuf },

    #[error("transmit failure: transmitter still running after {timeout:?}")]
    TransmitTimeout { timeout: Duration },

    #[error("{role} exited with code {code}, see {}", .log.display())]
    ReceiverFailed {
        role: DeviceRole,
        code: i32,
        log: PathBuf,
    },

    #[error("{role} did not finish within {deadline:?}; terminated")]
    ReceiverTimeout { role: DeviceRole, deadline: Duration },

    #[error("{role} exited cleanly but produced no capture file at {}", .path.display())]
    MissingOutput { role: DeviceRole, path: PathBuf },

    #[error("I/O error during attempt: {0}")]
    Io(#[from] std::io::Error),
}

impl AttemptFailure {
    /// Category used for reporting.
    pub fn kind(&self) -> FailureKind {
        match self {
            AttemptFailure::Launch { .. } => FailureKind::Launch,
            AttemptFailure::DiedBeforeArmed { .. } | AttemptFailure::ReadinessTimeout { .. } => {
                FailureKind::Readiness
            }
            AttemptFailure::TransmitFailed { .. } | AttemptFailure::TransmitTimeout { .. } => {
                FailureKind::Transmit
            }
            AttemptFailure::ReceiverFailed { .. }
            | AttemptFailure::ReceiverTimeout { .. }
            | AttemptFailure::MissingOutput { .. }
            | AttemptFailure::Io(_) => FailureKind::Completion,
        }
    }
}

fn format_roles(roles: &[DeviceRole]) -> String {
    roles
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Session-level error.
#[derive(Error, Debug)]
pub enum CollectError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Preflight check failed: {0}")]
    Preflight(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Snapshot error: {0}")]
    Toml(#[from] toml::ser::Error),

    #[error("run_{run:04} failed after {attempts} attempt(s); aborting session. Last failure: {last}")]
    RetryExhausted {
        run: u32,
        attempts: u32,
        #[source]
        last: AttemptFailure,
    },

    #[error("Session interrupted by {0}")]
    Interrupted(crate::session::InterruptKind),

    #[error("Archive error: {0}")]
    Archive(String),
}

impl From<figment::Error> for CollectError {
    fn from(value: figment::Error) -> Self {
        CollectError::Config(Box::new(value))
    }
}

impl CollectError {
    /// Process exit status the binary reports for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            CollectError::Config(_)
            | CollectError::Configuration(_)
            | CollectError::Preflight(_) => 2,
            CollectError::Interrupted(kind) => kind.exit_code(),
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_kinds_follow_taxonomy() {
        let died = AttemptFailure::DiedBeforeArmed {
            role: DeviceRole::Rx1,
            code: 1,
            log: PathBuf::from("rx1_try1.log"),
        };
        assert_eq!(died.kind(), FailureKind::Readiness);

        let tx = AttemptFailure::TransmitTimeout {
            timeout: Duration::from_secs(3),
        };
        assert_eq!(tx.kind(), FailureKind::Transmit);

        let rx = AttemptFailure::ReceiverTimeout {
            role: DeviceRole::Rx2,
            deadline: Duration::from_secs(2),
        };
        assert_eq!(rx.kind(), FailureKind::Completion);
    }

    #[test]
    fn readiness_timeout_names_pending_receivers() {
        let err = AttemptFailure::ReadinessTimeout {
            timeout: Duration::from_millis(10),
            pending: vec![DeviceRole::Rx1, DeviceRole::Rx2],
        };
        let msg = err.to_string();
        assert!(msg.contains("rx1, rx2"), "{msg}");
    }

    #[test]
    fn retry_exhaustion_identifies_run_and_attempts() {
        let err = CollectError::RetryExhausted {
            run: 7,
            attempts: 3,
            last: AttemptFailure::TransmitFailed {
                code: 1,
                log: PathBuf::from("tx_try3.log"),
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("run_0007"));
        assert!(msg.contains("3 attempt"));
        assert_eq!(err.exit_code(), 1);
        assert_eq!(CollectError::Configuration("x".into()).exit_code(), 2);
    }
}
