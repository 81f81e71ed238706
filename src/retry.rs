//! Retry & Promotion Manager.
//!
//! Wraps the attempts of one run in a bounded retry loop with a constant backoff. Every
//! attempt writes attempt-scoped files (`rx1_try2.iq`, ...), so a failed attempt never
//! touches what an earlier attempt produced. The first successful attempt is promoted:
//! its captures and logs are moved onto the canonical per-run names, replacing whatever
//! was there (remove, then rename).
//!
//! Failed attempts keep their logs for diagnosis; their partial captures are deleted so
//! downstream tools never mistake them for data.

use crate::command::CaptureCommand;
use crate::config::{DeviceRole, RetrySettings};
use crate::error::{AttemptFailure, FailureKind};
use crate::layout::{AttemptPaths, RunPaths};
use crate::orchestrator::{AttemptReport, ReceiverOutcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Defines a policy for retrying a capture attempt.
///
/// # Example
///
/// ```rust
/// use rf_collect::retry::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_attempts: 5,
///     backoff: Duration::from_millis(200),
/// };
/// assert!(policy.has_attempts_left(4));
/// assert!(!policy.has_attempts_left(5));
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per run, including the first.
    pub max_attempts: u32,
    /// Constant delay between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(250),
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            backoff: settings.backoff,
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt may follow attempt number `attempt` (1-based).
    pub fn has_attempts_left(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Something that can execute one capture attempt.
///
/// [`CaptureOrchestrator`](crate::orchestrator::CaptureOrchestrator) is the production
/// implementation.
#[async_trait]
pub trait AttemptRunner: Send + Sync {
    /// Run one attempt, writing only to the attempt-scoped paths in `attempt`.
    async fn run_attempt(&self, attempt: &AttemptPaths) -> Result<AttemptReport, AttemptFailure>;

    /// Invocations `run_attempt` launches for `attempt`, recorded in the run report.
    fn commands(&self, _attempt: &AttemptPaths) -> Vec<CaptureCommand> {
        Vec::new()
    }
}

/// Terminal status of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// An attempt succeeded and was promoted.
    Succeeded,
    /// Every attempt failed.
    Aborted,
}

/// Diagnostic record of one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Attempt number.
    pub attempt: u32,
    /// Wall-clock start.
    pub started_at: DateTime<Utc>,
    /// Duration in milliseconds.
    pub duration_ms: u64,
    /// Whether the attempt succeeded.
    pub succeeded: bool,
    /// Failure category, for failed attempts.
    pub failure_kind: Option<FailureKind>,
    /// Failure message, for failed attempts.
    pub failure: Option<String>,
    /// Command lines launched, receivers first.
    #[serde(default)]
    pub commands: Vec<String>,
    /// Per-receiver results, for the successful attempt.
    pub receivers: Vec<ReceiverOutcome>,
}

/// Result of [`RetryManager::run`].
#[derive(Debug)]
pub struct RunOutcome {
    /// Run ordinal.
    pub run: u32,
    /// Terminal status.
    pub status: RunStatus,
    /// One record per attempt made.
    pub attempts: Vec<AttemptRecord>,
    /// The failure that ended the last attempt, when the run aborted.
    pub last_failure: Option<AttemptFailure>,
}

impl RunOutcome {
    /// Number of attempts made.
    pub fn attempt_count(&self) -> u32 {
        u32::try_from(self.attempts.len()).unwrap_or(u32::MAX)
    }
}

/// Drives the attempts of a run and promotes the first success.
#[derive(Debug, Clone)]
pub struct RetryManager {
    policy: RetryPolicy,
    receivers: Vec<DeviceRole>,
}

impl RetryManager {
    /// `receivers` lists the enabled receiver roles whose captures get promoted.
    pub fn new(policy: RetryPolicy, receivers: Vec<DeviceRole>) -> Self {
        Self { policy, receivers }
    }

    /// Retry policy in effect.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run attempts until one succeeds or the policy is exhausted.
    ///
    /// Only I/O errors while promoting are returned as `Err`; attempt failures are part of
    /// the [`RunOutcome`].
    pub async fn run<R: AttemptRunner + ?Sized>(
        &self,
        runner: &R,
        run: &RunPaths,
    ) -> io::Result<RunOutcome> {
        let mut records = Vec::new();
        let mut attempt = 1;

        loop {
            let paths = run.attempt(attempt);
            let started_at = Utc::now();
            let started = Instant::now();
            info!(run = run.index(), attempt, max = self.policy.max_attempts, "starting attempt");

            let commands: Vec<String> = runner
                .commands(&paths)
                .iter()
                .map(ToString::to_string)
                .collect();
            let result = runner.run_attempt(&paths).await;
            let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

            match result {
                Ok(report) => {
                    self.promote(run, &report)?;
                    info!(run = run.index(), attempt, "promoted attempt to canonical files");
                    records.push(AttemptRecord {
                        attempt,
                        started_at,
                        duration_ms,
                        succeeded: true,
                        failure_kind: None,
                        failure: None,
                        commands,
                        receivers: promoted_outcomes(run, &report),
                    });
                    return Ok(RunOutcome {
                        run: run.index(),
                        status: RunStatus::Succeeded,
                        attempts: records,
                        last_failure: None,
                    });
                }
                Err(failure) => {
                    self.discard_outputs(&paths);
                    records.push(AttemptRecord {
                        attempt,
                        started_at,
                        duration_ms,
                        succeeded: false,
                        failure_kind: Some(failure.kind()),
                        failure: Some(failure.to_string()),
                        commands,
                        receivers: Vec::new(),
                    });

                    if !self.policy.has_attempts_left(attempt) {
                        warn!(
                            run = run.index(),
                            attempt,
                            kind = %failure.kind(),
                            "attempt {attempt}/{} failed: {failure}; no attempts left",
                            self.policy.max_attempts
                        );
                        return Ok(RunOutcome {
                            run: run.index(),
                            status: RunStatus::Aborted,
                            attempts: records,
                            last_failure: Some(failure),
                        });
                    }

                    warn!(
                        run = run.index(),
                        attempt,
                        kind = %failure.kind(),
                        backoff = ?self.policy.backoff,
                        "attempt {attempt}/{} failed: {failure}; retrying",
                        self.policy.max_attempts
                    );
                    sleep(self.policy.backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Move a successful attempt's files onto the canonical names.
    ///
    /// Running it twice for the same report is harmless: sources already moved are skipped.
    pub fn promote(&self, run: &RunPaths, report: &AttemptReport) -> io::Result<()> {
        for rx in &report.receivers {
            replace_file(&rx.output, &run.canonical_output(rx.role))?;
            replace_file(&rx.log, &run.canonical_log(rx.role))?;
        }
        replace_file(&report.tx_log, &run.canonical_log(DeviceRole::Tx))
    }

    fn discard_outputs(&self, paths: &AttemptPaths) {
        for role in &self.receivers {
            let partial = paths.output(*role);
            match std::fs::remove_file(&partial) {
                Ok(()) => debug!(path = %partial.display(), "removed partial capture"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %partial.display(), error = %e, "could not remove partial capture"),
            }
        }
    }
}

/// Replace `dst` with `src`: remove the old file, then rename.
///
/// A crash between the two steps leaves no canonical file until the run is repeated.
fn replace_file(src: &Path, dst: &Path) -> io::Result<()> {
    if !src.exists() {
        if dst.exists() {
            return Ok(());
        }
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("nothing to promote at {}", src.display()),
        ));
    }
    match std::fs::remove_file(dst) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    std::fs::rename(src, dst)
}

fn promoted_outcomes(run: &RunPaths, report: &AttemptReport) -> Vec<ReceiverOutcome> {
    report
        .receivers
        .iter()
        .map(|rx| ReceiverOutcome {
            output: run.canonical_output(rx.role),
            log: run.canonical_log(rx.role),
            ..rx.clone()
        })
        .collect()
}
