//! Capture Orchestrator: one attempt of one run.
//!
//! ```text
//! Idle -> Launching -> AwaitingReady -> Triggering -> AwaitingCompletion -> Succeeded
//!              \             \               \                 \
//!               +-------------+---------------+-----------------+--> Failed
//! ```
//!
//! The transmitter is launched only after every enabled receiver's [`ReadinessSignal`]
//! is set, and receivers are harvested only after the transmitter has exited. Every process
//! an attempt launches is owned by the attempt and is reaped before `run_attempt` returns,
//! whatever the outcome.
//!
//! [`ReadinessSignal`]: crate::readiness::ReadinessSignal

use crate::command::{build_rx_command, build_tx_command, CaptureCommand};
use crate::config::{DeviceRole, RunConfiguration};
use crate::error::{AppResult, AttemptFailure};
use crate::layout::AttemptPaths;
use crate::process::CaptureProcess;
use crate::readiness::{ReadinessDetector, ReadinessMatcher, ReadySource};
use crate::retry::AttemptRunner;
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};

/// Readiness aggregation poll interval.
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Fixed slack added to the nominal capture window before receivers are declared hung.
pub const HARVEST_GRACE: Duration = Duration::from_secs(2);
/// Grace between SIGTERM and SIGKILL for processes the attempt owns.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(2);
/// How long to wait for a receiver's output streams to close after it exited.
pub const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Attempt state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    /// Nothing launched yet.
    Idle,
    /// Starting receivers and their detectors.
    Launching,
    /// Waiting for every receiver to arm.
    AwaitingReady,
    /// Running the transmitter.
    Triggering,
    /// Waiting for receivers to finish their capture.
    AwaitingCompletion,
    /// All receivers delivered their capture.
    Succeeded,
    /// The attempt failed; see the returned [`AttemptFailure`].
    Failed,
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AttemptState::Idle => "Idle",
            AttemptState::Launching => "Launching",
            AttemptState::AwaitingReady => "AwaitingReady",
            AttemptState::Triggering => "Triggering",
            AttemptState::AwaitingCompletion => "AwaitingCompletion",
            AttemptState::Succeeded => "Succeeded",
            AttemptState::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// What one receiver delivered in a successful attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverOutcome {
    /// Receiver role.
    pub role: DeviceRole,
    /// How readiness was declared.
    pub ready: ReadySource,
    /// Time from launch to readiness, in milliseconds.
    pub ready_after_ms: u64,
    /// Exit code (always 0 for a successful attempt).
    pub exit_code: i32,
    /// Attempt-scoped capture file.
    pub output: PathBuf,
    /// Capture size in bytes.
    pub output_bytes: u64,
    /// Attempt-scoped log file.
    pub log: PathBuf,
}

/// Result of a successful attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptReport {
    /// Run ordinal.
    pub run: u32,
    /// Attempt number.
    pub attempt: u32,
    /// Per-receiver results, in launch order.
    pub receivers: Vec<ReceiverOutcome>,
    /// Attempt-scoped transmitter log.
    pub tx_log: PathBuf,
    /// Time from launch to transmitter exit, in milliseconds.
    pub trigger_after_ms: u64,
    /// Total attempt duration in milliseconds.
    pub duration_ms: u64,
}

impl AttemptReport {
    /// Outcome for one receiver role.
    pub fn receiver(&self, role: DeviceRole) -> Option<&ReceiverOutcome> {
        self.receivers.iter().find(|r| r.role == role)
    }
}

struct LiveReceiver {
    process: CaptureProcess,
    detector: ReadinessDetector,
}

/// Runs capture attempts for a fixed [`RunConfiguration`].
#[derive(Debug, Clone)]
pub struct CaptureOrchestrator {
    config: Arc<RunConfiguration>,
    matcher: ReadinessMatcher,
    poll_interval: Duration,
    harvest_grace: Duration,
}

impl CaptureOrchestrator {
    /// Compile readiness patterns and bind to a configuration.
    pub fn new(config: Arc<RunConfiguration>) -> AppResult<Self> {
        let matcher = ReadinessMatcher::from_settings(&config.readiness)?;
        Ok(Self {
            config,
            matcher,
            poll_interval: READY_POLL_INTERVAL,
            harvest_grace: HARVEST_GRACE,
        })
    }

    /// Override the fixed harvest grace.
    pub fn with_harvest_grace(mut self, grace: Duration) -> Self {
        self.harvest_grace = grace;
        self
    }

    /// Override the readiness aggregation poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// The configuration attempts run with.
    pub fn config(&self) -> &RunConfiguration {
        &self.config
    }

    /// Deadline for receivers after the trigger:
    /// `num_samples / sample_rate + safety_margin + harvest grace`.
    pub fn completion_window(&self) -> Duration {
        self.config.capture_duration() + self.config.timing.safety_margin + self.harvest_grace
    }

    /// Execute one attempt writing to `paths`.
    pub async fn execute(&self, paths: &AttemptPaths) -> Result<AttemptReport, AttemptFailure> {
        let span = info_span!("attempt", run = paths.run, attempt = paths.attempt);
        async {
            let started = Instant::now();
            let mut state = AttemptState::Idle;
            let mut receivers = Vec::new();

            let result = self
                .drive(paths, &mut receivers, &mut state, started)
                .await;

            match result {
                Ok(report) => {
                    transition(&mut state, AttemptState::Succeeded);
                    info!(duration = ?started.elapsed(), "attempt succeeded");
                    Ok(report)
                }
                Err(failure) => {
                    let failed_in = state;
                    transition(&mut state, AttemptState::Failed);
                    warn!(state = %failed_in, kind = %failure.kind(), "attempt failed: {failure}");
                    reap(&mut receivers).await;
                    Err(failure)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn drive(
        &self,
        paths: &AttemptPaths,
        receivers: &mut Vec<LiveReceiver>,
        state: &mut AttemptState,
        started: Instant,
    ) -> Result<AttemptReport, AttemptFailure> {
        let timing = &self.config.timing;

        transition(state, AttemptState::Launching);
        for role in self.config.enabled_receivers() {
            let output = paths.output(role);
            let log = paths.log(role);
            let cmd = build_rx_command(&self.config, role, &output);
            info!(%role, cmd = %cmd, "launching receiver");

            let mut process = CaptureProcess::spawn_piped(&cmd, &log, Some(&output))?;
            let (stdout, stderr) = process.take_output();
            let detector = ReadinessDetector::start(
                role,
                stdout,
                stderr,
                &log,
                self.matcher.clone(),
                timing.ready_fallback,
            )
            .await;
            match detector {
                Ok(detector) => receivers.push(LiveReceiver { process, detector }),
                Err(e) => {
                    if let Err(term) = process.terminate(TERMINATE_GRACE).await {
                        warn!(%role, pid = process.pid(), error = %term, "failed to terminate receiver");
                    }
                    return Err(e.into());
                }
            }
        }

        transition(state, AttemptState::AwaitingReady);
        self.await_ready(receivers).await?;
        for rx in receivers.iter_mut() {
            rx.process.mark_armed();
            if let Some(ready) = rx.detector.signal().get() {
                match &ready.source {
                    ReadySource::Pattern { line, .. } => {
                        info!(role = %rx.process.role(), elapsed = ?ready.elapsed, line = %line, "armed (pattern)")
                    }
                    ReadySource::Fallback => {
                        info!(role = %rx.process.role(), elapsed = ?ready.elapsed, "armed (fallback)")
                    }
                }
            }
        }

        transition(state, AttemptState::Triggering);
        for rx in receivers.iter_mut() {
            rx.process.mark_running();
        }
        let tx_log = paths.log(DeviceRole::Tx);
        let tx_cmd = build_tx_command(&self.config);
        info!(cmd = %tx_cmd, "launching transmitter");
        let mut tx = CaptureProcess::spawn_logged(&tx_cmd, &tx_log)?;
        tx.mark_running();
        let tx_code = match tx.wait_timeout(timing.transmit_timeout).await? {
            Some(code) => code,
            None => {
                tx.terminate(TERMINATE_GRACE).await?;
                return Err(AttemptFailure::TransmitTimeout {
                    timeout: timing.transmit_timeout,
                });
            }
        };
        if tx_code != 0 {
            return Err(AttemptFailure::TransmitFailed {
                code: tx_code,
                log: tx_log,
            });
        }
        let trigger_after = started.elapsed();
        debug!(elapsed = ?trigger_after, "transmitter finished");

        transition(state, AttemptState::AwaitingCompletion);
        let receivers_out = self.harvest(receivers).await?;

        Ok(AttemptReport {
            run: paths.run,
            attempt: paths.attempt,
            receivers: receivers_out,
            tx_log,
            trigger_after_ms: millis(trigger_after),
            duration_ms: millis(started.elapsed()),
        })
    }

    async fn await_ready(&self, receivers: &mut [LiveReceiver]) -> Result<(), AttemptFailure> {
        let limit = self.config.timing.joint_readiness_timeout;
        let deadline = Instant::now() + limit;
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if receivers.iter().all(|rx| rx.detector.signal().is_set()) {
                return confirm_alive(receivers).await;
            }

            for rx in receivers.iter_mut() {
                if rx.detector.signal().is_set() {
                    continue;
                }
                if let Some(code) = rx.process.try_exit()? {
                    // Pick up any output still in flight before deciding.
                    rx.detector.finish(DRAIN_GRACE).await;
                    if !rx.detector.signal().is_set() {
                        return Err(AttemptFailure::DiedBeforeArmed {
                            role: rx.process.role(),
                            code,
                            log: rx.process.log_path().to_path_buf(),
                        });
                    }
                }
            }

            if Instant::now() >= deadline {
                let pending = receivers
                    .iter()
                    .filter(|rx| !rx.detector.signal().is_set())
                    .map(|rx| rx.process.role())
                    .collect();
                return Err(AttemptFailure::ReadinessTimeout {
                    timeout: limit,
                    pending,
                });
            }

            let all_ready = join_all(receivers.iter().map(|rx| rx.detector.signal().wait()));
            tokio::select! {
                _ = ticker.tick() => {}
                _ = all_ready => {}
            }
        }
    }

    async fn harvest(
        &self,
        receivers: &mut [LiveReceiver],
    ) -> Result<Vec<ReceiverOutcome>, AttemptFailure> {
        let window = self.completion_window();
        let deadline = Instant::now() + window;
        debug!(?window, "waiting for receivers");

        let mut outcomes = Vec::with_capacity(receivers.len());
        let mut first_failure: Option<AttemptFailure> = None;

        for rx in receivers.iter_mut() {
            let role = rx.process.role();
            let remaining = deadline.saturating_duration_since(Instant::now());
            let code = match rx.process.wait_timeout(remaining).await? {
                Some(code) => code,
                None => {
                    warn!(%role, pid = rx.process.pid(), ?window, "receiver did not finish, terminating");
                    rx.process.terminate(TERMINATE_GRACE).await?;
                    rx.detector.finish(DRAIN_GRACE).await;
                    first_failure.get_or_insert(AttemptFailure::ReceiverTimeout {
                        role,
                        deadline: window,
                    });
                    continue;
                }
            };
            rx.detector.finish(DRAIN_GRACE).await;

            if code != 0 {
                first_failure.get_or_insert(AttemptFailure::ReceiverFailed {
                    role,
                    code,
                    log: rx.process.log_path().to_path_buf(),
                });
                continue;
            }

            let Some(output) = rx.process.output_path().map(PathBuf::from) else {
                continue;
            };
            let output_bytes = match tokio::fs::metadata(&output).await {
                Ok(meta) if meta.is_file() => meta.len(),
                _ => {
                    first_failure.get_or_insert(AttemptFailure::MissingOutput {
                        role,
                        path: output,
                    });
                    continue;
                }
            };

            let ready = rx.detector.signal().get();
            outcomes.push(ReceiverOutcome {
                role,
                ready_after_ms: ready.as_ref().map(|r| millis(r.elapsed)).unwrap_or_default(),
                ready: ready.map(|r| r.source).unwrap_or(ReadySource::Fallback),
                exit_code: code,
                output,
                output_bytes,
                log: rx.process.log_path().to_path_buf(),
            });
        }

        match first_failure {
            Some(failure) => Err(failure),
            None => Ok(outcomes),
        }
    }
}

#[async_trait]
impl AttemptRunner for CaptureOrchestrator {
    async fn run_attempt(&self, paths: &AttemptPaths) -> Result<AttemptReport, AttemptFailure> {
        self.execute(paths).await
    }

    fn commands(&self, paths: &AttemptPaths) -> Vec<CaptureCommand> {
        let mut commands: Vec<CaptureCommand> = self
            .config
            .enabled_receivers()
            .into_iter()
            .map(|role| build_rx_command(&self.config, role, &paths.output(role)))
            .collect();
        commands.push(build_tx_command(&self.config));
        commands
    }
}

fn transition(state: &mut AttemptState, next: AttemptState) {
    debug!(from = %state, to = %next, "attempt state");
    *state = next;
}

/// Gate before the trigger: every receiver must still be running.
///
/// The fallback timer is independent of the process, so it can mark a receiver ready after
/// it already exited. A receiver that exited while only the fallback vouched for it never
/// armed; one that exited non-zero after printing its readiness line has failed.
async fn confirm_alive(receivers: &mut [LiveReceiver]) -> Result<(), AttemptFailure> {
    for rx in receivers.iter_mut() {
        let Some(code) = rx.process.try_exit()? else {
            continue;
        };
        let role = rx.process.role();
        let log = rx.process.log_path().to_path_buf();
        rx.detector.finish(DRAIN_GRACE).await;
        match rx.detector.signal().get().map(|r| r.source) {
            Some(ReadySource::Pattern { .. }) if code == 0 => {
                debug!(%role, "receiver finished its capture before the trigger");
            }
            Some(ReadySource::Pattern { .. }) => {
                return Err(AttemptFailure::ReceiverFailed { role, code, log });
            }
            _ => return Err(AttemptFailure::DiedBeforeArmed { role, code, log }),
        }
    }
    Ok(())
}

/// Terminate whatever is still alive and flush its logs.
async fn reap(receivers: &mut [LiveReceiver]) {
    for rx in receivers.iter_mut() {
        if !rx.process.has_exited() {
            if let Err(e) = rx.process.terminate(TERMINATE_GRACE).await {
                warn!(role = %rx.process.role(), pid = rx.process.pid(), error = %e, "failed to terminate receiver");
            }
        }
        rx.detector.finish(DRAIN_GRACE).await;
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
