//! Session Runner.
//!
//! A session is an ordered sequence of runs sharing one output directory. Runs execute
//! strictly one after another since the radios are exclusive. Each run is wrapped by the
//! device guard (before and after), snapshotted, retried and reported. The first run that
//! exhausts its attempts ends the session.
//!
//! Interrupts (SIGINT, SIGTERM) are handled by [`SessionRunner::run_until_interrupted`]:
//! the configured device serials are cleaned up through the guard before the session
//! future is dropped and an [`CollectError::Interrupted`] is returned.

use crate::config::{CollectConfig, DeviceRole, RunConfiguration};
use crate::device_guard::DeviceGuard;
use crate::error::{AppResult, CollectError};
use crate::layout::{self, RunPaths};
use crate::orchestrator::CaptureOrchestrator;
use crate::report::{self, HostInfo, RunReport};
use crate::retry::{AttemptRecord, AttemptRunner, RetryManager, RetryPolicy, RunStatus};
use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};

/// Which external request stopped the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptKind {
    /// SIGINT / Ctrl-C.
    Interrupt,
    /// SIGTERM.
    Terminate,
}

impl InterruptKind {
    /// Conventional shell exit status (`128 + signo`).
    pub fn exit_code(self) -> i32 {
        match self {
            InterruptKind::Interrupt => 130,
            InterruptKind::Terminate => 143,
        }
    }
}

impl fmt::Display for InterruptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterruptKind::Interrupt => write!(f, "SIGINT"),
            InterruptKind::Terminate => write!(f, "SIGTERM"),
        }
    }
}

/// Resolve on the first SIGINT or SIGTERM.
pub async fn wait_for_signal() -> std::io::Result<InterruptKind> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r.map(|_| InterruptKind::Interrupt),
            _ = term.recv() => Ok(InterruptKind::Terminate),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.map(|_| InterruptKind::Interrupt)
    }
}

/// Everything the interrupt path needs, captured when the session starts.
#[derive(Debug, Clone)]
pub struct InterruptContext {
    guard: DeviceGuard,
    serials: Vec<(DeviceRole, String)>,
}

impl InterruptContext {
    /// Context for the given guard and device serials.
    pub fn new(guard: DeviceGuard, serials: Vec<(DeviceRole, String)>) -> Self {
        Self { guard, serials }
    }

    /// Terminate every capture process bound to the session's devices.
    pub async fn cleanup(&self) -> usize {
        if self.serials.is_empty() {
            return 0;
        }
        self.guard.terminate_all(&self.serials).await
    }
}

/// What a finished session produced.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    /// Session directory.
    pub session_dir: PathBuf,
    /// Run reports, in run order.
    pub reports: Vec<PathBuf>,
    /// Archive path, if one was written.
    pub archive: Option<PathBuf>,
}

/// Sequences the runs of one session.
pub struct SessionRunner {
    config: CollectConfig,
    capture: Arc<RunConfiguration>,
    runner: Arc<dyn AttemptRunner>,
    retry: RetryManager,
    guard: DeviceGuard,
}

impl fmt::Debug for SessionRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRunner")
            .field("runs", &self.config.session.runs)
            .field("data_root", &self.config.session.data_root)
            .field("retry", self.retry.policy())
            .finish_non_exhaustive()
    }
}

impl SessionRunner {
    /// Runner driving the real capture orchestrator.
    pub fn new(config: CollectConfig) -> AppResult<Self> {
        let capture = Arc::new(config.capture.clone());
        let orchestrator = CaptureOrchestrator::new(Arc::clone(&capture))?;
        Ok(Self::with_runner(config, Arc::new(orchestrator)))
    }

    /// Runner driving any [`AttemptRunner`].
    pub fn with_runner(config: CollectConfig, runner: Arc<dyn AttemptRunner>) -> Self {
        let capture = Arc::new(config.capture.clone());
        let retry = RetryManager::new(
            RetryPolicy::from(&capture.retry),
            capture.enabled_receivers(),
        );
        let guard = DeviceGuard::new(capture.tools.capture_program.clone(), config.guard.clone());
        Self {
            config,
            capture,
            runner,
            retry,
            guard,
        }
    }

    /// The device guard used around runs.
    pub fn guard(&self) -> &DeviceGuard {
        &self.guard
    }

    /// Context for interrupt cleanup.
    pub fn interrupt_context(&self) -> InterruptContext {
        InterruptContext::new(self.guard.clone(), self.capture.device_serials())
    }

    /// Run the session, stopping cleanly on SIGINT/SIGTERM.
    pub async fn run_until_interrupted(&self) -> AppResult<SessionSummary> {
        self.run_until(async {
            match wait_for_signal().await {
                Ok(kind) => kind,
                Err(e) => {
                    // Without signal handling the session can still run; only Ctrl-C
                    // cleanup is lost.
                    warn!(error = %e, "could not install signal handlers");
                    std::future::pending().await
                }
            }
        })
        .await
    }

    /// Run the session until it finishes or `interrupt` resolves.
    ///
    /// On interrupt, processes bound to the configured serials are terminated while the
    /// session future is still alive, then the future is dropped, which kills any child it
    /// still owns.
    pub async fn run_until<F>(&self, interrupt: F) -> AppResult<SessionSummary>
    where
        F: Future<Output = InterruptKind>,
    {
        let context = self.interrupt_context();
        let session = self.run();
        tokio::pin!(session);
        tokio::pin!(interrupt);

        tokio::select! {
            result = &mut session => result,
            kind = &mut interrupt => {
                warn!(signal = %kind, "interrupt received, cleaning up capture processes");
                let cleaned = context.cleanup().await;
                info!(processes = cleaned, "device cleanup finished");
                Err(CollectError::Interrupted(kind))
            }
        }
    }

    /// Run every configured run in order.
    pub async fn run(&self) -> AppResult<SessionSummary> {
        let session_cfg = &self.config.session;
        let session_dir =
            layout::create_session_dir(&session_cfg.data_root, session_cfg.tag.as_deref())?;
        report::write_session_config(&session_dir, &self.config)?;

        info!(
            session = %session_dir.display(),
            runs = session_cfg.runs,
            freq_hz = self.capture.rf.center_freq_hz,
            rate_hz = self.capture.rf.sample_rate_hz,
            samples = self.capture.rf.num_samples,
            "session started"
        );

        let mut reports = Vec::new();
        for index in 1..=session_cfg.runs {
            let span = info_span!("run", run = index, of = session_cfg.runs);
            let report = self.run_one(&session_dir, index).instrument(span).await?;
            reports.push(report);
        }

        let archive = self.finish_archive(&session_dir).await?;
        info!(session = %session_dir.display(), runs = reports.len(), "session complete");
        Ok(SessionSummary {
            session_dir,
            reports,
            archive,
        })
    }

    async fn run_one(&self, session_dir: &std::path::Path, index: u32) -> AppResult<PathBuf> {
        let run = RunPaths::new(session_dir, index);
        run.create()?;
        let serials = self.capture.device_serials();

        self.guard.before_run(&serials).await;
        report::write_config_snapshot(&run, &self.capture)?;

        let started_at = Utc::now();
        let result = self.retry.run(self.runner.as_ref(), &run).await;
        self.guard.after_run(&serials).await;

        let mut outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(run = index, error = %e, "could not promote captures, aborting session");
                let report =
                    self.run_report(&run, session_dir, RunStatus::Aborted, started_at, Vec::new());
                if let Err(write) = report::write_run_report(&run, &report) {
                    warn!(run = index, error = %write, "could not write run report");
                }
                return Err(e.into());
            }
        };

        let report = self.run_report(
            &run,
            session_dir,
            outcome.status,
            started_at,
            outcome.attempts.clone(),
        );
        let report_path = report::write_run_report(&run, &report)?;

        if let Some(last) = outcome.last_failure.take() {
            error!(
                run = index,
                attempts = outcome.attempt_count(),
                "run failed on every attempt, aborting session"
            );
            return Err(CollectError::RetryExhausted {
                run: index,
                attempts: outcome.attempt_count(),
                last,
            });
        }

        for empty in report.empty_outputs() {
            warn!(
                role = %empty.role,
                path = %empty.path.display(),
                "capture file is empty; the hardware trigger was probably not received"
            );
        }

        if report.status == RunStatus::Succeeded {
            let latest = self.config.session.latest_dir();
            if let Err(e) = layout::update_latest(&latest, run.dir(), session_dir) {
                warn!(latest = %latest.display(), error = %e, "could not update latest run mirror");
            }
        }

        info!(run = index, attempts = outcome.attempt_count(), "run complete");
        Ok(report_path)
    }

    fn run_report(
        &self,
        run: &RunPaths,
        session_dir: &std::path::Path,
        status: RunStatus,
        started_at: DateTime<Utc>,
        attempts: Vec<AttemptRecord>,
    ) -> RunReport {
        RunReport {
            run: run.index(),
            run_name: run.name(),
            status,
            session_dir: session_dir.to_path_buf(),
            started_at,
            finished_at: Utc::now(),
            attempts,
            outputs: report::collect_outputs(run, &self.capture.enabled_receivers()),
            host: HostInfo::current(),
        }
    }

    #[cfg(feature = "archive")]
    async fn finish_archive(&self, session_dir: &std::path::Path) -> AppResult<Option<PathBuf>> {
        if !self.config.session.archive {
            return Ok(None);
        }
        let dir = session_dir.to_path_buf();
        let path = tokio::task::spawn_blocking(move || crate::archive::zip_session_dir(&dir))
            .await
            .map_err(|e| CollectError::Archive(e.to_string()))??;
        info!(archive = %path.display(), "session archived");
        Ok(Some(path))
    }

    #[cfg(not(feature = "archive"))]
    async fn finish_archive(&self, _session_dir: &std::path::Path) -> AppResult<Option<PathBuf>> {
        if self.config.session.archive {
            warn!("session.archive is set but this build has no archive support");
        }
        Ok(None)
    }
}
