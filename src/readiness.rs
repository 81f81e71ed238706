//! Receiver readiness detection.
//!
//! A receiver started with hardware triggering prints a line such as "Waiting for trigger"
//! once it is armed. The detector drains the receiver's stdout and stderr as lines arrive,
//! appends every byte verbatim to the receiver's log file and matches each line against an
//! ordered list of case-insensitive patterns. The first match sets the receiver's
//! [`ReadinessSignal`].
//!
//! Some tool builds never print a recognisable line. A fallback timer therefore sets the
//! signal after a fixed delay; whichever of the two fires first wins and later events are
//! ignored.
//!
//! Streams are read incrementally, so a pipe never fills up and stalls the receiver,
//! and output that arrives after readiness keeps being logged until the process closes it.

use crate::config::{DeviceRole, ReadinessSettings};
use crate::error::{AppResult, CollectError};
use regex::{Regex, RegexBuilder};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// How a receiver was declared ready.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ReadySource {
    /// A line matched one of the readiness patterns.
    Pattern {
        /// The pattern that matched.
        pattern: String,
        /// The matching line, without its terminator.
        line: String,
    },
    /// No pattern matched before the fallback delay elapsed.
    Fallback,
}

/// When and why readiness was declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Readiness {
    /// Detection source.
    pub source: ReadySource,
    /// Time from detector start to readiness.
    pub elapsed: Duration,
}

/// One-shot readiness flag shared between the detector and the orchestrator.
///
/// Setting is idempotent: the first value wins.
#[derive(Debug, Clone)]
pub struct ReadinessSignal {
    tx: Arc<watch::Sender<Option<Readiness>>>,
}

impl Default for ReadinessSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessSignal {
    /// A fresh, unset signal.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Set the signal. Returns `true` if this call was the one that set it.
    pub fn set(&self, readiness: Readiness) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                false
            } else {
                *slot = Some(readiness);
                true
            }
        })
    }

    /// Whether the signal has been set.
    pub fn is_set(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// The readiness value, if set.
    pub fn get(&self) -> Option<Readiness> {
        self.tx.borrow().clone()
    }

    /// Resolve once the signal is set.
    pub async fn wait(&self) -> Readiness {
        let mut rx = self.tx.subscribe();
        let ready = rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|value| value.clone());
        match ready {
            Some(readiness) => readiness,
            // The sender is owned by `self`, so the channel cannot close while we wait.
            None => std::future::pending().await,
        }
    }
}

/// Compiled, ordered readiness patterns.
#[derive(Debug, Clone)]
pub struct ReadinessMatcher {
    patterns: Vec<Regex>,
}

impl ReadinessMatcher {
    /// Compile patterns case-insensitively, preserving order.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> AppResult<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                RegexBuilder::new(p.as_ref())
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| {
                        CollectError::Configuration(format!(
                            "readiness pattern '{}': {e}",
                            p.as_ref()
                        ))
                    })
            })
            .collect::<AppResult<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// Build from the `[readiness]` section.
    pub fn from_settings(settings: &ReadinessSettings) -> AppResult<Self> {
        Self::new(settings.patterns.as_slice())
    }

    /// The first pattern (in configured order) that matches `line`.
    pub fn first_match(&self, line: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|re| re.is_match(line))
            .map(Regex::as_str)
    }
}

/// Background readiness detection for one receiver.
///
/// Dropping the detector aborts its tasks.
#[derive(Debug)]
pub struct ReadinessDetector {
    role: DeviceRole,
    signal: ReadinessSignal,
    log_path: PathBuf,
    drain: Option<JoinHandle<()>>,
    fallback: JoinHandle<()>,
}

impl ReadinessDetector {
    /// Start draining `stdout`/`stderr` into `log_path` and arm the fallback timer.
    ///
    /// The log file is created (truncated) before this returns.
    pub async fn start<O, E>(
        role: DeviceRole,
        stdout: Option<O>,
        stderr: Option<E>,
        log_path: &Path,
        matcher: ReadinessMatcher,
        fallback: Duration,
    ) -> std::io::Result<Self>
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let log = tokio::fs::File::create(log_path).await?;
        let signal = ReadinessSignal::new();
        let started = Instant::now();

        let drain = tokio::spawn(drain_streams(
            role,
            stdout,
            stderr,
            log,
            matcher,
            signal.clone(),
            started,
        ));

        let timer_signal = signal.clone();
        let fallback = tokio::spawn(async move {
            tokio::time::sleep(fallback).await;
            if timer_signal.set(Readiness {
                source: ReadySource::Fallback,
                elapsed: started.elapsed(),
            }) {
                debug!(%role, ?fallback, "no readiness line seen, using fallback");
            }
        });

        Ok(Self {
            role,
            signal,
            log_path: log_path.to_path_buf(),
            drain: Some(drain),
            fallback,
        })
    }

    /// Receiver role.
    pub fn role(&self) -> DeviceRole {
        self.role
    }

    /// Shared readiness flag.
    pub fn signal(&self) -> &ReadinessSignal {
        &self.signal
    }

    /// Log file receiving the drained output.
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Stop the fallback timer and wait up to `grace` for the streams to reach EOF.
    ///
    /// Call after the receiver exited so its final output is in the log.
    pub async fn finish(&mut self, grace: Duration) {
        self.fallback.abort();
        if let Some(mut drain) = self.drain.take() {
            match tokio::time::timeout(grace, &mut drain).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => warn!(role = %self.role, error = %e, "log drain task failed"),
                Err(_) => {
                    warn!(role = %self.role, ?grace, "output still open after exit, closing log");
                    drain.abort();
                }
            }
        }
    }
}

impl Drop for ReadinessDetector {
    fn drop(&mut self) {
        self.fallback.abort();
        if let Some(drain) = self.drain.take() {
            drain.abort();
        }
    }
}

async fn drain_streams<O, E>(
    role: DeviceRole,
    stdout: Option<O>,
    stderr: Option<E>,
    mut log: tokio::fs::File,
    matcher: ReadinessMatcher,
    signal: ReadinessSignal,
    started: Instant,
) where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut out = stdout.map(BufReader::new);
    let mut err = stderr.map(BufReader::new);
    let mut out_buf = Vec::with_capacity(256);
    let mut err_buf = Vec::with_capacity(256);

    while out.is_some() || err.is_some() {
        // `read_until` keeps partial data in the buffer when cancelled, so losing the race
        // in `select!` drops nothing.
        let (result, from_stdout) = tokio::select! {
            r = read_line(&mut out, &mut out_buf), if out.is_some() => (r, true),
            r = read_line(&mut err, &mut err_buf), if err.is_some() => (r, false),
        };

        let buf = if from_stdout { &mut out_buf } else { &mut err_buf };
        match result {
            Ok(0) => {
                if from_stdout {
                    out = None;
                } else {
                    err = None;
                }
                continue;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(%role, error = %e, "error reading receiver output");
                if from_stdout {
                    out = None;
                } else {
                    err = None;
                }
                continue;
            }
        }

        if let Err(e) = log.write_all(buf).await {
            warn!(%role, error = %e, "failed to append to receiver log");
        }
        let _ = log.flush().await;

        if !signal.is_set() {
            let text = String::from_utf8_lossy(buf);
            let line = text.trim_end_matches(&['\r', '\n'][..]);
            trace!(%role, line, "receiver output");
            if let Some(pattern) = matcher.first_match(line) {
                let readiness = Readiness {
                    source: ReadySource::Pattern {
                        pattern: pattern.to_string(),
                        line: line.to_string(),
                    },
                    elapsed: started.elapsed(),
                };
                if signal.set(readiness) {
                    debug!(%role, pattern, line, elapsed = ?started.elapsed(), "receiver armed");
                }
            }
        }
        buf.clear();
    }

    let _ = log.flush().await;
}

async fn read_line<R: AsyncRead + Unpin>(
    reader: &mut Option<BufReader<R>>,
    buf: &mut Vec<u8>,
) -> std::io::Result<usize> {
    match reader {
        Some(r) => r.read_until(b'\n', buf).await,
        None => std::future::pending().await,
    }
}
