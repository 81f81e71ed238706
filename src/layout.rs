//! On-disk layout of a collection session.
//!
//! ```text
//! <data_root>/
//!   collect_2026-10-17T09-30-00_4821_bench/
//!     session_config.json
//!     run_0001/
//!       rx1.iq  rx2.iq  rx1.log  rx2.log  tx.log    canonical, promoted
//!       rx1_try1.log ...                            kept from failed attempts
//!       run_config.toml  run_report.json
//!   Latest/                                          copy of the last completed run
//! ```
//!
//! Attempt-scoped names carry a `_try{n}` suffix and are only ever written by that attempt.

use crate::config::DeviceRole;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Effective configuration written at the session root.
pub const SESSION_CONFIG_FILE: &str = "session_config.json";
/// Per-run configuration snapshot.
pub const RUN_CONFIG_FILE: &str = "run_config.toml";
/// Per-run outcome document.
pub const RUN_REPORT_FILE: &str = "run_report.json";
/// Provenance note inside the latest mirror.
pub const LATEST_SOURCE_FILE: &str = "LATEST_SOURCE.txt";

/// Raw capture file extension.
const IQ_EXT: &str = "iq";
/// Log file extension.
const LOG_EXT: &str = "log";

/// Session directory name: `collect_<UTC stamp>_<suffix>[_<tag>]`.
pub fn session_dir_name(now: DateTime<Utc>, suffix: u16, tag: Option<&str>) -> String {
    let stamp = now.format("%Y-%m-%dT%H-%M-%S");
    let base = format!("collect_{stamp}_{suffix:04}");
    match tag.map(sanitize_tag).filter(|t| !t.is_empty()) {
        Some(tag) => format!("{base}_{tag}"),
        None => base,
    }
}

/// Keep tags filesystem-safe: anything outside `[A-Za-z0-9_-]` becomes `_`.
fn sanitize_tag(tag: &str) -> String {
    tag.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Create a fresh session directory under `data_root`.
///
/// A name collision (two sessions in the same second with the same random suffix) is
/// resolved by drawing a new suffix.
pub fn create_session_dir(data_root: &Path, tag: Option<&str>) -> io::Result<PathBuf> {
    fs::create_dir_all(data_root)?;
    let mut rng = rand::thread_rng();
    let mut last_err = None;
    for _ in 0..16 {
        let name = session_dir_name(Utc::now(), rng.gen_range(1000..=9999), tag);
        let dir = data_root.join(name);
        match fs::create_dir(&dir) {
            Ok(()) => return Ok(dir),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => last_err = Some(e),
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "no free session name")))
}

/// `run_0001`, `run_0002`, ...
pub fn run_dir_name(index: u32) -> String {
    format!("run_{index:04}")
}

/// Paths of one run inside a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    index: u32,
    dir: PathBuf,
}

impl RunPaths {
    /// Paths for run `index` (1-based) under `session_dir`. Nothing is created.
    pub fn new(session_dir: &Path, index: u32) -> Self {
        Self {
            index,
            dir: session_dir.join(run_dir_name(index)),
        }
    }

    /// Run ordinal.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Run directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `run_0001` style name.
    pub fn name(&self) -> String {
        run_dir_name(self.index)
    }

    /// Create the run directory.
    pub fn create(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)
    }

    /// Canonical capture file for a receiver.
    pub fn canonical_output(&self, role: DeviceRole) -> PathBuf {
        self.dir.join(format!("{role}.{IQ_EXT}"))
    }

    /// Canonical log file for any role.
    pub fn canonical_log(&self, role: DeviceRole) -> PathBuf {
        self.dir.join(format!("{role}.{LOG_EXT}"))
    }

    /// Configuration snapshot path.
    pub fn config_snapshot(&self) -> PathBuf {
        self.dir.join(RUN_CONFIG_FILE)
    }

    /// Run report path.
    pub fn report(&self) -> PathBuf {
        self.dir.join(RUN_REPORT_FILE)
    }

    /// Attempt-scoped paths for attempt `attempt` (1-based).
    pub fn attempt(&self, attempt: u32) -> AttemptPaths {
        AttemptPaths {
            run: self.index,
            attempt,
            dir: self.dir.clone(),
        }
    }
}

/// File names owned by a single attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptPaths {
    /// Run ordinal.
    pub run: u32,
    /// Attempt number within the run, starting at 1.
    pub attempt: u32,
    dir: PathBuf,
}

impl AttemptPaths {
    /// Directory the attempt writes into (the run directory).
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `rx1_try2.iq`
    pub fn output(&self, role: DeviceRole) -> PathBuf {
        self.dir
            .join(format!("{role}_try{}.{IQ_EXT}", self.attempt))
    }

    /// `rx1_try2.log`, `tx_try2.log`
    pub fn log(&self, role: DeviceRole) -> PathBuf {
        self.dir
            .join(format!("{role}_try{}.{LOG_EXT}", self.attempt))
    }
}

/// Replace `latest_dir` with a copy of `run_dir`, plus the session configuration and a
/// provenance note.
pub fn update_latest(latest_dir: &Path, run_dir: &Path, session_dir: &Path) -> io::Result<()> {
    if run_dir.starts_with(latest_dir) || session_dir.starts_with(latest_dir) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "latest dir {} contains the session, refusing to replace it",
                latest_dir.display()
            ),
        ));
    }

    if latest_dir.exists() {
        fs::remove_dir_all(latest_dir)?;
    }
    copy_dir_recursive(run_dir, latest_dir)?;

    let session_config = session_dir.join(SESSION_CONFIG_FILE);
    if session_config.is_file() {
        fs::copy(&session_config, latest_dir.join(SESSION_CONFIG_FILE))?;
    }

    let run_name = run_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    fs::write(
        latest_dir.join(LATEST_SOURCE_FILE),
        format!(
            "session_dir={}\nrun_name={}\nrun_dir={}\n",
            session_dir.display(),
            run_name,
            run_dir.display()
        ),
    )
}

/// Recursive directory copy.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn session_name_format() {
        let now = Utc.with_ymd_and_hms(2026, 10, 17, 9, 30, 5).unwrap();
        assert_eq!(
            session_dir_name(now, 4821, None),
            "collect_2026-10-17T09-30-05_4821"
        );
        assert_eq!(
            session_dir_name(now, 4821, Some("bench a/b")),
            "collect_2026-10-17T09-30-05_4821_bench_a_b"
        );
        assert_eq!(
            session_dir_name(now, 4821, Some("  ")),
            "collect_2026-10-17T09-30-05_4821"
        );
    }

    #[test]
    fn run_and_attempt_names() {
        let run = RunPaths::new(Path::new("/s"), 12);
        assert_eq!(run.dir(), Path::new("/s/run_0012"));
        assert_eq!(run.canonical_output(DeviceRole::Rx2), Path::new("/s/run_0012/rx2.iq"));
        assert_eq!(run.canonical_log(DeviceRole::Tx), Path::new("/s/run_0012/tx.log"));

        let attempt = run.attempt(3);
        assert_eq!(attempt.output(DeviceRole::Rx1), Path::new("/s/run_0012/rx1_try3.iq"));
        assert_eq!(attempt.log(DeviceRole::Tx), Path::new("/s/run_0012/tx_try3.log"));
        assert_ne!(run.attempt(1).output(DeviceRole::Rx1), attempt.output(DeviceRole::Rx1));
    }

    #[test]
    fn session_dirs_are_unique() {
        let root = tempfile::tempdir().unwrap();
        let a = create_session_dir(root.path(), Some("t")).unwrap();
        let b = create_session_dir(root.path(), Some("t")).unwrap();
        assert_ne!(a, b);
        assert!(a.is_dir() && b.is_dir());
    }

    #[test]
    fn latest_mirror_is_replaced() {
        let root = tempfile::tempdir().unwrap();
        let session = root.path().join("collect_x");
        let latest = root.path().join("Latest");
        fs::create_dir_all(&latest).unwrap();
        fs::write(latest.join("stale.iq"), b"old").unwrap();

        let run = RunPaths::new(&session, 1);
        run.create().unwrap();
        fs::write(run.canonical_output(DeviceRole::Rx1), b"iq").unwrap();
        fs::write(session.join(SESSION_CONFIG_FILE), b"{}").unwrap();

        update_latest(&latest, run.dir(), &session).unwrap();

        assert!(!latest.join("stale.iq").exists());
        assert_eq!(fs::read(latest.join("rx1.iq")).unwrap(), b"iq");
        assert!(latest.join(SESSION_CONFIG_FILE).is_file());
        let note = fs::read_to_string(latest.join(LATEST_SOURCE_FILE)).unwrap();
        assert!(note.contains("run_name=run_0001"));
    }

    #[test]
    fn latest_refuses_to_wipe_session() {
        let root = tempfile::tempdir().unwrap();
        let session = root.path().join("collect_x");
        let run = RunPaths::new(&session, 1);
        run.create().unwrap();
        assert!(update_latest(root.path(), run.dir(), &session).is_err());
        assert!(run.dir().is_dir());
    }
}
