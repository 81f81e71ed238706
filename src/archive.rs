//! Session archive: one `.zip` next to the session directory.
//!
//! Entries are stored uncompressed; raw IQ captures barely compress and the archive is
//! mostly a transport container.

use crate::error::{AppResult, CollectError};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Zip `session_dir` into `<session_dir>.zip`, replacing an existing archive.
///
/// Entry names are relative to the session's parent, so unpacking recreates the session
/// directory itself.
pub fn zip_session_dir(session_dir: &Path) -> AppResult<PathBuf> {
    if !session_dir.is_dir() {
        return Err(CollectError::Archive(format!(
            "session dir not found: {}",
            session_dir.display()
        )));
    }
    let name = session_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| CollectError::Archive("session dir has no name".to_string()))?;
    let zip_path = session_dir.with_file_name(format!("{name}.zip"));

    let mut files = Vec::new();
    collect_files(session_dir, &name, &mut files)?;
    files.sort();

    let out = BufWriter::new(File::create(&zip_path)?);
    let mut archive = rawzip::ZipArchiveWriter::new(out);
    for (entry_name, path) in &files {
        let mut entry = archive
            .new_file(entry_name)
            .compression_method(rawzip::CompressionMethod::Store)
            .create()
            .map_err(zip_err)?;
        let mut writer = rawzip::ZipDataWriter::new(&mut entry);
        io::copy(&mut File::open(path)?, &mut writer)?;
        let (_, descriptor) = writer.finish().map_err(zip_err)?;
        entry.finish(descriptor).map_err(zip_err)?;
        debug!(entry = %entry_name, "archived");
    }
    let mut out = archive.finish().map_err(zip_err)?;
    out.flush()?;

    Ok(zip_path)
}

fn collect_files(dir: &Path, prefix: &str, out: &mut Vec<(String, PathBuf)>) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = format!("{prefix}/{}", entry.file_name().to_string_lossy());
        if entry.file_type()?.is_dir() {
            collect_files(&entry.path(), &name, out)?;
        } else {
            out.push((name, entry.path()));
        }
    }
    Ok(())
}

fn zip_err(e: rawzip::Error) -> CollectError {
    CollectError::Archive(format!("{e:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_contains_session_tree() {
        let root = tempfile::tempdir().unwrap();
        let session = root.path().join("collect_test");
        std::fs::create_dir_all(session.join("run_0001")).unwrap();
        std::fs::write(session.join("session_config.json"), b"{}").unwrap();
        std::fs::write(session.join("run_0001").join("rx1.iq"), [1u8, 2, 3, 4]).unwrap();

        let zip = zip_session_dir(&session).unwrap();
        assert_eq!(zip, root.path().join("collect_test.zip"));

        let bytes = std::fs::read(&zip).unwrap();
        let archive = rawzip::ZipArchive::from_slice(&bytes).unwrap();
        let mut names = Vec::new();
        for entry in archive.entries() {
            let entry = entry.unwrap();
            names.push(entry.file_path().try_normalize().unwrap().as_ref().to_string());
        }
        names.sort();
        assert_eq!(
            names,
            vec!["collect_test/run_0001/rx1.iq", "collect_test/session_config.json"]
        );
    }

    #[test]
    fn missing_session_is_error() {
        let root = tempfile::tempdir().unwrap();
        assert!(zip_session_dir(&root.path().join("nope")).is_err());
    }
}
