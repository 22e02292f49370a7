// src/backend/storage/files.rs
// Crash-safe file primitives used by the vault.

use crate::error::{AfterselfError, Result};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// `tempfile` names its files `.tmpXXXXXX`; anything left with this prefix is a
/// write that never reached its rename.
const TEMP_PREFIX: &str = ".tmp";

/// Replaces `path` with `data` so that readers see either the old or the new
/// bytes, never a mix: temp file in the same directory, fsync, rename, fsync dir.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let parent = parent_of(path)?;
    ensure_dir(parent)?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| AfterselfError::Storage(format!("rename to {}: {}", path.display(), e.error)))?;

    fsync_dir(parent);
    Ok(())
}

/// Writes `data` to `path` only if nothing exists there yet. The file appears
/// complete or not at all.
pub fn write_once(path: &Path, data: &[u8]) -> Result<()> {
    let parent = parent_of(path)?;
    ensure_dir(parent)?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist_noclobber(path).map_err(|e| {
        AfterselfError::Storage(format!("write-once {}: {}", path.display(), e.error))
    })?;

    fsync_dir(parent);
    Ok(())
}

/// Reads `path`, `None` if it does not exist.
pub fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Creates `dir` (owner-only on unix) if it is missing.
pub fn ensure_dir(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Removes temp files abandoned by a crash mid-write. Returns how many were removed.
pub fn remove_stale_temp_files(dir: &Path) -> Result<usize> {
    if !dir.is_dir() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(TEMP_PREFIX) && entry.file_type()?.is_file() {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    if removed > 0 {
        debug!(dir = %dir.display(), removed, "removed stale temp files");
    }
    Ok(removed)
}

/// Best-effort copy of a freshly written primary file into the backup tree.
/// Failure is logged and swallowed.
pub fn mirror_to_backup(backup_root: &Path, relative: &Path, data: &[u8]) {
    let target = backup_root.join(relative);
    if let Err(err) = atomic_write(&target, data) {
        warn!(target = %target.display(), error = %err, "backup mirror failed");
    }
}

fn parent_of(path: &Path) -> Result<&Path> {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| AfterselfError::Storage(format!("{} has no parent directory", path.display())))
}

/// Commits a rename to disk. Not every platform can open a directory for sync,
/// so failure here is only logged.
fn fsync_dir(dir: &Path) {
    if let Err(err) = File::open(dir).and_then(|d| d.sync_all()) {
        debug!(dir = %dir.display(), error = %err, "directory fsync skipped");
    }
}
