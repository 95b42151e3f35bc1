//! Atomic file replacement.
//!
//! RULE: Store and batch files are only ever replaced through
//! `replace_atomically`. Readers see the old complete file or the new
//! complete file, never a partial one.

use crate::error::VelocityResult;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Removes the temporary file on drop unless the rename went through.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!(
                        "Could not remove temporary file {}: {e}",
                        self.path.display()
                    );
                }
            }
        }
    }
}

/// `<dir>/<file-name>.<uuid>.tmp`, next to `dest` so the rename never
/// crosses a filesystem boundary.
pub fn temp_path_for(dest: &Path) -> PathBuf {
    let mut name: OsString = dest
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("store"));
    name.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
    dest.with_file_name(name)
}

/// Write through `write` into a fresh temporary file, fsync it, then
/// rename it onto `dest`. Any error before the rename leaves `dest`
/// untouched and the temporary file removed.
pub fn replace_atomically<F>(dest: &Path, write: F) -> VelocityResult<()>
where
    F: FnOnce(File) -> VelocityResult<()>,
{
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let temp_path = temp_path_for(dest);
    let mut guard = TempFileGuard::new(temp_path.clone());

    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp_path)?;
    write(file)?;

    // The writer owns and closes its handle; reopen to flush to disk.
    File::open(&temp_path)?.sync_all()?;
    fs::rename(&temp_path, dest)?;
    guard.disarm();

    log::debug!("Replaced {} atomically", dest.display());
    Ok(())
}
