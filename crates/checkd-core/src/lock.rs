//! Advisory lock held while an invocation spawns or terminates daemons, so two
//! concurrent invocations cannot double-spawn or race on reconciliation.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::error::{CheckdError, Result};
use crate::paths;

#[derive(Debug)]
pub struct SupervisorLock {
    // Held to keep the exclusive lock; released on drop.
    file: File,
    path: PathBuf,
}

impl SupervisorLock {
    /// Take the lock under `run_dir` without blocking.
    pub fn acquire(run_dir: &Path) -> Result<Self> {
        crate::io::ensure_dir(run_dir)?;
        let path = paths::lock_path(run_dir);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;
        if let Err(e) = FileExt::try_lock_exclusive(&file) {
            if e.kind() == std::io::ErrorKind::WouldBlock
                || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
            {
                return Err(CheckdError::SupervisorBusy(path));
            }
            return Err(e.into());
        }
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        debug!(path = %path.display(), "supervisor lock acquired");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SupervisorLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
