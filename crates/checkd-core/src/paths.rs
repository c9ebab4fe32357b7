use crate::error::{CheckdError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const CHECKD_DIR: &str = ".checkd";
pub const RUN_DIR: &str = ".checkd/run";
pub const LOG_DIR: &str = ".checkd/log";
pub const SPOOL_DIR: &str = ".checkd/spool";

pub const CONFIG_FILE: &str = ".checkd/config.yaml";
pub const PIPELINES_FILE: &str = ".checkd/pipelines.yaml";
pub const REGISTRY_FILE: &str = ".checkd/daemons.db";

pub const LOCK_FILE: &str = "supervisor.lock";
pub const INCOMING_DIR: &str = "incoming";
pub const CHECKED_DIR: &str = "checked";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn checkd_dir(root: &Path) -> PathBuf {
    root.join(CHECKD_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

/// Resolve a configured path against the root unless it is already absolute.
pub fn resolve(root: &Path, configured: &Path) -> PathBuf {
    if configured.is_absolute() {
        configured.to_path_buf()
    } else {
        root.join(configured)
    }
}

pub fn lock_path(run_dir: &Path) -> PathBuf {
    run_dir.join(LOCK_FILE)
}

/// `<log_dir>/<pipeline>.<worker_type>.<ordinal>.log`
pub fn worker_log_path(log_dir: &Path, pipeline: &str, worker_type: &str, ordinal: u32) -> PathBuf {
    log_dir.join(format!("{pipeline}.{worker_type}.{ordinal}.log"))
}

pub fn spool_incoming(spool_dir: &Path, pipeline: &str) -> PathBuf {
    spool_dir.join(pipeline).join(INCOMING_DIR)
}

pub fn spool_checked(spool_dir: &Path, pipeline: &str) -> PathBuf {
    spool_dir.join(pipeline).join(CHECKED_DIR)
}

// ---------------------------------------------------------------------------
// Name validation
// ---------------------------------------------------------------------------

static NAME_RE: OnceLock<Regex> = OnceLock::new();

fn name_re() -> &'static Regex {
    NAME_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_\-]*$").unwrap())
}

/// Pipeline names and worker types end up in file names and in the
/// `pipeline.workertype` identity marker, so dots and separators are rejected.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 || !name_re().is_match(name) {
        return Err(CheckdError::InvalidName(name.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
