//! Spawn handshake: how the orchestrator learns a worker's real pid.
//!
//! The pid returned by the spawn call is not the worker's, because the worker
//! detaches before it is ready. Instead:
//!
//! 1. the orchestrator allocates a unique rendezvous path under the run dir;
//! 2. the worker, once initialised, writes its own pid as the first line;
//! 3. the orchestrator waits a fixed grace period, then reads and deletes it.
//!
//! There is a single fixed timeout and no retry. A worker whose file is not
//! readable in time is reported and left untracked.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::error::{CheckdError, Result};
use crate::io;

/// Allocate a rendezvous path `<run_dir>/<pipeline>.<worker_type>.<uuid>.pid`.
/// The file itself is not created; that is the worker's job.
pub fn allocate(run_dir: &Path, pipeline: &str, worker_type: &str) -> Result<PathBuf> {
    io::ensure_dir(run_dir)?;
    Ok(run_dir.join(format!("{pipeline}.{worker_type}.{}.pid", Uuid::new_v4())))
}

/// Read the pid from the first line of `path`.
fn read_pid(path: &Path) -> std::result::Result<i32, String> {
    let file = std::fs::File::open(path).map_err(|e| format!("cannot open pid file: {e}"))?;
    let mut first = String::new();
    BufReader::new(file)
        .read_line(&mut first)
        .map_err(|e| format!("cannot read pid file: {e}"))?;
    let line = first.trim();
    if line.is_empty() {
        return Err("pid file is empty".into());
    }
    match line.parse::<i32>() {
        Ok(pid) if pid > 0 => Ok(pid),
        _ => Err(format!("pid file holds '{line}', not a pid")),
    }
}

/// Orchestrator side: take the pid out of the rendezvous file and delete it.
pub fn collect(path: &Path, pipeline: &str, ordinal: u32) -> Result<i32> {
    let pid = read_pid(path).map_err(|reason| CheckdError::HandshakeFailed {
        pipeline: pipeline.to_string(),
        ordinal,
        path: path.to_path_buf(),
        reason,
    })?;
    io::remove_if_exists(path)?;
    Ok(pid)
}

/// Worker side: announce `pid` once initialisation is complete.
pub fn publish(path: &Path, pid: u32) -> Result<()> {
    io::atomic_write(path, format!("{pid}\n").as_bytes())
}

/// Worker side, on exit: give the orchestrator up to `wait` to consume the
/// file, then remove it. Returns true if the worker had to remove it.
pub fn release(path: &Path, wait: Duration) -> Result<bool> {
    let deadline = Instant::now() + wait;
    while path.exists() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    io::remove_if_exists(path)
}
