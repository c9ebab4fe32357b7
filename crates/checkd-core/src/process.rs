//! The operating-system process table as seen by the orchestrator.
//!
//! Everything that touches live processes goes through [`ProcessTable`] so the
//! monitor and the termination controller can be exercised against a fake.

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use sysinfo::{ProcessRefreshKind, ProcessStatus, System, UpdateKind};
use tracing::debug;

use crate::error::{CheckdError, Result};

/// Subcommand every spawned worker runs under.
pub const WORKER_SUBCOMMAND: &str = "worker";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    Delivered,
    NoSuchProcess,
}

pub trait ProcessTable {
    /// Non-destructive liveness check. Anything other than a clear "this pid
    /// is a live process" answer counts as gone.
    fn is_alive(&self, pid: i32) -> bool;

    /// Argument vector of the live process.
    fn command_line(&self, pid: i32) -> Option<Vec<String>>;

    /// Ask the process to shut down gracefully (SIGTERM).
    fn terminate(&self, pid: i32) -> Result<SignalOutcome>;
}

/// The single argv element that identifies a worker: `--marker=<marker>`.
pub fn marker_arg(marker: &str) -> String {
    format!("--marker={marker}")
}

/// Does the live process `pid` carry the identity `marker`?
///
/// Arguments are compared whole, so a file name or a longer marker that
/// merely contains `marker` does not match.
pub fn carries_marker<P: ProcessTable + ?Sized>(procs: &P, pid: i32, marker: &str) -> bool {
    let Some(argv) = procs.command_line(pid) else {
        return false;
    };
    let expected = marker_arg(marker);
    argv.iter().any(|a| a == WORKER_SUBCOMMAND) && argv.iter().any(|a| *a == expected)
}

// ---------------------------------------------------------------------------
// HostProcesses
// ---------------------------------------------------------------------------

/// [`ProcessTable`] backed by the host kernel.
#[derive(Debug, Default)]
pub struct HostProcesses;

impl HostProcesses {
    pub fn new() -> Self {
        Self
    }

    fn snapshot(pid: i32) -> Option<(ProcessStatus, Vec<String>)> {
        let spid = sysinfo::Pid::from_u32(u32::try_from(pid).ok()?);
        let mut sys = System::new();
        // A plain refresh_process leaves the command line unloaded.
        let kind = ProcessRefreshKind::new().with_cmd(UpdateKind::Always);
        if !sys.refresh_process_specifics(spid, kind) {
            return None;
        }
        sys.process(spid).map(|p| (p.status(), p.cmd().to_vec()))
    }
}

impl ProcessTable for HostProcesses {
    fn is_alive(&self, pid: i32) -> bool {
        // pid 0 and negatives address process groups, never a single worker.
        if pid <= 0 {
            return false;
        }
        match kill(Pid::from_raw(pid), None) {
            Ok(()) => !matches!(
                Self::snapshot(pid),
                Some((ProcessStatus::Zombie | ProcessStatus::Dead, _))
            ),
            Err(Errno::ESRCH) => false,
            Err(e) => {
                debug!(pid, error = %e, "liveness check inconclusive; treating as gone");
                false
            }
        }
    }

    fn command_line(&self, pid: i32) -> Option<Vec<String>> {
        if pid <= 0 {
            return None;
        }
        match Self::snapshot(pid) {
            Some((ProcessStatus::Zombie | ProcessStatus::Dead, _)) => None,
            Some((_, cmd)) if !cmd.is_empty() => Some(cmd),
            _ => None,
        }
    }

    fn terminate(&self, pid: i32) -> Result<SignalOutcome> {
        if pid <= 0 {
            return Err(CheckdError::Signal(format!("refusing to signal pid {pid}")));
        }
        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) => Ok(SignalOutcome::Delivered),
            Err(Errno::ESRCH) => Ok(SignalOutcome::NoSuchProcess),
            Err(e) => Err(CheckdError::Signal(format!("SIGTERM to {pid}: {e}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Fake process table for unit tests
// ---------------------------------------------------------------------------
