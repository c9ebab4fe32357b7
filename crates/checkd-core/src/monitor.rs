//! Liveness Monitor: poll spawned workers and reconcile the registry when
//! they exit. Never signals anything.

use std::collections::BTreeSet;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::Result;
use crate::process::ProcessTable;
use crate::registry::{DaemonDb, EndReason};
use crate::signals::StopFlag;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    /// Occupy the foreground until interrupted.
    KeepRunning,
    /// Return once every tracked pid has been reconciled.
    UntilAllExit,
}

#[derive(Debug, Default, PartialEq)]
pub struct MonitorSummary {
    /// Pids seen to exit, in the order they were reconciled.
    pub reconciled: Vec<i32>,
    /// Pids still alive when the monitor returned.
    pub still_running: Vec<i32>,
}

pub struct Monitor<'a, P: ProcessTable + ?Sized> {
    db: &'a DaemonDb,
    procs: &'a P,
    interval: Duration,
    stop: StopFlag,
}

impl<'a, P: ProcessTable + ?Sized> Monitor<'a, P> {
    pub fn new(db: &'a DaemonDb, procs: &'a P, interval: Duration, stop: StopFlag) -> Self {
        Self {
            db,
            procs,
            interval,
            stop,
        }
    }

    /// Poll `tracked` every interval. Each pid is reconciled at most once.
    pub fn watch(&self, tracked: &[i32], mode: WatchMode) -> Result<MonitorSummary> {
        let mut pending: BTreeSet<i32> = tracked.iter().copied().collect();
        let mut summary = MonitorSummary::default();

        loop {
            let gone: Vec<i32> = pending
                .iter()
                .copied()
                .filter(|&pid| !self.procs.is_alive(pid))
                .collect();
            for pid in gone {
                pending.remove(&pid);
                match self.db.mark_stopped_by_pid(pid, EndReason::Exited)? {
                    Some(row) => info!(
                        pid,
                        pipeline = %row.pipeline,
                        id = row.id,
                        "daemon exited; registry reconciled"
                    ),
                    None => debug!(pid, "daemon exited; registry already reconciled"),
                }
                summary.reconciled.push(pid);
            }

            if mode == WatchMode::UntilAllExit && pending.is_empty() {
                break;
            }
            if self.stop.is_set() || self.stop.sleep(self.interval) {
                info!(remaining = pending.len(), "monitor interrupted");
                break;
            }
            debug!(remaining = pending.len(), "liveness round complete");
        }

        summary.still_running = pending.into_iter().collect();
        Ok(summary)
    }
}
