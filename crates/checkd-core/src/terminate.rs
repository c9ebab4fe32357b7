//! Termination Controller.
//!
//! Every running registry row is re-verified against the live process table
//! before anything is signalled: the process must still carry the
//! `pipeline.workertype` marker it was spawned with. Rows that fail the check
//! are stale claims and are closed without sending a signal.
//!
//! Verified workers get SIGTERM, then the controller polls a bounded number of
//! rounds. Any survivor after the last round fails the whole request; rows for
//! workers that did die stay reconciled. A signal that cannot be delivered
//! does not abort the sweep: the row stays running and the first such error
//! is returned once every other worker has been handled.

use std::collections::HashSet;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{CheckdError, Result};
use crate::process::{carries_marker, ProcessTable, SignalOutcome};
use crate::registry::{DaemonDb, DaemonInstance, EndReason};

#[derive(Debug, Default)]
pub struct TerminationReport {
    /// Rows whose process was signalled and confirmed dead.
    pub terminated: Vec<DaemonInstance>,
    /// Rows closed without signalling.
    pub stale: Vec<DaemonInstance>,
}

pub struct Terminator<'a, P: ProcessTable + ?Sized> {
    db: &'a DaemonDb,
    procs: &'a P,
    interval: Duration,
    rounds: u32,
}

impl<'a, P: ProcessTable + ?Sized> Terminator<'a, P> {
    pub fn new(db: &'a DaemonDb, procs: &'a P, interval: Duration, rounds: u32) -> Self {
        Self {
            db,
            procs,
            interval,
            rounds,
        }
    }

    /// Stop every running instance, optionally only those of `pipeline`.
    pub fn terminate(&self, pipeline: Option<&str>) -> Result<TerminationReport> {
        let mut report = TerminationReport::default();
        let mut waiting: Vec<DaemonInstance> = Vec::new();
        let mut seen_pids = HashSet::new();
        let mut signal_error: Option<CheckdError> = None;

        for row in self.db.list_running(pipeline)? {
            // Rows are newest first; an older running row for the same pid
            // is an outdated claim.
            if !seen_pids.insert(row.pid) {
                report.stale.push(self.close_stale(&row, "older claim for a reused pid")?);
                continue;
            }

            let marker = row.marker();
            if !self.procs.is_alive(row.pid) {
                report.stale.push(self.close_stale(&row, "process not found")?);
                continue;
            }
            if !carries_marker(self.procs, row.pid, &marker) {
                report
                    .stale
                    .push(self.close_stale(&row, "pid belongs to another process")?);
                continue;
            }

            match self.procs.terminate(row.pid) {
                Ok(SignalOutcome::Delivered) => {
                    info!(pid = row.pid, pipeline = %row.pipeline, "SIGTERM sent");
                    waiting.push(row);
                }
                Ok(SignalOutcome::NoSuchProcess) => {
                    report.stale.push(self.close_stale(&row, "exited before signal")?);
                }
                Err(e) => {
                    warn!(pid = row.pid, pipeline = %row.pipeline, error = %e, "could not signal daemon");
                    signal_error.get_or_insert(e);
                }
            }
        }

        for round in 1..=self.rounds {
            if waiting.is_empty() {
                break;
            }
            std::thread::sleep(self.interval);
            let mut alive = Vec::with_capacity(waiting.len());
            for row in waiting {
                if self.procs.is_alive(row.pid) {
                    alive.push(row);
                } else {
                    let closed = self.db.mark_stopped(row.id, EndReason::Terminated)?;
                    info!(pid = closed.pid, pipeline = %closed.pipeline, "daemon terminated");
                    report.terminated.push(closed);
                }
            }
            waiting = alive;
            debug!(round, remaining = waiting.len(), "termination wait round complete");
        }

        if !waiting.is_empty() {
            let pids: Vec<i32> = waiting.iter().map(|r| r.pid).collect();
            return Err(CheckdError::TerminationTimeout(pids));
        }
        match signal_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    fn close_stale(&self, row: &DaemonInstance, why: &str) -> Result<DaemonInstance> {
        warn!(
            pid = row.pid,
            pipeline = %row.pipeline,
            worker_type = %row.worker_type,
            "stale registry claim ({why}); reconciled without signalling"
        );
        self.db.mark_stopped(row.id, EndReason::Stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::fake::{FakeProcesses, OnTerm};
    use tempfile::TempDir;

    const MARKED: &str = "checkd worker --pipeline=MAGE-TAB --marker=MAGE-TAB.Checker";

    fn open_tmp() -> (TempDir, DaemonDb) {
        let dir = TempDir::new().unwrap();
        let db = DaemonDb::open(&dir.path().join("daemons.db")).unwrap();
        (dir, db)
    }

    fn claim(db: &DaemonDb, pipeline: &str, pid: i32) -> DaemonInstance {
        db.insert(DaemonInstance::spawned(pipeline, "Checker", pid, "curator"))
            .unwrap()
    }

    fn terminator<'a>(db: &'a DaemonDb, procs: &'a FakeProcesses) -> Terminator<'a, FakeProcesses> {
        Terminator::new(db, procs, Duration::ZERO, 16)
    }

    #[test]
    fn unrelated_process_on_claimed_pid_is_never_signalled() {
        let (_dir, db) = open_tmp();
        let procs = FakeProcesses::new();
        claim(&db, "MAGE-TAB", 4321);
        procs.spawn(4321, "/usr/lib/postgresql/bin/postgres -D /data");

        let report = terminator(&db, &procs).terminate(None).unwrap();

        assert!(procs.signals().is_empty());
        assert_eq!(report.stale.len(), 1);
        assert!(report.terminated.is_empty());
        let row = &db.list_all().unwrap()[0];
        assert!(!row.running);
        assert_eq!(row.end_reason, Some(EndReason::Stale));
    }

    #[test]
    fn missing_process_is_reconciled_as_stale() {
        let (_dir, db) = open_tmp();
        let procs = FakeProcesses::new();
        claim(&db, "MAGE-TAB", 999);

        let report = terminator(&db, &procs).terminate(None).unwrap();
        assert_eq!(report.stale.len(), 1);
        assert!(procs.signals().is_empty());
        assert!(db.list_running(None).unwrap().is_empty());
    }

    #[test]
    fn verified_workers_are_signalled_and_reconciled() {
        let (_dir, db) = open_tmp();
        let procs = FakeProcesses::new();
        for pid in [101, 102, 103] {
            claim(&db, "MAGE-TAB", pid);
            procs.insert(pid, MARKED, None, OnTerm::ExitAfter(2));
        }

        let report = terminator(&db, &procs).terminate(None).unwrap();

        let mut signalled = procs.signals();
        signalled.sort();
        assert_eq!(signalled, vec![101, 102, 103]);
        assert_eq!(report.terminated.len(), 3);
        assert!(report
            .terminated
            .iter()
            .all(|r| r.end_reason == Some(EndReason::Terminated) && r.ended_at.is_some()));
        assert!(db.list_running(None).unwrap().is_empty());
    }

    #[test]
    fn survivor_fails_request_and_others_stay_reconciled() {
        let (_dir, db) = open_tmp();
        let procs = FakeProcesses::new();
        for pid in [201, 202] {
            claim(&db, "MAGE-TAB", pid);
            procs.insert(pid, MARKED, None, OnTerm::Exit);
        }
        claim(&db, "MAGE-TAB", 203);
        procs.insert(203, MARKED, None, OnTerm::Ignore);

        let err = terminator(&db, &procs).terminate(None).unwrap_err();
        match err {
            CheckdError::TerminationTimeout(pids) => assert_eq!(pids, vec![203]),
            other => panic!("expected TerminationTimeout, got {other:?}"),
        }

        let running: Vec<i32> = db.list_running(None).unwrap().iter().map(|r| r.pid).collect();
        assert_eq!(running, vec![203]);
        // 16 wait rounds plus the initial marker check.
        assert_eq!(procs.checks(203), 17);
    }

    #[test]
    fn pipeline_scope_leaves_other_pipelines_alone() {
        let (_dir, db) = open_tmp();
        let procs = FakeProcesses::new();
        claim(&db, "MAGE-TAB", 301);
        procs.spawn(301, MARKED);
        claim(&db, "SEQ", 302);
        procs.spawn(302, "checkd worker --marker=SEQ.Checker");

        terminator(&db, &procs).terminate(Some("SEQ")).unwrap();

        assert_eq!(procs.signals(), vec![302]);
        let running = db.list_running(None).unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].pid, 301);
    }

    #[test]
    fn marker_of_other_pipeline_does_not_verify() {
        let (_dir, db) = open_tmp();
        let procs = FakeProcesses::new();
        claim(&db, "SEQ", 401);
        procs.spawn(401, MARKED);

        let report = terminator(&db, &procs).terminate(None).unwrap();
        assert!(procs.signals().is_empty());
        assert_eq!(report.stale.len(), 1);
    }

    #[test]
    fn signal_failure_does_not_abandon_other_workers() {
        let (_dir, db) = open_tmp();
        let procs = FakeProcesses::new();
        for pid in [501, 502, 503] {
            claim(&db, "MAGE-TAB", pid);
        }
        procs.insert(501, MARKED, None, OnTerm::ExitAfter(1));
        procs.insert(502, MARKED, None, OnTerm::Refuse);
        procs.insert(503, MARKED, None, OnTerm::ExitAfter(1));

        let err = terminator(&db, &procs).terminate(None).unwrap_err();
        assert!(matches!(err, CheckdError::Signal(_)), "got {err:?}");

        let mut signalled = procs.signals();
        signalled.sort();
        assert_eq!(signalled, vec![501, 502, 503]);
        for pid in [501, 503] {
            let row = db.list_all().unwrap().into_iter().find(|r| r.pid == pid).unwrap();
            assert!(!row.running);
            assert_eq!(row.end_reason, Some(EndReason::Terminated));
        }
        let running: Vec<i32> = db.list_running(None).unwrap().iter().map(|r| r.pid).collect();
        assert_eq!(running, vec![502]);
    }

    #[test]
    fn suffix_of_another_marker_does_not_verify() {
        let (_dir, db) = open_tmp();
        let procs = FakeProcesses::new();
        claim(&db, "TAB", 601);
        procs.spawn(601, MARKED);

        let report = terminator(&db, &procs).terminate(None).unwrap();
        assert!(procs.signals().is_empty());
        assert_eq!(report.stale.len(), 1);
    }

    #[test]
    fn process_merely_mentioning_marker_is_not_signalled() {
        let (_dir, db) = open_tmp();
        let procs = FakeProcesses::new();
        claim(&db, "MAGE-TAB", 701);
        procs.spawn(701, "tail -f .checkd/log/MAGE-TAB.Checker.1.log");

        let report = terminator(&db, &procs).terminate(None).unwrap();
        assert!(procs.signals().is_empty());
        assert_eq!(report.stale.len(), 1);
        assert!(db.list_running(None).unwrap().is_empty());
    }

    #[test]
    fn live_marked_host_process_is_terminated() {
        use crate::process::HostProcesses;
        use std::os::unix::process::ExitStatusExt;

        let (_dir, db) = open_tmp();
        let mut child = std::process::Command::new("sh")
            .args(["-c", "sleep 30; :", "worker", "--marker=MAGE-TAB.Checker"])
            .spawn()
            .unwrap();
        let pid = child.id() as i32;
        claim(&db, "MAGE-TAB", pid);

        // The child is ours, so reap it in the background or it lingers as a
        // zombie; HostProcesses treats zombies as gone.
        let reaper = std::thread::spawn(move || child.wait().unwrap());
        let procs = HostProcesses::new();
        let report = Terminator::new(&db, &procs, Duration::from_millis(50), 100)
            .terminate(None)
            .unwrap();

        assert_eq!(report.terminated.len(), 1);
        assert!(report.stale.is_empty());
        let status = reaper.join().unwrap();
        assert_eq!(status.signal(), Some(nix::sys::signal::Signal::SIGTERM as i32));
    }

    #[test]
    fn nothing_running_is_success() {
        let (_dir, db) = open_tmp();
        let procs = FakeProcesses::new();
        let report = terminator(&db, &procs).terminate(None).unwrap();
        assert!(report.terminated.is_empty());
        assert!(report.stale.is_empty());
    }
}
