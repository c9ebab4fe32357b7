//! Process Supervisor: spawn one worker process per planned instance, drive
//! the handshake, and record each successful spawn in the registry.
//!
//! Per-instance failures (unknown worker type, spawn error, handshake error)
//! are collected in the [`LaunchReport`] so one bad pipeline cannot block the
//! rest of the batch. Registry failures abort the batch.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{SitePaths, SpawnMode};
use crate::error::{CheckdError, Result};
use crate::handshake;
use crate::paths;
use crate::pipeline::PlannedInstance;
use crate::registry::{DaemonDb, DaemonInstance};
use crate::worker::{RunMode, WorkerRegistry};

// ---------------------------------------------------------------------------
// Launcher
// ---------------------------------------------------------------------------

/// Everything a launcher needs to start one worker.
#[derive(Debug, Clone)]
pub struct SpawnRequest<'a> {
    pub planned: &'a PlannedInstance,
    /// `pipeline.workertype`, carried on the worker's command line.
    pub marker: String,
    pub pidfile: PathBuf,
    pub severity_threshold: u32,
    pub run_mode: RunMode,
}

pub trait Launcher {
    /// Start the worker. Returns the pid reported by the spawn call, which is
    /// not necessarily the worker's final pid.
    fn launch(&mut self, request: &SpawnRequest<'_>) -> Result<u32>;

    /// Collect launch processes that have already exited.
    fn reap(&mut self) {}
}

/// Spawns `<program> worker --detach ...`. The detach stage starts the real
/// worker in its own process group and exits.
pub struct ProcessLauncher {
    program: PathBuf,
    paths: SitePaths,
    handshake_grace: Duration,
    children: Vec<Child>,
}

impl ProcessLauncher {
    pub fn new(program: PathBuf, paths: SitePaths, handshake_grace: Duration) -> Self {
        Self {
            program,
            paths,
            handshake_grace,
            children: Vec::new(),
        }
    }

    /// The configured worker program, or else the running executable.
    pub fn resolve_program(configured: Option<&PathBuf>) -> Result<PathBuf> {
        match configured {
            Some(p) => Ok(p.clone()),
            None => Ok(std::env::current_exe()?),
        }
    }

    fn command(&self, request: &SpawnRequest<'_>, log_file: &std::path::Path) -> Command {
        let p = &request.planned.pipeline;
        let mut cmd = Command::new(&self.program);
        cmd.arg("worker")
            .arg("--detach")
            .arg(format!("--pipeline={}", p.name))
            .arg(format!("--worker-type={}", p.worker_type))
            .arg(format!("--ordinal={}", request.planned.ordinal))
            .arg(crate::process::marker_arg(&request.marker))
            .arg(format!("--pidfile={}", request.pidfile.display()))
            .arg(format!("--polling-interval={}", p.polling_interval))
            .arg(format!("--threshold={}", request.severity_threshold))
            .arg(format!("--accession-prefix={}", p.accession_prefix))
            .arg(format!("--spool-dir={}", self.paths.spool_dir.display()))
            .arg(format!("--log-file={}", log_file.display()))
            .arg(format!(
                "--handshake-grace-ms={}",
                self.handshake_grace.as_millis()
            ));
        if request.run_mode == RunMode::UntilIdle {
            cmd.arg("--once");
        }
        cmd.current_dir(&self.paths.root);
        cmd
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&mut self, request: &SpawnRequest<'_>) -> Result<u32> {
        let planned = request.planned;
        let spawn_err = |reason: String| CheckdError::SpawnFailed {
            pipeline: planned.pipeline.name.clone(),
            reason,
        };

        crate::io::ensure_dir(&self.paths.log_dir)
            .map_err(|e| spawn_err(format!("log dir {}: {e}", self.paths.log_dir.display())))?;
        let log_file = paths::worker_log_path(
            &self.paths.log_dir,
            &planned.pipeline.name,
            &planned.pipeline.worker_type,
            planned.ordinal,
        );
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .map_err(|e| spawn_err(format!("opening {}: {e}", log_file.display())))?;

        let child = self
            .command(request, &log_file)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log))
            .spawn()
            .map_err(|e| spawn_err(format!("{}: {e}", self.program.display())))?;
        let pid = child.id();
        self.children.push(child);
        Ok(pid)
    }

    fn reap(&mut self) {
        self.children
            .retain_mut(|child| !matches!(child.try_wait(), Ok(Some(_)) | Err(_)));
    }
}

// ---------------------------------------------------------------------------
// LaunchReport
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct LaunchReport {
    pub spawned: Vec<DaemonInstance>,
    pub failures: Vec<CheckdError>,
}

impl LaunchReport {
    pub fn tracked_pids(&self) -> Vec<i32> {
        self.spawned.iter().map(|i| i.pid).collect()
    }
}

/// Errors that fail one instance without aborting the batch.
fn is_instance_error(e: &CheckdError) -> bool {
    matches!(
        e,
        CheckdError::WorkerTypeUnavailable { .. }
            | CheckdError::SpawnFailed { .. }
            | CheckdError::HandshakeFailed { .. }
            | CheckdError::InvalidSeverity(_)
    )
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// A spawned worker whose handshake is not resolved yet.
struct Pending<'p> {
    planned: &'p PlannedInstance,
    pidfile: PathBuf,
}

pub struct Supervisor<'a, L: Launcher> {
    db: &'a DaemonDb,
    workers: &'a WorkerRegistry,
    launcher: L,
    run_dir: PathBuf,
    handshake_grace: Duration,
    spawn_mode: SpawnMode,
    user: String,
}

impl<'a, L: Launcher> Supervisor<'a, L> {
    pub fn new(
        db: &'a DaemonDb,
        workers: &'a WorkerRegistry,
        launcher: L,
        run_dir: PathBuf,
        handshake_grace: Duration,
        spawn_mode: SpawnMode,
        user: impl Into<String>,
    ) -> Self {
        Self {
            db,
            workers,
            launcher,
            run_dir,
            handshake_grace,
            spawn_mode,
            user: user.into(),
        }
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Spawn every planned instance in plan order.
    pub fn launch(&mut self, plan: &[PlannedInstance], run_mode: RunMode) -> Result<LaunchReport> {
        let mut report = LaunchReport::default();
        match self.spawn_mode {
            SpawnMode::Sequential => {
                for planned in plan {
                    let outcome = self
                        .start(planned, run_mode)
                        .and_then(|pending| self.wait_and_finish(pending));
                    self.record(outcome, &mut report)?;
                }
            }
            SpawnMode::Overlapped => {
                let mut pending = Vec::with_capacity(plan.len());
                for planned in plan {
                    match self.start(planned, run_mode) {
                        Ok(p) => pending.push(p),
                        Err(e) => self.record(Err(e), &mut report)?,
                    }
                }
                if !pending.is_empty() {
                    std::thread::sleep(self.handshake_grace);
                }
                for p in pending {
                    let outcome = self.finish(p);
                    self.record(outcome, &mut report)?;
                }
            }
        }
        self.launcher.reap();
        Ok(report)
    }

    fn record(
        &self,
        outcome: Result<DaemonInstance>,
        report: &mut LaunchReport,
    ) -> Result<()> {
        match outcome {
            Ok(instance) => {
                report.spawned.push(instance);
                Ok(())
            }
            Err(e) if is_instance_error(&e) => {
                warn!(error = %e, "instance not started");
                report.failures.push(e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn start<'p>(&mut self, planned: &'p PlannedInstance, run_mode: RunMode) -> Result<Pending<'p>> {
        let def = &planned.pipeline;
        if !self.workers.contains(&def.worker_type) {
            return Err(CheckdError::WorkerTypeUnavailable {
                pipeline: def.name.clone(),
                worker_type: def.worker_type.clone(),
            });
        }
        let severity_threshold = def.severity_threshold()?;
        let pidfile = handshake::allocate(&self.run_dir, &def.name, &def.worker_type)?;
        let request = SpawnRequest {
            planned,
            marker: def.marker(),
            pidfile: pidfile.clone(),
            severity_threshold,
            run_mode,
        };
        let spawn_pid = self.launcher.launch(&request)?;
        debug!(
            pipeline = %def.name,
            ordinal = planned.ordinal,
            spawn_pid,
            pidfile = %pidfile.display(),
            "worker spawned; awaiting handshake"
        );
        Ok(Pending { planned, pidfile })
    }

    fn wait_and_finish(&mut self, pending: Pending<'_>) -> Result<DaemonInstance> {
        std::thread::sleep(self.handshake_grace);
        self.finish(pending)
    }

    fn finish(&mut self, pending: Pending<'_>) -> Result<DaemonInstance> {
        let def = &pending.planned.pipeline;
        let pid = handshake::collect(&pending.pidfile, &def.name, pending.planned.ordinal)?;
        let row = self.db.insert(DaemonInstance::spawned(
            &def.name,
            &def.worker_type,
            pid,
            &self.user,
        ))?;
        info!(
            pipeline = %def.name,
            worker_type = %def.worker_type,
            ordinal = pending.planned.ordinal,
            pid,
            id = row.id,
            "daemon running"
        );
        Ok(row)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
