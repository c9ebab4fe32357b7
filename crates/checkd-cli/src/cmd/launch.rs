use crate::output::print_json;
use anyhow::Context;
use checkd_core::{
    config::{Config, SitePaths},
    lock::SupervisorLock,
    monitor::{Monitor, MonitorSummary, WatchMode},
    pipeline::{resolve_plan, PipelineFile, PlannedInstance},
    process::HostProcesses,
    registry::{current_user, DaemonDb, DaemonInstance},
    signals,
    supervisor::{LaunchReport, ProcessLauncher, Supervisor},
    terminate::{TerminationReport, Terminator},
    worker::{RunMode, WorkerRegistry},
};
use serde::Serialize;
use std::path::Path;
use tracing::{info, warn};

pub struct LaunchOptions {
    pub pipelines: Vec<String>,
    pub kill: bool,
    pub restart: bool,
    /// Workers exit once idle and the monitor returns when all are gone.
    pub once: bool,
}

#[derive(Serialize, Default)]
struct LaunchOutput {
    #[serde(skip_serializing_if = "Option::is_none")]
    terminated: Option<KillOutput>,
    spawned: Vec<DaemonInstance>,
    failures: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    monitor: Option<MonitorOutput>,
}

#[derive(Serialize)]
struct KillOutput {
    terminated: Vec<DaemonInstance>,
    stale: Vec<DaemonInstance>,
}

#[derive(Serialize)]
struct MonitorOutput {
    reconciled: Vec<i32>,
    still_running: Vec<i32>,
}

pub fn run(root: &Path, opts: LaunchOptions, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    for w in config.check()? {
        warn!("config: {}", w.message);
    }
    let site = config.paths(root);

    // A plain kill only filters the registry by name: pipelines that have
    // since been removed from pipelines.yaml must still be stoppable.
    let plan = if opts.kill {
        Vec::new()
    } else {
        let pipelines = PipelineFile::load(&site.pipelines)
            .with_context(|| format!("failed to load {}", site.pipelines.display()))?;
        // Every selector must resolve before anything is stopped or started.
        resolve_plan(&pipelines, &opts.pipelines)?
    };

    let db = DaemonDb::open(&site.registry)
        .with_context(|| format!("failed to open registry {}", site.registry.display()))?;
    let procs = HostProcesses::new();
    let stop = signals::install()?;

    let mut output = LaunchOutput::default();

    let report = {
        let _lock = SupervisorLock::acquire(&site.run_dir)?;

        if opts.kill || opts.restart {
            let killed = terminate(&config, &db, &procs, &opts.pipelines, json)?;
            output.terminated = Some(KillOutput {
                terminated: killed.terminated,
                stale: killed.stale,
            });
        }
        if opts.kill {
            return finish(output, json);
        }

        if plan.is_empty() {
            info!("no pipeline has instances > 0; nothing to launch");
            return finish(output, json);
        }

        spawn(&config, &site, &db, &plan, opts.once)?
    };

    for failure in &report.failures {
        eprintln!("warning: {failure}");
    }
    output.failures = report.failures.iter().map(|e| e.to_string()).collect();
    if report.spawned.is_empty() {
        anyhow::bail!("no daemon could be started ({} failed)", report.failures.len());
    }
    if !json {
        for row in &report.spawned {
            println!(
                "Started {}.{} pid {} (instance {})",
                row.pipeline, row.worker_type, row.pid, row.id
            );
        }
    }
    let tracked = report.tracked_pids();
    output.spawned = report.spawned;

    let mode = if opts.once {
        WatchMode::UntilAllExit
    } else {
        WatchMode::KeepRunning
    };
    info!(daemons = tracked.len(), "monitoring");
    let monitor = Monitor::new(&db, &procs, config.timing.monitor_interval(), stop);
    let MonitorSummary {
        reconciled,
        still_running,
    } = monitor.watch(&tracked, mode)?;
    output.monitor = Some(MonitorOutput {
        reconciled,
        still_running,
    });

    finish(output, json)
}

fn terminate(
    config: &Config,
    db: &DaemonDb,
    procs: &HostProcesses,
    pipelines: &[String],
    json: bool,
) -> anyhow::Result<TerminationReport> {
    let terminator = Terminator::new(
        db,
        procs,
        config.timing.terminate_interval(),
        config.timing.terminate_rounds,
    );
    if pipelines.is_empty() {
        let report = terminator.terminate(None)?;
        if !json {
            print_kill(&report);
        }
        return Ok(report);
    }

    let mut total = TerminationReport::default();
    let mut done: Vec<&str> = Vec::new();
    for name in pipelines {
        if done.contains(&name.as_str()) {
            continue;
        }
        done.push(name.as_str());
        let report = terminator.terminate(Some(name))?;
        if !json {
            print_kill(&report);
        }
        total.terminated.extend(report.terminated);
        total.stale.extend(report.stale);
    }
    Ok(total)
}

fn print_kill(report: &TerminationReport) {
    for row in &report.terminated {
        println!("Stopped {}.{} pid {}", row.pipeline, row.worker_type, row.pid);
    }
    for row in &report.stale {
        println!(
            "Cleared stale claim {}.{} pid {}",
            row.pipeline, row.worker_type, row.pid
        );
    }
}

fn spawn(
    config: &Config,
    site: &SitePaths,
    db: &DaemonDb,
    plan: &[PlannedInstance],
    once: bool,
) -> anyhow::Result<LaunchReport> {
    let program = ProcessLauncher::resolve_program(config.worker_program.as_ref())
        .context("cannot locate worker program")?;
    let launcher = ProcessLauncher::new(program, site.clone(), config.timing.handshake_grace());
    let workers = WorkerRegistry::with_builtins();
    let mut supervisor = Supervisor::new(
        db,
        &workers,
        launcher,
        site.run_dir.clone(),
        config.timing.handshake_grace(),
        config.spawn_mode,
        current_user(),
    );
    let run_mode = if once {
        RunMode::UntilIdle
    } else {
        RunMode::Forever
    };
    Ok(supervisor.launch(plan, run_mode)?)
}

fn finish(output: LaunchOutput, json: bool) -> anyhow::Result<()> {
    if json {
        print_json(&output)?;
    }
    Ok(())
}
