use anyhow::Context;
use checkd_core::{
    handshake, signals,
    worker::{RunMode, WorkerConfig, WorkerRegistry},
};
use clap::Args;
use std::fs::OpenOptions;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::info;

#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Re-spawn in a new process group and return immediately
    #[arg(long)]
    pub detach: bool,

    #[arg(long)]
    pub pipeline: String,

    #[arg(long)]
    pub worker_type: String,

    #[arg(long, default_value_t = 1)]
    pub ordinal: u32,

    /// `pipeline.workertype`; only here so the process can be identified
    #[arg(long)]
    pub marker: String,

    /// Rendezvous file that receives this process's pid
    #[arg(long)]
    pub pidfile: PathBuf,

    /// Seconds between polls
    #[arg(long, default_value_t = 30)]
    pub polling_interval: u64,

    #[arg(long, default_value_t = 0)]
    pub threshold: u32,

    #[arg(long, default_value = "")]
    pub accession_prefix: String,

    #[arg(long)]
    pub spool_dir: PathBuf,

    /// Where the detached worker's output goes
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    #[arg(long, default_value_t = 5_000)]
    pub handshake_grace_ms: u64,

    /// Exit once there is no more work
    #[arg(long)]
    pub once: bool,
}

pub fn run(args: WorkerArgs) -> anyhow::Result<()> {
    if args.detach {
        detach(&args)
    } else {
        work(args)
    }
}

/// Start the real worker in its own process group so it outlives the
/// orchestrator. Its pid is learned through the handshake, not from here.
fn detach(args: &WorkerArgs) -> anyhow::Result<()> {
    let program = std::env::current_exe().context("cannot locate own executable")?;
    let forwarded = std::env::args_os()
        .skip(1)
        .filter(|a| a.as_os_str() != "--detach");

    let mut cmd = Command::new(program);
    cmd.args(forwarded).stdin(Stdio::null()).process_group(0);
    match &args.log_file {
        Some(path) => {
            let log = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            cmd.stdout(log.try_clone()?).stderr(log);
        }
        None => {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
    }
    cmd.spawn()
        .with_context(|| format!("failed to start worker for {}", args.marker))?;
    Ok(())
}

fn work(args: WorkerArgs) -> anyhow::Result<()> {
    let config = WorkerConfig {
        pipeline_name: args.pipeline,
        worker_type: args.worker_type,
        polling_interval: Duration::from_secs(args.polling_interval),
        severity_threshold: args.threshold,
        accession_prefix: args.accession_prefix,
        pidfile_path: args.pidfile,
        run_mode: if args.once {
            RunMode::UntilIdle
        } else {
            RunMode::Forever
        },
        spool_dir: args.spool_dir,
    };

    let registry = WorkerRegistry::with_builtins();
    let mut worker = registry.configure(&config)?;
    let stop = signals::install()?;

    handshake::publish(&config.pidfile_path, std::process::id())
        .context("failed to publish pid")?;
    info!(
        marker = %args.marker,
        ordinal = args.ordinal,
        pid = std::process::id(),
        mode = ?config.run_mode,
        "worker started"
    );

    let result = worker.run(&stop);

    let grace = Duration::from_millis(args.handshake_grace_ms.saturating_mul(2));
    if handshake::release(&config.pidfile_path, grace)? {
        info!(pidfile = %config.pidfile_path.display(), "removed unclaimed pid file");
    }
    info!(marker = %args.marker, "worker exiting");
    result.map_err(Into::into)
}
