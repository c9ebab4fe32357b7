mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::launch::LaunchOptions;
use cmd::worker::WorkerArgs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "checkd",
    about = "Launch, monitor and stop pipeline checker daemons",
    version,
    propagate_version = true
)]
struct Cli {
    /// Site root (default: auto-detect from .checkd/)
    #[arg(long, global = true, env = "CHECKD_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    /// Log at debug level
    #[arg(long, global = true, short = 'v')]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create .checkd/ with a default config and an example pipeline registry
    Init,

    /// Start daemons and keep monitoring them in the foreground
    Launch {
        /// Pipeline to start one instance of (repeatable; default: every
        /// pipeline at its configured instance count)
        #[arg(long = "pipeline", value_name = "NAME")]
        pipelines: Vec<String>,

        /// Stop every running daemon, then start again
        #[arg(long, conflicts_with = "kill")]
        restart: bool,

        /// Stop every running daemon and exit
        #[arg(long)]
        kill: bool,
    },

    /// Start daemons that exit once their work is done; return when all have exited
    LaunchOnce {
        /// Pipeline to start one instance of (repeatable)
        #[arg(long = "pipeline", value_name = "NAME")]
        pipelines: Vec<String>,
    },

    /// List daemon instances recorded in the registry
    Status {
        /// Include instances that are no longer running
        #[arg(long)]
        all: bool,

        /// Only show instances of this pipeline
        #[arg(long)]
        pipeline: Option<String>,
    },

    /// Worker process entry point (spawned by launch)
    #[command(hide = true)]
    Worker(WorkerArgs),
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        match &cli.command {
            Commands::Launch { .. } | Commands::LaunchOnce { .. } | Commands::Worker(_) => {
                tracing::Level::INFO
            }
            _ => tracing::Level::WARN,
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root),
        Commands::Launch {
            pipelines,
            restart,
            kill,
        } => cmd::launch::run(
            &root,
            LaunchOptions {
                pipelines,
                kill,
                restart,
                once: false,
            },
            cli.json,
        ),
        Commands::LaunchOnce { pipelines } => cmd::launch::run(
            &root,
            LaunchOptions {
                pipelines,
                kill: false,
                restart: false,
                once: true,
            },
            cli.json,
        ),
        Commands::Status { all, pipeline } => {
            cmd::status::run(&root, all, pipeline.as_deref(), cli.json)
        }
        Commands::Worker(args) => cmd::worker::run(args),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
