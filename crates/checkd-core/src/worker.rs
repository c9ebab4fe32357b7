//! Pluggable worker implementations.
//!
//! A worker type name from the pipeline registry is resolved through a
//! [`WorkerRegistry`] to a factory that configures a [`Worker`]. Resolution
//! failure is a typed error, never a crash at load time.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{CheckdError, Result};
use crate::paths;
use crate::signals::StopFlag;

// ---------------------------------------------------------------------------
// RunMode / WorkerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Keep polling until asked to stop.
    Forever,
    /// Exit as soon as there is no more work.
    UntilIdle,
}

/// Attribute set handed to a worker factory.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub pipeline_name: String,
    pub worker_type: String,
    pub polling_interval: Duration,
    pub severity_threshold: u32,
    pub accession_prefix: String,
    pub pidfile_path: PathBuf,
    pub run_mode: RunMode,
    pub spool_dir: PathBuf,
}

// ---------------------------------------------------------------------------
// Worker / WorkerRegistry
// ---------------------------------------------------------------------------

pub trait Worker {
    /// Block until the worker's own termination condition: idle in
    /// [`RunMode::UntilIdle`], a stop request in [`RunMode::Forever`].
    fn run(&mut self, stop: &StopFlag) -> Result<()>;
}

pub type WorkerFactory = fn(&WorkerConfig) -> Result<Box<dyn Worker>>;

pub struct WorkerRegistry {
    factories: BTreeMap<String, WorkerFactory>,
}

impl WorkerRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry holding every worker type shipped with checkd.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(Checker::TYPE_NAME, Checker::configure);
        registry
    }

    pub fn register(&mut self, name: &str, factory: WorkerFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn contains(&self, worker_type: &str) -> bool {
        self.factories.contains_key(worker_type)
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn configure(&self, config: &WorkerConfig) -> Result<Box<dyn Worker>> {
        let factory = self.factories.get(&config.worker_type).ok_or_else(|| {
            CheckdError::WorkerTypeUnavailable {
                pipeline: config.pipeline_name.clone(),
                worker_type: config.worker_type.clone(),
            }
        })?;
        factory(config)
    }
}

// ---------------------------------------------------------------------------
// Checker (built-in)
// ---------------------------------------------------------------------------

/// Consumes submission files from `<spool>/<pipeline>/incoming/` and files
/// them under `checked/`. The content checks themselves live elsewhere.
pub struct Checker {
    config: WorkerConfig,
    incoming: PathBuf,
    checked: PathBuf,
}

impl Checker {
    pub const TYPE_NAME: &'static str = "Checker";

    pub fn configure(config: &WorkerConfig) -> Result<Box<dyn Worker>> {
        let incoming = paths::spool_incoming(&config.spool_dir, &config.pipeline_name);
        let checked = paths::spool_checked(&config.spool_dir, &config.pipeline_name);
        crate::io::ensure_dir(&incoming)?;
        crate::io::ensure_dir(&checked)?;
        Ok(Box::new(Self {
            config: config.clone(),
            incoming,
            checked,
        }))
    }

    fn pending(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        files.sort();
        Ok(files)
    }

    /// One scan of the incoming directory. Returns the number of files checked.
    fn pass(&self, stop: &StopFlag) -> Result<usize> {
        let mut done = 0;
        for file in Self::pending(&self.incoming)? {
            if stop.is_set() {
                break;
            }
            let Some(name) = file.file_name() else {
                continue;
            };
            let target = self.checked.join(name);
            match std::fs::rename(&file, &target) {
                Ok(()) => {
                    info!(
                        pipeline = %self.config.pipeline_name,
                        submission = %name.to_string_lossy(),
                        threshold = self.config.severity_threshold,
                        accession_prefix = %self.config.accession_prefix,
                        "submission checked"
                    );
                    done += 1;
                }
                // Another instance of the same pipeline took it first.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(file = %file.display(), error = %e, "could not file submission");
                }
            }
        }
        Ok(done)
    }
}

impl Worker for Checker {
    fn run(&mut self, stop: &StopFlag) -> Result<()> {
        loop {
            let done = self.pass(stop)?;
            if stop.is_set() {
                info!(pipeline = %self.config.pipeline_name, "stop requested");
                return Ok(());
            }
            if done == 0 && self.config.run_mode == RunMode::UntilIdle {
                info!(pipeline = %self.config.pipeline_name, "no more work; exiting");
                return Ok(());
            }
            if done == 0 && stop.sleep(self.config.polling_interval) {
                info!(pipeline = %self.config.pipeline_name, "stop requested");
                return Ok(());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
