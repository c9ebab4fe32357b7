use crate::error::{CheckdError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// TimingConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Fixed wait between spawning a worker and reading its pid file.
    #[serde(default = "default_handshake_grace_ms")]
    pub handshake_grace_ms: u64,
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
    #[serde(default = "default_terminate_interval_ms")]
    pub terminate_interval_ms: u64,
    #[serde(default = "default_terminate_rounds")]
    pub terminate_rounds: u32,
}

fn default_handshake_grace_ms() -> u64 {
    5_000
}

fn default_monitor_interval_ms() -> u64 {
    2_000
}

fn default_terminate_interval_ms() -> u64 {
    5_000
}

fn default_terminate_rounds() -> u32 {
    16
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            handshake_grace_ms: default_handshake_grace_ms(),
            monitor_interval_ms: default_monitor_interval_ms(),
            terminate_interval_ms: default_terminate_interval_ms(),
            terminate_rounds: default_terminate_rounds(),
        }
    }
}

impl TimingConfig {
    pub fn handshake_grace(&self) -> Duration {
        Duration::from_millis(self.handshake_grace_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn terminate_interval(&self) -> Duration {
        Duration::from_millis(self.terminate_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// SpawnMode
// ---------------------------------------------------------------------------

/// Whether instance N+1 is spawned only after instance N's handshake resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnMode {
    #[default]
    Sequential,
    /// Spawn every instance, wait one grace period, then read all handshakes.
    Overlapped,
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_email: Option<String>,
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_spool_dir")]
    pub spool_dir: PathBuf,
    #[serde(default = "default_registry")]
    pub registry: PathBuf,
    #[serde(default = "default_pipelines")]
    pub pipelines: PathBuf,
    /// Program spawned for each worker. Defaults to the running executable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_program: Option<PathBuf>,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub spawn_mode: SpawnMode,
}

fn default_version() -> u32 {
    1
}

fn default_run_dir() -> PathBuf {
    PathBuf::from(paths::RUN_DIR)
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(paths::LOG_DIR)
}

fn default_spool_dir() -> PathBuf {
    PathBuf::from(paths::SPOOL_DIR)
}

fn default_registry() -> PathBuf {
    PathBuf::from(paths::REGISTRY_FILE)
}

fn default_pipelines() -> PathBuf {
    PathBuf::from(paths::PIPELINES_FILE)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            admin_email: None,
            run_dir: default_run_dir(),
            log_dir: default_log_dir(),
            spool_dir: default_spool_dir(),
            registry: default_registry(),
            pipelines: default_pipelines(),
            worker_program: None,
            timing: TimingConfig::default(),
            spawn_mode: SpawnMode::default(),
        }
    }
}

/// Absolute locations derived from a [`Config`] and the project root.
#[derive(Debug, Clone, PartialEq)]
pub struct SitePaths {
    pub root: PathBuf,
    pub run_dir: PathBuf,
    pub log_dir: PathBuf,
    pub spool_dir: PathBuf,
    pub registry: PathBuf,
    pub pipelines: PathBuf,
}

impl Config {
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(CheckdError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    pub fn paths(&self, root: &Path) -> SitePaths {
        SitePaths {
            root: root.to_path_buf(),
            run_dir: paths::resolve(root, &self.run_dir),
            log_dir: paths::resolve(root, &self.log_dir),
            spool_dir: paths::resolve(root, &self.spool_dir),
            registry: paths::resolve(root, &self.registry),
            pipelines: paths::resolve(root, &self.pipelines),
        }
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.timing.monitor_interval_ms == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "timing.monitor_interval_ms is 0: the monitor will busy-poll".into(),
            });
        }

        if self.timing.terminate_rounds == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "timing.terminate_rounds is 0: every termination will time out".into(),
            });
        }

        if self.timing.handshake_grace_ms < 500 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "timing.handshake_grace_ms={} is short; slow workers will fail the handshake",
                    self.timing.handshake_grace_ms
                ),
            });
        }

        if let Some(program) = &self.worker_program {
            if program.as_os_str().is_empty() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: "worker_program is set but empty".into(),
                });
            }
        }

        warnings
    }

    /// Like [`Config::validate`], but any `Error`-level finding fails the
    /// call. The remaining warnings are returned for the caller to report.
    pub fn check(&self) -> Result<Vec<ConfigWarning>> {
        let (errors, warnings): (Vec<_>, Vec<_>) = self
            .validate()
            .into_iter()
            .partition(|w| w.level == WarnLevel::Error);
        if errors.is_empty() {
            return Ok(warnings);
        }
        let messages: Vec<String> = errors.into_iter().map(|w| w.message).collect();
        Err(CheckdError::InvalidConfig(messages.join("; ")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
