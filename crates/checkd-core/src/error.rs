use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckdError {
    #[error("not initialized: run 'checkd init'")]
    NotInitialized,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("pipeline not found: {}", .0.join(", "))]
    PipelineNotFound(Vec<String>),

    #[error("duplicate pipeline definition: {0}")]
    DuplicatePipeline(String),

    #[error("invalid name '{0}': must be alphanumeric with '-' or '_', no dots")]
    InvalidName(String),

    #[error("unknown severity level '{0}' (expected debug, info, warn, error or fatal)")]
    InvalidSeverity(String),

    #[error("worker type '{worker_type}' not available for pipeline '{pipeline}'")]
    WorkerTypeUnavailable {
        pipeline: String,
        worker_type: String,
    },

    #[error("failed to spawn worker for pipeline '{pipeline}': {reason}")]
    SpawnFailed { pipeline: String, reason: String },

    #[error("handshake failed for {pipeline} #{ordinal} ({path}): {reason}")]
    HandshakeFailed {
        pipeline: String,
        ordinal: u32,
        path: PathBuf,
        reason: String,
    },

    #[error("daemons refused to terminate: {}", format_pids(.0))]
    TerminationTimeout(Vec<i32>),

    #[error("another supervisor holds the lock at {0}")]
    SupervisorBusy(PathBuf),

    #[error("instance not found: {0}")]
    InstanceNotFound(i64),

    #[error("registry database error: {0}")]
    RegistryDb(String),

    #[error("signal error: {0}")]
    Signal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

fn format_pids(pids: &[i32]) -> String {
    pids.iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, CheckdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn termination_timeout_names_every_pid() {
        let e = CheckdError::TerminationTimeout(vec![4321, 99]);
        assert_eq!(e.to_string(), "daemons refused to terminate: 4321, 99");
    }

    #[test]
    fn pipeline_not_found_names_every_selector() {
        let e = CheckdError::PipelineNotFound(vec!["NOPE".into(), "ALSO".into()]);
        assert_eq!(e.to_string(), "pipeline not found: NOPE, ALSO");
    }
}
