//! Pipeline Registry Reader.
//!
//! Pipeline definitions are managed outside this crate and are read-only here.
//! [`resolve_plan`] turns operator selectors into the ordered list of
//! instances the supervisor should spawn.

use crate::error::{CheckdError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

/// Named severity levels combined with bitwise OR into the worker threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl Severity {
    pub fn bits(self) -> u32 {
        match self {
            Severity::Debug => 1,
            Severity::Info => 2,
            Severity::Warn => 4,
            Severity::Error => 8,
            Severity::Fatal => 16,
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "debug" => Ok(Severity::Debug),
            "info" => Ok(Severity::Info),
            "warn" | "warning" => Ok(Severity::Warn),
            "error" => Ok(Severity::Error),
            "fatal" => Ok(Severity::Fatal),
            _ => Err(CheckdError::InvalidSeverity(name.to_string())),
        }
    }

    pub fn combine(levels: &[Severity]) -> u32 {
        levels.iter().fold(0, |acc, s| acc | s.bits())
    }
}

// ---------------------------------------------------------------------------
// PipelineDefinition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Submission type label, e.g. "MAGE-TAB".
    pub name: String,
    /// Registered worker implementation, e.g. "Checker".
    pub worker_type: String,
    /// Instances started when no explicit selector is given.
    #[serde(default)]
    pub instances: u32,
    /// Seconds between worker polls. Passed through, never used here.
    #[serde(default = "default_polling_interval")]
    pub polling_interval: u64,
    #[serde(default)]
    pub threshold: Vec<String>,
    #[serde(default)]
    pub accession_prefix: String,
}

fn default_polling_interval() -> u64 {
    30
}

impl PipelineDefinition {
    /// Identity marker carried on the worker's command line.
    pub fn marker(&self) -> String {
        marker(&self.name, &self.worker_type)
    }

    pub fn severity_threshold(&self) -> Result<u32> {
        let levels = self
            .threshold
            .iter()
            .map(|s| Severity::parse(s))
            .collect::<Result<Vec<_>>>()?;
        Ok(Severity::combine(&levels))
    }

    fn validate(&self) -> Result<()> {
        paths::validate_name(&self.name)?;
        paths::validate_name(&self.worker_type)?;
        self.severity_threshold()?;
        Ok(())
    }
}

pub fn marker(pipeline: &str, worker_type: &str) -> String {
    format!("{pipeline}.{worker_type}")
}

// ---------------------------------------------------------------------------
// PipelineStore
// ---------------------------------------------------------------------------

/// Read-only access to pipeline definitions.
pub trait PipelineStore {
    fn find(&self, name: &str) -> Option<&PipelineDefinition>;

    /// Every pipeline with desired concurrency > 0, in registry order.
    fn active(&self) -> Vec<&PipelineDefinition>;
}

/// YAML-backed pipeline registry (`pipelines.yaml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineFile {
    #[serde(default)]
    pub pipelines: Vec<PipelineDefinition>,
}

impl PipelineFile {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(CheckdError::NotInitialized);
        }
        let data = std::fs::read_to_string(path)?;
        Self::parse(&data)
    }

    pub fn parse(data: &str) -> Result<Self> {
        let file: PipelineFile = serde_yaml::from_str(data)?;
        let mut seen = HashSet::new();
        for p in &file.pipelines {
            p.validate()?;
            if !seen.insert(p.name.as_str()) {
                return Err(CheckdError::DuplicatePipeline(p.name.clone()));
            }
        }
        Ok(file)
    }
}

impl PipelineStore for PipelineFile {
    fn find(&self, name: &str) -> Option<&PipelineDefinition> {
        self.pipelines.iter().find(|p| p.name == name)
    }

    fn active(&self) -> Vec<&PipelineDefinition> {
        self.pipelines.iter().filter(|p| p.instances > 0).collect()
    }
}

// ---------------------------------------------------------------------------
// Plan resolution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedInstance {
    pub pipeline: PipelineDefinition,
    /// 1-based instance number within its pipeline.
    pub ordinal: u32,
}

/// Expand selectors (or the whole registry) into instances to spawn.
///
/// Any unresolved selector fails the whole plan so that nothing is started.
pub fn resolve_plan(store: &dyn PipelineStore, selectors: &[String]) -> Result<Vec<PlannedInstance>> {
    if selectors.is_empty() {
        let plan = store
            .active()
            .into_iter()
            .flat_map(|p| {
                (1..=p.instances).map(move |ordinal| PlannedInstance {
                    pipeline: p.clone(),
                    ordinal,
                })
            })
            .collect();
        return Ok(plan);
    }

    let missing: Vec<String> = selectors
        .iter()
        .filter(|s| store.find(s).is_none())
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(CheckdError::PipelineNotFound(missing));
    }

    let mut plan: Vec<PlannedInstance> = Vec::with_capacity(selectors.len());
    for selector in selectors {
        let Some(def) = store.find(selector) else {
            continue;
        };
        let ordinal = plan.iter().filter(|p| p.pipeline.name == def.name).count() as u32 + 1;
        plan.push(PlannedInstance {
            pipeline: def.clone(),
            ordinal,
        });
    }
    Ok(plan)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
