use anyhow::Context;
use checkd_core::{
    config::Config,
    io, paths,
    pipeline::{PipelineDefinition, PipelineFile},
};
use std::path::Path;

pub fn run(root: &Path) -> anyhow::Result<()> {
    println!("Initializing checkd in: {}", root.display());

    io::ensure_dir(&paths::checkd_dir(root))
        .with_context(|| format!("failed to create {}", paths::checkd_dir(root).display()))?;

    // 1. Write config.yaml if missing
    let defaults = serde_yaml::to_string(&Config::default())?;
    let created = io::write_if_missing(&paths::config_path(root), defaults.as_bytes())
        .context("failed to write config.yaml")?;
    report(created, paths::CONFIG_FILE);
    let config = Config::load(root).context("failed to load config.yaml")?;
    let site = config.paths(root);

    // 2. Example pipeline registry
    let example = serde_yaml::to_string(&example_pipelines())?;
    let created = io::write_if_missing(&site.pipelines, example.as_bytes())
        .context("failed to write pipelines.yaml")?;
    report(created, &site.pipelines.display().to_string());

    // 3. Runtime directories
    for dir in [&site.run_dir, &site.log_dir, &site.spool_dir] {
        io::ensure_dir(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    }

    for w in config.validate() {
        eprintln!("warning: {}", w.message);
    }

    println!("\ncheckd initialized. Edit the pipeline registry, then run 'checkd launch'.");
    Ok(())
}

fn report(created: bool, what: &str) {
    if created {
        println!("  created: {what}");
    } else {
        println!("  exists:  {what}");
    }
}

fn example_pipelines() -> PipelineFile {
    PipelineFile {
        pipelines: vec![PipelineDefinition {
            name: "MAGE-TAB".to_string(),
            worker_type: "Checker".to_string(),
            instances: 1,
            polling_interval: 30,
            threshold: vec!["error".to_string(), "fatal".to_string()],
            accession_prefix: "E-MTAB-".to_string(),
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use checkd_core::pipeline::PipelineStore;

    #[test]
    fn example_registry_is_valid() {
        let yaml = serde_yaml::to_string(&example_pipelines()).unwrap();
        let parsed = PipelineFile::parse(&yaml).unwrap();
        let def = parsed.find("MAGE-TAB").unwrap();
        assert_eq!(def.instances, 1);
        assert_eq!(def.severity_threshold().unwrap(), 24);
    }
}
