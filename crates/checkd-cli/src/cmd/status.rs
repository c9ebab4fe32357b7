use crate::output::{print_json, print_table};
use anyhow::Context;
use checkd_core::{
    config::Config,
    registry::{DaemonDb, DaemonInstance},
};
use std::path::Path;

pub fn run(root: &Path, all: bool, pipeline: Option<&str>, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let site = config.paths(root);
    let db = DaemonDb::open(&site.registry)
        .with_context(|| format!("failed to open registry {}", site.registry.display()))?;

    let rows: Vec<DaemonInstance> = if all {
        db.list_all()?
            .into_iter()
            .filter(|r| pipeline.map_or(true, |p| r.pipeline == p))
            .collect()
    } else {
        db.list_running(pipeline)?
    };

    if json {
        print_json(&rows)?;
        return Ok(());
    }

    if let Some(email) = &config.admin_email {
        println!("admin: {email}\n");
    }
    if rows.is_empty() {
        println!("No {} daemons.", if all { "recorded" } else { "running" });
        return Ok(());
    }

    let table: Vec<Vec<String>> = rows
        .iter()
        .map(|r| {
            vec![
                r.id.to_string(),
                r.pipeline.clone(),
                r.worker_type.clone(),
                r.pid.to_string(),
                r.user.clone(),
                r.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                state(r),
            ]
        })
        .collect();
    print_table(
        &["ID", "PIPELINE", "TYPE", "PID", "USER", "STARTED", "STATE"],
        table,
    );
    Ok(())
}

fn state(row: &DaemonInstance) -> String {
    if row.running {
        return "running".to_string();
    }
    let reason = row.end_reason.map(|r| r.as_str()).unwrap_or("stopped");
    match row.ended_at {
        Some(t) => format!("{reason} {}", t.format("%Y-%m-%d %H:%M:%S")),
        None => reason.to_string(),
    }
}
