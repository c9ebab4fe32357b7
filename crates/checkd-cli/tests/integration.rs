#![allow(deprecated)]
use assert_cmd::Command;
use checkd_core::config::Config;
use checkd_core::lock::SupervisorLock;
use checkd_core::process::{HostProcesses, ProcessTable};
use checkd_core::registry::{DaemonDb, DaemonInstance, EndReason};
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn checkd(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("checkd").unwrap();
    cmd.current_dir(dir.path()).env("CHECKD_ROOT", dir.path());
    cmd
}

/// `checkd init` with short timings so end-to-end runs finish quickly.
fn init_site(dir: &TempDir, pipelines: &str) {
    checkd(dir).arg("init").assert().success();
    let mut cfg = Config::load(dir.path()).unwrap();
    cfg.timing.handshake_grace_ms = 1_500;
    cfg.timing.monitor_interval_ms = 100;
    cfg.timing.terminate_interval_ms = 200;
    cfg.timing.terminate_rounds = 50;
    cfg.save(dir.path()).unwrap();
    std::fs::write(dir.path().join(".checkd/pipelines.yaml"), pipelines).unwrap();
}

fn registry(dir: &TempDir) -> DaemonDb {
    DaemonDb::open(&dir.path().join(".checkd/daemons.db")).unwrap()
}

fn spool(dir: &TempDir, pipeline: &str, sub: &str) -> PathBuf {
    dir.path().join(".checkd/spool").join(pipeline).join(sub)
}

fn count_files(path: &Path) -> usize {
    std::fs::read_dir(path).map(|d| d.count()).unwrap_or(0)
}

const ONE_MAGE_TAB: &str = r#"
pipelines:
  - name: MAGE-TAB
    worker_type: Checker
    instances: 1
    polling_interval: 1
    threshold: [error, fatal]
    accession_prefix: E-MTAB-
"#;

// ---------------------------------------------------------------------------
// checkd init
// ---------------------------------------------------------------------------

#[test]
fn init_creates_site_tree() {
    let dir = TempDir::new().unwrap();
    checkd(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("created: .checkd/config.yaml"));

    assert!(dir.path().join(".checkd/config.yaml").exists());
    assert!(dir.path().join(".checkd/pipelines.yaml").exists());
    assert!(dir.path().join(".checkd/run").is_dir());
    assert!(dir.path().join(".checkd/log").is_dir());
    assert!(dir.path().join(".checkd/spool").is_dir());
}

#[test]
fn init_is_idempotent_and_keeps_edits() {
    let dir = TempDir::new().unwrap();
    init_site(&dir, ONE_MAGE_TAB);
    checkd(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("exists:"));

    let cfg = Config::load(dir.path()).unwrap();
    assert_eq!(cfg.timing.handshake_grace_ms, 1_500);
    let pipelines = std::fs::read_to_string(dir.path().join(".checkd/pipelines.yaml")).unwrap();
    assert!(pipelines.contains("polling_interval: 1"));
}

// ---------------------------------------------------------------------------
// Argument and configuration errors
// ---------------------------------------------------------------------------

#[test]
fn launch_before_init_fails() {
    let dir = TempDir::new().unwrap();
    checkd(&dir)
        .arg("launch-once")
        .assert()
        .failure()
        .stderr(predicate::str::contains("checkd init"));
}

#[test]
fn unknown_pipeline_aborts_before_spawning() {
    let dir = TempDir::new().unwrap();
    init_site(&dir, ONE_MAGE_TAB);

    checkd(&dir)
        .args(["launch-once", "--pipeline", "MAGE-TAB", "--pipeline", "NOPE"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("pipeline not found: NOPE"));

    assert!(registry(&dir).list_all().unwrap().is_empty());
}

#[test]
fn kill_and_restart_conflict() {
    let dir = TempDir::new().unwrap();
    init_site(&dir, ONE_MAGE_TAB);
    checkd(&dir)
        .args(["launch", "--kill", "--restart"])
        .assert()
        .failure();
}

#[test]
fn unknown_worker_type_only_fails_that_instance() {
    let dir = TempDir::new().unwrap();
    init_site(
        &dir,
        r#"
pipelines:
  - name: MAGE-TAB
    worker_type: Checker
    instances: 1
  - name: GEO
    worker_type: Validator
    instances: 1
"#,
    );

    checkd(&dir)
        .arg("launch-once")
        .assert()
        .success()
        .stderr(predicate::str::contains("worker type 'Validator' not available"));

    let rows = registry(&dir).list_all().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].pipeline, "MAGE-TAB");
}

#[test]
fn error_level_config_refuses_to_launch() {
    let dir = TempDir::new().unwrap();
    init_site(&dir, ONE_MAGE_TAB);
    let mut cfg = Config::load(dir.path()).unwrap();
    cfg.timing.terminate_rounds = 0;
    cfg.save(dir.path()).unwrap();

    checkd(&dir)
        .args(["launch", "--kill"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid configuration"))
        .stderr(predicate::str::contains("terminate_rounds"));
    checkd(&dir)
        .arg("launch-once")
        .assert()
        .failure()
        .stderr(predicate::str::contains("terminate_rounds"));
    assert!(registry(&dir).list_all().unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// checkd status
// ---------------------------------------------------------------------------

#[test]
fn status_json_is_empty_on_fresh_site() {
    let dir = TempDir::new().unwrap();
    init_site(&dir, ONE_MAGE_TAB);
    let out = checkd(&dir)
        .args(["status", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let rows: Vec<DaemonInstance> = serde_json::from_slice(&out).unwrap();
    assert!(rows.is_empty());
}

#[test]
fn status_lists_running_rows() {
    let dir = TempDir::new().unwrap();
    init_site(&dir, ONE_MAGE_TAB);
    registry(&dir)
        .insert(DaemonInstance::spawned("MAGE-TAB", "Checker", 4321, "curator"))
        .unwrap();

    checkd(&dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("MAGE-TAB"))
        .stdout(predicate::str::contains("4321"))
        .stdout(predicate::str::contains("running"));
}

// ---------------------------------------------------------------------------
// End to end: launch-once
// ---------------------------------------------------------------------------

#[test]
fn launch_once_drains_spool_and_reconciles_every_instance() {
    let dir = TempDir::new().unwrap();
    init_site(
        &dir,
        r#"
pipelines:
  - name: MAGE-TAB
    worker_type: Checker
    instances: 2
    polling_interval: 1
    threshold: [error]
    accession_prefix: E-MTAB-
"#,
    );
    let incoming = spool(&dir, "MAGE-TAB", "incoming");
    std::fs::create_dir_all(&incoming).unwrap();
    for n in 1..=3 {
        std::fs::write(incoming.join(format!("E-MTAB-{n}.idf.txt")), "Investigation Title\t").unwrap();
    }

    checkd(&dir)
        .arg("launch-once")
        .timeout(Duration::from_secs(60))
        .assert()
        .success()
        .stdout(predicate::str::contains("Started MAGE-TAB.Checker"));

    assert_eq!(count_files(&incoming), 0);
    assert_eq!(count_files(&spool(&dir, "MAGE-TAB", "checked")), 3);

    let rows = registry(&dir).list_all().unwrap();
    assert_eq!(rows.len(), 2);
    for row in &rows {
        assert!(!row.running);
        assert!(row.ended_at.is_some());
        assert_eq!(row.end_reason, Some(EndReason::Exited));
        assert_eq!(row.worker_type, "Checker");
    }
    // Handshake files are consumed, never left behind.
    let leftovers = std::fs::read_dir(dir.path().join(".checkd/run"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|x| x == "pid"))
        .count();
    assert_eq!(leftovers, 0);
}

// ---------------------------------------------------------------------------
// End to end: termination
// ---------------------------------------------------------------------------

#[test]
fn kill_clears_stale_claim_without_signalling() {
    let dir = TempDir::new().unwrap();
    init_site(&dir, ONE_MAGE_TAB);

    // A live process that is not a checkd worker sits on the claimed pid.
    let mut bystander = std::process::Command::new("sleep").arg("30").spawn().unwrap();
    let pid = bystander.id() as i32;
    registry(&dir)
        .insert(DaemonInstance::spawned("MAGE-TAB", "Checker", pid, "curator"))
        .unwrap();

    checkd(&dir)
        .args(["launch", "--kill"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Cleared stale claim"));

    assert!(bystander.try_wait().unwrap().is_none(), "bystander was signalled");
    let row = &registry(&dir).list_all().unwrap()[0];
    assert!(!row.running);
    assert_eq!(row.end_reason, Some(EndReason::Stale));

    bystander.kill().unwrap();
    bystander.wait().unwrap();
}

#[test]
fn kill_reaches_pipeline_removed_from_definitions() {
    let dir = TempDir::new().unwrap();
    init_site(&dir, ONE_MAGE_TAB);

    let mut bystander = std::process::Command::new("sleep").arg("30").spawn().unwrap();
    let pid = bystander.id() as i32;
    registry(&dir)
        .insert(DaemonInstance::spawned("GONE", "Checker", pid, "curator"))
        .unwrap();

    checkd(&dir)
        .args(["launch", "--kill", "--pipeline", "GONE"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Cleared stale claim GONE.Checker"));

    assert!(bystander.try_wait().unwrap().is_none(), "bystander was signalled");
    assert!(registry(&dir).list_running(None).unwrap().is_empty());

    // Launching still insists the selector names a defined pipeline.
    checkd(&dir)
        .args(["launch", "--restart", "--pipeline", "GONE"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("pipeline not found: GONE"));

    bystander.kill().unwrap();
    bystander.wait().unwrap();
}

#[test]
fn kill_stops_daemon_started_by_foreground_launch() {
    let dir = TempDir::new().unwrap();
    init_site(&dir, ONE_MAGE_TAB);

    let mut foreground = std::process::Command::new(assert_cmd::cargo::cargo_bin("checkd"))
        .arg("launch")
        .current_dir(dir.path())
        .env("CHECKD_ROOT", dir.path())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .unwrap();

    let db = registry(&dir);
    let deadline = Instant::now() + Duration::from_secs(30);
    let worker = loop {
        if let Some(row) = db.list_running(None).unwrap().into_iter().next() {
            break row;
        }
        assert!(Instant::now() < deadline, "daemon never registered");
        std::thread::sleep(Duration::from_millis(100));
    };
    assert!(HostProcesses::new().is_alive(worker.pid));
    // The foreground supervisor drops its lock once spawning is over.
    let run_dir = dir.path().join(".checkd/run");
    while SupervisorLock::acquire(&run_dir).is_err() {
        assert!(Instant::now() < deadline, "supervisor lock never released");
        std::thread::sleep(Duration::from_millis(50));
    }

    checkd(&dir)
        .args(["launch", "--kill", "--json"])
        .timeout(Duration::from_secs(60))
        .assert()
        .success();

    assert!(!HostProcesses::new().is_alive(worker.pid));
    let row = db.get(worker.id).unwrap();
    assert!(!row.running);
    assert!(row.ended_at.is_some());

    foreground.kill().unwrap();
    foreground.wait().unwrap();
}
