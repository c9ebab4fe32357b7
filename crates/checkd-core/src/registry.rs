//! Daemon Instance Registry: persistent spawn/death records in SQLite.
//!
//! The registry is the only memory shared between orchestrator invocations,
//! and several invocations (a foreground supervisor, a `--kill` from another
//! terminal) open it at the same time. Each mutation is a single statement or
//! a short immediate transaction; a busy timeout covers brief contention.
//!
//! Rows are never deleted. A `running = 1` row is a claim, not a fact: pids
//! are reused by the OS, so only the newest running row for a pid is
//! meaningful, and [`DaemonDb::insert`] closes older running rows that carry
//! the same pid.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CheckdError, Result};

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const COLUMNS: &str =
    "id, pipeline, worker_type, pid, started_at, ended_at, running, end_reason, user";

fn db_err(e: impl std::fmt::Display) -> CheckdError {
    CheckdError::RegistryDb(e.to_string())
}

// ---------------------------------------------------------------------------
// DaemonInstance
// ---------------------------------------------------------------------------

/// Why a row stopped claiming a live process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The liveness monitor saw the process disappear.
    Exited,
    /// The termination controller signalled it and confirmed death.
    Terminated,
    /// The pid was gone or belonged to another process.
    Stale,
    /// A newer row claimed the same pid.
    Superseded,
}

impl EndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EndReason::Exited => "exited",
            EndReason::Terminated => "terminated",
            EndReason::Stale => "stale",
            EndReason::Superseded => "superseded",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "exited" => Some(EndReason::Exited),
            "terminated" => Some(EndReason::Terminated),
            "stale" => Some(EndReason::Stale),
            "superseded" => Some(EndReason::Superseded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonInstance {
    /// Assigned by [`DaemonDb::insert`].
    pub id: i64,
    pub pipeline: String,
    pub worker_type: String,
    pub pid: i32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub running: bool,
    pub end_reason: Option<EndReason>,
    /// Login name of the invoking user.
    pub user: String,
}

impl DaemonInstance {
    /// A fresh running claim for a worker that just completed its handshake.
    pub fn spawned(
        pipeline: impl Into<String>,
        worker_type: impl Into<String>,
        pid: i32,
        user: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            pipeline: pipeline.into(),
            worker_type: worker_type.into(),
            pid,
            started_at: Utc::now(),
            ended_at: None,
            running: true,
            end_reason: None,
            user: user.into(),
        }
    }

    pub fn marker(&self) -> String {
        crate::pipeline::marker(&self.pipeline, &self.worker_type)
    }

    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        let started_at: String = row.get(4)?;
        let ended_at: Option<String> = row.get(5)?;
        let end_reason: Option<String> = row.get(7)?;
        Ok(Self {
            id: row.get(0)?,
            pipeline: row.get(1)?,
            worker_type: row.get(2)?,
            pid: row.get(3)?,
            started_at: parse_ts(&started_at),
            ended_at: ended_at.as_deref().map(parse_ts),
            running: row.get(6)?,
            end_reason: end_reason.as_deref().and_then(EndReason::parse),
            user: row.get(8)?,
        })
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

/// Login name of the effective user, for the `user` column.
pub fn current_user() -> String {
    let uid = nix::unistd::Uid::effective();
    match nix::unistd::User::from_uid(uid) {
        Ok(Some(user)) => user.name,
        _ => std::env::var("USER").unwrap_or_else(|_| uid.to_string()),
    }
}

// ---------------------------------------------------------------------------
// DaemonDb
// ---------------------------------------------------------------------------

/// Persistent store for [`DaemonInstance`] records, shared by every invocation.
pub struct DaemonDb {
    conn: Mutex<Connection>,
}

impl DaemonDb {
    /// Open or create the registry at `path`, creating the schema if needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        Self::initialize(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::initialize(Connection::open_in_memory().map_err(db_err)?)
    }

    fn initialize(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT).map_err(db_err)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS daemon_instances (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pipeline TEXT NOT NULL,
                worker_type TEXT NOT NULL,
                pid INTEGER NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                running INTEGER NOT NULL DEFAULT 1,
                end_reason TEXT,
                user TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_instances_running ON daemon_instances(running, pid);
            CREATE INDEX IF NOT EXISTS idx_instances_pipeline ON daemon_instances(pipeline);
            "#,
        )
        .map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CheckdError::RegistryDb("connection mutex poisoned".into()))
    }

    /// Append a running row, assigning its id. Older running rows with the
    /// same pid are closed as `Superseded` in the same transaction.
    pub fn insert(&self, mut instance: DaemonInstance) -> Result<DaemonInstance> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let now = Utc::now().to_rfc3339();
        let superseded = tx
            .execute(
                "UPDATE daemon_instances SET running = 0, ended_at = ?1, end_reason = ?2 \
                 WHERE running = 1 AND pid = ?3",
                params![now, EndReason::Superseded.as_str(), instance.pid],
            )
            .map_err(db_err)?;
        if superseded > 0 {
            warn!(
                pid = instance.pid,
                rows = superseded,
                "pid reused; closed older running claims"
            );
        }

        tx.execute(
            "INSERT INTO daemon_instances (pipeline, worker_type, pid, started_at, ended_at, running, end_reason, user) \
             VALUES (?1, ?2, ?3, ?4, NULL, 1, NULL, ?5)",
            params![
                instance.pipeline,
                instance.worker_type,
                instance.pid,
                instance.started_at.to_rfc3339(),
                instance.user,
            ],
        )
        .map_err(db_err)?;
        instance.id = tx.last_insert_rowid();
        instance.running = true;
        tx.commit().map_err(db_err)?;
        Ok(instance)
    }

    /// Close the row identified by `id`. Closing an already closed row is a no-op.
    pub fn mark_stopped(&self, id: i64, reason: EndReason) -> Result<DaemonInstance> {
        {
            let conn = self.conn()?;
            conn.execute(
                "UPDATE daemon_instances SET running = 0, ended_at = ?1, end_reason = ?2 \
                 WHERE id = ?3 AND running = 1",
                params![Utc::now().to_rfc3339(), reason.as_str(), id],
            )
            .map_err(db_err)?;
        }
        self.get(id)
    }

    /// Close the newest running row for `pid`. Returns `None` when no running
    /// row claims that pid.
    pub fn mark_stopped_by_pid(&self, pid: i32, reason: EndReason) -> Result<Option<DaemonInstance>> {
        let id = {
            let mut conn = self.conn()?;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db_err)?;
            let id: Option<i64> = tx
                .query_row(
                    "SELECT id FROM daemon_instances WHERE running = 1 AND pid = ?1 \
                     ORDER BY id DESC LIMIT 1",
                    params![pid],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            if let Some(id) = id {
                tx.execute(
                    "UPDATE daemon_instances SET running = 0, ended_at = ?1, end_reason = ?2 \
                     WHERE id = ?3",
                    params![Utc::now().to_rfc3339(), reason.as_str(), id],
                )
                .map_err(db_err)?;
            }
            tx.commit().map_err(db_err)?;
            id
        };
        id.map(|id| self.get(id)).transpose()
    }

    /// Running rows, newest first, optionally restricted to one pipeline.
    pub fn list_running(&self, pipeline: Option<&str>) -> Result<Vec<DaemonInstance>> {
        self.query(true, pipeline)
    }

    /// Every row ever recorded, newest first.
    pub fn list_all(&self) -> Result<Vec<DaemonInstance>> {
        self.query(false, None)
    }

    fn query(&self, running_only: bool, pipeline: Option<&str>) -> Result<Vec<DaemonInstance>> {
        let conn = self.conn()?;
        let mut conditions = Vec::new();
        if running_only {
            conditions.push("running = 1");
        }
        if pipeline.is_some() {
            conditions.push("pipeline = ?1");
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        let sql = format!("SELECT {COLUMNS} FROM daemon_instances {where_clause} ORDER BY id DESC");

        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = match pipeline {
            Some(p) => stmt.query_map(params![p], DaemonInstance::from_row),
            None => stmt.query_map([], DaemonInstance::from_row),
        }
        .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    pub fn get(&self, id: i64) -> Result<DaemonInstance> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM daemon_instances WHERE id = ?1"),
            params![id],
            DaemonInstance::from_row,
        )
        .optional()
        .map_err(db_err)?
        .ok_or(CheckdError::InstanceNotFound(id))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn spawned(pipeline: &str, pid: i32) -> DaemonInstance {
        DaemonInstance::spawned(pipeline, "Checker", pid, "curator")
    }

    #[test]
    fn insert_assigns_increasing_ids() {
        let db = DaemonDb::in_memory().unwrap();
        let a = db.insert(spawned("MAGE-TAB", 100)).unwrap();
        let b = db.insert(spawned("MAGE-TAB", 101)).unwrap();
        assert!(b.id > a.id);
        let stored = db.get(b.id).unwrap();
        assert!(stored.running);
        assert!(stored.ended_at.is_none());
        assert_eq!(stored.pid, 101);
    }

    #[test]
    fn list_running_is_newest_first_and_filtered() {
        let db = DaemonDb::in_memory().unwrap();
        db.insert(spawned("MAGE-TAB", 100)).unwrap();
        db.insert(spawned("SEQ", 200)).unwrap();
        db.insert(spawned("MAGE-TAB", 300)).unwrap();

        let all: Vec<i32> = db.list_running(None).unwrap().iter().map(|r| r.pid).collect();
        assert_eq!(all, vec![300, 200, 100]);

        let mage: Vec<i32> = db
            .list_running(Some("MAGE-TAB"))
            .unwrap()
            .iter()
            .map(|r| r.pid)
            .collect();
        assert_eq!(mage, vec![300, 100]);
    }

    #[test]
    fn mark_stopped_by_pid_sets_end_time() {
        let db = DaemonDb::in_memory().unwrap();
        let row = db.insert(spawned("MAGE-TAB", 4321)).unwrap();

        let closed = db
            .mark_stopped_by_pid(4321, EndReason::Exited)
            .unwrap()
            .expect("row closed");
        assert_eq!(closed.id, row.id);
        assert!(!closed.running);
        assert!(closed.ended_at.is_some());
        assert_eq!(closed.end_reason, Some(EndReason::Exited));
        assert!(db.list_running(None).unwrap().is_empty());
    }

    #[test]
    fn mark_stopped_by_pid_without_running_row_is_none() {
        let db = DaemonDb::in_memory().unwrap();
        db.insert(spawned("MAGE-TAB", 1)).unwrap();
        db.mark_stopped_by_pid(1, EndReason::Exited).unwrap();
        assert!(db.mark_stopped_by_pid(1, EndReason::Exited).unwrap().is_none());
        assert!(db.mark_stopped_by_pid(999, EndReason::Exited).unwrap().is_none());
    }

    #[test]
    fn mark_stopped_twice_keeps_first_reason() {
        let db = DaemonDb::in_memory().unwrap();
        let row = db.insert(spawned("MAGE-TAB", 7)).unwrap();
        let first = db.mark_stopped(row.id, EndReason::Stale).unwrap();
        let second = db.mark_stopped(row.id, EndReason::Terminated).unwrap();
        assert_eq!(first.ended_at, second.ended_at);
        assert_eq!(second.end_reason, Some(EndReason::Stale));
    }

    #[test]
    fn mark_stopped_unknown_id_errors() {
        let db = DaemonDb::in_memory().unwrap();
        assert!(matches!(
            db.mark_stopped(42, EndReason::Exited),
            Err(CheckdError::InstanceNotFound(42))
        ));
    }

    #[test]
    fn reused_pid_supersedes_older_claim() {
        let db = DaemonDb::in_memory().unwrap();
        let old = db.insert(spawned("MAGE-TAB", 555)).unwrap();
        let new = db.insert(spawned("SEQ", 555)).unwrap();

        let running = db.list_running(None).unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, new.id);

        let old = db.get(old.id).unwrap();
        assert!(!old.running);
        assert_eq!(old.end_reason, Some(EndReason::Superseded));
    }

    #[test]
    fn history_is_never_deleted() {
        let db = DaemonDb::in_memory().unwrap();
        for pid in [10, 11, 12] {
            db.insert(spawned("MAGE-TAB", pid)).unwrap();
            db.mark_stopped_by_pid(pid, EndReason::Exited).unwrap();
        }
        assert_eq!(db.list_all().unwrap().len(), 3);
    }

    #[test]
    fn two_handles_share_one_registry_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemons.db");
        let supervisor = DaemonDb::open(&path).unwrap();
        let killer = DaemonDb::open(&path).unwrap();

        supervisor.insert(spawned("MAGE-TAB", 77)).unwrap();
        let running = killer.list_running(None).unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].user, "curator");

        killer.mark_stopped(running[0].id, EndReason::Terminated).unwrap();
        assert!(supervisor.mark_stopped_by_pid(77, EndReason::Exited).unwrap().is_none());
    }

    #[test]
    fn current_user_is_not_empty() {
        assert!(!current_user().is_empty());
    }
}
