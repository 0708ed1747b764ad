//! libSQL backend: the single transactional store behind every operation.
//!
//! One connection is shared by the whole process. `begin()` serialises access
//! to it and opens a `BEGIN IMMEDIATE` transaction, so each logical operation
//! reads and writes a consistent snapshot and no two operations interleave.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use libsql::params::IntoParams;
use libsql::{Connection, Database as LibSqlDatabase, Row, params};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::error::{DatabaseError, PoolError};
use crate::model::{
    ArtifactInput, RepoState, Repository, Task, TaskArtifact, TaskLease, TaskStatus, Worker,
    WorkerStatus, new_id,
};
use crate::store::migrations;
use crate::store::rows::{
    ARTIFACT_COLUMNS, LEASE_COLUMN_COUNT, LEASE_COLUMNS, REPO_COLUMNS, TASK_COLUMN_COUNT,
    TASK_COLUMNS, WORKER_COLUMNS, encode_list, fmt_ts, nullable, row_to_artifact, row_to_lease_at,
    row_to_repository, row_to_task, row_to_worker,
};

/// Liveness: a heartbeat at or after the cutoff bound to `?1`.
const FRESH_HEARTBEAT: &str = "(w.last_heartbeat IS NOT NULL AND w.last_heartbeat >= ?1)";

struct ConnState {
    conn: Connection,
    /// Set while a transaction is open; still set at `begin()` means its owner was dropped.
    in_transaction: bool,
}

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    state: Mutex<ConnState>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        conn.execute("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to enable foreign keys: {e}")))?;
        migrations::run_migrations(&conn).await?;

        Ok(Self {
            db: Arc::new(db),
            state: Mutex::new(ConnState {
                conn,
                in_transaction: false,
            }),
        })
    }

    /// Open a transaction scoped to one logical operation.
    pub async fn begin(&self) -> Result<StoreTx<'_>, DatabaseError> {
        let mut guard = self.state.lock().await;
        if guard.in_transaction {
            warn!("Rolling back transaction left open by a cancelled operation");
            guard
                .conn
                .execute("ROLLBACK", ())
                .await
                .map_err(|e| DatabaseError::Query(format!("rollback abandoned: {e}")))?;
            guard.in_transaction = false;
        }
        guard
            .conn
            .execute("BEGIN IMMEDIATE", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("begin: {e}")))?;
        guard.in_transaction = true;
        Ok(StoreTx { guard })
    }
}

/// An open transaction holding exclusive use of the connection.
pub struct StoreTx<'a> {
    guard: MutexGuard<'a, ConnState>,
}

/// A ready task joined with the repository settings needed to rank it.
#[derive(Debug, Clone)]
pub struct CandidateTask {
    pub task: Task,
    pub repo_key: String,
    pub max_open_prs: i64,
    pub area_locks_enabled: bool,
}

/// An active lease held by a worker, with the task fields eligibility depends on.
#[derive(Debug, Clone)]
pub struct HeldLease {
    pub lease: TaskLease,
    pub repo_id: String,
    pub area: Option<String>,
    pub estimate_points: i64,
}

/// A lease joined with its task (and worker) for reconciliation.
#[derive(Debug, Clone)]
pub struct LeaseRecord {
    pub lease: TaskLease,
    pub task_title: String,
    pub task_status: TaskStatus,
    pub worker_name: Option<String>,
}

impl<'a> StoreTx<'a> {
    pub(crate) fn conn(&self) -> &Connection {
        &self.guard.conn
    }

    pub async fn commit(mut self) -> Result<(), DatabaseError> {
        self.guard
            .conn
            .execute("COMMIT", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("commit: {e}")))?;
        self.guard.in_transaction = false;
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<(), DatabaseError> {
        self.guard
            .conn
            .execute("ROLLBACK", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("rollback: {e}")))?;
        self.guard.in_transaction = false;
        Ok(())
    }

    /// Commit on `Ok`, roll back on `Err`, and hand the result back.
    pub async fn finish<T>(self, result: Result<T, PoolError>) -> Result<T, PoolError> {
        match result {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback().await {
                    warn!(error = %rollback_err, "Rollback failed");
                }
                Err(err)
            }
        }
    }

    // ── Query helpers ───────────────────────────────────────────────

    pub(crate) async fn exec(
        &self,
        context: &str,
        sql: &str,
        params: impl IntoParams,
    ) -> Result<u64, DatabaseError> {
        self.conn()
            .execute(sql, params)
            .await
            .map_err(|e| DatabaseError::from_libsql(context, e))
    }

    pub(crate) async fn query_all<T>(
        &self,
        context: &str,
        sql: &str,
        params: impl IntoParams,
        map: impl Fn(&Row) -> Result<T, DatabaseError>,
    ) -> Result<Vec<T>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::from_libsql(context, e))?;
        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{context} row: {e}")))?
        {
            out.push(map(&row)?);
        }
        Ok(out)
    }

    pub(crate) async fn query_opt<T>(
        &self,
        context: &str,
        sql: &str,
        params: impl IntoParams,
        map: impl Fn(&Row) -> Result<T, DatabaseError>,
    ) -> Result<Option<T>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::from_libsql(context, e))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(Some(map(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("{context} row: {e}"))),
        }
    }

    async fn count(
        &self,
        context: &str,
        sql: &str,
        params: impl IntoParams,
    ) -> Result<i64, DatabaseError> {
        let count = self
            .query_opt(context, sql, params, |row| {
                row.get::<i64>(0)
                    .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))
            })
            .await?;
        Ok(count.unwrap_or(0))
    }

    // ── Workers ─────────────────────────────────────────────────────

    pub async fn insert_worker(&self, worker: &Worker) -> Result<(), DatabaseError> {
        self.exec(
            "insert_worker",
            "INSERT INTO workers (id, name, github_handle, skills, capacity_points, max_concurrent_tasks, status, token_hash, last_heartbeat, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                worker.id.as_str(),
                worker.name.as_str(),
                nullable(worker.github_handle.as_deref()),
                encode_list(&worker.skills)?,
                worker.capacity_points,
                worker.max_concurrent_tasks,
                worker.status.as_str(),
                worker.credential_hash.as_str(),
                nullable(worker.last_heartbeat.map(fmt_ts).as_deref()),
                fmt_ts(worker.created_at),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn get_worker(&self, id: &str) -> Result<Option<Worker>, DatabaseError> {
        self.query_opt(
            "get_worker",
            &format!("SELECT {WORKER_COLUMNS} FROM workers w WHERE w.id = ?1"),
            params![id],
            row_to_worker,
        )
        .await
    }

    pub async fn worker_by_credential_hash(
        &self,
        hash: &str,
    ) -> Result<Option<Worker>, DatabaseError> {
        self.query_opt(
            "worker_by_credential_hash",
            &format!("SELECT {WORKER_COLUMNS} FROM workers w WHERE w.token_hash = ?1"),
            params![hash],
            row_to_worker,
        )
        .await
    }

    pub async fn update_worker_heartbeat(
        &self,
        id: &str,
        status: WorkerStatus,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.exec(
            "update_worker_heartbeat",
            "UPDATE workers SET status = ?1, last_heartbeat = ?2 WHERE id = ?3",
            params![status.as_str(), fmt_ts(at), id],
        )
        .await?;
        Ok(())
    }

    pub async fn set_worker_status(
        &self,
        id: &str,
        status: WorkerStatus,
    ) -> Result<(), DatabaseError> {
        self.exec(
            "set_worker_status",
            "UPDATE workers SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )
        .await?;
        Ok(())
    }

    /// Workers that are not paused and have no heartbeat at or after `cutoff`.
    pub async fn stale_workers(&self, cutoff: DateTime<Utc>) -> Result<Vec<Worker>, DatabaseError> {
        self.query_all(
            "stale_workers",
            &format!(
                "SELECT {WORKER_COLUMNS} FROM workers w
                 WHERE NOT {FRESH_HEARTBEAT} AND w.status != 'paused'
                 ORDER BY w.created_at ASC"
            ),
            params![fmt_ts(cutoff)],
            row_to_worker,
        )
        .await
    }

    /// Exact complement of [`Self::stale_workers`] among unpaused workers.
    pub async fn count_online_workers(&self, cutoff: DateTime<Utc>) -> Result<i64, DatabaseError> {
        self.count(
            "count_online_workers",
            &format!(
                "SELECT COUNT(*) FROM workers w
                 WHERE {FRESH_HEARTBEAT} AND w.status != 'paused'"
            ),
            params![fmt_ts(cutoff)],
        )
        .await
    }

    // ── Repositories ────────────────────────────────────────────────

    /// Insert a repository or replace the settings of the existing one with the same key.
    pub async fn upsert_repository(
        &self,
        key: &str,
        max_open_prs: i64,
        area_locks_enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<Repository, DatabaseError> {
        self.exec(
            "upsert_repository",
            "INSERT INTO repositories (id, repo, max_open_prs, area_locks_enabled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(repo) DO UPDATE SET
               max_open_prs = excluded.max_open_prs,
               area_locks_enabled = excluded.area_locks_enabled",
            params![
                new_id("r"),
                key,
                max_open_prs,
                area_locks_enabled as i64,
                fmt_ts(now),
            ],
        )
        .await?;

        self.repository_by_key(key).await?.ok_or_else(|| {
            DatabaseError::Query(format!("upsert_repository: '{key}' missing after write"))
        })
    }

    pub async fn repository_by_key(&self, key: &str) -> Result<Option<Repository>, DatabaseError> {
        self.query_opt(
            "repository_by_key",
            &format!("SELECT {REPO_COLUMNS} FROM repositories r WHERE r.repo = ?1"),
            params![key],
            row_to_repository,
        )
        .await
    }

    /// Per-repository capacity view, ordered by key.
    pub async fn repo_states(&self) -> Result<Vec<RepoState>, DatabaseError> {
        self.query_all(
            "repo_states",
            "SELECT r.repo, r.max_open_prs, COUNT(t.id)
             FROM repositories r
             LEFT JOIN tasks t ON r.id = t.repo_id AND t.status = 'pr_opened'
             GROUP BY r.id, r.repo, r.max_open_prs
             ORDER BY r.repo",
            (),
            |row| {
                Ok(RepoState {
                    repo: row
                        .get::<String>(0)
                        .map_err(|e| DatabaseError::Query(format!("repo_states.repo: {e}")))?,
                    max_open_prs: row.get::<i64>(1).unwrap_or(0),
                    current_open_prs: row.get::<i64>(2).unwrap_or(0),
                })
            },
        )
        .await
    }

    pub async fn count_open_prs(&self, repo_id: &str) -> Result<i64, DatabaseError> {
        self.count(
            "count_open_prs",
            "SELECT COUNT(*) FROM tasks WHERE repo_id = ?1 AND status = 'pr_opened'",
            params![repo_id],
        )
        .await
    }

    // ── Tasks ───────────────────────────────────────────────────────

    pub async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError> {
        self.exec(
            "insert_task",
            "INSERT INTO tasks (id, repo_id, title, description, estimate_points, priority, required_skills, area, tier, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                task.id.as_str(),
                task.repo_id.as_str(),
                task.title.as_str(),
                nullable(task.description.as_deref()),
                task.estimate_points,
                task.priority,
                encode_list(&task.required_skills)?,
                nullable(task.area.as_deref()),
                task.tier,
                task.status.as_str(),
                fmt_ts(task.created_at),
                fmt_ts(task.updated_at),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<Task>, DatabaseError> {
        self.query_opt(
            "get_task",
            &format!("SELECT {TASK_COLUMNS} FROM tasks t WHERE t.id = ?1"),
            params![id],
            row_to_task,
        )
        .await
    }

    /// One page of ready tasks with no active lease, best first: priority
    /// descending, then oldest, then insertion order.
    pub async fn candidate_tasks(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<CandidateTask>, DatabaseError> {
        let offset = TASK_COLUMN_COUNT;
        self.query_all(
            "candidate_tasks",
            &format!(
                "SELECT {TASK_COLUMNS}, r.repo, r.max_open_prs, r.area_locks_enabled
                 FROM tasks t
                 JOIN repositories r ON r.id = t.repo_id
                 WHERE t.status = 'ready'
                   AND NOT EXISTS (
                     SELECT 1 FROM task_leases l
                     WHERE l.task_id = t.id AND l.lease_expires_at > ?1
                   )
                 ORDER BY t.priority DESC, t.created_at ASC, t.rowid ASC
                 LIMIT ?2 OFFSET ?3"
            ),
            params![fmt_ts(now), limit, offset],
            |row| {
                Ok(CandidateTask {
                    task: row_to_task(row)?,
                    repo_key: row
                        .get::<String>(offset)
                        .map_err(|e| DatabaseError::Query(format!("candidate.repo: {e}")))?,
                    max_open_prs: row.get::<i64>(offset + 1).unwrap_or(0),
                    area_locks_enabled: row.get::<i64>(offset + 2).unwrap_or(0) != 0,
                })
            },
        )
        .await
    }

    /// Flip a task from `ready` to `leased`; false if someone else already moved it.
    pub async fn claim_task(&self, id: &str, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let changed = self
            .exec(
                "claim_task",
                "UPDATE tasks SET status = 'leased', updated_at = ?1 WHERE id = ?2 AND status = 'ready'",
                params![fmt_ts(now), id],
            )
            .await?;
        Ok(changed == 1)
    }

    pub async fn set_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.exec(
            "set_task_status",
            "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), fmt_ts(now), id],
        )
        .await?;
        Ok(())
    }

    /// Put a task back to `ready` only if it is currently in one of `from`.
    pub async fn requeue_task_if(
        &self,
        id: &str,
        from: &[TaskStatus],
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let allowed = from
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let changed = self
            .exec(
                "requeue_task_if",
                &format!(
                    "UPDATE tasks SET status = 'ready', updated_at = ?1 WHERE id = ?2 AND status IN ({allowed})"
                ),
                params![fmt_ts(now), id],
            )
            .await?;
        Ok(changed == 1)
    }

    pub async fn count_tasks_in(&self, statuses: &[TaskStatus]) -> Result<i64, DatabaseError> {
        let list = statuses
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        self.count(
            "count_tasks_in",
            &format!("SELECT COUNT(*) FROM tasks WHERE status IN ({list})"),
            (),
        )
        .await
    }

    // ── Leases ──────────────────────────────────────────────────────

    pub async fn insert_lease(&self, lease: &TaskLease) -> Result<(), DatabaseError> {
        self.exec(
            "insert_lease",
            "INSERT INTO task_leases (id, task_id, worker_id, lease_expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                lease.id.as_str(),
                lease.task_id.as_str(),
                lease.worker_id.as_str(),
                fmt_ts(lease.expires_at),
                fmt_ts(lease.created_at),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn delete_lease(&self, id: &str) -> Result<u64, DatabaseError> {
        self.exec(
            "delete_lease",
            "DELETE FROM task_leases WHERE id = ?1",
            params![id],
        )
        .await
    }

    /// Drop lapsed lease rows for a task the reconciler has not reached yet.
    pub async fn delete_expired_leases_for_task(
        &self,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        self.exec(
            "delete_expired_leases_for_task",
            "DELETE FROM task_leases WHERE task_id = ?1 AND lease_expires_at <= ?2",
            params![task_id, fmt_ts(now)],
        )
        .await
    }

    pub async fn active_lease_for_task(
        &self,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskLease>, DatabaseError> {
        self.query_opt(
            "active_lease_for_task",
            &format!(
                "SELECT {LEASE_COLUMNS} FROM task_leases l
                 WHERE l.task_id = ?1 AND l.lease_expires_at > ?2"
            ),
            params![task_id, fmt_ts(now)],
            |row| row_to_lease_at(row, 0),
        )
        .await
    }

    pub async fn count_active_leases_for_task(
        &self,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, DatabaseError> {
        self.count(
            "count_active_leases_for_task",
            "SELECT COUNT(*) FROM task_leases WHERE task_id = ?1 AND lease_expires_at > ?2",
            params![task_id, fmt_ts(now)],
        )
        .await
    }

    pub async fn held_leases(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<HeldLease>, DatabaseError> {
        let offset = LEASE_COLUMN_COUNT;
        self.query_all(
            "held_leases",
            &format!(
                "SELECT {LEASE_COLUMNS}, t.repo_id, t.area, t.estimate_points
                 FROM task_leases l
                 JOIN tasks t ON t.id = l.task_id
                 WHERE l.worker_id = ?1 AND l.lease_expires_at > ?2
                 ORDER BY l.created_at ASC"
            ),
            params![worker_id, fmt_ts(now)],
            |row| {
                Ok(HeldLease {
                    lease: row_to_lease_at(row, 0)?,
                    repo_id: row
                        .get::<String>(offset)
                        .map_err(|e| DatabaseError::Query(format!("held.repo_id: {e}")))?,
                    area: row
                        .get::<String>(offset + 1)
                        .ok()
                        .filter(|a| !a.trim().is_empty()),
                    estimate_points: row.get::<i64>(offset + 2).unwrap_or(0),
                })
            },
        )
        .await
    }

    /// Leases whose expiry is at or before `now`.
    pub async fn expired_leases(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<LeaseRecord>, DatabaseError> {
        let offset = LEASE_COLUMN_COUNT;
        self.query_all(
            "expired_leases",
            &format!(
                "SELECT {LEASE_COLUMNS}, t.title, t.status
                 FROM task_leases l
                 JOIN tasks t ON t.id = l.task_id
                 WHERE l.lease_expires_at <= ?1
                 ORDER BY l.lease_expires_at ASC"
            ),
            params![fmt_ts(now)],
            |row| lease_record(row, offset, false),
        )
        .await
    }

    /// Leases held by paused workers on tasks that are still `leased` or `in_progress`.
    pub async fn orphaned_leases(&self) -> Result<Vec<LeaseRecord>, DatabaseError> {
        let offset = LEASE_COLUMN_COUNT;
        self.query_all(
            "orphaned_leases",
            &format!(
                "SELECT {LEASE_COLUMNS}, t.title, t.status, w.name
                 FROM task_leases l
                 JOIN tasks t ON t.id = l.task_id
                 JOIN workers w ON w.id = l.worker_id
                 WHERE w.status = 'paused'
                   AND t.status IN ('leased', 'in_progress')
                 ORDER BY l.created_at ASC"
            ),
            (),
            |row| lease_record(row, offset, true),
        )
        .await
    }

    // ── Artifacts ───────────────────────────────────────────────────

    /// Record the artifact for a task, replacing any earlier report.
    pub async fn upsert_artifact(
        &self,
        task_id: &str,
        input: &ArtifactInput,
        extra: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<TaskArtifact, DatabaseError> {
        let extra_json =
            serde_json::to_string(extra).map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.exec(
            "upsert_artifact",
            "INSERT INTO task_artifacts (id, task_id, pr_url, commit_sha, patch_url, extra, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(task_id) DO UPDATE SET
               pr_url = excluded.pr_url,
               commit_sha = excluded.commit_sha,
               patch_url = excluded.patch_url,
               extra = excluded.extra,
               updated_at = excluded.updated_at",
            params![
                new_id("ta"),
                task_id,
                nullable(input.pr_url.as_deref()),
                nullable(input.commit_sha.as_deref()),
                nullable(input.patch_url.as_deref()),
                extra_json,
                fmt_ts(now),
            ],
        )
        .await?;

        self.get_artifact(task_id).await?.ok_or_else(|| {
            DatabaseError::Query(format!("upsert_artifact: artifact for {task_id} missing after write"))
        })
    }

    pub async fn get_artifact(&self, task_id: &str) -> Result<Option<TaskArtifact>, DatabaseError> {
        self.query_opt(
            "get_artifact",
            &format!("SELECT {ARTIFACT_COLUMNS} FROM task_artifacts WHERE task_id = ?1"),
            params![task_id],
            row_to_artifact,
        )
        .await
    }
}

fn lease_record(row: &Row, offset: i32, with_worker: bool) -> Result<LeaseRecord, DatabaseError> {
    let status = row
        .get::<String>(offset + 1)
        .map_err(|e| DatabaseError::Query(format!("lease_record.status: {e}")))?
        .parse::<TaskStatus>()
        .map_err(DatabaseError::Serialization)?;
    Ok(LeaseRecord {
        lease: row_to_lease_at(row, 0)?,
        task_title: row.get::<String>(offset).unwrap_or_default(),
        task_status: status,
        worker_name: if with_worker {
            row.get::<String>(offset + 2).ok()
        } else {
            None
        },
    })
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn make_worker(hash: &str) -> Worker {
        Worker {
            id: new_id("w"),
            name: "alice".into(),
            github_handle: Some("alice-gh".into()),
            skills: vec!["rust".into()],
            capacity_points: 5,
            max_concurrent_tasks: 2,
            status: WorkerStatus::Idle,
            credential_hash: hash.into(),
            last_heartbeat: None,
            created_at: Utc::now(),
        }
    }

    fn make_task(repo_id: &str, priority: i64, created_at: DateTime<Utc>) -> Task {
        Task {
            id: new_id("t"),
            repo_id: repo_id.into(),
            title: format!("task p{priority}"),
            description: None,
            estimate_points: 1,
            priority,
            required_skills: vec![],
            area: None,
            tier: 0,
            status: TaskStatus::Ready,
            created_at,
            updated_at: created_at,
        }
    }

    #[tokio::test]
    async fn worker_insert_and_lookup_by_hash() {
        let db = test_db().await;
        let worker = make_worker("hash-1");

        let tx = db.begin().await.unwrap();
        tx.insert_worker(&worker).await.unwrap();
        tx.commit().await.unwrap();

        let tx = db.begin().await.unwrap();
        let fetched = tx.worker_by_credential_hash("hash-1").await.unwrap().unwrap();
        assert_eq!(fetched.id, worker.id);
        assert_eq!(fetched.skills, vec!["rust"]);
        assert_eq!(fetched.github_handle.as_deref(), Some("alice-gh"));
        assert!(fetched.last_heartbeat.is_none());
        assert!(tx.worker_by_credential_hash("nope").await.unwrap().is_none());
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let db = test_db().await;
        let worker = make_worker("hash-2");

        let tx = db.begin().await.unwrap();
        tx.insert_worker(&worker).await.unwrap();
        tx.rollback().await.unwrap();

        let tx = db.begin().await.unwrap();
        assert!(tx.get_worker(&worker.id).await.unwrap().is_none());
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn dropped_transaction_is_rolled_back_by_next_begin() {
        let db = test_db().await;
        let worker = make_worker("hash-3");

        {
            let tx = db.begin().await.unwrap();
            tx.insert_worker(&worker).await.unwrap();
        }

        let tx = db.begin().await.unwrap();
        assert!(tx.get_worker(&worker.id).await.unwrap().is_none());
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn finish_commits_ok_and_rolls_back_err() {
        let db = test_db().await;
        let kept = make_worker("keep");
        let dropped = make_worker("drop");

        let tx = db.begin().await.unwrap();
        tx.insert_worker(&kept).await.unwrap();
        tx.finish(Ok(())).await.unwrap();

        let tx = db.begin().await.unwrap();
        tx.insert_worker(&dropped).await.unwrap();
        let result: Result<(), PoolError> = tx.finish(Err(PoolError::conflict("nope"))).await;
        assert!(result.is_err());

        let tx = db.begin().await.unwrap();
        assert!(tx.get_worker(&kept.id).await.unwrap().is_some());
        assert!(tx.get_worker(&dropped.id).await.unwrap().is_none());
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn repository_upsert_keeps_id() {
        let db = test_db().await;
        let now = Utc::now();

        let tx = db.begin().await.unwrap();
        let first = tx.upsert_repository("demo", 3, true, now).await.unwrap();
        let second = tx.upsert_repository("demo", 7, false, now).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.max_open_prs, 7);
        assert!(!second.area_locks_enabled);
    }

    #[tokio::test]
    async fn candidates_ordered_by_priority_then_age() {
        let db = test_db().await;
        let t0 = Utc::now() - Duration::minutes(10);

        let tx = db.begin().await.unwrap();
        let repo = tx.upsert_repository("demo", 3, true, t0).await.unwrap();
        let a = make_task(&repo.id, 10, t0);
        let b = make_task(&repo.id, 5, t0 + Duration::seconds(1));
        let c = make_task(&repo.id, 10, t0 + Duration::seconds(2));
        for task in [&a, &b, &c] {
            tx.insert_task(task).await.unwrap();
        }

        let ids: Vec<String> = tx
            .candidate_tasks(Utc::now(), 10, 0)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.task.id)
            .collect();
        assert_eq!(ids, vec![a.id.clone(), c.id.clone(), b.id.clone()]);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn candidate_ties_follow_insertion_order_across_pages() {
        let db = test_db().await;
        let t0 = Utc::now() - Duration::minutes(10);

        let tx = db.begin().await.unwrap();
        let repo = tx.upsert_repository("demo", 3, true, t0).await.unwrap();
        let mut inserted = Vec::new();
        for _ in 0..5 {
            let task = make_task(&repo.id, 1, t0);
            tx.insert_task(&task).await.unwrap();
            inserted.push(task.id);
        }

        let mut paged = Vec::new();
        for offset in [0, 2, 4] {
            let page = tx.candidate_tasks(Utc::now(), 2, offset).await.unwrap();
            assert!(page.len() <= 2);
            paged.extend(page.into_iter().map(|c| c.task.id));
        }
        assert_eq!(paged, inserted);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn claim_is_conditional_on_ready() {
        let db = test_db().await;
        let now = Utc::now();

        let tx = db.begin().await.unwrap();
        let repo = tx.upsert_repository("demo", 3, true, now).await.unwrap();
        let task = make_task(&repo.id, 1, now);
        tx.insert_task(&task).await.unwrap();

        assert!(tx.claim_task(&task.id, now).await.unwrap());
        assert!(!tx.claim_task(&task.id, now).await.unwrap());
        let stored = tx.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Leased);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn artifact_upsert_replaces_previous_report() {
        let db = test_db().await;
        let now = Utc::now();

        let tx = db.begin().await.unwrap();
        let repo = tx.upsert_repository("demo", 3, true, now).await.unwrap();
        let task = make_task(&repo.id, 1, now);
        tx.insert_task(&task).await.unwrap();

        let first = ArtifactInput {
            pr_url: Some("https://example.com/pr/1".into()),
            ..Default::default()
        };
        tx.upsert_artifact(&task.id, &first, &serde_json::json!({}), now)
            .await
            .unwrap();
        let second = ArtifactInput {
            commit_sha: Some("abc123".into()),
            ..Default::default()
        };
        let stored = tx
            .upsert_artifact(&task.id, &second, &serde_json::json!({"message": "done"}), now)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(stored.pr_url, None);
        assert_eq!(stored.commit_sha.as_deref(), Some("abc123"));
        assert_eq!(stored.extra["message"], "done");
    }

    #[tokio::test]
    async fn on_disk_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("pool.db");
        let worker = make_worker("disk");

        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            let tx = db.begin().await.unwrap();
            tx.insert_worker(&worker).await.unwrap();
            tx.commit().await.unwrap();
        }

        let db = LibSqlBackend::new_local(&path).await.unwrap();
        let tx = db.begin().await.unwrap();
        assert!(tx.get_worker(&worker.id).await.unwrap().is_some());
        tx.commit().await.unwrap();
    }
}
