//! Row mapping and value encoding shared by the store modules.

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::Row;

use crate::error::DatabaseError;
use crate::model::{
    AuditEvent, Repository, Task, TaskArtifact, TaskLease, TaskStatus, Worker, WorkerStatus,
};

pub(crate) const WORKER_COLUMNS: &str = "w.id, w.name, w.github_handle, w.skills, w.capacity_points, w.max_concurrent_tasks, w.status, w.token_hash, w.last_heartbeat, w.created_at";

pub(crate) const REPO_COLUMNS: &str =
    "r.id, r.repo, r.max_open_prs, r.area_locks_enabled, r.created_at";

pub(crate) const TASK_COLUMNS: &str = "t.id, t.repo_id, t.title, t.description, t.estimate_points, t.priority, t.required_skills, t.area, t.tier, t.status, t.created_at, t.updated_at";

/// Number of columns in [`TASK_COLUMNS`]; joined columns start at this index.
pub(crate) const TASK_COLUMN_COUNT: i32 = 12;

pub(crate) const LEASE_COLUMNS: &str =
    "l.id, l.task_id, l.worker_id, l.lease_expires_at, l.created_at";

/// Number of columns in [`LEASE_COLUMNS`].
pub(crate) const LEASE_COLUMN_COUNT: i32 = 5;

pub(crate) const ARTIFACT_COLUMNS: &str =
    "id, task_id, pr_url, commit_sha, patch_url, extra, updated_at";

pub(crate) const AUDIT_COLUMNS: &str = "id, event_type, actor, target, details, created_at";

/// Encode a timestamp as fixed-width RFC 3339 so string order is time order.
pub(crate) fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Nullable text parameter.
pub(crate) fn nullable(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

pub(crate) fn encode_list(items: &[String]) -> Result<String, DatabaseError> {
    serde_json::to_string(items).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn decode_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn text(row: &Row, idx: i32, what: &str) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Query(format!("{what}: {e}")))
}

fn int(row: &Row, idx: i32, what: &str) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Query(format!("{what}: {e}")))
}

/// NULL columns come back as a conversion error; treat them as absent.
fn opt_text(row: &Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

pub(crate) fn row_to_worker(row: &Row) -> Result<Worker, DatabaseError> {
    let status_str = text(row, 6, "worker.status")?;
    let status = status_str
        .parse::<WorkerStatus>()
        .map_err(DatabaseError::Serialization)?;
    Ok(Worker {
        id: text(row, 0, "worker.id")?,
        name: text(row, 1, "worker.name")?,
        github_handle: opt_text(row, 2),
        skills: decode_list(&text(row, 3, "worker.skills")?),
        capacity_points: int(row, 4, "worker.capacity_points")?,
        max_concurrent_tasks: int(row, 5, "worker.max_concurrent_tasks")?,
        status,
        credential_hash: text(row, 7, "worker.token_hash")?,
        last_heartbeat: opt_text(row, 8).map(|s| parse_datetime(&s)),
        created_at: parse_datetime(&text(row, 9, "worker.created_at")?),
    })
}

pub(crate) fn row_to_repository(row: &Row) -> Result<Repository, DatabaseError> {
    Ok(Repository {
        id: text(row, 0, "repo.id")?,
        key: text(row, 1, "repo.repo")?,
        max_open_prs: int(row, 2, "repo.max_open_prs")?,
        area_locks_enabled: int(row, 3, "repo.area_locks_enabled")? != 0,
        created_at: parse_datetime(&text(row, 4, "repo.created_at")?),
    })
}

pub(crate) fn row_to_task(row: &Row) -> Result<Task, DatabaseError> {
    let status = text(row, 9, "task.status")?
        .parse::<TaskStatus>()
        .map_err(DatabaseError::Serialization)?;
    Ok(Task {
        id: text(row, 0, "task.id")?,
        repo_id: text(row, 1, "task.repo_id")?,
        title: text(row, 2, "task.title")?,
        description: opt_text(row, 3),
        estimate_points: int(row, 4, "task.estimate_points")?,
        priority: int(row, 5, "task.priority")?,
        required_skills: decode_list(&text(row, 6, "task.required_skills")?),
        area: opt_text(row, 7).filter(|a| !a.trim().is_empty()),
        tier: int(row, 8, "task.tier")?,
        status,
        created_at: parse_datetime(&text(row, 10, "task.created_at")?),
        updated_at: parse_datetime(&text(row, 11, "task.updated_at")?),
    })
}

/// Map a lease whose columns start at `offset`.
pub(crate) fn row_to_lease_at(row: &Row, offset: i32) -> Result<TaskLease, DatabaseError> {
    Ok(TaskLease {
        id: text(row, offset, "lease.id")?,
        task_id: text(row, offset + 1, "lease.task_id")?,
        worker_id: text(row, offset + 2, "lease.worker_id")?,
        expires_at: parse_datetime(&text(row, offset + 3, "lease.lease_expires_at")?),
        created_at: parse_datetime(&text(row, offset + 4, "lease.created_at")?),
    })
}

pub(crate) fn row_to_artifact(row: &Row) -> Result<TaskArtifact, DatabaseError> {
    let extra = opt_text(row, 5)
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_else(|| serde_json::json!({}));
    Ok(TaskArtifact {
        id: text(row, 0, "artifact.id")?,
        task_id: text(row, 1, "artifact.task_id")?,
        pr_url: opt_text(row, 2),
        commit_sha: opt_text(row, 3),
        patch_url: opt_text(row, 4),
        extra,
        updated_at: parse_datetime(&text(row, 6, "artifact.updated_at")?),
    })
}

pub(crate) fn row_to_audit(row: &Row) -> Result<AuditEvent, DatabaseError> {
    let details = opt_text(row, 4)
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_else(|| serde_json::json!({}));
    Ok(AuditEvent {
        id: text(row, 0, "audit.id")?,
        event_type: text(row, 1, "audit.event_type")?,
        actor: text(row, 2, "audit.actor")?,
        target: text(row, 3, "audit.target")?,
        details,
        created_at: parse_datetime(&text(row, 5, "audit.created_at")?),
    })
}
