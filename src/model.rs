//! Domain types: workers, repositories, tasks, leases, artifacts, audit events,
//! plus the request/response views of the logical operations.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Mint a prefixed identifier (`w_…`, `t_…`, `l_…`).
pub fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

/// Trim skills, drop blanks and case-insensitive duplicates, keeping first spellings.
pub fn normalize_skills(skills: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    skills
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && seen.insert(s.to_lowercase()))
        .collect()
}

// ── Statuses ────────────────────────────────────────────────────────

/// Lifecycle status of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Working,
    /// Set by the reconciler on heartbeat timeout, or by a worker reporting `offline`.
    Paused,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Working => "working",
            WorkerStatus::Paused => "paused",
        }
    }
}

impl FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(WorkerStatus::Idle),
            "working" => Ok(WorkerStatus::Working),
            "paused" => Ok(WorkerStatus::Paused),
            other => Err(format!("unknown worker status '{other}'")),
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status a worker may report in a heartbeat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatStatus {
    #[default]
    Idle,
    Working,
    Offline,
}

impl From<HeartbeatStatus> for WorkerStatus {
    fn from(status: HeartbeatStatus) -> Self {
        match status {
            HeartbeatStatus::Idle => WorkerStatus::Idle,
            HeartbeatStatus::Working => WorkerStatus::Working,
            HeartbeatStatus::Offline => WorkerStatus::Paused,
        }
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Ready,
    Leased,
    InProgress,
    Blocked,
    PrOpened,
    Merged,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Ready => "ready",
            TaskStatus::Leased => "leased",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::PrOpened => "pr_opened",
            TaskStatus::Merged => "merged",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Whether a leased worker may move its task to this status.
    ///
    /// `ready` and `leased` are owned by the lease manager and reconciler.
    pub fn is_worker_reportable(&self) -> bool {
        !matches!(self, TaskStatus::Ready | TaskStatus::Leased)
    }

    /// Whether reporting this status may end the task's lease.
    ///
    /// `in_progress` must keep a live lease, so it never qualifies.
    pub fn can_release_lease(&self) -> bool {
        self.is_worker_reportable() && *self != TaskStatus::InProgress
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(TaskStatus::Ready),
            "leased" => Ok(TaskStatus::Leased),
            "in_progress" => Ok(TaskStatus::InProgress),
            "blocked" => Ok(TaskStatus::Blocked),
            "pr_opened" => Ok(TaskStatus::PrOpened),
            "merged" => Ok(TaskStatus::Merged),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Entities ────────────────────────────────────────────────────────

/// A registered remote worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub name: String,
    pub github_handle: Option<String>,
    pub skills: Vec<String>,
    pub capacity_points: i64,
    pub max_concurrent_tasks: i64,
    pub status: WorkerStatus,
    #[serde(skip_serializing)]
    pub credential_hash: String,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A capacity-limited work destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub id: String,
    pub key: String,
    pub max_open_prs: i64,
    pub area_locks_enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// A unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub repo_id: String,
    pub title: String,
    pub description: Option<String>,
    pub estimate_points: i64,
    pub priority: i64,
    pub required_skills: Vec<String>,
    pub area: Option<String>,
    pub tier: i64,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A time-bounded exclusive claim by one worker on one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLease {
    pub id: String,
    pub task_id: String,
    pub worker_id: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Completion artifact reported by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskArtifact {
    pub id: String,
    pub task_id: String,
    pub pr_url: Option<String>,
    pub commit_sha: Option<String>,
    pub patch_url: Option<String>,
    pub extra: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// Append-only audit trail entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub event_type: String,
    pub actor: String,
    pub target: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ── Operation views ─────────────────────────────────────────────────

fn default_capacity_points() -> i64 {
    5
}

fn default_max_concurrent_tasks() -> i64 {
    2
}

fn default_max_open_prs() -> i64 {
    3
}

fn default_true() -> bool {
    true
}

fn default_estimate_points() -> i64 {
    1
}

fn default_priority() -> i64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterWorkerRequest {
    pub name: String,
    #[serde(default)]
    pub github_handle: Option<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default = "default_capacity_points")]
    pub capacity_points: i64,
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: i64,
}

impl RegisterWorkerRequest {
    pub fn new(name: impl Into<String>, skills: &[&str]) -> Self {
        Self {
            name: name.into(),
            github_handle: None,
            skills: skills.iter().map(|s| s.to_string()).collect(),
            capacity_points: default_capacity_points(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
        }
    }

    pub fn with_limits(mut self, capacity_points: i64, max_concurrent_tasks: i64) -> Self {
        self.capacity_points = capacity_points;
        self.max_concurrent_tasks = max_concurrent_tasks;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub status: HeartbeatStatus,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub ok: bool,
    pub server_time: DateTime<Utc>,
}

/// A lease as handed to the worker that holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseView {
    pub lease_id: String,
    pub task_id: String,
    pub repo: String,
    pub title: String,
    pub description: Option<String>,
    pub estimate_points: i64,
    pub priority: i64,
    pub area: Option<String>,
    pub tier: i64,
    pub required_skills: Vec<String>,
    pub lease_expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkResponse {
    pub worker_id: String,
    pub leases: Vec<LeaseView>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactInput {
    #[serde(default)]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub commit_sha: Option<String>,
    #[serde(default)]
    pub patch_url: Option<String>,
    #[serde(default)]
    pub extra: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusUpdateRequest {
    pub status: TaskStatus,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub artifact: Option<ArtifactInput>,
}

impl TaskStatusUpdateRequest {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status,
            message: None,
            artifact: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusUpdateResponse {
    pub ok: bool,
    pub task_id: String,
    pub status: TaskStatus,
    /// True when the reported status was terminal and the lease was dropped.
    pub lease_released: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoCreateRequest {
    pub repo: String,
    #[serde(default = "default_max_open_prs")]
    pub max_open_prs: i64,
    #[serde(default = "default_true")]
    pub area_locks_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCreateRequest {
    pub repo: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_estimate_points")]
    pub estimate_points: i64,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default)]
    pub required_skills: Vec<String>,
    #[serde(default)]
    pub area: Option<String>,
    #[serde(default)]
    pub tier: i64,
}

impl TaskCreateRequest {
    pub fn new(repo: impl Into<String>, title: impl Into<String>, required_skills: &[&str]) -> Self {
        Self {
            repo: repo.into(),
            title: title.into(),
            description: None,
            estimate_points: default_estimate_points(),
            priority: default_priority(),
            required_skills: required_skills.iter().map(|s| s.to_string()).collect(),
            area: None,
            tier: 0,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_area(mut self, area: impl Into<String>) -> Self {
        self.area = Some(area.into());
        self
    }

    pub fn with_estimate(mut self, estimate_points: i64) -> Self {
        self.estimate_points = estimate_points;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoState {
    pub repo: String,
    pub max_open_prs: i64,
    pub current_open_prs: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemState {
    pub workers_online: i64,
    pub tasks_queued: i64,
    pub tasks_in_progress: i64,
    pub repositories: Vec<RepoState>,
}
