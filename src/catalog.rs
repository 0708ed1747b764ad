//! Task Catalog: repositories, task definitions and the system state view.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;
use tracing::info;

use crate::directory::liveness_cutoff;
use crate::error::{PoolError, Result};
use crate::model::{
    RepoCreateRequest, Repository, SystemState, Task, TaskArtifact, TaskCreateRequest, TaskLease,
    TaskStatus, new_id, normalize_skills,
};
use crate::store::LibSqlBackend;

#[derive(Clone)]
pub struct TaskCatalog {
    store: Arc<LibSqlBackend>,
    liveness_threshold: Duration,
}

impl TaskCatalog {
    pub fn new(store: Arc<LibSqlBackend>, liveness_threshold: Duration) -> Self {
        Self {
            store,
            liveness_threshold,
        }
    }

    /// Create a repository, or replace the settings of an existing one with the same key.
    pub async fn create_repository(&self, req: RepoCreateRequest) -> Result<Repository> {
        let key = req.repo.trim();
        if key.is_empty() {
            return Err(PoolError::validation("Repository key must not be empty"));
        }
        if !(0..=100).contains(&req.max_open_prs) {
            return Err(PoolError::validation(format!(
                "max_open_prs must be between 0 and 100, got {}",
                req.max_open_prs
            )));
        }

        let tx = self.store.begin().await?;
        let now = Utc::now();
        let result = async {
            let repo = tx
                .upsert_repository(key, req.max_open_prs, req.area_locks_enabled, now)
                .await?;
            tx.append_audit(
                "repo_upserted",
                "admin",
                &repo.id,
                json!({
                    "repo": repo.key,
                    "max_open_prs": repo.max_open_prs,
                    "area_locks_enabled": repo.area_locks_enabled,
                }),
                now,
            )
            .await?;
            Ok::<_, PoolError>(repo)
        }
        .await;
        let repo = tx.finish(result).await?;

        info!(repo = %repo.key, max_open_prs = repo.max_open_prs, "Repository upserted");
        Ok(repo)
    }

    /// Create a `ready` task in an existing repository.
    pub async fn create_task(&self, req: TaskCreateRequest) -> Result<Task> {
        validate_task(&req)?;

        let tx = self.store.begin().await?;
        let now = Utc::now();
        let result = async {
            let repo_key = req.repo.trim();
            let repo = tx.repository_by_key(repo_key).await?.ok_or_else(|| {
                PoolError::not_found(format!("Repository '{repo_key}' not found"))
                    .with_suggestion("Create the repository before adding tasks to it")
            })?;

            let task = Task {
                id: new_id("t"),
                repo_id: repo.id.clone(),
                title: req.title.trim().to_string(),
                description: req.description.clone().filter(|d| !d.trim().is_empty()),
                estimate_points: req.estimate_points,
                priority: req.priority,
                required_skills: normalize_skills(req.required_skills.clone()),
                area: req
                    .area
                    .as_deref()
                    .map(str::trim)
                    .filter(|a| !a.is_empty())
                    .map(str::to_string),
                tier: req.tier,
                status: TaskStatus::Ready,
                created_at: now,
                updated_at: now,
            };
            tx.insert_task(&task).await?;
            tx.append_audit(
                "task_created",
                "admin",
                &task.id,
                json!({
                    "repo": repo.key,
                    "title": task.title,
                    "priority": task.priority,
                    "required_skills": task.required_skills,
                }),
                now,
            )
            .await?;
            Ok::<_, PoolError>(task)
        }
        .await;
        let task = tx.finish(result).await?;

        info!(task_id = %task.id, repo = %req.repo.trim(), priority = task.priority, "Task created");
        Ok(task)
    }

    /// Counts of online workers, queued and in-flight tasks, plus per-repository PR load.
    pub async fn system_state(&self) -> Result<SystemState> {
        let tx = self.store.begin().await?;
        let cutoff = liveness_cutoff(Utc::now(), self.liveness_threshold);
        let result = async {
            Ok::<_, PoolError>(SystemState {
                workers_online: tx.count_online_workers(cutoff).await?,
                tasks_queued: tx.count_tasks_in(&[TaskStatus::Ready]).await?,
                tasks_in_progress: tx
                    .count_tasks_in(&[TaskStatus::Leased, TaskStatus::InProgress])
                    .await?,
                repositories: tx.repo_states().await?,
            })
        }
        .await;
        tx.finish(result).await
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Task> {
        let tx = self.store.begin().await?;
        let result = async {
            tx.get_task(task_id)
                .await?
                .ok_or_else(|| PoolError::not_found(format!("Task '{task_id}' not found")))
        }
        .await;
        tx.finish(result).await
    }

    pub async fn get_artifact(&self, task_id: &str) -> Result<Option<TaskArtifact>> {
        let tx = self.store.begin().await?;
        let result = tx.get_artifact(task_id).await.map_err(PoolError::from);
        tx.finish(result).await
    }

    pub async fn active_lease_for_task(&self, task_id: &str) -> Result<Option<TaskLease>> {
        let tx = self.store.begin().await?;
        let result = tx
            .active_lease_for_task(task_id, Utc::now())
            .await
            .map_err(PoolError::from);
        tx.finish(result).await
    }
}

fn validate_task(req: &TaskCreateRequest) -> Result<()> {
    if req.repo.trim().is_empty() {
        return Err(PoolError::validation("Repository key must not be empty"));
    }
    if req.title.trim().is_empty() {
        return Err(PoolError::validation("Task title must not be empty"));
    }
    if !(1..=100).contains(&req.estimate_points) {
        return Err(PoolError::validation(format!(
            "estimate_points must be between 1 and 100, got {}",
            req.estimate_points
        )));
    }
    if !(0..=1000).contains(&req.priority) {
        return Err(PoolError::validation(format!(
            "priority must be between 0 and 1000, got {}",
            req.priority
        )));
    }
    if !(0..=3).contains(&req.tier) {
        return Err(PoolError::validation(format!(
            "tier must be between 0 and 3, got {}",
            req.tier
        )));
    }
    Ok(())
}
