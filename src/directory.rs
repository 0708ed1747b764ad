//! Worker Directory: registration, credential lookup and heartbeats.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use tracing::{debug, info};

use crate::auth::{generate_credential, hash_credential};
use crate::error::{PoolError, Result};
use crate::model::{
    HeartbeatRequest, HeartbeatResponse, RegisterWorkerRequest, Worker, WorkerStatus, new_id,
    normalize_skills,
};
use crate::store::{LibSqlBackend, StoreTx};

/// Result of a registration. The credential is not recoverable afterwards.
#[derive(Debug)]
pub struct WorkerRegistration {
    pub worker_id: String,
    pub credential: SecretString,
}

/// Earliest heartbeat that still counts as online at `now`.
///
/// A worker is online iff it is not paused and its last heartbeat is at or
/// after this instant. The reconciler pauses exactly the unpaused workers
/// that fail this test, and the state view counts exactly those that pass.
pub(crate) fn liveness_cutoff(now: DateTime<Utc>, threshold: Duration) -> DateTime<Utc> {
    now - threshold
}

/// Registers workers and records their heartbeats.
#[derive(Clone)]
pub struct WorkerDirectory {
    store: Arc<LibSqlBackend>,
}

impl WorkerDirectory {
    pub fn new(store: Arc<LibSqlBackend>) -> Self {
        Self { store }
    }

    /// Register a worker and mint its bearer credential.
    pub async fn register(&self, req: RegisterWorkerRequest) -> Result<WorkerRegistration> {
        validate_registration(&req)?;

        let credential = generate_credential();
        let tx = self.store.begin().await?;
        let now = Utc::now();
        let worker = Worker {
            id: new_id("w"),
            name: req.name.trim().to_string(),
            github_handle: req
                .github_handle
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty()),
            skills: normalize_skills(req.skills),
            capacity_points: req.capacity_points,
            max_concurrent_tasks: req.max_concurrent_tasks,
            status: WorkerStatus::Idle,
            credential_hash: hash_credential(credential.expose_secret()),
            last_heartbeat: None,
            created_at: now,
        };

        let result = async {
            tx.insert_worker(&worker).await?;
            tx.append_audit(
                "worker_registered",
                &worker.id,
                &worker.id,
                json!({
                    "name": worker.name,
                    "skills": worker.skills,
                    "capacity_points": worker.capacity_points,
                    "max_concurrent_tasks": worker.max_concurrent_tasks,
                }),
                now,
            )
            .await?;
            Ok::<_, PoolError>(())
        }
        .await;
        tx.finish(result).await?;

        info!(worker_id = %worker.id, name = %worker.name, skills = ?worker.skills, "Worker registered");
        Ok(WorkerRegistration {
            worker_id: worker.id,
            credential,
        })
    }

    /// Record a heartbeat for the worker owning `credential`.
    pub async fn heartbeat(
        &self,
        credential: &str,
        req: HeartbeatRequest,
    ) -> Result<HeartbeatResponse> {
        self.beat(credential, req, None).await
    }

    pub async fn heartbeat_at(
        &self,
        credential: &str,
        req: HeartbeatRequest,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatResponse> {
        self.beat(credential, req, Some(now)).await
    }

    async fn beat(
        &self,
        credential: &str,
        req: HeartbeatRequest,
        at: Option<DateTime<Utc>>,
    ) -> Result<HeartbeatResponse> {
        let tx = self.store.begin().await?;
        let now = at.unwrap_or_else(Utc::now);
        let result = async {
            let worker = authenticate(&tx, credential).await?;
            let status = WorkerStatus::from(req.status);
            let at = next_heartbeat(worker.last_heartbeat, now);
            tx.update_worker_heartbeat(&worker.id, status, at).await?;
            Ok::<_, PoolError>(worker)
        }
        .await;
        let worker = tx.finish(result).await?;

        debug!(
            worker_id = %worker.id,
            status = %WorkerStatus::from(req.status),
            note = req.note.as_deref().unwrap_or(""),
            "Heartbeat"
        );
        Ok(HeartbeatResponse {
            ok: true,
            server_time: now,
        })
    }

    pub async fn get_worker(&self, worker_id: &str) -> Result<Worker> {
        let tx = self.store.begin().await?;
        let result = async {
            tx.get_worker(worker_id)
                .await?
                .ok_or_else(|| PoolError::not_found(format!("Worker '{worker_id}' not found")))
        }
        .await;
        tx.finish(result).await
    }
}

/// Resolve a credential to its worker, whatever the worker's status.
pub(crate) async fn authenticate(tx: &StoreTx<'_>, credential: &str) -> Result<Worker> {
    if credential.trim().is_empty() {
        return Err(PoolError::auth("Missing worker credential"));
    }
    tx.worker_by_credential_hash(&hash_credential(credential.trim()))
        .await?
        .ok_or_else(|| PoolError::auth("Invalid worker token"))
}

/// Resolve a credential to a worker that may take new work.
pub(crate) async fn authenticate_active(tx: &StoreTx<'_>, credential: &str) -> Result<Worker> {
    let worker = authenticate(tx, credential).await?;
    if worker.status == WorkerStatus::Paused {
        return Err(PoolError::auth(format!("Worker '{}' is paused", worker.id))
            .with_suggestion("Send a heartbeat to resume taking work"));
    }
    Ok(worker)
}

/// Heartbeats never move backwards, even if the clock does.
fn next_heartbeat(previous: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    match previous {
        Some(prev) if prev >= now => prev + Duration::microseconds(1),
        _ => now,
    }
}

fn validate_registration(req: &RegisterWorkerRequest) -> Result<()> {
    if req.name.trim().is_empty() {
        return Err(PoolError::validation("Worker name must not be empty"));
    }
    if !(1..=100).contains(&req.capacity_points) {
        return Err(PoolError::validation(format!(
            "capacity_points must be between 1 and 100, got {}",
            req.capacity_points
        )));
    }
    if !(1..=20).contains(&req.max_concurrent_tasks) {
        return Err(PoolError::validation(format!(
            "max_concurrent_tasks must be between 1 and 20, got {}",
            req.max_concurrent_tasks
        )));
    }
    Ok(())
}
