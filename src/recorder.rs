//! Status/Artifact Recorder: applies worker-reported task transitions.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::config::TerminalStatuses;
use crate::directory::authenticate;
use crate::error::{PoolError, Result};
use crate::model::{TaskStatusUpdateRequest, TaskStatusUpdateResponse};
use crate::store::{LibSqlBackend, StoreTx};

#[derive(Clone)]
pub struct StatusRecorder {
    store: Arc<LibSqlBackend>,
    terminal: TerminalStatuses,
}

impl StatusRecorder {
    pub fn new(store: Arc<LibSqlBackend>, terminal: TerminalStatuses) -> Self {
        Self { store, terminal }
    }

    /// Apply a status reported by the worker holding the task's lease.
    ///
    /// A terminal status releases the lease in the same transaction.
    pub async fn update_task_status(
        &self,
        credential: &str,
        task_id: &str,
        req: TaskStatusUpdateRequest,
    ) -> Result<TaskStatusUpdateResponse> {
        self.update(credential, task_id, req, None).await
    }

    pub async fn update_task_status_at(
        &self,
        credential: &str,
        task_id: &str,
        req: TaskStatusUpdateRequest,
        now: DateTime<Utc>,
    ) -> Result<TaskStatusUpdateResponse> {
        self.update(credential, task_id, req, Some(now)).await
    }

    async fn update(
        &self,
        credential: &str,
        task_id: &str,
        req: TaskStatusUpdateRequest,
        at: Option<DateTime<Utc>>,
    ) -> Result<TaskStatusUpdateResponse> {
        if !req.status.is_worker_reportable() {
            return Err(PoolError::validation(format!(
                "Status '{}' cannot be reported by a worker",
                req.status
            )));
        }

        let tx = self.store.begin().await?;
        let now = at.unwrap_or_else(Utc::now);
        let result = self.apply(&tx, credential, task_id, &req, now).await;
        tx.finish(result).await
    }

    async fn apply(
        &self,
        tx: &StoreTx<'_>,
        credential: &str,
        task_id: &str,
        req: &TaskStatusUpdateRequest,
        now: DateTime<Utc>,
    ) -> Result<TaskStatusUpdateResponse> {
        let worker = authenticate(tx, credential).await?;
        if tx.get_task(task_id).await?.is_none() {
            return Err(PoolError::not_found(format!("Task '{task_id}' not found")));
        }

        let lease = match tx.active_lease_for_task(task_id, now).await? {
            Some(lease) if lease.worker_id == worker.id => lease,
            _ => {
                warn!(worker_id = %worker.id, task_id, "Status update without an active lease");
                return Err(PoolError::forbidden("No active lease for this task"));
            }
        };

        tx.set_task_status(task_id, req.status, now).await?;

        if let Some(artifact) = &req.artifact {
            let extra = artifact_metadata(artifact.extra.clone(), req.message.as_deref());
            tx.upsert_artifact(task_id, artifact, &extra, now).await?;
        }

        tx.append_audit(
            "task_status",
            &worker.id,
            task_id,
            json!({
                "status": req.status,
                "message": req.message,
                "artifact": req.artifact,
            }),
            now,
        )
        .await?;

        let lease_released = self.terminal.contains(req.status);
        if lease_released {
            tx.delete_lease(&lease.id).await?;
            tx.append_audit(
                "lease_released",
                &worker.id,
                task_id,
                json!({ "lease_id": lease.id, "status": req.status }),
                now,
            )
            .await?;
            info!(
                worker_id = %worker.id,
                task_id,
                lease_id = %lease.id,
                status = %req.status,
                "Lease released on terminal status"
            );
        } else {
            info!(worker_id = %worker.id, task_id, status = %req.status, "Task status updated");
        }

        Ok(TaskStatusUpdateResponse {
            ok: true,
            task_id: task_id.to_string(),
            status: req.status,
            lease_released,
        })
    }
}

/// Artifact metadata object, with the report's message folded in.
fn artifact_metadata(extra: Option<Value>, message: Option<&str>) -> Value {
    let mut meta = match extra {
        Some(Value::Object(map)) => Value::Object(map),
        Some(other) => json!({ "value": other }),
        None => json!({}),
    };
    if let (Some(message), Value::Object(map)) = (message, &mut meta) {
        map.insert("message".to_string(), Value::String(message.to_string()));
    }
    meta
}
