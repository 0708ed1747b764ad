//! `WorkPool`: one explicitly constructed handle over the store and every component.

use std::sync::Arc;

use crate::catalog::TaskCatalog;
use crate::config::{PoolConfig, chrono_duration};
use crate::directory::{WorkerDirectory, WorkerRegistration};
use crate::error::{PoolError, Result};
use crate::lease::LeaseManager;
use crate::model::{
    AuditEvent, HeartbeatRequest, HeartbeatResponse, RegisterWorkerRequest, RepoCreateRequest,
    Repository, SystemState, Task, TaskArtifact, TaskCreateRequest, TaskLease,
    TaskStatusUpdateRequest, TaskStatusUpdateResponse, WorkResponse,
};
use crate::reconciler::Reconciler;
use crate::recorder::StatusRecorder;
use crate::store::LibSqlBackend;

#[derive(Clone)]
pub struct WorkPool {
    config: Arc<PoolConfig>,
    store: Arc<LibSqlBackend>,
    directory: WorkerDirectory,
    catalog: TaskCatalog,
    leases: LeaseManager,
    recorder: StatusRecorder,
    reconciler: Arc<Reconciler>,
}

impl WorkPool {
    pub fn new(store: Arc<LibSqlBackend>, config: PoolConfig) -> Self {
        let liveness = chrono_duration(config.reconciler.liveness_threshold);
        Self {
            directory: WorkerDirectory::new(store.clone()),
            catalog: TaskCatalog::new(store.clone(), liveness),
            leases: LeaseManager::new(store.clone(), config.lease.clone()),
            recorder: StatusRecorder::new(store.clone(), config.terminal_statuses.clone()),
            reconciler: Arc::new(Reconciler::new(store.clone(), config.reconciler.clone())),
            store,
            config: Arc::new(config),
        }
    }

    /// Open the on-disk store named by `config.db_path`.
    pub async fn open(config: PoolConfig) -> Result<Self> {
        let store = LibSqlBackend::new_local(&config.db_path).await?;
        Ok(Self::new(Arc::new(store), config))
    }

    /// Pool over a fresh in-memory store.
    pub async fn in_memory(config: PoolConfig) -> Result<Self> {
        let store = LibSqlBackend::new_memory().await?;
        Ok(Self::new(Arc::new(store), config))
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<LibSqlBackend> {
        &self.store
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    // ── Worker operations ───────────────────────────────────────────

    pub async fn register_worker(&self, req: RegisterWorkerRequest) -> Result<WorkerRegistration> {
        self.directory.register(req).await
    }

    pub async fn heartbeat(
        &self,
        credential: &str,
        req: HeartbeatRequest,
    ) -> Result<HeartbeatResponse> {
        self.directory.heartbeat(credential, req).await
    }

    pub async fn fetch_work(&self, credential: &str) -> Result<WorkResponse> {
        self.leases.fetch_work(credential).await
    }

    pub async fn update_task_status(
        &self,
        credential: &str,
        task_id: &str,
        req: TaskStatusUpdateRequest,
    ) -> Result<TaskStatusUpdateResponse> {
        self.recorder.update_task_status(credential, task_id, req).await
    }

    // ── Administrative operations ───────────────────────────────────

    pub async fn create_repository(&self, req: RepoCreateRequest) -> Result<Repository> {
        self.catalog.create_repository(req).await
    }

    pub async fn create_task(&self, req: TaskCreateRequest) -> Result<Task> {
        self.catalog.create_task(req).await
    }

    pub async fn system_state(&self) -> Result<SystemState> {
        self.catalog.system_state().await
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Task> {
        self.catalog.get_task(task_id).await
    }

    pub async fn get_artifact(&self, task_id: &str) -> Result<Option<TaskArtifact>> {
        self.catalog.get_artifact(task_id).await
    }

    pub async fn active_lease_for_task(&self, task_id: &str) -> Result<Option<TaskLease>> {
        self.catalog.active_lease_for_task(task_id).await
    }

    pub async fn list_audit_events(
        &self,
        event_type: Option<&str>,
        limit: i64,
    ) -> Result<Vec<AuditEvent>> {
        let tx = self.store.begin().await?;
        let result = tx
            .list_audit_events(event_type, limit.clamp(1, 1000))
            .await
            .map_err(PoolError::from);
        tx.finish(result).await
    }
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;

    use crate::model::TaskStatus;

    use super::*;

    #[tokio::test]
    async fn end_to_end_scenario() {
        let pool = WorkPool::in_memory(PoolConfig::default()).await.unwrap();

        let reg = pool
            .register_worker(RegisterWorkerRequest::new("W", &["python"]).with_limits(5, 2))
            .await
            .unwrap();
        let token = reg.credential.expose_secret().to_string();
        pool.create_repository(RepoCreateRequest {
            repo: "demo".into(),
            max_open_prs: 3,
            area_locks_enabled: true,
        })
        .await
        .unwrap();
        let task = pool
            .create_task(TaskCreateRequest::new("demo", "X", &["python"]).with_priority(10))
            .await
            .unwrap();

        let work = pool.fetch_work(&token).await.unwrap();
        assert_eq!(work.worker_id, reg.worker_id);
        assert_eq!(work.leases.len(), 1);
        assert_eq!(work.leases[0].task_id, task.id);
        assert_eq!(pool.get_task(&task.id).await.unwrap().status, TaskStatus::Leased);

        let resp = pool
            .update_task_status(&token, &task.id, TaskStatusUpdateRequest::status(TaskStatus::PrOpened))
            .await
            .unwrap();
        assert!(resp.ok);
        assert!(pool.active_lease_for_task(&task.id).await.unwrap().is_none());

        let state = pool.system_state().await.unwrap();
        assert_eq!(state.tasks_queued, 0);
        assert_eq!(state.repositories[0].current_open_prs, 1);

        let types: Vec<String> = pool
            .list_audit_events(None, 50)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(
            types,
            vec![
                "worker_registered",
                "repo_upserted",
                "task_created",
                "task_leased",
                "task_status",
                "lease_released"
            ]
        );
    }
}
