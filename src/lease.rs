//! Lease Manager: hands the best eligible ready task to a requesting worker.
//!
//! Selection, claim and lease insertion happen inside one store transaction.
//! The claim is a conditional `UPDATE … WHERE status = 'ready'`; if it affects
//! no row the candidate was taken in between and selection runs again.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info};

use crate::config::{LeaseConfig, chrono_duration};
use crate::directory::authenticate_active;
use crate::error::{PoolError, Result};
use crate::model::{LeaseView, TaskLease, Worker, WorkResponse, new_id};
use crate::store::{CandidateTask, HeldLease, LibSqlBackend, StoreTx};

/// Upper bound on select→claim rounds within one fetch.
const MAX_CLAIM_ATTEMPTS: usize = 8;

/// Ready tasks read per query while looking for an eligible one.
const CANDIDATE_PAGE_SIZE: i64 = 32;

#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<LibSqlBackend>,
    config: LeaseConfig,
}

impl LeaseManager {
    pub fn new(store: Arc<LibSqlBackend>, config: LeaseConfig) -> Self {
        Self { store, config }
    }

    /// Lease at most one task to the worker owning `credential`.
    ///
    /// No eligible task is an empty lease list, not an error.
    pub async fn fetch_work(&self, credential: &str) -> Result<WorkResponse> {
        self.fetch(credential, None).await
    }

    pub async fn fetch_work_at(&self, credential: &str, now: DateTime<Utc>) -> Result<WorkResponse> {
        self.fetch(credential, Some(now)).await
    }

    async fn fetch(&self, credential: &str, at: Option<DateTime<Utc>>) -> Result<WorkResponse> {
        let tx = self.store.begin().await?;
        let now = at.unwrap_or_else(Utc::now);
        let result = self.assign(&tx, credential, now).await;
        tx.finish(result).await
    }

    async fn assign(
        &self,
        tx: &StoreTx<'_>,
        credential: &str,
        now: DateTime<Utc>,
    ) -> Result<WorkResponse> {
        let worker = authenticate_active(tx, credential).await?;
        let held = tx.held_leases(&worker.id, now).await?;

        if held.len() as i64 >= worker.max_concurrent_tasks {
            debug!(
                worker_id = %worker.id,
                held = held.len(),
                "Worker at concurrency limit"
            );
            return Ok(empty(&worker));
        }

        let skills = skill_set(&worker.skills);
        let mut open_prs: HashMap<String, i64> = HashMap::new();

        for attempt in 1..=MAX_CLAIM_ATTEMPTS {
            let chosen = self
                .select(tx, &worker, &skills, &held, &mut open_prs, now)
                .await?;

            let Some(candidate) = chosen else {
                debug!(worker_id = %worker.id, "No eligible task");
                return Ok(empty(&worker));
            };

            if !tx.claim_task(&candidate.task.id, now).await? {
                debug!(task_id = %candidate.task.id, attempt, "Candidate claimed elsewhere, reselecting");
                continue;
            }

            tx.delete_expired_leases_for_task(&candidate.task.id, now)
                .await?;
            let lease = TaskLease {
                id: new_id("l"),
                task_id: candidate.task.id.clone(),
                worker_id: worker.id.clone(),
                expires_at: now + chrono_duration(self.config.lease_ttl),
                created_at: now,
            };
            tx.insert_lease(&lease).await?;
            tx.append_audit(
                "task_leased",
                &worker.id,
                &lease.task_id,
                json!({
                    "lease_id": lease.id,
                    "repo": candidate.repo_key,
                    "lease_expires_at": lease.expires_at,
                }),
                now,
            )
            .await?;

            info!(
                worker_id = %worker.id,
                task_id = %lease.task_id,
                lease_id = %lease.id,
                repo = %candidate.repo_key,
                "Lease issued"
            );
            return Ok(WorkResponse {
                worker_id: worker.id.clone(),
                leases: vec![lease_view(&lease, candidate)],
            });
        }

        Err(PoolError::conflict("Could not claim a task under contention")
            .with_suggestion("Retry the fetch"))
    }

    /// Best eligible candidate, read a page at a time and stopping at the first match.
    async fn select(
        &self,
        tx: &StoreTx<'_>,
        worker: &Worker,
        skills: &HashSet<String>,
        held: &[HeldLease],
        open_prs: &mut HashMap<String, i64>,
        now: DateTime<Utc>,
    ) -> Result<Option<CandidateTask>> {
        let mut offset = 0;
        loop {
            let page = tx.candidate_tasks(now, CANDIDATE_PAGE_SIZE, offset).await?;
            let exhausted = (page.len() as i64) < CANDIDATE_PAGE_SIZE;
            for candidate in page {
                if !is_eligible(worker, skills, held, &candidate, &self.config) {
                    continue;
                }
                if self.config.enforce_pr_throttle
                    && self.repo_throttled(tx, &candidate, open_prs).await?
                {
                    continue;
                }
                return Ok(Some(candidate));
            }
            if exhausted {
                return Ok(None);
            }
            offset += CANDIDATE_PAGE_SIZE;
        }
    }

    async fn repo_throttled(
        &self,
        tx: &StoreTx<'_>,
        candidate: &CandidateTask,
        cache: &mut HashMap<String, i64>,
    ) -> Result<bool> {
        if candidate.max_open_prs <= 0 {
            return Ok(true);
        }
        let open = match cache.get(&candidate.task.repo_id) {
            Some(count) => *count,
            None => {
                let count = tx.count_open_prs(&candidate.task.repo_id).await?;
                cache.insert(candidate.task.repo_id.clone(), count);
                count
            }
        };
        Ok(open >= candidate.max_open_prs)
    }
}

fn empty(worker: &Worker) -> WorkResponse {
    WorkResponse {
        worker_id: worker.id.clone(),
        leases: Vec::new(),
    }
}

fn skill_set(skills: &[String]) -> HashSet<String> {
    skills.iter().map(|s| s.trim().to_lowercase()).collect()
}

/// Worker skills cover every required skill, ignoring case.
fn has_required_skills(worker_skills: &HashSet<String>, required: &[String]) -> bool {
    required
        .iter()
        .all(|skill| worker_skills.contains(&skill.trim().to_lowercase()))
}

/// The worker already holds a lease in the same repository and area.
fn area_conflict(held: &[HeldLease], candidate: &CandidateTask) -> bool {
    let Some(area) = candidate.task.area.as_deref() else {
        return false;
    };
    held.iter().any(|h| {
        h.repo_id == candidate.task.repo_id
            && h.area.as_deref().is_some_and(|a| a.eq_ignore_ascii_case(area))
    })
}

fn within_capacity_points(worker: &Worker, held: &[HeldLease], candidate: &CandidateTask) -> bool {
    let committed: i64 = held.iter().map(|h| h.estimate_points).sum();
    committed + candidate.task.estimate_points <= worker.capacity_points
}

fn is_eligible(
    worker: &Worker,
    worker_skills: &HashSet<String>,
    held: &[HeldLease],
    candidate: &CandidateTask,
    config: &LeaseConfig,
) -> bool {
    if !has_required_skills(worker_skills, &candidate.task.required_skills) {
        return false;
    }
    if candidate.area_locks_enabled && area_conflict(held, candidate) {
        return false;
    }
    if config.enforce_capacity_points && !within_capacity_points(worker, held, candidate) {
        return false;
    }
    true
}

fn lease_view(lease: &TaskLease, candidate: CandidateTask) -> LeaseView {
    let task = candidate.task;
    LeaseView {
        lease_id: lease.id.clone(),
        task_id: task.id,
        repo: candidate.repo_key,
        title: task.title,
        description: task.description,
        estimate_points: task.estimate_points,
        priority: task.priority,
        area: task.area,
        tier: task.tier,
        required_skills: task.required_skills,
        lease_expires_at: lease.expires_at,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use chrono::Duration;
    use secrecy::ExposeSecret;

    use crate::catalog::TaskCatalog;
    use crate::directory::WorkerDirectory;
    use crate::error::ErrorKind;
    use crate::model::{
        HeartbeatRequest, HeartbeatStatus, RegisterWorkerRequest, RepoCreateRequest,
        TaskCreateRequest, TaskStatus,
    };

    use super::*;

    struct Fixture {
        store: Arc<LibSqlBackend>,
        directory: WorkerDirectory,
        catalog: TaskCatalog,
        leases: LeaseManager,
    }

    async fn fixture_with(config: LeaseConfig) -> Fixture {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let fixture = Fixture {
            directory: WorkerDirectory::new(store.clone()),
            catalog: TaskCatalog::new(store.clone(), Duration::minutes(5)),
            leases: LeaseManager::new(store.clone(), config),
            store,
        };
        fixture
            .catalog
            .create_repository(RepoCreateRequest {
                repo: "demo".into(),
                max_open_prs: 3,
                area_locks_enabled: true,
            })
            .await
            .unwrap();
        fixture
    }

    async fn fixture() -> Fixture {
        fixture_with(LeaseConfig::default()).await
    }

    impl Fixture {
        async fn worker(&self, req: RegisterWorkerRequest) -> String {
            let reg = self.directory.register(req).await.unwrap();
            reg.credential.expose_secret().to_string()
        }

        async fn task(&self, req: TaskCreateRequest) -> String {
            self.catalog.create_task(req).await.unwrap().id
        }

        async fn fetch(&self, token: &str) -> Option<LeaseView> {
            let mut resp = self.leases.fetch_work(token).await.unwrap();
            assert!(resp.leases.len() <= 1);
            resp.leases.pop()
        }
    }

    #[tokio::test]
    async fn fetch_leases_task_and_flips_status() {
        let fx = fixture().await;
        let token = fx.worker(RegisterWorkerRequest::new("w", &["python"])).await;
        let task_id = fx
            .task(TaskCreateRequest::new("demo", "x", &["python"]))
            .await;

        let before = Utc::now();
        let view = fx.fetch(&token).await.unwrap();
        assert_eq!(view.task_id, task_id);
        assert_eq!(view.repo, "demo");
        assert!(view.lease_expires_at >= before + Duration::hours(4));

        let task = fx.catalog.get_task(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Leased);
        let lease = fx.catalog.active_lease_for_task(&task_id).await.unwrap().unwrap();
        assert_eq!(lease.id, view.lease_id);
    }

    #[tokio::test]
    async fn empty_queue_is_not_an_error() {
        let fx = fixture().await;
        let token = fx.worker(RegisterWorkerRequest::new("w", &[])).await;
        let resp = fx.leases.fetch_work(&token).await.unwrap();
        assert!(resp.leases.is_empty());
        assert!(resp.worker_id.starts_with("w_"));
    }

    #[tokio::test]
    async fn unknown_or_paused_worker_is_rejected() {
        let fx = fixture().await;
        let err = fx.leases.fetch_work("bogus").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthError);

        let token = fx.worker(RegisterWorkerRequest::new("w", &[])).await;
        fx.directory
            .heartbeat(
                &token,
                HeartbeatRequest {
                    status: HeartbeatStatus::Offline,
                    note: None,
                },
            )
            .await
            .unwrap();
        let err = fx.leases.fetch_work(&token).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthError);
    }

    #[tokio::test]
    async fn priority_then_age_ordering() {
        let fx = fixture().await;
        let token = fx
            .worker(RegisterWorkerRequest::new("w", &[]).with_limits(10, 3))
            .await;
        let t1 = fx
            .task(TaskCreateRequest::new("demo", "t1", &[]).with_priority(10))
            .await;
        let t2 = fx
            .task(TaskCreateRequest::new("demo", "t2", &[]).with_priority(5))
            .await;
        let t3 = fx
            .task(TaskCreateRequest::new("demo", "t3", &[]).with_priority(10))
            .await;

        let order = [
            fx.fetch(&token).await.unwrap().task_id,
            fx.fetch(&token).await.unwrap().task_id,
            fx.fetch(&token).await.unwrap().task_id,
        ];
        assert_eq!(order, [t1, t3, t2]);
    }

    #[tokio::test]
    async fn skill_gate_blocks_missing_skills() {
        let fx = fixture().await;
        let python = fx.worker(RegisterWorkerRequest::new("py", &["python"])).await;
        let rust = fx.worker(RegisterWorkerRequest::new("rs", &["RUST", "go"])).await;
        let task_id = fx.task(TaskCreateRequest::new("demo", "x", &["rust"])).await;

        assert!(fx.fetch(&python).await.is_none());
        assert_eq!(fx.fetch(&rust).await.unwrap().task_id, task_id);
    }

    #[tokio::test]
    async fn eligible_task_past_the_first_page_is_found() {
        let fx = fixture().await;
        let token = fx.worker(RegisterWorkerRequest::new("py", &["python"])).await;
        for i in 0..(CANDIDATE_PAGE_SIZE + 5) {
            fx.task(
                TaskCreateRequest::new("demo", &format!("go-{i}"), &["go"]).with_priority(50),
            )
            .await;
        }
        let wanted = fx
            .task(TaskCreateRequest::new("demo", "py", &["python"]).with_priority(1))
            .await;

        assert_eq!(fx.fetch(&token).await.unwrap().task_id, wanted);
    }

    #[tokio::test]
    async fn equal_priority_tasks_lease_in_creation_order() {
        let fx = fixture().await;
        let token = fx
            .worker(RegisterWorkerRequest::new("w", &[]).with_limits(5, 3))
            .await;
        let mut created = Vec::new();
        for title in ["a", "b", "c"] {
            created.push(fx.task(TaskCreateRequest::new("demo", title, &[])).await);
        }

        let mut leased = Vec::new();
        for _ in 0..3 {
            leased.push(fx.fetch(&token).await.unwrap().task_id);
        }
        assert_eq!(leased, created);
    }

    #[tokio::test]
    async fn concurrency_limit_is_respected() {
        let fx = fixture().await;
        let token = fx
            .worker(RegisterWorkerRequest::new("w", &[]).with_limits(5, 2))
            .await;
        for title in ["a", "b", "c"] {
            fx.task(TaskCreateRequest::new("demo", title, &[])).await;
        }

        assert!(fx.fetch(&token).await.is_some());
        assert!(fx.fetch(&token).await.is_some());
        assert!(fx.fetch(&token).await.is_none());

        let tx = fx.store.begin().await.unwrap();
        let worker = tx
            .worker_by_credential_hash(&crate::auth::hash_credential(&token))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tx.held_leases(&worker.id, Utc::now()).await.unwrap().len(), 2);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn area_lock_prevents_overlapping_work() {
        let fx = fixture().await;
        let token = fx
            .worker(RegisterWorkerRequest::new("w", &[]).with_limits(5, 3))
            .await;
        let first = fx
            .task(TaskCreateRequest::new("demo", "a", &[]).with_area("parser").with_priority(20))
            .await;
        fx.task(TaskCreateRequest::new("demo", "b", &[]).with_area("Parser").with_priority(15))
            .await;
        let other = fx
            .task(TaskCreateRequest::new("demo", "c", &[]).with_area("lexer"))
            .await;

        assert_eq!(fx.fetch(&token).await.unwrap().task_id, first);
        assert_eq!(fx.fetch(&token).await.unwrap().task_id, other);
        assert!(fx.fetch(&token).await.is_none());
    }

    #[tokio::test]
    async fn area_locks_can_be_disabled_per_repository() {
        let fx = fixture().await;
        fx.catalog
            .create_repository(RepoCreateRequest {
                repo: "loose".into(),
                max_open_prs: 3,
                area_locks_enabled: false,
            })
            .await
            .unwrap();
        let token = fx
            .worker(RegisterWorkerRequest::new("w", &[]).with_limits(5, 3))
            .await;
        fx.task(TaskCreateRequest::new("loose", "a", &[]).with_area("ui")).await;
        fx.task(TaskCreateRequest::new("loose", "b", &[]).with_area("ui")).await;

        assert!(fx.fetch(&token).await.is_some());
        assert!(fx.fetch(&token).await.is_some());
    }

    #[tokio::test]
    async fn capacity_points_gate_when_enforced() {
        let fx = fixture_with(LeaseConfig {
            enforce_capacity_points: true,
            ..LeaseConfig::default()
        })
        .await;
        let token = fx
            .worker(RegisterWorkerRequest::new("w", &[]).with_limits(5, 3))
            .await;
        let big = fx
            .task(TaskCreateRequest::new("demo", "big", &[]).with_estimate(4).with_priority(20))
            .await;
        fx.task(TaskCreateRequest::new("demo", "medium", &[]).with_estimate(2).with_priority(15))
            .await;
        let small = fx
            .task(TaskCreateRequest::new("demo", "small", &[]).with_estimate(1))
            .await;

        assert_eq!(fx.fetch(&token).await.unwrap().task_id, big);
        assert_eq!(fx.fetch(&token).await.unwrap().task_id, small);
        assert!(fx.fetch(&token).await.is_none());
    }

    #[tokio::test]
    async fn pr_throttle_skips_saturated_repositories() {
        let fx = fixture_with(LeaseConfig {
            enforce_pr_throttle: true,
            ..LeaseConfig::default()
        })
        .await;
        fx.catalog
            .create_repository(RepoCreateRequest {
                repo: "frozen".into(),
                max_open_prs: 0,
                area_locks_enabled: true,
            })
            .await
            .unwrap();
        let token = fx.worker(RegisterWorkerRequest::new("w", &[])).await;
        fx.task(TaskCreateRequest::new("frozen", "x", &[]).with_priority(99))
            .await;
        let open = fx.task(TaskCreateRequest::new("demo", "y", &[])).await;

        assert_eq!(fx.fetch(&token).await.unwrap().task_id, open);
        assert!(fx.fetch(&token).await.is_none());
    }

    #[tokio::test]
    async fn short_ttl_leases_expire() {
        let fx = fixture_with(LeaseConfig {
            lease_ttl: StdDuration::from_secs(60),
            ..LeaseConfig::default()
        })
        .await;
        let token = fx.worker(RegisterWorkerRequest::new("w", &[])).await;
        let task_id = fx.task(TaskCreateRequest::new("demo", "x", &[])).await;
        let now = Utc::now();

        let resp = fx.leases.fetch_work_at(&token, now).await.unwrap();
        assert_eq!(resp.leases[0].lease_expires_at, now + Duration::seconds(60));

        let tx = fx.store.begin().await.unwrap();
        let later = now + Duration::seconds(61);
        assert!(tx.active_lease_for_task(&task_id, later).await.unwrap().is_none());
        assert_eq!(tx.expired_leases(later).await.unwrap().len(), 1);
        tx.commit().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_fetches_never_double_lease() {
        let fx = Arc::new(fixture().await);
        let mut tokens = Vec::new();
        for i in 0..8 {
            tokens.push(
                fx.worker(RegisterWorkerRequest::new(format!("w{i}"), &[]).with_limits(5, 2))
                    .await,
            );
        }
        for i in 0..3 {
            fx.task(TaskCreateRequest::new("demo", format!("t{i}"), &[]))
                .await;
        }

        let mut handles = Vec::new();
        for token in tokens {
            let fx = fx.clone();
            handles.push(tokio::spawn(async move {
                fx.leases.fetch_work(&token).await.unwrap().leases
            }));
        }
        let granted: Vec<LeaseView> = futures::future::join_all(handles)
            .await
            .into_iter()
            .flat_map(|r| r.unwrap())
            .collect();

        assert_eq!(granted.len(), 3);
        let distinct: HashSet<&str> = granted.iter().map(|l| l.task_id.as_str()).collect();
        assert_eq!(distinct.len(), 3);

        let tx = fx.store.begin().await.unwrap();
        for task_id in distinct {
            assert_eq!(
                tx.count_active_leases_for_task(task_id, Utc::now())
                    .await
                    .unwrap(),
                1
            );
        }
        tx.commit().await.unwrap();
    }
}
