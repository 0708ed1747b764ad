//! Reconciler: periodic repair of lease and liveness drift.
//!
//! Each cycle runs three ordered steps in one transaction:
//! 1. expire lapsed leases and put their tasks back to `ready`
//! 2. pause workers whose heartbeat is older than the liveness threshold
//! 3. requeue tasks still leased to paused workers
//!
//! A worker paused in step 2 is picked up by step 3 in the same pass. A failed
//! cycle is logged and retried on the next tick; it never stops the ticker.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::{ReconcilerConfig, chrono_duration};
use crate::directory::liveness_cutoff;
use crate::error::Result;
use crate::model::{TaskStatus, WorkerStatus};
use crate::store::{LibSqlBackend, StoreTx};

/// Task statuses that imply a live lease.
const LEASED_STATUSES: [TaskStatus; 2] = [TaskStatus::Leased, TaskStatus::InProgress];

/// Outcome of one reconciliation cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub expired_leases: usize,
    pub offline_workers: usize,
    pub requeued_tasks: usize,
    pub at: DateTime<Utc>,
}

impl CycleReport {
    fn is_empty(&self) -> bool {
        self.expired_leases == 0 && self.offline_workers == 0 && self.requeued_tasks == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcilerStatus {
    pub running: bool,
    pub cycles: u64,
    pub last_report: Option<CycleReport>,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct CycleStats {
    cycles: u64,
    last_report: Option<CycleReport>,
    last_error: Option<String>,
}

struct CycleRunner {
    store: Arc<LibSqlBackend>,
    config: ReconcilerConfig,
    stats: RwLock<CycleStats>,
}

impl CycleRunner {
    async fn run_at(&self, at: Option<DateTime<Utc>>) -> Result<CycleReport> {
        let tx = self.store.begin().await?;
        let now = at.unwrap_or_else(Utc::now);
        let result = self.reconcile(&tx, now).await;
        let outcome = tx.finish(result).await;

        let mut stats = self.stats.write().await;
        stats.cycles += 1;
        match &outcome {
            Ok(report) => {
                stats.last_report = Some(report.clone());
                stats.last_error = None;
            }
            Err(e) => stats.last_error = Some(e.to_string()),
        }
        outcome
    }

    /// Run a cycle from the ticker; failures are logged, never propagated.
    async fn tick(&self) {
        match self.run_at(None).await {
            Ok(report) if report.is_empty() => debug!("Reconcile cycle: nothing to do"),
            Ok(report) => info!(
                expired_leases = report.expired_leases,
                offline_workers = report.offline_workers,
                requeued_tasks = report.requeued_tasks,
                "Reconcile cycle complete"
            ),
            Err(e) => warn!(error = %e, "Reconcile cycle failed, retrying next tick"),
        }
    }

    async fn reconcile(&self, tx: &StoreTx<'_>, now: DateTime<Utc>) -> Result<CycleReport> {
        let expired_leases = expire_leases(tx, now).await?;
        let cutoff = liveness_cutoff(now, chrono_duration(self.config.liveness_threshold));
        let offline_workers = mark_offline_workers(tx, cutoff).await?;
        let requeued_tasks = requeue_orphaned_tasks(tx, now).await?;
        Ok(CycleReport {
            expired_leases,
            offline_workers,
            requeued_tasks,
            at: now,
        })
    }
}

/// Step 1: delete lapsed leases, returning their tasks to the queue.
async fn expire_leases(tx: &StoreTx<'_>, now: DateTime<Utc>) -> Result<usize> {
    let expired = tx.expired_leases(now).await?;
    for record in &expired {
        let lease = &record.lease;
        let requeued = tx
            .requeue_task_if(&lease.task_id, &LEASED_STATUSES, now)
            .await?;
        tx.delete_lease(&lease.id).await?;
        tx.append_audit(
            "lease_expired",
            "system",
            &lease.task_id,
            json!({
                "lease_id": lease.id,
                "worker_id": lease.worker_id,
                "title": record.task_title,
                "lease_expires_at": lease.expires_at,
                "previous_status": record.task_status,
                "requeued": requeued,
            }),
            now,
        )
        .await?;
        info!(
            lease_id = %lease.id,
            task_id = %lease.task_id,
            worker_id = %lease.worker_id,
            "Lease expired"
        );
    }
    Ok(expired.len())
}

/// Step 2: pause workers that fail the liveness test at `cutoff`.
async fn mark_offline_workers(tx: &StoreTx<'_>, cutoff: DateTime<Utc>) -> Result<usize> {
    let stale = tx.stale_workers(cutoff).await?;
    for worker in &stale {
        tx.set_worker_status(&worker.id, WorkerStatus::Paused).await?;
        info!(
            worker_id = %worker.id,
            name = %worker.name,
            last_heartbeat = ?worker.last_heartbeat,
            "Worker marked offline"
        );
    }
    Ok(stale.len())
}

/// Step 3: take back work held by paused workers.
async fn requeue_orphaned_tasks(tx: &StoreTx<'_>, now: DateTime<Utc>) -> Result<usize> {
    let orphaned = tx.orphaned_leases().await?;
    for record in &orphaned {
        let lease = &record.lease;
        tx.requeue_task_if(&lease.task_id, &LEASED_STATUSES, now)
            .await?;
        tx.delete_lease(&lease.id).await?;
        tx.append_audit(
            "task_requeued",
            "system",
            &lease.task_id,
            json!({
                "reason": "worker_offline",
                "lease_id": lease.id,
                "worker_id": lease.worker_id,
                "worker_name": record.worker_name,
                "title": record.task_title,
                "previous_status": record.task_status,
            }),
            now,
        )
        .await?;
        info!(
            task_id = %lease.task_id,
            worker_id = %lease.worker_id,
            "Task requeued from offline worker"
        );
    }
    Ok(orphaned.len())
}

struct Ticker {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns the reconciliation cycle and its ticker task.
pub struct Reconciler {
    runner: Arc<CycleRunner>,
    ticker: Mutex<Option<Ticker>>,
}

impl Reconciler {
    pub fn new(store: Arc<LibSqlBackend>, config: ReconcilerConfig) -> Self {
        Self {
            runner: Arc::new(CycleRunner {
                store,
                config,
                stats: RwLock::new(CycleStats::default()),
            }),
            ticker: Mutex::new(None),
        }
    }

    /// Run one cycle now.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        self.runner.run_at(None).await
    }

    /// Run one cycle as if the clock read `now`.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        self.runner.run_at(Some(now)).await
    }

    /// Run an immediate cycle, then keep ticking every interval. No-op if running.
    pub async fn start(&self) {
        let mut ticker = self.ticker.lock().await;
        if ticker.is_some() {
            debug!("Reconciler already running");
            return;
        }

        self.runner.tick().await;

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let runner = self.runner.clone();
        let period = runner.config.interval;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // First tick fires immediately; the start-up cycle already covered it
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => runner.tick().await,
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Reconciler ticker exited");
        });

        *ticker = Some(Ticker { stop_tx, handle });
        info!(interval_secs = period.as_secs(), "Reconciler started");
    }

    /// Stop the ticker and wait for it to exit. No-op if stopped.
    pub async fn stop(&self) {
        let Some(ticker) = self.ticker.lock().await.take() else {
            debug!("Reconciler already stopped");
            return;
        };
        let _ = ticker.stop_tx.send(true);
        if let Err(e) = ticker.handle.await {
            warn!(error = %e, "Reconciler ticker ended abnormally");
        }
        info!("Reconciler stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.ticker.lock().await.is_some()
    }

    pub async fn status(&self) -> ReconcilerStatus {
        let running = self.is_running().await;
        let stats = self.runner.stats.read().await;
        ReconcilerStatus {
            running,
            cycles: stats.cycles,
            last_report: stats.last_report.clone(),
            last_error: stats.last_error.clone(),
        }
    }
}
