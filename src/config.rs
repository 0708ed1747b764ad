//! Configuration types.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::model::TaskStatus;

/// Lease Manager configuration.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Lease expiry horizon from issuance.
    pub lease_ttl: Duration,
    /// Reject tasks whose estimate would push the worker past its capacity points.
    pub enforce_capacity_points: bool,
    /// Stop assigning into a repository once its open-PR count reaches `max_open_prs`.
    pub enforce_pr_throttle: bool,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(4 * 60 * 60),
            enforce_capacity_points: false,
            enforce_pr_throttle: false,
        }
    }
}

/// Reconciler configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Time between reconciliation cycles.
    pub interval: Duration,
    /// Maximum gap since last heartbeat before a worker is presumed offline.
    pub liveness_threshold: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            liveness_threshold: Duration::from_secs(5 * 60),
        }
    }
}

/// Statuses that release a task's lease as soon as a worker reports them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalStatuses(BTreeSet<&'static str>);

impl TerminalStatuses {
    /// Statuses that cannot end a lease are ignored.
    pub fn new(statuses: impl IntoIterator<Item = TaskStatus>) -> Self {
        Self(
            statuses
                .into_iter()
                .filter(TaskStatus::can_release_lease)
                .map(|s| s.as_str())
                .collect(),
        )
    }

    pub fn contains(&self, status: TaskStatus) -> bool {
        self.0.contains(status.as_str())
    }

    /// Parse a comma separated list such as `pr_opened,merged`.
    pub fn parse(key: &str, list: &str) -> Result<Self, ConfigError> {
        let mut statuses = Vec::new();
        for raw in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let status = TaskStatus::from_str(raw).map_err(|_| ConfigError::UnknownStatus {
                key: key.to_string(),
                value: raw.to_string(),
            })?;
            if !status.can_release_lease() {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("'{raw}' cannot be a terminal status"),
                });
            }
            statuses.push(status);
        }
        if statuses.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: "at least one terminal status is required".to_string(),
            });
        }
        Ok(Self::new(statuses))
    }
}

impl Default for TerminalStatuses {
    fn default() -> Self {
        Self::new([
            TaskStatus::PrOpened,
            TaskStatus::Merged,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ])
    }
}

/// Process-wide configuration, built by `main` and handed to every component.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub db_path: PathBuf,
    pub bind_addr: String,
    pub admin_token: SecretString,
    pub lease: LeaseConfig,
    pub reconciler: ReconcilerConfig,
    pub terminal_statuses: TerminalStatuses,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/worker-pool.db"),
            bind_addr: "0.0.0.0:8787".to_string(),
            admin_token: SecretString::from("dev-admin-token"),
            lease: LeaseConfig::default(),
            reconciler: ReconcilerConfig::default(),
            terminal_statuses: TerminalStatuses::default(),
        }
    }
}

impl PoolConfig {
    /// Build config from `POOL_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let db_path = lookup("POOL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);
        let bind_addr = lookup("POOL_BIND").unwrap_or(defaults.bind_addr);
        let admin_token = lookup("POOL_ADMIN_TOKEN")
            .map(SecretString::from)
            .unwrap_or(defaults.admin_token);

        let lease = LeaseConfig {
            lease_ttl: secs(&lookup, "POOL_LEASE_TTL_SECS", defaults.lease.lease_ttl)?,
            enforce_capacity_points: flag(
                &lookup,
                "POOL_ENFORCE_CAPACITY_POINTS",
                defaults.lease.enforce_capacity_points,
            )?,
            enforce_pr_throttle: flag(
                &lookup,
                "POOL_ENFORCE_PR_THROTTLE",
                defaults.lease.enforce_pr_throttle,
            )?,
        };

        let reconciler = ReconcilerConfig {
            interval: secs(
                &lookup,
                "POOL_RECONCILE_INTERVAL_SECS",
                defaults.reconciler.interval,
            )?,
            liveness_threshold: secs(
                &lookup,
                "POOL_WORKER_TIMEOUT_SECS",
                defaults.reconciler.liveness_threshold,
            )?,
        };

        let terminal_statuses = match lookup("POOL_TERMINAL_STATUSES") {
            Some(list) => TerminalStatuses::parse("POOL_TERMINAL_STATUSES", &list)?,
            None => defaults.terminal_statuses,
        };

        Ok(Self {
            db_path,
            bind_addr,
            admin_token,
            lease,
            reconciler,
            terminal_statuses,
        })
    }
}

/// Convert a configured duration for timestamp arithmetic, saturating at a century.
pub(crate) fn chrono_duration(d: Duration) -> chrono::Duration {
    let cap = chrono::Duration::days(36_500);
    chrono::Duration::from_std(d).map_or(cap, |c| c.min(cap))
}

fn secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    let value: u64 = raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{e}"),
    })?;
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_secs(value))
}

fn flag(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    match lookup(key).as_deref().map(str::trim) {
        None => Ok(default),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got '{other}'"),
        }),
    }
}
