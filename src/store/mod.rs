//! Persistence layer: libSQL-backed storage for workers, tasks, leases and audit events.

mod audit;
pub mod libsql_backend;
pub mod migrations;
pub(crate) mod rows;

pub use libsql_backend::{CandidateTask, HeldLease, LeaseRecord, LibSqlBackend, StoreTx};
