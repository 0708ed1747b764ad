//! Append-only audit trail.

use chrono::{DateTime, Utc};
use libsql::params;
use serde_json::Value;
use tracing::debug;

use crate::error::DatabaseError;
use crate::model::{AuditEvent, new_id};
use crate::store::libsql_backend::StoreTx;
use crate::store::rows::{AUDIT_COLUMNS, fmt_ts, row_to_audit};

impl StoreTx<'_> {
    /// Record an event inside the current transaction.
    pub async fn append_audit(
        &self,
        event_type: &str,
        actor: &str,
        target: &str,
        details: Value,
        now: DateTime<Utc>,
    ) -> Result<AuditEvent, DatabaseError> {
        let event = AuditEvent {
            id: new_id("ae"),
            event_type: event_type.to_string(),
            actor: actor.to_string(),
            target: target.to_string(),
            details,
            created_at: now,
        };
        let details_json = serde_json::to_string(&event.details)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.exec(
            "append_audit",
            "INSERT INTO audit_events (id, event_type, actor, target, details, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.id.as_str(),
                event.event_type.as_str(),
                event.actor.as_str(),
                event.target.as_str(),
                details_json,
                fmt_ts(event.created_at),
            ],
        )
        .await?;

        debug!(event_type, actor, target, "Audit event recorded");
        Ok(event)
    }

    /// The latest `limit` events in the order they were written, optionally filtered by type.
    pub async fn list_audit_events(
        &self,
        event_type: Option<&str>,
        limit: i64,
    ) -> Result<Vec<AuditEvent>, DatabaseError> {
        match event_type {
            Some(kind) => {
                self.query_all(
                    "list_audit_events",
                    &format!(
                        "SELECT {AUDIT_COLUMNS} FROM (
                           SELECT seq, {AUDIT_COLUMNS} FROM audit_events
                           WHERE event_type = ?1 ORDER BY seq DESC LIMIT ?2
                         ) ORDER BY seq ASC"
                    ),
                    params![kind, limit],
                    row_to_audit,
                )
                .await
            }
            None => {
                self.query_all(
                    "list_audit_events",
                    &format!(
                        "SELECT {AUDIT_COLUMNS} FROM (
                           SELECT seq, {AUDIT_COLUMNS} FROM audit_events ORDER BY seq DESC LIMIT ?1
                         ) ORDER BY seq ASC"
                    ),
                    params![limit],
                    row_to_audit,
                )
                .await
            }
        }
    }
}
