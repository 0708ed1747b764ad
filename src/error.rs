//! Error types for the worker pool.
//!
//! Every public operation fails with a [`PoolError`]: one struct tagged with an
//! [`ErrorKind`], so callers dispatch on the kind instead of on the type.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Classification of a failure surfaced to a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or out-of-range input.
    ValidationError,
    /// Unknown or invalid credential, or admin-token mismatch.
    AuthError,
    /// Authenticated, but lacking the lease or ownership the call needs.
    Forbidden,
    /// A referenced repository, task or worker does not exist.
    NotFound,
    /// Duplicate or state-incompatible write.
    Conflict,
    /// Store or unexpected failure.
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::AuthError => "auth_error",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::InternalError => "internal_error",
        }
    }

    /// HTTP status code used when the error crosses the HTTP boundary.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::ValidationError => 400,
            ErrorKind::AuthError => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::InternalError => 500,
        }
    }

    fn default_suggestion(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "Check request format and required fields",
            ErrorKind::AuthError => "Provide valid authentication token",
            ErrorKind::Forbidden => "Fetch work to obtain a lease before reporting on a task",
            ErrorKind::NotFound => "Resource does not exist",
            ErrorKind::Conflict => "Resource already exists or state conflict",
            ErrorKind::InternalError => "Contact support if issue persists",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error type for pool operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct PoolError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Option<String>,
    pub suggestion: Option<String>,
}

impl PoolError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
            suggestion: Some(kind.default_suggestion().to_string()),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationError, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthError, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Wire form of this error.
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            code: self.kind,
            message: self.message.clone(),
            details: self.details.clone(),
            suggestion: self.suggestion.clone(),
        }
    }
}

/// Serialisable error body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Unknown task status in {key}: {value}")]
    UnknownStatus { key: String, value: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    /// Classify a libsql failure, separating constraint violations from the rest.
    pub fn from_libsql(context: &str, err: libsql::Error) -> Self {
        let text = err.to_string();
        if text.contains("constraint failed") || text.contains("UNIQUE constraint") {
            DatabaseError::Constraint(format!("{context}: {text}"))
        } else {
            DatabaseError::Query(format!("{context}: {text}"))
        }
    }
}

impl From<DatabaseError> for PoolError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::Constraint(msg) => PoolError::conflict(msg),
            other => PoolError::internal("Store operation failed").with_details(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for PoolError {
    fn from(err: serde_json::Error) -> Self {
        PoolError::from(DatabaseError::Serialization(err.to_string()))
    }
}

/// Result type alias for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_serialize_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ValidationError).unwrap();
        assert_eq!(json, "\"validation_error\"");
        let back: ErrorKind = serde_json::from_str("\"not_found\"").unwrap();
        assert_eq!(back, ErrorKind::NotFound);
    }

    #[test]
    fn constructors_attach_default_suggestion() {
        let err = PoolError::auth("Invalid token");
        assert_eq!(err.kind, ErrorKind::AuthError);
        assert_eq!(
            err.suggestion.as_deref(),
            Some("Provide valid authentication token")
        );
        assert_eq!(err.to_string(), "auth_error: Invalid token");
    }

    #[test]
    fn forbidden_is_distinct_from_auth() {
        let err = PoolError::forbidden("No active lease for this task");
        assert_ne!(err.kind, ErrorKind::AuthError);
        assert_eq!(err.kind.http_status(), 403);
    }

    #[test]
    fn constraint_errors_become_conflicts() {
        let err: PoolError = DatabaseError::Constraint("dup".into()).into();
        assert_eq!(err.kind, ErrorKind::Conflict);

        let err: PoolError = DatabaseError::Query("boom".into()).into();
        assert_eq!(err.kind, ErrorKind::InternalError);
        assert!(err.details.unwrap().contains("boom"));
    }

    #[test]
    fn response_omits_empty_details() {
        let body = PoolError::not_found("Repository 'x' not found").to_response();
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["code"], "not_found");
        assert!(json.get("details").is_none());
    }
}
