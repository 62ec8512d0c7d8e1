//! Uniform error type surfaced across the permission engine, overlay
//! filesystem, and sandbox lifecycle manager.
//!
//! Mirrors the categorized `thiserror` enum the teacher uses for subsystem
//! errors (see the jailer module): one flat enum that callers can match on
//! by kind, with `#[from]` conversions from the lower-level error types that
//! feed into it.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type AgentFenseResult<T> = Result<T, AgentFenseError>;

/// Error kinds surfaced uniformly to callers (spec §7).
///
/// Every variant carries enough context to explain the failure without ever
/// leaking a host filesystem path: paths attached to errors are always
/// codebase-relative.
#[derive(Debug, Error, Clone)]
pub enum AgentFenseError {
    /// Sandbox, codebase, session, or file absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Lifecycle transition not legal from the current state.
    #[error("invalid status: {0}")]
    InvalidStatus(String),

    /// Permission engine refused the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// File present in the lower layer but hidden by a `none` rule.
    ///
    /// Distinct from [`AgentFenseError::NotFound`] only for logging/metrics;
    /// callers should treat it identically to not-found (spec §7).
    #[error("not visible: {0}")]
    NotVisible(String),

    /// Rule pattern malformed (e.g. unbalanced bracket in a glob).
    #[error("invalid pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Exec or lifecycle operation exceeded its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Caller aborted the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Lower or upper store I/O failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// Resource exhausted (e.g. delta store out of disk).
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    /// Internal invariant violation; never expected in normal operation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AgentFenseError {
    /// Build a not-found error for a codebase-relative path.
    pub fn not_found(rel_path: impl Into<PathBuf>) -> Self {
        Self::NotFound(rel_path.into().display().to_string())
    }

    /// Build a not-visible error for a codebase-relative path.
    pub fn not_visible(rel_path: impl Into<PathBuf>) -> Self {
        Self::NotVisible(rel_path.into().display().to_string())
    }

    /// Build a permission-denied error for a codebase-relative path and the
    /// operation that was refused.
    pub fn permission_denied(rel_path: impl Into<PathBuf>, operation: &str) -> Self {
        Self::PermissionDenied(format!(
            "{} requires more than the effective permission on {}",
            operation,
            rel_path.into().display()
        ))
    }

    /// Returns true if this error kind is worth retrying under the
    /// transient-I/O retry policy (spec §7: up to three retries, 100ms base
    /// exponential backoff).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Capacity(_))
    }
}

impl From<std::io::Error> for AgentFenseError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(AgentFenseError::Io("disk error".into()).is_transient());
        assert!(AgentFenseError::Capacity("full".into()).is_transient());
        assert!(!AgentFenseError::NotFound("x".into()).is_transient());
    }

    #[test]
    fn not_found_uses_relative_path_only() {
        let err = AgentFenseError::not_found(PathBuf::from("src/main.rs"));
        assert_eq!(err.to_string(), "not found: src/main.rs");
    }
}
