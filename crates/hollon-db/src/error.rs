//! Store error taxonomy.
//!
//! Query functions return `anyhow::Result`; operations whose failure class
//! matters to callers (CAS transitions, tenancy checks, invariant guards)
//! attach a [`StoreError`] so policy layers can downcast and branch on it.

use thiserror::Error;
use uuid::Uuid;

/// Typed failure classes surfaced by the store gateway.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Entity absent. Fatal to the calling operation.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    /// Optimistic-lock miss: the row's current state did not match the
    /// caller's expectation. Always retryable by the caller.
    #[error("conflict on {entity} {id}: expected {expected}, found {found}")]
    Conflict {
        entity: &'static str,
        id: Uuid,
        expected: String,
        found: String,
    },

    /// Cross-tenant or hierarchy breach. Fatal, never retried.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Caller bug or data corruption, e.g. a cyclic dependency insert or a
    /// depth-cap violation. Fatal.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl StoreError {
    /// Whether the caller may retry the operation after observing this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}
