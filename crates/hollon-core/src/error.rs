//! Control-plane error taxonomy.
//!
//! Retryability is data, not control flow: policy layers (the gate, the
//! escalation ladder) branch on [`CoreError::is_retryable`] rather than on
//! error sites. Store errors convert losslessly so the taxonomy stays flat
//! at the crate seam.

use thiserror::Error;

use hollon_db::error::StoreError;

/// Typed failure classes of the control plane.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Entity absent; fatal to the calling operation.
    #[error("not found: {0}")]
    NotFound(String),

    /// CAS miss; always retryable by the caller (usually on the next tick).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Tenancy or hierarchy breach; fatal, never retried.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Caller bug or data corruption; fatal, logged at error level.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// External call exceeded its budget; retryable by policy.
    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    /// External call failed deterministically; retryable by policy.
    #[error("provider error: {0}")]
    ProviderError(String),

    /// Brain output unparseable; retryable by policy.
    #[error("parse error: {0}")]
    ParseError(String),

    /// VCS host hiccup; retryable by policy.
    #[error("transient: {0}")]
    Transient(String),

    /// Cost cap hit; never retried, escalates at level 4 directly.
    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    /// Dependency cycle; fatal to the operation that introduced it.
    #[error("cycle: {0}")]
    Cycle(String),
}

impl CoreError {
    /// Whether the escalation ladder may retry after this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict(_)
                | Self::Timeout(_)
                | Self::ProviderError(_)
                | Self::ParseError(_)
                | Self::Transient(_)
        )
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => Self::NotFound(format!("{entity} {id}")),
            StoreError::Conflict {
                entity,
                id,
                expected,
                found,
            } => Self::Conflict(format!("{entity} {id}: expected {expected}, found {found}")),
            StoreError::Forbidden(msg) => Self::Forbidden(msg),
            StoreError::InvariantViolation(msg) => Self::InvariantViolation(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn retryable_classes() {
        assert!(CoreError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(CoreError::ProviderError("boom".into()).is_retryable());
        assert!(CoreError::ParseError("bad json".into()).is_retryable());
        assert!(CoreError::Transient("host unreachable".into()).is_retryable());
        assert!(CoreError::Conflict("cas miss".into()).is_retryable());
    }

    #[test]
    fn fatal_classes() {
        assert!(!CoreError::NotFound("task".into()).is_retryable());
        assert!(!CoreError::Forbidden("cross-tenant".into()).is_retryable());
        assert!(!CoreError::InvariantViolation("depth".into()).is_retryable());
        assert!(!CoreError::BudgetExceeded("daily cap".into()).is_retryable());
        assert!(!CoreError::Cycle("a -> b -> a".into()).is_retryable());
    }

    #[test]
    fn store_errors_convert() {
        let err: CoreError = StoreError::Forbidden("nope".into()).into();
        assert!(matches!(err, CoreError::Forbidden(_)));
    }
}
