//! External VCS host gateway.
//!
//! The control plane treats the host as eventually consistent with the
//! store: branches are pushed, reviews opened and merged, and CI status is
//! polled and reconciled on the review loop's tick. Only the minimal opaque
//! operations the spec requires are modeled.

pub mod local;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::CoreError;

/// A review opened on the host: external number plus browse URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewRef {
    pub number: i64,
    pub url: String,
}

/// CI status of a review's branch as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CiStatus {
    Pending,
    Passing,
    Failing { summary: String },
}

/// Adapter interface for the external VCS host.
///
/// Transient connectivity failures surface as [`CoreError::Transient`] and
/// are retried by policy, not by the gateway.
#[async_trait]
pub trait VcsHost: Send + Sync {
    /// Push a branch and open a review for it.
    ///
    /// Idempotent: publishing a branch whose review already exists returns
    /// the existing reference.
    async fn publish(
        &self,
        project_id: Uuid,
        branch: &str,
        title: &str,
    ) -> Result<ReviewRef, CoreError>;

    /// Merge an open review. A failing required check on the host surfaces
    /// as `Transient` so the caller records it as a CI failure and retries
    /// through re-execution.
    async fn merge(&self, project_id: Uuid, review_number: i64) -> Result<(), CoreError>;

    /// Read the CI status for a review.
    async fn ci_status(&self, project_id: Uuid, review_number: i64) -> Result<CiStatus, CoreError>;

    /// Close a review without merging.
    async fn close_review(&self, project_id: Uuid, review_number: i64) -> Result<(), CoreError>;
}

// Compile-time assertion: VcsHost must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn VcsHost) {}
};
