//! Task pool -- the claiming protocol policy wrapper.
//!
//! The heavy lifting (serializable candidate selection, file-conflict
//! exclusion, dependency checks, the claim CAS) lives in the store's
//! [`hollon_db::queries::tasks::claim_ready_task`]. This layer resolves the
//! agent's capability set from its role, normalizes tags, and translates a
//! CAS miss into "nothing to do this tick".

use anyhow::Result;
use sqlx::PgPool;

use hollon_db::models::{Agent, Task};
use hollon_db::queries::{roles, tasks};

use crate::error::CoreError;

/// Claim the best eligible task for an agent, or `None` when nothing is
/// eligible this tick.
///
/// Idempotent for an agent already at its concurrency limit: the held task
/// is returned unchanged. A CAS miss inside the store is not an error --
/// the control loop simply tries again on the next tick.
pub async fn claim(pool: &PgPool, agent: &Agent) -> Result<Option<Task>> {
    let capabilities = agent_capabilities(pool, agent).await?;

    tasks::claim_ready_task(
        pool,
        agent.id,
        agent.organization_id,
        &capabilities,
        agent.max_concurrent_tasks,
    )
    .await
}

/// The agent's capability set: the union of its role's tags, normalized for
/// case-insensitive set containment.
pub async fn agent_capabilities(pool: &PgPool, agent: &Agent) -> Result<Vec<String>> {
    let role = roles::get_role(pool, agent.role_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("role {}", agent.role_id)))?;

    let mut capabilities: Vec<String> = role
        .capabilities
        .iter()
        .map(|c| roles::normalize_capability(c))
        .collect();
    capabilities.sort_unstable();
    capabilities.dedup();
    Ok(capabilities)
}
