//! Database query functions for the `agents` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Agent, AgentStatus};

/// Parameters for inserting a new permanent agent.
#[derive(Debug, Clone)]
pub struct NewAgent {
    pub organization_id: Uuid,
    pub team_id: Uuid,
    pub role_id: Uuid,
    pub name: String,
    pub brain_provider: String,
    pub custom_prompt: Option<String>,
    pub max_concurrent_tasks: i32,
}

/// Insert a new permanent agent at depth 0.
pub async fn insert_agent(pool: &PgPool, new: &NewAgent) -> Result<Agent> {
    let agent = sqlx::query_as::<_, Agent>(
        "INSERT INTO agents \
             (organization_id, team_id, role_id, name, brain_provider, \
              custom_prompt, max_concurrent_tasks) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING *",
    )
    .bind(new.organization_id)
    .bind(new.team_id)
    .bind(new.role_id)
    .bind(&new.name)
    .bind(&new.brain_provider)
    .bind(&new.custom_prompt)
    .bind(new.max_concurrent_tasks)
    .fetch_one(pool)
    .await
    .context("failed to insert agent")?;

    Ok(agent)
}

/// Insert a transient agent created by `creator`.
///
/// The depth is pre-computed as creator depth + 1 and hard-capped at 3;
/// exceeding the cap is an invariant violation, not a retryable failure.
pub async fn insert_transient_agent(
    pool: &PgPool,
    creator: &Agent,
    role_id: Uuid,
    name: &str,
    brain_provider: &str,
) -> Result<Agent> {
    let depth = creator.depth + 1;
    if depth > 3 {
        return Err(StoreError::InvariantViolation(format!(
            "transient agent depth {depth} exceeds cap 3 (creator {})",
            creator.id
        ))
        .into());
    }

    let agent = sqlx::query_as::<_, Agent>(
        "INSERT INTO agents \
             (organization_id, team_id, role_id, name, brain_provider, \
              lifecycle, creator_agent_id, depth) \
         VALUES ($1, $2, $3, $4, $5, 'transient', $6, $7) \
         RETURNING *",
    )
    .bind(creator.organization_id)
    .bind(creator.team_id)
    .bind(role_id)
    .bind(name)
    .bind(brain_provider)
    .bind(creator.id)
    .bind(depth)
    .fetch_one(pool)
    .await
    .context("failed to insert transient agent")?;

    Ok(agent)
}

/// Fetch a single agent by ID.
pub async fn get_agent(pool: &PgPool, id: Uuid) -> Result<Option<Agent>> {
    let agent = sqlx::query_as::<_, Agent>("SELECT * FROM agents WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch agent")?;

    Ok(agent)
}

/// Find an agent by name within an organization (case-insensitive). Used
/// when resolving assignees in brain-produced decomposition plans.
pub async fn find_agent_by_name(
    pool: &PgPool,
    organization_id: Uuid,
    name: &str,
) -> Result<Option<Agent>> {
    let agent = sqlx::query_as::<_, Agent>(
        "SELECT * FROM agents WHERE organization_id = $1 AND lower(name) = lower($2)",
    )
    .bind(organization_id)
    .bind(name)
    .fetch_optional(pool)
    .await
    .context("failed to find agent by name")?;

    Ok(agent)
}

/// List all agents on a team.
pub async fn list_team_agents(pool: &PgPool, team_id: Uuid) -> Result<Vec<Agent>> {
    let agents = sqlx::query_as::<_, Agent>(
        "SELECT * FROM agents WHERE team_id = $1 ORDER BY created_at ASC",
    )
    .bind(team_id)
    .fetch_all(pool)
    .await
    .context("failed to list team agents")?;

    Ok(agents)
}

/// Atomically transition an agent's status with an optimistic lock on the
/// prior status. Returns `StoreError::Conflict` on a CAS miss.
pub async fn set_agent_status(
    pool: &PgPool,
    id: Uuid,
    from: AgentStatus,
    to: AgentStatus,
) -> Result<()> {
    let result = sqlx::query("UPDATE agents SET status = $1 WHERE id = $2 AND status = $3")
        .bind(to)
        .bind(id)
        .bind(from)
        .execute(pool)
        .await
        .context("failed to set agent status")?;

    if result.rows_affected() == 0 {
        let agent = get_agent(pool, id).await?;
        return match agent {
            None => Err(StoreError::NotFound {
                entity: "agent",
                id,
            }
            .into()),
            Some(a) => Err(StoreError::Conflict {
                entity: "agent",
                id,
                expected: from.to_string(),
                found: a.status.to_string(),
            }
            .into()),
        };
    }

    Ok(())
}

/// Set the agent's current task (or clear it with `None`).
///
/// This is a lookup reference only; task ownership is decided by the claim
/// CAS on the tasks table.
pub async fn set_current_task(pool: &PgPool, id: Uuid, task_id: Option<Uuid>) -> Result<()> {
    let result = sqlx::query("UPDATE agents SET current_task_id = $1 WHERE id = $2")
        .bind(task_id)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to set agent current task")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("agent {id} not found");
    }

    Ok(())
}

/// Idle agents in an organization, oldest first.
pub async fn list_idle_agents(pool: &PgPool, organization_id: Uuid) -> Result<Vec<Agent>> {
    let agents = sqlx::query_as::<_, Agent>(
        "SELECT * FROM agents \
         WHERE organization_id = $1 AND status = 'idle' \
         ORDER BY created_at ASC",
    )
    .bind(organization_id)
    .fetch_all(pool)
    .await
    .context("failed to list idle agents")?;

    Ok(agents)
}

/// All agents currently in `reviewing`, across organizations. The review
/// loop uses this to drift settled reviewers back to idle.
pub async fn list_reviewing_agents(pool: &PgPool) -> Result<Vec<Agent>> {
    let agents = sqlx::query_as::<_, Agent>("SELECT * FROM agents WHERE status = 'reviewing'")
        .fetch_all(pool)
        .await
        .context("failed to list reviewing agents")?;

    Ok(agents)
}

/// Count agents currently occupying concurrency slots (working or blocked).
pub async fn count_active_agents(pool: &PgPool, organization_id: Uuid) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM agents \
         WHERE organization_id = $1 AND status IN ('working', 'blocked')",
    )
    .bind(organization_id)
    .fetch_one(pool)
    .await
    .context("failed to count active agents")?;

    Ok(row.0)
}

/// Idle team peers of `agent` (same team, excluding the agent itself) whose
/// role capabilities overlap the given set. Used by the teammate-retry and
/// reviewer-selection paths.
pub async fn find_capable_peers(
    pool: &PgPool,
    agent: &Agent,
    capabilities: &[String],
) -> Result<Vec<Agent>> {
    let agents = sqlx::query_as::<_, Agent>(
        "SELECT a.* FROM agents a \
         JOIN roles r ON r.id = a.role_id \
         WHERE a.team_id = $1 \
           AND a.id <> $2 \
           AND a.status = 'idle' \
           AND ($3::text[] = '{}' OR r.capabilities && $3) \
         ORDER BY a.created_at ASC",
    )
    .bind(agent.team_id)
    .bind(agent.id)
    .bind(capabilities)
    .fetch_all(pool)
    .await
    .context("failed to find capable peers")?;

    Ok(agents)
}

/// Record a terminal task outcome in the agent's performance counters.
pub async fn record_task_outcome(
    pool: &PgPool,
    id: Uuid,
    completed: bool,
    duration_ms: i64,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE agents \
         SET tasks_completed = tasks_completed + CASE WHEN $1 THEN 1 ELSE 0 END, \
             tasks_failed = tasks_failed + CASE WHEN $1 THEN 0 ELSE 1 END, \
             total_duration_ms = total_duration_ms + CASE WHEN $1 THEN $2 ELSE 0 END \
         WHERE id = $3",
    )
    .bind(completed)
    .bind(duration_ms)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to record task outcome")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("agent {id} not found");
    }

    Ok(())
}

/// Transient descendants of `creator`, deepest first so they can be marked
/// offline (and later swept) without dangling creator references.
pub async fn list_transient_descendants(pool: &PgPool, creator_id: Uuid) -> Result<Vec<Agent>> {
    let agents = sqlx::query_as::<_, Agent>(
        "WITH RECURSIVE descendants AS ( \
             SELECT * FROM agents WHERE creator_agent_id = $1 AND lifecycle = 'transient' \
             UNION ALL \
             SELECT a.* FROM agents a \
             JOIN descendants d ON a.creator_agent_id = d.id \
             WHERE a.lifecycle = 'transient' \
         ) \
         SELECT * FROM descendants ORDER BY depth DESC",
    )
    .bind(creator_id)
    .fetch_all(pool)
    .await
    .context("failed to list transient descendants")?;

    Ok(agents)
}

/// Retire every transient descendant of `creator` in one statement. Returns
/// the number of agents retired.
pub async fn retire_transient_descendants(pool: &PgPool, creator_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "WITH RECURSIVE descendants AS ( \
             SELECT id FROM agents WHERE creator_agent_id = $1 AND lifecycle = 'transient' \
             UNION ALL \
             SELECT a.id FROM agents a \
             JOIN descendants d ON a.creator_agent_id = d.id \
             WHERE a.lifecycle = 'transient' \
         ) \
         UPDATE agents SET status = 'offline', current_task_id = NULL \
         WHERE id IN (SELECT id FROM descendants) AND status <> 'offline'",
    )
    .bind(creator_id)
    .execute(pool)
    .await
    .context("failed to retire transient descendants")?;

    Ok(result.rows_affected())
}

/// Retire a transient agent: mark it offline and detach its current task.
///
/// Rows are kept (execution records reference them); `offline` removes the
/// agent from every scheduling query.
pub async fn retire_transient_agent(pool: &PgPool, id: Uuid) -> Result<()> {
    let result = sqlx::query(
        "UPDATE agents SET status = 'offline', current_task_id = NULL \
         WHERE id = $1 AND lifecycle = 'transient'",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to retire transient agent")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("transient agent {id} not found");
    }

    Ok(())
}
