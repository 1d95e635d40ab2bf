//! Database query functions for the `escalations` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Escalation;

/// Insert a new task-scoped escalation record.
pub async fn insert_escalation(
    pool: &PgPool,
    task_id: Uuid,
    level: i32,
    reason: &str,
    requested_by_agent_id: Option<Uuid>,
) -> Result<Escalation> {
    let esc = sqlx::query_as::<_, Escalation>(
        "INSERT INTO escalations (task_id, level, reason, requested_by_agent_id) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(level)
    .bind(reason)
    .bind(requested_by_agent_id)
    .fetch_one(pool)
    .await
    .context("failed to insert escalation")?;

    Ok(esc)
}

/// Insert an organization-level escalation record (no task), e.g. a tripped
/// cost cap.
pub async fn insert_org_escalation(
    pool: &PgPool,
    organization_id: Uuid,
    level: i32,
    reason: &str,
) -> Result<Escalation> {
    let esc = sqlx::query_as::<_, Escalation>(
        "INSERT INTO escalations (organization_id, level, reason) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(organization_id)
    .bind(level)
    .bind(reason)
    .fetch_one(pool)
    .await
    .context("failed to insert organization escalation")?;

    Ok(esc)
}

/// Fetch a single escalation by ID.
pub async fn get_escalation(pool: &PgPool, id: Uuid) -> Result<Option<Escalation>> {
    let esc = sqlx::query_as::<_, Escalation>("SELECT * FROM escalations WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch escalation")?;

    Ok(esc)
}

/// Record a resolution on an escalation. `resolver_agent_id` is null for a
/// human decision.
pub async fn resolve_escalation(
    pool: &PgPool,
    id: Uuid,
    resolver_agent_id: Option<Uuid>,
    decision: &str,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE escalations \
         SET resolver_agent_id = $1, decision = $2, decided_at = now() \
         WHERE id = $3 AND decided_at IS NULL",
    )
    .bind(resolver_agent_id)
    .bind(decision)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to resolve escalation")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("escalation {id} not found or already decided");
    }

    Ok(())
}

/// The escalation chain for a task, oldest first. This is what humans see
/// next to a failed or blocked task.
pub async fn list_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<Escalation>> {
    let escalations = sqlx::query_as::<_, Escalation>(
        "SELECT * FROM escalations WHERE task_id = $1 ORDER BY created_at ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list escalations for task")?;

    Ok(escalations)
}

/// Undecided level-3 (manager) escalations, oldest first.
pub async fn list_pending_manager_escalations(pool: &PgPool) -> Result<Vec<Escalation>> {
    let escalations = sqlx::query_as::<_, Escalation>(
        "SELECT * FROM escalations \
         WHERE level = 3 AND task_id IS NOT NULL AND decided_at IS NULL \
         ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list pending manager escalations")?;

    Ok(escalations)
}

/// Organization-level escalations (cost-cap trips), oldest first.
pub async fn list_for_organization(
    pool: &PgPool,
    organization_id: Uuid,
) -> Result<Vec<Escalation>> {
    let escalations = sqlx::query_as::<_, Escalation>(
        "SELECT * FROM escalations WHERE organization_id = $1 ORDER BY created_at ASC",
    )
    .bind(organization_id)
    .fetch_all(pool)
    .await
    .context("failed to list organization escalations")?;

    Ok(escalations)
}

/// Undecided task-scoped level-4 escalations older than the given age in
/// hours. These feed the level-5 terminal sweep (default window 48 h).
pub async fn list_stale_human_escalations(
    pool: &PgPool,
    older_than_hours: i64,
) -> Result<Vec<Escalation>> {
    let escalations = sqlx::query_as::<_, Escalation>(
        "SELECT * FROM escalations \
         WHERE level = 4 \
           AND task_id IS NOT NULL \
           AND decided_at IS NULL \
           AND created_at < now() - make_interval(hours => $1::int) \
         ORDER BY created_at ASC",
    )
    .bind(older_than_hours as i32)
    .fetch_all(pool)
    .await
    .context("failed to list stale human escalations")?;

    Ok(escalations)
}
