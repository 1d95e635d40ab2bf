//! Database query functions for the `organizations` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Organization;

/// Parameters for inserting a new organization.
#[derive(Debug, Clone)]
pub struct NewOrganization {
    pub name: String,
    pub context_prompt: String,
    pub daily_cost_cap_sub_cents: i64,
    pub monthly_cost_cap_sub_cents: i64,
    pub max_concurrent_agents: i32,
}

/// Insert a new organization row. Returns the inserted row with
/// server-generated defaults (id, created_at, autonomous_execution_enabled).
pub async fn insert_organization(pool: &PgPool, new: &NewOrganization) -> Result<Organization> {
    let org = sqlx::query_as::<_, Organization>(
        "INSERT INTO organizations \
             (name, context_prompt, daily_cost_cap_sub_cents, \
              monthly_cost_cap_sub_cents, max_concurrent_agents) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(&new.name)
    .bind(&new.context_prompt)
    .bind(new.daily_cost_cap_sub_cents)
    .bind(new.monthly_cost_cap_sub_cents)
    .bind(new.max_concurrent_agents)
    .fetch_one(pool)
    .await
    .context("failed to insert organization")?;

    Ok(org)
}

/// Fetch a single organization by ID.
pub async fn get_organization(pool: &PgPool, id: Uuid) -> Result<Option<Organization>> {
    let org = sqlx::query_as::<_, Organization>("SELECT * FROM organizations WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch organization")?;

    Ok(org)
}

/// List all organizations, oldest first.
pub async fn list_organizations(pool: &PgPool) -> Result<Vec<Organization>> {
    let orgs =
        sqlx::query_as::<_, Organization>("SELECT * FROM organizations ORDER BY created_at ASC")
            .fetch_all(pool)
            .await
            .context("failed to list organizations")?;

    Ok(orgs)
}

/// Set the autonomous-execution flag.
///
/// Disabling is the emergency stop and records the reason; enabling clears
/// nothing (the last stop reason is kept for the audit trail). Idempotent:
/// setting the flag to its current value affects the row but changes no
/// observable state.
pub async fn set_autonomous_execution(
    pool: &PgPool,
    id: Uuid,
    enabled: bool,
    reason: Option<&str>,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE organizations \
         SET autonomous_execution_enabled = $1, \
             last_stop_reason = CASE WHEN $1 THEN last_stop_reason ELSE COALESCE($2, last_stop_reason) END \
         WHERE id = $3",
    )
    .bind(enabled)
    .bind(reason)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to set autonomous execution flag")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("organization {id} not found");
    }

    Ok(())
}
