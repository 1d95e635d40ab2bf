//! Database query functions for the `roles` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Role;

/// Normalize a capability tag for case-insensitive set containment.
pub fn normalize_capability(tag: &str) -> String {
    tag.trim().to_lowercase()
}

/// Insert a new role. Capability tags are normalized (trimmed, lowercased)
/// at insert time so the claim query can use plain array containment.
pub async fn insert_role(
    pool: &PgPool,
    organization_id: Uuid,
    name: &str,
    system_prompt: &str,
    capabilities: &[String],
    transient_eligible: bool,
) -> Result<Role> {
    let normalized: Vec<String> = capabilities
        .iter()
        .map(|c| normalize_capability(c))
        .collect();

    let role = sqlx::query_as::<_, Role>(
        "INSERT INTO roles (organization_id, name, system_prompt, capabilities, transient_eligible) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(organization_id)
    .bind(name)
    .bind(system_prompt)
    .bind(&normalized)
    .bind(transient_eligible)
    .fetch_one(pool)
    .await
    .context("failed to insert role")?;

    Ok(role)
}

/// Fetch a single role by ID.
pub async fn get_role(pool: &PgPool, id: Uuid) -> Result<Option<Role>> {
    let role = sqlx::query_as::<_, Role>("SELECT * FROM roles WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch role")?;

    Ok(role)
}

/// Find a role by name within an organization (case-insensitive).
pub async fn find_role_by_name(
    pool: &PgPool,
    organization_id: Uuid,
    name: &str,
) -> Result<Option<Role>> {
    let role = sqlx::query_as::<_, Role>(
        "SELECT * FROM roles WHERE organization_id = $1 AND lower(name) = lower($2)",
    )
    .bind(organization_id)
    .bind(name)
    .fetch_optional(pool)
    .await
    .context("failed to find role by name")?;

    Ok(role)
}

/// Replace a role's capability set. Roles are otherwise immutable after
/// creation.
pub async fn update_capabilities(pool: &PgPool, id: Uuid, capabilities: &[String]) -> Result<()> {
    let normalized: Vec<String> = capabilities
        .iter()
        .map(|c| normalize_capability(c))
        .collect();

    let result = sqlx::query("UPDATE roles SET capabilities = $1 WHERE id = $2")
        .bind(&normalized)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to update role capabilities")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("role {id} not found");
    }

    Ok(())
}

/// Roles in an organization flagged as eligible for transient-agent creation
/// whose name matches the given review class keyword.
pub async fn find_transient_eligible_by_keyword(
    pool: &PgPool,
    organization_id: Uuid,
    keyword: &str,
) -> Result<Option<Role>> {
    let role = sqlx::query_as::<_, Role>(
        "SELECT * FROM roles \
         WHERE organization_id = $1 \
           AND transient_eligible \
           AND lower(name) LIKE '%' || lower($2) || '%' \
         ORDER BY created_at ASC \
         LIMIT 1",
    )
    .bind(organization_id)
    .bind(keyword)
    .fetch_optional(pool)
    .await
    .context("failed to find transient-eligible role")?;

    Ok(role)
}
