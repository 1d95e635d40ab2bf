//! Database query functions for the `projects` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Project;

/// Insert a new project.
pub async fn insert_project(
    pool: &PgPool,
    organization_id: Uuid,
    name: &str,
    host_url: &str,
    working_dir: &str,
) -> Result<Project> {
    let project = sqlx::query_as::<_, Project>(
        "INSERT INTO projects (organization_id, name, host_url, working_dir) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(organization_id)
    .bind(name)
    .bind(host_url)
    .bind(working_dir)
    .fetch_one(pool)
    .await
    .context("failed to insert project")?;

    Ok(project)
}

/// Fetch a single project by ID.
pub async fn get_project(pool: &PgPool, id: Uuid) -> Result<Option<Project>> {
    let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch project")?;

    Ok(project)
}

/// List all projects for an organization.
pub async fn list_projects(pool: &PgPool, organization_id: Uuid) -> Result<Vec<Project>> {
    let projects = sqlx::query_as::<_, Project>(
        "SELECT * FROM projects WHERE organization_id = $1 ORDER BY created_at ASC",
    )
    .bind(organization_id)
    .fetch_all(pool)
    .await
    .context("failed to list projects")?;

    Ok(projects)
}
