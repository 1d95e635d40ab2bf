//! Database query functions for the `teams` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Team;

/// Insert a new team.
pub async fn insert_team(
    pool: &PgPool,
    organization_id: Uuid,
    name: &str,
    parent_team_id: Option<Uuid>,
    description_prompt: &str,
) -> Result<Team> {
    let team = sqlx::query_as::<_, Team>(
        "INSERT INTO teams (organization_id, name, parent_team_id, description_prompt) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(organization_id)
    .bind(name)
    .bind(parent_team_id)
    .bind(description_prompt)
    .fetch_one(pool)
    .await
    .context("failed to insert team")?;

    Ok(team)
}

/// Fetch a single team by ID.
pub async fn get_team(pool: &PgPool, id: Uuid) -> Result<Option<Team>> {
    let team = sqlx::query_as::<_, Team>("SELECT * FROM teams WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch team")?;

    Ok(team)
}

/// Find a team by name within an organization (case-insensitive). Used when
/// resolving team references in brain-produced decomposition plans.
pub async fn find_team_by_name(
    pool: &PgPool,
    organization_id: Uuid,
    name: &str,
) -> Result<Option<Team>> {
    let team = sqlx::query_as::<_, Team>(
        "SELECT * FROM teams WHERE organization_id = $1 AND lower(name) = lower($2)",
    )
    .bind(organization_id)
    .bind(name)
    .fetch_optional(pool)
    .await
    .context("failed to find team by name")?;

    Ok(team)
}

/// List all teams in an organization, by name.
pub async fn list_teams(pool: &PgPool, organization_id: Uuid) -> Result<Vec<Team>> {
    let teams = sqlx::query_as::<_, Team>(
        "SELECT * FROM teams WHERE organization_id = $1 ORDER BY name",
    )
    .bind(organization_id)
    .fetch_all(pool)
    .await
    .context("failed to list teams")?;

    Ok(teams)
}

/// Set (or clear) the team's manager agent.
pub async fn set_manager(pool: &PgPool, team_id: Uuid, manager_agent_id: Option<Uuid>) -> Result<()> {
    let result = sqlx::query("UPDATE teams SET manager_agent_id = $1 WHERE id = $2")
        .bind(manager_agent_id)
        .bind(team_id)
        .execute(pool)
        .await
        .context("failed to set team manager")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("team {team_id} not found");
    }

    Ok(())
}

/// Walk the team tree from the given team up to its root.
///
/// Returns the chain **root-first**, ending with the given team -- the order
/// the prompt composer joins description prompts in. Cycles in parent links
/// would be a data-corruption bug; the walk is bounded to 32 hops to turn
/// that into an error instead of a hang.
pub async fn team_chain_root_first(pool: &PgPool, team_id: Uuid) -> Result<Vec<Team>> {
    let mut chain = Vec::new();
    let mut cursor = Some(team_id);
    let mut hops = 0;

    while let Some(id) = cursor {
        hops += 1;
        if hops > 32 {
            anyhow::bail!("team parent chain for {team_id} exceeds 32 hops; cycle suspected");
        }
        let team = get_team(pool, id)
            .await?
            .with_context(|| format!("team {id} not found while walking chain"))?;
        cursor = team.parent_team_id;
        chain.push(team);
    }

    chain.reverse();
    Ok(chain)
}
