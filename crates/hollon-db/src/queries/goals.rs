//! Database query functions for the `goals` table.

use anyhow::{Context, Result};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::{Goal, GoalStatus, Task};
use crate::queries::tasks::NewTask;

/// Parameters for inserting a new goal.
#[derive(Debug, Clone)]
pub struct NewGoal {
    pub organization_id: Uuid,
    pub project_id: Uuid,
    pub owner_agent_id: Uuid,
    pub title: String,
    pub description: String,
    pub success_criteria: Vec<String>,
}

/// Insert a new goal. Goals start `active` with `decomposed = false`; the
/// next decompose tick picks them up.
pub async fn insert_goal(pool: &PgPool, new: &NewGoal) -> Result<Goal> {
    let goal = sqlx::query_as::<_, Goal>(
        "INSERT INTO goals \
             (organization_id, project_id, owner_agent_id, title, description, success_criteria) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING *",
    )
    .bind(new.organization_id)
    .bind(new.project_id)
    .bind(new.owner_agent_id)
    .bind(&new.title)
    .bind(&new.description)
    .bind(&new.success_criteria)
    .fetch_one(pool)
    .await
    .context("failed to insert goal")?;

    Ok(goal)
}

/// Fetch a single goal by ID.
pub async fn get_goal(pool: &PgPool, id: Uuid) -> Result<Option<Goal>> {
    let goal = sqlx::query_as::<_, Goal>("SELECT * FROM goals WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch goal")?;

    Ok(goal)
}

/// Goals awaiting decomposition: `decomposed = false`, status `active`.
pub async fn list_undecomposed_goals(pool: &PgPool) -> Result<Vec<Goal>> {
    let goals = sqlx::query_as::<_, Goal>(
        "SELECT * FROM goals \
         WHERE decomposed = false AND status = 'active' \
         ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list undecomposed goals")?;

    Ok(goals)
}

/// Atomically flip `decomposed` false -> true and create the goal's epic
/// tasks in the same transaction.
///
/// The CAS and the inserts commit together, so at no observable instant
/// does a goal with `decomposed = false` have children, or a goal with
/// `decomposed = true` have none. Returns `None` when another
/// decomposition already won the CAS (the inserts are then skipped
/// entirely -- double decomposition is impossible).
pub async fn mark_decomposed_with_epics(
    pool: &PgPool,
    goal_id: Uuid,
    epics: &[NewTask],
) -> Result<Option<Vec<Task>>> {
    let mut tx: Transaction<'_, Postgres> = pool
        .begin()
        .await
        .context("failed to begin decomposition transaction")?;

    let flipped = sqlx::query(
        "UPDATE goals SET decomposed = true, status = 'decomposed' \
         WHERE id = $1 AND decomposed = false",
    )
    .bind(goal_id)
    .execute(&mut *tx)
    .await
    .context("failed to flip goal decomposed flag")?;

    if flipped.rows_affected() == 0 {
        tx.rollback().await.ok();
        return Ok(None);
    }

    let mut created = Vec::with_capacity(epics.len());
    for epic in epics {
        let task = sqlx::query_as::<_, Task>(
            "INSERT INTO tasks \
                 (project_id, goal_id, assigned_team_id, task_type, priority, \
                  title, description, acceptance_criteria) \
             VALUES ($1, $2, $3, 'team_epic', $4, $5, $6, $7) \
             RETURNING *",
        )
        .bind(epic.project_id)
        .bind(goal_id)
        .bind(epic.assigned_team_id)
        .bind(epic.priority)
        .bind(&epic.title)
        .bind(&epic.description)
        .bind(&epic.acceptance_criteria)
        .fetch_one(&mut *tx)
        .await
        .with_context(|| format!("failed to insert epic {:?}", epic.title))?;
        created.push(task);
    }

    tx.commit()
        .await
        .context("failed to commit decomposition transaction")?;

    Ok(Some(created))
}

/// Increment the decompose retry counter, recording the parse error.
/// Returns the new counter value.
pub async fn bump_decompose_retry(pool: &PgPool, id: Uuid, error: &str) -> Result<i32> {
    let row: (i32,) = sqlx::query_as(
        "UPDATE goals \
         SET decompose_retry_count = decompose_retry_count + 1, error_message = $1 \
         WHERE id = $2 \
         RETURNING decompose_retry_count",
    )
    .bind(error)
    .bind(id)
    .fetch_one(pool)
    .await
    .context("failed to bump goal decompose retry counter")?;

    Ok(row.0)
}

/// Update the status of a goal; stamps `completed_at` for terminal states.
pub async fn update_goal_status(pool: &PgPool, id: Uuid, status: GoalStatus) -> Result<()> {
    let completed = matches!(
        status,
        GoalStatus::Completed | GoalStatus::Abandoned | GoalStatus::Failed
    );
    let result = sqlx::query(
        "UPDATE goals \
         SET status = $1, \
             completed_at = CASE WHEN $2 THEN now() ELSE completed_at END \
         WHERE id = $3",
    )
    .bind(status)
    .bind(completed)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update goal status")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("goal {id} not found");
    }

    Ok(())
}

/// Decomposed goals that are not yet terminal, for the completion sweep.
pub async fn list_open_decomposed_goals(pool: &PgPool) -> Result<Vec<Goal>> {
    let goals = sqlx::query_as::<_, Goal>(
        "SELECT * FROM goals WHERE decomposed = true AND status = 'decomposed' \
         ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list open decomposed goals")?;

    Ok(goals)
}
