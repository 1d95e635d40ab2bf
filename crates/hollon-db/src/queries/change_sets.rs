//! Database query functions for the `change_sets` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{ChangeSet, ChangeSetStatus};

/// Insert a new change-set in `draft` status.
///
/// Idempotent per task: when an open (non-closed, non-merged) change-set
/// already exists for the task, that row is returned instead of creating a
/// duplicate -- publishing a sandbox whose change-set exists must return the
/// existing reference.
pub async fn insert_change_set(
    pool: &PgPool,
    task_id: Uuid,
    project_id: Uuid,
    branch_name: &str,
    author_agent_id: Uuid,
) -> Result<ChangeSet> {
    if let Some(existing) = find_open_for_task(pool, task_id).await? {
        return Ok(existing);
    }

    let cs = sqlx::query_as::<_, ChangeSet>(
        "INSERT INTO change_sets (task_id, project_id, branch_name, author_agent_id) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(project_id)
    .bind(branch_name)
    .bind(author_agent_id)
    .fetch_one(pool)
    .await
    .context("failed to insert change-set")?;

    Ok(cs)
}

/// Fetch a single change-set by ID.
pub async fn get_change_set(pool: &PgPool, id: Uuid) -> Result<Option<ChangeSet>> {
    let cs = sqlx::query_as::<_, ChangeSet>("SELECT * FROM change_sets WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch change-set")?;

    Ok(cs)
}

/// The open change-set for a task, if any (not merged, not closed).
pub async fn find_open_for_task(pool: &PgPool, task_id: Uuid) -> Result<Option<ChangeSet>> {
    let cs = sqlx::query_as::<_, ChangeSet>(
        "SELECT * FROM change_sets \
         WHERE task_id = $1 AND status NOT IN ('merged', 'closed') \
         ORDER BY created_at DESC \
         LIMIT 1",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .context("failed to find open change-set for task")?;

    Ok(cs)
}

/// All change-sets for a task, newest first. The CI retry loop creates a
/// fresh change-set per re-execution, so history accumulates here.
pub async fn list_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<ChangeSet>> {
    let sets = sqlx::query_as::<_, ChangeSet>(
        "SELECT * FROM change_sets WHERE task_id = $1 ORDER BY created_at DESC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list change-sets for task")?;

    Ok(sets)
}

/// Change-sets the CI poller watches: `ready_for_review` or `approved`.
pub async fn list_ci_watchable(pool: &PgPool) -> Result<Vec<ChangeSet>> {
    let sets = sqlx::query_as::<_, ChangeSet>(
        "SELECT * FROM change_sets \
         WHERE status IN ('ready_for_review', 'approved') \
         ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list CI-watchable change-sets")?;

    Ok(sets)
}

/// Atomically transition a change-set's status with an optimistic lock on
/// the prior status. Stamps `approved_at` / `merged_at` as appropriate.
pub async fn set_status(
    pool: &PgPool,
    id: Uuid,
    from: ChangeSetStatus,
    to: ChangeSetStatus,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE change_sets \
         SET status = $1, \
             approved_at = CASE WHEN $1 = 'approved' THEN now() ELSE approved_at END, \
             merged_at = CASE WHEN $1 = 'merged' THEN now() ELSE merged_at END \
         WHERE id = $2 AND status = $3",
    )
    .bind(to)
    .bind(id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to set change-set status")?;

    if result.rows_affected() == 0 {
        let cs = get_change_set(pool, id).await?;
        return match cs {
            None => Err(StoreError::NotFound {
                entity: "change_set",
                id,
            }
            .into()),
            Some(c) => Err(StoreError::Conflict {
                entity: "change_set",
                id,
                expected: from.to_string(),
                found: c.status.to_string(),
            }
            .into()),
        };
    }

    Ok(())
}

/// Record the external review handle after the host opens a review.
pub async fn set_review_handle(
    pool: &PgPool,
    id: Uuid,
    review_number: i64,
    review_url: &str,
) -> Result<()> {
    sqlx::query("UPDATE change_sets SET review_number = $1, review_url = $2 WHERE id = $3")
        .bind(review_number)
        .bind(review_url)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to set review handle")?;

    Ok(())
}

/// Assign a reviewer to a change-set. Only fills an empty slot, so a racing
/// second assignment loses quietly.
pub async fn assign_reviewer(pool: &PgPool, id: Uuid, reviewer_agent_id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE change_sets SET reviewer_agent_id = $1 \
         WHERE id = $2 AND reviewer_agent_id IS NULL",
    )
    .bind(reviewer_agent_id)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to assign reviewer")?;

    Ok(result.rows_affected() > 0)
}

/// Append review comments.
pub async fn set_review_comments(pool: &PgPool, id: Uuid, comments: &str) -> Result<()> {
    sqlx::query("UPDATE change_sets SET review_comments = $1 WHERE id = $2")
        .bind(comments)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to set review comments")?;

    Ok(())
}

/// Count a reviewer's active review load: change-sets assigned to the agent
/// in non-terminal review states. Used for least-loaded reviewer selection.
pub async fn count_active_reviews(pool: &PgPool, reviewer_agent_id: Uuid) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM change_sets \
         WHERE reviewer_agent_id = $1 \
           AND status IN ('ready_for_review', 'changes_requested')",
    )
    .bind(reviewer_agent_id)
    .fetch_one(pool)
    .await
    .context("failed to count active reviews")?;

    Ok(row.0)
}
