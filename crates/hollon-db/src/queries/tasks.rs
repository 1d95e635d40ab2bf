//! Database query functions for the `tasks` and `task_dependencies` tables.
//!
//! This module owns the two critical sections of the control plane: the
//! guarded status CAS ([`set_task_status`]) that every lifecycle transition
//! goes through, and the claim transaction ([`claim_ready_task`]) that
//! decides task ownership under concurrency.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Task, TaskComplexity, TaskPriority, TaskStatus, TaskType};

/// Parameters for inserting a new task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub project_id: Uuid,
    pub goal_id: Option<Uuid>,
    pub parent_task_id: Option<Uuid>,
    pub assigned_team_id: Option<Uuid>,
    pub assigned_agent_id: Option<Uuid>,
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub complexity: Option<TaskComplexity>,
    pub required_capabilities: Vec<String>,
    pub affected_files: Vec<String>,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
}

impl NewTask {
    /// A minimal leaf task; the remaining fields take their defaults.
    pub fn leaf(project_id: Uuid, title: impl Into<String>) -> Self {
        Self {
            project_id,
            goal_id: None,
            parent_task_id: None,
            assigned_team_id: None,
            assigned_agent_id: None,
            task_type: TaskType::Implementation,
            priority: TaskPriority::P3,
            complexity: None,
            required_capabilities: Vec::new(),
            affected_files: Vec::new(),
            title: title.into(),
            description: String::new(),
            acceptance_criteria: Vec::new(),
        }
    }
}

/// Insert a new task row.
///
/// Enforces the assignment XOR and the depth cap before touching the store:
/// the child's depth is parent depth + 1 (root tasks sit at 0), and any
/// depth beyond 3 is an invariant violation, not a retryable failure.
pub async fn insert_task(pool: &PgPool, new: &NewTask) -> Result<Task> {
    if new.assigned_team_id.is_some() && new.assigned_agent_id.is_some() {
        return Err(StoreError::InvariantViolation(format!(
            "task {:?} assigned to both a team and an agent",
            new.title
        ))
        .into());
    }

    let depth = match new.parent_task_id {
        None => 0,
        Some(parent_id) => {
            let parent = get_task(pool, parent_id)
                .await?
                .ok_or(StoreError::NotFound {
                    entity: "task",
                    id: parent_id,
                })?;
            parent.depth + 1
        }
    };
    if depth > 3 {
        return Err(StoreError::InvariantViolation(format!(
            "task {:?} would sit at depth {depth}, beyond the cap of 3",
            new.title
        ))
        .into());
    }

    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks \
             (project_id, goal_id, parent_task_id, depth, assigned_team_id, \
              assigned_agent_id, task_type, priority, complexity, \
              required_capabilities, affected_files, title, description, \
              acceptance_criteria) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
         RETURNING *",
    )
    .bind(new.project_id)
    .bind(new.goal_id)
    .bind(new.parent_task_id)
    .bind(depth)
    .bind(new.assigned_team_id)
    .bind(new.assigned_agent_id)
    .bind(new.task_type)
    .bind(new.priority)
    .bind(new.complexity)
    .bind(&new.required_capabilities)
    .bind(&new.affected_files)
    .bind(&new.title)
    .bind(&new.description)
    .bind(&new.acceptance_criteria)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List all tasks under a goal, ordered by creation time.
pub async fn list_tasks_for_goal(pool: &PgPool, goal_id: Uuid) -> Result<Vec<Task>> {
    let tasks =
        sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE goal_id = $1 ORDER BY created_at ASC")
            .bind(goal_id)
            .fetch_all(pool)
            .await
            .context("failed to list tasks for goal")?;

    Ok(tasks)
}

/// List all tasks under a project, ordered by creation time.
pub async fn list_tasks_for_project(pool: &PgPool, project_id: Uuid) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE project_id = $1 ORDER BY created_at ASC",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await
    .context("failed to list tasks for project")?;

    Ok(tasks)
}

/// Children of a task, ordered by creation time.
pub async fn list_children(pool: &PgPool, parent_task_id: Uuid) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE parent_task_id = $1 ORDER BY created_at ASC",
    )
    .bind(parent_task_id)
    .fetch_all(pool)
    .await
    .context("failed to list child tasks")?;

    Ok(tasks)
}

// ---------------------------------------------------------------------------
// Status CAS
// ---------------------------------------------------------------------------

/// Atomically transition a task from one status to another.
///
/// Optimistic lock: the UPDATE's WHERE clause includes `status = $from`, so
/// the row changes only when the current status matches. `started_at` is
/// stamped on the first move into `in_progress`; `completed_at` on any
/// terminal status. Returns `StoreError::Conflict` on a CAS miss and
/// `StoreError::NotFound` when the task does not exist.
pub async fn set_task_status(
    pool: &PgPool,
    task_id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = $1, \
             started_at = CASE WHEN $1 = 'in_progress' THEN COALESCE(started_at, now()) \
                               ELSE started_at END, \
             completed_at = CASE WHEN $1 IN ('completed', 'failed', 'cancelled') THEN now() \
                                 ELSE completed_at END \
         WHERE id = $2 AND status = $3",
    )
    .bind(to)
    .bind(task_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition task status")?;

    if result.rows_affected() == 0 {
        let task = get_task(pool, task_id).await?;
        return match task {
            None => Err(StoreError::NotFound {
                entity: "task",
                id: task_id,
            }
            .into()),
            Some(t) => Err(StoreError::Conflict {
                entity: "task",
                id: task_id,
                expected: from.to_string(),
                found: t.status.to_string(),
            }
            .into()),
        };
    }

    Ok(())
}

/// Set the task's error message.
pub async fn set_error_message(pool: &PgPool, task_id: Uuid, message: &str) -> Result<()> {
    sqlx::query("UPDATE tasks SET error_message = $1 WHERE id = $2")
        .bind(message)
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to set task error message")?;

    Ok(())
}

/// Attach a change-set reference to the task.
pub async fn set_change_set(pool: &PgPool, task_id: Uuid, change_set_id: Uuid) -> Result<()> {
    sqlx::query("UPDATE tasks SET change_set_id = $1 WHERE id = $2")
        .bind(change_set_id)
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to set task change-set")?;

    Ok(())
}

/// Move a task to `blocked` with a recovery deadline. Guarded on the prior
/// status like every other transition.
pub async fn block_task(
    pool: &PgPool,
    task_id: Uuid,
    from: TaskStatus,
    blocked_until: DateTime<Utc>,
    reason: &str,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'blocked', blocked_until = $1, error_message = $2 \
         WHERE id = $3 AND status = $4",
    )
    .bind(blocked_until)
    .bind(reason)
    .bind(task_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to block task")?;

    if result.rows_affected() == 0 {
        let task = get_task(pool, task_id).await?;
        return match task {
            None => Err(StoreError::NotFound {
                entity: "task",
                id: task_id,
            }
            .into()),
            Some(t) => Err(StoreError::Conflict {
                entity: "task",
                id: task_id,
                expected: from.to_string(),
                found: t.status.to_string(),
            }
            .into()),
        };
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Dependencies
// ---------------------------------------------------------------------------

/// Insert a dependency edge: `task_id` depends on `depends_on_id`.
///
/// Cycle detection is mandatory at insert time: the edge is rejected with
/// `StoreError::InvariantViolation` when `task_id` is already reachable
/// from `depends_on_id` through existing edges. The reachability check and
/// the insert run in one transaction. `ON CONFLICT DO NOTHING` keeps the
/// insert idempotent.
pub async fn insert_task_dependency(
    pool: &PgPool,
    task_id: Uuid,
    depends_on_id: Uuid,
) -> Result<()> {
    if task_id == depends_on_id {
        return Err(
            StoreError::InvariantViolation(format!("task {task_id} cannot depend on itself"))
                .into(),
        );
    }

    let mut tx: Transaction<'_, Postgres> = pool
        .begin()
        .await
        .context("failed to begin dependency transaction")?;

    let creates_cycle: bool = sqlx::query_scalar(
        "WITH RECURSIVE reach AS ( \
             SELECT depends_on AS id FROM task_dependencies WHERE task_id = $1 \
             UNION \
             SELECT td.depends_on FROM task_dependencies td \
             JOIN reach r ON td.task_id = r.id \
         ) \
         SELECT EXISTS(SELECT 1 FROM reach WHERE id = $2)",
    )
    .bind(depends_on_id)
    .bind(task_id)
    .fetch_one(&mut *tx)
    .await
    .context("failed to run dependency cycle check")?;

    if creates_cycle {
        tx.rollback().await.ok();
        return Err(StoreError::InvariantViolation(format!(
            "dependency {task_id} -> {depends_on_id} would create a cycle"
        ))
        .into());
    }

    sqlx::query(
        "INSERT INTO task_dependencies (task_id, depends_on) VALUES ($1, $2) \
         ON CONFLICT DO NOTHING",
    )
    .bind(task_id)
    .bind(depends_on_id)
    .execute(&mut *tx)
    .await
    .context("failed to insert task dependency")?;

    tx.commit()
        .await
        .context("failed to commit dependency transaction")?;

    Ok(())
}

/// Tasks that `task_id` depends on.
pub async fn find_dependencies(pool: &PgPool, task_id: Uuid) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT t.* FROM task_dependencies td \
         JOIN tasks t ON t.id = td.depends_on \
         WHERE td.task_id = $1 \
         ORDER BY t.created_at ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to find task dependencies")?;

    Ok(tasks)
}

/// Tasks that depend on `task_id`.
pub async fn find_dependents(pool: &PgPool, task_id: Uuid) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT t.* FROM task_dependencies td \
         JOIN tasks t ON t.id = td.task_id \
         WHERE td.depends_on = $1 \
         ORDER BY t.created_at ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to find task dependents")?;

    Ok(tasks)
}

/// Titles of the tasks `task_id` depends on, for the prompt's task block.
pub async fn dependency_titles(pool: &PgPool, task_id: Uuid) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT t.title FROM task_dependencies td \
         JOIN tasks t ON t.id = td.depends_on \
         WHERE td.task_id = $1 \
         ORDER BY t.title",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to get dependency titles")?;

    Ok(rows.into_iter().map(|(title,)| title).collect())
}

/// Flip `pending` dependents of a completed task to `ready` when their last
/// dependency just completed.
///
/// Monotonic: `ready` never returns to `pending`, so a dependent is flipped
/// exactly once no matter how many completions race. Returns the flipped
/// tasks.
pub async fn unblock_dependents(pool: &PgPool, completed_task_id: Uuid) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "UPDATE tasks t \
         SET status = 'ready' \
         WHERE t.status = 'pending' \
           AND t.id IN (SELECT task_id FROM task_dependencies WHERE depends_on = $1) \
           AND NOT EXISTS ( \
               SELECT 1 FROM task_dependencies td \
               JOIN tasks dep ON dep.id = td.depends_on \
               WHERE td.task_id = t.id AND dep.status <> 'completed' \
           ) \
         RETURNING t.*",
    )
    .bind(completed_task_id)
    .fetch_all(pool)
    .await
    .context("failed to unblock dependents")?;

    Ok(tasks)
}

// ---------------------------------------------------------------------------
// Claiming
// ---------------------------------------------------------------------------

/// Claim the best eligible task for an agent.
///
/// The single serializable critical section of the scheduler. In one
/// transaction, selects the highest-priority, oldest-created task such that:
///
/// - status is `pending` or `ready` (a `pending` task whose dependencies are
///   all complete is claimable directly);
/// - the task is a leaf (never `team_epic`) in the agent's organization;
/// - it is unassigned, or already assigned to this agent;
/// - every dependency is `completed`;
/// - its required capabilities are a subset of the agent's (normalized tags,
///   set containment);
/// - no `in_progress` task in the same project touches an overlapping
///   affected-file set;
///
/// then CAS-moves it to `in_progress` assigned to the agent and marks the
/// agent `working`. `FOR UPDATE SKIP LOCKED` keeps two claimants from ever
/// observing the same row as unclaimed.
///
/// Re-claiming is idempotent: when the agent already holds its maximum
/// number of in-progress tasks, the most recently claimed one is returned
/// unchanged. Returns `None` when nothing is eligible; a CAS miss inside
/// the window surfaces as `None` as well (retry on the next tick).
pub async fn claim_ready_task(
    pool: &PgPool,
    agent_id: Uuid,
    organization_id: Uuid,
    capabilities: &[String],
    max_concurrent_tasks: i32,
) -> Result<Option<Task>> {
    let mut tx: Transaction<'_, Postgres> = pool
        .begin()
        .await
        .context("failed to begin claim transaction")?;

    // Concurrency guard + idempotent re-claim.
    let held: Vec<Task> = sqlx::query_as(
        "SELECT * FROM tasks \
         WHERE assigned_agent_id = $1 AND status = 'in_progress' \
         ORDER BY started_at DESC",
    )
    .bind(agent_id)
    .fetch_all(&mut *tx)
    .await
    .context("failed to count held tasks")?;

    if held.len() as i32 >= max_concurrent_tasks {
        tx.commit().await.ok();
        return Ok(held.into_iter().next());
    }

    let candidate: Option<Task> = sqlx::query_as(
        "SELECT t.* FROM tasks t \
         JOIN projects p ON p.id = t.project_id \
         WHERE p.organization_id = $1 \
           AND t.status IN ('pending', 'ready') \
           AND t.task_type <> 'team_epic' \
           AND t.assigned_team_id IS NULL \
           AND (t.assigned_agent_id IS NULL OR t.assigned_agent_id = $2) \
           AND t.required_capabilities <@ $3 \
           AND NOT EXISTS ( \
               SELECT 1 FROM task_dependencies td \
               JOIN tasks dep ON dep.id = td.depends_on \
               WHERE td.task_id = t.id AND dep.status <> 'completed' \
           ) \
           AND NOT EXISTS ( \
               SELECT 1 FROM tasks o \
               WHERE o.project_id = t.project_id \
                 AND o.id <> t.id \
                 AND o.status = 'in_progress' \
                 AND o.affected_files && t.affected_files \
           ) \
         ORDER BY t.priority ASC, t.created_at ASC \
         LIMIT 1 \
         FOR UPDATE OF t SKIP LOCKED",
    )
    .bind(organization_id)
    .bind(agent_id)
    .bind(capabilities)
    .fetch_optional(&mut *tx)
    .await
    .context("failed to select claim candidate")?;

    let Some(candidate) = candidate else {
        tx.commit().await.ok();
        return Ok(None);
    };

    let claimed: Option<Task> = sqlx::query_as(
        "UPDATE tasks \
         SET status = 'in_progress', \
             assigned_agent_id = $1, \
             started_at = COALESCE(started_at, now()) \
         WHERE id = $2 AND status IN ('pending', 'ready') \
         RETURNING *",
    )
    .bind(agent_id)
    .bind(candidate.id)
    .fetch_optional(&mut *tx)
    .await
    .context("failed to claim task")?;

    let Some(claimed) = claimed else {
        // The row moved under us despite the lock; treat as a miss.
        tx.rollback().await.ok();
        return Ok(None);
    };

    sqlx::query("UPDATE agents SET status = 'working', current_task_id = $1 WHERE id = $2")
        .bind(claimed.id)
        .bind(agent_id)
        .execute(&mut *tx)
        .await
        .context("failed to mark claiming agent working")?;

    tx.commit()
        .await
        .context("failed to commit claim transaction")?;

    Ok(Some(claimed))
}

// ---------------------------------------------------------------------------
// Retry and CI bookkeeping
// ---------------------------------------------------------------------------

/// Level-1 self-retry: increment the retry counter, clear the assignment,
/// and return the task to `ready` for the pool to re-offer.
///
/// Optimistic lock on both status and the current retry count; fails the
/// CAS when the counter has already reached the given maximum.
pub async fn retry_task(
    pool: &PgPool,
    task_id: Uuid,
    current_retry_count: i32,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'ready', \
             retry_count = retry_count + 1, \
             consecutive_failures = consecutive_failures + 1, \
             last_failure_at = now(), \
             assigned_agent_id = NULL \
         WHERE id = $1 AND status = 'in_progress' AND retry_count = $2 AND retry_count < 3",
    )
    .bind(task_id)
    .bind(current_retry_count)
    .execute(pool)
    .await
    .context("failed to retry task")?;

    Ok(result.rows_affected())
}

/// Level-2 teammate retry: hand the task to a chosen peer and return it to
/// `ready` without consuming the retry budget further.
pub async fn reassign_to_peer(pool: &PgPool, task_id: Uuid, peer_agent_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'ready', \
             assigned_agent_id = $1, \
             consecutive_failures = consecutive_failures + 1, \
             last_failure_at = now() \
         WHERE id = $2 AND status = 'in_progress'",
    )
    .bind(peer_agent_id)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to reassign task to peer")?;

    Ok(result.rows_affected())
}

/// Manager or human resolution of a blocked task: re-create it as a fresh
/// attempt. Every retry budget resets and the assignment clears so the
/// pool (or the decompose loop, for epics) can re-offer it; the
/// accumulated escalation records stay as the audit trail.
pub async fn reset_for_fresh_attempt(pool: &PgPool, task_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'ready', \
             retry_count = 0, \
             plan_retry_count = 0, \
             ci_retry_count = 0, \
             assigned_agent_id = NULL, \
             blocked_until = NULL, \
             error_message = NULL \
         WHERE id = $1 AND status = 'blocked'",
    )
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to reset task for fresh attempt")?;

    Ok(result.rows_affected())
}

/// Record a CI failure: increment the CI-retry counter (capped at 3) and
/// capture the CI summary verbatim for the next prompt composition.
///
/// Returns `true` when the counter was incremented (re-execution allowed)
/// and `false` when the cap was already reached (terminal, level-4
/// escalation).
pub async fn record_ci_failure(pool: &PgPool, task_id: Uuid, feedback: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET ci_retry_count = ci_retry_count + 1, \
             last_ci_failure_at = now(), \
             last_ci_feedback = $1 \
         WHERE id = $2 AND ci_retry_count < 3",
    )
    .bind(feedback)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to record CI failure")?;

    Ok(result.rows_affected() > 0)
}

/// Store reviewer feedback for the next prompt composition. Shares the
/// feedback channel with CI summaries but does not touch the CI counter:
/// review rounds are not bounded the way CI retries are.
pub async fn set_review_feedback(pool: &PgPool, task_id: Uuid, feedback: &str) -> Result<()> {
    sqlx::query("UPDATE tasks SET last_ci_feedback = $1 WHERE id = $2")
        .bind(feedback)
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to set review feedback")?;

    Ok(())
}

/// Reset the consecutive-failure counter after a successful completion.
pub async fn reset_consecutive_failures(pool: &PgPool, task_id: Uuid) -> Result<()> {
    sqlx::query("UPDATE tasks SET consecutive_failures = 0 WHERE id = $1")
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to reset consecutive failures")?;

    Ok(())
}

/// Increment the decomposition retry counter on an epic (phase B parse or
/// validation failure). Returns the new value.
pub async fn bump_plan_retry(pool: &PgPool, task_id: Uuid, error: &str) -> Result<i32> {
    let row: (i32,) = sqlx::query_as(
        "UPDATE tasks \
         SET plan_retry_count = plan_retry_count + 1, error_message = $1 \
         WHERE id = $2 \
         RETURNING plan_retry_count",
    )
    .bind(error)
    .bind(task_id)
    .fetch_one(pool)
    .await
    .context("failed to bump plan retry counter")?;

    Ok(row.0)
}

// ---------------------------------------------------------------------------
// Scans
// ---------------------------------------------------------------------------

/// Epics ready for phase-B decomposition: `team_epic` tasks in `ready` or
/// `pending` status (with dependencies complete) whose team has a manager.
pub async fn list_decomposable_epics(pool: &PgPool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT t.* FROM tasks t \
         JOIN teams tm ON tm.id = t.assigned_team_id \
         WHERE t.task_type = 'team_epic' \
           AND t.status IN ('pending', 'ready') \
           AND tm.manager_agent_id IS NOT NULL \
           AND NOT EXISTS ( \
               SELECT 1 FROM task_dependencies td \
               JOIN tasks dep ON dep.id = td.depends_on \
               WHERE td.task_id = t.id AND dep.status <> 'completed' \
           ) \
         ORDER BY t.priority ASC, t.created_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list decomposable epics")?;

    Ok(tasks)
}

/// Tasks in review with no reviewer assigned on their change-set, for the
/// review loop's backfill scan.
pub async fn list_unreviewed_tasks(pool: &PgPool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT t.* FROM tasks t \
         JOIN change_sets cs ON cs.id = t.change_set_id \
         WHERE t.status = 'in_review' AND cs.reviewer_agent_id IS NULL \
         ORDER BY t.created_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list unreviewed tasks")?;

    Ok(tasks)
}

/// Reset tasks stranded `in_progress` by a crashed process back to `ready`
/// with their assignment cleared. The claim CAS makes the reset safe even
/// if the old process is somehow still alive.
///
/// Returns the tasks that were reset.
pub async fn reset_orphaned_tasks(pool: &PgPool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET status = 'ready', assigned_agent_id = NULL \
         WHERE status = 'in_progress' \
         RETURNING *",
    )
    .fetch_all(pool)
    .await
    .context("failed to reset orphaned tasks")?;

    Ok(tasks)
}

/// Status counts for a goal's tasks.
#[derive(Debug, Clone, Default)]
pub struct GoalProgress {
    pub pending: i64,
    pub ready: i64,
    pub in_progress: i64,
    pub in_review: i64,
    pub approved: i64,
    pub completed: i64,
    pub blocked: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub total: i64,
}

impl GoalProgress {
    /// Every task reached a terminal or approved state with none failed.
    pub fn all_completed(&self) -> bool {
        self.total > 0 && self.completed == self.total
    }
}

/// Get a summary of task counts by status for a given goal.
pub async fn get_goal_progress(pool: &PgPool, goal_id: Uuid) -> Result<GoalProgress> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status::text, COUNT(*) as cnt \
         FROM tasks \
         WHERE goal_id = $1 \
         GROUP BY status",
    )
    .bind(goal_id)
    .fetch_all(pool)
    .await
    .context("failed to get goal progress")?;

    let mut progress = GoalProgress::default();
    for (status, count) in &rows {
        match status.as_str() {
            "pending" => progress.pending = *count,
            "ready" => progress.ready = *count,
            "in_progress" => progress.in_progress = *count,
            "in_review" => progress.in_review = *count,
            "approved" => progress.approved = *count,
            "completed" => progress.completed = *count,
            "blocked" => progress.blocked = *count,
            "failed" => progress.failed = *count,
            "cancelled" => progress.cancelled = *count,
            _ => {}
        }
        progress.total += count;
    }
    Ok(progress)
}

/// Human-initiated cancel. Works from any non-terminal status; an
/// in-flight cycle's next CAS against the task will miss and tear down.
pub async fn cancel_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'cancelled', completed_at = now() \
         WHERE id = $1 AND status NOT IN ('completed', 'failed', 'cancelled')",
    )
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to cancel task")?;

    if result.rows_affected() == 0 {
        let task = get_task(pool, task_id).await?;
        return match task {
            None => Err(StoreError::NotFound {
                entity: "task",
                id: task_id,
            }
            .into()),
            Some(t) => Err(StoreError::Conflict {
                entity: "task",
                id: task_id,
                expected: "a non-terminal status".to_owned(),
                found: t.status.to_string(),
            }
            .into()),
        };
    }

    Ok(())
}

/// Human nudge: assign an unclaimed task to an agent, honoring the XOR
/// invariant (any team assignment is cleared).
pub async fn assign_task_to_agent(pool: &PgPool, task_id: Uuid, agent_id: Uuid) -> Result<()> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET assigned_agent_id = $1, assigned_team_id = NULL \
         WHERE id = $2 AND status IN ('pending', 'ready', 'blocked')",
    )
    .bind(agent_id)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to assign task to agent")?;

    if result.rows_affected() == 0 {
        let task = get_task(pool, task_id).await?;
        return match task {
            None => Err(StoreError::NotFound {
                entity: "task",
                id: task_id,
            }
            .into()),
            Some(t) => Err(StoreError::Conflict {
                entity: "task",
                id: task_id,
                expected: "pending, ready, or blocked".to_owned(),
                found: t.status.to_string(),
            }
            .into()),
        };
    }

    Ok(())
}
