//! Database query functions for the `execution_records` and `cost_records`
//! tables.
//!
//! `execution_records` is the primary, append-only cost ledger. The
//! per-organization day roll-up in `cost_records` is derived from it in the
//! same transaction that appends, so the two ledgers cannot drift under
//! retries: the roll-up is a commutative integer add.

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::ExecutionRecord;

/// Parameters for appending a new execution record.
#[derive(Debug, Clone)]
pub struct NewExecutionRecord {
    pub task_id: Uuid,
    pub agent_id: Uuid,
    pub attempt: i32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_sub_cents: i64,
    pub brain_duration_ms: i64,
}

/// Append an execution record and fold its cost into the organization's
/// day roll-up, atomically.
pub async fn record_execution(
    pool: &PgPool,
    organization_id: Uuid,
    new: &NewExecutionRecord,
) -> Result<ExecutionRecord> {
    let mut tx: Transaction<'_, Postgres> = pool
        .begin()
        .await
        .context("failed to begin execution-record transaction")?;

    let record = sqlx::query_as::<_, ExecutionRecord>(
        "INSERT INTO execution_records \
             (task_id, agent_id, attempt, started_at, ended_at, outcome, \
              input_tokens, output_tokens, cost_sub_cents, brain_duration_ms) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
         RETURNING *",
    )
    .bind(new.task_id)
    .bind(new.agent_id)
    .bind(new.attempt)
    .bind(new.started_at)
    .bind(new.ended_at)
    .bind(&new.outcome)
    .bind(new.input_tokens)
    .bind(new.output_tokens)
    .bind(new.cost_sub_cents)
    .bind(new.brain_duration_ms)
    .fetch_one(&mut *tx)
    .await
    .context("failed to insert execution record")?;

    sqlx::query(
        "INSERT INTO cost_records (organization_id, day, sub_cents) \
         VALUES ($1, $2, $3) \
         ON CONFLICT (organization_id, day) \
         DO UPDATE SET sub_cents = cost_records.sub_cents + EXCLUDED.sub_cents",
    )
    .bind(organization_id)
    .bind(new.ended_at.date_naive())
    .bind(new.cost_sub_cents)
    .execute(&mut *tx)
    .await
    .context("failed to roll up cost record")?;

    tx.commit()
        .await
        .context("failed to commit execution-record transaction")?;

    Ok(record)
}

/// Execution history for a task, oldest first.
pub async fn list_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<ExecutionRecord>> {
    let records = sqlx::query_as::<_, ExecutionRecord>(
        "SELECT * FROM execution_records WHERE task_id = $1 ORDER BY started_at ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list execution records for task")?;

    Ok(records)
}

/// Day-to-date spend for an organization, in sub-cents.
pub async fn daily_cost(pool: &PgPool, organization_id: Uuid, day: NaiveDate) -> Result<i64> {
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT sub_cents FROM cost_records WHERE organization_id = $1 AND day = $2",
    )
    .bind(organization_id)
    .bind(day)
    .fetch_optional(pool)
    .await
    .context("failed to fetch daily cost")?;

    Ok(row.map(|(c,)| c).unwrap_or(0))
}

/// Month-to-date spend for an organization, in sub-cents, derived by summing
/// the day roll-ups of the month containing `day`.
pub async fn monthly_cost(pool: &PgPool, organization_id: Uuid, day: NaiveDate) -> Result<i64> {
    let month_start = NaiveDate::from_ymd_opt(day.year(), day.month(), 1)
        .context("failed to compute month start")?;

    let row: (Option<i64>,) = sqlx::query_as(
        "SELECT SUM(sub_cents) FROM cost_records \
         WHERE organization_id = $1 AND day >= $2 AND day <= $3",
    )
    .bind(organization_id)
    .bind(month_start)
    .bind(day)
    .fetch_one(pool)
    .await
    .context("failed to fetch monthly cost")?;

    Ok(row.0.unwrap_or(0))
}

/// Sum of execution-record costs for an organization on a given day.
///
/// This recomputes the roll-up from the primary ledger; the two agree after
/// any quiescence window, which the invariant tests verify.
pub async fn recompute_daily_cost(
    pool: &PgPool,
    organization_id: Uuid,
    day: NaiveDate,
) -> Result<i64> {
    let row: (Option<i64>,) = sqlx::query_as(
        "SELECT SUM(er.cost_sub_cents) \
         FROM execution_records er \
         JOIN tasks t ON t.id = er.task_id \
         JOIN projects p ON p.id = t.project_id \
         WHERE p.organization_id = $1 AND er.ended_at::date = $2",
    )
    .bind(organization_id)
    .bind(day)
    .fetch_one(pool)
    .await
    .context("failed to recompute daily cost")?;

    Ok(row.0.unwrap_or(0))
}
