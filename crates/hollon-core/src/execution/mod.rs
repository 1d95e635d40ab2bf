//! The execution cycle -- one attempt by one agent to complete one task.
//!
//! claim -> sandbox -> prompt -> brain -> edits -> gate -> publish. The
//! whole body runs under a wall-clock ceiling of 20x the brain timeout;
//! on expiry the cycle is torn down forcibly (the brain subprocess dies
//! with its future, the sandbox is preserved for diagnostics) and the task
//! fails with the ceiling as its error.
//!
//! Cost accounting is unconditional and precedes the gate decision, so
//! budgets bind even for executions the gate rejects.

pub mod edits;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use tracing::{info, warn};

use hollon_db::models::{Agent, AgentStatus, ChangeSetStatus, Project, Task, TaskStatus, TaskType};
use hollon_db::queries::executions::NewExecutionRecord;
use hollon_db::queries::{agents, change_sets, executions, projects, tasks};

use crate::brain::{BrainCost, BrainRegistry};
use crate::error::CoreError;
use crate::escalation::{self, LadderAction};
use crate::gate::{self, GateConfig};
use crate::prompt::PromptComposer;
use crate::review;
use crate::sandbox::{Sandbox, SandboxManager};
use crate::taskpool;
use crate::vcs::VcsHost;

/// Multiplier on the brain timeout that bounds the whole cycle.
pub const WALL_CLOCK_MULTIPLIER: u32 = 20;

/// Shared collaborators of every execution cycle.
pub struct ExecutionDeps {
    pub pool: PgPool,
    pub brains: Arc<BrainRegistry>,
    pub host: Arc<dyn VcsHost>,
    pub composer: PromptComposer,
    pub gate: GateConfig,
    pub brain_timeout: Duration,
}

/// Result of one cycle invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No eligible task this tick.
    Idle,
    /// A change-set was published and the task moved to review.
    Published,
    /// The gate (or an upstream stage) rejected the execution; the
    /// escalation ladder has routed it.
    FailedValidation {
        reason: String,
        action: LadderAction,
    },
    /// The wall-clock ceiling expired and the cycle was torn down.
    WallClock,
}

/// Run one execution cycle for an agent.
pub async fn run_execution_cycle(deps: &ExecutionDeps, agent: &Agent) -> Result<CycleOutcome> {
    let ceiling = deps.brain_timeout * WALL_CLOCK_MULTIPLIER;
    let claimed: Arc<Mutex<Option<Task>>> = Arc::new(Mutex::new(None));

    match tokio::time::timeout(ceiling, cycle_inner(deps, agent, Arc::clone(&claimed))).await {
        Ok(result) => result,
        Err(_elapsed) => {
            warn!(agent = %agent.name, ?ceiling, "execution cycle hit the wall-clock ceiling");
            let held = claimed.lock().unwrap().clone();
            if let Some(task) = held {
                let _ = tasks::set_error_message(&deps.pool, task.id, "wall clock ceiling").await;
                if let Err(e) = tasks::set_task_status(
                    &deps.pool,
                    task.id,
                    TaskStatus::InProgress,
                    TaskStatus::Failed,
                )
                .await
                {
                    warn!(task_id = %task.id, error = %e, "failed to fail timed-out task");
                }
                let _ = agents::record_task_outcome(&deps.pool, agent.id, false, 0).await;
            }
            release_agent(&deps.pool, agent).await;
            Ok(CycleOutcome::WallClock)
        }
    }
}

async fn cycle_inner(
    deps: &ExecutionDeps,
    agent: &Agent,
    claimed: Arc<Mutex<Option<Task>>>,
) -> Result<CycleOutcome> {
    let pool = &deps.pool;

    // 1. Claim.
    let Some(task) = taskpool::claim(pool, agent).await? else {
        return Ok(CycleOutcome::Idle);
    };
    *claimed.lock().unwrap() = Some(task.clone());
    info!(agent = %agent.name, task_id = %task.id, task = %task.title, "claimed task");

    let project = projects::get_project(pool, task.project_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("project {}", task.project_id)))?;

    // 2. Sandbox: subtasks join the parent task's working copy.
    let manager = SandboxManager::new(&project.working_dir)
        .with_context(|| format!("failed to open sandbox manager for {}", project.name))?;
    let sandbox = resolve_sandbox(pool, &manager, agent.id, &task).await?;

    // 3. Prompt.
    let prompt = deps.composer.compose(pool, agent, &task).await?;

    // 4. Brain.
    let Some(brain) = deps.brains.get(&agent.brain_provider) else {
        let reason = format!("brain provider {:?} is not registered", agent.brain_provider);
        return fail_validation(deps, agent, &task, &manager, &sandbox, true, &reason).await;
    };

    let started_at = Utc::now();
    let response = match brain.execute(&prompt, deps.brain_timeout).await {
        Ok(response) => response,
        Err(e) => {
            record(deps, &task, agent, started_at, "brain_error", &BrainCost::default(), 0).await?;
            return fail_validation(
                deps,
                agent,
                &task,
                &manager,
                &sandbox,
                e.is_retryable(),
                &e.to_string(),
            )
            .await;
        }
    };

    // 5. Account cost before the gate decides anything.
    record(
        deps,
        &task,
        agent,
        started_at,
        "executed",
        &response.cost,
        response.duration.as_millis() as i64,
    )
    .await?;

    // 6. Interpret the edit envelope and write into the sandbox.
    let envelope = match edits::parse_edit_envelope(&response.output) {
        Ok(envelope) => envelope,
        Err(e) => {
            return fail_validation(deps, agent, &task, &manager, &sandbox, true, &e.to_string())
                .await;
        }
    };
    for edit in &envelope.files {
        if let Err(e) = manager.write(&sandbox, &edit.path, edit.content.as_bytes()) {
            return fail_validation(deps, agent, &task, &manager, &sandbox, true, &e.to_string())
                .await;
        }
    }

    // 7. Gate.
    let org = hollon_db::queries::orgs::get_organization(pool, agent.organization_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("organization {}", agent.organization_id)))?;
    let outcome = gate::evaluate(&deps.gate, &org, &task, &response);
    for warning in &outcome.warnings {
        warn!(task_id = %task.id, warning, "gate warning");
    }
    if !outcome.passed {
        return fail_validation(
            deps,
            agent,
            &task,
            &manager,
            &sandbox,
            outcome.should_retry,
            &outcome.reason,
        )
        .await;
    }

    // 8. Commit and publish.
    let message = format!("{} (attempt {})", task.title, task.retry_count);
    manager
        .stage_and_commit(&sandbox, &message, &agent.name)
        .with_context(|| format!("failed to commit task {}", task.id))?;

    let review_ref = match deps
        .host
        .publish(project.id, &sandbox.branch, &task.title)
        .await
    {
        Ok(review_ref) => review_ref,
        Err(e) => {
            // Publish failures (host unreachable) retry under the same
            // policy as a quality failure.
            return fail_validation(
                deps,
                agent,
                &task,
                &manager,
                &sandbox,
                e.is_retryable(),
                &e.to_string(),
            )
            .await;
        }
    };

    let change_set =
        change_sets::insert_change_set(pool, task.id, project.id, &sandbox.branch, agent.id)
            .await?;
    change_sets::set_review_handle(pool, change_set.id, review_ref.number, &review_ref.url).await?;
    tasks::set_change_set(pool, task.id, change_set.id).await?;

    match change_set.status {
        ChangeSetStatus::Draft => {
            change_sets::set_status(
                pool,
                change_set.id,
                ChangeSetStatus::Draft,
                ChangeSetStatus::ReadyForReview,
            )
            .await?;
        }
        // A re-execution after requested changes re-opens the same review.
        ChangeSetStatus::ChangesRequested => {
            change_sets::set_status(
                pool,
                change_set.id,
                ChangeSetStatus::ChangesRequested,
                ChangeSetStatus::ReadyForReview,
            )
            .await?;
        }
        _ => {}
    }

    tasks::set_task_status(pool, task.id, TaskStatus::InProgress, TaskStatus::InReview).await?;

    // 9. Reviewer assignment; the review loop backfills when none is free.
    if let Err(e) = review::try_assign_reviewer(pool, &task, &change_set, agent).await {
        warn!(task_id = %task.id, error = %e, "reviewer assignment deferred to review loop");
    }

    release_agent(pool, agent).await;
    info!(task_id = %task.id, review = review_ref.number, "change-set published");
    Ok(CycleOutcome::Published)
}

/// Resolve the sandbox a task executes in: its own, or -- for subtasks of an
/// executing (non-epic) parent -- the parent's. `fallback_agent_id` names
/// the sandbox directory when the task is its own sandbox owner.
pub async fn resolve_sandbox(
    pool: &PgPool,
    manager: &SandboxManager,
    fallback_agent_id: uuid::Uuid,
    task: &Task,
) -> Result<Sandbox> {
    let mut owner = task.clone();
    while let Some(parent_id) = owner.parent_task_id {
        let Some(parent) = tasks::get_task(pool, parent_id).await? else {
            break;
        };
        if parent.task_type == TaskType::TeamEpic {
            break;
        }
        owner = parent;
    }

    let owner_agent = if owner.id == task.id {
        fallback_agent_id
    } else {
        owner.assigned_agent_id.unwrap_or(fallback_agent_id)
    };

    if let Some(existing) = manager.open_existing(owner_agent, owner.id) {
        return Ok(existing);
    }
    Ok(manager.acquire(owner_agent, owner.id)?)
}

/// Route a failed execution through the escalation ladder, preserve the
/// sandbox for diagnostics, and free the agent.
async fn fail_validation(
    deps: &ExecutionDeps,
    agent: &Agent,
    task: &Task,
    manager: &SandboxManager,
    sandbox: &Sandbox,
    should_retry: bool,
    reason: &str,
) -> Result<CycleOutcome> {
    warn!(task_id = %task.id, reason, "execution failed validation");

    let action =
        escalation::handle_gate_failure(&deps.pool, task, agent, should_retry, reason).await?;

    // Terminal routes count against the agent; retries do not.
    if action == LadderAction::HumanEscalation {
        let _ = agents::record_task_outcome(&deps.pool, agent.id, false, 0).await;
    }

    manager.release(sandbox, true);
    release_agent(&deps.pool, agent).await;

    Ok(CycleOutcome::FailedValidation {
        reason: reason.to_string(),
        action,
    })
}

/// Append the execution record and roll up its cost.
async fn record(
    deps: &ExecutionDeps,
    task: &Task,
    agent: &Agent,
    started_at: chrono::DateTime<Utc>,
    outcome: &str,
    cost: &BrainCost,
    brain_duration_ms: i64,
) -> Result<()> {
    executions::record_execution(
        &deps.pool,
        agent.organization_id,
        &NewExecutionRecord {
            task_id: task.id,
            agent_id: agent.id,
            attempt: task.retry_count,
            started_at,
            ended_at: Utc::now(),
            outcome: outcome.to_string(),
            input_tokens: cost.input_tokens,
            output_tokens: cost.output_tokens,
            cost_sub_cents: cost.sub_cents,
            brain_duration_ms,
        },
    )
    .await?;
    Ok(())
}

/// Return the agent to the idle pool. Tolerates CAS misses: an agent that
/// moved to another state keeps it.
pub async fn release_agent(pool: &PgPool, agent: &Agent) {
    if let Err(e) =
        agents::set_agent_status(pool, agent.id, AgentStatus::Working, AgentStatus::Idle).await
    {
        tracing::debug!(agent = %agent.name, error = %e, "agent not in working state on release");
    }
    if let Err(e) = agents::set_current_task(pool, agent.id, None).await {
        warn!(agent = %agent.name, error = %e, "failed to clear current task");
    }
}

/// Open a project's sandbox manager; helper shared with the review loop.
pub fn sandbox_manager_for(project: &Project) -> Result<SandboxManager> {
    SandboxManager::new(&project.working_dir)
        .with_context(|| format!("failed to open sandbox manager for {}", project.name))
}
