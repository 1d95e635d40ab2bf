//! Review and merge loop.
//!
//! Published change-sets flow through reviewer selection, review execution,
//! auto-merge, and the CI feedback loop. Completion fans out from here:
//! dependent unblocking, epic roll-up, goal completion, transient-agent
//! sweep, and the task-completed event the knowledge extractor consumes.

use anyhow::Result;
use serde::Deserialize;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use hollon_db::models::{
    Agent, AgentStatus, ChangeSet, ChangeSetStatus, GoalStatus, Task, TaskStatus,
};
use hollon_db::queries::executions::NewExecutionRecord;
use hollon_db::queries::{agents, change_sets, executions, goals, projects, roles, tasks};

use crate::decompose::plan_format::extract_plan;
use crate::error::CoreError;
use crate::escalation;
use crate::execution::{release_agent, resolve_sandbox, sandbox_manager_for, ExecutionDeps};
use crate::vcs::CiStatus;

/// Review classification by keyword scan over title + description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewClass {
    Security,
    Architecture,
    Performance,
    General,
}

impl ReviewClass {
    /// The role-name keyword a class-matching reviewer carries.
    pub fn keyword(self) -> Option<&'static str> {
        match self {
            Self::Security => Some("security"),
            Self::Architecture => Some("architecture"),
            Self::Performance => Some("performance"),
            Self::General => None,
        }
    }
}

/// Classify a task for reviewer selection.
pub fn classify(title: &str, description: &str) -> ReviewClass {
    let text = format!("{title} {description}").to_lowercase();

    const SECURITY: [&str; 5] = ["security", "auth", "credential", "vulnerab", "encrypt"];
    const ARCHITECTURE: [&str; 4] = ["architecture", "refactor", "redesign", "schema"];
    const PERFORMANCE: [&str; 4] = ["performance", "latency", "throughput", "optimiz"];

    if SECURITY.iter().any(|kw| text.contains(kw)) {
        ReviewClass::Security
    } else if ARCHITECTURE.iter().any(|kw| text.contains(kw)) {
        ReviewClass::Architecture
    } else if PERFORMANCE.iter().any(|kw| text.contains(kw)) {
        ReviewClass::Performance
    } else {
        ReviewClass::General
    }
}

// ---------------------------------------------------------------------------
// Reviewer selection
// ---------------------------------------------------------------------------

/// Pick and assign a reviewer for a published change-set.
///
/// Specialist classes seek an idle agent whose role name matches the class;
/// failing that, a transient reviewer is created under the author (subject
/// to the depth cap). General changes go to an idle team peer of the author
/// with the lowest active review load, then to any idle agent in the
/// organization. Returns `None` when nobody is available this tick -- the
/// review loop simply retries later.
pub async fn try_assign_reviewer(
    pool: &PgPool,
    task: &Task,
    change_set: &ChangeSet,
    author: &Agent,
) -> Result<Option<Agent>> {
    let class = classify(&task.title, &task.description);

    let reviewer = match class.keyword() {
        Some(keyword) => match find_specialist(pool, author, keyword).await? {
            Some(reviewer) => Some(reviewer),
            None => create_transient_reviewer(pool, author, keyword).await?,
        },
        None => find_general_reviewer(pool, author).await?,
    };

    let Some(reviewer) = reviewer else {
        return Ok(None);
    };

    if !change_sets::assign_reviewer(pool, change_set.id, reviewer.id).await? {
        // A racing assignment won; leave its reviewer in place.
        return Ok(None);
    }
    if let Err(e) =
        agents::set_agent_status(pool, reviewer.id, AgentStatus::Idle, AgentStatus::Reviewing).await
    {
        warn!(reviewer = %reviewer.name, error = %e, "reviewer busy after assignment");
    }
    info!(
        task_id = %task.id,
        reviewer = %reviewer.name,
        ?class,
        "reviewer assigned"
    );
    Ok(Some(reviewer))
}

/// An idle specialist whose role name matches the class keyword.
async fn find_specialist(pool: &PgPool, author: &Agent, keyword: &str) -> Result<Option<Agent>> {
    let idle = agents::list_idle_agents(pool, author.organization_id).await?;
    for candidate in idle {
        if candidate.id == author.id {
            continue;
        }
        let Some(role) = roles::get_role(pool, candidate.role_id).await? else {
            continue;
        };
        if role.name.to_lowercase().contains(keyword) {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

/// Create a transient specialist reviewer under the author, when an
/// eligible role exists and the depth cap allows it.
async fn create_transient_reviewer(
    pool: &PgPool,
    author: &Agent,
    keyword: &str,
) -> Result<Option<Agent>> {
    if author.depth >= 3 {
        return Ok(None);
    }
    let Some(role) =
        roles::find_transient_eligible_by_keyword(pool, author.organization_id, keyword).await?
    else {
        return Ok(None);
    };

    let name = format!("{}-{}-reviewer-{}", author.name, keyword, short(Uuid::new_v4()));
    let reviewer =
        agents::insert_transient_agent(pool, author, role.id, &name, &author.brain_provider)
            .await?;
    info!(reviewer = %reviewer.name, depth = reviewer.depth, "transient reviewer created");
    Ok(Some(reviewer))
}

/// Idle team peer with the lowest review load, falling back to any idle
/// agent in the organization, always excluding the author.
async fn find_general_reviewer(pool: &PgPool, author: &Agent) -> Result<Option<Agent>> {
    let peers: Vec<Agent> = agents::list_team_agents(pool, author.team_id)
        .await?
        .into_iter()
        .filter(|a| a.id != author.id && a.status == AgentStatus::Idle)
        .collect();

    if let Some(peer) = lowest_review_load(pool, peers).await? {
        return Ok(Some(peer));
    }

    let org_idle: Vec<Agent> = agents::list_idle_agents(pool, author.organization_id)
        .await?
        .into_iter()
        .filter(|a| a.id != author.id)
        .collect();
    lowest_review_load(pool, org_idle).await
}

async fn lowest_review_load(pool: &PgPool, candidates: Vec<Agent>) -> Result<Option<Agent>> {
    let mut best: Option<(i64, Agent)> = None;
    for candidate in candidates {
        let load = change_sets::count_active_reviews(pool, candidate.id).await?;
        match &best {
            Some((best_load, _)) if *best_load <= load => {}
            _ => best = Some((load, candidate)),
        }
    }
    Ok(best.map(|(_, agent)| agent))
}

// ---------------------------------------------------------------------------
// Review execution
// ---------------------------------------------------------------------------

/// The verdict envelope a reviewer emits.
#[derive(Debug, Clone, Deserialize)]
struct ReviewVerdict {
    verdict: String,
    #[serde(default)]
    comments: String,
}

/// Outcome of one review execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewOutcome {
    Approved,
    ChangesRequested,
    /// The reviewer could not produce a verdict; retried next tick.
    Deferred,
}

/// Run the review cycle for a change-set awaiting a verdict.
pub async fn run_review(deps: &ExecutionDeps, change_set: &ChangeSet) -> Result<ReviewOutcome> {
    let pool = &deps.pool;

    let Some(reviewer_id) = change_set.reviewer_agent_id else {
        return Ok(ReviewOutcome::Deferred);
    };
    let reviewer = agents::get_agent(pool, reviewer_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("agent {reviewer_id}")))?;
    let task = tasks::get_task(pool, change_set.task_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("task {}", change_set.task_id)))?;

    let Some(brain) = deps.brains.get(&reviewer.brain_provider) else {
        warn!(reviewer = %reviewer.name, "reviewer brain provider missing, deferring review");
        return Ok(ReviewOutcome::Deferred);
    };

    let prompt = review_prompt(pool, &reviewer, &task).await?;
    let started_at = chrono::Utc::now();
    let response = match brain.execute(&prompt, deps.brain_timeout).await {
        Ok(response) => response,
        Err(e) => {
            warn!(task_id = %task.id, error = %e, "review execution failed, deferring");
            return Ok(ReviewOutcome::Deferred);
        }
    };

    executions::record_execution(
        pool,
        reviewer.organization_id,
        &NewExecutionRecord {
            task_id: task.id,
            agent_id: reviewer.id,
            attempt: task.retry_count,
            started_at,
            ended_at: chrono::Utc::now(),
            outcome: "review".to_string(),
            input_tokens: response.cost.input_tokens,
            output_tokens: response.cost.output_tokens,
            cost_sub_cents: response.cost.sub_cents,
            brain_duration_ms: response.duration.as_millis() as i64,
        },
    )
    .await?;

    let Some(verdict) = parse_verdict(&response.output) else {
        warn!(task_id = %task.id, "unparseable review verdict, deferring");
        return Ok(ReviewOutcome::Deferred);
    };

    if !verdict.comments.is_empty() {
        change_sets::set_review_comments(pool, change_set.id, &verdict.comments).await?;
    }

    if verdict.verdict.eq_ignore_ascii_case("approve") {
        change_sets::set_status(
            pool,
            change_set.id,
            ChangeSetStatus::ReadyForReview,
            ChangeSetStatus::Approved,
        )
        .await?;
        tasks::set_task_status(pool, task.id, TaskStatus::InReview, TaskStatus::Approved).await?;
        finish_reviewing(pool, &reviewer).await;
        info!(task_id = %task.id, "review approved");

        // Auto-merge follows approval immediately; a failing required check
        // on the host comes back as a CI failure.
        let refreshed = change_sets::get_change_set(pool, change_set.id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("change set {}", change_set.id)))?;
        attempt_merge(deps, &refreshed).await?;
        Ok(ReviewOutcome::Approved)
    } else {
        change_sets::set_status(
            pool,
            change_set.id,
            ChangeSetStatus::ReadyForReview,
            ChangeSetStatus::ChangesRequested,
        )
        .await?;
        // The author re-executes with the review comments injected the same
        // way CI feedback is; its next publish re-opens this change-set.
        tasks::set_review_feedback(
            pool,
            task.id,
            &format!("Review requested changes:\n{}", verdict.comments),
        )
        .await?;
        tasks::set_task_status(pool, task.id, TaskStatus::InReview, TaskStatus::Ready).await?;
        finish_reviewing(pool, &reviewer).await;
        info!(task_id = %task.id, "review requested changes");
        Ok(ReviewOutcome::ChangesRequested)
    }
}

async fn review_prompt(pool: &PgPool, reviewer: &Agent, task: &Task) -> Result<String> {
    let role = roles::get_role(pool, reviewer.role_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("role {}", reviewer.role_id)))?;

    let mut prompt = String::new();
    prompt.push_str(&role.system_prompt);
    prompt.push_str(
        "\n\nReview the change-set for the task below. Respond with a JSON object \
         {\"verdict\": \"APPROVE\" | \"CHANGES_REQUESTED\", \"comments\": \"...\"}.\n\n",
    );
    prompt.push_str(&format!("Task: {}\n", task.title));
    prompt.push_str(task.description.trim());
    if !task.acceptance_criteria.is_empty() {
        prompt.push_str("\n\nAcceptance criteria:\n");
        for criterion in &task.acceptance_criteria {
            prompt.push_str(&format!("- {criterion}\n"));
        }
    }
    Ok(prompt)
}

fn parse_verdict(raw: &str) -> Option<ReviewVerdict> {
    if let Ok(verdict) = extract_plan::<ReviewVerdict>(raw) {
        return Some(verdict);
    }
    // Keyword fallback; CHANGES_REQUESTED is checked first because a
    // comment like "cannot approve" must not read as approval.
    let upper = raw.to_uppercase();
    if upper.contains("CHANGES_REQUESTED") || upper.contains("REQUEST CHANGES") {
        return Some(ReviewVerdict {
            verdict: "CHANGES_REQUESTED".into(),
            comments: raw.trim().to_string(),
        });
    }
    if upper.contains("APPROVE") {
        return Some(ReviewVerdict {
            verdict: "APPROVE".into(),
            comments: String::new(),
        });
    }
    None
}

/// Return a reviewer to the pool, retiring transient ones.
async fn finish_reviewing(pool: &PgPool, reviewer: &Agent) {
    if let Err(e) =
        agents::set_agent_status(pool, reviewer.id, AgentStatus::Reviewing, AgentStatus::Idle).await
    {
        tracing::debug!(reviewer = %reviewer.name, error = %e, "reviewer not in reviewing state");
    }
}

// ---------------------------------------------------------------------------
// Merge and completion
// ---------------------------------------------------------------------------

/// Merge an approved change-set. Failure is recorded as a CI failure and
/// retried through re-execution.
pub async fn attempt_merge(deps: &ExecutionDeps, change_set: &ChangeSet) -> Result<bool> {
    let pool = &deps.pool;
    let Some(review_number) = change_set.review_number else {
        return Ok(false);
    };

    match deps.host.merge(change_set.project_id, review_number).await {
        Ok(()) => {
            change_sets::set_status(
                pool,
                change_set.id,
                ChangeSetStatus::Approved,
                ChangeSetStatus::Merged,
            )
            .await?;
            let task = tasks::get_task(pool, change_set.task_id)
                .await?
                .ok_or_else(|| CoreError::NotFound(format!("task {}", change_set.task_id)))?;
            complete_task(deps, &task, change_set).await?;
            Ok(true)
        }
        Err(e) => {
            warn!(change_set = %change_set.id, error = %e, "merge failed, recording as CI failure");
            handle_ci_failure(deps, change_set, &format!("merge failed: {e}")).await?;
            Ok(false)
        }
    }
}

/// Drive a merged task to `completed` and fan out the consequences.
async fn complete_task(deps: &ExecutionDeps, task: &Task, change_set: &ChangeSet) -> Result<()> {
    let pool = &deps.pool;

    tasks::set_task_status(pool, task.id, TaskStatus::Approved, TaskStatus::Completed).await?;
    tasks::reset_consecutive_failures(pool, task.id).await?;

    // Author performance counters.
    let duration_ms = match (task.started_at, task.completed_at) {
        (Some(start), _) => (chrono::Utc::now() - start).num_milliseconds().max(0),
        _ => 0,
    };
    agents::record_task_outcome(pool, change_set.author_agent_id, true, duration_ms).await?;

    // Dependents whose last dependency just completed become ready.
    let unblocked = tasks::unblock_dependents(pool, task.id).await?;
    for dependent in &unblocked {
        info!(task_id = %dependent.id, "dependent task unblocked");
    }

    // Release the task's sandbox.
    if let Some(author) = agents::get_agent(pool, change_set.author_agent_id).await? {
        if let Some(project) = projects::get_project(pool, task.project_id).await? {
            if let Ok(manager) = sandbox_manager_for(&project) {
                if let Ok(sandbox) = resolve_sandbox(pool, &manager, author.id, task).await {
                    // Only the sandbox owner's own completion removes the
                    // working copy; subtasks leave the parent's in place.
                    if sandbox.task_id == task.id {
                        manager.release(&sandbox, false);
                    }
                }
            }
        }

        // Transient agents spun up for this task are destroyed with it.
        let retired = agents::retire_transient_descendants(pool, author.id).await?;
        if retired > 0 {
            info!(author = %author.name, retired, "transient agents retired");
        }
    }

    // Epic roll-up and goal completion.
    roll_up_ancestors(pool, task).await?;
    if let Some(goal_id) = task.goal_id {
        check_goal_completion(pool, goal_id).await?;
    }

    // The task-completed event is the knowledge extractor's hand-off; it
    // carries the task, the change-set reference, and the execution trail.
    info!(
        target: "hollon::events",
        event = "task_completed",
        task_id = %task.id,
        change_set_id = %change_set.id,
        review_url = change_set.review_url.as_deref().unwrap_or(""),
        "task completed"
    );

    Ok(())
}

/// Complete parent chains whose children have all completed.
async fn roll_up_ancestors(pool: &PgPool, task: &Task) -> Result<()> {
    let mut cursor = task.parent_task_id;
    while let Some(parent_id) = cursor {
        let Some(parent) = tasks::get_task(pool, parent_id).await? else {
            break;
        };
        let children = tasks::list_children(pool, parent_id).await?;
        let all_done = children
            .iter()
            .all(|c| c.status == TaskStatus::Completed);
        if !all_done || parent.status != TaskStatus::InProgress {
            break;
        }
        tasks::set_task_status(pool, parent_id, TaskStatus::InProgress, TaskStatus::Completed)
            .await?;
        tasks::unblock_dependents(pool, parent_id).await?;
        info!(task_id = %parent_id, "epic completed");
        cursor = parent.parent_task_id;
    }
    Ok(())
}

/// Complete a goal when every one of its tasks has completed.
async fn check_goal_completion(pool: &PgPool, goal_id: Uuid) -> Result<()> {
    let progress = tasks::get_goal_progress(pool, goal_id).await?;
    if progress.all_completed() {
        goals::update_goal_status(pool, goal_id, GoalStatus::Completed).await?;
        info!(goal_id = %goal_id, "goal completed");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// CI feedback loop
// ---------------------------------------------------------------------------

/// Poll CI for one watchable change-set and apply the feedback rules.
pub async fn process_ci(deps: &ExecutionDeps, change_set: &ChangeSet) -> Result<()> {
    let Some(review_number) = change_set.review_number else {
        return Ok(());
    };

    let status = match deps
        .host
        .ci_status(change_set.project_id, review_number)
        .await
    {
        Ok(status) => status,
        Err(e) => {
            // CI pollers retry forever; a host hiccup waits for next tick.
            warn!(change_set = %change_set.id, error = %e, "CI status unavailable");
            return Ok(());
        }
    };

    match status {
        CiStatus::Pending => Ok(()),
        CiStatus::Passing => {
            if change_set.status == ChangeSetStatus::Approved {
                attempt_merge(deps, change_set).await?;
            }
            Ok(())
        }
        CiStatus::Failing { summary } => handle_ci_failure(deps, change_set, &summary).await,
    }
}

/// Apply the CI-failure rules: bounded re-execution with feedback, then a
/// level-4 escalation once the CI retry budget is spent.
async fn handle_ci_failure(deps: &ExecutionDeps, change_set: &ChangeSet, summary: &str) -> Result<()> {
    let pool = &deps.pool;
    let task = tasks::get_task(pool, change_set.task_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("task {}", change_set.task_id)))?;

    let within_budget = tasks::record_ci_failure(pool, task.id, summary).await?;
    if within_budget {
        // Close the change-set and return the task to the pool; the next
        // cycle re-composes the prompt with the captured feedback.
        if let Some(review_number) = change_set.review_number {
            if let Err(e) = deps
                .host
                .close_review(change_set.project_id, review_number)
                .await
            {
                warn!(change_set = %change_set.id, error = %e, "failed to close review on host");
            }
        }
        change_sets::set_status(pool, change_set.id, change_set.status, ChangeSetStatus::Closed)
            .await?;

        let current = tasks::get_task(pool, task.id)
            .await?
            .map(|t| t.status)
            .unwrap_or(task.status);
        let from = if current == TaskStatus::Approved {
            TaskStatus::Approved
        } else {
            TaskStatus::InReview
        };
        tasks::set_task_status(pool, task.id, from, TaskStatus::Ready).await?;

        // Release the sandbox; the re-execution re-acquires it.
        if let Some(author) = agents::get_agent(pool, change_set.author_agent_id).await? {
            if let Some(project) = projects::get_project(pool, task.project_id).await? {
                if let Ok(manager) = sandbox_manager_for(&project) {
                    if let Ok(sandbox) = resolve_sandbox(pool, &manager, author.id, &task).await {
                        manager.release(&sandbox, false);
                    }
                }
            }
            release_agent(pool, &author).await;
        }

        info!(
            task_id = %task.id,
            ci_retry = task.ci_retry_count + 1,
            "CI failed, task returned for re-execution"
        );
    } else {
        warn!(task_id = %task.id, "CI retry budget exhausted, escalating to human");
        escalation::escalate_to_human(pool, &task, None, &format!("CI kept failing: {summary}"))
            .await?;
    }
    Ok(())
}

fn short(id: Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}
