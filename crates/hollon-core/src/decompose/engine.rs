//! The two decomposition phases.
//!
//! Phase A turns an undecomposed goal into `team_epic` tasks, one per epic
//! the goal's owner agent plans, assigned to teams resolved by name. Phase B
//! turns a ready epic into leaf tasks planned by the epic's team manager,
//! with dependency edges translated from titles to task ids.
//!
//! Both phases are 3-strike: a parse or validation failure increments a
//! retry counter and reschedules (the next decompose tick retries); the
//! third failure is terminal -- the goal is failed, or the epic is blocked
//! and escalated to its manager.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use hollon_db::models::{Agent, AgentStatus, Goal, GoalStatus, Task, TaskPriority, TaskStatus};
use hollon_db::queries::tasks::NewTask;
use hollon_db::queries::{agents, escalations, goals, tasks, teams};

use crate::brain::BrainRegistry;
use crate::error::CoreError;

use super::plan_format::{extract_plan, EpicPlan, SubtaskPlan};
use super::validate::validate_plan;

/// Terminal failure threshold for either phase.
const MAX_PLAN_RETRIES: i32 = 3;

/// Cooldown applied when an epic is blocked after exhausting plan retries.
const EPIC_BLOCK_COOLDOWN: Duration = Duration::from_secs(600);

/// Outcome of one decomposition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecomposeOutcome {
    /// Tasks were created.
    Decomposed { created: usize },
    /// Another decomposition won the CAS; nothing to do.
    AlreadyDecomposed,
    /// The attempt failed; it will be retried on a later tick.
    RetryScheduled { error: String },
    /// The retry budget is exhausted; the goal or epic is now terminal.
    TerminalFailure { error: String },
}

// ---------------------------------------------------------------------------
// Phase A: goal -> team epics
// ---------------------------------------------------------------------------

/// Decompose a goal into team epics.
pub async fn decompose_goal(
    pool: &PgPool,
    brains: &BrainRegistry,
    goal: &Goal,
    brain_timeout: Duration,
) -> Result<DecomposeOutcome> {
    let owner = agents::get_agent(pool, goal.owner_agent_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("agent {}", goal.owner_agent_id)))?;

    let brain = brains
        .get(&owner.brain_provider)
        .ok_or_else(|| CoreError::NotFound(format!("brain provider {}", owner.brain_provider)))?;

    let prompt = phase_a_prompt(pool, goal).await?;

    let plan = match brain.execute(&prompt, brain_timeout).await {
        Ok(response) => match extract_plan::<EpicPlan>(&response.output) {
            Ok(plan) => plan,
            Err(e) => return phase_a_failure(pool, goal, &e.to_string()).await,
        },
        Err(e) => return phase_a_failure(pool, goal, &e.to_string()).await,
    };

    if plan.epics.is_empty() {
        return phase_a_failure(pool, goal, "plan contains no epics").await;
    }

    // Resolve every team by name before creating anything.
    let mut new_epics = Vec::with_capacity(plan.epics.len());
    for epic in &plan.epics {
        let Some(team) = teams::find_team_by_name(pool, goal.organization_id, &epic.team).await?
        else {
            return phase_a_failure(
                pool,
                goal,
                &format!("epic {:?} names unknown team {:?}", epic.title, epic.team),
            )
            .await;
        };

        let priority: TaskPriority = match epic.priority.parse() {
            Ok(p) => p,
            Err(_) => {
                return phase_a_failure(
                    pool,
                    goal,
                    &format!("epic {:?} has invalid priority {:?}", epic.title, epic.priority),
                )
                .await;
            }
        };

        let mut task = NewTask::leaf(goal.project_id, &epic.title);
        task.goal_id = Some(goal.id);
        task.assigned_team_id = Some(team.id);
        task.priority = priority;
        task.description = epic.description.clone();
        new_epics.push(task);
    }

    match goals::mark_decomposed_with_epics(pool, goal.id, &new_epics).await? {
        Some(created) => {
            info!(goal_id = %goal.id, epics = created.len(), "goal decomposed into epics");
            Ok(DecomposeOutcome::Decomposed {
                created: created.len(),
            })
        }
        None => Ok(DecomposeOutcome::AlreadyDecomposed),
    }
}

async fn phase_a_failure(pool: &PgPool, goal: &Goal, error: &str) -> Result<DecomposeOutcome> {
    let retries = goals::bump_decompose_retry(pool, goal.id, error).await?;
    if retries >= MAX_PLAN_RETRIES {
        warn!(goal_id = %goal.id, error, "goal decomposition exhausted retries, failing goal");
        goals::update_goal_status(pool, goal.id, GoalStatus::Failed).await?;
        return Ok(DecomposeOutcome::TerminalFailure {
            error: error.to_string(),
        });
    }
    Ok(DecomposeOutcome::RetryScheduled {
        error: error.to_string(),
    })
}

async fn phase_a_prompt(pool: &PgPool, goal: &Goal) -> Result<String> {
    let team_list = teams::list_teams(pool, goal.organization_id)
        .await
        .context("failed to list teams for decomposition prompt")?;

    let mut prompt = String::new();
    prompt.push_str(
        "Break the following goal into team-level epics. Respond with a JSON object \
         of the shape {\"epics\": [{\"title\", \"description\", \"team\", \"priority\"}]}, \
         where team is one of the team names listed below and priority is p1..p4.\n\n",
    );
    let _ = writeln!(prompt, "Goal: {}", goal.title);
    prompt.push_str(goal.description.trim());
    prompt.push('\n');
    if !goal.success_criteria.is_empty() {
        prompt.push_str("\nSuccess criteria:\n");
        for criterion in &goal.success_criteria {
            let _ = writeln!(prompt, "- {criterion}");
        }
    }
    prompt.push_str("\nTeams:\n");
    for team in &team_list {
        let _ = writeln!(prompt, "- {}: {}", team.name, team.description_prompt);
    }
    Ok(prompt)
}

// ---------------------------------------------------------------------------
// Phase B: team epic -> leaf tasks
// ---------------------------------------------------------------------------

/// Decompose a ready epic into leaf tasks planned by its team manager.
pub async fn decompose_epic(
    pool: &PgPool,
    brains: &BrainRegistry,
    epic: &Task,
    brain_timeout: Duration,
) -> Result<DecomposeOutcome> {
    let team_id = epic
        .assigned_team_id
        .ok_or_else(|| CoreError::InvariantViolation(format!("epic {} has no team", epic.id)))?;
    let team = teams::get_team(pool, team_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("team {team_id}")))?;
    let manager_id = team.manager_agent_id.ok_or_else(|| {
        CoreError::InvariantViolation(format!("team {} has no manager", team.id))
    })?;
    let manager = agents::get_agent(pool, manager_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("agent {manager_id}")))?;

    let brain = brains
        .get(&manager.brain_provider)
        .ok_or_else(|| CoreError::NotFound(format!("brain provider {}", manager.brain_provider)))?;

    let members: Vec<Agent> = agents::list_team_agents(pool, team_id)
        .await?
        .into_iter()
        .filter(|a| a.status != AgentStatus::Offline)
        .collect();
    let member_names: Vec<String> = members.iter().map(|a| a.name.clone()).collect();

    let prompt = phase_b_prompt(epic, &team.name, &members);

    let plan = match brain.execute(&prompt, brain_timeout).await {
        Ok(response) => match extract_plan::<SubtaskPlan>(&response.output) {
            Ok(plan) => plan,
            Err(e) => return phase_b_failure(pool, epic, &manager, &e.to_string()).await,
        },
        Err(e) => return phase_b_failure(pool, epic, &manager, &e.to_string()).await,
    };

    let validated = match validate_plan(&plan, &member_names) {
        Ok(validated) => validated,
        Err(e) => return phase_b_failure(pool, epic, &manager, &e.to_string()).await,
    };

    let by_name: HashMap<String, Uuid> = members
        .iter()
        .map(|a| (a.name.to_lowercase(), a.id))
        .collect();

    // Materialize in topological order so dependency edges always reference
    // already-inserted tasks.
    let mut id_by_title: HashMap<String, Uuid> = HashMap::new();
    for subtask in &validated.ordered {
        let spec = &subtask.spec;
        let assignee = by_name[&spec.assignee.to_lowercase()];

        let new_task = NewTask {
            project_id: epic.project_id,
            goal_id: epic.goal_id,
            parent_task_id: Some(epic.id),
            assigned_team_id: None,
            assigned_agent_id: Some(assignee),
            task_type: subtask.task_type,
            priority: subtask.priority,
            complexity: subtask.complexity,
            required_capabilities: spec.required_capabilities.clone(),
            affected_files: spec.affected_files.clone(),
            title: spec.title.clone(),
            description: spec.description.clone(),
            acceptance_criteria: spec.acceptance_criteria.clone(),
        };
        let created = tasks::insert_task(pool, &new_task).await?;

        for dep_title in &spec.depends_on {
            let dep_id = id_by_title[dep_title];
            tasks::insert_task_dependency(pool, created.id, dep_id).await?;
        }
        id_by_title.insert(spec.title.clone(), created.id);
    }

    tasks::set_task_status(pool, epic.id, epic.status, TaskStatus::InProgress).await?;

    info!(
        epic_id = %epic.id,
        subtasks = validated.ordered.len(),
        "epic decomposed into leaf tasks"
    );
    Ok(DecomposeOutcome::Decomposed {
        created: validated.ordered.len(),
    })
}

async fn phase_b_failure(
    pool: &PgPool,
    epic: &Task,
    manager: &Agent,
    error: &str,
) -> Result<DecomposeOutcome> {
    let retries = tasks::bump_plan_retry(pool, epic.id, error).await?;
    if retries >= MAX_PLAN_RETRIES {
        warn!(epic_id = %epic.id, error, "epic decomposition exhausted retries, blocking epic");
        let blocked_until = chrono::Utc::now()
            + chrono::Duration::from_std(EPIC_BLOCK_COOLDOWN).unwrap_or_default();
        tasks::block_task(pool, epic.id, epic.status, blocked_until, error).await?;
        escalations::insert_escalation(
            pool,
            epic.id,
            3,
            &format!("epic decomposition failed after {retries} attempts: {error}"),
            Some(manager.id),
        )
        .await?;
        return Ok(DecomposeOutcome::TerminalFailure {
            error: error.to_string(),
        });
    }
    Ok(DecomposeOutcome::RetryScheduled {
        error: error.to_string(),
    })
}

fn phase_b_prompt(epic: &Task, team_name: &str, members: &[Agent]) -> String {
    let mut prompt = String::new();
    prompt.push_str(
        "Break the following epic into at most 10 leaf subtasks for your team. Respond \
         with a JSON object of the shape {\"subtasks\": [{\"title\", \"description\", \
         \"assignee\", \"task_type\", \"priority\", \"complexity\", \"depends_on\", \
         \"affected_files\", \"acceptance_criteria\"}]}. Assignees must be team members \
         listed below; depends_on references other subtasks by title and must not form \
         a cycle.\n\n",
    );
    let _ = writeln!(prompt, "Team: {team_name}");
    let _ = writeln!(prompt, "Epic: {}", epic.title);
    prompt.push_str(epic.description.trim());
    prompt.push_str("\n\nTeam members:\n");
    for member in members {
        let _ = writeln!(prompt, "- {}", member.name);
    }
    prompt
}
