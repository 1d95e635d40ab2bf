//! The five-level escalation ladder.
//!
//! Entered whenever the gate fails an execution. Each level is tried in
//! order until one applies:
//!
//! 1. **Self-retry** -- retry budget remains and the failure is retryable:
//!    the task returns to `ready` unassigned and the pool re-offers it.
//! 2. **Teammate retry** -- a capability-overlapping idle peer exists: the
//!    task returns to `ready` pre-assigned to the least-loaded peer.
//! 3. **Manager** -- the team has a manager: an escalation record is filed
//!    and the task blocks for a cooldown pending the manager's decision.
//! 4. **Human** -- no manager, or the failure is non-retryable (budget):
//!    a level-4 record is filed and the task blocks until a human decides.
//! 5. **Terminal** -- 48 hours without a decision, or explicit rejection:
//!    the task fails and its parent blocks pending a re-plan.
//!
//! The consecutive-failure counter is per task and resets on success.

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use hollon_db::models::{Agent, Task, TaskStatus};
use hollon_db::queries::{agents, change_sets, escalations, tasks, teams};

use crate::taskpool;

/// Cooldown while a manager escalation is pending.
pub const MANAGER_COOLDOWN: Duration = Duration::from_secs(600);

/// Window a human has to decide a level-4 escalation.
pub const HUMAN_DECISION_WINDOW_HOURS: i64 = 48;

/// Which rung of the ladder handled a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LadderAction {
    SelfRetry,
    PeerRetry { peer_id: Uuid },
    ManagerEscalation,
    HumanEscalation,
}

/// Route a gate failure for an in-progress task through the ladder.
pub async fn handle_gate_failure(
    pool: &PgPool,
    task: &Task,
    agent: &Agent,
    should_retry: bool,
    reason: &str,
) -> Result<LadderAction> {
    tasks::set_error_message(pool, task.id, reason).await?;

    // Non-retryable failures (cost ceiling) go straight to a human.
    if !should_retry {
        return escalate_to_human(pool, task, Some(agent.id), reason).await;
    }

    // Level 1: self-retry while budget remains.
    if task.retry_count < 3 {
        let rows = tasks::retry_task(pool, task.id, task.retry_count).await?;
        if rows > 0 {
            info!(task_id = %task.id, retry = task.retry_count + 1, "self-retry scheduled");
            return Ok(LadderAction::SelfRetry);
        }
        // CAS miss: someone else moved the task; fall through to higher
        // levels against its current state.
    }

    // Level 2: a capable idle teammate.
    let capabilities = taskpool::agent_capabilities(pool, agent).await?;
    let peers = agents::find_capable_peers(pool, agent, &capabilities).await?;
    if let Some(peer) = least_loaded(pool, peers).await? {
        let rows = tasks::reassign_to_peer(pool, task.id, peer.id).await?;
        if rows > 0 {
            info!(task_id = %task.id, peer = %peer.name, "task reassigned to teammate");
            return Ok(LadderAction::PeerRetry { peer_id: peer.id });
        }
    }

    // Level 3: the team's manager.
    let team = teams::get_team(pool, agent.team_id).await?;
    if let Some(manager_id) = team.and_then(|t| t.manager_agent_id) {
        // A manager escalating its own failure skips to level 4.
        if manager_id != agent.id {
            escalations::insert_escalation(
                pool,
                task.id,
                3,
                &format!("retries exhausted: {reason}"),
                Some(agent.id),
            )
            .await?;
            let blocked_until =
                Utc::now() + chrono::Duration::from_std(MANAGER_COOLDOWN).unwrap_or_default();
            tasks::block_task(pool, task.id, TaskStatus::InProgress, blocked_until, reason).await?;
            info!(task_id = %task.id, manager = %manager_id, "escalated to team manager");
            return Ok(LadderAction::ManagerEscalation);
        }
    }

    // Level 4: no manager to turn to.
    escalate_to_human(pool, task, Some(agent.id), reason).await
}

/// File a level-4 record and block the task pending a human decision.
pub async fn escalate_to_human(
    pool: &PgPool,
    task: &Task,
    requested_by: Option<Uuid>,
    reason: &str,
) -> Result<LadderAction> {
    escalations::insert_escalation(pool, task.id, 4, reason, requested_by).await?;
    let blocked_until = Utc::now() + chrono::Duration::hours(HUMAN_DECISION_WINDOW_HOURS);
    // The task may arrive here from several states; tolerate a CAS miss on
    // all but the common ones.
    let current = tasks::get_task(pool, task.id)
        .await?
        .map(|t| t.status)
        .unwrap_or(task.status);
    if !current.is_terminal() && current != TaskStatus::Blocked {
        tasks::block_task(pool, task.id, current, blocked_until, reason).await?;
    }
    warn!(task_id = %task.id, reason, "task awaiting human decision");
    Ok(LadderAction::HumanEscalation)
}

/// Manager resolution of a level-3 escalation: `retry` re-creates the task
/// as a fresh attempt; anything else fails it terminally.
pub async fn resolve_manager_escalation(
    pool: &PgPool,
    escalation_id: Uuid,
    task_id: Uuid,
    manager_id: Uuid,
    retry: bool,
) -> Result<()> {
    let decision = if retry { "retry" } else { "fail" };
    escalations::resolve_escalation(pool, escalation_id, Some(manager_id), decision).await?;

    if retry {
        tasks::reset_for_fresh_attempt(pool, task_id).await?;
    } else {
        tasks::set_task_status(pool, task_id, TaskStatus::Blocked, TaskStatus::Failed).await?;
        fail_parent_pending_replan(pool, task_id).await?;
    }
    Ok(())
}

/// Human resolution of a level-4 escalation: `retry` re-creates the task
/// as a fresh attempt; rejection is terminal (level 5) and blocks the
/// parent pending a re-plan.
pub async fn resolve_human_escalation(
    pool: &PgPool,
    escalation_id: Uuid,
    task_id: Uuid,
    retry: bool,
) -> Result<()> {
    let decision = if retry { "retry" } else { "reject" };
    escalations::resolve_escalation(pool, escalation_id, None, decision).await?;

    if retry {
        tasks::reset_for_fresh_attempt(pool, task_id).await?;
    } else {
        escalations::insert_escalation(pool, task_id, 5, "rejected by human", None).await?;
        tasks::set_task_status(pool, task_id, TaskStatus::Blocked, TaskStatus::Failed).await?;
        fail_parent_pending_replan(pool, task_id).await?;
    }
    Ok(())
}

/// Decision envelope a manager emits when resolving an escalation.
#[derive(Debug, serde::Deserialize)]
struct ManagerDecision {
    decision: String,
}

/// Drive pending level-3 escalations to a manager decision.
///
/// For each undecided manager escalation whose task is still blocked and
/// whose cooldown has passed, the team's manager is asked (through its own
/// brain) whether to retry or fail. An absent manager, or one that cannot
/// produce a verdict, hands the task to level 4.
pub async fn resolve_pending_manager_escalations(
    pool: &PgPool,
    brains: &crate::brain::BrainRegistry,
    brain_timeout: Duration,
) -> Result<()> {
    for escalation in escalations::list_pending_manager_escalations(pool).await? {
        let Some(task_id) = escalation.task_id else {
            continue;
        };
        let Some(task) = tasks::get_task(pool, task_id).await? else {
            continue;
        };
        if task.status != TaskStatus::Blocked {
            // Resolved through another path; close the record.
            escalations::resolve_escalation(pool, escalation.id, None, "superseded").await?;
            continue;
        }
        if task.blocked_until.is_some_and(|until| until > Utc::now()) {
            continue;
        }

        let manager = manager_for_escalation(pool, &escalation).await?;
        let Some(manager) = manager else {
            hand_to_level_four(pool, &escalation, task_id, "manager absent").await?;
            continue;
        };
        let Some(brain) = brains.get(&manager.brain_provider) else {
            hand_to_level_four(pool, &escalation, task_id, "manager brain unavailable").await?;
            continue;
        };

        let prompt = format!(
            "A task your team owns has exhausted its retries.\n\n\
             Task: {}\n{}\n\nFailure: {}\n\n\
             Decide whether the team should attempt it again from scratch or \
             give up. Respond with a JSON object \
             {{\"decision\": \"retry\" | \"fail\"}}.",
            task.title,
            task.description.trim(),
            escalation.reason,
        );

        match brain.execute(&prompt, brain_timeout).await {
            Ok(response) => match parse_manager_decision(&response.output) {
                Some(retry) => {
                    resolve_manager_escalation(pool, escalation.id, task_id, manager.id, retry)
                        .await?;
                    info!(
                        task_id = %task_id,
                        manager = %manager.name,
                        retry,
                        "manager resolved escalation"
                    );
                }
                None => {
                    hand_to_level_four(pool, &escalation, task_id, "manager verdict unparseable")
                        .await?;
                }
            },
            Err(e) => {
                // Transient brain trouble: leave undecided, next tick retries.
                warn!(task_id = %task_id, error = %e, "manager resolution deferred");
            }
        }
    }
    Ok(())
}

/// The manager responsible for an escalation: the requesting agent's team
/// manager.
async fn manager_for_escalation(
    pool: &PgPool,
    escalation: &hollon_db::models::Escalation,
) -> Result<Option<Agent>> {
    let Some(requester_id) = escalation.requested_by_agent_id else {
        return Ok(None);
    };
    let Some(requester) = agents::get_agent(pool, requester_id).await? else {
        return Ok(None);
    };
    let Some(team) = teams::get_team(pool, requester.team_id).await? else {
        return Ok(None);
    };
    let Some(manager_id) = team.manager_agent_id else {
        return Ok(None);
    };
    agents::get_agent(pool, manager_id).await
}

/// Close a level-3 record as escalated and file the level-4 record; the
/// task stays blocked for a human.
async fn hand_to_level_four(
    pool: &PgPool,
    escalation: &hollon_db::models::Escalation,
    task_id: Uuid,
    reason: &str,
) -> Result<()> {
    escalations::resolve_escalation(pool, escalation.id, None, "escalated").await?;
    escalations::insert_escalation(pool, task_id, 4, reason, escalation.requested_by_agent_id)
        .await?;
    warn!(task_id = %task_id, reason, "manager escalation handed to level 4");
    Ok(())
}

fn parse_manager_decision(raw: &str) -> Option<bool> {
    if let Ok(decision) = crate::decompose::plan_format::extract_plan::<ManagerDecision>(raw) {
        return match decision.decision.to_lowercase().as_str() {
            "retry" => Some(true),
            "fail" => Some(false),
            _ => None,
        };
    }
    let lowered = raw.to_lowercase();
    if lowered.contains("retry") {
        Some(true)
    } else if lowered.contains("fail") {
        Some(false)
    } else {
        None
    }
}

/// Level-5 sweep: fail tasks whose level-4 escalation has waited past the
/// human-decision window. Returns the ids of the tasks failed.
pub async fn sweep_stale_escalations(pool: &PgPool) -> Result<Vec<Uuid>> {
    let stale = escalations::list_stale_human_escalations(pool, HUMAN_DECISION_WINDOW_HOURS).await?;

    let mut failed = Vec::new();
    for escalation in stale {
        let Some(task_id) = escalation.task_id else {
            continue;
        };
        escalations::resolve_escalation(pool, escalation.id, None, "expired").await?;
        escalations::insert_escalation(pool, task_id, 5, "no human decision within the window", None)
            .await?;

        let Some(task) = tasks::get_task(pool, task_id).await? else {
            continue;
        };
        if task.status == TaskStatus::Blocked {
            tasks::set_task_status(pool, task.id, TaskStatus::Blocked, TaskStatus::Failed).await?;
            fail_parent_pending_replan(pool, task.id).await?;
            failed.push(task.id);
            warn!(task_id = %task.id, "level-5 terminal failure");
        }
    }
    Ok(failed)
}

/// Block a failed task's parent pending a re-plan, and retire the failed
/// author's transient helpers -- terminal failure destroys them the same
/// way completion does.
async fn fail_parent_pending_replan(pool: &PgPool, task_id: Uuid) -> Result<()> {
    let Some(task) = tasks::get_task(pool, task_id).await? else {
        return Ok(());
    };
    if let Some(author_id) = task.assigned_agent_id {
        agents::retire_transient_descendants(pool, author_id).await?;
    }
    let Some(parent_id) = task.parent_task_id else {
        return Ok(());
    };
    let Some(parent) = tasks::get_task(pool, parent_id).await? else {
        return Ok(());
    };
    if parent.status.is_terminal() || parent.status == TaskStatus::Blocked {
        return Ok(());
    }
    let blocked_until = Utc::now() + chrono::Duration::hours(HUMAN_DECISION_WINDOW_HOURS);
    tasks::block_task(
        pool,
        parent_id,
        parent.status,
        blocked_until,
        "child task failed terminally; awaiting re-plan",
    )
    .await?;
    Ok(())
}

/// The idle peer with the lowest active review load, first-created winning
/// ties.
async fn least_loaded(pool: &PgPool, peers: Vec<Agent>) -> Result<Option<Agent>> {
    let mut best: Option<(i64, Agent)> = None;
    for peer in peers {
        let load = change_sets::count_active_reviews(pool, peer.id).await?;
        match &best {
            Some((best_load, _)) if *best_load <= load => {}
            _ => best = Some((load, peer)),
        }
    }
    Ok(best.map(|(_, agent)| agent))
}
