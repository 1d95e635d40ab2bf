//! Control-plane loops -- the periodic schedulers that drive the system.
//!
//! Three cooperative loops share a cancellation token and tick on a fixed
//! short period (jittered so a fleet of processes does not align):
//!
//! 1. **Decompose**: undecomposed goals through phase A, ready epics
//!    through phase B.
//! 2. **Execute**: per organization, admit through the governor, then fan
//!    out idle agents to execution cycles under the in-flight dedup set.
//! 3. **Review/CI**: backfill missing reviewer assignments, run pending
//!    reviews, poll CI, sweep stale escalations.
//!
//! Loops are stateless across ticks -- every decision re-reads the store.
//! A loop may lag; catching up is natural.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use hollon_db::models::{AgentStatus, ChangeSetStatus, GoalStatus};
use hollon_db::queries::{agents, change_sets, goals, orgs, tasks};

use crate::decompose;
use crate::escalation;
use crate::execution::{run_execution_cycle, ExecutionDeps};
use crate::governor::{Governor, OrgAdmission};
use crate::review;

/// Loop timing knobs.
#[derive(Debug, Clone, Copy)]
pub struct LoopConfig {
    /// Base tick period for all three loops.
    pub period: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(10),
        }
    }
}

/// Run all three control loops until cancelled.
///
/// On startup, tasks stranded `in_progress` by a previous process are reset
/// to `ready`; the claim CAS makes the reset safe even if the old process
/// still lives.
pub async fn run_control_loops(
    deps: Arc<ExecutionDeps>,
    governor: Arc<Governor>,
    config: LoopConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let orphaned = tasks::reset_orphaned_tasks(&deps.pool).await?;
    for orphan in &orphaned {
        warn!(task_id = %orphan.id, task = %orphan.title, "reset orphaned task to ready");
    }

    let decompose_loop = tick_loop("decompose", config, cancel.clone(), {
        let deps = Arc::clone(&deps);
        move || {
            let deps = Arc::clone(&deps);
            async move { decompose_tick(&deps).await }
        }
    });

    let execute_loop = tick_loop("execute", config, cancel.clone(), {
        let deps = Arc::clone(&deps);
        let governor = Arc::clone(&governor);
        move || {
            let deps = Arc::clone(&deps);
            let governor = Arc::clone(&governor);
            async move { execute_tick(deps, governor).await }
        }
    });

    let review_loop = tick_loop("review", config, cancel.clone(), {
        let deps = Arc::clone(&deps);
        move || {
            let deps = Arc::clone(&deps);
            async move { review_tick(&deps).await }
        }
    });

    tokio::try_join!(decompose_loop, execute_loop, review_loop)?;
    info!("control loops stopped");
    Ok(())
}

/// Drive one named tick function on the configured period until cancelled.
/// Tick errors are logged, never fatal: the next tick retries naturally.
async fn tick_loop<F, Fut>(
    name: &'static str,
    config: LoopConfig,
    cancel: CancellationToken,
    mut tick: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    // Jitter the start so multiple processes do not tick in lockstep.
    let jitter = Duration::from_millis(rand::rng().random_range(0..500));
    tokio::time::sleep(jitter).await;

    let mut interval = tokio::time::interval(config.period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = tick().await {
                    warn!(loop_name = name, error = %e, "tick failed");
                }
            }
            _ = cancel.cancelled() => {
                info!(loop_name = name, "loop cancelled");
                return Ok(());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Ticks
// ---------------------------------------------------------------------------

/// Decompose tick: phase A for undecomposed goals, phase B for ready epics.
pub async fn decompose_tick(deps: &ExecutionDeps) -> Result<()> {
    let pool = &deps.pool;

    for goal in goals::list_undecomposed_goals(pool).await? {
        if let Err(e) =
            decompose::decompose_goal(pool, &deps.brains, &goal, deps.brain_timeout).await
        {
            warn!(goal_id = %goal.id, error = %e, "goal decomposition errored");
        }
    }

    for epic in tasks::list_decomposable_epics(pool).await? {
        if let Err(e) =
            decompose::decompose_epic(pool, &deps.brains, &epic, deps.brain_timeout).await
        {
            warn!(epic_id = %epic.id, error = %e, "epic decomposition errored");
        }
    }

    Ok(())
}

/// Execute tick: fan out eligible idle agents to execution cycles.
pub async fn execute_tick(deps: Arc<ExecutionDeps>, governor: Arc<Governor>) -> Result<()> {
    let pool = deps.pool.clone();

    for org in orgs::list_organizations(&pool).await? {
        let slots = match governor.admit(&pool, &org).await? {
            OrgAdmission::Stopped => continue,
            OrgAdmission::CapTripped { reason } => {
                warn!(org = %org.name, reason, "organization stopped by governor");
                continue;
            }
            OrgAdmission::Slots(slots) => slots,
        };
        if slots == 0 {
            continue;
        }

        let idle = agents::list_idle_agents(&pool, org.id).await?;
        let mut launched = 0usize;

        for agent in idle {
            if launched >= slots {
                break;
            }
            if !governor.try_begin(agent.id) {
                continue;
            }
            launched += 1;

            let deps = Arc::clone(&deps);
            let governor = Arc::clone(&governor);
            tokio::spawn(async move {
                let agent_id = agent.id;
                match run_execution_cycle(&deps, &agent).await {
                    Ok(outcome) => {
                        tracing::debug!(agent = %agent.name, ?outcome, "cycle finished");
                    }
                    Err(e) => {
                        warn!(agent = %agent.name, error = %e, "cycle errored");
                    }
                }
                governor.finish(agent_id);
            });
        }
    }

    Ok(())
}

/// Review tick: reviewer backfill, pending reviews, CI polling, and the
/// level-5 escalation sweep.
pub async fn review_tick(deps: &ExecutionDeps) -> Result<()> {
    let pool = &deps.pool;

    // Backfill reviewer assignments the publish path could not make.
    for task in tasks::list_unreviewed_tasks(pool).await? {
        let Some(change_set_id) = task.change_set_id else {
            continue;
        };
        let Some(change_set) = change_sets::get_change_set(pool, change_set_id).await? else {
            continue;
        };
        let Some(author) = agents::get_agent(pool, change_set.author_agent_id).await? else {
            continue;
        };
        if let Err(e) = review::try_assign_reviewer(pool, &task, &change_set, &author).await {
            warn!(task_id = %task.id, error = %e, "reviewer backfill failed");
        }
    }

    // Reviews awaiting a verdict, then CI for every watchable change-set.
    for change_set in change_sets::list_ci_watchable(pool).await? {
        if change_set.status == ChangeSetStatus::ReadyForReview
            && change_set.reviewer_agent_id.is_some()
        {
            match review::run_review(deps, &change_set).await {
                Ok(outcome) => {
                    tracing::debug!(change_set = %change_set.id, ?outcome, "review ran");
                }
                Err(e) => warn!(change_set = %change_set.id, error = %e, "review errored"),
            }
        }

        // Re-read: the review above may have merged or closed it.
        let Some(current) = change_sets::get_change_set(pool, change_set.id).await? else {
            continue;
        };
        if matches!(
            current.status,
            ChangeSetStatus::ReadyForReview | ChangeSetStatus::Approved
        ) {
            if let Err(e) = review::process_ci(deps, &current).await {
                warn!(change_set = %current.id, error = %e, "CI processing errored");
            }
        }
    }

    // Safety sweep: goals whose last task completed through a path that
    // skipped the inline check still close.
    for goal in goals::list_open_decomposed_goals(pool).await? {
        let progress = tasks::get_goal_progress(pool, goal.id).await?;
        if progress.all_completed() {
            goals::update_goal_status(pool, goal.id, GoalStatus::Completed).await?;
            info!(goal_id = %goal.id, "goal completed");
        }
    }

    // Reviewers stuck in reviewing with no open assignment drift back to
    // idle when their change-set reached a terminal state.
    reconcile_reviewers(pool).await?;

    // Pending manager escalations past their cooldown get a decision, and
    // level-4 records past the human window go terminal.
    escalation::resolve_pending_manager_escalations(pool, &deps.brains, deps.brain_timeout)
        .await?;
    escalation::sweep_stale_escalations(pool).await?;

    Ok(())
}

/// Return reviewers whose assigned reviews are all settled to the idle pool.
async fn reconcile_reviewers(pool: &PgPool) -> Result<()> {
    for reviewer in agents::list_reviewing_agents(pool).await? {
        let load = change_sets::count_active_reviews(pool, reviewer.id).await?;
        if load == 0 {
            let _ = agents::set_agent_status(
                pool,
                reviewer.id,
                AgentStatus::Reviewing,
                AgentStatus::Idle,
            )
            .await;
        }
    }
    Ok(())
}
