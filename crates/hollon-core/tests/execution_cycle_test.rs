//! Integration tests for the execution cycle: claim, publish, gate
//! failures, and cost accounting.
//!
//! These tests require Docker (testcontainers) or an external PostgreSQL
//! reachable via `HOLLON_TEST_PG_URL`.

mod common;

use std::sync::Arc;

use hollon_core::brain::scripted::{ScriptedBrain, ScriptedReply};
use hollon_core::escalation::LadderAction;
use hollon_core::execution::{run_execution_cycle, CycleOutcome};
use hollon_db::models::{ChangeSetStatus, TaskStatus};
use hollon_db::queries::{change_sets, executions, tasks};

use common::{add_agent, deps_with_brains, edit_envelope, fixture};

#[tokio::test]
async fn cycle_publishes_change_set_and_moves_task_to_review() {
    let fx = fixture().await;
    let agent = add_agent(&fx, "dev-1", "brain-1").await;

    let brain = Arc::new(ScriptedBrain::new("brain-1"));
    brain.push(ScriptedReply::text(edit_envelope("src/generated.rs")));
    let deps = deps_with_brains(&fx, vec![brain]);

    let mut new_task = tasks::NewTask::leaf(fx.project.id, "write generated module");
    new_task.description = "Add the generated module.".into();
    let task = tasks::insert_task(&fx.pool, &new_task).await.unwrap();

    let outcome = run_execution_cycle(&deps, &agent).await.unwrap();
    assert_eq!(outcome, CycleOutcome::Published);

    let task = tasks::get_task(&fx.pool, task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::InReview);
    assert_eq!(task.assigned_agent_id, Some(agent.id));
    assert!(task.change_set_id.is_some());

    let change_set = change_sets::get_change_set(&fx.pool, task.change_set_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(change_set.status, ChangeSetStatus::ReadyForReview);
    assert_eq!(change_set.author_agent_id, agent.id);
    assert!(change_set.review_number.is_some());

    // Cost was accounted exactly once.
    let records = executions::list_for_task(&fx.pool, task.id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, "executed");
    assert_eq!(records[0].cost_sub_cents, 1);

    fx.teardown().await;
}

#[tokio::test]
async fn idle_when_no_task_is_eligible() {
    let fx = fixture().await;
    let agent = add_agent(&fx, "dev-1", "brain-1").await;

    let brain = Arc::new(ScriptedBrain::new("brain-1"));
    let deps = deps_with_brains(&fx, vec![brain]);

    let outcome = run_execution_cycle(&deps, &agent).await.unwrap();
    assert_eq!(outcome, CycleOutcome::Idle);

    fx.teardown().await;
}

#[tokio::test]
async fn gate_failure_schedules_self_retry() {
    let fx = fixture().await;
    let agent = add_agent(&fx, "dev-1", "brain-1").await;

    let brain = Arc::new(ScriptedBrain::new("brain-1"));
    brain.push(ScriptedReply::text("Error: everything is on fire"));
    let deps = deps_with_brains(&fx, vec![brain]);

    let task = tasks::insert_task(&fx.pool, &tasks::NewTask::leaf(fx.project.id, "doomed"))
        .await
        .unwrap();

    let outcome = run_execution_cycle(&deps, &agent).await.unwrap();
    match outcome {
        CycleOutcome::FailedValidation { action, .. } => {
            assert_eq!(action, LadderAction::SelfRetry);
        }
        other => panic!("expected FailedValidation, got {other:?}"),
    }

    let task = tasks::get_task(&fx.pool, task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Ready);
    assert_eq!(task.retry_count, 1);
    assert_eq!(task.consecutive_failures, 1);
    assert_eq!(task.assigned_agent_id, None);

    // The failed execution still cost money and is on the ledger.
    let records = executions::list_for_task(&fx.pool, task.id).await.unwrap();
    assert_eq!(records.len(), 1);

    fx.teardown().await;
}

#[tokio::test]
async fn unparseable_edit_envelope_is_a_quality_failure() {
    let fx = fixture().await;
    let agent = add_agent(&fx, "dev-1", "brain-1").await;

    let brain = Arc::new(ScriptedBrain::new("brain-1"));
    brain.push(ScriptedReply::text(
        "I made the changes you asked for, they look great!",
    ));
    let deps = deps_with_brains(&fx, vec![brain]);

    let task = tasks::insert_task(&fx.pool, &tasks::NewTask::leaf(fx.project.id, "prose-only"))
        .await
        .unwrap();

    let outcome = run_execution_cycle(&deps, &agent).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::FailedValidation { .. }));

    let task = tasks::get_task(&fx.pool, task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Ready);
    assert_eq!(task.retry_count, 1);

    fx.teardown().await;
}

#[tokio::test]
async fn claim_is_idempotent_for_an_agent_at_capacity() {
    let fx = fixture().await;
    let agent = add_agent(&fx, "dev-1", "brain-1").await;

    let task = tasks::insert_task(&fx.pool, &tasks::NewTask::leaf(fx.project.id, "only"))
        .await
        .unwrap();

    let first = hollon_core::taskpool::claim(&fx.pool, &agent)
        .await
        .unwrap()
        .expect("first claim should win the task");
    assert_eq!(first.id, task.id);

    // The agent holds its one slot; a second claim returns the same task.
    let second = hollon_core::taskpool::claim(&fx.pool, &agent)
        .await
        .unwrap()
        .expect("second claim should return the held task");
    assert_eq!(second.id, task.id);
    assert_eq!(second.status, TaskStatus::InProgress);

    fx.teardown().await;
}

#[tokio::test]
async fn capability_mismatch_is_not_claimable() {
    let fx = fixture().await;
    let agent = add_agent(&fx, "dev-1", "brain-1").await;

    let mut new_task = tasks::NewTask::leaf(fx.project.id, "needs-ml");
    new_task.required_capabilities = vec!["machine-learning".to_string()];
    tasks::insert_task(&fx.pool, &new_task).await.unwrap();

    // The fixture role carries rust/backend only.
    let claimed = hollon_core::taskpool::claim(&fx.pool, &agent).await.unwrap();
    assert!(claimed.is_none());

    fx.teardown().await;
}
