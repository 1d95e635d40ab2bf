//! Escalation ladder: self-retry exhaustion, teammate fallback, and
//! completion through the peer without a manager escalation.

mod common;

use std::sync::Arc;

use hollon_core::brain::scripted::{ScriptedBrain, ScriptedReply};
use hollon_core::escalation::LadderAction;
use hollon_core::execution::{run_execution_cycle, CycleOutcome};
use hollon_core::review;
use hollon_db::models::{ChangeSetStatus, TaskStatus};
use hollon_db::queries::{change_sets, escalations, tasks};

use common::{add_agent, approve_verdict, deps_with_brains, edit_envelope, fixture};

#[tokio::test]
async fn failing_agent_retries_three_times_then_peer_completes() {
    let fx = fixture().await;
    let a1 = add_agent(&fx, "dev-1", "brain-a1").await;
    let a2 = add_agent(&fx, "dev-2", "brain-a2").await;

    let brain_a1 = Arc::new(ScriptedBrain::new("brain-a1"));
    brain_a1.push(ScriptedReply::text("Error: model confused")); // repeats
    let brain_a2 = Arc::new(ScriptedBrain::new("brain-a2"));
    brain_a2.push(ScriptedReply::text(edit_envelope("src/done.rs")));
    let deps = deps_with_brains(&fx, vec![brain_a1.clone(), brain_a2]);

    let task = tasks::insert_task(&fx.pool, &tasks::NewTask::leaf(fx.project.id, "tricky"))
        .await
        .unwrap();

    // Three self-retries for the failing agent.
    for expected_retry in 1..=3 {
        let outcome = run_execution_cycle(&deps, &a1).await.unwrap();
        match outcome {
            CycleOutcome::FailedValidation { action, .. } => {
                assert_eq!(action, LadderAction::SelfRetry);
            }
            other => panic!("expected self-retry, got {other:?}"),
        }
        let current = tasks::get_task(&fx.pool, task.id).await.unwrap().unwrap();
        assert_eq!(current.retry_count, expected_retry);
        assert_eq!(current.status, TaskStatus::Ready);
    }

    // The fourth failure falls through to the teammate.
    let outcome = run_execution_cycle(&deps, &a1).await.unwrap();
    match outcome {
        CycleOutcome::FailedValidation { action, .. } => {
            assert_eq!(action, LadderAction::PeerRetry { peer_id: a2.id });
        }
        other => panic!("expected peer retry, got {other:?}"),
    }
    let current = tasks::get_task(&fx.pool, task.id).await.unwrap().unwrap();
    assert_eq!(current.assigned_agent_id, Some(a2.id));
    assert_eq!(current.status, TaskStatus::Ready);
    assert!(current.retry_count <= 3);

    // A1 can no longer steal it back: it is pre-assigned to the peer.
    let stolen = hollon_core::taskpool::claim(&fx.pool, &a1).await.unwrap();
    assert!(stolen.is_none());

    // The peer publishes.
    let outcome = run_execution_cycle(&deps, &a2).await.unwrap();
    assert_eq!(outcome, CycleOutcome::Published);

    let current = tasks::get_task(&fx.pool, task.id).await.unwrap().unwrap();
    assert_eq!(current.status, TaskStatus::InReview);
    let change_set = change_sets::get_change_set(&fx.pool, current.change_set_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    // A1 picked up the review (only idle peer of the author).
    assert_eq!(change_set.reviewer_agent_id, Some(a1.id));

    // A1 approves; merge completes the task.
    brain_a1.push(ScriptedReply::text(approve_verdict()));
    let outcome = review::run_review(&deps, &change_set).await.unwrap();
    assert_eq!(outcome, review::ReviewOutcome::Approved);

    let current = tasks::get_task(&fx.pool, task.id).await.unwrap().unwrap();
    assert_eq!(current.status, TaskStatus::Completed);
    assert!(current.retry_count <= 3);
    assert_eq!(current.consecutive_failures, 0);

    let change_set = change_sets::get_change_set(&fx.pool, change_set.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(change_set.status, ChangeSetStatus::Merged);

    // No manager escalation was ever filed.
    let chain = escalations::list_for_task(&fx.pool, task.id).await.unwrap();
    assert!(chain.iter().all(|e| e.level != 3), "chain: {chain:?}");

    fx.teardown().await;
}
