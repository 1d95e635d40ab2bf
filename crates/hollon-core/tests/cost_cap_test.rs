//! Cost-cap behavior: per-execution gate ceiling and the daily-cap governor
//! trip with its level-4 escalation.

mod common;

use std::sync::Arc;

use hollon_core::brain::scripted::{ScriptedBrain, ScriptedReply};
use hollon_core::execution::{run_execution_cycle, CycleOutcome};
use hollon_core::gate::GateConfig;
use hollon_core::governor::{Governor, OrgAdmission};
use hollon_db::queries::{escalations, executions, orgs, tasks};

use common::{add_agent, deps_with_brains, edit_envelope, fixture_with_cap};

#[tokio::test]
async fn daily_cap_trips_the_governor_after_the_second_execution() {
    // Daily cap 100 sub-cents; each invocation costs 60.
    let fx = fixture_with_cap(100).await;
    let agent = add_agent(&fx, "dev-1", "brain-1").await;

    let brain = Arc::new(ScriptedBrain::new("brain-1"));
    brain.push(ScriptedReply::text_with_cost(
        edit_envelope("src/one.rs"),
        60,
    ));
    brain.push(ScriptedReply::text_with_cost(
        edit_envelope("src/two.rs"),
        60,
    ));
    let mut deps = deps_with_brains(&fx, vec![brain]);
    // Allow a single execution to spend the whole daily cap; this test
    // exercises the roll-up trip, not the per-execution ceiling.
    deps.gate = GateConfig {
        execution_cost_fraction: 1.0,
    };

    tasks::insert_task(&fx.pool, &tasks::NewTask::leaf(fx.project.id, "first"))
        .await
        .unwrap();
    tasks::insert_task(&fx.pool, &tasks::NewTask::leaf(fx.project.id, "second"))
        .await
        .unwrap();

    let governor = Governor::new();

    // Before any spend the governor admits with free slots.
    let org = orgs::get_organization(&fx.pool, fx.org.id)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        governor.admit(&fx.pool, &org).await.unwrap(),
        OrgAdmission::Slots(_)
    ));

    // First execution: 60 spent, still under the cap.
    let outcome = run_execution_cycle(&deps, &agent).await.unwrap();
    assert_eq!(outcome, CycleOutcome::Published);

    let today = chrono::Utc::now().date_naive();
    assert_eq!(
        executions::daily_cost(&fx.pool, fx.org.id, today).await.unwrap(),
        60
    );
    let org = orgs::get_organization(&fx.pool, fx.org.id)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        governor.admit(&fx.pool, &org).await.unwrap(),
        OrgAdmission::Slots(_)
    ));

    // Second execution: cost enforced at invocation, so it is allowed; the
    // roll-up now crosses the cap.
    let outcome = run_execution_cycle(&deps, &agent).await.unwrap();
    assert_eq!(outcome, CycleOutcome::Published);
    assert_eq!(
        executions::daily_cost(&fx.pool, fx.org.id, today).await.unwrap(),
        120
    );

    // The next admission trips the emergency stop.
    let org = orgs::get_organization(&fx.pool, fx.org.id)
        .await
        .unwrap()
        .unwrap();
    let admission = governor.admit(&fx.pool, &org).await.unwrap();
    assert!(matches!(admission, OrgAdmission::CapTripped { .. }));

    let org = orgs::get_organization(&fx.pool, fx.org.id)
        .await
        .unwrap()
        .unwrap();
    assert!(!org.autonomous_execution_enabled);
    assert_eq!(org.last_stop_reason.as_deref(), Some("daily cap reached"));

    // A level-4 organization escalation exists.
    let org_escalations = escalations::list_for_organization(&fx.pool, fx.org.id)
        .await
        .unwrap();
    assert_eq!(org_escalations.len(), 1);
    assert_eq!(org_escalations[0].level, 4);

    // A stopped organization is skipped without re-tripping.
    let admission = governor.admit(&fx.pool, &org).await.unwrap();
    assert_eq!(admission, OrgAdmission::Stopped);
    let org_escalations = escalations::list_for_organization(&fx.pool, fx.org.id)
        .await
        .unwrap();
    assert_eq!(org_escalations.len(), 1);

    fx.teardown().await;
}

#[tokio::test]
async fn per_execution_ceiling_refuses_with_cost_reason() {
    // Daily cap 100, default fraction 0.10: any execution over 10 sub-cents
    // is refused by the gate without retry.
    let fx = fixture_with_cap(100).await;
    let agent = add_agent(&fx, "dev-1", "brain-1").await;

    let brain = Arc::new(ScriptedBrain::new("brain-1"));
    brain.push(ScriptedReply::text_with_cost(
        edit_envelope("src/pricy.rs"),
        60,
    ));
    let deps = deps_with_brains(&fx, vec![brain]);

    let task = tasks::insert_task(&fx.pool, &tasks::NewTask::leaf(fx.project.id, "pricy"))
        .await
        .unwrap();

    let outcome = run_execution_cycle(&deps, &agent).await.unwrap();
    match outcome {
        CycleOutcome::FailedValidation { reason, .. } => {
            assert!(reason.starts_with("cost:"), "reason was {reason:?}");
        }
        other => panic!("expected FailedValidation, got {other:?}"),
    }

    // Refused executions still hit the ledger.
    let today = chrono::Utc::now().date_naive();
    assert_eq!(
        executions::daily_cost(&fx.pool, fx.org.id, today).await.unwrap(),
        60
    );

    // Budget refusals escalate straight to a human: the task is blocked.
    let task = tasks::get_task(&fx.pool, task.id).await.unwrap().unwrap();
    assert_eq!(task.status, hollon_db::models::TaskStatus::Blocked);
    let chain = escalations::list_for_task(&fx.pool, task.id).await.unwrap();
    assert_eq!(chain.len(), 1);
    assert_eq!(chain[0].level, 4);

    fx.teardown().await;
}
