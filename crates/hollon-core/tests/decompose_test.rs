//! Decomposition engine integration tests: CAS idempotence, validation
//! failures, the 3-strike retry policy, and the subtask cap.

mod common;

use std::sync::Arc;

use hollon_core::brain::scripted::{ScriptedBrain, ScriptedReply};
use hollon_core::decompose::{self, DecomposeOutcome};
use hollon_db::models::TaskStatus;
use hollon_db::queries::goals::NewGoal;
use hollon_db::queries::{escalations, goals, tasks, teams};

use common::{add_agent, deps_with_brains, fixture};

async fn submit_goal(fx: &common::Fixture, owner: uuid::Uuid) -> hollon_db::models::Goal {
    goals::insert_goal(
        &fx.pool,
        &NewGoal {
            organization_id: fx.org.id,
            project_id: fx.project.id,
            owner_agent_id: owner,
            title: "Ship the thing".into(),
            description: "It must ship.".into(),
            success_criteria: vec![],
        },
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn decomposing_a_goal_twice_is_a_no_op() {
    let fx = fixture().await;
    let exec = add_agent(&fx, "exec", "brain-exec").await;

    let brain = Arc::new(ScriptedBrain::new("brain-exec"));
    brain.push(ScriptedReply::text(
        r#"{"epics": [{"title": "Only epic", "team": "core", "priority": "p1"}]}"#,
    ));
    let deps = deps_with_brains(&fx, vec![brain]);

    let goal = submit_goal(&fx, exec.id).await;

    let first = decompose::decompose_goal(&fx.pool, &deps.brains, &goal, deps.brain_timeout)
        .await
        .unwrap();
    assert_eq!(first, DecomposeOutcome::Decomposed { created: 1 });

    // A stale copy of the goal (decomposed = false) races in; the CAS
    // rejects the second materialization.
    let second = decompose::decompose_goal(&fx.pool, &deps.brains, &goal, deps.brain_timeout)
        .await
        .unwrap();
    assert_eq!(second, DecomposeOutcome::AlreadyDecomposed);

    let children = tasks::list_tasks_for_goal(&fx.pool, goal.id).await.unwrap();
    assert_eq!(children.len(), 1);

    // Invariant: decomposed goals have children, undecomposed ones do not.
    let goal = goals::get_goal(&fx.pool, goal.id).await.unwrap().unwrap();
    assert!(goal.decomposed);
    assert!(!children.is_empty());

    fx.teardown().await;
}

#[tokio::test]
async fn unknown_team_fails_the_goal_after_three_strikes() {
    let fx = fixture().await;
    let exec = add_agent(&fx, "exec", "brain-exec").await;

    let brain = Arc::new(ScriptedBrain::new("brain-exec"));
    brain.push(ScriptedReply::text(
        r#"{"epics": [{"title": "Bad epic", "team": "phantom", "priority": "p2"}]}"#,
    ));
    let deps = deps_with_brains(&fx, vec![brain]);

    let goal = submit_goal(&fx, exec.id).await;

    for _ in 0..2 {
        let outcome = decompose::decompose_goal(&fx.pool, &deps.brains, &goal, deps.brain_timeout)
            .await
            .unwrap();
        assert!(matches!(outcome, DecomposeOutcome::RetryScheduled { .. }));
    }
    let outcome = decompose::decompose_goal(&fx.pool, &deps.brains, &goal, deps.brain_timeout)
        .await
        .unwrap();
    assert!(matches!(outcome, DecomposeOutcome::TerminalFailure { .. }));

    let goal = goals::get_goal(&fx.pool, goal.id).await.unwrap().unwrap();
    assert_eq!(goal.status, hollon_db::models::GoalStatus::Failed);
    assert!(!goal.decomposed);
    assert!(goal.error_message.as_deref().unwrap().contains("phantom"));
    assert!(
        tasks::list_tasks_for_goal(&fx.pool, goal.id)
            .await
            .unwrap()
            .is_empty(),
        "a failed decomposition must create no children"
    );

    fx.teardown().await;
}

#[tokio::test]
async fn epic_plan_with_cycle_blocks_after_three_strikes() {
    let fx = fixture().await;
    let exec = add_agent(&fx, "exec", "brain-exec").await;
    let _dev = add_agent(&fx, "dev-1", "brain-dev").await;
    teams::set_manager(&fx.pool, fx.team.id, Some(exec.id))
        .await
        .unwrap();

    let brain = Arc::new(ScriptedBrain::new("brain-exec"));
    brain.push(ScriptedReply::text(
        r#"{"epics": [{"title": "Epic", "team": "core", "priority": "p2"}]}"#,
    ));
    // Phase B keeps producing a cyclic plan.
    brain.push(ScriptedReply::text(
        r#"{"subtasks": [
            {"title": "a", "assignee": "dev-1", "depends_on": ["b"]},
            {"title": "b", "assignee": "dev-1", "depends_on": ["a"]}
        ]}"#,
    ));
    let deps = deps_with_brains(&fx, vec![brain]);

    let goal = submit_goal(&fx, exec.id).await;
    decompose::decompose_goal(&fx.pool, &deps.brains, &goal, deps.brain_timeout)
        .await
        .unwrap();

    let epic = tasks::list_tasks_for_goal(&fx.pool, goal.id).await.unwrap()[0].clone();

    for _ in 0..2 {
        let epic = tasks::get_task(&fx.pool, epic.id).await.unwrap().unwrap();
        let outcome = decompose::decompose_epic(&fx.pool, &deps.brains, &epic, deps.brain_timeout)
            .await
            .unwrap();
        assert!(matches!(outcome, DecomposeOutcome::RetryScheduled { .. }));
        // The plan is rejected atomically: no subtask was materialized.
        assert!(tasks::list_children(&fx.pool, epic.id).await.unwrap().is_empty());
    }

    let epic_row = tasks::get_task(&fx.pool, epic.id).await.unwrap().unwrap();
    let outcome = decompose::decompose_epic(&fx.pool, &deps.brains, &epic_row, deps.brain_timeout)
        .await
        .unwrap();
    assert!(matches!(outcome, DecomposeOutcome::TerminalFailure { .. }));

    let epic_row = tasks::get_task(&fx.pool, epic.id).await.unwrap().unwrap();
    assert_eq!(epic_row.status, TaskStatus::Blocked);
    assert!(epic_row.blocked_until.is_some());
    assert_eq!(epic_row.plan_retry_count, 3);

    let chain = escalations::list_for_task(&fx.pool, epic.id).await.unwrap();
    assert_eq!(chain.len(), 1);
    assert_eq!(chain[0].level, 3);

    fx.teardown().await;
}

#[tokio::test]
async fn manager_resolution_reopens_a_blocked_epic() {
    let fx = fixture().await;
    let exec = add_agent(&fx, "exec", "brain-exec").await;
    let _dev = add_agent(&fx, "dev-1", "brain-dev").await;
    teams::set_manager(&fx.pool, fx.team.id, Some(exec.id))
        .await
        .unwrap();

    let brain = Arc::new(ScriptedBrain::new("brain-exec"));
    brain.push(ScriptedReply::text(
        r#"{"epics": [{"title": "Epic", "team": "core", "priority": "p2"}]}"#,
    ));
    brain.push(ScriptedReply::text("not a plan at all")); // phase B garbage
    let deps = deps_with_brains(&fx, vec![brain.clone()]);

    let goal = submit_goal(&fx, exec.id).await;
    decompose::decompose_goal(&fx.pool, &deps.brains, &goal, deps.brain_timeout)
        .await
        .unwrap();
    let epic = tasks::list_tasks_for_goal(&fx.pool, goal.id).await.unwrap()[0].clone();

    for _ in 0..3 {
        let epic_row = tasks::get_task(&fx.pool, epic.id).await.unwrap().unwrap();
        decompose::decompose_epic(&fx.pool, &deps.brains, &epic_row, deps.brain_timeout)
            .await
            .unwrap();
    }
    let epic_row = tasks::get_task(&fx.pool, epic.id).await.unwrap().unwrap();
    assert_eq!(epic_row.status, TaskStatus::Blocked);

    // Cooldown still running: the resolution pass leaves it alone.
    hollon_core::escalation::resolve_pending_manager_escalations(
        &fx.pool,
        &deps.brains,
        deps.brain_timeout,
    )
    .await
    .unwrap();
    let epic_row = tasks::get_task(&fx.pool, epic.id).await.unwrap().unwrap();
    assert_eq!(epic_row.status, TaskStatus::Blocked);

    // Expire the cooldown; the manager decides to retry.
    sqlx::query("UPDATE tasks SET blocked_until = now() - interval '1 minute' WHERE id = $1")
        .bind(epic.id)
        .execute(&fx.pool)
        .await
        .unwrap();
    brain.push(ScriptedReply::text(r#"{"decision": "retry"}"#));
    hollon_core::escalation::resolve_pending_manager_escalations(
        &fx.pool,
        &deps.brains,
        deps.brain_timeout,
    )
    .await
    .unwrap();

    let epic_row = tasks::get_task(&fx.pool, epic.id).await.unwrap().unwrap();
    assert_eq!(epic_row.status, TaskStatus::Ready);
    assert_eq!(epic_row.plan_retry_count, 0);
    assert_eq!(epic_row.retry_count, 0);

    // The escalation chain records the decision.
    let chain = escalations::list_for_task(&fx.pool, epic.id).await.unwrap();
    assert_eq!(chain.len(), 1);
    assert_eq!(chain[0].decision.as_deref(), Some("retry"));
    assert!(chain[0].decided_at.is_some());

    fx.teardown().await;
}

#[tokio::test]
async fn oversized_plan_is_rejected() {
    let fx = fixture().await;
    let exec = add_agent(&fx, "exec", "brain-exec").await;
    let _dev = add_agent(&fx, "dev-1", "brain-dev").await;
    teams::set_manager(&fx.pool, fx.team.id, Some(exec.id))
        .await
        .unwrap();

    let brain = Arc::new(ScriptedBrain::new("brain-exec"));
    brain.push(ScriptedReply::text(
        r#"{"epics": [{"title": "Epic", "team": "core", "priority": "p2"}]}"#,
    ));
    let subtasks: Vec<String> = (0..11)
        .map(|i| format!(r#"{{"title": "t{i}", "assignee": "dev-1"}}"#))
        .collect();
    brain.push(ScriptedReply::text(format!(
        r#"{{"subtasks": [{}]}}"#,
        subtasks.join(",")
    )));
    let deps = deps_with_brains(&fx, vec![brain]);

    let goal = submit_goal(&fx, exec.id).await;
    decompose::decompose_goal(&fx.pool, &deps.brains, &goal, deps.brain_timeout)
        .await
        .unwrap();
    let epic = tasks::list_tasks_for_goal(&fx.pool, goal.id).await.unwrap()[0].clone();

    let outcome = decompose::decompose_epic(&fx.pool, &deps.brains, &epic, deps.brain_timeout)
        .await
        .unwrap();
    match outcome {
        DecomposeOutcome::RetryScheduled { error } => {
            assert!(error.contains("11 subtasks"), "error was {error:?}");
        }
        other => panic!("expected RetryScheduled, got {other:?}"),
    }
    assert!(tasks::list_children(&fx.pool, epic.id).await.unwrap().is_empty());

    fx.teardown().await;
}

#[tokio::test]
async fn valid_plan_materializes_dependency_edges() {
    let fx = fixture().await;
    let exec = add_agent(&fx, "exec", "brain-exec").await;
    let _dev = add_agent(&fx, "dev-1", "brain-dev").await;
    teams::set_manager(&fx.pool, fx.team.id, Some(exec.id))
        .await
        .unwrap();

    let brain = Arc::new(ScriptedBrain::new("brain-exec"));
    brain.push(ScriptedReply::text(
        r#"{"epics": [{"title": "Epic", "team": "core", "priority": "p2"}]}"#,
    ));
    brain.push(ScriptedReply::text(
        r#"{"subtasks": [
            {"title": "design", "assignee": "dev-1", "task_type": "spike"},
            {"title": "build", "assignee": "dev-1", "depends_on": ["design"],
             "complexity": "medium"}
        ]}"#,
    ));
    let deps = deps_with_brains(&fx, vec![brain]);

    let goal = submit_goal(&fx, exec.id).await;
    decompose::decompose_goal(&fx.pool, &deps.brains, &goal, deps.brain_timeout)
        .await
        .unwrap();
    let epic = tasks::list_tasks_for_goal(&fx.pool, goal.id).await.unwrap()[0].clone();

    let outcome = decompose::decompose_epic(&fx.pool, &deps.brains, &epic, deps.brain_timeout)
        .await
        .unwrap();
    assert_eq!(outcome, DecomposeOutcome::Decomposed { created: 2 });

    let children = tasks::list_children(&fx.pool, epic.id).await.unwrap();
    assert_eq!(children.len(), 2);

    let build = children.iter().find(|t| t.title == "build").unwrap();
    let design = children.iter().find(|t| t.title == "design").unwrap();
    assert_eq!(build.depth, 1);
    assert_eq!(
        build.complexity,
        Some(hollon_db::models::TaskComplexity::Medium)
    );

    let dependencies = tasks::find_dependencies(&fx.pool, build.id).await.unwrap();
    assert_eq!(dependencies.len(), 1);
    assert_eq!(dependencies[0].id, design.id);

    let titles = tasks::dependency_titles(&fx.pool, build.id).await.unwrap();
    assert_eq!(titles, vec!["design".to_string()]);

    fx.teardown().await;
}
