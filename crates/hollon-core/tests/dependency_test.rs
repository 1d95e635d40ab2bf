//! Dependency semantics: claim ordering, monotonic unblocking, cycle
//! rejection at insert time, and the depth cap.

mod common;

use hollon_core::taskpool;
use hollon_db::error::StoreError;
use hollon_db::models::TaskStatus;
use hollon_db::queries::tasks;

use common::{add_agent, fixture};

#[tokio::test]
async fn dependent_task_waits_for_its_dependency() {
    let fx = fixture().await;
    let agent = add_agent(&fx, "dev-1", "brain-1").await;

    // T1 (older) depends on T2: despite age ordering, T2 must be claimed
    // first.
    let t1 = tasks::insert_task(&fx.pool, &tasks::NewTask::leaf(fx.project.id, "dependent"))
        .await
        .unwrap();
    let t2 = tasks::insert_task(&fx.pool, &tasks::NewTask::leaf(fx.project.id, "prerequisite"))
        .await
        .unwrap();
    tasks::insert_task_dependency(&fx.pool, t1.id, t2.id)
        .await
        .unwrap();

    let claimed = taskpool::claim(&fx.pool, &agent).await.unwrap().unwrap();
    assert_eq!(claimed.id, t2.id);

    // Complete T2; the dependent flips pending -> ready exactly once.
    tasks::set_task_status(&fx.pool, t2.id, TaskStatus::InProgress, TaskStatus::InReview)
        .await
        .unwrap();
    tasks::set_task_status(&fx.pool, t2.id, TaskStatus::InReview, TaskStatus::Approved)
        .await
        .unwrap();
    tasks::set_task_status(&fx.pool, t2.id, TaskStatus::Approved, TaskStatus::Completed)
        .await
        .unwrap();

    let unblocked = tasks::unblock_dependents(&fx.pool, t2.id).await.unwrap();
    assert_eq!(unblocked.len(), 1);
    assert_eq!(unblocked[0].id, t1.id);
    assert_eq!(unblocked[0].status, TaskStatus::Ready);

    // A second unblock pass is a no-op (monotonic).
    let again = tasks::unblock_dependents(&fx.pool, t2.id).await.unwrap();
    assert!(again.is_empty());

    // T2 is terminal, so the agent's slot is free again; the dependent is
    // claimable with every dependency completed at claim time.
    let claimed = taskpool::claim(&fx.pool, &agent).await.unwrap().unwrap();
    assert_eq!(claimed.id, t1.id);
    let deps = tasks::find_dependencies(&fx.pool, t1.id).await.unwrap();
    assert!(deps.iter().all(|d| d.status == TaskStatus::Completed));

    fx.teardown().await;
}

#[tokio::test]
async fn partially_completed_dependencies_do_not_unblock() {
    let fx = fixture().await;

    let dependent = tasks::insert_task(&fx.pool, &tasks::NewTask::leaf(fx.project.id, "gated"))
        .await
        .unwrap();
    let d1 = tasks::insert_task(&fx.pool, &tasks::NewTask::leaf(fx.project.id, "dep one"))
        .await
        .unwrap();
    let d2 = tasks::insert_task(&fx.pool, &tasks::NewTask::leaf(fx.project.id, "dep two"))
        .await
        .unwrap();
    tasks::insert_task_dependency(&fx.pool, dependent.id, d1.id)
        .await
        .unwrap();
    tasks::insert_task_dependency(&fx.pool, dependent.id, d2.id)
        .await
        .unwrap();

    complete(&fx.pool, d1.id).await;
    let unblocked = tasks::unblock_dependents(&fx.pool, d1.id).await.unwrap();
    assert!(unblocked.is_empty(), "d2 is still incomplete");

    complete(&fx.pool, d2.id).await;
    let unblocked = tasks::unblock_dependents(&fx.pool, d2.id).await.unwrap();
    assert_eq!(unblocked.len(), 1);
    assert_eq!(unblocked[0].id, dependent.id);

    fx.teardown().await;
}

#[tokio::test]
async fn cyclic_dependency_is_rejected_at_insert() {
    let fx = fixture().await;

    let a = tasks::insert_task(&fx.pool, &tasks::NewTask::leaf(fx.project.id, "a"))
        .await
        .unwrap();
    let b = tasks::insert_task(&fx.pool, &tasks::NewTask::leaf(fx.project.id, "b"))
        .await
        .unwrap();
    let c = tasks::insert_task(&fx.pool, &tasks::NewTask::leaf(fx.project.id, "c"))
        .await
        .unwrap();

    tasks::insert_task_dependency(&fx.pool, b.id, a.id).await.unwrap();
    tasks::insert_task_dependency(&fx.pool, c.id, b.id).await.unwrap();

    // a -> c would close the loop a <- b <- c <- a.
    let err = tasks::insert_task_dependency(&fx.pool, a.id, c.id)
        .await
        .unwrap_err();
    let store = err.downcast_ref::<StoreError>().expect("typed store error");
    assert!(matches!(store, StoreError::InvariantViolation(_)));

    // Self-dependency is rejected outright.
    let err = tasks::insert_task_dependency(&fx.pool, a.id, a.id)
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::InvariantViolation(_))
    ));

    fx.teardown().await;
}

#[tokio::test]
async fn depth_cap_rejects_level_four_children() {
    let fx = fixture().await;

    let mut parent = tasks::insert_task(&fx.pool, &tasks::NewTask::leaf(fx.project.id, "d0"))
        .await
        .unwrap();
    assert_eq!(parent.depth, 0);

    for level in 1..=3 {
        let mut child = tasks::NewTask::leaf(fx.project.id, format!("d{level}"));
        child.parent_task_id = Some(parent.id);
        parent = tasks::insert_task(&fx.pool, &child).await.unwrap();
        assert_eq!(parent.depth, level);
    }

    let mut too_deep = tasks::NewTask::leaf(fx.project.id, "d4");
    too_deep.parent_task_id = Some(parent.id);
    let err = tasks::insert_task(&fx.pool, &too_deep).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::InvariantViolation(_))
    ));

    fx.teardown().await;
}

#[tokio::test]
async fn xor_assignment_is_rejected() {
    let fx = fixture().await;
    let agent = add_agent(&fx, "dev-1", "brain-1").await;

    let mut bad = tasks::NewTask::leaf(fx.project.id, "doubly assigned");
    bad.assigned_team_id = Some(fx.team.id);
    bad.assigned_agent_id = Some(agent.id);
    let err = tasks::insert_task(&fx.pool, &bad).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::InvariantViolation(_))
    ));

    fx.teardown().await;
}

async fn complete(pool: &sqlx::PgPool, task_id: uuid::Uuid) {
    tasks::set_task_status(pool, task_id, TaskStatus::Pending, TaskStatus::Ready)
        .await
        .unwrap();
    tasks::set_task_status(pool, task_id, TaskStatus::Ready, TaskStatus::InProgress)
        .await
        .unwrap();
    tasks::set_task_status(pool, task_id, TaskStatus::InProgress, TaskStatus::InReview)
        .await
        .unwrap();
    tasks::set_task_status(pool, task_id, TaskStatus::InReview, TaskStatus::Approved)
        .await
        .unwrap();
    tasks::set_task_status(pool, task_id, TaskStatus::Approved, TaskStatus::Completed)
        .await
        .unwrap();
}
