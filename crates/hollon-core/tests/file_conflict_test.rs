//! File-conflict exclusion: two tasks touching the same files are never
//! in progress together under one project.

mod common;

use hollon_core::taskpool;
use hollon_db::models::TaskStatus;
use hollon_db::queries::tasks;

use common::{add_agent, fixture};

#[tokio::test]
async fn overlapping_affected_files_serialize_execution() {
    let fx = fixture().await;
    let a1 = add_agent(&fx, "dev-1", "brain-1").await;
    let a2 = add_agent(&fx, "dev-2", "brain-2").await;

    let mut t1 = tasks::NewTask::leaf(fx.project.id, "first writer");
    t1.affected_files = vec!["src/a.ts".to_string()];
    let t1 = tasks::insert_task(&fx.pool, &t1).await.unwrap();

    let mut t2 = tasks::NewTask::leaf(fx.project.id, "second writer");
    t2.affected_files = vec!["src/a.ts".to_string()];
    let t2 = tasks::insert_task(&fx.pool, &t2).await.unwrap();

    // A1 wins the older task.
    let claimed = taskpool::claim(&fx.pool, &a1).await.unwrap().unwrap();
    assert_eq!(claimed.id, t1.id);

    // A2 cannot take the conflicting one while T1 is in progress.
    let conflicting = taskpool::claim(&fx.pool, &a2).await.unwrap();
    assert!(conflicting.is_none());

    assert_no_conflicting_in_progress(&fx.pool, fx.project.id).await;

    // Drive T1 through its lifecycle to completion.
    tasks::set_task_status(&fx.pool, t1.id, TaskStatus::InProgress, TaskStatus::InReview)
        .await
        .unwrap();
    tasks::set_task_status(&fx.pool, t1.id, TaskStatus::InReview, TaskStatus::Approved)
        .await
        .unwrap();
    tasks::set_task_status(&fx.pool, t1.id, TaskStatus::Approved, TaskStatus::Completed)
        .await
        .unwrap();

    // Now T2 is claimable.
    let claimed = taskpool::claim(&fx.pool, &a2).await.unwrap().unwrap();
    assert_eq!(claimed.id, t2.id);

    assert_no_conflicting_in_progress(&fx.pool, fx.project.id).await;

    fx.teardown().await;
}

#[tokio::test]
async fn disjoint_affected_files_run_concurrently() {
    let fx = fixture().await;
    let a1 = add_agent(&fx, "dev-1", "brain-1").await;
    let a2 = add_agent(&fx, "dev-2", "brain-2").await;

    let mut t1 = tasks::NewTask::leaf(fx.project.id, "writer a");
    t1.affected_files = vec!["src/a.ts".to_string()];
    tasks::insert_task(&fx.pool, &t1).await.unwrap();

    let mut t2 = tasks::NewTask::leaf(fx.project.id, "writer b");
    t2.affected_files = vec!["src/b.ts".to_string()];
    tasks::insert_task(&fx.pool, &t2).await.unwrap();

    let first = taskpool::claim(&fx.pool, &a1).await.unwrap();
    let second = taskpool::claim(&fx.pool, &a2).await.unwrap();
    assert!(first.is_some());
    assert!(second.is_some());
    assert_ne!(first.unwrap().id, second.unwrap().id);

    fx.teardown().await;
}

/// Invariant: no two in-progress tasks under one project share a file.
async fn assert_no_conflicting_in_progress(pool: &sqlx::PgPool, project_id: uuid::Uuid) {
    let in_progress: Vec<hollon_db::models::Task> = tasks::list_tasks_for_project(pool, project_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.status == TaskStatus::InProgress)
        .collect();

    for (i, left) in in_progress.iter().enumerate() {
        for right in &in_progress[i + 1..] {
            let overlap = left
                .affected_files
                .iter()
                .any(|f| right.affected_files.contains(f));
            assert!(
                !overlap,
                "tasks {} and {} are both in progress with overlapping files",
                left.id, right.id
            );
        }
    }
}
