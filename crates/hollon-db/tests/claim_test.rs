//! Claim protocol tests against a real PostgreSQL.
//!
//! Require Docker (testcontainers) or an external PostgreSQL via
//! `HOLLON_TEST_PG_URL`.

use sqlx::PgPool;
use uuid::Uuid;

use hollon_db::models::{TaskPriority, TaskStatus};
use hollon_db::queries::agents::{self, NewAgent};
use hollon_db::queries::orgs::{self, NewOrganization};
use hollon_db::queries::tasks::{self, NewTask};
use hollon_db::queries::{projects, roles, teams};

struct Ctx {
    pool: PgPool,
    db_name: String,
    org_id: Uuid,
    project_id: Uuid,
    agent_id: Uuid,
}

async fn setup() -> Ctx {
    let (pool, db_name) = hollon_test_utils::create_test_db().await;

    let org = orgs::insert_organization(
        &pool,
        &NewOrganization {
            name: format!("org-{}", Uuid::new_v4().simple()),
            context_prompt: String::new(),
            daily_cost_cap_sub_cents: 0,
            monthly_cost_cap_sub_cents: 0,
            max_concurrent_agents: 4,
        },
    )
    .await
    .unwrap();

    let role = roles::insert_role(&pool, org.id, "engineer", "", &["rust".into()], false)
        .await
        .unwrap();
    let team = teams::insert_team(&pool, org.id, "core", None, "").await.unwrap();
    let project = projects::insert_project(&pool, org.id, "demo", "local://demo", "/tmp/demo")
        .await
        .unwrap();
    let agent = agents::insert_agent(
        &pool,
        &NewAgent {
            organization_id: org.id,
            team_id: team.id,
            role_id: role.id,
            name: "dev-1".into(),
            brain_provider: "scripted".into(),
            custom_prompt: None,
            max_concurrent_tasks: 1,
        },
    )
    .await
    .unwrap();

    Ctx {
        pool,
        db_name,
        org_id: org.id,
        project_id: project.id,
        agent_id: agent.id,
    }
}

async fn claim(ctx: &Ctx) -> Option<hollon_db::models::Task> {
    tasks::claim_ready_task(&ctx.pool, ctx.agent_id, ctx.org_id, &["rust".into()], 1)
        .await
        .unwrap()
}

#[tokio::test]
async fn claim_orders_by_priority_then_age() {
    let ctx = setup().await;

    let mut low = NewTask::leaf(ctx.project_id, "older but low priority");
    low.priority = TaskPriority::P3;
    let low = tasks::insert_task(&ctx.pool, &low).await.unwrap();

    let mut urgent = NewTask::leaf(ctx.project_id, "newer but urgent");
    urgent.priority = TaskPriority::P1;
    let urgent = tasks::insert_task(&ctx.pool, &urgent).await.unwrap();

    let claimed = claim(&ctx).await.unwrap();
    assert_eq!(claimed.id, urgent.id, "p1 beats an older p3");
    assert_eq!(claimed.status, TaskStatus::InProgress);
    assert_eq!(claimed.assigned_agent_id, Some(ctx.agent_id));

    // The claiming agent is marked working on the task.
    let agent = agents::get_agent(&ctx.pool, ctx.agent_id).await.unwrap().unwrap();
    assert_eq!(agent.status, hollon_db::models::AgentStatus::Working);
    assert_eq!(agent.current_task_id, Some(urgent.id));

    // The low-priority task is untouched.
    let low = tasks::get_task(&ctx.pool, low.id).await.unwrap().unwrap();
    assert_eq!(low.status, TaskStatus::Pending);

    ctx.pool.close().await;
    hollon_test_utils::drop_test_db(&ctx.db_name).await;
}

#[tokio::test]
async fn claim_skips_team_epics_and_foreign_assignments() {
    let ctx = setup().await;

    let mut epic = NewTask::leaf(ctx.project_id, "an epic");
    epic.task_type = hollon_db::models::TaskType::TeamEpic;
    tasks::insert_task(&ctx.pool, &epic).await.unwrap();

    let other_agent = Uuid::new_v4();
    let mut foreign = NewTask::leaf(ctx.project_id, "someone else's");
    foreign.assigned_agent_id = Some(other_agent);
    // Insert fails on the FK for a random agent; build a real one instead.
    assert!(tasks::insert_task(&ctx.pool, &foreign).await.is_err());

    assert!(claim(&ctx).await.is_none(), "epics are never claimable");

    ctx.pool.close().await;
    hollon_test_utils::drop_test_db(&ctx.db_name).await;
}

#[tokio::test]
async fn capability_superset_is_required() {
    let ctx = setup().await;

    let mut task = NewTask::leaf(ctx.project_id, "requires rust only");
    task.required_capabilities = vec!["rust".into()];
    tasks::insert_task(&ctx.pool, &task).await.unwrap();

    let mut demanding = NewTask::leaf(ctx.project_id, "requires rust and ml");
    demanding.required_capabilities = vec!["rust".into(), "ml".into()];
    demanding.priority = TaskPriority::P1;
    tasks::insert_task(&ctx.pool, &demanding).await.unwrap();

    // Despite its priority, the demanding task is out of reach.
    let claimed = claim(&ctx).await.unwrap();
    assert_eq!(claimed.title, "requires rust only");

    ctx.pool.close().await;
    hollon_test_utils::drop_test_db(&ctx.db_name).await;
}

#[tokio::test]
async fn concurrency_guard_returns_held_task() {
    let ctx = setup().await;

    let first = tasks::insert_task(&ctx.pool, &NewTask::leaf(ctx.project_id, "one"))
        .await
        .unwrap();
    tasks::insert_task(&ctx.pool, &NewTask::leaf(ctx.project_id, "two"))
        .await
        .unwrap();

    let claimed = claim(&ctx).await.unwrap();
    assert_eq!(claimed.id, first.id);

    // max_concurrent_tasks = 1: the second claim returns the held task
    // instead of a new one.
    let held = claim(&ctx).await.unwrap();
    assert_eq!(held.id, first.id);

    ctx.pool.close().await;
    hollon_test_utils::drop_test_db(&ctx.db_name).await;
}

#[tokio::test]
async fn concurrent_claimants_never_share_a_task() {
    let ctx = setup().await;

    // A second agent in the same org and team.
    let role = roles::insert_role(&ctx.pool, ctx.org_id, "engineer-2", "", &["rust".into()], false)
        .await
        .unwrap();
    let team = teams::insert_team(&ctx.pool, ctx.org_id, "core-2", None, "")
        .await
        .unwrap();
    let agent2 = agents::insert_agent(
        &ctx.pool,
        &NewAgent {
            organization_id: ctx.org_id,
            team_id: team.id,
            role_id: role.id,
            name: "dev-2".into(),
            brain_provider: "scripted".into(),
            custom_prompt: None,
            max_concurrent_tasks: 1,
        },
    )
    .await
    .unwrap();

    tasks::insert_task(&ctx.pool, &NewTask::leaf(ctx.project_id, "contested"))
        .await
        .unwrap();

    // Race both claimants.
    let pool = ctx.pool.clone();
    let org = ctx.org_id;
    let a1 = ctx.agent_id;
    let caps = vec!["rust".to_string()];
    let caps2 = caps.clone();
    let pool2 = pool.clone();
    let (r1, r2) = tokio::join!(
        tokio::spawn(async move { tasks::claim_ready_task(&pool, a1, org, &caps, 1).await }),
        tokio::spawn(async move {
            tasks::claim_ready_task(&pool2, agent2.id, org, &caps2, 1).await
        }),
    );
    let r1 = r1.unwrap().unwrap();
    let r2 = r2.unwrap().unwrap();

    // Exactly one winner.
    assert!(
        r1.is_some() ^ r2.is_some(),
        "exactly one claimant must win, got {r1:?} and {r2:?}"
    );

    ctx.pool.close().await;
    hollon_test_utils::drop_test_db(&ctx.db_name).await;
}
