//! HTTP surface for hollond.
//!
//! Humans interact with the control plane through a narrow set of
//! endpoints: goal submission, emergency stop and resume, read-only
//! goal/task views with escalation chains, the assignment nudge, and cost
//! roll-ups. Everything else is autonomous.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use hollon_db::error::StoreError;
use hollon_db::models::{ChangeSet, Escalation, ExecutionRecord, Goal, Task};
use hollon_db::queries::goals::NewGoal;
use hollon_db::queries::tasks::GoalProgress;
use hollon_db::queries::{change_sets, escalations, executions, goals, orgs, tasks};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        // Translate typed store failures to their HTTP meanings; anything
        // else is a 500.
        if let Some(store) = err.downcast_ref::<StoreError>() {
            let status = match store {
                StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
                StoreError::Conflict { .. } => StatusCode::CONFLICT,
                StoreError::Forbidden(_) => StatusCode::FORBIDDEN,
                StoreError::InvariantViolation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            };
            return Self {
                status,
                message: store.to_string(),
            };
        }
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err)
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct StopRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitGoalRequest {
    pub organization_id: Uuid,
    pub project_id: Uuid,
    pub owner_agent_id: Uuid,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub success_criteria: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct SubmitGoalResponse {
    pub goal_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct ProgressResponse {
    pub pending: i64,
    pub ready: i64,
    pub in_progress: i64,
    pub in_review: i64,
    pub approved: i64,
    pub completed: i64,
    pub blocked: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub total: i64,
}

impl From<GoalProgress> for ProgressResponse {
    fn from(p: GoalProgress) -> Self {
        Self {
            pending: p.pending,
            ready: p.ready,
            in_progress: p.in_progress,
            in_review: p.in_review,
            approved: p.approved,
            completed: p.completed,
            blocked: p.blocked,
            failed: p.failed,
            cancelled: p.cancelled,
            total: p.total,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct GoalDetailResponse {
    #[serde(flatten)]
    pub goal: Goal,
    pub progress: ProgressResponse,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Serialize)]
pub struct TaskDetailResponse {
    #[serde(flatten)]
    pub task: Task,
    /// True when neither a team nor an agent is assigned: such tasks are
    /// invisible to the execute loop until a human assigns them.
    pub needs_assignment: bool,
    pub dependencies: Vec<Uuid>,
    pub escalations: Vec<Escalation>,
    pub executions: Vec<ExecutionRecord>,
    pub change_sets: Vec<ChangeSet>,
}

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub agent_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct ResolveEscalationRequest {
    /// True re-creates the task as a fresh attempt; false rejects it
    /// terminally.
    pub retry: bool,
}

#[derive(Debug, Deserialize)]
pub struct TaskListQuery {
    pub project_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct CostResponse {
    pub daily_sub_cents: i64,
    pub monthly_sub_cents: i64,
    pub daily_cap_sub_cents: i64,
    pub monthly_cap_sub_cents: i64,
    pub autonomous_execution_enabled: bool,
    pub last_stop_reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn stop_org(
    State(pool): State<PgPool>,
    Path(org_id): Path<Uuid>,
    // The body is optional: a bare POST is a valid stop.
    request: Option<Json<StopRequest>>,
) -> Result<StatusCode, AppError> {
    let reason = request
        .as_ref()
        .and_then(|r| r.reason.as_deref())
        .unwrap_or("manual stop");
    orgs::set_autonomous_execution(&pool, org_id, false, Some(reason)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn resume_org(
    State(pool): State<PgPool>,
    Path(org_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    orgs::set_autonomous_execution(&pool, org_id, true, None).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn org_costs(
    State(pool): State<PgPool>,
    Path(org_id): Path<Uuid>,
) -> Result<Json<CostResponse>, AppError> {
    let org = orgs::get_organization(&pool, org_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("organization {org_id} not found")))?;

    let today = Utc::now().date_naive();
    let daily = executions::daily_cost(&pool, org_id, today).await?;
    let monthly = executions::monthly_cost(&pool, org_id, today).await?;

    Ok(Json(CostResponse {
        daily_sub_cents: daily,
        monthly_sub_cents: monthly,
        daily_cap_sub_cents: org.daily_cost_cap_sub_cents,
        monthly_cap_sub_cents: org.monthly_cost_cap_sub_cents,
        autonomous_execution_enabled: org.autonomous_execution_enabled,
        last_stop_reason: org.last_stop_reason,
    }))
}

async fn submit_goal(
    State(pool): State<PgPool>,
    Json(request): Json<SubmitGoalRequest>,
) -> Result<(StatusCode, Json<SubmitGoalResponse>), AppError> {
    let goal = goals::insert_goal(
        &pool,
        &NewGoal {
            organization_id: request.organization_id,
            project_id: request.project_id,
            owner_agent_id: request.owner_agent_id,
            title: request.title,
            description: request.description,
            success_criteria: request.success_criteria,
        },
    )
    .await?;

    Ok((
        StatusCode::CREATED,
        Json(SubmitGoalResponse { goal_id: goal.id }),
    ))
}

async fn get_goal(
    State(pool): State<PgPool>,
    Path(goal_id): Path<Uuid>,
) -> Result<Json<GoalDetailResponse>, AppError> {
    let goal = goals::get_goal(&pool, goal_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("goal {goal_id} not found")))?;
    let progress = tasks::get_goal_progress(&pool, goal_id).await?;
    let goal_tasks = tasks::list_tasks_for_goal(&pool, goal_id).await?;

    Ok(Json(GoalDetailResponse {
        goal,
        progress: progress.into(),
        tasks: goal_tasks,
    }))
}

async fn get_task(
    State(pool): State<PgPool>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<TaskDetailResponse>, AppError> {
    let task = tasks::get_task(&pool, task_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("task {task_id} not found")))?;

    let dependencies = tasks::find_dependencies(&pool, task_id)
        .await?
        .into_iter()
        .map(|t| t.id)
        .collect();
    let task_escalations = escalations::list_for_task(&pool, task_id).await?;
    let task_executions = executions::list_for_task(&pool, task_id).await?;
    let task_change_sets = change_sets::list_for_task(&pool, task_id).await?;

    let needs_assignment =
        task.assigned_team_id.is_none() && task.assigned_agent_id.is_none();

    Ok(Json(TaskDetailResponse {
        task,
        needs_assignment,
        dependencies,
        escalations: task_escalations,
        executions: task_executions,
        change_sets: task_change_sets,
    }))
}

async fn list_tasks(
    State(pool): State<PgPool>,
    Query(query): Query<TaskListQuery>,
) -> Result<Json<Vec<Task>>, AppError> {
    let project_tasks = tasks::list_tasks_for_project(&pool, query.project_id).await?;
    Ok(Json(project_tasks))
}

async fn assign_task(
    State(pool): State<PgPool>,
    Path(task_id): Path<Uuid>,
    Json(request): Json<AssignRequest>,
) -> Result<StatusCode, AppError> {
    tasks::assign_task_to_agent(&pool, task_id, request.agent_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cancel_task(
    State(pool): State<PgPool>,
    Path(task_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    tasks::cancel_task(&pool, task_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn resolve_escalation(
    State(pool): State<PgPool>,
    Path(escalation_id): Path<Uuid>,
    Json(request): Json<ResolveEscalationRequest>,
) -> Result<StatusCode, AppError> {
    let escalation = escalations::get_escalation(&pool, escalation_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("escalation {escalation_id} not found")))?;
    let task_id = escalation
        .task_id
        .ok_or_else(|| AppError::not_found("escalation carries no task"))?;

    hollon_core::escalation::resolve_human_escalation(&pool, escalation_id, task_id, request.retry)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the hollond router.
pub fn router(pool: PgPool) -> Router {
    Router::new()
        .route("/orgs/{id}/stop", post(stop_org))
        .route("/orgs/{id}/resume", post(resume_org))
        .route("/orgs/{id}/costs", get(org_costs))
        .route("/goals", post(submit_goal))
        .route("/goals/{id}", get(get_goal))
        .route("/tasks", get(list_tasks))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/assign", patch(assign_task))
        .route("/tasks/{id}/cancel", post(cancel_task))
        .route("/escalations/{id}/resolve", post(resolve_escalation))
        .layer(CorsLayer::permissive())
        .with_state(pool)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
