use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Error returned when parsing an invalid enum string.
#[derive(Debug, Clone)]
pub struct EnumParseError {
    pub what: &'static str,
    pub value: String,
}

impl fmt::Display for EnumParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?}", self.what, self.value)
    }
}

impl std::error::Error for EnumParseError {}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle class of an agent.
///
/// Permanent agents are created by operators and live indefinitely.
/// Transient agents are created by other agents for a specific task and are
/// destroyed when their originating task terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentLifecycle {
    Permanent,
    Transient,
}

impl fmt::Display for AgentLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Permanent => "permanent",
            Self::Transient => "transient",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentLifecycle {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "permanent" => Ok(Self::Permanent),
            "transient" => Ok(Self::Transient),
            other => Err(EnumParseError {
                what: "agent lifecycle",
                value: other.to_owned(),
            }),
        }
    }
}

/// Runtime status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Working,
    Blocked,
    Reviewing,
    Offline,
    Error,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Working => "working",
            Self::Blocked => "blocked",
            Self::Reviewing => "reviewing",
            Self::Offline => "offline",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentStatus {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "working" => Ok(Self::Working),
            "blocked" => Ok(Self::Blocked),
            "reviewing" => Ok(Self::Reviewing),
            "offline" => Ok(Self::Offline),
            "error" => Ok(Self::Error),
            other => Err(EnumParseError {
                what: "agent status",
                value: other.to_owned(),
            }),
        }
    }
}

/// Status of a goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Active,
    Decomposed,
    Completed,
    Abandoned,
    Failed,
}

impl fmt::Display for GoalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Decomposed => "decomposed",
            Self::Completed => "completed",
            Self::Abandoned => "abandoned",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for GoalStatus {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "decomposed" => Ok(Self::Decomposed),
            "completed" => Ok(Self::Completed),
            "abandoned" => Ok(Self::Abandoned),
            "failed" => Ok(Self::Failed),
            other => Err(EnumParseError {
                what: "goal status",
                value: other.to_owned(),
            }),
        }
    }
}

/// Classification of a task.
///
/// `team_epic` tasks are decomposition containers assigned to a team; every
/// other type is a leaf executed by a single agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    TeamEpic,
    Implementation,
    Review,
    Test,
    Documentation,
    Spike,
    Other,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TeamEpic => "team_epic",
            Self::Implementation => "implementation",
            Self::Review => "review",
            Self::Test => "test",
            Self::Documentation => "documentation",
            Self::Spike => "spike",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskType {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "team_epic" => Ok(Self::TeamEpic),
            "implementation" => Ok(Self::Implementation),
            "review" => Ok(Self::Review),
            "test" => Ok(Self::Test),
            "documentation" => Ok(Self::Documentation),
            "spike" => Ok(Self::Spike),
            "other" => Ok(Self::Other),
            other => Err(EnumParseError {
                what: "task type",
                value: other.to_owned(),
            }),
        }
    }
}

/// Task priority. Lower numeric suffix means higher urgency, and the text
/// encoding sorts correctly: "p1" < "p2" < "p3" < "p4".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    P1,
    P2,
    P3,
    P4,
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::P1 => "p1",
            Self::P2 => "p2",
            Self::P3 => "p3",
            Self::P4 => "p4",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskPriority {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "p1" => Ok(Self::P1),
            "p2" => Ok(Self::P2),
            "p3" => Ok(Self::P3),
            "p4" => Ok(Self::P4),
            other => Err(EnumParseError {
                what: "task priority",
                value: other.to_owned(),
            }),
        }
    }
}

/// Estimated complexity of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskComplexity {
    Low,
    Medium,
    High,
}

impl fmt::Display for TaskComplexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskComplexity {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(EnumParseError {
                what: "task complexity",
                value: other.to_owned(),
            }),
        }
    }
}

/// Status of a task.
///
/// The transition graph is enforced by [`crate::queries::tasks::set_task_status`]
/// together with the state machine in `hollon-core`:
///
/// ```text
/// pending     -> ready        (dependencies complete)
/// pending     -> in_progress  (claimed directly when dependencies complete)
/// ready       -> in_progress  (claimed)
/// in_progress -> in_review    (change-set published)
/// in_review   -> ready        (CI failure, re-execution)
/// in_review   -> approved     (review passed)
/// approved    -> completed    (merged)
/// any         -> failed | cancelled | blocked
/// blocked     -> ready        (recovered)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    InProgress,
    InReview,
    Approved,
    Completed,
    Blocked,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::InProgress => "in_progress",
            Self::InReview => "in_review",
            Self::Approved => "approved",
            Self::Completed => "completed",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "in_progress" => Ok(Self::InProgress),
            "in_review" => Ok(Self::InReview),
            "approved" => Ok(Self::Approved),
            "completed" => Ok(Self::Completed),
            "blocked" => Ok(Self::Blocked),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(EnumParseError {
                what: "task status",
                value: other.to_owned(),
            }),
        }
    }
}

/// Status of a change-set on the external VCS host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ChangeSetStatus {
    Draft,
    ReadyForReview,
    ChangesRequested,
    Approved,
    Merged,
    Closed,
}

impl fmt::Display for ChangeSetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::ReadyForReview => "ready_for_review",
            Self::ChangesRequested => "changes_requested",
            Self::Approved => "approved",
            Self::Merged => "merged",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

impl FromStr for ChangeSetStatus {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "ready_for_review" => Ok(Self::ReadyForReview),
            "changes_requested" => Ok(Self::ChangesRequested),
            "approved" => Ok(Self::Approved),
            "merged" => Ok(Self::Merged),
            "closed" => Ok(Self::Closed),
            other => Err(EnumParseError {
                what: "change-set status",
                value: other.to_owned(),
            }),
        }
    }
}

/// Status of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Active,
    Archived,
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Archived => "archived",
        };
        f.write_str(s)
    }
}

impl FromStr for ProjectStatus {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "archived" => Ok(Self::Archived),
            other => Err(EnumParseError {
                what: "project status",
                value: other.to_owned(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// An organization -- the tenancy boundary.
///
/// `autonomous_execution_enabled = false` is the emergency stop: the execute
/// loop skips the organization entirely until a human resumes it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub context_prompt: String,
    /// Daily spend cap, integer sub-cents.
    pub daily_cost_cap_sub_cents: i64,
    /// Monthly spend cap, integer sub-cents.
    pub monthly_cost_cap_sub_cents: i64,
    pub max_concurrent_agents: i32,
    pub autonomous_execution_enabled: bool,
    pub last_stop_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A role -- capability profile shared by agents.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Role {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub system_prompt: String,
    /// Free-text capability tags, normalized to lowercase at insert time.
    pub capabilities: Vec<String>,
    /// Whether transient agents may be created with this role.
    pub transient_eligible: bool,
    pub created_at: DateTime<Utc>,
}

/// A team -- a grouping of agents with an optional manager.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Team {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub parent_team_id: Option<Uuid>,
    pub manager_agent_id: Option<Uuid>,
    pub description_prompt: String,
    pub created_at: DateTime<Utc>,
}

/// An agent ("hollon") -- the execution principal.
///
/// Invariant: `status = working` implies `current_task_id` is set.
/// Transient agents carry a `creator_agent_id` back-pointer and a
/// pre-computed `depth` capped at 3.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Agent {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub team_id: Uuid,
    pub role_id: Uuid,
    pub name: String,
    /// Brain provider reference, resolved by the brain registry.
    pub brain_provider: String,
    pub custom_prompt: Option<String>,
    pub lifecycle: AgentLifecycle,
    pub status: AgentStatus,
    pub creator_agent_id: Option<Uuid>,
    /// 0 for permanent agents; creator depth + 1 for transient agents.
    pub depth: i32,
    pub current_task_id: Option<Uuid>,
    pub max_concurrent_tasks: i32,
    pub tasks_completed: i64,
    pub tasks_failed: i64,
    /// Cumulative wall time across completed tasks, for average duration.
    pub total_duration_ms: i64,
    pub created_at: DateTime<Utc>,
}

impl Agent {
    /// Fraction of terminal outcomes that completed successfully.
    pub fn success_rate(&self) -> f64 {
        let total = self.tasks_completed + self.tasks_failed;
        if total == 0 {
            return 0.0;
        }
        self.tasks_completed as f64 / total as f64
    }

    /// Average task duration in milliseconds, or `None` before the first
    /// completion.
    pub fn average_duration_ms(&self) -> Option<i64> {
        if self.tasks_completed == 0 {
            return None;
        }
        Some(self.total_duration_ms / self.tasks_completed)
    }
}

/// A project -- a target repository.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Project {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub host_url: String,
    /// Root of the local working copy; sandboxes live under
    /// `<working_dir>/.worktrees/`.
    pub working_dir: String,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
}

/// A goal -- the top-level unit of work filed by a human.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Goal {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub project_id: Uuid,
    pub owner_agent_id: Uuid,
    pub title: String,
    pub description: String,
    pub success_criteria: Vec<String>,
    pub status: GoalStatus,
    /// Monotonic false -> true; flipped by CAS so double decomposition is
    /// impossible.
    pub decomposed: bool,
    pub decompose_retry_count: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A task -- the central work record.
///
/// Assignment is exclusive-or: `assigned_team_id` (epics) or
/// `assigned_agent_id` (leaves), never both; both may be null for drafts.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub project_id: Uuid,
    pub goal_id: Option<Uuid>,
    pub parent_task_id: Option<Uuid>,
    /// Root = 0; hard cap 3.
    pub depth: i32,
    pub assigned_team_id: Option<Uuid>,
    pub assigned_agent_id: Option<Uuid>,
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub complexity: Option<TaskComplexity>,
    pub required_capabilities: Vec<String>,
    pub affected_files: Vec<String>,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub status: TaskStatus,
    pub retry_count: i32,
    pub consecutive_failures: i32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub blocked_until: Option<DateTime<Utc>>,
    pub ci_retry_count: i32,
    pub last_ci_failure_at: Option<DateTime<Utc>>,
    pub last_ci_feedback: Option<String>,
    /// Retry counter for decomposition of this epic (phase B).
    pub plan_retry_count: i32,
    pub change_set_id: Option<Uuid>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// An edge in the task dependency DAG: `task_id` depends on `depends_on`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskDependency {
    pub task_id: Uuid,
    pub depends_on: Uuid,
}

/// A change-set -- a published branch plus review handle on the VCS host.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ChangeSet {
    pub id: Uuid,
    pub task_id: Uuid,
    pub project_id: Uuid,
    pub branch_name: String,
    pub review_number: Option<i64>,
    pub review_url: Option<String>,
    pub author_agent_id: Uuid,
    pub reviewer_agent_id: Option<Uuid>,
    pub status: ChangeSetStatus,
    pub review_comments: Option<String>,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub merged_at: Option<DateTime<Utc>>,
}

/// One execution attempt of one task by one agent. Append-only; this table
/// is the primary cost ledger.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExecutionRecord {
    pub id: i64,
    pub task_id: Uuid,
    pub agent_id: Uuid,
    pub attempt: i32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_sub_cents: i64,
    pub brain_duration_ms: i64,
}

/// Per-day cost roll-up at organization granularity, derived from
/// execution records in the same transaction that appends them.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CostRecord {
    pub organization_id: Uuid,
    pub day: NaiveDate,
    pub sub_cents: i64,
}

/// An escalation record on the 5-level ladder. Task-scoped records carry a
/// `task_id`; organization-level records (a tripped cost cap) carry the
/// `organization_id` instead.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Escalation {
    pub id: Uuid,
    pub task_id: Option<Uuid>,
    pub organization_id: Option<Uuid>,
    /// 1 = self-retry .. 5 = terminal.
    pub level: i32,
    pub reason: String,
    pub requested_by_agent_id: Option<Uuid>,
    pub resolver_agent_id: Option<Uuid>,
    pub decision: Option<String>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

/// A learned artifact produced by the extraction pipeline. The control plane
/// only reads these (prompt layer 5) and emits completion events; it makes
/// no assumptions about how they are produced.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct KnowledgeArtifact {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub task_id: Option<Uuid>,
    pub title: String,
    pub content: String,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
