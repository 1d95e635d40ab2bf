#![allow(dead_code)]
//! Shared fixtures for hollon-core integration tests.
//!
//! Each test gets a temporary database (via hollon-test-utils), a scratch
//! git repository to act as the project working copy, and an organization
//! populated with a team, a role, and whatever agents the test adds.

use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tempfile::TempDir;
use uuid::Uuid;

use hollon_core::brain::scripted::ScriptedBrain;
use hollon_core::brain::BrainRegistry;
use hollon_core::execution::ExecutionDeps;
use hollon_core::gate::GateConfig;
use hollon_core::prompt::PromptComposer;
use hollon_core::vcs::local::LocalVcsHost;
use hollon_db::models::{Agent, Organization, Project, Role, Team};
use hollon_db::queries::agents::NewAgent;
use hollon_db::queries::orgs::NewOrganization;
use hollon_db::queries::{agents, orgs, projects, roles, teams};

pub struct Fixture {
    pub pool: PgPool,
    pub db_name: String,
    /// Keeps the scratch repository alive for the test's duration.
    pub repo: TempDir,
    pub org: Organization,
    pub team: Team,
    pub role: Role,
    pub project: Project,
    pub host: Arc<LocalVcsHost>,
}

impl Fixture {
    pub async fn teardown(self) {
        self.pool.close().await;
        hollon_test_utils::drop_test_db(&self.db_name).await;
    }
}

/// Build a fixture with the given daily cost cap (0 disables budget gates).
pub async fn fixture_with_cap(daily_cap_sub_cents: i64) -> Fixture {
    let (pool, db_name) = hollon_test_utils::create_test_db().await;
    let repo = create_git_repo();

    let org = orgs::insert_organization(
        &pool,
        &NewOrganization {
            name: format!("org-{}", Uuid::new_v4().simple()),
            context_prompt: "You build software autonomously.".into(),
            daily_cost_cap_sub_cents: daily_cap_sub_cents,
            monthly_cost_cap_sub_cents: 0,
            max_concurrent_agents: 4,
        },
    )
    .await
    .expect("insert org");

    let role = roles::insert_role(
        &pool,
        org.id,
        "engineer",
        "You are a careful software engineer.",
        &["rust".to_string(), "backend".to_string()],
        false,
    )
    .await
    .expect("insert role");

    let team = teams::insert_team(&pool, org.id, "core", None, "The core team.")
        .await
        .expect("insert team");

    let project = projects::insert_project(
        &pool,
        org.id,
        "demo",
        "local://demo",
        repo.path().to_str().unwrap(),
    )
    .await
    .expect("insert project");

    Fixture {
        pool,
        db_name,
        repo,
        org,
        team,
        role,
        project,
        host: Arc::new(LocalVcsHost::new()),
    }
}

pub async fn fixture() -> Fixture {
    fixture_with_cap(0).await
}

/// Add an agent on the fixture team with its own brain provider name.
pub async fn add_agent(fx: &Fixture, name: &str, provider: &str) -> Agent {
    agents::insert_agent(
        &fx.pool,
        &NewAgent {
            organization_id: fx.org.id,
            team_id: fx.team.id,
            role_id: fx.role.id,
            name: name.to_string(),
            brain_provider: provider.to_string(),
            custom_prompt: None,
            max_concurrent_tasks: 1,
        },
    )
    .await
    .expect("insert agent")
}

/// Build execution deps wired to the fixture host and the given brains.
pub fn deps_with_brains(fx: &Fixture, brains: Vec<Arc<ScriptedBrain>>) -> ExecutionDeps {
    let mut registry = BrainRegistry::new();
    for brain in brains {
        registry.register(brain);
    }
    ExecutionDeps {
        pool: fx.pool.clone(),
        brains: Arc::new(registry),
        host: fx.host.clone(),
        composer: PromptComposer::default(),
        gate: GateConfig::default(),
        brain_timeout: Duration::from_secs(5),
    }
}

/// A valid edit envelope writing one file.
pub fn edit_envelope(path: &str) -> String {
    serde_json::json!({
        "files": [{"path": path, "content": "pub fn generated() -> i32 { 7 }\n"}],
        "summary": "write generated module"
    })
    .to_string()
}

/// An approve review verdict.
pub fn approve_verdict() -> String {
    r#"{"verdict": "APPROVE", "comments": "looks good"}"#.to_string()
}

fn create_git_repo() -> TempDir {
    let dir = TempDir::new().expect("failed to create temp dir");
    let path = dir.path();

    let run = |args: &[&str]| {
        let output = Command::new("git")
            .args(args)
            .current_dir(path)
            .output()
            .unwrap_or_else(|e| panic!("git {} failed: {e}", args.join(" ")));
        assert!(output.status.success(), "git {} failed", args.join(" "));
    };

    run(&["init"]);
    run(&["config", "user.email", "test@hollon.local"]);
    run(&["config", "user.name", "Hollon Test"]);
    std::fs::write(path.join("README.md"), "# Demo\n").unwrap();
    run(&["add", "."]);
    run(&["commit", "-m", "Initial commit"]);

    dir
}
