mod config;
mod routes;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hollon_core::brain::subprocess::SubprocessBrain;
use hollon_core::brain::{BrainRegistry, TokenRates};
use hollon_core::execution::ExecutionDeps;
use hollon_core::gate::GateConfig;
use hollon_core::governor::Governor;
use hollon_core::loops::{run_control_loops, LoopConfig};
use hollon_core::prompt::PromptComposer;
use hollon_core::vcs::local::LocalVcsHost;
use hollon_db::pool;

use config::HollonConfig;

#[derive(Parser)]
#[command(name = "hollond", about = "Autonomous agent orchestrator service")]
struct Cli {
    /// Database URL (overrides HOLLON_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a hollon config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = hollon_db::config::DbConfig::DEFAULT_URL)]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the hollon database (create + migrate)
    DbInit,
    /// Run the service: HTTP surface plus control-plane loops
    Serve {
        /// Tick period for the control loops, in seconds
        #[arg(long, default_value_t = 10)]
        tick_secs: u64,
        /// Brain invocation timeout, in seconds
        #[arg(long, default_value_t = 300)]
        brain_timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let resolved = HollonConfig::resolve(cli.database_url.clone());

    match cli.command {
        Commands::Init { db_url, force } => init_config(&db_url, force),
        Commands::DbInit => db_init(&resolved).await,
        Commands::Serve {
            tick_secs,
            brain_timeout_secs,
        } => {
            serve(
                &resolved,
                Duration::from_secs(tick_secs),
                Duration::from_secs(brain_timeout_secs),
            )
            .await
        }
    }
}

fn init_config(db_url: &str, force: bool) -> Result<()> {
    let path = config::config_path();
    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    config::save_config(&config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        server: config::ServerSection::default(),
    })?;
    println!("wrote config to {}", path.display());
    Ok(())
}

async fn db_init(resolved: &HollonConfig) -> Result<()> {
    pool::ensure_database_exists(&resolved.db).await?;
    let db = pool::create_pool(&resolved.db).await?;
    pool::run_migrations(&db, pool::default_migrations_path()).await?;
    println!("database initialized at {}", resolved.db.database_url);
    Ok(())
}

async fn serve(resolved: &HollonConfig, tick: Duration, brain_timeout: Duration) -> Result<()> {
    let db = pool::create_pool(&resolved.db).await?;

    let mut brains = BrainRegistry::new();
    register_env_brains(&mut brains);

    let deps = Arc::new(ExecutionDeps {
        pool: db.clone(),
        brains: Arc::new(brains),
        host: Arc::new(LocalVcsHost::new()),
        composer: PromptComposer::default(),
        gate: GateConfig::default(),
        brain_timeout,
    });

    let cancel = CancellationToken::new();

    let loops = if resolved.scheduler_disabled {
        info!("scheduler disabled; control loops will not run");
        None
    } else {
        let deps = Arc::clone(&deps);
        let governor = Arc::new(Governor::new());
        let cancel = cancel.clone();
        let config = LoopConfig { period: tick };
        Some(tokio::spawn(async move {
            run_control_loops(deps, governor, config, cancel).await
        }))
    };

    let app = routes::router(db);
    let listener = tokio::net::TcpListener::bind(&resolved.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", resolved.http_addr))?;
    info!(addr = %resolved.http_addr, "hollond listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await
        .context("http server failed")?;

    cancel.cancel();
    if let Some(loops) = loops {
        loops.await.context("control loops panicked")??;
    }
    Ok(())
}

/// Resolve Ctrl-C into cooperative cancellation: the loops stop issuing new
/// cycles and in-flight cycles run to their wall-clock ceiling.
async fn shutdown_signal(cancel: CancellationToken) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
    cancel.cancel();
}

/// Register subprocess brain providers from `HOLLON_BRAIN_<NAME>` env vars.
///
/// Each variable holds the provider command line; credentials travel in the
/// provider's own environment. Token rates default to zero (providers that
/// report `sub_cents` directly need no rates).
fn register_env_brains(brains: &mut BrainRegistry) {
    for (key, value) in std::env::vars() {
        let Some(name) = key.strip_prefix("HOLLON_BRAIN_") else {
            continue;
        };
        let mut parts = value.split_whitespace();
        let Some(program) = parts.next() else {
            continue;
        };
        let args: Vec<String> = parts.map(str::to_string).collect();
        let name = name.to_lowercase();
        info!(provider = %name, program, "registered subprocess brain");
        brains.register(Arc::new(SubprocessBrain::new(
            name.clone(),
            program,
            args,
            TokenRates {
                input_sub_cents_per_mtok: 0,
                output_sub_cents_per_mtok: 0,
            },
        )));
    }
}
