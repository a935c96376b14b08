use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use baton_core::app::query_status;
use baton_core::domain::{TaskId, TaskStatus};
use baton_core::impls::FileTaskStore;
use baton_core::ports::{Clock, IdGenerator, SystemClock, UlidGenerator};
use baton_core::{BatonConfig, OrchestratorBuilder};
use clap::{Parser, Subcommand};

mod agents;

use agents::SimulatedAgent;

/// Built-in onboarding pipeline used when `--config` is not given.
const ONBOARDING: &str = include_str!("onboarding.toml");

#[derive(Parser)]
#[command(name = "baton")]
#[command(about = "Baton - multi-stage task orchestrator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a config file and check its pipeline
    Validate { config: PathBuf },

    /// Run one task through the pipeline with simulated agents
    Run {
        #[arg(long)]
        subject: String,

        /// Config file (defaults to the built-in onboarding pipeline)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Make the kyc agent fail this many times
        #[arg(long, default_value_t = 0)]
        fail_kyc: u32,

        /// Simulated work per stage
        #[arg(long, default_value_t = 2000)]
        agent_delay_ms: u64,
    },

    /// Print a task's status from a file store
    Status {
        task_id: TaskId,

        #[arg(long)]
        store: PathBuf,
    },
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;

    match cli.command {
        Commands::Validate { config } => {
            init_tracing("warn");
            validate(&config)
        }
        Commands::Run {
            subject,
            config,
            fail_kyc,
            agent_delay_ms,
        } => {
            let config = load_config(config.as_deref())?;
            init_tracing(&config.logging.level);
            runtime.block_on(run(
                config,
                &subject,
                fail_kyc,
                Duration::from_millis(agent_delay_ms),
            ))
        }
        Commands::Status { task_id, store } => {
            init_tracing("warn");
            runtime.block_on(status(task_id, &store))
        }
    }
}

/// `RUST_LOG` wins over the configured level.
fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn load_config(path: Option<&Path>) -> Result<BatonConfig> {
    match path {
        Some(path) => BatonConfig::load(path).with_context(|| format!("loading {}", path.display())),
        None => BatonConfig::from_toml_str(ONBOARDING).context("built-in onboarding config"),
    }
}

fn validate(path: &Path) -> Result<ExitCode> {
    let config = load_config(Some(path))?;
    let graph = config.graph().context("invalid pipeline")?;

    let route: Vec<&str> = graph.success_path().into_iter().map(|s| s.as_str()).collect();
    println!("ok: {} stages, entry '{}'", graph.len(), graph.entry_stage());
    println!("success path: {} -> terminal", route.join(" -> "));
    for stage in graph.stages() {
        println!(
            "  {:<16} topic={:<16} max_attempts={} timeout={:?}",
            stage.name.as_str(),
            stage.target_topic,
            stage.max_attempts,
            stage.timeout,
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn run(config: BatonConfig, subject: &str, fail_kyc: u32, delay: Duration) -> Result<ExitCode> {
    let graph = config.graph().context("invalid pipeline")?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
    let store = config
        .store
        .open(
            Arc::clone(&clock),
            Arc::clone(&ids),
            config.orchestrator.dedup_retention(),
        )
        .await
        .context("opening task store")?;

    let topics: Vec<String> = graph.topics().into_iter().map(str::to_string).collect();
    let mut builder = OrchestratorBuilder::new(graph)
        .settings(config.orchestrator.clone())
        .store(store)
        .clock(clock)
        .id_generator(ids);
    for topic in topics {
        let failures = if topic == "kyc" { fail_kyc } else { 0 };
        let agent = SimulatedAgent::new(topic, delay).failing(failures);
        builder = builder.agent(Arc::new(agent))?;
    }
    let mut orchestrator = builder.require_agents().build()?;
    orchestrator.start().await?;

    let task_id = orchestrator.submit(subject).await?;
    println!("submitted {task_id} for subject '{subject}'");

    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    let view = loop {
        tokio::select! {
            _ = ticker.tick() => {
                let view = orchestrator.status(task_id).await?;
                if view.status.is_terminal() {
                    break Some(view);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("interrupted");
                break None;
            }
        }
    };

    let counts = orchestrator.counts().await?;
    orchestrator.shutdown().await;

    let Some(view) = view else {
        return Ok(ExitCode::from(130));
    };
    println!("{}", serde_json::to_string_pretty(&view)?);
    println!(
        "counts: pending={} in_progress={} completed={} failed={}",
        counts.pending, counts.in_progress, counts.completed, counts.failed
    );

    Ok(match view.status {
        TaskStatus::Completed => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

async fn status(task_id: TaskId, path: &Path) -> Result<ExitCode> {
    anyhow::ensure!(path.exists(), "no store at {}", path.display());

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
    let store = FileTaskStore::open(path, clock, ids)
        .await
        .with_context(|| format!("opening {}", path.display()))?;

    let view = query_status(&store, task_id)
        .await
        .with_context(|| format!("task {task_id}"))?;
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(ExitCode::SUCCESS)
}
