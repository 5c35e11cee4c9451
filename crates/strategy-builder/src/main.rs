use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coordination::{CheckpointStore, FileCheckpointStore, HealthMonitor, SessionManager};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use strategy_builder::artifact::ArtifactStore;
use strategy_builder::config::BuildConfig;
use strategy_builder::generator::CommandGenerator;
use strategy_builder::mcp_client::{McpClient, McpLeaseInitializer, McpProbe};
use strategy_builder::notify::SlackNotifier;
use strategy_builder::orchestrator::{BuildOrchestrator, Collaborators};
use strategy_builder::telemetry::read_history;
use strategy_builder::tracker_bridge::{McpTracker, NoopTracker, StatusTracker};
use strategy_builder::validator::BacktestValidator;
use strategy_builder::vcs_bridge::{GitPublisher, Publisher};

/// Autonomous strategy builder
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a build and print the final report as JSON
    Run {
        /// Natural-language strategy description handed to the agent
        #[arg(long)]
        spec: PathBuf,

        /// TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Resume the session stored in this checkpoint
        #[arg(long)]
        resume: Option<Uuid>,

        /// Overrides max_iterations
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Overrides cost_ceiling (USD)
        #[arg(long)]
        cost_ceiling: Option<f64>,

        #[arg(long, default_value_t = false)]
        skip_preflight: bool,

        /// Do not push or open a pull request
        #[arg(long, default_value_t = false)]
        no_publish: bool,
    },
    /// Probe every endpoint; exits non-zero when pre-flight would block
    Health {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the stored checkpoint of a session
    Status {
        session_id: Uuid,

        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    match Cli::parse().command {
        Command::Run {
            spec,
            config,
            resume,
            max_iterations,
            cost_ceiling,
            skip_preflight,
            no_publish,
        } => {
            let mut config = BuildConfig::load(config.as_deref())?;
            if let Some(n) = max_iterations {
                config.max_iterations = n;
            }
            if let Some(c) = cost_ceiling {
                config.cost_ceiling = c;
            }
            config.skip_preflight |= skip_preflight;
            if no_publish {
                config.publish = false;
            }
            config.validate()?;
            run(config, spec, resume).await
        }
        Command::Health { config } => health(BuildConfig::load(config.as_deref())?).await,
        Command::Status { session_id, config } => {
            status(BuildConfig::load(config.as_deref())?, session_id)
        }
    }
}

fn health_monitor(config: &BuildConfig) -> Result<HealthMonitor> {
    Ok(HealthMonitor::new(
        Arc::new(McpProbe::new()?),
        config.health_config(),
    ))
}

async fn run(config: BuildConfig, spec_path: PathBuf, resume: Option<Uuid>) -> Result<ExitCode> {
    let spec = std::fs::read_to_string(&spec_path)
        .with_context(|| format!("Failed to read spec {}", spec_path.display()))?;
    std::fs::create_dir_all(&config.state_dir)
        .with_context(|| format!("Failed to create {}", config.state_dir.display()))?;

    let checkpoints = Arc::new(FileCheckpointStore::new(config.checkpoint_dir()));
    let resume = match resume {
        Some(id) => Some(
            checkpoints
                .load(id)?
                .with_context(|| format!("No checkpoint for session {id}"))?,
        ),
        None => None,
    };

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let sessions = Arc::new(
        SessionManager::new(
            Arc::new(McpLeaseInitializer::new(&config)?),
            config.session_config(),
        )
        .with_events(events_tx),
    );
    let limiter = Arc::new(config.rate_limiter()?);
    let tools = Arc::new(McpClient::new(&config, sessions.clone(), limiter)?);

    let tracker: Arc<dyn StatusTracker> = match &config.tracker_endpoint {
        Some(endpoint) => Arc::new(McpTracker::new(tools.clone(), endpoint)),
        None => Arc::new(NoopTracker),
    };
    let publisher: Option<Arc<dyn Publisher>> = Some(Arc::new(
        GitPublisher::new(&config.workdir, &config.base_branch).exclude(&config.state_dir),
    ));

    let notifier = Arc::new(SlackNotifier::new(config.slack_webhook.clone()));
    let collab = Collaborators {
        generator: Arc::new(CommandGenerator::new(
            &config.generator_command,
            &config.workdir,
            config.state_dir.join("prompts"),
        )),
        validator: Arc::new(BacktestValidator::new(
            tools.clone(),
            &config.backtest_endpoint,
            &config.entry_file,
        )),
        health: health_monitor(&config)?,
        sessions,
        session_events: Some(events_rx),
        checkpoints,
        artifacts: ArtifactStore::new(config.artifact_dir()),
        tracker,
        notifier: notifier.clone(),
        publisher,
    };

    info!(
        spec = %spec_path.display(),
        backends = config.backends.len(),
        ceiling = config.cost_ceiling,
        max_iterations = config.max_iterations,
        slack = notifier.is_configured(),
        "Strategy builder starting"
    );
    let mut orchestrator = BuildOrchestrator::new(&config, collab)?;
    let report = orchestrator.run(&spec, resume).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(if report.status == coordination::BuildStatus::Succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}

async fn health(config: BuildConfig) -> Result<ExitCode> {
    let report = health_monitor(&config)?
        .check_all(&config.probe_targets())
        .await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(if report.is_ready() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn status(config: BuildConfig, session_id: Uuid) -> Result<ExitCode> {
    let store = FileCheckpointStore::new(config.checkpoint_dir());
    let checkpoint = store
        .load(session_id)?
        .with_context(|| format!("No checkpoint for session {session_id}"))?;
    let history = read_history(&config.history_path())?
        .into_iter()
        .rev()
        .find(|e| e.session_id == session_id);
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "checkpoint": checkpoint,
            "history": history,
        }))?
    );
    Ok(ExitCode::SUCCESS)
}
