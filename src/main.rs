use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use reelforge::budget::{ApprovalPrompt, AutoApprove, AutoDeny, CeilingApproval};
use reelforge::pipeline::{FileCheckpointStore, PipelineOrchestrator, PipelineOutcome, RunStatus};
use reelforge::{DryRunBackend, SessionConfig, SessionContext};

#[derive(Parser)]
#[command(name = "reelforge")]
#[command(version, about = "Run a generative media pipeline under rate and budget limits")]
struct Cli {
    /// Configuration file (TOML). Environment variables prefixed with
    /// REELFORGE__ override it.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory for checkpoints, overriding the configuration
    #[arg(long, global = true)]
    checkpoint_dir: Option<PathBuf>,

    /// What to do when an operation would exceed the budget limit
    #[arg(long, value_enum, default_value_t = ApprovalMode::Deny, global = true)]
    approval: ApprovalMode,

    /// Highest total spend approved with --approval ceiling
    #[arg(long, global = true)]
    ceiling: Option<f64>,

    /// Simulated latency of each dry-run backend call, in milliseconds
    #[arg(long, default_value_t = 0, global = true)]
    latency_ms: u64,

    /// Scenes in scripts produced by the dry-run backend
    #[arg(long, default_value_t = 3, global = true)]
    scenes: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new pipeline run
    Run {
        /// What to produce
        brief: String,

        /// Session id; checkpoints are stored under it
        #[arg(long)]
        session_id: Option<String>,
    },
    /// Continue a paused or failed run from its checkpoint
    Resume {
        session_id: String,
    },
    /// Delete a session's checkpoint
    Discard {
        session_id: String,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ApprovalMode {
    /// Approve every overrun
    Approve,
    /// Treat the limit as a hard stop
    Deny,
    /// Approve while total spend stays under --ceiling
    Ceiling,
}

fn approval_for(mode: ApprovalMode, ceiling: Option<f64>) -> Result<Arc<dyn ApprovalPrompt>> {
    Ok(match mode {
        ApprovalMode::Approve => Arc::new(AutoApprove),
        ApprovalMode::Deny => Arc::new(AutoDeny),
        ApprovalMode::Ceiling => {
            let ceiling = ceiling.context("--approval ceiling requires --ceiling")?;
            Arc::new(CeilingApproval::new(ceiling))
        }
    })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("reelforge=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn default_session_id() -> String {
    format!("session-{}", chrono::Utc::now().format("%Y%m%d-%H%M%S"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let mut config = SessionConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(dir) = &cli.checkpoint_dir {
        config.pipeline.checkpoint_dir = dir.clone();
    }

    let session_id = match &cli.command {
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config).context("Failed to render configuration")?);
            return Ok(());
        }
        Commands::Run { session_id, .. } => session_id.clone().unwrap_or_else(default_session_id),
        Commands::Resume { session_id } | Commands::Discard { session_id } => session_id.clone(),
    };

    let store = Arc::new(
        FileCheckpointStore::new(&config.pipeline.checkpoint_dir).with_context(|| {
            format!(
                "Failed to open checkpoint directory {}",
                config.pipeline.checkpoint_dir.display()
            )
        })?,
    );
    let backend = Arc::new(DryRunBackend::new(Duration::from_millis(cli.latency_ms)).with_scenes(cli.scenes));
    let approval = approval_for(cli.approval, cli.ceiling)?;
    let session = Arc::new(SessionContext::new(&session_id, &config, backend, approval));
    let orchestrator = PipelineOrchestrator::new(session, store, config.pipeline.clone());

    // Ctrl-C pauses at the next request boundary; the run checkpoints and
    // exits so it can be resumed.
    let handle = orchestrator.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, pausing");
            handle.pause();
        }
    });

    let outcome = match cli.command {
        Commands::Run { brief, .. } => orchestrator.run(brief).await,
        Commands::Resume { .. } => orchestrator.resume().await,
        Commands::Discard { .. } => {
            orchestrator
                .discard(&session_id)
                .with_context(|| format!("Failed to discard session {}", session_id))?;
            println!("{}", serde_json::json!({ "session_id": session_id, "discarded": true }));
            return Ok(());
        }
        Commands::Config => return Ok(()),
    }
    .with_context(|| format!("Pipeline for session {} could not run", session_id))?;

    report(&outcome)?;
    if let RunStatus::Failed { .. } = outcome.status {
        std::process::exit(2);
    }
    Ok(())
}

fn report(outcome: &PipelineOutcome) -> Result<()> {
    let json = serde_json::to_string_pretty(outcome).context("Failed to serialize outcome")?;
    println!("{}", json);
    Ok(())
}
