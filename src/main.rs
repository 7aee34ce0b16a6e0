mod agents;
mod doctor;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mplp_core::config::AppConfig;
use mplp_core::types::{StepStatus, WorkflowResult};
use mplp_engine::{ExecutionEngine, ExecutionOptions, RunLogger, WorkflowFile};
use mplp_orchestrator::MultiAgentOrchestrator;

#[derive(Parser)]
#[command(name = "mplp", version, about = "Multi-agent workflow runner")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "mplp.toml", env = "MPLP_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow file to completion
    Run {
        /// Workflow file (.toml or .json)
        file: PathBuf,
        /// Workflow parameter as key=value; values are parsed as JSON when possible
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, serde_json::Value)>,
        /// Override the workflow timeout
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check a workflow file without running it
    Validate {
        /// Workflow file (.toml or .json)
        file: PathBuf,
    },
    /// Show current configuration
    Config,
    /// Run configuration checks
    Doctor {
        /// Also check that this workflow's agents are configured
        #[arg(long)]
        workflow: Option<PathBuf>,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

fn parse_param(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty parameter name in '{raw}'"));
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mplp=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Completions don't need config
    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "mplp", &mut std::io::stdout());
        return Ok(());
    }

    let config = AppConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::Run {
            file,
            params,
            timeout_ms,
            json,
        } => run_workflow(&config, &file, params.into_iter().collect(), timeout_ms, json).await,
        Commands::Validate { file } => validate_workflow(&file),
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Doctor { workflow } => {
            println!("Checking {}", cli.config.display());
            println!();
            if doctor::run_doctor(&config, workflow.as_deref()) > 0 {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }
}

async fn build_orchestrator(config: &AppConfig) -> anyhow::Result<MultiAgentOrchestrator> {
    let engine = Arc::new(ExecutionEngine::with_config(config.engine.clone()));
    let orchestrator = MultiAgentOrchestrator::new(engine);
    for agent_config in &config.agents {
        let agent = agents::build_agent(agent_config)?;
        match &agent_config.category {
            Some(category) => orchestrator.register_agent_as(agent, category).await?,
            None => orchestrator.register_agent(agent).await?,
        }
    }
    Ok(orchestrator)
}

async fn run_workflow(
    config: &AppConfig,
    file: &Path,
    params: HashMap<String, serde_json::Value>,
    timeout_ms: Option<u64>,
    json: bool,
) -> anyhow::Result<()> {
    let definition = WorkflowFile::load(file)
        .and_then(WorkflowFile::into_definition)
        .with_context(|| format!("loading {}", file.display()))?;
    let workflow_id = definition.id.clone();

    let orchestrator = build_orchestrator(config).await?;
    orchestrator.register_workflow(definition)?;

    let shutdown = CancellationToken::new();
    let logger = config.log.as_ref().map(|log| {
        info!(dir = %log.log_dir().display(), level = log.level, "Run log enabled");
        RunLogger::new(log.log_dir(), log.level).spawn(orchestrator.event_bus(), shutdown.clone())
    });

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling workflow");
                cancel.cancel();
            }
        })
    };

    let options = ExecutionOptions {
        timeout_ms,
        cancel: Some(cancel),
        ..ExecutionOptions::default()
    };
    let outcome = orchestrator
        .execute_workflow(&workflow_id, params, options)
        .await;
    ctrl_c.abort();

    shutdown.cancel();
    if let Some(handle) = logger {
        let _ = handle.await;
    }

    let result = match &outcome {
        Ok(result) => Some(result.clone()),
        Err(_) => orchestrator
            .list_executions()
            .await
            .into_iter()
            .find(|r| r.workflow_id == workflow_id),
    };

    if let Some(result) = &result {
        if json {
            println!("{}", serde_json::to_string_pretty(result)?);
        } else {
            print_summary(result);
        }
    }

    outcome.map(|_| ()).map_err(Into::into)
}

fn print_summary(result: &WorkflowResult) {
    println!(
        "{} [{}] {:?} in {}ms",
        result.workflow_id,
        result.execution_id,
        result.status,
        result.duration_ms.unwrap_or_default()
    );
    for step in &result.steps {
        let icon = match step.status {
            StepStatus::Completed => "[OK]",
            StepStatus::Skipped => "[--]",
            StepStatus::Cancelled => "[..]",
            _ => "[!!]",
        };
        let duration = step.duration_ms.unwrap_or_default();
        match &step.error {
            Some(error) => println!("  {} {} ({}ms): {}", icon, step.step_id, duration, error),
            None => println!("  {} {} ({}ms)", icon, step.step_id, duration),
        }
    }
}

fn validate_workflow(file: &Path) -> anyhow::Result<()> {
    let definition = WorkflowFile::load(file)
        .and_then(WorkflowFile::into_definition)
        .with_context(|| format!("loading {}", file.display()))?;

    println!("Workflow '{}' ({})", definition.name, definition.id);
    println!("  top-level steps: {}", definition.steps.len());
    println!("  total steps:     {}", definition.total_steps());
    let agents: Vec<String> = definition.agent_ids().into_iter().collect();
    println!("  agents:          {}", agents.join(", "));
    Ok(())
}
