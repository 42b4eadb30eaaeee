use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use lingcode_config::Config;
use lingcode_core::agent::{self, AgentConfig, Services};
use lingcode_core::events::AgentEvent;
use lingcode_core::model::{StepKind, Task};
use lingcode_core::workspace;

#[derive(Parser)]
#[command(name = "lingcode", about = "Autonomous coding agent for the terminal", version)]
struct Cli {
    /// The task to run
    task: String,

    /// Project root to operate in (defaults to the current directory's
    /// detected workspace root)
    #[arg(long)]
    project_root: Option<PathBuf>,

    /// Model to use, overriding the configured default
    #[arg(short, long)]
    model: Option<String>,

    /// Trust mode: off, limited, autoedit, or full
    #[arg(short = 'y', long = "trust")]
    trust: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("lingcode=info".parse()?),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    Config::ensure_dirs()?;
    let global_config = Config::load()?;

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let project_root = cli.project_root.unwrap_or_else(|| cwd.clone());
    let workspace_ctx = workspace::detect_workspace(&project_root);

    let mut config = if workspace_ctx.has_lingcode_config {
        match Config::load_project(&workspace_ctx.project_root)? {
            Some(project_config) => Config::merge(&global_config, &project_config),
            None => global_config,
        }
    } else {
        global_config
    };

    if let Some(trust) = &cli.trust {
        config.agent.trust.mode = trust
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;
    }

    let provider = lingcode_provider::create_provider(&config)
        .context("failed to initialize provider")?;
    let provider: Arc<dyn lingcode_provider::Provider> = Arc::from(provider);

    let model = cli
        .model
        .clone()
        .or_else(|| config.provider.anthropic.model.clone())
        .unwrap_or_else(|| provider.supported_models()[0].id.clone());

    let services = Services::new(provider);
    let agent_config = AgentConfig::from_config(&config, model);

    let (events, mut rx) = tokio::sync::broadcast::channel(256);
    let cancel = CancellationToken::new();

    let print_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => print_event(event).await,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let task = Task::new(cli.task, Some(workspace_ctx.project_root.clone()));

    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_for_signal.cancel();
        }
    });

    let outcome = agent::run(task, &services, &agent_config, events, cancel).await?;

    drop(print_task);

    println!();
    println!("--- {:?} ---", outcome.reason);
    println!("{}", outcome.summary);
    if outcome.usage.total_cost_usd > 0.0 {
        println!(
            "tokens: {} in / {} out, ${:.4}",
            outcome.usage.total_input_tokens,
            outcome.usage.total_output_tokens,
            outcome.usage.total_cost_usd
        );
    }

    Ok(())
}

async fn print_event(event: AgentEvent) {
    match event {
        AgentEvent::TextDelta(text) => {
            print!("{text}");
        }
        AgentEvent::StepAdded { kind, description, .. } => {
            if kind != StepKind::Thinking {
                println!("\n[{kind:?}] {description}");
            }
        }
        AgentEvent::StepUpdated { status, .. } => {
            tracing::debug!(?status, "step updated");
        }
        AgentEvent::StepRemoved { .. } => {}
        AgentEvent::ToolStarting { name } => {
            println!("\n> {name}");
        }
        AgentEvent::ToolOutputDelta { delta, .. } => {
            print!("{delta}");
        }
        AgentEvent::FileCreated { path, .. } => {
            println!("created {path}");
        }
        AgentEvent::FileUpdated { path, .. } => {
            println!("updated {path}");
        }
        AgentEvent::ApprovalRequested { reason, respond } => {
            println!("\napproval requested: {reason}");
            print!("allow? [y/N] ");
            use std::io::Write;
            let _ = std::io::stdout().flush();

            let approved = tokio::task::spawn_blocking(|| {
                let mut input = String::new();
                std::io::stdin().read_line(&mut input).is_ok()
                    && matches!(input.trim().to_lowercase().as_str(), "y" | "yes")
            })
            .await
            .unwrap_or(false);

            if let Some(sender) = respond.lock().await.take() {
                let _ = sender.send(approved);
            }
        }
        AgentEvent::Retrying { attempt, max_retries, wait_ms, reason } => {
            println!("\nretrying ({attempt}/{max_retries}) after {wait_ms}ms: {reason}");
        }
        AgentEvent::Usage(_) => {}
        AgentEvent::SystemMessage(msg) => {
            println!("\n{msg}");
        }
        AgentEvent::TaskCompleted { summary } => {
            println!("\n{summary}");
        }
        AgentEvent::Error(msg) => {
            eprintln!("\nerror: {msg}");
        }
    }
}
