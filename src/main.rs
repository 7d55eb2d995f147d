use std::collections::HashSet;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use conductor_agent::{
    validate, AgentExecutor, GovernanceManager, GovernanceStore, WorkflowDefinition,
    WorkflowEngine,
};
use conductor_core::config::{AgentProfile, AppConfig, ModelConfig};
use conductor_core::governance::AuditFilter;
use conductor_core::traits::CompletionClient;
use conductor_core::types::{EngineEvent, WorkflowStatus};
use conductor_core::{EventBus, SystemClock};
use conductor_tools::ToolRegistry;

#[derive(Parser)]
#[command(name = "conductor", version, about = "Governed multi-agent workflow runner")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "conductor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single agent on a prompt
    Run {
        /// Agent profile name (defaults to a general assistant)
        #[arg(short, long)]
        agent: Option<String>,
        /// Simulate tool calls instead of executing them
        #[arg(long)]
        dry_run: bool,
        /// The prompt to send to the agent
        #[arg(trailing_var_arg = true)]
        prompt: Vec<String>,
    },
    /// Validate, run, or export workflow files
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },
    /// Inspect governance state
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },
    /// Show current configuration
    Config,
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// Check a workflow for structural errors
    Validate {
        file: PathBuf,
    },
    /// Execute a workflow
    Run {
        file: PathBuf,
        /// Input handed to the start node
        #[arg(short, long, default_value = "")]
        input: String,
    },
    /// Print a workflow in canonical JSON form
    Export {
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum AuditAction {
    /// Print the audit log as JSON
    Export {
        #[arg(long)]
        agent: Option<String>,
        #[arg(long)]
        tool: Option<String>,
    },
    /// List recorded permissions for an agent
    Permissions {
        agent: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("conductor=info,warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    // Export needs no config or agents
    if let Commands::Workflow {
        action: WorkflowAction::Export { file },
    } = &cli.command
    {
        let def = WorkflowDefinition::from_file(file)?;
        println!("{}", def.to_json()?);
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    if let Commands::Config = cli.command {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let workspace = config.workspace_dir();
    std::fs::create_dir_all(&workspace).ok();

    let governance = Arc::new(open_governance(&config)?);

    match cli.command {
        Commands::Audit { action } => match action {
            AuditAction::Export { agent, tool } => {
                let filter = AuditFilter {
                    agent_id: agent,
                    tool_name: tool,
                    result: None,
                };
                println!("{}", governance.export_audit_log(&filter)?);
            }
            AuditAction::Permissions { agent } => {
                let permissions = governance.permissions(&agent);
                if permissions.is_empty() {
                    println!("No permissions recorded for '{}'", agent);
                }
                for p in permissions {
                    let expires = p
                        .expires_at
                        .map(|t| format!(" (expires {})", t.to_rfc3339()))
                        .unwrap_or_default();
                    println!(
                        "{:<20} {:<6} {:<8} by {}{}",
                        p.tool_name,
                        p.scope.to_string(),
                        if p.granted { "granted" } else { "revoked" },
                        p.granted_by.as_deref().unwrap_or("-"),
                        expires
                    );
                }
            }
        },
        Commands::Run {
            agent,
            dry_run,
            prompt,
        } => {
            let mut text = prompt.join(" ");
            if text.is_empty() {
                text = io::stdin()
                    .lock()
                    .lines()
                    .map_while(|l| l.ok())
                    .collect::<Vec<_>>()
                    .join("\n");
            }
            if text.trim().is_empty() {
                anyhow::bail!("No prompt given");
            }

            let profile = match agent {
                Some(name) => config
                    .agent(&name)
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("No agent profile named '{}'", name))?,
                None => default_profile(),
            };

            let client = build_client(&config)?;
            let tools = Arc::new(ToolRegistry::with_builtins());
            let event_bus = Arc::new(EventBus::default());
            let mut executor_config = profile.to_executor_config(&config.model, &config.agent);
            if dry_run {
                executor_config.dry_run = true;
            }
            let executor = AgentExecutor::new(executor_config, client, tools, governance)
                .with_event_bus(event_bus)
                .with_working_dir(workspace)
                .with_max_tokens(config.model.max_tokens);

            let result = executor.execute(&text).await;
            for step in &result.steps {
                eprintln!("[{}] {}", step.kind, step.content);
            }
            if !result.success {
                anyhow::bail!(result.error.unwrap_or_else(|| "Agent run failed".into()));
            }
            println!("{}", result.final_response);
        }
        Commands::Workflow {
            action: WorkflowAction::Validate { file },
        } => {
            let def = WorkflowDefinition::from_file(&file)?;
            let known: HashSet<String> = config.agents.iter().map(|a| a.name.clone()).collect();
            let report = validate(&def, Some(&known));
            for issue in &report.errors {
                println!("error: {}", issue.message);
            }
            for issue in &report.warnings {
                println!("warning: {}", issue.message);
            }
            if !report.valid {
                anyhow::bail!("Workflow '{}' is invalid", def.id);
            }
            println!("Workflow '{}' is valid", def.id);
        }
        Commands::Workflow { action } => {
            let client = build_client(&config)?;
            let tools = Arc::new(ToolRegistry::with_builtins());
            let event_bus = Arc::new(EventBus::default());
            let engine = Arc::new(WorkflowEngine::new(
                config.workflow.clone(),
                event_bus.clone(),
            ));
            for profile in &config.agents {
                let executor = AgentExecutor::new(
                    profile.to_executor_config(&config.model, &config.agent),
                    client.clone(),
                    tools.clone(),
                    governance.clone(),
                )
                .with_event_bus(event_bus.clone())
                .with_working_dir(workspace.clone())
                .with_max_tokens(config.model.max_tokens);
                engine.register_agent(profile.name.clone(), Arc::new(executor));
            }

            match action {
                WorkflowAction::Run { file, input } => {
                    let def = WorkflowDefinition::from_file(&file)?;

                    let mut rx = event_bus.subscribe();
                    let printer = tokio::spawn(async move {
                        while let Ok(event) = rx.recv().await {
                            match event {
                                EngineEvent::StepChanged {
                                    node_id, status, ..
                                } => eprintln!("[{}] {}", node_id, status),
                                EngineEvent::StepRetrying {
                                    node_id,
                                    attempt,
                                    error,
                                    ..
                                } => eprintln!("[{}] retry #{}: {}", node_id, attempt, error),
                                EngineEvent::ToolBlocked { agent, tool, reason } => {
                                    eprintln!("[{}] tool '{}' blocked: {}", agent, tool, reason)
                                }
                                _ => {}
                            }
                        }
                    });

                    let engine_for_signal = engine.clone();
                    tokio::spawn(async move {
                        tokio::signal::ctrl_c().await.ok();
                        info!("Cancelling workflow...");
                        engine_for_signal.cancel_all();
                    });

                    let execution = engine.execute(&def, &input).await?;
                    printer.abort();
                    println!("{}", serde_json::to_string_pretty(&execution)?);
                    if execution.status != WorkflowStatus::Completed {
                        anyhow::bail!(
                            "Workflow {}: {}",
                            execution.status,
                            execution.error.unwrap_or_default()
                        );
                    }
                }
                WorkflowAction::Validate { .. } | WorkflowAction::Export { .. } => {}
            }
        }
        Commands::Config => {}
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    if let Some(home_config) = dirs_home().map(|h| h.join(".conductor").join("config.toml")) {
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home_config)?);
        }
    }
    warn!("No config file found, configuring from environment");
    create_env_config()
}

/// Minimal config from `ANTHROPIC_API_KEY` or `CONDUCTOR_ENDPOINT`.
fn create_env_config() -> anyhow::Result<AppConfig> {
    let (provider, model_id, endpoint, api_key) =
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            ("anthropic", "claude-sonnet-4-20250514", None, Some(key))
        } else if let Ok(endpoint) = std::env::var("CONDUCTOR_ENDPOINT") {
            (
                "proxy",
                "default",
                Some(endpoint),
                std::env::var("CONDUCTOR_API_KEY").ok(),
            )
        } else {
            anyhow::bail!(
                "No config file found. Create conductor.toml or set ANTHROPIC_API_KEY / CONDUCTOR_ENDPOINT"
            );
        };

    let config = AppConfig {
        model: ModelConfig {
            provider: provider.to_string(),
            model_id: model_id.to_string(),
            endpoint,
            api_key,
            max_tokens: 4096,
            temperature: 0.7,
            retry: None,
        },
        fallback_models: Vec::new(),
        agent: Default::default(),
        governance: Default::default(),
        workflow: Default::default(),
        agents: Vec::new(),
    };
    Ok(config)
}

fn build_client(config: &AppConfig) -> anyhow::Result<Arc<dyn CompletionClient>> {
    if !config.fallback_models.is_empty() || config.model.retry.is_some() {
        let client =
            conductor_llm::create_retrying_client(&config.model, &config.fallback_models)?;
        info!(
            model = %config.model.model_id,
            fallbacks = client.fallback_count(),
            "Using retrying completion client"
        );
        Ok(Arc::new(client))
    } else {
        Ok(Arc::from(conductor_llm::create_client(&config.model)?))
    }
}

fn open_governance(config: &AppConfig) -> anyhow::Result<GovernanceManager> {
    let clock = Arc::new(SystemClock);
    match config.governance_state_path() {
        Some(path) => {
            let store = GovernanceStore::open(&path)?;
            info!(path = %path.display(), "Governance state persisted");
            Ok(GovernanceManager::with_store(&config.governance, clock, store))
        }
        None => Ok(GovernanceManager::new(&config.governance, clock)),
    }
}

fn default_profile() -> AgentProfile {
    AgentProfile {
        name: "assistant".into(),
        role: "a careful general-purpose assistant".into(),
        goal: "Answer the user's request, using tools when they help".into(),
        tools: Vec::new(),
        model: None,
        temperature: None,
        max_iterations: None,
        dry_run: None,
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
