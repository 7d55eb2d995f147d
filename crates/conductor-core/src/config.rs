use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConductorError, Result};
use crate::governance::GovernancePolicy;
use crate::types::AgentExecutorConfig;

/// Top-level Conductor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub model: ModelConfig,
    #[serde(default)]
    pub fallback_models: Vec<ModelConfig>,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub governance: GovernanceConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    /// Named agent profiles that workflow agent nodes bind to.
    #[serde(default)]
    pub agents: Vec<AgentProfile>,
}

/// Defaults applied to every agent execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default)]
    pub dry_run: bool,
    /// Base directory for tools that touch the filesystem.
    #[serde(default = "default_workspace")]
    pub workspace: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            dry_run: false,
            workspace: default_workspace(),
        }
    }
}

fn default_max_iterations() -> usize { 5 }
fn default_workspace() -> String { "~/.conductor".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// "proxy" (app completion route) or "anthropic" (Messages API).
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

fn default_provider() -> String { "proxy".to_string() }
fn default_max_tokens() -> u32 { 4096 }
fn default_temperature() -> f32 { 0.7 }

/// Retry configuration for completion requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// Governance defaults and persisted-state location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceConfig {
    /// Hourly execution cap per (agent, tool) when a policy sets none.
    #[serde(default = "default_max_executions_per_hour")]
    pub max_executions_per_hour: u32,
    /// Most recent audit entries retained.
    #[serde(default = "default_audit_log_capacity")]
    pub audit_log_capacity: usize,
    /// SQLite file holding the governance snapshot. None = in-memory only.
    #[serde(default)]
    pub state_path: Option<String>,
    #[serde(default = "default_require_audit_log")]
    pub require_audit_log: bool,
    /// Per-agent policy overrides.
    #[serde(default)]
    pub policies: HashMap<String, GovernancePolicy>,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            max_executions_per_hour: default_max_executions_per_hour(),
            audit_log_capacity: default_audit_log_capacity(),
            state_path: None,
            require_audit_log: default_require_audit_log(),
            policies: HashMap::new(),
        }
    }
}

fn default_max_executions_per_hour() -> u32 { 100 }
fn default_audit_log_capacity() -> usize { 1000 }
fn default_require_audit_log() -> bool { true }

/// Workflow engine limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Times a single node may run in one execution (loop guard).
    #[serde(default = "default_max_node_visits")]
    pub max_node_visits: u32,
    /// Applied to nodes that declare no timeout. None = unbounded.
    #[serde(default)]
    pub default_node_timeout_ms: Option<u64>,
    /// Upper bound for retry backoff between node attempts.
    #[serde(default = "default_workflow_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_node_visits: default_max_node_visits(),
            default_node_timeout_ms: None,
            max_backoff_ms: default_workflow_max_backoff(),
        }
    }
}

fn default_max_node_visits() -> u32 { 10 }
fn default_workflow_max_backoff() -> u64 { 60_000 }

/// A named agent profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_iterations: Option<usize>,
    #[serde(default)]
    pub dry_run: Option<bool>,
}

impl AgentProfile {
    /// Resolve this profile against model and agent defaults.
    pub fn to_executor_config(
        &self,
        model: &ModelConfig,
        defaults: &AgentConfig,
    ) -> AgentExecutorConfig {
        AgentExecutorConfig {
            agent_name: self.name.clone(),
            agent_role: self.role.clone(),
            agent_goal: self.goal.clone(),
            tool_names: self.tools.clone(),
            model: self.model.clone().unwrap_or_else(|| model.model_id.clone()),
            temperature: self.temperature.unwrap_or(model.temperature),
            max_iterations: self.max_iterations.unwrap_or(defaults.max_iterations),
            dry_run: self.dry_run.unwrap_or(defaults.dry_run),
        }
    }
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| ConductorError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| ConductorError::Config(e.to_string()))
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        expand_home(&self.agent.workspace)
    }

    /// Resolve the governance state file, if persistence is configured.
    pub fn governance_state_path(&self) -> Option<PathBuf> {
        self.governance.state_path.as_deref().map(expand_home)
    }

    /// Find an agent profile by name.
    pub fn agent(&self, name: &str) -> Option<&AgentProfile> {
        self.agents.iter().find(|a| a.name == name)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
