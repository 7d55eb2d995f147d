use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Context handed to every tool invocation.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Agent on whose behalf the tool runs.
    pub agent_id: String,
    /// Base directory for relative paths.
    pub working_dir: PathBuf,
}

impl ToolContext {
    pub fn new(agent_id: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            agent_id: agent_id.into(),
            working_dir: working_dir.into(),
        }
    }
}

/// Declared type and documentation of one tool parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    #[serde(rename = "type")]
    pub param_type: String,
    pub description: String,
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
}

impl ParameterSpec {
    pub fn new(param_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            param_type: param_type.into(),
            description: description.into(),
            enum_values: None,
        }
    }

    pub fn with_enum(mut self, values: &[&str]) -> Self {
        self.enum_values = Some(values.iter().map(|v| v.to_string()).collect());
        self
    }
}

/// Parameter schema of a tool, keyed by parameter name.
pub type ToolSchema = BTreeMap<String, ParameterSpec>;

/// Outcome of a tool execution.
///
/// Expected failures are reported with `success: false` rather than an `Err`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub output: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl ToolOutput {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            data: serde_json::Value::Null,
        }
    }

    pub fn failure(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            data: serde_json::Value::Null,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Tool definition rendered into agent prompts and CLI listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: ToolSchema,
}

/// Per-request configuration of one agent execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentExecutorConfig {
    pub agent_name: String,
    #[serde(default)]
    pub agent_role: String,
    #[serde(default)]
    pub agent_goal: String,
    /// Tools this agent may call (empty = all registered tools).
    #[serde(default)]
    pub tool_names: Vec<String>,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default)]
    pub dry_run: bool,
}

fn default_temperature() -> f32 { 0.7 }
fn default_max_iterations() -> usize { 5 }

impl AgentExecutorConfig {
    pub fn new(agent_name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            agent_role: String::new(),
            agent_goal: String::new(),
            tool_names: Vec::new(),
            model: model.into(),
            temperature: default_temperature(),
            max_iterations: default_max_iterations(),
            dry_run: false,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.agent_role = role.into();
        self
    }

    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.agent_goal = goal.into();
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tool_names = tools;
        self
    }

    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// Kind of a single ReAct step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Thought,
    Action,
    Observation,
    Answer,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Thought => write!(f, "Thought"),
            Self::Action => write!(f, "Action"),
            Self::Observation => write!(f, "Observation"),
            Self::Answer => write!(f, "Answer"),
        }
    }
}

/// One entry of an agent run's ordered trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStep {
    #[serde(rename = "type")]
    pub kind: StepKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionStep {
    pub fn new(kind: StepKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Terminal artifact of one agent execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub steps: Vec<ExecutionStep>,
    pub final_response: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    /// The last step recorded, if any.
    pub fn last_step(&self) -> Option<&ExecutionStep> {
        self.steps.last()
    }
}

/// Request sent to a completion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRequest {
    pub prompt: String,
    pub system_prompt: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
}

/// Status of one workflow node run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    /// Whether the status is final for the current visit.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Status of a whole workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Events emitted by agent executions and workflow runs.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// An agent run started.
    AgentStarted { agent: String },
    /// An agent recorded a step.
    AgentStep { agent: String, step: ExecutionStep },
    /// A tool call was refused by governance.
    ToolBlocked {
        agent: String,
        tool: String,
        reason: String,
    },
    /// An agent run finished.
    AgentFinished { agent: String, success: bool },
    /// A workflow run started.
    WorkflowStarted {
        execution_id: String,
        workflow_id: String,
    },
    /// A workflow node changed status.
    StepChanged {
        execution_id: String,
        node_id: String,
        status: StepStatus,
    },
    /// A workflow node is being retried.
    StepRetrying {
        execution_id: String,
        node_id: String,
        attempt: u32,
        error: String,
    },
    /// A workflow run reached a terminal status.
    WorkflowFinished {
        execution_id: String,
        status: WorkflowStatus,
    },
}
