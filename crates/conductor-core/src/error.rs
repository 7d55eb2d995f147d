use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConductorError {
    // Completion endpoint errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM response parse error: {0}")]
    LlmParse(String),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("Tool input validation failed: {0}")]
    ToolValidation(String),

    // Governance errors
    #[error("Tool '{tool}' denied by governance policy: {reason}")]
    GovernanceDenied { tool: String, reason: String },

    // Agent errors
    #[error("Execution cancelled")]
    Cancelled,

    #[error("Agent not registered: {0}")]
    AgentNotRegistered(String),

    // Workflow errors
    #[error("Workflow import failed: {0}")]
    WorkflowImport(String),

    #[error("Workflow is invalid: {0}")]
    WorkflowValidation(String),

    #[error("Node '{node}' timed out after {timeout_ms}ms")]
    NodeTimeout { node: String, timeout_ms: u64 },

    #[error("Node '{node}' failed: {message}")]
    NodeFailed { node: String, message: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    #[error("Configuration absent: {0}")]
    ConfigAbsent(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConductorError>;
