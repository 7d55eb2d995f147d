use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// Completion endpoint — turns a prompt into response text.
pub trait CompletionClient: Send + Sync + 'static {
    /// Send one completion request and return the response text.
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<String>>;
}

/// Tool — a named callable an agent may invoke.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used in `TOOL_CALL:` directives).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// Declared parameters, keyed by name.
    fn parameters(&self) -> ToolSchema;

    /// Execute the tool with the given parameters.
    fn execute(
        &self,
        params: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolOutput>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }
}
