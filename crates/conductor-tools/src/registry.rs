use std::collections::HashMap;
use std::sync::Arc;

use conductor_core::error::{ConductorError, Result};
use conductor_core::traits::Tool;
use conductor_core::types::{ToolContext, ToolDefinition, ToolOutput};

/// Registry of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. A tool with the same name is replaced.
    pub fn register(&mut self, tool: impl Tool) {
        self.register_arc(Arc::new(tool));
    }

    /// Register an already shared tool.
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Unregister a tool by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Get a tool by name, restricted to `allowed` (empty = no restriction).
    pub fn get_scoped(&self, name: &str, allowed: &[String]) -> Option<Arc<dyn Tool>> {
        if !allowed.is_empty() && !allowed.iter().any(|a| a == name) {
            return None;
        }
        self.get(name)
    }

    /// List all registered tool names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Definitions of all tools, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.subset(&[])
    }

    /// Definitions of the named tools (empty = all). Unknown names are ignored.
    pub fn subset(&self, names: &[String]) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .filter(|t| names.is_empty() || names.iter().any(|n| n == t.name()))
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Execute a tool by name.
    pub async fn execute(
        &self,
        name: &str,
        params: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolOutput> {
        let tool = self
            .get(name)
            .ok_or_else(|| ConductorError::ToolNotFound(name.to_string()))?;
        execute_with_timeout(&tool, params, ctx).await
    }

    /// Create a registry with all built-in tools registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(crate::builtin::read_file::ReadFileTool);
        registry.register(crate::builtin::network::HttpRequestTool);
        registry.register(crate::builtin::data::JsonQueryTool);
        registry.register(crate::builtin::time::CurrentTimeTool);
        registry
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Run a resolved tool under its declared timeout.
pub async fn execute_with_timeout(
    tool: &Arc<dyn Tool>,
    params: serde_json::Value,
    ctx: ToolContext,
) -> Result<ToolOutput> {
    let timeout = std::time::Duration::from_secs(tool.timeout_secs());
    match tokio::time::timeout(timeout, tool.execute(params, ctx)).await {
        Ok(result) => result,
        Err(_) => Err(ConductorError::ToolTimeout {
            tool: tool.name().to_string(),
            timeout_secs: tool.timeout_secs(),
        }),
    }
}
