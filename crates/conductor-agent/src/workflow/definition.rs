use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use conductor_core::error::{ConductorError, Result};

/// A workflow graph as authored and exchanged in JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub nodes: Vec<WorkflowNode>,
    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowNode {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(flatten)]
    pub kind: NodeKind,
    /// Editor placement only.
    #[serde(default)]
    pub position: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

/// Node variant, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NodeKind {
    Start,
    End,
    Agent {
        #[serde(default, rename = "agentId", skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
    },
    Condition {
        #[serde(default)]
        expression: String,
    },
    Parallel,
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Agent { .. } => "agent",
            Self::Condition { .. } => "condition",
            Self::Parallel => "parallel",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// Retry policy of a node. `max_attempts` counts total attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(rename = "type", default)]
    pub edge_type: EdgeType,
    /// Guard expression for `conditional` edges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeType {
    #[default]
    Default,
    Success,
    Failure,
    Conditional,
}

impl WorkflowNode {
    fn with_kind(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            label: None,
            kind,
            position: Position::default(),
            timeout_ms: None,
            retry: None,
        }
    }

    pub fn start(id: impl Into<String>) -> Self {
        Self::with_kind(id, NodeKind::Start)
    }

    pub fn end(id: impl Into<String>) -> Self {
        Self::with_kind(id, NodeKind::End)
    }

    pub fn agent(id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self::with_kind(
            id,
            NodeKind::Agent {
                agent_id: Some(agent_id.into()),
            },
        )
    }

    pub fn condition(id: impl Into<String>, expression: impl Into<String>) -> Self {
        Self::with_kind(
            id,
            NodeKind::Condition {
                expression: expression.into(),
            },
        )
    }

    pub fn parallel(id: impl Into<String>) -> Self {
        Self::with_kind(id, NodeKind::Parallel)
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, backoff_ms: u64) -> Self {
        self.retry = Some(RetryPolicy {
            max_attempts,
            backoff_ms,
        });
        self
    }

    /// Display label, falling back to the id.
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.id)
    }
}

impl WorkflowEdge {
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            edge_type: EdgeType::Default,
            condition: None,
        }
    }

    pub fn with_type(mut self, edge_type: EdgeType) -> Self {
        self.edge_type = edge_type;
        self
    }

    pub fn with_condition(mut self, expr: impl Into<String>) -> Self {
        self.edge_type = EdgeType::Conditional;
        self.condition = Some(expr.into());
        self
    }
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: default_version(),
            description: None,
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn with_node(mut self, node: WorkflowNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, edge: WorkflowEdge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Import from JSON. Malformed input or duplicate ids are rejected whole.
    pub fn from_json(json: &str) -> Result<Self> {
        let def: Self = serde_json::from_str(json)
            .map_err(|e| ConductorError::WorkflowImport(format!("invalid workflow JSON: {}", e)))?;

        let mut seen = HashSet::new();
        if let Some(dup) = def.nodes.iter().find(|n| !seen.insert(n.id.as_str())) {
            return Err(ConductorError::WorkflowImport(format!(
                "duplicate node id '{}'",
                dup.id
            )));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = def.edges.iter().find(|e| !seen.insert(e.id.as_str())) {
            return Err(ConductorError::WorkflowImport(format!(
                "duplicate edge id '{}'",
                dup.id
            )));
        }
        Ok(def)
    }

    /// Load and import a workflow file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            ConductorError::WorkflowImport(format!("{}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    /// Export as pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// The first `start` node.
    pub fn start_node(&self) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.kind == NodeKind::Start)
    }

    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a WorkflowEdge> + 'a {
        self.edges.iter().filter(move |e| e.source == id)
    }
}
