use std::collections::{HashMap, HashSet, VecDeque};

use serde::Serialize;

use super::definition::{EdgeType, NodeKind, WorkflowDefinition, WorkflowEdge};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge_id: Option<String>,
    pub message: String,
}

/// Outcome of validating a workflow. Errors block execution; warnings do not.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    fn error(&mut self, node_id: Option<&str>, edge_id: Option<&str>, message: String) {
        self.errors.push(ValidationIssue {
            severity: Severity::Error,
            node_id: node_id.map(String::from),
            edge_id: edge_id.map(String::from),
            message,
        });
    }

    fn warning(&mut self, node_id: Option<&str>, edge_id: Option<&str>, message: String) {
        self.warnings.push(ValidationIssue {
            severity: Severity::Warning,
            node_id: node_id.map(String::from),
            edge_id: edge_id.map(String::from),
            message,
        });
    }

    /// All error messages joined for display.
    pub fn summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Check the structure of a workflow.
///
/// `known_agents`, when given, is the set of agent ids that agent nodes may
/// reference.
pub fn validate(
    def: &WorkflowDefinition,
    known_agents: Option<&HashSet<String>>,
) -> ValidationReport {
    let mut report = ValidationReport::default();

    let mut node_ids = HashSet::new();
    for node in &def.nodes {
        if !node_ids.insert(node.id.as_str()) {
            report.error(Some(&node.id), None, format!("Duplicate node id '{}'", node.id));
        }
    }
    let mut edge_ids = HashSet::new();
    for edge in &def.edges {
        if !edge_ids.insert(edge.id.as_str()) {
            report.error(None, Some(&edge.id), format!("Duplicate edge id '{}'", edge.id));
        }
    }

    let starts: Vec<_> = def.nodes.iter().filter(|n| n.kind == NodeKind::Start).collect();
    match starts.len() {
        0 => report.error(None, None, "Workflow has no start node".into()),
        1 => {}
        _ => {
            for extra in &starts[1..] {
                report.error(
                    Some(&extra.id),
                    None,
                    format!("Workflow has more than one start node ('{}')", extra.id),
                );
            }
        }
    }
    if !def.nodes.iter().any(|n| n.kind == NodeKind::End) {
        report.error(None, None, "Workflow has no end node".into());
    }

    for edge in &def.edges {
        if !node_ids.contains(edge.source.as_str()) {
            report.error(
                None,
                Some(&edge.id),
                format!("Edge '{}' references missing source node '{}'", edge.id, edge.source),
            );
        }
        if !node_ids.contains(edge.target.as_str()) {
            report.error(
                None,
                Some(&edge.id),
                format!("Edge '{}' references missing target node '{}'", edge.id, edge.target),
            );
        }
    }

    for node in &def.nodes {
        if let NodeKind::Agent { agent_id } = &node.kind {
            match agent_id.as_deref().map(str::trim) {
                None | Some("") => report.error(
                    Some(&node.id),
                    None,
                    format!("Agent node '{}' has no agentId", node.id),
                ),
                Some(id) => {
                    if known_agents.is_some_and(|known| !known.contains(id)) {
                        report.error(
                            Some(&node.id),
                            None,
                            format!("Agent node '{}' references unknown agent '{}'", node.id, id),
                        );
                    }
                }
            }
        }
    }

    let valid_edges: Vec<_> = def
        .edges
        .iter()
        .filter(|e| node_ids.contains(e.source.as_str()) && node_ids.contains(e.target.as_str()))
        .collect();

    let mut cyclic = unbroken_cycle_nodes(def, &valid_edges);
    if !cyclic.is_empty() {
        cyclic.sort_unstable();
        report.error(
            Some(cyclic[0]),
            None,
            format!(
                "Cycle without a condition node: {}",
                cyclic.join(", ")
            ),
        );
    }

    if let Some(start) = starts.first() {
        let reachable = reachable_from(&start.id, &valid_edges);
        for node in &def.nodes {
            if !reachable.contains(node.id.as_str()) {
                report.warning(
                    Some(&node.id),
                    None,
                    format!("Node '{}' is unreachable from start", node.id),
                );
            }
        }
    }

    for node in &def.nodes {
        let has_outgoing = def.outgoing(&node.id).next().is_some();
        match node.kind {
            NodeKind::End if has_outgoing => report.warning(
                Some(&node.id),
                None,
                format!("End node '{}' has outgoing edges", node.id),
            ),
            NodeKind::End => {}
            _ if !has_outgoing => report.warning(
                Some(&node.id),
                None,
                format!("Node '{}' has no outgoing edges", node.id),
            ),
            _ => {}
        }
    }

    let kinds: HashMap<&str, &NodeKind> =
        def.nodes.iter().map(|n| (n.id.as_str(), &n.kind)).collect();
    for edge in &def.edges {
        let from_condition = matches!(
            kinds.get(edge.source.as_str()),
            Some(NodeKind::Condition { .. })
        );
        let has_guard = edge
            .condition
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty());
        if edge.edge_type == EdgeType::Conditional && !from_condition && !has_guard {
            report.warning(
                None,
                Some(&edge.id),
                format!("Conditional edge '{}' has no condition", edge.id),
            );
        }
    }

    report.valid = report.errors.is_empty();
    report
}

/// Nodes left on a cycle once condition nodes are removed (Kahn's algorithm).
fn unbroken_cycle_nodes<'a>(
    def: &'a WorkflowDefinition,
    edges: &[&'a WorkflowEdge],
) -> Vec<&'a str> {
    let members: HashSet<&str> = def
        .nodes
        .iter()
        .filter(|n| !matches!(n.kind, NodeKind::Condition { .. }))
        .map(|n| n.id.as_str())
        .collect();

    let mut in_degree: HashMap<&str, usize> = members.iter().map(|id| (*id, 0)).collect();
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in edges {
        let (s, t) = (edge.source.as_str(), edge.target.as_str());
        if members.contains(s) && members.contains(t) {
            adjacency.entry(s).or_default().push(t);
            if let Some(d) = in_degree.get_mut(t) {
                *d += 1;
            }
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0;
    while let Some(id) = queue.pop_front() {
        visited += 1;
        for next in adjacency.get(id).into_iter().flatten() {
            if let Some(d) = in_degree.get_mut(next) {
                *d -= 1;
                if *d == 0 {
                    queue.push_back(*next);
                }
            }
        }
    }

    if visited == members.len() {
        return Vec::new();
    }

    // What remains may include nodes merely downstream of a cycle; peel off
    // anything without a successor left in the set.
    let mut remaining: HashSet<&str> = in_degree
        .into_iter()
        .filter(|(_, d)| *d > 0)
        .map(|(id, _)| id)
        .collect();
    loop {
        let sinks: Vec<&str> = remaining
            .iter()
            .filter(|id| {
                !adjacency
                    .get(*id)
                    .into_iter()
                    .flatten()
                    .any(|t| remaining.contains(t))
            })
            .copied()
            .collect();
        if sinks.is_empty() {
            break;
        }
        for id in sinks {
            remaining.remove(id);
        }
    }
    remaining.into_iter().collect()
}

fn reachable_from<'a>(
    start: &'a str,
    edges: &[&'a WorkflowEdge],
) -> HashSet<&'a str> {
    let mut seen = HashSet::from([start]);
    let mut queue = VecDeque::from([start]);
    while let Some(id) = queue.pop_front() {
        for edge in edges.iter().filter(|e| e.source == id) {
            if seen.insert(edge.target.as_str()) {
                queue.push_back(edge.target.as_str());
            }
        }
    }
    seen
}
