use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use conductor_core::config::WorkflowConfig;
use conductor_core::error::{ConductorError, Result};
use conductor_core::event::EventBus;
use conductor_core::types::{EngineEvent, StepStatus, WorkflowStatus};

use super::condition::evaluate_condition;
use super::context::SharedContext;
use super::definition::{
    EdgeType, NodeKind, RetryPolicy, WorkflowDefinition, WorkflowEdge, WorkflowNode,
};
use super::validator::{validate, ValidationReport};
use crate::executor::AgentExecutor;

/// Record of one node within a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStepExecution {
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowStepExecution {
    pub fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            input: None,
            output: None,
            error: None,
            attempts: 0,
            logs: Vec::new(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// Result of executing a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecution {
    pub id: String,
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Per-node records keyed by node id.
    pub steps: BTreeMap<String, WorkflowStepExecution>,
    pub context: SharedContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowExecution {
    pub fn step(&self, node_id: &str) -> Option<&WorkflowStepExecution> {
        self.steps.get(node_id)
    }
}

/// Runs workflow graphs against registered agent executors.
///
/// Nodes become ready once every incoming forward edge is resolved. Ready
/// agent nodes run concurrently as futures multiplexed on the calling task,
/// so parallel branches make progress together and a join waits for all of
/// its predecessors.
pub struct WorkflowEngine {
    agents: RwLock<HashMap<String, Arc<AgentExecutor>>>,
    config: WorkflowConfig,
    event_bus: Arc<EventBus>,
    running: Mutex<HashMap<String, CancellationToken>>,
}

impl WorkflowEngine {
    pub fn new(config: WorkflowConfig, event_bus: Arc<EventBus>) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            config,
            event_bus,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Bind an executor to the agent id referenced by workflow nodes.
    pub fn register_agent(&self, agent_id: impl Into<String>, executor: Arc<AgentExecutor>) {
        let agent_id = agent_id.into();
        debug!(agent_id = %agent_id, "Registered workflow agent");
        self.agents
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(agent_id, executor);
    }

    /// Registered agent ids, sorted.
    pub fn agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Validate against the agents registered with this engine.
    pub fn validate_workflow(&self, def: &WorkflowDefinition) -> ValidationReport {
        let known: HashSet<String> = self.agent_ids().into_iter().collect();
        validate(def, Some(&known))
    }

    /// Ids of executions currently in progress.
    pub fn running(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock_running().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Cancel one execution. Returns false if it is not running.
    pub fn cancel(&self, execution_id: &str) -> bool {
        match self.lock_running().get(execution_id) {
            Some(token) => {
                info!(execution_id, "Cancelling workflow execution");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every running execution, returning how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let running = self.lock_running();
        for token in running.values() {
            token.cancel();
        }
        running.len()
    }

    /// Validate and run a workflow to a terminal status.
    ///
    /// Invalid graphs are refused with `WorkflowValidation` before any node
    /// runs. Node failures do not produce an `Err`; they are reported in the
    /// returned execution.
    pub async fn execute(&self, def: &WorkflowDefinition, input: &str) -> Result<WorkflowExecution> {
        let report = self.validate_workflow(def);
        if !report.valid {
            warn!(workflow = %def.id, errors = report.errors.len(), "Refusing invalid workflow");
            return Err(ConductorError::WorkflowValidation(report.summary()));
        }
        let graph = Graph::build(def)?;

        let execution_id = Uuid::new_v4().to_string();
        let token = CancellationToken::new();
        let _guard = RunGuard::track(self, &execution_id, token.clone());
        let agents = self.agents.read().unwrap_or_else(|e| e.into_inner()).clone();

        let mut run = Run::new(
            def,
            graph,
            execution_id.clone(),
            input,
            agents,
            self.config.clone(),
            self.event_bus.clone(),
            token.clone(),
        );

        info!(execution_id = %execution_id, workflow = %def.id, "Workflow started");
        self.event_bus.publish(EngineEvent::WorkflowStarted {
            execution_id: execution_id.clone(),
            workflow_id: def.id.clone(),
        });

        let mut in_flight: FuturesUnordered<BoxFuture<'static, NodeDone>> = FuturesUnordered::new();
        let mut cancelled = false;
        loop {
            if token.is_cancelled() {
                cancelled = true;
                break;
            }
            in_flight.extend(run.advance());
            if run.aborted.is_some() || in_flight.is_empty() {
                break;
            }
            tokio::select! {
                _ = token.cancelled() => {
                    cancelled = true;
                    break;
                }
                Some(done) = in_flight.next() => run.finish_agent(done),
            }
        }
        // Results still in flight are discarded.
        drop(in_flight);

        let execution = run.finish(cancelled);
        info!(
            execution_id = %execution.id,
            status = %execution.status,
            "Workflow finished"
        );
        self.event_bus.publish(EngineEvent::WorkflowFinished {
            execution_id: execution.id.clone(),
            status: execution.status,
        });
        Ok(execution)
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Keeps a run's token registered for as long as `execute` is alive.
struct RunGuard<'e> {
    engine: &'e WorkflowEngine,
    id: String,
}

impl<'e> RunGuard<'e> {
    fn track(engine: &'e WorkflowEngine, id: &str, token: CancellationToken) -> Self {
        engine.lock_running().insert(id.to_string(), token);
        Self {
            engine,
            id: id.to_string(),
        }
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.engine.lock_running().remove(&self.id);
    }
}

/// Adjacency of a definition with back edges separated out.
struct Graph<'a> {
    start: &'a str,
    outgoing: HashMap<&'a str, Vec<&'a WorkflowEdge>>,
    /// Incoming edges from nodes reachable from start, minus back edges.
    forward_incoming: HashMap<&'a str, Vec<&'a WorkflowEdge>>,
    /// Edges that close a loop, found by depth-first search from start.
    back_edges: HashSet<&'a str>,
}

impl<'a> Graph<'a> {
    fn build(def: &'a WorkflowDefinition) -> Result<Self> {
        let start = def
            .start_node()
            .ok_or_else(|| ConductorError::WorkflowValidation("Workflow has no start node".into()))?
            .id
            .as_str();

        let mut outgoing: HashMap<&str, Vec<&WorkflowEdge>> = HashMap::new();
        for edge in &def.edges {
            outgoing.entry(edge.source.as_str()).or_default().push(edge);
        }

        let mut back_edges = HashSet::new();
        let mut reachable = HashSet::new();
        let mut on_stack = HashSet::new();
        mark_back_edges(start, &outgoing, &mut reachable, &mut on_stack, &mut back_edges);

        // Edges leaving nodes start cannot reach never resolve, so they do
        // not gate readiness.
        let mut forward_incoming: HashMap<&str, Vec<&WorkflowEdge>> = HashMap::new();
        for edge in def.edges.iter().filter(|e| {
            reachable.contains(e.source.as_str()) && !back_edges.contains(e.id.as_str())
        }) {
            forward_incoming
                .entry(edge.target.as_str())
                .or_default()
                .push(edge);
        }

        Ok(Self {
            start,
            outgoing,
            forward_incoming,
            back_edges,
        })
    }

    fn outgoing(&self, id: &str) -> &[&'a WorkflowEdge] {
        self.outgoing.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    fn forward_incoming(&self, id: &str) -> &[&'a WorkflowEdge] {
        self.forward_incoming.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    fn is_back_edge(&self, edge: &WorkflowEdge) -> bool {
        self.back_edges.contains(edge.id.as_str())
    }
}

fn mark_back_edges<'a>(
    node: &'a str,
    outgoing: &HashMap<&'a str, Vec<&'a WorkflowEdge>>,
    visited: &mut HashSet<&'a str>,
    on_stack: &mut HashSet<&'a str>,
    back_edges: &mut HashSet<&'a str>,
) {
    visited.insert(node);
    on_stack.insert(node);
    for edge in outgoing.get(node).into_iter().flatten() {
        let target = edge.target.as_str();
        if on_stack.contains(target) {
            back_edges.insert(edge.id.as_str());
        } else if !visited.contains(target) {
            mark_back_edges(target, outgoing, visited, on_stack, back_edges);
        }
    }
    on_stack.remove(node);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeState {
    Pending,
    Taken,
    NotTaken,
}

/// How a finished node selects its outgoing edges.
#[derive(Debug, Clone, Copy)]
enum Resolution {
    Completed,
    Failed,
    Condition(bool),
    All,
}

enum Readiness {
    Wait,
    Run,
    Skip,
}

/// Outcome of an agent node's attempts.
struct NodeOutcome {
    result: std::result::Result<String, String>,
    attempts: u32,
    logs: Vec<String>,
}

struct NodeDone {
    node_id: String,
    visit: u32,
    outcome: NodeOutcome,
}

/// Mutable state of one workflow execution.
struct Run<'a> {
    def: &'a WorkflowDefinition,
    graph: Graph<'a>,
    exec: WorkflowExecution,
    input: String,
    agents: HashMap<String, Arc<AgentExecutor>>,
    config: WorkflowConfig,
    event_bus: Arc<EventBus>,
    token: CancellationToken,
    edges: HashMap<&'a str, EdgeState>,
    visits: HashMap<&'a str, u32>,
    first_error: Option<String>,
    aborted: Option<String>,
}

impl<'a> Run<'a> {
    #[allow(clippy::too_many_arguments)]
    fn new(
        def: &'a WorkflowDefinition,
        graph: Graph<'a>,
        execution_id: String,
        input: &str,
        agents: HashMap<String, Arc<AgentExecutor>>,
        config: WorkflowConfig,
        event_bus: Arc<EventBus>,
        token: CancellationToken,
    ) -> Self {
        let steps = def
            .nodes
            .iter()
            .map(|n| (n.id.clone(), WorkflowStepExecution::pending()))
            .collect();
        let edges = def
            .edges
            .iter()
            .map(|e| (e.id.as_str(), EdgeState::Pending))
            .collect();
        Self {
            def,
            graph,
            exec: WorkflowExecution {
                id: execution_id,
                workflow_id: def.id.clone(),
                status: WorkflowStatus::Running,
                started_at: Utc::now(),
                completed_at: None,
                steps,
                context: SharedContext::with_input(input),
                error: None,
            },
            input: input.to_string(),
            agents,
            config,
            event_bus,
            token,
            edges,
            visits: HashMap::new(),
            first_error: None,
            aborted: None,
        }
    }

    /// Start or skip every node whose inputs are settled, until nothing
    /// changes. Returns the agent futures to drive.
    fn advance(&mut self) -> Vec<BoxFuture<'static, NodeDone>> {
        let def = self.def;
        let mut jobs = Vec::new();
        loop {
            let mut changed = false;
            for node in &def.nodes {
                if self.aborted.is_some() {
                    return jobs;
                }
                match self.status(&node.id) {
                    StepStatus::Pending => match self.readiness(&node.id) {
                        Readiness::Wait => {}
                        Readiness::Skip => {
                            self.skip(node);
                            changed = true;
                        }
                        Readiness::Run => {
                            jobs.extend(self.activate(node));
                            changed = true;
                        }
                    },
                    StepStatus::Running if node.kind == NodeKind::Parallel => {
                        if self.branches_settled(node) {
                            self.set_status(&node.id, StepStatus::Completed);
                            changed = true;
                        }
                    }
                    _ => {}
                }
            }
            if !changed {
                return jobs;
            }
        }
    }

    fn readiness(&self, id: &str) -> Readiness {
        let incoming = self.graph.forward_incoming(id);
        if incoming.is_empty() {
            return if id == self.graph.start {
                Readiness::Run
            } else {
                Readiness::Skip
            };
        }
        let states: Vec<EdgeState> = incoming.iter().map(|e| self.edge_state(e)).collect();
        if states.contains(&EdgeState::Pending) {
            Readiness::Wait
        } else if states.contains(&EdgeState::Taken) {
            Readiness::Run
        } else {
            Readiness::Skip
        }
    }

    fn branches_settled(&self, node: &WorkflowNode) -> bool {
        self.graph
            .outgoing(&node.id)
            .iter()
            .all(|e| self.status(&e.target).is_terminal())
    }

    fn skip(&mut self, node: &'a WorkflowNode) {
        debug!(node = %node.id, "Skipping node");
        self.set_status(&node.id, StepStatus::Skipped);
        for edge in self.graph.outgoing(&node.id).to_vec() {
            self.edges.insert(edge.id.as_str(), EdgeState::NotTaken);
        }
    }

    /// Begin a visit of `node`. Agent nodes return a future; every other
    /// kind settles immediately.
    fn activate(&mut self, node: &'a WorkflowNode) -> Option<BoxFuture<'static, NodeDone>> {
        let visit = {
            let count = self.visits.entry(node.id.as_str()).or_insert(0);
            *count += 1;
            *count
        };
        if visit > self.config.max_node_visits {
            let message = format!(
                "Node '{}' exceeded the maximum of {} visits",
                node.id, self.config.max_node_visits
            );
            warn!(node = %node.id, visits = visit, "Loop limit reached, aborting workflow");
            self.step_mut(&node.id).error = Some(message.clone());
            self.set_status(&node.id, StepStatus::Failed);
            self.aborted = Some(message);
            return None;
        }

        {
            let step = self.step_mut(&node.id);
            step.started_at = Some(Utc::now());
            step.completed_at = None;
            step.output = None;
            step.error = None;
        }
        self.set_status(&node.id, StepStatus::Running);
        debug!(node = %node.id, kind = node.kind.name(), visit, "Activating node");

        match &node.kind {
            NodeKind::Start => {
                let input = self.input.clone();
                self.step_mut(&node.id).output = Some(Value::String(input));
                self.settle(node, StepStatus::Completed, Resolution::Completed);
                None
            }
            NodeKind::End => {
                let snapshot = self.exec.context.snapshot();
                self.step_mut(&node.id).output = Some(snapshot);
                self.settle(node, StepStatus::Completed, Resolution::Completed);
                None
            }
            NodeKind::Condition { expression } => {
                let result = evaluate_condition(expression, self.exec.context.data());
                debug!(node = %node.id, expression = %expression, result, "Condition evaluated");
                let step = self.step_mut(&node.id);
                step.output = Some(Value::Bool(result));
                step.logs.push(format!("`{}` evaluated to {}", expression, result));
                self.settle(node, StepStatus::Completed, Resolution::Condition(result));
                None
            }
            NodeKind::Parallel => {
                self.resolve_edges(node, Resolution::All);
                None
            }
            NodeKind::Agent { agent_id } => self.spawn_agent(node, agent_id.as_deref(), visit),
        }
    }

    fn spawn_agent(
        &mut self,
        node: &'a WorkflowNode,
        agent_id: Option<&str>,
        visit: u32,
    ) -> Option<BoxFuture<'static, NodeDone>> {
        let agent_id = agent_id.unwrap_or_default();
        let Some(executor) = self.agents.get(agent_id).cloned() else {
            let message = ConductorError::AgentNotRegistered(agent_id.to_string()).to_string();
            self.fail(node, message);
            return None;
        };

        let input = self.agent_input(node);
        self.step_mut(&node.id).input = Some(input.clone());

        let retry = node.retry.unwrap_or(RetryPolicy {
            max_attempts: 1,
            backoff_ms: 0,
        });
        let job = AgentJob {
            execution_id: self.exec.id.clone(),
            node_id: node.id.clone(),
            visit,
            executor,
            input,
            timeout_ms: node
                .timeout_ms
                .or(self.config.default_node_timeout_ms)
                .filter(|ms| *ms > 0),
            max_attempts: retry.max_attempts.max(1),
            backoff_ms: retry.backoff_ms,
            max_backoff_ms: self.config.max_backoff_ms,
            cancel: self.token.child_token(),
            event_bus: self.event_bus.clone(),
        };
        debug!(node = %node.id, agent = %agent_id, visit, "Dispatching agent node");
        Some(job.run().boxed())
    }

    /// Workflow input, then upstream agent outputs on taken edges, then the
    /// shared context.
    fn agent_input(&self, node: &WorkflowNode) -> String {
        let mut input = self.input.clone();
        for edge in self.graph.forward_incoming(&node.id) {
            if self.edge_state(edge) != EdgeState::Taken {
                continue;
            }
            let Some(source) = self.def.node(&edge.source) else {
                continue;
            };
            if !matches!(source.kind, NodeKind::Agent { .. }) {
                continue;
            }
            if let Some(Value::String(output)) =
                self.exec.steps.get(&edge.source).and_then(|s| s.output.as_ref())
            {
                let _ = write!(input, "\n\n[Output from {}]\n{}", source.display_name(), output);
            }
        }
        if let Ok(context) = serde_json::to_string_pretty(&self.exec.context.snapshot()) {
            let _ = write!(input, "\n\n[Shared context]\n{}", context);
        }
        input
    }

    fn finish_agent(&mut self, done: NodeDone) {
        let def = self.def;
        let Some(node) = def.node(&done.node_id) else {
            return;
        };
        let current_visit = self.visits.get(node.id.as_str()).copied().unwrap_or(0);
        if current_visit != done.visit || self.status(&node.id) != StepStatus::Running {
            debug!(node = %node.id, visit = done.visit, "Discarding stale node result");
            return;
        }

        let NodeOutcome {
            result,
            attempts,
            logs,
        } = done.outcome;
        {
            let step = self.step_mut(&node.id);
            step.attempts = attempts;
            step.logs.extend(logs);
        }

        match result {
            Ok(output) => {
                self.exec.context.ingest_output(&node.id, &output);
                self.exec
                    .context
                    .set_str(format!("{}_status", node.id), "success");
                self.step_mut(&node.id).output = Some(Value::String(output));
                self.settle(node, StepStatus::Completed, Resolution::Completed);
            }
            Err(message) => self.fail(node, message),
        }
    }

    fn fail(&mut self, node: &'a WorkflowNode, message: String) {
        warn!(node = %node.id, error = %message, "Workflow node failed");
        self.exec
            .context
            .set_str(format!("{}_status", node.id), "failure");
        if self.first_error.is_none() {
            self.first_error = Some(
                ConductorError::NodeFailed {
                    node: node.id.clone(),
                    message: message.clone(),
                }
                .to_string(),
            );
        }
        self.step_mut(&node.id).error = Some(message);
        self.settle(node, StepStatus::Failed, Resolution::Failed);
    }

    fn settle(&mut self, node: &'a WorkflowNode, status: StepStatus, resolution: Resolution) {
        self.set_status(&node.id, status);
        self.resolve_edges(node, resolution);
    }

    fn resolve_edges(&mut self, node: &'a WorkflowNode, resolution: Resolution) {
        let mut loop_targets = Vec::new();
        for edge in self.graph.outgoing(&node.id).to_vec() {
            let taken = self.edge_taken(edge, resolution);
            let state = if taken {
                EdgeState::Taken
            } else {
                EdgeState::NotTaken
            };
            self.edges.insert(edge.id.as_str(), state);
            if taken && self.graph.is_back_edge(edge) {
                loop_targets.push(edge.target.as_str());
            }
        }
        for target in loop_targets {
            debug!(from = %node.id, to = %target, "Re-entering loop");
            self.reenter_loop(target);
        }
    }

    fn edge_taken(&self, edge: &WorkflowEdge, resolution: Resolution) -> bool {
        let guard = || {
            edge.condition
                .as_deref()
                .filter(|c| !c.trim().is_empty())
                .map(|c| evaluate_condition(c, self.exec.context.data()))
        };
        match resolution {
            Resolution::All => true,
            Resolution::Failed => edge.edge_type == EdgeType::Failure,
            Resolution::Completed => match edge.edge_type {
                EdgeType::Default | EdgeType::Success => true,
                EdgeType::Failure => false,
                EdgeType::Conditional => guard().unwrap_or(true),
            },
            Resolution::Condition(result) => match edge.edge_type {
                EdgeType::Default => true,
                EdgeType::Success => result,
                EdgeType::Failure => !result,
                EdgeType::Conditional => guard().unwrap_or(result),
            },
        }
    }

    /// Reset `target` and everything forward-reachable from it so the loop
    /// body runs again.
    fn reenter_loop(&mut self, target: &'a str) {
        let mut seen = HashSet::from([target]);
        let mut queue = VecDeque::from([target]);
        while let Some(id) = queue.pop_front() {
            for edge in self.graph.outgoing(id) {
                if self.graph.is_back_edge(edge) {
                    continue;
                }
                if seen.insert(edge.target.as_str()) {
                    queue.push_back(edge.target.as_str());
                }
            }
        }

        for id in seen {
            for edge in self.graph.outgoing(id).to_vec() {
                self.edges.insert(edge.id.as_str(), EdgeState::Pending);
            }
            if self.status(id) != StepStatus::Pending {
                {
                    let step = self.step_mut(id);
                    step.output = None;
                    step.error = None;
                    step.completed_at = None;
                }
                self.set_status(id, StepStatus::Pending);
            }
        }
    }

    /// Settle leftover steps and compute the terminal status.
    fn finish(mut self, cancelled: bool) -> WorkflowExecution {
        let def = self.def;
        for node in &def.nodes {
            let next = match self.status(&node.id) {
                StepStatus::Pending | StepStatus::Running if cancelled => StepStatus::Cancelled,
                StepStatus::Pending => StepStatus::Skipped,
                StepStatus::Running
                    if node.kind == NodeKind::Parallel && self.aborted.is_none() =>
                {
                    StepStatus::Completed
                }
                StepStatus::Running => StepStatus::Cancelled,
                _ => continue,
            };
            self.set_status(&node.id, next);
        }

        let reached_end = def
            .nodes
            .iter()
            .any(|n| n.kind == NodeKind::End && self.status(&n.id) == StepStatus::Completed);

        let (status, error) = if cancelled {
            (WorkflowStatus::Cancelled, Some(ConductorError::Cancelled.to_string()))
        } else if let Some(message) = self.aborted.take() {
            (WorkflowStatus::Failed, Some(message))
        } else if reached_end {
            (WorkflowStatus::Completed, None)
        } else {
            let message = self
                .first_error
                .take()
                .unwrap_or_else(|| "Workflow did not reach an end node".to_string());
            (WorkflowStatus::Failed, Some(message))
        };

        self.exec.status = status;
        self.exec.error = error;
        self.exec.completed_at = Some(Utc::now());
        self.exec
    }

    fn status(&self, id: &str) -> StepStatus {
        self.exec
            .steps
            .get(id)
            .map(|s| s.status)
            .unwrap_or(StepStatus::Pending)
    }

    fn edge_state(&self, edge: &WorkflowEdge) -> EdgeState {
        self.edges
            .get(edge.id.as_str())
            .copied()
            .unwrap_or(EdgeState::Pending)
    }

    fn step_mut(&mut self, id: &str) -> &mut WorkflowStepExecution {
        self.exec
            .steps
            .entry(id.to_string())
            .or_insert_with(WorkflowStepExecution::pending)
    }

    fn set_status(&mut self, id: &str, status: StepStatus) {
        let step = self.step_mut(id);
        if step.status == status {
            return;
        }
        step.status = status;
        if status.is_terminal() {
            step.completed_at = Some(Utc::now());
        }
        debug!(node = %id, status = %status, "Step status changed");
        self.event_bus.publish(EngineEvent::StepChanged {
            execution_id: self.exec.id.clone(),
            node_id: id.to_string(),
            status,
        });
    }
}

/// Everything an agent node needs to run detached from the scheduler.
struct AgentJob {
    execution_id: String,
    node_id: String,
    visit: u32,
    executor: Arc<AgentExecutor>,
    input: String,
    timeout_ms: Option<u64>,
    max_attempts: u32,
    backoff_ms: u64,
    max_backoff_ms: u64,
    cancel: CancellationToken,
    event_bus: Arc<EventBus>,
}

impl AgentJob {
    async fn run(self) -> NodeDone {
        let outcome = self.attempts().await;
        NodeDone {
            node_id: self.node_id,
            visit: self.visit,
            outcome,
        }
    }

    async fn attempts(&self) -> NodeOutcome {
        let mut logs = Vec::new();
        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            if self.cancel.is_cancelled() {
                return NodeOutcome {
                    result: Err(ConductorError::Cancelled.to_string()),
                    attempts: attempt - 1,
                    logs,
                };
            }

            match self.attempt().await {
                Ok(output) => {
                    logs.push(format!("Attempt {} succeeded", attempt));
                    return NodeOutcome {
                        result: Ok(output),
                        attempts: attempt,
                        logs,
                    };
                }
                Err(e) => last_error = e,
            }
            logs.push(format!("Attempt {} failed: {}", attempt, last_error));

            if attempt < self.max_attempts {
                let delay = backoff_delay(self.backoff_ms, attempt, self.max_backoff_ms);
                warn!(
                    node = %self.node_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_error,
                    "Retrying workflow node"
                );
                self.event_bus.publish(EngineEvent::StepRetrying {
                    execution_id: self.execution_id.clone(),
                    node_id: self.node_id.clone(),
                    attempt: attempt + 1,
                    error: last_error.clone(),
                });
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.cancel.cancelled() => {
                        return NodeOutcome {
                            result: Err(ConductorError::Cancelled.to_string()),
                            attempts: attempt,
                            logs,
                        };
                    }
                }
            }
        }

        NodeOutcome {
            result: Err(last_error),
            attempts: self.max_attempts,
            logs,
        }
    }

    async fn attempt(&self) -> std::result::Result<String, String> {
        let token = self.cancel.child_token();
        let run = self.executor.execute_with_cancel(&self.input, token.clone());
        let result = match self.timeout_ms {
            Some(timeout_ms) => match tokio::time::timeout(Duration::from_millis(timeout_ms), run).await {
                Ok(result) => result,
                Err(_) => {
                    token.cancel();
                    return Err(ConductorError::NodeTimeout {
                        node: self.node_id.clone(),
                        timeout_ms,
                    }
                    .to_string());
                }
            },
            None => run.await,
        };
        if result.success {
            Ok(result.final_response)
        } else {
            Err(result.error.unwrap_or(result.final_response))
        }
    }
}

/// `backoff_ms * 2^(attempt-1)`, capped.
fn backoff_delay(backoff_ms: u64, attempt: u32, max_backoff_ms: u64) -> Duration {
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_millis(backoff_ms.saturating_mul(factor).min(max_backoff_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    use conductor_core::config::GovernanceConfig;
    use conductor_core::types::AgentExecutorConfig;
    use conductor_core::SystemClock;
    use conductor_test_utils::{Reply, ScriptedClient};
    use conductor_tools::ToolRegistry;

    use crate::governance::GovernanceManager;
    use crate::workflow::definition::{WorkflowEdge, WorkflowNode};

    fn agent(name: &str, client: &ScriptedClient) -> Arc<AgentExecutor> {
        Arc::new(AgentExecutor::new(
            AgentExecutorConfig::new(name, "test-model"),
            Arc::new(client.clone()),
            Arc::new(ToolRegistry::new()),
            Arc::new(GovernanceManager::new(
                &GovernanceConfig::default(),
                Arc::new(SystemClock),
            )),
        ))
    }

    fn engine() -> (WorkflowEngine, Arc<EventBus>) {
        engine_with(WorkflowConfig::default())
    }

    fn engine_with(config: WorkflowConfig) -> (WorkflowEngine, Arc<EventBus>) {
        let bus = Arc::new(EventBus::default());
        (WorkflowEngine::new(config, bus.clone()), bus)
    }

    fn linear(work: WorkflowNode) -> WorkflowDefinition {
        WorkflowDefinition::new("wf", "Linear")
            .with_node(WorkflowNode::start("start"))
            .with_node(work)
            .with_node(WorkflowNode::end("end"))
            .with_edge(WorkflowEdge::new("e1", "start", "work"))
            .with_edge(WorkflowEdge::new("e2", "work", "end"))
    }

    fn status(exec: &WorkflowExecution, node: &str) -> StepStatus {
        exec.step(node).unwrap().status
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn linear_workflow_completes() {
        let (engine, bus) = engine();
        let client = ScriptedClient::texts(&["FINAL_ANSWER: drafted"]);
        engine.register_agent("writer", agent("writer", &client));
        let mut rx = bus.subscribe();

        let exec = engine
            .execute(&linear(WorkflowNode::agent("work", "writer")), "write a poem")
            .await
            .unwrap();

        assert_eq!(exec.status, WorkflowStatus::Completed);
        assert!(exec.error.is_none());
        assert!(exec.completed_at.is_some());
        assert_eq!(status(&exec, "start"), StepStatus::Completed);
        assert_eq!(exec.step("work").unwrap().output, Some(Value::String("drafted".into())));
        assert_eq!(exec.step("work").unwrap().attempts, 1);
        assert_eq!(exec.context.get_str("work"), Some("drafted"));
        assert_eq!(exec.context.get_str("work_status"), Some("success"));
        assert_eq!(exec.step("end").unwrap().output.as_ref().unwrap()["work"], "drafted");

        let prompt = &client.requests()[0].prompt;
        assert!(prompt.contains("write a poem"));
        assert!(prompt.contains("[Shared context]"));

        let events = drain(&mut rx);
        assert!(matches!(events.first(), Some(EngineEvent::WorkflowStarted { workflow_id, .. }) if workflow_id == "wf"));
        assert!(matches!(
            events.last(),
            Some(EngineEvent::WorkflowFinished { status: WorkflowStatus::Completed, .. })
        ));
        let work_transitions: Vec<StepStatus> = events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::StepChanged { node_id, status, .. } if node_id == "work" => Some(*status),
                _ => None,
            })
            .collect();
        assert_eq!(work_transitions, vec![StepStatus::Running, StepStatus::Completed]);
        assert!(engine.running().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failing_node_retries_then_fails() {
        let (engine, bus) = engine();
        let client = ScriptedClient::repeating(Reply::Fail("upstream down".into()));
        engine.register_agent("writer", agent("writer", &client));
        let mut rx = bus.subscribe();

        let exec = engine
            .execute(&linear(WorkflowNode::agent("work", "writer").with_retry(3, 100)), "go")
            .await
            .unwrap();

        assert_eq!(exec.status, WorkflowStatus::Failed);
        let step = exec.step("work").unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.attempts, 3);
        assert!(step.error.as_deref().unwrap().contains("upstream down"));
        assert_eq!(step.logs.len(), 3);
        assert_eq!(client.call_count(), 3);
        assert!(exec.error.as_deref().unwrap().starts_with("Node 'work' failed"));
        assert_eq!(status(&exec, "end"), StepStatus::Skipped);
        assert_eq!(exec.context.get_str("work_status"), Some("failure"));

        let retries: Vec<u32> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::StepRetrying { attempt, .. } => Some(attempt),
                _ => None,
            })
            .collect();
        assert_eq!(retries, vec![2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_after_transient_failure() {
        let (engine, _bus) = engine();
        let client = ScriptedClient::new(vec![
            Reply::Fail("blip".into()),
            Reply::Text("FINAL_ANSWER: ok".into()),
        ]);
        engine.register_agent("writer", agent("writer", &client));

        let exec = engine
            .execute(&linear(WorkflowNode::agent("work", "writer").with_retry(2, 50)), "go")
            .await
            .unwrap();

        assert_eq!(exec.status, WorkflowStatus::Completed);
        assert_eq!(exec.step("work").unwrap().attempts, 2);
        assert!(exec.step("work").unwrap().error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn node_timeout_fails_step() {
        let (engine, _bus) = engine();
        let client = ScriptedClient::repeating(Reply::Delayed(
            Duration::from_secs(10),
            "FINAL_ANSWER: late".into(),
        ));
        engine.register_agent("writer", agent("writer", &client));

        let exec = engine
            .execute(&linear(WorkflowNode::agent("work", "writer").with_timeout(50)), "go")
            .await
            .unwrap();

        assert_eq!(exec.status, WorkflowStatus::Failed);
        let step = exec.step("work").unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.error.as_deref(), Some("Node 'work' timed out after 50ms"));
    }

    #[tokio::test(start_paused = true)]
    async fn default_timeout_applies_to_nodes_without_one() {
        let (engine, _bus) = engine_with(WorkflowConfig {
            default_node_timeout_ms: Some(20),
            ..WorkflowConfig::default()
        });
        let client = ScriptedClient::repeating(Reply::Delayed(
            Duration::from_secs(1),
            "FINAL_ANSWER: late".into(),
        ));
        engine.register_agent("writer", agent("writer", &client));

        let exec = engine
            .execute(&linear(WorkflowNode::agent("work", "writer")), "go")
            .await
            .unwrap();
        assert!(exec.step("work").unwrap().error.as_deref().unwrap().contains("timed out after 20ms"));
    }

    #[tokio::test]
    async fn parallel_branches_join_once() {
        let (engine, _bus) = engine();
        let alpha = ScriptedClient::texts(&["FINAL_ANSWER: from alpha"]);
        let beta = ScriptedClient::texts(&["FINAL_ANSWER: from beta"]);
        let merger = ScriptedClient::texts(&["FINAL_ANSWER: merged"]);
        engine.register_agent("alpha", agent("alpha", &alpha));
        engine.register_agent("beta", agent("beta", &beta));
        engine.register_agent("merger", agent("merger", &merger));

        let def = WorkflowDefinition::new("wf", "Fan out")
            .with_node(WorkflowNode::start("start"))
            .with_node(WorkflowNode::parallel("fan"))
            .with_node(WorkflowNode::agent("a", "alpha"))
            .with_node(WorkflowNode::agent("b", "beta"))
            .with_node(WorkflowNode::agent("join", "merger"))
            .with_node(WorkflowNode::end("end"))
            .with_edge(WorkflowEdge::new("e1", "start", "fan"))
            .with_edge(WorkflowEdge::new("e2", "fan", "a"))
            .with_edge(WorkflowEdge::new("e3", "fan", "b"))
            .with_edge(WorkflowEdge::new("e4", "a", "join"))
            .with_edge(WorkflowEdge::new("e5", "b", "join"))
            .with_edge(WorkflowEdge::new("e6", "join", "end"));

        let exec = engine.execute(&def, "research").await.unwrap();

        assert_eq!(exec.status, WorkflowStatus::Completed);
        for node in ["fan", "a", "b", "join", "end"] {
            assert_eq!(status(&exec, node), StepStatus::Completed, "{}", node);
        }
        assert_eq!(merger.call_count(), 1);
        let prompt = &merger.requests()[0].prompt;
        assert!(prompt.contains("[Output from a]\nfrom alpha"));
        assert!(prompt.contains("[Output from b]\nfrom beta"));
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_node_completes_after_its_branches() {
        let (engine, bus) = engine();
        let slow = ScriptedClient::new(vec![Reply::Delayed(
            Duration::from_millis(500),
            "FINAL_ANSWER: slow".into(),
        )]);
        let fast = ScriptedClient::texts(&["FINAL_ANSWER: fast"]);
        engine.register_agent("slow", agent("slow", &slow));
        engine.register_agent("fast", agent("fast", &fast));
        let def = WorkflowDefinition::new("wf", "Fan out")
            .with_node(WorkflowNode::start("start"))
            .with_node(WorkflowNode::parallel("fan"))
            .with_node(WorkflowNode::agent("a", "slow"))
            .with_node(WorkflowNode::agent("b", "fast"))
            .with_node(WorkflowNode::end("end"))
            .with_edge(WorkflowEdge::new("e1", "start", "fan"))
            .with_edge(WorkflowEdge::new("e2", "fan", "a"))
            .with_edge(WorkflowEdge::new("e3", "fan", "b"))
            .with_edge(WorkflowEdge::new("e4", "a", "end"))
            .with_edge(WorkflowEdge::new("e5", "b", "end"));
        let mut rx = bus.subscribe();

        let exec = engine.execute(&def, "go").await.unwrap();
        assert_eq!(exec.status, WorkflowStatus::Completed);

        let transitions: Vec<(String, StepStatus)> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::StepChanged { node_id, status, .. } => Some((node_id, status)),
                _ => None,
            })
            .collect();
        let at = |node: &str, status: StepStatus| {
            transitions
                .iter()
                .position(|(n, s)| n == node && *s == status)
                .unwrap()
        };
        let fan_running = at("fan", StepStatus::Running);
        let fan_completed = at("fan", StepStatus::Completed);
        let b_completed = at("b", StepStatus::Completed);
        let a_completed = at("a", StepStatus::Completed);
        assert!(fan_running < b_completed);
        assert!(b_completed < a_completed);
        assert!(a_completed < fan_completed);
        assert_eq!(
            transitions.iter().filter(|(n, _)| n == "fan").count(),
            2,
            "fan only moves Running then Completed"
        );
    }

    #[tokio::test]
    async fn unreachable_loop_does_not_block_reachable_path() {
        let (engine, _bus) = engine();
        let writer = ScriptedClient::texts(&["FINAL_ANSWER: done"]);
        let idle = ScriptedClient::default();
        engine.register_agent("writer", agent("writer", &writer));
        engine.register_agent("idle", agent("idle", &idle));
        let def = WorkflowDefinition::new("wf", "Detached loop")
            .with_node(WorkflowNode::start("start"))
            .with_node(WorkflowNode::agent("a", "writer"))
            .with_node(WorkflowNode::end("end"))
            .with_node(WorkflowNode::agent("x", "idle"))
            .with_node(WorkflowNode::condition("c", "true"))
            .with_edge(WorkflowEdge::new("e1", "start", "a"))
            .with_edge(WorkflowEdge::new("e2", "a", "end"))
            .with_edge(WorkflowEdge::new("e3", "x", "c"))
            .with_edge(WorkflowEdge::new("e4", "c", "x"))
            .with_edge(WorkflowEdge::new("e5", "c", "a"));

        let report = engine.validate_workflow(&def);
        assert!(report.valid, "{:?}", report.errors);
        assert!(!report.warnings.is_empty());

        let exec = engine.execute(&def, "go").await.unwrap();

        assert_eq!(exec.status, WorkflowStatus::Completed);
        assert_eq!(status(&exec, "a"), StepStatus::Completed);
        assert_eq!(status(&exec, "x"), StepStatus::Skipped);
        assert_eq!(status(&exec, "c"), StepStatus::Skipped);
        assert_eq!(writer.call_count(), 1);
        assert_eq!(idle.call_count(), 0);
    }

    fn branching() -> WorkflowDefinition {
        WorkflowDefinition::new("wf", "Branch")
            .with_node(WorkflowNode::start("start"))
            .with_node(WorkflowNode::condition("check", r#"input == "go""#))
            .with_node(WorkflowNode::agent("work", "writer"))
            .with_node(WorkflowNode::agent("fallback", "backup"))
            .with_node(WorkflowNode::end("end"))
            .with_edge(WorkflowEdge::new("e1", "start", "check"))
            .with_edge(WorkflowEdge::new("e2", "check", "work").with_type(EdgeType::Success))
            .with_edge(WorkflowEdge::new("e3", "check", "fallback").with_type(EdgeType::Failure))
            .with_edge(WorkflowEdge::new("e4", "work", "end"))
            .with_edge(WorkflowEdge::new("e5", "fallback", "end"))
    }

    #[tokio::test]
    async fn false_condition_skips_branch() {
        let (engine, _bus) = engine();
        let writer = ScriptedClient::texts(&["FINAL_ANSWER: wrote"]);
        let backup = ScriptedClient::texts(&["FINAL_ANSWER: fell back"]);
        engine.register_agent("writer", agent("writer", &writer));
        engine.register_agent("backup", agent("backup", &backup));

        let exec = engine.execute(&branching(), "stop").await.unwrap();

        assert_eq!(exec.status, WorkflowStatus::Completed);
        assert_eq!(exec.step("check").unwrap().output, Some(Value::Bool(false)));
        assert_eq!(status(&exec, "work"), StepStatus::Skipped);
        assert_eq!(status(&exec, "fallback"), StepStatus::Completed);
        assert_eq!(status(&exec, "end"), StepStatus::Completed);
        assert_eq!(writer.call_count(), 0);
    }

    #[tokio::test]
    async fn skipped_end_fails_workflow() {
        let (engine, _bus) = engine();
        let writer = ScriptedClient::texts(&["FINAL_ANSWER: wrote"]);
        engine.register_agent("writer", agent("writer", &writer));
        let def = WorkflowDefinition::new("wf", "Gate")
            .with_node(WorkflowNode::start("start"))
            .with_node(WorkflowNode::condition("check", r#"input == "go""#))
            .with_node(WorkflowNode::agent("work", "writer"))
            .with_node(WorkflowNode::end("end"))
            .with_edge(WorkflowEdge::new("e1", "start", "check"))
            .with_edge(WorkflowEdge::new("e2", "check", "work").with_type(EdgeType::Success))
            .with_edge(WorkflowEdge::new("e3", "work", "end"));

        let exec = engine.execute(&def, "stop").await.unwrap();

        assert_eq!(exec.status, WorkflowStatus::Failed);
        assert_eq!(exec.error.as_deref(), Some("Workflow did not reach an end node"));
        assert_eq!(status(&exec, "work"), StepStatus::Skipped);
        assert_eq!(status(&exec, "end"), StepStatus::Skipped);
    }

    #[tokio::test]
    async fn failure_edge_routes_around_failed_node() {
        let (engine, _bus) = engine();
        let writer = ScriptedClient::repeating(Reply::Fail("nope".into()));
        let backup = ScriptedClient::texts(&["FINAL_ANSWER: recovered"]);
        engine.register_agent("writer", agent("writer", &writer));
        engine.register_agent("backup", agent("backup", &backup));
        let def = WorkflowDefinition::new("wf", "Recover")
            .with_node(WorkflowNode::start("start"))
            .with_node(WorkflowNode::agent("work", "writer"))
            .with_node(WorkflowNode::agent("recover", "backup"))
            .with_node(WorkflowNode::end("end"))
            .with_edge(WorkflowEdge::new("e1", "start", "work"))
            .with_edge(WorkflowEdge::new("e2", "work", "end").with_type(EdgeType::Success))
            .with_edge(WorkflowEdge::new("e3", "work", "recover").with_type(EdgeType::Failure))
            .with_edge(WorkflowEdge::new("e4", "recover", "end"));

        let exec = engine.execute(&def, "go").await.unwrap();

        assert_eq!(exec.status, WorkflowStatus::Completed);
        assert_eq!(status(&exec, "work"), StepStatus::Failed);
        assert_eq!(status(&exec, "recover"), StepStatus::Completed);
        assert_eq!(exec.context.get_str("work_status"), Some("failure"));
    }

    #[tokio::test]
    async fn json_output_feeds_conditions() {
        let (engine, _bus) = engine();
        let reviewer = ScriptedClient::texts(&[r#"FINAL_ANSWER: {"verdict": "pass"}"#]);
        engine.register_agent("reviewer", agent("reviewer", &reviewer));
        let def = WorkflowDefinition::new("wf", "Review")
            .with_node(WorkflowNode::start("start"))
            .with_node(WorkflowNode::agent("review", "reviewer"))
            .with_node(WorkflowNode::end("approved"))
            .with_node(WorkflowNode::end("rejected"))
            .with_edge(WorkflowEdge::new("e1", "start", "review"))
            .with_edge(WorkflowEdge::new("e2", "review", "approved").with_condition(r#"verdict == "pass""#))
            .with_edge(WorkflowEdge::new("e3", "review", "rejected").with_condition(r#"verdict != "pass""#));

        let exec = engine.execute(&def, "check this").await.unwrap();

        assert_eq!(exec.status, WorkflowStatus::Completed);
        assert_eq!(exec.context.get_str("verdict"), Some("pass"));
        assert_eq!(status(&exec, "approved"), StepStatus::Completed);
        assert_eq!(status(&exec, "rejected"), StepStatus::Skipped);
    }

    fn revision_loop() -> WorkflowDefinition {
        WorkflowDefinition::new("wf", "Revise")
            .with_node(WorkflowNode::start("start"))
            .with_node(WorkflowNode::agent("work", "writer"))
            .with_node(WorkflowNode::condition("check", r#"work contains "approved""#))
            .with_node(WorkflowNode::end("end"))
            .with_edge(WorkflowEdge::new("e1", "start", "work"))
            .with_edge(WorkflowEdge::new("e2", "work", "check"))
            .with_edge(WorkflowEdge::new("e3", "check", "end").with_type(EdgeType::Success))
            .with_edge(WorkflowEdge::new("e4", "check", "work").with_type(EdgeType::Failure))
    }

    #[tokio::test]
    async fn condition_back_edge_loops_until_satisfied() {
        let (engine, _bus) = engine();
        let client = ScriptedClient::texts(&[
            "FINAL_ANSWER: draft one",
            "FINAL_ANSWER: draft two approved",
        ]);
        engine.register_agent("writer", agent("writer", &client));

        let exec = engine.execute(&revision_loop(), "write").await.unwrap();

        assert_eq!(exec.status, WorkflowStatus::Completed);
        assert_eq!(client.call_count(), 2);
        assert_eq!(
            exec.step("work").unwrap().output,
            Some(Value::String("draft two approved".into()))
        );
        assert_eq!(status(&exec, "end"), StepStatus::Completed);
        // second pass sees the first draft in context
        assert!(client.requests()[1].prompt.contains("draft one"));
    }

    #[tokio::test]
    async fn loop_exceeding_visit_limit_fails() {
        let (engine, _bus) = engine_with(WorkflowConfig {
            max_node_visits: 3,
            ..WorkflowConfig::default()
        });
        let client = ScriptedClient::repeating(Reply::Text("FINAL_ANSWER: still drafting".into()));
        engine.register_agent("writer", agent("writer", &client));

        let exec = engine.execute(&revision_loop(), "write").await.unwrap();

        assert_eq!(exec.status, WorkflowStatus::Failed);
        assert_eq!(client.call_count(), 3);
        assert!(exec.error.as_deref().unwrap().contains("exceeded the maximum of 3 visits"));
        assert_eq!(status(&exec, "work"), StepStatus::Failed);
        assert_eq!(status(&exec, "end"), StepStatus::Skipped);
    }

    #[tokio::test]
    async fn cancel_all_stops_running_workflow() {
        let (engine, bus) = engine();
        let client = ScriptedClient::repeating(Reply::Delayed(
            Duration::from_secs(60),
            "FINAL_ANSWER: never".into(),
        ));
        engine.register_agent("writer", agent("writer", &client));
        let def = linear(WorkflowNode::agent("work", "writer"));
        let mut rx = bus.subscribe();

        let canceller = async {
            loop {
                match rx.recv().await {
                    Ok(EngineEvent::StepChanged { node_id, status: StepStatus::Running, .. })
                        if node_id == "work" =>
                    {
                        break
                    }
                    Ok(_) => continue,
                    Err(e) => panic!("event stream closed: {}", e),
                }
            }
            assert_eq!(engine.running().len(), 1);
            engine.cancel_all()
        };
        let (exec, signalled) = tokio::join!(engine.execute(&def, "go"), canceller);
        let exec = exec.unwrap();

        assert_eq!(signalled, 1);
        assert_eq!(exec.status, WorkflowStatus::Cancelled);
        assert_eq!(exec.error.as_deref(), Some("Execution cancelled"));
        assert_eq!(status(&exec, "start"), StepStatus::Completed);
        assert_eq!(status(&exec, "work"), StepStatus::Cancelled);
        assert_eq!(status(&exec, "end"), StepStatus::Cancelled);
        assert!(engine.running().is_empty());
        assert!(!engine.cancel(&exec.id));
    }

    #[tokio::test]
    async fn cancel_by_id_stops_that_execution() {
        let (engine, bus) = engine();
        let client = ScriptedClient::repeating(Reply::Delayed(
            Duration::from_secs(60),
            "FINAL_ANSWER: never".into(),
        ));
        engine.register_agent("writer", agent("writer", &client));
        let def = linear(WorkflowNode::agent("work", "writer"));
        let mut rx = bus.subscribe();

        let canceller = async {
            let execution_id = loop {
                match rx.recv().await {
                    Ok(EngineEvent::StepChanged {
                        execution_id,
                        node_id,
                        status: StepStatus::Running,
                    }) if node_id == "work" => break execution_id,
                    Ok(_) => continue,
                    Err(e) => panic!("event stream closed: {}", e),
                }
            };
            assert!(!engine.cancel("no-such-execution"));
            let cancelled = engine.cancel(&execution_id);
            (execution_id, cancelled)
        };
        let (exec, (execution_id, cancelled)) = tokio::join!(engine.execute(&def, "go"), canceller);
        let exec = exec.unwrap();

        assert!(cancelled);
        assert_eq!(exec.id, execution_id);
        assert_eq!(exec.status, WorkflowStatus::Cancelled);
        assert_eq!(status(&exec, "work"), StepStatus::Cancelled);
        assert!(engine.running().is_empty());
    }

    #[tokio::test]
    async fn invalid_workflow_is_refused() {
        let (engine, bus) = engine();
        let mut rx = bus.subscribe();

        let err = engine
            .execute(&linear(WorkflowNode::agent("work", "ghost")), "go")
            .await
            .unwrap_err();

        assert!(matches!(err, ConductorError::WorkflowValidation(_)));
        assert!(err.to_string().contains("unknown agent 'ghost'"));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn validate_uses_registered_agents() {
        let (engine, _bus) = engine();
        let def = linear(WorkflowNode::agent("work", "writer"));
        assert!(!engine.validate_workflow(&def).valid);
        engine.register_agent("writer", agent("writer", &ScriptedClient::default()));
        assert!(engine.validate_workflow(&def).valid);
        assert_eq!(engine.agent_ids(), vec!["writer"]);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(100, 1, 60_000), Duration::from_millis(100));
        assert_eq!(backoff_delay(100, 2, 60_000), Duration::from_millis(200));
        assert_eq!(backoff_delay(100, 4, 60_000), Duration::from_millis(800));
        assert_eq!(backoff_delay(100, 20, 1_000), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(u64::MAX, 64, 5_000), Duration::from_millis(5_000));
    }

    #[test]
    fn execution_serializes_camel_case() {
        let mut steps = BTreeMap::new();
        steps.insert("a".to_string(), WorkflowStepExecution::pending());
        let exec = WorkflowExecution {
            id: "x".into(),
            workflow_id: "wf".into(),
            status: WorkflowStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            steps,
            context: SharedContext::with_input("hi"),
            error: None,
        };
        let json = serde_json::to_value(&exec).unwrap();
        assert_eq!(json["workflowId"], "wf");
        assert_eq!(json["status"], "running");
        assert_eq!(json["steps"]["a"]["status"], "pending");
    }
}
