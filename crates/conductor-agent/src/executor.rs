use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use conductor_core::error::ConductorError;
use conductor_core::event::EventBus;
use conductor_core::traits::CompletionClient;
use conductor_core::types::{
    AgentExecutorConfig, CompletionRequest, EngineEvent, ExecutionResult, ExecutionStep, StepKind,
    ToolContext,
};
use conductor_tools::ToolRegistry;

use crate::governance::{GovernanceManager, ToolRequest};
use crate::prompt::{build_system_prompt, build_transcript};
use crate::protocol::{parse_response, ParsedResponse};

const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Runs one agent's bounded think/act/observe loop.
pub struct AgentExecutor {
    config: AgentExecutorConfig,
    client: Arc<dyn CompletionClient>,
    tools: Arc<ToolRegistry>,
    governance: Arc<GovernanceManager>,
    event_bus: Arc<EventBus>,
    working_dir: PathBuf,
    max_tokens: u32,
}

/// Mutable record of one run.
struct Run {
    steps: Vec<ExecutionStep>,
}

impl AgentExecutor {
    pub fn new(
        config: AgentExecutorConfig,
        client: Arc<dyn CompletionClient>,
        tools: Arc<ToolRegistry>,
        governance: Arc<GovernanceManager>,
    ) -> Self {
        Self {
            config,
            client,
            tools,
            governance,
            event_bus: Arc::new(EventBus::default()),
            working_dir: PathBuf::from("."),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn config(&self) -> &AgentExecutorConfig {
        &self.config
    }

    /// Run to completion.
    pub async fn execute(&self, input: &str) -> ExecutionResult {
        self.execute_with_cancel(input, CancellationToken::new()).await
    }

    /// Run until completion or until `cancel` fires.
    pub async fn execute_with_cancel(
        &self,
        input: &str,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let agent = self.config.agent_name.clone();
        self.event_bus.publish(EngineEvent::AgentStarted {
            agent: agent.clone(),
        });

        let result = self.run_loop(input, &cancel).await;

        info!(
            agent = %agent,
            success = result.success,
            steps = result.steps.len(),
            "Agent run finished"
        );
        self.event_bus.publish(EngineEvent::AgentFinished {
            agent,
            success: result.success,
        });
        result
    }

    async fn run_loop(&self, input: &str, cancel: &CancellationToken) -> ExecutionResult {
        let definitions = self.tools.subset(&self.config.tool_names);
        let available: Vec<String> = definitions.iter().map(|d| d.name.clone()).collect();
        let system_prompt = build_system_prompt(&self.config, &definitions);
        let mut run = Run { steps: Vec::new() };
        let max_iterations = self.config.max_iterations;

        for iteration in 1..=max_iterations {
            if cancel.is_cancelled() {
                return run.cancelled();
            }
            info!(agent = %self.config.agent_name, iteration, "Agent iteration");

            let request = CompletionRequest {
                prompt: build_transcript(input, &run.steps),
                system_prompt: system_prompt.clone(),
                model: self.config.model.clone(),
                temperature: self.config.temperature,
                max_tokens: self.max_tokens,
                stream: false,
            };

            let response = tokio::select! {
                r = self.client.complete(request) => r,
                _ = cancel.cancelled() => return run.cancelled(),
            };
            let text = match response {
                Ok(text) => text,
                Err(e) => {
                    warn!(agent = %self.config.agent_name, error = %e, "Completion failed");
                    let message = e.to_string();
                    self.record(
                        &mut run,
                        ExecutionStep::new(StepKind::Observation, format!("Error: {}", message)),
                    );
                    return run.failed(message);
                }
            };

            match parse_response(&text) {
                ParsedResponse::FinalAnswer(answer) | ParsedResponse::Unknown(answer) => {
                    self.record(&mut run, ExecutionStep::new(StepKind::Answer, answer.clone()));
                    return run.finished(answer);
                }
                ParsedResponse::ToolCall {
                    name,
                    params,
                    thought,
                } => {
                    let thought = if thought.is_empty() {
                        format!("Using tool '{}'", name)
                    } else {
                        thought
                    };
                    self.record(&mut run, ExecutionStep::new(StepKind::Thought, thought));
                    self.record(
                        &mut run,
                        ExecutionStep::new(StepKind::Action, format!("{}({})", name, params))
                            .with_metadata(serde_json::json!({
                                "tool": name.clone(),
                                "params": params.clone(),
                            })),
                    );

                    let observation = tokio::select! {
                        o = self.run_tool(&name, params, &available) => o,
                        _ = cancel.cancelled() => return run.cancelled(),
                    };
                    self.record(&mut run, ExecutionStep::new(StepKind::Observation, observation));
                }
            }
        }

        let notice = format!(
            "Reached the iteration limit ({} iterations) without a final answer.",
            max_iterations
        );
        warn!(agent = %self.config.agent_name, max_iterations, "Iteration limit reached");
        self.record(&mut run, ExecutionStep::new(StepKind::Answer, notice.clone()));
        run.finished(notice)
    }

    /// Dispatch one tool call and describe the outcome as an observation.
    async fn run_tool(&self, name: &str, params: serde_json::Value, available: &[String]) -> String {
        let Some(tool) = self.tools.get_scoped(name, &self.config.tool_names) else {
            debug!(agent = %self.config.agent_name, tool = %name, "Unknown tool requested");
            let listed = if available.is_empty() {
                "none".to_string()
            } else {
                available.join(", ")
            };
            return format!("Tool '{}' not found. Available tools: {}", name, listed);
        };

        if self.config.dry_run {
            return format!("[DRY RUN] Would execute tool '{}' with params: {}", name, params);
        }

        let request = ToolRequest {
            agent_id: self.config.agent_name.clone(),
            agent_name: self.config.agent_name.clone(),
            tool_name: name.to_string(),
            params,
        };
        let ctx = ToolContext::new(self.config.agent_name.clone(), self.working_dir.clone());

        match self.governance.execute_tool(request, tool, ctx).await {
            Ok(out) if out.success => out.output,
            Ok(out) => format!("Tool reported failure: {}", out.output),
            Err(ConductorError::GovernanceDenied { tool, reason }) => {
                self.event_bus.publish(EngineEvent::ToolBlocked {
                    agent: self.config.agent_name.clone(),
                    tool,
                    reason: reason.clone(),
                });
                format!("Permission denied: {}", reason)
            }
            Err(e) => format!("Error: {}", e),
        }
    }

    fn record(&self, run: &mut Run, step: ExecutionStep) {
        debug!(agent = %self.config.agent_name, kind = %step.kind, "Step recorded");
        self.event_bus.publish(EngineEvent::AgentStep {
            agent: self.config.agent_name.clone(),
            step: step.clone(),
        });
        run.steps.push(step);
    }
}

impl Run {
    fn finished(self, answer: String) -> ExecutionResult {
        ExecutionResult {
            steps: self.steps,
            final_response: answer,
            success: true,
            error: None,
        }
    }

    fn failed(self, error: String) -> ExecutionResult {
        ExecutionResult {
            steps: self.steps,
            final_response: String::new(),
            success: false,
            error: Some(error),
        }
    }

    fn cancelled(self) -> ExecutionResult {
        self.failed(ConductorError::Cancelled.to_string())
    }
}
