use std::fmt::Write;

use conductor_core::types::{AgentExecutorConfig, ExecutionStep, StepKind, ToolDefinition};

use crate::protocol::{FINAL_ANSWER_MARKER, PARAMS_MARKER, TOOL_CALL_MARKER};

/// System prompt: identity, goal, tools and the response protocol.
pub fn build_system_prompt(config: &AgentExecutorConfig, tools: &[ToolDefinition]) -> String {
    let mut prompt = format!("You are {}", config.agent_name);
    if !config.agent_role.is_empty() {
        let _ = write!(prompt, ", {}", config.agent_role);
    }
    prompt.push_str(".\n");
    if !config.agent_goal.is_empty() {
        let _ = writeln!(prompt, "Your goal: {}", config.agent_goal);
    }

    prompt.push_str("\n## Available tools\n");
    if tools.is_empty() {
        prompt.push_str("(none)\n");
    }
    for tool in tools {
        let _ = writeln!(prompt, "\n### {}\n{}", tool.name, tool.description);
        for (name, spec) in &tool.parameters {
            let _ = write!(prompt, "- {} ({}): {}", name, spec.param_type, spec.description);
            if let Some(values) = &spec.enum_values {
                let _ = write!(prompt, " [one of: {}]", values.join(", "));
            }
            prompt.push('\n');
        }
    }

    let _ = write!(
        prompt,
        "\n## Response format\n\
         Think step by step. To use a tool, reply with exactly:\n\
         {TOOL_CALL_MARKER} <tool name>\n\
         {PARAMS_MARKER} <JSON object of parameters>\n\n\
         When you have the answer, reply with:\n\
         {FINAL_ANSWER_MARKER} <your answer>\n\n\
         Use one tool per response and wait for its observation."
    );
    prompt
}

/// User input followed by every prior step, in order.
pub fn build_transcript(input: &str, steps: &[ExecutionStep]) -> String {
    let mut transcript = format!("User: {}\n", input);
    for step in steps {
        let label = match step.kind {
            StepKind::Thought => "Thought",
            StepKind::Action => "Action",
            StepKind::Observation => "Observation",
            StepKind::Answer => "Answer",
        };
        let _ = write!(transcript, "\n{}: {}", label, step.content);
    }
    transcript
}
