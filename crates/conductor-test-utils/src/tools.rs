use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;

use conductor_core::error::{ConductorError, Result};
use conductor_core::traits::Tool;
use conductor_core::types::{ParameterSpec, ToolContext, ToolOutput, ToolSchema};

fn text_schema() -> ToolSchema {
    let mut schema = ToolSchema::new();
    schema.insert("text".into(), ParameterSpec::new("string", "Text to process"));
    schema
}

/// Returns its `text` parameter (or the whole params object) as output.
pub struct EchoTool;

impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the given text back"
    }

    fn parameters(&self) -> ToolSchema {
        text_schema()
    }

    fn execute(&self, params: serde_json::Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async move {
            let text = params
                .get("text")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| params.to_string());
            Ok(ToolOutput::success(text).with_data(params))
        })
    }
}

/// Reports an expected failure via `success: false`.
pub struct FailingTool;

impl Tool for FailingTool {
    fn name(&self) -> &str {
        "flaky"
    }

    fn description(&self) -> &str {
        "Always reports failure"
    }

    fn parameters(&self) -> ToolSchema {
        ToolSchema::new()
    }

    fn execute(&self, _params: serde_json::Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async { Ok(ToolOutput::failure("upstream unavailable")) })
    }
}

/// Returns an `Err` from `execute`.
pub struct PanickyTool;

impl Tool for PanickyTool {
    fn name(&self) -> &str {
        "explode"
    }

    fn description(&self) -> &str {
        "Always errors"
    }

    fn parameters(&self) -> ToolSchema {
        ToolSchema::new()
    }

    fn execute(&self, _params: serde_json::Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async {
            Err(ConductorError::ToolExecution {
                tool: "explode".into(),
                message: "kaboom".into(),
            })
        })
    }
}

/// Counts invocations; clones share the counter.
#[derive(Clone, Default)]
pub struct CountingTool {
    calls: Arc<AtomicUsize>,
}

impl CountingTool {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Tool for CountingTool {
    fn name(&self) -> &str {
        "counter"
    }

    fn description(&self) -> &str {
        "Counts how often it is called"
    }

    fn parameters(&self) -> ToolSchema {
        ToolSchema::new()
    }

    fn execute(&self, _params: serde_json::Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async move {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(ToolOutput::success(format!("call {}", n)))
        })
    }
}
