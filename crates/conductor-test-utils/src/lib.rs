//! Test doubles shared across the workspace.

mod client;
mod clock;
mod fixtures;
mod tools;

pub use client::{Reply, ScriptedClient};
pub use clock::ManualClock;
pub use fixtures::{linear_workflow_json, test_model_config};
pub use tools::{CountingTool, EchoTool, FailingTool, PanickyTool};
