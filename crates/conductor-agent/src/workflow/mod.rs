//! Workflow graphs: definition, validation, and execution.

pub mod condition;
pub mod context;
pub mod definition;
pub mod engine;
pub mod validator;

pub use condition::evaluate_condition;
pub use context::SharedContext;
pub use definition::{
    EdgeType, NodeKind, Position, RetryPolicy, WorkflowDefinition, WorkflowEdge, WorkflowNode,
};
pub use engine::{WorkflowEngine, WorkflowExecution, WorkflowStepExecution};
pub use validator::{validate, Severity, ValidationIssue, ValidationReport};
