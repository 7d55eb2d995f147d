pub mod executor;
pub mod governance;
pub mod prompt;
pub mod protocol;
pub mod store;
pub mod workflow;

pub use executor::AgentExecutor;
pub use governance::{GovernanceManager, ToolRequest};
pub use protocol::{parse_response, ParsedResponse};
pub use store::GovernanceStore;
pub use workflow::{
    validate, SharedContext, ValidationReport, WorkflowDefinition, WorkflowEngine,
    WorkflowExecution,
};
