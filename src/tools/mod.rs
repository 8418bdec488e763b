//! 统一工具契约层：ToolCall / ToolResult 形状、Agent 注册表、执行器

pub mod contract;
pub mod executor;
pub mod registry;

pub use contract::{
    AgentReply, CapabilityAgent, OperationSpec, ProviderError, ToolCall, ToolError, ToolErrorKind,
    ToolResult, ToolStatus,
};
pub use executor::ToolExecutor;
pub use registry::AgentRegistry;
