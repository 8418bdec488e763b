//! 编排核心：信封、错误、路由、聚合、调度与回合状态机

pub mod aggregator;
pub mod envelope;
pub mod error;
pub mod orchestrator;
pub mod router;
pub mod scheduler;

pub use aggregator::Aggregator;
pub use envelope::{IncomingRequest, OutgoingResponse, ReplyStatus};
pub use error::AssistantError;
pub use orchestrator::Orchestrator;
pub use router::{RoutedAction, Router, RoutingDecision};
pub use scheduler::ToolScheduler;
