//! 推理 Oracle：客户端抽象、决策解析与 prompt 模板

pub mod decision;
pub mod mock;
pub mod openai;
pub mod prompts;
pub mod traits;

pub use decision::{decision_schema_json, parse_decision, OracleDecision, ProposedStep};
pub use mock::{FailingOracle, ScriptedOracle};
pub use openai::OpenAiOracle;
pub use traits::{ChatMessage, Oracle, OracleError, Role};
