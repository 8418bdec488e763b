//! 会话层：Conversation / Turn / PendingPlan 模型与存储原语

pub mod conversation;
pub mod store;

pub use conversation::{
    Conversation, ConversationKey, ConversationSnapshot, PendingPlan, PlanStep, Turn,
};
pub use store::{MemorySessionStore, PlanUpdate, SessionStore, StoreError, TurnCommit};
