//! 推理 Oracle 抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 Oracle trait；对核心而言 Oracle 是不透明的
//! 「prompt 进、文本出」服务，意图分解与回复起草都委托给它。

use async_trait::async_trait;
use thiserror::Error;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

/// 单条消息
#[derive(Clone, Debug)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Oracle 错误：对核心只有「暂不可用」一种语义，调用方必须能降级为固定回复
#[derive(Error, Debug)]
pub enum OracleError {
    #[error("oracle unavailable: {0}")]
    Unavailable(String),
}

/// 推理 Oracle trait
#[async_trait]
pub trait Oracle: Send + Sync {
    /// 非流式补全；失败只以 Unavailable 形式呈现
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, OracleError>;
}
