//! Mock Oracle（用于测试，无需 API）
//!
//! ScriptedOracle 按队列返回预置回复；队列耗尽后回显最后一条 User 消息。
//! FailingOracle 恒定不可用，用于验证降级路径。

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::oracle::traits::{ChatMessage, Oracle, OracleError, Role};

/// 脚本化 Mock：依次弹出预置回复
#[derive(Default)]
pub struct ScriptedOracle {
    responses: Mutex<VecDeque<String>>,
}

impl ScriptedOracle {
    pub fn new(responses: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
        }
    }

    pub async fn push(&self, response: impl Into<String>) {
        self.responses.lock().await.push_back(response.into());
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, OracleError> {
        if let Some(next) = self.responses.lock().await.pop_front() {
            return Ok(next);
        }
        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        Ok(format!("Echo from Mock: {last_user}"))
    }
}

/// 恒定失败的 Mock：模拟 Oracle 不可用
#[derive(Debug, Default)]
pub struct FailingOracle;

#[async_trait]
impl Oracle for FailingOracle {
    async fn complete(&self, _messages: &[ChatMessage]) -> Result<String, OracleError> {
        Err(OracleError::Unavailable("mock outage".to_string()))
    }
}
