//! 请求 / 回复信封：各接入渠道（HTTP、Slack）与编排核心之间的统一形状

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::session::ConversationKey;

/// 回合的最终状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    /// 所有动作成功
    Ok,
    /// 部分成功（混合结果或某调用返回 partial）
    Partial,
    /// 整体失败
    Error,
}

/// 进入核心的一次用户请求
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    /// 会话标识（渠道 + 参与者）
    pub identity: ConversationKey,
    /// 用户的自然语言文本
    pub text: String,
    pub received_at: NaiveDateTime,
    /// 渠道回传提示（如 Slack 的 thread_ts），核心不解释只透传
    pub reply_hint: Option<String>,
}

impl IncomingRequest {
    pub fn new(identity: ConversationKey, text: impl Into<String>) -> Self {
        Self {
            identity,
            text: text.into(),
            received_at: chrono::Utc::now().naive_utc(),
            reply_hint: None,
        }
    }

    pub fn with_reply_hint(mut self, hint: impl Into<String>) -> Self {
        self.reply_hint = Some(hint.into());
        self
    }
}

/// 核心产出的最终回复
#[derive(Debug, Clone, Serialize)]
pub struct OutgoingResponse {
    pub text: String,
    pub status: ReplyStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_hint: Option<String>,
}
