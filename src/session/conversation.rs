//! 会话模型
//!
//! Conversation 以 (channel, participant) 标识，持有回合历史、会话时区与可选的跨回合计划。
//! 内部时间一律 UTC-naive，会话时区仅在格式化时应用。

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{NaiveDateTime, Utc};
use serde_json::Value;

use crate::core::envelope::ReplyStatus;
use crate::tools::ToolCall;

/// 会话标识：渠道 + 参与者
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    pub channel: String,
    pub participant: String,
}

impl ConversationKey {
    pub fn new(channel: impl Into<String>, participant: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            participant: participant.into(),
        }
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.channel, self.participant)
    }
}

/// 一个已完成的回合：请求、发出的工具调用、最终回复
#[derive(Debug, Clone)]
pub struct Turn {
    pub id: String,
    pub request: String,
    pub calls: Vec<ToolCall>,
    pub reply: String,
    pub status: ReplyStatus,
    pub completed_at: NaiveDateTime,
}

impl Turn {
    pub fn new(request: impl Into<String>, calls: Vec<ToolCall>, reply: impl Into<String>, status: ReplyStatus) -> Self {
        Self {
            id: format!("turn_{}", uuid::Uuid::new_v4()),
            request: request.into(),
            calls,
            reply: reply.into(),
            status,
            completed_at: Utc::now().naive_utc(),
        }
    }
}

/// 计划中的一步：绑定一个 Agent 操作，参数可含 `{{stepN.path}}` 模板引用前序结果
#[derive(Debug, Clone)]
pub struct PlanStep {
    /// 步骤标识（step1、step2…），同时是结果缓存的键
    pub id: String,
    pub agent: String,
    pub operation: String,
    pub parameters: Value,
    /// 变更类步骤在建计划时即分配幂等键，跨回合重试不会重复生效
    pub idempotency_key: Option<String>,
}

/// 跨回合的多步计划：剩余步骤 + 前序结果缓存
#[derive(Debug, Clone)]
pub struct PendingPlan {
    pub id: String,
    /// 建计划时的原始请求，供后续回合与放弃提示引用
    pub goal: String,
    pub remaining: Vec<PlanStep>,
    /// 已完成步骤的结果缓存（step id -> payload）
    pub results: HashMap<String, Value>,
    pub created_at: Instant,
}

impl PendingPlan {
    pub fn new(goal: impl Into<String>, steps: Vec<PlanStep>) -> Self {
        Self {
            id: format!("plan_{}", uuid::Uuid::new_v4()),
            goal: goal.into(),
            remaining: steps,
            results: HashMap::new(),
            created_at: Instant::now(),
        }
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.created_at.elapsed() > timeout
    }
}

/// 单个会话：回合历史、时区、可选计划
#[derive(Debug, Clone)]
pub struct Conversation {
    pub key: ConversationKey,
    pub turns: Vec<Turn>,
    /// 会话时区（相对 UTC 的分钟偏移），格式化时应用
    pub utc_offset_minutes: i32,
    pub pending_plan: Option<PendingPlan>,
    pub last_active: Instant,
    pub created_at: Instant,
}

impl Conversation {
    pub fn new(key: ConversationKey, utc_offset_minutes: i32) -> Self {
        Self {
            key,
            turns: Vec::new(),
            utc_offset_minutes,
            pending_plan: None,
            last_active: Instant::now(),
            created_at: Instant::now(),
        }
    }

    /// 追加回合并按上限剪枝最旧历史
    pub fn push_turn(&mut self, turn: Turn, max_history_turns: usize) {
        self.turns.push(turn);
        if self.turns.len() > max_history_turns {
            let drop = self.turns.len() - max_history_turns;
            self.turns.drain(..drop);
        }
        self.last_active = Instant::now();
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.last_active.elapsed() > timeout
    }

    /// 只读快照（Router / Aggregator 消费；变更一律经 store 提交）
    pub fn snapshot(&self) -> ConversationSnapshot {
        ConversationSnapshot {
            key: self.key.clone(),
            turns: self.turns.clone(),
            utc_offset_minutes: self.utc_offset_minutes,
            pending_plan: self.pending_plan.clone(),
        }
    }
}

/// Router / Aggregator 读取的会话快照
#[derive(Debug, Clone)]
pub struct ConversationSnapshot {
    pub key: ConversationKey,
    pub turns: Vec<Turn>,
    pub utc_offset_minutes: i32,
    pub pending_plan: Option<PendingPlan>,
}

impl ConversationSnapshot {
    /// 压缩近期历史为文本摘录，注入 Oracle prompt
    pub fn history_excerpt(&self, max_turns: usize) -> String {
        let start = self.turns.len().saturating_sub(max_turns);
        self.turns[start..]
            .iter()
            .map(|t| format!("user: {}\nassistant: {}", t.request, t.reply))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_turn_prunes_history() {
        let mut convo = Conversation::new(ConversationKey::new("api", "u1"), 0);
        for i in 0..5 {
            convo.push_turn(
                Turn::new(format!("q{i}"), vec![], format!("a{i}"), ReplyStatus::Ok),
                3,
            );
        }
        assert_eq!(convo.turns.len(), 3);
        assert_eq!(convo.turns[0].request, "q2");
    }

    #[test]
    fn test_history_excerpt_takes_recent_turns() {
        let mut convo = Conversation::new(ConversationKey::new("api", "u1"), 0);
        for i in 0..4 {
            convo.push_turn(
                Turn::new(format!("q{i}"), vec![], format!("a{i}"), ReplyStatus::Ok),
                10,
            );
        }
        let excerpt = convo.snapshot().history_excerpt(2);
        assert!(excerpt.contains("q2"));
        assert!(excerpt.contains("q3"));
        assert!(!excerpt.contains("q1"));
    }
}
