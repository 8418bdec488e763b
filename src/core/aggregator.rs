//! 聚合器：把本回合的结构化结果合成最终自然语言回复
//!
//! 合成交给 Oracle，规则写进 prompt：失败必须如实呈现，部分成功必须说清成败各是什么。
//! Oracle 不可用时用确定性降级：直接由结构化结果拼出朴素回复，回合照常产出。

use std::sync::Arc;

use serde_json::json;

use crate::core::envelope::ReplyStatus;
use crate::oracle::prompts::{local_now_string, synthesis_prompt};
use crate::oracle::{ChatMessage, Oracle};
use crate::session::ConversationSnapshot;
use crate::tools::{ToolCall, ToolResult, ToolStatus};

/// 注入合成 prompt 的历史轮数
const HISTORY_EXCERPT_TURNS: usize = 4;

/// 聚合器
pub struct Aggregator {
    oracle: Arc<dyn Oracle>,
}

impl Aggregator {
    pub fn new(oracle: Arc<dyn Oracle>) -> Self {
        Self { oracle }
    }

    /// 由工具结果合成回复；返回 (回复文本, 回合状态)
    pub async fn synthesize(
        &self,
        request: &str,
        results: &[(ToolCall, ToolResult)],
        snapshot: &ConversationSnapshot,
        notes: &[String],
    ) -> (String, ReplyStatus) {
        let status = turn_status(results, notes);

        let results_block = results_json(results);
        let notes_block = notes.join("\n");
        let local_now = local_now_string(snapshot.utc_offset_minutes);
        let prompt = synthesis_prompt(&results_block, &notes_block, &local_now);

        let mut messages = vec![ChatMessage::system(prompt)];
        let history = snapshot.history_excerpt(HISTORY_EXCERPT_TURNS);
        if !history.is_empty() {
            messages.push(ChatMessage::system(format!("Recent conversation:\n{history}")));
        }
        messages.push(ChatMessage::user(request.to_string()));

        match self.oracle.complete(&messages).await {
            Ok(reply) if !reply.trim().is_empty() => (reply.trim().to_string(), status),
            Ok(_) | Err(_) => {
                tracing::warn!("synthesis oracle unavailable, using deterministic fallback");
                (fallback_reply(results, notes), status)
            }
        }
    }
}

/// 回合状态：全部成功为 Ok；有附注或混合结果为 Partial；全部失败为 Error
fn turn_status(results: &[(ToolCall, ToolResult)], notes: &[String]) -> ReplyStatus {
    let any_failed = results.iter().any(|(_, r)| r.is_failed());
    let any_partial = results.iter().any(|(_, r)| r.status == ToolStatus::Partial);
    let any_ok = results.iter().any(|(_, r)| r.is_ok());

    if any_failed && !any_ok && !any_partial && !results.is_empty() {
        ReplyStatus::Error
    } else if any_failed || any_partial || !notes.is_empty() {
        ReplyStatus::Partial
    } else {
        ReplyStatus::Ok
    }
}

fn results_json(results: &[(ToolCall, ToolResult)]) -> String {
    let entries: Vec<serde_json::Value> = results
        .iter()
        .map(|(call, result)| {
            json!({
                "agent": call.agent,
                "operation": call.operation,
                "status": result.status,
                "payload": result.payload,
                "error": result.error,
            })
        })
        .collect();
    serde_json::to_string_pretty(&entries).unwrap_or_else(|_| "[]".to_string())
}

/// 确定性降级回复：不经 Oracle，从结构化结果直接拼出
fn fallback_reply(results: &[(ToolCall, ToolResult)], notes: &[String]) -> String {
    let mut lines = Vec::new();
    for (call, result) in results {
        match result.status {
            ToolStatus::Ok => {
                // 优先用 Agent 给出的人类可读摘要
                if let Some(summary) = result.payload.get("summary").and_then(|v| v.as_str()) {
                    lines.push(summary.to_string());
                } else {
                    lines.push(format!("Done: {} {}.", call.agent, call.operation));
                }
            }
            ToolStatus::Partial => {
                let why = result
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "part of it did not finish".to_string());
                lines.push(format!(
                    "I partly finished the {} {}: {why}",
                    call.agent, call.operation
                ));
            }
            ToolStatus::Failed => {
                let why = result
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "an unknown error occurred".to_string());
                lines.push(format!(
                    "I couldn't complete the {} {}: {why}",
                    call.agent, call.operation
                ));
            }
        }
    }
    lines.extend(notes.iter().cloned());
    if lines.is_empty() {
        "There is nothing to report for this request.".to_string()
    } else {
        lines.join("\n")
    }
}
