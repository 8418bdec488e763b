//! 决策解析：将 Oracle 的原始输出解析为封闭决策集
//!
//! 任何后续逻辑只消费 OracleDecision 枚举，绝不直接在自由文本上分支。
//! 线格式（schemars 生成 Schema 注入路由 prompt，减少格式错误）：
//! `{"mode": "direct"|"tools", "reply": "...", "steps": [{"agent", "operation", "parameters", "depends_on_previous"}]}`

use schemars::{schema_for, JsonSchema};
use serde::Deserialize;
use serde_json::Value;

use crate::core::error::AssistantError;

/// Oracle 提议的一步调用（尚未经能力清单校验）
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ProposedStep {
    /// 目标 Agent 名（email / calendar / weather / search）
    pub agent: String,
    /// 操作名（须在该 Agent 的操作集合内）
    pub operation: String,
    /// 具名参数；串行计划中可用 "{{stepN.path.to.field}}" 引用前序步骤结果
    #[serde(default)]
    pub parameters: Value,
    /// true 表示本步依赖上一步的输出（串行标记）
    #[serde(default)]
    pub depends_on_previous: bool,
}

/// Oracle 决策的线格式
#[derive(Debug, Deserialize, JsonSchema)]
struct RawDecision {
    /// "direct"：无需工具直接作答；"tools"：提议一或多步工具调用；
    /// "unsupported"：请求需要清单外的能力，reply 说明无法代办
    mode: String,
    /// mode = direct 时的回复文本
    #[serde(default)]
    reply: Option<String>,
    #[serde(default)]
    steps: Vec<ProposedStep>,
}

/// 解析后的封闭决策集
#[derive(Debug, Clone)]
pub enum OracleDecision {
    /// 不调用工具，直接回复
    DirectAnswer(String),
    /// 单步调用
    SingleToolCall(ProposedStep),
    /// 多步独立调用，并发执行
    ParallelToolCalls(Vec<ProposedStep>),
    /// 多步依赖调用，建 PendingPlan 逐步执行
    SequentialPlan(Vec<ProposedStep>),
    /// 请求需要清单外的能力，携带面向用户的说明
    UnsupportedCapability(String),
}

/// 返回决策线格式的 JSON Schema 字符串，拼入路由 prompt
pub fn decision_schema_json() -> String {
    let schema = schema_for!(RawDecision);
    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| String::new())
}

/// 从 Oracle 输出中提取 JSON 块（```json ... ``` 或首尾大括号之间）
fn extract_json(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(
            rest.find("```")
                .map(|end| rest[..end].trim())
                .unwrap_or_else(|| rest.trim()),
        );
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

/// 解析 Oracle 输出
///
/// - 不含 JSON：整段当作直答
/// - mode = unsupported：请求超出能力清单
/// - mode = direct 或 steps 为空：直答
/// - 任一步带 depends_on_previous：串行计划
/// - 多步且无依赖标记：默认并行；sequential_by_default 为 true 时按串行处理
pub fn parse_decision(
    output: &str,
    sequential_by_default: bool,
) -> Result<OracleDecision, AssistantError> {
    let Some(json_str) = extract_json(output) else {
        return Ok(OracleDecision::DirectAnswer(output.trim().to_string()));
    };

    let raw: RawDecision = serde_json::from_str(json_str)
        .map_err(|e| AssistantError::MalformedDecision(format!("{e}: {json_str}")))?;

    if raw.mode == "unsupported" {
        let reply = raw
            .reply
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| "I don't have a capability for that yet.".to_string());
        return Ok(OracleDecision::UnsupportedCapability(reply));
    }

    if raw.mode == "direct" || raw.steps.is_empty() {
        let reply = raw
            .reply
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| output.trim().to_string());
        return Ok(OracleDecision::DirectAnswer(reply));
    }

    let dependent = raw.steps.iter().any(|s| s.depends_on_previous);
    let mut steps = raw.steps;

    if steps.len() == 1 {
        return Ok(OracleDecision::SingleToolCall(steps.remove(0)));
    }
    if dependent || sequential_by_default {
        Ok(OracleDecision::SequentialPlan(steps))
    } else {
        Ok(OracleDecision::ParallelToolCalls(steps))
    }
}
