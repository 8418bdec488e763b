//! 路由器：把一次用户请求变为本回合的行动决定
//!
//! 算法：
//! 1. 快照里有 PendingPlan：先检查超时，再试绑定下一步模板；绑定失败（前序结果缺失）
//!    则放弃计划并附注说明，落回第 2 步
//! 2. 否则咨询 Oracle（能力清单 + 近期历史 + 本地时间），解析为封闭决策集
//! 3. 依赖步骤建 PendingPlan（变更步骤此时即分配幂等键），独立步骤并发发出
//! 4. 提议了清单外的能力：丢弃该调用并附注说明，绝不猜测
//!
//! Oracle 不可用时降级为固定回复，回合照常产出。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::core::envelope::ReplyStatus;
use crate::core::error::AssistantError;
use crate::oracle::prompts::{local_now_string, routing_prompt, SERVICE_UNAVAILABLE_REPLY};
use crate::oracle::{parse_decision, ChatMessage, Oracle, OracleDecision, ProposedStep};
use crate::session::{ConversationSnapshot, PendingPlan, PlanStep};
use crate::tools::{AgentRegistry, ToolCall};

/// 注入路由 prompt 的历史轮数
const HISTORY_EXCERPT_TURNS: usize = 6;

/// 本回合的行动
#[derive(Debug)]
pub enum RoutedAction {
    /// 不调用工具，直接回复
    Direct { reply: String, status: ReplyStatus },
    /// 独立调用集合，并发执行
    Invoke(Vec<ToolCall>),
    /// 串行计划；调用方经 next_ready_call 逐步取已绑定的调用
    Plan(PendingPlan),
}

/// 路由决定：行动 + 面向用户的附注 + 是否清除既有计划
#[derive(Debug)]
pub struct RoutingDecision {
    pub action: RoutedAction,
    /// 聚合时如实转述给用户的说明（计划放弃、不支持的能力等）
    pub notes: Vec<String>,
    /// true 表示既有 PendingPlan 应在本回合提交时清除（已放弃或超时）
    pub clear_plan: bool,
}

/// 路由器
pub struct Router {
    oracle: Arc<dyn Oracle>,
    registry: Arc<AgentRegistry>,
    sequential_by_default: bool,
    plan_timeout: Duration,
}

impl Router {
    pub fn new(
        oracle: Arc<dyn Oracle>,
        registry: Arc<AgentRegistry>,
        sequential_by_default: bool,
        plan_timeout: Duration,
    ) -> Self {
        Self {
            oracle,
            registry,
            sequential_by_default,
            plan_timeout,
        }
    }

    /// 决定本回合的行动
    pub async fn decide(&self, text: &str, snapshot: &ConversationSnapshot) -> RoutingDecision {
        let mut notes = Vec::new();
        let mut clear_plan = false;

        if let Some(plan) = &snapshot.pending_plan {
            if plan.is_expired(self.plan_timeout) {
                tracing::info!(plan_id = %plan.id, "pending plan expired");
                notes.push(format!(
                    "The earlier task \"{}\" sat unfinished too long and was dropped.",
                    plan.goal
                ));
                clear_plan = true;
            } else {
                // 试绑定验证：下一步的前序引用必须可解析
                let mut probe = plan.clone();
                match next_ready_call(&mut probe) {
                    Ok(Some(_)) => {
                        return RoutingDecision {
                            action: RoutedAction::Plan(plan.clone()),
                            notes,
                            clear_plan: false,
                        };
                    }
                    Ok(None) => {
                        clear_plan = true;
                    }
                    Err(e) => {
                        tracing::warn!(plan_id = %plan.id, error = %e, "abandoning pending plan");
                        notes.push(format!(
                            "I had to abandon the earlier task \"{}\" because an earlier step's result is missing.",
                            plan.goal
                        ));
                        clear_plan = true;
                    }
                }
            }
        }

        let decision = self.consult_oracle(text, snapshot).await;
        let decision = match decision {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, "oracle consult failed, degrading to fixed reply");
                return RoutingDecision {
                    action: RoutedAction::Direct {
                        reply: SERVICE_UNAVAILABLE_REPLY.to_string(),
                        status: ReplyStatus::Error,
                    },
                    notes,
                    clear_plan,
                };
            }
        };

        let action = match decision {
            OracleDecision::DirectAnswer(reply) => RoutedAction::Direct {
                reply,
                status: ReplyStatus::Ok,
            },
            OracleDecision::UnsupportedCapability(message) => RoutedAction::Direct {
                reply: message,
                status: ReplyStatus::Partial,
            },
            OracleDecision::SingleToolCall(step) => {
                let calls = self.validate_steps(vec![step], &mut notes);
                if calls.is_empty() {
                    self.unsupported_fallback(&notes)
                } else {
                    RoutedAction::Invoke(calls)
                }
            }
            OracleDecision::ParallelToolCalls(steps) => {
                let calls = self.validate_steps(steps, &mut notes);
                if calls.is_empty() {
                    self.unsupported_fallback(&notes)
                } else {
                    RoutedAction::Invoke(calls)
                }
            }
            OracleDecision::SequentialPlan(steps) => {
                // 串行计划里任何一步不被支持都会断链，整体落回直答
                if steps
                    .iter()
                    .any(|s| !self.registry.supports(&s.agent, &s.operation))
                {
                    let offending = steps
                        .iter()
                        .find(|s| !self.registry.supports(&s.agent, &s.operation));
                    if let Some(s) = offending {
                        notes.push(unsupported_note(&s.agent, &s.operation));
                    }
                    self.unsupported_fallback(&notes)
                } else {
                    RoutedAction::Plan(self.build_plan(text, steps))
                }
            }
        };

        RoutingDecision {
            action,
            notes,
            clear_plan,
        }
    }

    async fn consult_oracle(
        &self,
        text: &str,
        snapshot: &ConversationSnapshot,
    ) -> Result<OracleDecision, AssistantError> {
        let manifest = self.registry.manifest_json();
        let history = snapshot.history_excerpt(HISTORY_EXCERPT_TURNS);
        let local_now = local_now_string(snapshot.utc_offset_minutes);
        let prompt = routing_prompt(&manifest, &history, &local_now);

        let messages = [ChatMessage::system(prompt), ChatMessage::user(text)];
        let output = self
            .oracle
            .complete(&messages)
            .await
            .map_err(|e| AssistantError::OracleUnavailable(e.to_string()))?;

        // 解析不动的输出当作直答：对话式回复里夹杂大括号不应触发降级固定回复
        match parse_decision(&output, self.sequential_by_default) {
            Ok(decision) => Ok(decision),
            Err(e) => {
                tracing::warn!(error = %e, "oracle output unparsable, treating as direct answer");
                Ok(OracleDecision::DirectAnswer(output.trim().to_string()))
            }
        }
    }

    /// 清单校验：丢弃清单外的调用并附注；为变更类调用分配幂等键
    fn validate_steps(&self, steps: Vec<ProposedStep>, notes: &mut Vec<String>) -> Vec<ToolCall> {
        let mut calls = Vec::new();
        for step in steps {
            if !self.registry.supports(&step.agent, &step.operation) {
                tracing::warn!(agent = %step.agent, operation = %step.operation, "dropping unsupported tool call");
                notes.push(unsupported_note(&step.agent, &step.operation));
                continue;
            }
            let mut call = ToolCall::new(step.agent, step.operation, step.parameters);
            if self.is_mutating(&call) {
                call = call.with_idempotency_key(uuid::Uuid::new_v4().to_string());
            }
            calls.push(call);
        }
        calls
    }

    fn is_mutating(&self, call: &ToolCall) -> bool {
        self.registry
            .operation(&call.agent, &call.operation)
            .map(|spec| spec.mutating)
            .unwrap_or(false)
    }

    /// 所有候选调用都被丢弃时的直答
    fn unsupported_fallback(&self, notes: &[String]) -> RoutedAction {
        let reply = notes
            .last()
            .cloned()
            .unwrap_or_else(|| "I can't help with that capability yet.".to_string());
        RoutedAction::Direct {
            reply,
            status: ReplyStatus::Partial,
        }
    }

    /// 把 Oracle 的依赖步骤序列变为 PendingPlan；变更步骤此时分配幂等键
    fn build_plan(&self, goal: &str, steps: Vec<ProposedStep>) -> PendingPlan {
        let steps: Vec<PlanStep> = steps
            .into_iter()
            .enumerate()
            .map(|(i, step)| {
                let mutating = self
                    .registry
                    .operation(&step.agent, &step.operation)
                    .map(|spec| spec.mutating)
                    .unwrap_or(false);
                PlanStep {
                    id: format!("step{}", i + 1),
                    agent: step.agent,
                    operation: step.operation,
                    parameters: step.parameters,
                    idempotency_key: mutating.then(|| uuid::Uuid::new_v4().to_string()),
                }
            })
            .collect();
        PendingPlan::new(goal, steps)
    }
}

fn unsupported_note(agent: &str, operation: &str) -> String {
    format!("I don't have a \"{operation}\" capability for {agent}, so I skipped that part.")
}

/// 取计划中下一个就绪调用：弹出首个剩余步骤并绑定其模板参数
///
/// 返回 (step_id, ToolCall)；剩余为空返回 None；前序结果缺失返回 PlanAbandoned。
pub fn next_ready_call(plan: &mut PendingPlan) -> Result<Option<(String, ToolCall)>, AssistantError> {
    if plan.remaining.is_empty() {
        return Ok(None);
    }
    let step = plan.remaining.remove(0);
    let bound = bind_templates(&step.parameters, &plan.results).map_err(|e| {
        AssistantError::PlanAbandoned(format!("step {} of plan {}: {e}", step.id, plan.id))
    })?;
    let mut call = ToolCall::new(step.agent, step.operation, bound);
    if let Some(key) = step.idempotency_key {
        call = call.with_idempotency_key(key);
    }
    Ok(Some((step.id, call)))
}

/// 参数值里是否还有未绑定的 `{{...}}` 占位符
pub fn has_placeholders(value: &Value) -> bool {
    match value {
        Value::String(s) => s.contains("{{") && s.contains("}}"),
        Value::Array(items) => items.iter().any(has_placeholders),
        Value::Object(map) => map.values().any(has_placeholders),
        _ => false,
    }
}

/// 递归绑定 `{{stepN.path.to.field}}` 模板
///
/// 整串恰为一个占位符时以原始类型替换；嵌在更长字符串里时以标量文本替换。
fn bind_templates(value: &Value, results: &HashMap<String, Value>) -> Result<Value, String> {
    match value {
        Value::String(s) => bind_string(s, results),
        Value::Array(items) => items
            .iter()
            .map(|v| bind_templates(v, results))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| bind_templates(v, results).map(|v| (k.clone(), v)))
            .collect::<Result<serde_json::Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

fn bind_string(s: &str, results: &HashMap<String, Value>) -> Result<Value, String> {
    let trimmed = s.trim();
    // 整串恰为一个占位符：保留被引用值的类型
    if trimmed.starts_with("{{") && trimmed.ends_with("}}") && trimmed.matches("{{").count() == 1 {
        let path = trimmed[2..trimmed.len() - 2].trim();
        return resolve_path(path, results).cloned();
    }

    let mut out = String::new();
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        let Some(end_rel) = rest[start..].find("}}") else {
            break;
        };
        out.push_str(&rest[..start]);
        let path = rest[start + 2..start + end_rel].trim();
        let resolved = resolve_path(path, results)?;
        match resolved {
            Value::String(v) => out.push_str(v),
            scalar => out.push_str(&scalar.to_string()),
        }
        rest = &rest[start + end_rel + 2..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

/// 解析 "step1.messages.0.subject" 形式的路径；首段为步骤 id，数字段索引数组
fn resolve_path<'a>(path: &str, results: &'a HashMap<String, Value>) -> Result<&'a Value, String> {
    let mut segments = path.split('.');
    let step_id = segments
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "empty template path".to_string())?;
    let mut cur = results
        .get(step_id)
        .ok_or_else(|| format!("no cached result for '{step_id}'"))?;
    for segment in segments {
        cur = match (cur, segment.parse::<usize>()) {
            (Value::Array(items), Ok(idx)) => items
                .get(idx)
                .ok_or_else(|| format!("index {idx} out of range in '{path}'"))?,
            (other, _) => other
                .get(segment)
                .ok_or_else(|| format!("missing field '{segment}' in '{path}'"))?,
        };
    }
    Ok(cur)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{FailingOracle, ScriptedOracle};
    use crate::session::ConversationKey;
    use crate::tools::contract::{AgentReply, CapabilityAgent, OperationSpec, ProviderError};
    use async_trait::async_trait;
    use serde_json::json;

    struct StubAgent {
        name: &'static str,
        ops: Vec<(&'static str, bool)>,
    }

    #[async_trait]
    impl CapabilityAgent for StubAgent {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "stub"
        }

        fn operations(&self) -> Vec<OperationSpec> {
            self.ops
                .iter()
                .map(|(op, mutating)| OperationSpec {
                    name: op,
                    description: "stub op",
                    parameters: json!({"type": "object"}),
                    mutating: *mutating,
                })
                .collect()
        }

        async fn invoke(&self, _op: &str, _params: &Value) -> Result<AgentReply, ProviderError> {
            Ok(AgentReply::Complete(Value::Null))
        }
    }

    fn registry() -> Arc<AgentRegistry> {
        let mut registry = AgentRegistry::new();
        registry.register(StubAgent {
            name: "weather",
            ops: vec![("forecast", false), ("current", false)],
        });
        registry.register(StubAgent {
            name: "calendar",
            ops: vec![("create", true), ("list", false)],
        });
        registry.register(StubAgent {
            name: "email",
            ops: vec![("search", false), ("send", true)],
        });
        Arc::new(registry)
    }

    fn router(oracle: Arc<dyn Oracle>) -> Router {
        Router::new(oracle, registry(), false, Duration::from_secs(1800))
    }

    fn snapshot() -> ConversationSnapshot {
        ConversationSnapshot {
            key: ConversationKey::new("api", "u1"),
            turns: vec![],
            utc_offset_minutes: 0,
            pending_plan: None,
        }
    }

    #[tokio::test]
    async fn test_single_tool_call_routed() {
        let oracle = Arc::new(ScriptedOracle::new([json!({
            "mode": "tools",
            "steps": [{"agent": "weather", "operation": "forecast",
                       "parameters": {"location": "Hanoi", "day_offset": 1}}]
        })
        .to_string()]));
        let decision = router(oracle).decide("weather in Hanoi tomorrow?", &snapshot()).await;
        match decision.action {
            RoutedAction::Invoke(calls) => {
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].agent, "weather");
                assert_eq!(calls[0].parameters["day_offset"], 1);
                assert!(calls[0].idempotency_key.is_none());
            }
            other => panic!("expected Invoke, got {other:?}"),
        }
        assert!(decision.notes.is_empty());
    }

    #[tokio::test]
    async fn test_mutating_call_gets_idempotency_key() {
        let oracle = Arc::new(ScriptedOracle::new([json!({
            "mode": "tools",
            "steps": [{"agent": "calendar", "operation": "create",
                       "parameters": {"title": "Standup", "start": "2026-08-25T09:00"}}]
        })
        .to_string()]));
        let decision = router(oracle).decide("book a standup", &snapshot()).await;
        match decision.action {
            RoutedAction::Invoke(calls) => assert!(calls[0].idempotency_key.is_some()),
            other => panic!("expected Invoke, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unsupported_capability_dropped_with_note() {
        let oracle = Arc::new(ScriptedOracle::new([json!({
            "mode": "tools",
            "steps": [{"agent": "music", "operation": "play", "parameters": {}}]
        })
        .to_string()]));
        let decision = router(oracle).decide("play some jazz", &snapshot()).await;
        match decision.action {
            RoutedAction::Direct { status, .. } => assert_eq!(status, ReplyStatus::Partial),
            other => panic!("expected Direct fallback, got {other:?}"),
        }
        assert_eq!(decision.notes.len(), 1);
    }

    #[tokio::test]
    async fn test_dependent_steps_become_plan() {
        let oracle = Arc::new(ScriptedOracle::new([json!({
            "mode": "tools",
            "steps": [
                {"agent": "email", "operation": "search", "parameters": {"query": "deadline"}},
                {"agent": "calendar", "operation": "create",
                 "parameters": {"title": "{{step1.messages.0.subject}}",
                                "start": "{{step1.messages.0.received_at}}"},
                 "depends_on_previous": true}
            ]
        })
        .to_string()]));
        let decision = router(oracle)
            .decide("find the deadline email and add it to my calendar", &snapshot())
            .await;
        match decision.action {
            RoutedAction::Plan(plan) => {
                assert_eq!(plan.remaining.len(), 2);
                assert!(plan.remaining[0].idempotency_key.is_none());
                // 变更步骤建计划时即持有幂等键
                assert!(plan.remaining[1].idempotency_key.is_some());
            }
            other => panic!("expected Plan, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unparsable_oracle_output_becomes_direct_answer() {
        // 对话式回复里夹着大括号：不应变成「暂时无法处理」
        let text = "Sure! A JSON object looks like {\"key\": ...} and has braces.";
        let oracle = Arc::new(ScriptedOracle::new([text]));
        let decision = router(oracle).decide("what is JSON?", &snapshot()).await;
        match decision.action {
            RoutedAction::Direct { reply, status } => {
                assert_eq!(reply, text);
                assert_eq!(status, ReplyStatus::Ok);
            }
            other => panic!("expected Direct, got {other:?}"),
        }
        assert!(decision.notes.is_empty());
    }

    #[tokio::test]
    async fn test_oracle_unavailable_degrades() {
        let decision = router(Arc::new(FailingOracle))
            .decide("anything", &snapshot())
            .await;
        match decision.action {
            RoutedAction::Direct { reply, status } => {
                assert_eq!(reply, SERVICE_UNAVAILABLE_REPLY);
                assert_eq!(status, ReplyStatus::Error);
            }
            other => panic!("expected Direct, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_expired_plan_cleared_with_note() {
        let oracle = Arc::new(ScriptedOracle::new([
            json!({"mode": "direct", "reply": "hi"}).to_string()
        ]));
        let router = Router::new(oracle, registry(), false, Duration::from_millis(0));

        let mut snap = snapshot();
        snap.pending_plan = Some(PendingPlan::new(
            "old goal",
            vec![PlanStep {
                id: "step1".to_string(),
                agent: "email".to_string(),
                operation: "search".to_string(),
                parameters: json!({"query": "x"}),
                idempotency_key: None,
            }],
        ));
        std::thread::sleep(Duration::from_millis(5));

        let decision = router.decide("hello", &snap).await;
        assert!(decision.clear_plan);
        assert_eq!(decision.notes.len(), 1);
        assert!(matches!(decision.action, RoutedAction::Direct { .. }));
    }

    #[tokio::test]
    async fn test_pending_plan_resumed() {
        let router = router(Arc::new(FailingOracle));
        let mut snap = snapshot();
        snap.pending_plan = Some(PendingPlan::new(
            "goal",
            vec![PlanStep {
                id: "step2".to_string(),
                agent: "calendar".to_string(),
                operation: "list".to_string(),
                parameters: json!({"from": "2026-08-25T00:00", "to": "2026-08-26T00:00"}),
                idempotency_key: None,
            }],
        ));

        // Oracle 不可达也无妨：恢复计划不经过 Oracle
        let decision = router.decide("continue", &snap).await;
        assert!(matches!(decision.action, RoutedAction::Plan(_)));
        assert!(!decision.clear_plan);
    }

    #[test]
    fn test_next_ready_call_binds_templates() {
        let mut plan = PendingPlan::new(
            "goal",
            vec![PlanStep {
                id: "step2".to_string(),
                agent: "calendar".to_string(),
                operation: "create".to_string(),
                parameters: json!({
                    "title": "Re: {{step1.messages.0.subject}}",
                    "start": "{{step1.messages.0.received_at}}"
                }),
                idempotency_key: Some("key-1".to_string()),
            }],
        );
        plan.results.insert(
            "step1".to_string(),
            json!({"messages": [{"subject": "Q3 deadline", "received_at": "2026-08-29T10:00:00"}]}),
        );

        let (step_id, call) = next_ready_call(&mut plan).unwrap().unwrap();
        assert_eq!(step_id, "step2");
        assert_eq!(call.parameters["title"], "Re: Q3 deadline");
        assert_eq!(call.parameters["start"], "2026-08-29T10:00:00");
        assert_eq!(call.idempotency_key.as_deref(), Some("key-1"));
        assert!(plan.remaining.is_empty());
    }

    #[test]
    fn test_next_ready_call_missing_result_abandons() {
        let mut plan = PendingPlan::new(
            "goal",
            vec![PlanStep {
                id: "step2".to_string(),
                agent: "calendar".to_string(),
                operation: "create".to_string(),
                parameters: json!({"title": "{{step1.subject}}"}),
                idempotency_key: None,
            }],
        );
        let err = next_ready_call(&mut plan).unwrap_err();
        assert!(matches!(err, AssistantError::PlanAbandoned(_)));
    }

    #[test]
    fn test_whole_placeholder_preserves_type() {
        let mut results = HashMap::new();
        results.insert("step1".to_string(), json!({"count": 3}));
        let bound = bind_templates(&json!({"n": "{{step1.count}}"}), &results).unwrap();
        assert_eq!(bound["n"], 3);
    }

    #[test]
    fn test_has_placeholders() {
        assert!(has_placeholders(&json!({"a": "{{step1.x}}"})));
        assert!(!has_placeholders(&json!({"a": "plain", "b": [1, 2]})));
    }
}
