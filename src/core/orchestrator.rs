//! 编排器：一个回合的状态机
//!
//! Received → Routing → ToolExecuting(0..n) → Aggregating → Committed。
//! 回合许可保证同一会话串行（先到先处理）；独立调用并发执行，受调度器限流；
//! 计划步骤严格串行，步骤失败即放弃计划，后续步骤绝不触达。
//! 提交失败（Aborted）不阻塞回复送达：回合暂存，下一回合提交时重试。
//! 取消的回合照常执行完变更类调用并提交，只是不送达回复。

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::core::aggregator::Aggregator;
use crate::core::envelope::{IncomingRequest, OutgoingResponse, ReplyStatus};
use crate::core::router::{has_placeholders, next_ready_call, RoutedAction, Router};
use crate::core::scheduler::ToolScheduler;
use crate::session::{ConversationKey, PendingPlan, PlanUpdate, SessionStore, Turn, TurnCommit};
use crate::tools::{ToolCall, ToolExecutor, ToolResult};

/// 编排器
pub struct Orchestrator {
    router: Router,
    aggregator: Aggregator,
    executor: Arc<ToolExecutor>,
    scheduler: Arc<ToolScheduler>,
    store: Arc<dyn SessionStore>,
    /// Aborted 回合：提交失败后整个 TurnCommit 暂存（计划处置与时区一并保留），
    /// 下一回合提交时按原顺序先行重试
    stashed: Mutex<HashMap<ConversationKey, Vec<TurnCommit>>>,
}

impl Orchestrator {
    pub fn new(
        router: Router,
        aggregator: Aggregator,
        executor: Arc<ToolExecutor>,
        scheduler: Arc<ToolScheduler>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            router,
            aggregator,
            executor,
            scheduler,
            store,
            stashed: Mutex::new(HashMap::new()),
        }
    }

    /// 处理一次请求；取消时返回 None（回合照常提交，回复不送达）
    pub async fn handle(
        &self,
        request: IncomingRequest,
        cancel: CancellationToken,
    ) -> Option<OutgoingResponse> {
        // 同一会话的回合许可按到达顺序发放
        let _permit = self.store.turn_permit(&request.identity).await;
        let snapshot = self.store.snapshot(&request.identity).await;
        tracing::debug!(key = %request.identity, "turn started");

        let decision = self.router.decide(&request.text, &snapshot).await;
        let mut notes = decision.notes;
        let base_plan_update = if decision.clear_plan {
            PlanUpdate::Clear
        } else {
            PlanUpdate::Keep
        };

        let (reply, status, calls, plan_update) = match decision.action {
            RoutedAction::Direct { reply, status } => {
                // 与聚合器同规则：有附注的回合至多 Partial
                let (reply, status) = if notes.is_empty() {
                    (reply, status)
                } else {
                    let status = match status {
                        ReplyStatus::Ok => ReplyStatus::Partial,
                        other => other,
                    };
                    (format!("{}\n{reply}", notes.join("\n")), status)
                };
                (reply, status, Vec::new(), base_plan_update)
            }
            RoutedAction::Invoke(calls) => {
                let results = self.execute_concurrently(&calls).await;
                let (reply, status) = self
                    .aggregator
                    .synthesize(&request.text, &results, &snapshot, &notes)
                    .await;
                (reply, status, calls, base_plan_update)
            }
            RoutedAction::Plan(plan) => {
                let (results, plan_update) = self.drive_plan(plan, &mut notes).await;
                let calls: Vec<ToolCall> = results.iter().map(|(c, _)| c.clone()).collect();
                let (reply, status) = self
                    .aggregator
                    .synthesize(&request.text, &results, &snapshot, &notes)
                    .await;
                (reply, status, calls, plan_update)
            }
        };

        let turn = Turn::new(request.text.clone(), calls, reply.clone(), status);
        self.commit_with_stash(&request.identity, turn, plan_update)
            .await;

        if ToolScheduler::is_cancelled(&cancel) {
            tracing::info!(key = %request.identity, "turn cancelled, discarding reply");
            return None;
        }
        Some(OutgoingResponse {
            text: reply,
            status,
            reply_hint: request.reply_hint,
        })
    }

    /// 独立调用并发执行；调度器限制并发度
    async fn execute_concurrently(&self, calls: &[ToolCall]) -> Vec<(ToolCall, ToolResult)> {
        let futures = calls.iter().map(|call| {
            let executor = self.executor.clone();
            let scheduler = self.scheduler.clone();
            let call = call.clone();
            async move {
                let _permit = scheduler.acquire_tool().await;
                let result = executor.invoke(&call).await;
                (call, result)
            }
        });
        join_all(futures).await
    }

    /// 驱动串行计划
    ///
    /// 每回合至少执行一步；后续步骤若不含模板占位符则同回合继续执行，
    /// 否则剩余部分存回会话，下一回合恢复。任一步失败即放弃整个计划。
    async fn drive_plan(
        &self,
        mut plan: PendingPlan,
        notes: &mut Vec<String>,
    ) -> (Vec<(ToolCall, ToolResult)>, PlanUpdate) {
        let mut results = Vec::new();

        loop {
            let (step_id, call) = match next_ready_call(&mut plan) {
                Ok(Some(next)) => next,
                Ok(None) => {
                    tracing::info!(plan_id = %plan.id, "plan completed");
                    return (results, PlanUpdate::Clear);
                }
                Err(e) => {
                    tracing::warn!(plan_id = %plan.id, error = %e, "plan abandoned mid-turn");
                    notes.push(format!(
                        "I had to stop the task \"{}\" because a needed earlier result is missing.",
                        plan.goal
                    ));
                    return (results, PlanUpdate::Clear);
                }
            };

            let _permit = self.scheduler.acquire_tool().await;
            let result = self.executor.invoke(&call).await;
            let failed = result.is_failed();
            let payload = result.payload.clone();
            results.push((call, result));

            if failed {
                // 步骤失败：放弃计划，剩余步骤绝不触达
                notes.push(format!(
                    "I stopped the task \"{}\" after step {step_id} failed; the remaining steps were not attempted.",
                    plan.goal
                ));
                return (results, PlanUpdate::Clear);
            }

            plan.results.insert(step_id, payload);
            match plan.remaining.first() {
                None => return (results, PlanUpdate::Clear),
                // 下一步的输入已可解析：同回合继续
                Some(step) if !has_placeholders(&step.parameters) => continue,
                Some(_) => {
                    // 下一步依赖模板绑定：先试绑定。刚产出的结果绑不上，
                    // 下一回合也绑不上，当场放弃；绑得上则存回会话，下一回合恢复
                    let mut probe = plan.clone();
                    match next_ready_call(&mut probe) {
                        Ok(_) => return (results, PlanUpdate::Set(plan)),
                        Err(e) => {
                            tracing::info!(plan_id = %plan.id, error = %e, "plan unresolvable, abandoning");
                            notes.push(format!(
                                "I had to stop the task \"{}\": the step that just ran came back empty, so the next step has nothing to work with.",
                                plan.goal
                            ));
                            return (results, PlanUpdate::Clear);
                        }
                    }
                }
            }
        }
    }

    /// 提交回合；先按原顺序重试之前 Aborted 的提交，失败则全部暂存到下一回合。
    /// 暂存的是完整 TurnCommit：计划的 Set/Clear 与时区更新在重放时原样生效
    async fn commit_with_stash(&self, key: &ConversationKey, turn: Turn, plan: PlanUpdate) {
        let mut backlog = {
            let mut stashed = self.stashed.lock().await;
            stashed.remove(key).unwrap_or_default()
        };
        backlog.push(TurnCommit {
            turn,
            plan,
            utc_offset_minutes: None,
        });

        while let Some(commit) = backlog.first().cloned() {
            if let Err(e) = self.store.commit(key, commit).await {
                // Aborted：回复照常送达，未提交的回合按序暂存待下一次提交
                tracing::error!(key = %key, error = %e, "turn commit failed, stashing for retry");
                self.stashed.lock().await.insert(key.clone(), backlog);
                return;
            }
            backlog.remove(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolsSection;
    use crate::core::router::Router;
    use crate::oracle::ScriptedOracle;
    use crate::session::MemorySessionStore;
    use crate::tools::contract::{
        AgentReply, CapabilityAgent, OperationSpec, ProviderError,
    };
    use crate::tools::AgentRegistry;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// 记录触达次数的日历桩；create 恒定失败
    struct FlakyCalendar {
        creates: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CapabilityAgent for FlakyCalendar {
        fn name(&self) -> &str {
            "calendar"
        }

        fn description(&self) -> &str {
            "calendar stub"
        }

        fn operations(&self) -> Vec<OperationSpec> {
            vec![OperationSpec {
                name: "create",
                description: "create event",
                parameters: json!({"type": "object"}),
                mutating: true,
            }]
        }

        async fn invoke(&self, _op: &str, _params: &Value) -> Result<AgentReply, ProviderError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            Err(ProviderError::Unavailable("calendar down".into()))
        }
    }

    struct EmptyEmail;

    #[async_trait]
    impl CapabilityAgent for EmptyEmail {
        fn name(&self) -> &str {
            "email"
        }

        fn description(&self) -> &str {
            "email stub"
        }

        fn operations(&self) -> Vec<OperationSpec> {
            vec![OperationSpec {
                name: "search",
                description: "search mailbox",
                parameters: json!({"type": "object"}),
                mutating: false,
            }]
        }

        async fn invoke(&self, _op: &str, _params: &Value) -> Result<AgentReply, ProviderError> {
            Ok(AgentReply::Complete(json!({"messages": [], "count": 0})))
        }
    }

    fn orchestrator(
        oracle: Arc<ScriptedOracle>,
        creates: Arc<AtomicUsize>,
    ) -> Orchestrator {
        let mut registry = AgentRegistry::new();
        registry.register(FlakyCalendar { creates });
        registry.register(EmptyEmail);
        let registry = Arc::new(registry);

        let tools_cfg = ToolsSection {
            tool_timeout_secs: 1,
            max_attempts: 2,
            backoff_base_ms: 1,
            backoff_cap_ms: 2,
            idempotency_window_secs: 600,
            max_concurrent_calls: 3,
        };
        Orchestrator::new(
            Router::new(
                oracle.clone(),
                registry.clone(),
                false,
                Duration::from_secs(1800),
            ),
            Aggregator::new(oracle),
            Arc::new(ToolExecutor::new(registry, &tools_cfg)),
            Arc::new(ToolScheduler::new(3)),
            Arc::new(MemorySessionStore::new(20, 3600, 0)),
        )
    }

    #[tokio::test]
    async fn test_direct_answer_turn() {
        let oracle = Arc::new(ScriptedOracle::new([
            json!({"mode": "direct", "reply": "Hello there!"}).to_string(),
        ]));
        let orchestrator = orchestrator(oracle, Arc::new(AtomicUsize::new(0)));

        let request = IncomingRequest::new(ConversationKey::new("api", "u1"), "hi");
        let response = orchestrator
            .handle(request, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.text, "Hello there!");
        assert_eq!(response.status, ReplyStatus::Ok);
    }

    #[tokio::test]
    async fn test_plan_stops_after_failed_step() {
        // step1 邮件搜索成功（空结果），step2 引用其结果 → 存回会话；
        // 本测试改用字面参数的两步计划：step1 失败即放弃，step2 绝不触达
        let creates = Arc::new(AtomicUsize::new(0));
        let oracle = Arc::new(ScriptedOracle::new([
            json!({
                "mode": "tools",
                "steps": [
                    {"agent": "calendar", "operation": "create",
                     "parameters": {"title": "A", "start": "2026-08-25T09:00"}},
                    {"agent": "calendar", "operation": "create",
                     "parameters": {"title": "B", "start": "2026-08-25T10:00"},
                     "depends_on_previous": true}
                ]
            })
            .to_string(),
            "I couldn't create the first event, so I stopped there.".to_string(),
        ]));
        let orchestrator = orchestrator(oracle, creates.clone());

        let request = IncomingRequest::new(ConversationKey::new("api", "u2"), "book A then B");
        let response = orchestrator
            .handle(request, CancellationToken::new())
            .await
            .unwrap();

        // 仅 step1 触达（含一次重试 = 2 次 Provider 触达），step2 从未发出
        assert_eq!(creates.load(Ordering::SeqCst), 2);
        assert_eq!(response.status, ReplyStatus::Error);
    }

    #[tokio::test]
    async fn test_direct_turn_with_note_degrades_to_partial() {
        let oracle = Arc::new(ScriptedOracle::new([
            json!({"mode": "direct", "reply": "Hello!"}).to_string(),
        ]));
        let mut registry = AgentRegistry::new();
        registry.register(EmptyEmail);
        let registry = Arc::new(registry);
        let tools_cfg = ToolsSection {
            tool_timeout_secs: 1,
            max_attempts: 2,
            backoff_base_ms: 1,
            backoff_cap_ms: 2,
            idempotency_window_secs: 600,
            max_concurrent_calls: 3,
        };
        let store = Arc::new(MemorySessionStore::new(20, 3600, 0));
        let orchestrator = Orchestrator::new(
            Router::new(oracle.clone(), registry.clone(), false, Duration::from_millis(0)),
            Aggregator::new(oracle),
            Arc::new(ToolExecutor::new(registry, &tools_cfg)),
            Arc::new(ToolScheduler::new(3)),
            store.clone(),
        );

        // 预置一个立即过期的计划：回合带「任务被丢弃」附注
        let key = ConversationKey::new("api", "u4");
        store
            .commit(
                &key,
                TurnCommit {
                    turn: Turn::new("earlier", vec![], "ok", ReplyStatus::Ok),
                    plan: PlanUpdate::Set(PendingPlan::new("old goal", vec![])),
                    utc_offset_minutes: None,
                },
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let response = orchestrator
            .handle(IncomingRequest::new(key.clone(), "hi"), CancellationToken::new())
            .await
            .unwrap();

        // 直答路径与聚合器同规则：带附注的回合不再是 Ok
        assert_eq!(response.status, ReplyStatus::Partial);
        assert!(response.text.contains("dropped"));
        assert!(response.text.contains("Hello!"));
        assert!(store.snapshot(&key).await.pending_plan.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_turn_discards_reply_but_commits() {
        let oracle = Arc::new(ScriptedOracle::new([
            json!({"mode": "direct", "reply": "unseen"}).to_string(),
        ]));
        let orchestrator = orchestrator(oracle, Arc::new(AtomicUsize::new(0)));

        let key = ConversationKey::new("api", "u3");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let response = orchestrator
            .handle(IncomingRequest::new(key.clone(), "hi"), cancel)
            .await;
        assert!(response.is_none());

        // 回合仍然入史
        let snapshot = orchestrator.store.snapshot(&key).await;
        assert_eq!(snapshot.turns.len(), 1);
    }
}
