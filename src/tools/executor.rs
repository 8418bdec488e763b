//! 工具执行器
//!
//! 契约层的唯一入口：invoke(ToolCall) 永远返回 ToolResult，从不向调用方抛错。
//! 职责：单次调用超时、可重试失败的有界指数退避、变更类操作的幂等去重、
//! 每次调用输出结构化审计日志（JSON）。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::config::ToolsSection;
use crate::tools::contract::{AgentReply, CapabilityAgent, ToolCall, ToolErrorKind, ToolResult};
use crate::tools::registry::AgentRegistry;

/// 幂等缓存条目
struct DedupEntry {
    stored_at: Instant,
    result: ToolResult,
}

/// 幂等槽位：同键调用在槽位锁上串行，后到者等待先到者的结果而非再触达 Provider
type DedupSlot = Arc<Mutex<Option<DedupEntry>>>;

/// 工具执行器：持有注册表与超时/重试/幂等配置
pub struct ToolExecutor {
    registry: Arc<AgentRegistry>,
    call_timeout: Duration,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
    idempotency_window: Duration,
    dedup: Mutex<HashMap<String, DedupSlot>>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<AgentRegistry>, cfg: &ToolsSection) -> Self {
        Self {
            registry,
            call_timeout: Duration::from_secs(cfg.tool_timeout_secs),
            max_attempts: cfg.max_attempts.max(1),
            backoff_base: Duration::from_millis(cfg.backoff_base_ms),
            backoff_cap: Duration::from_millis(cfg.backoff_cap_ms.max(cfg.backoff_base_ms)),
            idempotency_window: Duration::from_secs(cfg.idempotency_window_secs),
            dedup: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// 执行一次工具调用
    ///
    /// - 未注册的 agent/operation：InvalidInput，不可重试
    /// - 变更类操作缺少幂等键：InvalidInput，不可重试
    /// - 幂等窗口内重复键：直接返回缓存结果，不再触达 Provider
    /// - 超时：ProviderUnavailable，可重试；可重试失败按配置退避重试
    pub async fn invoke(&self, call: &ToolCall) -> ToolResult {
        let start = Instant::now();

        let Some(agent) = self.registry.get(&call.agent) else {
            let result = ToolResult::failed(
                ToolErrorKind::InvalidInput,
                format!("unknown agent '{}'", call.agent),
                false,
            );
            self.audit(call, &result, start, 0, false);
            return result;
        };
        let Some(op) = self.registry.operation(&call.agent, &call.operation) else {
            let result = ToolResult::failed(
                ToolErrorKind::InvalidInput,
                format!("agent '{}' has no operation '{}'", call.agent, call.operation),
                false,
            );
            self.audit(call, &result, start, 0, false);
            return result;
        };

        if op.mutating && call.idempotency_key.is_none() {
            let result = ToolResult::failed(
                ToolErrorKind::InvalidInput,
                format!(
                    "mutating operation '{}.{}' requires an idempotency_key",
                    call.agent, call.operation
                ),
                false,
            );
            self.audit(call, &result, start, 0, false);
            return result;
        }

        // 幂等去重：同键调用持有同一槽位锁跨越整个 Provider 触达，
        // 并发同键也只产生一次效果；窗口内后到者直接取缓存结果
        if let Some(key) = call.idempotency_key.as_deref() {
            let slot = {
                let mut dedup = self.dedup.lock().await;
                dedup.retain(|_, slot| {
                    Arc::strong_count(slot) > 1
                        || match slot.try_lock() {
                            Ok(entry) => entry
                                .as_ref()
                                .is_some_and(|e| e.stored_at.elapsed() < self.idempotency_window),
                            Err(_) => true,
                        }
                });
                dedup
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(None)))
                    .clone()
            };

            let mut entry = slot.lock().await;
            if let Some(cached) = entry.as_ref() {
                if cached.stored_at.elapsed() < self.idempotency_window {
                    let result = cached.result.clone();
                    drop(entry);
                    self.audit(call, &result, start, 0, true);
                    return result;
                }
            }

            let (result, attempts) = self.run_attempts(agent.as_ref(), call).await;
            *entry = Some(DedupEntry {
                stored_at: Instant::now(),
                result: result.clone(),
            });
            drop(entry);
            self.audit(call, &result, start, attempts, false);
            return result;
        }

        let (result, attempts) = self.run_attempts(agent.as_ref(), call).await;
        self.audit(call, &result, start, attempts, false);
        result
    }

    /// 单次调用的超时与有界退避重试；返回 (结果, 实际触达次数)
    async fn run_attempts(&self, agent: &dyn CapabilityAgent, call: &ToolCall) -> (ToolResult, u32) {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let outcome = timeout(
                self.call_timeout,
                agent.invoke(&call.operation, &call.parameters),
            )
            .await;

            let result = match outcome {
                Ok(Ok(AgentReply::Complete(payload))) => ToolResult::ok(payload),
                Ok(Ok(AgentReply::Partial { payload, error })) => {
                    ToolResult::partial(payload, error)
                }
                Ok(Err(e)) => ToolResult::failed(e.kind(), e.to_string(), e.retriable()),
                Err(_) => ToolResult::failed(
                    ToolErrorKind::ProviderUnavailable,
                    format!(
                        "'{}.{}' timed out after {}s",
                        call.agent,
                        call.operation,
                        self.call_timeout.as_secs()
                    ),
                    true,
                ),
            };

            if result.is_failed() && result.retriable && attempt < self.max_attempts {
                tokio::time::sleep(self.backoff(attempt)).await;
                continue;
            }
            break (result, attempt);
        }
    }

    /// 第 n 次失败后的退避时长：base * 2^(n-1)，封顶 cap
    fn backoff(&self, failed_attempts: u32) -> Duration {
        let multiplier = 1u32.checked_shl(failed_attempts.saturating_sub(1)).unwrap_or(u32::MAX);
        let delay = self.backoff_base.saturating_mul(multiplier);
        delay.min(self.backoff_cap)
    }

    /// 结构化审计记录：agent、操作、结局、耗时；供外部观测系统消费，核心不落盘
    fn audit(&self, call: &ToolCall, result: &ToolResult, start: Instant, attempts: u32, dedup: bool) {
        let outcome = match (&result.status, &result.error) {
            (crate::tools::contract::ToolStatus::Ok, _) => "ok".to_string(),
            (crate::tools::contract::ToolStatus::Partial, _) => "partial".to_string(),
            (_, Some(err)) => format!("failed:{:?}", err.kind),
            (_, None) => "failed".to_string(),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "agent": call.agent,
            "operation": call.operation,
            "outcome": outcome,
            "attempts": attempts,
            "deduplicated": dedup,
            "duration_ms": start.elapsed().as_millis() as u64,
        });
        tracing::info!(audit = %audit.to_string(), "tool");
    }
}
