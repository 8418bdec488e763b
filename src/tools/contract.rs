//! 统一工具契约
//!
//! ToolCall / ToolResult 是编排层与能力 Agent 之间的唯一交互形状；
//! Provider 的各种失败统一映射为 ToolErrorKind 错误分类，绝不以异常形式穿透契约层。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// 对某个能力 Agent 的一次调用请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Agent 名称（如 email、calendar、weather、search）
    pub agent: String,
    /// 操作名（Agent 各自的操作枚举，如 email.search、calendar.create）
    pub operation: String,
    /// 具名参数
    #[serde(default)]
    pub parameters: Value,
    /// 幂等键：变更类操作（send / create / update / delete）必填
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl ToolCall {
    pub fn new(agent: impl Into<String>, operation: impl Into<String>, parameters: Value) -> Self {
        Self {
            agent: agent.into(),
            operation: operation.into(),
            parameters,
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// 调用结果状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Ok,
    Partial,
    Failed,
}

/// 工具层错误分类（Provider 专有错误统一归入此六类）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    AuthExpired,
    RateLimited,
    NotFound,
    InvalidInput,
    ProviderUnavailable,
    Unknown,
}

/// 结构化错误：分类 + 人类可读信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
}

/// 一次调用的最终结果；invoke 永远返回 ToolResult，不向调用方抛错
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub status: ToolStatus,
    /// 操作特定的结构化负载
    pub payload: Value,
    /// status != ok 时填充
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
    pub retriable: bool,
}

impl ToolResult {
    pub fn ok(payload: Value) -> Self {
        Self {
            status: ToolStatus::Ok,
            payload,
            error: None,
            retriable: false,
        }
    }

    pub fn partial(payload: Value, error: ToolError) -> Self {
        Self {
            status: ToolStatus::Partial,
            payload,
            error: Some(error),
            retriable: false,
        }
    }

    pub fn failed(kind: ToolErrorKind, message: impl Into<String>, retriable: bool) -> Self {
        Self {
            status: ToolStatus::Failed,
            payload: Value::Null,
            error: Some(ToolError {
                kind,
                message: message.into(),
            }),
            retriable,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ToolStatus::Ok
    }

    pub fn is_failed(&self) -> bool {
        self.status == ToolStatus::Failed
    }
}

/// Provider 层错误：能力 Agent 内部使用，由执行器映射为 ToolResult
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("auth expired: {0}")]
    AuthExpired(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    pub fn kind(&self) -> ToolErrorKind {
        match self {
            ProviderError::AuthExpired(_) => ToolErrorKind::AuthExpired,
            ProviderError::RateLimited(_) => ToolErrorKind::RateLimited,
            ProviderError::NotFound(_) => ToolErrorKind::NotFound,
            ProviderError::InvalidInput(_) => ToolErrorKind::InvalidInput,
            ProviderError::Unavailable(_) => ToolErrorKind::ProviderUnavailable,
            ProviderError::Other(_) => ToolErrorKind::Unknown,
        }
    }

    /// RateLimited / Unavailable 可重试；InvalidInput / AuthExpired / NotFound 立即定论
    pub fn retriable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited(_) | ProviderError::Unavailable(_)
        )
    }
}

/// 单个操作的描述：名称、说明、参数 schema、是否变更类
#[derive(Debug, Clone, Serialize)]
pub struct OperationSpec {
    pub name: &'static str,
    pub description: &'static str,
    /// 参数 JSON Schema（供 Oracle 生成正确的参数，也用于入参校验说明）
    pub parameters: Value,
    /// 变更类操作必须携带幂等键
    pub mutating: bool,
}

/// Agent 成功路径的产出：完整结果，或带部分失败说明的不完整结果
#[derive(Debug, Clone)]
pub enum AgentReply {
    Complete(Value),
    /// 例如分页拉取中途失败：已取得的部分照常返回，同时附上失败说明
    Partial { payload: Value, error: ToolError },
}

impl From<Value> for AgentReply {
    fn from(value: Value) -> Self {
        AgentReply::Complete(value)
    }
}

/// 能力 Agent trait：一个外部领域（邮件 / 日历 / 天气 / 搜索）的有界封装
///
/// Agent 在调用 Provider 前校验参数，非法入参直接返回 InvalidInput（不可重试）；
/// Agent 自身无状态，连续性全部存于 Session / PendingPlan。
#[async_trait]
pub trait CapabilityAgent: Send + Sync {
    /// Agent 名称（ToolCall.agent 字段）
    fn name(&self) -> &str;

    /// 描述（进入能力清单，供 Oracle 选择）
    fn description(&self) -> &str;

    /// 该 Agent 暴露的操作集合
    fn operations(&self) -> Vec<OperationSpec>;

    /// 执行一个操作；参数校验失败返回 InvalidInput
    async fn invoke(&self, operation: &str, parameters: &Value)
        -> Result<AgentReply, ProviderError>;
}

/// 入参校验辅助：取必填字符串参数
pub fn require_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, ProviderError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ProviderError::InvalidInput(format!("missing required parameter '{key}'")))
}

/// 入参校验辅助：取可选字符串参数
pub fn optional_str<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

/// 入参校验辅助：取可选非负整数参数
pub fn optional_u64(params: &Value, key: &str) -> Result<Option<u64>, ProviderError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| ProviderError::InvalidInput(format!("parameter '{key}' must be a non-negative integer"))),
    }
}
