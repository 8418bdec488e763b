//! 邮件能力 Agent
//!
//! 操作：search / read / draft / send。send 为变更类操作，必须携带幂等键。
//! Provider 按页返回搜索结果；Agent 在此做分页归一化：循环拉取直到满足
//! max_results 或无下一页；中途某页失败时返回 Partial（已取得的照常返回）。

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::tools::contract::{
    optional_u64, require_str, AgentReply, CapabilityAgent, OperationSpec, ProviderError,
    ToolError,
};

/// 单封邮件（时间为 UTC-naive）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailMessage {
    pub id: String,
    pub thread_id: String,
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub snippet: String,
    /// read 操作才填充正文
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub received_at: NaiveDateTime,
}

/// 一页搜索结果
#[derive(Debug, Clone)]
pub struct MailPage {
    pub messages: Vec<MailMessage>,
    pub next_page_token: Option<String>,
}

/// 待创建/发送的邮件
#[derive(Debug, Clone, Serialize)]
pub struct MailDraft {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

/// 邮件 Provider 抽象（Gmail 等实现接到此缝）
#[async_trait]
pub trait MailProvider: Send + Sync {
    async fn search(
        &self,
        query: &str,
        page_size: usize,
        page_token: Option<&str>,
    ) -> Result<MailPage, ProviderError>;

    async fn read(&self, message_id: &str) -> Result<MailMessage, ProviderError>;

    /// 返回草稿 id
    async fn create_draft(&self, draft: &MailDraft) -> Result<String, ProviderError>;

    /// 返回已发送邮件 id
    async fn send(&self, draft: &MailDraft) -> Result<String, ProviderError>;
}

/// 未配置任何邮箱账号时的占位 Provider：一律 AuthExpired
///
/// 能力清单里仍然出现 email，Oracle 可以正常路由，失败在回复中如实呈现。
pub struct UnconfiguredMailProvider;

#[async_trait]
impl MailProvider for UnconfiguredMailProvider {
    async fn search(
        &self,
        _query: &str,
        _page_size: usize,
        _page_token: Option<&str>,
    ) -> Result<MailPage, ProviderError> {
        Err(ProviderError::AuthExpired(
            "no mail account is connected".to_string(),
        ))
    }

    async fn read(&self, _message_id: &str) -> Result<MailMessage, ProviderError> {
        Err(ProviderError::AuthExpired(
            "no mail account is connected".to_string(),
        ))
    }

    async fn create_draft(&self, _draft: &MailDraft) -> Result<String, ProviderError> {
        Err(ProviderError::AuthExpired(
            "no mail account is connected".to_string(),
        ))
    }

    async fn send(&self, _draft: &MailDraft) -> Result<String, ProviderError> {
        Err(ProviderError::AuthExpired(
            "no mail account is connected".to_string(),
        ))
    }
}

const DEFAULT_MAX_RESULTS: u64 = 10;
const MAX_PAGES: usize = 5;

/// 邮件 Agent
pub struct EmailAgent {
    provider: std::sync::Arc<dyn MailProvider>,
}

impl EmailAgent {
    pub fn new(provider: std::sync::Arc<dyn MailProvider>) -> Self {
        Self { provider }
    }

    /// "to" 接受字符串或字符串数组
    fn parse_recipients(params: &Value) -> Result<Vec<String>, ProviderError> {
        match params.get("to") {
            Some(Value::String(s)) if !s.trim().is_empty() => Ok(vec![s.trim().to_string()]),
            Some(Value::Array(items)) => {
                let recipients: Vec<String> = items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                if recipients.is_empty() {
                    Err(ProviderError::InvalidInput(
                        "'to' must contain at least one recipient".to_string(),
                    ))
                } else {
                    Ok(recipients)
                }
            }
            _ => Err(ProviderError::InvalidInput(
                "missing required parameter 'to'".to_string(),
            )),
        }
    }

    fn parse_draft(params: &Value) -> Result<MailDraft, ProviderError> {
        Ok(MailDraft {
            to: Self::parse_recipients(params)?,
            subject: require_str(params, "subject")?.to_string(),
            body: require_str(params, "body")?.to_string(),
        })
    }

    /// 分页归一化：循环拉取直到凑够 max_results 或无下一页
    ///
    /// 第一页即失败 → 整体失败；后续页失败 → Partial，已取得的照常返回。
    async fn search_all(&self, query: &str, max_results: usize) -> Result<AgentReply, ProviderError> {
        let mut messages: Vec<MailMessage> = Vec::new();
        let mut page_token: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let remaining = max_results - messages.len();
            let page = self
                .provider
                .search(query, remaining, page_token.as_deref())
                .await;
            match page {
                Ok(page) => {
                    messages.extend(page.messages);
                    if messages.len() >= max_results || page.next_page_token.is_none() {
                        messages.truncate(max_results);
                        break;
                    }
                    page_token = page.next_page_token;
                }
                Err(e) if messages.is_empty() => return Err(e),
                Err(e) => {
                    let count = messages.len();
                    let payload = json!({
                        "query": query,
                        "messages": messages,
                        "count": count,
                    });
                    return Ok(AgentReply::Partial {
                        payload,
                        error: ToolError {
                            kind: e.kind(),
                            message: format!("search stopped early: {e}"),
                        },
                    });
                }
            }
        }

        let count = messages.len();
        Ok(AgentReply::Complete(json!({
            "query": query,
            "messages": messages,
            "count": count,
        })))
    }
}

#[async_trait]
impl CapabilityAgent for EmailAgent {
    fn name(&self) -> &str {
        "email"
    }

    fn description(&self) -> &str {
        "Email: search the mailbox, read a message, draft or send mail."
    }

    fn operations(&self) -> Vec<OperationSpec> {
        vec![
            OperationSpec {
                name: "search",
                description: "Search the mailbox; returns message headers and snippets",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "query": {"type": "string", "description": "Mailbox search query"},
                        "max_results": {"type": "integer", "minimum": 1, "maximum": 50}
                    },
                    "required": ["query"]
                }),
                mutating: false,
            },
            OperationSpec {
                name: "read",
                description: "Read the full body of one message by id",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "message_id": {"type": "string"}
                    },
                    "required": ["message_id"]
                }),
                mutating: false,
            },
            OperationSpec {
                name: "draft",
                description: "Create a draft without sending it",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "to": {"type": "array", "items": {"type": "string"}},
                        "subject": {"type": "string"},
                        "body": {"type": "string"}
                    },
                    "required": ["to", "subject", "body"]
                }),
                mutating: false,
            },
            OperationSpec {
                name: "send",
                description: "Send an email immediately; only when the user explicitly asked to send",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "to": {"type": "array", "items": {"type": "string"}},
                        "subject": {"type": "string"},
                        "body": {"type": "string"}
                    },
                    "required": ["to", "subject", "body"]
                }),
                mutating: true,
            },
        ]
    }

    async fn invoke(&self, operation: &str, parameters: &Value) -> Result<AgentReply, ProviderError> {
        match operation {
            "search" => {
                let query = require_str(parameters, "query")?;
                let max_results = optional_u64(parameters, "max_results")?
                    .unwrap_or(DEFAULT_MAX_RESULTS)
                    .clamp(1, 50) as usize;
                self.search_all(query, max_results).await
            }
            "read" => {
                let message_id = require_str(parameters, "message_id")?;
                let message = self.provider.read(message_id).await?;
                let payload = serde_json::to_value(&message)
                    .map_err(|e| ProviderError::Other(e.to_string()))?;
                Ok(AgentReply::Complete(payload))
            }
            "draft" => {
                let draft = Self::parse_draft(parameters)?;
                let draft_id = self.provider.create_draft(&draft).await?;
                Ok(AgentReply::Complete(json!({
                    "draft_id": draft_id,
                    "to": draft.to,
                    "subject": draft.subject,
                })))
            }
            "send" => {
                let draft = Self::parse_draft(parameters)?;
                let message_id = self.provider.send(&draft).await?;
                Ok(AgentReply::Complete(json!({
                    "message_id": message_id,
                    "to": draft.to,
                    "subject": draft.subject,
                })))
            }
            other => Err(ProviderError::InvalidInput(format!(
                "unknown email operation '{other}'"
            ))),
        }
    }
}
