//! 日历能力 Agent
//!
//! 操作：list / create / update / delete。create / update / delete 为变更类操作。
//! 时间归一化：入参接受带时区的 RFC3339 或 naive 的 "YYYY-MM-DDTHH:MM[:SS]"，
//! 内部一律转为 UTC-naive；会话时区只在最终格式化时应用。

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::tools::contract::{
    optional_str, optional_u64, require_str, AgentReply, CapabilityAgent, OperationSpec,
    ProviderError,
};

/// 日历事件（时间为 UTC-naive）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: String,
    pub title: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// 待创建的事件
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub title: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub location: Option<String>,
    pub description: Option<String>,
}

/// 事件的局部更新；None 表示该字段不变
#[derive(Debug, Clone, Default)]
pub struct EventPatch {
    pub title: Option<String>,
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
    pub location: Option<String>,
    pub description: Option<String>,
}

/// 日历 Provider 抽象（Google Calendar 等实现接到此缝）
#[async_trait]
pub trait CalendarProvider: Send + Sync {
    async fn list(
        &self,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<Vec<CalendarEvent>, ProviderError>;

    async fn create(&self, event: &NewEvent) -> Result<CalendarEvent, ProviderError>;

    async fn update(&self, event_id: &str, patch: &EventPatch)
        -> Result<CalendarEvent, ProviderError>;

    async fn delete(&self, event_id: &str) -> Result<(), ProviderError>;
}

/// 未连接日历账号时的占位 Provider：一律 AuthExpired
pub struct UnconfiguredCalendarProvider;

#[async_trait]
impl CalendarProvider for UnconfiguredCalendarProvider {
    async fn list(
        &self,
        _from: NaiveDateTime,
        _to: NaiveDateTime,
    ) -> Result<Vec<CalendarEvent>, ProviderError> {
        Err(ProviderError::AuthExpired(
            "no calendar account is connected".to_string(),
        ))
    }

    async fn create(&self, _event: &NewEvent) -> Result<CalendarEvent, ProviderError> {
        Err(ProviderError::AuthExpired(
            "no calendar account is connected".to_string(),
        ))
    }

    async fn update(
        &self,
        _event_id: &str,
        _patch: &EventPatch,
    ) -> Result<CalendarEvent, ProviderError> {
        Err(ProviderError::AuthExpired(
            "no calendar account is connected".to_string(),
        ))
    }

    async fn delete(&self, _event_id: &str) -> Result<(), ProviderError> {
        Err(ProviderError::AuthExpired(
            "no calendar account is connected".to_string(),
        ))
    }
}

/// 解析入参时间：RFC3339（带偏移，转 UTC）或 naive "YYYY-MM-DDTHH:MM[:SS]"（视为已是 UTC）
pub fn parse_datetime(key: &str, raw: &str) -> Result<NaiveDateTime, ProviderError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.naive_utc());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok(dt);
        }
    }
    Err(ProviderError::InvalidInput(format!(
        "parameter '{key}' is not a recognizable datetime: '{raw}'"
    )))
}

const DEFAULT_DURATION_MINUTES: u64 = 60;

/// 日历 Agent
pub struct CalendarAgent {
    provider: std::sync::Arc<dyn CalendarProvider>,
}

impl CalendarAgent {
    pub fn new(provider: std::sync::Arc<dyn CalendarProvider>) -> Self {
        Self { provider }
    }

    fn parse_new_event(params: &Value) -> Result<NewEvent, ProviderError> {
        let title = require_str(params, "title")?.to_string();
        let start = parse_datetime("start", require_str(params, "start")?)?;
        let end = match optional_str(params, "end") {
            Some(raw) => parse_datetime("end", raw)?,
            None => {
                let minutes =
                    optional_u64(params, "duration_minutes")?.unwrap_or(DEFAULT_DURATION_MINUTES);
                start + Duration::minutes(minutes as i64)
            }
        };
        if end <= start {
            return Err(ProviderError::InvalidInput(
                "event end must be after its start".to_string(),
            ));
        }
        Ok(NewEvent {
            title,
            start,
            end,
            location: optional_str(params, "location").map(str::to_string),
            description: optional_str(params, "description").map(str::to_string),
        })
    }

    fn parse_patch(params: &Value) -> Result<EventPatch, ProviderError> {
        let patch = EventPatch {
            title: optional_str(params, "title").map(str::to_string),
            start: optional_str(params, "start")
                .map(|raw| parse_datetime("start", raw))
                .transpose()?,
            end: optional_str(params, "end")
                .map(|raw| parse_datetime("end", raw))
                .transpose()?,
            location: optional_str(params, "location").map(str::to_string),
            description: optional_str(params, "description").map(str::to_string),
        };
        if patch.title.is_none()
            && patch.start.is_none()
            && patch.end.is_none()
            && patch.location.is_none()
            && patch.description.is_none()
        {
            return Err(ProviderError::InvalidInput(
                "update needs at least one field to change".to_string(),
            ));
        }
        Ok(patch)
    }
}

#[async_trait]
impl CapabilityAgent for CalendarAgent {
    fn name(&self) -> &str {
        "calendar"
    }

    fn description(&self) -> &str {
        "Calendar: list events in a time range, create, update or delete events."
    }

    fn operations(&self) -> Vec<OperationSpec> {
        vec![
            OperationSpec {
                name: "list",
                description: "List events between two datetimes",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "from": {"type": "string", "description": "RFC3339 or YYYY-MM-DDTHH:MM"},
                        "to": {"type": "string", "description": "RFC3339 or YYYY-MM-DDTHH:MM"}
                    },
                    "required": ["from", "to"]
                }),
                mutating: false,
            },
            OperationSpec {
                name: "create",
                description: "Create an event; end defaults to start + 60 minutes",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "title": {"type": "string"},
                        "start": {"type": "string"},
                        "end": {"type": "string"},
                        "duration_minutes": {"type": "integer", "minimum": 1},
                        "location": {"type": "string"},
                        "description": {"type": "string"}
                    },
                    "required": ["title", "start"]
                }),
                mutating: true,
            },
            OperationSpec {
                name: "update",
                description: "Change fields of an existing event",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "event_id": {"type": "string"},
                        "title": {"type": "string"},
                        "start": {"type": "string"},
                        "end": {"type": "string"},
                        "location": {"type": "string"},
                        "description": {"type": "string"}
                    },
                    "required": ["event_id"]
                }),
                mutating: true,
            },
            OperationSpec {
                name: "delete",
                description: "Delete an event by id",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "event_id": {"type": "string"}
                    },
                    "required": ["event_id"]
                }),
                mutating: true,
            },
        ]
    }

    async fn invoke(&self, operation: &str, parameters: &Value) -> Result<AgentReply, ProviderError> {
        match operation {
            "list" => {
                let from = parse_datetime("from", require_str(parameters, "from")?)?;
                let to = parse_datetime("to", require_str(parameters, "to")?)?;
                if to <= from {
                    return Err(ProviderError::InvalidInput(
                        "'to' must be after 'from'".to_string(),
                    ));
                }
                let events = self.provider.list(from, to).await?;
                let count = events.len();
                Ok(AgentReply::Complete(json!({
                    "events": events,
                    "count": count,
                })))
            }
            "create" => {
                let event = Self::parse_new_event(parameters)?;
                let created = self.provider.create(&event).await?;
                let payload = serde_json::to_value(&created)
                    .map_err(|e| ProviderError::Other(e.to_string()))?;
                Ok(AgentReply::Complete(payload))
            }
            "update" => {
                let event_id = require_str(parameters, "event_id")?;
                let patch = Self::parse_patch(parameters)?;
                let updated = self.provider.update(event_id, &patch).await?;
                let payload = serde_json::to_value(&updated)
                    .map_err(|e| ProviderError::Other(e.to_string()))?;
                Ok(AgentReply::Complete(payload))
            }
            "delete" => {
                let event_id = require_str(parameters, "event_id")?;
                self.provider.delete(event_id).await?;
                Ok(AgentReply::Complete(json!({"deleted": event_id})))
            }
            other => Err(ProviderError::InvalidInput(format!(
                "unknown calendar operation '{other}'"
            ))),
        }
    }
}
