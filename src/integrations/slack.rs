//! Slack 集成
//!
//! 通过 Events API Webhook 接收消息（app_mention / 私聊 message），
//! 经编排器处理后用 chat.postMessage 回帖（thread_ts 透传为 reply_hint）。
//!
//! 重要：Slack 要求 Webhook 在 3 秒内返回 200，否则判失败并重试。
//! 本模块在签名校验与解析后立即返回，耗时处理在后台异步执行。
//! 签名校验：HMAC-SHA256 over "v0:{timestamp}:{body}"，时间戳超窗直接拒绝。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::core::{IncomingRequest, Orchestrator};
use crate::session::ConversationKey;

type HmacSha256 = Hmac<Sha256>;

/// Slack 服务状态
pub struct SlackState {
    pub orchestrator: Arc<Orchestrator>,
    pub signing_secret: String,
    pub bot_token: String,
    pub api_base: String,
    pub signature_window: Duration,
    /// 已处理事件 ID（Slack 重试时去重）
    pub processed_events: RwLock<HashSet<String>>,
}

impl SlackState {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        signing_secret: String,
        bot_token: String,
        signature_window_secs: u64,
    ) -> Self {
        Self {
            orchestrator,
            signing_secret,
            bot_token,
            api_base: "https://slack.com/api".to_string(),
            signature_window: Duration::from_secs(signature_window_secs),
            processed_events: RwLock::new(HashSet::new()),
        }
    }
}

/// 事件回调顶层
#[derive(Debug, Deserialize)]
struct EventPayload {
    #[serde(rename = "type")]
    type_: Option<String>,
    challenge: Option<String>,
    event_id: Option<String>,
    event: Option<EventData>,
}

#[derive(Debug, Deserialize)]
struct EventData {
    #[serde(rename = "type")]
    type_: Option<String>,
    user: Option<String>,
    text: Option<String>,
    channel: Option<String>,
    ts: Option<String>,
    thread_ts: Option<String>,
    /// 机器人自身的消息带 bot_id，不处理
    bot_id: Option<String>,
}

/// 创建 Slack 路由
pub fn create_router(state: Arc<SlackState>) -> Router {
    Router::new()
        .route("/slack/events", post(events_handler))
        .route("/slack/health", get(|| async { "OK" }))
        .with_state(state)
}

/// 校验 Slack 请求签名
///
/// 基串 "v0:{timestamp}:{body}"，期望签名 "v0=" + hex(HMAC-SHA256)。
pub fn verify_signature(
    signing_secret: &str,
    timestamp: &str,
    body: &[u8],
    signature: &str,
    window: Duration,
    now_epoch_secs: u64,
) -> bool {
    let Ok(ts) = timestamp.parse::<u64>() else {
        return false;
    };
    if now_epoch_secs.abs_diff(ts) > window.as_secs() {
        return false;
    }

    let Some(hex_sig) = signature.strip_prefix("v0=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(signing_secret.as_bytes()) else {
        return false;
    };
    mac.update(format!("v0:{timestamp}:").as_bytes());
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// 去掉消息开头的 @机器人 提及，如 "<@U12345> 明天天气"
fn strip_leading_mention(text: &str) -> &str {
    let trimmed = text.trim_start();
    if trimmed.starts_with("<@") {
        if let Some(end) = trimmed.find('>') {
            return trimmed[end + 1..].trim_start();
        }
    }
    trimmed
}

/// POST /slack/events - URL 校验 + 事件回调
async fn events_handler(
    State(state): State<Arc<SlackState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let timestamp = headers
        .get("x-slack-request-timestamp")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let signature = headers
        .get("x-slack-signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let now = chrono::Utc::now().timestamp().max(0) as u64;

    if !verify_signature(
        &state.signing_secret,
        timestamp,
        &body,
        signature,
        state.signature_window,
        now,
    ) {
        tracing::warn!("slack webhook: signature verification failed");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let payload: EventPayload =
        serde_json::from_slice(&body).map_err(|_| StatusCode::BAD_REQUEST)?;

    if payload.type_.as_deref() == Some("url_verification") {
        let Some(challenge) = payload.challenge else {
            return Err(StatusCode::BAD_REQUEST);
        };
        return Ok(Json(serde_json::json!({ "challenge": challenge })));
    }

    let Some(event) = payload.event else {
        return Ok(Json(serde_json::json!({})));
    };
    if event.bot_id.is_some() {
        return Ok(Json(serde_json::json!({})));
    }
    let event_type = event.type_.as_deref();
    if event_type != Some("app_mention") && event_type != Some("message") {
        tracing::debug!(event_type, "slack webhook: ignoring event type");
        return Ok(Json(serde_json::json!({})));
    }

    let (Some(user), Some(channel)) = (event.user.clone(), event.channel.clone()) else {
        return Ok(Json(serde_json::json!({})));
    };
    let text = strip_leading_mention(event.text.as_deref().unwrap_or("")).to_string();
    if text.is_empty() {
        return Ok(Json(serde_json::json!({})));
    }

    // Slack 投递失败会重试同一 event_id：先去重再受理
    if let Some(event_id) = payload.event_id {
        let mut processed = state.processed_events.write().await;
        if processed.contains(&event_id) {
            tracing::debug!(event_id, "slack webhook: duplicate event ignored");
            return Ok(Json(serde_json::json!({})));
        }
        processed.insert(event_id);
        if processed.len() > 10_000 {
            processed.clear();
        }
    }

    let thread = event.thread_ts.or(event.ts);
    let identity = ConversationKey::new(format!("slack:{channel}"), user);
    let mut request = IncomingRequest::new(identity, text);
    if let Some(thread) = &thread {
        request = request.with_reply_hint(thread.clone());
    }

    tracing::info!(channel, "slack webhook: accepted message, spawning background task");
    let state = Arc::clone(&state);
    tokio::spawn(async move {
        if let Err(e) = process_and_reply(state, &channel, request).await {
            tracing::error!(error = %e, "slack background process error");
        }
    });

    Ok(Json(serde_json::json!({})))
}

/// 后台执行：调用编排器，把回复发回原频道（有 reply_hint 则回帖）
async fn process_and_reply(
    state: Arc<SlackState>,
    channel: &str,
    request: IncomingRequest,
) -> anyhow::Result<()> {
    let Some(response) = state
        .orchestrator
        .handle(request, CancellationToken::new())
        .await
    else {
        return Ok(());
    };

    let mut body = serde_json::json!({
        "channel": channel,
        "text": response.text,
    });
    if let Some(thread_ts) = &response.reply_hint {
        body["thread_ts"] = serde_json::Value::String(thread_ts.clone());
    }

    let url = format!("{}/chat.postMessage", state.api_base);
    let client = reqwest::Client::new();
    let resp: serde_json::Value = client
        .post(&url)
        .bearer_auth(&state.bot_token)
        .json(&body)
        .send()
        .await?
        .json()
        .await?;

    if resp["ok"].as_bool() != Some(true) {
        anyhow::bail!(
            "chat.postMessage rejected: {}",
            resp["error"].as_str().unwrap_or("unknown")
        );
    }
    Ok(())
}
