//! HTTP 接入
//!
//! POST /chat 接收归一化请求，同步等待编排器产出回复。
//! 回合任务独立 spawn：客户端断开时回合照常跑完（变更类调用不弃中途），
//! 只是取消令牌生效、回复被丢弃。

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::core::{IncomingRequest, Orchestrator, OutgoingResponse};
use crate::session::ConversationKey;

/// HTTP 服务状态
pub struct HttpState {
    pub orchestrator: Arc<Orchestrator>,
}

/// POST /chat 请求体
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    /// 参与者标识（必填）
    pub participant: String,
    /// 用户的自然语言文本
    pub text: String,
    /// 渠道名；缺省 "api"
    #[serde(default)]
    pub channel: Option<String>,
    /// 线程标识等回传提示，原样回显
    #[serde(default)]
    pub reply_hint: Option<String>,
}

/// 创建 HTTP 路由
pub fn create_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/chat", post(chat_handler))
        .route("/health", get(|| async { "OK" }))
        .with_state(state)
}

/// POST /chat - 处理一次请求并返回合成回复
async fn chat_handler(
    State(state): State<Arc<HttpState>>,
    Json(body): Json<ChatRequest>,
) -> Result<Json<OutgoingResponse>, StatusCode> {
    if body.text.trim().is_empty() || body.participant.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let channel = body.channel.unwrap_or_else(|| "api".to_string());
    let identity = ConversationKey::new(channel, body.participant);
    let mut request = IncomingRequest::new(identity, body.text.trim().to_string());
    if let Some(hint) = body.reply_hint {
        request = request.with_reply_hint(hint);
    }

    // 回合任务独立 spawn；本 handler 被客户端断开丢弃时令牌随守卫取消，
    // 回合在后台照常执行完并提交，回复被丢弃
    let token = CancellationToken::new();
    let _guard = token.clone().drop_guard();
    let orchestrator = state.orchestrator.clone();
    let task = tokio::spawn(async move { orchestrator.handle(request, token).await });

    match task.await {
        Ok(Some(response)) => Ok(Json(response)),
        Ok(None) => Err(StatusCode::GATEWAY_TIMEOUT),
        Err(e) => {
            tracing::error!(error = %e, "turn task panicked");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
