//! Aide - 个人助理编排服务
//!
//! 入口：初始化日志与配置，装配能力 Agent / Oracle / 会话存储 / 编排器，
//! 启动 HTTP 服务（配置了 Slack 凭据时同时挂载 Slack 事件路由）。

use std::sync::Arc;
use std::time::Duration;

use aide::agents::{
    CalendarAgent, EmailAgent, OpenMeteoProvider, SearchAgent, TavilyProvider,
    UnconfiguredCalendarProvider, UnconfiguredMailProvider, WeatherAgent,
};
use aide::config::load_config;
use aide::core::{Aggregator, Orchestrator, Router, ToolScheduler};
use aide::integrations::http::{create_router as http_router, HttpState};
use aide::integrations::slack::{create_router as slack_router, SlackState};
use aide::oracle::{OpenAiOracle, Oracle};
use aide::session::{MemorySessionStore, SessionStore};
use aide::tools::{AgentRegistry, ToolExecutor};
use anyhow::Context;

/// 过期会话的后台清理间隔
const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    aide::observability::init();

    let cfg = load_config(None).context("Failed to load config")?;
    tracing::info!(
        model = %cfg.oracle.model,
        bind = %cfg.server.bind,
        "starting aide"
    );

    // 能力 Agent 装配。邮件与日历未接入真实账号时挂占位 Provider：
    // 能力清单保持完整，调用失败会在回复中如实呈现
    let mut registry = AgentRegistry::new();
    registry.register(WeatherAgent::new(Arc::new(OpenMeteoProvider::new(
        &cfg.providers.weather,
    ))));
    registry.register(SearchAgent::new(
        Arc::new(TavilyProvider::new(
            &cfg.providers.search,
            std::env::var("TAVILY_API_KEY").unwrap_or_default(),
        )),
        cfg.providers.search.max_results,
    ));
    registry.register(EmailAgent::new(Arc::new(UnconfiguredMailProvider)));
    registry.register(CalendarAgent::new(Arc::new(UnconfiguredCalendarProvider)));
    let registry = Arc::new(registry);

    let oracle: Arc<dyn Oracle> = Arc::new(OpenAiOracle::new(
        cfg.oracle.base_url.as_deref(),
        &cfg.oracle.model,
        None,
    ));

    let store = Arc::new(MemorySessionStore::new(
        cfg.app.max_history_turns,
        cfg.app.session_timeout_secs,
        cfg.app.default_utc_offset_minutes,
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        Router::new(
            oracle.clone(),
            registry.clone(),
            cfg.routing.sequential_by_default,
            Duration::from_secs(cfg.app.plan_timeout_secs),
        ),
        Aggregator::new(oracle),
        Arc::new(ToolExecutor::new(registry, &cfg.tools)),
        Arc::new(ToolScheduler::new(cfg.tools.max_concurrent_calls)),
        store.clone(),
    ));

    // 过期会话后台回收
    {
        let store = store.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                ticker.tick().await;
                let removed = store.cleanup_expired().await;
                if removed > 0 {
                    tracing::debug!(removed, "expired conversations cleaned up");
                }
            }
        });
    }

    let mut app = http_router(Arc::new(HttpState {
        orchestrator: orchestrator.clone(),
    }));

    match (
        std::env::var("SLACK_SIGNING_SECRET"),
        std::env::var("SLACK_BOT_TOKEN"),
    ) {
        (Ok(signing_secret), Ok(bot_token)) => {
            tracing::info!("slack integration enabled");
            app = app.merge(slack_router(Arc::new(SlackState::new(
                orchestrator,
                signing_secret,
                bot_token,
                cfg.slack.signature_window_secs,
            ))));
        }
        _ => {
            tracing::info!("slack credentials not set, slack integration disabled");
        }
    }

    let listener = tokio::net::TcpListener::bind(&cfg.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.server.bind))?;
    tracing::info!(addr = %cfg.server.bind, "listening");
    axum::serve(listener, app).await.context("Server failed")?;

    Ok(())
}
