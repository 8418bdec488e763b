//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `AIDE__*` 覆盖（双下划线表示嵌套，如 `AIDE__ORACLE__MODEL=gpt-4o-mini`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub oracle: OracleSection,
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default)]
    pub routing: RoutingSection,
    #[serde(default)]
    pub providers: ProvidersSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub slack: SlackSection,
}

/// [app] 段：应用名、默认时区、历史轮数、会话保留
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 默认会话时区（相对 UTC 的分钟偏移；内部时间一律 UTC-naive，仅格式化时应用）
    #[serde(default)]
    pub default_utc_offset_minutes: i32,
    /// 会话历史保留轮数
    #[serde(default = "default_max_history_turns")]
    pub max_history_turns: usize,
    /// 空闲会话回收时间（秒）
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    /// 跨回合计划的超时（秒），超时后路由器放弃该计划
    #[serde(default = "default_plan_timeout_secs")]
    pub plan_timeout_secs: u64,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            default_utc_offset_minutes: 0,
            max_history_turns: default_max_history_turns(),
            session_timeout_secs: default_session_timeout_secs(),
            plan_timeout_secs: default_plan_timeout_secs(),
        }
    }
}

fn default_max_history_turns() -> usize {
    20
}

fn default_session_timeout_secs() -> u64 {
    3600
}

fn default_plan_timeout_secs() -> u64 {
    1800
}

/// [oracle] 段：推理 Oracle 后端（OpenAI 兼容端点）
#[derive(Debug, Clone, Deserialize, Default)]
pub struct OracleSection {
    #[serde(default = "default_oracle_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 单次补全请求超时（秒）
    #[serde(default = "default_oracle_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_oracle_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_oracle_timeout_secs() -> u64 {
    60
}

/// [tools] 段：工具调用超时、重试、幂等窗口、并发上限
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// 可重试失败的总尝试次数（含首次）
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 指数退避基准（毫秒）
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// 退避上限（毫秒）
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// 幂等键去重窗口（秒）
    #[serde(default = "default_idempotency_window_secs")]
    pub idempotency_window_secs: u64,
    /// 单回合内工具并发上限
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            idempotency_window_secs: default_idempotency_window_secs(),
            max_concurrent_calls: default_max_concurrent_calls(),
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    2
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_cap_ms() -> u64 {
    4000
}

fn default_idempotency_window_secs() -> u64 {
    600
}

fn default_max_concurrent_calls() -> usize {
    3
}

/// [routing] 段：多意图请求的并行/串行策略
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RoutingSection {
    /// 无显式依赖标记的多意图请求默认按串行计划处理（默认 false：并行）
    #[serde(default)]
    pub sequential_by_default: bool,
}

/// [providers] 段：各外部 Provider 的端点与限额
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProvidersSection {
    #[serde(default)]
    pub weather: WeatherProviderSection,
    #[serde(default)]
    pub search: SearchProviderSection,
}

/// [providers.weather] 段：Open-Meteo 与 Nominatim 端点
#[derive(Debug, Clone, Deserialize)]
pub struct WeatherProviderSection {
    #[serde(default = "default_open_meteo_url")]
    pub open_meteo_url: String,
    #[serde(default = "default_nominatim_url")]
    pub nominatim_url: String,
    #[serde(default = "default_weather_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for WeatherProviderSection {
    fn default() -> Self {
        Self {
            open_meteo_url: default_open_meteo_url(),
            nominatim_url: default_nominatim_url(),
            timeout_secs: default_weather_timeout_secs(),
        }
    }
}

fn default_open_meteo_url() -> String {
    "https://api.open-meteo.com/v1/forecast".to_string()
}

fn default_nominatim_url() -> String {
    "https://nominatim.openstreetmap.org/search".to_string()
}

fn default_weather_timeout_secs() -> u64 {
    15
}

/// [providers.search] 段：Tavily 搜索端点与结果数
#[derive(Debug, Clone, Deserialize)]
pub struct SearchProviderSection {
    #[serde(default = "default_tavily_url")]
    pub tavily_url: String,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_search_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SearchProviderSection {
    fn default() -> Self {
        Self {
            tavily_url: default_tavily_url(),
            max_results: default_max_results(),
            timeout_secs: default_search_timeout_secs(),
        }
    }
}

fn default_tavily_url() -> String {
    "https://api.tavily.com/search".to_string()
}

fn default_max_results() -> usize {
    5
}

fn default_search_timeout_secs() -> u64 {
    30
}

/// [server] 段：HTTP 监听地址
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

/// [slack] 段：签名校验时间窗
#[derive(Debug, Clone, Deserialize)]
pub struct SlackSection {
    /// 请求时间戳允许的偏差（秒）
    #[serde(default = "default_signature_window_secs")]
    pub signature_window_secs: u64,
}

impl Default for SlackSection {
    fn default() -> Self {
        Self {
            signature_window_secs: default_signature_window_secs(),
        }
    }
}

fn default_signature_window_secs() -> u64 {
    300
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app: AppSection::default(),
            oracle: OracleSection::default(),
            tools: ToolsSection::default(),
            routing: RoutingSection::default(),
            providers: ProvidersSection::default(),
            server: ServerSection::default(),
            slack: SlackSection::default(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 AIDE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 AIDE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("AIDE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
