//! Aide - 个人助理编排核心
//!
//! 模块划分：
//! - **agents**: 能力 Agent（邮件 / 日历 / 天气 / 搜索）与 Provider 抽象
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 路由、聚合、回合编排与并发调度
//! - **integrations**: 入站适配器（HTTP API、Slack 事件）
//! - **observability**: tracing 初始化
//! - **oracle**: 推理 Oracle 抽象与实现（OpenAI 兼容 / Mock）、决策解析
//! - **session**: 会话模型（Conversation / Turn / PendingPlan）与存储
//! - **tools**: 统一工具契约（ToolCall / ToolResult）、注册表与执行器

pub mod agents;
pub mod config;
pub mod core;
pub mod integrations;
pub mod observability;
pub mod oracle;
pub mod session;
pub mod tools;
