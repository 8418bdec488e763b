//! 接入渠道：HTTP 与 Slack 适配器，把外部事件归一化为 IncomingRequest

pub mod http;
pub mod slack;

pub use http::HttpState;
pub use slack::SlackState;
