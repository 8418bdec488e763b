//! 能力 Agent 集合：邮件 / 日历 / 天气 / 搜索
//!
//! 每个 Agent 是一个外部领域的有界封装：校验参数、调用 Provider、
//! 把 Provider 专有错误映射为统一错误分类。Provider trait 是接入真实
//! 账号（Gmail、Google Calendar 等）的缝。

pub mod calendar;
pub mod email;
pub mod search;
pub mod weather;

pub use calendar::{CalendarAgent, CalendarProvider, UnconfiguredCalendarProvider};
pub use email::{EmailAgent, MailProvider, UnconfiguredMailProvider};
pub use search::{SearchAgent, SearchProvider, TavilyProvider};
pub use weather::{OpenMeteoProvider, WeatherAgent, WeatherProvider};
