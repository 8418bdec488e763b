//! 编排层错误类型
//!
//! 工具层错误永远不以 Err 穿透契约层（见 tools::contract）；持久化失败由
//! session::StoreError 承载。这里只定义编排自身的错误。

use thiserror::Error;

/// 编排过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AssistantError {
    /// Oracle 暂不可用；调用方降级为固定回复，不阻塞回合
    #[error("oracle unavailable: {0}")]
    OracleUnavailable(String),

    /// Oracle 输出无法解析为封闭决策集
    #[error("malformed oracle decision: {0}")]
    MalformedDecision(String),

    /// 跨回合计划被放弃（前序结果缺失或计划超时），回合降级为直答
    #[error("plan abandoned: {0}")]
    PlanAbandoned(String),
}
