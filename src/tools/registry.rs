//! 能力 Agent 注册表
//!
//! 所有 Agent 实现 CapabilityAgent trait，由 AgentRegistry 按名注册与查找；
//! 能力清单（名称 + 操作签名）由此生成，注入路由 prompt。

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::tools::contract::{CapabilityAgent, OperationSpec};

/// Agent 注册表：按名称存储 Arc<dyn CapabilityAgent>
#[derive(Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn CapabilityAgent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: impl CapabilityAgent + 'static) {
        let name = agent.name().to_string();
        self.agents.insert(name, Arc::new(agent));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CapabilityAgent>> {
        self.agents.get(name).cloned()
    }

    pub fn agent_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.keys().cloned().collect();
        names.sort();
        names
    }

    /// 查询某 Agent 的操作描述；不存在返回 None
    pub fn operation(&self, agent: &str, operation: &str) -> Option<OperationSpec> {
        self.agents
            .get(agent)?
            .operations()
            .into_iter()
            .find(|op| op.name == operation)
    }

    /// 某个 (agent, operation) 组合是否在清单内
    pub fn supports(&self, agent: &str, operation: &str) -> bool {
        self.operation(agent, operation).is_some()
    }

    /// 生成能力清单 JSON：Agent 名称、描述、操作签名，注入路由 prompt
    pub fn manifest_json(&self) -> String {
        let mut names = self.agent_names();
        names.sort();
        let manifest: Vec<Value> = names
            .iter()
            .filter_map(|name| self.agents.get(name))
            .map(|agent| {
                serde_json::json!({
                    "agent": agent.name(),
                    "description": agent.description(),
                    "operations": agent.operations(),
                })
            })
            .collect();
        serde_json::to_string_pretty(&manifest).unwrap_or_else(|_| "[]".to_string())
    }
}
