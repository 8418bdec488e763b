//! 网络搜索能力 Agent
//!
//! 操作：query。只读。Provider 实现：Tavily 搜索 API。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::SearchProviderSection;
use crate::tools::contract::{
    optional_str, optional_u64, require_str, AgentReply, CapabilityAgent, OperationSpec,
    ProviderError,
};

/// 单条搜索命中
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// 一次搜索的结果
#[derive(Debug, Clone, Serialize)]
pub struct SearchResults {
    pub query: String,
    /// Provider 给出的直接答案（如有）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    pub results: Vec<SearchHit>,
}

/// 搜索深度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchDepth {
    Basic,
    Advanced,
}

impl SearchDepth {
    fn as_str(self) -> &'static str {
        match self {
            SearchDepth::Basic => "basic",
            SearchDepth::Advanced => "advanced",
        }
    }
}

/// 搜索 Provider 抽象
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn query(
        &self,
        query: &str,
        depth: SearchDepth,
        max_results: usize,
    ) -> Result<SearchResults, ProviderError>;
}

/// 搜索 Agent
pub struct SearchAgent {
    provider: std::sync::Arc<dyn SearchProvider>,
    default_max_results: usize,
}

impl SearchAgent {
    pub fn new(provider: std::sync::Arc<dyn SearchProvider>, default_max_results: usize) -> Self {
        Self {
            provider,
            default_max_results,
        }
    }
}

#[async_trait]
impl CapabilityAgent for SearchAgent {
    fn name(&self) -> &str {
        "search"
    }

    fn description(&self) -> &str {
        "Web search: current events, facts, and anything outside the other capabilities."
    }

    fn operations(&self) -> Vec<OperationSpec> {
        vec![OperationSpec {
            name: "query",
            description: "Run a web search and return titles, URLs and snippets",
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "depth": {"type": "string", "enum": ["basic", "advanced"]},
                    "max_results": {"type": "integer", "minimum": 1, "maximum": 10}
                },
                "required": ["query"]
            }),
            mutating: false,
        }]
    }

    async fn invoke(&self, operation: &str, parameters: &Value) -> Result<AgentReply, ProviderError> {
        match operation {
            "query" => {
                let query = require_str(parameters, "query")?;
                let depth = match optional_str(parameters, "depth") {
                    None | Some("basic") => SearchDepth::Basic,
                    Some("advanced") => SearchDepth::Advanced,
                    Some(other) => {
                        return Err(ProviderError::InvalidInput(format!(
                            "depth must be 'basic' or 'advanced', got '{other}'"
                        )))
                    }
                };
                let max_results = optional_u64(parameters, "max_results")?
                    .map(|n| n.clamp(1, 10) as usize)
                    .unwrap_or(self.default_max_results);

                let results = self.provider.query(query, depth, max_results).await?;
                let payload = serde_json::to_value(&results)
                    .map_err(|e| ProviderError::Other(e.to_string()))?;
                Ok(AgentReply::Complete(payload))
            }
            other => Err(ProviderError::InvalidInput(format!(
                "unknown search operation '{other}'"
            ))),
        }
    }
}

/// Tavily HTTP Provider
pub struct TavilyProvider {
    http: reqwest::Client,
    url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct TavilyHit {
    title: String,
    url: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    results: Vec<TavilyHit>,
}

impl TavilyProvider {
    pub fn new(cfg: &SearchProviderSection, api_key: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(cfg.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            http,
            url: cfg.tavily_url.clone(),
            api_key,
        }
    }

    fn map_http_error(e: reqwest::Error) -> ProviderError {
        match e.status().map(|s| s.as_u16()) {
            Some(401) | Some(403) => ProviderError::AuthExpired(e.to_string()),
            Some(429) => ProviderError::RateLimited(e.to_string()),
            Some(400) | Some(422) => ProviderError::InvalidInput(e.to_string()),
            _ => ProviderError::Unavailable(e.to_string()),
        }
    }
}

#[async_trait]
impl SearchProvider for TavilyProvider {
    async fn query(
        &self,
        query: &str,
        depth: SearchDepth,
        max_results: usize,
    ) -> Result<SearchResults, ProviderError> {
        if self.api_key.is_empty() {
            return Err(ProviderError::AuthExpired(
                "search API key is not configured".to_string(),
            ));
        }

        let body = json!({
            "api_key": self.api_key,
            "query": query,
            "search_depth": depth.as_str(),
            "include_answer": true,
            "max_results": max_results,
        });

        let response: TavilyResponse = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(Self::map_http_error)?
            .error_for_status()
            .map_err(Self::map_http_error)?
            .json()
            .await
            .map_err(Self::map_http_error)?;

        Ok(SearchResults {
            query: query.to_string(),
            answer: response.answer.filter(|a| !a.trim().is_empty()),
            results: response
                .results
                .into_iter()
                .take(max_results)
                .map(|hit| SearchHit {
                    title: hit.title,
                    url: hit.url,
                    snippet: hit.content,
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct CannedSearch;

    #[async_trait]
    impl SearchProvider for CannedSearch {
        async fn query(
            &self,
            query: &str,
            _depth: SearchDepth,
            max_results: usize,
        ) -> Result<SearchResults, ProviderError> {
            Ok(SearchResults {
                query: query.to_string(),
                answer: Some("42".to_string()),
                results: (0..max_results)
                    .map(|i| SearchHit {
                        title: format!("Result {i}"),
                        url: format!("https://example.com/{i}"),
                        snippet: "snippet".to_string(),
                    })
                    .collect(),
            })
        }
    }

    #[tokio::test]
    async fn test_query_returns_hits() {
        let agent = SearchAgent::new(Arc::new(CannedSearch), 5);
        let reply = agent
            .invoke("query", &json!({"query": "rust news", "max_results": 2}))
            .await
            .unwrap();
        let AgentReply::Complete(payload) = reply else {
            panic!("expected complete reply");
        };
        assert_eq!(payload["results"].as_array().unwrap().len(), 2);
        assert_eq!(payload["answer"], "42");
    }

    #[tokio::test]
    async fn test_bad_depth_rejected() {
        let agent = SearchAgent::new(Arc::new(CannedSearch), 5);
        let err = agent
            .invoke("query", &json!({"query": "x", "depth": "extreme"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_missing_api_key_is_auth_expired() {
        let provider = TavilyProvider::new(&SearchProviderSection::default(), String::new());
        let err = provider
            .query("anything", SearchDepth::Basic, 3)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::AuthExpired(_)));
    }
}
