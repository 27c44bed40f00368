//! Knowledge-base retrieval for diagram and chat prompts.
//!
//! The knowledge base itself lives in a separate service. This module talks
//! to it over the context-harness tool API:
//!
//! ```text
//! POST {endpoint}/tools/search   { "query": "...", "limit": 5 }
//! 200 → { "result": { "results": [ { "title": "...", "snippet": "..." } ] } }
//! ```
//!
//! Retrieval is best-effort: [`retrieve_context`] logs failures and returns
//! an empty context instead of failing the chat turn.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::KnowledgeConfig;

#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    /// Returns up to `limit` text snippets relevant to `query`.
    async fn retrieve(&self, query: &str, limit: usize) -> Result<Vec<String>>;
}

/// Used when no `knowledge.endpoint` is configured.
pub struct NoKnowledge;

#[async_trait]
impl KnowledgeBase for NoKnowledge {
    async fn retrieve(&self, _query: &str, _limit: usize) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

pub struct HttpKnowledgeBase {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpKnowledgeBase {
    pub fn new(endpoint: &str, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl KnowledgeBase for HttpKnowledgeBase {
    async fn retrieve(&self, query: &str, limit: usize) -> Result<Vec<String>> {
        let url = format!("{}/tools/search", self.endpoint);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "query": query, "limit": limit }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("knowledge search failed {}: {}", status, body);
        }

        let json: serde_json::Value = resp.json().await?;
        Ok(parse_search_results(&json, limit))
    }
}

/// Pulls `result.results[].snippet` (prefixed by the title when present).
fn parse_search_results(json: &serde_json::Value, limit: usize) -> Vec<String> {
    json.get("result")
        .and_then(|r| r.get("results"))
        .and_then(|r| r.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let snippet = item.get("snippet")?.as_str()?.trim();
                    if snippet.is_empty() {
                        return None;
                    }
                    Some(match item.get("title").and_then(|t| t.as_str()) {
                        Some(title) if !title.trim().is_empty() => {
                            format!("{}: {}", title.trim(), snippet)
                        }
                        _ => snippet.to_string(),
                    })
                })
                .take(limit)
                .collect()
        })
        .unwrap_or_default()
}

pub fn create_knowledge_base(config: &KnowledgeConfig) -> Result<Arc<dyn KnowledgeBase>> {
    match &config.endpoint {
        Some(endpoint) => Ok(Arc::new(HttpKnowledgeBase::new(
            endpoint,
            config.timeout_secs,
        )?)),
        None => Ok(Arc::new(NoKnowledge)),
    }
}

/// Retrieves context for a prompt, degrading to an empty list on error.
pub async fn retrieve_context(kb: &dyn KnowledgeBase, query: &str, limit: usize) -> Vec<String> {
    match kb.retrieve(query, limit).await {
        Ok(snippets) => snippets,
        Err(e) => {
            eprintln!("Warning: knowledge retrieval failed: {}", e);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_search_results() {
        let json = serde_json::json!({
            "result": { "results": [
                { "title": "VPC guide", "snippet": "Subnets span one AZ." },
                { "title": null, "snippet": "RDS runs in private subnets." },
                { "title": "empty", "snippet": "   " }
            ]}
        });
        let out = parse_search_results(&json, 5);
        assert_eq!(
            out,
            vec![
                "VPC guide: Subnets span one AZ.".to_string(),
                "RDS runs in private subnets.".to_string()
            ]
        );
    }

    #[test]
    fn test_parse_search_results_respects_limit() {
        let json = serde_json::json!({
            "result": { "results": [
                { "snippet": "a" }, { "snippet": "b" }, { "snippet": "c" }
            ]}
        });
        assert_eq!(parse_search_results(&json, 2).len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_degrades_to_empty() {
        let kb = HttpKnowledgeBase::new("http://127.0.0.1:9", 1).unwrap();
        let out = retrieve_context(&kb, "vpc", 3).await;
        assert!(out.is_empty());
    }
}
