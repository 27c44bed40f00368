//! Component extraction: free-text prompt → [`DiagramComponents`].
//!
//! Two chained completions:
//!
//! 1. an *explain* call that asks for a technical walkthrough of the topic,
//!    enriched with knowledge-base snippets;
//! 2. a *structure* call in JSON mode that turns prompt + walkthrough into
//!    `{ title, nodes, connections, categories }`.
//!
//! Both prompts carry a uniqueness token (timestamp + random value) so that
//! near-identical prompts do not get served a cached answer upstream.
//!
//! Any failure (transport, malformed JSON, missing keys, empty lists) falls
//! back to a hand-authored template; [`ComponentExtractor::extract`] never
//! returns an error.

use anyhow::{bail, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::llm::{ChatMessage, ChatModel, ChatRequest};
use crate::models::{Connection, DiagramComponents, DiagramRequest};
use crate::templates;

/// Upper bound on nodes taken from an LLM answer.
const MAX_NODES: usize = 14;
/// Upper bound on knowledge snippets folded into the explain prompt.
const MAX_CONTEXT_SNIPPETS: usize = 8;

const EXPLAIN_SYSTEM: &str = "You are a senior solutions architect. Explain the requested \
migration or architecture topic in technical depth: the main systems involved, how data and \
control flow between them, and the supporting concerns around them.";

const STRUCTURE_SYSTEM: &str = "You convert architecture explanations into diagram data. \
Respond with a single JSON object and nothing else, shaped as \
{\"title\": string, \"nodes\": [string], \"connections\": [{\"from\": string, \"to\": string, \
\"label\": string}], \"categories\": {string: [string]}}. The first node is the primary \
component. Every connection endpoint must be one of the node names. Use 4 to 12 nodes and \
2 to 4 categories.";

/// Where the returned components came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentSource {
    Llm,
    Template { name: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct Extraction {
    pub components: DiagramComponents,
    /// Walkthrough text from the explain call, when it succeeded.
    pub explanation: Option<String>,
    pub source: ComponentSource,
}

pub struct ComponentExtractor {
    model: Arc<dyn ChatModel>,
    temperature: f32,
}

impl ComponentExtractor {
    pub fn new(model: Arc<dyn ChatModel>, temperature: f32) -> Self {
        Self { model, temperature }
    }

    /// Runs both completions and validates the result, falling back to a
    /// template on any failure.
    pub async fn extract(&self, request: &DiagramRequest) -> Extraction {
        let token = uniqueness_token();
        let mut explanation = None;

        let outcome = async {
            let explained = self.explain(request, &token).await?;
            explanation = Some(explained.clone());
            let raw = self.structure(request, &explained, &token).await?;
            parse_components(&raw)
        }
        .await;

        match outcome {
            Ok(components) => Extraction {
                components,
                explanation,
                source: ComponentSource::Llm,
            },
            Err(e) => {
                let now = chrono::Utc::now().timestamp_millis();
                let kind = templates::select_template(&request.prompt, now);
                eprintln!(
                    "Warning: component extraction failed ({}); using {} template",
                    e,
                    kind.name()
                );
                Extraction {
                    components: templates::template_components(kind, &request.prompt),
                    explanation,
                    source: ComponentSource::Template {
                        name: kind.name(),
                        reason: e.to_string(),
                    },
                }
            }
        }
    }

    async fn explain(&self, request: &DiagramRequest, token: &str) -> Result<String> {
        let mut user = format!("Explain in technical depth: {}\n", request.prompt.trim());
        let snippets: Vec<&String> = request
            .knowledge_context
            .iter()
            .filter(|s| !s.trim().is_empty())
            .take(MAX_CONTEXT_SNIPPETS)
            .collect();
        if !snippets.is_empty() {
            user.push_str("\nKnowledge base context:\n");
            for s in snippets {
                user.push_str("- ");
                user.push_str(s.trim());
                user.push('\n');
            }
        }
        user.push_str(&format!("\n[request-id: {}]", token));

        let text = self
            .model
            .complete(&ChatRequest {
                messages: vec![ChatMessage::system(EXPLAIN_SYSTEM), ChatMessage::user(user)],
                temperature: self.temperature,
                json_mode: false,
            })
            .await?;
        if text.trim().is_empty() {
            bail!("explain call returned no content");
        }
        Ok(text)
    }

    async fn structure(
        &self,
        request: &DiagramRequest,
        explanation: &str,
        token: &str,
    ) -> Result<String> {
        let user = format!(
            "Request: {}\n\nExplanation:\n{}\n\nReturn the diagram JSON now. [request-id: {}]",
            request.prompt.trim(),
            explanation.trim(),
            token
        );
        self.model
            .complete(&ChatRequest {
                messages: vec![ChatMessage::system(STRUCTURE_SYSTEM), ChatMessage::user(user)],
                temperature: self.temperature,
                json_mode: true,
            })
            .await
    }
}

/// `<unix millis>-<8 hex chars>`, unique per call.
pub fn uniqueness_token() -> String {
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", chrono::Utc::now().timestamp_millis(), &nonce[..8])
}

#[derive(Deserialize)]
struct RawComponents {
    title: Option<String>,
    nodes: Option<Vec<String>>,
    connections: Option<Vec<RawConnection>>,
    categories: Option<BTreeMap<String, Vec<String>>>,
}

#[derive(Deserialize)]
struct RawConnection {
    from: Option<String>,
    to: Option<String>,
    label: Option<String>,
}

/// Parses and validates an LLM answer.
///
/// Accepts prose around the JSON object (the outermost `{ ... }` is used).
/// Rejects answers missing any of the four keys or with an empty title,
/// node list or category map. Node names are trimmed and de-duplicated.
pub fn parse_components(raw: &str) -> Result<DiagramComponents> {
    let json = extract_json_object(raw)
        .ok_or_else(|| anyhow::anyhow!("no JSON object in LLM answer"))?;
    let parsed: RawComponents = serde_json::from_str(json)
        .map_err(|e| anyhow::anyhow!("malformed JSON in LLM answer: {}", e))?;

    let title = parsed
        .title
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| anyhow::anyhow!("missing title"))?;

    let mut nodes: Vec<String> = Vec::new();
    for n in parsed.nodes.ok_or_else(|| anyhow::anyhow!("missing nodes"))? {
        let n = n.trim().to_string();
        if !n.is_empty() && !nodes.contains(&n) {
            nodes.push(n);
        }
    }
    nodes.truncate(MAX_NODES);
    if nodes.is_empty() {
        bail!("nodes must not be empty");
    }

    let connections = parsed
        .connections
        .ok_or_else(|| anyhow::anyhow!("missing connections"))?
        .into_iter()
        .filter_map(|c| {
            let from = c.from?.trim().to_string();
            let to = c.to?.trim().to_string();
            if from.is_empty() || to.is_empty() {
                return None;
            }
            let label = c
                .label
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty());
            Some(Connection { from, to, label })
        })
        .collect();

    let categories: BTreeMap<String, Vec<String>> = parsed
        .categories
        .ok_or_else(|| anyhow::anyhow!("missing categories"))?
        .into_iter()
        .filter_map(|(k, items)| {
            let k = k.trim().to_string();
            let items: Vec<String> = items
                .into_iter()
                .map(|i| i.trim().to_string())
                .filter(|i| !i.is_empty())
                .collect();
            (!k.is_empty() && !items.is_empty()).then_some((k, items))
        })
        .collect();
    if categories.is_empty() {
        bail!("categories must not be empty");
    }

    Ok(DiagramComponents {
        title,
        nodes,
        connections,
        categories,
    })
}

fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(&raw[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FailingModel;

    #[async_trait]
    impl ChatModel for FailingModel {
        fn model_name(&self) -> &str {
            "failing"
        }
        async fn complete(&self, _request: &ChatRequest) -> Result<String> {
            bail!("rate limited")
        }
    }

    /// Replays canned answers and records the prompts it was sent.
    struct ScriptedModel {
        answers: Mutex<Vec<String>>,
        seen: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedModel {
        fn new(answers: &[&str]) -> Self {
            Self {
                answers: Mutex::new(answers.iter().rev().map(|s| s.to_string()).collect()),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        fn model_name(&self) -> &str {
            "scripted"
        }
        async fn complete(&self, request: &ChatRequest) -> Result<String> {
            self.seen.lock().unwrap().push(request.clone());
            self.answers
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| anyhow::anyhow!("no more answers"))
        }
    }

    const GOOD_JSON: &str = r#"Sure! {"title": "VPC layout",
        "nodes": ["VPC", "EC2", "RDS", "EC2"],
        "connections": [{"from": "EC2", "to": "RDS", "label": "sql"}],
        "categories": {"Networking": ["VPC", "Subnets"]}}"#;

    #[tokio::test]
    async fn test_failing_model_falls_back_to_valid_template() {
        let extractor = ComponentExtractor::new(Arc::new(FailingModel), 0.7);
        for prompt in [
            "Create a network diagram for AWS VPC with EC2 and RDS",
            "What is RiverMeadow?",
            "",
        ] {
            let out = extractor.extract(&DiagramRequest::new(prompt)).await;
            assert!(out.components.is_complete(), "prompt {:?}", prompt);
            assert!(matches!(out.source, ComponentSource::Template { .. }));
            assert!(out.explanation.is_none());
        }
    }

    #[tokio::test]
    async fn test_two_chained_calls_with_uniqueness_token() {
        let model = Arc::new(ScriptedModel::new(&["A long explanation.", GOOD_JSON]));
        let extractor = ComponentExtractor::new(model.clone(), 0.5);
        let req = DiagramRequest::new("Diagram the VPC")
            .with_context(vec!["Subnets live in one AZ.".to_string()]);
        let out = extractor.extract(&req).await;

        assert_eq!(out.source, ComponentSource::Llm);
        assert_eq!(out.explanation.as_deref(), Some("A long explanation."));
        assert_eq!(out.components.nodes, vec!["VPC", "EC2", "RDS"]);

        let seen = model.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(!seen[0].json_mode);
        assert!(seen[1].json_mode);
        assert!(seen[0].messages[1].content.contains("Subnets live in one AZ."));
        assert!(seen[0].messages[1].content.contains("[request-id: "));
        assert!(seen[1].messages[1].content.contains("A long explanation."));
    }

    #[tokio::test]
    async fn test_malformed_structure_answer_keeps_explanation() {
        let model = Arc::new(ScriptedModel::new(&["Explanation.", "{not json"]));
        let extractor = ComponentExtractor::new(model, 0.5);
        let out = extractor
            .extract(&DiagramRequest::new("Draw the workflow steps"))
            .await;
        assert_eq!(out.explanation.as_deref(), Some("Explanation."));
        match out.source {
            ComponentSource::Template { name, .. } => assert_eq!(name, "process-workflow"),
            other => panic!("expected template, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_missing_keys() {
        assert!(parse_components(r#"{"title": "x", "nodes": ["a"], "connections": []}"#).is_err());
        assert!(parse_components(
            r#"{"title": "", "nodes": ["a"], "connections": [], "categories": {"c": ["d"]}}"#
        )
        .is_err());
        assert!(parse_components(
            r#"{"title": "x", "nodes": [], "connections": [], "categories": {"c": ["d"]}}"#
        )
        .is_err());
        assert!(parse_components("no json here").is_err());
    }

    #[test]
    fn test_parse_drops_empty_categories_and_endpoints() {
        let c = parse_components(
            r#"{"title": "x", "nodes": ["a", "b"],
                "connections": [{"from": "a", "to": ""}, {"from": "a", "to": "b", "label": " "}],
                "categories": {"empty": [], "ok": ["y"]}}"#,
        )
        .unwrap();
        assert_eq!(c.connections, vec![Connection::new("a", "b", None)]);
        assert_eq!(c.categories.len(), 1);
    }

    #[test]
    fn test_uniqueness_tokens_differ() {
        assert_ne!(uniqueness_token(), uniqueness_token());
    }
}
