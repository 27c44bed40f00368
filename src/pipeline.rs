//! End-to-end diagram generation and chat turns.
//!
//! ```text
//! prompt ─► knowledge retrieval ─► component extraction ─► layout synthesis ─► store
//! ```
//!
//! [`DiagramPipeline::generate`] runs the chain for one prompt and returns
//! the stored filename. [`DiagramPipeline::chat_turn`] classifies a chat
//! message first: diagram requests go through `generate`, everything else
//! gets a plain completion. A failed diagram never fails the turn; the
//! reply degrades to text.

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;

use crate::classify::{is_image_generation_request, is_network_diagram_request};
use crate::config::Config;
use crate::extractor::{ComponentExtractor, ComponentSource};
use crate::knowledge::{create_knowledge_base, retrieve_context, KnowledgeBase};
use crate::layout::{synthesize, LayoutOptions};
use crate::llm::{create_chat_model, ChatMessage, ChatModel, ChatRequest};
use crate::models::{Connection, DiagramRequest};
use crate::store::DiagramStore;

const ANSWER_SYSTEM: &str = "You are a helpful assistant for infrastructure and migration \
questions. Answer concisely and ground your answer in the provided knowledge base context \
when it is relevant.";

/// Result of one diagram generation.
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedDiagram {
    pub filename: String,
    pub title: String,
    pub seed: u64,
    pub layout: &'static str,
    pub network: bool,
    /// `llm`, or `template:<name>` when extraction fell back.
    pub source: String,
    /// Connections whose endpoints matched no node.
    pub dropped_connections: Vec<Connection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatReply {
    pub reply: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagram: Option<GeneratedDiagram>,
}

pub struct DiagramPipeline {
    model: Arc<dyn ChatModel>,
    extractor: ComponentExtractor,
    knowledge: Arc<dyn KnowledgeBase>,
    store: DiagramStore,
    knowledge_limit: usize,
    temperature: f32,
}

impl DiagramPipeline {
    pub fn new(
        model: Arc<dyn ChatModel>,
        knowledge: Arc<dyn KnowledgeBase>,
        store: DiagramStore,
        config: &Config,
    ) -> Self {
        Self {
            extractor: ComponentExtractor::new(model.clone(), config.llm.temperature),
            model,
            knowledge,
            store,
            knowledge_limit: config.knowledge.limit,
            temperature: config.llm.temperature,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(
            create_chat_model(&config.llm)?,
            create_knowledge_base(&config.knowledge)?,
            DiagramStore::new(&config.storage.generated_dir),
            config,
        ))
    }

    pub fn store(&self) -> &DiagramStore {
        &self.store
    }

    /// Generates and stores one diagram.
    ///
    /// `context` is prepended to whatever the knowledge base returns for
    /// `prompt`. Only storage failures are errors; LLM and knowledge-base
    /// failures degrade inside the chain.
    pub async fn generate(
        &self,
        prompt: &str,
        context: &[String],
        options: LayoutOptions,
    ) -> Result<GeneratedDiagram> {
        let mut snippets = context.to_vec();
        snippets.extend(
            retrieve_context(self.knowledge.as_ref(), prompt, self.knowledge_limit).await,
        );

        let request = DiagramRequest::new(prompt).with_context(snippets);
        let extraction = self.extractor.extract(&request).await;
        let synthesis = synthesize(&extraction.components, &options);
        let xml = synthesis.document.to_xml()?;
        let stored = self.store.save(&xml, &extraction.components)?;

        Ok(GeneratedDiagram {
            filename: stored.filename,
            title: extraction.components.title,
            seed: synthesis.seed,
            layout: synthesis.kind.name(),
            network: options.network,
            source: match extraction.source {
                ComponentSource::Llm => "llm".to_string(),
                ComponentSource::Template { name, .. } => format!("template:{}", name),
            },
            dropped_connections: synthesis.dropped_connections,
            explanation: extraction.explanation,
        })
    }

    /// Answers one chat message, generating a diagram when asked for one.
    pub async fn chat_turn(&self, message: &str, context: &[String]) -> ChatReply {
        if is_image_generation_request(message) {
            let network = is_network_diagram_request(message);
            match self
                .generate(message, context, LayoutOptions::random(network))
                .await
            {
                Ok(diagram) => {
                    let reply = diagram
                        .explanation
                        .clone()
                        .unwrap_or_else(|| format!("Here is a diagram of {}.", diagram.title));
                    return ChatReply {
                        reply,
                        diagram: Some(diagram),
                    };
                }
                Err(e) => {
                    eprintln!("Error: diagram generation failed: {:#}", e);
                }
            }
        }

        ChatReply {
            reply: self.answer(message, context).await,
            diagram: None,
        }
    }

    /// Plain completion with knowledge context, or a text fallback.
    async fn answer(&self, message: &str, context: &[String]) -> String {
        let mut snippets = context.to_vec();
        snippets.extend(
            retrieve_context(self.knowledge.as_ref(), message, self.knowledge_limit).await,
        );

        let mut user = message.trim().to_string();
        if !snippets.is_empty() {
            user.push_str("\n\nKnowledge base context:\n");
            for s in &snippets {
                user.push_str("- ");
                user.push_str(s.trim());
                user.push('\n');
            }
        }

        let request = ChatRequest {
            messages: vec![ChatMessage::system(ANSWER_SYSTEM), ChatMessage::user(user)],
            temperature: self.temperature,
            json_mode: false,
        };
        match self.model.complete(&request).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => fallback_answer(&snippets),
            Err(e) => {
                eprintln!("Warning: chat completion failed: {}", e);
                fallback_answer(&snippets)
            }
        }
    }
}

fn fallback_answer(snippets: &[String]) -> String {
    if snippets.is_empty() {
        "The assistant is unavailable right now. Please try again later.".to_string()
    } else {
        let mut out = "The assistant is unavailable right now. Related knowledge base entries:\n"
            .to_string();
        for s in snippets {
            out.push_str("- ");
            out.push_str(s.trim());
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DiagramDocument;
    use crate::knowledge::NoKnowledge;
    use crate::layout::NETWORK_SHAPES;
    use crate::llm::DisabledChat;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

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
                .ok_or_else(|| anyhow::anyhow!("no scripted answer left"))
        }
    }

    struct FixedKnowledge(Vec<String>);

    #[async_trait]
    impl KnowledgeBase for FixedKnowledge {
        async fn retrieve(&self, _query: &str, limit: usize) -> Result<Vec<String>> {
            Ok(self.0.iter().take(limit).cloned().collect())
        }
    }

    fn pipeline(
        model: Arc<dyn ChatModel>,
        knowledge: Arc<dyn KnowledgeBase>,
        dir: &std::path::Path,
    ) -> DiagramPipeline {
        DiagramPipeline::new(model, knowledge, DiagramStore::new(dir), &Config::minimal())
    }

    #[tokio::test]
    async fn test_generate_with_disabled_llm_uses_template() {
        let tmp = TempDir::new().unwrap();
        let p = pipeline(Arc::new(DisabledChat), Arc::new(NoKnowledge), tmp.path());

        let d = p
            .generate("Migrate Windows servers to Linux", &[], LayoutOptions::seeded(3, false))
            .await
            .unwrap();
        assert_eq!(d.source, "template:os-migration");
        assert_eq!(d.title, "Operating System Migration");
        assert_eq!(d.seed, 3);
        assert!(d.dropped_connections.is_empty());

        let xml = p.store().read_source(&d.filename).unwrap();
        let doc = DiagramDocument::parse(&xml).unwrap();
        assert_eq!(doc.find("node-0").unwrap().value, "Migration Orchestrator");
    }

    #[tokio::test]
    async fn test_generate_reports_dropped_connections() {
        let tmp = TempDir::new().unwrap();
        let json = r#"{"title":"Shop","nodes":["API","DB"],
            "connections":[{"from":"api","to":"db"},{"from":"API","to":"Cache"}],
            "categories":{"Tier":["web"]}}"#;
        let model = Arc::new(ScriptedModel::new(&["An API over a DB.", json]));
        let p = pipeline(model.clone(), Arc::new(NoKnowledge), tmp.path());

        let d = p
            .generate("draw the shop", &[], LayoutOptions::seeded(1, false))
            .await
            .unwrap();
        assert_eq!(d.source, "llm");
        assert_eq!(d.explanation.as_deref(), Some("An API over a DB."));
        assert_eq!(d.dropped_connections, vec![Connection::new("API", "Cache", None)]);
    }

    #[tokio::test]
    async fn test_knowledge_context_reaches_the_model() {
        let tmp = TempDir::new().unwrap();
        let model = Arc::new(ScriptedModel::new(&[]));
        let kb = Arc::new(FixedKnowledge(vec!["RDS lives in private subnets".into()]));
        let p = pipeline(model.clone(), kb, tmp.path());

        p.generate("draw our VPC", &["caller note".into()], LayoutOptions::seeded(1, true))
            .await
            .unwrap();
        let seen = model.seen.lock().unwrap();
        let prompt = &seen[0].messages[1].content;
        assert!(prompt.contains("- caller note"));
        assert!(prompt.contains("- RDS lives in private subnets"));
        assert!(prompt.contains("[request-id: "));
    }

    #[tokio::test]
    async fn test_question_gets_text_only() {
        let tmp = TempDir::new().unwrap();
        let model = Arc::new(ScriptedModel::new(&["RiverMeadow is a migration platform."]));
        let p = pipeline(model, Arc::new(NoKnowledge), tmp.path());

        let reply = p.chat_turn("What is RiverMeadow?", &[]).await;
        assert!(reply.diagram.is_none());
        assert_eq!(reply.reply, "RiverMeadow is a migration platform.");
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_network_request_uses_network_shapes() {
        let tmp = TempDir::new().unwrap();
        let p = pipeline(Arc::new(DisabledChat), Arc::new(NoKnowledge), tmp.path());

        let reply = p
            .chat_turn("Create a network diagram for AWS VPC with EC2 and RDS", &[])
            .await;
        let diagram = reply.diagram.expect("diagram expected");
        assert!(diagram.network);

        let xml = p.store().read_source(&diagram.filename).unwrap();
        let doc = DiagramDocument::parse(&xml).unwrap();
        for node in doc.vertices().filter(|c| c.id.starts_with("node-")) {
            assert!(NETWORK_SHAPES.contains(&node.style.shape()));
        }
    }

    #[tokio::test]
    async fn test_storage_failure_degrades_to_text() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("not-a-dir");
        std::fs::write(&blocker, "x").unwrap();
        let p = pipeline(Arc::new(DisabledChat), Arc::new(NoKnowledge), &blocker);

        let reply = p.chat_turn("Draw a diagram of our CI pipeline", &[]).await;
        assert!(reply.diagram.is_none());
        assert!(reply.reply.contains("unavailable"));
    }

    #[test]
    fn test_fallback_answer_lists_snippets() {
        let text = fallback_answer(&["a".into(), " b ".into()]);
        assert!(text.ends_with("- a\n- b\n"));
    }
}
