//! Core data models for the diagram pipeline.
//!
//! A [`DiagramRequest`] is built per chat turn, turned into
//! [`DiagramComponents`] by the extractor, laid out into a diagram document,
//! and finally rendered on demand into a [`RenderedArtifact`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-turn input to the diagram pipeline. Never persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagramRequest {
    pub prompt: String,
    #[serde(default)]
    pub knowledge_context: Vec<String>,
}

impl DiagramRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            knowledge_context: Vec::new(),
        }
    }

    pub fn with_context(mut self, context: Vec<String>) -> Self {
        self.knowledge_context = context;
        self
    }
}

/// A directed link between two named nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Connection {
    pub fn new(from: &str, to: &str, label: Option<&str>) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            label: label.map(str::to_string),
        }
    }
}

/// Structured description of a diagram: the intermediate form between the
/// LLM and the layout stage.
///
/// The first entry of `nodes` is the primary entity and is always placed
/// at the center of the layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagramComponents {
    pub title: String,
    pub nodes: Vec<String>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub categories: BTreeMap<String, Vec<String>>,
}

impl DiagramComponents {
    /// True when title, nodes and categories are all non-empty.
    pub fn is_complete(&self) -> bool {
        !self.title.trim().is_empty()
            && !self.nodes.is_empty()
            && self.nodes.iter().all(|n| !n.trim().is_empty())
            && !self.categories.is_empty()
    }
}

/// Output format of a rendered artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactFormat {
    Svg,
    Png,
    /// Raw diagram-description source (drawio XML or D2 text).
    Source,
}

impl ArtifactFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            ArtifactFormat::Svg => "image/svg+xml",
            ArtifactFormat::Png => "image/png",
            ArtifactFormat::Source => "application/xml",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactFormat::Svg => "svg",
            ArtifactFormat::Png => "png",
            ArtifactFormat::Source => "drawio",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "svg" => Some(ArtifactFormat::Svg),
            "png" => Some(ArtifactFormat::Png),
            "source" | "xml" | "drawio" => Some(ArtifactFormat::Source),
            _ => None,
        }
    }
}

/// Bytes produced by a render call. Rebuilt on every request and never
/// cached; `cache_key` is unique per response.
#[derive(Debug, Clone)]
pub struct RenderedArtifact {
    pub format: ArtifactFormat,
    pub bytes: Vec<u8>,
    pub cache_key: String,
}

impl RenderedArtifact {
    /// Wraps rendered bytes with a fresh cache key: a content digest
    /// prefix plus a per-response nonce.
    pub fn new(format: ArtifactFormat, bytes: Vec<u8>) -> Self {
        use sha2::{Digest, Sha256};
        let digest = hex::encode(Sha256::digest(&bytes));
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let cache_key = format!("{}-{}", &digest[..16], &nonce[..8]);
        Self {
            format,
            bytes,
            cache_key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_components_json_shape() {
        let json = r#"{
            "title": "Web tier",
            "nodes": ["ALB", "EC2"],
            "connections": [{"from": "ALB", "to": "EC2"}],
            "categories": {"Compute": ["EC2"]}
        }"#;
        let c: DiagramComponents = serde_json::from_str(json).unwrap();
        assert!(c.is_complete());
        assert_eq!(c.connections[0].label, None);
    }

    #[test]
    fn test_incomplete_components() {
        let c = DiagramComponents {
            title: " ".into(),
            nodes: vec!["A".into()],
            connections: vec![],
            categories: BTreeMap::from([("x".into(), vec!["y".into()])]),
        };
        assert!(!c.is_complete());
    }

    #[test]
    fn test_cache_keys_differ_for_same_bytes() {
        let a = RenderedArtifact::new(ArtifactFormat::Svg, b"<svg/>".to_vec());
        let b = RenderedArtifact::new(ArtifactFormat::Svg, b"<svg/>".to_vec());
        assert_eq!(a.bytes, b.bytes);
        assert_ne!(a.cache_key, b.cache_key);
        assert_eq!(&a.cache_key[..16], &b.cache_key[..16]);
    }
}
