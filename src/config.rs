//! TOML configuration for the diagram chat service.
//!
//! Every section except `[server]` has defaults, so a minimal file only
//! needs a bind address:
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:7340"
//!
//! [storage]
//! generated_dir = "./generated"
//!
//! [llm]
//! provider = "openai"
//! model = "gpt-4o-mini"
//!
//! [render]
//! cli_command = "d2"
//! browser_command = "chromium"
//!
//! [knowledge]
//! endpoint = "http://127.0.0.1:7331"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Directory holding generated `.drawio` documents and their sidecars.
    #[serde(default = "default_generated_dir")]
    pub generated_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            generated_dir: default_generated_dir(),
        }
    }
}

fn default_generated_dir() -> PathBuf {
    PathBuf::from("./generated")
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            temperature: default_temperature(),
            timeout_secs: default_llm_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_llm_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct RenderConfig {
    /// Fixed factor applied to document coordinates when emitting SVG.
    #[serde(default = "default_svg_scale")]
    pub svg_scale: f64,
    /// Upsampling factor used when rasterizing SVG to PNG.
    #[serde(default = "default_png_scale")]
    pub png_scale: f32,
    #[serde(default = "default_cli_command")]
    pub cli_command: String,
    #[serde(default = "default_cli_theme")]
    pub cli_theme: Option<String>,
    #[serde(default = "default_cli_layout")]
    pub cli_layout: Option<String>,
    #[serde(default = "default_tool_timeout_secs")]
    pub cli_timeout_secs: u64,
    /// Headless browser executable. Unset means in-process rasterization only.
    #[serde(default)]
    pub browser_command: Option<String>,
    #[serde(default = "default_tool_timeout_secs")]
    pub browser_timeout_secs: u64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            svg_scale: default_svg_scale(),
            png_scale: default_png_scale(),
            cli_command: default_cli_command(),
            cli_theme: default_cli_theme(),
            cli_layout: default_cli_layout(),
            cli_timeout_secs: default_tool_timeout_secs(),
            browser_command: None,
            browser_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

fn default_svg_scale() -> f64 {
    1.0
}
fn default_png_scale() -> f32 {
    2.0
}
fn default_cli_command() -> String {
    "d2".to_string()
}
fn default_cli_theme() -> Option<String> {
    Some("0".to_string())
}
fn default_cli_layout() -> Option<String> {
    Some("dagre".to_string())
}
fn default_tool_timeout_secs() -> u64 {
    12
}

#[derive(Debug, Deserialize, Clone)]
pub struct KnowledgeConfig {
    /// Base URL of a knowledge-base server exposing `POST /tools/search`.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_knowledge_limit")]
    pub limit: usize,
    #[serde(default = "default_knowledge_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            limit: default_knowledge_limit(),
            timeout_secs: default_knowledge_timeout_secs(),
        }
    }
}

fn default_knowledge_limit() -> usize {
    5
}
fn default_knowledge_timeout_secs() -> u64 {
    10
}

impl Config {
    /// Configuration used when no file is available: LLM disabled,
    /// generated files under `./generated`.
    pub fn minimal() -> Self {
        Self {
            server: ServerConfig {
                bind: "127.0.0.1:7340".to_string(),
            },
            storage: StorageConfig::default(),
            llm: LlmConfig::default(),
            render: RenderConfig::default(),
            knowledge: KnowledgeConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    match config.llm.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    if config.llm.is_enabled() && config.llm.model.is_none() {
        anyhow::bail!(
            "llm.model must be specified when provider is '{}'",
            config.llm.provider
        );
    }

    for (name, secs) in [
        ("llm.timeout_secs", config.llm.timeout_secs),
        ("render.cli_timeout_secs", config.render.cli_timeout_secs),
        ("render.browser_timeout_secs", config.render.browser_timeout_secs),
        ("knowledge.timeout_secs", config.knowledge.timeout_secs),
    ] {
        if !(1..=120).contains(&secs) {
            anyhow::bail!("{} must be in [1, 120]", name);
        }
    }

    if !(config.render.svg_scale > 0.0 && config.render.svg_scale <= 8.0) {
        anyhow::bail!("render.svg_scale must be in (0, 8]");
    }
    if !(config.render.png_scale > 0.0 && config.render.png_scale <= 8.0) {
        anyhow::bail!("render.png_scale must be in (0, 8]");
    }

    if config.knowledge.limit == 0 {
        anyhow::bail!("knowledge.limit must be >= 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_file_uses_defaults() {
        let cfg: Config = toml::from_str("[server]\nbind = \"127.0.0.1:0\"\n").unwrap();
        validate(&cfg).unwrap();
        assert!(!cfg.llm.is_enabled());
        assert_eq!(cfg.render.cli_command, "d2");
        assert_eq!(cfg.render.cli_timeout_secs, 12);
        assert_eq!(cfg.storage.generated_dir, PathBuf::from("./generated"));
        assert!(cfg.knowledge.endpoint.is_none());
    }

    #[test]
    fn test_openai_requires_model() {
        let cfg: Config = toml::from_str(
            "[server]\nbind = \"127.0.0.1:0\"\n[llm]\nprovider = \"openai\"\n",
        )
        .unwrap();
        let err = validate(&cfg).unwrap_err().to_string();
        assert!(err.contains("llm.model"), "{}", err);
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let cfg: Config = toml::from_str(
            "[server]\nbind = \"127.0.0.1:0\"\n[llm]\nprovider = \"mystery\"\n",
        )
        .unwrap();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn test_timeout_bounds() {
        let cfg: Config = toml::from_str(
            "[server]\nbind = \"127.0.0.1:0\"\n[render]\ncli_timeout_secs = 0\n",
        )
        .unwrap();
        let err = validate(&cfg).unwrap_err().to_string();
        assert!(err.contains("render.cli_timeout_secs"), "{}", err);
    }
}
