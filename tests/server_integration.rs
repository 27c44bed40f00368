//! HTTP surface and fallback-chain tests against a live server.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use diagram_chat::config::Config;
use diagram_chat::fallback::{FallbackClient, FetchOutcome};
use diagram_chat::knowledge::NoKnowledge;
use diagram_chat::llm::{ChatModel, ChatRequest};
use diagram_chat::models::ArtifactFormat;
use diagram_chat::pipeline::DiagramPipeline;
use diagram_chat::progress::{FetchStage, FetchStatusEvent, FetchStatusReporter};
use diagram_chat::render::raster::png_dimensions;
use diagram_chat::server::{run_server, run_server_with_pipeline};
use diagram_chat::store::DiagramStore;

// ─── Test helpers ───────────────────────────────────────────────────

fn test_config_with_port(tmp: &TempDir, port: u16) -> Config {
    let config_content = format!(
        r#"
[server]
bind = "127.0.0.1:{}"

[storage]
generated_dir = "{}"

[llm]
provider = "disabled"

[render]
cli_command = "false"
browser_command = "/nonexistent/headless-browser"
cli_timeout_secs = 5
browser_timeout_secs = 5
"#,
        port,
        tmp.path().join("generated").display()
    );
    toml::from_str(&config_content).unwrap()
}

fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_for_server(port: u16) {
    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{}/health", port);
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        if let Ok(resp) = client.get(&url).send().await {
            if resp.status().is_success() {
                return;
            }
        }
    }
    panic!("Server did not become ready within 5 seconds");
}

/// Starts a server with the disabled LLM. Returns its base URL.
async fn start_server(tmp: &TempDir) -> (String, Config) {
    let port = find_free_port();
    let cfg = test_config_with_port(tmp, port);
    let cfg_clone = cfg.clone();
    tokio::spawn(async move {
        run_server(&cfg_clone).await.ok();
    });
    wait_for_server(port).await;
    (format!("http://127.0.0.1:{}", port), cfg)
}

async fn generate(client: &reqwest::Client, base: &str, prompt: &str, seed: u64) -> Value {
    let resp = client
        .post(format!("{}/api/diagrams", base))
        .json(&serde_json::json!({ "prompt": prompt, "seed": seed }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    resp.json().await.unwrap()
}

/// Writes an unreadable document straight into the store directory.
fn write_malformed(cfg: &Config, name: &str) {
    std::fs::create_dir_all(&cfg.storage.generated_dir).unwrap();
    std::fs::write(cfg.storage.generated_dir.join(name), "this is not a diagram").unwrap();
}

#[derive(Default)]
struct Recorder(Mutex<Vec<FetchStatusEvent>>);

impl FetchStatusReporter for Recorder {
    fn report(&self, event: FetchStatusEvent) {
        self.0.lock().unwrap().push(event);
    }
}

impl Recorder {
    fn failed_stages(&self) -> Vec<FetchStage> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                FetchStatusEvent::StageFailed { stage, .. } => Some(*stage),
                _ => None,
            })
            .collect()
    }
}

/// Answers the explain call with prose and the structure call with JSON.
struct ScriptedModel {
    components: &'static str,
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &ChatRequest) -> Result<String> {
        if request.json_mode {
            Ok(self.components.to_string())
        } else {
            Ok("A load balancer fronts two web servers backed by a database.".to_string())
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health() {
    let tmp = TempDir::new().unwrap();
    let (base, _) = start_server(&tmp).await;

    let body: Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_missing_diagram_is_json_404() {
    let tmp = TempDir::new().unwrap();
    let (base, _) = start_server(&tmp).await;

    let resp = reqwest::get(format!("{}/api/diagram-svg/diagram_missing.drawio", base))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("diagram_missing.drawio"));
}

#[tokio::test]
async fn test_invalid_filename_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let (base, _) = start_server(&tmp).await;

    let resp = reqwest::get(format!("{}/api/diagram-xml/notes%20and%20secrets.txt", base))
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_generate_then_render_every_format() {
    let tmp = TempDir::new().unwrap();
    let (base, cfg) = start_server(&tmp).await;
    let client = reqwest::Client::new();

    let diagram = generate(&client, &base, "Draw our AWS migration plan", 5).await;
    let filename = diagram["filename"].as_str().unwrap().to_string();
    assert_eq!(diagram["seed"], 5);
    assert_eq!(diagram["source"], "template:aws-migration");
    assert!(cfg.storage.generated_dir.join(&filename).exists());

    // SVG: identical bytes per request, fresh cache key per response.
    let url = format!("{}/api/diagram-svg/{}", base, filename);
    let a = client.get(&url).send().await.unwrap();
    assert_eq!(a.status(), 200);
    assert_eq!(a.headers()["content-type"], "image/svg+xml");
    assert!(a.headers()["cache-control"]
        .to_str()
        .unwrap()
        .contains("no-store"));
    assert_eq!(a.headers()["pragma"], "no-cache");
    assert!(a.headers().get("x-render-fallback").is_none());
    let key_a = a.headers()["x-cache-key"].to_str().unwrap().to_string();
    let svg_a = a.bytes().await.unwrap();

    let b = client.get(&url).send().await.unwrap();
    let key_b = b.headers()["x-cache-key"].to_str().unwrap().to_string();
    let svg_b = b.bytes().await.unwrap();
    assert_eq!(svg_a, svg_b);
    assert_ne!(key_a, key_b);

    // Full PNG download.
    let resp = client
        .get(format!("{}/api/download-full-diagram/{}", base, filename))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "image/png");
    assert!(resp.headers()["content-disposition"]
        .to_str()
        .unwrap()
        .contains(".png"));
    let png = resp.bytes().await.unwrap();
    assert!(png_dimensions(&png).is_some());

    // Raw source round-trips byte for byte.
    let xml = client
        .get(format!("{}/api/diagram-xml/{}", base, filename))
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(
        xml.to_vec(),
        std::fs::read(cfg.storage.generated_dir.join(&filename)).unwrap()
    );

    // No browser configured: screenshot degrades to resvg.
    let resp = client
        .get(format!("{}/api/screenshot-diagram/{}", base, filename))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["x-render-fallback"], "raster");
    assert!(resp.bytes().await.unwrap().starts_with(b"\x89PNG"));

    // Failing D2 CLI: placeholder PNG with the error title.
    let resp = client
        .get(format!("{}/api/diagram-d2/{}", base, filename))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["x-render-fallback"], "placeholder");
    let png = resp.bytes().await.unwrap();
    let needle = b"D2 Diagram Generation Error";
    assert!(png.windows(needle.len()).any(|w| w == needle));
}

#[tokio::test]
async fn test_malformed_document_degrades_or_fails_cleanly() {
    let tmp = TempDir::new().unwrap();
    let (base, cfg) = start_server(&tmp).await;
    write_malformed(&cfg, "broken.drawio");
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{}/api/diagram-svg/broken.drawio", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["x-render-fallback"], "error-svg");
    let svg = resp.text().await.unwrap();
    assert!(svg.contains("Diagram Render Error"));
    assert!(svg.contains("this is not a diagram"));

    let resp = client
        .get(format!("{}/api/download-full-diagram/broken.drawio", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "render_failed");
}

#[tokio::test]
async fn test_generate_rejects_bad_input() {
    let tmp = TempDir::new().unwrap();
    let (base, _) = start_server(&tmp).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/api/diagrams", base))
        .json(&serde_json::json!({ "prompt": "   " }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(format!("{}/api/diagrams", base))
        .json(&serde_json::json!({ "prompt": "draw it", "layout": "spiral" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"]["message"].as_str().unwrap().contains("spiral"));
}

#[tokio::test]
async fn test_unparseable_bodies_get_json_errors() {
    let tmp = TempDir::new().unwrap();
    let (base, _) = start_server(&tmp).await;
    let client = reqwest::Client::new();

    for route in ["/api/diagrams", "/api/chat"] {
        let resp = client
            .post(format!("{}{}", base, route))
            .header("content-type", "application/json")
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400, "{}", route);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "bad_request", "{}", route);

        // Well-formed JSON missing the required field.
        let resp = client
            .post(format!("{}{}", base, route))
            .json(&serde_json::json!({ "seed": 1 }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400, "{}", route);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "bad_request", "{}", route);
    }
}

#[tokio::test]
async fn test_chat_routes_questions_and_diagram_requests() {
    let tmp = TempDir::new().unwrap();
    let (base, _) = start_server(&tmp).await;
    let client = reqwest::Client::new();

    let body: Value = client
        .post(format!("{}/api/chat", base))
        .json(&serde_json::json!({ "message": "What is RiverMeadow?" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(body.get("diagram").is_none());
    assert!(body["reply"].as_str().unwrap().contains("unavailable"));

    let body: Value = client
        .post(format!("{}/api/chat", base))
        .json(&serde_json::json!({
            "message": "Create a network diagram for AWS VPC with EC2 and RDS"
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["diagram"]["network"], true);
    assert!(body["diagram"]["filename"]
        .as_str()
        .unwrap()
        .ends_with(".drawio"));
}

#[tokio::test]
async fn test_llm_components_and_dropped_connections() {
    let tmp = TempDir::new().unwrap();
    let port = find_free_port();
    let cfg = test_config_with_port(&tmp, port);

    let model = Arc::new(ScriptedModel {
        components: r#"{
            "title": "Web Tier",
            "nodes": ["Load Balancer", "Web Server", "Database"],
            "connections": [
                {"from": "load balancer", "to": " Web  Server "},
                {"from": "Web Server", "to": "Database", "label": "SQL"},
                {"from": "Web Server", "to": "Cache"}
            ],
            "categories": {"Compute": ["Web Server"]}
        }"#,
    });
    let pipeline = DiagramPipeline::new(
        model,
        Arc::new(NoKnowledge),
        DiagramStore::new(&cfg.storage.generated_dir),
        &cfg,
    );
    let cfg_clone = cfg.clone();
    tokio::spawn(async move {
        run_server_with_pipeline(&cfg_clone, Arc::new(pipeline))
            .await
            .ok();
    });
    wait_for_server(port).await;

    let client = reqwest::Client::new();
    let base = format!("http://127.0.0.1:{}", port);
    let diagram = generate(&client, &base, "Draw the web tier", 3).await;

    assert_eq!(diagram["source"], "llm");
    assert_eq!(diagram["title"], "Web Tier");
    let dropped = diagram["dropped_connections"].as_array().unwrap();
    assert_eq!(dropped.len(), 1);
    assert_eq!(dropped[0]["to"], "Cache");
    assert!(diagram["explanation"]
        .as_str()
        .unwrap()
        .contains("load balancer"));
}

// ─── Fallback chain against a live server ───────────────────────────

#[tokio::test]
async fn test_fallback_first_stage_rasterizes_svg() {
    let tmp = TempDir::new().unwrap();
    let (base, cfg) = start_server(&tmp).await;
    let client = reqwest::Client::new();
    let diagram = generate(&client, &base, "Draw our AWS migration plan", 9).await;
    let filename = diagram["filename"].as_str().unwrap();

    let recorder = Recorder::default();
    let fetcher = FallbackClient::new(&base, 10, cfg.render.png_scale).unwrap();
    match fetcher.fetch(filename, ArtifactFormat::Png, &recorder).await {
        FetchOutcome::Downloaded { stage, artifact } => {
            assert_eq!(stage, FetchStage::Svg);
            assert_eq!(artifact.format, ArtifactFormat::Png);
            assert!(png_dimensions(&artifact.bytes).is_some());
        }
        other => panic!("expected a download, got {:?}", other),
    }
    assert!(recorder.failed_stages().is_empty());

    match fetcher.fetch(filename, ArtifactFormat::Svg, &recorder).await {
        FetchOutcome::Downloaded { artifact, .. } => {
            assert_eq!(artifact.format, ArtifactFormat::Svg);
            assert!(artifact.bytes.starts_with(b"<svg"));
        }
        other => panic!("expected a download, got {:?}", other),
    }
}

#[tokio::test]
async fn test_fallback_malformed_document_ends_at_source() {
    let tmp = TempDir::new().unwrap();
    let (base, cfg) = start_server(&tmp).await;
    write_malformed(&cfg, "broken.drawio");

    let recorder = Recorder::default();
    let fetcher = FallbackClient::new(&base, 10, 2.0).unwrap();
    match fetcher
        .fetch("broken.drawio", ArtifactFormat::Png, &recorder)
        .await
    {
        FetchOutcome::Downloaded { stage, artifact } => {
            assert_eq!(stage, FetchStage::Source);
            assert_eq!(artifact.format, ArtifactFormat::Source);
            assert_eq!(artifact.bytes, b"this is not a diagram");
        }
        other => panic!("expected the raw source, got {:?}", other),
    }
    assert_eq!(
        recorder.failed_stages(),
        vec![FetchStage::Svg, FetchStage::Screenshot]
    );
}

#[tokio::test]
async fn test_fallback_missing_diagram_is_manual() {
    let tmp = TempDir::new().unwrap();
    let (base, _) = start_server(&tmp).await;

    let recorder = Recorder::default();
    let fetcher = FallbackClient::new(&base, 10, 2.0).unwrap();
    match fetcher
        .fetch("diagram_gone.drawio", ArtifactFormat::Png, &recorder)
        .await
    {
        FetchOutcome::Manual { url, .. } => {
            assert_eq!(url, format!("{}/api/diagram-svg/diagram_gone.drawio", base));
        }
        other => panic!("expected manual outcome, got {:?}", other),
    }
    assert_eq!(recorder.failed_stages().len(), 3);
}
