//! HTTP server for diagram generation and rendering.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/api/diagrams` | Generate and store a diagram from a prompt |
//! | `POST` | `/api/chat` | One chat turn; may attach a generated diagram |
//! | `GET`  | `/api/diagram-svg/{filename}` | SVG, or an error SVG for unreadable documents |
//! | `GET`  | `/api/download-full-diagram/{filename}` | PNG, or a structured error |
//! | `GET`  | `/api/screenshot-diagram/{filename}` | PNG via headless browser, degrading to resvg |
//! | `GET`  | `/api/diagram-xml/{filename}` | Raw diagram document |
//! | `GET`  | `/api/diagram-d2/{filename}` | PNG via the D2 CLI, or a placeholder PNG |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "diagram not found: x.drawio" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `render_failed` (500),
//! `internal` (500).
//!
//! # Caching
//!
//! Artifacts are rendered on every request. Responses carry
//! `Cache-Control: no-store`, `Pragma: no-cache` and a per-response
//! `X-Cache-Key`. Degraded output is marked with `X-Render-Fallback`.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{
        header::{CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_TYPE, PRAGMA},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::classify::is_network_diagram_request;
use crate::config::Config;
use crate::fallback::RENDER_FALLBACK_HEADER;
use crate::layout::{LayoutKind, LayoutOptions};
use crate::models::{ArtifactFormat, RenderedArtifact};
use crate::pipeline::{ChatReply, DiagramPipeline, GeneratedDiagram};
use crate::render::{self, Fallback};
use crate::store::StoreError;

const ROUTES: &[(&str, &str, &str)] = &[
    ("GET", "/health", "health check"),
    ("POST", "/api/diagrams", "generate a diagram"),
    ("POST", "/api/chat", "chat turn"),
    ("GET", "/api/diagram-svg/{filename}", "SVG"),
    ("GET", "/api/download-full-diagram/{filename}", "PNG download"),
    ("GET", "/api/screenshot-diagram/{filename}", "PNG via browser screenshot"),
    ("GET", "/api/diagram-xml/{filename}", "raw diagram document"),
    ("GET", "/api/diagram-d2/{filename}", "PNG via D2"),
];

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    pipeline: Arc<DiagramPipeline>,
}

/// Starts the server on `[server].bind` with the configured LLM and
/// knowledge base. Runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pipeline = DiagramPipeline::from_config(config)?;
    run_server_with_pipeline(config, Arc::new(pipeline)).await
}

/// Like [`run_server`], but with a caller-built pipeline (custom
/// [`ChatModel`](crate::llm::ChatModel) or knowledge base).
pub async fn run_server_with_pipeline(
    config: &Config,
    pipeline: Arc<DiagramPipeline>,
) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let app = router(Arc::new(config.clone()), pipeline);

    println!("Diagram server listening on http://{}", bind_addr);
    for (method, path, what) in ROUTES {
        println!("  {:<5} {} ({})", method, path, what);
    }

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(config: Arc<Config>, pipeline: Arc<DiagramPipeline>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/diagrams", post(handle_generate))
        .route("/api/chat", post(handle_chat))
        .route("/api/diagram-svg/{filename}", get(handle_svg))
        .route("/api/download-full-diagram/{filename}", get(handle_download_png))
        .route("/api/screenshot-diagram/{filename}", get(handle_screenshot))
        .route("/api/diagram-xml/{filename}", get(handle_xml))
        .route("/api/diagram-d2/{filename}", get(handle_d2))
        .layer(cors)
        .with_state(AppState { config, pipeline })
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn render_failed(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "render_failed".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidName(_) => bad_request(err.to_string()),
            StoreError::NotFound(_) => not_found(err.to_string()),
            StoreError::Io(_) => {
                eprintln!("Error: {}", err);
                internal("failed to read diagram")
            }
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(err: JsonRejection) -> Self {
        bad_request(err.body_text())
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /api/diagrams ============

#[derive(Deserialize)]
struct GenerateRequest {
    prompt: String,
    #[serde(default)]
    context: Vec<String>,
    #[serde(default)]
    seed: Option<u64>,
    /// Defaults to classifying the prompt.
    #[serde(default)]
    network: Option<bool>,
    #[serde(default)]
    layout: Option<String>,
}

async fn handle_generate(
    State(state): State<AppState>,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Json<GeneratedDiagram>, AppError> {
    let Json(req) = payload?;
    if req.prompt.trim().is_empty() {
        return Err(bad_request("prompt must not be empty"));
    }
    let kind = match req.layout.as_deref() {
        Some(name) => Some(LayoutKind::parse(name).ok_or_else(|| {
            bad_request(format!("layout must be radial or layered, got '{}'", name))
        })?),
        None => None,
    };
    let network = req
        .network
        .unwrap_or_else(|| is_network_diagram_request(&req.prompt));
    let mut options = match req.seed {
        Some(seed) => LayoutOptions::seeded(seed, network),
        None => LayoutOptions::random(network),
    };
    options.kind = kind;

    state
        .pipeline
        .generate(&req.prompt, &req.context, options)
        .await
        .map(Json)
        .map_err(|e| {
            eprintln!("Error: diagram generation failed: {:#}", e);
            internal("diagram generation failed")
        })
}

// ============ POST /api/chat ============

#[derive(Deserialize)]
struct ChatBody {
    message: String,
    #[serde(default)]
    context: Vec<String>,
}

async fn handle_chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatBody>, JsonRejection>,
) -> Result<Json<ChatReply>, AppError> {
    let Json(req) = payload?;
    if req.message.trim().is_empty() {
        return Err(bad_request("message must not be empty"));
    }
    Ok(Json(state.pipeline.chat_turn(&req.message, &req.context).await))
}

// ============ Artifact endpoints ============

fn artifact_response(
    artifact: RenderedArtifact,
    fallback: Option<&Fallback>,
    attachment: Option<String>,
) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(artifact.format.content_type()),
    );
    headers.insert(
        CACHE_CONTROL,
        HeaderValue::from_static("no-store, no-cache, must-revalidate"),
    );
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    if let Ok(key) = HeaderValue::from_str(&artifact.cache_key) {
        headers.insert("x-cache-key", key);
    }
    if let Some(fallback) = fallback {
        headers.insert(
            RENDER_FALLBACK_HEADER,
            HeaderValue::from_static(fallback.header_value()),
        );
    }
    if let Some(name) = attachment {
        if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", name)) {
            headers.insert(CONTENT_DISPOSITION, value);
        }
    }
    (StatusCode::OK, headers, artifact.bytes).into_response()
}

fn with_extension(filename: &str, ext: &str) -> String {
    let stem = filename
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(filename);
    format!("{}.{}", stem, ext)
}

async fn handle_svg(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, AppError> {
    let source = state.pipeline.store().read_source(&filename)?;
    let rendered = render::render_svg(&source, &state.config.render);
    if let Some(fallback) = &rendered.fallback {
        eprintln!("Warning: {}: {}", filename, fallback.error());
    }
    Ok(artifact_response(
        RenderedArtifact::new(ArtifactFormat::Svg, rendered.bytes),
        rendered.fallback.as_ref(),
        None,
    ))
}

async fn handle_download_png(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, AppError> {
    let source = state.pipeline.store().read_source(&filename)?;
    match render::render_png_blocking(&source, &state.config.render).await {
        Ok(png) => Ok(artifact_response(
            RenderedArtifact::new(ArtifactFormat::Png, png),
            None,
            Some(with_extension(&filename, "png")),
        )),
        Err(e) => {
            eprintln!("Error: PNG render of {} failed: {}", filename, e);
            Err(render_failed(e.to_string()))
        }
    }
}

async fn handle_screenshot(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, AppError> {
    let source = state.pipeline.store().read_source(&filename)?;
    let rendered = render::render_screenshot(&source, &state.config.render).await;
    Ok(artifact_response(
        RenderedArtifact::new(ArtifactFormat::Png, rendered.bytes),
        rendered.fallback.as_ref(),
        None,
    ))
}

async fn handle_xml(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, AppError> {
    let source = state.pipeline.store().read_source(&filename)?;
    Ok(artifact_response(
        RenderedArtifact::new(ArtifactFormat::Source, source.into_bytes()),
        None,
        Some(filename),
    ))
}

async fn handle_d2(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, AppError> {
    let source = state.pipeline.store().read_source(&filename)?;
    let rendered = render::render_d2_png(&source, &state.config.render).await;
    Ok(artifact_response(
        RenderedArtifact::new(ArtifactFormat::Png, rendered.bytes),
        rendered.fallback.as_ref(),
        None,
    ))
}
