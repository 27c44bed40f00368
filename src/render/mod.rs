//! Render backends for stored diagram documents.
//!
//! | Path | Module | Output |
//! |------|--------|--------|
//! | document → SVG | [`svg`] | hand-emitted SVG, error SVG on bad input |
//! | SVG → PNG | [`raster`] | in-process resvg rasterization |
//! | SVG → PNG | [`browser`] | headless browser screenshot, resvg fallback |
//! | document → D2 → PNG | [`d2`] | external D2 CLI, placeholder on failure |
//! | errors → SVG/PNG | [`placeholder`] | visible error text plus escaped source |
//!
//! Every entry point here is infallible from the caller's point of view
//! except [`render_png`], which backs the download endpoint and reports
//! failure as a structured error. Degraded output is flagged through
//! [`Rendered::fallback`] so the HTTP layer can mark it.
//!
//! Rendering is a pure function of the input bytes and configuration: the
//! same document always produces the same SVG.

pub mod browser;
pub mod d2;
pub mod placeholder;
pub mod raster;
pub mod svg;

use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use crate::config::RenderConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// The diagram document could not be read, even after repair.
    Parse(String),
    /// Unbalanced braces or quotes that repair could not fix.
    Unbalanced(String),
    /// The external tool is not installed or not configured.
    ToolUnavailable(String),
    /// The external tool ran but failed or produced no output.
    ToolFailed(String),
    Timeout(u64),
    Raster(String),
}

impl RenderError {
    pub fn code(&self) -> &'static str {
        match self {
            RenderError::Parse(_) => "parse",
            RenderError::Unbalanced(_) => "unbalanced",
            RenderError::ToolUnavailable(_) => "tool_unavailable",
            RenderError::ToolFailed(_) => "tool_failed",
            RenderError::Timeout(_) => "timeout",
            RenderError::Raster(_) => "raster",
        }
    }
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderError::Parse(e) => write!(f, "failed to parse diagram: {}", e),
            RenderError::Unbalanced(e) => write!(f, "unbalanced diagram source: {}", e),
            RenderError::ToolUnavailable(e) => write!(f, "render tool unavailable: {}", e),
            RenderError::ToolFailed(e) => write!(f, "render tool failed: {}", e),
            RenderError::Timeout(secs) => write!(f, "render tool timed out after {}s", secs),
            RenderError::Raster(e) => write!(f, "rasterization failed: {}", e),
        }
    }
}

impl std::error::Error for RenderError {}

/// How a render degraded, if it did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fallback {
    /// The document was unreadable; the SVG is an error card.
    ErrorSvg(RenderError),
    /// The preferred rasterizer failed; resvg produced the image instead.
    Raster(RenderError),
    /// Nothing could render the diagram; the PNG is an error card.
    Placeholder(RenderError),
}

impl Fallback {
    /// Value for the `X-Render-Fallback` response header.
    pub fn header_value(&self) -> &'static str {
        match self {
            Fallback::ErrorSvg(_) => "error-svg",
            Fallback::Raster(_) => "raster",
            Fallback::Placeholder(_) => "placeholder",
        }
    }

    pub fn error(&self) -> &RenderError {
        match self {
            Fallback::ErrorSvg(e) | Fallback::Raster(e) | Fallback::Placeholder(e) => e,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Rendered {
    pub bytes: Vec<u8>,
    pub fallback: Option<Fallback>,
}

impl Rendered {
    fn ok(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            fallback: None,
        }
    }
}

/// Document source → SVG, or an error SVG.
pub fn render_svg(source: &str, config: &RenderConfig) -> Rendered {
    let out = svg::render_source(source, config.svg_scale);
    Rendered {
        bytes: out.svg.into_bytes(),
        fallback: out.error.map(Fallback::ErrorSvg),
    }
}

/// Document source → PNG through resvg. Fails instead of degrading.
pub fn render_png(source: &str, config: &RenderConfig) -> Result<Vec<u8>, RenderError> {
    let out = svg::render_source(source, config.svg_scale);
    if let Some(err) = out.error {
        return Err(err);
    }
    raster::svg_to_png(&out.svg, config.png_scale)
}

/// [`render_png`] on the blocking pool, for async callers.
pub async fn render_png_blocking(
    source: &str,
    config: &RenderConfig,
) -> Result<Vec<u8>, RenderError> {
    let source = source.to_string();
    let config = config.clone();
    tokio::task::spawn_blocking(move || render_png(&source, &config))
        .await
        .map_err(|e| RenderError::Raster(format!("render task failed: {}", e)))?
}

/// Document source → PNG through a headless browser screenshot.
///
/// Falls back to resvg when the browser is unavailable or fails, and to a
/// placeholder when the document itself is unreadable.
pub async fn render_screenshot(source: &str, config: &RenderConfig) -> Rendered {
    let out = svg::render_source(source, config.svg_scale);
    if let Some(err) = out.error {
        eprintln!("Warning: screenshot render skipped: {}", err);
        let png = placeholder_blocking("Diagram Render Error", err.to_string(), source).await;
        return Rendered {
            bytes: png,
            fallback: Some(Fallback::Placeholder(err)),
        };
    }

    let browser = browser::BrowserScreenshot::from_config(config);
    match browser.screenshot(&out.svg, config.png_scale).await {
        Ok(png) => Rendered::ok(png),
        Err(browser_err) => {
            eprintln!("Warning: browser screenshot failed: {}", browser_err);
            match raster::svg_to_png_blocking(out.svg, config.png_scale).await {
                Ok(png) => Rendered {
                    bytes: png,
                    fallback: Some(Fallback::Raster(browser_err)),
                },
                Err(raster_err) => {
                    eprintln!("Error: rasterization failed: {}", raster_err);
                    let png =
                        placeholder_blocking("Diagram Render Error", raster_err.to_string(), source)
                            .await;
                    Rendered {
                        bytes: png,
                        fallback: Some(Fallback::Placeholder(raster_err)),
                    }
                }
            }
        }
    }
}

/// Document source → D2 → PNG through the D2 CLI, or a placeholder PNG.
pub async fn render_d2_png(source: &str, config: &RenderConfig) -> Rendered {
    let cli = d2::D2Cli::from_config(config);
    match d2::source_to_png(source, &cli).await {
        Ok(png) => Rendered::ok(png),
        Err(err) => {
            eprintln!("Warning: D2 render failed: {}", err);
            let png = placeholder_blocking(d2::D2_ERROR_TITLE, err.to_string(), source).await;
            Rendered {
                bytes: png,
                fallback: Some(Fallback::Placeholder(err)),
            }
        }
    }
}

/// [`placeholder::placeholder_png`] on the blocking pool.
async fn placeholder_blocking(title: &'static str, message: String, source: &str) -> Vec<u8> {
    let source = source.to_string();
    tokio::task::spawn_blocking(move || placeholder::placeholder_png(title, &message, &source))
        .await
        .unwrap_or_else(|e| {
            eprintln!("Error: placeholder render task failed: {}", e);
            placeholder::MINIMAL_PNG.to_vec()
        })
}

/// Runs an external render tool to completion.
///
/// The child gets a null stdin and is killed if `timeout` elapses. A
/// missing executable is reported as [`RenderError::ToolUnavailable`].
pub(crate) async fn run_tool(
    mut cmd: tokio::process::Command,
    timeout: Duration,
) -> Result<std::process::Output, RenderError> {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
            RenderError::ToolUnavailable(format!("{}: {}", program, e))
        }
        _ => RenderError::ToolFailed(format!("failed to start {}: {}", program, e)),
    })?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| RenderError::Timeout(timeout.as_secs()))?
        .map_err(|e| RenderError::ToolFailed(format!("{}: {}", program, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr: String = stderr.trim().chars().take(500).collect();
        return Err(RenderError::ToolFailed(format!(
            "{} exited with {}: {}",
            program, output.status, stderr
        )));
    }
    Ok(output)
}

pub(crate) fn escape_xml(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c if c.is_control() && c != '\n' && c != '\t' => {}
            c => out.push(c),
        }
    }
    out
}
