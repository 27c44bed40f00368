//! SVG → PNG through a headless Chromium-compatible browser.
//!
//! The SVG is embedded in a one-image HTML page as a base64 data URI and
//! captured with `--screenshot`. Each call runs its own browser process
//! in a scratch directory.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::time::Duration;

use super::{run_tool, RenderError};
use crate::config::RenderConfig;

const MAX_EDGE_PX: f32 = 8192.0;

#[derive(Debug, Clone)]
pub struct BrowserScreenshot {
    command: Option<String>,
    timeout: Duration,
}

impl BrowserScreenshot {
    pub fn from_config(config: &RenderConfig) -> Self {
        Self {
            command: config.browser_command.clone(),
            timeout: Duration::from_secs(config.browser_timeout_secs),
        }
    }

    pub async fn screenshot(&self, svg: &str, scale: f32) -> Result<Vec<u8>, RenderError> {
        let Some(command) = &self.command else {
            return Err(RenderError::ToolUnavailable(
                "no render.browser_command configured".to_string(),
            ));
        };

        let (width, height) = viewport(svg, scale)?;
        let scratch = tempfile::tempdir()
            .map_err(|e| RenderError::ToolFailed(format!("scratch directory: {}", e)))?;
        let page = scratch.path().join("diagram.html");
        let output = scratch.path().join("screenshot.png");
        tokio::fs::write(&page, screenshot_html(svg, width, height))
            .await
            .map_err(|e| RenderError::ToolFailed(format!("writing screenshot page: {}", e)))?;

        let mut cmd = tokio::process::Command::new(command);
        cmd.args([
            "--headless",
            "--disable-gpu",
            "--no-sandbox",
            "--hide-scrollbars",
        ])
        .arg(format!("--window-size={},{}", width, height))
        .arg(format!("--screenshot={}", output.display()))
        .arg(format!("file://{}", page.display()));
        run_tool(cmd, self.timeout).await?;

        match tokio::fs::read(&output).await {
            Ok(bytes) if !bytes.is_empty() => Ok(bytes),
            _ => Err(RenderError::ToolFailed(format!(
                "{} wrote no screenshot",
                command
            ))),
        }
    }
}

/// Window size for the screenshot: the SVG's intrinsic size times `scale`.
fn viewport(svg: &str, scale: f32) -> Result<(u32, u32), RenderError> {
    let tree = usvg::Tree::from_str(svg, &usvg::Options::default())
        .map_err(|e| RenderError::Raster(format!("invalid SVG: {}", e)))?;
    let size = tree.size();
    let scale = scale.min(MAX_EDGE_PX / size.width().max(size.height()));
    Ok((
        (size.width() * scale).round().max(1.0) as u32,
        (size.height() * scale).round().max(1.0) as u32,
    ))
}

fn screenshot_html(svg: &str, width: u32, height: u32) -> String {
    format!(
        r#"<!DOCTYPE html>
<html><head><meta charset="utf-8"><style>html,body{{margin:0;padding:0;background:#fff;overflow:hidden}}img{{display:block}}</style></head>
<body><img width="{w}" height="{h}" src="data:image/svg+xml;base64,{data}"></body></html>
"#,
        w = width,
        h = height,
        data = BASE64.encode(svg)
    )
}
