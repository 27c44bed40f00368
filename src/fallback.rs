//! Client side of the diagram download fallback chain.
//!
//! Given a stored diagram filename, [`FallbackClient::fetch`] tries, in
//! order:
//!
//! 1. `GET /api/diagram-svg/{f}` and rasterize it locally with resvg
//! 2. `GET /api/screenshot-diagram/{f}` (server-side rasterization)
//! 3. `GET /api/diagram-xml/{f}` (raw document for a diagram editor)
//! 4. give up and point the user at the SVG URL for a manual screenshot
//!
//! Each stage runs only if the previous one failed, and every transition
//! is announced through a [`FetchStatusReporter`]. Requests carry
//! `Cache-Control: no-store` and a random query string because diagrams
//! are rendered per request and must never come from a stale cache.

use anyhow::{bail, Result};
use rand::Rng;
use reqwest::header::{CACHE_CONTROL, CONTENT_TYPE, PRAGMA};
use std::time::Duration;

use crate::models::{ArtifactFormat, RenderedArtifact};
use crate::progress::{FetchStage, FetchStatusEvent, FetchStatusReporter};
use crate::render::raster;

pub const RENDER_FALLBACK_HEADER: &str = "x-render-fallback";

#[derive(Debug)]
pub enum FetchOutcome {
    Downloaded {
        stage: FetchStage,
        artifact: RenderedArtifact,
    },
    /// Every automatic stage failed.
    Manual { url: String, message: String },
}

pub struct FallbackClient {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
    png_scale: f32,
}

impl FallbackClient {
    pub fn new(base_url: &str, timeout_secs: u64, png_scale: f32) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            timeout: Duration::from_secs(timeout_secs),
            png_scale,
        })
    }

    fn endpoint(&self, route: &str, filename: &str) -> String {
        format!("{}/api/{}/{}", self.base_url, route, filename)
    }

    /// Runs the chain for `filename`.
    ///
    /// `preferred` picks the entry stage: PNG (default) starts at stage 1
    /// and rasterizes, SVG starts at stage 1 and keeps the vector bytes,
    /// and source skips straight to stage 3.
    pub async fn fetch(
        &self,
        filename: &str,
        preferred: ArtifactFormat,
        reporter: &dyn FetchStatusReporter,
    ) -> FetchOutcome {
        let stages: &[FetchStage] = match preferred {
            ArtifactFormat::Source => &[FetchStage::Source],
            _ => &[FetchStage::Svg, FetchStage::Screenshot, FetchStage::Source],
        };

        for stage in stages {
            let url = match stage {
                FetchStage::Svg => self.endpoint("diagram-svg", filename),
                FetchStage::Screenshot => self.endpoint("screenshot-diagram", filename),
                _ => self.endpoint("diagram-xml", filename),
            };
            reporter.report(FetchStatusEvent::Attempting {
                stage: *stage,
                url: url.clone(),
            });

            let attempt = match stage {
                FetchStage::Svg => self.fetch_svg(&url, preferred).await,
                FetchStage::Screenshot => self.fetch_screenshot(&url).await,
                _ => self.fetch_source(&url).await,
            };

            match attempt {
                Ok(artifact) => {
                    reporter.report(FetchStatusEvent::Succeeded {
                        stage: *stage,
                        format: artifact.format,
                        bytes: artifact.bytes.len(),
                    });
                    return FetchOutcome::Downloaded {
                        stage: *stage,
                        artifact,
                    };
                }
                Err(e) => {
                    reporter.report(FetchStatusEvent::StageFailed {
                        stage: *stage,
                        error: e.to_string(),
                    });
                }
            }
        }

        let url = self.endpoint("diagram-svg", filename);
        let message = format!(
            "Could not download {}. Open {} in a browser tab and take a screenshot manually.",
            filename, url
        );
        reporter.report(FetchStatusEvent::Exhausted { url: url.clone() });
        FetchOutcome::Manual { url, message }
    }

    async fn fetch_svg(&self, url: &str, preferred: ArtifactFormat) -> Result<RenderedArtifact> {
        let resp = self.get(url).await?;
        if let Some(kind) = resp.headers().get(RENDER_FALLBACK_HEADER) {
            bail!(
                "server returned a fallback SVG ({})",
                kind.to_str().unwrap_or("unknown")
            );
        }
        let svg = resp.text().await?;
        if !svg.contains("<svg") {
            bail!("response is not an SVG document");
        }
        if preferred == ArtifactFormat::Svg {
            return Ok(RenderedArtifact::new(ArtifactFormat::Svg, svg.into_bytes()));
        }
        let png = raster::svg_to_png_blocking(svg, self.png_scale).await?;
        Ok(RenderedArtifact::new(ArtifactFormat::Png, png))
    }

    async fn fetch_screenshot(&self, url: &str) -> Result<RenderedArtifact> {
        let resp = self.get(url).await?;
        if let Some(kind) = resp.headers().get(RENDER_FALLBACK_HEADER) {
            if kind.as_bytes() == b"placeholder" {
                bail!("server could only produce a placeholder image");
            }
        }
        let is_png = resp
            .headers()
            .get(CONTENT_TYPE)
            .map(|v| v.as_bytes().starts_with(b"image/png"))
            .unwrap_or(false);
        let bytes = resp.bytes().await?.to_vec();
        if !is_png || !bytes.starts_with(b"\x89PNG") {
            bail!("response is not a PNG image");
        }
        Ok(RenderedArtifact::new(ArtifactFormat::Png, bytes))
    }

    async fn fetch_source(&self, url: &str) -> Result<RenderedArtifact> {
        let resp = self.get(url).await?;
        let bytes = resp.bytes().await?.to_vec();
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            bail!("diagram file is empty");
        }
        Ok(RenderedArtifact::new(ArtifactFormat::Source, bytes))
    }

    /// Cache-busting GET that fails on any non-2xx status.
    async fn get(&self, url: &str) -> Result<reqwest::Response> {
        let resp = self
            .client
            .get(url)
            .query(&cache_buster())
            .header(CACHE_CONTROL, "no-store")
            .header(PRAGMA, "no-cache")
            .timeout(self.timeout)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let body: String = body.chars().take(200).collect();
            bail!("HTTP {}: {}", status, body);
        }
        Ok(resp)
    }
}

fn cache_buster() -> [(&'static str, String); 2] {
    let millis = chrono::Utc::now().timestamp_millis();
    let nonce: u64 = rand::thread_rng().gen();
    [("t", millis.to_string()), ("r", format!("{:x}", nonce))]
}
