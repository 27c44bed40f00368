//! Fallback-chain status reporting.
//!
//! Every stage of a diagram fetch (see [`crate::fallback`]) announces what
//! it is about to try, and whether it worked, so the user is never handed a
//! different format without being told. Status is emitted on **stderr** so
//! stdout stays usable for the artifact itself.

use std::io::Write;

use crate::models::ArtifactFormat;

/// One step of the fetch fallback chain, in the order they are tried.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FetchStage {
    /// Pre-rendered SVG, rasterized locally.
    Svg,
    /// Server-side screenshot endpoint.
    Screenshot,
    /// Raw diagram document for third-party diagram software.
    Source,
    /// Nothing downloadable; the user screenshots the page by hand.
    Manual,
}

impl FetchStage {
    pub const COUNT: usize = 4;

    pub fn number(&self) -> usize {
        match self {
            FetchStage::Svg => 1,
            FetchStage::Screenshot => 2,
            FetchStage::Source => 3,
            FetchStage::Manual => 4,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FetchStage::Svg => "svg",
            FetchStage::Screenshot => "screenshot",
            FetchStage::Source => "source",
            FetchStage::Manual => "manual",
        }
    }

    fn action(&self) -> &'static str {
        match self {
            FetchStage::Svg => "downloading SVG and rasterizing locally",
            FetchStage::Screenshot => "requesting a server-side screenshot",
            FetchStage::Source => "downloading the raw diagram file instead of an image",
            FetchStage::Manual => "no automatic download left",
        }
    }
}

#[derive(Clone, Debug)]
pub enum FetchStatusEvent {
    Attempting {
        stage: FetchStage,
        url: String,
    },
    StageFailed {
        stage: FetchStage,
        error: String,
    },
    Succeeded {
        stage: FetchStage,
        format: ArtifactFormat,
        bytes: usize,
    },
    /// All automatic stages failed.
    Exhausted {
        url: String,
    },
}

/// Human-readable line for an event.
pub fn describe(event: &FetchStatusEvent) -> String {
    let step = |s: &FetchStage| format!("fetch [{}/{}]", s.number(), FetchStage::COUNT);
    match event {
        FetchStatusEvent::Attempting { stage, url } => {
            format!("{} {}: {}", step(stage), stage.action(), url)
        }
        FetchStatusEvent::StageFailed { stage, error } => {
            format!("{} {} failed: {}", step(stage), stage.name(), error)
        }
        FetchStatusEvent::Succeeded {
            stage,
            format,
            bytes,
        } => {
            let note = match stage {
                FetchStage::Source => {
                    " (not an image: open it in draw.io or another diagram editor)"
                }
                _ => "",
            };
            format!(
                "{} got {} ({} bytes){}",
                step(stage),
                format.extension(),
                bytes,
                note
            )
        }
        FetchStatusEvent::Exhausted { url } => format!(
            "{} every download failed; open {} in a browser and take a screenshot manually",
            step(&FetchStage::Manual),
            url
        ),
    }
}

pub trait FetchStatusReporter: Send + Sync {
    fn report(&self, event: FetchStatusEvent);
}

pub struct StderrStatus;

impl FetchStatusReporter for StderrStatus {
    fn report(&self, event: FetchStatusEvent) {
        let line = format!("{}\n", describe(&event));
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable status: one JSON object per line on stderr.
pub struct JsonStatus;

impl FetchStatusReporter for JsonStatus {
    fn report(&self, event: FetchStatusEvent) {
        let obj = match &event {
            FetchStatusEvent::Attempting { stage, url } => serde_json::json!({
                "event": "attempt",
                "stage": stage.name(),
                "step": stage.number(),
                "url": url
            }),
            FetchStatusEvent::StageFailed { stage, error } => serde_json::json!({
                "event": "stage_failed",
                "stage": stage.name(),
                "step": stage.number(),
                "error": error
            }),
            FetchStatusEvent::Succeeded {
                stage,
                format,
                bytes,
            } => serde_json::json!({
                "event": "succeeded",
                "stage": stage.name(),
                "step": stage.number(),
                "format": format,
                "bytes": bytes
            }),
            FetchStatusEvent::Exhausted { url } => serde_json::json!({
                "event": "exhausted",
                "stage": FetchStage::Manual.name(),
                "step": FetchStage::Manual.number(),
                "url": url,
                "message": describe(&event)
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

pub struct NoStatus;

impl FetchStatusReporter for NoStatus {
    fn report(&self, _event: FetchStatusEvent) {}
}

/// Status mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StatusMode {
    Off,
    Human,
    Json,
}

impl StatusMode {
    /// Human status when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            StatusMode::Human
        } else {
            StatusMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn FetchStatusReporter> {
        match self {
            StatusMode::Off => Box::new(NoStatus),
            StatusMode::Human => Box::new(StderrStatus),
            StatusMode::Json => Box::new(JsonStatus),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_stage_has_its_own_message() {
        let stages = [
            FetchStage::Svg,
            FetchStage::Screenshot,
            FetchStage::Source,
        ];
        let lines: Vec<String> = stages
            .iter()
            .map(|s| {
                describe(&FetchStatusEvent::Attempting {
                    stage: *s,
                    url: "http://x".into(),
                })
            })
            .collect();
        assert_eq!(lines[0], "fetch [1/4] downloading SVG and rasterizing locally: http://x");
        assert!(lines[1].starts_with("fetch [2/4] requesting a server-side screenshot"));
        assert!(lines[2].starts_with("fetch [3/4] downloading the raw diagram file"));
    }

    #[test]
    fn source_success_says_it_is_not_an_image() {
        let line = describe(&FetchStatusEvent::Succeeded {
            stage: FetchStage::Source,
            format: ArtifactFormat::Source,
            bytes: 10,
        });
        assert!(line.contains("not an image"));
        assert!(line.contains("drawio"));
    }

    #[test]
    fn exhaustion_asks_for_manual_screenshot() {
        let line = describe(&FetchStatusEvent::Exhausted {
            url: "http://host/api/diagram-svg/a.drawio".into(),
        });
        assert!(line.starts_with("fetch [4/4]"));
        assert!(line.contains("screenshot manually"));
    }
}
