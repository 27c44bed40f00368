//! Diagram document → D2 source → PNG via the `d2` CLI.
//!
//! D2 does its own layout, so only labels, shapes, colors and the
//! container structure are carried over; positions are dropped. Nodes
//! whose box sits inside a swimlane become children of that container.
//!
//! The CLI is invoked as
//!
//! ```text
//! <cli_command> <input.d2> <output.png> [--theme=T] [--layout=L]
//! ```
//!
//! and counts as successful when it exits 0 and leaves a non-empty output
//! file behind.

use std::collections::HashMap;
use std::time::Duration;

use super::{run_tool, RenderError};
use crate::config::RenderConfig;
use crate::document::{Cell, CellKind, DiagramDocument, Geometry, Style};

/// Title of the placeholder shown when this path fails.
pub const D2_ERROR_TITLE: &str = "D2 Diagram Generation Error";

#[derive(Debug, Clone)]
pub struct D2Cli {
    command: String,
    theme: Option<String>,
    layout: Option<String>,
    timeout: Duration,
}

impl D2Cli {
    pub fn new(
        command: &str,
        theme: Option<&str>,
        layout: Option<&str>,
        timeout_secs: u64,
    ) -> Self {
        Self {
            command: command.to_string(),
            theme: theme.map(str::to_string),
            layout: layout.map(str::to_string),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn from_config(config: &RenderConfig) -> Self {
        Self::new(
            &config.cli_command,
            config.cli_theme.as_deref(),
            config.cli_layout.as_deref(),
            config.cli_timeout_secs,
        )
    }

    /// Renders D2 source to `format` (`png` or `svg`) in a scratch directory.
    pub async fn render(&self, source: &str, format: &str) -> Result<Vec<u8>, RenderError> {
        let scratch = tempfile::tempdir()
            .map_err(|e| RenderError::ToolFailed(format!("scratch directory: {}", e)))?;
        let input = scratch.path().join("diagram.d2");
        let output = scratch.path().join(format!("diagram.{}", format));
        tokio::fs::write(&input, source)
            .await
            .map_err(|e| RenderError::ToolFailed(format!("writing D2 input: {}", e)))?;

        let mut cmd = tokio::process::Command::new(&self.command);
        cmd.arg(&input).arg(&output);
        if let Some(theme) = &self.theme {
            cmd.arg(format!("--theme={}", theme));
        }
        if let Some(layout) = &self.layout {
            cmd.arg(format!("--layout={}", layout));
        }
        run_tool(cmd, self.timeout).await?;

        match tokio::fs::read(&output).await {
            Ok(bytes) if !bytes.is_empty() => Ok(bytes),
            _ => Err(RenderError::ToolFailed(format!(
                "{} produced no output",
                self.command
            ))),
        }
    }
}

/// Renders either a stored diagram document (XML) or raw D2 source.
///
/// Raw D2 goes through [`repair_braces`] first.
pub async fn source_to_png(source: &str, cli: &D2Cli) -> Result<Vec<u8>, RenderError> {
    let d2 = if source.trim_start().starts_with('<') {
        let (doc, _) = DiagramDocument::parse_lenient(source)
            .map_err(|e| RenderError::Parse(e.to_string()))?;
        to_d2(&doc)
    } else {
        let (fixed, repaired) = repair_braces(source)?;
        if repaired {
            eprintln!("Warning: D2 source had unbalanced braces and has been repaired");
        }
        fixed
    };
    cli.render(&d2, "png").await
}

pub fn to_d2(doc: &DiagramDocument) -> String {
    let vertices: Vec<&Cell> = doc.vertices().collect();
    let lanes: Vec<(&Cell, &Geometry)> = vertices
        .iter()
        .filter(|c| c.style.shape() == "swimlane")
        .filter_map(|c| c.geometry().map(|g| (*c, g)))
        .collect();

    let mut parent: HashMap<&str, &str> = HashMap::new();
    for cell in &vertices {
        if cell.style.shape() == "swimlane" {
            continue;
        }
        let Some(g) = cell.geometry() else {
            continue;
        };
        if let Some((lane, _)) = lanes.iter().find(|(_, lg)| contains(lg, g)) {
            parent.insert(cell.id.as_str(), lane.id.as_str());
        }
    }

    let path = |id: &str| match parent.get(id) {
        Some(p) => format!("{}.{}", d2_key(p), d2_key(id)),
        None => d2_key(id),
    };

    let mut out = String::from("direction: right\n\n");
    let mut title_placed = false;

    for cell in &vertices {
        if cell.style.shape() == "swimlane" || parent.contains_key(cell.id.as_str()) {
            continue;
        }
        let near = is_title(&cell.style) && !title_placed;
        title_placed |= near;
        out.push_str(&node_decl(cell, "", near));
    }

    for (lane, _) in &lanes {
        out.push_str(&format!("{}: {} {{\n", d2_key(&lane.id), quote(&lane.value)));
        for prop in style_props(&lane.style) {
            out.push_str(&format!("  {}\n", prop));
        }
        for cell in vertices
            .iter()
            .filter(|c| parent.get(c.id.as_str()) == Some(&lane.id.as_str()))
        {
            out.push_str(&node_decl(cell, "  ", false));
        }
        out.push_str("}\n");
    }

    let known: std::collections::HashSet<&str> = vertices.iter().map(|c| c.id.as_str()).collect();
    let mut wrote_edge = false;
    for edge in doc.edges() {
        let CellKind::Edge {
            source: Some(s),
            target: Some(t),
        } = &edge.kind
        else {
            continue;
        };
        if !known.contains(s.as_str()) || !known.contains(t.as_str()) {
            continue;
        }
        if !wrote_edge {
            out.push('\n');
            wrote_edge = true;
        }
        let mut line = format!("{} -> {}", path(s), path(t));
        if !edge.value.trim().is_empty() {
            line.push_str(&format!(": {}", quote(&edge.value)));
        }
        let mut props = Vec::new();
        if let Some(color) = edge.style.get("strokeColor") {
            props.push(format!("style.stroke: {}", quote(color)));
        }
        if edge.style.flag("dashed") {
            props.push("style.stroke-dash: 4".to_string());
        }
        if !props.is_empty() {
            line.push_str(&format!(" {{ {} }}", props.join("; ")));
        }
        out.push_str(&line);
        out.push('\n');
    }
    out
}

fn contains(outer: &Geometry, inner: &Geometry) -> bool {
    inner.x >= outer.x
        && inner.y >= outer.y
        && inner.x + inner.width <= outer.x + outer.width
        && inner.y + inner.height <= outer.y + outer.height
}

fn is_title(style: &Style) -> bool {
    style.shape() == "text"
        && style
            .get("fontSize")
            .and_then(|s| s.parse::<f64>().ok())
            .is_some_and(|s| s >= 18.0)
}

fn node_decl(cell: &Cell, indent: &str, near_top: bool) -> String {
    let mut props = Vec::new();
    if let Some(shape) = d2_shape(&cell.style) {
        props.push(format!("shape: {}", shape));
    }
    if near_top {
        props.push("near: top-center".to_string());
    }
    props.extend(style_props(&cell.style));

    let mut out = format!("{}{}: {}", indent, d2_key(&cell.id), quote(&cell.value));
    if props.is_empty() {
        out.push('\n');
        return out;
    }
    out.push_str(" {\n");
    for prop in props {
        out.push_str(&format!("{}  {}\n", indent, prop));
    }
    out.push_str(&format!("{}}}\n", indent));
    out
}

fn d2_shape(style: &Style) -> Option<&'static str> {
    match style.shape() {
        "ellipse" => Some("oval"),
        "rhombus" => Some("diamond"),
        "hexagon" => Some("hexagon"),
        "cylinder" | "cylinder3" => Some("cylinder"),
        "cloud" => Some("cloud"),
        "text" => Some("text"),
        "mxgraph.network.router" => Some("circle"),
        _ => None,
    }
}

fn style_props(style: &Style) -> Vec<String> {
    let mut props = Vec::new();
    if style.shape() == "text" {
        if let Some(size) = style.get("fontSize").and_then(|s| s.parse::<u32>().ok()) {
            props.push(format!("style.font-size: {}", size));
        }
        return props;
    }
    if let Some(fill) = style.get("fillColor").filter(|c| *c != "none") {
        props.push(format!("style.fill: {}", quote(fill)));
    }
    if let Some(stroke) = style.get("strokeColor").filter(|c| *c != "none") {
        props.push(format!("style.stroke: {}", quote(stroke)));
    }
    if style.flag("rounded") {
        props.push("style.border-radius: 8".to_string());
    }
    if style
        .get("fontStyle")
        .and_then(|s| s.parse::<u32>().ok())
        .is_some_and(|bits| bits & 1 == 1)
    {
        props.push("style.bold: true".to_string());
    }
    props
}

/// Cell ids as D2 keys: anything outside `[A-Za-z0-9_-]` becomes `_`.
fn d2_key(id: &str) -> String {
    let key: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if key.is_empty() {
        "cell".to_string()
    } else {
        key
    }
}

fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => {}
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Balances `{`/`}` in D2 source, ignoring braces inside quoted strings
/// and `#` comments. Stray closers are dropped and missing closers
/// appended. Returns the fixed source and whether anything changed.
///
/// An unterminated string cannot be repaired.
pub fn repair_braces(source: &str) -> Result<(String, bool), RenderError> {
    let mut out = String::with_capacity(source.len() + 8);
    let mut depth = 0usize;
    let mut changed = false;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut comment = false;

    for (line_no, line) in source.split_inclusive('\n').enumerate() {
        for c in line.chars() {
            if comment {
                out.push(c);
                continue;
            }
            if let Some(q) = quote {
                out.push(c);
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == q {
                    quote = None;
                }
                continue;
            }
            match c {
                '"' | '\'' => {
                    quote = Some(c);
                    out.push(c);
                }
                '#' => {
                    comment = true;
                    out.push(c);
                }
                '{' => {
                    depth += 1;
                    out.push(c);
                }
                '}' if depth == 0 => changed = true,
                '}' => {
                    depth -= 1;
                    out.push(c);
                }
                c => out.push(c),
            }
        }
        if quote.is_some() {
            return Err(RenderError::Unbalanced(format!(
                "unterminated string on line {}",
                line_no + 1
            )));
        }
        comment = false;
    }

    if depth > 0 {
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        for _ in 0..depth {
            out.push_str("}\n");
        }
        changed = true;
    }
    Ok((out, changed))
}
