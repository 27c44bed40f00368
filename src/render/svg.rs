//! Diagram document → SVG.
//!
//! Shapes are emitted by hand from the style of each cell. The output only
//! depends on the document, so rendering the same file twice yields the
//! same bytes.
//!
//! Tolerated input problems:
//! - nodes without usable geometry are skipped, along with their edges;
//! - missing style keys fall back to black-on-white defaults;
//! - unreadable XML is repaired once, then replaced by an error SVG.

use std::collections::{BTreeSet, HashMap};

use super::placeholder::error_svg;
use super::{escape_xml, RenderError};
use crate::document::{fmt_num, Cell, CellKind, DiagramDocument, Geometry, Style};

const PAD: f64 = 20.0;
const DEFAULT_FILL: &str = "#ffffff";
const DEFAULT_STROKE: &str = "#000000";
const DEFAULT_FONT_SIZE: f64 = 12.0;
const EDGE_FONT_SIZE: f64 = 11.0;

pub struct SvgOutput {
    pub svg: String,
    /// Set when the error SVG was emitted instead of the diagram.
    pub error: Option<RenderError>,
    pub repaired: bool,
}

/// Parses (repairing once if needed) and renders a stored document.
pub fn render_source(source: &str, scale: f64) -> SvgOutput {
    match DiagramDocument::parse_lenient(source) {
        Ok((doc, repaired)) => {
            if repaired {
                eprintln!("Warning: diagram XML was malformed and has been repaired");
            }
            SvgOutput {
                svg: document_to_svg(&doc, scale),
                error: None,
                repaired,
            }
        }
        Err(e) => {
            let err = RenderError::Parse(e.to_string());
            eprintln!("Warning: {}", err);
            SvgOutput {
                svg: error_svg("Diagram Render Error", &err.to_string(), source),
                error: Some(err),
                repaired: false,
            }
        }
    }
}

pub fn document_to_svg(doc: &DiagramDocument, scale: f64) -> String {
    let placed: HashMap<&str, &Geometry> = doc
        .vertices()
        .filter_map(|c| c.geometry().map(|g| (c.id.as_str(), g)))
        .collect();

    let Some((min_x, min_y, max_x, max_y)) = doc
        .vertices()
        .filter_map(Cell::geometry)
        .fold(None, |acc: Option<(f64, f64, f64, f64)>, g| {
            let (x0, y0, x1, y1) = acc.unwrap_or((g.x, g.y, g.x + g.width, g.y + g.height));
            Some((
                x0.min(g.x),
                y0.min(g.y),
                x1.max(g.x + g.width),
                y1.max(g.y + g.height),
            ))
        })
    else {
        return empty_svg(&doc.name, scale);
    };

    let (vx, vy) = (min_x - PAD, min_y - PAD);
    let (vw, vh) = (max_x - min_x + 2.0 * PAD, max_y - min_y + 2.0 * PAD);

    let edges: Vec<(&Cell, &Geometry, &Geometry)> = doc
        .edges()
        .filter_map(|e| match &e.kind {
            CellKind::Edge {
                source: Some(s),
                target: Some(t),
            } => Some((e, *placed.get(s.as_str())?, *placed.get(t.as_str())?)),
            _ => None,
        })
        .collect();

    let markers: Vec<String> = edges
        .iter()
        .filter(|(e, _, _)| has_arrow(&e.style))
        .map(|(e, _, _)| stroke_color(&e.style).to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let mut out = String::new();
    out.push_str(&format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{}" height="{}" viewBox="{} {} {} {}" font-family="Helvetica, Arial, sans-serif">"#,
        fmt_num(vw * scale),
        fmt_num(vh * scale),
        fmt_num(vx),
        fmt_num(vy),
        fmt_num(vw),
        fmt_num(vh),
    ));
    out.push('\n');
    out.push_str(&format!(
        "<title>{}</title>\n",
        escape_xml(&doc.name)
    ));
    out.push_str(&format!(
        r##"<rect x="{}" y="{}" width="{}" height="{}" fill="#ffffff"/>"##,
        fmt_num(vx),
        fmt_num(vy),
        fmt_num(vw),
        fmt_num(vh)
    ));
    out.push('\n');

    if !markers.is_empty() {
        out.push_str("<defs>\n");
        for (i, color) in markers.iter().enumerate() {
            out.push_str(&format!(
                r#"<marker id="arrow-{}" viewBox="0 0 10 10" refX="9" refY="5" markerWidth="8" markerHeight="8" orient="auto"><path d="M0,0 L10,5 L0,10 z" fill="{}"/></marker>"#,
                i,
                escape_xml(color)
            ));
            out.push('\n');
        }
        out.push_str("</defs>\n");
    }

    // containers first so nodes and edges draw on top of them
    for cell in doc.vertices().filter(|c| c.style.shape() == "swimlane") {
        if let Some(g) = cell.geometry() {
            out.push_str(&vertex_svg(cell, g));
        }
    }
    for (edge, s, t) in &edges {
        let marker = markers
            .iter()
            .position(|m| m == stroke_color(&edge.style))
            .filter(|_| has_arrow(&edge.style));
        out.push_str(&edge_svg(edge, s, t, marker));
    }
    for cell in doc.vertices().filter(|c| c.style.shape() != "swimlane") {
        if let Some(g) = cell.geometry() {
            out.push_str(&vertex_svg(cell, g));
        }
    }

    out.push_str("</svg>\n");
    out
}

fn empty_svg(name: &str, scale: f64) -> String {
    format!(
        concat!(
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 240 80" font-family="Helvetica, Arial, sans-serif">"#,
            "\n<title>{name}</title>\n",
            r##"<rect x="0" y="0" width="240" height="80" fill="#ffffff" stroke="#cccccc"/>"##,
            "\n",
            r##"<text x="120" y="44" font-size="14" fill="#666666" text-anchor="middle">Empty diagram</text>"##,
            "\n</svg>\n"
        ),
        w = fmt_num(240.0 * scale),
        h = fmt_num(80.0 * scale),
        name = escape_xml(name),
    )
}

fn has_arrow(style: &Style) -> bool {
    style.get("endArrow") != Some("none")
}

fn stroke_color(style: &Style) -> &str {
    style.get("strokeColor").unwrap_or(DEFAULT_STROKE)
}

fn paint(style: &Style, fill: &str) -> String {
    let stroke = stroke_color(style);
    let width = style
        .get("strokeWidth")
        .and_then(|w| w.parse::<f64>().ok())
        .filter(|w| w.is_finite() && *w >= 0.0)
        .unwrap_or(1.0);
    let dash = if style.flag("dashed") {
        r#" stroke-dasharray="6 4""#
    } else {
        ""
    };
    format!(
        r#"fill="{}" stroke="{}" stroke-width="{}"{}"#,
        escape_xml(fill),
        escape_xml(stroke),
        fmt_num(width),
        dash
    )
}

fn vertex_svg(cell: &Cell, g: &Geometry) -> String {
    let style = &cell.style;
    let fill = style.get("fillColor").unwrap_or(DEFAULT_FILL);
    let p = paint(style, fill);
    let (x, y, w, h) = (g.x, g.y, g.width, g.height);
    let (cx, cy) = g.center();
    let n = fmt_num;
    let mut out = String::new();
    let mut label_center = (cx, cy);
    let mut label_width = w;

    match style.shape() {
        "text" => {}
        "ellipse" => out.push_str(&format!(
            r#"<ellipse cx="{}" cy="{}" rx="{}" ry="{}" {}/>"#,
            n(cx),
            n(cy),
            n(w / 2.0),
            n(h / 2.0),
            p
        )),
        "rhombus" => out.push_str(&format!(
            r#"<polygon points="{},{} {},{} {},{} {},{}" {}/>"#,
            n(cx),
            n(y),
            n(x + w),
            n(cy),
            n(cx),
            n(y + h),
            n(x),
            n(cy),
            p
        )),
        "hexagon" => {
            let inset = (w * 0.2).min(h / 2.0);
            out.push_str(&format!(
                r#"<polygon points="{},{} {},{} {},{} {},{} {},{} {},{}" {}/>"#,
                n(x + inset),
                n(y),
                n(x + w - inset),
                n(y),
                n(x + w),
                n(cy),
                n(x + w - inset),
                n(y + h),
                n(x + inset),
                n(y + h),
                n(x),
                n(cy),
                p
            ));
            label_width = w - 2.0 * inset;
        }
        "cylinder3" | "cylinder" => {
            // Short cylinders can have max_ry below 2, so no clamp here.
            let max_ry = h / 4.0;
            let ry = style
                .get("size")
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(10.0)
                .min(max_ry)
                .max(max_ry.min(2.0));
            let rx = w / 2.0;
            out.push_str(&format!(
                r#"<path d="M{},{} A{},{} 0 0 1 {},{} L{},{} A{},{} 0 0 1 {},{} Z" {}/>"#,
                n(x),
                n(y + ry),
                n(rx),
                n(ry),
                n(x + w),
                n(y + ry),
                n(x + w),
                n(y + h - ry),
                n(rx),
                n(ry),
                n(x),
                n(y + h - ry),
                p
            ));
            out.push_str(&format!(
                r#"<path d="M{},{} A{},{} 0 0 0 {},{}" {}/>"#,
                n(x),
                n(y + ry),
                n(rx),
                n(ry),
                n(x + w),
                n(y + ry),
                paint(style, "none")
            ));
            label_center = (cx, cy + ry / 2.0);
        }
        "cloud" => {
            let px = |f: f64| n(x + f * w);
            let py = |f: f64| n(y + f * h);
            out.push_str(&format!(
                r#"<path d="M{},{} C{},{} {},{} {},{} C{},{} {},{} {},{} C{},{} {},{} {},{} C{},{} {},{} {},{} Z" {}/>"#,
                px(0.25), py(0.85),
                px(0.0), py(0.85), px(0.0), py(0.45), px(0.2), py(0.45),
                px(0.18), py(0.05), px(0.55), py(0.0), px(0.6), py(0.28),
                px(0.72), py(0.05), px(1.0), py(0.18), px(0.86), py(0.45),
                px(1.02), py(0.5), px(1.0), py(0.85), px(0.8), py(0.85),
                p
            ));
            label_center = (cx, y + 0.58 * h);
            label_width = w * 0.7;
        }
        "process" => {
            let bar = w * 0.1;
            out.push_str(&rect(x, y, w, h, 0.0, &p));
            out.push_str(&format!(
                r#"<path d="M{},{} L{},{} M{},{} L{},{}" {}/>"#,
                n(x + bar),
                n(y),
                n(x + bar),
                n(y + h),
                n(x + w - bar),
                n(y),
                n(x + w - bar),
                n(y + h),
                paint(style, "none")
            ));
            label_width = w - 2.0 * bar;
        }
        "swimlane" => {
            let header = style
                .get("startSize")
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(30.0)
                .clamp(0.0, h);
            out.push_str(&rect(x, y, w, h, 0.0, &paint(style, "#ffffff")));
            out.push_str(&rect(x, y, w, header, 0.0, &p));
            label_center = (cx, y + header / 2.0);
        }
        shape if shape.starts_with("mxgraph.network.") => {
            out.push_str(&rect(x, y, w, h, (w.min(h) * 0.12).min(8.0), &p));
            out.push_str(&network_glyph(&shape["mxgraph.network.".len()..], g, style));
            label_center = (cx + h * 0.2, cy);
            label_width = w - h * 0.45;
        }
        _ => {
            let rx = if style.flag("rounded") {
                (w.min(h) * 0.15).min(10.0)
            } else {
                0.0
            };
            out.push_str(&rect(x, y, w, h, rx, &p));
        }
    }
    out.push('\n');

    let font_size = style
        .get("fontSize")
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|s| s.is_finite() && *s > 0.0)
        .unwrap_or(DEFAULT_FONT_SIZE);
    let bold = style
        .get("fontStyle")
        .and_then(|s| s.parse::<u32>().ok())
        .is_some_and(|bits| bits & 1 == 1);
    let color = style.get("fontColor").unwrap_or("#000000");
    out.push_str(&text_svg(
        &cell.value,
        label_center,
        label_width,
        font_size,
        color,
        bold,
        "",
    ));
    out
}

fn rect(x: f64, y: f64, w: f64, h: f64, rx: f64, paint: &str) -> String {
    let corner = if rx > 0.0 {
        format!(r#" rx="{}" ry="{}""#, fmt_num(rx), fmt_num(rx))
    } else {
        String::new()
    };
    format!(
        r#"<rect x="{}" y="{}" width="{}" height="{}"{} {}/>"#,
        fmt_num(x),
        fmt_num(y),
        fmt_num(w),
        fmt_num(h),
        corner,
        paint
    )
}

/// Small icon in the left part of a network node.
fn network_glyph(kind: &str, g: &Geometry, style: &Style) -> String {
    let n = fmt_num;
    let size = (g.height * 0.5).min(g.width * 0.25);
    let gx = g.x + g.height * 0.2;
    let gy = g.y + (g.height - size) / 2.0;
    let stroke = escape_xml(stroke_color(style));
    match kind {
        "router" => format!(
            r#"<circle cx="{}" cy="{}" r="{}" fill="none" stroke="{s}"/><path d="M{},{} L{},{} M{},{} L{},{}" stroke="{s}"/>"#,
            n(gx + size / 2.0),
            n(gy + size / 2.0),
            n(size / 2.0),
            n(gx + size * 0.15),
            n(gy + size / 2.0),
            n(gx + size * 0.85),
            n(gy + size / 2.0),
            n(gx + size / 2.0),
            n(gy + size * 0.15),
            n(gx + size / 2.0),
            n(gy + size * 0.85),
            s = stroke
        ),
        "firewall" => format!(
            r#"<rect x="{}" y="{}" width="{}" height="{}" fill="none" stroke="{s}"/><path d="M{},{} L{},{} M{},{} L{},{} M{},{} L{},{}" stroke="{s}"/>"#,
            n(gx),
            n(gy),
            n(size),
            n(size),
            n(gx),
            n(gy + size / 3.0),
            n(gx + size),
            n(gy + size / 3.0),
            n(gx),
            n(gy + 2.0 * size / 3.0),
            n(gx + size),
            n(gy + 2.0 * size / 3.0),
            n(gx + size / 2.0),
            n(gy),
            n(gx + size / 2.0),
            n(gy + size / 3.0),
            s = stroke
        ),
        _ => {
            let mut out = format!(
                r#"<rect x="{}" y="{}" width="{}" height="{}" fill="none" stroke="{}"/>"#,
                n(gx),
                n(gy),
                n(size * 0.7),
                n(size),
                stroke
            );
            for i in 1..=2 {
                let ly = gy + size * i as f64 / 3.0;
                out.push_str(&format!(
                    r#"<path d="M{},{} L{},{}" stroke="{}"/>"#,
                    n(gx),
                    n(ly),
                    n(gx + size * 0.7),
                    n(ly),
                    stroke
                ));
            }
            out
        }
    }
}

fn edge_svg(edge: &Cell, s: &Geometry, t: &Geometry, marker: Option<usize>) -> String {
    let n = fmt_num;
    let style = &edge.style;
    let (scx, scy) = s.center();
    let (tcx, tcy) = t.center();
    let (dx, dy) = (tcx - scx, tcy - scy);
    if dx == 0.0 && dy == 0.0 {
        return String::new();
    }

    let orthogonal = style
        .get("edgeStyle")
        .is_some_and(|e| e.contains("orthogonal") || e.contains("elbow"));

    let (d, label_at) = if orthogonal {
        if dx.abs() >= dy.abs() {
            let dir = if dx >= 0.0 { 1.0 } else { -1.0 };
            let sx = scx + dir * s.width / 2.0;
            let tx = tcx - dir * t.width / 2.0;
            let mx = (sx + tx) / 2.0;
            (
                format!(
                    "M{},{} L{},{} L{},{} L{},{}",
                    n(sx),
                    n(scy),
                    n(mx),
                    n(scy),
                    n(mx),
                    n(tcy),
                    n(tx),
                    n(tcy)
                ),
                (mx, (scy + tcy) / 2.0),
            )
        } else {
            let dir = if dy >= 0.0 { 1.0 } else { -1.0 };
            let sy = scy + dir * s.height / 2.0;
            let ty = tcy - dir * t.height / 2.0;
            let my = (sy + ty) / 2.0;
            (
                format!(
                    "M{},{} L{},{} L{},{} L{},{}",
                    n(scx),
                    n(sy),
                    n(scx),
                    n(my),
                    n(tcx),
                    n(my),
                    n(tcx),
                    n(ty)
                ),
                ((scx + tcx) / 2.0, my),
            )
        }
    } else {
        let (x0, y0) = clip_to_box(s, dx, dy);
        let (x1, y1) = clip_to_box(t, -dx, -dy);
        if style.flag("curved") {
            // control point offset perpendicular to the chord
            let (cx, cy) = ((x0 + x1) / 2.0 - dy * 0.2, (y0 + y1) / 2.0 + dx * 0.2);
            (
                format!(
                    "M{},{} Q{},{} {},{}",
                    n(x0),
                    n(y0),
                    n(cx),
                    n(cy),
                    n(x1),
                    n(y1)
                ),
                (
                    0.25 * x0 + 0.5 * cx + 0.25 * x1,
                    0.25 * y0 + 0.5 * cy + 0.25 * y1,
                ),
            )
        } else {
            (
                format!("M{},{} L{},{}", n(x0), n(y0), n(x1), n(y1)),
                ((x0 + x1) / 2.0, (y0 + y1) / 2.0),
            )
        }
    };

    let join = if style.flag("rounded") {
        r#" stroke-linejoin="round""#
    } else {
        ""
    };
    let end = marker
        .map(|i| format!(r#" marker-end="url(#arrow-{})""#, i))
        .unwrap_or_default();
    let mut out = format!(
        r#"<path d="{}" {}{}{}/>"#,
        d,
        paint(style, "none"),
        join,
        end
    );
    out.push('\n');
    out.push_str(&text_svg(
        &edge.value,
        label_at,
        160.0,
        EDGE_FONT_SIZE,
        "#333333",
        false,
        r##" stroke="#ffffff" stroke-width="3" paint-order="stroke""##,
    ));
    out
}

/// Point where the ray from the box center along (dx, dy) leaves the box.
fn clip_to_box(g: &Geometry, dx: f64, dy: f64) -> (f64, f64) {
    let (cx, cy) = g.center();
    let tx = if dx != 0.0 {
        (g.width / 2.0) / dx.abs()
    } else {
        f64::INFINITY
    };
    let ty = if dy != 0.0 {
        (g.height / 2.0) / dy.abs()
    } else {
        f64::INFINITY
    };
    let t = tx.min(ty);
    (cx + dx * t, cy + dy * t)
}

fn text_svg(
    value: &str,
    (cx, cy): (f64, f64),
    width: f64,
    font_size: f64,
    color: &str,
    bold: bool,
    extra: &str,
) -> String {
    let text = plain_text(value);
    if text.trim().is_empty() {
        return String::new();
    }
    let max_chars = (((width - 8.0) / (font_size * 0.6)).floor() as usize).max(4);
    let lines = wrap(&text, max_chars);
    let line_h = font_size * 1.2;
    let first = cy - (lines.len() as f64 - 1.0) * line_h / 2.0 + font_size * 0.35;

    let weight = if bold { r#" font-weight="bold""# } else { "" };
    let mut out = format!(
        r#"<text font-size="{}" fill="{}" text-anchor="middle"{}{}>"#,
        fmt_num(font_size),
        escape_xml(color),
        weight,
        extra
    );
    for (i, line) in lines.iter().enumerate() {
        out.push_str(&format!(
            r#"<tspan x="{}" y="{}">{}</tspan>"#,
            fmt_num(cx),
            fmt_num(first + i as f64 * line_h),
            escape_xml(line)
        ));
    }
    out.push_str("</text>\n");
    out
}

/// Strips the HTML that `html=1` labels may carry.
fn plain_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find('<') {
        out.push_str(&rest[..start]);
        match rest[start..].find('>') {
            Some(end) => {
                let tag = rest[start + 1..start + end].trim().to_ascii_lowercase();
                if tag.starts_with("br") || tag == "/div" || tag == "/p" {
                    out.push('\n');
                }
                rest = &rest[start + end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

fn wrap(text: &str, max_chars: usize) -> Vec<String> {
    let mut lines = Vec::new();
    for paragraph in text.lines() {
        let mut line = String::new();
        for word in paragraph.split_whitespace() {
            let len = line.chars().count();
            if len > 0 && len + 1 + word.chars().count() > max_chars {
                lines.push(std::mem::take(&mut line));
            }
            if !line.is_empty() {
                line.push(' ');
            }
            line.push_str(word);
        }
        if !line.is_empty() {
            lines.push(line);
        }
    }
    lines
}
