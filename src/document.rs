//! The diagram description document.
//!
//! Documents use the draw.io (mxGraph) XML dialect so they can be opened in
//! third-party diagram software as a last-resort download:
//!
//! ```text
//! <mxfile host="diagram-chat">
//!   <diagram id="..." name="Title">
//!     <mxGraphModel>
//!       <root>
//!         <mxCell id="0"/>
//!         <mxCell id="1" parent="0"/>
//!         <mxCell id="node-0" value="VPC" style="shape=cloud;..." vertex="1" parent="1">
//!           <mxGeometry x="40" y="40" width="160" height="60" as="geometry"/>
//!         </mxCell>
//!         <mxCell id="edge-0" value="" style="..." edge="1" parent="1" source="node-0" target="node-1">
//!           <mxGeometry relative="1" as="geometry"/>
//!         </mxCell>
//!       </root>
//!     </mxGraphModel>
//!   </diagram>
//! </mxfile>
//! ```
//!
//! A document is written once per diagram and never edited afterwards;
//! re-rendering always re-reads the file.

use anyhow::Result;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use std::collections::HashMap;
use std::fmt;

/// Ordered `key=value;` pairs of an mxGraph style string. Bare tokens such
/// as `ellipse;` are stored with an empty value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Style {
    entries: Vec<(String, String)>,
}

impl Style {
    pub fn parse(s: &str) -> Self {
        let entries = s
            .split(';')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| match t.split_once('=') {
                Some((k, v)) => (k.trim().to_string(), v.trim().to_string()),
                None => (t.to_string(), String::new()),
            })
            .collect();
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn flag(&self, key: &str) -> bool {
        self.get(key) == Some("1")
    }

    /// Sets `key`, replacing an existing value in place.
    pub fn set(&mut self, key: &str, value: &str) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.entries.push((key.to_string(), value.to_string())),
        }
    }

    /// Shape name: `shape=` when present, else a bare shape token
    /// (`ellipse`, `rhombus`, `text`, `swimlane`), else `rectangle`.
    pub fn shape(&self) -> &str {
        if let Some(shape) = self.get("shape") {
            return shape;
        }
        for token in ["ellipse", "rhombus", "text", "swimlane"] {
            if self.has(token) {
                return token;
            }
        }
        "rectangle"
    }
}

impl fmt::Display for Style {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (k, v) in &self.entries {
            if v.is_empty() {
                write!(f, "{};", k)?;
            } else {
                write!(f, "{}={};", k, v)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geometry {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Geometry {
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn overlaps(&self, other: &Geometry) -> bool {
        self.x < other.x + other.width
            && other.x < self.x + self.width
            && self.y < other.y + other.height
            && other.y < self.y + self.height
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellKind {
    /// A node. Geometry is `None` when the source document omitted or
    /// mangled it; such nodes are skipped by renderers.
    Vertex { geometry: Option<Geometry> },
    Edge {
        source: Option<String>,
        target: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub id: String,
    pub value: String,
    pub style: Style,
    pub kind: CellKind,
}

impl Cell {
    pub fn vertex(id: &str, value: &str, style: Style, geometry: Geometry) -> Self {
        Self {
            id: id.to_string(),
            value: value.to_string(),
            style,
            kind: CellKind::Vertex {
                geometry: Some(geometry),
            },
        }
    }

    pub fn edge(id: &str, value: &str, style: Style, source: &str, target: &str) -> Self {
        Self {
            id: id.to_string(),
            value: value.to_string(),
            style,
            kind: CellKind::Edge {
                source: Some(source.to_string()),
                target: Some(target.to_string()),
            },
        }
    }

    pub fn geometry(&self) -> Option<&Geometry> {
        match &self.kind {
            CellKind::Vertex { geometry } => geometry.as_ref(),
            CellKind::Edge { .. } => None,
        }
    }

    pub fn is_edge(&self) -> bool {
        matches!(self.kind, CellKind::Edge { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiagramDocument {
    pub id: String,
    pub name: String,
    pub cells: Vec<Cell>,
}

/// Failure to read a document.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentError {
    /// The XML itself is ill-formed.
    Xml(String),
    /// The input ended with these elements still open (outermost first).
    Unclosed(Vec<String>),
    /// Well-formed XML with no diagram model in it.
    NotADiagram,
}

impl fmt::Display for DocumentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentError::Xml(e) => write!(f, "malformed diagram XML: {}", e),
            DocumentError::Unclosed(tags) => {
                write!(f, "diagram XML ends with unclosed elements: {}", tags.join(", "))
            }
            DocumentError::NotADiagram => write!(f, "no diagram model found in document"),
        }
    }
}

impl std::error::Error for DocumentError {}

impl DiagramDocument {
    pub fn new(name: &str) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: id[..12].to_string(),
            name: name.to_string(),
            cells: Vec::new(),
        }
    }

    pub fn find(&self, id: &str) -> Option<&Cell> {
        self.cells.iter().find(|c| c.id == id)
    }

    pub fn vertices(&self) -> impl Iterator<Item = &Cell> {
        self.cells.iter().filter(|c| !c.is_edge())
    }

    pub fn edges(&self) -> impl Iterator<Item = &Cell> {
        self.cells.iter().filter(|c| c.is_edge())
    }

    /// Serializes to mxGraph XML. Every element opened here is closed.
    pub fn to_xml(&self) -> Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let mut mxfile = BytesStart::new("mxfile");
        mxfile.push_attribute(("host", "diagram-chat"));
        mxfile.push_attribute(("version", env!("CARGO_PKG_VERSION")));
        writer.write_event(Event::Start(mxfile))?;

        let mut diagram = BytesStart::new("diagram");
        diagram.push_attribute(("id", self.id.as_str()));
        diagram.push_attribute(("name", self.name.as_str()));
        writer.write_event(Event::Start(diagram))?;

        let mut model = BytesStart::new("mxGraphModel");
        for (k, v) in [
            ("grid", "1"),
            ("gridSize", "10"),
            ("guides", "1"),
            ("arrows", "1"),
            ("page", "0"),
        ] {
            model.push_attribute((k, v));
        }
        writer.write_event(Event::Start(model))?;
        writer.write_event(Event::Start(BytesStart::new("root")))?;

        let mut root0 = BytesStart::new("mxCell");
        root0.push_attribute(("id", "0"));
        writer.write_event(Event::Empty(root0))?;
        let mut root1 = BytesStart::new("mxCell");
        root1.push_attribute(("id", "1"));
        root1.push_attribute(("parent", "0"));
        writer.write_event(Event::Empty(root1))?;

        for cell in &self.cells {
            let style = cell.style.to_string();
            let mut start = BytesStart::new("mxCell");
            start.push_attribute(("id", cell.id.as_str()));
            start.push_attribute(("value", cell.value.as_str()));
            start.push_attribute(("style", style.as_str()));

            let geometry = match &cell.kind {
                CellKind::Vertex { geometry } => {
                    start.push_attribute(("vertex", "1"));
                    start.push_attribute(("parent", "1"));
                    let mut geo = BytesStart::new("mxGeometry");
                    if let Some(g) = geometry {
                        geo.push_attribute(("x", fmt_num(g.x).as_str()));
                        geo.push_attribute(("y", fmt_num(g.y).as_str()));
                        geo.push_attribute(("width", fmt_num(g.width).as_str()));
                        geo.push_attribute(("height", fmt_num(g.height).as_str()));
                    }
                    geo.push_attribute(("as", "geometry"));
                    geometry.map(|_| geo)
                }
                CellKind::Edge { source, target } => {
                    start.push_attribute(("edge", "1"));
                    start.push_attribute(("parent", "1"));
                    if let Some(s) = source {
                        start.push_attribute(("source", s.as_str()));
                    }
                    if let Some(t) = target {
                        start.push_attribute(("target", t.as_str()));
                    }
                    let mut geo = BytesStart::new("mxGeometry");
                    geo.push_attribute(("relative", "1"));
                    geo.push_attribute(("as", "geometry"));
                    Some(geo)
                }
            };

            match geometry {
                Some(geo) => {
                    writer.write_event(Event::Start(start))?;
                    writer.write_event(Event::Empty(geo))?;
                    writer.write_event(Event::End(BytesEnd::new("mxCell")))?;
                }
                None => writer.write_event(Event::Empty(start))?,
            }
        }

        writer.write_event(Event::End(BytesEnd::new("root")))?;
        writer.write_event(Event::End(BytesEnd::new("mxGraphModel")))?;
        writer.write_event(Event::End(BytesEnd::new("diagram")))?;
        writer.write_event(Event::End(BytesEnd::new("mxfile")))?;

        Ok(String::from_utf8(writer.into_inner())?)
    }

    /// Strict parse. Cells that are neither vertices nor edges (the two
    /// root cells) are skipped.
    pub fn parse(xml: &str) -> Result<Self, DocumentError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut doc = DiagramDocument {
            id: String::new(),
            name: String::new(),
            cells: Vec::new(),
        };
        let mut stack: Vec<String> = Vec::new();
        let mut current: Option<Cell> = None;
        let mut saw_model = false;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                    match name.as_str() {
                        "mxCell" => current = cell_from_attrs(&attrs(&e)?),
                        "mxGeometry" => apply_geometry(&mut current, &attrs(&e)?),
                        "diagram" => read_diagram_attrs(&mut doc, &attrs(&e)?),
                        "mxGraphModel" | "mxfile" => saw_model = true,
                        _ => {}
                    }
                    stack.push(name);
                }
                Ok(Event::Empty(e)) => {
                    let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                    match name.as_str() {
                        "mxCell" => {
                            if let Some(cell) = cell_from_attrs(&attrs(&e)?) {
                                doc.cells.push(cell);
                            }
                        }
                        "mxGeometry" => apply_geometry(&mut current, &attrs(&e)?),
                        "diagram" => read_diagram_attrs(&mut doc, &attrs(&e)?),
                        "mxGraphModel" | "mxfile" => saw_model = true,
                        _ => {}
                    }
                }
                Ok(Event::End(e)) => {
                    stack.pop();
                    if e.local_name().as_ref() == b"mxCell" {
                        if let Some(cell) = current.take() {
                            doc.cells.push(cell);
                        }
                    }
                }
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(DocumentError::Xml(format!(
                        "at byte {}: {}",
                        reader.error_position(),
                        e
                    )))
                }
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err(DocumentError::Unclosed(stack));
        }
        if !saw_model && doc.cells.is_empty() {
            return Err(DocumentError::NotADiagram);
        }
        Ok(doc)
    }

    /// Parses, and on failure retries once on [`repair_xml`] output.
    /// Returns the document and whether repair was needed.
    pub fn parse_lenient(xml: &str) -> Result<(Self, bool), DocumentError> {
        match Self::parse(xml) {
            Ok(doc) => Ok((doc, false)),
            Err(original) => match repair_xml(xml) {
                Some(fixed) => Self::parse(&fixed)
                    .map(|doc| (doc, true))
                    .map_err(|_| original),
                None => Err(original),
            },
        }
    }
}

fn attrs(e: &BytesStart) -> Result<HashMap<String, String>, DocumentError> {
    let mut out = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| DocumentError::Xml(err.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|err| DocumentError::Xml(err.to_string()))?
            .into_owned();
        out.insert(key, value);
    }
    Ok(out)
}

fn cell_from_attrs(a: &HashMap<String, String>) -> Option<Cell> {
    let id = a.get("id")?.clone();
    let value = a.get("value").cloned().unwrap_or_default();
    let style = Style::parse(a.get("style").map(String::as_str).unwrap_or(""));

    let kind = if a.get("edge").map(String::as_str) == Some("1") {
        CellKind::Edge {
            source: a.get("source").cloned(),
            target: a.get("target").cloned(),
        }
    } else if a.get("vertex").map(String::as_str) == Some("1") {
        CellKind::Vertex { geometry: None }
    } else {
        return None;
    };

    Some(Cell {
        id,
        value,
        style,
        kind,
    })
}

/// Width and height are required; a missing `x`/`y` means 0.
fn apply_geometry(current: &mut Option<Cell>, a: &HashMap<String, String>) {
    let Some(Cell {
        kind: CellKind::Vertex { geometry },
        ..
    }) = current
    else {
        return;
    };
    let num = |key: &str| a.get(key).and_then(|v| v.trim().parse::<f64>().ok());
    let (Some(width), Some(height)) = (num("width"), num("height")) else {
        return;
    };
    if !(width.is_finite() && height.is_finite()) || width <= 0.0 || height <= 0.0 {
        return;
    }
    *geometry = Some(Geometry {
        x: num("x").filter(|v| v.is_finite()).unwrap_or(0.0),
        y: num("y").filter(|v| v.is_finite()).unwrap_or(0.0),
        width,
        height,
    });
}

fn read_diagram_attrs(doc: &mut DiagramDocument, a: &HashMap<String, String>) {
    if let Some(id) = a.get("id") {
        doc.id = id.clone();
    }
    if let Some(name) = a.get("name") {
        doc.name = name.clone();
    }
}

/// Best-effort repair of truncated or unbalanced XML: drops a trailing
/// partial tag and appends end tags for every element left open.
///
/// Returns `None` when there is nothing to repair.
pub fn repair_xml(xml: &str) -> Option<String> {
    let mut body = xml.trim_end().to_string();
    let mut changed = false;

    if let Some(lt) = body.rfind('<') {
        if body[lt..].find('>').is_none() {
            body.truncate(lt);
            changed = true;
        }
    }

    let mut stack: Vec<String> = Vec::new();
    let bytes = body.as_bytes();
    let mut i = 0;
    while let Some(off) = body[i..].find('<') {
        let start = i + off;
        let rest = &body[start..];
        if rest.starts_with("<!--") {
            match rest.find("-->") {
                Some(end) => i = start + end + 3,
                None => break,
            }
            continue;
        }
        let Some(end) = find_tag_end(bytes, start) else {
            break;
        };
        let tag = &body[start + 1..end];
        i = end + 1;

        if tag.starts_with('?') || tag.starts_with('!') {
            continue;
        }
        if let Some(name) = tag.strip_prefix('/') {
            let name = name.trim();
            if let Some(pos) = stack.iter().rposition(|n| n == name) {
                stack.truncate(pos);
            }
            continue;
        }
        if tag.ends_with('/') {
            continue;
        }
        let name: String = tag
            .chars()
            .take_while(|c| !c.is_whitespace() && *c != '/')
            .collect();
        if !name.is_empty() {
            stack.push(name);
        }
    }

    if !stack.is_empty() {
        for name in stack.iter().rev() {
            body.push_str(&format!("</{}>", name));
        }
        changed = true;
    }

    changed.then_some(body)
}

/// Index of the `>` closing the tag opened at `start`, ignoring any inside
/// quoted attribute values.
fn find_tag_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut quote: Option<u8> = None;
    for (idx, &b) in bytes.iter().enumerate().skip(start + 1) {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'\'' => quote = Some(b),
            None if b == b'>' => return Some(idx),
            None => {}
        }
    }
    None
}

/// Formats a coordinate with at most one decimal.
pub fn fmt_num(v: f64) -> String {
    let rounded = (v * 10.0).round() / 10.0;
    if rounded == 0.0 {
        return "0".to_string();
    }
    if rounded.fract() == 0.0 {
        format!("{:.0}", rounded)
    } else {
        format!("{:.1}", rounded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DiagramDocument {
        let mut doc = DiagramDocument::new("VPC & friends");
        doc.cells.push(Cell::vertex(
            "node-0",
            "Load <Balancer>",
            Style::parse("shape=cloud;fillColor=#dae8fc;"),
            Geometry {
                x: 10.0,
                y: 20.0,
                width: 160.0,
                height: 60.0,
            },
        ));
        doc.cells.push(Cell::vertex(
            "node-1",
            "EC2",
            Style::parse("rounded=1;"),
            Geometry {
                x: 300.0,
                y: 20.5,
                width: 120.0,
                height: 60.0,
            },
        ));
        doc.cells.push(Cell::edge(
            "edge-0",
            "http \"80\"",
            Style::parse("edgeStyle=orthogonalEdgeStyle;"),
            "node-0",
            "node-1",
        ));
        doc
    }

    #[test]
    fn test_written_document_reads_back() {
        let doc = sample();
        let xml = doc.to_xml().unwrap();
        assert!(xml.starts_with("<?xml"));
        assert!(xml.contains("Load &lt;Balancer&gt;"));
        let parsed = DiagramDocument::parse(&xml).unwrap();
        assert_eq!(parsed, doc);
    }

    #[test]
    fn test_style_parse_and_display() {
        let mut s = Style::parse("ellipse; whiteSpace=wrap;fillColor=#fff;;");
        assert_eq!(s.shape(), "ellipse");
        assert_eq!(s.get("fillColor"), Some("#fff"));
        s.set("fillColor", "#000");
        assert_eq!(s.to_string(), "ellipse;whiteSpace=wrap;fillColor=#000;");
        assert_eq!(Style::parse("").shape(), "rectangle");
        assert_eq!(Style::parse("shape=cylinder3;ellipse;").shape(), "cylinder3");
    }

    #[test]
    fn test_missing_geometry_is_kept_as_none() {
        let xml = r#"<mxfile><diagram name="d"><mxGraphModel><root>
            <mxCell id="0"/><mxCell id="1" parent="0"/>
            <mxCell id="a" value="A" vertex="1" parent="1"/>
            <mxCell id="b" value="B" vertex="1" parent="1"><mxGeometry x="5" as="geometry"/></mxCell>
            <mxCell id="c" value="C" vertex="1" parent="1"><mxGeometry width="10" height="10" as="geometry"/></mxCell>
            </root></mxGraphModel></diagram></mxfile>"#;
        let doc = DiagramDocument::parse(xml).unwrap();
        assert_eq!(doc.cells.len(), 3);
        assert!(doc.find("a").unwrap().geometry().is_none());
        assert!(doc.find("b").unwrap().geometry().is_none());
        let c = doc.find("c").unwrap().geometry().unwrap();
        assert_eq!((c.x, c.y), (0.0, 0.0));
    }

    #[test]
    fn test_truncated_document_is_reported_and_repaired() {
        let xml = sample().to_xml().unwrap();
        let cut = xml.find("<mxCell id=\"edge-0\"").unwrap();
        let truncated = &xml[..cut + 12];

        assert!(DiagramDocument::parse(truncated).is_err());
        let (doc, repaired) = DiagramDocument::parse_lenient(truncated).unwrap();
        assert!(repaired);
        assert_eq!(doc.vertices().count(), 2);
        assert_eq!(doc.edges().count(), 0);
    }

    #[test]
    fn test_unclosed_elements_error() {
        let err = DiagramDocument::parse("<mxfile><diagram><mxGraphModel>").unwrap_err();
        match err {
            DocumentError::Unclosed(tags) => {
                assert_eq!(tags, vec!["mxfile", "diagram", "mxGraphModel"]);
            }
            // some reader versions flag the missing end tags themselves
            DocumentError::Xml(_) => {}
            other => panic!("unexpected error: {:?}", other),
        }
        let (doc, repaired) =
            DiagramDocument::parse_lenient("<mxfile><diagram><mxGraphModel>").unwrap();
        assert!(repaired);
        assert!(doc.cells.is_empty());
    }

    #[test]
    fn test_not_a_diagram() {
        assert_eq!(
            DiagramDocument::parse("<html><body/></html>").unwrap_err(),
            DocumentError::NotADiagram
        );
    }

    #[test]
    fn test_repair_ignores_gt_inside_quotes() {
        let fixed = repair_xml(r#"<a><b title="x > y"><c/>"#).unwrap();
        assert_eq!(fixed, r#"<a><b title="x > y"><c/></b></a>"#);
        assert_eq!(repair_xml("<a><b/></a>"), None);
    }

    #[test]
    fn test_fmt_num() {
        assert_eq!(fmt_num(40.0), "40");
        assert_eq!(fmt_num(12.345), "12.3");
        assert_eq!(fmt_num(-0.04), "0");
    }
}
