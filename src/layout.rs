//! Layout synthesis: [`DiagramComponents`] → [`DiagramDocument`].
//!
//! Each call picks a topology (radial or layered), jitters positions, and
//! draws node shapes, colors and edge routing from small fixed palettes, so
//! repeated requests for the same topic do not produce identical pictures.
//! All of that randomness comes from one seeded RNG: the same components
//! and [`LayoutOptions`] always yield the same document. Callers that want
//! variety use [`LayoutOptions::random`] at the outermost call.
//!
//! Placement guarantees:
//! - the first component node is the center/primary node;
//! - main nodes never overlap each other;
//! - category clusters sit entirely to the left or right of the main nodes;
//! - every emitted edge references an emitted node.

use anyhow::Result;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::f64::consts::TAU;

use crate::document::{Cell, CellKind, DiagramDocument, Geometry, Style};
use crate::models::{Connection, DiagramComponents};

const NODE_HEIGHT: f64 = 60.0;
const NETWORK_NODE_HEIGHT: f64 = 70.0;
const MIN_NODE_WIDTH: f64 = 120.0;
const MAX_NODE_WIDTH: f64 = 200.0;
/// Minimum center-to-center distance between main nodes. Larger than the
/// diagonal of the biggest node, so circles of this radius cannot hold two
/// overlapping nodes.
const MIN_CENTER_DIST: f64 = 260.0;
const CATEGORY_MARGIN: f64 = 120.0;
const CATEGORY_ITEM_WIDTH: f64 = 130.0;
const CATEGORY_ITEM_HEIGHT: f64 = 36.0;
const CATEGORY_HEADER: f64 = 30.0;
const CATEGORY_PAD: f64 = 12.0;
const CANVAS_MARGIN: f64 = 40.0;

/// (fill, stroke) pairs.
const COLORS: &[(&str, &str)] = &[
    ("#dae8fc", "#6c8ebf"),
    ("#d5e8d4", "#82b366"),
    ("#ffe6cc", "#d79b00"),
    ("#fff2cc", "#d6b656"),
    ("#f8cecc", "#b85450"),
    ("#e1d5e7", "#9673a6"),
];

const NODE_SHAPES: &[&str] = &[
    "rounded=1;whiteSpace=wrap;html=1;",
    "rounded=0;whiteSpace=wrap;html=1;",
    "ellipse;whiteSpace=wrap;html=1;",
    "shape=hexagon;perimeter=hexagonPerimeter2;whiteSpace=wrap;html=1;",
    "shape=process;whiteSpace=wrap;html=1;",
    "shape=cylinder3;boundedLbl=1;size=10;whiteSpace=wrap;html=1;",
];

const EDGE_STYLES: &[&str] = &[
    "edgeStyle=orthogonalEdgeStyle;rounded=0;",
    "edgeStyle=orthogonalEdgeStyle;rounded=1;",
    "curved=1;",
    "",
    "dashed=1;",
];

const EDGE_COLORS: &[&str] = &["#555555", "#6c8ebf", "#82b366", "#9673a6", "#b85450"];

/// Shape names the network palette can produce.
pub const NETWORK_SHAPES: &[&str] = &[
    "cylinder3",
    "cloud",
    "mxgraph.network.firewall",
    "mxgraph.network.router",
    "mxgraph.network.server",
    "hexagon",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutKind {
    /// Nodes on a jittered circle around the center node.
    Radial,
    /// Center node in a middle band, the rest split above and below.
    Layered,
}

impl LayoutKind {
    pub fn name(&self) -> &'static str {
        match self {
            LayoutKind::Radial => "radial",
            LayoutKind::Layered => "layered",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "radial" => Some(LayoutKind::Radial),
            "layered" => Some(LayoutKind::Layered),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone)]
pub struct LayoutOptions {
    pub seed: u64,
    /// Use network-oriented node shapes.
    pub network: bool,
    /// Force a topology instead of drawing one.
    pub kind: Option<LayoutKind>,
}

impl LayoutOptions {
    pub fn seeded(seed: u64, network: bool) -> Self {
        Self {
            seed,
            network,
            kind: None,
        }
    }

    pub fn random(network: bool) -> Self {
        Self::seeded(rand::random(), network)
    }
}

#[derive(Debug, Clone)]
pub struct Synthesis {
    pub document: DiagramDocument,
    pub seed: u64,
    pub kind: LayoutKind,
    pub category_side: Side,
    /// Connections whose endpoints did not resolve to a node.
    pub dropped_connections: Vec<Connection>,
}

/// Lays out `components` with a fresh random seed and serializes the result.
pub fn synthesize_diagram(components: &DiagramComponents, network: bool) -> Result<String> {
    synthesize(components, &LayoutOptions::random(network))
        .document
        .to_xml()
}

pub fn synthesize(components: &DiagramComponents, options: &LayoutOptions) -> Synthesis {
    let mut rng = StdRng::seed_from_u64(options.seed);
    let kind = options.kind.unwrap_or_else(|| {
        if rng.gen_bool(0.5) {
            LayoutKind::Radial
        } else {
            LayoutKind::Layered
        }
    });

    let labels = dedup_labels(&components.nodes);
    let height = if options.network {
        NETWORK_NODE_HEIGHT
    } else {
        NODE_HEIGHT
    };
    let widths: Vec<f64> = labels.iter().map(|l| node_width(l)).collect();

    let centers = match kind {
        LayoutKind::Radial => radial_centers(labels.len(), &mut rng),
        LayoutKind::Layered => layered_centers(labels.len(), &widths, &mut rng),
    };

    let mut doc = DiagramDocument::new(&components.title);
    doc.id = format!("{:012x}", options.seed & 0xffff_ffff_ffff);
    let mut name_to_id: HashMap<String, String> = HashMap::new();

    for (i, label) in labels.iter().enumerate() {
        let id = format!("node-{}", i);
        let (cx, cy) = centers[i];
        let geometry = Geometry {
            x: cx - widths[i] / 2.0,
            y: cy - height / 2.0,
            width: widths[i],
            height,
        };
        let mut style = if options.network {
            Style::parse(network_shape(label, &mut rng))
        } else {
            Style::parse(NODE_SHAPES.choose(&mut rng).copied().unwrap_or(NODE_SHAPES[0]))
        };
        let (fill, stroke) = *COLORS.choose(&mut rng).unwrap_or(&COLORS[0]);
        style.set("fillColor", fill);
        style.set("strokeColor", stroke);
        style.set("fontColor", "#1a1a1a");
        if i == 0 {
            style.set("fontStyle", "1");
            style.set("strokeWidth", "2");
        }
        name_to_id.entry(normalize_name(label)).or_insert(id.clone());
        doc.cells.push(Cell::vertex(&id, label, style, geometry));
    }

    let mut dropped = Vec::new();
    let mut edge_count = 0;
    for conn in &components.connections {
        let source = name_to_id.get(&normalize_name(&conn.from));
        let target = name_to_id.get(&normalize_name(&conn.to));
        match (source, target) {
            (Some(s), Some(t)) if s != t => {
                let mut style = Style::parse(EDGE_STYLES.choose(&mut rng).copied().unwrap_or(""));
                style.set("endArrow", "classic");
                style.set("html", "1");
                style.set(
                    "strokeColor",
                    EDGE_COLORS.choose(&mut rng).copied().unwrap_or("#555555"),
                );
                let id = format!("edge-{}", edge_count);
                edge_count += 1;
                let label = conn.label.as_deref().unwrap_or("");
                doc.cells.push(Cell::edge(&id, label, style, s, t));
            }
            _ => dropped.push(conn.clone()),
        }
    }
    if !dropped.is_empty() {
        eprintln!(
            "Warning: dropped {} connection(s) with unknown endpoints: {}",
            dropped.len(),
            dropped
                .iter()
                .map(|c| format!("{} -> {}", c.from, c.to))
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    let side = if rng.gen_bool(0.5) {
        Side::Left
    } else {
        Side::Right
    };
    place_categories(&mut doc, components, side, &mut rng);
    place_title(&mut doc, &components.title);
    shift_to_margin(&mut doc);

    Synthesis {
        document: doc,
        seed: options.seed,
        kind,
        category_side: side,
        dropped_connections: dropped,
    }
}

/// Trimmed, whitespace-collapsed, lowercased name used to match connection
/// endpoints against node labels.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn dedup_labels(nodes: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    nodes
        .iter()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty() && seen.insert(normalize_name(n)))
        .collect()
}

fn node_width(label: &str) -> f64 {
    (label.chars().count() as f64 * 7.0 + 40.0).clamp(MIN_NODE_WIDTH, MAX_NODE_WIDTH)
}

/// Center node at the origin, the rest shuffled onto a jittered circle.
///
/// Angular jitter stays within ±20% of the slot and radius jitter within
/// ±10%, and the base radius is chosen so that `1.8·r·sin(0.3·step)` is at
/// least [`MIN_CENTER_DIST`]; any two nodes end up at least that far apart.
fn radial_centers(n: usize, rng: &mut StdRng) -> Vec<(f64, f64)> {
    let mut centers = vec![(0.0, 0.0); n];
    if n <= 1 {
        return centers;
    }
    let mut order: Vec<usize> = (1..n).collect();
    order.shuffle(rng);

    let k = order.len() as f64;
    let step = TAU / k;
    let base = (MIN_CENTER_DIST / (1.8 * (0.3 * step.min(std::f64::consts::PI)).sin()))
        .max(MIN_CENTER_DIST * 1.2);
    let start = rng.gen_range(0.0..TAU);

    for (slot, &node) in order.iter().enumerate() {
        let angle = start + slot as f64 * step + rng.gen_range(-0.2..0.2) * step;
        let radius = base * rng.gen_range(0.9..1.1);
        centers[node] = (radius * angle.cos(), radius * angle.sin());
    }
    centers
}

/// Center node alone in the middle band; the shuffled rest split across a
/// top and a bottom band.
fn layered_centers(n: usize, widths: &[f64], rng: &mut StdRng) -> Vec<(f64, f64)> {
    let mut centers = vec![(0.0, 0.0); n];
    if n <= 1 {
        return centers;
    }
    let mut order: Vec<usize> = (1..n).collect();
    order.shuffle(rng);

    let max_w = widths.iter().cloned().fold(MIN_NODE_WIDTH, f64::max);
    let band_gap = rng.gen_range(170.0..230.0);
    let col_spacing = max_w + rng.gen_range(60.0..100.0);
    let split = order.len().div_ceil(2);
    let (top, bottom) = order.split_at(split);

    for (band, y) in [(top, -band_gap), (bottom, band_gap)] {
        let m = band.len() as f64;
        for (i, &node) in band.iter().enumerate() {
            let x = (i as f64 - (m - 1.0) / 2.0) * col_spacing + rng.gen_range(-10.0..10.0);
            let jitter_y = rng.gen_range(-15.0..15.0);
            centers[node] = (x, y + jitter_y);
        }
    }
    centers
}

fn network_shape(label: &str, rng: &mut StdRng) -> &'static str {
    let lower = label.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let any = |vocab: &[&str]| words.iter().any(|w| vocab.contains(w));

    if any(&["rds", "database", "db", "sql", "aurora", "dynamodb", "storage", "s3"]) {
        "shape=cylinder3;boundedLbl=1;size=12;whiteSpace=wrap;html=1;"
    } else if any(&["internet", "cloud", "vpc", "region", "cdn", "wan"]) {
        "shape=cloud;whiteSpace=wrap;html=1;"
    } else if any(&["firewall", "waf", "security", "acl"]) {
        "shape=mxgraph.network.firewall;whiteSpace=wrap;html=1;"
    } else if any(&["router", "gateway", "elb", "alb", "nlb", "nat", "vpn", "switch"])
        || lower.contains("load balancer")
    {
        "shape=mxgraph.network.router;whiteSpace=wrap;html=1;"
    } else if rng.gen_bool(0.5) {
        "shape=mxgraph.network.server;whiteSpace=wrap;html=1;"
    } else {
        "shape=hexagon;perimeter=hexagonPerimeter2;whiteSpace=wrap;html=1;"
    }
}

fn bounds<'a>(cells: impl Iterator<Item = &'a Cell>) -> Option<(f64, f64, f64, f64)> {
    cells.filter_map(Cell::geometry).fold(None, |acc, g| {
        let (x0, y0, x1, y1) = acc.unwrap_or((g.x, g.y, g.x + g.width, g.y + g.height));
        Some((
            x0.min(g.x),
            y0.min(g.y),
            x1.max(g.x + g.width),
            y1.max(g.y + g.height),
        ))
    })
}

/// Category annotations as swimlane clusters beside the main diagram,
/// items wrapped into rows of two or three.
fn place_categories(
    doc: &mut DiagramDocument,
    components: &DiagramComponents,
    side: Side,
    rng: &mut StdRng,
) {
    let Some((min_x, min_y, max_x, _)) = bounds(doc.cells.iter()) else {
        return;
    };
    let per_row: usize = rng.gen_range(2..=3);
    let cluster_w = per_row as f64 * (CATEGORY_ITEM_WIDTH + CATEGORY_PAD) + CATEGORY_PAD;
    let x = match side {
        Side::Right => max_x + CATEGORY_MARGIN,
        Side::Left => min_x - CATEGORY_MARGIN - cluster_w,
    };
    let mut y = min_y;

    for (ci, (name, items)) in components.categories.iter().enumerate() {
        let rows = items.len().div_ceil(per_row).max(1);
        let cluster_h = CATEGORY_HEADER
            + rows as f64 * (CATEGORY_ITEM_HEIGHT + CATEGORY_PAD)
            + CATEGORY_PAD;
        let (fill, stroke) = *COLORS.choose(rng).unwrap_or(&COLORS[0]);

        let mut style = Style::parse("swimlane;html=1;startSize=30;");
        style.set("fillColor", fill);
        style.set("strokeColor", stroke);
        doc.cells.push(Cell::vertex(
            &format!("cat-{}", ci),
            name,
            style,
            Geometry {
                x,
                y,
                width: cluster_w,
                height: cluster_h,
            },
        ));

        for (ii, item) in items.iter().enumerate() {
            let row = ii / per_row;
            let col = ii % per_row;
            let mut style = Style::parse("rounded=1;whiteSpace=wrap;html=1;fontSize=11;");
            style.set("fillColor", "#ffffff");
            style.set("strokeColor", stroke);
            doc.cells.push(Cell::vertex(
                &format!("cat-{}-item-{}", ci, ii),
                item,
                style,
                Geometry {
                    x: x + CATEGORY_PAD + col as f64 * (CATEGORY_ITEM_WIDTH + CATEGORY_PAD),
                    y: y + CATEGORY_HEADER + CATEGORY_PAD
                        + row as f64 * (CATEGORY_ITEM_HEIGHT + CATEGORY_PAD),
                    width: CATEGORY_ITEM_WIDTH,
                    height: CATEGORY_ITEM_HEIGHT,
                },
            ));
        }

        y += cluster_h + 30.0;
    }
}

fn place_title(doc: &mut DiagramDocument, title: &str) {
    let Some((min_x, min_y, max_x, _)) = bounds(doc.cells.iter()) else {
        return;
    };
    doc.cells.push(Cell::vertex(
        "title",
        title,
        Style::parse("text;html=1;align=center;verticalAlign=middle;fontSize=20;fontStyle=1;"),
        Geometry {
            x: min_x,
            y: min_y - 80.0,
            width: (max_x - min_x).max(200.0),
            height: 40.0,
        },
    ));
}

/// Translates every vertex so the drawing starts at the canvas margin.
fn shift_to_margin(doc: &mut DiagramDocument) {
    let Some((min_x, min_y, _, _)) = bounds(doc.cells.iter()) else {
        return;
    };
    let (dx, dy) = (CANVAS_MARGIN - min_x, CANVAS_MARGIN - min_y);
    for cell in &mut doc.cells {
        if let CellKind::Vertex { geometry: Some(g) } = &mut cell.kind {
            g.x = (g.x + dx).round();
            g.y = (g.y + dy).round();
        }
    }
}
