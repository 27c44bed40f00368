//! Prompt classification for chat turns.
//!
//! Decides whether a user message asks for a diagram at all, and whether
//! that diagram is a network/infrastructure diagram (which switches the
//! layout stage to network-oriented node shapes). Matching is done on
//! whole words so that "plan" never matches "lan".

const ACTION_WORDS: &[&str] = &[
    "create", "generate", "draw", "make", "build", "design", "show", "sketch", "render",
    "produce", "visualize", "visualise", "illustrate", "map", "diagram", "plot", "give",
];

const VISUAL_NOUNS: &[&str] = &[
    "diagram", "diagrams", "chart", "flowchart", "image", "picture", "visual", "visualization",
    "visualisation", "topology", "schematic", "blueprint", "drawing", "graph", "illustration",
];

/// Imperatives that count as a diagram request on their own when they
/// open the message.
const LEADING_IMPERATIVES: &[&str] = &["draw", "diagram", "visualize", "visualise", "sketch"];

const NETWORK_WORDS: &[&str] = &[
    "network", "vpc", "subnet", "subnets", "topology", "firewall", "router", "routers", "switch",
    "lan", "wan", "dns", "vpn", "cidr", "ec2", "rds", "elb", "alb", "nat", "gateway", "dmz",
    "peering",
];

const NETWORK_PHRASES: &[&str] = &["load balancer", "security group", "transit gateway"];

fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

fn normalized(text: &str) -> String {
    words(text).join(" ")
}

fn contains_any(words: &[String], vocab: &[&str]) -> bool {
    words.iter().any(|w| vocab.contains(&w.as_str()))
}

/// Returns true when the message explicitly asks for a diagram or image.
///
/// A plain question ("What is RiverMeadow?") is never a diagram request,
/// even when it mentions a visual noun without an action.
pub fn is_image_generation_request(text: &str) -> bool {
    let words = words(text);
    let Some(first) = words.first() else {
        return false;
    };

    if LEADING_IMPERATIVES.contains(&first.as_str()) {
        return true;
    }

    let has_action = words
        .iter()
        .any(|w| ACTION_WORDS.contains(&w.as_str()) && !VISUAL_NOUNS.contains(&w.as_str()));
    has_action && contains_any(&words, VISUAL_NOUNS)
}

/// Returns true when the message asks for a network or infrastructure
/// diagram.
pub fn is_network_diagram_request(text: &str) -> bool {
    let words = words(text);
    let norm = normalized(text);

    let networky =
        contains_any(&words, NETWORK_WORDS) || NETWORK_PHRASES.iter().any(|p| norm.contains(p));
    if !networky {
        return false;
    }

    is_image_generation_request(text) || words.iter().any(|w| w == "topology" || w == "diagram")
}
