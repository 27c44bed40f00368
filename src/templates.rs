//! Hand-authored fallback diagrams.
//!
//! Used whenever the LLM cannot produce usable components. Selection first
//! matches prompt keywords; prompts that match nothing rotate through all
//! templates by timestamp so repeated failures do not keep returning the
//! same picture.

use std::collections::BTreeMap;

use crate::models::{Connection, DiagramComponents};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    OsMigration,
    AwsMigration,
    ProcessWorkflow,
    Generic,
}

impl TemplateKind {
    pub const ALL: [TemplateKind; 4] = [
        TemplateKind::OsMigration,
        TemplateKind::AwsMigration,
        TemplateKind::ProcessWorkflow,
        TemplateKind::Generic,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            TemplateKind::OsMigration => "os-migration",
            TemplateKind::AwsMigration => "aws-migration",
            TemplateKind::ProcessWorkflow => "process-workflow",
            TemplateKind::Generic => "generic",
        }
    }
}

const OS_KEYWORDS: &[&str] = &[
    "windows", "linux", "rhel", "centos", "ubuntu", "os", "operating", "upgrade", "kernel",
];
const AWS_KEYWORDS: &[&str] = &[
    "aws", "amazon", "ec2", "vpc", "rds", "s3", "cloud", "lambda", "eks",
];
const PROCESS_KEYWORDS: &[&str] = &[
    "workflow", "process", "pipeline", "steps", "stages", "lifecycle", "flow",
];

/// Picks a template by keyword, or by `now_millis` rotation when nothing
/// matches.
pub fn select_template(prompt: &str, now_millis: i64) -> TemplateKind {
    let words: Vec<String> = prompt
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect();
    let hits = |vocab: &[&str]| words.iter().filter(|w| vocab.contains(&w.as_str())).count();

    let scored = [
        (TemplateKind::OsMigration, hits(OS_KEYWORDS)),
        (TemplateKind::AwsMigration, hits(AWS_KEYWORDS)),
        (TemplateKind::ProcessWorkflow, hits(PROCESS_KEYWORDS)),
    ];
    // max_by_key keeps the last maximum; iterate reversed so ties go to the earlier template
    let best = scored.iter().rev().max_by_key(|(_, n)| *n);
    match best {
        Some((kind, n)) if *n > 0 => *kind,
        _ => {
            let idx = (now_millis / 1000).rem_euclid(TemplateKind::ALL.len() as i64) as usize;
            TemplateKind::ALL[idx]
        }
    }
}

/// Builds the components for a template. The generic template folds the
/// prompt into its title.
pub fn template_components(kind: TemplateKind, prompt: &str) -> DiagramComponents {
    match kind {
        TemplateKind::OsMigration => os_migration(),
        TemplateKind::AwsMigration => aws_migration(),
        TemplateKind::ProcessWorkflow => process_workflow(),
        TemplateKind::Generic => generic(prompt),
    }
}

/// Never fails; always returns complete components.
pub fn fallback_components(prompt: &str, now_millis: i64) -> DiagramComponents {
    template_components(select_template(prompt, now_millis), prompt)
}

fn categories(entries: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
    entries
        .iter()
        .map(|(k, items)| (k.to_string(), items.iter().map(|s| s.to_string()).collect()))
        .collect()
}

fn os_migration() -> DiagramComponents {
    DiagramComponents {
        title: "Operating System Migration".to_string(),
        nodes: vec![
            "Migration Orchestrator".to_string(),
            "Source Server (Legacy OS)".to_string(),
            "Discovery Agent".to_string(),
            "Snapshot Store".to_string(),
            "Target Server (Modern OS)".to_string(),
            "Validation Suite".to_string(),
        ],
        connections: vec![
            Connection::new("Discovery Agent", "Source Server (Legacy OS)", Some("inventory")),
            Connection::new("Migration Orchestrator", "Discovery Agent", Some("schedule")),
            Connection::new("Source Server (Legacy OS)", "Snapshot Store", Some("capture")),
            Connection::new("Snapshot Store", "Target Server (Modern OS)", Some("restore")),
            Connection::new("Migration Orchestrator", "Target Server (Modern OS)", Some("upgrade")),
            Connection::new("Target Server (Modern OS)", "Validation Suite", Some("verify")),
        ],
        categories: categories(&[
            ("Phases", &["Discover", "Capture", "Upgrade", "Cutover"]),
            ("Risks", &["Driver compatibility", "Application dependencies", "Downtime window"]),
        ]),
    }
}

fn aws_migration() -> DiagramComponents {
    DiagramComponents {
        title: "AWS Cloud Migration".to_string(),
        nodes: vec![
            "Migration Hub".to_string(),
            "On-Premises Data Center".to_string(),
            "VPN Gateway".to_string(),
            "VPC".to_string(),
            "EC2 Instances".to_string(),
            "RDS Database".to_string(),
            "S3 Bucket".to_string(),
        ],
        connections: vec![
            Connection::new("On-Premises Data Center", "VPN Gateway", Some("replicate")),
            Connection::new("VPN Gateway", "VPC", None),
            Connection::new("VPC", "EC2 Instances", None),
            Connection::new("EC2 Instances", "RDS Database", Some("SQL")),
            Connection::new("EC2 Instances", "S3 Bucket", Some("objects")),
            Connection::new("Migration Hub", "On-Premises Data Center", Some("track")),
            Connection::new("Migration Hub", "EC2 Instances", Some("cutover")),
        ],
        categories: categories(&[
            ("Compute", &["EC2 Instances", "Auto Scaling"]),
            ("Data", &["RDS Database", "S3 Bucket"]),
            ("Networking", &["VPC", "VPN Gateway", "Subnets"]),
        ]),
    }
}

fn process_workflow() -> DiagramComponents {
    DiagramComponents {
        title: "Process Workflow".to_string(),
        nodes: vec![
            "Coordinator".to_string(),
            "Intake".to_string(),
            "Assessment".to_string(),
            "Planning".to_string(),
            "Execution".to_string(),
            "Review".to_string(),
        ],
        connections: vec![
            Connection::new("Intake", "Assessment", None),
            Connection::new("Assessment", "Planning", None),
            Connection::new("Planning", "Execution", None),
            Connection::new("Execution", "Review", None),
            Connection::new("Review", "Planning", Some("rework")),
            Connection::new("Coordinator", "Intake", Some("assign")),
        ],
        categories: categories(&[
            ("Roles", &["Owner", "Reviewer", "Operator"]),
            ("Artifacts", &["Runbook", "Sign-off", "Report"]),
        ]),
    }
}

fn generic(prompt: &str) -> DiagramComponents {
    let subject: String = prompt.split_whitespace().take(8).collect::<Vec<_>>().join(" ");
    let title = if subject.is_empty() {
        "Architecture Overview".to_string()
    } else {
        format!("Architecture Overview: {}", subject)
    };

    DiagramComponents {
        title,
        nodes: vec![
            "Core Service".to_string(),
            "Client".to_string(),
            "API Gateway".to_string(),
            "Worker".to_string(),
            "Database".to_string(),
            "Monitoring".to_string(),
        ],
        connections: vec![
            Connection::new("Client", "API Gateway", Some("HTTPS")),
            Connection::new("API Gateway", "Core Service", None),
            Connection::new("Core Service", "Worker", Some("jobs")),
            Connection::new("Core Service", "Database", None),
            Connection::new("Monitoring", "Core Service", Some("metrics")),
        ],
        categories: categories(&[
            ("Layers", &["Presentation", "Application", "Data"]),
            ("Concerns", &["Security", "Scalability", "Observability"]),
        ]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_template_is_complete_and_consistent() {
        for kind in TemplateKind::ALL {
            let c = template_components(kind, "anything");
            assert!(c.is_complete(), "{} incomplete", kind.name());
            for conn in &c.connections {
                assert!(
                    c.nodes.contains(&conn.from) && c.nodes.contains(&conn.to),
                    "{}: dangling connection {:?}",
                    kind.name(),
                    conn
                );
            }
        }
    }

    #[test]
    fn test_keyword_selection() {
        assert_eq!(
            select_template("Migrate Windows servers to Linux", 0),
            TemplateKind::OsMigration
        );
        assert_eq!(
            select_template("Move our app to AWS with EC2 and RDS", 0),
            TemplateKind::AwsMigration
        );
        assert_eq!(
            select_template("Show the approval workflow steps", 0),
            TemplateKind::ProcessWorkflow
        );
    }

    #[test]
    fn test_rotation_without_keywords() {
        let seen: Vec<TemplateKind> = (0..4)
            .map(|s| select_template("Tell me about RiverMeadow", s * 1000))
            .collect();
        assert_eq!(seen, TemplateKind::ALL.to_vec());
    }

    #[test]
    fn test_generic_title_uses_prompt() {
        let c = template_components(TemplateKind::Generic, "billing platform overview");
        assert_eq!(c.title, "Architecture Overview: billing platform overview");
        let c = template_components(TemplateKind::Generic, "   ");
        assert_eq!(c.title, "Architecture Overview");
    }
}
