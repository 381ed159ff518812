//! Output formatting for CLI commands.
//!
//! Every formatter returns a string in the selected format; `main` decides
//! where it is written.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{ConfigHasher, StackConfig, ValidationResult};
use crate::graph::DependencyGraph;
use crate::planner::{ApplyResult, ChangeKind, ChangeOp, Plan};
use crate::state::{LockInfo, RecordStatus, StateRecord, StateSnapshot};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan op row for table display.
#[derive(Tabled)]
struct PlanOpRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Detail")]
    detail: String,
}

/// Graph node row for table display.
#[derive(Tabled)]
struct GraphRow {
    #[tabled(rename = "Rank")]
    rank: usize,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Depends on")]
    dependencies: String,
}

/// State record row for table display.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Physical ID")]
    physical_id: String,
    #[tabled(rename = "Rev")]
    revision: u64,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(&plan.summary()),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        if plan.is_empty() {
            return format!("{} No changes. Infrastructure matches the stack.\n", "✓".green());
        }

        let hasher = ConfigHasher::new();
        let mut output = String::new();
        let _ = writeln!(output, "\nPlan");
        let _ = writeln!(
            output,
            "   Graph: {}  State: {}\n",
            hasher.short_hash(&plan.graph_fingerprint),
            hasher.short_hash(&plan.state_fingerprint)
        );

        let rows: Vec<PlanOpRow> = plan
            .ops()
            .iter()
            .enumerate()
            .map(|(i, op)| PlanOpRow {
                index: i + 1,
                action: Self::format_action(op.kind()),
                resource: op.id().to_string(),
                detail: Self::truncate(&Self::op_detail(op), 60),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            for op in plan.ops().iter().filter(|op| !op.changes().is_empty()) {
                let _ = writeln!(output, "\n   {}", op.id().to_string().bold());
                for change in op.changes() {
                    let marker = if change.forces_replacement { " (forces replacement)".red().to_string() } else { String::new() };
                    let _ = writeln!(
                        output,
                        "     {}: {} -> {}{marker}",
                        change.property,
                        Self::render_value(change.before.as_ref()),
                        Self::render_value(change.after.as_ref()),
                    );
                }
            }
        }

        let summary = plan.summary();
        let _ = writeln!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to delete",
            summary.creates.to_string().green(),
            summary.updates.to_string().yellow(),
            summary.replaces.to_string().magenta(),
            summary.deletes.to_string().red()
        );

        output
    }

    /// Formats the outcome of an apply.
    #[must_use]
    pub fn format_apply(&self, result: &ApplyResult) -> String {
        match self.format {
            OutputFormat::Json => to_json(&result.summary()),
            OutputFormat::Text => {
                let mut output = String::new();
                for op in &result.completed {
                    let _ = writeln!(output, "   {} {op}", "✓".green());
                }
                if let Some(failed) = &result.failed {
                    let _ = writeln!(output, "   {} {}: {}", "✗".red(), failed.op, failed.cause);
                }
                for op in &result.pending {
                    let _ = writeln!(output, "   {} {op}", "·".dimmed());
                }

                let status = if result.is_success() {
                    format!("{} Apply complete", "✓".green())
                } else if result.cancelled {
                    format!("{} Apply cancelled", "⚠".yellow())
                } else {
                    format!("{} Apply failed", "✗".red())
                };
                let _ = writeln!(
                    output,
                    "\n{status}: {} completed, {} failed, {} pending",
                    result.completed.len(),
                    usize::from(result.failed.is_some()),
                    result.pending.len()
                );

                if result.failed.as_ref().is_some_and(|f| f.cause.is_retryable()) {
                    let _ = writeln!(output, "   The failure looks transient; running apply again may succeed.");
                }
                output
            }
        }
    }

    /// Formats the dependency graph in apply order.
    #[must_use]
    pub fn format_graph(&self, graph: &DependencyGraph) -> String {
        match self.format {
            OutputFormat::Json => {
                let nodes: Vec<GraphNodeJson> = graph
                    .iter()
                    .map(|node| GraphNodeJson {
                        identity: node.spec.id().to_string(),
                        rank: node.rank,
                        dependencies: node.dependencies.iter().map(ToString::to_string).collect(),
                    })
                    .collect();
                to_json(&nodes)
            }
            OutputFormat::Text => {
                if graph.is_empty() {
                    return String::from("   No resources declared.\n");
                }

                let rows: Vec<GraphRow> = graph
                    .iter()
                    .map(|node| GraphRow {
                        rank: node.rank,
                        resource: node.spec.id().to_string(),
                        dependencies: node
                            .dependencies
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join(", "),
                    })
                    .collect();

                let mut output = Table::new(rows).to_string();
                let _ = write!(
                    output,
                    "\n\n{} resources, {} edges\n",
                    graph.len(),
                    graph.edge_count()
                );
                output
            }
        }
    }

    /// Formats recorded state and the current lock.
    #[must_use]
    pub fn format_state(&self, backend: &str, snapshot: &StateSnapshot, lock: Option<&LockInfo>) -> String {
        match self.format {
            OutputFormat::Json => to_json(&StateJson {
                backend,
                fingerprint: ConfigHasher::new().hash_state(snapshot),
                lock,
                records: snapshot.values().collect(),
            }),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = writeln!(output, "\nState ({backend} backend)");
                let _ = writeln!(
                    output,
                    "   Fingerprint: {}",
                    ConfigHasher::new().short_hash(&ConfigHasher::new().hash_state(snapshot))
                );
                match lock {
                    Some(lock) => {
                        let _ = writeln!(
                            output,
                            "   Locked by {} since {} ({})",
                            lock.holder,
                            lock.acquired_at.format("%Y-%m-%d %H:%M:%S"),
                            lock.lock_id
                        );
                    }
                    None => {
                        let _ = writeln!(output, "   Unlocked");
                    }
                }
                output.push('\n');

                if snapshot.is_empty() {
                    output.push_str("   No resources recorded.\n");
                    return output;
                }

                let rows: Vec<RecordRow> = snapshot.values().map(Self::record_row).collect();
                output.push_str(&Table::new(rows).to_string());
                output.push('\n');

                let deposed: Vec<String> = snapshot
                    .values()
                    .flat_map(|r| r.deposed.iter().map(move |id| format!("{} ({id})", r.identity)))
                    .collect();
                if !deposed.is_empty() {
                    let _ = writeln!(output, "\n{} Deposed instances awaiting cleanup:", "⚠".yellow());
                    for entry in deposed {
                        let _ = writeln!(output, "   - {entry}");
                    }
                }
                output
            }
        }
    }

    /// Formats a validation outcome.
    #[must_use]
    pub fn format_validation(&self, config: &StackConfig, result: &ValidationResult, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "valid": result.is_valid(),
                "project": config.project.name,
                "environment": config.project.environment,
                "resources": config.resource_names(),
                "errors": result.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "warnings": result.warnings,
            })),
            OutputFormat::Text => {
                let mut output = format!("{} Stack is valid\n", "✓".green());
                if show_warnings && !result.warnings.is_empty() {
                    let _ = writeln!(output, "\n{} Warnings:", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }

                let _ = writeln!(output, "\nStack summary:");
                let _ = writeln!(output, "   Project: {}", config.project.name);
                let _ = writeln!(output, "   Environment: {}", config.project.environment);
                let _ = writeln!(output, "   Resources: {}", config.resources.len());
                let _ = writeln!(output, "   Kinds with capabilities: {}", config.kinds.len());
                output
            }
        }
    }

    /// Formats a newly acquired lock.
    #[must_use]
    pub fn format_lock(&self, lock: &LockInfo) -> String {
        match self.format {
            OutputFormat::Json => to_json(lock),
            OutputFormat::Text => format!(
                "{} State locked by {} until {}\n   Lock ID: {}\n",
                "✓".green(),
                lock.holder,
                lock.expires_at.format("%Y-%m-%d %H:%M:%S"),
                lock.lock_id
            ),
        }
    }

    /// Formats a success message.
    #[must_use]
    pub fn success(&self, message: &str) -> String {
        self.message("success", &format!("{} {message}", "✓".green()), message)
    }

    /// Formats an error message.
    #[must_use]
    pub fn error(&self, message: &str) -> String {
        self.message("error", &format!("{} {message}", "✗".red()), message)
    }

    /// Formats a warning message.
    #[must_use]
    pub fn warning(&self, message: &str) -> String {
        self.message("warning", &format!("{} {message}", "⚠".yellow()), message)
    }

    fn message(&self, status: &str, text: &str, message: &str) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({ "status": status, "message": message })),
            OutputFormat::Text => text.to_string(),
        }
    }

    fn record_row(record: &StateRecord) -> RecordRow {
        RecordRow {
            resource: record.identity.to_string(),
            status: Self::format_status(record.status),
            physical_id: record.physical_id.as_deref().map_or_else(|| String::from("-"), |id| Self::truncate(id, 24)),
            revision: record.revision,
            updated: record.updated_at.format("%Y-%m-%d %H:%M").to_string(),
        }
    }

    fn op_detail(op: &ChangeOp) -> String {
        match op {
            ChangeOp::Replace { reason, strategy, .. } => format!("{reason}, {strategy}"),
            ChangeOp::Update { changes, .. } => changes
                .iter()
                .map(|c| c.property.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            ChangeOp::Delete { previous, .. } => previous
                .physical_id
                .clone()
                .unwrap_or_else(|| String::from("no physical resource")),
            ChangeOp::DeleteDeposed { physical_id, .. } => format!("deposed {physical_id}"),
            ChangeOp::Create { .. } => String::new(),
        }
    }

    /// Formats a change kind with color.
    fn format_action(kind: ChangeKind) -> String {
        match kind {
            ChangeKind::Create => "+create".green().to_string(),
            ChangeKind::Update => "~update".yellow().to_string(),
            ChangeKind::Replace => "-/+replace".magenta().to_string(),
            ChangeKind::Delete => "-delete".red().to_string(),
            ChangeKind::DeleteDeposed => "-deposed".red().to_string(),
        }
    }

    /// Formats a record status with color.
    fn format_status(status: RecordStatus) -> String {
        match status {
            RecordStatus::Active => "active".green().to_string(),
            RecordStatus::Tainted => "tainted".yellow().to_string(),
            RecordStatus::Deleted => "deleted".dimmed().to_string(),
        }
    }

    fn render_value(value: Option<&serde_json::Value>) -> String {
        value.map_or_else(|| String::from("(none)"), ToString::to_string)
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

// JSON serialization helpers

#[derive(Serialize)]
struct GraphNodeJson {
    identity: String,
    rank: usize,
    dependencies: Vec<String>,
}

#[derive(Serialize)]
struct StateJson<'a> {
    backend: &'a str,
    fingerprint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    lock: Option<&'a LockInfo>,
    records: Vec<&'a StateRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::model::{CapabilityTable, ResourceId, SpecSet};
    use crate::planner::DiffEngine;
    use serde_json::{Value, json};
    use std::collections::BTreeMap;

    fn plan() -> Plan {
        let mut specs = SpecSet::new();
        specs
            .define_resource(
                "network",
                "vpc",
                &BTreeMap::from([(String::from("cidr"), json!("10.0.0.0/16"))]),
                [],
            )
            .expect("vpc");
        specs
            .define_resource(
                "database",
                "main",
                &BTreeMap::from([(String::from("subnet"), json!("${network.vpc.id}"))]),
                [],
            )
            .expect("db");
        let graph = GraphBuilder::build(&specs).expect("graph");
        DiffEngine::new().diff(graph, &StateSnapshot::new(), &CapabilityTable::new())
    }

    #[test]
    fn test_plan_json() {
        let formatter = OutputFormatter::new(OutputFormat::Json);
        let parsed: Value = serde_json::from_str(&formatter.format_plan(&plan(), false)).expect("json");
        assert_eq!(parsed["creates"], json!(2));
        assert_eq!(parsed["ops"][0]["identity"], json!("network.vpc"));
        assert_eq!(parsed["ops"][1]["action"], json!("create"));
    }

    #[test]
    fn test_plan_text() {
        let formatter = OutputFormatter::new(OutputFormat::Text);
        let text = formatter.format_plan(&plan(), true);
        assert!(text.contains("network.vpc"));
        assert!(text.contains("database.main"));
        assert!(text.contains("to create"));
    }

    #[test]
    fn test_state_json_lists_records() {
        let id = ResourceId::parse("network.vpc").expect("id");
        let mut record = StateRecord::new(id.clone(), BTreeMap::new());
        record.physical_id = Some(String::from("vpc-123"));
        let snapshot = StateSnapshot::from([(id, record)]);

        let formatter = OutputFormatter::new(OutputFormat::Json);
        let parsed: Value = serde_json::from_str(&formatter.format_state("memory", &snapshot, None)).expect("json");
        assert_eq!(parsed["backend"], json!("memory"));
        assert_eq!(parsed["records"][0]["physical_id"], json!("vpc-123"));
        assert!(parsed.get("lock").is_none());
    }

    #[test]
    fn test_graph_json_in_rank_order() {
        let formatter = OutputFormatter::new(OutputFormat::Json);
        let parsed: Value = serde_json::from_str(&formatter.format_graph(plan().graph())).expect("json");
        assert_eq!(parsed[0]["identity"], json!("network.vpc"));
        assert_eq!(parsed[1]["dependencies"], json!(["network.vpc"]));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("a-very-long-identifier", 10), "a-very-...");
    }
}
