//! Graph validation: lint rules and diagnostics.
//!
//! Every [`GraphDefinition`] is checked once before compilation. Call
//! [`validate`] for advisory diagnostics or [`validate_or_raise`] to fail on
//! the first `Error`-severity issue.

use std::collections::{HashMap, HashSet, VecDeque};

use prepflow_types::PrepflowError;

use crate::graph::GraphDefinition;

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub node: Option<String>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, graph: &GraphDefinition) -> Vec<Diagnostic>;
}

fn error(rule: &str, node: Option<&str>, message: String, fix: Option<String>) -> Diagnostic {
    Diagnostic {
        rule: rule.into(),
        severity: Severity::Error,
        message,
        node: node.map(String::from),
        fix,
    }
}

fn node_names(graph: &GraphDefinition) -> HashSet<&str> {
    graph.nodes.iter().map(|n| n.name.as_str()).collect()
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct DuplicateNodeRule;
impl LintRule for DuplicateNodeRule {
    fn name(&self) -> &str { "duplicate_node" }
    fn apply(&self, graph: &GraphDefinition) -> Vec<Diagnostic> {
        let mut seen = HashSet::new();
        graph
            .nodes
            .iter()
            .filter(|n| !seen.insert(n.name.as_str()))
            .map(|n| {
                error(
                    self.name(),
                    Some(&n.name),
                    format!("Node '{}' is registered more than once", n.name),
                    Some("Give each node a unique name".into()),
                )
            })
            .collect()
    }
}

struct EntryPointRule;
impl LintRule for EntryPointRule {
    fn name(&self) -> &str { "entry_point" }
    fn apply(&self, graph: &GraphDefinition) -> Vec<Diagnostic> {
        let Some(entry) = &graph.entry else {
            return vec![error(
                self.name(),
                None,
                "No entry point declared".into(),
                Some("Call entry_point() or fixed_entry() on the builder".into()),
            )];
        };
        let names = node_names(graph);
        let targets = entry.targets();
        if targets.is_empty() {
            return vec![error(
                self.name(),
                None,
                "Entry resolver declares no candidates".into(),
                None,
            )];
        }
        targets
            .into_iter()
            .filter(|t| !names.contains(t))
            .map(|t| {
                error(
                    self.name(),
                    Some(t),
                    format!("Entry candidate '{t}' is not a registered node"),
                    Some(format!("Register '{t}' or remove it from the entry candidates")),
                )
            })
            .collect()
    }
}

struct EdgeTargetExistsRule;
impl LintRule for EdgeTargetExistsRule {
    fn name(&self) -> &str { "edge_target_exists" }
    fn apply(&self, graph: &GraphDefinition) -> Vec<Diagnostic> {
        let names = node_names(graph);
        let mut diags = Vec::new();
        for edge in &graph.edges {
            if !names.contains(edge.from.as_str()) {
                diags.push(error(
                    self.name(),
                    Some(&edge.from),
                    format!("Edge source '{}' is not a registered node", edge.from),
                    None,
                ));
            }
            let targets = edge.route.targets();
            if targets.is_empty() {
                diags.push(error(
                    self.name(),
                    Some(&edge.from),
                    format!("Conditional edge from '{}' declares no candidates", edge.from),
                    None,
                ));
            }
            for t in targets.into_iter().filter(|t| !names.contains(t)) {
                diags.push(error(
                    self.name(),
                    Some(&edge.from),
                    format!("Edge {} -> {t} references non-existent target '{t}'", edge.from),
                    Some(format!("Register node '{t}' or fix the edge candidates")),
                ));
            }
        }
        diags
    }
}

struct SingleOutgoingRule;
impl LintRule for SingleOutgoingRule {
    fn name(&self) -> &str { "single_outgoing" }
    fn apply(&self, graph: &GraphDefinition) -> Vec<Diagnostic> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for edge in &graph.edges {
            *counts.entry(edge.from.as_str()).or_default() += 1;
        }
        let mut dupes: Vec<_> = counts.into_iter().filter(|(_, c)| *c > 1).collect();
        dupes.sort();
        dupes
            .into_iter()
            .map(|(from, count)| {
                error(
                    self.name(),
                    Some(from),
                    format!("Node '{from}' has {count} outgoing routes; expected at most one"),
                    Some("Merge the edges into one conditional edge".into()),
                )
            })
            .collect()
    }
}

struct ReachabilityRule;
impl LintRule for ReachabilityRule {
    fn name(&self) -> &str { "reachability" }
    fn apply(&self, graph: &GraphDefinition) -> Vec<Diagnostic> {
        let Some(entry) = &graph.entry else {
            return vec![]; // EntryPointRule will catch this
        };

        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in &graph.edges {
            adjacency
                .entry(edge.from.as_str())
                .or_default()
                .extend(edge.route.targets());
        }
        for cp in &graph.checkpoints {
            adjacency
                .entry(cp.after.as_str())
                .or_default()
                .extend(cp.rewind.targets());
        }

        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        for t in entry.targets() {
            if visited.insert(t) {
                queue.push_back(t);
            }
        }
        while let Some(current) = queue.pop_front() {
            for &next in adjacency.get(current).into_iter().flatten() {
                if visited.insert(next) {
                    queue.push_back(next);
                }
            }
        }

        let mut unreachable: Vec<_> = graph
            .nodes
            .iter()
            .map(|n| n.name.as_str())
            .filter(|n| !visited.contains(n))
            .collect();
        unreachable.sort();
        unreachable
            .into_iter()
            .map(|id| {
                error(
                    self.name(),
                    Some(id),
                    format!("Node '{id}' is not reachable from the entry point"),
                    Some(format!("Add an edge leading to '{id}' or remove it")),
                )
            })
            .collect()
    }
}

struct TerminalNodeRule;
impl LintRule for TerminalNodeRule {
    fn name(&self) -> &str { "terminal_node" }
    fn apply(&self, graph: &GraphDefinition) -> Vec<Diagnostic> {
        let sources: HashSet<&str> = graph.edges.iter().map(|e| e.from.as_str()).collect();
        if graph.nodes.iter().any(|n| !sources.contains(n.name.as_str())) {
            vec![]
        } else {
            vec![error(
                self.name(),
                None,
                "Graph has no terminal node (every node has an outgoing route)".into(),
                Some("Leave at least one node without outgoing edges".into()),
            )]
        }
    }
}

struct CheckpointBindingRule;
impl LintRule for CheckpointBindingRule {
    fn name(&self) -> &str { "checkpoint_binding" }
    fn apply(&self, graph: &GraphDefinition) -> Vec<Diagnostic> {
        let names = node_names(graph);
        let mut diags = Vec::new();
        let mut bound: HashSet<&str> = HashSet::new();
        let mut named: HashSet<&str> = HashSet::new();

        for cp in &graph.checkpoints {
            if !named.insert(cp.name.as_str()) {
                diags.push(error(
                    self.name(),
                    None,
                    format!("Checkpoint name '{}' is used more than once", cp.name),
                    None,
                ));
            }
            if !names.contains(cp.after.as_str()) {
                diags.push(error(
                    self.name(),
                    Some(&cp.after),
                    format!("Checkpoint '{}' is bound to unknown node '{}'", cp.name, cp.after),
                    None,
                ));
            }
            if !bound.insert(cp.after.as_str()) {
                diags.push(error(
                    self.name(),
                    Some(&cp.after),
                    format!("Node '{}' has more than one checkpoint", cp.after),
                    None,
                ));
            }
            let targets = cp.rewind.targets();
            if targets.is_empty() {
                diags.push(error(
                    self.name(),
                    None,
                    format!("Checkpoint '{}' declares no rewind target", cp.name),
                    None,
                ));
            }
            for t in targets.into_iter().filter(|t| !names.contains(t)) {
                diags.push(error(
                    self.name(),
                    Some(t),
                    format!("Checkpoint '{}' rewinds to unknown node '{t}'", cp.name),
                    None,
                ));
            }
            for s in cp.stage.iter().filter(|s| !names.contains(s.as_str())) {
                diags.push(Diagnostic {
                    rule: self.name().into(),
                    severity: Severity::Warning,
                    message: format!("Checkpoint '{}' stage lists unknown node '{s}'", cp.name),
                    node: Some(s.clone()),
                    fix: None,
                });
            }
        }
        diags
    }
}

struct SelfLoopRule;
impl LintRule for SelfLoopRule {
    fn name(&self) -> &str { "self_loop" }
    fn apply(&self, graph: &GraphDefinition) -> Vec<Diagnostic> {
        graph
            .edges
            .iter()
            .filter(|e| e.route.targets().contains(&e.from.as_str()))
            .map(|e| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Warning,
                message: format!("Node '{}' can route to itself", e.from),
                node: Some(e.from.clone()),
                fix: Some("Rely on max_retries for re-execution instead".into()),
            })
            .collect()
    }
}

/// Retry counts above this are almost certainly a configuration mistake.
const MAX_SENSIBLE_RETRIES: usize = 10;

struct RetryBoundRule;
impl LintRule for RetryBoundRule {
    fn name(&self) -> &str { "retry_bound" }
    fn apply(&self, graph: &GraphDefinition) -> Vec<Diagnostic> {
        graph
            .nodes
            .iter()
            .filter(|n| n.max_retries > MAX_SENSIBLE_RETRIES)
            .map(|n| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Warning,
                message: format!(
                    "Node '{}' retries up to {} times",
                    n.name, n.max_retries
                ),
                node: Some(n.name.clone()),
                fix: Some(format!("Keep max_retries at or below {MAX_SENSIBLE_RETRIES}")),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

fn builtin_rules() -> Vec<Box<dyn LintRule>> {
    vec![
        Box::new(DuplicateNodeRule),
        Box::new(EntryPointRule),
        Box::new(EdgeTargetExistsRule),
        Box::new(SingleOutgoingRule),
        Box::new(ReachabilityRule),
        Box::new(TerminalNodeRule),
        Box::new(CheckpointBindingRule),
        Box::new(SelfLoopRule),
        Box::new(RetryBoundRule),
    ]
}

/// Run all built-in lint rules and return every diagnostic.
pub fn validate(graph: &GraphDefinition) -> Vec<Diagnostic> {
    builtin_rules()
        .iter()
        .flat_map(|rule| rule.apply(graph))
        .collect()
}

/// Run validation and fail on the first `Error`-severity diagnostic.
pub fn validate_or_raise(graph: &GraphDefinition) -> prepflow_types::Result<Vec<Diagnostic>> {
    let diagnostics = validate(graph);
    if let Some(err) = diagnostics.iter().find(|d| d.severity == Severity::Error) {
        return Err(PrepflowError::Validation(format!(
            "[{}] {}",
            err.rule, err.message
        )));
    }
    Ok(diagnostics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{CheckpointSpec, GraphBuilder, Route};
    use crate::handler::PassThroughNode;

    fn builder(names: &[&str]) -> GraphBuilder {
        let mut b = GraphBuilder::new("test");
        for n in names {
            b.register_node(n, PassThroughNode).unwrap();
        }
        b
    }

    fn rules_hit(def: &GraphDefinition) -> Vec<String> {
        validate(def)
            .into_iter()
            .filter(|d| d.severity == Severity::Error)
            .map(|d| d.rule)
            .collect()
    }

    #[test]
    fn valid_graph_has_no_errors() {
        let mut b = builder(&["a", "b", "c"]);
        b.fixed_entry("a")
            .add_conditional_edge("a", &["b", "c"], |_| "b".into());
        b.add_edge("b", "c");
        assert!(rules_hit(b.definition()).is_empty());
    }

    #[test]
    fn missing_entry_is_reported() {
        let mut b = builder(&["a"]);
        b.add_edge("a", "a");
        assert!(rules_hit(b.definition()).contains(&"entry_point".to_string()));
    }

    #[test]
    fn unknown_candidate_is_reported() {
        let mut b = builder(&["a", "b"]);
        b.fixed_entry("a")
            .add_conditional_edge("a", &["b", "ghost"], |_| "b".into());
        let hits = rules_hit(b.definition());
        assert!(hits.contains(&"edge_target_exists".to_string()));
    }

    #[test]
    fn unreachable_node_is_reported() {
        let mut b = builder(&["a", "b", "island"]);
        b.fixed_entry("a").add_edge("a", "b");
        let diags = validate(b.definition());
        let unreachable: Vec<_> = diags
            .iter()
            .filter(|d| d.rule == "reachability")
            .filter_map(|d| d.node.clone())
            .collect();
        assert_eq!(unreachable, vec!["island".to_string()]);
    }

    #[test]
    fn rewind_targets_count_as_reachable() {
        let mut b = builder(&["a", "b", "retry_here"]);
        b.fixed_entry("a").add_edge("a", "b");
        b.add_edge("retry_here", "b");
        b.checkpoint(CheckpointSpec {
            name: "review".into(),
            after: "b".into(),
            rewind: Route::Next("retry_here".into()),
            stage: vec![],
        });
        assert!(rules_hit(b.definition()).is_empty());
    }

    #[test]
    fn two_routes_from_one_node_is_an_error() {
        let mut b = builder(&["a", "b", "c"]);
        b.fixed_entry("a").add_edge("a", "b").add_edge("a", "c");
        assert!(rules_hit(b.definition()).contains(&"single_outgoing".to_string()));
    }

    #[test]
    fn cycle_without_terminal_is_reported() {
        let mut b = builder(&["a", "b"]);
        b.fixed_entry("a").add_edge("a", "b").add_edge("b", "a");
        assert!(rules_hit(b.definition()).contains(&"terminal_node".to_string()));
    }

    #[test]
    fn checkpoint_on_unknown_node_is_reported() {
        let mut b = builder(&["a"]);
        b.fixed_entry("a").checkpoint(CheckpointSpec {
            name: "review".into(),
            after: "missing".into(),
            rewind: Route::Next("a".into()),
            stage: vec!["also_missing".into()],
        });
        let diags = validate(b.definition());
        assert!(diags
            .iter()
            .any(|d| d.rule == "checkpoint_binding" && d.severity == Severity::Error));
        assert!(diags
            .iter()
            .any(|d| d.rule == "checkpoint_binding" && d.severity == Severity::Warning));
    }

    #[test]
    fn self_loop_is_a_warning_only() {
        let mut b = builder(&["a", "b"]);
        b.fixed_entry("a")
            .add_conditional_edge("a", &["a", "b"], |_| "b".into());
        let diags = validate(b.definition());
        assert!(diags
            .iter()
            .any(|d| d.rule == "self_loop" && d.severity == Severity::Warning));
        assert!(validate_or_raise(b.definition()).is_ok());
    }

    #[test]
    fn excessive_retries_warn() {
        let mut b = GraphBuilder::new("test");
        b.register_retryable_node("a", PassThroughNode, 50).unwrap();
        b.fixed_entry("a");
        let diags = validate(b.definition());
        assert!(diags
            .iter()
            .any(|d| d.rule == "retry_bound" && d.severity == Severity::Warning));
        assert!(rules_hit(b.definition()).is_empty());
    }

    #[test]
    fn validate_or_raise_reports_rule_name() {
        let b = builder(&["a"]);
        let err = validate_or_raise(b.definition()).unwrap_err();
        assert!(err.to_string().contains("[entry_point]"));
    }
}
