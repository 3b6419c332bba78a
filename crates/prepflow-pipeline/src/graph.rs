//! Workflow graph: declarative definition, builder, and the compiled graph.
//!
//! A [`GraphDefinition`] is a plain value (node descriptors, routes,
//! checkpoints). [`GraphDefinition::compile`] validates it once and produces
//! an immutable [`WorkflowGraph`] the run loop executes.

use std::collections::HashMap;
use std::sync::Arc;

use prepflow_types::{PrepflowError, Result, RunState};

use crate::handler::{DynNode, StepNode};
use crate::validation::{validate_or_raise, Diagnostic};

/// Pure function picking the next node from the current run state.
pub type Router = Arc<dyn Fn(&RunState) -> String + Send + Sync>;

// ---------------------------------------------------------------------------
// Route
// ---------------------------------------------------------------------------

/// Where execution goes after a node (or where a run enters the graph).
#[derive(Clone)]
pub enum Route {
    /// Unconditional transition.
    Next(String),
    /// Router choosing among a declared candidate set.
    Conditional {
        candidates: Vec<String>,
        router: Router,
    },
}

impl Route {
    pub fn conditional<F>(candidates: &[&str], router: F) -> Self
    where
        F: Fn(&RunState) -> String + Send + Sync + 'static,
    {
        Route::Conditional {
            candidates: candidates.iter().map(|c| c.to_string()).collect(),
            router: Arc::new(router),
        }
    }

    /// Every node this route can lead to.
    pub fn targets(&self) -> Vec<&str> {
        match self {
            Route::Next(to) => vec![to.as_str()],
            Route::Conditional { candidates, .. } => {
                candidates.iter().map(String::as_str).collect()
            }
        }
    }

    /// Evaluate the route. `from` names the owner for error reporting.
    pub fn resolve(&self, from: &str, state: &RunState) -> Result<String> {
        match self {
            Route::Next(to) => Ok(to.clone()),
            Route::Conditional { candidates, router } => {
                let chosen = router(state);
                if candidates.iter().any(|c| *c == chosen) {
                    Ok(chosen)
                } else {
                    Err(PrepflowError::Routing {
                        from: from.to_string(),
                        returned: chosen,
                    })
                }
            }
        }
    }

    pub fn is_conditional(&self) -> bool {
        matches!(self, Route::Conditional { .. })
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Route::Next(to) => f.debug_tuple("Next").field(to).finish(),
            Route::Conditional { candidates, .. } => f
                .debug_struct("Conditional")
                .field("candidates", candidates)
                .finish_non_exhaustive(),
        }
    }
}

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NodeDescriptor {
    pub name: String,
    pub executor: DynNode,
    /// Extra attempts after a failed execution; 0 means not retryable.
    pub max_retries: usize,
}

#[derive(Debug, Clone)]
pub struct EdgeDescriptor {
    pub from: String,
    pub route: Route,
}

/// A named pause point bound to the node after which it parks the run.
#[derive(Debug, Clone)]
pub struct CheckpointSpec {
    pub name: String,
    pub after: String,
    pub rewind: Route,
    /// Nodes whose outputs are discarded when the checkpoint is rejected.
    pub stage: Vec<String>,
}

/// Declarative description of a workflow graph.
#[derive(Debug, Clone, Default)]
pub struct GraphDefinition {
    pub name: String,
    pub nodes: Vec<NodeDescriptor>,
    pub edges: Vec<EdgeDescriptor>,
    pub entry: Option<Route>,
    pub checkpoints: Vec<CheckpointSpec>,
}

impl GraphDefinition {
    /// Validate the definition and compile it into an immutable execution plan.
    pub fn compile(self) -> Result<WorkflowGraph> {
        let diagnostics = validate_or_raise(&self)?;

        let entry = self
            .entry
            .ok_or_else(|| PrepflowError::Validation("No entry point declared".into()))?;
        let order: Vec<String> = self.nodes.iter().map(|n| n.name.clone()).collect();
        let nodes = self
            .nodes
            .into_iter()
            .map(|n| (n.name.clone(), n))
            .collect();
        let routes = self.edges.into_iter().map(|e| (e.from, e.route)).collect();
        let checkpoints = self
            .checkpoints
            .into_iter()
            .map(|c| (c.after.clone(), c))
            .collect();

        Ok(WorkflowGraph {
            name: self.name,
            order,
            nodes,
            routes,
            entry,
            checkpoints,
            diagnostics,
        })
    }
}

// ---------------------------------------------------------------------------
// GraphBuilder
// ---------------------------------------------------------------------------

/// Imperative front-end that accumulates a [`GraphDefinition`].
#[derive(Default)]
pub struct GraphBuilder {
    def: GraphDefinition,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            def: GraphDefinition {
                name: name.into(),
                ..Default::default()
            },
        }
    }

    pub fn register_node(
        &mut self,
        name: &str,
        executor: impl StepNode + 'static,
    ) -> Result<&mut Self> {
        self.register_retryable_node(name, executor, 0)
    }

    pub fn register_retryable_node(
        &mut self,
        name: &str,
        executor: impl StepNode + 'static,
        max_retries: usize,
    ) -> Result<&mut Self> {
        if self.def.nodes.iter().any(|n| n.name == name) {
            return Err(PrepflowError::DuplicateNode(name.to_string()));
        }
        self.def.nodes.push(NodeDescriptor {
            name: name.to_string(),
            executor: DynNode::new(executor),
            max_retries,
        });
        Ok(self)
    }

    pub fn add_edge(&mut self, from: &str, to: &str) -> &mut Self {
        self.def.edges.push(EdgeDescriptor {
            from: from.to_string(),
            route: Route::Next(to.to_string()),
        });
        self
    }

    pub fn add_conditional_edge<F>(&mut self, from: &str, candidates: &[&str], router: F) -> &mut Self
    where
        F: Fn(&RunState) -> String + Send + Sync + 'static,
    {
        self.def.edges.push(EdgeDescriptor {
            from: from.to_string(),
            route: Route::conditional(candidates, router),
        });
        self
    }

    /// Declare the entry resolver, evaluated once when a fresh run starts.
    pub fn entry_point<F>(&mut self, candidates: &[&str], resolver: F) -> &mut Self
    where
        F: Fn(&RunState) -> String + Send + Sync + 'static,
    {
        self.def.entry = Some(Route::conditional(candidates, resolver));
        self
    }

    pub fn fixed_entry(&mut self, node: &str) -> &mut Self {
        self.def.entry = Some(Route::Next(node.to_string()));
        self
    }

    pub fn checkpoint(&mut self, spec: CheckpointSpec) -> &mut Self {
        self.def.checkpoints.push(spec);
        self
    }

    pub fn definition(&self) -> &GraphDefinition {
        &self.def
    }

    pub fn into_definition(self) -> GraphDefinition {
        self.def
    }

    pub fn build(self) -> Result<WorkflowGraph> {
        self.def.compile()
    }
}

// ---------------------------------------------------------------------------
// WorkflowGraph
// ---------------------------------------------------------------------------

/// Compiled, immutable workflow graph.
#[derive(Debug)]
pub struct WorkflowGraph {
    pub name: String,
    order: Vec<String>,
    nodes: HashMap<String, NodeDescriptor>,
    routes: HashMap<String, Route>,
    entry: Route,
    /// Keyed by the node the checkpoint is bound to.
    checkpoints: HashMap<String, CheckpointSpec>,
    /// Non-fatal findings from validation at compile time.
    diagnostics: Vec<Diagnostic>,
}

impl WorkflowGraph {
    pub fn node(&self, name: &str) -> Option<&NodeDescriptor> {
        self.nodes.get(name)
    }

    pub fn has_node(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Node names in registration order.
    pub fn node_names(&self) -> &[String] {
        &self.order
    }

    pub fn route(&self, from: &str) -> Option<&Route> {
        self.routes.get(from)
    }

    pub fn entry(&self) -> &Route {
        &self.entry
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn resolve_entry(&self, state: &RunState) -> Result<String> {
        self.entry.resolve("<entry>", state)
    }

    /// Next node after `from`, or `None` when `from` is terminal.
    pub fn next_node(&self, from: &str, state: &RunState) -> Result<Option<String>> {
        match self.routes.get(from) {
            Some(route) => route.resolve(from, state).map(Some),
            None => Ok(None),
        }
    }

    pub fn checkpoint_after(&self, node: &str) -> Option<&CheckpointSpec> {
        self.checkpoints.get(node)
    }

    pub fn checkpoint(&self, name: &str) -> Option<&CheckpointSpec> {
        self.checkpoints.values().find(|c| c.name == name)
    }

    pub fn checkpoints(&self) -> impl Iterator<Item = &CheckpointSpec> {
        self.checkpoints.values()
    }

    /// Render the graph in Graphviz DOT form.
    pub fn to_dot(&self) -> String {
        let mut out = format!("digraph \"{}\" {{\n", self.name);
        out.push_str("  __entry [shape=\"Mdiamond\", label=\"entry\"]\n");
        for name in &self.order {
            let shape = if self.routes.contains_key(name) {
                "box"
            } else {
                "Msquare"
            };
            out.push_str(&format!("  {name} [shape=\"{shape}\"]\n"));
        }
        for target in self.entry.targets() {
            let style = if self.entry.is_conditional() {
                ", style=\"dashed\""
            } else {
                ""
            };
            out.push_str(&format!("  __entry -> {target} [label=\"entry\"{style}]\n"));
        }
        for name in &self.order {
            let Some(route) = self.routes.get(name) else {
                continue;
            };
            for target in route.targets() {
                if route.is_conditional() {
                    out.push_str(&format!(
                        "  {name} -> {target} [style=\"dashed\", label=\"route\"]\n"
                    ));
                } else {
                    out.push_str(&format!("  {name} -> {target}\n"));
                }
            }
        }
        let mut checkpoints: Vec<_> = self.checkpoints.values().collect();
        checkpoints.sort_by(|a, b| a.name.cmp(&b.name));
        for cp in checkpoints {
            out.push_str(&format!(
                "  {} [shape=\"hexagon\", label=\"{}\"]\n  {} -> {} [style=\"dotted\"]\n",
                cp.name, cp.name, cp.after, cp.name
            ));
            for target in cp.rewind.targets() {
                out.push_str(&format!(
                    "  {} -> {target} [style=\"dotted\", label=\"rewind\"]\n",
                    cp.name
                ));
            }
        }
        out.push_str("}\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::PassThroughNode;
    use prepflow_types::{LearningParadigm, RunInput};

    fn linear() -> GraphBuilder {
        let mut b = GraphBuilder::new("linear");
        b.register_node("a", PassThroughNode).unwrap();
        b.register_node("b", PassThroughNode).unwrap();
        b.add_edge("a", "b").fixed_entry("a");
        b
    }

    #[test]
    fn register_node_rejects_duplicates() {
        let mut b = GraphBuilder::new("g");
        b.register_node("a", PassThroughNode).unwrap();
        let err = b.register_node("a", PassThroughNode).err().unwrap();
        assert!(matches!(err, PrepflowError::DuplicateNode(ref n) if n == "a"));
    }

    #[test]
    fn build_linear_graph() {
        let g = linear().build().unwrap();
        assert_eq!(g.node_names(), &["a".to_string(), "b".to_string()]);
        let state = RunState::new(RunInput::default());
        assert_eq!(g.resolve_entry(&state).unwrap(), "a");
        assert_eq!(g.next_node("a", &state).unwrap().as_deref(), Some("b"));
        assert_eq!(g.next_node("b", &state).unwrap(), None);
    }

    #[test]
    fn conditional_route_rejects_undeclared_target() {
        let route = Route::conditional(&["x", "y"], |_| "z".to_string());
        let state = RunState::new(RunInput::default());
        let err = route.resolve("a", &state).unwrap_err();
        match err {
            PrepflowError::Routing { from, returned } => {
                assert_eq!(from, "a");
                assert_eq!(returned, "z");
            }
            other => panic!("expected Routing, got {other:?}"),
        }
    }

    #[test]
    fn conditional_route_follows_state() {
        let route = Route::conditional(&["sup", "unsup"], |s| match s.learning_paradigm {
            Some(LearningParadigm::Unsupervised) => "unsup".into(),
            _ => "sup".into(),
        });
        let mut state = RunState::new(RunInput::default());
        assert_eq!(route.resolve("p", &state).unwrap(), "sup");
        state.learning_paradigm = Some(LearningParadigm::Unsupervised);
        assert_eq!(route.resolve("p", &state).unwrap(), "unsup");
    }

    #[test]
    fn compile_without_entry_fails() {
        let mut b = GraphBuilder::new("g");
        b.register_node("a", PassThroughNode).unwrap();
        let err = b.build().unwrap_err();
        assert!(matches!(err, PrepflowError::Validation(_)));
    }

    #[test]
    fn checkpoint_lookup_by_node_and_name() {
        let mut b = linear();
        b.checkpoint(CheckpointSpec {
            name: "review".into(),
            after: "a".into(),
            rewind: Route::Next("a".into()),
            stage: vec!["a".into()],
        });
        let g = b.build().unwrap();
        assert_eq!(g.checkpoint_after("a").unwrap().name, "review");
        assert_eq!(g.checkpoint("review").unwrap().after, "a");
        assert!(g.checkpoint_after("b").is_none());
    }

    #[test]
    fn compiled_graph_keeps_validation_warnings() {
        let mut b = GraphBuilder::new("g");
        b.register_retryable_node("a", PassThroughNode, 50).unwrap();
        b.fixed_entry("a");
        let g = b.build().unwrap();
        assert_eq!(g.diagnostics().len(), 1);
        assert_eq!(g.diagnostics()[0].rule, "retry_bound");

        assert!(linear().build().unwrap().diagnostics().is_empty());
    }

    #[test]
    fn to_dot_lists_nodes_and_edges() {
        let g = linear().build().unwrap();
        let dot = g.to_dot();
        assert!(dot.starts_with("digraph \"linear\""));
        assert!(dot.contains("a -> b"));
        assert!(dot.contains("b [shape=\"Msquare\"]"));
    }
}
