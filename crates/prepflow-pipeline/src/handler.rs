//! Step node trait, dynamic dispatch wrapper, and closure-backed nodes.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use prepflow_types::{Result, RunState};

// ---------------------------------------------------------------------------
// StepNode trait
// ---------------------------------------------------------------------------

/// One unit of pipeline work.
///
/// A node receives the full run state and returns the updated state. All
/// mutation flows through the returned value; nodes never write to the
/// run-state store themselves.
#[async_trait]
pub trait StepNode: Send + Sync {
    /// Short kind identifier used in logs and events (e.g. "agent", "preprocess").
    fn kind(&self) -> &str;

    async fn execute(&self, state: RunState) -> Result<RunState>;
}

// ---------------------------------------------------------------------------
// DynNode: shareable handle
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct DynNode(Arc<dyn StepNode>);

impl DynNode {
    pub fn new(node: impl StepNode + 'static) -> Self {
        Self(Arc::new(node))
    }

    pub fn kind(&self) -> &str {
        self.0.kind()
    }

    pub async fn execute(&self, state: RunState) -> Result<RunState> {
        self.0.execute(state).await
    }
}

impl std::fmt::Debug for DynNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DynNode").field(&self.kind()).finish()
    }
}

// ---------------------------------------------------------------------------
// FnNode: closure adapter
// ---------------------------------------------------------------------------

type BoxedStep =
    Box<dyn Fn(RunState) -> Pin<Box<dyn Future<Output = Result<RunState>> + Send>> + Send + Sync>;

/// Wraps an async closure `RunState -> Result<RunState>` as a [`StepNode`].
pub struct FnNode {
    kind: String,
    f: BoxedStep,
}

impl FnNode {
    pub fn new<F, Fut>(kind: impl Into<String>, f: F) -> Self
    where
        F: Fn(RunState) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RunState>> + Send + 'static,
    {
        Self {
            kind: kind.into(),
            f: Box::new(move |state| Box::pin(f(state))),
        }
    }
}

#[async_trait]
impl StepNode for FnNode {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn execute(&self, state: RunState) -> Result<RunState> {
        (self.f)(state).await
    }
}

/// A node that passes the state through untouched.
pub struct PassThroughNode;

#[async_trait]
impl StepNode for PassThroughNode {
    fn kind(&self) -> &str {
        "pass"
    }

    async fn execute(&self, state: RunState) -> Result<RunState> {
        Ok(state)
    }
}
