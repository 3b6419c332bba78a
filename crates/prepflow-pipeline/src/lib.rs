//! Workflow engine for human-reviewed data-preprocessing runs.
//!
//! This crate implements the prepflow run loop: graph definition and
//! validation, conditional routing, pause-and-persist review checkpoints,
//! technique dispatch with fallback, and compare-and-swap run-state stores.

pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod decision;
pub mod engine;
pub mod events;
pub mod graph;
pub mod handler;
pub mod nodes;
pub mod pipeline;
pub mod policy;
pub mod retry;
pub mod store;
pub mod techniques;
pub mod validation;

pub use checkpoint::{CheckpointController, ReviewOutcome, Transition};
pub use config::EngineConfig;
pub use coordinator::RunCoordinator;
pub use decision::{
    question_id, DecisionService, HeuristicDecisionService, RetryingDecisionService,
    ScriptedDecisionService,
};
pub use engine::PipelineExecutor;
pub use events::{EventEmitter, PipelineEvent};
pub use graph::{
    CheckpointSpec, GraphBuilder, GraphDefinition, NodeDescriptor, Route, Router, WorkflowGraph,
};
pub use handler::{DynNode, FnNode, PassThroughNode, StepNode};
pub use pipeline::{preprocessing_definition, preprocessing_graph, PipelineDeps};
pub use policy::{ExpiryAction, ReviewPolicy};
pub use retry::{execute_with_retry, BackoffPolicy};
pub use store::{MemoryRunStore, RunStateStore, SqliteRunStore};
pub use techniques::{builtin_registry, dispatch_with_fallback, StepPolicy, TechniqueRegistry};
pub use validation::{validate, validate_or_raise, Diagnostic, LintRule, Severity};
