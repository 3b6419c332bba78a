//! Shared types, errors, and the run-state record for the prepflow engine.
//!
//! This crate provides the foundational types used across the other prepflow crates:
//! - `PrepflowError`: unified error taxonomy
//! - `RunState`: the single mutable record describing one pipeline run
//! - `Dataset`: column-major table flowing between preprocessing steps
//! - review types exchanged at the checkpoint boundary

pub mod dataset;
pub mod review;
pub mod state;

pub use dataset::{Column, ColumnKind, ColumnProfile, Dataset, DatasetProfile};
pub use review::{
    AppliedTechnique, DecisionRecord, PreprocessingStep, PreprocessingSummary, ReviewAnswer,
    ReviewDecision, ReviewQuestion, ReviewState, TechniqueChoice,
};
pub use state::{
    CategoryPrediction, ErrorRecord, LearningParadigm, PipelineConfigInput, PromptAnalysis,
    RunInput, RunState, RunStatus,
};

/// Unified error type for all prepflow subsystems.
#[derive(Debug, thiserror::Error)]
pub enum PrepflowError {
    // === Graph Errors ===
    #[error("Node '{0}' is already registered")]
    DuplicateNode(String),

    #[error("Pipeline validation failed: {0}")]
    Validation(String),

    #[error("Router on '{from}' returned '{returned}', which is not a declared candidate")]
    Routing { from: String, returned: String },

    #[error("Step limit reached after {limit} node executions")]
    StepLimitExceeded { limit: usize },

    // === Node Errors ===
    #[error("Node '{node}' failed: {message}")]
    NodeExecution {
        node: String,
        message: String,
        retryable: bool,
    },

    #[error("Node '{node}' broke the node contract: {message}")]
    NodeContract { node: String, message: String },

    #[error("Unknown technique '{technique}' for step '{step}'")]
    UnknownTechnique { step: String, technique: String },

    #[error("Technique '{technique}' failed: {message}")]
    Technique { technique: String, message: String },

    #[error("Learning paradigm is locked to '{current}', cannot switch to '{requested}'")]
    ParadigmLocked {
        current: LearningParadigm,
        requested: LearningParadigm,
    },

    // === Run / Checkpoint Errors ===
    #[error("Run '{0}' not found")]
    RunNotFound(String),

    #[error("Cannot {action} run '{run_id}' while it is {status}")]
    InvalidTransition {
        run_id: String,
        status: RunStatus,
        action: String,
    },

    #[error("Invalid review decision: {0}")]
    InvalidDecision(String),

    #[error("Run '{run_id}' was modified concurrently (expected version {expected}, found {found})")]
    ConcurrentModification {
        run_id: String,
        expected: u64,
        found: u64,
    },

    #[error("Checkpoint '{checkpoint}' was rejected {iterations} times, limit is {limit}")]
    ReviewLimitExceeded {
        checkpoint: String,
        iterations: u32,
        limit: u32,
    },

    #[error("Review at '{checkpoint}' expired after waiting {waited_secs}s")]
    ReviewExpired { checkpoint: String, waited_secs: i64 },

    // === Collaborator Errors ===
    #[error("Decision service failed during {operation}: {message}")]
    Decision {
        operation: String,
        message: String,
        retryable: bool,
    },

    // === Generic ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl PrepflowError {
    /// Returns `true` if the error is transient and the operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PrepflowError::NodeExecution { retryable: true, .. }
                | PrepflowError::Decision { retryable: true, .. }
                | PrepflowError::Io(_)
        )
    }

    /// Returns `true` if the error breaks a graph or state invariant, so
    /// re-invoking the node cannot help.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PrepflowError::ParadigmLocked { .. }
                | PrepflowError::NodeContract { .. }
                | PrepflowError::Routing { .. }
                | PrepflowError::Validation(_)
                | PrepflowError::ConcurrentModification { .. }
        )
    }

    /// Returns `true` for errors caused by the caller's request rather than
    /// by the run itself. These are never recorded on the run.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            PrepflowError::RunNotFound(_)
                | PrepflowError::InvalidTransition { .. }
                | PrepflowError::InvalidDecision(_)
                | PrepflowError::ConcurrentModification { .. }
        )
    }

    /// Short machine-readable kind, used in error records and CLI output.
    pub fn kind(&self) -> &'static str {
        match self {
            PrepflowError::DuplicateNode(_) => "duplicate_node",
            PrepflowError::Validation(_) => "validation",
            PrepflowError::Routing { .. } => "routing",
            PrepflowError::StepLimitExceeded { .. } => "step_limit",
            PrepflowError::NodeExecution { .. } => "node_execution",
            PrepflowError::NodeContract { .. } => "node_contract",
            PrepflowError::UnknownTechnique { .. } => "unknown_technique",
            PrepflowError::Technique { .. } => "technique",
            PrepflowError::ParadigmLocked { .. } => "paradigm_locked",
            PrepflowError::RunNotFound(_) => "not_found",
            PrepflowError::InvalidTransition { .. } => "invalid_transition",
            PrepflowError::InvalidDecision(_) => "invalid_decision",
            PrepflowError::ConcurrentModification { .. } => "concurrent_modification",
            PrepflowError::ReviewLimitExceeded { .. } => "review_limit",
            PrepflowError::ReviewExpired { .. } => "review_expired",
            PrepflowError::Decision { .. } => "decision_service",
            PrepflowError::Config(_) => "config",
            PrepflowError::Storage(_) => "storage",
            PrepflowError::Io(_) => "io",
            PrepflowError::Json(_) => "json",
            PrepflowError::Other(_) => "internal_error",
        }
    }

    /// Maps the error to the process exit code used by the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            PrepflowError::RunNotFound(_) => 2,
            PrepflowError::InvalidTransition { .. } | PrepflowError::InvalidDecision(_) => 3,
            PrepflowError::ConcurrentModification { .. } => 4,
            _ => 1,
        }
    }
}

/// A convenience alias for `Result<T, PrepflowError>`.
pub type Result<T> = std::result::Result<T, PrepflowError>;
