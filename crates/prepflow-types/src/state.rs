//! The run-state record and its stage groups.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dataset::Dataset;
use crate::review::{PreprocessingSummary, ReviewQuestion, ReviewState, TechniqueChoice};
use crate::{PrepflowError, Result};

// ---------------------------------------------------------------------------
// RunStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    AwaitingReview,
    Failed,
    Stopped,
    Completed,
}

impl RunStatus {
    /// Terminal runs never execute another node.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Failed | RunStatus::Stopped | RunStatus::Completed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::AwaitingReview => "awaiting_review",
            RunStatus::Failed => "failed",
            RunStatus::Stopped => "stopped",
            RunStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// LearningParadigm
// ---------------------------------------------------------------------------

/// Selects which of the two disjoint preprocessing sub-graphs runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningParadigm {
    Supervised,
    Unsupervised,
}

impl LearningParadigm {
    pub fn as_str(self) -> &'static str {
        match self {
            LearningParadigm::Supervised => "supervised",
            LearningParadigm::Unsupervised => "unsupervised",
        }
    }
}

impl fmt::Display for LearningParadigm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LearningParadigm {
    type Err = PrepflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "supervised" => Ok(LearningParadigm::Supervised),
            "unsupervised" => Ok(LearningParadigm::Unsupervised),
            other => Err(PrepflowError::Other(format!(
                "unknown learning paradigm '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// ErrorRecord
// ---------------------------------------------------------------------------

/// Structured entry in a run's `errors` or `warnings` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub node: Option<String>,
    pub kind: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(node: Option<&str>, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            node: node.map(String::from),
            kind: kind.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn from_error(node: Option<&str>, err: &PrepflowError) -> Self {
        Self::new(node, err.kind(), err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Stage groups
// ---------------------------------------------------------------------------

/// Pre-structured configuration supplied instead of a free-text prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfigInput {
    #[serde(default)]
    pub goal: Option<String>,
    #[serde(default)]
    pub target_column: Option<String>,
    #[serde(default)]
    pub learning_paradigm: Option<LearningParadigm>,
    #[serde(default)]
    pub algorithm_category: Option<String>,
    #[serde(default)]
    pub hints: BTreeMap<String, String>,
}

/// Inputs given when a run is requested.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunInput {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub config: Option<PipelineConfigInput>,
    #[serde(default)]
    pub dataset_path: Option<PathBuf>,
    #[serde(default)]
    pub dataset: Option<Dataset>,
    #[serde(default)]
    pub target_column: Option<String>,
}

impl RunInput {
    pub fn has_prompt(&self) -> bool {
        self.prompt.as_deref().is_some_and(|p| !p.trim().is_empty())
    }
}

/// Output of the prompt-analysis (or config-loading) stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptAnalysis {
    pub goal: String,
    #[serde(default)]
    pub target_column: Option<String>,
    #[serde(default)]
    pub paradigm_hint: Option<LearningParadigm>,
    #[serde(default)]
    pub category_hint: Option<String>,
    #[serde(default)]
    pub hints: BTreeMap<String, String>,
}

/// Output of the algorithm-category prediction stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryPrediction {
    pub algorithm_category: String,
    pub learning_paradigm: LearningParadigm,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
}

// ---------------------------------------------------------------------------
// RunState
// ---------------------------------------------------------------------------

/// The single mutable record describing one pipeline execution.
///
/// Nodes receive the full record and return an updated copy; the engine
/// persists it after every node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub status: RunStatus,
    pub current_node: Option<String>,
    pub completed_nodes: Vec<String>,
    pub failed_nodes: Vec<String>,
    pub node_outputs: BTreeMap<String, serde_json::Value>,
    pub learning_paradigm: Option<LearningParadigm>,
    pub review_answers: BTreeMap<String, TechniqueChoice>,
    pub review_iteration: u32,
    pub errors: Vec<ErrorRecord>,
    pub warnings: Vec<ErrorRecord>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    pub input: RunInput,
    #[serde(default)]
    pub analysis: Option<PromptAnalysis>,
    #[serde(default)]
    pub prediction: Option<CategoryPrediction>,
    #[serde(default)]
    pub questions: Vec<ReviewQuestion>,
    #[serde(default)]
    pub review: ReviewState,
    #[serde(default)]
    pub summary: Option<PreprocessingSummary>,
}

impl RunState {
    /// Create a fresh `pending` record with a new run id.
    pub fn new(input: RunInput) -> Self {
        let now = Utc::now();
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            status: RunStatus::Pending,
            current_node: None,
            completed_nodes: Vec::new(),
            failed_nodes: Vec::new(),
            node_outputs: BTreeMap::new(),
            learning_paradigm: None,
            review_answers: BTreeMap::new(),
            review_iteration: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
            input,
            analysis: None,
            prediction: None,
            questions: Vec::new(),
            review: ReviewState::default(),
            summary: None,
        }
    }

    pub fn is_awaiting_review(&self) -> bool {
        self.status == RunStatus::AwaitingReview
    }

    /// Record a successful node execution. Re-executions do not duplicate entries.
    pub fn mark_completed(&mut self, node: &str) {
        self.failed_nodes.retain(|n| n != node);
        if !self.completed_nodes.iter().any(|n| n == node) {
            self.completed_nodes.push(node.to_string());
        }
    }

    /// Record a failed node execution. The latest outcome wins: a node that
    /// completed earlier and then fails on re-execution moves to the failed
    /// set, so the two sets stay disjoint.
    pub fn mark_failed(&mut self, node: &str) {
        self.completed_nodes.retain(|n| n != node);
        if !self.failed_nodes.iter().any(|n| n == node) {
            self.failed_nodes.push(node.to_string());
        }
    }

    pub fn record_error(&mut self, node: Option<&str>, err: &PrepflowError) {
        self.errors.push(ErrorRecord::from_error(node, err));
    }

    pub fn record_warning(
        &mut self,
        node: Option<&str>,
        kind: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.warnings.push(ErrorRecord::new(node, kind, message));
    }

    pub fn set_output(&mut self, node: &str, value: serde_json::Value) {
        self.node_outputs.insert(node.to_string(), value);
    }

    pub fn output(&self, node: &str) -> Option<&serde_json::Value> {
        self.node_outputs.get(node)
    }

    /// Set the learning paradigm. Setting the same value again is a no-op;
    /// switching to the other paradigm is rejected.
    pub fn set_paradigm(&mut self, paradigm: LearningParadigm) -> Result<()> {
        match self.learning_paradigm {
            Some(current) if current != paradigm => Err(PrepflowError::ParadigmLocked {
                current,
                requested: paradigm,
            }),
            _ => {
                self.learning_paradigm = Some(paradigm);
                Ok(())
            }
        }
    }

    /// Drop the outputs of the given nodes and forget that they completed.
    pub fn discard_stage(&mut self, nodes: &[String]) {
        for node in nodes {
            self.node_outputs.remove(node);
        }
        self.completed_nodes.retain(|n| !nodes.contains(n));
    }

    /// The reviewer's technique choice for a question, if any.
    pub fn answer_for(&self, question_id: &str) -> Option<&TechniqueChoice> {
        self.review_answers.get(question_id)
    }

    /// The target column resolved by analysis, falling back to the raw input.
    pub fn target_column(&self) -> Option<&str> {
        self.analysis
            .as_ref()
            .and_then(|a| a.target_column.as_deref())
            .or(self.input.target_column.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_run_is_pending_with_unique_id() {
        let a = RunState::new(RunInput::default());
        let b = RunState::new(RunInput::default());
        assert_eq!(a.status, RunStatus::Pending);
        assert_eq!(a.version, 0);
        assert!(a.current_node.is_none());
        assert_ne!(a.run_id, b.run_id);
    }

    #[test]
    fn mark_completed_is_an_ordered_set() {
        let mut s = RunState::new(RunInput::default());
        s.mark_completed("load_data");
        s.mark_completed("predict_category");
        s.mark_completed("load_data");
        assert_eq!(s.completed_nodes, vec!["load_data", "predict_category"]);
    }

    #[test]
    fn failed_and_completed_stay_disjoint() {
        let mut s = RunState::new(RunInput::default());
        s.mark_completed("load_data");
        s.mark_completed("impute");
        s.mark_failed("impute");
        s.mark_failed("encode");
        assert_eq!(s.completed_nodes, vec!["load_data"]);
        assert_eq!(s.failed_nodes, vec!["impute", "encode"]);

        s.mark_completed("encode");
        assert_eq!(s.completed_nodes, vec!["load_data", "encode"]);
        assert_eq!(s.failed_nodes, vec!["impute"]);
    }

    #[test]
    fn paradigm_is_immutable_once_set() {
        let mut s = RunState::new(RunInput::default());
        s.set_paradigm(LearningParadigm::Unsupervised).unwrap();
        s.set_paradigm(LearningParadigm::Unsupervised).unwrap();
        let err = s.set_paradigm(LearningParadigm::Supervised).unwrap_err();
        assert!(matches!(err, PrepflowError::ParadigmLocked { .. }));
        assert_eq!(s.learning_paradigm, Some(LearningParadigm::Unsupervised));
    }

    #[test]
    fn discard_stage_drops_outputs_and_completion() {
        let mut s = RunState::new(RunInput::default());
        s.set_output("load_data", serde_json::json!({"rows": 3}));
        s.set_output("impute", serde_json::json!({"rows": 3}));
        s.mark_completed("load_data");
        s.mark_completed("impute");

        s.discard_stage(&["impute".to_string()]);

        assert!(s.output("impute").is_none());
        assert!(s.output("load_data").is_some());
        assert_eq!(s.completed_nodes, vec!["load_data"]);
    }

    #[test]
    fn target_column_prefers_analysis() {
        let mut s = RunState::new(RunInput {
            target_column: Some("raw".into()),
            ..Default::default()
        });
        assert_eq!(s.target_column(), Some("raw"));
        s.analysis = Some(PromptAnalysis {
            goal: "predict churn".into(),
            target_column: Some("churned".into()),
            ..Default::default()
        });
        assert_eq!(s.target_column(), Some("churned"));
    }

    #[test]
    fn status_serializes_to_snake_case() {
        assert_eq!(
            serde_json::to_string(&RunStatus::AwaitingReview).unwrap(),
            "\"awaiting_review\""
        );
        let status: RunStatus = serde_json::from_str("\"stopped\"").unwrap();
        assert_eq!(status, RunStatus::Stopped);
    }

    #[test]
    fn paradigm_parses_case_insensitively() {
        assert_eq!(
            "Unsupervised".parse::<LearningParadigm>().unwrap(),
            LearningParadigm::Unsupervised
        );
        assert!("semi".parse::<LearningParadigm>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Stopped.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(!RunStatus::AwaitingReview.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
    }
}
