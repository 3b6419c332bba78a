//! Types exchanged at the review checkpoint boundary.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// PreprocessingStep
// ---------------------------------------------------------------------------

/// A preprocessing operation whose technique is selectable at review time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreprocessingStep {
    Clean,
    CleanOutliers,
    Impute,
    Encode,
    Scale,
}

impl PreprocessingStep {
    pub const ALL: [PreprocessingStep; 5] = [
        PreprocessingStep::Clean,
        PreprocessingStep::CleanOutliers,
        PreprocessingStep::Impute,
        PreprocessingStep::Encode,
        PreprocessingStep::Scale,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PreprocessingStep::Clean => "clean",
            PreprocessingStep::CleanOutliers => "clean_outliers",
            PreprocessingStep::Impute => "impute",
            PreprocessingStep::Encode => "encode",
            PreprocessingStep::Scale => "scale",
        }
    }
}

impl fmt::Display for PreprocessingStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Questions and answers
// ---------------------------------------------------------------------------

/// A reviewer-facing question generated before the config review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewQuestion {
    pub id: String,
    pub step: PreprocessingStep,
    pub prompt: String,
    pub options: Vec<String>,
    pub default: String,
}

/// Technique selected for a question, as stored in `RunState::review_answers`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TechniqueChoice {
    pub technique_name: String,
    #[serde(default)]
    pub technique_params: serde_json::Value,
}

impl TechniqueChoice {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            technique_name: name.into(),
            technique_params: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewAnswer {
    pub question_id: String,
    #[serde(default)]
    pub answer: String,
    #[serde(default)]
    pub technique_name: Option<String>,
    #[serde(default)]
    pub technique_params: Option<serde_json::Value>,
}

impl ReviewAnswer {
    /// The technique this answer selects. An explicit `technique_name` wins;
    /// otherwise the free-text answer names the technique.
    pub fn to_choice(&self) -> Option<TechniqueChoice> {
        let name = self
            .technique_name
            .as_deref()
            .unwrap_or(self.answer.as_str())
            .trim();
        if name.is_empty() {
            return None;
        }
        Some(TechniqueChoice {
            technique_name: name.to_string(),
            technique_params: self
                .technique_params
                .clone()
                .unwrap_or(serde_json::Value::Null),
        })
    }
}

/// Decision submitted by a reviewer for a parked run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewDecision {
    pub approved: bool,
    #[serde(default)]
    pub answers: Vec<ReviewAnswer>,
    #[serde(default)]
    pub user_feedback: Option<String>,
}

impl ReviewDecision {
    pub fn approve() -> Self {
        Self {
            approved: true,
            ..Default::default()
        }
    }

    pub fn reject(feedback: impl Into<String>) -> Self {
        Self {
            approved: false,
            answers: Vec::new(),
            user_feedback: Some(feedback.into()),
        }
    }

    pub fn with_answer(mut self, answer: ReviewAnswer) -> Self {
        self.answers.push(answer);
        self
    }
}

// ---------------------------------------------------------------------------
// Review bookkeeping
// ---------------------------------------------------------------------------

/// Audit entry for one applied decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub checkpoint: String,
    pub approved: bool,
    pub iteration: u32,
    #[serde(default)]
    pub feedback: Option<String>,
    /// Set when the decision was applied by the expiry policy, not a reviewer.
    #[serde(default)]
    pub automatic: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewState {
    #[serde(default)]
    pub pending_checkpoint: Option<String>,
    #[serde(default)]
    pub awaiting_since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub feedback_history: Vec<String>,
    #[serde(default)]
    pub decisions: Vec<DecisionRecord>,
}

impl ReviewState {
    pub fn latest_feedback(&self) -> Option<&str> {
        self.feedback_history.last().map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Preprocessing summary
// ---------------------------------------------------------------------------

/// Technique that a preprocessing node actually applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedTechnique {
    pub node: String,
    pub step: PreprocessingStep,
    pub technique: String,
    #[serde(default)]
    pub params: serde_json::Value,
    /// `true` when the requested technique was replaced by the step default.
    #[serde(default)]
    pub fallback: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreprocessingSummary {
    pub rows_before: usize,
    pub rows_after: usize,
    pub columns_before: usize,
    pub columns_after: usize,
    pub applied: Vec<AppliedTechnique>,
    #[serde(default)]
    pub missing_after: BTreeMap<String, usize>,
}
