//! The decision service: the agent collaborator behind prompt analysis,
//! category prediction, and question generation.
//!
//! The engine treats it as a black box returning structured values. Three
//! implementations ship here:
//!
//! - [`HeuristicDecisionService`]: deterministic keyword and dataset-shape rules
//! - [`ScriptedDecisionService`]: canned JSON responses, for tests and replay
//! - [`RetryingDecisionService`]: bounded retry wrapper around any service

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{LazyLock, Mutex};

use async_trait::async_trait;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;

use prepflow_types::{
    CategoryPrediction, ColumnKind, DatasetProfile, LearningParadigm, PreprocessingStep,
    PrepflowError, PromptAnalysis, Result, ReviewQuestion,
};

use crate::pipeline::paradigm_steps;
use crate::retry::{execute_with_retry, BackoffPolicy};
use crate::techniques::StepPolicy;

/// Structured-output agent consulted by the agent nodes.
#[async_trait]
pub trait DecisionService: Send + Sync {
    /// Turn a free-text goal (plus reviewer feedback on a rewind) into a
    /// structured analysis.
    async fn analyze_prompt(&self, prompt: &str, feedback: Option<&str>)
        -> Result<PromptAnalysis>;

    async fn predict_category(
        &self,
        analysis: &PromptAnalysis,
        profile: &DatasetProfile,
    ) -> Result<CategoryPrediction>;

    async fn generate_questions(
        &self,
        prediction: &CategoryPrediction,
        profile: &DatasetProfile,
    ) -> Result<Vec<ReviewQuestion>>;
}

/// Question id used for a preprocessing step.
pub fn question_id(step: PreprocessingStep) -> String {
    format!("q_{step}")
}

/// Parse a structured agent response. Markdown code fences around the JSON
/// are tolerated.
pub fn parse_structured<T: DeserializeOwned>(operation: &str, raw: &str) -> Result<T> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();
    serde_json::from_str(body).map_err(|e| PrepflowError::Decision {
        operation: operation.to_string(),
        message: format!("malformed response: {e}"),
        retryable: false,
    })
}

// ---------------------------------------------------------------------------
// HeuristicDecisionService
// ---------------------------------------------------------------------------

const UNSUPERVISED_WORDS: &[&str] = &["cluster", "segment", "anomal", "group similar", "unsupervised"];
const SUPERVISED_WORDS: &[&str] = &["predict", "classif", "regress", "forecast", "supervised"];

/// Technique options offered per step, before registry and policy filtering.
const STEP_OPTIONS: &[(PreprocessingStep, &[&str])] = &[
    (PreprocessingStep::Clean, &["drop_duplicates", "drop_empty_rows", "none"]),
    (PreprocessingStep::CleanOutliers, &["iqr_clip", "zscore_filter", "none"]),
    (
        PreprocessingStep::Impute,
        &["mean", "median", "most_frequent", "constant", "drop_rows"],
    ),
    (PreprocessingStep::Encode, &["one_hot", "label", "target", "none"]),
    (PreprocessingStep::Scale, &["standard", "minmax", "robust", "none"]),
];

/// Deterministic rules standing in for an LLM-backed agent.
#[derive(Debug, Clone, Default)]
pub struct HeuristicDecisionService;

impl HeuristicDecisionService {
    pub fn new() -> Self {
        Self
    }
}

static EXPLICIT_TARGET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\btarget(?:\s+column)?\s*(?:is|=|:)?\s*['"`]?([A-Za-z_][A-Za-z0-9_]*)"#)
        .expect("target pattern is a valid regex")
});

static PREDICTED_TARGET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:predict|forecast|estimate|classify)\s+(?:the\s+)?([A-Za-z_][A-Za-z0-9_]*)")
        .expect("prediction pattern is a valid regex")
});

fn capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)?.get(1).map(|m| m.as_str().to_string())
}

fn extract_target(text: &str) -> Option<String> {
    capture(&EXPLICIT_TARGET, text).or_else(|| capture(&PREDICTED_TARGET, text))
}

fn mentions(text: &str, words: &[&str]) -> bool {
    let lower = text.to_lowercase();
    words.iter().any(|w| lower.contains(w))
}

fn category_hint(text: &str) -> Option<String> {
    let lower = text.to_lowercase();
    let category = if lower.contains("anomal") || lower.contains("outlier detection") {
        "anomaly_detection"
    } else if lower.contains("cluster") || lower.contains("segment") {
        "clustering"
    } else if lower.contains("classif") {
        "classification"
    } else if lower.contains("regress") || lower.contains("forecast") {
        "regression"
    } else {
        return None;
    };
    Some(category.to_string())
}

fn step_prompt(step: PreprocessingStep, profile: &DatasetProfile) -> String {
    match step {
        PreprocessingStep::Clean => format!("How should the {} rows be cleaned?", profile.rows),
        PreprocessingStep::CleanOutliers => {
            "How should outliers in numeric features be handled?".to_string()
        }
        PreprocessingStep::Impute => {
            let missing: usize = profile.columns.iter().map(|c| c.missing).sum();
            format!("How should the {missing} missing cells be filled?")
        }
        PreprocessingStep::Encode => {
            let categorical = profile
                .columns
                .iter()
                .filter(|c| c.kind == ColumnKind::Categorical)
                .count();
            format!("How should the {categorical} categorical columns be encoded?")
        }
        PreprocessingStep::Scale => "How should numeric features be scaled?".to_string(),
    }
}

#[async_trait]
impl DecisionService for HeuristicDecisionService {
    async fn analyze_prompt(
        &self,
        prompt: &str,
        feedback: Option<&str>,
    ) -> Result<PromptAnalysis> {
        // Feedback from a rejected review takes precedence over the prompt.
        let sources: Vec<&str> = feedback.into_iter().chain(Some(prompt)).collect();
        let target_column = sources.iter().find_map(|s| extract_target(s));
        let paradigm_hint = sources.iter().find_map(|s| {
            if mentions(s, UNSUPERVISED_WORDS) {
                Some(LearningParadigm::Unsupervised)
            } else if mentions(s, SUPERVISED_WORDS) {
                Some(LearningParadigm::Supervised)
            } else {
                None
            }
        });
        let mut hints = BTreeMap::new();
        if let Some(fb) = feedback {
            hints.insert("feedback".to_string(), fb.to_string());
        }
        Ok(PromptAnalysis {
            goal: prompt.trim().to_string(),
            target_column,
            paradigm_hint,
            category_hint: sources.iter().find_map(|s| category_hint(s)),
            hints,
        })
    }

    async fn predict_category(
        &self,
        analysis: &PromptAnalysis,
        profile: &DatasetProfile,
    ) -> Result<CategoryPrediction> {
        let target = analysis
            .target_column
            .as_deref()
            .and_then(|t| profile.column(t));
        let paradigm = analysis.paradigm_hint.unwrap_or(if target.is_some() {
            LearningParadigm::Supervised
        } else {
            LearningParadigm::Unsupervised
        });
        let category = analysis.category_hint.clone().unwrap_or_else(|| {
            match (paradigm, target.map(|t| t.kind)) {
                (LearningParadigm::Unsupervised, _) => "clustering",
                (LearningParadigm::Supervised, Some(ColumnKind::Numeric)) => "regression",
                (LearningParadigm::Supervised, _) => "classification",
            }
            .to_string()
        });
        let confidence = if analysis.paradigm_hint.is_some() { 0.9 } else { 0.6 };
        let reasoning = match &analysis.target_column {
            Some(t) if target.is_some() => format!("target column '{t}' present in data"),
            Some(t) => format!("target column '{t}' not found in data"),
            None => "no target column given".to_string(),
        };
        Ok(CategoryPrediction {
            algorithm_category: category,
            learning_paradigm: paradigm,
            confidence,
            reasoning,
        })
    }

    async fn generate_questions(
        &self,
        prediction: &CategoryPrediction,
        profile: &DatasetProfile,
    ) -> Result<Vec<ReviewQuestion>> {
        let paradigm = prediction.learning_paradigm;
        Ok(paradigm_steps(paradigm)
            .iter()
            .map(|&step| {
                let options = STEP_OPTIONS
                    .iter()
                    .find(|(s, _)| *s == step)
                    .map(|(_, opts)| opts.iter().map(|o| o.to_string()).collect())
                    .unwrap_or_default();
                ReviewQuestion {
                    id: question_id(step),
                    step,
                    prompt: step_prompt(step, profile),
                    options,
                    default: StepPolicy::for_paradigm(paradigm, step).default,
                }
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// ScriptedDecisionService
// ---------------------------------------------------------------------------

/// Replays canned responses per operation, falling back to the heuristic
/// service once a queue runs dry.
///
/// A script is a JSON object keyed by operation name (`analyze_prompt`,
/// `predict_category`, `generate_questions`), each holding a list of
/// responses. A response is either the structured value itself, a string of
/// (possibly fenced) JSON, or `{"error": "...", "retryable": bool}`.
#[derive(Debug, Default)]
pub struct ScriptedDecisionService {
    responses: Mutex<HashMap<String, VecDeque<Value>>>,
    calls: Mutex<Vec<String>>,
    fallback: HeuristicDecisionService,
}

impl ScriptedDecisionService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_script(script: &Value) -> Result<Self> {
        let obj = script
            .as_object()
            .ok_or_else(|| PrepflowError::Config("decision script must be a JSON object".into()))?;
        let service = Self::new();
        for (operation, entries) in obj {
            let entries = entries.as_array().ok_or_else(|| {
                PrepflowError::Config(format!("script entry '{operation}' must be a list"))
            })?;
            for entry in entries {
                service.push(operation, entry.clone());
            }
        }
        Ok(service)
    }

    pub fn push(&self, operation: &str, response: Value) {
        let mut responses = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        responses
            .entry(operation.to_string())
            .or_default()
            .push_back(response);
    }

    /// Operations invoked so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn next<T: DeserializeOwned>(&self, operation: &str) -> Option<Result<T>> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(operation.to_string());
        let response = self
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(operation)?
            .pop_front()?;
        Some(decode(operation, response))
    }
}

fn decode<T: DeserializeOwned>(operation: &str, response: Value) -> Result<T> {
    if let Some(message) = response.get("error").and_then(Value::as_str) {
        return Err(PrepflowError::Decision {
            operation: operation.to_string(),
            message: message.to_string(),
            retryable: response
                .get("retryable")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        });
    }
    match response {
        Value::String(raw) => parse_structured(operation, &raw),
        other => serde_json::from_value(other).map_err(|e| PrepflowError::Decision {
            operation: operation.to_string(),
            message: format!("malformed response: {e}"),
            retryable: false,
        }),
    }
}

#[async_trait]
impl DecisionService for ScriptedDecisionService {
    async fn analyze_prompt(
        &self,
        prompt: &str,
        feedback: Option<&str>,
    ) -> Result<PromptAnalysis> {
        match self.next("analyze_prompt") {
            Some(result) => result,
            None => self.fallback.analyze_prompt(prompt, feedback).await,
        }
    }

    async fn predict_category(
        &self,
        analysis: &PromptAnalysis,
        profile: &DatasetProfile,
    ) -> Result<CategoryPrediction> {
        match self.next("predict_category") {
            Some(result) => result,
            None => self.fallback.predict_category(analysis, profile).await,
        }
    }

    async fn generate_questions(
        &self,
        prediction: &CategoryPrediction,
        profile: &DatasetProfile,
    ) -> Result<Vec<ReviewQuestion>> {
        match self.next("generate_questions") {
            Some(result) => result,
            None => self.fallback.generate_questions(prediction, profile).await,
        }
    }
}

// ---------------------------------------------------------------------------
// RetryingDecisionService
// ---------------------------------------------------------------------------

/// Retries transient collaborator failures with backoff.
#[derive(Debug)]
pub struct RetryingDecisionService<S> {
    inner: S,
    max_retries: usize,
    backoff: BackoffPolicy,
}

impl<S: DecisionService> RetryingDecisionService<S> {
    pub fn new(inner: S, max_retries: usize, backoff: BackoffPolicy) -> Self {
        Self {
            inner,
            max_retries,
            backoff,
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: DecisionService> DecisionService for RetryingDecisionService<S> {
    async fn analyze_prompt(
        &self,
        prompt: &str,
        feedback: Option<&str>,
    ) -> Result<PromptAnalysis> {
        execute_with_retry(
            || self.inner.analyze_prompt(prompt, feedback),
            self.max_retries,
            &self.backoff,
            "analyze_prompt",
        )
        .await
    }

    async fn predict_category(
        &self,
        analysis: &PromptAnalysis,
        profile: &DatasetProfile,
    ) -> Result<CategoryPrediction> {
        execute_with_retry(
            || self.inner.predict_category(analysis, profile),
            self.max_retries,
            &self.backoff,
            "predict_category",
        )
        .await
    }

    async fn generate_questions(
        &self,
        prediction: &CategoryPrediction,
        profile: &DatasetProfile,
    ) -> Result<Vec<ReviewQuestion>> {
        execute_with_retry(
            || self.inner.generate_questions(prediction, profile),
            self.max_retries,
            &self.backoff,
            "generate_questions",
        )
        .await
    }
}
