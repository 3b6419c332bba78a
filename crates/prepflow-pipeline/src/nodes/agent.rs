//! Nodes that consult the decision service (or stand in for it).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use prepflow_types::{LearningParadigm, PromptAnalysis, Result, ReviewQuestion, RunState};

use super::{executing, node_error, profile_from, to_json};
use crate::decision::DecisionService;
use crate::handler::StepNode;
use crate::pipeline::paradigm_steps;
use crate::techniques::{StepPolicy, TechniqueRegistry};

// ---------------------------------------------------------------------------
// AnalyzePromptNode
// ---------------------------------------------------------------------------

/// Turns the free-text prompt, plus the latest reviewer feedback, into a
/// [`PromptAnalysis`].
pub struct AnalyzePromptNode {
    service: Arc<dyn DecisionService>,
}

impl AnalyzePromptNode {
    pub fn new(service: Arc<dyn DecisionService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl StepNode for AnalyzePromptNode {
    fn kind(&self) -> &str {
        "agent"
    }

    async fn execute(&self, mut state: RunState) -> Result<RunState> {
        let node = executing(&state)?;
        let feedback = state.review.latest_feedback().map(str::to_string);
        let config = state.input.config.clone().unwrap_or_default();
        // A structured-config run rewound with feedback analyzes the stated
        // goal, or the feedback itself.
        let prompt = state
            .input
            .prompt
            .clone()
            .filter(|p| !p.trim().is_empty())
            .or(config.goal)
            .or_else(|| feedback.clone())
            .ok_or_else(|| node_error(&node, "run has no prompt to analyze"))?;

        let mut analysis = self
            .service
            .analyze_prompt(&prompt, feedback.as_deref())
            .await?;
        analysis.target_column = analysis
            .target_column
            .or(config.target_column)
            .or_else(|| state.input.target_column.clone());
        analysis.paradigm_hint = analysis.paradigm_hint.or(config.learning_paradigm);
        analysis.category_hint = analysis.category_hint.or(config.algorithm_category);
        for (k, v) in config.hints {
            analysis.hints.entry(k).or_insert(v);
        }
        tracing::info!(
            node = %node,
            target = ?analysis.target_column,
            paradigm_hint = ?analysis.paradigm_hint,
            "Prompt analyzed"
        );

        let output = to_json(&node, &analysis)?;
        state.analysis = Some(analysis);
        state.set_output(&node, output);
        Ok(state)
    }
}

// ---------------------------------------------------------------------------
// LoadConfigNode
// ---------------------------------------------------------------------------

/// Builds the analysis directly from a pre-structured configuration.
pub struct LoadConfigNode;

#[async_trait]
impl StepNode for LoadConfigNode {
    fn kind(&self) -> &str {
        "config"
    }

    async fn execute(&self, mut state: RunState) -> Result<RunState> {
        let node = executing(&state)?;
        let config = state.input.config.clone().unwrap_or_default();
        let analysis = PromptAnalysis {
            goal: config.goal.unwrap_or_default(),
            target_column: config
                .target_column
                .or_else(|| state.input.target_column.clone()),
            paradigm_hint: config.learning_paradigm,
            category_hint: config.algorithm_category,
            hints: config.hints,
        };
        let output = to_json(&node, &analysis)?;
        state.analysis = Some(analysis);
        state.set_output(&node, output);
        Ok(state)
    }
}

// ---------------------------------------------------------------------------
// PredictCategoryNode
// ---------------------------------------------------------------------------

/// Predicts the algorithm category and fixes the run's learning paradigm.
pub struct PredictCategoryNode {
    service: Arc<dyn DecisionService>,
    data_source: String,
}

impl PredictCategoryNode {
    pub fn new(service: Arc<dyn DecisionService>, data_source: impl Into<String>) -> Self {
        Self {
            service,
            data_source: data_source.into(),
        }
    }
}

#[async_trait]
impl StepNode for PredictCategoryNode {
    fn kind(&self) -> &str {
        "agent"
    }

    async fn execute(&self, mut state: RunState) -> Result<RunState> {
        let node = executing(&state)?;
        let analysis = state
            .analysis
            .clone()
            .ok_or_else(|| node_error(&node, "no analysis to predict from"))?;
        let profile = profile_from(&state, &node, &self.data_source)?;

        let prediction = self.service.predict_category(&analysis, &profile).await?;
        state.set_paradigm(prediction.learning_paradigm)?;

        if prediction.learning_paradigm == LearningParadigm::Supervised {
            let target = state.target_column().map(str::to_string);
            match target.as_deref() {
                Some(t) if profile.column(t).is_none() => {
                    let msg = format!("target column '{t}' is not in the dataset");
                    state.record_warning(Some(&node), "missing_target", msg);
                }
                None => state.record_warning(
                    Some(&node),
                    "missing_target",
                    "supervised run without a target column",
                ),
                _ => {}
            }
        }
        tracing::info!(
            node = %node,
            category = %prediction.algorithm_category,
            paradigm = %prediction.learning_paradigm,
            confidence = prediction.confidence,
            "Category predicted"
        );

        let output = to_json(&node, &prediction)?;
        state.prediction = Some(prediction);
        state.set_output(&node, output);
        Ok(state)
    }
}

// ---------------------------------------------------------------------------
// GenerateQuestionsNode
// ---------------------------------------------------------------------------

/// Asks the decision service for reviewer questions and narrows each
/// question's options to what the registry and step policy allow.
pub struct GenerateQuestionsNode {
    service: Arc<dyn DecisionService>,
    registry: Arc<TechniqueRegistry>,
    data_source: String,
}

impl GenerateQuestionsNode {
    pub fn new(
        service: Arc<dyn DecisionService>,
        registry: Arc<TechniqueRegistry>,
        data_source: impl Into<String>,
    ) -> Self {
        Self {
            service,
            registry,
            data_source: data_source.into(),
        }
    }
}

#[async_trait]
impl StepNode for GenerateQuestionsNode {
    fn kind(&self) -> &str {
        "agent"
    }

    async fn execute(&self, mut state: RunState) -> Result<RunState> {
        let node = executing(&state)?;
        let prediction = state
            .prediction
            .clone()
            .ok_or_else(|| node_error(&node, "no category prediction"))?;
        let profile = profile_from(&state, &node, &self.data_source)?;
        let paradigm = prediction.learning_paradigm;
        let steps = paradigm_steps(paradigm);

        let generated = self.service.generate_questions(&prediction, &profile).await?;
        let mut questions: Vec<ReviewQuestion> = Vec::with_capacity(generated.len());
        for mut q in generated {
            if !steps.contains(&q.step) {
                state.record_warning(
                    Some(&node),
                    "question_dropped",
                    format!("question '{}' targets step '{}' outside the {paradigm} path", q.id, q.step),
                );
                continue;
            }
            if questions.iter().any(|existing| existing.id == q.id) {
                continue;
            }
            let policy = StepPolicy::for_paradigm(paradigm, q.step);
            let registry = &self.registry;
            q.options = policy
                .allowed_options(q.options.iter().map(String::as_str))
                .into_iter()
                .filter(|o| registry.has(q.step, o))
                .collect();
            if !q.options.contains(&q.default) {
                q.default = policy.default.clone();
            }
            if !q.options.contains(&q.default) && registry.has(q.step, &q.default) {
                q.options.insert(0, q.default.clone());
            }
            questions.push(q);
        }
        tracing::info!(node = %node, count = questions.len(), "Review questions generated");

        state.set_output(&node, json!({ "questions": to_json(&node, &questions)? }));
        state.questions = questions;
        Ok(state)
    }
}
