//! Technique-driven preprocessing nodes and the stage summary.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use prepflow_types::{
    AppliedTechnique, LearningParadigm, PreprocessingStep, PreprocessingSummary, Result, RunState,
    TechniqueChoice,
};

use super::{dataset_from, executing, node_error, to_json};
use crate::decision::question_id;
use crate::handler::StepNode;
use crate::techniques::{dispatch_with_fallback, StepPolicy, TechniqueRegistry};

// ---------------------------------------------------------------------------
// PreprocessNode
// ---------------------------------------------------------------------------

/// Runs the reviewer-selected technique for one step over the dataset
/// produced by `source`.
///
/// The technique comes from the reviewer's answer to the step's question,
/// else the question's suggested default, else the policy default.
pub struct PreprocessNode {
    step: PreprocessingStep,
    source: String,
    registry: Arc<TechniqueRegistry>,
    policy: StepPolicy,
}

impl PreprocessNode {
    pub fn new(
        source: impl Into<String>,
        registry: Arc<TechniqueRegistry>,
        policy: StepPolicy,
    ) -> Self {
        Self {
            step: policy.step,
            source: source.into(),
            registry,
            policy,
        }
    }

    pub fn step(&self) -> PreprocessingStep {
        self.step
    }

    fn requested(&self, state: &RunState) -> Option<TechniqueChoice> {
        let qid = question_id(self.step);
        state.answer_for(&qid).cloned().or_else(|| {
            state
                .questions
                .iter()
                .find(|q| q.id == qid)
                .map(|q| TechniqueChoice::new(q.default.clone()))
        })
    }
}

#[async_trait]
impl StepNode for PreprocessNode {
    fn kind(&self) -> &str {
        "preprocess"
    }

    async fn execute(&self, mut state: RunState) -> Result<RunState> {
        let node = executing(&state)?;
        let data = dataset_from(&state, &node, &self.source)?;
        let requested = self.requested(&state);
        let context = match state.target_column() {
            Some(target) => json!({ "target_column": target }),
            None => Value::Null,
        };

        let out = dispatch_with_fallback(
            &self.registry,
            &self.policy,
            requested.as_ref(),
            &context,
            data,
        )?;
        for warning in &out.warnings {
            state.record_warning(Some(&node), "technique_fallback", warning.clone());
        }
        tracing::info!(
            node = %node,
            step = %self.step,
            technique = %out.technique,
            fallback = out.fallback,
            rows = out.dataset.n_rows(),
            "Technique applied"
        );

        let applied = AppliedTechnique {
            node: node.clone(),
            step: self.step,
            technique: out.technique,
            params: out.params,
            fallback: out.fallback,
        };
        state.set_output(
            &node,
            json!({
                "dataset": out.dataset,
                "applied": applied,
                "rows": out.dataset.n_rows(),
                "columns": out.dataset.n_cols(),
            }),
        );
        Ok(state)
    }
}

// ---------------------------------------------------------------------------
// SummarizeNode
// ---------------------------------------------------------------------------

/// Compares the raw dataset with the active path's final output and lists
/// the technique each step applied.
pub struct SummarizeNode {
    raw_source: String,
    chains: Vec<(LearningParadigm, Vec<String>)>,
}

impl SummarizeNode {
    pub fn new(raw_source: impl Into<String>, chains: Vec<(LearningParadigm, Vec<String>)>) -> Self {
        Self {
            raw_source: raw_source.into(),
            chains,
        }
    }
}

#[async_trait]
impl StepNode for SummarizeNode {
    fn kind(&self) -> &str {
        "summary"
    }

    async fn execute(&self, mut state: RunState) -> Result<RunState> {
        let node = executing(&state)?;
        let paradigm = state.learning_paradigm.unwrap_or(LearningParadigm::Supervised);
        let chain = self
            .chains
            .iter()
            .find(|(p, _)| *p == paradigm)
            .map(|(_, nodes)| nodes)
            .ok_or_else(|| node_error(&node, format!("no preprocessing path for {paradigm}")))?;
        let last = chain
            .last()
            .ok_or_else(|| node_error(&node, "empty preprocessing path"))?;

        let before = dataset_from(&state, &node, &self.raw_source)?;
        let after = dataset_from(&state, &node, last)?;

        let mut applied = Vec::with_capacity(chain.len());
        for step_node in chain {
            let raw = state
                .output(step_node)
                .and_then(|o| o.get("applied"))
                .ok_or_else(|| node_error(&node, format!("'{step_node}' has not run")))?;
            let technique: AppliedTechnique = serde_json::from_value(raw.clone())
                .map_err(|e| node_error(&node, format!("bad output from '{step_node}': {e}")))?;
            applied.push(technique);
        }

        let missing_after: BTreeMap<String, usize> = after
            .columns
            .iter()
            .filter(|c| c.missing() > 0)
            .map(|c| (c.name.clone(), c.missing()))
            .collect();
        if !missing_after.is_empty() {
            state.record_warning(
                Some(&node),
                "missing_values",
                format!("{} columns still have missing values", missing_after.len()),
            );
        }

        let summary = PreprocessingSummary {
            rows_before: before.n_rows(),
            rows_after: after.n_rows(),
            columns_before: before.n_cols(),
            columns_after: after.n_cols(),
            applied,
            missing_after,
        };
        tracing::info!(
            node = %node,
            rows_before = summary.rows_before,
            rows_after = summary.rows_after,
            columns_after = summary.columns_after,
            "Preprocessing summarized"
        );
        state.set_output(
            &node,
            json!({ "summary": to_json(&node, &summary)?, "dataset": after }),
        );
        state.summary = Some(summary);
        Ok(state)
    }
}
