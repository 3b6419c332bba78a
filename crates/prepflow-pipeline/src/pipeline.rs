//! The preprocessing workflow: node names, routers, and graph assembly.
//!
//! ```text
//!            ┌─ analyze_prompt ─┐
//!  entry ────┤                  ├─ load_data ─ predict_category ─ generate_questions
//!            └─ load_config ────┘                                        │
//!                                                     [config_review] ───┤ paradigm
//!                  ┌─────────────────────────────────────────────────────┤
//!   supervised_clean → _impute → _encode → _scale ─┐                     │
//!   unsupervised_clean_outliers → _impute → _encode → _scale ─┴─ summarize_preprocessing
//!                                                 [preprocessing_review] ─ finalize
//! ```

use std::sync::Arc;

use prepflow_types::{LearningParadigm, PreprocessingStep, Result, RunState};

use crate::decision::DecisionService;
use crate::graph::{CheckpointSpec, GraphBuilder, GraphDefinition, Route, WorkflowGraph};
use crate::nodes::{
    AnalyzePromptNode, FinalizeNode, GenerateQuestionsNode, LoadConfigNode, LoadDataNode,
    PredictCategoryNode, PreprocessNode, SummarizeNode,
};
use crate::techniques::{StepPolicy, TechniqueRegistry};

pub const GRAPH_NAME: &str = "preprocessing";

pub const ANALYZE_PROMPT: &str = "analyze_prompt";
pub const LOAD_CONFIG: &str = "load_config";
pub const LOAD_DATA: &str = "load_data";
pub const PREDICT_CATEGORY: &str = "predict_category";
pub const GENERATE_QUESTIONS: &str = "generate_questions";
pub const SUPERVISED_CLEAN: &str = "supervised_clean";
pub const SUPERVISED_IMPUTE: &str = "supervised_impute";
pub const SUPERVISED_ENCODE: &str = "supervised_encode";
pub const SUPERVISED_SCALE: &str = "supervised_scale";
pub const UNSUPERVISED_CLEAN_OUTLIERS: &str = "unsupervised_clean_outliers";
pub const UNSUPERVISED_IMPUTE: &str = "unsupervised_impute";
pub const UNSUPERVISED_ENCODE: &str = "unsupervised_encode";
pub const UNSUPERVISED_SCALE: &str = "unsupervised_scale";
pub const SUMMARIZE: &str = "summarize_preprocessing";
pub const FINALIZE: &str = "finalize";

pub const CONFIG_REVIEW: &str = "config_review";
pub const PREPROCESSING_REVIEW: &str = "preprocessing_review";

/// Preprocessing steps each paradigm runs, in order.
pub fn paradigm_steps(paradigm: LearningParadigm) -> &'static [PreprocessingStep] {
    use PreprocessingStep::*;
    match paradigm {
        LearningParadigm::Supervised => &[Clean, Impute, Encode, Scale],
        LearningParadigm::Unsupervised => &[CleanOutliers, Impute, Encode, Scale],
    }
}

/// Node names of each paradigm's preprocessing chain, aligned with
/// [`paradigm_steps`].
pub fn paradigm_nodes(paradigm: LearningParadigm) -> &'static [&'static str] {
    match paradigm {
        LearningParadigm::Supervised => &[
            SUPERVISED_CLEAN,
            SUPERVISED_IMPUTE,
            SUPERVISED_ENCODE,
            SUPERVISED_SCALE,
        ],
        LearningParadigm::Unsupervised => &[
            UNSUPERVISED_CLEAN_OUTLIERS,
            UNSUPERVISED_IMPUTE,
            UNSUPERVISED_ENCODE,
            UNSUPERVISED_SCALE,
        ],
    }
}

// ---------------------------------------------------------------------------
// Routers
// ---------------------------------------------------------------------------

/// Prompt runs start with analysis; structured-config runs skip it.
pub fn select_entry(state: &RunState) -> String {
    if state.input.has_prompt() {
        ANALYZE_PROMPT.to_string()
    } else {
        LOAD_CONFIG.to_string()
    }
}

/// First preprocessing node of the active paradigm. An unset paradigm takes
/// the supervised path.
pub fn select_preprocessing_path(state: &RunState) -> String {
    let paradigm = state
        .learning_paradigm
        .unwrap_or(LearningParadigm::Supervised);
    paradigm_nodes(paradigm)[0].to_string()
}

/// A rejected config review is re-analyzed when there is text to analyze.
pub fn select_config_rewind(state: &RunState) -> String {
    if state.input.has_prompt() || state.review.latest_feedback().is_some() {
        ANALYZE_PROMPT.to_string()
    } else {
        LOAD_CONFIG.to_string()
    }
}

// ---------------------------------------------------------------------------
// Assembly
// ---------------------------------------------------------------------------

/// Collaborators shared by the built-in nodes.
#[derive(Clone)]
pub struct PipelineDeps {
    pub decision: Arc<dyn DecisionService>,
    pub registry: Arc<TechniqueRegistry>,
    /// Retries for the data-loading node.
    pub load_retries: usize,
}

/// Declarative definition of the preprocessing workflow.
pub fn preprocessing_definition(deps: &PipelineDeps) -> Result<GraphDefinition> {
    let mut b = GraphBuilder::new(GRAPH_NAME);

    b.register_node(ANALYZE_PROMPT, AnalyzePromptNode::new(deps.decision.clone()))?
        .register_node(LOAD_CONFIG, LoadConfigNode)?
        .register_retryable_node(LOAD_DATA, LoadDataNode, deps.load_retries)?
        .register_node(
            PREDICT_CATEGORY,
            PredictCategoryNode::new(deps.decision.clone(), LOAD_DATA),
        )?
        .register_node(
            GENERATE_QUESTIONS,
            GenerateQuestionsNode::new(deps.decision.clone(), deps.registry.clone(), LOAD_DATA),
        )?;

    let mut chains = Vec::new();
    for paradigm in [LearningParadigm::Supervised, LearningParadigm::Unsupervised] {
        let nodes = paradigm_nodes(paradigm);
        let mut source = LOAD_DATA;
        for (&name, &step) in nodes.iter().zip(paradigm_steps(paradigm)) {
            b.register_node(
                name,
                PreprocessNode::new(
                    source,
                    deps.registry.clone(),
                    StepPolicy::for_paradigm(paradigm, step),
                ),
            )?;
            if source != LOAD_DATA {
                b.add_edge(source, name);
            }
            source = name;
        }
        b.add_edge(source, SUMMARIZE);
        chains.push((paradigm, nodes.iter().map(|n| n.to_string()).collect()));
    }

    b.register_node(SUMMARIZE, SummarizeNode::new(LOAD_DATA, chains))?
        .register_node(FINALIZE, FinalizeNode::new(SUMMARIZE))?;

    let preprocessing_heads = [SUPERVISED_CLEAN, UNSUPERVISED_CLEAN_OUTLIERS];
    b.entry_point(&[ANALYZE_PROMPT, LOAD_CONFIG], select_entry)
        .add_edge(ANALYZE_PROMPT, LOAD_DATA)
        .add_edge(LOAD_CONFIG, LOAD_DATA)
        .add_edge(LOAD_DATA, PREDICT_CATEGORY)
        .add_edge(PREDICT_CATEGORY, GENERATE_QUESTIONS)
        .add_conditional_edge(GENERATE_QUESTIONS, &preprocessing_heads, select_preprocessing_path)
        .add_edge(SUMMARIZE, FINALIZE);

    b.checkpoint(CheckpointSpec {
        name: CONFIG_REVIEW.into(),
        after: GENERATE_QUESTIONS.into(),
        rewind: Route::conditional(&[ANALYZE_PROMPT, LOAD_CONFIG], select_config_rewind),
        stage: [ANALYZE_PROMPT, LOAD_CONFIG, PREDICT_CATEGORY, GENERATE_QUESTIONS]
            .iter()
            .map(|n| n.to_string())
            .collect(),
    });

    let mut preprocessing_stage: Vec<String> = [LearningParadigm::Supervised, LearningParadigm::Unsupervised]
        .iter()
        .flat_map(|&p| paradigm_nodes(p).iter().map(|n| n.to_string()))
        .collect();
    preprocessing_stage.push(SUMMARIZE.into());
    b.checkpoint(CheckpointSpec {
        name: PREPROCESSING_REVIEW.into(),
        after: SUMMARIZE.into(),
        rewind: Route::conditional(&preprocessing_heads, select_preprocessing_path),
        stage: preprocessing_stage,
    });

    Ok(b.into_definition())
}

/// Compiled preprocessing workflow.
pub fn preprocessing_graph(deps: &PipelineDeps) -> Result<WorkflowGraph> {
    preprocessing_definition(deps)?.compile()
}
