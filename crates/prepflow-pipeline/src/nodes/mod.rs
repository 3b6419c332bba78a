//! Built-in step nodes of the preprocessing workflow.
//!
//! Each node reads what it needs from the run state, does one unit of work,
//! and records its payload under its own name in `node_outputs`. The engine
//! sets `current_node` to the executing node before calling it, which is how
//! a node learns the name it was registered under.

pub mod agent;
pub mod data;
pub mod preprocess;

use serde::Serialize;
use serde_json::Value;

use prepflow_types::{Dataset, DatasetProfile, PrepflowError, Result, RunState};

pub use agent::{AnalyzePromptNode, GenerateQuestionsNode, LoadConfigNode, PredictCategoryNode};
pub use data::{FinalizeNode, LoadDataNode};
pub use preprocess::{PreprocessNode, SummarizeNode};

/// Name of the node being executed.
pub(crate) fn executing(state: &RunState) -> Result<String> {
    state
        .current_node
        .clone()
        .ok_or_else(|| PrepflowError::NodeContract {
            node: "<unknown>".into(),
            message: "node executed without current_node set".into(),
        })
}

pub(crate) fn node_error(node: &str, message: impl Into<String>) -> PrepflowError {
    PrepflowError::NodeExecution {
        node: node.to_string(),
        message: message.into(),
        retryable: false,
    }
}

pub(crate) fn to_json(node: &str, value: &impl Serialize) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| node_error(node, format!("cannot encode output: {e}")))
}

/// The dataset another node recorded under `"dataset"` in its output.
pub(crate) fn dataset_from(state: &RunState, node: &str, source: &str) -> Result<Dataset> {
    let raw = state
        .output(source)
        .and_then(|o| o.get("dataset"))
        .ok_or_else(|| node_error(node, format!("no dataset output from '{source}'")))?;
    serde_json::from_value(raw.clone())
        .map_err(|e| node_error(node, format!("dataset output of '{source}' is malformed: {e}")))
}

pub(crate) fn profile_from(state: &RunState, node: &str, source: &str) -> Result<DatasetProfile> {
    match state.output(source).and_then(|o| o.get("profile")) {
        Some(raw) => serde_json::from_value(raw.clone())
            .map_err(|e| node_error(node, format!("profile output of '{source}' is malformed: {e}"))),
        None => Ok(dataset_from(state, node, source)?.profile()),
    }
}
