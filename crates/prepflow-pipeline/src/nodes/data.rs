//! Dataset loading and the terminal node.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use prepflow_types::{Column, Dataset, Result, RunState};

use super::{dataset_from, executing, node_error};
use crate::handler::StepNode;

// ---------------------------------------------------------------------------
// LoadDataNode
// ---------------------------------------------------------------------------

/// Loads the run's dataset, inline or from a JSON file.
///
/// A file holds either the column-major form (`{"columns": [...]}`) or an
/// array of row objects. Read failures are I/O errors and therefore
/// retryable when the node is registered with retries.
pub struct LoadDataNode;

/// Parse either supported JSON layout into a dataset.
pub fn parse_dataset(value: Value) -> std::result::Result<Dataset, String> {
    if value.get("columns").is_some() {
        return serde_json::from_value(value).map_err(|e| format!("invalid column layout: {e}"));
    }
    match value {
        Value::Array(rows) => {
            let mut headers: Vec<String> = Vec::new();
            let mut records: Vec<Map<String, Value>> = Vec::with_capacity(rows.len());
            for (i, row) in rows.into_iter().enumerate() {
                let Value::Object(record) = row else {
                    return Err(format!("row {i} is not an object"));
                };
                for key in record.keys() {
                    if !headers.contains(key) {
                        headers.push(key.clone());
                    }
                }
                records.push(record);
            }
            let columns = headers
                .into_iter()
                .map(|name| {
                    let values = records
                        .iter()
                        .map(|r| r.get(&name).cloned().unwrap_or(Value::Null))
                        .collect();
                    Column::new(name, values)
                })
                .collect();
            Ok(Dataset { columns })
        }
        _ => Err("expected an object with \"columns\" or an array of row objects".into()),
    }
}

#[async_trait]
impl StepNode for LoadDataNode {
    fn kind(&self) -> &str {
        "data"
    }

    async fn execute(&self, mut state: RunState) -> Result<RunState> {
        let node = executing(&state)?;
        let dataset = match (&state.input.dataset, &state.input.dataset_path) {
            (Some(inline), _) => inline.clone(),
            (None, Some(path)) => {
                let raw = tokio::fs::read_to_string(path).await?;
                let value: Value = serde_json::from_str(&raw)
                    .map_err(|e| node_error(&node, format!("{}: {e}", path.display())))?;
                parse_dataset(value)
                    .map_err(|e| node_error(&node, format!("{}: {e}", path.display())))?
            }
            (None, None) => return Err(node_error(&node, "run has no dataset")),
        };
        dataset
            .validate()
            .map_err(|e| node_error(&node, e.to_string()))?;
        if dataset.n_cols() == 0 || dataset.n_rows() == 0 {
            return Err(node_error(&node, "dataset is empty"));
        }

        let profile = dataset.profile();
        tracing::info!(node = %node, rows = profile.rows, columns = profile.columns.len(), "Dataset loaded");
        state.set_output(&node, json!({ "dataset": dataset, "profile": profile }));
        Ok(state)
    }
}

// ---------------------------------------------------------------------------
// FinalizeNode
// ---------------------------------------------------------------------------

/// Terminal node: records the shape of the prepared dataset.
pub struct FinalizeNode {
    source: String,
}

impl FinalizeNode {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

#[async_trait]
impl StepNode for FinalizeNode {
    fn kind(&self) -> &str {
        "finalize"
    }

    async fn execute(&self, mut state: RunState) -> Result<RunState> {
        let node = executing(&state)?;
        let dataset = dataset_from(&state, &node, &self.source)?;
        let output = json!({
            "rows": dataset.n_rows(),
            "columns": dataset.column_names(),
            "learning_paradigm": state.learning_paradigm,
            "algorithm_category": state.prediction.as_ref().map(|p| p.algorithm_category.clone()),
            "review_iterations": state.review_iteration,
        });
        state.set_output(&node, output);
        Ok(state)
    }
}
