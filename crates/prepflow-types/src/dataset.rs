//! Column-major tabular data passed between preprocessing steps.
//!
//! Cells are JSON values: numbers for numeric columns, strings for
//! categorical ones, `null` for a missing cell.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{PrepflowError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub columns: Vec<Column>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Numeric,
    Categorical,
    Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnProfile {
    pub name: String,
    pub kind: ColumnKind,
    pub missing: usize,
    pub distinct: usize,
}

/// Shape summary handed to the decision service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetProfile {
    pub rows: usize,
    pub columns: Vec<ColumnProfile>,
}

impl DatasetProfile {
    pub fn column(&self, name: &str) -> Option<&ColumnProfile> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_missing(&self) -> bool {
        self.columns.iter().any(|c| c.missing > 0)
    }

    pub fn has_categorical(&self) -> bool {
        self.columns.iter().any(|c| c.kind == ColumnKind::Categorical)
    }
}

impl Dataset {
    /// Build a dataset from a header row and row-major records.
    pub fn from_rows(headers: &[&str], rows: Vec<Vec<Value>>) -> Result<Self> {
        let mut columns: Vec<Column> = headers
            .iter()
            .map(|h| Column {
                name: (*h).to_string(),
                values: Vec::with_capacity(rows.len()),
            })
            .collect();
        for (i, row) in rows.into_iter().enumerate() {
            if row.len() != headers.len() {
                return Err(PrepflowError::Other(format!(
                    "row {i} has {} cells, expected {}",
                    row.len(),
                    headers.len()
                )));
            }
            for (col, cell) in columns.iter_mut().zip(row) {
                col.values.push(cell);
            }
        }
        Ok(Self { columns })
    }

    pub fn n_rows(&self) -> usize {
        self.columns.first().map_or(0, |c| c.values.len())
    }

    pub fn n_cols(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_mut(&mut self, name: &str) -> Option<&mut Column> {
        self.columns.iter_mut().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Row `i` as a vector of cells.
    pub fn row(&self, i: usize) -> Vec<&Value> {
        self.columns.iter().map(|c| &c.values[i]).collect()
    }

    /// Keep only rows where `keep[i]` is true.
    pub fn retain_rows(&mut self, keep: &[bool]) {
        for col in &mut self.columns {
            let mut idx = 0;
            col.values.retain(|_| {
                let k = keep.get(idx).copied().unwrap_or(true);
                idx += 1;
                k
            });
        }
    }

    /// Check that every column has the same number of rows.
    pub fn validate(&self) -> Result<()> {
        let rows = self.n_rows();
        if let Some(bad) = self.columns.iter().find(|c| c.values.len() != rows) {
            return Err(PrepflowError::Other(format!(
                "column '{}' has {} values, expected {rows}",
                bad.name,
                bad.values.len()
            )));
        }
        Ok(())
    }

    pub fn profile(&self) -> DatasetProfile {
        DatasetProfile {
            rows: self.n_rows(),
            columns: self.columns.iter().map(Column::profile).collect(),
        }
    }
}

impl Column {
    pub fn new(name: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    pub fn kind(&self) -> ColumnKind {
        let mut seen = false;
        for v in &self.values {
            match v {
                Value::Null => {}
                Value::Number(_) | Value::Bool(_) => seen = true,
                _ => return ColumnKind::Categorical,
            }
        }
        if seen {
            ColumnKind::Numeric
        } else {
            ColumnKind::Empty
        }
    }

    pub fn is_numeric(&self) -> bool {
        self.kind() == ColumnKind::Numeric
    }

    pub fn missing(&self) -> usize {
        self.values.iter().filter(|v| v.is_null()).count()
    }

    /// Numeric view of the column; non-numeric or missing cells are `None`.
    pub fn as_f64(&self) -> Vec<Option<f64>> {
        self.values
            .iter()
            .map(|v| match v {
                Value::Number(n) => n.as_f64(),
                Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
                _ => None,
            })
            .collect()
    }

    pub fn profile(&self) -> ColumnProfile {
        let mut distinct: Vec<String> = self
            .values
            .iter()
            .filter(|v| !v.is_null())
            .map(|v| v.to_string())
            .collect();
        distinct.sort();
        distinct.dedup();
        ColumnProfile {
            name: self.name.clone(),
            kind: self.kind(),
            missing: self.missing(),
            distinct: distinct.len(),
        }
    }
}
