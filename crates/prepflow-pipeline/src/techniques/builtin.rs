//! Reference preprocessing techniques.
//!
//! Every technique is a pure `(Dataset, params) -> Dataset` function. The
//! `target_column` param, injected by the preprocessing node, is never
//! encoded, scaled, or imputed.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde_json::Value;

use prepflow_types::{Column, ColumnKind, Dataset, PreprocessingStep, PrepflowError, Result};

use super::{TechniqueRegistry, NONE};

/// Registry holding every reference technique, with the standard defaults.
pub fn builtin_registry() -> TechniqueRegistry {
    use PreprocessingStep::*;

    let mut reg = TechniqueRegistry::new();
    reg.register(Clean, "drop_duplicates", drop_duplicates)
        .register(Clean, "drop_empty_rows", drop_empty_rows)
        .register(Clean, NONE, identity)
        .register(CleanOutliers, "iqr_clip", iqr_clip)
        .register(CleanOutliers, "zscore_filter", zscore_filter)
        .register(CleanOutliers, NONE, identity)
        .register(Impute, "mean", impute_mean)
        .register(Impute, "median", impute_median)
        .register(Impute, "most_frequent", impute_most_frequent)
        .register(Impute, "constant", impute_constant)
        .register(Impute, "drop_rows", impute_drop_rows)
        .register(Encode, "one_hot", one_hot)
        .register(Encode, "label", label_encode)
        .register(Encode, "target", target_encode)
        .register(Encode, NONE, identity)
        .register(Scale, "standard", standard_scale)
        .register(Scale, "minmax", minmax_scale)
        .register(Scale, "robust", robust_scale)
        .register(Scale, NONE, identity);

    for (step, default) in [
        (Clean, "drop_duplicates"),
        (CleanOutliers, "iqr_clip"),
        (Impute, "mean"),
        (Encode, "one_hot"),
        (Scale, "standard"),
    ] {
        // Every default above is registered just before.
        if let Err(e) = reg.set_default(step, default) {
            tracing::error!(error = %e, "Built-in default missing");
        }
    }
    reg
}

fn identity(data: Dataset, _params: &Value) -> Result<Dataset> {
    Ok(data)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn target_column(params: &Value) -> Option<&str> {
    params.get("target_column").and_then(Value::as_str)
}

fn param_f64(params: &Value, key: &str, default: f64) -> f64 {
    params.get(key).and_then(Value::as_f64).unwrap_or(default)
}

/// Indices of non-target columns of the given kind.
fn feature_columns(data: &Dataset, params: &Value, kind: ColumnKind) -> Vec<usize> {
    let target = target_column(params);
    data.columns
        .iter()
        .enumerate()
        .filter(|(_, c)| Some(c.name.as_str()) != target && c.kind() == kind)
        .map(|(i, _)| i)
        .collect()
}

fn number(v: f64) -> Value {
    serde_json::Number::from_f64(v)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Label used for a categorical cell.
fn label(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn present(col: &Column) -> Vec<f64> {
    col.as_f64().into_iter().flatten().collect()
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

fn std_dev(values: &[f64], mean: f64) -> f64 {
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

/// Linear-interpolated quantile of an already sorted slice.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = (sorted.len() - 1) as f64 * q;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

fn sorted(mut values: Vec<f64>) -> Vec<f64> {
    values.sort_by(|a, b| a.total_cmp(b));
    values
}

/// Most frequent non-null value. Ties go to the value seen first.
fn mode(col: &Column) -> Option<Value> {
    let mut counts: Vec<(String, usize, &Value)> = Vec::new();
    for v in col.values.iter().filter(|v| !v.is_null()) {
        let key = v.to_string();
        match counts.iter_mut().find(|(k, _, _)| *k == key) {
            Some(entry) => entry.1 += 1,
            None => counts.push((key, 1, v)),
        }
    }
    let best = counts.iter().map(|(_, n, _)| *n).max()?;
    counts
        .into_iter()
        .find(|(_, n, _)| *n == best)
        .map(|(_, _, v)| v.clone())
}

fn map_numeric(col: &mut Column, f: impl Fn(f64) -> f64) {
    let nums = col.as_f64();
    for (cell, n) in col.values.iter_mut().zip(nums) {
        if let Some(x) = n {
            *cell = number(f(x));
        }
    }
}

fn fill_missing(col: &mut Column, fill: &Value) {
    for cell in col.values.iter_mut().filter(|v| v.is_null()) {
        *cell = fill.clone();
    }
}

// ---------------------------------------------------------------------------
// clean
// ---------------------------------------------------------------------------

fn drop_duplicates(mut data: Dataset, _params: &Value) -> Result<Dataset> {
    let mut seen = HashSet::new();
    let keep: Vec<bool> = (0..data.n_rows())
        .map(|i| {
            let key = Value::Array(data.row(i).into_iter().cloned().collect()).to_string();
            seen.insert(key)
        })
        .collect();
    data.retain_rows(&keep);
    Ok(data)
}

fn drop_empty_rows(mut data: Dataset, _params: &Value) -> Result<Dataset> {
    let keep: Vec<bool> = (0..data.n_rows())
        .map(|i| data.row(i).iter().any(|v| !v.is_null()))
        .collect();
    data.retain_rows(&keep);
    Ok(data)
}

// ---------------------------------------------------------------------------
// clean_outliers
// ---------------------------------------------------------------------------

/// Clip numeric features to `[q1 - factor*iqr, q3 + factor*iqr]`.
fn iqr_clip(mut data: Dataset, params: &Value) -> Result<Dataset> {
    let factor = param_f64(params, "factor", 1.5);
    for idx in feature_columns(&data, params, ColumnKind::Numeric) {
        let col = &mut data.columns[idx];
        let values = sorted(present(col));
        if values.len() < 2 {
            continue;
        }
        let q1 = quantile(&values, 0.25);
        let q3 = quantile(&values, 0.75);
        let iqr = q3 - q1;
        let (lo, hi) = (q1 - factor * iqr, q3 + factor * iqr);
        map_numeric(col, |x| x.clamp(lo, hi));
    }
    Ok(data)
}

/// Drop rows where any numeric feature has `|z| > threshold`.
fn zscore_filter(mut data: Dataset, params: &Value) -> Result<Dataset> {
    let threshold = param_f64(params, "threshold", 3.0);
    if threshold <= 0.0 {
        return Err(PrepflowError::Technique {
            technique: "zscore_filter".into(),
            message: format!("threshold must be positive, got {threshold}"),
        });
    }
    let mut keep = vec![true; data.n_rows()];
    for idx in feature_columns(&data, params, ColumnKind::Numeric) {
        let col = &data.columns[idx];
        let values = present(col);
        let Some(m) = mean(&values) else { continue };
        let sd = std_dev(&values, m);
        if sd == 0.0 {
            continue;
        }
        for (i, x) in col.as_f64().into_iter().enumerate() {
            if let Some(x) = x {
                if ((x - m) / sd).abs() > threshold {
                    keep[i] = false;
                }
            }
        }
    }
    data.retain_rows(&keep);
    Ok(data)
}

// ---------------------------------------------------------------------------
// impute
// ---------------------------------------------------------------------------

fn impute_with(
    mut data: Dataset,
    params: &Value,
    numeric_stat: impl Fn(Vec<f64>) -> Option<f64>,
) -> Result<Dataset> {
    let target = target_column(params).map(str::to_string);
    for col in data.columns.iter_mut() {
        if Some(&col.name) == target.as_ref() || col.missing() == 0 {
            continue;
        }
        let fill = match col.kind() {
            ColumnKind::Numeric => numeric_stat(present(col)).map(number),
            ColumnKind::Categorical => mode(col),
            ColumnKind::Empty => None,
        };
        if let Some(fill) = fill {
            fill_missing(col, &fill);
        }
    }
    Ok(data)
}

fn impute_mean(data: Dataset, params: &Value) -> Result<Dataset> {
    impute_with(data, params, |v| mean(&v))
}

fn impute_median(data: Dataset, params: &Value) -> Result<Dataset> {
    impute_with(data, params, |v| {
        if v.is_empty() {
            None
        } else {
            Some(quantile(&sorted(v), 0.5))
        }
    })
}

fn impute_most_frequent(mut data: Dataset, params: &Value) -> Result<Dataset> {
    let target = target_column(params).map(str::to_string);
    for col in data.columns.iter_mut() {
        if Some(&col.name) == target.as_ref() {
            continue;
        }
        if let Some(fill) = mode(col) {
            fill_missing(col, &fill);
        }
    }
    Ok(data)
}

/// Fill with `params.value`, or `0` / `"missing"` by column kind.
fn impute_constant(mut data: Dataset, params: &Value) -> Result<Dataset> {
    let target = target_column(params).map(str::to_string);
    let explicit = params.get("value").filter(|v| !v.is_null()).cloned();
    for col in data.columns.iter_mut() {
        if Some(&col.name) == target.as_ref() {
            continue;
        }
        let fill = match (&explicit, col.kind()) {
            (Some(v), _) => v.clone(),
            (None, ColumnKind::Categorical) => Value::String("missing".into()),
            (None, _) => Value::from(0),
        };
        fill_missing(col, &fill);
    }
    Ok(data)
}

fn impute_drop_rows(mut data: Dataset, _params: &Value) -> Result<Dataset> {
    let keep: Vec<bool> = (0..data.n_rows())
        .map(|i| data.row(i).iter().all(|v| !v.is_null()))
        .collect();
    data.retain_rows(&keep);
    Ok(data)
}

// ---------------------------------------------------------------------------
// encode
// ---------------------------------------------------------------------------

fn categories(col: &Column) -> Vec<String> {
    col.values
        .iter()
        .filter(|v| !v.is_null())
        .map(label)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Replace each categorical feature with one 0/1 column per category,
/// named `<column>_<category>`, at the original position.
fn one_hot(data: Dataset, params: &Value) -> Result<Dataset> {
    let encode: HashSet<usize> = feature_columns(&data, params, ColumnKind::Categorical)
        .into_iter()
        .collect();
    let mut columns = Vec::with_capacity(data.n_cols());
    for (idx, col) in data.columns.into_iter().enumerate() {
        if !encode.contains(&idx) {
            columns.push(col);
            continue;
        }
        for category in categories(&col) {
            let values = col
                .values
                .iter()
                .map(|v| Value::from(u8::from(!v.is_null() && label(v) == category)))
                .collect();
            columns.push(Column::new(format!("{}_{category}", col.name), values));
        }
    }
    Ok(Dataset { columns })
}

/// Map each category to its index in sorted order. Missing stays missing.
fn label_encode(mut data: Dataset, params: &Value) -> Result<Dataset> {
    for idx in feature_columns(&data, params, ColumnKind::Categorical) {
        let col = &mut data.columns[idx];
        let index: BTreeMap<String, usize> = categories(col)
            .into_iter()
            .enumerate()
            .map(|(i, c)| (c, i))
            .collect();
        for cell in col.values.iter_mut().filter(|v| !v.is_null()) {
            if let Some(i) = index.get(&label(cell)) {
                *cell = Value::from(*i);
            }
        }
    }
    Ok(data)
}

/// Replace each category with the mean target value observed for it.
/// Missing cells get the global target mean.
fn target_encode(mut data: Dataset, params: &Value) -> Result<Dataset> {
    let fail = |message: String| PrepflowError::Technique {
        technique: "target".into(),
        message,
    };
    let target_name = target_column(params)
        .ok_or_else(|| fail("target encoding requires a target column".into()))?;
    let target = data
        .column(target_name)
        .ok_or_else(|| fail(format!("target column '{target_name}' not found")))?;
    if !target.is_numeric() {
        return Err(fail(format!("target column '{target_name}' is not numeric")));
    }
    let y = target.as_f64();
    let global = mean(&y.iter().flatten().copied().collect::<Vec<_>>()).unwrap_or(0.0);

    for idx in feature_columns(&data, params, ColumnKind::Categorical) {
        let col = &mut data.columns[idx];
        let mut sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
        for (cell, yv) in col.values.iter().zip(&y) {
            if let (false, Some(yv)) = (cell.is_null(), yv) {
                let entry = sums.entry(label(cell)).or_insert((0.0, 0));
                entry.0 += yv;
                entry.1 += 1;
            }
        }
        for cell in col.values.iter_mut() {
            let encoded = if cell.is_null() {
                global
            } else {
                sums.get(&label(cell))
                    .map(|(s, n)| s / *n as f64)
                    .unwrap_or(global)
            };
            *cell = number(encoded);
        }
    }
    Ok(data)
}

// ---------------------------------------------------------------------------
// scale
// ---------------------------------------------------------------------------

/// `(x - mean) / std`; constant columns become 0.
fn standard_scale(mut data: Dataset, params: &Value) -> Result<Dataset> {
    for idx in feature_columns(&data, params, ColumnKind::Numeric) {
        let col = &mut data.columns[idx];
        let values = present(col);
        let Some(m) = mean(&values) else { continue };
        let sd = std_dev(&values, m);
        map_numeric(col, |x| if sd == 0.0 { 0.0 } else { (x - m) / sd });
    }
    Ok(data)
}

fn minmax_scale(mut data: Dataset, params: &Value) -> Result<Dataset> {
    for idx in feature_columns(&data, params, ColumnKind::Numeric) {
        let col = &mut data.columns[idx];
        let values = present(col);
        if values.is_empty() {
            continue;
        }
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let range = max - min;
        map_numeric(col, |x| if range == 0.0 { 0.0 } else { (x - min) / range });
    }
    Ok(data)
}

/// `(x - median) / iqr`; a zero IQR only centers.
fn robust_scale(mut data: Dataset, params: &Value) -> Result<Dataset> {
    for idx in feature_columns(&data, params, ColumnKind::Numeric) {
        let col = &mut data.columns[idx];
        let values = sorted(present(col));
        if values.is_empty() {
            continue;
        }
        let median = quantile(&values, 0.5);
        let iqr = quantile(&values, 0.75) - quantile(&values, 0.25);
        map_numeric(col, |x| {
            if iqr == 0.0 {
                x - median
            } else {
                (x - median) / iqr
            }
        });
    }
    Ok(data)
}
