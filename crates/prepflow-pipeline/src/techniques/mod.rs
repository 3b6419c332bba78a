//! Technique registry and dispatch.
//!
//! A [`TechniqueRegistry`] maps `(step, technique name)` to a pure transform
//! over a [`Dataset`]. It is built once at process start and shared by
//! reference with the preprocessing nodes. [`StepPolicy`] carries the
//! per-paradigm business rules (default, forbidden, mandatory) and
//! [`dispatch_with_fallback`] applies them.

pub mod builtin;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;

use prepflow_types::{
    Dataset, LearningParadigm, PreprocessingStep, PrepflowError, Result, TechniqueChoice,
};

pub use builtin::builtin_registry;

/// Name of the identity technique.
pub const NONE: &str = "none";

/// A named transform: `(data, params) -> data`.
pub type TechniqueFn = Arc<dyn Fn(Dataset, &Value) -> Result<Dataset> + Send + Sync>;

// ---------------------------------------------------------------------------
// TechniqueRegistry
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct StepTable {
    techniques: BTreeMap<String, TechniqueFn>,
    default: Option<String>,
}

#[derive(Clone, Default)]
pub struct TechniqueRegistry {
    tables: HashMap<PreprocessingStep, StepTable>,
}

impl TechniqueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a technique for a step.
    pub fn register<F>(&mut self, step: PreprocessingStep, name: &str, f: F) -> &mut Self
    where
        F: Fn(Dataset, &Value) -> Result<Dataset> + Send + Sync + 'static,
    {
        self.tables
            .entry(step)
            .or_default()
            .techniques
            .insert(name.to_string(), Arc::new(f));
        self
    }

    /// Declare the default technique of a step. It must already be registered.
    pub fn set_default(&mut self, step: PreprocessingStep, name: &str) -> Result<&mut Self> {
        if !self.has(step, name) {
            return Err(unknown(step, name));
        }
        if let Some(table) = self.tables.get_mut(&step) {
            table.default = Some(name.to_string());
        }
        Ok(self)
    }

    pub fn default_for(&self, step: PreprocessingStep) -> Option<&str> {
        self.tables.get(&step).and_then(|t| t.default.as_deref())
    }

    pub fn has(&self, step: PreprocessingStep, name: &str) -> bool {
        self.tables
            .get(&step)
            .is_some_and(|t| t.techniques.contains_key(name))
    }

    /// Registered technique names for a step, sorted.
    pub fn techniques(&self, step: PreprocessingStep) -> Vec<&str> {
        self.tables
            .get(&step)
            .map(|t| t.techniques.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Look up and invoke a technique.
    pub fn dispatch(
        &self,
        step: PreprocessingStep,
        name: &str,
        params: &Value,
        data: Dataset,
    ) -> Result<Dataset> {
        let f = self
            .tables
            .get(&step)
            .and_then(|t| t.techniques.get(name))
            .ok_or_else(|| unknown(step, name))?;
        f(data, params)
    }
}

impl std::fmt::Debug for TechniqueRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for step in PreprocessingStep::ALL {
            if self.tables.contains_key(&step) {
                map.entry(&step.as_str(), &self.techniques(step));
            }
        }
        map.finish()
    }
}

fn unknown(step: PreprocessingStep, name: &str) -> PrepflowError {
    PrepflowError::UnknownTechnique {
        step: step.to_string(),
        technique: name.to_string(),
    }
}

// ---------------------------------------------------------------------------
// StepPolicy
// ---------------------------------------------------------------------------

/// Business rules for one preprocessing node.
#[derive(Debug, Clone, PartialEq)]
pub struct StepPolicy {
    pub step: PreprocessingStep,
    pub default: String,
    pub forbidden: Vec<String>,
    /// A mandatory step may not be skipped with [`NONE`].
    pub mandatory: bool,
}

impl StepPolicy {
    pub fn new(step: PreprocessingStep, default: &str) -> Self {
        Self {
            step,
            default: default.to_string(),
            forbidden: Vec::new(),
            mandatory: false,
        }
    }

    pub fn forbid(mut self, name: &str) -> Self {
        self.forbidden.push(name.to_string());
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    /// The rules each paradigm applies to a step.
    ///
    /// Unsupervised runs have no target, so target encoding is forbidden, and
    /// distance-based models need scaled features, so scaling is mandatory.
    pub fn for_paradigm(paradigm: LearningParadigm, step: PreprocessingStep) -> Self {
        use LearningParadigm::*;
        use PreprocessingStep::*;
        match (paradigm, step) {
            (_, Clean) => StepPolicy::new(Clean, "drop_duplicates"),
            (_, CleanOutliers) => StepPolicy::new(CleanOutliers, "iqr_clip"),
            (_, Impute) => StepPolicy::new(Impute, "mean"),
            (Supervised, Encode) => StepPolicy::new(Encode, "one_hot"),
            (Unsupervised, Encode) => StepPolicy::new(Encode, "one_hot").forbid("target"),
            (Supervised, Scale) => StepPolicy::new(Scale, "standard"),
            (Unsupervised, Scale) => StepPolicy::new(Scale, "standard").mandatory(),
        }
    }

    pub fn permits(&self, name: &str) -> bool {
        !self.forbidden.iter().any(|f| f == name) && !(self.mandatory && name == NONE)
    }

    /// Filter reviewer-facing options down to what this policy allows.
    pub fn allowed_options<'a>(&self, options: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        options
            .into_iter()
            .filter(|o| self.permits(o))
            .map(String::from)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Dispatch with fallback
// ---------------------------------------------------------------------------

/// Result of [`dispatch_with_fallback`].
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub dataset: Dataset,
    pub technique: String,
    pub params: Value,
    /// `true` when the requested technique was replaced by the default.
    pub fallback: bool,
    pub warnings: Vec<String>,
}

/// Run the requested technique, falling back to the policy default when the
/// request is forbidden, unregistered, or fails. Only a failing default is
/// returned as an error.
///
/// `context` entries (such as `target_column`) are merged into the params
/// without overriding reviewer-supplied keys.
pub fn dispatch_with_fallback(
    registry: &TechniqueRegistry,
    policy: &StepPolicy,
    requested: Option<&TechniqueChoice>,
    context: &Value,
    data: Dataset,
) -> Result<Dispatched> {
    let step = policy.step;
    let mut warnings = Vec::new();

    let (name, params) = match requested {
        Some(choice) if policy.permits(&choice.technique_name) => {
            (choice.technique_name.clone(), choice.technique_params.clone())
        }
        Some(choice) => {
            warnings.push(format!(
                "technique '{}' is not allowed for step '{step}' on this path, using '{}'",
                choice.technique_name, policy.default
            ));
            (policy.default.clone(), Value::Null)
        }
        None => (policy.default.clone(), Value::Null),
    };
    let mut fallback = !warnings.is_empty();

    if name != policy.default {
        let merged = merge_params(&params, context);
        match registry.dispatch(step, &name, &merged, data.clone()) {
            Ok(dataset) => {
                return Ok(Dispatched {
                    dataset,
                    technique: name,
                    params: merged,
                    fallback,
                    warnings,
                })
            }
            Err(e) => {
                tracing::warn!(step = %step, technique = %name, error = %e, "Falling back to default technique");
                warnings.push(format!("{e}; using default '{}'", policy.default));
                fallback = true;
            }
        }
    }

    let params = if fallback { Value::Null } else { params };
    let merged = merge_params(&params, context);
    let dataset = registry.dispatch(step, &policy.default, &merged, data)?;
    Ok(Dispatched {
        dataset,
        technique: policy.default.clone(),
        params: merged,
        fallback,
        warnings,
    })
}

fn merge_params(params: &Value, context: &Value) -> Value {
    let mut merged = match params {
        Value::Object(map) => map.clone(),
        Value::Null => serde_json::Map::new(),
        other => {
            let mut m = serde_json::Map::new();
            m.insert("value".into(), other.clone());
            m
        }
    };
    if let Value::Object(ctx) = context {
        for (k, v) in ctx {
            merged.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
    Value::Object(merged)
}
