//! Engine configuration, loaded from TOML.
//!
//! ```toml
//! store_dir = ".prepflow/runs"
//! max_steps = 200
//! decision_retries = 2
//!
//! [retry_backoff]
//! kind = "exponential"
//! base_ms = 500
//! max_ms = 30000
//!
//! [review]
//! max_review_iterations = 5
//! expiry_secs = 86400
//! on_expiry = "fail"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use prepflow_types::{PrepflowError, Result};

use crate::policy::ReviewPolicy;
use crate::retry::BackoffPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding the SQLite run store (`runs.db`).
    pub store_dir: PathBuf,
    /// Node executions allowed per run-loop invocation.
    pub max_steps: usize,
    /// Backoff between retries of retryable nodes and decision-service calls.
    pub retry_backoff: BackoffPolicy,
    /// Retries for transient decision-service failures.
    pub decision_retries: usize,
    /// Retries for the data-loading node.
    pub load_retries: usize,
    pub review: ReviewPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from(".prepflow/runs"),
            max_steps: 200,
            retry_backoff: BackoffPolicy::default(),
            decision_retries: 2,
            load_retries: 1,
            review: ReviewPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| PrepflowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            PrepflowError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Load `path` if given, else defaults.
    pub async fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p).await,
            None => Ok(Self::default()),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            return Err(PrepflowError::Config("max_steps must be at least 1".into()));
        }
        if self.review.max_review_iterations == Some(0) {
            tracing::warn!("max_review_iterations = 0, every rejection will fail its run");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ExpiryAction;

    #[test]
    fn empty_toml_gives_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.max_steps, 200);
    }

    #[test]
    fn partial_toml_overrides_fields() {
        let config = EngineConfig::from_toml_str(
            r#"
store_dir = "/tmp/runs"
decision_retries = 0

[retry_backoff]
kind = "none"

[review]
expiry_secs = 30
on_expiry = "approve_defaults"
"#,
        )
        .unwrap();
        assert_eq!(config.store_dir, PathBuf::from("/tmp/runs"));
        assert_eq!(config.decision_retries, 0);
        assert_eq!(config.retry_backoff, BackoffPolicy::None);
        assert_eq!(config.review.expiry_secs, Some(30));
        assert_eq!(config.review.on_expiry, ExpiryAction::ApproveDefaults);
        assert_eq!(config.max_steps, 200);
    }

    #[test]
    fn zero_max_steps_is_rejected() {
        let err = EngineConfig::from_toml_str("max_steps = 0").unwrap_err();
        assert!(matches!(err, PrepflowError::Config(_)));
    }

    #[test]
    fn unknown_backoff_kind_is_a_config_error() {
        let err = EngineConfig::from_toml_str("[retry_backoff]\nkind = \"jitter\"").unwrap_err();
        assert!(matches!(err, PrepflowError::Config(_)));
    }

    #[tokio::test]
    async fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prepflow.toml");
        tokio::fs::write(&path, "max_steps = 12").await.unwrap();
        let config = EngineConfig::load_or_default(Some(&path)).await.unwrap();
        assert_eq!(config.max_steps, 12);
    }
}
