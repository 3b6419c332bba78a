//! Review policy: rejection cap and review expiry.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happens to a review that has waited longer than `expiry_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryAction {
    /// Fail the run.
    #[default]
    Fail,
    /// Approve with every question's default technique.
    ApproveDefaults,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewPolicy {
    /// Maximum number of rejections across a run. `None` is unbounded.
    pub max_review_iterations: Option<u32>,
    /// Seconds a run may stay parked. `None` never expires.
    pub expiry_secs: Option<u64>,
    pub on_expiry: ExpiryAction,
}

impl ReviewPolicy {
    /// Whether one more rejection is allowed at the given iteration count.
    pub fn allows_rejection(&self, review_iteration: u32) -> bool {
        self.max_review_iterations
            .map_or(true, |limit| review_iteration < limit)
    }

    pub fn expiry(&self) -> Option<Duration> {
        self.expiry_secs.map(Duration::from_secs)
    }

    /// Whether a review parked at `awaiting_since` has expired at `now`.
    pub fn is_expired(&self, awaiting_since: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let Some(secs) = self.expiry_secs else {
            return false;
        };
        let waited = now.signed_duration_since(awaiting_since);
        waited.num_seconds() >= 0 && waited.num_seconds() as u64 >= secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_unbounded_and_never_expires() {
        let p = ReviewPolicy::default();
        assert!(p.allows_rejection(10_000));
        assert!(!p.is_expired(Utc::now() - chrono::Duration::days(365), Utc::now()));
        assert!(p.expiry().is_none());
    }

    #[test]
    fn rejection_cap() {
        let p = ReviewPolicy {
            max_review_iterations: Some(2),
            ..Default::default()
        };
        assert!(p.allows_rejection(0));
        assert!(p.allows_rejection(1));
        assert!(!p.allows_rejection(2));
    }

    #[test]
    fn expiry_boundary() {
        let p = ReviewPolicy {
            expiry_secs: Some(60),
            ..Default::default()
        };
        let since = Utc::now();
        assert!(!p.is_expired(since, since + chrono::Duration::seconds(59)));
        assert!(p.is_expired(since, since + chrono::Duration::seconds(60)));
    }

    #[test]
    fn parses_from_toml() {
        let p: ReviewPolicy = toml::from_str(
            "max_review_iterations = 3\nexpiry_secs = 600\non_expiry = \"approve_defaults\"",
        )
        .unwrap();
        assert_eq!(p.max_review_iterations, Some(3));
        assert_eq!(p.on_expiry, ExpiryAction::ApproveDefaults);
    }
}
