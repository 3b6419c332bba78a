//! Review checkpoints: applying reviewer decisions to a parked run.
//!
//! Parking happens in the run loop when a checkpoint's bound node completes.
//! The [`CheckpointController`] handles the other half: it validates a
//! [`ReviewDecision`] against the parked record, merges answers, and moves the
//! run either forward (approve) or back to the checkpoint's rewind target
//! (reject). It never touches the store; the caller persists the returned
//! state with a compare-and-swap save.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use prepflow_types::{
    DecisionRecord, PrepflowError, Result, ReviewAnswer, ReviewDecision, RunState, RunStatus,
};

use crate::graph::{CheckpointSpec, WorkflowGraph};
use crate::policy::{ExpiryAction, ReviewPolicy};

/// What a decision did to the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewOutcome {
    /// Approved; execution continues at `next`.
    Resumed { next: String },
    /// Approved after the graph's last node; the run is complete.
    Completed,
    /// Rejected; execution restarts at `target`.
    Rewound { target: String },
    /// The decision ended the run (review limit, expiry, or a routing error).
    Failed,
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub checkpoint: String,
    pub approved: bool,
    pub outcome: ReviewOutcome,
    pub state: RunState,
}

impl Transition {
    /// Whether the run loop should pick the run up again.
    pub fn needs_execution(&self) -> bool {
        self.state.status == RunStatus::Running
    }
}

pub struct CheckpointController {
    graph: Arc<WorkflowGraph>,
    policy: ReviewPolicy,
}

impl CheckpointController {
    pub fn new(graph: Arc<WorkflowGraph>, policy: ReviewPolicy) -> Self {
        Self { graph, policy }
    }

    pub fn policy(&self) -> &ReviewPolicy {
        &self.policy
    }

    /// Apply a reviewer decision to a parked run.
    ///
    /// Client errors (`InvalidTransition`, `InvalidDecision`) are returned
    /// before the state is touched.
    pub fn apply_decision(&self, state: RunState, decision: &ReviewDecision) -> Result<Transition> {
        self.apply(state, decision, false)
    }

    /// If the run has waited past the policy's expiry, apply the configured
    /// expiry action. Returns `None` when nothing is due.
    pub fn expire(&self, mut state: RunState, now: DateTime<Utc>) -> Result<Option<Transition>> {
        if state.status != RunStatus::AwaitingReview {
            return Ok(None);
        }
        let Some(since) = state.review.awaiting_since else {
            return Ok(None);
        };
        if !self.policy.is_expired(since, now) {
            return Ok(None);
        }
        let cp = self.parked_at(&state)?.clone();
        let waited_secs = now.signed_duration_since(since).num_seconds();
        tracing::warn!(
            run_id = %state.run_id,
            checkpoint = %cp.name,
            waited_secs,
            action = ?self.policy.on_expiry,
            "Review expired"
        );

        match self.policy.on_expiry {
            ExpiryAction::ApproveDefaults => {
                let decision = defaults_decision(&state);
                self.apply(state, &decision, true).map(Some)
            }
            ExpiryAction::Fail => {
                let err = PrepflowError::ReviewExpired {
                    checkpoint: cp.name.clone(),
                    waited_secs,
                };
                state.review.decisions.push(DecisionRecord {
                    checkpoint: cp.name.clone(),
                    approved: false,
                    iteration: state.review_iteration,
                    feedback: None,
                    automatic: true,
                    timestamp: now,
                });
                fail_at(&mut state, &cp, &err);
                Ok(Some(Transition {
                    checkpoint: cp.name,
                    approved: false,
                    outcome: ReviewOutcome::Failed,
                    state,
                }))
            }
        }
    }

    fn apply(
        &self,
        mut state: RunState,
        decision: &ReviewDecision,
        automatic: bool,
    ) -> Result<Transition> {
        if state.status != RunStatus::AwaitingReview {
            return Err(PrepflowError::InvalidTransition {
                run_id: state.run_id.clone(),
                status: state.status,
                action: "submit a decision for".into(),
            });
        }
        let cp = self.parked_at(&state)?.clone();
        let choices = validate_answers(&state, &decision.answers)?;

        for (question_id, choice) in choices {
            state.review_answers.insert(question_id, choice);
        }
        let feedback = decision
            .user_feedback
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(String::from);
        if let Some(text) = &feedback {
            state.review.feedback_history.push(text.clone());
        }
        state.review.decisions.push(DecisionRecord {
            checkpoint: cp.name.clone(),
            approved: decision.approved,
            iteration: state.review_iteration,
            feedback,
            automatic,
            timestamp: Utc::now(),
        });
        state.review.pending_checkpoint = None;
        state.review.awaiting_since = None;

        let outcome = if decision.approved {
            self.resume(&mut state, &cp)
        } else {
            self.rewind(&mut state, &cp)
        };
        tracing::info!(
            run_id = %state.run_id,
            checkpoint = %cp.name,
            approved = decision.approved,
            review_iteration = state.review_iteration,
            outcome = ?outcome,
            "Review decision applied"
        );
        Ok(Transition {
            checkpoint: cp.name,
            approved: decision.approved,
            outcome,
            state,
        })
    }

    fn resume(&self, state: &mut RunState, cp: &CheckpointSpec) -> ReviewOutcome {
        match self.graph.next_node(&cp.after, state) {
            Ok(Some(next)) => {
                state.status = RunStatus::Running;
                state.current_node = Some(next.clone());
                ReviewOutcome::Resumed { next }
            }
            Ok(None) => {
                state.status = RunStatus::Completed;
                ReviewOutcome::Completed
            }
            Err(err) => {
                fail_at(state, cp, &err);
                ReviewOutcome::Failed
            }
        }
    }

    fn rewind(&self, state: &mut RunState, cp: &CheckpointSpec) -> ReviewOutcome {
        if !self.policy.allows_rejection(state.review_iteration) {
            let err = PrepflowError::ReviewLimitExceeded {
                checkpoint: cp.name.clone(),
                iterations: state.review_iteration + 1,
                limit: self.policy.max_review_iterations.unwrap_or_default(),
            };
            fail_at(state, cp, &err);
            return ReviewOutcome::Failed;
        }
        state.review_iteration += 1;
        state.discard_stage(&cp.stage);
        match cp.rewind.resolve(&cp.name, state) {
            Ok(target) => {
                state.status = RunStatus::Running;
                state.current_node = Some(target.clone());
                ReviewOutcome::Rewound { target }
            }
            Err(err) => {
                fail_at(state, cp, &err);
                ReviewOutcome::Failed
            }
        }
    }

    fn parked_at<'a>(&'a self, state: &RunState) -> Result<&'a CheckpointSpec> {
        let name = state.review.pending_checkpoint.as_deref().ok_or_else(|| {
            PrepflowError::Other(format!(
                "run '{}' is awaiting review without a pending checkpoint",
                state.run_id
            ))
        })?;
        self.graph.checkpoint(name).ok_or_else(|| {
            PrepflowError::Other(format!("checkpoint '{name}' is not part of this graph"))
        })
    }
}

fn fail_at(state: &mut RunState, cp: &CheckpointSpec, err: &PrepflowError) {
    state.review.pending_checkpoint = None;
    state.review.awaiting_since = None;
    state.status = RunStatus::Failed;
    state.current_node = Some(cp.after.clone());
    state.record_error(Some(&cp.after), err);
}

/// Check every answer against the generated questions and resolve it to a
/// technique choice.
fn validate_answers(
    state: &RunState,
    answers: &[ReviewAnswer],
) -> Result<Vec<(String, prepflow_types::TechniqueChoice)>> {
    let mut choices = Vec::with_capacity(answers.len());
    for answer in answers {
        if !state.questions.is_empty() && !state.questions.iter().any(|q| q.id == answer.question_id)
        {
            return Err(PrepflowError::InvalidDecision(format!(
                "unknown question_id '{}'",
                answer.question_id
            )));
        }
        let choice = answer.to_choice().ok_or_else(|| {
            PrepflowError::InvalidDecision(format!(
                "answer to '{}' names no technique",
                answer.question_id
            ))
        })?;
        choices.push((answer.question_id.clone(), choice));
    }
    Ok(choices)
}

/// Approval that accepts every generated question's default technique.
fn defaults_decision(state: &RunState) -> ReviewDecision {
    ReviewDecision {
        approved: true,
        answers: state
            .questions
            .iter()
            .filter(|q| !state.review_answers.contains_key(&q.id))
            .map(|q| ReviewAnswer {
                question_id: q.id.clone(),
                answer: q.default.clone(),
                technique_name: None,
                technique_params: None,
            })
            .collect(),
        user_feedback: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphBuilder, Route};
    use crate::handler::PassThroughNode;
    use prepflow_types::{PreprocessingStep, ReviewQuestion, RunInput};
    use serde_json::json;

    fn graph() -> Arc<WorkflowGraph> {
        let mut b = GraphBuilder::new("g");
        for n in ["analyze", "questions", "work", "done"] {
            b.register_node(n, PassThroughNode).unwrap();
        }
        b.fixed_entry("analyze")
            .add_edge("analyze", "questions")
            .add_edge("questions", "work")
            .add_edge("work", "done")
            .checkpoint(CheckpointSpec {
                name: "config_review".into(),
                after: "questions".into(),
                rewind: Route::Next("analyze".into()),
                stage: vec!["analyze".into(), "questions".into()],
            })
            .checkpoint(CheckpointSpec {
                name: "final_review".into(),
                after: "done".into(),
                rewind: Route::Next("work".into()),
                stage: vec!["work".into(), "done".into()],
            });
        Arc::new(b.build().unwrap())
    }

    fn parked(checkpoint: &str, after: &str) -> RunState {
        let mut s = RunState::new(RunInput::default());
        s.status = RunStatus::AwaitingReview;
        s.current_node = Some(after.into());
        s.review.pending_checkpoint = Some(checkpoint.into());
        s.review.awaiting_since = Some(Utc::now());
        for n in ["analyze", "questions"] {
            s.set_output(n, json!({"ok": true}));
            s.mark_completed(n);
        }
        s.questions.push(ReviewQuestion {
            id: "q_scale".into(),
            step: PreprocessingStep::Scale,
            prompt: "How should features be scaled?".into(),
            options: vec!["standard".into(), "minmax".into()],
            default: "standard".into(),
        });
        s
    }

    fn controller(policy: ReviewPolicy) -> CheckpointController {
        CheckpointController::new(graph(), policy)
    }

    fn answer(qid: &str, technique: &str) -> ReviewAnswer {
        ReviewAnswer {
            question_id: qid.into(),
            answer: String::new(),
            technique_name: Some(technique.into()),
            technique_params: None,
        }
    }

    #[test]
    fn approve_merges_answers_and_resumes() {
        let ctl = controller(ReviewPolicy::default());
        let decision = ReviewDecision::approve().with_answer(answer("q_scale", "minmax"));
        let t = ctl
            .apply_decision(parked("config_review", "questions"), &decision)
            .unwrap();

        assert_eq!(t.outcome, ReviewOutcome::Resumed { next: "work".into() });
        assert!(t.needs_execution());
        assert_eq!(t.state.current_node.as_deref(), Some("work"));
        assert_eq!(t.state.answer_for("q_scale").unwrap().technique_name, "minmax");
        assert!(t.state.review.pending_checkpoint.is_none());
        assert_eq!(t.state.review.decisions.len(), 1);
        assert_eq!(t.state.review_iteration, 0);
    }

    #[test]
    fn approve_at_terminal_node_completes() {
        let ctl = controller(ReviewPolicy::default());
        let t = ctl
            .apply_decision(parked("final_review", "done"), &ReviewDecision::approve())
            .unwrap();
        assert_eq!(t.outcome, ReviewOutcome::Completed);
        assert_eq!(t.state.status, RunStatus::Completed);
        assert!(!t.needs_execution());
    }

    #[test]
    fn reject_rewinds_and_discards_stage() {
        let ctl = controller(ReviewPolicy::default());
        let t = ctl
            .apply_decision(
                parked("config_review", "questions"),
                &ReviewDecision::reject("target is churned"),
            )
            .unwrap();

        assert_eq!(t.outcome, ReviewOutcome::Rewound { target: "analyze".into() });
        assert_eq!(t.state.review_iteration, 1);
        assert!(t.state.output("analyze").is_none());
        assert!(t.state.output("questions").is_none());
        assert!(t.state.completed_nodes.is_empty());
        assert_eq!(t.state.review.latest_feedback(), Some("target is churned"));
        assert_eq!(t.state.status, RunStatus::Running);
    }

    #[test]
    fn decision_on_running_run_is_invalid_transition() {
        let ctl = controller(ReviewPolicy::default());
        let mut state = parked("config_review", "questions");
        state.status = RunStatus::Running;
        let before = state.clone();
        let err = ctl
            .apply_decision(state, &ReviewDecision::approve())
            .unwrap_err();
        assert!(matches!(err, PrepflowError::InvalidTransition { .. }));
        assert_eq!(before.status, RunStatus::Running);
    }

    #[test]
    fn unknown_question_is_rejected() {
        let ctl = controller(ReviewPolicy::default());
        let decision = ReviewDecision::approve().with_answer(answer("q_nope", "minmax"));
        let err = ctl
            .apply_decision(parked("config_review", "questions"), &decision)
            .unwrap_err();
        assert!(matches!(err, PrepflowError::InvalidDecision(_)));
    }

    #[test]
    fn empty_answer_is_rejected() {
        let ctl = controller(ReviewPolicy::default());
        let decision = ReviewDecision::approve().with_answer(ReviewAnswer {
            question_id: "q_scale".into(),
            answer: "  ".into(),
            technique_name: None,
            technique_params: None,
        });
        assert!(ctl
            .apply_decision(parked("config_review", "questions"), &decision)
            .is_err());
    }

    #[test]
    fn rejection_past_limit_fails_run() {
        let ctl = controller(ReviewPolicy {
            max_review_iterations: Some(1),
            ..Default::default()
        });
        let mut state = parked("config_review", "questions");
        state.review_iteration = 1;
        let t = ctl
            .apply_decision(state, &ReviewDecision::reject("again"))
            .unwrap();
        assert_eq!(t.outcome, ReviewOutcome::Failed);
        assert_eq!(t.state.status, RunStatus::Failed);
        assert_eq!(t.state.review_iteration, 1);
        assert_eq!(t.state.errors[0].kind, "review_limit");
        assert_eq!(t.state.current_node.as_deref(), Some("questions"));
    }

    #[test]
    fn expiry_fail_action() {
        let ctl = controller(ReviewPolicy {
            expiry_secs: Some(60),
            ..Default::default()
        });
        let state = parked("config_review", "questions");
        let now = Utc::now();
        assert!(ctl.expire(state.clone(), now).unwrap().is_none());

        let t = ctl
            .expire(state, now + chrono::Duration::seconds(120))
            .unwrap()
            .unwrap();
        assert_eq!(t.state.status, RunStatus::Failed);
        assert_eq!(t.state.errors[0].kind, "review_expired");
        assert!(t.state.review.decisions[0].automatic);
    }

    #[test]
    fn expiry_approve_defaults_action() {
        let ctl = controller(ReviewPolicy {
            expiry_secs: Some(0),
            on_expiry: ExpiryAction::ApproveDefaults,
            ..Default::default()
        });
        let t = ctl
            .expire(parked("config_review", "questions"), Utc::now())
            .unwrap()
            .unwrap();
        assert!(t.approved);
        assert_eq!(t.state.answer_for("q_scale").unwrap().technique_name, "standard");
        assert_eq!(t.state.status, RunStatus::Running);
    }

    #[test]
    fn expire_ignores_runs_that_are_not_parked() {
        let ctl = controller(ReviewPolicy {
            expiry_secs: Some(0),
            ..Default::default()
        });
        let state = RunState::new(RunInput::default());
        assert!(ctl.expire(state, Utc::now()).unwrap().is_none());
    }
}
