//! Entry point for the outer service layer: start, review, continue, stop.

use std::sync::Arc;

use chrono::Utc;

use prepflow_types::{PrepflowError, Result, ReviewDecision, RunInput, RunState, RunStatus};

use crate::checkpoint::{CheckpointController, Transition};
use crate::config::EngineConfig;
use crate::decision::{DecisionService, HeuristicDecisionService, RetryingDecisionService};
use crate::engine::PipelineExecutor;
use crate::events::{EventEmitter, PipelineEvent};
use crate::graph::WorkflowGraph;
use crate::pipeline::{preprocessing_graph, PipelineDeps};
use crate::store::{RunStateStore, SqliteRunStore};
use crate::techniques::builtin_registry;

/// Drives runs of one graph: every operation loads the record, transitions
/// it, and persists it with a compare-and-swap save.
#[derive(Clone)]
pub struct RunCoordinator {
    executor: PipelineExecutor,
    controller: Arc<CheckpointController>,
}

impl RunCoordinator {
    pub fn new(executor: PipelineExecutor, controller: CheckpointController) -> Self {
        Self {
            executor,
            controller: Arc::new(controller),
        }
    }

    /// Build the preprocessing workflow over the given collaborators.
    pub fn with_services(
        config: &EngineConfig,
        decision: Arc<dyn DecisionService>,
        store: Arc<dyn RunStateStore>,
    ) -> Result<Self> {
        let deps = PipelineDeps {
            decision,
            registry: Arc::new(builtin_registry()),
            load_retries: config.load_retries,
        };
        let graph = Arc::new(preprocessing_graph(&deps)?);
        let executor = PipelineExecutor::new(graph.clone(), store)
            .with_max_steps(config.max_steps)
            .with_backoff(config.retry_backoff.clone());
        let controller = CheckpointController::new(graph, config.review.clone());
        Ok(Self::new(executor, controller))
    }

    /// Heuristic decision service behind the retry wrapper, SQLite store
    /// under `store_dir`.
    pub async fn from_config(config: &EngineConfig) -> Result<Self> {
        let decision = RetryingDecisionService::new(
            HeuristicDecisionService::new(),
            config.decision_retries,
            config.retry_backoff.clone(),
        );
        let store = SqliteRunStore::open(&config.store_dir).await?;
        Self::with_services(config, Arc::new(decision), Arc::new(store))
    }

    pub fn graph(&self) -> &WorkflowGraph {
        self.executor.graph()
    }

    pub fn events(&self) -> &EventEmitter {
        self.executor.events()
    }

    pub fn store(&self) -> &Arc<dyn RunStateStore> {
        self.executor.store()
    }

    /// Persist a new pending run and execute it up to its first park or
    /// terminal state. Returns the run id.
    pub async fn start(&self, input: RunInput) -> Result<String> {
        let created = self.store().create(RunState::new(input)).await?;
        let run_id = created.run_id.clone();
        tracing::info!(run_id = %run_id, "Run created");
        let state = self.executor.run(created).await?;
        tracing::info!(run_id = %run_id, status = %state.status, "Run returned control");
        Ok(run_id)
    }

    pub async fn get_state(&self, run_id: &str) -> Result<RunState> {
        self.store().load(run_id).await
    }

    /// Apply a reviewer decision and continue the run if it resumes.
    ///
    /// A decision submitted after the review expired is replaced by the
    /// policy's expiry action.
    pub async fn submit_decision(&self, run_id: &str, decision: ReviewDecision) -> Result<RunState> {
        let state = self.store().load(run_id).await?;
        self.decide(state, decision).await
    }

    /// Like [`submit_decision`](Self::submit_decision), but only against the
    /// record version the reviewer looked at.
    pub async fn submit_decision_at(
        &self,
        run_id: &str,
        expected_version: u64,
        decision: ReviewDecision,
    ) -> Result<RunState> {
        let state = self.store().load(run_id).await?;
        if state.version != expected_version {
            return Err(PrepflowError::ConcurrentModification {
                run_id: run_id.to_string(),
                expected: expected_version,
                found: state.version,
            });
        }
        self.decide(state, decision).await
    }

    async fn decide(&self, state: RunState, decision: ReviewDecision) -> Result<RunState> {
        if state.status == RunStatus::AwaitingReview {
            if let Some(transition) = self.controller.expire(state.clone(), Utc::now())? {
                tracing::warn!(
                    run_id = %state.run_id,
                    "Decision arrived after the review expired, expiry action applied instead"
                );
                return self.commit(transition).await;
            }
        }
        let transition = self.controller.apply_decision(state, &decision)?;
        self.commit(transition).await
    }

    /// Persist a checkpoint transition and hand resumed runs back to the
    /// run loop.
    async fn commit(&self, transition: Transition) -> Result<RunState> {
        let needs_execution = transition.needs_execution();
        let checkpoint = transition.checkpoint.clone();
        let approved = transition.approved;
        let saved = self.store().save(transition.state).await?;
        self.events().emit(PipelineEvent::DecisionApplied {
            run_id: saved.run_id.clone(),
            checkpoint,
            approved,
            review_iteration: saved.review_iteration,
        });
        match saved.status {
            RunStatus::Failed => {
                let error = saved
                    .errors
                    .last()
                    .map(|e| e.message.clone())
                    .unwrap_or_default();
                self.events().emit(PipelineEvent::RunFailed {
                    run_id: saved.run_id.clone(),
                    node: saved.current_node.clone().unwrap_or_default(),
                    error,
                });
            }
            RunStatus::Completed => {
                self.events().emit(PipelineEvent::RunCompleted {
                    run_id: saved.run_id.clone(),
                    completed_nodes: saved.completed_nodes.clone(),
                });
            }
            _ => {}
        }
        if needs_execution {
            self.executor.run(saved).await
        } else {
            Ok(saved)
        }
    }

    /// Resume a `pending` or `running` run from its `current_node`, e.g. after
    /// the process that was executing it died.
    pub async fn continue_run(&self, run_id: &str) -> Result<RunState> {
        let state = self.store().load(run_id).await?;
        match state.status {
            RunStatus::Pending | RunStatus::Running => {
                tracing::info!(run_id, node = ?state.current_node, "Continuing run");
                self.executor.run(state).await
            }
            status => Err(PrepflowError::InvalidTransition {
                run_id: run_id.to_string(),
                status,
                action: "continue".into(),
            }),
        }
    }

    /// Mark a running or parked run as stopped. Stopped runs never resume.
    pub async fn stop(&self, run_id: &str) -> Result<RunState> {
        let mut state = self.store().load(run_id).await?;
        if !matches!(state.status, RunStatus::Running | RunStatus::AwaitingReview) {
            return Err(PrepflowError::InvalidTransition {
                run_id: run_id.to_string(),
                status: state.status,
                action: "stop".into(),
            });
        }
        state.status = RunStatus::Stopped;
        state.review.pending_checkpoint = None;
        state.review.awaiting_since = None;
        let saved = self.store().save(state).await?;
        tracing::info!(run_id, "Run stopped");
        self.events().emit(PipelineEvent::RunStopped {
            run_id: saved.run_id.clone(),
        });
        Ok(saved)
    }

    pub async fn list_runs(&self) -> Result<Vec<RunState>> {
        self.store().list().await
    }

    /// Apply the expiry action to every run parked past the review expiry.
    /// Returns the runs that changed. A run modified concurrently is skipped.
    pub async fn expire_stale_reviews(&self) -> Result<Vec<RunState>> {
        if self.controller.policy().expiry().is_none() {
            return Ok(Vec::new());
        }
        let now = Utc::now();
        let mut changed = Vec::new();
        for state in self.store().list().await? {
            let run_id = state.run_id.clone();
            let Some(transition) = self.controller.expire(state, now)? else {
                continue;
            };
            match self.commit(transition).await {
                Ok(state) => changed.push(state),
                Err(err @ PrepflowError::ConcurrentModification { .. }) => {
                    tracing::warn!(run_id = %run_id, error = %err, "Skipping expiry, run changed");
                }
                Err(err) => return Err(err),
            }
        }
        tracing::info!(expired = changed.len(), "Stale reviews swept");
        Ok(changed)
    }
}
