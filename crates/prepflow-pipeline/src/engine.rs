//! Run loop: executes nodes, persists after each one, and parks at
//! checkpoints.
//!
//! [`PipelineExecutor::run`] drives a run from its `current_node` (or the
//! resolved entry point on a fresh run) until the graph reaches a terminal
//! node, a checkpoint parks the run, or a node fails. Run-level failures are
//! recorded on the state and returned as `Ok`; only persistence and caller
//! errors come back as `Err`.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::Instrument;

use prepflow_types::{PrepflowError, Result, RunState, RunStatus};

use crate::events::{EventEmitter, PipelineEvent};
use crate::graph::{NodeDescriptor, WorkflowGraph};
use crate::retry::BackoffPolicy;
use crate::store::RunStateStore;

pub const DEFAULT_MAX_STEPS: usize = 200;

/// Executes runs of one compiled graph against one store.
#[derive(Clone)]
pub struct PipelineExecutor {
    graph: Arc<WorkflowGraph>,
    store: Arc<dyn RunStateStore>,
    events: EventEmitter,
    max_steps: usize,
    backoff: BackoffPolicy,
}

impl PipelineExecutor {
    pub fn new(graph: Arc<WorkflowGraph>, store: Arc<dyn RunStateStore>) -> Self {
        Self {
            graph,
            store,
            events: EventEmitter::default(),
            max_steps: DEFAULT_MAX_STEPS,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    pub fn store(&self) -> &Arc<dyn RunStateStore> {
        &self.store
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Drive a persisted `pending` or `running` run forward.
    pub async fn run(&self, state: RunState) -> Result<RunState> {
        if !matches!(state.status, RunStatus::Pending | RunStatus::Running) {
            return Err(PrepflowError::InvalidTransition {
                run_id: state.run_id.clone(),
                status: state.status,
                action: "run".into(),
            });
        }
        let span = tracing::info_span!("run", run_id = %state.run_id);
        self.run_loop(state).instrument(span).await
    }

    async fn run_loop(&self, mut state: RunState) -> Result<RunState> {
        let fresh = state.status == RunStatus::Pending;
        let start = match state.current_node.clone() {
            Some(node) if self.graph.has_node(&node) => node,
            Some(node) => {
                let err = PrepflowError::NodeContract {
                    node: node.clone(),
                    message: "current_node is not a node of this graph".into(),
                };
                state.current_node = None;
                return self.fail_run(state, None, err).await;
            }
            None => match self.graph.resolve_entry(&state) {
                Ok(node) => node,
                Err(err) => return self.fail_run(state, None, err).await,
            },
        };

        state.status = RunStatus::Running;
        state.current_node = Some(start.clone());
        let mut state = self.save(state).await?;
        if state.status == RunStatus::Stopped {
            return Ok(state);
        }
        if fresh {
            tracing::info!(entry = %start, "Run started");
            self.events.emit(PipelineEvent::RunStarted {
                run_id: state.run_id.clone(),
                entry_node: start.clone(),
            });
        }

        let mut node = start;
        let mut steps = 0usize;
        loop {
            if steps >= self.max_steps {
                let err = PrepflowError::StepLimitExceeded {
                    limit: self.max_steps,
                };
                return self.fail_run(state, Some(&node), err).await;
            }
            steps += 1;

            // Existence is checked by validation and on loop entry.
            let Some(descriptor) = self.graph.node(&node) else {
                let err = PrepflowError::NodeContract {
                    node: node.clone(),
                    message: "routed to an unregistered node".into(),
                };
                state.mark_failed(&node);
                return self.fail_run(state, Some(&node), err).await;
            };

            let started = Instant::now();
            self.events.emit(PipelineEvent::NodeStarted {
                run_id: state.run_id.clone(),
                node: node.clone(),
                kind: descriptor.executor.kind().to_string(),
            });
            let span = tracing::info_span!("node", node = %node, kind = %descriptor.executor.kind());
            let outcome = self
                .execute_node(descriptor, state.clone())
                .instrument(span)
                .await
                .and_then(|next| check_contract(&node, &state, next));

            let mut next_state = match outcome {
                Ok(next) => next,
                Err(err) => {
                    tracing::error!(node = %node, error = %err, "Node failed");
                    self.events.emit(PipelineEvent::NodeFailed {
                        run_id: state.run_id.clone(),
                        node: node.clone(),
                        error: err.to_string(),
                    });
                    state.mark_failed(&node);
                    return self.fail_run(state, Some(&node), err).await;
                }
            };
            next_state.mark_completed(&node);
            let duration_ms = started.elapsed().as_millis() as u64;
            tracing::info!(node = %node, duration_ms, "Node completed");
            self.events.emit(PipelineEvent::NodeCompleted {
                run_id: next_state.run_id.clone(),
                node: node.clone(),
                duration_ms,
            });

            if let Some(cp) = self.graph.checkpoint_after(&node) {
                next_state.status = RunStatus::AwaitingReview;
                next_state.current_node = Some(node.clone());
                next_state.review.pending_checkpoint = Some(cp.name.clone());
                next_state.review.awaiting_since = Some(Utc::now());
                let parked = self.save(next_state).await?;
                if parked.status == RunStatus::AwaitingReview {
                    tracing::info!(checkpoint = %cp.name, node = %node, "Run parked for review");
                    self.events.emit(PipelineEvent::CheckpointReached {
                        run_id: parked.run_id.clone(),
                        checkpoint: cp.name.clone(),
                    });
                }
                return Ok(parked);
            }

            match self.graph.next_node(&node, &next_state) {
                Ok(Some(next)) => {
                    tracing::debug!(from = %node, to = %next, "Route selected");
                    self.events.emit(PipelineEvent::RouteSelected {
                        run_id: next_state.run_id.clone(),
                        from_node: node.clone(),
                        to_node: next.clone(),
                    });
                    next_state.current_node = Some(next.clone());
                    state = self.save(next_state).await?;
                    if state.status == RunStatus::Stopped {
                        return Ok(state);
                    }
                    node = next;
                }
                Ok(None) => {
                    next_state.status = RunStatus::Completed;
                    next_state.current_node = Some(node.clone());
                    let done = self.save(next_state).await?;
                    if done.status == RunStatus::Completed {
                        tracing::info!(nodes = done.completed_nodes.len(), "Run completed");
                        self.events.emit(PipelineEvent::RunCompleted {
                            run_id: done.run_id.clone(),
                            completed_nodes: done.completed_nodes.clone(),
                        });
                    }
                    return Ok(done);
                }
                Err(err) => {
                    tracing::error!(node = %node, error = %err, "Routing failed");
                    return self.fail_run(next_state, Some(&node), err).await;
                }
            }
        }
    }

    /// Execute a node, re-invoking it on non-terminal errors up to its retry
    /// bound.
    async fn execute_node(&self, descriptor: &NodeDescriptor, state: RunState) -> Result<RunState> {
        let mut attempt = 0usize;
        loop {
            match descriptor.executor.execute(state.clone()).await {
                Ok(next) => return Ok(next),
                Err(err) if !err.is_terminal() && attempt < descriptor.max_retries => {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    attempt += 1;
                    tracing::warn!(
                        node = %descriptor.name,
                        attempt,
                        max_retries = descriptor.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Node failed, retrying"
                    );
                    self.events.emit(PipelineEvent::NodeRetrying {
                        run_id: state.run_id.clone(),
                        node: descriptor.name.clone(),
                        attempt,
                    });
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Mark the run failed at `node` and persist it. Callers record a failed
    /// execution in `failed_nodes` themselves; routing and step-limit
    /// failures leave the node's completion intact.
    async fn fail_run(
        &self,
        mut state: RunState,
        node: Option<&str>,
        err: PrepflowError,
    ) -> Result<RunState> {
        if let Some(node) = node {
            state.current_node = Some(node.to_string());
        }
        state.record_error(node, &err);
        state.status = RunStatus::Failed;
        let failed = self.save(state).await?;
        if failed.status == RunStatus::Failed {
            self.events.emit(PipelineEvent::RunFailed {
                run_id: failed.run_id.clone(),
                node: node.unwrap_or_default().to_string(),
                error: err.to_string(),
            });
        }
        Ok(failed)
    }

    /// Compare-and-swap save. Losing the race to a stop request is not an
    /// error: the stored, stopped record is returned instead.
    pub(crate) async fn save(&self, state: RunState) -> Result<RunState> {
        let run_id = state.run_id.clone();
        match self.store.save(state).await {
            Ok(saved) => {
                tracing::debug!(version = saved.version, status = %saved.status, "Run state saved");
                self.events.emit(PipelineEvent::StateSaved {
                    run_id,
                    version: saved.version,
                });
                Ok(saved)
            }
            Err(err @ PrepflowError::ConcurrentModification { .. }) => {
                let stored = self.store.load(&run_id).await?;
                if stored.status == RunStatus::Stopped {
                    tracing::info!("Run was stopped while executing, halting");
                    Ok(stored)
                } else {
                    Err(err)
                }
            }
            Err(err) => Err(err),
        }
    }
}

/// A node must hand back the same run, at a version no lower than it got,
/// and may not change a learning paradigm that is already set.
fn check_contract(node: &str, before: &RunState, after: RunState) -> Result<RunState> {
    if after.run_id != before.run_id {
        return Err(PrepflowError::NodeContract {
            node: node.to_string(),
            message: format!("returned run '{}' instead of '{}'", after.run_id, before.run_id),
        });
    }
    if after.version < before.version {
        return Err(PrepflowError::NodeContract {
            node: node.to_string(),
            message: format!(
                "returned version {} below current version {}",
                after.version, before.version
            ),
        });
    }
    if let Some(current) = before.learning_paradigm {
        match after.learning_paradigm {
            Some(requested) if requested != current => {
                return Err(PrepflowError::ParadigmLocked { current, requested });
            }
            None => {
                return Err(PrepflowError::NodeContract {
                    node: node.to_string(),
                    message: format!("cleared the locked learning paradigm '{current}'"),
                });
            }
            Some(_) => {}
        }
    }
    Ok(after)
}
