//! Run event system for observability.
//!
//! Emits [`PipelineEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! external observers (loggers, progress displays, etc.) can follow run
//! progress without coupling to the engine internals.

use serde::{Deserialize, Serialize};

/// Events emitted while a run executes or is reviewed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    RunStarted {
        run_id: String,
        entry_node: String,
    },
    RunCompleted {
        run_id: String,
        completed_nodes: Vec<String>,
    },
    RunFailed {
        run_id: String,
        node: String,
        error: String,
    },
    RunStopped {
        run_id: String,
    },
    NodeStarted {
        run_id: String,
        node: String,
        kind: String,
    },
    NodeCompleted {
        run_id: String,
        node: String,
        duration_ms: u64,
    },
    NodeFailed {
        run_id: String,
        node: String,
        error: String,
    },
    NodeRetrying {
        run_id: String,
        node: String,
        attempt: usize,
    },
    RouteSelected {
        run_id: String,
        from_node: String,
        to_node: String,
    },
    CheckpointReached {
        run_id: String,
        checkpoint: String,
    },
    DecisionApplied {
        run_id: String,
        checkpoint: String,
        approved: bool,
        review_iteration: u32,
    },
    StateSaved {
        run_id: String,
        version: u64,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<PipelineEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitter_sends_and_receives() {
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();

        emitter.emit(PipelineEvent::CheckpointReached {
            run_id: "r1".into(),
            checkpoint: "config_review".into(),
        });

        match rx.recv().await.unwrap() {
            PipelineEvent::CheckpointReached { run_id, checkpoint } => {
                assert_eq!(run_id, "r1");
                assert_eq!(checkpoint, "config_review");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let emitter = EventEmitter::new(16);
        let mut rx1 = emitter.subscribe();
        let mut rx2 = emitter.subscribe();

        emitter.emit(PipelineEvent::StateSaved {
            run_id: "r1".into(),
            version: 4,
        });

        let json1 = serde_json::to_string(&rx1.recv().await.unwrap()).unwrap();
        let json2 = serde_json::to_string(&rx2.recv().await.unwrap()).unwrap();
        assert_eq!(json1, json2);
    }

    #[test]
    fn emit_with_no_subscribers_does_not_panic() {
        let emitter = EventEmitter::new(16);
        emitter.emit(PipelineEvent::RunStopped { run_id: "r1".into() });
    }
}
