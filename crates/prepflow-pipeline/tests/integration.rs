//! End-to-end tests for the prepflow engine.
//!
//! Each test drives the full preprocessing workflow through the coordinator:
//! start -> park -> review decision -> resume/rewind -> verify the persisted record.

use std::sync::Arc;

use serde_json::json;

use prepflow_pipeline::pipeline::{
    paradigm_nodes, select_config_rewind, select_entry, select_preprocessing_path, ANALYZE_PROMPT,
    CONFIG_REVIEW, FINALIZE, GENERATE_QUESTIONS, LOAD_CONFIG, LOAD_DATA, PREDICT_CATEGORY,
    PREPROCESSING_REVIEW, SUMMARIZE, SUPERVISED_CLEAN, SUPERVISED_SCALE, UNSUPERVISED_CLEAN_OUTLIERS,
    UNSUPERVISED_SCALE,
};
use prepflow_pipeline::{
    builtin_registry, preprocessing_graph, BackoffPolicy, CheckpointController, DecisionService,
    EngineConfig, HeuristicDecisionService, MemoryRunStore, PipelineDeps, PipelineEvent,
    ReviewPolicy, RunCoordinator, RunStateStore, ScriptedDecisionService, SqliteRunStore,
};
use prepflow_types::{
    Dataset, LearningParadigm, PipelineConfigInput, PrepflowError, ReviewAnswer, ReviewDecision,
    RunInput, RunState, RunStatus,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn config() -> EngineConfig {
    EngineConfig {
        retry_backoff: BackoffPolicy::None,
        ..Default::default()
    }
}

fn coordinator() -> RunCoordinator {
    coordinator_over(Arc::new(MemoryRunStore::new()), &config())
}

fn coordinator_over(store: Arc<dyn RunStateStore>, config: &EngineConfig) -> RunCoordinator {
    RunCoordinator::with_services(config, Arc::new(HeuristicDecisionService::new()), store)
        .expect("preprocessing graph must compile")
}

fn customers() -> Dataset {
    Dataset::from_rows(
        &["age", "income", "city", "churned"],
        vec![
            vec![json!(31), json!(52000.0), json!("paris"), json!(1)],
            vec![json!(45), json!(61000.0), json!("lyon"), json!(0)],
            vec![json!(null), json!(58000.0), json!("paris"), json!(0)],
            vec![json!(38), json!(null), json!("nice"), json!(1)],
            vec![json!(38), json!(null), json!("nice"), json!(1)],
        ],
    )
    .unwrap()
}

fn prompt_input(prompt: &str) -> RunInput {
    RunInput {
        prompt: Some(prompt.into()),
        dataset: Some(customers()),
        ..Default::default()
    }
}

fn unsupervised_config_input() -> RunInput {
    RunInput {
        config: Some(PipelineConfigInput {
            goal: Some("segment customers".into()),
            learning_paradigm: Some(LearningParadigm::Unsupervised),
            ..Default::default()
        }),
        dataset: Some(customers()),
        ..Default::default()
    }
}

fn answer(question_id: &str, technique: &str) -> ReviewAnswer {
    ReviewAnswer {
        question_id: question_id.into(),
        answer: String::new(),
        technique_name: Some(technique.into()),
        technique_params: None,
    }
}

fn applied_technique(state: &RunState, node: &str) -> String {
    state.output(node).unwrap()["applied"]["technique"]
        .as_str()
        .unwrap()
        .to_string()
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

#[test]
fn routing_is_deterministic_over_all_input_combinations() {
    let prompts = [None, Some(""), Some("predict churned")];
    let configs = [None, Some(PipelineConfigInput::default())];
    let paradigms = [
        None,
        Some(LearningParadigm::Supervised),
        Some(LearningParadigm::Unsupervised),
    ];
    let feedback = [None, Some("target is churned")];

    for prompt in prompts {
        for config in &configs {
            for paradigm in paradigms {
                for fb in feedback {
                    let mut state = RunState::new(RunInput {
                        prompt: prompt.map(String::from),
                        config: config.clone(),
                        ..Default::default()
                    });
                    state.learning_paradigm = paradigm;
                    if let Some(fb) = fb {
                        state.review.feedback_history.push(fb.into());
                    }

                    let entry = select_entry(&state);
                    assert_eq!(entry, select_entry(&state.clone()));
                    let has_prompt = prompt.is_some_and(|p| !p.is_empty());
                    assert_eq!(entry, if has_prompt { ANALYZE_PROMPT } else { LOAD_CONFIG });

                    let path = select_preprocessing_path(&state);
                    let expected = match paradigm {
                        Some(LearningParadigm::Unsupervised) => UNSUPERVISED_CLEAN_OUTLIERS,
                        _ => SUPERVISED_CLEAN,
                    };
                    assert_eq!(path, expected);

                    let rewind = select_config_rewind(&state);
                    if has_prompt || fb.is_some() {
                        assert_eq!(rewind, ANALYZE_PROMPT);
                    } else {
                        assert_eq!(rewind, LOAD_CONFIG);
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Checkpoint round trips
// ---------------------------------------------------------------------------

#[tokio::test]
async fn supervised_run_completes_after_two_approvals() {
    let coord = coordinator();
    let mut events = coord.events().subscribe();
    let run_id = coord.start(prompt_input("predict churned")).await.unwrap();

    let parked = coord.get_state(&run_id).await.unwrap();
    assert_eq!(parked.status, RunStatus::AwaitingReview);
    assert_eq!(parked.review.pending_checkpoint.as_deref(), Some(CONFIG_REVIEW));
    assert_eq!(parked.learning_paradigm, Some(LearningParadigm::Supervised));
    assert_eq!(parked.target_column(), Some("churned"));
    assert_eq!(parked.questions.len(), 4);
    assert_eq!(
        parked.completed_nodes,
        vec![ANALYZE_PROMPT, LOAD_DATA, PREDICT_CATEGORY, GENERATE_QUESTIONS]
    );

    let decision = ReviewDecision::approve()
        .with_answer(answer("q_impute", "median"))
        .with_answer(answer("q_scale", "minmax"));
    let state = coord.submit_decision(&run_id, decision).await.unwrap();
    assert_eq!(state.status, RunStatus::AwaitingReview);
    assert_eq!(
        state.review.pending_checkpoint.as_deref(),
        Some(PREPROCESSING_REVIEW)
    );
    assert_eq!(state.answer_for("q_scale").unwrap().technique_name, "minmax");
    assert_eq!(applied_technique(&state, SUPERVISED_SCALE), "minmax");

    let summary = state.summary.clone().unwrap();
    assert_eq!(summary.rows_before, 5);
    assert_eq!(summary.rows_after, 4);
    assert_eq!(summary.applied.len(), 4);
    assert!(summary.missing_after.is_empty());

    let done = coord
        .submit_decision(&run_id, ReviewDecision::approve())
        .await
        .unwrap();
    assert_eq!(done.status, RunStatus::Completed);
    assert_eq!(done.current_node.as_deref(), Some(FINALIZE));
    assert_eq!(done.review_iteration, 0);
    assert_eq!(done.review.decisions.len(), 2);
    assert!(done.errors.is_empty());
    assert!(done.failed_nodes.is_empty());
    let finalize = done.output(FINALIZE).unwrap();
    assert_eq!(finalize["learning_paradigm"], "supervised");
    assert!(finalize["columns"]
        .as_array()
        .unwrap()
        .contains(&json!("city_paris")));

    let mut saw_decisions = 0;
    let mut saw_completed = false;
    while let Ok(event) = events.try_recv() {
        match event {
            PipelineEvent::DecisionApplied { .. } => saw_decisions += 1,
            PipelineEvent::RunCompleted { .. } => saw_completed = true,
            _ => {}
        }
    }
    assert_eq!(saw_decisions, 2);
    assert!(saw_completed);
}

#[tokio::test]
async fn config_review_rejection_rewinds_once() {
    let coord = coordinator();
    let run_id = coord.start(prompt_input("predict churned")).await.unwrap();
    let before = coord.get_state(&run_id).await.unwrap();

    let state = coord
        .submit_decision(&run_id, ReviewDecision::reject("target is churned, keep it"))
        .await
        .unwrap();

    assert_eq!(state.review_iteration, before.review_iteration + 1);
    assert_eq!(state.status, RunStatus::AwaitingReview);
    assert_eq!(state.review.pending_checkpoint.as_deref(), Some(CONFIG_REVIEW));
    assert_eq!(state.review.feedback_history.len(), 1);
    assert_eq!(
        state.analysis.as_ref().unwrap().hints.get("feedback").map(String::as_str),
        Some("target is churned, keep it")
    );
    assert!(state.version > before.version);
}

#[tokio::test]
async fn preprocessing_rejection_discards_stage_and_reruns_path() {
    let coord = coordinator();
    let run_id = coord.start(prompt_input("predict churned")).await.unwrap();
    coord
        .submit_decision(&run_id, ReviewDecision::approve())
        .await
        .unwrap();

    // Reject with a different scaler; the whole preprocessing stage reruns.
    let decision = ReviewDecision::reject("use robust scaling").with_answer(answer("q_scale", "robust"));
    let state = coord.submit_decision(&run_id, decision).await.unwrap();

    assert_eq!(state.review_iteration, 1);
    assert_eq!(
        state.review.pending_checkpoint.as_deref(),
        Some(PREPROCESSING_REVIEW)
    );
    assert_eq!(applied_technique(&state, SUPERVISED_SCALE), "robust");
    for node in paradigm_nodes(LearningParadigm::Unsupervised) {
        assert!(state.output(node).is_none());
    }
    assert!(state.completed_nodes.iter().any(|n| n == SUMMARIZE));
    // Earlier stages are untouched by the rewind.
    assert!(state.output(LOAD_DATA).is_some());
}

#[tokio::test]
async fn unsupervised_config_run_overrides_mandatory_scaling() {
    let coord = coordinator();
    let run_id = coord.start(unsupervised_config_input()).await.unwrap();
    let parked = coord.get_state(&run_id).await.unwrap();
    assert!(parked.completed_nodes.iter().any(|n| n == LOAD_CONFIG));
    assert_eq!(parked.learning_paradigm, Some(LearningParadigm::Unsupervised));
    let encode = parked.questions.iter().find(|q| q.id == "q_encode").unwrap();
    assert!(!encode.options.iter().any(|o| o == "target"));

    let state = coord
        .submit_decision(
            &run_id,
            ReviewDecision::approve().with_answer(answer("q_scale", "none")),
        )
        .await
        .unwrap();

    assert_eq!(state.status, RunStatus::AwaitingReview);
    assert_eq!(applied_technique(&state, UNSUPERVISED_SCALE), "standard");
    let warning = state
        .warnings
        .iter()
        .find(|w| w.kind == "technique_fallback")
        .unwrap();
    assert_eq!(warning.node.as_deref(), Some(UNSUPERVISED_SCALE));
    assert!(state.output(SUPERVISED_CLEAN).is_none());
}

#[tokio::test]
async fn unknown_technique_falls_back_without_failing() {
    let coord = coordinator();
    let run_id = coord.start(prompt_input("predict churned")).await.unwrap();
    let state = coord
        .submit_decision(
            &run_id,
            ReviewDecision::approve().with_answer(answer("q_impute", "quantum_impute")),
        )
        .await
        .unwrap();

    assert_eq!(state.status, RunStatus::AwaitingReview);
    assert!(state.errors.is_empty());
    assert!(state
        .warnings
        .iter()
        .any(|w| w.kind == "technique_fallback" && w.message.contains("quantum_impute")));
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test]
async fn two_decisions_on_one_snapshot_apply_once() {
    let store: Arc<dyn RunStateStore> = Arc::new(MemoryRunStore::new());
    let coord = coordinator_over(store.clone(), &config());
    let run_id = coord.start(prompt_input("predict churned")).await.unwrap();
    let snapshot = coord.get_state(&run_id).await.unwrap();

    let deps = PipelineDeps {
        decision: Arc::new(HeuristicDecisionService::new()),
        registry: Arc::new(builtin_registry()),
        load_retries: 0,
    };
    let controller = CheckpointController::new(
        Arc::new(preprocessing_graph(&deps).unwrap()),
        ReviewPolicy::default(),
    );
    let first = controller
        .apply_decision(snapshot.clone(), &ReviewDecision::approve())
        .unwrap();
    let second = controller
        .apply_decision(snapshot.clone(), &ReviewDecision::reject("no"))
        .unwrap();

    let results = [store.save(first.state).await, store.save(second.state).await];
    assert!(results[0].is_ok());
    match &results[1] {
        Err(PrepflowError::ConcurrentModification { expected, found, .. }) => {
            assert_eq!(*expected, snapshot.version);
            assert_eq!(*found, snapshot.version + 1);
        }
        other => panic!("expected ConcurrentModification, got {other:?}"),
    }
    let stored = store.load(&run_id).await.unwrap();
    assert_eq!(stored.review.decisions.len(), 1);
    assert_eq!(stored.review_iteration, 0);
}

#[tokio::test]
async fn concurrent_submissions_from_separate_processes_apply_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        store_dir: dir.path().to_path_buf(),
        ..config()
    };
    // Each coordinator owns its own connection pool, as two CLI processes would.
    let first = RunCoordinator::from_config(&config).await.unwrap();
    let second = RunCoordinator::from_config(&config).await.unwrap();
    let run_id = first.start(prompt_input("predict churned")).await.unwrap();
    let seen = first.get_state(&run_id).await.unwrap().version;

    let (a, b) = tokio::join!(
        first.submit_decision_at(&run_id, seen, ReviewDecision::approve()),
        second.submit_decision_at(&run_id, seen, ReviewDecision::approve()),
    );

    let applied = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(applied, 1);
    let loser = if a.is_ok() { b.unwrap_err() } else { a.unwrap_err() };
    assert!(matches!(loser, PrepflowError::ConcurrentModification { .. }));

    let stored = second.get_state(&run_id).await.unwrap();
    assert_eq!(stored.review.decisions.len(), 1);
    assert_eq!(
        stored.review.pending_checkpoint.as_deref(),
        Some(PREPROCESSING_REVIEW)
    );
}

#[tokio::test]
async fn concurrent_submissions_on_one_coordinator_apply_once() {
    let coord = coordinator();
    let run_id = coord.start(prompt_input("predict churned")).await.unwrap();
    let seen = coord.get_state(&run_id).await.unwrap().version;

    let (a, b) = tokio::join!(
        coord.submit_decision_at(&run_id, seen, ReviewDecision::approve()),
        coord.submit_decision_at(&run_id, seen, ReviewDecision::reject("again")),
    );

    assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
    let stored = coord.get_state(&run_id).await.unwrap();
    assert_eq!(stored.review.decisions.len(), 1);
}

#[tokio::test]
async fn versioned_submission_rejects_stale_reviewer() {
    let coord = coordinator();
    let run_id = coord.start(prompt_input("predict churned")).await.unwrap();
    let seen = coord.get_state(&run_id).await.unwrap().version;

    coord
        .submit_decision_at(&run_id, seen, ReviewDecision::approve())
        .await
        .unwrap();
    let err = coord
        .submit_decision_at(&run_id, seen, ReviewDecision::approve())
        .await
        .unwrap_err();
    assert!(matches!(err, PrepflowError::ConcurrentModification { .. }));
    assert_eq!(err.exit_code(), 4);
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_run_names_the_failing_node() {
    let coord = coordinator();
    let run_id = coord
        .start(RunInput {
            prompt: Some("predict churned".into()),
            dataset_path: Some("/nonexistent/prepflow/data.json".into()),
            ..Default::default()
        })
        .await
        .unwrap();

    let state = coord.get_state(&run_id).await.unwrap();
    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(state.current_node.as_deref(), Some(LOAD_DATA));
    assert_eq!(state.failed_nodes, vec![LOAD_DATA]);
    assert_eq!(state.errors.len(), 1);
    assert_eq!(state.errors[0].node.as_deref(), Some(LOAD_DATA));
    assert_eq!(state.errors[0].kind, "io");

    let err = coord
        .submit_decision(&run_id, ReviewDecision::approve())
        .await
        .unwrap_err();
    assert!(matches!(err, PrepflowError::InvalidTransition { .. }));
    assert_eq!(coord.get_state(&run_id).await.unwrap().version, state.version);
}

#[tokio::test]
async fn dataset_lost_before_rewind_records_load_data_as_failed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("customers.json");
    tokio::fs::write(&path, serde_json::to_string(&customers()).unwrap())
        .await
        .unwrap();

    let coord = coordinator();
    let run_id = coord
        .start(RunInput {
            prompt: Some("predict churned".into()),
            dataset_path: Some(path.clone()),
            ..Default::default()
        })
        .await
        .unwrap();
    let parked = coord.get_state(&run_id).await.unwrap();
    assert_eq!(parked.status, RunStatus::AwaitingReview);
    assert!(parked.completed_nodes.iter().any(|n| n == LOAD_DATA));

    tokio::fs::remove_file(&path).await.unwrap();
    let state = coord
        .submit_decision(&run_id, ReviewDecision::reject("target is churned"))
        .await
        .unwrap();

    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(state.current_node.as_deref(), Some(LOAD_DATA));
    assert_eq!(state.failed_nodes, vec![LOAD_DATA]);
    assert!(!state.completed_nodes.iter().any(|n| n == LOAD_DATA));
    assert_eq!(state.errors.last().unwrap().kind, "io");
}

#[tokio::test]
async fn feedback_switching_paradigm_is_locked() {
    let coord = coordinator();
    let run_id = coord.start(prompt_input("predict churned")).await.unwrap();
    let state = coord
        .submit_decision(&run_id, ReviewDecision::reject("actually, cluster the customers"))
        .await
        .unwrap();

    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(state.learning_paradigm, Some(LearningParadigm::Supervised));
    assert_eq!(state.current_node.as_deref(), Some(PREDICT_CATEGORY));
    assert_eq!(state.errors[0].kind, "paradigm_locked");
}

#[tokio::test]
async fn decision_service_failure_fails_analysis() {
    let script = json!({
        "analyze_prompt": [{"error": "model returned prose", "retryable": false}]
    });
    let service: Arc<dyn DecisionService> =
        Arc::new(ScriptedDecisionService::from_script(&script).unwrap());
    let coord = RunCoordinator::with_services(&config(), service, Arc::new(MemoryRunStore::new()))
        .unwrap();

    let run_id = coord.start(prompt_input("predict churned")).await.unwrap();
    let state = coord.get_state(&run_id).await.unwrap();
    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(state.current_node.as_deref(), Some(ANALYZE_PROMPT));
    assert_eq!(state.errors[0].kind, "decision_service");
}

#[tokio::test]
async fn review_limit_fails_the_run() {
    let config = EngineConfig {
        review: ReviewPolicy {
            max_review_iterations: Some(1),
            ..Default::default()
        },
        ..config()
    };
    let coord = coordinator_over(Arc::new(MemoryRunStore::new()), &config);
    let run_id = coord.start(prompt_input("predict churned")).await.unwrap();

    let once = coord
        .submit_decision(&run_id, ReviewDecision::reject("try again"))
        .await
        .unwrap();
    assert_eq!(once.status, RunStatus::AwaitingReview);

    let twice = coord
        .submit_decision(&run_id, ReviewDecision::reject("and again"))
        .await
        .unwrap();
    assert_eq!(twice.status, RunStatus::Failed);
    assert_eq!(twice.review_iteration, 1);
    assert_eq!(twice.errors.last().unwrap().kind, "review_limit");
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn parked_run_survives_process_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        store_dir: dir.path().to_path_buf(),
        ..config()
    };

    let run_id = {
        let coord = RunCoordinator::from_config(&config).await.unwrap();
        coord.start(prompt_input("predict churned")).await.unwrap()
    };
    assert!(dir.path().join("runs.db").exists());

    // A fresh coordinator over the same directory picks the run up.
    let coord = RunCoordinator::from_config(&config).await.unwrap();
    let state = coord.get_state(&run_id).await.unwrap();
    assert_eq!(state.status, RunStatus::AwaitingReview);
    let state = coord
        .submit_decision(&run_id, ReviewDecision::approve())
        .await
        .unwrap();
    assert_eq!(
        state.review.pending_checkpoint.as_deref(),
        Some(PREPROCESSING_REVIEW)
    );

    let store = SqliteRunStore::open(dir.path()).await.unwrap();
    assert_eq!(store.list().await.unwrap().len(), 1);
}
