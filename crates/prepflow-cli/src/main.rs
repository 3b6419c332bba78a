//! CLI binary for starting, reviewing, and inspecting prepflow runs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};

use prepflow_pipeline::{
    EngineConfig, RetryingDecisionService, RunCoordinator, ScriptedDecisionService, Severity,
    SqliteRunStore,
};
use prepflow_types::{
    LearningParadigm, PipelineConfigInput, PrepflowError, ReviewAnswer, ReviewDecision, RunInput,
    RunState,
};

#[derive(Parser)]
#[command(name = "prepflow", version, about = "Human-reviewed data preprocessing runs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Engine configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Run-state directory, overrides `store_dir` from the config file
    #[arg(long, global = true)]
    store_dir: Option<PathBuf>,

    /// Node-execution limit per run-loop invocation, overrides `max_steps`
    #[arg(long, global = true)]
    max_steps: Option<usize>,

    /// Replay decision-service responses from a JSON script instead of the
    /// built-in heuristics
    #[arg(long, global = true)]
    decision_script: Option<PathBuf>,

    /// Print the full run record as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a run and execute it up to its first review checkpoint
    StartRun {
        /// Free-text description of the modelling goal
        #[arg(short, long)]
        prompt: Option<String>,

        /// Dataset file: `{"columns": [...]}` or an array of row objects
        #[arg(short, long)]
        dataset: PathBuf,

        /// Target column, if known
        #[arg(short, long)]
        target_column: Option<String>,

        /// Structured run configuration (JSON) used instead of a prompt
        #[arg(long, conflicts_with = "prompt")]
        run_config: Option<PathBuf>,

        /// Learning paradigm for a structured run (supervised | unsupervised)
        #[arg(long, conflicts_with = "prompt")]
        paradigm: Option<LearningParadigm>,
    },

    /// Show the stored state of a run
    GetRunState { run_id: String },

    /// Approve or reject the checkpoint a run is parked at
    SubmitReview {
        run_id: String,

        #[arg(long, conflicts_with = "reject")]
        approve: bool,

        #[arg(long)]
        reject: bool,

        /// Answer a question: QUESTION_ID=TECHNIQUE (repeatable)
        #[arg(short, long = "answer", value_parser = parse_answer)]
        answers: Vec<ReviewAnswer>,

        /// Feedback for the agents
        #[arg(short, long)]
        feedback: Option<String>,

        /// Full decision as a JSON file; overrides the other decision flags
        #[arg(long)]
        decision_file: Option<PathBuf>,

        /// Only apply the decision if the run is still at this version
        #[arg(long)]
        expected_version: Option<u64>,
    },

    /// Resume a pending or running run from its current node
    ContinueRun { run_id: String },

    /// Stop a running or parked run
    StopRun { run_id: String },

    /// List stored runs, oldest first
    ListRuns,

    /// Apply the review-expiry policy to runs parked too long
    ExpireReviews,

    /// Validate and describe the preprocessing graph
    Graph {
        /// Print Graphviz DOT instead of a summary
        #[arg(long)]
        dot: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run(cli).await {
        let code = err
            .downcast_ref::<PrepflowError>()
            .map_or(1, PrepflowError::exit_code);
        eprintln!("error: {err:#}");
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = EngineConfig::load_or_default(cli.config.as_deref()).await?;
    if let Some(dir) = cli.store_dir {
        config.store_dir = dir;
    }
    if let Some(max_steps) = cli.max_steps {
        config.max_steps = max_steps;
    }
    tracing::debug!(
        store_dir = %config.store_dir.display(),
        max_steps = config.max_steps,
        scripted = cli.decision_script.is_some(),
        "Engine configured"
    );
    let coord = build_coordinator(&config, cli.decision_script.as_deref()).await?;
    let json = cli.json;

    match cli.command {
        Commands::StartRun {
            prompt,
            dataset,
            target_column,
            run_config,
            paradigm,
        } => {
            let config_input = match run_config {
                Some(path) => Some(read_json::<PipelineConfigInput>(&path).await?),
                None if prompt.is_none() => Some(PipelineConfigInput::default()),
                None => None,
            }
            .map(|mut c| {
                c.learning_paradigm = paradigm.or(c.learning_paradigm);
                c
            });
            let input = RunInput {
                prompt,
                config: config_input,
                dataset_path: Some(dataset),
                dataset: None,
                target_column,
            };
            let run_id = coord.start(input).await?;
            print_state(&coord.get_state(&run_id).await?, json)?;
        }
        Commands::GetRunState { run_id } => {
            print_state(&coord.get_state(&run_id).await?, json)?;
        }
        Commands::SubmitReview {
            run_id,
            approve,
            reject,
            answers,
            feedback,
            decision_file,
            expected_version,
        } => {
            let decision = match decision_file {
                Some(path) => read_json::<ReviewDecision>(&path).await?,
                None => {
                    if approve == reject {
                        anyhow::bail!("Must specify either --approve or --reject");
                    }
                    ReviewDecision {
                        approved: approve,
                        answers,
                        user_feedback: feedback,
                    }
                }
            };
            let state = match expected_version {
                Some(version) => coord.submit_decision_at(&run_id, version, decision).await?,
                None => coord.submit_decision(&run_id, decision).await?,
            };
            print_state(&state, json)?;
        }
        Commands::ContinueRun { run_id } => {
            print_state(&coord.continue_run(&run_id).await?, json)?;
        }
        Commands::StopRun { run_id } => {
            print_state(&coord.stop(&run_id).await?, json)?;
        }
        Commands::ListRuns => {
            let runs = coord.list_runs().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&runs)?);
            } else if runs.is_empty() {
                println!("No runs in {}", config.store_dir.display());
            } else {
                for run in &runs {
                    println!(
                        "{}  {:<15}  {:<28}  {}",
                        run.run_id,
                        run.status.as_str(),
                        run.current_node.as_deref().unwrap_or("-"),
                        run.updated_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }
        }
        Commands::ExpireReviews => {
            let changed = coord.expire_stale_reviews().await?;
            println!("Expired {} review(s)", changed.len());
            for run in &changed {
                println!("  {} -> {}", run.run_id, run.status);
            }
        }
        Commands::Graph { dot } => {
            if dot {
                print!("{}", coord.graph().to_dot());
            } else {
                cmd_graph(&coord)?;
            }
        }
    }

    Ok(())
}

async fn build_coordinator(
    config: &EngineConfig,
    decision_script: Option<&Path>,
) -> anyhow::Result<RunCoordinator> {
    let Some(path) = decision_script else {
        return Ok(RunCoordinator::from_config(config).await?);
    };
    let script = read_json::<serde_json::Value>(path).await?;
    let decision = RetryingDecisionService::new(
        ScriptedDecisionService::from_script(&script)?,
        config.decision_retries,
        config.retry_backoff.clone(),
    );
    let store = SqliteRunStore::open(&config.store_dir).await?;
    Ok(RunCoordinator::with_services(
        config,
        Arc::new(decision),
        Arc::new(store),
    )?)
}

fn cmd_graph(coord: &RunCoordinator) -> anyhow::Result<()> {
    let graph = coord.graph();

    println!("Graph: {}", graph.name);
    println!("Nodes: {}", graph.node_names().len());
    for name in graph.node_names() {
        let Some(node) = graph.node(name) else {
            continue;
        };
        let next = graph
            .route(name)
            .map(|r| r.targets().join(" | "))
            .unwrap_or_else(|| "(terminal)".into());
        let retries = if node.max_retries > 0 {
            format!(" retries={}", node.max_retries)
        } else {
            String::new()
        };
        println!("  {name} [{}]{retries} -> {next}", node.executor.kind());
    }
    let mut checkpoints: Vec<_> = graph.checkpoints().collect();
    checkpoints.sort_by(|a, b| a.name.cmp(&b.name));
    println!("Checkpoints:");
    for cp in checkpoints {
        println!(
            "  {} after {} (rewind -> {})",
            cp.name,
            cp.after,
            cp.rewind.targets().join(" | ")
        );
    }

    let diagnostics = graph.diagnostics();
    if diagnostics.is_empty() {
        println!("Graph is valid");
    }
    for diag in diagnostics {
        let severity = match diag.severity {
            Severity::Error => "ERROR",
            Severity::Warning => "WARN",
            Severity::Info => "INFO",
        };
        println!("[{}] {}: {}", severity, diag.rule, diag.message);
    }
    Ok(())
}

fn parse_answer(raw: &str) -> Result<ReviewAnswer, String> {
    let (question_id, technique) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected QUESTION_ID=TECHNIQUE, got '{raw}'"))?;
    let (question_id, technique) = (question_id.trim(), technique.trim());
    if question_id.is_empty() || technique.is_empty() {
        return Err(format!("expected QUESTION_ID=TECHNIQUE, got '{raw}'"));
    }
    Ok(ReviewAnswer {
        question_id: question_id.to_string(),
        answer: technique.to_string(),
        technique_name: Some(technique.to_string()),
        technique_params: None,
    })
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {}", path.display()))
}

fn print_state(state: &RunState, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(state)?);
        return Ok(());
    }

    println!("Run: {}", state.run_id);
    println!("Status: {}", state.status);
    println!(
        "Current node: {}",
        state.current_node.as_deref().unwrap_or("-")
    );
    println!("Version: {}", state.version);
    if let Some(paradigm) = state.learning_paradigm {
        let category = state
            .prediction
            .as_ref()
            .map(|p| p.algorithm_category.as_str())
            .unwrap_or("-");
        println!("Paradigm: {paradigm} ({category})");
    }
    if state.review_iteration > 0 {
        println!("Review iteration: {}", state.review_iteration);
    }

    if let Some(checkpoint) = &state.review.pending_checkpoint {
        println!("\nAwaiting review at '{checkpoint}'");
        for q in &state.questions {
            let chosen = state
                .answer_for(&q.id)
                .map(|c| c.technique_name.as_str())
                .unwrap_or(q.default.as_str());
            println!("  {} {}", q.id, q.prompt);
            println!("      options: {}  (current: {chosen})", q.options.join(", "));
        }
        if let Some(summary) = &state.summary {
            println!(
                "  rows {} -> {}, columns {} -> {}",
                summary.rows_before, summary.rows_after, summary.columns_before, summary.columns_after
            );
            for applied in &summary.applied {
                let note = if applied.fallback { " (fallback)" } else { "" };
                println!("  {}: {}{note}", applied.step, applied.technique);
            }
        }
    }

    if !state.warnings.is_empty() {
        println!("\nWarnings:");
        for w in &state.warnings {
            println!("  [{}] {}: {}", w.node.as_deref().unwrap_or("-"), w.kind, w.message);
        }
    }
    if !state.errors.is_empty() {
        println!("\nErrors:");
        for e in &state.errors {
            println!("  [{}] {}: {}", e.node.as_deref().unwrap_or("-"), e.kind, e.message);
        }
    }
    Ok(())
}
