//! CLI command definitions for sqlforge.
//!
//! `run` executes a pipeline over a dataset, `validate` checks the pipeline
//! and resume flags without touching the dataset, and `stages` lists the
//! stage registry.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use crate::catalog::SqliteCatalog;
use crate::checkpoint::FileCheckpointStore;
use crate::llm::{LiteLlmClient, LlmProvider, DEFAULT_API_BASE, DEFAULT_MODEL};
use crate::metrics::init_metrics;
use crate::pipeline::{
    load_dataset, load_pipeline_setup, PipelineDefinition, RunConfig, RunManager, RunMode,
    RunSummary, StageKind, DEFAULT_MAX_CONCURRENCY, DEFAULT_STAGE_TIMEOUT,
};
use crate::stages::StageRegistry;

const DEFAULT_DATA_PATH: &str = "./data/dev/dev.json";
const DEFAULT_RESULTS_DIR: &str = "./results";
const DEFAULT_DB_ROOT: &str = "./data/dev/dev_databases";

/// Multi-stage text-to-SQL pipeline runner.
#[derive(Parser)]
#[command(name = "sqlforge")]
#[command(about = "Run multi-stage text-to-SQL pipelines with checkpoint resume")]
#[command(version)]
#[command(
    long_about = "sqlforge applies a configurable sequence of stages (keyword extraction, retrieval, \
schema selection, SQL generation) to every question of a dataset, stage by stage, \
checkpointing each task after each stage.\n\nExample usage:\n  sqlforge run --data-path ./data/dev/dev.json \
--pipeline-nodes keyword_extraction+entity_retrieval+context_retrieval"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "warn", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run a pipeline over a dataset.
    Run(Box<RunArgs>),

    /// Validate the pipeline definition and resume flags, then print the plan.
    Validate(PipelineArgs),

    /// List the known stages with their configuration keys and field contracts.
    Stages,
}

/// Pipeline, dataset and resume flags shared by `run` and `validate`.
#[derive(Parser, Debug, Clone)]
pub struct PipelineArgs {
    /// Dataset split name, used in the results path.
    #[arg(long, default_value = "dev")]
    pub data_mode: String,

    /// Path to the dataset JSON file.
    #[arg(long, default_value = DEFAULT_DATA_PATH)]
    pub data_path: PathBuf,

    /// Stages to run, joined by '+'. Defaults to all seven stages.
    #[arg(long)]
    pub pipeline_nodes: Option<String>,

    /// Stage configuration: inline JSON, or @path to a JSON/YAML file.
    #[arg(long)]
    pub pipeline_setup: Option<String>,

    /// Resume from checkpoints of an earlier run.
    #[arg(long)]
    pub use_checkpoint: bool,

    /// Stages to restore from checkpoints, joined by '+'.
    #[arg(long)]
    pub checkpoint_nodes: Option<String>,

    /// Run directory of the earlier run to restore from.
    #[arg(long)]
    pub checkpoint_dir: Option<PathBuf>,

    /// Root directory for run outputs.
    #[arg(long, default_value = DEFAULT_RESULTS_DIR)]
    pub results_dir: PathBuf,

    /// Maximum concurrent stage invocations within a stage.
    #[arg(long, default_value_t = DEFAULT_MAX_CONCURRENCY)]
    pub concurrency: usize,

    /// Timeout for one stage invocation on one task, in seconds.
    #[arg(long, default_value_t = DEFAULT_STAGE_TIMEOUT.as_secs())]
    pub stage_timeout_secs: u64,

    /// Explicit run id (defaults to the start timestamp).
    #[arg(long)]
    pub run_id: Option<String>,
}

/// Arguments for `sqlforge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub pipeline: PipelineArgs,

    /// Directory holding `{db_id}/{db_id}.sqlite` databases.
    #[arg(long, default_value = DEFAULT_DB_ROOT)]
    pub db_root: PathBuf,

    /// API key for the completion endpoint.
    #[arg(long, env = "OPENROUTER_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Base URL of the OpenAI-compatible completion endpoint.
    #[arg(long, env = "LITELLM_API_BASE", default_value = DEFAULT_API_BASE)]
    pub api_base: String,

    /// Print the run summary as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_pipeline_command(*args).await,
        Commands::Validate(args) => run_validate_command(args),
        Commands::Stages => {
            print_stages();
            Ok(())
        }
    }
}

/// Builds the immutable run configuration from the flags.
///
/// Resume flags are checked before the pipeline so a resume request without
/// its parameters fails first.
pub fn build_run_config(args: &PipelineArgs) -> anyhow::Result<RunConfig> {
    let mode = RunMode::from_flags(
        args.use_checkpoint,
        args.checkpoint_nodes.as_deref(),
        args.checkpoint_dir.as_deref(),
    )?;

    let setup = match &args.pipeline_setup {
        Some(text) => load_pipeline_setup(text)?,
        None => PipelineDefinition::default_setup(),
    };
    let stage_list = args
        .pipeline_nodes
        .clone()
        .unwrap_or_else(PipelineDefinition::default_stage_list);
    let pipeline = PipelineDefinition::from_text(&stage_list, &setup)?;

    let mut config = RunConfig::new(&args.data_path, pipeline)
        .with_data_mode(&args.data_mode)
        .with_results_root(&args.results_dir)
        .with_mode(mode)
        .with_max_concurrency(args.concurrency)
        .with_stage_timeout(Duration::from_secs(args.stage_timeout_secs));
    if let Some(run_id) = &args.run_id {
        config = config.with_run_id(run_id);
    }

    config.validate()?;
    Ok(config)
}

fn build_llm_client(args: &RunArgs) -> anyhow::Result<Arc<dyn LlmProvider>> {
    let api_key = args
        .api_key
        .clone()
        .or_else(|| std::env::var("LITELLM_API_KEY").ok());

    if api_key.is_none() {
        warn!("No API key configured; requests go to {} unauthenticated", args.api_base);
    }

    let client = LiteLlmClient::new(&args.api_base, api_key, DEFAULT_MODEL)
        .context("Failed to initialize LLM client")?;
    Ok(Arc::new(client))
}

async fn run_pipeline_command(args: RunArgs) -> anyhow::Result<()> {
    init_metrics().context("Failed to register metrics")?;

    let config = build_run_config(&args.pipeline)?;
    let data_path = config.data_path.clone();

    let llm = build_llm_client(&args)?;
    let catalog = Arc::new(SqliteCatalog::new(&args.db_root));
    let registry = StageRegistry::standard(llm, catalog);

    let mut manager = RunManager::new(config, registry, Arc::new(FileCheckpointStore::new()))?;

    let records = load_dataset(&data_path).await?;
    manager.initialize_tasks(records)?;
    manager.prepare_run_dir().await?;
    info!(run_dir = %manager.config().run_dir().display(), "Prepared run directory");

    manager.run_tasks().await;
    let outputs = manager.generate_sql_files().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(manager.summary())?);
    } else {
        print_summary(manager.summary());
        println!("SQL files:   {}", outputs.sql_files);
        println!("Predictions: {}", outputs.predictions.display());
        println!("Report:      {}", outputs.report.display());
    }

    Ok(())
}

fn run_validate_command(args: PipelineArgs) -> anyhow::Result<()> {
    let config = build_run_config(&args)?;

    println!("Pipeline: {}", config.pipeline.name());
    println!("Run dir:  {}", config.run_dir().display());
    if let RunMode::Resume { source, .. } = &config.mode {
        println!("Resume:   {}", source.display());
    }
    println!();
    for (position, step) in config.execution_plan().iter().enumerate() {
        let note = if step.restore_only {
            " (restore only)"
        } else if config.mode.resumes(step.kind) {
            " (restore or execute)"
        } else {
            ""
        };
        println!("  {}. {}{}", position + 1, step.kind, note);
    }
    Ok(())
}

fn print_stages() {
    for kind in StageKind::ALL {
        println!("{}", kind);
        println!("  keys:     {}", kind.accepted_keys().join(", "));
        if !kind.accepted_modes().is_empty() {
            println!("  modes:    {}", kind.accepted_modes().join(", "));
        }
        if !kind.required_inputs().is_empty() {
            println!("  requires: {}", kind.required_inputs().join(", "));
        }
        println!("  produces: {}", kind.produced_fields().join(", "));
    }
}

fn print_summary(summary: &RunSummary) {
    println!(
        "Tasks: {} total, {} succeeded, {} failed",
        summary.total_tasks, summary.succeeded, summary.failed
    );
    for stage in &summary.stages {
        println!(
            "  {:<22} executed={:<5} restored={:<5} failed={:<5} skipped={}",
            stage.stage.as_str(),
            stage.executed,
            stage.restored,
            stage.failed,
            stage.skipped
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;

    fn pipeline_args(extra: &[&str]) -> PipelineArgs {
        let mut argv = vec!["sqlforge", "validate"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Validate(args) => args,
            _ => panic!("expected validate"),
        }
    }

    #[test]
    fn test_defaults() {
        let args = pipeline_args(&[]);
        assert_eq!(args.data_mode, "dev");
        assert_eq!(args.results_dir, PathBuf::from("./results"));
        assert_eq!(args.concurrency, DEFAULT_MAX_CONCURRENCY);

        let config = build_run_config(&args).unwrap();
        assert_eq!(config.pipeline.stage_order(), &StageKind::ALL);
        assert_eq!(config.mode, RunMode::Fresh);
    }

    #[test]
    fn test_resume_without_dir_is_fatal() {
        let args = pipeline_args(&[
            "--use-checkpoint",
            "--checkpoint-nodes",
            "keyword_extraction",
        ]);
        let err = build_run_config(&args).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::MissingResumeParameter("--checkpoint-dir"))
        ));
    }

    #[test]
    fn test_resume_plan_and_run_dir() {
        let args = pipeline_args(&[
            "--pipeline-nodes",
            "column_filtering+table_selection",
            "--use-checkpoint",
            "--checkpoint-nodes",
            "keyword_extraction+entity_retrieval",
            "--checkpoint-dir",
            "results/dev/old",
            "--run-id",
            "2024-05-01-10-00-00",
        ]);
        let config = build_run_config(&args).unwrap();

        let plan: Vec<(StageKind, bool)> = config
            .execution_plan()
            .iter()
            .map(|step| (step.kind, step.restore_only))
            .collect();
        assert_eq!(
            plan,
            vec![
                (StageKind::KeywordExtraction, true),
                (StageKind::EntityRetrieval, true),
                (StageKind::ColumnFiltering, false),
                (StageKind::TableSelection, false),
            ]
        );
        assert_eq!(
            config.run_dir(),
            PathBuf::from("./results/dev/column_filtering+table_selection/dev/2024-05-01-10-00-00")
        );
    }

    #[test]
    fn test_inline_setup_is_validated() {
        let args = pipeline_args(&[
            "--pipeline-nodes",
            "context_retrieval",
            "--pipeline-setup",
            r#"{"context_retrieval": {"mode": "vector_db", "engine": "gpt-4"}}"#,
        ]);
        let err = build_run_config(&args).unwrap_err();
        assert!(err.to_string().contains("engine"));
    }

    #[test]
    fn test_run_args_parse() {
        let cli = Cli::try_parse_from([
            "sqlforge",
            "--log-level",
            "debug",
            "run",
            "--db-root",
            "/tmp/dbs",
            "--api-base",
            "http://localhost:4000",
            "--concurrency",
            "2",
        ])
        .unwrap();
        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.db_root, PathBuf::from("/tmp/dbs"));
                assert_eq!(args.api_base, "http://localhost:4000");
                assert_eq!(args.pipeline.concurrency, 2);
            }
            _ => panic!("expected run"),
        }
    }
}
