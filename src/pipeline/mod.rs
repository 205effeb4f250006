//! Pipeline definition, tasks and the stage-major run manager.
//!
//! # Architecture
//!
//! - **Config**: stage registry metadata, pipeline validation and the
//!   immutable [`RunConfig`]
//! - **Task**: dataset records and the per-task state they accumulate
//! - **RunManager**: applies each plan step to every task, consulting and
//!   updating the checkpoint store
//! - **Output**: SQL files, predictions and the run report
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sqlforge::checkpoint::FileCheckpointStore;
//! use sqlforge::pipeline::{load_dataset, PipelineDefinition, RunConfig, RunManager};
//! use sqlforge::stages::StageRegistry;
//!
//! let pipeline = PipelineDefinition::from_text(
//!     &PipelineDefinition::default_stage_list(),
//!     &PipelineDefinition::default_setup(),
//! )?;
//! let config = RunConfig::new("./data/dev/dev.json", pipeline);
//!
//! let mut manager = RunManager::new(config, registry, Arc::new(FileCheckpointStore::new()))?;
//! manager.prepare_run_dir().await?;
//! manager.initialize_tasks(load_dataset("./data/dev/dev.json").await?)?;
//! manager.run_tasks().await;
//! manager.generate_sql_files().await?;
//! ```

pub mod config;
pub mod output;
pub mod run_manager;
pub mod task;

pub use config::{
    fields, generate_run_id, load_pipeline_setup, parse_stage_kinds, split_stage_list,
    PipelineDefinition, PlanStep, RunConfig, RunMode, StageConfig, StageKind,
    DEFAULT_MAX_CONCURRENCY, DEFAULT_SAMPLING_COUNT, DEFAULT_STAGE_TIMEOUT, DEFAULT_TOP_K,
    STAGE_SEPARATOR,
};
pub use output::{OutputSummary, OutputWriter, Prediction, RunReport, TaskOutcome, TaskReport};
pub use run_manager::{RunManager, RunSummary, StageSummary};
pub use task::{
    build_tasks, derive_task_id, load_dataset, merge_fields, parse_dataset, DatasetRecord,
    Fields, StageStatus, Task, TaskFailure,
};
