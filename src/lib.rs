//! sqlforge: multi-stage text-to-SQL pipeline runner.
//!
//! Applies an ordered, validated sequence of stages to every question of a
//! dataset, stage by stage, checkpointing each task's state after each stage
//! so interrupted or partial runs can be resumed.

pub mod catalog;
pub mod checkpoint;
pub mod cli;
pub mod error;
pub mod llm;
pub mod metrics;
pub mod pipeline;
pub mod prompts;
pub mod stages;
pub mod utils;

// Re-export commonly used error types
pub use error::{
    CatalogError, CheckpointError, ConfigError, DatasetError, LlmError, OutputError, RunError,
    StageError,
};
