//! Command-line interface for sqlforge.
//!
//! Provides commands for running pipelines, validating pipeline and resume
//! flags, and listing the stage registry.

mod commands;

pub use commands::{
    build_run_config, parse_cli, run, run_with_cli, Cli, Commands, PipelineArgs, RunArgs,
};
