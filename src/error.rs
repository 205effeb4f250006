//! Error types for sqlforge operations.
//!
//! Defines error types for every subsystem of the runner:
//! - Pipeline definition and run configuration
//! - Dataset loading and task initialization
//! - Checkpoint persistence
//! - Stage execution (per task, recoverable)
//! - LLM engine and schema catalog collaborators
//! - Output materialization

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while validating the pipeline definition or run configuration.
///
/// All of these are fatal: the run does not start.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unknown stage '{0}'")]
    UnknownStage(String),

    #[error("Stage '{0}' is declared more than once")]
    DuplicateStage(String),

    #[error("Stage '{0}' has no configuration entry")]
    MissingStageConfig(String),

    #[error("Stage '{stage}' does not accept configuration key '{key}'")]
    UnknownConfigKey { stage: String, key: String },

    #[error("Invalid value for '{stage}.{key}': {message}")]
    InvalidConfigValue {
        stage: String,
        key: String,
        message: String,
    },

    #[error("Pipeline must declare at least one stage")]
    EmptyPipeline,

    #[error("Malformed pipeline setup: {0}")]
    MalformedSetup(String),

    #[error("Resume requested but {0} was not provided")]
    MissingResumeParameter(&'static str),

    #[error("No implementation registered for stage '{0}'")]
    MissingStageImplementation(String),

    #[error("Run directory already exists: {0:?}")]
    RunDirectoryExists(PathBuf),

    #[error("Invalid run setting: {0}")]
    InvalidSetting(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while loading the dataset and creating tasks.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Failed to read dataset {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed dataset: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Dataset must be a JSON array of records")]
    NotAnArray,

    #[error("Record {index} is missing required field '{field}'")]
    MissingField { index: usize, field: &'static str },

    #[error("Duplicate task id '{0}'")]
    DuplicateTaskId(String),
}

/// Errors raised by checkpoint stores.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Corrupt checkpoint for task '{task_id}' at stage '{stage}': {reason}")]
    Corrupt {
        task_id: String,
        stage: String,
        reason: String,
    },
}

/// Errors raised by a single stage invocation for a single task.
///
/// These are recoverable at run level: the task is marked failed and the
/// run continues for every other task.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Missing required input field '{0}'")]
    MissingInput(String),

    #[error("Stage produced undeclared field '{0}'")]
    UndeclaredField(String),

    #[error("Engine error: {0}")]
    Engine(#[from] LlmError),

    #[error("Malformed engine response: {0}")]
    MalformedResponse(String),

    #[error("Prompt rendering failed: {0}")]
    Prompt(#[from] tera::Error),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Stage timed out after {millis} ms")]
    Timeout { millis: u64 },

    #[error("Unsupported mode '{0}'")]
    UnsupportedMode(String),

    #[error("Stage produced no result: {0}")]
    EmptyResult(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key: OPENROUTER_API_KEY or LITELLM_API_KEY environment variable not set")]
    MissingApiKey,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },
}

/// Errors raised by schema catalogs.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Database '{db_id}' not found at {path:?}")]
    DatabaseNotFound { db_id: String, path: PathBuf },

    #[error("Database '{0}' is not registered")]
    UnknownDatabase(String),

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),
}

/// Errors raised while writing run artifacts.
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Fatal run-level errors.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Output error: {0}")]
    Output(#[from] OutputError),
}
