//! Pipeline definition and run configuration.
//!
//! This module holds the fixed registry of stage types, the per-stage
//! configuration schemas, the validated `PipelineDefinition`, and the
//! immutable `RunConfig` that is built once at run start and threaded
//! through the run manager and every stage invocation.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::checkpoint::RunScope;
use crate::error::ConfigError;

/// Default number of retrieved entries for `context_retrieval`.
pub const DEFAULT_TOP_K: usize = 5;

/// Default number of samples drawn by sampling stages.
pub const DEFAULT_SAMPLING_COUNT: usize = 1;

/// Default upper bound on concurrent stage invocations within a stage.
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// Default timeout for a single stage invocation on a single task.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(600);

/// Separator used by the stage list text form (`a+b+c`).
pub const STAGE_SEPARATOR: char = '+';

/// Names of the task state fields produced by the shipped stages.
pub mod fields {
    pub const KEYWORDS: &str = "keywords";
    pub const SIMILAR_COLUMNS: &str = "similar_columns";
    pub const SIMILAR_VALUES: &str = "similar_values";
    pub const SCHEMA_WITH_DESCRIPTIONS: &str = "schema_with_descriptions";
    pub const FILTERED_SCHEMA: &str = "filtered_schema";
    pub const SELECTED_TABLES: &str = "selected_tables";
    pub const SELECTED_SCHEMA: &str = "selected_schema";
    pub const SQL: &str = "sql";
    pub const SQL_CANDIDATES: &str = "sql_candidates";
}

/// The closed set of stage types, in canonical pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    KeywordExtraction,
    EntityRetrieval,
    ContextRetrieval,
    ColumnFiltering,
    TableSelection,
    ColumnSelection,
    CandidateGeneration,
}

impl StageKind {
    /// Every stage type, in canonical order.
    pub const ALL: [StageKind; 7] = [
        StageKind::KeywordExtraction,
        StageKind::EntityRetrieval,
        StageKind::ContextRetrieval,
        StageKind::ColumnFiltering,
        StageKind::TableSelection,
        StageKind::ColumnSelection,
        StageKind::CandidateGeneration,
    ];

    /// Registry name of the stage.
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::KeywordExtraction => "keyword_extraction",
            StageKind::EntityRetrieval => "entity_retrieval",
            StageKind::ContextRetrieval => "context_retrieval",
            StageKind::ColumnFiltering => "column_filtering",
            StageKind::TableSelection => "table_selection",
            StageKind::ColumnSelection => "column_selection",
            StageKind::CandidateGeneration => "candidate_generation",
        }
    }

    /// Configuration keys this stage accepts.
    pub fn accepted_keys(&self) -> &'static [&'static str] {
        match self {
            StageKind::KeywordExtraction | StageKind::ColumnFiltering => {
                &["engine", "temperature", "base_uri"]
            }
            StageKind::EntityRetrieval => &["mode"],
            StageKind::ContextRetrieval => &["mode", "top_k"],
            StageKind::TableSelection | StageKind::ColumnSelection => {
                &["mode", "engine", "temperature", "base_uri", "sampling_count"]
            }
            StageKind::CandidateGeneration => {
                &["engine", "temperature", "base_uri", "sampling_count"]
            }
        }
    }

    /// Values accepted for the `mode` key (empty when the stage has no mode).
    pub fn accepted_modes(&self) -> &'static [&'static str] {
        match self {
            StageKind::EntityRetrieval => &["ask_model"],
            StageKind::ContextRetrieval => &["vector_db"],
            StageKind::TableSelection | StageKind::ColumnSelection => &["ask_model", "corrects"],
            _ => &[],
        }
    }

    /// State fields that must be present before the stage runs.
    pub fn required_inputs(&self) -> &'static [&'static str] {
        match self {
            StageKind::EntityRetrieval | StageKind::ContextRetrieval => &[fields::KEYWORDS],
            _ => &[],
        }
    }

    /// State fields the stage is allowed to write.
    pub fn produced_fields(&self) -> &'static [&'static str] {
        match self {
            StageKind::KeywordExtraction => &[fields::KEYWORDS],
            StageKind::EntityRetrieval => &[fields::SIMILAR_COLUMNS, fields::SIMILAR_VALUES],
            StageKind::ContextRetrieval => &[fields::SCHEMA_WITH_DESCRIPTIONS],
            StageKind::ColumnFiltering => &[fields::FILTERED_SCHEMA],
            StageKind::TableSelection => &[fields::SELECTED_TABLES],
            StageKind::ColumnSelection => &[fields::SELECTED_SCHEMA],
            StageKind::CandidateGeneration => &[fields::SQL, fields::SQL_CANDIDATES],
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownStage(s.to_string()))
    }
}

/// Validated configuration of one stage.
///
/// Only constructed through [`StageConfig::from_value`], so every field
/// present has passed the owning stage's schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling_count: Option<usize>,
}

impl StageConfig {
    /// Validates a raw configuration record against the schema of `kind`.
    pub fn from_value(kind: StageKind, value: &Value) -> Result<Self, ConfigError> {
        let stage = kind.as_str();
        let object = value.as_object().ok_or_else(|| ConfigError::InvalidConfigValue {
            stage: stage.to_string(),
            key: "*".to_string(),
            message: "stage configuration must be an object".to_string(),
        })?;

        let invalid = |key: &str, message: String| ConfigError::InvalidConfigValue {
            stage: stage.to_string(),
            key: key.to_string(),
            message,
        };

        let mut config = StageConfig::default();
        for (key, raw) in object {
            if !kind.accepted_keys().contains(&key.as_str()) {
                return Err(ConfigError::UnknownConfigKey {
                    stage: stage.to_string(),
                    key: key.clone(),
                });
            }

            match key.as_str() {
                "mode" => {
                    let mode = raw
                        .as_str()
                        .ok_or_else(|| invalid(key, "expected a string".to_string()))?;
                    if !kind.accepted_modes().contains(&mode) {
                        return Err(invalid(
                            key,
                            format!(
                                "unsupported mode '{}', expected one of {:?}",
                                mode,
                                kind.accepted_modes()
                            ),
                        ));
                    }
                    config.mode = Some(mode.to_string());
                }
                "engine" | "base_uri" => {
                    let text = raw
                        .as_str()
                        .ok_or_else(|| invalid(key, "expected a string".to_string()))?
                        .to_string();
                    if key == "engine" {
                        config.engine = Some(text);
                    } else {
                        config.base_uri = Some(text);
                    }
                }
                "temperature" => {
                    let temperature = raw
                        .as_f64()
                        .ok_or_else(|| invalid(key, "expected a number".to_string()))?;
                    if !(0.0..=2.0).contains(&temperature) {
                        return Err(invalid(key, "must be between 0.0 and 2.0".to_string()));
                    }
                    config.temperature = Some(temperature);
                }
                "top_k" | "sampling_count" => {
                    let count = raw
                        .as_u64()
                        .filter(|n| *n >= 1)
                        .ok_or_else(|| invalid(key, "expected a positive integer".to_string()))?
                        as usize;
                    if key == "top_k" {
                        config.top_k = Some(count);
                    } else {
                        config.sampling_count = Some(count);
                    }
                }
                _ => unreachable!("accepted_keys covers every matched key"),
            }
        }

        Ok(config)
    }

    /// Engine identifier, empty when the engine client default should be used.
    pub fn engine(&self) -> &str {
        self.engine.as_deref().unwrap_or("")
    }

    /// Endpoint override, `None` when unset or empty.
    pub fn base_uri(&self) -> Option<&str> {
        self.base_uri.as_deref().filter(|uri| !uri.is_empty())
    }

    pub fn temperature(&self) -> f64 {
        self.temperature.unwrap_or(0.0)
    }

    pub fn top_k(&self) -> usize {
        self.top_k.unwrap_or(DEFAULT_TOP_K)
    }

    pub fn sampling_count(&self) -> usize {
        self.sampling_count.unwrap_or(DEFAULT_SAMPLING_COUNT)
    }

    pub fn mode(&self) -> Option<&str> {
        self.mode.as_deref()
    }
}

/// A validated, ordered pipeline of stages with their configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineDefinition {
    stage_order: Vec<StageKind>,
    stage_config: BTreeMap<StageKind, StageConfig>,
}

impl PipelineDefinition {
    /// Validates a stage order against a configuration block.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when a stage name is unknown or duplicated, when a
    /// declared stage has no configuration entry, or when any configuration
    /// entry carries a key or value its stage does not accept.
    pub fn validate<S: AsRef<str>>(
        stage_order: &[S],
        stage_config: &Value,
    ) -> Result<Self, ConfigError> {
        let order = parse_stage_kinds(stage_order)?;
        if order.is_empty() {
            return Err(ConfigError::EmptyPipeline);
        }

        let block = stage_config.as_object().ok_or_else(|| {
            ConfigError::MalformedSetup("pipeline setup must be a JSON object".to_string())
        })?;

        let mut configs = BTreeMap::new();
        for (name, raw) in block {
            let kind = StageKind::from_str(name)?;
            configs.insert(kind, StageConfig::from_value(kind, raw)?);
        }

        if let Some(missing) = order.iter().find(|kind| !configs.contains_key(kind)) {
            return Err(ConfigError::MissingStageConfig(missing.to_string()));
        }

        Ok(Self {
            stage_order: order,
            stage_config: configs,
        })
    }

    /// Validates the `a+b+c` text form of the stage order.
    pub fn from_text(stage_list: &str, stage_config: &Value) -> Result<Self, ConfigError> {
        Self::validate(&split_stage_list(stage_list), stage_config)
    }

    /// The built-in configuration block covering all seven stages.
    pub fn default_setup() -> Value {
        json!({
            "keyword_extraction": {
                "engine": "gpt-3.5-turbo-0125",
                "temperature": 0.2,
                "base_uri": ""
            },
            "entity_retrieval": {
                "mode": "ask_model"
            },
            "context_retrieval": {
                "mode": "vector_db",
                "top_k": 5
            },
            "column_filtering": {
                "engine": "gpt-3.5-turbo-0125",
                "temperature": 0.0,
                "base_uri": ""
            },
            "table_selection": {
                "mode": "ask_model",
                "engine": "gpt-4-turbo",
                "temperature": 0.0,
                "base_uri": "",
                "sampling_count": 1
            },
            "column_selection": {
                "mode": "ask_model",
                "engine": "gpt-4-turbo",
                "temperature": 0.0,
                "base_uri": "",
                "sampling_count": 1
            },
            "candidate_generation": {
                "engine": "gpt-4-turbo",
                "temperature": 0.0,
                "base_uri": "",
                "sampling_count": 1
            }
        })
    }

    /// The default stage list text (all seven stages, canonical order).
    pub fn default_stage_list() -> String {
        join_stage_list(&StageKind::ALL)
    }

    pub fn stage_order(&self) -> &[StageKind] {
        &self.stage_order
    }

    /// Configuration of a stage, including stages configured but not declared.
    pub fn config(&self, kind: StageKind) -> Option<&StageConfig> {
        self.stage_config.get(&kind)
    }

    pub fn contains(&self, kind: StageKind) -> bool {
        self.stage_order.contains(&kind)
    }

    /// Stage order in its `a+b+c` text form.
    pub fn name(&self) -> String {
        join_stage_list(&self.stage_order)
    }
}

/// Splits `a+b+c` into trimmed, non-empty names.
pub fn split_stage_list(text: &str) -> Vec<String> {
    text.split(STAGE_SEPARATOR)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

fn join_stage_list(kinds: &[StageKind]) -> String {
    kinds
        .iter()
        .map(StageKind::as_str)
        .collect::<Vec<_>>()
        .join(STAGE_SEPARATOR.encode_utf8(&mut [0; 4]))
}

/// Resolves stage names, rejecting unknown and duplicated entries.
pub fn parse_stage_kinds<S: AsRef<str>>(names: &[S]) -> Result<Vec<StageKind>, ConfigError> {
    let mut seen = HashSet::new();
    let mut kinds = Vec::with_capacity(names.len());
    for name in names {
        let kind = StageKind::from_str(name.as_ref())?;
        if !seen.insert(kind) {
            return Err(ConfigError::DuplicateStage(kind.to_string()));
        }
        kinds.push(kind);
    }
    Ok(kinds)
}

/// Parses a pipeline setup value.
///
/// `text` is either inline JSON or `@path` naming a `.json`, `.yaml` or
/// `.yml` file.
pub fn load_pipeline_setup(text: &str) -> Result<Value, ConfigError> {
    let Some(path) = text.strip_prefix('@') else {
        return serde_json::from_str(text).map_err(|e| ConfigError::MalformedSetup(e.to_string()));
    };

    let contents = std::fs::read_to_string(path)?;
    let is_yaml = Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));

    if is_yaml {
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::MalformedSetup(e.to_string()))
    } else {
        serde_json::from_str(&contents).map_err(|e| ConfigError::MalformedSetup(e.to_string()))
    }
}

/// Whether a run starts fresh or reuses checkpoints of an earlier run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RunMode {
    Fresh,
    Resume {
        /// Run directory of the earlier run.
        source: PathBuf,
        /// Stages treated as satisfied by existing checkpoints.
        stages: Vec<StageKind>,
    },
}

impl RunMode {
    /// Builds the run mode from the resume flags.
    ///
    /// # Errors
    ///
    /// Fails fast when resume is requested without checkpoint stages or
    /// without a checkpoint directory.
    pub fn from_flags(
        use_checkpoint: bool,
        checkpoint_nodes: Option<&str>,
        checkpoint_dir: Option<&Path>,
    ) -> Result<Self, ConfigError> {
        if !use_checkpoint {
            return Ok(RunMode::Fresh);
        }

        let nodes = checkpoint_nodes
            .map(split_stage_list)
            .filter(|names| !names.is_empty())
            .ok_or(ConfigError::MissingResumeParameter("--checkpoint-nodes"))?;
        let source = checkpoint_dir
            .filter(|dir| !dir.as_os_str().is_empty())
            .ok_or(ConfigError::MissingResumeParameter("--checkpoint-dir"))?;

        Ok(RunMode::Resume {
            source: source.to_path_buf(),
            stages: parse_stage_kinds(&nodes)?,
        })
    }

    /// Whether `kind` may be satisfied from an existing checkpoint.
    pub fn resumes(&self, kind: StageKind) -> bool {
        match self {
            RunMode::Fresh => false,
            RunMode::Resume { stages, .. } => stages.contains(&kind),
        }
    }

    /// Checkpoint scope of the earlier run, when resuming.
    pub fn source_scope(&self) -> Option<RunScope> {
        match self {
            RunMode::Fresh => None,
            RunMode::Resume { source, .. } => Some(RunScope::for_run_dir(source)),
        }
    }
}

/// One step of the execution plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlanStep {
    pub kind: StageKind,
    /// Restore-only steps are never executed; a task lacking a checkpoint fails.
    pub restore_only: bool,
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Immutable configuration of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunConfig {
    pub run_id: String,
    pub data_mode: String,
    pub data_path: PathBuf,
    pub results_root: PathBuf,
    pub pipeline: PipelineDefinition,
    pub mode: RunMode,
    pub max_concurrency: usize,
    pub stage_timeout_ms: u64,
}

impl RunConfig {
    /// Creates a fresh-run configuration with default settings.
    pub fn new(data_path: impl Into<PathBuf>, pipeline: PipelineDefinition) -> Self {
        Self {
            run_id: generate_run_id(),
            data_mode: "dev".to_string(),
            data_path: data_path.into(),
            results_root: PathBuf::from("./results"),
            pipeline,
            mode: RunMode::Fresh,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            stage_timeout_ms: duration_millis(DEFAULT_STAGE_TIMEOUT),
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn with_data_mode(mut self, data_mode: impl Into<String>) -> Self {
        self.data_mode = data_mode.into();
        self
    }

    pub fn with_results_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.results_root = root.into();
        self
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout_ms = duration_millis(timeout);
        self
    }

    /// Validates run-level settings.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidSetting` for out-of-range values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run_id.is_empty() {
            return Err(ConfigError::InvalidSetting(
                "run_id cannot be empty".to_string(),
            ));
        }

        if self.max_concurrency == 0 {
            return Err(ConfigError::InvalidSetting(
                "max_concurrency must be greater than 0".to_string(),
            ));
        }

        if self.stage_timeout_ms == 0 {
            return Err(ConfigError::InvalidSetting(
                "stage_timeout must be greater than 0".to_string(),
            ));
        }

        if let RunMode::Resume { stages, .. } = &self.mode {
            if stages.is_empty() {
                return Err(ConfigError::MissingResumeParameter("--checkpoint-nodes"));
            }
        }

        Ok(())
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }

    /// Directory holding this run's checkpoints and outputs.
    pub fn run_dir(&self) -> PathBuf {
        let dataset = self
            .data_path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("dataset");

        self.results_root
            .join(&self.data_mode)
            .join(self.pipeline.name())
            .join(dataset)
            .join(&self.run_id)
    }

    /// Scope under which this run writes its checkpoints.
    pub fn checkpoint_scope(&self) -> RunScope {
        RunScope::for_run_dir(self.run_dir())
    }

    /// Ordered steps applied to every task.
    ///
    /// Checkpoint stages missing from the declared order come first as
    /// restore-only steps, in canonical order, followed by the declared
    /// stages.
    pub fn execution_plan(&self) -> Vec<PlanStep> {
        let mut plan = Vec::new();

        if let RunMode::Resume { stages, .. } = &self.mode {
            let mut restore_only: Vec<StageKind> = stages
                .iter()
                .copied()
                .filter(|kind| !self.pipeline.contains(*kind))
                .collect();
            restore_only.sort();
            plan.extend(restore_only.into_iter().map(|kind| PlanStep {
                kind,
                restore_only: true,
            }));
        }

        plan.extend(self.pipeline.stage_order().iter().map(|&kind| PlanStep {
            kind,
            restore_only: false,
        }));
        plan
    }
}

/// Run identifier derived from the invocation start time.
pub fn generate_run_id() -> String {
    Local::now().format("%Y-%m-%d-%H-%M-%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_pipeline() -> PipelineDefinition {
        PipelineDefinition::from_text(
            &PipelineDefinition::default_stage_list(),
            &PipelineDefinition::default_setup(),
        )
        .expect("default pipeline is valid")
    }

    #[test]
    fn test_default_pipeline_is_valid() {
        let pipeline = default_pipeline();
        assert_eq!(pipeline.stage_order(), &StageKind::ALL);
        assert_eq!(
            pipeline
                .config(StageKind::ContextRetrieval)
                .map(StageConfig::top_k),
            Some(5)
        );
        assert_eq!(
            pipeline
                .config(StageKind::TableSelection)
                .and_then(StageConfig::mode),
            Some("ask_model")
        );
    }

    #[test]
    fn test_stage_kind_round_trip_names() {
        for kind in StageKind::ALL {
            assert_eq!(StageKind::from_str(kind.as_str()).unwrap(), kind);
        }
        assert!(matches!(
            StageKind::from_str("revision"),
            Err(ConfigError::UnknownStage(name)) if name == "revision"
        ));
    }

    #[test]
    fn test_rejects_unknown_stage_in_order() {
        let result = PipelineDefinition::validate(
            &["keyword_extraction", "revision"],
            &PipelineDefinition::default_setup(),
        );
        assert!(matches!(result, Err(ConfigError::UnknownStage(_))));
    }

    #[test]
    fn test_rejects_unknown_stage_in_config() {
        let mut setup = PipelineDefinition::default_setup();
        setup["revision"] = json!({"engine": "gpt-4"});
        let result = PipelineDefinition::validate(&["keyword_extraction"], &setup);
        assert!(matches!(result, Err(ConfigError::UnknownStage(_))));
    }

    #[test]
    fn test_rejects_missing_stage_config() {
        let setup = json!({"keyword_extraction": {"engine": "gpt-4"}});
        let result =
            PipelineDefinition::validate(&["keyword_extraction", "entity_retrieval"], &setup);
        assert!(matches!(
            result,
            Err(ConfigError::MissingStageConfig(name)) if name == "entity_retrieval"
        ));
    }

    #[test]
    fn test_rejects_unknown_config_key() {
        let setup = json!({"context_retrieval": {"mode": "vector_db", "engine": "gpt-4"}});
        let result = PipelineDefinition::validate(&["context_retrieval"], &setup);
        match result {
            Err(ConfigError::UnknownConfigKey { stage, key }) => {
                assert_eq!(stage, "context_retrieval");
                assert_eq!(key, "engine");
            }
            other => panic!("expected UnknownConfigKey, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_duplicate_stage() {
        let result = PipelineDefinition::validate(
            &["keyword_extraction", "keyword_extraction"],
            &PipelineDefinition::default_setup(),
        );
        assert!(matches!(result, Err(ConfigError::DuplicateStage(_))));
    }

    #[test]
    fn test_rejects_empty_pipeline() {
        let result = PipelineDefinition::from_text(" + ", &PipelineDefinition::default_setup());
        assert!(matches!(result, Err(ConfigError::EmptyPipeline)));
    }

    #[test]
    fn test_rejects_invalid_values() {
        let bad_temperature = json!({"keyword_extraction": {"temperature": 3.5}});
        assert!(matches!(
            PipelineDefinition::validate(&["keyword_extraction"], &bad_temperature),
            Err(ConfigError::InvalidConfigValue { key, .. }) if key == "temperature"
        ));

        let bad_top_k = json!({"context_retrieval": {"top_k": 0}});
        assert!(matches!(
            PipelineDefinition::validate(&["context_retrieval"], &bad_top_k),
            Err(ConfigError::InvalidConfigValue { key, .. }) if key == "top_k"
        ));

        let bad_mode = json!({"table_selection": {"mode": "guess"}});
        assert!(matches!(
            PipelineDefinition::validate(&["table_selection"], &bad_mode),
            Err(ConfigError::InvalidConfigValue { key, .. }) if key == "mode"
        ));

        let bad_engine = json!({"candidate_generation": {"engine": 4}});
        assert!(matches!(
            PipelineDefinition::validate(&["candidate_generation"], &bad_engine),
            Err(ConfigError::InvalidConfigValue { key, .. }) if key == "engine"
        ));
    }

    #[test]
    fn test_stage_config_defaults() {
        let config =
            StageConfig::from_value(StageKind::CandidateGeneration, &json!({"base_uri": ""}))
                .unwrap();
        assert_eq!(config.engine(), "");
        assert_eq!(config.base_uri(), None);
        assert_eq!(config.sampling_count(), 1);
        assert!((config.temperature() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_split_stage_list() {
        assert_eq!(
            split_stage_list("keyword_extraction + column_filtering+"),
            vec!["keyword_extraction", "column_filtering"]
        );
    }

    #[test]
    fn test_run_mode_requires_checkpoint_dir() {
        let result = RunMode::from_flags(true, Some("keyword_extraction"), None);
        assert!(matches!(
            result,
            Err(ConfigError::MissingResumeParameter("--checkpoint-dir"))
        ));
    }

    #[test]
    fn test_run_mode_requires_checkpoint_nodes() {
        let result = RunMode::from_flags(true, None, Some(Path::new("results/old")));
        assert!(matches!(
            result,
            Err(ConfigError::MissingResumeParameter("--checkpoint-nodes"))
        ));
    }

    #[test]
    fn test_run_mode_fresh_ignores_resume_flags() {
        let mode = RunMode::from_flags(false, None, None).unwrap();
        assert_eq!(mode, RunMode::Fresh);
        assert!(!mode.resumes(StageKind::KeywordExtraction));
    }

    #[test]
    fn test_execution_plan_places_restore_only_stages_first() {
        let pipeline = PipelineDefinition::validate(
            &["candidate_generation"],
            &PipelineDefinition::default_setup(),
        )
        .unwrap();
        let mode = RunMode::from_flags(
            true,
            Some("column_filtering+keyword_extraction+candidate_generation"),
            Some(Path::new("results/old")),
        )
        .unwrap();
        let config = RunConfig::new("data/dev.json", pipeline).with_mode(mode);

        let plan = config.execution_plan();
        assert_eq!(
            plan,
            vec![
                PlanStep {
                    kind: StageKind::KeywordExtraction,
                    restore_only: true
                },
                PlanStep {
                    kind: StageKind::ColumnFiltering,
                    restore_only: true
                },
                PlanStep {
                    kind: StageKind::CandidateGeneration,
                    restore_only: false
                },
            ]
        );
    }

    #[test]
    fn test_run_dir_layout() {
        let pipeline = PipelineDefinition::validate(
            &["keyword_extraction", "candidate_generation"],
            &PipelineDefinition::default_setup(),
        )
        .unwrap();
        let config = RunConfig::new("data/dev/dev.json", pipeline)
            .with_run_id("2024-05-01-10-00-00")
            .with_results_root("out");

        assert_eq!(
            config.run_dir(),
            PathBuf::from("out/dev/keyword_extraction+candidate_generation/dev/2024-05-01-10-00-00")
        );
    }

    #[test]
    fn test_run_config_validation() {
        let config = RunConfig::new("data/dev.json", default_pipeline());
        assert!(config.validate().is_ok());

        let config = RunConfig::new("data/dev.json", default_pipeline()).with_max_concurrency(0);
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("max_concurrency"));

        let config = RunConfig::new("data/dev.json", default_pipeline())
            .with_stage_timeout(Duration::from_secs(0));
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("stage_timeout"));
    }

    #[test]
    fn test_sub_second_stage_timeout_is_kept() {
        let config = RunConfig::new("data/dev.json", default_pipeline())
            .with_stage_timeout(Duration::from_millis(500));

        assert!(config.validate().is_ok());
        assert_eq!(config.stage_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_load_pipeline_setup_inline_and_yaml() {
        let value = load_pipeline_setup(r#"{"entity_retrieval": {"mode": "ask_model"}}"#).unwrap();
        assert_eq!(value["entity_retrieval"]["mode"], "ask_model");

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("setup.yaml");
        std::fs::write(&path, "context_retrieval:\n  mode: vector_db\n  top_k: 3\n").unwrap();
        let value = load_pipeline_setup(&format!("@{}", path.display())).unwrap();
        assert_eq!(value["context_retrieval"]["top_k"], 3);

        assert!(matches!(
            load_pipeline_setup("{not json"),
            Err(ConfigError::MalformedSetup(_))
        ));
    }
}
