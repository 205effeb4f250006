//! Stage capability, field contracts, and the stage registry.
//!
//! A stage is an opaque function `(task state, stage config) -> new fields`.
//! The run manager only sees the [`Stage`] trait; concrete implementations
//! are injected through a [`StageRegistry`] keyed by [`StageKind`], so the
//! orchestration core can be driven by deterministic stubs in tests.

mod generation;
mod keywords;
mod retrieval;
mod selection;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use tracing::warn;

use crate::catalog::{Catalog, DatabaseSchema, SchemaSelection};
use crate::error::StageError;
use crate::llm::{GenerationRequest, LlmProvider};
use crate::pipeline::{fields, Fields, StageConfig, StageKind, Task};
use crate::prompts::{Prompt, QuestionContext};
use crate::utils::json_extraction::try_extract_json_from_response;

pub use generation::CandidateGenerationStage;
pub use keywords::KeywordExtractionStage;
pub use retrieval::{ContextRetrievalStage, EntityRetrievalStage};
pub use selection::{ColumnFilteringStage, ColumnSelectionStage, TableSelectionStage};

/// Fields a stage reads and writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageContract {
    pub required: Vec<String>,
    pub produces: Vec<String>,
}

impl StageContract {
    pub fn new<R, P>(required: R, produces: P) -> Self
    where
        R: IntoIterator,
        R::Item: Into<String>,
        P: IntoIterator,
        P::Item: Into<String>,
    {
        Self {
            required: required.into_iter().map(Into::into).collect(),
            produces: produces.into_iter().map(Into::into).collect(),
        }
    }

    /// The built-in contract of a stage type.
    pub fn for_kind(kind: StageKind) -> Self {
        Self::new(
            kind.required_inputs().iter().copied(),
            kind.produced_fields().iter().copied(),
        )
    }

    /// Fails with the first required field missing from `state`.
    pub fn check_inputs(&self, state: &Fields) -> Result<(), StageError> {
        match self.required.iter().find(|name| !state.contains_key(*name)) {
            Some(missing) => Err(StageError::MissingInput(missing.clone())),
            None => Ok(()),
        }
    }

    /// Fails with the first produced field the contract does not declare.
    pub fn check_outputs(&self, produced: &Fields) -> Result<(), StageError> {
        match produced.keys().find(|name| !self.produces.contains(*name)) {
            Some(undeclared) => Err(StageError::UndeclaredField(undeclared.clone())),
            None => Ok(()),
        }
    }
}

/// A named processing step applied to one task at a time.
#[async_trait]
pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;

    fn contract(&self) -> StageContract {
        StageContract::for_kind(self.kind())
    }

    /// Computes the fields this stage adds for `task`.
    ///
    /// Must not depend on any other task.
    async fn run(&self, task: &Task, config: &StageConfig) -> Result<Fields, StageError>;
}

/// Stage implementations keyed by stage type.
#[derive(Clone, Default)]
pub struct StageRegistry {
    stages: HashMap<StageKind, Arc<dyn Stage>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The shipped implementations of all seven stages.
    pub fn standard(llm: Arc<dyn LlmProvider>, catalog: Arc<dyn Catalog>) -> Self {
        Self::new()
            .with_stage(Arc::new(KeywordExtractionStage::new(Arc::clone(&llm))))
            .with_stage(Arc::new(EntityRetrievalStage::new(Arc::clone(&catalog))))
            .with_stage(Arc::new(ContextRetrievalStage::new(Arc::clone(&catalog))))
            .with_stage(Arc::new(ColumnFilteringStage::new(
                Arc::clone(&llm),
                Arc::clone(&catalog),
            )))
            .with_stage(Arc::new(TableSelectionStage::new(
                Arc::clone(&llm),
                Arc::clone(&catalog),
            )))
            .with_stage(Arc::new(ColumnSelectionStage::new(
                Arc::clone(&llm),
                Arc::clone(&catalog),
            )))
            .with_stage(Arc::new(CandidateGenerationStage::new(llm, catalog)))
    }

    /// Registers a stage, replacing any previous implementation of its kind.
    pub fn register(&mut self, stage: Arc<dyn Stage>) -> Option<Arc<dyn Stage>> {
        self.stages.insert(stage.kind(), stage)
    }

    pub fn with_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.register(stage);
        self
    }

    pub fn get(&self, kind: StageKind) -> Option<Arc<dyn Stage>> {
        self.stages.get(&kind).cloned()
    }

    pub fn contains(&self, kind: StageKind) -> bool {
        self.stages.contains_key(&kind)
    }

    /// Registered kinds in canonical order.
    pub fn kinds(&self) -> Vec<StageKind> {
        StageKind::ALL
            .into_iter()
            .filter(|kind| self.contains(*kind))
            .collect()
    }
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRegistry")
            .field("stages", &self.kinds())
            .finish()
    }
}

pub(crate) fn question_context(task: &Task) -> QuestionContext<'_> {
    QuestionContext {
        question: &task.input.question,
        hint: task.input.evidence.as_deref().unwrap_or(""),
    }
}

/// Sends one prompt and returns the completion text.
pub(crate) async fn complete(
    llm: &dyn LlmProvider,
    config: &StageConfig,
    prompt: Prompt,
) -> Result<String, StageError> {
    let request = GenerationRequest::new(config.engine(), prompt.into_messages())
        .with_temperature(config.temperature())
        .with_api_base(config.base_uri());

    let response = llm.generate(request).await?;
    response
        .first_content()
        .filter(|content| !content.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| StageError::MalformedResponse("empty completion".to_string()))
}

/// Sends one prompt and parses the JSON payload of the reply.
pub(crate) async fn complete_json(
    llm: &dyn LlmProvider,
    config: &StageConfig,
    prompt: Prompt,
) -> Result<Value, StageError> {
    let content = complete(llm, config, prompt).await?;
    let extraction = try_extract_json_from_response(&content);
    let description = extraction.describe();
    extraction
        .into_value()
        .ok_or(StageError::MalformedResponse(description))
}

/// Runs `sampling_count` independent draws.
///
/// Failed samples are dropped as long as one succeeds; otherwise the first
/// error is returned.
pub(crate) async fn sample<T, F, Fut>(
    stage: StageKind,
    config: &StageConfig,
    draw: F,
) -> Result<Vec<T>, StageError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, StageError>>,
{
    let results = join_all((0..config.sampling_count()).map(|_| draw())).await;

    let mut values = Vec::new();
    let mut first_error = None;
    for result in results {
        match result {
            Ok(value) => values.push(value),
            Err(e) => {
                warn!(stage = %stage, error = %e, "Discarding failed sample");
                first_error.get_or_insert(e);
            }
        }
    }

    match (values.is_empty(), first_error) {
        (true, Some(e)) => Err(e),
        _ => Ok(values),
    }
}

/// Most frequent value; ties go to the earliest occurrence.
pub(crate) fn majority_vote<T: Clone + PartialEq>(samples: &[T]) -> Option<T> {
    let mut best: Option<(&T, usize)> = None;
    for candidate in samples {
        let votes = samples.iter().filter(|s| *s == candidate).count();
        if best.map_or(true, |(_, top)| votes > top) {
            best = Some((candidate, votes));
        }
    }
    best.map(|(value, _)| value.clone())
}

/// Reads a `{table: [columns]}` or `[tables]` field as a selection over `schema`.
pub(crate) fn selection_field(
    state: &Fields,
    field: &str,
    schema: &DatabaseSchema,
) -> Option<SchemaSelection> {
    state
        .get(field)
        .map(|value| schema.resolve_selection(value))
        .filter(|selection| !selection.is_empty())
}

/// The narrowest schema view earlier stages have produced.
pub(crate) fn narrowest_selection(state: &Fields, schema: &DatabaseSchema) -> Option<SchemaSelection> {
    [
        fields::SELECTED_SCHEMA,
        fields::SELECTED_TABLES,
        fields::FILTERED_SCHEMA,
    ]
    .into_iter()
    .find_map(|field| selection_field(state, field, schema))
}

pub(crate) fn selection_to_value(selection: &SchemaSelection) -> Value {
    serde_json::to_value(selection).unwrap_or(Value::Null)
}

/// Merges table/column lists, keeping names sorted and unique.
pub(crate) fn union_selection(into: &mut SchemaSelection, other: &SchemaSelection) {
    for (table, columns) in other {
        let entry = into.entry(table.clone()).or_default();
        entry.extend(columns.iter().cloned());
        entry.sort();
        entry.dedup();
    }
}

pub(crate) fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn single_field(name: &str, value: Value) -> Fields {
    let mut produced = BTreeMap::new();
    produced.insert(name.to_string(), value);
    produced
}
