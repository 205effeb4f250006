//! Tasks: one dataset example plus its evolving intermediate results.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DatasetError;

use super::config::StageKind;

/// Named values accumulated on a task, or produced by one stage invocation.
pub type Fields = BTreeMap<String, Value>;

/// One example of the input dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub question: String,
    pub db_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
    /// Gold SQL, used by the `corrects` selection mode.
    #[serde(
        default,
        rename = "SQL",
        alias = "sql",
        skip_serializing_if = "Option::is_none"
    )]
    pub gold_sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<String>,
    /// Any other fields of the record, kept verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl DatasetRecord {
    pub fn new(question: impl Into<String>, db_id: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            db_id: db_id.into(),
            question_id: None,
            evidence: None,
            gold_sql: None,
            difficulty: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_question_id(mut self, question_id: impl Into<Value>) -> Self {
        self.question_id = Some(question_id.into());
        self
    }

    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence = Some(evidence.into());
        self
    }

    pub fn with_gold_sql(mut self, sql: impl Into<String>) -> Self {
        self.gold_sql = Some(sql.into());
        self
    }
}

/// Reads the dataset file fully into memory.
///
/// # Errors
///
/// Returns `DatasetError` when the file cannot be read, is not a JSON
/// array, or a record lacks `question` or `db_id`.
pub async fn load_dataset(path: impl AsRef<Path>) -> Result<Vec<DatasetRecord>, DatasetError> {
    let path = path.as_ref();
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| DatasetError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    parse_dataset(&contents)
}

/// Parses dataset JSON text.
pub fn parse_dataset(contents: &str) -> Result<Vec<DatasetRecord>, DatasetError> {
    let value: Value = serde_json::from_str(contents)?;
    let Value::Array(items) = value else {
        return Err(DatasetError::NotAnArray);
    };

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            for field in ["question", "db_id"] {
                if !item.get(field).is_some_and(Value::is_string) {
                    return Err(DatasetError::MissingField { index, field });
                }
            }
            Ok(serde_json::from_value(item)?)
        })
        .collect()
}

/// Per-(task, stage) status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    /// Restored from an existing checkpoint; the stage was not invoked.
    Checkpointed,
    /// Invoked during this run and checkpointed.
    Executed,
    Failed,
}

/// Why and where a task stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub stage: StageKind,
    pub reason: String,
}

/// One dataset example carried through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub id: String,
    /// Position of the example in the dataset.
    pub index: usize,
    pub input: DatasetRecord,
    pub state: Fields,
    pub completed_stages: Vec<StageKind>,
    stage_status: BTreeMap<StageKind, StageStatus>,
    failure: Option<TaskFailure>,
}

impl Task {
    pub fn new(index: usize, input: DatasetRecord) -> Self {
        Self {
            id: derive_task_id(index, &input),
            index,
            input,
            state: Fields::new(),
            completed_stages: Vec::new(),
            stage_status: BTreeMap::new(),
            failure: None,
        }
    }

    pub fn with_state(mut self, state: Fields) -> Self {
        self.state = state;
        self
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    pub fn failure(&self) -> Option<&TaskFailure> {
        self.failure.as_ref()
    }

    pub fn has_completed(&self, kind: StageKind) -> bool {
        self.completed_stages.contains(&kind)
    }

    pub fn status(&self, kind: StageKind) -> StageStatus {
        self.stage_status
            .get(&kind)
            .copied()
            .unwrap_or(StageStatus::Pending)
    }

    pub fn stage_statuses(&self) -> &BTreeMap<StageKind, StageStatus> {
        &self.stage_status
    }

    /// State after applying `fields`, without mutating the task.
    pub fn merged_state(&self, fields: &Fields) -> Fields {
        let mut state = self.state.clone();
        merge_fields(&mut state, fields);
        state
    }

    /// Replaces the state with a restored snapshot.
    pub fn record_checkpointed(&mut self, kind: StageKind, snapshot: Fields) {
        self.state = snapshot;
        self.complete(kind, StageStatus::Checkpointed);
    }

    /// Installs the state computed by an executed stage.
    pub fn record_executed(&mut self, kind: StageKind, state: Fields) {
        self.state = state;
        self.complete(kind, StageStatus::Executed);
    }

    pub fn record_failure(&mut self, kind: StageKind, reason: impl Into<String>) {
        self.stage_status.insert(kind, StageStatus::Failed);
        self.failure = Some(TaskFailure {
            stage: kind,
            reason: reason.into(),
        });
    }

    fn complete(&mut self, kind: StageKind, status: StageStatus) {
        if !self.completed_stages.contains(&kind) {
            self.completed_stages.push(kind);
        }
        self.stage_status.insert(kind, status);
    }
}

/// Inserts produced fields into a state. Reapplying the same fields is a no-op.
pub fn merge_fields(state: &mut Fields, fields: &Fields) {
    for (name, value) in fields {
        state.insert(name.clone(), value.clone());
    }
}

/// Deterministic task id: `{db_id}_{question_id}`, or `{db_id}_{index}`
/// when the record carries no question id.
pub fn derive_task_id(index: usize, record: &DatasetRecord) -> String {
    let suffix = match &record.question_id {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => index.to_string(),
    };
    sanitize(&format!("{}_{}", record.db_id, suffix))
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Builds one task per record, each starting from `initial` state.
///
/// # Errors
///
/// Returns `DatasetError::DuplicateTaskId` when two records map to the same id.
pub fn build_tasks(records: Vec<DatasetRecord>, initial: &Fields) -> Result<Vec<Task>, DatasetError> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .enumerate()
        .map(|(index, record)| {
            let task = Task::new(index, record).with_state(initial.clone());
            if !seen.insert(task.id.clone()) {
                return Err(DatasetError::DuplicateTaskId(task.id));
            }
            Ok(task)
        })
        .collect()
}
