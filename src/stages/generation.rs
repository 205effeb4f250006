//! Candidate generation: drafts SQL over the narrowest available schema view.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::catalog::Catalog;
use crate::error::StageError;
use crate::llm::LlmProvider;
use crate::pipeline::{fields, Fields, StageConfig, StageKind, Task};
use crate::prompts::build_candidate_generation_prompt;
use crate::utils::extract_sql_from_response;

use super::{complete, majority_vote, narrowest_selection, question_context, sample, Stage};

pub struct CandidateGenerationStage {
    llm: Arc<dyn LlmProvider>,
    catalog: Arc<dyn Catalog>,
}

impl CandidateGenerationStage {
    pub fn new(llm: Arc<dyn LlmProvider>, catalog: Arc<dyn Catalog>) -> Self {
        Self { llm, catalog }
    }
}

/// Renders `{table: {column: [values]}}` as `table.column = value` lines.
fn value_hints(state: &Fields) -> Vec<String> {
    let Some(tables) = state.get(fields::SIMILAR_VALUES).and_then(Value::as_object) else {
        return Vec::new();
    };

    let mut hints = Vec::new();
    for (table, columns) in tables {
        let Some(columns) = columns.as_object() else {
            continue;
        };
        for (column, values) in columns {
            for value in values.as_array().into_iter().flatten().filter_map(Value::as_str) {
                hints.push(format!("{}.{} = {}", table, column, value));
            }
        }
    }
    hints
}

/// Collapses whitespace so formatting differences do not split votes.
fn normalize_sql(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[async_trait]
impl Stage for CandidateGenerationStage {
    fn kind(&self) -> StageKind {
        StageKind::CandidateGeneration
    }

    async fn run(&self, task: &Task, config: &StageConfig) -> Result<Fields, StageError> {
        let schema = self.catalog.schema(&task.input.db_id).await?;
        let view = narrowest_selection(&task.state, &schema);
        let rendered = schema.render(view.as_ref());
        let rendered = rendered.as_str();
        let hints = value_hints(&task.state);
        let hints = hints.as_slice();
        let question = question_context(task);
        let question = &question;

        let candidates = sample(StageKind::CandidateGeneration, config, || async move {
            let prompt = build_candidate_generation_prompt(question, rendered, hints)?;
            let content = complete(self.llm.as_ref(), config, prompt).await?;
            extract_sql_from_response(&content)
                .map(|sql| normalize_sql(&sql))
                .filter(|sql| !sql.is_empty())
                .ok_or_else(|| StageError::MalformedResponse("no SQL in completion".to_string()))
        })
        .await?;

        let chosen = majority_vote(&candidates)
            .ok_or_else(|| StageError::EmptyResult("no SQL candidates".to_string()))?;

        debug!(task_id = %task.id, candidates = candidates.len(), "Generated SQL");

        let mut produced = Fields::new();
        produced.insert(fields::SQL.to_string(), Value::String(chosen));
        produced.insert(fields::SQL_CANDIDATES.to_string(), Value::from(candidates));
        Ok(produced)
    }
}
