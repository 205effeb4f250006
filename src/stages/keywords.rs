//! Keyword extraction: asks the model for the keywords and entities of the question.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::StageError;
use crate::llm::LlmProvider;
use crate::pipeline::{fields, Fields, StageConfig, StageKind, Task};
use crate::prompts::build_keyword_extraction_prompt;

use super::{complete_json, question_context, single_field, Stage};

pub struct KeywordExtractionStage {
    llm: Arc<dyn LlmProvider>,
}

impl KeywordExtractionStage {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

/// Accepts `["kw", ...]` or `{"keywords": ["kw", ...]}`; trims and drops
/// duplicates while keeping first-seen order.
fn parse_keywords(value: &Value) -> Result<Vec<String>, StageError> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(map) => map
            .get("keywords")
            .and_then(Value::as_array)
            .ok_or_else(|| StageError::MalformedResponse("expected a keyword list".to_string()))?,
        _ => {
            return Err(StageError::MalformedResponse(
                "expected a keyword list".to_string(),
            ))
        }
    };

    let mut keywords: Vec<String> = Vec::new();
    for keyword in items.iter().filter_map(Value::as_str).map(str::trim) {
        if !keyword.is_empty() && !keywords.iter().any(|k| k == keyword) {
            keywords.push(keyword.to_string());
        }
    }
    Ok(keywords)
}

#[async_trait]
impl Stage for KeywordExtractionStage {
    fn kind(&self) -> StageKind {
        StageKind::KeywordExtraction
    }

    async fn run(&self, task: &Task, config: &StageConfig) -> Result<Fields, StageError> {
        let prompt = build_keyword_extraction_prompt(&question_context(task))?;
        let response = complete_json(self.llm.as_ref(), config, prompt).await?;
        let keywords = parse_keywords(&response)?;

        debug!(task_id = %task.id, count = keywords.len(), "Extracted keywords");
        Ok(single_field(fields::KEYWORDS, Value::from(keywords)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::DatasetRecord;
    use crate::stages::testing::{FailingLlmProvider, MockLlmProvider};
    use serde_json::json;

    fn task() -> Task {
        Task::new(
            0,
            DatasetRecord::new("How many schools are in Alameda?", "california_schools")
                .with_evidence("Alameda refers to County"),
        )
    }

    #[tokio::test]
    async fn test_extracts_keywords_from_fenced_reply() {
        let llm = Arc::new(MockLlmProvider::new(
            "```json\n[\"schools\", \"Alameda\", \"schools\", \" \"]\n```",
        ));
        let stage = KeywordExtractionStage::new(llm.clone());

        let produced = stage.run(&task(), &StageConfig::default()).await.unwrap();

        assert_eq!(produced["keywords"], json!(["schools", "Alameda"]));
        assert_eq!(llm.request_count(), 1);
    }

    #[test]
    fn test_parse_keywords_object_form() {
        assert_eq!(
            parse_keywords(&json!({"keywords": ["County"]})).unwrap(),
            vec!["County"]
        );
        assert!(parse_keywords(&json!({"other": 1})).is_err());
        assert!(parse_keywords(&json!("County")).is_err());
    }

    #[tokio::test]
    async fn test_engine_failure_is_a_stage_error() {
        let stage = KeywordExtractionStage::new(Arc::new(FailingLlmProvider));
        let result = stage.run(&task(), &StageConfig::default()).await;
        assert!(matches!(result, Err(StageError::Engine(_))));
    }
}
