//! Catalog-backed retrieval stages: entity retrieval and context retrieval.
//!
//! Neither stage calls the model. Entity retrieval matches keywords against
//! column names and stored values; context retrieval ranks columns by token
//! overlap with the keywords and returns the best `top_k` per keyword.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::catalog::{Catalog, DatabaseSchema, SchemaSelection};
use crate::error::StageError;
use crate::pipeline::{fields, Fields, StageConfig, StageKind, Task};

use super::{selection_to_value, single_field, string_list, Stage};

/// Maximum stored values returned per keyword.
const VALUES_PER_KEYWORD: usize = 5;

/// Keywords shorter than this are not used for value or substring matching.
const MIN_MATCH_LEN: usize = 3;

fn check_mode(config: &StageConfig, expected: &str) -> Result<(), StageError> {
    match config.mode() {
        None => Ok(()),
        Some(mode) if mode == expected => Ok(()),
        Some(other) => Err(StageError::UnsupportedMode(other.to_string())),
    }
}

/// Lowercases and turns underscores into spaces.
fn normalize(name: &str) -> String {
    name.replace('_', " ").trim().to_lowercase()
}

fn tokens(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Whether a keyword names a column, allowing either to contain the other.
fn names_column(keyword: &str, column: &str) -> bool {
    if keyword == column {
        return true;
    }
    (column.len() >= MIN_MATCH_LEN && keyword.contains(column))
        || (keyword.len() >= MIN_MATCH_LEN && column.contains(keyword))
}

fn similar_columns(keywords: &[String], schema: &DatabaseSchema) -> SchemaSelection {
    let keywords: Vec<String> = keywords.iter().map(|k| normalize(k)).collect();
    let mut selection = SchemaSelection::new();

    for table in &schema.tables {
        for column in &table.columns {
            let column_name = normalize(&column.name);
            if keywords.iter().any(|k| names_column(k, &column_name)) {
                selection
                    .entry(table.name.clone())
                    .or_default()
                    .push(column.name.clone());
            }
        }
    }
    selection
}

pub struct EntityRetrievalStage {
    catalog: Arc<dyn Catalog>,
}

impl EntityRetrievalStage {
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self { catalog }
    }

    async fn similar_values(
        &self,
        db_id: &str,
        keywords: &[String],
    ) -> Result<Value, StageError> {
        let mut values: BTreeMap<String, BTreeMap<String, BTreeSet<String>>> = BTreeMap::new();

        for keyword in keywords
            .iter()
            .map(|k| k.trim())
            .filter(|k| k.chars().count() >= MIN_MATCH_LEN)
        {
            let matches = self
                .catalog
                .find_values(db_id, keyword, VALUES_PER_KEYWORD)
                .await?;
            for m in matches {
                values
                    .entry(m.table)
                    .or_default()
                    .entry(m.column)
                    .or_default()
                    .insert(m.value);
            }
        }

        Ok(serde_json::to_value(values).unwrap_or_else(|_| json!({})))
    }
}

#[async_trait]
impl Stage for EntityRetrievalStage {
    fn kind(&self) -> StageKind {
        StageKind::EntityRetrieval
    }

    async fn run(&self, task: &Task, config: &StageConfig) -> Result<Fields, StageError> {
        check_mode(config, "ask_model")?;

        let keywords = string_list(task.state.get(fields::KEYWORDS));
        let schema = self.catalog.schema(&task.input.db_id).await?;

        let columns = similar_columns(&keywords, &schema);
        let values = self.similar_values(&task.input.db_id, &keywords).await?;

        debug!(
            task_id = %task.id,
            tables = columns.len(),
            "Retrieved similar columns and values"
        );

        let mut produced = single_field(fields::SIMILAR_COLUMNS, selection_to_value(&columns));
        produced.insert(fields::SIMILAR_VALUES.to_string(), values);
        Ok(produced)
    }
}

pub struct ContextRetrievalStage {
    catalog: Arc<dyn Catalog>,
}

impl ContextRetrievalStage {
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self { catalog }
    }
}

/// Share of the column's name tokens that appear in the keyword.
fn overlap_score(keyword: &BTreeSet<String>, column: &BTreeSet<String>) -> f64 {
    if column.is_empty() {
        return 0.0;
    }
    let shared = column.intersection(keyword).count();
    shared as f64 / column.len() as f64
}

/// The `top_k` best-scoring columns for each keyword, unioned.
fn rank_columns(keywords: &[String], schema: &DatabaseSchema, top_k: usize) -> SchemaSelection {
    let mut selection = SchemaSelection::new();

    for keyword in keywords {
        let keyword_tokens = tokens(keyword);
        let mut scored: Vec<(f64, &str, &str)> = schema
            .tables
            .iter()
            .flat_map(|table| {
                table.columns.iter().map(|column| {
                    (
                        overlap_score(&keyword_tokens, &tokens(&column.name)),
                        table.name.as_str(),
                        column.name.as_str(),
                    )
                })
            })
            .filter(|(score, _, _)| *score > 0.0)
            .collect();

        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| (a.1, a.2).cmp(&(b.1, b.2))));

        for (_, table, column) in scored.into_iter().take(top_k) {
            let entry = selection.entry(table.to_string()).or_default();
            if !entry.iter().any(|c| c == column) {
                entry.push(column.to_string());
            }
        }
    }
    selection
}

fn describe(selection: &SchemaSelection, schema: &DatabaseSchema) -> Value {
    let mut described = Map::new();
    for (table_name, columns) in selection {
        let Some(table) = schema.table(table_name) else {
            continue;
        };
        let mut table_entry = Map::new();
        for column in columns.iter().filter_map(|c| table.column(c)) {
            table_entry.insert(
                column.name.clone(),
                json!({
                    "type": column.data_type,
                    "examples": column.examples,
                }),
            );
        }
        described.insert(table.name.clone(), Value::Object(table_entry));
    }
    Value::Object(described)
}

#[async_trait]
impl Stage for ContextRetrievalStage {
    fn kind(&self) -> StageKind {
        StageKind::ContextRetrieval
    }

    async fn run(&self, task: &Task, config: &StageConfig) -> Result<Fields, StageError> {
        check_mode(config, "vector_db")?;

        let keywords = string_list(task.state.get(fields::KEYWORDS));
        let schema = self.catalog.schema(&task.input.db_id).await?;
        let ranked = rank_columns(&keywords, &schema, config.top_k());

        Ok(single_field(
            fields::SCHEMA_WITH_DESCRIPTIONS,
            describe(&ranked, &schema),
        ))
    }
}
