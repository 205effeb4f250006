//! Schema narrowing stages: column filtering, table selection and column selection.

use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use futures::future::try_join_all;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

use crate::catalog::{Catalog, DatabaseSchema, SchemaSelection};
use crate::error::StageError;
use crate::llm::LlmProvider;
use crate::pipeline::{fields, Fields, StageConfig, StageKind, Task};
use crate::prompts::{
    build_column_filtering_prompt, build_column_selection_prompt, build_table_selection_prompt,
};

use super::{
    complete_json, majority_vote, question_context, sample, selection_field, selection_to_value,
    single_field, union_selection, Stage,
};

/// How a selection stage picks its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SelectionMode {
    AskModel,
    /// Read the answer off the gold SQL.
    Corrects,
}

impl SelectionMode {
    fn from_config(config: &StageConfig) -> Result<Self, StageError> {
        match config.mode() {
            None | Some("ask_model") => Ok(SelectionMode::AskModel),
            Some("corrects") => Ok(SelectionMode::Corrects),
            Some(other) => Err(StageError::UnsupportedMode(other.to_string())),
        }
    }
}

/// `{table: {column: ...}}` as `{table: [column, ...]}`.
fn nested_keys(value: &Value) -> Value {
    let Some(tables) = value.as_object() else {
        return Value::Object(Map::new());
    };
    tables
        .iter()
        .map(|(table, columns)| {
            let names: Vec<Value> = columns
                .as_object()
                .map(|c| c.keys().cloned().map(Value::String).collect())
                .unwrap_or_default();
            (table.clone(), Value::Array(names))
        })
        .collect::<Map<String, Value>>()
        .into()
}

/// Identifiers referenced by a SQL query, lowercased. String literals are skipped.
fn sql_identifiers(sql: &str) -> BTreeSet<String> {
    static LITERAL: OnceLock<Regex> = OnceLock::new();
    static IDENTIFIER: OnceLock<Regex> = OnceLock::new();

    let literal = LITERAL.get_or_init(|| Regex::new(r"'(?:[^']|'')*'").expect("valid literal regex"));
    let identifier = IDENTIFIER.get_or_init(|| {
        Regex::new(r#"`([^`]+)`|"([^"]+)"|([A-Za-z_][A-Za-z0-9_]*)"#)
            .expect("valid identifier regex")
    });

    let stripped = literal.replace_all(sql, " ");
    identifier
        .captures_iter(&stripped)
        .filter_map(|caps| caps.get(1).or(caps.get(2)).or(caps.get(3)))
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

fn gold_sql(task: &Task) -> Result<&str, StageError> {
    task.input
        .gold_sql
        .as_deref()
        .filter(|sql| !sql.trim().is_empty())
        .ok_or_else(|| StageError::EmptyResult("record carries no gold SQL".to_string()))
}

/// Tables of `schema` named in `sql`, canonical and sorted.
fn tables_in_sql(sql: &str, schema: &DatabaseSchema) -> Vec<String> {
    let identifiers = sql_identifiers(sql);
    let mut tables: Vec<String> = schema
        .tables
        .iter()
        .filter(|table| identifiers.contains(&table.name.to_lowercase()))
        .map(|table| table.name.clone())
        .collect();
    tables.sort();
    tables
}

/// Columns named in `sql`, grouped by the referenced tables that own them.
fn columns_in_sql(sql: &str, schema: &DatabaseSchema) -> SchemaSelection {
    let identifiers = sql_identifiers(sql);
    let tables = tables_in_sql(sql, schema);

    let mut selection = SchemaSelection::new();
    for table in tables.iter().filter_map(|name| schema.table(name)) {
        let mut columns: Vec<String> = table
            .columns
            .iter()
            .filter(|column| identifiers.contains(&column.name.to_lowercase()))
            .map(|column| column.name.clone())
            .collect();
        columns.sort();
        if !columns.is_empty() {
            selection.insert(table.name.clone(), columns);
        }
    }
    selection
}

/// Every table of `schema`, unrestricted.
fn whole_schema(schema: &DatabaseSchema) -> SchemaSelection {
    schema
        .table_names()
        .into_iter()
        .map(|name| (name, Vec::new()))
        .collect()
}

pub struct ColumnFilteringStage {
    llm: Arc<dyn LlmProvider>,
    catalog: Arc<dyn Catalog>,
}

impl ColumnFilteringStage {
    pub fn new(llm: Arc<dyn LlmProvider>, catalog: Arc<dyn Catalog>) -> Self {
        Self { llm, catalog }
    }

    /// Columns pointed at by earlier retrieval stages.
    fn retrieved_columns(state: &Fields, schema: &DatabaseSchema) -> SchemaSelection {
        let mut hints = selection_field(state, fields::SIMILAR_COLUMNS, schema).unwrap_or_default();
        for field in [fields::SIMILAR_VALUES, fields::SCHEMA_WITH_DESCRIPTIONS] {
            if let Some(value) = state.get(field) {
                union_selection(&mut hints, &schema.resolve_selection(&nested_keys(value)));
            }
        }
        hints
    }
}

#[async_trait]
impl Stage for ColumnFilteringStage {
    fn kind(&self) -> StageKind {
        StageKind::ColumnFiltering
    }

    async fn run(&self, task: &Task, config: &StageConfig) -> Result<Fields, StageError> {
        let schema = self.catalog.schema(&task.input.db_id).await?;
        let schema: &DatabaseSchema = &schema;
        let question = question_context(task);
        let question = &question;

        let per_table = try_join_all(schema.tables.iter().map(|table| {
            async move {
                let prompt = build_column_filtering_prompt(question, &table.render(&[]))?;
                let reply = complete_json(self.llm.as_ref(), config, prompt).await?;
                let mut raw = Map::new();
                raw.insert(
                    table.name.clone(),
                    reply.get("relevant_columns").cloned().unwrap_or(Value::Null),
                );
                Ok::<_, StageError>(schema.resolve_selection(&Value::Object(raw)))
            }
        }))
        .await?;

        let mut filtered = Self::retrieved_columns(&task.state, schema);
        for selection in &per_table {
            union_selection(&mut filtered, selection);
        }

        debug!(task_id = %task.id, tables = filtered.len(), "Filtered schema");
        Ok(single_field(
            fields::FILTERED_SCHEMA,
            selection_to_value(&filtered),
        ))
    }
}

pub struct TableSelectionStage {
    llm: Arc<dyn LlmProvider>,
    catalog: Arc<dyn Catalog>,
}

impl TableSelectionStage {
    pub fn new(llm: Arc<dyn LlmProvider>, catalog: Arc<dyn Catalog>) -> Self {
        Self { llm, catalog }
    }

    async fn ask_model(
        &self,
        task: &Task,
        config: &StageConfig,
        schema: &DatabaseSchema,
    ) -> Result<Vec<String>, StageError> {
        let view = selection_field(&task.state, fields::FILTERED_SCHEMA, schema);
        let rendered = schema.render(view.as_ref());
        let rendered = rendered.as_str();
        let question = question_context(task);
        let question = &question;

        let samples = sample(StageKind::TableSelection, config, || async move {
            let prompt = build_table_selection_prompt(question, rendered)?;
            let reply = complete_json(self.llm.as_ref(), config, prompt).await?;
            let names = reply.get("table_names").cloned().unwrap_or(Value::Null);
            Ok::<_, StageError>(schema
                .resolve_selection(&names)
                .into_keys()
                .collect::<Vec<_>>())
        })
        .await?;

        let votes: Vec<Vec<String>> = samples.into_iter().filter(|s| !s.is_empty()).collect();
        Ok(majority_vote(&votes).unwrap_or_default())
    }
}

#[async_trait]
impl Stage for TableSelectionStage {
    fn kind(&self) -> StageKind {
        StageKind::TableSelection
    }

    async fn run(&self, task: &Task, config: &StageConfig) -> Result<Fields, StageError> {
        let mode = SelectionMode::from_config(config)?;
        let schema = self.catalog.schema(&task.input.db_id).await?;

        let tables = match mode {
            SelectionMode::AskModel => self.ask_model(task, config, &schema).await?,
            SelectionMode::Corrects => tables_in_sql(gold_sql(task)?, &schema),
        };

        if tables.is_empty() {
            return Err(StageError::EmptyResult("no tables selected".to_string()));
        }

        Ok(single_field(fields::SELECTED_TABLES, Value::from(tables)))
    }
}

pub struct ColumnSelectionStage {
    llm: Arc<dyn LlmProvider>,
    catalog: Arc<dyn Catalog>,
}

impl ColumnSelectionStage {
    pub fn new(llm: Arc<dyn LlmProvider>, catalog: Arc<dyn Catalog>) -> Self {
        Self { llm, catalog }
    }

    /// Filtered schema (or the whole schema), restricted to the selected tables.
    fn candidate_view(state: &Fields, schema: &DatabaseSchema) -> SchemaSelection {
        let base = selection_field(state, fields::FILTERED_SCHEMA, schema)
            .unwrap_or_else(|| whole_schema(schema));

        match selection_field(state, fields::SELECTED_TABLES, schema) {
            Some(tables) => tables
                .into_keys()
                .map(|table| {
                    let columns = base.get(&table).cloned().unwrap_or_default();
                    (table, columns)
                })
                .collect(),
            None => base,
        }
    }

    async fn ask_model(
        &self,
        task: &Task,
        config: &StageConfig,
        schema: &DatabaseSchema,
    ) -> Result<SchemaSelection, StageError> {
        let view = Self::candidate_view(&task.state, schema);
        let view = &view;
        let rendered = schema.render(Some(view));
        let rendered = rendered.as_str();
        let question = question_context(task);
        let question = &question;

        let samples = sample(StageKind::ColumnSelection, config, || async move {
            let prompt = build_column_selection_prompt(question, rendered)?;
            let reply = complete_json(self.llm.as_ref(), config, prompt).await?;
            let columns = reply.get("columns").cloned().unwrap_or(Value::Null);
            Ok::<_, StageError>(schema
                .resolve_selection(&columns)
                .into_iter()
                .filter(|(table, _)| view.contains_key(table))
                .collect::<SchemaSelection>())
        })
        .await?;

        let votes: Vec<SchemaSelection> = samples.into_iter().filter(|s| !s.is_empty()).collect();
        Ok(majority_vote(&votes).unwrap_or_default())
    }
}

#[async_trait]
impl Stage for ColumnSelectionStage {
    fn kind(&self) -> StageKind {
        StageKind::ColumnSelection
    }

    async fn run(&self, task: &Task, config: &StageConfig) -> Result<Fields, StageError> {
        let mode = SelectionMode::from_config(config)?;
        let schema = self.catalog.schema(&task.input.db_id).await?;

        let selected = match mode {
            SelectionMode::AskModel => self.ask_model(task, config, &schema).await?,
            SelectionMode::Corrects => columns_in_sql(gold_sql(task)?, &schema),
        };

        if selected.is_empty() {
            return Err(StageError::EmptyResult("no columns selected".to_string()));
        }

        Ok(single_field(
            fields::SELECTED_SCHEMA,
            selection_to_value(&selected),
        ))
    }
}
