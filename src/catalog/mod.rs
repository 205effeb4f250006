//! Schema metadata for the databases the questions target.
//!
//! Stages read database structure through the [`Catalog`] trait so the
//! pipeline can run against real SQLite files or an in-memory fixture.

mod sqlite;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CatalogError;

pub use sqlite::SqliteCatalog;

/// Table name to selected column names. An empty column list selects the
/// whole table.
pub type SchemaSelection = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    #[serde(default)]
    pub primary_key: bool,
    /// A few distinct values, rendered as text.
    #[serde(default)]
    pub examples: Vec<String>,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            primary_key: false,
            examples: Vec::new(),
        }
    }

    pub fn primary(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn with_examples<I, S>(mut self, examples: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.examples = examples.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnSchema>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns
            .iter()
            .find(|column| column.name.eq_ignore_ascii_case(name))
    }

    /// `CREATE TABLE` text, restricted to `columns` when non-empty.
    ///
    /// Primary key columns are always kept so joins stay expressible.
    pub fn render(&self, columns: &[String]) -> String {
        let keep = |column: &ColumnSchema| {
            columns.is_empty()
                || column.primary_key
                || columns.iter().any(|c| c.eq_ignore_ascii_case(&column.name))
        };

        let mut out = format!("CREATE TABLE `{}`\n(\n", self.name);
        for column in self.columns.iter().filter(|c| keep(c)) {
            out.push_str(&format!("    `{}` {}", column.name, column.data_type));
            if column.primary_key {
                out.push_str(" PRIMARY KEY");
            }
            out.push(',');
            if !column.examples.is_empty() {
                out.push_str(&format!(" -- examples: {}", column.examples.join(", ")));
            }
            out.push('\n');
        }
        out.push_str(");");
        out
    }
}

/// Structure of one database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSchema {
    pub db_id: String,
    pub tables: Vec<TableSchema>,
}

impl DatabaseSchema {
    pub fn new(db_id: impl Into<String>, tables: Vec<TableSchema>) -> Self {
        Self {
            db_id: db_id.into(),
            tables,
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables
            .iter()
            .find(|table| table.name.eq_ignore_ascii_case(name))
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|table| table.name.clone()).collect()
    }

    /// Renders every table, or only the selected ones.
    pub fn render(&self, selection: Option<&SchemaSelection>) -> String {
        let rendered: Vec<String> = match selection {
            None => self.tables.iter().map(|table| table.render(&[])).collect(),
            Some(selection) => self
                .tables
                .iter()
                .filter_map(|table| {
                    selection
                        .iter()
                        .find(|(name, _)| name.eq_ignore_ascii_case(&table.name))
                        .map(|(_, columns)| table.render(columns))
                })
                .collect(),
        };
        rendered.join("\n\n")
    }

    /// Maps a model-proposed selection onto canonical table and column
    /// names, dropping anything the database does not contain.
    ///
    /// Accepts `{"table": ["col", ...]}` objects and `["table", ...]` arrays.
    pub fn resolve_selection(&self, raw: &Value) -> SchemaSelection {
        let mut selection = SchemaSelection::new();

        match raw {
            Value::Object(map) => {
                for (table_name, columns) in map {
                    let Some(table) = self.table(table_name) else {
                        continue;
                    };
                    let mut resolved: Vec<String> = columns
                        .as_array()
                        .into_iter()
                        .flatten()
                        .filter_map(Value::as_str)
                        .filter_map(|name| table.column(name))
                        .map(|column| column.name.clone())
                        .collect();
                    resolved.sort();
                    resolved.dedup();
                    if !resolved.is_empty() {
                        selection.insert(table.name.clone(), resolved);
                    }
                }
            }
            Value::Array(names) => {
                for table in names
                    .iter()
                    .filter_map(Value::as_str)
                    .filter_map(|name| self.table(name))
                {
                    selection.insert(table.name.clone(), Vec::new());
                }
            }
            _ => {}
        }

        selection
    }
}

/// A database value matching a search needle.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueMatch {
    pub table: String,
    pub column: String,
    pub value: String,
}

/// Source of database schema metadata.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn schema(&self, db_id: &str) -> Result<Arc<DatabaseSchema>, CatalogError>;

    /// Stored values containing `needle`, case-insensitively.
    ///
    /// The default implementation only searches the example values carried
    /// by the schema.
    async fn find_values(
        &self,
        db_id: &str,
        needle: &str,
        limit: usize,
    ) -> Result<Vec<ValueMatch>, CatalogError> {
        let schema = self.schema(db_id).await?;
        let needle = needle.to_lowercase();

        Ok(schema
            .tables
            .iter()
            .flat_map(|table| {
                table.columns.iter().flat_map(move |column| {
                    column.examples.iter().map(move |value| ValueMatch {
                        table: table.name.clone(),
                        column: column.name.clone(),
                        value: value.clone(),
                    })
                })
            })
            .filter(|m| m.value.to_lowercase().contains(&needle))
            .take(limit)
            .collect())
    }
}

/// Catalog over schemas registered up front.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    schemas: HashMap<String, Arc<DatabaseSchema>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(mut self, schema: DatabaseSchema) -> Self {
        self.schemas.insert(schema.db_id.clone(), Arc::new(schema));
        self
    }
}

#[async_trait]
impl Catalog for StaticCatalog {
    async fn schema(&self, db_id: &str) -> Result<Arc<DatabaseSchema>, CatalogError> {
        self.schemas
            .get(db_id)
            .cloned()
            .ok_or_else(|| CatalogError::UnknownDatabase(db_id.to_string()))
    }
}
