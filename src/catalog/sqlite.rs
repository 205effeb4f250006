//! Catalog reading schema metadata from SQLite database files.
//!
//! Databases are expected at `{db_root}/{db_id}/{db_id}.sqlite`, the layout
//! used by the BIRD and Spider benchmarks.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

use crate::error::CatalogError;

use super::{Catalog, ColumnSchema, DatabaseSchema, TableSchema, ValueMatch};

/// Number of distinct example values collected per column.
const EXAMPLES_PER_COLUMN: i64 = 3;

/// Longest example value kept, in characters.
const MAX_EXAMPLE_LEN: usize = 64;

/// Read connections kept open per database.
const MAX_CONNECTIONS: u32 = 4;

/// Read-only pool and schema of one opened database.
struct LoadedDatabase {
    pool: SqlitePool,
    schema: Arc<DatabaseSchema>,
}

/// Catalog over a directory of SQLite databases.
///
/// Each database is opened once and loaded behind its own cell, so loading
/// one database never blocks lookups of another.
pub struct SqliteCatalog {
    db_root: PathBuf,
    databases: Mutex<HashMap<String, Arc<OnceCell<LoadedDatabase>>>>,
}

impl SqliteCatalog {
    pub fn new(db_root: impl Into<PathBuf>) -> Self {
        Self {
            db_root: db_root.into(),
            databases: Mutex::new(HashMap::new()),
        }
    }

    pub fn db_root(&self) -> &Path {
        &self.db_root
    }

    pub fn database_path(&self, db_id: &str) -> PathBuf {
        self.db_root.join(db_id).join(format!("{}.sqlite", db_id))
    }

    async fn open(&self, db_id: &str) -> Result<SqlitePool, CatalogError> {
        let path = self.database_path(db_id);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(CatalogError::DatabaseNotFound {
                db_id: db_id.to_string(),
                path,
            });
        }

        let options = SqliteConnectOptions::new().filename(&path).read_only(true);
        Ok(SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?)
    }

    async fn load(&self, db_id: &str) -> Result<LoadedDatabase, CatalogError> {
        let pool = self.open(db_id).await?;
        let schema = match read_schema(&pool, db_id).await {
            Ok(schema) => schema,
            Err(e) => {
                pool.close().await;
                return Err(e);
            }
        };

        debug!(db_id = %db_id, tables = schema.tables.len(), "Loaded database schema");
        Ok(LoadedDatabase {
            pool,
            schema: Arc::new(schema),
        })
    }

    /// Opens and loads a database on first use. A failed load is retried on
    /// the next call.
    async fn database(
        &self,
        db_id: &str,
    ) -> Result<(SqlitePool, Arc<DatabaseSchema>), CatalogError> {
        let cell = {
            let mut databases = self.databases.lock().await;
            Arc::clone(databases.entry(db_id.to_string()).or_default())
        };

        let loaded = cell.get_or_try_init(|| self.load(db_id)).await?;
        Ok((loaded.pool.clone(), Arc::clone(&loaded.schema)))
    }
}

/// Whether a declared column type has text affinity.
fn is_text_column(data_type: &str) -> bool {
    let upper = data_type.to_ascii_uppercase();
    upper.is_empty() || ["CHAR", "CLOB", "TEXT"].iter().any(|t| upper.contains(t))
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

async fn read_schema(pool: &SqlitePool, db_id: &str) -> Result<DatabaseSchema, CatalogError> {
    let table_rows = sqlx::query(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )
    .fetch_all(pool)
    .await?;

    let mut tables = Vec::with_capacity(table_rows.len());
    for row in table_rows {
        let table_name: String = row.try_get("name")?;
        let table = quote_identifier(&table_name);

        let column_rows = sqlx::query(&format!("PRAGMA table_info({})", table))
            .fetch_all(pool)
            .await?;

        let mut columns = Vec::with_capacity(column_rows.len());
        for column_row in column_rows {
            let name: String = column_row.try_get("name")?;
            let data_type: String = column_row.try_get("type")?;
            let pk: i64 = column_row.try_get("pk")?;

            let column = quote_identifier(&name);
            let examples: Vec<String> = sqlx::query(&format!(
                "SELECT DISTINCT CAST({col} AS TEXT) AS value FROM {table} WHERE {col} IS NOT NULL LIMIT ?",
                col = column,
                table = table
            ))
            .bind(EXAMPLES_PER_COLUMN)
            .fetch_all(pool)
            .await?
            .into_iter()
            .filter_map(|r| r.try_get::<Option<String>, _>("value").ok().flatten())
            .filter(|value| !value.is_empty() && value.chars().count() <= MAX_EXAMPLE_LEN)
            .collect();

            let mut schema = ColumnSchema::new(name, data_type).with_examples(examples);
            schema.primary_key = pk > 0;
            columns.push(schema);
        }

        tables.push(TableSchema::new(table_name, columns));
    }

    Ok(DatabaseSchema::new(db_id, tables))
}

#[async_trait]
impl Catalog for SqliteCatalog {
    async fn schema(&self, db_id: &str) -> Result<Arc<DatabaseSchema>, CatalogError> {
        let (_, schema) = self.database(db_id).await?;
        Ok(schema)
    }

    async fn find_values(
        &self,
        db_id: &str,
        needle: &str,
        limit: usize,
    ) -> Result<Vec<ValueMatch>, CatalogError> {
        let (pool, schema) = self.database(db_id).await?;
        let pattern = format!("%{}%", needle);

        let mut matches = Vec::new();
        'tables: for table in &schema.tables {
            for column in table.columns.iter().filter(|c| is_text_column(&c.data_type)) {
                let remaining = limit.saturating_sub(matches.len());
                if remaining == 0 {
                    break 'tables;
                }

                let rows = sqlx::query(&format!(
                    "SELECT DISTINCT {col} AS value FROM {table} WHERE {col} LIKE ? LIMIT ?",
                    col = quote_identifier(&column.name),
                    table = quote_identifier(&table.name)
                ))
                .bind(pattern.as_str())
                .bind(remaining as i64)
                .fetch_all(&pool)
                .await?;

                matches.extend(rows.into_iter().filter_map(|row| {
                    row.try_get::<Option<String>, _>("value")
                        .ok()
                        .flatten()
                        .map(|value| ValueMatch {
                            table: table.name.clone(),
                            column: column.name.clone(),
                            value,
                        })
                }));
            }
        }

        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn create_database(root: &Path, db_id: &str) {
        let dir = root.join(db_id);
        std::fs::create_dir_all(&dir).unwrap();
        let options = SqliteConnectOptions::new()
            .filename(dir.join(format!("{}.sqlite", db_id)))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();

        sqlx::query("CREATE TABLE schools (CDSCode TEXT PRIMARY KEY, County TEXT, \"Free Meal\" REAL)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO schools VALUES ('011', 'Alameda', 0.5), ('012', 'Fresno', NULL)")
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;
    }

    #[tokio::test]
    async fn test_reads_tables_columns_and_examples() {
        let dir = TempDir::new().unwrap();
        create_database(dir.path(), "california_schools").await;

        let catalog = SqliteCatalog::new(dir.path());
        let schema = catalog.schema("california_schools").await.unwrap();

        let table = schema.table("schools").unwrap();
        assert_eq!(table.columns.len(), 3);
        assert!(table.column("CDSCode").unwrap().primary_key);
        assert_eq!(table.column("Free Meal").unwrap().data_type, "REAL");
        assert_eq!(table.column("Free Meal").unwrap().examples, vec!["0.5"]);
        assert!(table
            .column("County")
            .unwrap()
            .examples
            .contains(&"Fresno".to_string()));
    }

    #[tokio::test]
    async fn test_find_values_uses_like_search() {
        let dir = TempDir::new().unwrap();
        create_database(dir.path(), "california_schools").await;

        let catalog = SqliteCatalog::new(dir.path());
        let matches = catalog
            .find_values("california_schools", "fres", 10)
            .await
            .unwrap();

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].column, "County");
        assert_eq!(matches[0].value, "Fresno");
    }

    #[test]
    fn test_text_affinity() {
        assert!(is_text_column("VARCHAR(20)"));
        assert!(is_text_column("text"));
        assert!(is_text_column(""));
        assert!(!is_text_column("REAL"));
    }

    #[tokio::test]
    async fn test_missing_database() {
        let dir = TempDir::new().unwrap();
        let catalog = SqliteCatalog::new(dir.path());
        assert!(matches!(
            catalog.schema("financial").await,
            Err(CatalogError::DatabaseNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_schema_is_cached() {
        let dir = TempDir::new().unwrap();
        create_database(dir.path(), "db").await;

        let catalog = SqliteCatalog::new(dir.path());
        let first = catalog.schema("db").await.unwrap();
        let second = catalog.schema("db").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_concurrent_lookups_share_one_load() {
        let dir = TempDir::new().unwrap();
        create_database(dir.path(), "db").await;
        create_database(dir.path(), "other").await;

        let catalog = SqliteCatalog::new(dir.path());
        let lookups = (0..8).map(|i| {
            let catalog = &catalog;
            async move {
                let db_id = if i % 2 == 0 { "db" } else { "other" };
                catalog.schema(db_id).await.unwrap()
            }
        });
        let schemas = futures::future::join_all(lookups).await;

        for pair in schemas.chunks(2).collect::<Vec<_>>().windows(2) {
            assert!(Arc::ptr_eq(&pair[0][0], &pair[1][0]));
            assert!(Arc::ptr_eq(&pair[0][1], &pair[1][1]));
        }
        assert_eq!(schemas[0].db_id, "db");
        assert_eq!(schemas[1].db_id, "other");

        // Value searches reuse the open database.
        let matches = catalog.find_values("db", "Alameda", 5).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert!(Arc::ptr_eq(&catalog.schema("db").await.unwrap(), &schemas[0]));
    }

    #[tokio::test]
    async fn test_failed_load_is_retried() {
        let dir = TempDir::new().unwrap();
        let catalog = SqliteCatalog::new(dir.path());

        assert!(catalog.schema("late").await.is_err());

        create_database(dir.path(), "late").await;
        let schema = catalog.schema("late").await.unwrap();
        assert!(schema.table("schools").is_some());
    }
}
