//! PostgreSQL resource handler.
//!
//! Step vocabulary: seed a table from a data table, assert table contents
//! (order-sensitive, column-by-column string equality), assert emptiness or
//! an exact row count, and execute free-form SQL inline or from a file.
//!
//! `reset` enumerates user tables in the `public` schema and truncates them
//! in one cascading statement, excluding migration bookkeeping tables and
//! any names in the resource's `exclude` option.

use async_trait::async_trait;
use camino::Utf8Path;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::error::{CleanupError, InfraError, StepError};

use super::stepdef::{StepArgs, StepCategory, StepDef};
use super::{Handler, HandlerDeps, SqlExecutor};
use crate::config::ResourceSpec;

/// Tables never touched by reset.
const BUILTIN_EXCLUSIONS: &[&str] = &["schema_migrations", "goose_db_version"];

mod action {
    pub const TABLE_HAS_VALUES: &str = "table-has-values";
    pub const TABLE_CONTAINS: &str = "table-contains";
    pub const TABLE_EMPTY: &str = "table-empty";
    pub const TABLE_ROW_COUNT: &str = "table-row-count";
    pub const EXEC_SQL: &str = "exec-sql";
    pub const EXEC_SQL_FILE: &str = "exec-sql-file";
}

/// The PostgreSQL step vocabulary.
pub(super) fn vocabulary() -> StepCategory {
    StepCategory {
        name: "Postgres",
        description: "Steps for interacting with PostgreSQL databases",
        steps: vec![
            StepDef {
                group: "Data Setup",
                pattern: r#"^"{resource}" table "([^"]*)" has values:$"#,
                description: "Inserts rows into a table from a data table",
                example: "\"{resource}\" table \"users\" has values:\n  | id | name  |\n  | 1  | alice |",
                action: action::TABLE_HAS_VALUES,
            },
            StepDef {
                group: "Assertions",
                pattern: r#"^"{resource}" table "([^"]*)" contains:$"#,
                description: "Asserts a table contains the expected rows",
                example: "\"{resource}\" table \"users\" contains:\n  | id | name  |\n  | 1  | alice |",
                action: action::TABLE_CONTAINS,
            },
            StepDef {
                group: "Assertions",
                pattern: r#"^"{resource}" table "([^"]*)" is empty$"#,
                description: "Asserts a table has no rows",
                example: "\"{resource}\" table \"users\" is empty",
                action: action::TABLE_EMPTY,
            },
            StepDef {
                group: "Assertions",
                pattern: r#"^"{resource}" table "([^"]*)" has "(\d+)" rows$"#,
                description: "Asserts a table has exactly N rows",
                example: "\"{resource}\" table \"users\" has \"5\" rows",
                action: action::TABLE_ROW_COUNT,
            },
            StepDef {
                group: "Execution",
                pattern: r#"^"{resource}" executes:$"#,
                description: "Executes a raw SQL block",
                example: "\"{resource}\" executes:\n  \"\"\"\n  UPDATE users SET active = true WHERE id = 1\n  \"\"\"",
                action: action::EXEC_SQL,
            },
            StepDef {
                group: "Execution",
                pattern: r#"^"{resource}" executes file "([^"]*)"$"#,
                description: "Executes SQL from a file",
                example: "\"{resource}\" executes file \"fixtures/seed.sql\"",
                action: action::EXEC_SQL_FILE,
            },
        ],
    }
}

/// Handler for one declared `postgres` resource.
pub struct Postgres {
    name: String,
    spec: ResourceSpec,
    deps: HandlerDeps,
    pool: Option<PgPool>,
}

impl Postgres {
    /// Create the handler; the connection is established in `init`.
    #[must_use]
    pub fn new(name: String, spec: ResourceSpec, deps: HandlerDeps) -> Self {
        Self {
            name,
            spec,
            deps,
            pool: None,
        }
    }

    fn pool(&self) -> Result<&PgPool, StepError> {
        self.pool
            .as_ref()
            .ok_or_else(|| StepError::backend(format!("handler '{}' is not connected", self.name)))
    }

    async fn dsn(&self) -> Result<String, InfraError> {
        if let Some(url) = self.spec.opt_str("url") {
            return Ok(String::from(url));
        }

        let container = self.spec.container.as_deref().ok_or_else(|| {
            InfraError::HandlerInitFailed {
                handler: self.name.clone(),
                message: String::from("postgres resource needs a container or a url option"),
            }
        })?;
        let host = self.deps.orchestrator.host(container)?;
        let port = self.deps.orchestrator.port(container, "5432/tcp").await?;

        let database = self.spec.database.as_deref().unwrap_or("postgres");
        let user = self.spec.opt_str("user").unwrap_or("postgres");
        let password = self.spec.opt_str("password").unwrap_or("postgres");

        Ok(format!(
            "postgres://{user}:{password}@{host}:{port}/{database}"
        ))
    }

    fn exclusions(&self) -> Vec<String> {
        let mut excluded: Vec<String> =
            BUILTIN_EXCLUSIONS.iter().map(|t| String::from(*t)).collect();
        excluded.extend(self.spec.opt_str_list("exclude"));
        excluded
    }

    async fn insert_rows(&self, table: &str, args: &StepArgs) -> Result<(), StepError> {
        let data = args.table()?;
        if !data.has_data() {
            return Err(StepError::assertion(
                "table must have headers and at least one data row",
            ));
        }
        let columns = data
            .headers()
            .map(|headers| headers.join(", "))
            .unwrap_or_default();

        for row in data.data_rows() {
            let values: Vec<String> = row.iter().map(|cell| quote_literal(cell)).collect();
            let insert = format!(
                "INSERT INTO {table} ({columns}) VALUES ({})",
                values.join(", ")
            );
            sqlx::raw_sql(&insert)
                .execute(self.pool()?)
                .await
                .map_err(|e| StepError::backend(format!("inserting row: {e}")))?;
        }
        Ok(())
    }

    async fn assert_contains(&self, table: &str, args: &StepArgs) -> Result<(), StepError> {
        let expected = args.table()?;
        if !expected.has_data() {
            return Err(StepError::assertion(
                "expected table must have headers and at least one data row",
            ));
        }
        let headers = expected.headers().unwrap_or_default();
        let select_list: Vec<String> = headers
            .iter()
            .map(|column| format!("{column}::text"))
            .collect();
        let query = format!("SELECT {} FROM {table}", select_list.join(", "));

        let rows = sqlx::query(&query)
            .fetch_all(self.pool()?)
            .await
            .map_err(|e| StepError::backend(format!("querying table: {e}")))?;

        for (row_index, expected_row) in expected.data_rows().iter().enumerate() {
            let Some(actual_row) = rows.get(row_index) else {
                return Err(StepError::assertion(format!("missing row {}", row_index + 1)));
            };
            for (column_index, expected_cell) in expected_row.iter().enumerate() {
                let actual_cell: Option<String> = actual_row
                    .try_get(column_index)
                    .map_err(|e| StepError::backend(format!("scanning row: {e}")))?;
                let actual_cell = actual_cell.unwrap_or_else(|| String::from("NULL"));
                if &actual_cell != expected_cell {
                    return Err(StepError::assertion(format!(
                        "row {}, column {}: expected \"{expected_cell}\", got \"{actual_cell}\"",
                        row_index + 1,
                        headers.get(column_index).map_or("?", String::as_str),
                    )));
                }
            }
        }
        Ok(())
    }

    async fn count_rows(&self, table: &str) -> Result<i64, StepError> {
        let query = format!("SELECT COUNT(*) FROM {table}");
        let row = sqlx::query(&query)
            .fetch_one(self.pool()?)
            .await
            .map_err(|e| StepError::backend(format!("counting rows: {e}")))?;
        row.try_get(0)
            .map_err(|e| StepError::backend(format!("reading count: {e}")))
    }
}

#[async_trait]
impl Handler for Postgres {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&mut self) -> Result<(), InfraError> {
        let dsn = self.dsn().await?;
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&dsn)
            .await
            .map_err(|e| InfraError::HandlerInitFailed {
                handler: self.name.clone(),
                message: format!("connecting to postgres: {e}"),
            })?;
        self.pool = Some(pool);
        Ok(())
    }

    async fn ready(&mut self) -> Result<(), InfraError> {
        let Some(pool) = self.pool.as_ref() else {
            return Err(InfraError::HandlerInitFailed {
                handler: self.name.clone(),
                message: String::from("not initialised"),
            });
        };
        sqlx::query("SELECT 1")
            .execute(pool)
            .await
            .map(|_| ())
            .map_err(|e| InfraError::HandlerInitFailed {
                handler: self.name.clone(),
                message: format!("ping failed: {e}"),
            })
    }

    async fn reset(&mut self) -> Result<(), InfraError> {
        let Some(pool) = self.pool.as_ref() else {
            return Ok(());
        };
        let reset_failed = |message: String| InfraError::HandlerInitFailed {
            handler: self.name.clone(),
            message,
        };

        let rows = sqlx::query("SELECT tablename FROM pg_tables WHERE schemaname = 'public'")
            .fetch_all(pool)
            .await
            .map_err(|e| reset_failed(format!("listing tables: {e}")))?;

        let excluded = self.exclusions();
        let tables: Vec<String> = rows
            .iter()
            .filter_map(|row| row.try_get::<String, _>(0).ok())
            .filter(|table| !excluded.iter().any(|e| e == table))
            .collect();

        if tables.is_empty() {
            return Ok(());
        }

        let truncate = format!("TRUNCATE TABLE {} CASCADE", tables.join(", "));
        sqlx::raw_sql(&truncate)
            .execute(pool)
            .await
            .map(|_| ())
            .map_err(|e| reset_failed(format!("truncating tables: {e}")))
    }

    async fn cleanup(&mut self) -> Result<(), CleanupError> {
        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }
        Ok(())
    }

    fn steps(&self) -> StepCategory {
        vocabulary()
    }

    async fn run_step(&mut self, action: &str, args: &StepArgs) -> Result<(), StepError> {
        match action {
            action::TABLE_HAS_VALUES => {
                let table = args.string(0)?.to_owned();
                self.insert_rows(&table, args).await
            }
            action::TABLE_CONTAINS => {
                let table = args.string(0)?.to_owned();
                self.assert_contains(&table, args).await
            }
            action::TABLE_EMPTY => {
                let table = args.string(0)?;
                let count = self.count_rows(table).await?;
                if count != 0 {
                    return Err(StepError::assertion(format!(
                        "table {table} has {count} rows, expected 0"
                    )));
                }
                Ok(())
            }
            action::TABLE_ROW_COUNT => {
                let table = args.string(0)?;
                let expected = args.int(1)?;
                let count = self.count_rows(table).await?;
                if count != expected {
                    return Err(StepError::assertion(format!(
                        "table {table} has {count} rows, expected {expected}"
                    )));
                }
                Ok(())
            }
            action::EXEC_SQL => {
                self.exec_sql(args.docstring()?).await.map(|_| ())
            }
            action::EXEC_SQL_FILE => {
                let path = Utf8Path::new(args.string(0)?).to_owned();
                self.exec_sql_file(&path).await
            }
            other => Err(StepError::UnknownAction {
                handler: self.name.clone(),
                action: String::from(other),
            }),
        }
    }

    fn as_sql_executor(&self) -> Option<&dyn SqlExecutor> {
        Some(self)
    }
}

#[async_trait]
impl SqlExecutor for Postgres {
    async fn exec_sql(&self, sql: &str) -> Result<u64, StepError> {
        let result = sqlx::raw_sql(sql)
            .execute(self.pool()?)
            .await
            .map_err(|e| StepError::backend(format!("executing SQL: {e}")))?;
        Ok(result.rows_affected())
    }

    async fn exec_sql_file(&self, path: &Utf8Path) -> Result<(), StepError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| StepError::backend(format!("reading SQL file: {e}")))?;
        self.exec_sql(&content).await.map(|_| ())
    }
}

/// Quote a cell value as a SQL string literal, doubling embedded quotes.
pub(super) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("alice", "'alice'")]
    #[case("o'brien", "'o''brien'")]
    #[case("", "''")]
    fn quote_literal_doubles_embedded_quotes(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(quote_literal(input), expected);
    }

    #[rstest]
    fn vocabulary_actions_are_unique() {
        let steps = vocabulary().steps;
        let mut actions: Vec<&str> = steps.iter().map(|step| step.action).collect();
        actions.sort_unstable();
        actions.dedup();
        assert_eq!(actions.len(), steps.len());
    }

    #[rstest]
    fn patterns_compile_for_a_resource_name() {
        for step in vocabulary().steps {
            super::super::stepdef::compile_pattern(step.pattern, "db")
                .expect("postgres pattern compiles");
        }
    }
}
