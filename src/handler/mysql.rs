//! MySQL resource handler.
//!
//! Mirrors the PostgreSQL vocabulary over a MySQL connection. Text casts
//! use `CAST(col AS CHAR)` and `reset` walks `information_schema.tables`
//! for the connected database, truncating each table with foreign-key
//! checks disabled for the duration.

use async_trait::async_trait;
use camino::Utf8Path;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySqlPool, Row};

use crate::error::{CleanupError, InfraError, StepError};

use super::postgres::quote_literal;
use super::stepdef::{StepArgs, StepCategory, StepDef};
use super::{Handler, HandlerDeps, SqlExecutor};
use crate::config::ResourceSpec;

const BUILTIN_EXCLUSIONS: &[&str] = &["schema_migrations", "goose_db_version"];

mod action {
    pub const TABLE_HAS_VALUES: &str = "table-has-values";
    pub const TABLE_CONTAINS: &str = "table-contains";
    pub const TABLE_EMPTY: &str = "table-empty";
    pub const TABLE_ROW_COUNT: &str = "table-row-count";
    pub const EXEC_SQL: &str = "exec-sql";
    pub const EXEC_SQL_FILE: &str = "exec-sql-file";
}

/// The MySQL step vocabulary.
pub(super) fn vocabulary() -> StepCategory {
    StepCategory {
        name: "MySQL",
        description: "Steps for interacting with MySQL databases",
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

/// Handler for one declared `mysql` resource.
pub struct MySql {
    name: String,
    spec: ResourceSpec,
    deps: HandlerDeps,
    pool: Option<MySqlPool>,
}

impl MySql {
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

    fn pool(&self) -> Result<&MySqlPool, StepError> {
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
                message: String::from("mysql resource needs a container or a url option"),
            }
        })?;
        let host = self.deps.orchestrator.host(container)?;
        let port = self.deps.orchestrator.port(container, "3306/tcp").await?;

        let database = self.spec.database.as_deref().unwrap_or("mysql");
        let user = self.spec.opt_str("user").unwrap_or("root");
        let password = self.spec.opt_str("password").unwrap_or("root");

        Ok(format!("mysql://{user}:{password}@{host}:{port}/{database}"))
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
            .map(|column| format!("CAST({column} AS CHAR)"))
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
}

#[async_trait]
impl Handler for MySql {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&mut self) -> Result<(), InfraError> {
        let dsn = self.dsn().await?;
        let pool = MySqlPoolOptions::new()
            .max_connections(5)
            .connect(&dsn)
            .await
            .map_err(|e| InfraError::HandlerInitFailed {
                handler: self.name.clone(),
                message: format!("connecting to mysql: {e}"),
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

        let rows = sqlx::query(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = DATABASE() AND table_type = 'BASE TABLE'",
        )
        .fetch_all(pool)
        .await
        .map_err(|e| reset_failed(format!("listing tables: {e}")))?;

        let mut excluded: Vec<String> =
            BUILTIN_EXCLUSIONS.iter().map(|t| String::from(*t)).collect();
        excluded.extend(self.spec.opt_str_list("exclude"));

        let tables: Vec<String> = rows
            .iter()
            .filter_map(|row| row.try_get::<String, _>(0).ok())
            .filter(|table| !excluded.iter().any(|e| e == table))
            .collect();

        if tables.is_empty() {
            return Ok(());
        }

        sqlx::raw_sql("SET FOREIGN_KEY_CHECKS = 0")
            .execute(pool)
            .await
            .map_err(|e| reset_failed(format!("disabling fk checks: {e}")))?;
        for table in &tables {
            let truncate = format!("TRUNCATE TABLE {table}");
            sqlx::raw_sql(&truncate)
                .execute(pool)
                .await
                .map_err(|e| reset_failed(format!("truncating {table}: {e}")))?;
        }
        sqlx::raw_sql("SET FOREIGN_KEY_CHECKS = 1")
            .execute(pool)
            .await
            .map(|_| ())
            .map_err(|e| reset_failed(format!("restoring fk checks: {e}")))
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
            action::EXEC_SQL => self.exec_sql(args.docstring()?).await.map(|_| ()),
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
impl SqlExecutor for MySql {
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

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn vocabulary_matches_the_postgres_shape() {
        let mysql_actions: Vec<&str> = vocabulary().steps.iter().map(|s| s.action).collect();
        let postgres_actions: Vec<&str> = super::super::postgres::vocabulary()
            .steps
            .iter()
            .map(|s| s.action)
            .collect();
        assert_eq!(mysql_actions, postgres_actions);
    }

    #[rstest]
    fn patterns_compile_for_a_resource_name() {
        for step in vocabulary().steps {
            super::super::stepdef::compile_pattern(step.pattern, "db")
                .expect("mysql pattern compiles");
        }
    }
}
