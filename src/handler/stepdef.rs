//! Step definition metadata and typed step arguments.
//!
//! Each handler publishes a [`StepCategory`] of [`StepDef`]s. The pattern is
//! a regex template carrying a literal `{resource}` placeholder; at
//! registration the dispatcher substitutes the resource's configured name
//! (escaped) and compiles the result. Matching is full-string: patterns are
//! written with explicit `^...$` anchors.
//!
//! Capture groups reach the handler through [`StepArgs`], which coerces
//! `(\d+)` captures to integers on access and surfaces the step's attached
//! docstring or data table.

use regex::Regex;

use crate::error::StepError;

/// One step definition: pattern template, documentation, and the action
/// identifier the owning handler resolves in `run_step`.
#[derive(Debug, Clone)]
pub struct StepDef {
    /// Category within a handler (for `steps`/`docs` output grouping).
    pub group: &'static str,

    /// Anchored regex template with a `{resource}` placeholder.
    pub pattern: &'static str,

    /// What this step does.
    pub description: &'static str,

    /// Usage example for documentation output.
    pub example: &'static str,

    /// Action name dispatched back to the handler.
    pub action: &'static str,
}

/// A handler's named group of step definitions.
#[derive(Debug, Clone)]
pub struct StepCategory {
    /// Display name (`Postgres`, `HTTP Client`, ...).
    pub name: &'static str,

    /// What the vocabulary covers.
    pub description: &'static str,

    /// The step definitions.
    pub steps: Vec<StepDef>,
}

/// Substitute the resource name into a pattern template and compile it.
///
/// The resource name is regex-escaped, so names containing metacharacters
/// stay literal.
///
/// # Errors
///
/// Returns `regex::Error` when the resulting pattern is invalid.
pub fn compile_pattern(pattern: &str, resource: &str) -> Result<Regex, regex::Error> {
    Regex::new(&pattern.replace("{resource}", &regex::escape(resource)))
}

/// Substitute the resource name into an example for documentation output.
#[must_use]
pub fn format_example(example: &str, resource: &str) -> String {
    example.replace("{resource}", resource)
}

/// A pipe-delimited data table attached to a step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataTable {
    /// All rows, including the header row when the step treats the first
    /// row as column names.
    pub rows: Vec<Vec<String>>,
}

impl DataTable {
    /// Build a table from raw rows.
    #[must_use]
    pub fn new(rows: Vec<Vec<String>>) -> Self {
        Self { rows }
    }

    /// The header row.
    #[must_use]
    pub fn headers(&self) -> Option<&[String]> {
        self.rows.first().map(Vec::as_slice)
    }

    /// The rows after the header.
    #[must_use]
    pub fn data_rows(&self) -> &[Vec<String>] {
        self.rows.get(1..).unwrap_or_default()
    }

    /// Whether the table has a header and at least one data row.
    #[must_use]
    pub fn has_data(&self) -> bool {
        self.rows.len() >= 2
    }

    /// Column index for a header name, compared case-insensitively.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers()?
            .iter()
            .position(|header| header.eq_ignore_ascii_case(name))
    }
}

/// Parsed arguments for one step invocation.
#[derive(Debug, Clone, Default)]
pub struct StepArgs {
    captures: Vec<String>,
    docstring: Option<String>,
    table: Option<DataTable>,
}

impl StepArgs {
    /// Build arguments from capture groups and optional attachments.
    #[must_use]
    pub fn new(
        captures: Vec<String>,
        docstring: Option<String>,
        table: Option<DataTable>,
    ) -> Self {
        Self {
            captures,
            docstring,
            table,
        }
    }

    /// The capture at `index` as a string.
    ///
    /// # Errors
    ///
    /// Returns `StepError::InvalidArgument` when the capture is absent.
    pub fn string(&self, index: usize) -> Result<&str, StepError> {
        self.captures
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| StepError::InvalidArgument {
                index,
                message: String::from("capture group missing"),
            })
    }

    /// The capture at `index` coerced to an integer.
    ///
    /// # Errors
    ///
    /// Returns `StepError::InvalidArgument` when the capture is absent or
    /// not an integer.
    pub fn int(&self, index: usize) -> Result<i64, StepError> {
        let raw = self.string(index)?;
        raw.parse().map_err(|_| StepError::InvalidArgument {
            index,
            message: format!("expected integer, got \"{raw}\""),
        })
    }

    /// The capture at `index` parsed as a humantime duration (`"5s"`).
    ///
    /// # Errors
    ///
    /// Returns `StepError::InvalidArgument` when the capture is absent or
    /// not a duration literal.
    pub fn duration(&self, index: usize) -> Result<std::time::Duration, StepError> {
        let raw = self.string(index)?;
        humantime::parse_duration(raw).map_err(|e| StepError::InvalidArgument {
            index,
            message: format!("invalid duration \"{raw}\": {e}"),
        })
    }

    /// The step's docstring.
    ///
    /// # Errors
    ///
    /// Returns `StepError::MissingAttachment` when no docstring is attached.
    pub fn docstring(&self) -> Result<&str, StepError> {
        self.docstring
            .as_deref()
            .ok_or_else(|| StepError::MissingAttachment {
                expected: String::from("a docstring"),
            })
    }

    /// The step's data table.
    ///
    /// # Errors
    ///
    /// Returns `StepError::MissingAttachment` when no table is attached.
    pub fn table(&self) -> Result<&DataTable, StepError> {
        self.table
            .as_ref()
            .ok_or_else(|| StepError::MissingAttachment {
                expected: String::from("a data table"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn compile_pattern_substitutes_and_escapes_the_resource() {
        let regex = compile_pattern(r#"^"{resource}" key "([^"]*)" should exist$"#, "my.cache")
            .expect("pattern compiles");
        let captures = regex
            .captures(r#""my.cache" key "session" should exist"#)
            .expect("matches substituted resource");
        assert_eq!(&captures[1], "session");

        // The dot must be literal, not a wildcard.
        assert!(!regex.is_match(r#""myxcache" key "session" should exist"#));
    }

    #[rstest]
    fn int_coercion_reports_non_numeric_captures() {
        let args = StepArgs::new(vec![String::from("users"), String::from("5")], None, None);
        assert_eq!(args.int(1).expect("numeric capture"), 5);

        let error = args.int(0).expect_err("non-numeric capture");
        assert!(matches!(error, StepError::InvalidArgument { index: 0, .. }));
    }

    #[rstest]
    fn duration_coercion_parses_humantime_literals() {
        let args = StepArgs::new(vec![String::from("5s")], None, None);
        assert_eq!(
            args.duration(0).expect("valid duration"),
            std::time::Duration::from_secs(5)
        );
    }

    #[rstest]
    fn missing_attachments_are_precise_errors() {
        let args = StepArgs::default();
        assert!(matches!(
            args.docstring().expect_err("no docstring"),
            StepError::MissingAttachment { .. }
        ));
        assert!(matches!(
            args.table().expect_err("no table"),
            StepError::MissingAttachment { .. }
        ));
    }

    #[rstest]
    fn data_table_splits_headers_and_rows() {
        let table = DataTable::new(vec![
            vec![String::from("id"), String::from("name")],
            vec![String::from("1"), String::from("alice")],
        ]);
        assert!(table.has_data());
        assert_eq!(table.headers().expect("headers"), ["id", "name"]);
        assert_eq!(table.data_rows().len(), 1);
        assert_eq!(table.column_index("NAME"), Some(1));
        assert_eq!(table.column_index("email"), None);
    }
}
