//! Step vocabulary rendering for the `steps` and `docs` commands.
//!
//! Both commands show the same content: every handler's step definitions
//! with pattern, description, and example. `steps` renders for the
//! terminal with optional type and keyword filters; `docs` renders
//! markdown or HTML for publishing.

use std::fmt::Write as _;

use crate::handler::registry::vocabularies;
use crate::handler::stepdef::StepCategory;

/// Select vocabularies, optionally restricted to one resource type and to
/// steps whose pattern or description contains a keyword.
#[must_use]
pub fn filtered(kind: Option<&str>, keyword: Option<&str>) -> Vec<(&'static str, StepCategory)> {
    vocabularies()
        .into_iter()
        .filter(|(name, _)| kind.is_none_or(|wanted| *name == wanted))
        .filter_map(|(name, mut category)| {
            if let Some(keyword) = keyword {
                let needle = keyword.to_lowercase();
                category.steps.retain(|step| {
                    step.pattern.to_lowercase().contains(&needle)
                        || step.description.to_lowercase().contains(&needle)
                });
            }
            (!category.steps.is_empty()).then_some((name, category))
        })
        .collect()
}

/// Terminal rendering for the `steps` command.
#[must_use]
pub fn render_terminal(selection: &[(&'static str, StepCategory)]) -> String {
    let mut output = String::new();
    for (kind, category) in selection {
        let _ = writeln!(output, "{} ({kind})", category.name);
        let _ = writeln!(output, "  {}", category.description);
        let mut current_group = "";
        for step in &category.steps {
            if !step.group.is_empty() && step.group != current_group {
                current_group = step.group;
                let _ = writeln!(output, "\n  [{current_group}]");
            }
            let _ = writeln!(output, "    {}", step.pattern);
            let _ = writeln!(output, "      {}", step.description);
        }
        let _ = writeln!(output);
    }
    output
}

/// Markdown rendering for the `docs` command.
#[must_use]
pub fn render_markdown(selection: &[(&'static str, StepCategory)]) -> String {
    let mut output = String::from("# Step reference\n");
    for (kind, category) in selection {
        let _ = writeln!(output, "\n## {} (`{kind}`)\n", category.name);
        let _ = writeln!(output, "{}\n", category.description);
        for step in &category.steps {
            let _ = writeln!(output, "### `{}`\n", step.pattern);
            let _ = writeln!(output, "{}\n", step.description);
            if !step.example.is_empty() {
                let _ = writeln!(output, "```gherkin\n{}\n```\n", step.example);
            }
        }
    }
    output
}

/// HTML rendering for the `docs` command.
#[must_use]
pub fn render_html(selection: &[(&'static str, StepCategory)]) -> String {
    let mut output = String::from(
        "<!doctype html>\n<html>\n<head><meta charset=\"utf-8\"><title>Step reference</title></head>\n<body>\n<h1>Step reference</h1>\n",
    );
    for (kind, category) in selection {
        let _ = writeln!(
            output,
            "<h2>{} (<code>{kind}</code>)</h2>\n<p>{}</p>",
            escape(category.name),
            escape(category.description)
        );
        let _ = writeln!(output, "<table>\n<tr><th>Pattern</th><th>Description</th></tr>");
        for step in &category.steps {
            let _ = writeln!(
                output,
                "<tr><td><code>{}</code></td><td>{}</td></tr>",
                escape(step.pattern),
                escape(step.description)
            );
        }
        let _ = writeln!(output, "</table>");
    }
    output.push_str("</body>\n</html>\n");
    output
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn unfiltered_selection_covers_every_type() {
        let selection = filtered(None, None);
        assert_eq!(selection.len(), 10);
    }

    #[rstest]
    fn type_filter_narrows_to_one_vocabulary() {
        let selection = filtered(Some("redis"), None);
        assert_eq!(selection.len(), 1);
        assert_eq!(selection[0].0, "redis");
    }

    #[rstest]
    fn keyword_filter_narrows_steps() {
        let selection = filtered(Some("http-client"), Some("header"));
        assert_eq!(selection.len(), 1);
        assert!(
            selection[0]
                .1
                .steps
                .iter()
                .all(|step| step.pattern.contains("header")
                    || step.description.to_lowercase().contains("header"))
        );
    }

    #[rstest]
    fn keyword_with_no_matches_drops_the_category() {
        let selection = filtered(Some("redis"), Some("no-such-term-anywhere"));
        assert!(selection.is_empty());
    }

    #[rstest]
    fn renderings_include_patterns() {
        let selection = filtered(Some("postgres"), None);
        let terminal = render_terminal(&selection);
        assert!(terminal.contains("table \"([^\"]*)\" is empty"));

        let markdown = render_markdown(&selection);
        assert!(markdown.starts_with("# Step reference"));
        assert!(markdown.contains("```gherkin"));

        let html = render_html(&selection);
        assert!(html.contains("<table>"));
        assert!(html.contains("&quot;") || html.contains("table"));
    }
}
