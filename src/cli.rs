//! Command-line interface definitions.

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};

/// Behavioural testing harness: Gherkin scenarios against containerised
/// resources.
#[derive(Debug, Parser)]
#[command(name = "tomato", version, about)]
pub struct Cli {
    /// The subcommand to run.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Execute all scenarios against the configured infrastructure.
    Run(RunArgs),

    /// Validate the configuration, feature files, and step bindings.
    Validate(ValidateArgs),

    /// Print the registered step vocabulary.
    Steps(StepsArgs),

    /// Render the step vocabulary for publishing.
    Docs(DocsArgs),

    /// Print the version.
    Version,
}

/// Arguments for `tomato run`.
#[derive(Debug, Parser)]
pub struct RunArgs {
    /// Path to the configuration file.
    #[arg(default_value = "tomato.yml")]
    pub config: Utf8PathBuf,

    /// Feature paths, overriding the configuration.
    #[arg(long = "features")]
    pub features: Vec<Utf8PathBuf>,

    /// Shuffle scenario order (the seed is logged).
    #[arg(long)]
    pub randomize: bool,

    /// Abort the run at the first failing scenario.
    #[arg(long)]
    pub stop_on_failure: bool,

    /// Tag filter expression, overriding the configuration.
    #[arg(long)]
    pub tags: Option<String>,

    /// Scenario-name regex filter, overriding the configuration.
    #[arg(long)]
    pub scenario: Option<String>,

    /// Output format (`pretty` or `json`), overriding the configuration.
    #[arg(long)]
    pub format: Option<String>,

    /// Suppress per-step output and app log echo.
    #[arg(long)]
    pub quiet: bool,
}

/// Arguments for `tomato validate`.
#[derive(Debug, Parser)]
pub struct ValidateArgs {
    /// Path to the configuration file.
    #[arg(default_value = "tomato.yml")]
    pub config: Utf8PathBuf,
}

/// Arguments for `tomato steps`.
#[derive(Debug, Parser)]
pub struct StepsArgs {
    /// Restrict to one resource type.
    #[arg(long = "type")]
    pub kind: Option<String>,

    /// Restrict to steps whose pattern or description contains a keyword.
    #[arg(long)]
    pub keyword: Option<String>,
}

/// Arguments for `tomato docs`.
#[derive(Debug, Parser)]
pub struct DocsArgs {
    /// Write to a file instead of stdout.
    #[arg(long)]
    pub output: Option<Utf8PathBuf>,

    /// Output format: `markdown` or `html`.
    #[arg(long, default_value = "markdown")]
    pub format: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn run_parses_with_defaults() {
        let cli = Cli::try_parse_from(["tomato", "run"]).expect("parses");
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.config, Utf8PathBuf::from("tomato.yml"));
        assert!(!args.randomize);
        assert!(args.format.is_none());
    }

    #[rstest]
    fn run_accepts_every_documented_flag() {
        let cli = Cli::try_parse_from([
            "tomato",
            "run",
            "custom.yml",
            "--features",
            "specs",
            "--randomize",
            "--stop-on-failure",
            "--tags",
            "@smoke && ~@slow",
            "--scenario",
            "^login",
            "--format",
            "json",
            "--quiet",
        ])
        .expect("parses");
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.config, Utf8PathBuf::from("custom.yml"));
        assert_eq!(args.features, vec![Utf8PathBuf::from("specs")]);
        assert!(args.randomize);
        assert!(args.stop_on_failure);
        assert_eq!(args.tags.as_deref(), Some("@smoke && ~@slow"));
        assert_eq!(args.scenario.as_deref(), Some("^login"));
        assert_eq!(args.format.as_deref(), Some("json"));
        assert!(args.quiet);
    }

    #[rstest]
    fn steps_type_filter_uses_the_type_flag() {
        let cli =
            Cli::try_parse_from(["tomato", "steps", "--type", "redis", "--keyword", "ttl"])
                .expect("parses");
        let Commands::Steps(args) = cli.command else {
            panic!("expected steps");
        };
        assert_eq!(args.kind.as_deref(), Some("redis"));
        assert_eq!(args.keyword.as_deref(), Some("ttl"));
    }

    #[rstest]
    fn docs_defaults_to_markdown() {
        let cli = Cli::try_parse_from(["tomato", "docs"]).expect("parses");
        let Commands::Docs(args) = cli.command else {
            panic!("expected docs");
        };
        assert_eq!(args.format, "markdown");
        assert!(args.output.is_none());
    }
}
