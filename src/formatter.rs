//! Structured run events and their formatters.
//!
//! The engine emits one event stream; formatters render it. `pretty` writes
//! a human-oriented feature/scenario/step tree to the terminal, `json`
//! writes one JSON object per event line for tooling to consume. Both see
//! the identical events, so alternative formatters need no engine changes.

use serde::Serialize;

/// Outcome of one executed (or skipped) step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// The handler function returned success.
    Passed,
    /// The handler function returned an error.
    Failed,
    /// Skipped because an earlier step in the scenario failed.
    Skipped,
    /// No registered pattern matched.
    Undefined,
    /// More than one registered pattern matched.
    Ambiguous,
}

/// Aggregated result of a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    /// Number of features that contributed scenarios.
    pub features: usize,
    /// Scenarios that passed.
    pub scenarios_passed: usize,
    /// Scenarios that failed.
    pub scenarios_failed: usize,
    /// Steps that passed.
    pub steps_passed: usize,
    /// Steps that failed (handler errors).
    pub steps_failed: usize,
    /// Steps skipped after a failure.
    pub steps_skipped: usize,
    /// Steps with no matching pattern.
    pub steps_undefined: usize,
    /// Steps with more than one matching pattern.
    pub steps_ambiguous: usize,
    /// Per-failure diagnostics.
    pub failures: Vec<FailureRecord>,
}

impl RunSummary {
    /// Whether every scenario passed.
    #[must_use]
    pub const fn all_passed(&self) -> bool {
        self.scenarios_failed == 0
    }

    /// Total scenarios executed.
    #[must_use]
    pub const fn scenarios_total(&self) -> usize {
        self.scenarios_passed + self.scenarios_failed
    }
}

/// One failure, with enough context to locate it.
#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    /// The feature's name.
    pub feature: String,
    /// The scenario's name.
    pub scenario: String,
    /// The failing step's text.
    pub step: String,
    /// The handler's diagnostic string.
    pub message: String,
}

/// One event in the run's structured stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// The run is starting.
    RunStarted {
        /// Number of selected features.
        features: usize,
        /// Number of selected scenarios.
        scenarios: usize,
        /// Shuffle seed, when randomisation is on.
        #[serde(skip_serializing_if = "Option::is_none")]
        seed: Option<u64>,
    },

    /// A feature's first scenario is about to run.
    FeatureStarted {
        /// The feature's name.
        name: String,
        /// The feature file's path.
        path: String,
    },

    /// A scenario is about to run.
    ScenarioStarted {
        /// The enclosing feature.
        feature: String,
        /// The scenario's name.
        name: String,
    },

    /// A step finished (or was skipped).
    StepEnd {
        /// The enclosing feature.
        feature: String,
        /// The enclosing scenario.
        scenario: String,
        /// The Gherkin keyword (`Given`, `When`, ...).
        keyword: String,
        /// The step text after variable substitution.
        text: String,
        /// The step's outcome.
        status: StepStatus,
        /// Failure diagnostic, when the step did not pass.
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// A scenario finished.
    ScenarioEnd {
        /// The enclosing feature.
        feature: String,
        /// The scenario's name.
        name: String,
        /// Whether every step passed.
        passed: bool,
    },

    /// The run finished.
    RunEnded {
        /// The aggregated result.
        summary: RunSummary,
    },
}

/// Consumes the engine's event stream.
pub trait Formatter: Send {
    /// Observe one event.
    fn event(&mut self, event: &Event);
}

/// Human-oriented terminal output.
pub struct PrettyFormatter {
    quiet: bool,
}

impl PrettyFormatter {
    /// Create a pretty formatter; `quiet` suppresses per-step lines.
    #[must_use]
    pub const fn new(quiet: bool) -> Self {
        Self { quiet }
    }
}

impl Formatter for PrettyFormatter {
    fn event(&mut self, event: &Event) {
        match event {
            Event::RunStarted {
                features,
                scenarios,
                seed,
            } => {
                println!("Running {scenarios} scenarios from {features} features");
                if let Some(seed) = seed {
                    println!("Randomised order (seed {seed})");
                }
            }
            Event::FeatureStarted { name, path } => {
                println!("\nFeature: {name} ({path})");
            }
            Event::ScenarioStarted { name, .. } => {
                if !self.quiet {
                    println!("  Scenario: {name}");
                }
            }
            Event::StepEnd {
                keyword,
                text,
                status,
                message,
                ..
            } => {
                if self.quiet {
                    return;
                }
                let glyph = match status {
                    StepStatus::Passed => "\u{2713}",
                    StepStatus::Failed => "\u{2717}",
                    StepStatus::Skipped => "-",
                    StepStatus::Undefined => "?",
                    StepStatus::Ambiguous => "!",
                };
                println!("    {glyph} {keyword} {text}");
                if let Some(message) = message {
                    for line in message.lines() {
                        println!("        {line}");
                    }
                }
            }
            Event::ScenarioEnd { name, passed, .. } => {
                if !self.quiet && !passed {
                    println!("  Scenario failed: {name}");
                }
            }
            Event::RunEnded { summary } => {
                println!();
                println!(
                    "{} scenarios ({} passed, {} failed)",
                    summary.scenarios_total(),
                    summary.scenarios_passed,
                    summary.scenarios_failed
                );
                println!(
                    "{} steps passed, {} failed, {} skipped, {} undefined, {} ambiguous",
                    summary.steps_passed,
                    summary.steps_failed,
                    summary.steps_skipped,
                    summary.steps_undefined,
                    summary.steps_ambiguous
                );
                for failure in &summary.failures {
                    println!(
                        "\n  {} > {} > {}\n    {}",
                        failure.feature, failure.scenario, failure.step, failure.message
                    );
                }
            }
        }
    }
}

/// One JSON object per event line.
#[derive(Default)]
pub struct JsonFormatter;

impl JsonFormatter {
    /// Create a JSON formatter.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Formatter for JsonFormatter {
    fn event(&mut self, event: &Event) {
        if let Ok(line) = serde_json::to_string(event) {
            println!("{line}");
        }
    }
}

/// Build the formatter for a validated output format name.
#[must_use]
pub fn for_format(format: &str, quiet: bool) -> Box<dyn Formatter> {
    match format {
        "json" => Box::new(JsonFormatter::new()),
        _ => Box::new(PrettyFormatter::new(quiet)),
    }
}
