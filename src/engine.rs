//! Scenario engine: feature discovery, planning, and the execution loop.
//!
//! Features are discovered recursively under the configured paths, parsed
//! to Gherkin documents, and lowered to a flat execution plan: Background
//! steps are prepended to every scenario and Scenario Outlines are expanded
//! one scenario per Examples row. The loop then drives each scenario
//! through the reset policy, hooks, variable substitution, and step
//! dispatch, emitting structured events for the formatters.

pub mod dispatcher;
pub mod hooks;
pub mod tags;

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use rand::SeedableRng;
use rand::seq::SliceRandom;
use regex::Regex;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::{Config, OnFailure, ResetLevel};
use crate::error::{ConfigError, StepError, TomatoError};
use crate::formatter::{Event, FailureRecord, Formatter, RunSummary, StepStatus};
use crate::handler::stepdef::{DataTable, StepArgs};
use crate::handler::{Registry, VariableStore};
use crate::orchestrator::Orchestrator;

use self::dispatcher::{Dispatcher, Resolution};
use self::tags::TagExpression;

#[cfg(test)]
mod tests;

/// One step ready to dispatch.
#[derive(Debug, Clone)]
pub struct PlannedStep {
    /// The Gherkin keyword as written (`Given`, `And`, ...).
    pub keyword: String,
    /// The step text before variable substitution.
    pub text: String,
    /// Attached docstring, if any.
    pub docstring: Option<String>,
    /// Attached data table, if any.
    pub table: Option<DataTable>,
}

/// One concrete scenario in the execution plan.
#[derive(Debug, Clone)]
pub struct PlannedScenario {
    /// The enclosing feature's name.
    pub feature: String,
    /// The feature file's path.
    pub path: String,
    /// The scenario's name.
    pub name: String,
    /// Feature-level plus scenario-level tags.
    pub tags: Vec<String>,
    /// Background steps followed by the scenario's own steps.
    pub steps: Vec<PlannedStep>,
}

/// Engine run options beyond the configuration file.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Shuffle scenario order with a logged seed.
    pub randomize: bool,
}

/// Executes planned scenarios against a ready registry.
pub struct Engine {
    config: Config,
    registry: Arc<Registry>,
    orchestrator: Arc<Orchestrator>,
    variables: Arc<VariableStore>,
    options: RunOptions,
}

impl Engine {
    /// Create an engine over started infrastructure.
    #[must_use]
    pub fn new(
        config: Config,
        registry: Arc<Registry>,
        orchestrator: Arc<Orchestrator>,
        variables: Arc<VariableStore>,
        options: RunOptions,
    ) -> Self {
        Self {
            config,
            registry,
            orchestrator,
            variables,
            options,
        }
    }

    /// Execute every selected scenario and report the aggregated result.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for unloadable features or filters, and
    /// `HookError` when a `before_all` hook fails. Scenario failures are
    /// reported in the summary, not as an `Err`.
    pub async fn run(&self, formatter: &mut dyn Formatter) -> Result<RunSummary, TomatoError> {
        if self.config.settings.parallel > 1 {
            // Handler request state is per-registry; concurrent scenarios
            // would share it. Execution stays serial until per-worker
            // handler pools exist.
            warn!(
                requested = self.config.settings.parallel,
                "parallel > 1 is not supported; running scenarios serially"
            );
        }

        let scenario_filter = self.scenario_filter()?;
        let tag_filter =
            TagExpression::parse(self.config.features.tags.as_deref().unwrap_or_default())
                .map_err(TomatoError::Config)?;

        let features = discover_features(&self.config.features.paths)?;
        let mut plan = build_plan(&features, &tag_filter);
        if let Some(filter) = &scenario_filter {
            plan.retain(|scenario| filter.is_match(&scenario.name));
        }

        let seed = if self.options.randomize {
            let seed: u64 = rand::random();
            info!(seed, "randomising scenario order");
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
            plan.shuffle(&mut rng);
            Some(seed)
        } else {
            None
        };

        let mut dispatcher = Dispatcher::new();
        for (resource, category) in self.registry.step_categories().await {
            dispatcher
                .register(&resource, &category)
                .map_err(TomatoError::Config)?;
        }

        let feature_count = plan
            .iter()
            .map(|scenario| scenario.feature.as_str())
            .collect::<std::collections::BTreeSet<_>>()
            .len();
        formatter.event(&Event::RunStarted {
            features: feature_count,
            scenarios: plan.len(),
            seed,
        });

        hooks::run_hooks(
            &self.config.hooks.before_all,
            &self.registry,
            &self.orchestrator,
        )
        .await
        .map_err(TomatoError::Hook)?;

        let summary = self.run_plan(&plan, &dispatcher, formatter).await;

        if let Err(error) = hooks::run_hooks(
            &self.config.hooks.after_all,
            &self.registry,
            &self.orchestrator,
        )
        .await
        {
            warn!(%error, "after_all hooks failed");
        }

        formatter.event(&Event::RunEnded {
            summary: summary.clone(),
        });
        Ok(summary)
    }

    async fn run_plan(
        &self,
        plan: &[PlannedScenario],
        dispatcher: &Dispatcher,
        formatter: &mut dyn Formatter,
    ) -> RunSummary {
        let level = self.config.settings.reset.parsed_level();
        let on_failure = self.config.settings.reset.parsed_on_failure();

        let mut summary = RunSummary::default();
        let mut seen_features = std::collections::BTreeSet::new();
        let mut current_feature: Option<String> = None;
        let mut previous_failed = false;
        let mut first_scenario = true;

        for scenario in plan {
            let feature_changed = current_feature.as_deref() != Some(scenario.feature.as_str());
            if feature_changed {
                if seen_features.insert(scenario.feature.clone()) {
                    summary.features += 1;
                }
                current_feature = Some(scenario.feature.clone());
                formatter.event(&Event::FeatureStarted {
                    name: scenario.feature.clone(),
                    path: scenario.path.clone(),
                });
            }
            formatter.event(&Event::ScenarioStarted {
                feature: scenario.feature.clone(),
                name: scenario.name.clone(),
            });

            let boundary = match level {
                ResetLevel::Scenario => true,
                ResetLevel::Feature => feature_changed,
                ResetLevel::Run => first_scenario,
                ResetLevel::None => false,
            };
            first_scenario = false;

            let mut scenario_failed = false;
            let keep_state = previous_failed && on_failure == OnFailure::Keep;
            if boundary && !keep_state {
                self.variables.reset();
                if let Err(error) = self.registry.reset_all().await {
                    scenario_failed = true;
                    summary.failures.push(FailureRecord {
                        feature: scenario.feature.clone(),
                        scenario: scenario.name.clone(),
                        step: String::from("(reset)"),
                        message: error.to_string(),
                    });
                }
            }

            if !scenario_failed
                && let Err(error) = hooks::run_hooks(
                    &self.config.hooks.before_scenario,
                    &self.registry,
                    &self.orchestrator,
                )
                .await
            {
                scenario_failed = true;
                summary.failures.push(FailureRecord {
                    feature: scenario.feature.clone(),
                    scenario: scenario.name.clone(),
                    step: String::from("(before_scenario hook)"),
                    message: error.to_string(),
                });
            }

            self.run_steps(
                scenario,
                dispatcher,
                formatter,
                &mut summary,
                &mut scenario_failed,
            )
            .await;

            if let Err(error) = hooks::run_hooks(
                &self.config.hooks.after_scenario,
                &self.registry,
                &self.orchestrator,
            )
            .await
            {
                warn!(scenario = %scenario.name, %error, "after_scenario hooks failed");
            }

            if scenario_failed {
                summary.scenarios_failed += 1;
            } else {
                summary.scenarios_passed += 1;
            }
            formatter.event(&Event::ScenarioEnd {
                feature: scenario.feature.clone(),
                name: scenario.name.clone(),
                passed: !scenario_failed,
            });

            previous_failed = scenario_failed;
            if scenario_failed && self.config.settings.fail_fast {
                break;
            }
        }

        summary
    }

    async fn run_steps(
        &self,
        scenario: &PlannedScenario,
        dispatcher: &Dispatcher,
        formatter: &mut dyn Formatter,
        summary: &mut RunSummary,
        scenario_failed: &mut bool,
    ) {
        let deadline = tokio::time::Instant::now() + self.config.settings.timeout;

        for step in &scenario.steps {
            let text = self.variables.replace(&step.text);

            if *scenario_failed {
                summary.steps_skipped += 1;
                formatter.event(&Event::StepEnd {
                    feature: scenario.feature.clone(),
                    scenario: scenario.name.clone(),
                    keyword: step.keyword.clone(),
                    text,
                    status: StepStatus::Skipped,
                    message: None,
                });
                continue;
            }

            let (status, message) = match dispatcher.resolve(&text) {
                Resolution::Undefined => {
                    summary.steps_undefined += 1;
                    let error = StepError::Undefined { text: text.clone() };
                    (StepStatus::Undefined, Some(error.to_string()))
                }
                Resolution::Ambiguous { count } => {
                    summary.steps_ambiguous += 1;
                    let error = StepError::Ambiguous {
                        text: text.clone(),
                        count,
                    };
                    (StepStatus::Ambiguous, Some(error.to_string()))
                }
                Resolution::Match {
                    resource,
                    action,
                    captures,
                } => {
                    let args =
                        StepArgs::new(captures, step.docstring.clone(), step.table.clone());
                    let remaining = deadline
                        .checked_duration_since(tokio::time::Instant::now())
                        .unwrap_or(Duration::ZERO);

                    let outcome = tokio::time::timeout(
                        remaining,
                        self.registry.run_step(&resource, action, &args),
                    )
                    .await;

                    match outcome {
                        Ok(Ok(())) => {
                            summary.steps_passed += 1;
                            (StepStatus::Passed, None)
                        }
                        Ok(Err(error)) => {
                            summary.steps_failed += 1;
                            (StepStatus::Failed, Some(error.to_string()))
                        }
                        Err(_) => {
                            summary.steps_failed += 1;
                            let message = format!(
                                "scenario timeout ({}) exceeded",
                                humantime::format_duration(self.config.settings.timeout)
                            );
                            (StepStatus::Failed, Some(message))
                        }
                    }
                }
            };

            if status != StepStatus::Passed {
                *scenario_failed = true;
                summary.failures.push(FailureRecord {
                    feature: scenario.feature.clone(),
                    scenario: scenario.name.clone(),
                    step: text.clone(),
                    message: message.clone().unwrap_or_default(),
                });
            }

            formatter.event(&Event::StepEnd {
                feature: scenario.feature.clone(),
                scenario: scenario.name.clone(),
                keyword: step.keyword.clone(),
                text,
                status,
                message,
            });
        }
    }

    fn scenario_filter(&self) -> Result<Option<Regex>, TomatoError> {
        self.config
            .features
            .scenario
            .as_deref()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    TomatoError::Config(ConfigError::InvalidValue {
                        field: String::from("features.scenario"),
                        reason: e.to_string(),
                    })
                })
            })
            .transpose()
    }
}

/// Recursively collect and parse every `.feature` file under the paths.
///
/// # Errors
///
/// Returns `ConfigError::InvalidValue` when a feature file fails to parse.
pub fn discover_features(paths: &[Utf8PathBuf]) -> Result<Vec<gherkin::Feature>, ConfigError> {
    let mut files = Vec::new();
    for root in paths {
        for entry in WalkDir::new(root.as_std_path())
            .into_iter()
            .filter_map(Result::ok)
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "feature") {
                files.push(path.to_path_buf());
            }
        }
    }
    files.sort();

    let mut features = Vec::with_capacity(files.len());
    for file in files {
        let feature = gherkin::Feature::parse_path(&file, gherkin::GherkinEnv::default())
            .map_err(|e| ConfigError::InvalidValue {
                field: file.display().to_string(),
                reason: e.to_string(),
            })?;
        features.push(feature);
    }
    Ok(features)
}

/// Lower parsed features into the flat execution plan, applying the tag
/// filter, prepending Background steps, and expanding Scenario Outlines.
#[must_use]
pub fn build_plan(features: &[gherkin::Feature], filter: &TagExpression) -> Vec<PlannedScenario> {
    let mut plan = Vec::new();

    for feature in features {
        let path = feature
            .path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let background: Vec<PlannedStep> = feature
            .background
            .as_ref()
            .map(|background| background.steps.iter().map(plan_step).collect())
            .unwrap_or_default();

        for scenario in &feature.scenarios {
            let mut tags = feature.tags.clone();
            tags.extend(scenario.tags.iter().cloned());
            if !filter.matches(&tags) {
                continue;
            }

            if scenario.examples.is_empty() {
                let mut steps = background.clone();
                steps.extend(scenario.steps.iter().map(plan_step));
                plan.push(PlannedScenario {
                    feature: feature.name.clone(),
                    path: path.clone(),
                    name: scenario.name.clone(),
                    tags,
                    steps,
                });
                continue;
            }

            for examples in &scenario.examples {
                let Some(table) = examples.table.as_ref() else {
                    continue;
                };
                let Some((header, rows)) = table.rows.split_first() else {
                    continue;
                };
                for row in rows {
                    let mut steps = background.clone();
                    steps.extend(
                        scenario
                            .steps
                            .iter()
                            .map(|step| expand_step(step, header, row)),
                    );
                    plan.push(PlannedScenario {
                        feature: feature.name.clone(),
                        path: path.clone(),
                        name: scenario.name.clone(),
                        tags: tags.clone(),
                        steps,
                    });
                }
            }
        }
    }

    plan
}

fn plan_step(step: &gherkin::Step) -> PlannedStep {
    PlannedStep {
        keyword: step.keyword.trim().to_owned(),
        text: step.value.clone(),
        docstring: step.docstring.clone(),
        table: step
            .table
            .as_ref()
            .map(|table| DataTable::new(table.rows.clone())),
    }
}

/// Substitute `<name>` placeholders from one Examples row into a step.
fn expand_step(step: &gherkin::Step, header: &[String], row: &[String]) -> PlannedStep {
    let substitute = |input: &str| -> String {
        let mut output = String::from(input);
        for (name, value) in header.iter().zip(row) {
            output = output.replace(&format!("<{name}>"), value);
        }
        output
    };

    PlannedStep {
        keyword: step.keyword.trim().to_owned(),
        text: substitute(&step.value),
        docstring: step.docstring.as_deref().map(substitute),
        table: step.table.as_ref().map(|table| {
            DataTable::new(
                table
                    .rows
                    .iter()
                    .map(|cells| cells.iter().map(|cell| substitute(cell)).collect())
                    .collect(),
            )
        }),
    }
}

/// Step-binding check used by the `validate` command: resolve every planned
/// step against the vocabularies the declared resources would register.
///
/// Returns the list of warnings (undefined or ambiguous steps).
#[must_use]
pub fn check_step_bindings(config: &Config, plan: &[PlannedScenario]) -> Vec<String> {
    let mut dispatcher = Dispatcher::new();
    for (name, spec) in &config.resources {
        let canonical = crate::handler::registry::canonical_kind(&spec.kind);
        if let Some((_, category)) = crate::handler::registry::vocabularies()
            .into_iter()
            .find(|(kind, _)| *kind == canonical)
        {
            // Patterns ship with the crate; compilation cannot fail here.
            let _ = dispatcher.register(name, &category);
        }
    }

    let mut warnings = Vec::new();
    for scenario in plan {
        for step in &scenario.steps {
            match dispatcher.resolve(&step.text) {
                Resolution::Match { .. } => {}
                Resolution::Undefined => warnings.push(format!(
                    "{} > {}: undefined step: {}",
                    scenario.feature, scenario.name, step.text
                )),
                Resolution::Ambiguous { count } => warnings.push(format!(
                    "{} > {}: ambiguous step ({count} matches): {}",
                    scenario.feature, scenario.name, step.text
                )),
            }
        }
    }
    warnings
}

