//! Engine tests: planning, filtering, and the execution loop driven end to
//! end against the shell handler (no containers required).

use std::collections::BTreeMap;

use rstest::rstest;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::config::{Hook, ResourceSpec};
use crate::handler::HandlerDeps;

/// Event recorder standing in for a real formatter.
#[derive(Default)]
struct Recorder {
    events: Vec<Event>,
}

impl Formatter for Recorder {
    fn event(&mut self, event: &Event) {
        self.events.push(event.clone());
    }
}

impl Recorder {
    fn step_statuses(&self) -> Vec<StepStatus> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::StepEnd { status, .. } => Some(*status),
                _ => None,
            })
            .collect()
    }

    fn scenario_results(&self) -> Vec<(String, bool)> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::ScenarioEnd { name, passed, .. } => Some((name.clone(), *passed)),
                _ => None,
            })
            .collect()
    }
}

fn parse_feature(source: &str) -> gherkin::Feature {
    gherkin::Feature::parse(source, gherkin::GherkinEnv::default())
        .expect("feature source parses")
}

fn offline_deps() -> HandlerDeps {
    let docker = bollard::Docker::connect_with_http(
        "http://nonexistent.tomato-test.invalid",
        5,
        bollard::API_DEFAULT_VERSION,
    )
    .expect("client construction is lazy");
    HandlerDeps {
        orchestrator: Arc::new(
            Orchestrator::new(docker, BTreeMap::new(), CancellationToken::new())
                .expect("empty graph"),
        ),
        variables: Arc::new(VariableStore::new()),
        cancel: CancellationToken::new(),
    }
}

/// Build an engine over a single shell resource and the given feature
/// sources written into a temp directory.
fn shell_engine(features: &[&str], mutate: impl FnOnce(&mut Config)) -> (Engine, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("temp dir");
    for (index, source) in features.iter().enumerate() {
        std::fs::write(tmp.path().join(format!("f{index}.feature")), source)
            .expect("write feature file");
    }

    let mut config = Config {
        version: 2,
        ..Config::default()
    };
    config.settings.reset.level = String::from("scenario");
    config.settings.reset.on_failure = String::from("reset");
    config.features.paths = vec![
        Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf-8 temp path"),
    ];
    config.resources.insert(
        String::from("sh"),
        ResourceSpec {
            kind: String::from("shell"),
            ..ResourceSpec::default()
        },
    );
    mutate(&mut config);

    let deps = offline_deps();
    let registry =
        Arc::new(Registry::new(&config.resources, &deps).expect("registry constructs"));
    let engine = Engine::new(
        config,
        registry,
        Arc::clone(&deps.orchestrator),
        Arc::clone(&deps.variables),
        RunOptions::default(),
    );
    (engine, tmp)
}

// =============================================================================
// Planning
// =============================================================================

#[rstest]
fn background_steps_prepend_to_every_scenario() {
    let feature = parse_feature(
        "Feature: F\n\
         \x20 Background:\n\
         \x20   Given I run \"true\" on \"sh\"\n\
         \x20 Scenario: one\n\
         \x20   Then \"sh\" should succeed\n\
         \x20 Scenario: two\n\
         \x20   Then \"sh\" should succeed\n",
    );
    let plan = build_plan(&[feature], &TagExpression::All);
    assert_eq!(plan.len(), 2);
    for scenario in &plan {
        assert_eq!(scenario.steps.len(), 2);
        assert!(scenario.steps[0].text.contains("I run"));
    }
}

#[rstest]
fn outlines_expand_one_scenario_per_example_row() {
    let feature = parse_feature(
        "Feature: F\n\
         \x20 Scenario Outline: echo\n\
         \x20   Given I run \"echo <word>\" on \"sh\"\n\
         \x20   Then \"sh\" stdout should contain \"<word>\"\n\
         \x20 Examples:\n\
         \x20   | word  |\n\
         \x20   | apple |\n\
         \x20   | pear  |\n",
    );
    let plan = build_plan(&[feature], &TagExpression::All);
    assert_eq!(plan.len(), 2);
    assert!(plan[0].steps[0].text.contains("echo apple"));
    assert!(plan[1].steps[1].text.contains("\"pear\""));
}

#[rstest]
fn tag_filter_selects_on_feature_and_scenario_tags() {
    let feature = parse_feature(
        "@api\n\
         Feature: F\n\
         \x20 @smoke\n\
         \x20 Scenario: tagged\n\
         \x20   Given I run \"true\" on \"sh\"\n\
         \x20 Scenario: untagged\n\
         \x20   Given I run \"true\" on \"sh\"\n",
    );

    let smoke = TagExpression::parse("@smoke").expect("parses");
    let plan = build_plan(std::slice::from_ref(&feature), &smoke);
    assert_eq!(plan.len(), 1);
    assert_eq!(plan[0].name, "tagged");

    // Feature-level tags reach every scenario.
    let api = TagExpression::parse("@api").expect("parses");
    assert_eq!(build_plan(std::slice::from_ref(&feature), &api).len(), 2);

    let excluded = TagExpression::parse("~@smoke").expect("parses");
    let plan = build_plan(&[feature], &excluded);
    assert_eq!(plan.len(), 1);
    assert_eq!(plan[0].name, "untagged");
}

#[rstest]
fn docstrings_and_tables_reach_the_plan() {
    let feature = parse_feature(
        "Feature: F\n\
         \x20 Scenario: attachments\n\
         \x20   Given I run command on \"sh\":\n\
         \x20     \"\"\"\n\
         \x20     echo hi\n\
         \x20     \"\"\"\n\
         \x20   Then \"db\" table \"users\" has values:\n\
         \x20     | id | name  |\n\
         \x20     | 1  | alice |\n",
    );
    let plan = build_plan(&[feature], &TagExpression::All);
    let steps = &plan[0].steps;
    assert!(steps[0].docstring.as_deref().is_some_and(|d| d.contains("echo hi")));
    let table = steps[1].table.as_ref().expect("table attached");
    assert_eq!(table.headers().expect("headers"), ["id", "name"]);
}

// =============================================================================
// Execution
// =============================================================================

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn passing_feature_reports_all_green() {
    let (engine, _tmp) = shell_engine(
        &["Feature: Shell\n\
           \x20 Scenario: echo\n\
           \x20   Given I run \"echo hello\" on \"sh\"\n\
           \x20   Then \"sh\" stdout should contain \"hello\"\n"],
        |_| {},
    );

    let mut recorder = Recorder::default();
    let summary = engine.run(&mut recorder).await.expect("run completes");

    assert!(summary.all_passed());
    assert_eq!(summary.scenarios_passed, 1);
    assert_eq!(summary.steps_passed, 2);
    assert_eq!(
        recorder.step_statuses(),
        vec![StepStatus::Passed, StepStatus::Passed]
    );
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn failing_step_skips_the_rest_of_the_scenario() {
    let (engine, _tmp) = shell_engine(
        &["Feature: Shell\n\
           \x20 Scenario: failure\n\
           \x20   Given I run \"echo hello\" on \"sh\"\n\
           \x20   Then \"sh\" stdout should contain \"absent\"\n\
           \x20   And \"sh\" should succeed\n"],
        |_| {},
    );

    let mut recorder = Recorder::default();
    let summary = engine.run(&mut recorder).await.expect("run completes");

    assert_eq!(summary.scenarios_failed, 1);
    assert_eq!(summary.steps_failed, 1);
    assert_eq!(summary.steps_skipped, 1);
    assert_eq!(
        recorder.step_statuses(),
        vec![StepStatus::Passed, StepStatus::Failed, StepStatus::Skipped]
    );
    assert_eq!(summary.failures.len(), 1);
    assert!(summary.failures[0].message.contains("does not contain"));
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn undefined_steps_are_reported_separately() {
    let (engine, _tmp) = shell_engine(
        &["Feature: Shell\n\
           \x20 Scenario: typo\n\
           \x20   Given I run a step nobody registered\n"],
        |_| {},
    );

    let mut recorder = Recorder::default();
    let summary = engine.run(&mut recorder).await.expect("run completes");

    assert_eq!(summary.steps_undefined, 1);
    assert_eq!(summary.steps_failed, 0);
    assert_eq!(summary.scenarios_failed, 1);
    assert_eq!(recorder.step_statuses(), vec![StepStatus::Undefined]);
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn scenario_reset_isolates_handler_state() {
    // Scenario one leaves stdout state behind; with reset level `scenario`
    // the second scenario observes a clean handler.
    let feature = "Feature: Isolation\n\
                   \x20 Scenario: write state\n\
                   \x20   Given I run \"echo state\" on \"sh\"\n\
                   \x20 Scenario: observe baseline\n\
                   \x20   Then \"sh\" stdout should be empty\n";

    let (engine, _tmp) = shell_engine(&[feature], |_| {});
    let summary = engine
        .run(&mut Recorder::default())
        .await
        .expect("run completes");
    assert!(summary.all_passed(), "reset level scenario isolates state");

    let (engine, _tmp) = shell_engine(&[feature], |config| {
        config.settings.reset.level = String::from("none");
    });
    let summary = engine
        .run(&mut Recorder::default())
        .await
        .expect("run completes");
    assert_eq!(
        summary.scenarios_failed, 1,
        "without reset the second scenario sees stale state"
    );
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn fail_fast_stops_after_the_first_failure() {
    let (engine, _tmp) = shell_engine(
        &["Feature: Shell\n\
           \x20 Scenario: a-fails\n\
           \x20   Then \"sh\" stdout should contain \"absent\"\n\
           \x20 Scenario: b-never-runs\n\
           \x20   Given I run \"true\" on \"sh\"\n"],
        |config| config.settings.fail_fast = true,
    );

    let mut recorder = Recorder::default();
    let summary = engine.run(&mut recorder).await.expect("run completes");

    assert_eq!(summary.scenarios_total(), 1);
    assert_eq!(recorder.scenario_results().len(), 1);
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn scenario_name_filter_skips_non_matching_scenarios() {
    let (engine, _tmp) = shell_engine(
        &["Feature: Shell\n\
           \x20 Scenario: keep this one\n\
           \x20   Given I run \"true\" on \"sh\"\n\
           \x20 Scenario: drop the other\n\
           \x20   Given I run \"true\" on \"sh\"\n"],
        |config| config.features.scenario = Some(String::from("^keep")),
    );

    let mut recorder = Recorder::default();
    let summary = engine.run(&mut recorder).await.expect("run completes");

    assert_eq!(summary.scenarios_total(), 1);
    assert_eq!(recorder.scenario_results()[0].0, "keep this one");
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn variable_substitution_happens_before_dispatch() {
    // With reset level `none` a variable set before the run survives into
    // step text substitution.
    let (engine, _tmp) = shell_engine(
        &["Feature: Shell\n\
           \x20 Scenario: uses variable\n\
           \x20   Given I run \"echo {{word}}\" on \"sh\"\n\
           \x20   Then \"sh\" stdout should contain \"{{word}}\"\n"],
        |config| config.settings.reset.level = String::from("none"),
    );
    engine.variables.set("word", "crimson");

    let mut recorder = Recorder::default();
    let summary = engine.run(&mut recorder).await.expect("run completes");

    assert!(summary.all_passed());
    let substituted = recorder.events.iter().any(|event| {
        matches!(event, Event::StepEnd { text, .. } if text.contains("crimson"))
    });
    assert!(substituted, "emitted step text carries the substituted value");
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn before_all_hook_failure_prevents_every_scenario() {
    let (engine, _tmp) = shell_engine(
        &["Feature: Shell\n\
           \x20 Scenario: never runs\n\
           \x20   Given I run \"true\" on \"sh\"\n"],
        |config| {
            // An empty hook is a hook error, and before_all errors are fatal.
            config.hooks.before_all.push(Hook::default());
        },
    );

    let error = engine
        .run(&mut Recorder::default())
        .await
        .expect_err("before_all failure aborts the run");
    assert!(matches!(error, TomatoError::Hook(_)));
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn after_all_hook_failure_never_alters_the_verdict() {
    let (engine, _tmp) = shell_engine(
        &["Feature: Shell\n\
           \x20 Scenario: passes\n\
           \x20   Given I run \"true\" on \"sh\"\n"],
        |config| {
            config.hooks.after_all.push(Hook::default());
        },
    );

    let summary = engine
        .run(&mut Recorder::default())
        .await
        .expect("after_all failures are logged, not fatal");
    assert!(summary.all_passed());
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn before_scenario_hook_failure_fails_that_scenario_only() {
    let (engine, _tmp) = shell_engine(
        &["Feature: Shell\n\
           \x20 Scenario: one\n\
           \x20   Given I run \"true\" on \"sh\"\n\
           \x20 Scenario: two\n\
           \x20   Given I run \"true\" on \"sh\"\n"],
        |config| {
            config.hooks.before_scenario.push(Hook::default());
        },
    );

    let summary = engine
        .run(&mut Recorder::default())
        .await
        .expect("run completes");
    // Both scenarios fail via the hook, but the run itself proceeds.
    assert_eq!(summary.scenarios_failed, 2);
    assert_eq!(summary.steps_skipped, 2);
}

#[rstest]
fn step_binding_check_warns_on_unbound_steps() {
    let feature = parse_feature(
        "Feature: F\n\
         \x20 Scenario: mixed\n\
         \x20   Given I run \"true\" on \"sh\"\n\
         \x20   And this step matches no vocabulary\n",
    );
    let plan = build_plan(&[feature], &TagExpression::All);

    let mut config = Config::default();
    config.resources.insert(
        String::from("sh"),
        ResourceSpec {
            kind: String::from("shell"),
            ..ResourceSpec::default()
        },
    );

    let warnings = check_step_bindings(&config, &plan);
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("undefined step"));
}
