//! End-to-end HTTP flows: a mock server resource and a client resource
//! driven entirely through feature files, with no containers involved.
//!
//! The client reaches the mock server through a captured variable: the
//! mock's OS-assigned URL is stored by a step and substituted into request
//! paths.

mod support;

use std::collections::BTreeMap;

use rstest::rstest;

use support::{Recorder, engine_with, resource};
use tomato::formatter::StepStatus;

fn http_resources() -> BTreeMap<String, tomato::config::ResourceSpec> {
    BTreeMap::from([
        (String::from("api"), resource("http-server")),
        (String::from("client"), resource("http-client")),
    ])
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn stubbed_endpoint_round_trips_through_the_client() {
    let feature = "Feature: Stubbing\n\
        \x20 Scenario: success class\n\
        \x20   Given \"api\" stub \"GET\" \"/ok\" returns \"200\"\n\
        \x20   And \"api\" url is stored in \"MOCK_URL\"\n\
        \x20   When \"client\" sends \"GET\" to \"{{MOCK_URL}}/ok\"\n\
        \x20   Then \"client\" response status is success\n\
        \x20   And \"api\" received \"GET\" \"/ok\"\n";

    let (engine, _tmp) = engine_with(http_resources(), &[feature], |_| {}).await;
    let mut recorder = Recorder::default();
    let summary = engine.run(&mut recorder).await.expect("run completes");

    assert!(summary.all_passed(), "failures: {:?}", summary.failures);
    assert_eq!(summary.steps_passed, 5);
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn server_error_stub_fails_the_status_class_assertion() {
    let feature = "Feature: Stubbing\n\
        \x20 Scenario: wrong class\n\
        \x20   Given \"api\" stub \"GET\" \"/ok\" returns \"500\"\n\
        \x20   And \"api\" url is stored in \"MOCK_URL\"\n\
        \x20   When \"client\" sends \"GET\" to \"{{MOCK_URL}}/ok\"\n\
        \x20   Then \"client\" response status is success\n";

    let (engine, _tmp) = engine_with(http_resources(), &[feature], |_| {}).await;
    let mut recorder = Recorder::default();
    let summary = engine.run(&mut recorder).await.expect("run completes");

    assert_eq!(summary.scenarios_failed, 1);
    let message = recorder
        .first_failure_message()
        .expect("a step failed with a message");
    assert!(
        message.contains("expected success status, got 500"),
        "unexpected diagnostic: {message}"
    );
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn json_stub_body_and_matchers() {
    let feature = "Feature: JSON\n\
        \x20 Scenario: matcher tokens\n\
        \x20   Given \"api\" stub \"GET\" \"/user\" returns \"200\" with json:\n\
        \x20     \"\"\"\n\
        \x20     {\"id\": 7, \"name\": \"alice\", \"deleted_at\": null}\n\
        \x20     \"\"\"\n\
        \x20   And \"api\" url is stored in \"MOCK_URL\"\n\
        \x20   When \"client\" sends \"GET\" to \"{{MOCK_URL}}/user\"\n\
        \x20   Then \"client\" response header \"Content-Type\" contains \"json\"\n\
        \x20   And \"client\" response json \"name\" is \"alice\"\n\
        \x20   And \"client\" response json matches:\n\
        \x20     \"\"\"\n\
        \x20     {\"id\": \"@number\", \"name\": \"@string\", \"deleted_at\": \"@null\"}\n\
        \x20     \"\"\"\n\
        \x20   And \"client\" response json contains:\n\
        \x20     \"\"\"\n\
        \x20     {\"name\": \"@contains:lic\"}\n\
        \x20     \"\"\"\n";

    let (engine, _tmp) = engine_with(http_resources(), &[feature], |_| {}).await;
    let summary = engine
        .run(&mut Recorder::default())
        .await
        .expect("run completes");
    assert!(summary.all_passed(), "failures: {:?}", summary.failures);
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn headers_persist_within_a_scenario_and_reset_between() {
    // Scenario one proves a header set once rides along on later requests.
    // Scenario two (after the reset boundary) proves it is gone: the same
    // received-with-header assertion now fails.
    let feature = "Feature: Header persistence\n\
        \x20 Background:\n\
        \x20   Given \"api\" stub \"GET\" \"/a\" returns \"200\"\n\
        \x20   And \"api\" stub \"GET\" \"/b\" returns \"200\"\n\
        \x20   And \"api\" url is stored in \"MOCK_URL\"\n\
        \x20 Scenario: header set once covers both requests\n\
        \x20   Given \"client\" header \"Authorization\" is \"Bearer token-1\"\n\
        \x20   When \"client\" sends \"GET\" to \"{{MOCK_URL}}/a\"\n\
        \x20   And \"client\" sends \"GET\" to \"{{MOCK_URL}}/b\"\n\
        \x20   Then \"api\" received request with header \"Authorization\" containing \"Bearer\"\n\
        \x20   And \"api\" received \"2\" requests\n\
        \x20 Scenario: the header does not leak across the reset\n\
        \x20   When \"client\" sends \"GET\" to \"{{MOCK_URL}}/a\"\n\
        \x20   Then \"api\" received request with header \"Authorization\" containing \"Bearer\"\n";

    let (engine, _tmp) = engine_with(http_resources(), &[feature], |_| {}).await;
    let mut recorder = Recorder::default();
    let summary = engine.run(&mut recorder).await.expect("run completes");

    assert_eq!(summary.scenarios_passed, 1);
    assert_eq!(summary.scenarios_failed, 1);
    assert_eq!(summary.failures.len(), 1);
    assert!(summary.failures[0].message.contains("Authorization"));
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn unmatched_requests_get_diagnostic_404s() {
    let feature = "Feature: Diagnostics\n\
        \x20 Scenario: no stub installed\n\
        \x20   Given \"api\" url is stored in \"MOCK_URL\"\n\
        \x20   When \"client\" sends \"GET\" to \"{{MOCK_URL}}/missing\"\n\
        \x20   Then \"client\" response status is \"404\"\n\
        \x20   And \"client\" response body contains \"No stub found for GET /missing\"\n";

    let (engine, _tmp) = engine_with(http_resources(), &[feature], |_| {}).await;
    let summary = engine
        .run(&mut Recorder::default())
        .await
        .expect("run completes");
    assert!(summary.all_passed(), "failures: {:?}", summary.failures);
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn captured_json_values_substitute_into_later_steps() {
    let feature = "Feature: Capture\n\
        \x20 Scenario: chain a captured id\n\
        \x20   Given \"api\" stub \"POST\" \"/users\" returns \"201\" with json:\n\
        \x20     \"\"\"\n\
        \x20     {\"id\": 42}\n\
        \x20     \"\"\"\n\
        \x20   And \"api\" stub \"GET\" \"/users/42\" returns \"200\"\n\
        \x20   And \"api\" url is stored in \"MOCK_URL\"\n\
        \x20   When \"client\" sends \"POST\" to \"{{MOCK_URL}}/users\"\n\
        \x20   And \"client\" response json \"id\" saved as \"{{user_id}}\"\n\
        \x20   And \"client\" sends \"GET\" to \"{{MOCK_URL}}/users/{{user_id}}\"\n\
        \x20   Then \"client\" response status is \"200\"\n\
        \x20   And \"api\" received \"GET\" \"/users/42\"\n";

    let (engine, _tmp) = engine_with(http_resources(), &[feature], |_| {}).await;
    let mut recorder = Recorder::default();
    let summary = engine.run(&mut recorder).await.expect("run completes");

    assert!(summary.all_passed(), "failures: {:?}", summary.failures);
    assert!(!recorder.step_statuses().contains(&StepStatus::Failed));
}
