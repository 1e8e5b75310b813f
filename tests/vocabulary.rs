//! Cross-handler vocabulary properties: every pattern registers cleanly,
//! and sample steps from different handlers resolve without ambiguity even
//! when every vocabulary is loaded at once.

mod support;

use std::collections::BTreeMap;

use rstest::rstest;

use support::{Recorder, engine_with};
use tomato::engine::dispatcher::{Dispatcher, Resolution};
use tomato::handler::registry::vocabularies;

/// Register every vocabulary under a plausible resource name.
fn full_dispatcher() -> Dispatcher {
    let mut dispatcher = Dispatcher::new();
    for (kind, category) in vocabularies() {
        dispatcher
            .register(kind, &category)
            .expect("every shipped pattern compiles");
    }
    dispatcher
}

#[rstest]
fn every_vocabulary_registers() {
    let dispatcher = full_dispatcher();
    let total: usize = vocabularies()
        .iter()
        .map(|(_, category)| category.steps.len())
        .sum();
    assert_eq!(dispatcher.len(), total);
    assert!(total > 100, "the combined vocabulary is substantial");
}

#[rstest]
#[case(r#"I set "redis" key "x" with value "one""#)]
#[case(r#""postgres" table "users" has "5" rows"#)]
#[case(r#"I publish JSON to "kafka" topic "events":"#)]
#[case(r#""rabbitmq" declares durable queue "orders""#)]
#[case(r#""http-client" sends "GET" to "/users""#)]
#[case(r#""http-server" stub "GET" "/ok" returns "200""#)]
#[case(r#""websocket-client" connects"#)]
#[case(r#""websocket-server" broadcasts "ping""#)]
#[case(r#"I run "make test" on "shell""#)]
fn sample_steps_resolve_uniquely(#[case] text: &str) {
    match full_dispatcher().resolve(text) {
        Resolution::Match { .. } => {}
        other => panic!("expected a unique match for {text:?}, got {other:?}"),
    }
}

#[rstest]
fn table_row_assertion_distinguishes_sql_resources() {
    // Identical SQL vocabularies under different resource names resolve by
    // name, not by vocabulary.
    let dispatcher = full_dispatcher();
    match dispatcher.resolve(r#""mysql" table "users" is empty"#) {
        Resolution::Match { resource, .. } => assert_eq!(resource, "mysql"),
        other => panic!("expected a match, got {other:?}"),
    }
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn minimum_configuration_runs_zero_scenarios_successfully() {
    // The `{version: 2}` configuration: no resources, no features.
    let (engine, _tmp) = engine_with(BTreeMap::new(), &[], |_| {}).await;
    let summary = engine
        .run(&mut Recorder::default())
        .await
        .expect("empty run completes");

    assert!(summary.all_passed());
    assert_eq!(summary.scenarios_total(), 0);
}
