//! End-to-end WebSocket flows: the mock server and client resources driven
//! through feature files on a loopback port.

mod support;

use std::collections::BTreeMap;

use rstest::rstest;
use serde_yaml::Value;

use support::{Recorder, engine_with, resource};

/// Reserve a loopback port for the mock server, so the client's URL can be
/// written into the resource declaration up front.
fn reserve_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    port
}

fn ws_resources(port: u16) -> BTreeMap<String, tomato::config::ResourceSpec> {
    let mut server = resource("websocket-server");
    server
        .options
        .insert(String::from("port"), Value::from(i64::from(port)));

    let mut client = resource("websocket-client");
    client.url = Some(format!("ws://127.0.0.1:{port}"));

    BTreeMap::from([
        (String::from("mock"), server),
        (String::from("ws"), client),
    ])
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn ping_pong_reply_rule_round_trips() {
    let feature = "Feature: WebSocket\n\
        \x20 Scenario: ping pong\n\
        \x20   Given \"mock\" on message \"ping\" replies:\n\
        \x20     \"\"\"\n\
        \x20     pong\n\
        \x20     \"\"\"\n\
        \x20   And \"ws\" connects\n\
        \x20   And \"ws\" is connected\n\
        \x20   When \"ws\" sends \"ping\"\n\
        \x20   Then \"ws\" receives within \"5s\" containing \"pong\"\n\
        \x20   And \"mock\" received message \"ping\"\n\
        \x20   And \"mock\" has \"1\" connections\n\
        \x20   And \"ws\" last message contains \"pong\"\n";

    let (engine, _tmp) = engine_with(ws_resources(reserve_port()), &[feature], |_| {}).await;
    let summary = engine
        .run(&mut Recorder::default())
        .await
        .expect("run completes");
    assert!(summary.all_passed(), "failures: {:?}", summary.failures);
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn on_connect_greeting_reaches_the_client() {
    let feature = "Feature: WebSocket\n\
        \x20 Scenario: welcome\n\
        \x20   Given \"mock\" on connect sends:\n\
        \x20     \"\"\"\n\
        \x20     {\"type\": \"welcome\"}\n\
        \x20     \"\"\"\n\
        \x20   And \"ws\" connects\n\
        \x20   Then \"ws\" receives within \"5s\" containing \"welcome\"\n\
        \x20   And \"ws\" last message is json matching:\n\
        \x20     \"\"\"\n\
        \x20     {\"type\": \"@string\"}\n\
        \x20     \"\"\"\n";

    let (engine, _tmp) = engine_with(ws_resources(reserve_port()), &[feature], |_| {}).await;
    let summary = engine
        .run(&mut Recorder::default())
        .await
        .expect("run completes");
    assert!(summary.all_passed(), "failures: {:?}", summary.failures);
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn silence_assertion_and_disconnect() {
    let feature = "Feature: WebSocket\n\
        \x20 Scenario: nothing arrives\n\
        \x20   Given \"ws\" connects\n\
        \x20   Then \"ws\" does not receive within \"300ms\"\n\
        \x20   And \"ws\" received \"0\" messages\n\
        \x20   When \"ws\" disconnects\n\
        \x20   Then \"ws\" is disconnected\n";

    let (engine, _tmp) = engine_with(ws_resources(reserve_port()), &[feature], |_| {}).await;
    let summary = engine
        .run(&mut Recorder::default())
        .await
        .expect("run completes");
    assert!(summary.all_passed(), "failures: {:?}", summary.failures);
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn reset_between_scenarios_empties_the_inbox() {
    // Scenario one receives a pong; scenario two starts from an empty
    // buffer, so its received-count assertion passes only after reset.
    let feature = "Feature: WebSocket isolation\n\
        \x20 Scenario: receive one\n\
        \x20   Given \"mock\" on message \"ping\" replies:\n\
        \x20     \"\"\"\n\
        \x20     pong\n\
        \x20     \"\"\"\n\
        \x20   And \"ws\" connects\n\
        \x20   When \"ws\" sends \"ping\"\n\
        \x20   Then \"ws\" receives within \"5s\" containing \"pong\"\n\
        \x20 Scenario: start clean\n\
        \x20   Then \"ws\" received \"0\" messages\n\
        \x20   And \"ws\" is disconnected\n";

    let (engine, _tmp) = engine_with(ws_resources(reserve_port()), &[feature], |_| {}).await;
    let summary = engine
        .run(&mut Recorder::default())
        .await
        .expect("run completes");
    assert!(summary.all_passed(), "failures: {:?}", summary.failures);
}
