//! App runner unit tests: ready-check lowering, the log ring, and
//! environment templating.

use std::collections::BTreeMap;

use rstest::{fixture, rstest};
use tokio_util::sync::CancellationToken;

use super::*;
use crate::config::BuildSpec;

/// A docker client that never dials: enough to construct an orchestrator
/// for templating tests, where every lookup fails and placeholders must be
/// left verbatim.
fn offline_orchestrator() -> Arc<Orchestrator> {
    let docker = Docker::connect_with_http(
        "http://nonexistent.tomato-test.invalid",
        5,
        bollard::API_DEFAULT_VERSION,
    )
    .expect("client construction is lazy");
    Arc::new(
        Orchestrator::new(docker, BTreeMap::new(), CancellationToken::new())
            .expect("empty graph is acyclic"),
    )
}

#[fixture]
fn command_spec() -> AppSpec {
    AppSpec {
        command: Some(String::from("./api-server")),
        port: 8080,
        env: BTreeMap::from([(
            String::from("DATABASE_URL"),
            String::from("postgres://user@{{.postgres.host}}:{{.postgres.port.5432}}/test"),
        )]),
        ..AppSpec::default()
    }
}

#[rstest]
fn build_declaration_selects_docker_mode() {
    let spec = AppSpec {
        build: Some(BuildSpec {
            dockerfile: camino::Utf8PathBuf::from("Dockerfile"),
            context: None,
        }),
        ..AppSpec::default()
    };
    let runner = AppRunner::new(spec, offline_orchestrator(), CancellationToken::new());
    assert_eq!(runner.mode(), Mode::Docker);
}

#[rstest]
fn command_declaration_selects_command_mode(command_spec: AppSpec) {
    let runner = AppRunner::new(command_spec, offline_orchestrator(), CancellationToken::new());
    assert_eq!(runner.mode(), Mode::Command);
    assert_eq!(runner.base_url(), "http://localhost:8080");
}

#[rstest]
#[tokio::test]
async fn unresolvable_placeholders_stay_verbatim(command_spec: AppSpec) {
    let runner = AppRunner::new(command_spec, offline_orchestrator(), CancellationToken::new());
    let env = runner.build_env().await;
    assert_eq!(
        env["DATABASE_URL"],
        "postgres://user@{{.postgres.host}}:{{.postgres.port.5432}}/test"
    );
}

#[rstest]
#[tokio::test]
async fn docker_mode_resolves_aliases_and_internal_ports() {
    let spec = AppSpec {
        build: Some(BuildSpec {
            dockerfile: camino::Utf8PathBuf::from("Dockerfile"),
            context: None,
        }),
        env: BTreeMap::from([
            (
                String::from("DATABASE_URL"),
                String::from("postgres://{{.postgres.host}}:{{.postgres.port.5432}}/test"),
            ),
            (
                String::from("KAFKA_BROKERS"),
                String::from("{{.kafka.host}}:{{.kafka.port.9092/tcp}}"),
            ),
            (String::from("PLAIN"), String::from("untouched")),
        ]),
        ..AppSpec::default()
    };
    let runner = AppRunner::new(spec, offline_orchestrator(), CancellationToken::new());

    let env = runner.build_env().await;
    assert_eq!(env["DATABASE_URL"], "postgres://postgres:5432/test");
    assert_eq!(env["KAFKA_BROKERS"], "kafka:9092");
    assert_eq!(env["PLAIN"], "untouched");
}

#[rstest]
fn recent_logs_returns_a_bounded_tail(command_spec: AppSpec) {
    let runner = AppRunner::new(command_spec, offline_orchestrator(), CancellationToken::new());

    for i in 0..150 {
        record_line(&runner.ring, &runner.log_file, false, "stdout", &format!("line {i}"));
    }

    let tail = runner.recent_logs(3);
    assert_eq!(tail, vec!["line 147", "line 148", "line 149"]);

    let all = runner.recent_logs(1000);
    assert_eq!(all.len(), LOG_RING_CAPACITY);
    assert_eq!(all.first().map(String::as_str), Some("line 50"));

    assert!(runner.recent_logs(0).is_empty());
}

#[rstest]
#[tokio::test]
async fn stop_is_idempotent_without_a_running_app(command_spec: AppSpec) {
    let runner = AppRunner::new(command_spec, offline_orchestrator(), CancellationToken::new());
    runner.stop().await;
    runner.stop().await;
}

#[rstest]
fn missing_ready_check_with_port_lowers_to_tcp_probe() {
    let (probe, timeout) = lower_ready_check(None, "localhost", 8080);
    assert_eq!(
        probe,
        ReadinessProbe::Port {
            host: String::from("localhost"),
            port: 8080,
        }
    );
    assert_eq!(timeout, DEFAULT_READY_TIMEOUT);
}

#[rstest]
fn missing_ready_check_without_port_lowers_to_none() {
    let (probe, _) = lower_ready_check(None, "localhost", 0);
    assert_eq!(probe, ReadinessProbe::None);
}

#[rstest]
fn http_ready_check_defaults_path_and_status() {
    let ready = ReadyCheck {
        kind: String::from("http"),
        ..ReadyCheck::default()
    };
    let (probe, _) = lower_ready_check(Some(&ready), "localhost", 9000);
    assert_eq!(
        probe,
        ReadinessProbe::Http {
            url: String::from("http://localhost:9000/health"),
            method: String::from("GET"),
            expect: StatusExpectation::Exactly(200),
        }
    );
}

#[rstest]
fn exec_ready_check_carries_its_command_and_timeout() {
    let ready = ReadyCheck {
        kind: String::from("exec"),
        command: Some(String::from("curl -sf localhost:8080/ping")),
        timeout: Some(Duration::from_secs(90)),
        ..ReadyCheck::default()
    };
    let (probe, timeout) = lower_ready_check(Some(&ready), "localhost", 8080);
    assert_eq!(
        probe,
        ReadinessProbe::Exec {
            command: String::from("curl -sf localhost:8080/ping"),
        }
    );
    assert_eq!(timeout, Duration::from_secs(90));
}

#[rstest]
#[tokio::test]
async fn command_mode_runs_a_real_process_to_readiness() {
    let spec = AppSpec {
        command: Some(String::from("sleep 30")),
        port: 0,
        ready: Some(ReadyCheck {
            kind: String::from("exec"),
            command: Some(String::from("true")),
            timeout: Some(Duration::from_secs(5)),
            ..ReadyCheck::default()
        }),
        ..AppSpec::default()
    };
    let runner = AppRunner::new(spec, offline_orchestrator(), CancellationToken::new());

    runner.start().await.expect("sleep starts and exec-ready passes");
    runner.stop().await;
}
