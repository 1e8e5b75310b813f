//! Shared helpers for integration tests: an engine wired to an offline
//! orchestrator (no daemon needed) plus an event-recording formatter.

// Each integration test binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use camino::Utf8PathBuf;
use tokio_util::sync::CancellationToken;

use tomato::config::{Config, ResourceSpec};
use tomato::engine::{Engine, RunOptions};
use tomato::formatter::{Event, Formatter, StepStatus};
use tomato::handler::{HandlerDeps, Registry, VariableStore};
use tomato::orchestrator::Orchestrator;

/// A docker client that never dials; fine for runs without containers.
pub fn offline_orchestrator() -> Arc<Orchestrator> {
    let docker = bollard::Docker::connect_with_http(
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

/// Build a resource spec of the given type.
pub fn resource(kind: &str) -> ResourceSpec {
    ResourceSpec {
        kind: String::from(kind),
        ..ResourceSpec::default()
    }
}

/// Build an engine over the given resources, with the feature sources
/// written into a temp directory. The registry is initialised (`init` +
/// `ready`) before the engine is returned.
pub async fn engine_with(
    resources: BTreeMap<String, ResourceSpec>,
    features: &[&str],
    mutate: impl FnOnce(&mut Config),
) -> (Engine, tempfile::TempDir) {
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
    config.features.paths = vec![
        Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf-8 temp path"),
    ];
    config.resources = resources;
    mutate(&mut config);

    let orchestrator = offline_orchestrator();
    let variables = Arc::new(VariableStore::new());
    let deps = HandlerDeps {
        orchestrator: Arc::clone(&orchestrator),
        variables: Arc::clone(&variables),
        cancel: CancellationToken::new(),
    };
    let registry =
        Arc::new(Registry::new(&config.resources, &deps).expect("registry constructs"));
    registry.wait_ready().await.expect("handlers become ready");

    let engine = Engine::new(
        config,
        registry,
        orchestrator,
        variables,
        RunOptions::default(),
    );
    (engine, tmp)
}

/// Event recorder standing in for a real formatter.
#[derive(Default)]
pub struct Recorder {
    pub events: Vec<Event>,
}

impl Formatter for Recorder {
    fn event(&mut self, event: &Event) {
        self.events.push(event.clone());
    }
}

impl Recorder {
    /// Statuses of every emitted step, in order.
    pub fn step_statuses(&self) -> Vec<StepStatus> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::StepEnd { status, .. } => Some(*status),
                _ => None,
            })
            .collect()
    }

    /// The failure message of the first non-passing step, if any.
    pub fn first_failure_message(&self) -> Option<String> {
        self.events.iter().find_map(|event| match event {
            Event::StepEnd {
                message: Some(message),
                ..
            } => Some(message.clone()),
            _ => None,
        })
    }
}
