//! Mock HTTP server resource handler.
//!
//! Owns a TCP listener on an OS-assigned (or configured) port and serves
//! stubbed responses. Dynamic stubs installed by steps are searched first
//! in insertion order; fixture stubs loaded from YAML are searched next
//! with the most-specific (highest condition count) match winning. Every
//! request is recorded for the verification steps. Unmatched requests get
//! a 404 with a diagnostic body.
//!
//! Fixture stubs survive `reset`; dynamic stubs and recorded calls do not.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::Response;
use camino::Utf8Path;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::error::{CleanupError, InfraError, StepError};

use super::stepdef::{StepArgs, StepCategory, StepDef};
use super::{Handler, HandlerDeps};
use crate::config::ResourceSpec;

/// Cap on recorded request bodies.
const MAX_BODY_BYTES: usize = 1024 * 1024;

mod action {
    pub const STUB_STATUS: &str = "stub-status";
    pub const STUB_BODY: &str = "stub-body";
    pub const STUB_JSON: &str = "stub-json";
    pub const STUB_HEADERS: &str = "stub-headers";
    pub const RECEIVED: &str = "received";
    pub const RECEIVED_TIMES: &str = "received-times";
    pub const NOT_RECEIVED: &str = "not-received";
    pub const RECEIVED_WITH_HEADER: &str = "received-with-header";
    pub const RECEIVED_WITH_BODY: &str = "received-with-body";
    pub const RECEIVED_TOTAL: &str = "received-total";
    pub const STORE_URL: &str = "store-url";
    pub const LOAD_FIXTURES: &str = "load-fixtures";
}

/// The HTTP server step vocabulary.
pub(super) fn vocabulary() -> StepCategory {
    StepCategory {
        name: "HTTP Server",
        description: "Steps for stubbing HTTP services",
        steps: vec![
            StepDef {
                group: "Stub Setup",
                pattern: r#"^"{resource}" stub "([^"]*)" "([^"]*)" returns "(\d+)"$"#,
                description: "Creates a stub that returns a status code",
                example: "\"{resource}\" stub \"GET\" \"/users\" returns \"200\"",
                action: action::STUB_STATUS,
            },
            StepDef {
                group: "Stub Setup",
                pattern: r#"^"{resource}" stub "([^"]*)" "([^"]*)" returns "(\d+)" with body:$"#,
                description: "Creates a stub that returns a status code and body",
                example: "\"{resource}\" stub \"GET\" \"/users\" returns \"200\" with body:\n  \"\"\"\n  [{\"id\": 1}]\n  \"\"\"",
                action: action::STUB_BODY,
            },
            StepDef {
                group: "Stub Setup",
                pattern: r#"^"{resource}" stub "([^"]*)" "([^"]*)" returns "(\d+)" with json:$"#,
                description: "Creates a JSON stub (validates and sets Content-Type)",
                example: "\"{resource}\" stub \"GET\" \"/users\" returns \"200\" with json:\n  \"\"\"\n  [{\"id\": 1}]\n  \"\"\"",
                action: action::STUB_JSON,
            },
            StepDef {
                group: "Stub Setup",
                pattern: r#"^"{resource}" stub "([^"]*)" "([^"]*)" returns "(\d+)" with headers:$"#,
                description: "Creates a stub with custom response headers",
                example: "\"{resource}\" stub \"GET\" \"/users\" returns \"200\" with headers:\n  | header   | value |\n  | X-Custom | yes   |",
                action: action::STUB_HEADERS,
            },
            StepDef {
                group: "Verification",
                pattern: r#"^"{resource}" received "([^"]*)" "([^"]*)"$"#,
                description: "Asserts a request was received",
                example: "\"{resource}\" received \"GET\" \"/users\"",
                action: action::RECEIVED,
            },
            StepDef {
                group: "Verification",
                pattern: r#"^"{resource}" received "([^"]*)" "([^"]*)" "(\d+)" times$"#,
                description: "Asserts a request was received N times",
                example: "\"{resource}\" received \"GET\" \"/users\" \"2\" times",
                action: action::RECEIVED_TIMES,
            },
            StepDef {
                group: "Verification",
                pattern: r#"^"{resource}" did not receive "([^"]*)" "([^"]*)"$"#,
                description: "Asserts a request was not received",
                example: "\"{resource}\" did not receive \"DELETE\" \"/users\"",
                action: action::NOT_RECEIVED,
            },
            StepDef {
                group: "Verification",
                pattern: r#"^"{resource}" received request with header "([^"]*)" containing "([^"]*)"$"#,
                description: "Asserts some request carried a header containing a value",
                example: "\"{resource}\" received request with header \"Authorization\" containing \"Bearer\"",
                action: action::RECEIVED_WITH_HEADER,
            },
            StepDef {
                group: "Verification",
                pattern: r#"^"{resource}" received request with body containing "([^"]*)"$"#,
                description: "Asserts some request carried a body containing a value",
                example: "\"{resource}\" received request with body containing \"name\"",
                action: action::RECEIVED_WITH_BODY,
            },
            StepDef {
                group: "Verification",
                pattern: r#"^"{resource}" received "(\d+)" requests$"#,
                description: "Asserts the total number of requests received",
                example: "\"{resource}\" received \"5\" requests",
                action: action::RECEIVED_TOTAL,
            },
            StepDef {
                group: "Server Info",
                pattern: r#"^"{resource}" url is stored in "([^"]*)"$"#,
                description: "Stores the server URL in a scenario variable",
                example: "\"{resource}\" url is stored in \"SERVER_URL\"",
                action: action::STORE_URL,
            },
            StepDef {
                group: "Fixture Management",
                pattern: r#"^"{resource}" loads fixtures from "([^"]*)"$"#,
                description: "Loads fixture stubs from a directory (stubs.yml + responses)",
                example: "\"{resource}\" loads fixtures from \"fixtures/github-api\"",
                action: action::LOAD_FIXTURES,
            },
        ],
    }
}

/// One dynamic stub installed by a step.
struct HttpStub {
    method: String,
    path: String,
    path_pattern: Option<Regex>,
    status: u16,
    headers: BTreeMap<String, String>,
    body: String,
}

/// One recorded inbound request.
struct RecordedCall {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    body: String,
}

/// Root of a `stubs.yml` fixture file.
#[derive(Debug, Deserialize)]
struct FixtureConfig {
    #[serde(default)]
    stubs: Vec<FixtureStub>,
}

/// One stub loaded from fixtures, with optional match conditions.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FixtureStub {
    id: String,
    method: String,
    path: String,
    #[serde(rename = "pathPattern")]
    path_pattern: String,
    conditions: Option<FixtureConditions>,
    response: FixtureResponse,

    #[serde(skip)]
    compiled_pattern: Option<Regex>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FixtureResponse {
    status: u16,
    headers: BTreeMap<String, String>,
    body: String,
    #[serde(rename = "bodyFile")]
    body_file: String,

    #[serde(skip)]
    body_content: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FixtureConditions {
    headers: BTreeMap<String, HeaderCondition>,
    query: BTreeMap<String, String>,
    body: Option<BodyCondition>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HeaderCondition {
    equals: String,
    contains: String,
    matches: String,

    #[serde(skip)]
    compiled: Option<Regex>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BodyCondition {
    #[serde(rename = "jsonPath")]
    json_path: String,
    equals: String,
    contains: String,
    matches: String,
    #[serde(rename = "bodyContains")]
    body_contains: String,
    #[serde(rename = "bodyMatches")]
    body_matches: String,

    #[serde(skip)]
    compiled_matches: Option<Regex>,
    #[serde(skip)]
    compiled_body_matches: Option<Regex>,
}

#[derive(Default)]
struct ServerState {
    stubs: RwLock<Vec<HttpStub>>,
    fixtures: RwLock<Vec<FixtureStub>>,
    calls: RwLock<Vec<RecordedCall>>,
}

/// Handler for one declared `http-server` resource.
pub struct HttpServer {
    name: String,
    spec: ResourceSpec,
    deps: HandlerDeps,
    state: Arc<ServerState>,
    port: u16,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl HttpServer {
    /// Create the handler; the listener is bound in `init`.
    #[must_use]
    pub fn new(name: String, spec: ResourceSpec, deps: HandlerDeps) -> Self {
        Self {
            name,
            spec,
            deps,
            state: Arc::new(ServerState::default()),
            port: 0,
            shutdown: None,
        }
    }

    /// The mock server's URL.
    #[must_use]
    pub fn url(&self) -> String {
        format!("http://localhost:{}", self.port)
    }

    fn push_stub(&self, stub: HttpStub) {
        if let Ok(mut stubs) = self.state.stubs.write() {
            stubs.push(stub);
        }
    }

    fn with_calls<T>(&self, reader: impl FnOnce(&[RecordedCall]) -> T) -> T {
        match self.state.calls.read() {
            Ok(calls) => reader(&calls),
            Err(_) => reader(&[]),
        }
    }

    fn load_fixtures(&self, dir: &Utf8Path) -> Result<(), StepError> {
        if !dir.as_std_path().exists() {
            return Err(StepError::backend(format!(
                "fixtures path does not exist: {dir}"
            )));
        }

        let stubs_file = dir.join("stubs.yml");
        let raw = std::fs::read_to_string(&stubs_file)
            .map_err(|e| StepError::backend(format!("reading {stubs_file}: {e}")))?;
        let mut config: FixtureConfig = serde_yaml::from_str(&raw)
            .map_err(|e| StepError::backend(format!("parsing {stubs_file}: {e}")))?;

        for stub in &mut config.stubs {
            prepare_fixture(stub, dir)
                .map_err(|e| StepError::backend(format!("preparing fixture \"{}\": {e}", stub.id)))?;
        }

        if let Ok(mut fixtures) = self.state.fixtures.write() {
            fixtures.extend(config.stubs);
        }
        Ok(())
    }
}

#[async_trait]
impl Handler for HttpServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&mut self) -> Result<(), InfraError> {
        let port = u16::try_from(self.spec.opt_i64("port").unwrap_or(0)).unwrap_or(0);
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| InfraError::HandlerInitFailed {
                handler: self.name.clone(),
                message: format!("binding listener: {e}"),
            })?;
        self.port = listener
            .local_addr()
            .map_err(|e| InfraError::HandlerInitFailed {
                handler: self.name.clone(),
                message: format!("resolving listener address: {e}"),
            })?
            .port();

        let router = Router::new()
            .fallback(serve_request)
            .with_state(Arc::clone(&self.state));
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        self.shutdown = Some(shutdown_tx);

        let name = self.name.clone();
        tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(error) = serve.await {
                debug!(handler = %name, %error, "mock server exited");
            }
        });

        // Auto-load fixtures when configured (both key spellings accepted).
        let fixtures_path = self
            .spec
            .opt_str("fixtures_path")
            .or_else(|| self.spec.opt_str("fixturesPath"))
            .map(String::from);
        if let Some(fixtures_path) = fixtures_path {
            let auto_load = self
                .spec
                .opt_bool("auto_load")
                .or_else(|| self.spec.opt_bool("autoLoad"))
                .unwrap_or(true);
            if auto_load {
                let dir = Utf8Path::new(&fixtures_path).to_owned();
                self.load_fixtures(&dir)
                    .map_err(|e| InfraError::HandlerInitFailed {
                        handler: self.name.clone(),
                        message: format!("loading fixtures from \"{dir}\": {e}"),
                    })?;
            }
        }

        Ok(())
    }

    async fn ready(&mut self) -> Result<(), InfraError> {
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), InfraError> {
        // Dynamic stubs and recordings clear; fixture stubs persist.
        if let Ok(mut stubs) = self.state.stubs.write() {
            stubs.clear();
        }
        if let Ok(mut calls) = self.state.calls.write() {
            calls.clear();
        }
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<(), CleanupError> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        Ok(())
    }

    fn steps(&self) -> StepCategory {
        vocabulary()
    }

    async fn run_step(&mut self, action: &str, args: &StepArgs) -> Result<(), StepError> {
        match action {
            action::STUB_STATUS => {
                let stub = HttpStub {
                    method: args.string(0)?.to_owned(),
                    path: args.string(1)?.to_owned(),
                    path_pattern: None,
                    status: status_from(args.int(2)?)?,
                    headers: BTreeMap::new(),
                    body: String::new(),
                };
                self.push_stub(stub);
                Ok(())
            }
            action::STUB_BODY => {
                let stub = HttpStub {
                    method: args.string(0)?.to_owned(),
                    path: args.string(1)?.to_owned(),
                    path_pattern: None,
                    status: status_from(args.int(2)?)?,
                    headers: BTreeMap::new(),
                    body: String::from(args.docstring()?),
                };
                self.push_stub(stub);
                Ok(())
            }
            action::STUB_JSON => {
                let doc = args.docstring()?;
                serde_json::from_str::<serde_json::Value>(doc)
                    .map_err(|e| StepError::assertion(format!("invalid JSON: {e}")))?;
                let stub = HttpStub {
                    method: args.string(0)?.to_owned(),
                    path: args.string(1)?.to_owned(),
                    path_pattern: None,
                    status: status_from(args.int(2)?)?,
                    headers: BTreeMap::from([(
                        String::from("Content-Type"),
                        String::from("application/json"),
                    )]),
                    body: String::from(doc),
                };
                self.push_stub(stub);
                Ok(())
            }
            action::STUB_HEADERS => {
                let headers: BTreeMap<String, String> = args
                    .table()?
                    .data_rows()
                    .iter()
                    .filter(|row| row.len() >= 2)
                    .map(|row| (row[0].clone(), row[1].clone()))
                    .collect();
                let stub = HttpStub {
                    method: args.string(0)?.to_owned(),
                    path: args.string(1)?.to_owned(),
                    path_pattern: None,
                    status: status_from(args.int(2)?)?,
                    headers,
                    body: String::new(),
                };
                self.push_stub(stub);
                Ok(())
            }
            action::RECEIVED => {
                let (method, path) = (args.string(0)?, args.string(1)?);
                let found = self.with_calls(|calls| {
                    calls
                        .iter()
                        .any(|call| call.method == method && call.path == path)
                });
                if found {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "no {method} {path} request received"
                    )))
                }
            }
            action::RECEIVED_TIMES => {
                let (method, path) = (args.string(0)?, args.string(1)?);
                let expected = args.int(2)?;
                let count = self.with_calls(|calls| {
                    calls
                        .iter()
                        .filter(|call| call.method == method && call.path == path)
                        .count()
                });
                if count as i64 == expected {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "expected {expected} {method} {path} requests, got {count}"
                    )))
                }
            }
            action::NOT_RECEIVED => {
                let (method, path) = (args.string(0)?, args.string(1)?);
                let found = self.with_calls(|calls| {
                    calls
                        .iter()
                        .any(|call| call.method == method && call.path == path)
                });
                if found {
                    Err(StepError::assertion(format!(
                        "unexpected {method} {path} request received"
                    )))
                } else {
                    Ok(())
                }
            }
            action::RECEIVED_WITH_HEADER => {
                let (header, needle) = (args.string(0)?, args.string(1)?);
                let found = self.with_calls(|calls| {
                    calls.iter().any(|call| {
                        call.headers.iter().any(|(name, value)| {
                            name.eq_ignore_ascii_case(header) && value.contains(needle)
                        })
                    })
                });
                if found {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "no request received with header \"{header}\" containing \"{needle}\""
                    )))
                }
            }
            action::RECEIVED_WITH_BODY => {
                let needle = args.string(0)?;
                let found =
                    self.with_calls(|calls| calls.iter().any(|call| call.body.contains(needle)));
                if found {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "no request received with body containing \"{needle}\""
                    )))
                }
            }
            action::RECEIVED_TOTAL => {
                let expected = args.int(0)?;
                let count = self.with_calls(<[RecordedCall]>::len);
                if count as i64 == expected {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "expected {expected} requests, got {count}"
                    )))
                }
            }
            action::STORE_URL => {
                let variable = args.string(0)?;
                self.deps.variables.set(variable, &self.url());
                Ok(())
            }
            action::LOAD_FIXTURES => {
                let dir = Utf8Path::new(args.string(0)?).to_owned();
                self.load_fixtures(&dir)
            }
            other => Err(StepError::UnknownAction {
                handler: self.name.clone(),
                action: String::from(other),
            }),
        }
    }
}

/// The single axum handler: record, match, respond.
async fn serve_request(State(state): State<Arc<ServerState>>, request: Request) -> Response {
    let method = request.method().as_str().to_owned();
    let path = request.uri().path().to_owned();
    let query = request.uri().query().map(String::from).unwrap_or_default();
    let headers: Vec<(String, String)> = request
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_owned(),
                value.to_str().unwrap_or_default().to_owned(),
            )
        })
        .collect();

    let body = axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES)
        .await
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default();

    if let Ok(mut calls) = state.calls.write() {
        calls.push(RecordedCall {
            method: method.clone(),
            path: path.clone(),
            headers: headers.clone(),
            body: body.clone(),
        });
    }

    // Dynamic stubs first, in insertion order.
    if let Ok(stubs) = state.stubs.read() {
        let matched = stubs.iter().find(|stub| {
            stub.method == method
                && stub
                    .path_pattern
                    .as_ref()
                    .map_or(stub.path == path, |pattern| pattern.is_match(&path))
        });
        if let Some(stub) = matched {
            return build_response(stub.status, &stub.headers, &stub.body);
        }
    }

    // Fixture stubs: most conditions wins.
    if let Ok(fixtures) = state.fixtures.read() {
        let mut best: Option<&FixtureStub> = None;
        let mut best_conditions = 0usize;
        for fixture in fixtures.iter() {
            if !fixture_matches(fixture, &method, &path, &query, &headers, &body) {
                continue;
            }
            let conditions = condition_count(fixture);
            if best.is_none() || conditions > best_conditions {
                best = Some(fixture);
                best_conditions = conditions;
            }
        }
        if let Some(fixture) = best {
            let body = if fixture.response.body_content.is_empty() {
                &fixture.response.body
            } else {
                &fixture.response.body_content
            };
            return build_response(fixture.response.status, &fixture.response.headers, body);
        }
    }

    build_response(
        StatusCode::NOT_FOUND.as_u16(),
        &BTreeMap::new(),
        &format!("No stub found for {method} {path}"),
    )
}

fn build_response(status: u16, headers: &BTreeMap<String, String>, body: &str) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR));
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from(String::from(body)))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn fixture_matches(
    fixture: &FixtureStub,
    method: &str,
    path: &str,
    query: &str,
    headers: &[(String, String)],
    body: &str,
) -> bool {
    if fixture.method != method {
        return false;
    }

    if fixture.path_pattern.is_empty() {
        if fixture.path != path {
            return false;
        }
    } else if !fixture
        .compiled_pattern
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(path))
    {
        return false;
    }

    let Some(conditions) = &fixture.conditions else {
        return true;
    };

    for (name, condition) in &conditions.headers {
        let value = headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
            .unwrap_or_default();
        if !header_condition_matches(condition, value) {
            return false;
        }
    }

    if !conditions.query.is_empty() {
        let parsed: BTreeMap<String, String> = url::form_urlencoded::parse(query.as_bytes())
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        for (key, expected) in &conditions.query {
            if parsed.get(key) != Some(expected) {
                return false;
            }
        }
    }

    conditions
        .body
        .as_ref()
        .is_none_or(|condition| body_condition_matches(condition, body))
}

fn header_condition_matches(condition: &HeaderCondition, value: &str) -> bool {
    if !condition.equals.is_empty() && value != condition.equals {
        return false;
    }
    if !condition.contains.is_empty() && !value.contains(&condition.contains) {
        return false;
    }
    if !condition.matches.is_empty()
        && !condition
            .compiled
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(value))
    {
        return false;
    }
    true
}

fn body_condition_matches(condition: &BodyCondition, body: &str) -> bool {
    if !condition.json_path.is_empty() {
        let Some(value) = extract_json_path(body, &condition.json_path) else {
            return false;
        };
        if !condition.equals.is_empty() && value != condition.equals {
            return false;
        }
        if !condition.contains.is_empty() && !value.contains(&condition.contains) {
            return false;
        }
        if !condition.matches.is_empty()
            && !condition
                .compiled_matches
                .as_ref()
                .is_some_and(|pattern| pattern.is_match(&value))
        {
            return false;
        }
        return true;
    }

    if !condition.body_contains.is_empty() && !body.contains(&condition.body_contains) {
        return false;
    }
    if !condition.body_matches.is_empty()
        && !condition
            .compiled_body_matches
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(body))
    {
        return false;
    }
    true
}

/// Evaluate a `$.field[0].nested` JSONPath subset against a request body,
/// rendering the result as a string.
fn extract_json_path(body: &str, path: &str) -> Option<String> {
    let stripped = path.strip_prefix("$.").or_else(|| path.strip_prefix('$'))?;
    let document: serde_json::Value = serde_json::from_str(body).ok()?;
    if stripped.is_empty() {
        return Some(document.to_string());
    }
    let normalized = stripped.trim_start_matches('.');
    crate::compare::lookup_path(&document, normalized)
        .ok()
        .map(crate::compare::render)
}

fn condition_count(fixture: &FixtureStub) -> usize {
    fixture.conditions.as_ref().map_or(0, |conditions| {
        conditions.headers.len()
            + conditions.query.len()
            + usize::from(conditions.body.is_some())
    })
}

/// Validate fields and compile regexes for one fixture stub.
fn prepare_fixture(stub: &mut FixtureStub, base: &Utf8Path) -> Result<(), String> {
    if stub.method.is_empty() {
        return Err(String::from("method is required"));
    }
    if stub.path.is_empty() && stub.path_pattern.is_empty() {
        return Err(String::from("either path or pathPattern is required"));
    }
    if !stub.path.is_empty() && !stub.path_pattern.is_empty() {
        return Err(String::from("cannot specify both path and pathPattern"));
    }

    if !stub.path_pattern.is_empty() {
        stub.compiled_pattern = Some(
            Regex::new(&stub.path_pattern).map_err(|e| format!("compiling pathPattern: {e}"))?,
        );
    }

    if !stub.response.body_file.is_empty() {
        let body_path = base.join(&stub.response.body_file);
        stub.response.body_content = std::fs::read_to_string(&body_path)
            .map_err(|e| format!("reading bodyFile \"{}\": {e}", stub.response.body_file))?;
    }

    if let Some(conditions) = &mut stub.conditions {
        for (name, condition) in &mut conditions.headers {
            if !condition.matches.is_empty() {
                condition.compiled = Some(
                    Regex::new(&condition.matches)
                        .map_err(|e| format!("compiling header condition regex for \"{name}\": {e}"))?,
                );
            }
        }
        if let Some(body) = &mut conditions.body {
            if !body.matches.is_empty() {
                body.compiled_matches = Some(
                    Regex::new(&body.matches).map_err(|e| format!("compiling body matches regex: {e}"))?,
                );
            }
            if !body.body_matches.is_empty() {
                body.compiled_body_matches = Some(
                    Regex::new(&body.body_matches)
                        .map_err(|e| format!("compiling bodyMatches regex: {e}"))?,
                );
            }
        }
    }

    Ok(())
}

fn status_from(raw: i64) -> Result<u16, StepError> {
    u16::try_from(raw).map_err(|_| StepError::assertion(format!("invalid status code: {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn vocabulary_actions_are_unique() {
        let steps = vocabulary().steps;
        let mut actions: Vec<&str> = steps.iter().map(|step| step.action).collect();
        actions.sort_unstable();
        actions.dedup();
        assert_eq!(actions.len(), steps.len());
    }

    #[rstest]
    fn patterns_compile_for_a_resource_name() {
        for step in vocabulary().steps {
            super::super::stepdef::compile_pattern(step.pattern, "external-api")
                .expect("http server pattern compiles");
        }
    }

    #[rstest]
    fn fixture_preparation_validates_path_exclusivity() {
        let mut both = FixtureStub {
            method: String::from("GET"),
            path: String::from("/a"),
            path_pattern: String::from("^/a$"),
            ..FixtureStub::default()
        };
        let error = prepare_fixture(&mut both, Utf8Path::new(".")).expect_err("both set");
        assert!(error.contains("cannot specify both"));

        let mut neither = FixtureStub {
            method: String::from("GET"),
            ..FixtureStub::default()
        };
        assert!(prepare_fixture(&mut neither, Utf8Path::new(".")).is_err());
    }

    #[rstest]
    fn fixture_matching_honours_conditions() {
        let mut fixture = FixtureStub {
            method: String::from("POST"),
            path: String::from("/login"),
            conditions: Some(FixtureConditions {
                headers: BTreeMap::from([(
                    String::from("Content-Type"),
                    HeaderCondition {
                        contains: String::from("json"),
                        ..HeaderCondition::default()
                    },
                )]),
                query: BTreeMap::new(),
                body: Some(BodyCondition {
                    json_path: String::from("$.user"),
                    equals: String::from("alice"),
                    ..BodyCondition::default()
                }),
            }),
            ..FixtureStub::default()
        };
        prepare_fixture(&mut fixture, Utf8Path::new(".")).expect("fixture prepares");

        let headers = vec![(
            String::from("content-type"),
            String::from("application/json"),
        )];
        assert!(fixture_matches(
            &fixture,
            "POST",
            "/login",
            "",
            &headers,
            r#"{"user": "alice"}"#
        ));
        assert!(!fixture_matches(
            &fixture,
            "POST",
            "/login",
            "",
            &headers,
            r#"{"user": "bob"}"#
        ));
        assert!(!fixture_matches(
            &fixture,
            "GET",
            "/login",
            "",
            &headers,
            r#"{"user": "alice"}"#
        ));
    }

    #[rstest]
    fn json_path_extraction_walks_requests() {
        let body = r#"{"data": {"items": [{"id": 7}]}}"#;
        assert_eq!(
            extract_json_path(body, "$.data.items[0].id"),
            Some(String::from("7"))
        );
        assert_eq!(extract_json_path(body, "$.missing"), None);
        assert_eq!(extract_json_path("not json", "$.a"), None);
    }
}
