//! HTTP client resource handler.
//!
//! Holds request state (headers, query parameters, body) built up across
//! steps, sends requests against the resource's base URL, and asserts on
//! the last response: status, headers, body text, JSON paths, structural
//! JSON matches, and response time.
//!
//! Request-scoped body and query parameters are cleared after each send.
//! Headers persist across requests until `reset` so an `Authorization:
//! Bearer ...` set once survives a scenario's whole call sequence.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::compare;
use crate::error::{CleanupError, InfraError, StepError};

use super::stepdef::{StepArgs, StepCategory, StepDef};
use super::{Handler, HandlerDeps};
use crate::config::ResourceSpec;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const UUID_PATTERN: &str =
    r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$";
const EMAIL_PATTERN: &str = r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$";
const ISO_TIMESTAMP_PATTERN: &str =
    r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(\.\d+)?(Z|[+-]\d{2}:\d{2})?$";

mod action {
    pub const SET_HEADER: &str = "set-header";
    pub const SET_HEADERS: &str = "set-headers";
    pub const SET_QUERY_PARAM: &str = "set-query-param";
    pub const SET_BODY: &str = "set-body";
    pub const SET_JSON_BODY: &str = "set-json-body";
    pub const SET_FORM_BODY: &str = "set-form-body";
    pub const SEND: &str = "send";
    pub const SEND_WITH_BODY: &str = "send-with-body";
    pub const SEND_WITH_JSON: &str = "send-with-json";
    pub const STATUS_IS: &str = "status-is";
    pub const STATUS_CLASS_IS: &str = "status-class-is";
    pub const HEADER_IS: &str = "header-is";
    pub const HEADER_CONTAINS: &str = "header-contains";
    pub const HEADER_EXISTS: &str = "header-exists";
    pub const BODY_IS: &str = "body-is";
    pub const BODY_CONTAINS: &str = "body-contains";
    pub const BODY_NOT_CONTAINS: &str = "body-not-contains";
    pub const BODY_EMPTY: &str = "body-empty";
    pub const JSON_PATH_IS: &str = "json-path-is";
    pub const JSON_PATH_EXISTS: &str = "json-path-exists";
    pub const JSON_PATH_NOT_EXISTS: &str = "json-path-not-exists";
    pub const JSON_MATCHES: &str = "json-matches";
    pub const JSON_CONTAINS: &str = "json-contains";
    pub const JSON_PATH_PATTERN: &str = "json-path-pattern";
    pub const JSON_PATH_UUID: &str = "json-path-uuid";
    pub const JSON_PATH_EMAIL: &str = "json-path-email";
    pub const JSON_PATH_TIMESTAMP: &str = "json-path-timestamp";
    pub const RESPONSE_TIME_BELOW: &str = "response-time-below";
    pub const SAVE_JSON_PATH: &str = "save-json-path";
    pub const SAVE_HEADER: &str = "save-header";
}

/// The HTTP client step vocabulary.
#[allow(clippy::too_many_lines, reason = "one entry per vocabulary step")]
pub(super) fn vocabulary() -> StepCategory {
    StepCategory {
        name: "HTTP Client",
        description: "Steps for making HTTP requests and validating responses",
        steps: vec![
            StepDef {
                group: "Request Setup",
                pattern: r#"^"{resource}" header "([^"]*)" is "([^"]*)"$"#,
                description: "Set a header (persists across requests until reset)",
                example: "\"{resource}\" header \"Content-Type\" is \"application/json\"",
                action: action::SET_HEADER,
            },
            StepDef {
                group: "Request Setup",
                pattern: r#"^"{resource}" headers are:$"#,
                description: "Set multiple headers from a table",
                example: "\"{resource}\" headers are:\n  | header        | value  |\n  | Authorization | Bearer |",
                action: action::SET_HEADERS,
            },
            StepDef {
                group: "Request Setup",
                pattern: r#"^"{resource}" query param "([^"]*)" is "([^"]*)"$"#,
                description: "Set a query parameter for the next request",
                example: "\"{resource}\" query param \"page\" is \"1\"",
                action: action::SET_QUERY_PARAM,
            },
            StepDef {
                group: "Request Setup",
                pattern: r#"^"{resource}" body is:$"#,
                description: "Set the next request's raw body",
                example: "\"{resource}\" body is:\n  \"\"\"\n  payload\n  \"\"\"",
                action: action::SET_BODY,
            },
            StepDef {
                group: "Request Setup",
                pattern: r#"^"{resource}" json body is:$"#,
                description: "Set a JSON body (validated; sets Content-Type)",
                example: "\"{resource}\" json body is:\n  \"\"\"\n  {\"name\": \"alice\"}\n  \"\"\"",
                action: action::SET_JSON_BODY,
            },
            StepDef {
                group: "Request Setup",
                pattern: r#"^"{resource}" form body is:$"#,
                description: "Set a form-encoded body from a table",
                example: "\"{resource}\" form body is:\n  | field | value |\n  | name  | alice |",
                action: action::SET_FORM_BODY,
            },
            StepDef {
                group: "Request Execution",
                pattern: r#"^"{resource}" sends "([^"]*)" to "([^"]*)"$"#,
                description: "Send an HTTP request",
                example: "\"{resource}\" sends \"GET\" to \"/users\"",
                action: action::SEND,
            },
            StepDef {
                group: "Request Execution",
                pattern: r#"^"{resource}" sends "([^"]*)" to "([^"]*)" with body:$"#,
                description: "Send with a raw docstring body",
                example: "\"{resource}\" sends \"POST\" to \"/users\" with body:\n  \"\"\"\n  payload\n  \"\"\"",
                action: action::SEND_WITH_BODY,
            },
            StepDef {
                group: "Request Execution",
                pattern: r#"^"{resource}" sends "([^"]*)" to "([^"]*)" with json:$"#,
                description: "Send with a JSON docstring body",
                example: "\"{resource}\" sends \"POST\" to \"/users\" with json:\n  \"\"\"\n  {\"name\": \"alice\"}\n  \"\"\"",
                action: action::SEND_WITH_JSON,
            },
            StepDef {
                group: "Response Status",
                pattern: r#"^"{resource}" response status is "(\d+)"$"#,
                description: "Assert the exact status code",
                example: "\"{resource}\" response status is \"200\"",
                action: action::STATUS_IS,
            },
            StepDef {
                group: "Response Status",
                pattern: r#"^"{resource}" response status is (success|redirect|client error|server error)$"#,
                description: "Assert the status class (2xx, 3xx, 4xx, 5xx)",
                example: "\"{resource}\" response status is success",
                action: action::STATUS_CLASS_IS,
            },
            StepDef {
                group: "Response Headers",
                pattern: r#"^"{resource}" response header "([^"]*)" is "([^"]*)"$"#,
                description: "Assert an exact header value",
                example: "\"{resource}\" response header \"Content-Type\" is \"application/json\"",
                action: action::HEADER_IS,
            },
            StepDef {
                group: "Response Headers",
                pattern: r#"^"{resource}" response header "([^"]*)" contains "([^"]*)"$"#,
                description: "Assert a header contains a substring",
                example: "\"{resource}\" response header \"Content-Type\" contains \"json\"",
                action: action::HEADER_CONTAINS,
            },
            StepDef {
                group: "Response Headers",
                pattern: r#"^"{resource}" response header "([^"]*)" exists$"#,
                description: "Assert a header is present",
                example: "\"{resource}\" response header \"X-Request-Id\" exists",
                action: action::HEADER_EXISTS,
            },
            StepDef {
                group: "Response Body",
                pattern: r#"^"{resource}" response body is:$"#,
                description: "Assert the exact body (whitespace-trimmed)",
                example: "\"{resource}\" response body is:\n  \"\"\"\n  ok\n  \"\"\"",
                action: action::BODY_IS,
            },
            StepDef {
                group: "Response Body",
                pattern: r#"^"{resource}" response body contains "([^"]*)"$"#,
                description: "Assert the body contains a substring",
                example: "\"{resource}\" response body contains \"success\"",
                action: action::BODY_CONTAINS,
            },
            StepDef {
                group: "Response Body",
                pattern: r#"^"{resource}" response body does not contain "([^"]*)"$"#,
                description: "Assert the body does not contain a substring",
                example: "\"{resource}\" response body does not contain \"error\"",
                action: action::BODY_NOT_CONTAINS,
            },
            StepDef {
                group: "Response Body",
                pattern: r#"^"{resource}" response body is empty$"#,
                description: "Assert an empty body",
                example: "\"{resource}\" response body is empty",
                action: action::BODY_EMPTY,
            },
            StepDef {
                group: "Response JSON",
                pattern: r#"^"{resource}" response json "([^"]*)" is "([^"]*)"$"#,
                description: "Assert a JSON path's value",
                example: "\"{resource}\" response json \"data.id\" is \"123\"",
                action: action::JSON_PATH_IS,
            },
            StepDef {
                group: "Response JSON",
                pattern: r#"^"{resource}" response json "([^"]*)" exists$"#,
                description: "Assert a JSON path exists",
                example: "\"{resource}\" response json \"data.id\" exists",
                action: action::JSON_PATH_EXISTS,
            },
            StepDef {
                group: "Response JSON",
                pattern: r#"^"{resource}" response json "([^"]*)" does not exist$"#,
                description: "Assert a JSON path is absent",
                example: "\"{resource}\" response json \"data.deleted\" does not exist",
                action: action::JSON_PATH_NOT_EXISTS,
            },
            StepDef {
                group: "Response JSON",
                pattern: r#"^"{resource}" response json matches:$"#,
                description: "Strict structural match; supports @string, @number, @boolean, @array, @object, @any, @null, @notnull, @empty, @notempty, @regex:p, @contains:s, @startswith:s, @endswith:s, @gt:n, @gte:n, @lt:n, @lte:n, @len:n",
                example: "\"{resource}\" response json matches:\n  \"\"\"\n  {\"id\": \"@number\"}\n  \"\"\"",
                action: action::JSON_MATCHES,
            },
            StepDef {
                group: "Response JSON",
                pattern: r#"^"{resource}" response json contains:$"#,
                description: "Partial structural match (extra fields ignored); same matchers as 'matches'",
                example: "\"{resource}\" response json contains:\n  \"\"\"\n  {\"name\": \"@string\"}\n  \"\"\"",
                action: action::JSON_CONTAINS,
            },
            StepDef {
                group: "Response JSON",
                pattern: r#"^"{resource}" response json "([^"]*)" matches pattern "([^"]*)"$"#,
                description: "Assert a JSON path's value matches a regex",
                example: "\"{resource}\" response json \"id\" matches pattern \"^[0-9]+$\"",
                action: action::JSON_PATH_PATTERN,
            },
            StepDef {
                group: "Response JSON",
                pattern: r#"^"{resource}" response json "([^"]*)" is uuid$"#,
                description: "Assert a JSON path's value is a UUID",
                example: "\"{resource}\" response json \"id\" is uuid",
                action: action::JSON_PATH_UUID,
            },
            StepDef {
                group: "Response JSON",
                pattern: r#"^"{resource}" response json "([^"]*)" is email$"#,
                description: "Assert a JSON path's value looks like an email",
                example: "\"{resource}\" response json \"email\" is email",
                action: action::JSON_PATH_EMAIL,
            },
            StepDef {
                group: "Response JSON",
                pattern: r#"^"{resource}" response json "([^"]*)" is iso-timestamp$"#,
                description: "Assert a JSON path's value is an ISO 8601 timestamp",
                example: "\"{resource}\" response json \"created_at\" is iso-timestamp",
                action: action::JSON_PATH_TIMESTAMP,
            },
            StepDef {
                group: "Response Timing",
                pattern: r#"^"{resource}" response time is less than "([^"]*)"$"#,
                description: "Assert the response arrived within a duration",
                example: "\"{resource}\" response time is less than \"500ms\"",
                action: action::RESPONSE_TIME_BELOW,
            },
            StepDef {
                group: "Variable Capture",
                pattern: r#"^"{resource}" response json "([^"]*)" saved as "\{\{([^}]+)\}\}"$"#,
                description: "Save a JSON path's value for later steps",
                example: "\"{resource}\" response json \"id\" saved as \"{{user_id}}\"",
                action: action::SAVE_JSON_PATH,
            },
            StepDef {
                group: "Variable Capture",
                pattern: r#"^"{resource}" response header "([^"]*)" saved as "\{\{([^}]+)\}\}"$"#,
                description: "Save a response header's value for later steps",
                example: "\"{resource}\" response header \"Location\" saved as \"{{location}}\"",
                action: action::SAVE_HEADER,
            },
        ],
    }
}

struct LastResponse {
    status: u16,
    headers: HeaderMap,
    body: Vec<u8>,
    elapsed: Duration,
}

/// Handler for one declared `http-client` resource.
pub struct HttpClient {
    name: String,
    spec: ResourceSpec,
    deps: HandlerDeps,
    client: Option<reqwest::Client>,
    base_url: String,
    headers: BTreeMap<String, String>,
    body: Option<Vec<u8>>,
    query: Vec<(String, String)>,
    last: Option<LastResponse>,
}

impl HttpClient {
    /// Create the handler; the client is built in `init`.
    #[must_use]
    pub fn new(name: String, spec: ResourceSpec, deps: HandlerDeps) -> Self {
        Self {
            name,
            spec,
            deps,
            client: None,
            base_url: String::new(),
            headers: BTreeMap::new(),
            body: None,
            query: Vec::new(),
            last: None,
        }
    }

    fn client(&self) -> Result<&reqwest::Client, StepError> {
        self.client
            .as_ref()
            .ok_or_else(|| StepError::backend(format!("handler '{}' is not connected", self.name)))
    }

    fn last(&self) -> Result<&LastResponse, StepError> {
        self.last
            .as_ref()
            .ok_or_else(|| StepError::assertion("no response received"))
    }

    fn last_json(&self) -> Result<serde_json::Value, StepError> {
        let last = self.last()?;
        serde_json::from_slice(&last.body)
            .map_err(|e| StepError::assertion(format!("invalid response JSON: {e}")))
    }

    fn header_value<'a>(last: &'a LastResponse, header: &str) -> Option<&'a str> {
        last.headers.get(header).and_then(|value| value.to_str().ok())
    }

    async fn send(
        &mut self,
        method: &str,
        path: &str,
        body_override: Option<Vec<u8>>,
    ) -> Result<(), StepError> {
        let variables = &self.deps.variables;
        let path = variables.replace(path);

        let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
            .map_err(|_| StepError::assertion(format!("invalid HTTP method: {method}")))?;
        let url = variables.replace(&format!("{}{path}", self.base_url));

        let mut request = self.client()?.request(method, &url);
        if !self.query.is_empty() {
            request = request.query(&self.query);
        }

        let mut header_map = HeaderMap::new();
        for (key, value) in &self.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|_| StepError::assertion(format!("invalid header name: {key}")))?;
            let substituted = variables.replace(value);
            let value = HeaderValue::from_str(&substituted)
                .map_err(|_| StepError::assertion(format!("invalid header value for {key}")))?;
            header_map.insert(name, value);
        }
        request = request.headers(header_map);

        let body = body_override.or_else(|| self.body.clone());
        if let Some(body) = body {
            let substituted = variables.replace(&String::from_utf8_lossy(&body));
            request = request.body(substituted.into_bytes());
        }

        let started = Instant::now();
        let response = request
            .send()
            .await
            .map_err(|e| StepError::backend(format!("sending request: {e}")))?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| StepError::backend(format!("reading response body: {e}")))?
            .to_vec();

        self.last = Some(LastResponse {
            status,
            headers,
            body,
            elapsed: started.elapsed(),
        });

        // Request-scoped state is single-use; headers persist until reset.
        self.body = None;
        self.query.clear();
        Ok(())
    }

    fn assert_json_path_pattern(&self, path: &str, pattern: &str) -> Result<(), StepError> {
        let document = self.last_json()?;
        let value = compare::lookup_path(&document, path)?;
        let text = value.as_str().ok_or_else(|| {
            StepError::assertion(format!("JSON path \"{path}\" is not a string"))
        })?;
        let regex = regex::Regex::new(pattern)
            .map_err(|e| StepError::assertion(format!("invalid regex pattern: {e}")))?;
        if regex.is_match(text) {
            Ok(())
        } else {
            Err(StepError::assertion(format!(
                "JSON path \"{path}\" value \"{text}\" does not match pattern \"{pattern}\""
            )))
        }
    }
}

#[async_trait]
impl Handler for HttpClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&mut self) -> Result<(), InfraError> {
        let timeout = self.spec.opt_duration("timeout").unwrap_or(DEFAULT_TIMEOUT);
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if self.spec.opt_bool("no_redirect").unwrap_or(false) {
            builder = builder.redirect(reqwest::redirect::Policy::none());
        }
        let client = builder.build().map_err(|e| InfraError::HandlerInitFailed {
            handler: self.name.clone(),
            message: format!("building HTTP client: {e}"),
        })?;

        self.base_url = if let Some(base_url) = &self.spec.base_url {
            base_url.clone()
        } else if let Some(container) = self.spec.container.as_deref() {
            let host = self.deps.orchestrator.host(container)?;
            let port = self.spec.opt_str("port").unwrap_or("8080");
            let mapped = self
                .deps
                .orchestrator
                .port(container, &crate::orchestrator::normalize_port(port))
                .await?;
            let scheme = self.spec.opt_str("scheme").unwrap_or("http");
            format!("{scheme}://{host}:{mapped}")
        } else {
            // No base: steps must use absolute URLs, typically a captured
            // mock-server address like {{SERVER_URL}}/path.
            String::new()
        };

        self.client = Some(client);
        Ok(())
    }

    async fn ready(&mut self) -> Result<(), InfraError> {
        let Some(health_path) = self.spec.opt_str("health_path") else {
            return Ok(());
        };
        let url = format!("{}{health_path}", self.base_url);
        let client = self.client.as_ref().ok_or_else(|| {
            InfraError::HandlerInitFailed {
                handler: self.name.clone(),
                message: String::from("not initialised"),
            }
        })?;

        let response = client
            .get(&url)
            .send()
            .await
            .map_err(|e| InfraError::HandlerInitFailed {
                handler: self.name.clone(),
                message: format!("health check failed: {e}"),
            })?;
        if response.status().as_u16() >= 400 {
            return Err(InfraError::HandlerInitFailed {
                handler: self.name.clone(),
                message: format!("health check returned status {}", response.status().as_u16()),
            });
        }
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), InfraError> {
        self.headers.clear();
        self.body = None;
        self.query.clear();
        self.last = None;
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<(), CleanupError> {
        self.client = None;
        Ok(())
    }

    fn steps(&self) -> StepCategory {
        vocabulary()
    }

    #[allow(clippy::too_many_lines, reason = "one arm per vocabulary entry")]
    async fn run_step(&mut self, action: &str, args: &StepArgs) -> Result<(), StepError> {
        match action {
            action::SET_HEADER => {
                let (key, value) = (args.string(0)?, args.string(1)?);
                self.headers.insert(String::from(key), String::from(value));
                Ok(())
            }
            action::SET_HEADERS => {
                for row in args.table()?.data_rows() {
                    if row.len() >= 2 {
                        self.headers.insert(row[0].clone(), row[1].clone());
                    }
                }
                Ok(())
            }
            action::SET_QUERY_PARAM => {
                let (key, value) = (args.string(0)?, args.string(1)?);
                self.query.retain(|(existing, _)| existing != key);
                self.query.push((String::from(key), String::from(value)));
                Ok(())
            }
            action::SET_BODY => {
                self.body = Some(args.docstring()?.as_bytes().to_vec());
                Ok(())
            }
            action::SET_JSON_BODY => {
                let doc = args.docstring()?;
                serde_json::from_str::<serde_json::Value>(doc)
                    .map_err(|e| StepError::assertion(format!("invalid JSON: {e}")))?;
                self.body = Some(doc.as_bytes().to_vec());
                self.headers
                    .entry(String::from("Content-Type"))
                    .or_insert_with(|| String::from("application/json"));
                Ok(())
            }
            action::SET_FORM_BODY => {
                let mut encoder = url::form_urlencoded::Serializer::new(String::new());
                for row in args.table()?.data_rows() {
                    if row.len() >= 2 {
                        encoder.append_pair(&row[0], &row[1]);
                    }
                }
                self.body = Some(encoder.finish().into_bytes());
                self.headers
                    .entry(String::from("Content-Type"))
                    .or_insert_with(|| String::from("application/x-www-form-urlencoded"));
                Ok(())
            }
            action::SEND => {
                let (method, path) = (args.string(0)?.to_owned(), args.string(1)?.to_owned());
                self.send(&method, &path, None).await
            }
            action::SEND_WITH_BODY => {
                let (method, path) = (args.string(0)?.to_owned(), args.string(1)?.to_owned());
                let body = args.docstring()?.as_bytes().to_vec();
                self.send(&method, &path, Some(body)).await
            }
            action::SEND_WITH_JSON => {
                let (method, path) = (args.string(0)?.to_owned(), args.string(1)?.to_owned());
                let doc = args.docstring()?;
                serde_json::from_str::<serde_json::Value>(doc)
                    .map_err(|e| StepError::assertion(format!("invalid JSON: {e}")))?;
                self.headers
                    .entry(String::from("Content-Type"))
                    .or_insert_with(|| String::from("application/json"));
                let body = doc.as_bytes().to_vec();
                self.send(&method, &path, Some(body)).await
            }
            action::STATUS_IS => {
                let expected = args.int(0)?;
                let last = self.last()?;
                if i64::from(last.status) != expected {
                    return Err(StepError::assertion(format!(
                        "expected status {expected}, got {}\nBody: {}",
                        last.status,
                        String::from_utf8_lossy(&last.body)
                    )));
                }
                Ok(())
            }
            action::STATUS_CLASS_IS => {
                let class = args.string(0)?;
                let status = self.last()?.status;
                let ok = match class {
                    "success" => (200..300).contains(&status),
                    "redirect" => (300..400).contains(&status),
                    "client error" => (400..500).contains(&status),
                    "server error" => (500..600).contains(&status),
                    other => {
                        return Err(StepError::assertion(format!(
                            "unknown status class: {other}"
                        )));
                    }
                };
                if ok {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "expected {class} status, got {status}"
                    )))
                }
            }
            action::HEADER_IS => {
                let (header, expected) = (args.string(0)?, args.string(1)?);
                let last = self.last()?;
                let actual = Self::header_value(last, header).unwrap_or_default();
                if actual == expected {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "header \"{header}\": expected \"{expected}\", got \"{actual}\""
                    )))
                }
            }
            action::HEADER_CONTAINS => {
                let (header, needle) = (args.string(0)?, args.string(1)?);
                let last = self.last()?;
                let actual = Self::header_value(last, header).unwrap_or_default();
                if actual.contains(needle) {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "header \"{header}\" value \"{actual}\" does not contain \"{needle}\""
                    )))
                }
            }
            action::HEADER_EXISTS => {
                let header = args.string(0)?;
                let last = self.last()?;
                if Self::header_value(last, header).is_some_and(|value| !value.is_empty()) {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "header \"{header}\" does not exist"
                    )))
                }
            }
            action::BODY_IS => {
                let expected = args.docstring()?.trim();
                let last = self.last()?;
                let actual_text = String::from_utf8_lossy(&last.body);
                let actual = actual_text.trim();
                if actual == expected {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "body mismatch:\nexpected: {expected}\nactual: {actual}"
                    )))
                }
            }
            action::BODY_CONTAINS => {
                let needle = args.string(0)?;
                let last = self.last()?;
                let body = String::from_utf8_lossy(&last.body);
                if body.contains(needle) {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "body does not contain \"{needle}\"\nbody: {body}"
                    )))
                }
            }
            action::BODY_NOT_CONTAINS => {
                let needle = args.string(0)?;
                let last = self.last()?;
                let body = String::from_utf8_lossy(&last.body);
                if body.contains(needle) {
                    Err(StepError::assertion(format!(
                        "body should not contain \"{needle}\"\nbody: {body}"
                    )))
                } else {
                    Ok(())
                }
            }
            action::BODY_EMPTY => {
                let last = self.last()?;
                if last.body.is_empty() {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "expected empty body, got: {}",
                        String::from_utf8_lossy(&last.body)
                    )))
                }
            }
            action::JSON_PATH_IS => {
                let (path, expected) = (args.string(0)?, args.string(1)?);
                let document = self.last_json()?;
                let value = compare::lookup_path(&document, path)?;
                let actual = compare::render(value);
                if actual == expected {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "JSON path \"{path}\": expected \"{expected}\", got \"{actual}\""
                    )))
                }
            }
            action::JSON_PATH_EXISTS => {
                let path = args.string(0)?;
                let document = self.last_json()?;
                compare::lookup_path(&document, path).map(|_| ())
            }
            action::JSON_PATH_NOT_EXISTS => {
                let path = args.string(0)?;
                let document = self.last_json()?;
                if compare::lookup_path(&document, path).is_ok() {
                    Err(StepError::assertion(format!(
                        "JSON path \"{path}\" exists but should not"
                    )))
                } else {
                    Ok(())
                }
            }
            action::JSON_MATCHES => {
                let expected: serde_json::Value = serde_json::from_str(args.docstring()?)
                    .map_err(|e| StepError::assertion(format!("invalid expected JSON: {e}")))?;
                compare::json_matches(&expected, &self.last_json()?)
            }
            action::JSON_CONTAINS => {
                let expected: serde_json::Value = serde_json::from_str(args.docstring()?)
                    .map_err(|e| StepError::assertion(format!("invalid expected JSON: {e}")))?;
                compare::json_contains(&expected, &self.last_json()?)
            }
            action::JSON_PATH_PATTERN => {
                self.assert_json_path_pattern(args.string(0)?, args.string(1)?)
            }
            action::JSON_PATH_UUID => self.assert_json_path_pattern(args.string(0)?, UUID_PATTERN),
            action::JSON_PATH_EMAIL => {
                self.assert_json_path_pattern(args.string(0)?, EMAIL_PATTERN)
            }
            action::JSON_PATH_TIMESTAMP => {
                self.assert_json_path_pattern(args.string(0)?, ISO_TIMESTAMP_PATTERN)
            }
            action::RESPONSE_TIME_BELOW => {
                let limit = args.duration(0)?;
                let elapsed = self.last()?.elapsed;
                if elapsed < limit {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "response time {} exceeded {}",
                        humantime::format_duration(elapsed),
                        humantime::format_duration(limit)
                    )))
                }
            }
            action::SAVE_JSON_PATH => {
                let (path, variable) = (args.string(0)?, args.string(1)?);
                let document = self.last_json()?;
                let value = compare::lookup_path(&document, path)?;
                self.deps.variables.set(variable, &compare::render(value));
                Ok(())
            }
            action::SAVE_HEADER => {
                let (header, variable) = (args.string(0)?, args.string(1)?);
                let last = self.last()?;
                let value = Self::header_value(last, header)
                    .filter(|value| !value.is_empty())
                    .ok_or_else(|| {
                        StepError::assertion(format!("header \"{header}\" not found or empty"))
                    })?;
                self.deps.variables.set(variable, value);
                Ok(())
            }
            other => Err(StepError::UnknownAction {
                handler: self.name.clone(),
                action: String::from(other),
            }),
        }
    }
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
            super::super::stepdef::compile_pattern(step.pattern, "api")
                .expect("http client pattern compiles");
        }
    }

    #[rstest]
    fn status_class_pattern_captures_without_quotes() {
        let regex = super::super::stepdef::compile_pattern(
            r#"^"{resource}" response status is (success|redirect|client error|server error)$"#,
            "api",
        )
        .expect("pattern compiles");
        let captures = regex
            .captures("\"api\" response status is client error")
            .expect("matches");
        assert_eq!(&captures[1], "client error");
    }
}
