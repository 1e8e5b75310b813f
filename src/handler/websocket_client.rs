//! WebSocket client resource handler.
//!
//! On connect, a background reader task buffers every inbound text frame
//! (mutex-guarded list plus a last-message pointer) while the step side
//! keeps the write half. Receive assertions poll the buffer under a
//! deadline; `reset` disconnects and empties the buffer.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use crate::compare;
use crate::error::{CleanupError, InfraError, StepError};

use super::stepdef::{StepArgs, StepCategory, StepDef};
use super::{Handler, HandlerDeps};
use crate::config::ResourceSpec;

/// Poll interval while waiting for buffered frames.
const RECEIVE_POLL: Duration = Duration::from_millis(50);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

mod action {
    pub const CONNECT: &str = "connect";
    pub const CONNECT_WITH_HEADERS: &str = "connect-with-headers";
    pub const DISCONNECT: &str = "disconnect";
    pub const IS_CONNECTED: &str = "is-connected";
    pub const IS_DISCONNECTED: &str = "is-disconnected";
    pub const SEND_DOCSTRING: &str = "send-docstring";
    pub const SEND_TEXT: &str = "send-text";
    pub const SEND_JSON: &str = "send-json";
    pub const RECEIVE_WITHIN: &str = "receive-within";
    pub const RECEIVE_WITHIN_CONTAINING: &str = "receive-within-containing";
    pub const RECEIVE_JSON_WITHIN: &str = "receive-json-within";
    pub const RECEIVE_COUNT_WITHIN: &str = "receive-count-within";
    pub const NOT_RECEIVE_WITHIN: &str = "not-receive-within";
    pub const LAST_IS: &str = "last-is";
    pub const LAST_CONTAINS: &str = "last-contains";
    pub const LAST_JSON_MATCHES: &str = "last-json-matches";
    pub const RECEIVED_COUNT: &str = "received-count";
}

/// The WebSocket client step vocabulary.
#[allow(clippy::too_many_lines, reason = "one entry per vocabulary step")]
pub(super) fn vocabulary() -> StepCategory {
    StepCategory {
        name: "WebSocket Client",
        description: "Steps for driving WebSocket connections",
        steps: vec![
            StepDef {
                group: "Connection",
                pattern: r#"^"{resource}" connects$"#,
                description: "Opens the connection",
                example: "\"{resource}\" connects",
                action: action::CONNECT,
            },
            StepDef {
                group: "Connection",
                pattern: r#"^"{resource}" connects with headers:$"#,
                description: "Opens the connection with handshake headers",
                example: "\"{resource}\" connects with headers:\n  | header        | value  |\n  | Authorization | Bearer |",
                action: action::CONNECT_WITH_HEADERS,
            },
            StepDef {
                group: "Connection",
                pattern: r#"^"{resource}" disconnects$"#,
                description: "Closes the connection",
                example: "\"{resource}\" disconnects",
                action: action::DISCONNECT,
            },
            StepDef {
                group: "Connection",
                pattern: r#"^"{resource}" is connected$"#,
                description: "Asserts the connection is open",
                example: "\"{resource}\" is connected",
                action: action::IS_CONNECTED,
            },
            StepDef {
                group: "Connection",
                pattern: r#"^"{resource}" is disconnected$"#,
                description: "Asserts the connection is closed",
                example: "\"{resource}\" is disconnected",
                action: action::IS_DISCONNECTED,
            },
            StepDef {
                group: "Sending",
                pattern: r#"^"{resource}" sends:$"#,
                description: "Sends a docstring as a text frame",
                example: "\"{resource}\" sends:\n  \"\"\"\n  hello\n  \"\"\"",
                action: action::SEND_DOCSTRING,
            },
            StepDef {
                group: "Sending",
                pattern: r#"^"{resource}" sends "([^"]*)"$"#,
                description: "Sends a short text frame",
                example: "\"{resource}\" sends \"ping\"",
                action: action::SEND_TEXT,
            },
            StepDef {
                group: "Sending",
                pattern: r#"^"{resource}" sends json:$"#,
                description: "Sends a JSON text frame (validated)",
                example: "\"{resource}\" sends json:\n  \"\"\"\n  {\"type\": \"subscribe\"}\n  \"\"\"",
                action: action::SEND_JSON,
            },
            StepDef {
                group: "Receiving",
                pattern: r#"^"{resource}" receives within "([^"]*)":$"#,
                description: "Asserts an exact frame arrives within a timeout",
                example: "\"{resource}\" receives within \"5s\":\n  \"\"\"\n  pong\n  \"\"\"",
                action: action::RECEIVE_WITHIN,
            },
            StepDef {
                group: "Receiving",
                pattern: r#"^"{resource}" receives within "([^"]*)" containing "([^"]*)"$"#,
                description: "Asserts a frame containing a value arrives within a timeout",
                example: "\"{resource}\" receives within \"5s\" containing \"pong\"",
                action: action::RECEIVE_WITHIN_CONTAINING,
            },
            StepDef {
                group: "Receiving",
                pattern: r#"^"{resource}" receives json within "([^"]*)" matching:$"#,
                description: "Asserts a JSON frame matching the expected structure arrives",
                example: "\"{resource}\" receives json within \"5s\" matching:\n  \"\"\"\n  {\"status\": \"@string\"}\n  \"\"\"",
                action: action::RECEIVE_JSON_WITHIN,
            },
            StepDef {
                group: "Receiving",
                pattern: r#"^"{resource}" receives "(\d+)" messages within "([^"]*)"$"#,
                description: "Asserts a total frame count is reached within a timeout",
                example: "\"{resource}\" receives \"3\" messages within \"5s\"",
                action: action::RECEIVE_COUNT_WITHIN,
            },
            StepDef {
                group: "Receiving",
                pattern: r#"^"{resource}" does not receive within "([^"]*)"$"#,
                description: "Asserts no frame arrives for the full duration",
                example: "\"{resource}\" does not receive within \"2s\"",
                action: action::NOT_RECEIVE_WITHIN,
            },
            StepDef {
                group: "Assertions",
                pattern: r#"^"{resource}" last message is:$"#,
                description: "Asserts the last frame exactly",
                example: "\"{resource}\" last message is:\n  \"\"\"\n  pong\n  \"\"\"",
                action: action::LAST_IS,
            },
            StepDef {
                group: "Assertions",
                pattern: r#"^"{resource}" last message contains "([^"]*)"$"#,
                description: "Asserts the last frame contains a value",
                example: "\"{resource}\" last message contains \"pong\"",
                action: action::LAST_CONTAINS,
            },
            StepDef {
                group: "Assertions",
                pattern: r#"^"{resource}" last message is json matching:$"#,
                description: "Asserts the last frame matches a JSON structure",
                example: "\"{resource}\" last message is json matching:\n  \"\"\"\n  {\"ok\": true}\n  \"\"\"",
                action: action::LAST_JSON_MATCHES,
            },
            StepDef {
                group: "Assertions",
                pattern: r#"^"{resource}" received "(\d+)" messages$"#,
                description: "Asserts the total number of received frames",
                example: "\"{resource}\" received \"2\" messages",
                action: action::RECEIVED_COUNT,
            },
        ],
    }
}

#[derive(Default)]
struct Inbox {
    messages: Vec<String>,
    last: Option<String>,
}

/// Handler for one declared `websocket-client` resource.
pub struct WebSocketClient {
    name: String,
    spec: ResourceSpec,
    deps: HandlerDeps,
    sink: Option<WsSink>,
    reader_stop: Option<CancellationToken>,
    inbox: Arc<Mutex<Inbox>>,
}

impl WebSocketClient {
    /// Create the handler; connections are opened by steps.
    #[must_use]
    pub fn new(name: String, spec: ResourceSpec, deps: HandlerDeps) -> Self {
        Self {
            name,
            spec,
            deps,
            sink: None,
            reader_stop: None,
            inbox: Arc::new(Mutex::new(Inbox::default())),
        }
    }

    async fn endpoint(&self) -> Result<String, StepError> {
        if let Some(url) = &self.spec.url {
            return Ok(self.deps.variables.replace(url));
        }
        if let Some(url) = self.spec.opt_str("url") {
            return Ok(self.deps.variables.replace(url));
        }

        let container = self.spec.container.as_deref().ok_or_else(|| {
            StepError::backend(format!(
                "websocket resource '{}' needs a url or a container",
                self.name
            ))
        })?;
        let host = self
            .deps
            .orchestrator
            .host(container)
            .map_err(|e| StepError::backend(e.to_string()))?;
        let port = self.spec.opt_str("port").unwrap_or("8080");
        let mapped = self
            .deps
            .orchestrator
            .port(container, &crate::orchestrator::normalize_port(port))
            .await
            .map_err(|e| StepError::backend(e.to_string()))?;
        let path = self.spec.opt_str("path").unwrap_or("/");
        Ok(format!("ws://{host}:{mapped}{path}"))
    }

    async fn connect(&mut self, headers: &[(String, String)]) -> Result<(), StepError> {
        self.disconnect().await;

        let endpoint = self.endpoint().await?;
        let mut request = endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| StepError::backend(format!("building request: {e}")))?;
        for (name, value) in headers {
            use tokio_tungstenite::tungstenite::http;
            let header_name: http::HeaderName = name
                .parse()
                .map_err(|_| StepError::assertion(format!("invalid header name: {name}")))?;
            let header_value: http::HeaderValue = value
                .parse()
                .map_err(|_| StepError::assertion(format!("invalid header value for {name}")))?;
            request.headers_mut().insert(header_name, header_value);
        }

        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| StepError::backend(format!("connecting to {endpoint}: {e}")))?;
        let (sink, mut reader) = stream.split();

        let stop = self.deps.cancel.child_token();
        let inbox = Arc::clone(&self.inbox);
        let stop_for_reader = stop.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = stop_for_reader.cancelled() => break,
                    frame = reader.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            if let Ok(mut inbox) = inbox.lock() {
                                inbox.messages.push(text.clone());
                                inbox.last = Some(text);
                            }
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            let text = String::from_utf8_lossy(&bytes).into_owned();
                            if let Ok(mut inbox) = inbox.lock() {
                                inbox.messages.push(text.clone());
                                inbox.last = Some(text);
                            }
                        }
                        Some(Ok(_)) => {}
                        _ => break,
                    },
                }
            }
        });

        self.sink = Some(sink);
        self.reader_stop = Some(stop);
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(stop) = self.reader_stop.take() {
            stop.cancel();
        }
        if let Some(mut sink) = self.sink.take() {
            let _ = sink.send(Message::Close(None)).await;
        }
    }

    async fn send_text(&mut self, text: &str) -> Result<(), StepError> {
        let substituted = self.deps.variables.replace(text);
        let sink = self
            .sink
            .as_mut()
            .ok_or_else(|| StepError::assertion("not connected"))?;
        sink.send(Message::Text(substituted))
            .await
            .map_err(|e| StepError::backend(format!("sending frame: {e}")))
    }

    fn message_count(&self) -> usize {
        self.inbox.lock().map_or(0, |inbox| inbox.messages.len())
    }

    fn last_message(&self) -> Result<String, StepError> {
        self.inbox
            .lock()
            .ok()
            .and_then(|inbox| inbox.last.clone())
            .ok_or_else(|| StepError::assertion("no message received"))
    }

    /// Wait until some buffered frame satisfies the predicate.
    async fn wait_for_frame(
        &self,
        timeout: Duration,
        description: &str,
        predicate: impl Fn(&str) -> bool,
    ) -> Result<(), StepError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let found = self.inbox.lock().is_ok_and(|inbox| {
                inbox.messages.iter().any(|message| predicate(message))
            });
            if found {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(StepError::TimedOut {
                    message: format!(
                        "{description} not received within {}",
                        humantime::format_duration(timeout)
                    ),
                });
            }
            tokio::time::sleep(RECEIVE_POLL).await;
        }
    }
}

#[async_trait]
impl Handler for WebSocketClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&mut self) -> Result<(), InfraError> {
        // Connections open on demand from the `connects` step.
        Ok(())
    }

    async fn ready(&mut self) -> Result<(), InfraError> {
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), InfraError> {
        self.disconnect().await;
        if let Ok(mut inbox) = self.inbox.lock() {
            inbox.messages.clear();
            inbox.last = None;
        }
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<(), CleanupError> {
        self.disconnect().await;
        Ok(())
    }

    fn steps(&self) -> StepCategory {
        vocabulary()
    }

    #[allow(clippy::too_many_lines, reason = "one arm per vocabulary entry")]
    async fn run_step(&mut self, action: &str, args: &StepArgs) -> Result<(), StepError> {
        match action {
            action::CONNECT => self.connect(&[]).await,
            action::CONNECT_WITH_HEADERS => {
                let headers: Vec<(String, String)> = args
                    .table()?
                    .data_rows()
                    .iter()
                    .filter(|row| row.len() >= 2)
                    .map(|row| (row[0].clone(), row[1].clone()))
                    .collect();
                self.connect(&headers).await
            }
            action::DISCONNECT => {
                self.disconnect().await;
                Ok(())
            }
            action::IS_CONNECTED => {
                if self.sink.is_some() {
                    Ok(())
                } else {
                    Err(StepError::assertion("connection is not open"))
                }
            }
            action::IS_DISCONNECTED => {
                if self.sink.is_some() {
                    Err(StepError::assertion("connection is still open"))
                } else {
                    Ok(())
                }
            }
            action::SEND_DOCSTRING => {
                let text = args.docstring()?.to_owned();
                self.send_text(&text).await
            }
            action::SEND_TEXT => {
                let text = args.string(0)?.to_owned();
                self.send_text(&text).await
            }
            action::SEND_JSON => {
                let doc = args.docstring()?.to_owned();
                serde_json::from_str::<serde_json::Value>(&doc)
                    .map_err(|e| StepError::assertion(format!("invalid JSON: {e}")))?;
                self.send_text(&doc).await
            }
            action::RECEIVE_WITHIN => {
                let timeout = args.duration(0)?;
                let expected = args.docstring()?.trim().to_owned();
                self.wait_for_frame(timeout, &format!("message \"{expected}\""), |message| {
                    message.trim() == expected
                })
                .await
            }
            action::RECEIVE_WITHIN_CONTAINING => {
                let timeout = args.duration(0)?;
                let needle = args.string(1)?.to_owned();
                self.wait_for_frame(
                    timeout,
                    &format!("message containing \"{needle}\""),
                    |message| message.contains(&needle),
                )
                .await
            }
            action::RECEIVE_JSON_WITHIN => {
                let timeout = args.duration(0)?;
                let expected: serde_json::Value = serde_json::from_str(args.docstring()?)
                    .map_err(|e| StepError::assertion(format!("invalid expected JSON: {e}")))?;
                self.wait_for_frame(timeout, "matching JSON message", |message| {
                    serde_json::from_str::<serde_json::Value>(message)
                        .is_ok_and(|actual| compare::json_matches(&expected, &actual).is_ok())
                })
                .await
            }
            action::RECEIVE_COUNT_WITHIN => {
                let expected = usize::try_from(args.int(0)?).unwrap_or(0);
                let timeout = args.duration(1)?;
                let deadline = tokio::time::Instant::now() + timeout;
                loop {
                    if self.message_count() >= expected {
                        return Ok(());
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Err(StepError::TimedOut {
                            message: format!(
                                "expected {expected} messages within {}, got {}",
                                humantime::format_duration(timeout),
                                self.message_count()
                            ),
                        });
                    }
                    tokio::time::sleep(RECEIVE_POLL).await;
                }
            }
            action::NOT_RECEIVE_WITHIN => {
                let timeout = args.duration(0)?;
                let before = self.message_count();
                tokio::time::sleep(timeout).await;
                let after = self.message_count();
                if after > before {
                    Err(StepError::assertion(format!(
                        "expected no messages, received {}",
                        after - before
                    )))
                } else {
                    Ok(())
                }
            }
            action::LAST_IS => {
                let expected = args.docstring()?.trim().to_owned();
                let last = self.last_message()?;
                if last.trim() == expected {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "message mismatch:\nexpected: {expected}\nactual: {last}"
                    )))
                }
            }
            action::LAST_CONTAINS => {
                let needle = args.string(0)?;
                let last = self.last_message()?;
                if last.contains(needle) {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "last message \"{last}\" does not contain \"{needle}\""
                    )))
                }
            }
            action::LAST_JSON_MATCHES => {
                let expected: serde_json::Value = serde_json::from_str(args.docstring()?)
                    .map_err(|e| StepError::assertion(format!("invalid expected JSON: {e}")))?;
                let last = self.last_message()?;
                let actual: serde_json::Value = serde_json::from_str(&last)
                    .map_err(|e| StepError::assertion(format!("last message is not JSON: {e}")))?;
                compare::json_matches(&expected, &actual)
            }
            action::RECEIVED_COUNT => {
                let expected = args.int(0)?;
                let count = self.message_count();
                if count as i64 == expected {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "expected {expected} messages, got {count}"
                    )))
                }
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
            super::super::stepdef::compile_pattern(step.pattern, "ws")
                .expect("websocket client pattern compiles");
        }
    }
}
