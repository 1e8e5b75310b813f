//! Mock WebSocket server resource handler.
//!
//! Accepts connections on an OS-assigned (or configured) port, tracks the
//! active connection set, and applies configurable behaviours: a message
//! sent on connect, and reply rules keyed on exact text or a regex. Steps
//! can also broadcast to every client and assert on received messages.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use regex::Regex;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{CleanupError, InfraError, StepError};

use super::stepdef::{StepArgs, StepCategory, StepDef};
use super::{Handler, HandlerDeps};
use crate::config::ResourceSpec;

mod action {
    pub const ON_CONNECT_SENDS: &str = "on-connect-sends";
    pub const ON_MESSAGE_REPLIES: &str = "on-message-replies";
    pub const ON_MESSAGE_MATCHING_REPLIES: &str = "on-message-matching-replies";
    pub const BROADCAST_DOCSTRING: &str = "broadcast-docstring";
    pub const BROADCAST_TEXT: &str = "broadcast-text";
    pub const CONNECTION_COUNT: &str = "connection-count";
    pub const RECEIVED_MESSAGE: &str = "received-message";
    pub const RECEIVED_COUNT: &str = "received-count";
}

/// The WebSocket server step vocabulary.
pub(super) fn vocabulary() -> StepCategory {
    StepCategory {
        name: "WebSocket Server",
        description: "Steps for stubbing WebSocket services",
        steps: vec![
            StepDef {
                group: "Setup",
                pattern: r#"^"{resource}" on connect sends:$"#,
                description: "Sends a message to each client on connect",
                example: "\"{resource}\" on connect sends:\n  \"\"\"\n  {\"type\": \"welcome\"}\n  \"\"\"",
                action: action::ON_CONNECT_SENDS,
            },
            StepDef {
                group: "Setup",
                pattern: r#"^"{resource}" on message "([^"]*)" replies:$"#,
                description: "Replies to an exact message",
                example: "\"{resource}\" on message \"ping\" replies:\n  \"\"\"\n  pong\n  \"\"\"",
                action: action::ON_MESSAGE_REPLIES,
            },
            StepDef {
                group: "Setup",
                pattern: r#"^"{resource}" on message matching "([^"]*)" replies:$"#,
                description: "Replies to messages matching a regex",
                example: "\"{resource}\" on message matching \".*subscribe.*\" replies:\n  \"\"\"\n  {\"status\": \"subscribed\"}\n  \"\"\"",
                action: action::ON_MESSAGE_MATCHING_REPLIES,
            },
            StepDef {
                group: "Broadcast",
                pattern: r#"^"{resource}" broadcasts:$"#,
                description: "Broadcasts a docstring to all clients",
                example: "\"{resource}\" broadcasts:\n  \"\"\"\n  {\"event\": \"update\"}\n  \"\"\"",
                action: action::BROADCAST_DOCSTRING,
            },
            StepDef {
                group: "Broadcast",
                pattern: r#"^"{resource}" broadcasts "([^"]*)"$"#,
                description: "Broadcasts a short message to all clients",
                example: "\"{resource}\" broadcasts \"ping\"",
                action: action::BROADCAST_TEXT,
            },
            StepDef {
                group: "Assertions",
                pattern: r#"^"{resource}" has "(\d+)" connections$"#,
                description: "Asserts the number of connected clients",
                example: "\"{resource}\" has \"2\" connections",
                action: action::CONNECTION_COUNT,
            },
            StepDef {
                group: "Assertions",
                pattern: r#"^"{resource}" received message "([^"]*)"$"#,
                description: "Asserts a specific message was received",
                example: "\"{resource}\" received message \"ping\"",
                action: action::RECEIVED_MESSAGE,
            },
            StepDef {
                group: "Assertions",
                pattern: r#"^"{resource}" received "(\d+)" messages$"#,
                description: "Asserts the total number of received messages",
                example: "\"{resource}\" received \"3\" messages",
                action: action::RECEIVED_COUNT,
            },
        ],
    }
}

/// One reply rule: exact text or regex, plus the canned response.
struct MessageRule {
    exact: Option<String>,
    pattern: Option<Regex>,
    reply: String,
}

#[derive(Default)]
struct ServerState {
    on_connect: Option<String>,
    rules: Vec<MessageRule>,
    received: Vec<String>,
    /// Sender handles for every active connection, for broadcast.
    connections: Vec<mpsc::UnboundedSender<String>>,
}

impl ServerState {
    fn prune_closed(&mut self) {
        self.connections.retain(|sender| !sender.is_closed());
    }
}

/// Handler for one declared `websocket-server` resource.
pub struct WebSocketServer {
    name: String,
    spec: ResourceSpec,
    deps: HandlerDeps,
    state: Arc<Mutex<ServerState>>,
    port: u16,
    accept_stop: Option<CancellationToken>,
}

impl WebSocketServer {
    /// Create the handler; the listener is bound in `init`.
    #[must_use]
    pub fn new(name: String, spec: ResourceSpec, deps: HandlerDeps) -> Self {
        Self {
            name,
            spec,
            deps,
            state: Arc::new(Mutex::new(ServerState::default())),
            port: 0,
            accept_stop: None,
        }
    }

    /// The mock server's URL.
    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://localhost:{}", self.port)
    }

    fn broadcast(&self, message: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.prune_closed();
            for sender in &state.connections {
                let _ = sender.send(String::from(message));
            }
        }
    }
}

/// Per-connection task: forward queued outbound messages, record inbound
/// text, and apply reply rules.
async fn serve_connection(
    stream: tokio::net::TcpStream,
    state: Arc<Mutex<ServerState>>,
    stop: CancellationToken,
) {
    let Ok(websocket) = accept_async(stream).await else {
        return;
    };
    let (mut sink, mut reader) = websocket.split();

    let (sender, mut outbound) = mpsc::unbounded_channel::<String>();
    {
        let Ok(mut state) = state.lock() else { return };
        if let Some(greeting) = state.on_connect.clone() {
            let _ = sender.send(greeting);
        }
        state.connections.push(sender);
    }

    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            queued = outbound.recv() => match queued {
                Some(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            frame = reader.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let reply = {
                        let Ok(mut state) = state.lock() else { break };
                        state.received.push(text.clone());
                        state.rules.iter().find_map(|rule| {
                            let matched = rule
                                .exact
                                .as_deref()
                                .is_some_and(|exact| exact == text)
                                || rule
                                    .pattern
                                    .as_ref()
                                    .is_some_and(|pattern| pattern.is_match(&text));
                            matched.then(|| rule.reply.clone())
                        })
                    };
                    if let Some(reply) = reply
                        && sink.send(Message::Text(reply)).await.is_err()
                    {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

#[async_trait]
impl Handler for WebSocketServer {
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

        let stop = self.deps.cancel.child_token();
        self.accept_stop = Some(stop.clone());

        let state = Arc::clone(&self.state);
        let name = self.name.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            tokio::spawn(serve_connection(
                                stream,
                                Arc::clone(&state),
                                stop.clone(),
                            ));
                        }
                        Err(error) => {
                            debug!(handler = %name, %error, "accept failed");
                            break;
                        }
                    },
                }
            }
        });

        Ok(())
    }

    async fn ready(&mut self) -> Result<(), InfraError> {
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), InfraError> {
        if let Ok(mut state) = self.state.lock() {
            // Dropping the senders closes every per-connection task's queue.
            state.connections.clear();
            state.rules.clear();
            state.on_connect = None;
            state.received.clear();
        }
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<(), CleanupError> {
        if let Some(stop) = self.accept_stop.take() {
            stop.cancel();
        }
        if let Ok(mut state) = self.state.lock() {
            state.connections.clear();
        }
        Ok(())
    }

    fn steps(&self) -> StepCategory {
        vocabulary()
    }

    async fn run_step(&mut self, action: &str, args: &StepArgs) -> Result<(), StepError> {
        match action {
            action::ON_CONNECT_SENDS => {
                let message = args.docstring()?.to_owned();
                if let Ok(mut state) = self.state.lock() {
                    state.on_connect = Some(message);
                }
                Ok(())
            }
            action::ON_MESSAGE_REPLIES => {
                let exact = args.string(0)?.to_owned();
                let reply = args.docstring()?.to_owned();
                if let Ok(mut state) = self.state.lock() {
                    state.rules.push(MessageRule {
                        exact: Some(exact),
                        pattern: None,
                        reply,
                    });
                }
                Ok(())
            }
            action::ON_MESSAGE_MATCHING_REPLIES => {
                let pattern = Regex::new(args.string(0)?)
                    .map_err(|e| StepError::assertion(format!("invalid regex pattern: {e}")))?;
                let reply = args.docstring()?.to_owned();
                if let Ok(mut state) = self.state.lock() {
                    state.rules.push(MessageRule {
                        exact: None,
                        pattern: Some(pattern),
                        reply,
                    });
                }
                Ok(())
            }
            action::BROADCAST_DOCSTRING => {
                self.broadcast(args.docstring()?);
                Ok(())
            }
            action::BROADCAST_TEXT => {
                self.broadcast(args.string(0)?);
                Ok(())
            }
            action::CONNECTION_COUNT => {
                let expected = args.int(0)?;
                let count = self.state.lock().map_or(0, |mut state| {
                    state.prune_closed();
                    state.connections.len()
                });
                if count as i64 == expected {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "expected {expected} connections, got {count}"
                    )))
                }
            }
            action::RECEIVED_MESSAGE => {
                let expected = args.string(0)?;
                let found = self.state.lock().is_ok_and(|state| {
                    state.received.iter().any(|message| message == expected)
                });
                if found {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "message \"{expected}\" was not received"
                    )))
                }
            }
            action::RECEIVED_COUNT => {
                let expected = args.int(0)?;
                let count = self.state.lock().map_or(0, |state| state.received.len());
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
            super::super::stepdef::compile_pattern(step.pattern, "ws-mock")
                .expect("websocket server pattern compiles");
        }
    }
}
