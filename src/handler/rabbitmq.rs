//! RabbitMQ message broker resource handler.
//!
//! Topology steps declare queues and exchanges and bind them; publishing
//! steps send text or JSON to queues (default exchange) or named exchanges
//! with routing keys; consuming steps run background consumers per queue,
//! buffering deliveries for the assertion steps. `reset` stops consumers,
//! clears buffers, and purges the queues named in the resource's `queues`
//! option (strategy `none` skips the purge).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions, QueuePurgeOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{CleanupError, InfraError, StepError};

use super::stepdef::{StepArgs, StepCategory, StepDef};
use super::{Handler, HandlerDeps, MessageConsumer, MessagePublisher};
use crate::config::ResourceSpec;

/// Poll interval while waiting for buffered deliveries.
const CONSUME_POLL: Duration = Duration::from_millis(100);

mod action {
    pub const DECLARE_QUEUE: &str = "declare-queue";
    pub const DECLARE_DURABLE_QUEUE: &str = "declare-durable-queue";
    pub const QUEUE_EXISTS: &str = "queue-exists";
    pub const PURGE_QUEUE: &str = "purge-queue";
    pub const DECLARE_EXCHANGE: &str = "declare-exchange";
    pub const DECLARE_DURABLE_EXCHANGE: &str = "declare-durable-exchange";
    pub const EXCHANGE_EXISTS: &str = "exchange-exists";
    pub const BIND_QUEUE: &str = "bind-queue";
    pub const BIND_QUEUE_ROUTING_KEY: &str = "bind-queue-routing-key";
    pub const PUBLISH_QUEUE: &str = "publish-queue";
    pub const PUBLISH_JSON_QUEUE: &str = "publish-json-queue";
    pub const PUBLISH_EXCHANGE: &str = "publish-exchange";
    pub const PUBLISH_JSON_EXCHANGE: &str = "publish-json-exchange";
    pub const PUBLISH_BATCH: &str = "publish-batch";
    pub const CONSUME_QUEUE: &str = "consume-queue";
    pub const RECEIVE_WITHIN: &str = "receive-within";
    pub const RECEIVE_WITHIN_MATCHING: &str = "receive-within-matching";
    pub const QUEUE_MESSAGE_COUNT: &str = "queue-message-count";
    pub const QUEUE_EMPTY: &str = "queue-empty";
    pub const LAST_CONTAINS: &str = "last-contains";
    pub const LAST_ROUTING_KEY: &str = "last-routing-key";
    pub const LAST_HAS_HEADER: &str = "last-has-header";
}

/// The RabbitMQ step vocabulary.
#[allow(clippy::too_many_lines, reason = "one entry per vocabulary step")]
pub(super) fn vocabulary() -> StepCategory {
    StepCategory {
        name: "RabbitMQ",
        description: "Steps for interacting with RabbitMQ message brokers",
        steps: vec![
            StepDef {
                group: "Topology",
                pattern: r#"^"{resource}" declares queue "([^"]*)"$"#,
                description: "Declares a transient queue",
                example: "\"{resource}\" declares queue \"orders\"",
                action: action::DECLARE_QUEUE,
            },
            StepDef {
                group: "Topology",
                pattern: r#"^"{resource}" declares durable queue "([^"]*)"$"#,
                description: "Declares a durable queue",
                example: "\"{resource}\" declares durable queue \"orders\"",
                action: action::DECLARE_DURABLE_QUEUE,
            },
            StepDef {
                group: "Topology",
                pattern: r#"^"{resource}" queue "([^"]*)" exists$"#,
                description: "Asserts a queue exists",
                example: "\"{resource}\" queue \"orders\" exists",
                action: action::QUEUE_EXISTS,
            },
            StepDef {
                group: "Topology",
                pattern: r#"^"{resource}" purges queue "([^"]*)"$"#,
                description: "Removes all messages from a queue",
                example: "\"{resource}\" purges queue \"orders\"",
                action: action::PURGE_QUEUE,
            },
            StepDef {
                group: "Topology",
                pattern: r#"^"{resource}" declares exchange "([^"]*)" of type "([^"]*)"$"#,
                description: "Declares a transient exchange",
                example: "\"{resource}\" declares exchange \"events\" of type \"topic\"",
                action: action::DECLARE_EXCHANGE,
            },
            StepDef {
                group: "Topology",
                pattern: r#"^"{resource}" declares durable exchange "([^"]*)" of type "([^"]*)"$"#,
                description: "Declares a durable exchange",
                example: "\"{resource}\" declares durable exchange \"events\" of type \"topic\"",
                action: action::DECLARE_DURABLE_EXCHANGE,
            },
            StepDef {
                group: "Topology",
                pattern: r#"^"{resource}" exchange "([^"]*)" exists$"#,
                description: "Asserts an exchange exists",
                example: "\"{resource}\" exchange \"events\" exists",
                action: action::EXCHANGE_EXISTS,
            },
            StepDef {
                group: "Topology",
                pattern: r#"^"{resource}" binds queue "([^"]*)" to exchange "([^"]*)"$"#,
                description: "Binds a queue to an exchange",
                example: "\"{resource}\" binds queue \"orders\" to exchange \"events\"",
                action: action::BIND_QUEUE,
            },
            StepDef {
                group: "Topology",
                pattern: r#"^"{resource}" binds queue "([^"]*)" to exchange "([^"]*)" with routing key "([^"]*)"$"#,
                description: "Binds a queue to an exchange with a routing key",
                example: "\"{resource}\" binds queue \"orders\" to exchange \"events\" with routing key \"order.*\"",
                action: action::BIND_QUEUE_ROUTING_KEY,
            },
            StepDef {
                group: "Publishing",
                pattern: r#"^"{resource}" publishes to queue "([^"]*)":$"#,
                description: "Publishes a text message to a queue",
                example: "\"{resource}\" publishes to queue \"orders\":\n  \"\"\"\n  hello\n  \"\"\"",
                action: action::PUBLISH_QUEUE,
            },
            StepDef {
                group: "Publishing",
                pattern: r#"^"{resource}" publishes json to queue "([^"]*)":$"#,
                description: "Publishes a JSON message to a queue (validated)",
                example: "\"{resource}\" publishes json to queue \"orders\":\n  \"\"\"\n  {\"id\": 1}\n  \"\"\"",
                action: action::PUBLISH_JSON_QUEUE,
            },
            StepDef {
                group: "Publishing",
                pattern: r#"^"{resource}" publishes to exchange "([^"]*)" with routing key "([^"]*)":$"#,
                description: "Publishes a text message to an exchange",
                example: "\"{resource}\" publishes to exchange \"events\" with routing key \"order.created\":\n  \"\"\"\n  hello\n  \"\"\"",
                action: action::PUBLISH_EXCHANGE,
            },
            StepDef {
                group: "Publishing",
                pattern: r#"^"{resource}" publishes json to exchange "([^"]*)" with routing key "([^"]*)":$"#,
                description: "Publishes a JSON message to an exchange (validated)",
                example: "\"{resource}\" publishes json to exchange \"events\" with routing key \"order.created\":\n  \"\"\"\n  {\"id\": 1}\n  \"\"\"",
                action: action::PUBLISH_JSON_EXCHANGE,
            },
            StepDef {
                group: "Publishing",
                pattern: r#"^"{resource}" publishes messages to queue "([^"]*)":$"#,
                description: "Publishes each table row to a queue",
                example: "\"{resource}\" publishes messages to queue \"orders\":\n  | value      |\n  | {\"id\": 1} |",
                action: action::PUBLISH_BATCH,
            },
            StepDef {
                group: "Consuming",
                pattern: r#"^"{resource}" consumes from queue "([^"]*)"$"#,
                description: "Starts a background consumer for a queue",
                example: "\"{resource}\" consumes from queue \"orders\"",
                action: action::CONSUME_QUEUE,
            },
            StepDef {
                group: "Consuming",
                pattern: r#"^"{resource}" receives from queue "([^"]*)" within "([^"]*)"$"#,
                description: "Waits for any delivery within a timeout",
                example: "\"{resource}\" receives from queue \"orders\" within \"5s\"",
                action: action::RECEIVE_WITHIN,
            },
            StepDef {
                group: "Consuming",
                pattern: r#"^"{resource}" receives from queue "([^"]*)" within "([^"]*)":$"#,
                description: "Asserts a specific delivery arrives within a timeout",
                example: "\"{resource}\" receives from queue \"orders\" within \"5s\":\n  \"\"\"\n  hello\n  \"\"\"",
                action: action::RECEIVE_WITHIN_MATCHING,
            },
            StepDef {
                group: "Assertions",
                pattern: r#"^"{resource}" queue "([^"]*)" has "(\d+)" messages$"#,
                description: "Asserts the consumed delivery count for a queue",
                example: "\"{resource}\" queue \"orders\" has \"2\" messages",
                action: action::QUEUE_MESSAGE_COUNT,
            },
            StepDef {
                group: "Assertions",
                pattern: r#"^"{resource}" queue "([^"]*)" is empty$"#,
                description: "Asserts no deliveries were consumed from a queue",
                example: "\"{resource}\" queue \"orders\" is empty",
                action: action::QUEUE_EMPTY,
            },
            StepDef {
                group: "Assertions",
                pattern: r#"^"{resource}" last message contains:$"#,
                description: "Asserts the last delivery contains content",
                example: "\"{resource}\" last message contains:\n  \"\"\"\n  created\n  \"\"\"",
                action: action::LAST_CONTAINS,
            },
            StepDef {
                group: "Assertions",
                pattern: r#"^"{resource}" last message has routing key "([^"]*)"$"#,
                description: "Asserts the last delivery's routing key",
                example: "\"{resource}\" last message has routing key \"order.created\"",
                action: action::LAST_ROUTING_KEY,
            },
            StepDef {
                group: "Assertions",
                pattern: r#"^"{resource}" last message has header "([^"]*)" with value "([^"]*)"$"#,
                description: "Asserts a header on the last delivery",
                example: "\"{resource}\" last message has header \"content-type\" with value \"application/json\"",
                action: action::LAST_HAS_HEADER,
            },
        ],
    }
}

/// One delivery captured by a background consumer.
#[derive(Debug, Clone)]
struct ReceivedDelivery {
    payload: Vec<u8>,
    routing_key: String,
    headers: Vec<(String, String)>,
}

impl ReceivedDelivery {
    fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[derive(Default)]
struct Buffers {
    deliveries: HashMap<String, Vec<ReceivedDelivery>>,
    last: Option<ReceivedDelivery>,
}

/// Handler for one declared `rabbitmq` resource.
pub struct RabbitMq {
    name: String,
    spec: ResourceSpec,
    deps: HandlerDeps,
    connection: Option<Connection>,
    channel: Option<Channel>,
    buffers: Arc<Mutex<Buffers>>,
    consumers: HashMap<String, CancellationToken>,
}

impl RabbitMq {
    /// Create the handler; the connection is established in `init`.
    #[must_use]
    pub fn new(name: String, spec: ResourceSpec, deps: HandlerDeps) -> Self {
        Self {
            name,
            spec,
            deps,
            connection: None,
            channel: None,
            buffers: Arc::new(Mutex::new(Buffers::default())),
            consumers: HashMap::new(),
        }
    }

    fn channel(&self) -> Result<&Channel, StepError> {
        self.channel
            .as_ref()
            .ok_or_else(|| StepError::backend(format!("handler '{}' is not connected", self.name)))
    }

    async fn uri(&self) -> Result<String, InfraError> {
        if let Some(url) = self.spec.opt_str("url") {
            return Ok(String::from(url));
        }

        let container = self.spec.container.as_deref().ok_or_else(|| {
            InfraError::HandlerInitFailed {
                handler: self.name.clone(),
                message: String::from("rabbitmq resource needs a container or a url option"),
            }
        })?;
        let host = self.deps.orchestrator.host(container)?;
        let port = self.deps.orchestrator.port(container, "5672/tcp").await?;
        let user = self.spec.opt_str("user").unwrap_or("guest");
        let password = self.spec.opt_str("password").unwrap_or("guest");
        Ok(format!("amqp://{user}:{password}@{host}:{port}/%2f"))
    }

    /// Passive declares close their channel on failure, so existence checks
    /// run on a throwaway channel.
    async fn passive_queue_check(&self, queue: &str) -> Result<bool, StepError> {
        let connection = self.connection.as_ref().ok_or_else(|| {
            StepError::backend(format!("handler '{}' is not connected", self.name))
        })?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| StepError::backend(format!("opening channel: {e}")))?;
        let options = QueueDeclareOptions {
            passive: true,
            ..QueueDeclareOptions::default()
        };
        Ok(channel
            .queue_declare(queue, options, FieldTable::default())
            .await
            .is_ok())
    }

    async fn passive_exchange_check(&self, exchange: &str) -> Result<bool, StepError> {
        let connection = self.connection.as_ref().ok_or_else(|| {
            StepError::backend(format!("handler '{}' is not connected", self.name))
        })?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| StepError::backend(format!("opening channel: {e}")))?;
        let options = ExchangeDeclareOptions {
            passive: true,
            ..ExchangeDeclareOptions::default()
        };
        Ok(channel
            .exchange_declare(
                exchange,
                ExchangeKind::Direct,
                options,
                FieldTable::default(),
            )
            .await
            .is_ok())
    }

    async fn publish_message(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), StepError> {
        self.channel()?
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| StepError::backend(format!("publishing: {e}")))?
            .await
            .map(|_| ())
            .map_err(|e| StepError::backend(format!("publish confirmation: {e}")))
    }

    async fn start_consumer(&mut self, queue: &str) -> Result<(), StepError> {
        if self.consumers.contains_key(queue) {
            return Ok(());
        }

        let connection = self.connection.as_ref().ok_or_else(|| {
            StepError::backend(format!("handler '{}' is not connected", self.name))
        })?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| StepError::backend(format!("opening consumer channel: {e}")))?;

        let options = BasicConsumeOptions {
            no_ack: true,
            ..BasicConsumeOptions::default()
        };
        let mut consumer = channel
            .basic_consume(
                queue,
                &format!("tomato-{}-{queue}", self.name),
                options,
                FieldTable::default(),
            )
            .await
            .map_err(|e| StepError::backend(format!("consuming from {queue}: {e}")))?;

        let stop = self.deps.cancel.child_token();
        self.consumers.insert(String::from(queue), stop.clone());

        let buffers = Arc::clone(&self.buffers);
        let queue_name = String::from(queue);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    delivery = consumer.next() => match delivery {
                        Some(Ok(delivery)) => {
                            let captured = ReceivedDelivery {
                                payload: delivery.data.clone(),
                                routing_key: delivery.routing_key.to_string(),
                                headers: extract_headers(delivery.properties.headers().as_ref()),
                            };
                            if let Ok(mut buffers) = buffers.lock() {
                                buffers
                                    .deliveries
                                    .entry(queue_name.clone())
                                    .or_default()
                                    .push(captured.clone());
                                buffers.last = Some(captured);
                            }
                        }
                        Some(Err(error)) => {
                            debug!(queue = %queue_name, %error, "consumer delivery error");
                        }
                        None => break,
                    },
                }
            }
        });

        Ok(())
    }

    fn stop_all_consumers(&mut self) {
        for (_, stop) in self.consumers.drain() {
            stop.cancel();
        }
    }

    fn delivery_count(&self, queue: &str) -> usize {
        self.buffers.lock().map_or(0, |buffers| {
            buffers.deliveries.get(queue).map_or(0, Vec::len)
        })
    }

    fn last_delivery(&self) -> Result<ReceivedDelivery, StepError> {
        self.buffers
            .lock()
            .ok()
            .and_then(|buffers| buffers.last.clone())
            .ok_or_else(|| StepError::assertion("no message received"))
    }

    async fn wait_for_delivery(
        &mut self,
        queue: &str,
        timeout: Duration,
    ) -> Result<(), StepError> {
        self.start_consumer(queue).await?;

        let already = self.delivery_count(queue);
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.delivery_count(queue) > already {
                return Ok(());
            }
            tokio::time::sleep(CONSUME_POLL).await;
        }
        Err(StepError::TimedOut {
            message: format!(
                "no message received from queue \"{queue}\" within {}",
                humantime::format_duration(timeout)
            ),
        })
    }
}

fn extract_headers(headers: Option<&FieldTable>) -> Vec<(String, String)> {
    headers
        .map(|table| {
            table
                .inner()
                .iter()
                .map(|(key, value)| (key.to_string(), amqp_value_text(value)))
                .collect()
        })
        .unwrap_or_default()
}

fn amqp_value_text(value: &lapin::types::AMQPValue) -> String {
    use lapin::types::AMQPValue;
    match value {
        AMQPValue::LongString(text) => text.to_string(),
        AMQPValue::ShortString(text) => text.to_string(),
        AMQPValue::Boolean(flag) => flag.to_string(),
        AMQPValue::LongInt(number) => number.to_string(),
        AMQPValue::LongLongInt(number) => number.to_string(),
        other => format!("{other:?}"),
    }
}

fn exchange_kind(kind: &str) -> ExchangeKind {
    match kind {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "topic" => ExchangeKind::Topic,
        "headers" => ExchangeKind::Headers,
        other => ExchangeKind::Custom(String::from(other).into()),
    }
}

#[async_trait]
impl Handler for RabbitMq {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&mut self) -> Result<(), InfraError> {
        let uri = self.uri().await?;
        let init_failed = |message: String| InfraError::HandlerInitFailed {
            handler: self.name.clone(),
            message,
        };

        let connection = Connection::connect(&uri, ConnectionProperties::default())
            .await
            .map_err(|e| init_failed(format!("connecting to rabbitmq: {e}")))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| init_failed(format!("opening channel: {e}")))?;

        self.connection = Some(connection);
        self.channel = Some(channel);
        Ok(())
    }

    async fn ready(&mut self) -> Result<(), InfraError> {
        let connected = self
            .connection
            .as_ref()
            .is_some_and(|connection| connection.status().connected());
        if connected {
            Ok(())
        } else {
            Err(InfraError::HandlerInitFailed {
                handler: self.name.clone(),
                message: String::from("connection is not open"),
            })
        }
    }

    async fn reset(&mut self) -> Result<(), InfraError> {
        self.stop_all_consumers();

        if let Ok(mut buffers) = self.buffers.lock() {
            buffers.deliveries.clear();
            buffers.last = None;
        }

        if matches!(self.spec.opt_str("reset_strategy"), Some("none")) {
            return Ok(());
        }

        let queues = self.spec.opt_str_list("queues");
        let Some(channel) = self.channel.as_ref() else {
            return Ok(());
        };
        for queue in queues {
            if let Err(error) = channel
                .queue_purge(&queue, QueuePurgeOptions::default())
                .await
            {
                warn!(queue = %queue, %error, "failed to purge queue during reset");
            }
        }
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<(), CleanupError> {
        self.stop_all_consumers();
        self.channel = None;
        if let Some(connection) = self.connection.take() {
            if let Err(error) = connection.close(200, "tomato run finished").await {
                return Err(CleanupError::HandlerFailed {
                    handler: self.name.clone(),
                    message: error.to_string(),
                });
            }
        }
        Ok(())
    }

    fn steps(&self) -> StepCategory {
        vocabulary()
    }

    #[allow(clippy::too_many_lines, reason = "one arm per vocabulary entry")]
    async fn run_step(&mut self, action: &str, args: &StepArgs) -> Result<(), StepError> {
        match action {
            action::DECLARE_QUEUE | action::DECLARE_DURABLE_QUEUE => {
                let queue = args.string(0)?;
                let options = QueueDeclareOptions {
                    durable: action == action::DECLARE_DURABLE_QUEUE,
                    ..QueueDeclareOptions::default()
                };
                self.channel()?
                    .queue_declare(queue, options, FieldTable::default())
                    .await
                    .map(|_| ())
                    .map_err(|e| StepError::backend(format!("declaring queue {queue}: {e}")))
            }
            action::QUEUE_EXISTS => {
                let queue = args.string(0)?;
                if self.passive_queue_check(queue).await? {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "queue \"{queue}\" does not exist"
                    )))
                }
            }
            action::PURGE_QUEUE => {
                let queue = args.string(0)?;
                self.channel()?
                    .queue_purge(queue, QueuePurgeOptions::default())
                    .await
                    .map(|_| ())
                    .map_err(|e| StepError::backend(format!("purging queue {queue}: {e}")))
            }
            action::DECLARE_EXCHANGE | action::DECLARE_DURABLE_EXCHANGE => {
                let (exchange, kind) = (args.string(0)?, args.string(1)?);
                let options = ExchangeDeclareOptions {
                    durable: action == action::DECLARE_DURABLE_EXCHANGE,
                    ..ExchangeDeclareOptions::default()
                };
                self.channel()?
                    .exchange_declare(exchange, exchange_kind(kind), options, FieldTable::default())
                    .await
                    .map(|_| ())
                    .map_err(|e| {
                        StepError::backend(format!("declaring exchange {exchange}: {e}"))
                    })
            }
            action::EXCHANGE_EXISTS => {
                let exchange = args.string(0)?;
                if self.passive_exchange_check(exchange).await? {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "exchange \"{exchange}\" does not exist"
                    )))
                }
            }
            action::BIND_QUEUE | action::BIND_QUEUE_ROUTING_KEY => {
                let (queue, exchange) = (args.string(0)?, args.string(1)?);
                let routing_key = if action == action::BIND_QUEUE_ROUTING_KEY {
                    args.string(2)?
                } else {
                    ""
                };
                self.channel()?
                    .queue_bind(
                        queue,
                        exchange,
                        routing_key,
                        QueueBindOptions::default(),
                        FieldTable::default(),
                    )
                    .await
                    .map(|_| ())
                    .map_err(|e| {
                        StepError::backend(format!(
                            "binding queue {queue} to exchange {exchange}: {e}"
                        ))
                    })
            }
            action::PUBLISH_QUEUE => {
                let queue = args.string(0)?;
                let payload = args.docstring()?.as_bytes();
                self.publish_message("", queue, payload, BasicProperties::default())
                    .await
            }
            action::PUBLISH_JSON_QUEUE => {
                let queue = args.string(0)?;
                let doc = args.docstring()?;
                serde_json::from_str::<serde_json::Value>(doc)
                    .map_err(|e| StepError::assertion(format!("invalid JSON: {e}")))?;
                let properties =
                    BasicProperties::default().with_content_type("application/json".into());
                self.publish_message("", queue, doc.as_bytes(), properties)
                    .await
            }
            action::PUBLISH_EXCHANGE => {
                let (exchange, routing_key) = (args.string(0)?, args.string(1)?);
                let payload = args.docstring()?.as_bytes();
                self.publish_message(exchange, routing_key, payload, BasicProperties::default())
                    .await
            }
            action::PUBLISH_JSON_EXCHANGE => {
                let (exchange, routing_key) = (args.string(0)?, args.string(1)?);
                let doc = args.docstring()?;
                serde_json::from_str::<serde_json::Value>(doc)
                    .map_err(|e| StepError::assertion(format!("invalid JSON: {e}")))?;
                let properties =
                    BasicProperties::default().with_content_type("application/json".into());
                self.publish_message(exchange, routing_key, doc.as_bytes(), properties)
                    .await
            }
            action::PUBLISH_BATCH => {
                let queue = args.string(0)?.to_owned();
                let table = args.table()?.clone();
                if !table.has_data() {
                    return Err(StepError::assertion(
                        "table must have headers and at least one data row",
                    ));
                }
                let value_column = table
                    .column_index("value")
                    .or_else(|| table.column_index("message"))
                    .or_else(|| table.column_index("payload"))
                    .ok_or_else(|| {
                        StepError::assertion("table must have a 'value' or 'message' column")
                    })?;

                for row in table.data_rows() {
                    let value = row.get(value_column).cloned().unwrap_or_default();
                    self.publish_message("", &queue, value.as_bytes(), BasicProperties::default())
                        .await?;
                }
                Ok(())
            }
            action::CONSUME_QUEUE => self.start_consumer(args.string(0)?).await,
            action::RECEIVE_WITHIN => {
                let queue = args.string(0)?.to_owned();
                let timeout = args.duration(1)?;
                self.wait_for_delivery(&queue, timeout).await
            }
            action::RECEIVE_WITHIN_MATCHING => {
                let queue = args.string(0)?.to_owned();
                let timeout = args.duration(1)?;
                let expected = args.docstring()?.trim().to_owned();

                self.wait_for_delivery(&queue, timeout).await?;
                let last = self.last_delivery()?;
                let actual = last.payload_text();
                if actual.trim() == expected {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "message mismatch:\nexpected: {expected}\nactual: {actual}"
                    )))
                }
            }
            action::QUEUE_MESSAGE_COUNT => {
                let queue = args.string(0)?;
                let expected = args.int(1)?;
                let count = self.delivery_count(queue);
                if count as i64 == expected {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "queue \"{queue}\": expected {expected} messages, got {count}"
                    )))
                }
            }
            action::QUEUE_EMPTY => {
                let queue = args.string(0)?;
                let count = self.delivery_count(queue);
                if count == 0 {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "queue \"{queue}\": expected 0 messages, got {count}"
                    )))
                }
            }
            action::LAST_CONTAINS => {
                let expected = args.docstring()?.trim().to_owned();
                let last = self.last_delivery()?;
                let actual = last.payload_text();
                if actual.contains(&expected) {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "message does not contain expected content:\nexpected to contain: {expected}\nactual: {actual}"
                    )))
                }
            }
            action::LAST_ROUTING_KEY => {
                let expected = args.string(0)?;
                let last = self.last_delivery()?;
                if last.routing_key == expected {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "expected routing key \"{expected}\", got \"{}\"",
                        last.routing_key
                    )))
                }
            }
            action::LAST_HAS_HEADER => {
                let (header, expected) = (args.string(0)?, args.string(1)?);
                let last = self.last_delivery()?;
                match last
                    .headers
                    .iter()
                    .find(|(name, _)| name == header)
                    .map(|(_, value)| value.as_str())
                {
                    Some(actual) if actual == expected => Ok(()),
                    Some(actual) => Err(StepError::assertion(format!(
                        "header \"{header}\": expected \"{expected}\", got \"{actual}\""
                    ))),
                    None => Err(StepError::assertion(format!(
                        "header \"{header}\" not found"
                    ))),
                }
            }
            other => Err(StepError::UnknownAction {
                handler: self.name.clone(),
                action: String::from(other),
            }),
        }
    }

    fn as_message_publisher(&self) -> Option<&dyn MessagePublisher> {
        Some(self)
    }

    fn as_message_consumer(&self) -> Option<&dyn MessageConsumer> {
        Some(self)
    }
}

impl MessageConsumer for RabbitMq {
    fn buffered(&self, target: &str) -> usize {
        self.delivery_count(target)
    }

    fn last_payload(&self) -> Option<Vec<u8>> {
        self.buffers
            .lock()
            .ok()
            .and_then(|buffers| buffers.last.as_ref().map(|delivery| delivery.payload.clone()))
    }
}

#[async_trait]
impl MessagePublisher for RabbitMq {
    async fn publish(
        &self,
        target: &str,
        payload: &[u8],
        headers: &BTreeMap<String, String>,
    ) -> Result<(), StepError> {
        let mut table = FieldTable::default();
        for (key, value) in headers {
            table.insert(
                key.as_str().into(),
                lapin::types::AMQPValue::LongString(value.as_str().into()),
            );
        }
        let properties = BasicProperties::default().with_headers(table);
        self.publish_message("", target, payload, properties).await
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
            super::super::stepdef::compile_pattern(step.pattern, "broker")
                .expect("rabbitmq pattern compiles");
        }
    }

    #[rstest]
    fn exchange_kinds_map_from_names() {
        assert!(matches!(exchange_kind("direct"), ExchangeKind::Direct));
        assert!(matches!(exchange_kind("fanout"), ExchangeKind::Fanout));
        assert!(matches!(exchange_kind("topic"), ExchangeKind::Topic));
        assert!(matches!(exchange_kind("headers"), ExchangeKind::Headers));
        assert!(matches!(exchange_kind("x-delayed"), ExchangeKind::Custom(_)));
    }

    #[rstest]
    fn receive_pattern_with_and_without_docstring_are_distinct() {
        let bare = super::super::stepdef::compile_pattern(
            r#"^"{resource}" receives from queue "([^"]*)" within "([^"]*)"$"#,
            "broker",
        )
        .expect("pattern compiles");
        let with_doc = super::super::stepdef::compile_pattern(
            r#"^"{resource}" receives from queue "([^"]*)" within "([^"]*)":$"#,
            "broker",
        )
        .expect("pattern compiles");

        let text = r#""broker" receives from queue "orders" within "5s""#;
        assert!(bare.is_match(text));
        assert!(!with_doc.is_match(text));
        assert!(with_doc.is_match(&format!("{text}:")));
    }
}
