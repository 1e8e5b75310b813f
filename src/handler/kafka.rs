//! Kafka message broker resource handler.
//!
//! Publishing goes through one shared producer. Consuming spawns one
//! background task per topic, each appending into a mutex-guarded per-topic
//! buffer with a `last message` pointer; assertions read the buffers while
//! consumers write. `reset` stops every consumer, clears the buffers, and
//! (by default) deletes and recreates the topics named in the resource's
//! `topics` option; the `none` strategy skips broker-side cleanup.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::ClientConfig;
use rdkafka::Message;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Headers;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{CleanupError, InfraError, StepError};

use super::stepdef::{StepArgs, StepCategory, StepDef};
use super::{Handler, HandlerDeps, MessageConsumer, MessagePublisher};
use crate::config::ResourceSpec;

/// Poll interval while waiting for buffered messages.
const CONSUME_POLL: Duration = Duration::from_millis(100);

/// Producer delivery timeout.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Metadata fetch timeout for topic checks.
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause between topic delete and recreate during reset.
const RECREATE_SETTLE: Duration = Duration::from_millis(500);

mod action {
    pub const TOPIC_EXISTS: &str = "topic-exists";
    pub const CREATE_TOPIC: &str = "create-topic";
    pub const CREATE_TOPIC_PARTITIONS: &str = "create-topic-partitions";
    pub const PUBLISH: &str = "publish";
    pub const PUBLISH_WITH_KEY: &str = "publish-with-key";
    pub const PUBLISH_JSON: &str = "publish-json";
    pub const PUBLISH_JSON_WITH_KEY: &str = "publish-json-with-key";
    pub const PUBLISH_BATCH: &str = "publish-batch";
    pub const START_CONSUMING: &str = "start-consuming";
    pub const CONSUME_WITHIN: &str = "consume-within";
    pub const EXPECT_MESSAGE_WITHIN: &str = "expect-message-within";
    pub const EXPECT_KEY_WITHIN: &str = "expect-key-within";
    pub const TOPIC_MESSAGE_COUNT: &str = "topic-message-count";
    pub const TOPIC_EMPTY: &str = "topic-empty";
    pub const LAST_CONTAINS: &str = "last-contains";
    pub const LAST_HAS_KEY: &str = "last-has-key";
    pub const LAST_HAS_HEADER: &str = "last-has-header";
    pub const EXPECT_IN_ORDER: &str = "expect-in-order";
}

/// The Kafka step vocabulary.
#[allow(clippy::too_many_lines, reason = "one entry per vocabulary step")]
pub(super) fn vocabulary() -> StepCategory {
    StepCategory {
        name: "Kafka",
        description: "Steps for interacting with Apache Kafka message brokers",
        steps: vec![
            StepDef {
                group: "Topics",
                pattern: r#"^kafka topic "([^"]*)" exists on "{resource}"$"#,
                description: "Asserts a topic exists",
                example: "kafka topic \"events\" exists on \"{resource}\"",
                action: action::TOPIC_EXISTS,
            },
            StepDef {
                group: "Topics",
                pattern: r#"^I create kafka topic "([^"]*)" on "{resource}"$"#,
                description: "Creates a topic with one partition",
                example: "I create kafka topic \"events\" on \"{resource}\"",
                action: action::CREATE_TOPIC,
            },
            StepDef {
                group: "Topics",
                pattern: r#"^I create kafka topic "([^"]*)" on "{resource}" with "(\d+)" partitions$"#,
                description: "Creates a topic with N partitions",
                example: "I create kafka topic \"events\" on \"{resource}\" with \"3\" partitions",
                action: action::CREATE_TOPIC_PARTITIONS,
            },
            StepDef {
                group: "Publishing",
                pattern: r#"^I publish message to "{resource}" topic "([^"]*)":$"#,
                description: "Publishes a text message",
                example: "I publish message to \"{resource}\" topic \"events\":\n  \"\"\"\n  hello\n  \"\"\"",
                action: action::PUBLISH,
            },
            StepDef {
                group: "Publishing",
                pattern: r#"^I publish message to "{resource}" topic "([^"]*)" with key "([^"]*)":$"#,
                description: "Publishes a text message with a key",
                example: "I publish message to \"{resource}\" topic \"events\" with key \"user-1\":\n  \"\"\"\n  hello\n  \"\"\"",
                action: action::PUBLISH_WITH_KEY,
            },
            StepDef {
                group: "Publishing",
                pattern: r#"^I publish JSON to "{resource}" topic "([^"]*)":$"#,
                description: "Publishes a JSON message (validated)",
                example: "I publish JSON to \"{resource}\" topic \"events\":\n  \"\"\"\n  {\"type\": \"created\"}\n  \"\"\"",
                action: action::PUBLISH_JSON,
            },
            StepDef {
                group: "Publishing",
                pattern: r#"^I publish JSON to "{resource}" topic "([^"]*)" with key "([^"]*)":$"#,
                description: "Publishes a JSON message with a key",
                example: "I publish JSON to \"{resource}\" topic \"events\" with key \"user-1\":\n  \"\"\"\n  {\"type\": \"created\"}\n  \"\"\"",
                action: action::PUBLISH_JSON_WITH_KEY,
            },
            StepDef {
                group: "Publishing",
                pattern: r#"^I publish messages to "{resource}" topic "([^"]*)":$"#,
                description: "Publishes each table row (key and value columns)",
                example: "I publish messages to \"{resource}\" topic \"events\":\n  | key    | value      |\n  | user-1 | {\"id\": 1} |",
                action: action::PUBLISH_BATCH,
            },
            StepDef {
                group: "Consuming",
                pattern: r#"^I start consuming from "{resource}" topic "([^"]*)"$"#,
                description: "Starts a background consumer for a topic",
                example: "I start consuming from \"{resource}\" topic \"events\"",
                action: action::START_CONSUMING,
            },
            StepDef {
                group: "Consuming",
                pattern: r#"^I consume message from "{resource}" topic "([^"]*)" within "([^"]*)"$"#,
                description: "Waits for any message within a timeout",
                example: "I consume message from \"{resource}\" topic \"events\" within \"5s\"",
                action: action::CONSUME_WITHIN,
            },
            StepDef {
                group: "Consuming",
                pattern: r#"^I should receive message from "{resource}" topic "([^"]*)" within "([^"]*)":$"#,
                description: "Asserts a specific message arrives within a timeout",
                example: "I should receive message from \"{resource}\" topic \"events\" within \"5s\":\n  \"\"\"\n  hello\n  \"\"\"",
                action: action::EXPECT_MESSAGE_WITHIN,
            },
            StepDef {
                group: "Consuming",
                pattern: r#"^I should receive message from "{resource}" topic "([^"]*)" with key "([^"]*)" within "([^"]*)"$"#,
                description: "Asserts a message with a key arrives within a timeout",
                example: "I should receive message from \"{resource}\" topic \"events\" with key \"user-1\" within \"5s\"",
                action: action::EXPECT_KEY_WITHIN,
            },
            StepDef {
                group: "Assertions",
                pattern: r#"^"{resource}" topic "([^"]*)" should have "(\d+)" messages$"#,
                description: "Asserts the consumed message count for a topic",
                example: "\"{resource}\" topic \"events\" should have \"3\" messages",
                action: action::TOPIC_MESSAGE_COUNT,
            },
            StepDef {
                group: "Assertions",
                pattern: r#"^"{resource}" topic "([^"]*)" should be empty$"#,
                description: "Asserts no messages were consumed from a topic",
                example: "\"{resource}\" topic \"events\" should be empty",
                action: action::TOPIC_EMPTY,
            },
            StepDef {
                group: "Assertions",
                pattern: r#"^the last message from "{resource}" should contain:$"#,
                description: "Asserts the last consumed message contains content",
                example: "the last message from \"{resource}\" should contain:\n  \"\"\"\n  created\n  \"\"\"",
                action: action::LAST_CONTAINS,
            },
            StepDef {
                group: "Assertions",
                pattern: r#"^the last message from "{resource}" should have key "([^"]*)"$"#,
                description: "Asserts the last consumed message's key",
                example: "the last message from \"{resource}\" should have key \"user-1\"",
                action: action::LAST_HAS_KEY,
            },
            StepDef {
                group: "Assertions",
                pattern: r#"^the last message from "{resource}" should have header "([^"]*)" with value "([^"]*)"$"#,
                description: "Asserts a header on the last consumed message",
                example: "the last message from \"{resource}\" should have header \"content-type\" with value \"application/json\"",
                action: action::LAST_HAS_HEADER,
            },
            StepDef {
                group: "Assertions",
                pattern: r#"^I should receive messages from "{resource}" topic "([^"]*)" in order:$"#,
                description: "Asserts buffered messages arrive in table order",
                example: "I should receive messages from \"{resource}\" topic \"events\" in order:\n  | key  | value |\n  | k1   | v1    |",
                action: action::EXPECT_IN_ORDER,
            },
        ],
    }
}

/// One message captured by a background consumer.
#[derive(Debug, Clone)]
struct ReceivedMessage {
    key: Option<String>,
    payload: Vec<u8>,
    headers: Vec<(String, String)>,
}

impl ReceivedMessage {
    fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[derive(Default)]
struct Buffers {
    messages: HashMap<String, Vec<ReceivedMessage>>,
    last: Option<ReceivedMessage>,
}

/// Handler for one declared `kafka` resource.
pub struct Kafka {
    name: String,
    spec: ResourceSpec,
    deps: HandlerDeps,
    brokers: String,
    producer: Option<FutureProducer>,
    admin: Option<AdminClient<DefaultClientContext>>,
    buffers: Arc<Mutex<Buffers>>,
    consumers: HashMap<String, CancellationToken>,
}

impl Kafka {
    /// Create the handler; clients are built in `init`.
    #[must_use]
    pub fn new(name: String, spec: ResourceSpec, deps: HandlerDeps) -> Self {
        Self {
            name,
            spec,
            deps,
            brokers: String::new(),
            producer: None,
            admin: None,
            buffers: Arc::new(Mutex::new(Buffers::default())),
            consumers: HashMap::new(),
        }
    }

    fn producer(&self) -> Result<&FutureProducer, StepError> {
        self.producer
            .as_ref()
            .ok_or_else(|| StepError::backend(format!("handler '{}' is not connected", self.name)))
    }

    fn admin(&self) -> Result<&AdminClient<DefaultClientContext>, StepError> {
        self.admin
            .as_ref()
            .ok_or_else(|| StepError::backend(format!("handler '{}' is not connected", self.name)))
    }

    async fn resolve_brokers(&self) -> Result<String, InfraError> {
        if !self.spec.brokers.is_empty() {
            return Ok(self.spec.brokers.join(","));
        }

        let container = self.spec.container.as_deref().ok_or_else(|| {
            InfraError::HandlerInitFailed {
                handler: self.name.clone(),
                message: String::from("kafka resource needs a container or a brokers list"),
            }
        })?;
        let host = self.deps.orchestrator.host(container)?;
        let port = self.deps.orchestrator.port(container, "9092/tcp").await?;
        Ok(format!("{host}:{port}"))
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.brokers);
        config
    }

    fn consumer_group(&self) -> String {
        self.spec
            .consumer_group
            .clone()
            .unwrap_or_else(|| format!("tomato-{}", self.name))
    }

    fn start_consuming(&mut self, topic: &str) -> Result<(), StepError> {
        if self.consumers.contains_key(topic) {
            return Ok(());
        }

        let consumer: StreamConsumer = self
            .client_config()
            .set("group.id", self.consumer_group())
            .set("auto.offset.reset", "latest")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| StepError::backend(format!("creating consumer: {e}")))?;
        consumer
            .subscribe(&[topic])
            .map_err(|e| StepError::backend(format!("subscribing to {topic}: {e}")))?;

        let stop = self.deps.cancel.child_token();
        self.consumers.insert(String::from(topic), stop.clone());

        let buffers = Arc::clone(&self.buffers);
        let topic_name = String::from(topic);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    received = consumer.recv() => match received {
                        Ok(message) => {
                            let captured = capture(&message);
                            if let Ok(mut buffers) = buffers.lock() {
                                buffers
                                    .messages
                                    .entry(topic_name.clone())
                                    .or_default()
                                    .push(captured.clone());
                                buffers.last = Some(captured);
                            }
                        }
                        Err(error) => {
                            debug!(topic = %topic_name, %error, "consumer receive error");
                        }
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

    fn message_count(&self, topic: &str) -> usize {
        self.buffers.lock().map_or(0, |buffers| {
            buffers.messages.get(topic).map_or(0, Vec::len)
        })
    }

    fn last_message(&self) -> Result<ReceivedMessage, StepError> {
        self.buffers
            .lock()
            .ok()
            .and_then(|buffers| buffers.last.clone())
            .ok_or_else(|| StepError::assertion("no message received"))
    }

    async fn wait_for_count(
        &mut self,
        topic: &str,
        above: usize,
        timeout: Duration,
    ) -> Result<(), StepError> {
        self.start_consuming(topic)?;

        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.message_count(topic) > above {
                return Ok(());
            }
            tokio::time::sleep(CONSUME_POLL).await;
        }
        Err(StepError::TimedOut {
            message: format!(
                "no message received from topic \"{topic}\" within {}",
                humantime::format_duration(timeout)
            ),
        })
    }

    async fn send_record(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
        headers: Option<rdkafka::message::OwnedHeaders>,
    ) -> Result<(), StepError> {
        let mut record = FutureRecord::to(topic).payload(payload);
        if let Some(key) = key {
            record = record.key(key);
        }
        if let Some(headers) = headers {
            record = record.headers(headers);
        }

        self.producer()?
            .send(record, Timeout::After(SEND_TIMEOUT))
            .await
            .map(|_| ())
            .map_err(|(error, _)| StepError::backend(format!("sending message: {error}")))
    }

    fn topic_exists(&self, topic: &str) -> Result<bool, StepError> {
        let producer = self.producer()?;
        let metadata = tokio::task::block_in_place(|| {
            producer
                .client()
                .fetch_metadata(Some(topic), Timeout::After(METADATA_TIMEOUT))
        })
        .map_err(|e| StepError::backend(format!("fetching metadata: {e}")))?;

        Ok(metadata
            .topics()
            .iter()
            .any(|entry| entry.name() == topic && !entry.partitions().is_empty()))
    }

    async fn create_topic(&self, topic: &str, partitions: i32) -> Result<(), StepError> {
        let new_topic = NewTopic::new(topic, partitions, TopicReplication::Fixed(1));
        let results = self
            .admin()?
            .create_topics(&[new_topic], &AdminOptions::new())
            .await
            .map_err(|e| StepError::backend(format!("creating topic {topic}: {e}")))?;

        for result in results {
            if let Err((name, code)) = result {
                let benign = code == rdkafka::types::RDKafkaErrorCode::TopicAlreadyExists;
                if !benign {
                    return Err(StepError::backend(format!(
                        "creating topic {name}: {code}"
                    )));
                }
            }
        }
        Ok(())
    }

    async fn recreate_topics(&self, topics: &[String]) -> Result<(), InfraError> {
        let admin = self.admin.as_ref().ok_or_else(|| {
            InfraError::HandlerInitFailed {
                handler: self.name.clone(),
                message: String::from("not initialised"),
            }
        })?;
        let reset_failed = |message: String| InfraError::HandlerInitFailed {
            handler: self.name.clone(),
            message,
        };

        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        match admin.delete_topics(&names, &AdminOptions::new()).await {
            Ok(results) => {
                for result in results {
                    if let Err((name, code)) = result {
                        let benign =
                            code == rdkafka::types::RDKafkaErrorCode::UnknownTopicOrPartition;
                        if !benign {
                            warn!(topic = %name, %code, "error deleting topic during reset");
                        }
                    }
                }
            }
            Err(error) => warn!(%error, "topic deletion failed during reset"),
        }

        tokio::time::sleep(RECREATE_SETTLE).await;

        let partitions =
            i32::try_from(self.spec.opt_i64("partitions").unwrap_or(1)).unwrap_or(1);
        let replication =
            i32::try_from(self.spec.opt_i64("replication_factor").unwrap_or(1)).unwrap_or(1);
        let new_topics: Vec<NewTopic<'_>> = topics
            .iter()
            .map(|topic| NewTopic::new(topic, partitions, TopicReplication::Fixed(replication)))
            .collect();

        let results = admin
            .create_topics(&new_topics, &AdminOptions::new())
            .await
            .map_err(|e| reset_failed(format!("recreating topics: {e}")))?;
        for result in results {
            if let Err((name, code)) = result {
                let benign = code == rdkafka::types::RDKafkaErrorCode::TopicAlreadyExists;
                if !benign {
                    return Err(reset_failed(format!("recreating topic {name}: {code}")));
                }
            }
        }
        Ok(())
    }
}

/// Extract the fields assertions need from a borrowed message.
fn capture(message: &rdkafka::message::BorrowedMessage<'_>) -> ReceivedMessage {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|header| {
                    (
                        String::from(header.key),
                        header
                            .value
                            .map(|value| String::from_utf8_lossy(value).into_owned())
                            .unwrap_or_default(),
                    )
                })
                .collect()
        })
        .unwrap_or_default();

    ReceivedMessage {
        key: message
            .key()
            .map(|key| String::from_utf8_lossy(key).into_owned()),
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        headers,
    }
}

#[async_trait]
impl Handler for Kafka {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&mut self) -> Result<(), InfraError> {
        self.brokers = self.resolve_brokers().await?;
        let init_failed = |message: String| InfraError::HandlerInitFailed {
            handler: self.name.clone(),
            message,
        };

        let producer: FutureProducer = self
            .client_config()
            .set("message.timeout.ms", "10000")
            .create()
            .map_err(|e| init_failed(format!("creating producer: {e}")))?;
        let admin: AdminClient<DefaultClientContext> = self
            .client_config()
            .create()
            .map_err(|e| init_failed(format!("creating admin client: {e}")))?;

        self.producer = Some(producer);
        self.admin = Some(admin);
        Ok(())
    }

    async fn ready(&mut self) -> Result<(), InfraError> {
        let producer = self.producer.as_ref().ok_or_else(|| {
            InfraError::HandlerInitFailed {
                handler: self.name.clone(),
                message: String::from("not initialised"),
            }
        })?;
        tokio::task::block_in_place(|| {
            producer
                .client()
                .fetch_metadata(None, Timeout::After(METADATA_TIMEOUT))
        })
        .map(|_| ())
        .map_err(|e| InfraError::HandlerInitFailed {
            handler: self.name.clone(),
            message: format!("broker metadata unavailable: {e}"),
        })
    }

    async fn reset(&mut self) -> Result<(), InfraError> {
        self.stop_all_consumers();

        if let Ok(mut buffers) = self.buffers.lock() {
            buffers.messages.clear();
            buffers.last = None;
        }

        let topics = self.spec.opt_str_list("topics");
        if topics.is_empty() {
            return Ok(());
        }

        match self.spec.opt_str("reset_strategy") {
            Some("none") => Ok(()),
            _ => self.recreate_topics(&topics).await,
        }
    }

    async fn cleanup(&mut self) -> Result<(), CleanupError> {
        self.stop_all_consumers();
        self.producer = None;
        self.admin = None;
        Ok(())
    }

    fn steps(&self) -> StepCategory {
        vocabulary()
    }

    #[allow(clippy::too_many_lines, reason = "one arm per vocabulary entry")]
    async fn run_step(&mut self, action: &str, args: &StepArgs) -> Result<(), StepError> {
        match action {
            action::TOPIC_EXISTS => {
                let topic = args.string(0)?;
                if self.topic_exists(topic)? {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "topic \"{topic}\" does not exist"
                    )))
                }
            }
            action::CREATE_TOPIC => self.create_topic(args.string(0)?, 1).await,
            action::CREATE_TOPIC_PARTITIONS => {
                let topic = args.string(0)?;
                let partitions = i32::try_from(args.int(1)?).map_err(|_| {
                    StepError::assertion("partition count out of range")
                })?;
                self.create_topic(topic, partitions).await
            }
            action::PUBLISH => {
                let topic = args.string(0)?;
                let payload = args.docstring()?.as_bytes().to_vec();
                self.send_record(topic, None, &payload, None).await
            }
            action::PUBLISH_WITH_KEY => {
                let (topic, key) = (args.string(0)?, args.string(1)?);
                let payload = args.docstring()?.as_bytes().to_vec();
                self.send_record(topic, Some(key), &payload, None).await
            }
            action::PUBLISH_JSON => {
                let topic = args.string(0)?;
                let doc = args.docstring()?;
                serde_json::from_str::<serde_json::Value>(doc)
                    .map_err(|e| StepError::assertion(format!("invalid JSON: {e}")))?;
                self.send_record(topic, None, doc.as_bytes(), None).await
            }
            action::PUBLISH_JSON_WITH_KEY => {
                let (topic, key) = (args.string(0)?, args.string(1)?);
                let doc = args.docstring()?;
                serde_json::from_str::<serde_json::Value>(doc)
                    .map_err(|e| StepError::assertion(format!("invalid JSON: {e}")))?;
                self.send_record(topic, Some(key), doc.as_bytes(), None).await
            }
            action::PUBLISH_BATCH => {
                let topic = args.string(0)?.to_owned();
                let table = args.table()?.clone();
                if !table.has_data() {
                    return Err(StepError::assertion(
                        "table must have headers and at least one data row",
                    ));
                }
                let key_column = table.column_index("key");
                let value_column = table
                    .column_index("value")
                    .or_else(|| table.column_index("message"))
                    .or_else(|| table.column_index("payload"))
                    .ok_or_else(|| {
                        StepError::assertion("table must have a 'value' or 'message' column")
                    })?;

                for row in table.data_rows() {
                    let value = row.get(value_column).cloned().unwrap_or_default();
                    let key = key_column.and_then(|index| row.get(index)).cloned();
                    self.send_record(&topic, key.as_deref(), value.as_bytes(), None)
                        .await?;
                }
                Ok(())
            }
            action::START_CONSUMING => self.start_consuming(args.string(0)?),
            action::CONSUME_WITHIN => {
                let topic = args.string(0)?.to_owned();
                let timeout = args.duration(1)?;
                let already = self.message_count(&topic);
                self.wait_for_count(&topic, already, timeout).await
            }
            action::EXPECT_MESSAGE_WITHIN => {
                let topic = args.string(0)?.to_owned();
                let timeout = args.duration(1)?;
                let expected = args.docstring()?.trim().to_owned();

                let already = self.message_count(&topic);
                self.wait_for_count(&topic, already, timeout).await?;

                let last = self.last_message()?;
                let actual = last.payload_text();
                if actual.trim() == expected {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "message mismatch:\nexpected: {expected}\nactual: {actual}"
                    )))
                }
            }
            action::EXPECT_KEY_WITHIN => {
                let topic = args.string(0)?.to_owned();
                let key = args.string(1)?.to_owned();
                let timeout = args.duration(2)?;

                self.start_consuming(&topic)?;
                let deadline = tokio::time::Instant::now() + timeout;
                loop {
                    let found = self.buffers.lock().ok().and_then(|mut buffers| {
                        let matched = buffers
                            .messages
                            .get(&topic)
                            .and_then(|messages| {
                                messages
                                    .iter()
                                    .find(|message| message.key.as_deref() == Some(key.as_str()))
                                    .cloned()
                            });
                        if let Some(matched) = matched {
                            buffers.last = Some(matched.clone());
                            Some(matched)
                        } else {
                            None
                        }
                    });
                    if found.is_some() {
                        return Ok(());
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Err(StepError::TimedOut {
                            message: format!(
                                "no message with key \"{key}\" received within {}",
                                humantime::format_duration(timeout)
                            ),
                        });
                    }
                    tokio::time::sleep(CONSUME_POLL).await;
                }
            }
            action::TOPIC_MESSAGE_COUNT => {
                let topic = args.string(0)?;
                let expected = args.int(1)?;
                let count = self.message_count(topic);
                if count as i64 == expected {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "topic \"{topic}\": expected {expected} messages, got {count}"
                    )))
                }
            }
            action::TOPIC_EMPTY => {
                let topic = args.string(0)?;
                let count = self.message_count(topic);
                if count == 0 {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "topic \"{topic}\": expected 0 messages, got {count}"
                    )))
                }
            }
            action::LAST_CONTAINS => {
                let expected = args.docstring()?.trim().to_owned();
                let last = self.last_message()?;
                let actual = last.payload_text();
                if actual.contains(&expected) {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "message does not contain expected content:\nexpected to contain: {expected}\nactual: {actual}"
                    )))
                }
            }
            action::LAST_HAS_KEY => {
                let expected = args.string(0)?;
                let last = self.last_message()?;
                let actual = last.key.unwrap_or_default();
                if actual == expected {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "expected key \"{expected}\", got \"{actual}\""
                    )))
                }
            }
            action::LAST_HAS_HEADER => {
                let (header, expected) = (args.string(0)?, args.string(1)?);
                let last = self.last_message()?;
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
            action::EXPECT_IN_ORDER => {
                let topic = args.string(0)?;
                let table = args.table()?;
                if !table.has_data() {
                    return Err(StepError::assertion(
                        "table must have headers and at least one data row",
                    ));
                }
                let key_column = table.column_index("key");
                let value_column = table
                    .column_index("value")
                    .or_else(|| table.column_index("message"))
                    .or_else(|| table.column_index("payload"));

                let messages = self.buffers.lock().map_or_else(
                    |_| Vec::new(),
                    |buffers| buffers.messages.get(topic).cloned().unwrap_or_default(),
                );
                let expected_rows = table.data_rows();
                if messages.len() < expected_rows.len() {
                    return Err(StepError::assertion(format!(
                        "expected at least {} messages, got {}",
                        expected_rows.len(),
                        messages.len()
                    )));
                }

                for (index, row) in expected_rows.iter().enumerate() {
                    let message = &messages[index];
                    if let Some(key_index) = key_column
                        && let Some(expected_key) = row.get(key_index)
                    {
                        let actual_key = message.key.clone().unwrap_or_default();
                        if &actual_key != expected_key {
                            return Err(StepError::assertion(format!(
                                "message {}: expected key \"{expected_key}\", got \"{actual_key}\"",
                                index + 1
                            )));
                        }
                    }
                    if let Some(value_index) = value_column
                        && let Some(expected_value) = row.get(value_index)
                    {
                        let actual = message.payload_text();
                        if !actual.contains(expected_value) {
                            return Err(StepError::assertion(format!(
                                "message {}: expected value containing \"{expected_value}\", got \"{actual}\"",
                                index + 1
                            )));
                        }
                    }
                }
                Ok(())
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

impl MessageConsumer for Kafka {
    fn buffered(&self, target: &str) -> usize {
        self.message_count(target)
    }

    fn last_payload(&self) -> Option<Vec<u8>> {
        self.buffers
            .lock()
            .ok()
            .and_then(|buffers| buffers.last.as_ref().map(|message| message.payload.clone()))
    }
}

#[async_trait]
impl MessagePublisher for Kafka {
    async fn publish(
        &self,
        target: &str,
        payload: &[u8],
        headers: &BTreeMap<String, String>,
    ) -> Result<(), StepError> {
        let owned_headers = if headers.is_empty() {
            None
        } else {
            let mut built = rdkafka::message::OwnedHeaders::new();
            for (key, value) in headers {
                built = built.insert(rdkafka::message::Header {
                    key,
                    value: Some(value.as_bytes()),
                });
            }
            Some(built)
        };
        self.send_record(target, None, payload, owned_headers).await
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
            super::super::stepdef::compile_pattern(step.pattern, "queue")
                .expect("kafka pattern compiles");
        }
    }

    #[rstest]
    fn round_trip_patterns_match_the_expected_step_text() {
        let publish = super::super::stepdef::compile_pattern(
            r#"^I publish JSON to "{resource}" topic "([^"]*)":$"#,
            "queue",
        )
        .expect("pattern compiles");
        let captures = publish
            .captures(r#"I publish JSON to "queue" topic "events":"#)
            .expect("publish step matches");
        assert_eq!(&captures[1], "events");

        let receive = super::super::stepdef::compile_pattern(
            r#"^I should receive message from "{resource}" topic "([^"]*)" within "([^"]*)":$"#,
            "queue",
        )
        .expect("pattern compiles");
        let captures = receive
            .captures(r#"I should receive message from "queue" topic "events" within "5s":"#)
            .expect("receive step matches");
        assert_eq!(&captures[2], "5s");
    }
}
