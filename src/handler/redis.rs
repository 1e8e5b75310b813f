//! Redis cache resource handler.
//!
//! Vocabulary spans string operations and assertions, hash/list/set
//! operations, counters, and database-wide checks. `reset` issues `FLUSHDB`
//! by default; the `pattern` strategy scans and deletes keys matching the
//! resource's `reset_pattern` glob instead, for shared databases.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;

use crate::error::{CleanupError, InfraError, StepError};

use super::stepdef::{StepArgs, StepCategory, StepDef};
use super::{Handler, HandlerDeps, KvStore};
use crate::config::ResourceSpec;

mod action {
    pub const SET_KEY: &str = "set-key";
    pub const SET_KEY_TTL: &str = "set-key-ttl";
    pub const SET_KEY_JSON: &str = "set-key-json";
    pub const DELETE_KEY: &str = "delete-key";
    pub const KEY_EXISTS: &str = "key-exists";
    pub const KEY_NOT_EXISTS: &str = "key-not-exists";
    pub const KEY_HAS_VALUE: &str = "key-has-value";
    pub const KEY_CONTAINS: &str = "key-contains";
    pub const KEY_TTL_AT_LEAST: &str = "key-ttl-at-least";
    pub const KEY_COUNT: &str = "key-count";
    pub const DB_EMPTY: &str = "db-empty";
    pub const SET_HASH: &str = "set-hash";
    pub const HASH_FIELD: &str = "hash-field";
    pub const HASH_CONTAINS: &str = "hash-contains";
    pub const LIST_PUSH: &str = "list-push";
    pub const LIST_PUSH_MANY: &str = "list-push-many";
    pub const LIST_LENGTH: &str = "list-length";
    pub const LIST_CONTAINS: &str = "list-contains";
    pub const SET_ADD: &str = "set-add";
    pub const SET_ADD_MANY: &str = "set-add-many";
    pub const SET_CONTAINS: &str = "set-contains";
    pub const SET_SIZE: &str = "set-size";
    pub const INCREMENT: &str = "increment";
    pub const INCREMENT_BY: &str = "increment-by";
    pub const DECREMENT: &str = "decrement";
}

/// The Redis step vocabulary.
pub(super) fn vocabulary() -> StepCategory {
    StepCategory {
        name: "Redis",
        description: "Steps for interacting with Redis caches",
        steps: vec![
            StepDef {
                group: "Keys",
                pattern: r#"^I set "{resource}" key "([^"]*)" with value "([^"]*)"$"#,
                description: "Sets a string key",
                example: "I set \"{resource}\" key \"session\" with value \"abc\"",
                action: action::SET_KEY,
            },
            StepDef {
                group: "Keys",
                pattern: r#"^I set "{resource}" key "([^"]*)" with value "([^"]*)" and TTL "([^"]*)"$"#,
                description: "Sets a string key with an expiry",
                example: "I set \"{resource}\" key \"session\" with value \"abc\" and TTL \"60s\"",
                action: action::SET_KEY_TTL,
            },
            StepDef {
                group: "Keys",
                pattern: r#"^I set "{resource}" key "([^"]*)" with JSON:$"#,
                description: "Sets a key from a JSON docstring (validated)",
                example: "I set \"{resource}\" key \"user\" with JSON:\n  \"\"\"\n  {\"id\": 1}\n  \"\"\"",
                action: action::SET_KEY_JSON,
            },
            StepDef {
                group: "Keys",
                pattern: r#"^I delete "{resource}" key "([^"]*)"$"#,
                description: "Deletes a key",
                example: "I delete \"{resource}\" key \"session\"",
                action: action::DELETE_KEY,
            },
            StepDef {
                group: "Assertions",
                pattern: r#"^"{resource}" key "([^"]*)" should exist$"#,
                description: "Asserts a key exists",
                example: "\"{resource}\" key \"session\" should exist",
                action: action::KEY_EXISTS,
            },
            StepDef {
                group: "Assertions",
                pattern: r#"^"{resource}" key "([^"]*)" should not exist$"#,
                description: "Asserts a key does not exist",
                example: "\"{resource}\" key \"session\" should not exist",
                action: action::KEY_NOT_EXISTS,
            },
            StepDef {
                group: "Assertions",
                pattern: r#"^"{resource}" key "([^"]*)" should have value "([^"]*)"$"#,
                description: "Asserts a key's exact value",
                example: "\"{resource}\" key \"session\" should have value \"abc\"",
                action: action::KEY_HAS_VALUE,
            },
            StepDef {
                group: "Assertions",
                pattern: r#"^"{resource}" key "([^"]*)" should contain "([^"]*)"$"#,
                description: "Asserts a key's value contains a substring",
                example: "\"{resource}\" key \"user\" should contain \"alice\"",
                action: action::KEY_CONTAINS,
            },
            StepDef {
                group: "Assertions",
                pattern: r#"^"{resource}" key "([^"]*)" should have TTL greater than "(\d+)" seconds$"#,
                description: "Asserts a key's remaining TTL is at least N seconds",
                example: "\"{resource}\" key \"session\" should have TTL greater than \"30\" seconds",
                action: action::KEY_TTL_AT_LEAST,
            },
            StepDef {
                group: "Assertions",
                pattern: r#"^"{resource}" should have "(\d+)" keys$"#,
                description: "Asserts the database key count",
                example: "\"{resource}\" should have \"3\" keys",
                action: action::KEY_COUNT,
            },
            StepDef {
                group: "Assertions",
                pattern: r#"^"{resource}" should be empty$"#,
                description: "Asserts the database has no keys",
                example: "\"{resource}\" should be empty",
                action: action::DB_EMPTY,
            },
            StepDef {
                group: "Hashes",
                pattern: r#"^I set "{resource}" hash "([^"]*)" with fields:$"#,
                description: "Sets hash fields from a table",
                example: "I set \"{resource}\" hash \"user:1\" with fields:\n  | field | value |\n  | name  | alice |",
                action: action::SET_HASH,
            },
            StepDef {
                group: "Hashes",
                pattern: r#"^"{resource}" hash "([^"]*)" field "([^"]*)" should be "([^"]*)"$"#,
                description: "Asserts one hash field",
                example: "\"{resource}\" hash \"user:1\" field \"name\" should be \"alice\"",
                action: action::HASH_FIELD,
            },
            StepDef {
                group: "Hashes",
                pattern: r#"^"{resource}" hash "([^"]*)" should contain:$"#,
                description: "Asserts multiple hash fields from a table",
                example: "\"{resource}\" hash \"user:1\" should contain:\n  | field | value |\n  | name  | alice |",
                action: action::HASH_CONTAINS,
            },
            StepDef {
                group: "Lists",
                pattern: r#"^I push "([^"]*)" to "{resource}" list "([^"]*)"$"#,
                description: "Appends one value to a list",
                example: "I push \"job-1\" to \"{resource}\" list \"jobs\"",
                action: action::LIST_PUSH,
            },
            StepDef {
                group: "Lists",
                pattern: r#"^I push values to "{resource}" list "([^"]*)":$"#,
                description: "Appends each table row to a list",
                example: "I push values to \"{resource}\" list \"jobs\":\n  | job-1 |\n  | job-2 |",
                action: action::LIST_PUSH_MANY,
            },
            StepDef {
                group: "Lists",
                pattern: r#"^"{resource}" list "([^"]*)" should have "(\d+)" items$"#,
                description: "Asserts a list's length",
                example: "\"{resource}\" list \"jobs\" should have \"2\" items",
                action: action::LIST_LENGTH,
            },
            StepDef {
                group: "Lists",
                pattern: r#"^"{resource}" list "([^"]*)" should contain "([^"]*)"$"#,
                description: "Asserts a list contains a value",
                example: "\"{resource}\" list \"jobs\" should contain \"job-1\"",
                action: action::LIST_CONTAINS,
            },
            StepDef {
                group: "Sets",
                pattern: r#"^I add "([^"]*)" to "{resource}" set "([^"]*)"$"#,
                description: "Adds one member to a set",
                example: "I add \"alice\" to \"{resource}\" set \"admins\"",
                action: action::SET_ADD,
            },
            StepDef {
                group: "Sets",
                pattern: r#"^I add members to "{resource}" set "([^"]*)":$"#,
                description: "Adds each table row to a set",
                example: "I add members to \"{resource}\" set \"admins\":\n  | alice |\n  | bob   |",
                action: action::SET_ADD_MANY,
            },
            StepDef {
                group: "Sets",
                pattern: r#"^"{resource}" set "([^"]*)" should contain "([^"]*)"$"#,
                description: "Asserts set membership",
                example: "\"{resource}\" set \"admins\" should contain \"alice\"",
                action: action::SET_CONTAINS,
            },
            StepDef {
                group: "Sets",
                pattern: r#"^"{resource}" set "([^"]*)" should have "(\d+)" members$"#,
                description: "Asserts a set's cardinality",
                example: "\"{resource}\" set \"admins\" should have \"2\" members",
                action: action::SET_SIZE,
            },
            StepDef {
                group: "Counters",
                pattern: r#"^I increment "{resource}" key "([^"]*)"$"#,
                description: "Increments a counter by one",
                example: "I increment \"{resource}\" key \"visits\"",
                action: action::INCREMENT,
            },
            StepDef {
                group: "Counters",
                pattern: r#"^I increment "{resource}" key "([^"]*)" by "(\d+)"$"#,
                description: "Increments a counter by N",
                example: "I increment \"{resource}\" key \"visits\" by \"5\"",
                action: action::INCREMENT_BY,
            },
            StepDef {
                group: "Counters",
                pattern: r#"^I decrement "{resource}" key "([^"]*)"$"#,
                description: "Decrements a counter by one",
                example: "I decrement \"{resource}\" key \"stock\"",
                action: action::DECREMENT,
            },
        ],
    }
}

/// Handler for one declared `redis` resource.
pub struct Redis {
    name: String,
    spec: ResourceSpec,
    deps: HandlerDeps,
    connection: Option<MultiplexedConnection>,
}

impl Redis {
    /// Create the handler; the connection is established in `init`.
    #[must_use]
    pub fn new(name: String, spec: ResourceSpec, deps: HandlerDeps) -> Self {
        Self {
            name,
            spec,
            deps,
            connection: None,
        }
    }

    fn connection(&self) -> Result<MultiplexedConnection, StepError> {
        self.connection
            .clone()
            .ok_or_else(|| StepError::backend(format!("handler '{}' is not connected", self.name)))
    }

    async fn url(&self) -> Result<String, InfraError> {
        if let Some(url) = self.spec.opt_str("url") {
            return Ok(String::from(url));
        }

        let container = self.spec.container.as_deref().ok_or_else(|| {
            InfraError::HandlerInitFailed {
                handler: self.name.clone(),
                message: String::from("redis resource needs a container or a url option"),
            }
        })?;
        let host = self.deps.orchestrator.host(container)?;
        let port = self.deps.orchestrator.port(container, "6379/tcp").await?;
        let db = self.spec.opt_i64("db").unwrap_or(0);

        Ok(match self.spec.opt_str("password") {
            Some(password) => format!("redis://:{password}@{host}:{port}/{db}"),
            None => format!("redis://{host}:{port}/{db}"),
        })
    }

    async fn delete_by_pattern(&self, pattern: &str) -> Result<(), InfraError> {
        let mut con = self.connection.clone().ok_or_else(|| {
            InfraError::HandlerInitFailed {
                handler: self.name.clone(),
                message: String::from("not initialised"),
            }
        })?;
        let backend = |message: String| InfraError::HandlerInitFailed {
            handler: self.name.clone(),
            message,
        };

        let keys: Vec<String> = {
            let mut iter = con
                .scan_match::<_, String>(pattern)
                .await
                .map_err(|e| backend(format!("scanning keys: {e}")))?;
            let mut collected = Vec::new();
            while let Some(key) = iter.next_item().await {
                collected.push(key);
            }
            collected
        };

        if !keys.is_empty() {
            let _: () = con
                .del(keys)
                .await
                .map_err(|e| backend(format!("deleting keys: {e}")))?;
        }
        Ok(())
    }

    async fn db_size(&self) -> Result<i64, StepError> {
        let mut con = self.connection()?;
        redis::cmd("DBSIZE")
            .query_async(&mut con)
            .await
            .map_err(|e| StepError::backend(format!("DBSIZE: {e}")))
    }

    async fn get_value(&self, key: &str) -> Result<String, StepError> {
        let mut con = self.connection()?;
        let value: Option<String> = con
            .get(key)
            .await
            .map_err(|e| StepError::backend(format!("getting key \"{key}\": {e}")))?;
        value.ok_or_else(|| StepError::assertion(format!("key \"{key}\" does not exist")))
    }
}

#[async_trait]
impl Handler for Redis {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&mut self) -> Result<(), InfraError> {
        let url = self.url().await?;
        let client = redis::Client::open(url).map_err(|e| InfraError::HandlerInitFailed {
            handler: self.name.clone(),
            message: format!("opening redis client: {e}"),
        })?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| InfraError::HandlerInitFailed {
                handler: self.name.clone(),
                message: format!("connecting to redis: {e}"),
            })?;
        self.connection = Some(connection);
        Ok(())
    }

    async fn ready(&mut self) -> Result<(), InfraError> {
        let Some(connection) = self.connection.clone() else {
            return Err(InfraError::HandlerInitFailed {
                handler: self.name.clone(),
                message: String::from("not initialised"),
            });
        };
        let mut con = connection;
        let pong: Result<(), redis::RedisError> =
            redis::cmd("PING").query_async(&mut con).await;
        pong.map_err(|e| InfraError::HandlerInitFailed {
            handler: self.name.clone(),
            message: format!("ping failed: {e}"),
        })
    }

    async fn reset(&mut self) -> Result<(), InfraError> {
        let Some(connection) = self.connection.clone() else {
            return Ok(());
        };

        match self.spec.opt_str("reset_strategy") {
            Some("pattern") => {
                let pattern = self
                    .spec
                    .opt_str("reset_pattern")
                    .map_or_else(|| String::from("*"), String::from);
                self.delete_by_pattern(&pattern).await
            }
            _ => {
                let mut con = connection;
                let flushed: Result<(), redis::RedisError> =
                    redis::cmd("FLUSHDB").query_async(&mut con).await;
                flushed.map_err(|e| InfraError::HandlerInitFailed {
                    handler: self.name.clone(),
                    message: format!("FLUSHDB failed: {e}"),
                })
            }
        }
    }

    async fn cleanup(&mut self) -> Result<(), CleanupError> {
        self.connection = None;
        Ok(())
    }

    fn steps(&self) -> StepCategory {
        vocabulary()
    }

    #[allow(clippy::too_many_lines, reason = "one arm per vocabulary entry")]
    async fn run_step(&mut self, action: &str, args: &StepArgs) -> Result<(), StepError> {
        let mut con = self.connection()?;
        let backend = |message: String| StepError::backend(message);

        match action {
            action::SET_KEY => {
                let (key, value) = (args.string(0)?, args.string(1)?);
                let _: () = con
                    .set(key, value)
                    .await
                    .map_err(|e| backend(format!("SET {key}: {e}")))?;
                Ok(())
            }
            action::SET_KEY_TTL => {
                let (key, value) = (args.string(0)?, args.string(1)?);
                let ttl = args.duration(2)?;
                let _: () = con
                    .set_ex(key, value, ttl.as_secs())
                    .await
                    .map_err(|e| backend(format!("SETEX {key}: {e}")))?;
                Ok(())
            }
            action::SET_KEY_JSON => {
                let key = args.string(0)?;
                let doc = args.docstring()?;
                serde_json::from_str::<serde_json::Value>(doc)
                    .map_err(|e| StepError::assertion(format!("invalid JSON: {e}")))?;
                let _: () = con
                    .set(key, doc)
                    .await
                    .map_err(|e| backend(format!("SET {key}: {e}")))?;
                Ok(())
            }
            action::DELETE_KEY => {
                let key = args.string(0)?;
                let _: () = con
                    .del(key)
                    .await
                    .map_err(|e| backend(format!("DEL {key}: {e}")))?;
                Ok(())
            }
            action::KEY_EXISTS => {
                let key = args.string(0)?;
                let exists: bool = con
                    .exists(key)
                    .await
                    .map_err(|e| backend(format!("EXISTS {key}: {e}")))?;
                if exists {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!("key \"{key}\" does not exist")))
                }
            }
            action::KEY_NOT_EXISTS => {
                let key = args.string(0)?;
                let exists: bool = con
                    .exists(key)
                    .await
                    .map_err(|e| backend(format!("EXISTS {key}: {e}")))?;
                if exists {
                    Err(StepError::assertion(format!(
                        "key \"{key}\" exists but should not"
                    )))
                } else {
                    Ok(())
                }
            }
            action::KEY_HAS_VALUE => {
                let (key, expected) = (args.string(0)?, args.string(1)?);
                let value = self.get_value(key).await?;
                if value == expected {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "key \"{key}\": expected \"{expected}\", got \"{value}\""
                    )))
                }
            }
            action::KEY_CONTAINS => {
                let (key, needle) = (args.string(0)?, args.string(1)?);
                let value = self.get_value(key).await?;
                if value.contains(needle) {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "key \"{key}\" value \"{value}\" does not contain \"{needle}\""
                    )))
                }
            }
            action::KEY_TTL_AT_LEAST => {
                let key = args.string(0)?;
                let minimum = args.int(1)?;
                let ttl: i64 = con
                    .ttl(key)
                    .await
                    .map_err(|e| backend(format!("TTL {key}: {e}")))?;
                if ttl < minimum {
                    Err(StepError::assertion(format!(
                        "key \"{key}\" TTL is {ttl}s, expected at least {minimum}s"
                    )))
                } else {
                    Ok(())
                }
            }
            action::KEY_COUNT => {
                let expected = args.int(0)?;
                let count = self.db_size().await?;
                if count == expected {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "expected {expected} keys, got {count}"
                    )))
                }
            }
            action::DB_EMPTY => {
                let count = self.db_size().await?;
                if count == 0 {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "expected empty database, got {count} keys"
                    )))
                }
            }
            action::SET_HASH => {
                let hash = args.string(0)?;
                let table = args.table()?;
                if !table.has_data() {
                    return Err(StepError::assertion(
                        "table must have headers and at least one data row",
                    ));
                }
                let fields: Vec<(String, String)> = table
                    .data_rows()
                    .iter()
                    .filter(|row| row.len() >= 2)
                    .map(|row| (row[0].clone(), row[1].clone()))
                    .collect();
                let _: () = con
                    .hset_multiple(hash, &fields)
                    .await
                    .map_err(|e| backend(format!("HSET {hash}: {e}")))?;
                Ok(())
            }
            action::HASH_FIELD => {
                let (hash, field, expected) =
                    (args.string(0)?, args.string(1)?, args.string(2)?);
                assert_hash_field(&mut con, hash, field, expected).await
            }
            action::HASH_CONTAINS => {
                let hash = args.string(0)?;
                let table = args.table()?;
                for row in table.data_rows() {
                    if row.len() >= 2 {
                        assert_hash_field(&mut con, hash, &row[0], &row[1]).await?;
                    }
                }
                Ok(())
            }
            action::LIST_PUSH => {
                let (value, list) = (args.string(0)?, args.string(1)?);
                let _: () = con
                    .rpush(list, value)
                    .await
                    .map_err(|e| backend(format!("RPUSH {list}: {e}")))?;
                Ok(())
            }
            action::LIST_PUSH_MANY => {
                let list = args.string(0)?;
                let values: Vec<String> = args
                    .table()?
                    .rows
                    .iter()
                    .filter_map(|row| row.first().cloned())
                    .collect();
                let _: () = con
                    .rpush(list, values)
                    .await
                    .map_err(|e| backend(format!("RPUSH {list}: {e}")))?;
                Ok(())
            }
            action::LIST_LENGTH => {
                let list = args.string(0)?;
                let expected = args.int(1)?;
                let length: i64 = con
                    .llen(list)
                    .await
                    .map_err(|e| backend(format!("LLEN {list}: {e}")))?;
                if length == expected {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "list \"{list}\": expected {expected} items, got {length}"
                    )))
                }
            }
            action::LIST_CONTAINS => {
                let (list, expected) = (args.string(0)?, args.string(1)?);
                let values: Vec<String> = con
                    .lrange(list, 0, -1)
                    .await
                    .map_err(|e| backend(format!("LRANGE {list}: {e}")))?;
                if values.iter().any(|value| value == expected) {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "list \"{list}\" does not contain \"{expected}\""
                    )))
                }
            }
            action::SET_ADD => {
                let (member, set) = (args.string(0)?, args.string(1)?);
                let _: () = con
                    .sadd(set, member)
                    .await
                    .map_err(|e| backend(format!("SADD {set}: {e}")))?;
                Ok(())
            }
            action::SET_ADD_MANY => {
                let set = args.string(0)?;
                let members: Vec<String> = args
                    .table()?
                    .rows
                    .iter()
                    .filter_map(|row| row.first().cloned())
                    .collect();
                let _: () = con
                    .sadd(set, members)
                    .await
                    .map_err(|e| backend(format!("SADD {set}: {e}")))?;
                Ok(())
            }
            action::SET_CONTAINS => {
                let (set, member) = (args.string(0)?, args.string(1)?);
                let is_member: bool = con
                    .sismember(set, member)
                    .await
                    .map_err(|e| backend(format!("SISMEMBER {set}: {e}")))?;
                if is_member {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "set \"{set}\" does not contain \"{member}\""
                    )))
                }
            }
            action::SET_SIZE => {
                let set = args.string(0)?;
                let expected = args.int(1)?;
                let size: i64 = con
                    .scard(set)
                    .await
                    .map_err(|e| backend(format!("SCARD {set}: {e}")))?;
                if size == expected {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "set \"{set}\": expected {expected} members, got {size}"
                    )))
                }
            }
            action::INCREMENT => {
                let key = args.string(0)?;
                let _: i64 = con
                    .incr(key, 1)
                    .await
                    .map_err(|e| backend(format!("INCR {key}: {e}")))?;
                Ok(())
            }
            action::INCREMENT_BY => {
                let key = args.string(0)?;
                let amount = args.int(1)?;
                let _: i64 = con
                    .incr(key, amount)
                    .await
                    .map_err(|e| backend(format!("INCRBY {key}: {e}")))?;
                Ok(())
            }
            action::DECREMENT => {
                let key = args.string(0)?;
                let _: i64 = con
                    .decr(key, 1)
                    .await
                    .map_err(|e| backend(format!("DECR {key}: {e}")))?;
                Ok(())
            }
            other => Err(StepError::UnknownAction {
                handler: self.name.clone(),
                action: String::from(other),
            }),
        }
    }

    fn as_kv_store(&self) -> Option<&dyn KvStore> {
        Some(self)
    }
}

async fn assert_hash_field(
    con: &mut MultiplexedConnection,
    hash: &str,
    field: &str,
    expected: &str,
) -> Result<(), StepError> {
    let value: Option<String> = con
        .hget(hash, field)
        .await
        .map_err(|e| StepError::backend(format!("HGET {hash} {field}: {e}")))?;
    let value = value.ok_or_else(|| {
        StepError::assertion(format!("hash \"{hash}\" has no field \"{field}\""))
    })?;
    if value == expected {
        Ok(())
    } else {
        Err(StepError::assertion(format!(
            "hash \"{hash}\" field \"{field}\": expected \"{expected}\", got \"{value}\""
        )))
    }
}

#[async_trait]
impl KvStore for Redis {
    async fn set(&self, key: &str, value: &str) -> Result<(), StepError> {
        let mut con = self.connection()?;
        let _: () = con
            .set(key, value)
            .await
            .map_err(|e| StepError::backend(format!("SET {key}: {e}")))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<String, StepError> {
        self.get_value(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), StepError> {
        let mut con = self.connection()?;
        let _: () = con
            .del(key)
            .await
            .map_err(|e| StepError::backend(format!("DEL {key}: {e}")))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StepError> {
        let mut con = self.connection()?;
        con.exists(key)
            .await
            .map_err(|e| StepError::backend(format!("EXISTS {key}: {e}")))
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
            super::super::stepdef::compile_pattern(step.pattern, "cache")
                .expect("redis pattern compiles");
        }
    }
}
