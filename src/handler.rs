//! Resource handlers: the per-resource-type step vocabularies.
//!
//! A handler owns one declared resource for the duration of a run: its
//! connection, its per-scenario state, and the step vocabulary that feature
//! files use to drive it. The engine talks to handlers through the
//! [`Handler`] lifecycle trait; narrower capabilities (SQL execution,
//! message publishing, key-value access) are separate traits the registry's
//! consumers query dynamically, so a handler without a capability yields a
//! precise error instead of a stub.
//!
//! Steps are dispatched by name: each handler publishes [`StepDef`]s whose
//! `action` identifiers it resolves in [`Handler::run_step`]. This replaces
//! the reflection-based binding a dynamic-language harness would use with an
//! explicit match, which keeps dispatch observable and exhaustively
//! testable.

pub mod registry;
pub mod stepdef;
pub mod variables;

mod http_client;
mod http_server;
mod kafka;
mod mysql;
mod postgres;
mod rabbitmq;
mod redis;
mod shell;
mod websocket_client;
mod websocket_server;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use camino::Utf8Path;
use tokio_util::sync::CancellationToken;

pub use registry::Registry;
pub use stepdef::{DataTable, StepArgs, StepCategory, StepDef};
pub use variables::VariableStore;

use crate::error::{CleanupError, InfraError, StepError};
use crate::orchestrator::Orchestrator;

/// Shared collaborators injected into every handler.
#[derive(Clone)]
pub struct HandlerDeps {
    /// Container orchestrator for host/port lookups and in-container exec.
    pub orchestrator: Arc<Orchestrator>,

    /// Scenario-scoped variable store. An explicit object, not a global:
    /// this is what keeps future per-worker handler pools possible.
    pub variables: Arc<VariableStore>,

    /// Run-wide cancellation signal; background consumers and readers
    /// select on this.
    pub cancel: CancellationToken,
}

/// Lifecycle and step dispatch implemented by every resource handler.
#[async_trait]
pub trait Handler: Send {
    /// The resource's configured name.
    fn name(&self) -> &str;

    /// Connect to the backing resource. Called once containers are ready.
    async fn init(&mut self) -> Result<(), InfraError>;

    /// Verify the connection is usable.
    async fn ready(&mut self) -> Result<(), InfraError>;

    /// Clear per-scenario state back to the baseline.
    async fn reset(&mut self) -> Result<(), InfraError>;

    /// Release connections and stop background tasks. Called at run end.
    async fn cleanup(&mut self) -> Result<(), CleanupError>;

    /// The handler's step vocabulary.
    fn steps(&self) -> StepCategory;

    /// Execute one step action with its parsed arguments.
    async fn run_step(&mut self, action: &str, args: &StepArgs) -> Result<(), StepError>;

    /// SQL execution capability, for hooks written as SQL.
    fn as_sql_executor(&self) -> Option<&dyn SqlExecutor> {
        None
    }

    /// Message publishing capability.
    fn as_message_publisher(&self) -> Option<&dyn MessagePublisher> {
        None
    }

    /// Message consuming capability.
    fn as_message_consumer(&self) -> Option<&dyn MessageConsumer> {
        None
    }

    /// Key-value capability.
    fn as_kv_store(&self) -> Option<&dyn KvStore> {
        None
    }
}

/// Implemented by handlers that can execute SQL.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Execute a SQL block, returning the affected row count.
    async fn exec_sql(&self, sql: &str) -> Result<u64, StepError>;

    /// Execute SQL read from a file.
    async fn exec_sql_file(&self, path: &Utf8Path) -> Result<(), StepError>;
}

/// Implemented by handlers that can publish messages.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Publish a payload to a topic or queue with optional headers.
    async fn publish(
        &self,
        target: &str,
        payload: &[u8],
        headers: &BTreeMap<String, String>,
    ) -> Result<(), StepError>;
}

/// Implemented by handlers that consume messages into buffers.
pub trait MessageConsumer: Send + Sync {
    /// Number of buffered messages observed for a topic or queue.
    fn buffered(&self, target: &str) -> usize;

    /// Payload of the most recently observed message, if any.
    fn last_payload(&self) -> Option<Vec<u8>>;
}

/// Implemented by handlers that provide key-value storage.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Store a value.
    async fn set(&self, key: &str, value: &str) -> Result<(), StepError>;

    /// Fetch a value.
    async fn get(&self, key: &str) -> Result<String, StepError>;

    /// Delete a key.
    async fn delete(&self, key: &str) -> Result<(), StepError>;

    /// Whether a key exists.
    async fn exists(&self, key: &str) -> Result<bool, StepError>;
}
