//! Handler registry: construction by type tag and lifecycle fan-out.
//!
//! The registry instantiates one handler per declared resource, dispatching
//! on the resource's type tag (legacy aliases map to their canonical
//! handlers: `http` to http-client, `postgresql` to postgres, `websocket`
//! to websocket-client, `wiremock` to http-server). Lifecycle calls fan out
//! in name order; `reset_all` honours the per-resource tri-state toggle and
//! `cleanup` accumulates errors instead of short-circuiting.

use std::collections::BTreeMap;
use std::sync::Arc;

use camino::Utf8Path;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::ResourceSpec;
use crate::error::{CleanupError, ConfigError, HookError, InfraError, StepError};

use super::stepdef::{StepArgs, StepCategory};
use super::{
    Handler, HandlerDeps, http_client, http_server, kafka, mysql, postgres, rabbitmq, redis,
    shell, websocket_client, websocket_server,
};

/// Owns every handler for the run.
pub struct Registry {
    handlers: BTreeMap<String, Arc<Mutex<dyn Handler>>>,
    reset_policy: BTreeMap<String, Option<bool>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("reset_policy", &self.reset_policy)
            .finish()
    }
}

impl Registry {
    /// Instantiate one handler per resource declaration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownResourceType` for a type tag the factory
    /// does not know (normally caught earlier, at configuration load).
    pub fn new(
        resources: &BTreeMap<String, ResourceSpec>,
        deps: &HandlerDeps,
    ) -> Result<Self, ConfigError> {
        let mut handlers: BTreeMap<String, Arc<Mutex<dyn Handler>>> = BTreeMap::new();
        let mut reset_policy = BTreeMap::new();

        for (name, spec) in resources {
            let handler = build_handler(name, spec, deps)?;
            handlers.insert(name.clone(), handler);
            reset_policy.insert(name.clone(), spec.reset);
        }

        Ok(Self {
            handlers,
            reset_policy,
        })
    }

    /// The registered handler names, in deterministic order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    /// Look up a handler by resource name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Mutex<dyn Handler>>> {
        self.handlers.get(name).map(Arc::clone)
    }

    /// Initialise then readiness-check every handler, failing on the first
    /// error.
    ///
    /// # Errors
    ///
    /// Propagates the first handler's `InfraError`.
    pub async fn wait_ready(&self) -> Result<(), InfraError> {
        for (name, handler) in &self.handlers {
            debug!(handler = %name, "initialising handler");
            let mut guard = handler.lock().await;
            guard.init().await?;

            debug!(handler = %name, "checking handler readiness");
            guard.ready().await?;
        }
        Ok(())
    }

    /// Reset every handler whose per-resource policy permits it: an unset
    /// toggle follows the global level, `true` always resets, `false` never
    /// does.
    ///
    /// # Errors
    ///
    /// Propagates the first handler's `InfraError`.
    pub async fn reset_all(&self) -> Result<(), InfraError> {
        for (name, handler) in &self.handlers {
            if self.reset_policy.get(name).copied().flatten() == Some(false) {
                debug!(handler = %name, "skipping reset (disabled)");
                continue;
            }
            debug!(handler = %name, "resetting handler");
            handler.lock().await.reset().await?;
        }
        Ok(())
    }

    /// Clean up every handler, accumulating failures.
    ///
    /// # Errors
    ///
    /// Returns a `CleanupError` joining every handler's failure message.
    pub async fn cleanup(&self) -> Result<(), CleanupError> {
        let mut failures = Vec::new();
        for (name, handler) in &self.handlers {
            if let Err(error) = handler.lock().await.cleanup().await {
                failures.push(format!("{name}: {error}"));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CleanupError::Multiple {
                messages: failures.join("; "),
            })
        }
    }

    /// Every handler's step vocabulary, keyed by resource name, for the
    /// dispatcher to compile.
    pub async fn step_categories(&self) -> Vec<(String, StepCategory)> {
        let mut categories = Vec::with_capacity(self.handlers.len());
        for (name, handler) in &self.handlers {
            categories.push((name.clone(), handler.lock().await.steps()));
        }
        categories
    }

    /// Execute one step action on the named handler.
    ///
    /// # Errors
    ///
    /// Returns the handler's `StepError`, or a backend error for unknown
    /// handler names.
    pub async fn run_step(
        &self,
        handler: &str,
        action: &str,
        args: &StepArgs,
    ) -> Result<(), StepError> {
        let handler = self
            .handlers
            .get(handler)
            .ok_or_else(|| StepError::backend(format!("handler not found: {handler}")))?;
        handler.lock().await.run_step(action, args).await
    }

    /// Run a SQL hook against the named resource, requiring the SQL
    /// capability.
    ///
    /// # Errors
    ///
    /// Returns `HookError::ResourceNotFound`, `HookError::SqlUnsupported`,
    /// or `HookError::SqlFailed`.
    pub async fn exec_sql_hook(&self, resource: &str, sql: &str) -> Result<(), HookError> {
        let handler = self
            .handlers
            .get(resource)
            .ok_or_else(|| HookError::ResourceNotFound {
                resource: String::from(resource),
            })?;
        let guard = handler.lock().await;
        let executor = guard
            .as_sql_executor()
            .ok_or_else(|| HookError::SqlUnsupported {
                resource: String::from(resource),
            })?;
        executor
            .exec_sql(sql)
            .await
            .map(|_| ())
            .map_err(|e| HookError::SqlFailed {
                resource: String::from(resource),
                message: e.to_string(),
            })
    }

    /// Run a SQL-file hook against the named resource.
    ///
    /// # Errors
    ///
    /// As [`Self::exec_sql_hook`], plus `HookError::SqlFileUnreadable` for a
    /// missing file.
    pub async fn exec_sql_file_hook(
        &self,
        resource: &str,
        path: &Utf8Path,
    ) -> Result<(), HookError> {
        let sql = std::fs::read_to_string(path).map_err(|e| HookError::SqlFileUnreadable {
            path: path.to_owned(),
            message: e.to_string(),
        })?;
        self.exec_sql_hook(resource, &sql).await
    }
}

fn build_handler(
    name: &str,
    spec: &ResourceSpec,
    deps: &HandlerDeps,
) -> Result<Arc<Mutex<dyn Handler>>, ConfigError> {
    let name = String::from(name);
    let spec = spec.clone();
    let deps = deps.clone();

    Ok(match spec.kind.as_str() {
        "postgres" | "postgresql" => Arc::new(Mutex::new(postgres::Postgres::new(name, spec, deps))),
        "mysql" => Arc::new(Mutex::new(mysql::MySql::new(name, spec, deps))),
        "redis" => Arc::new(Mutex::new(redis::Redis::new(name, spec, deps))),
        "kafka" => Arc::new(Mutex::new(kafka::Kafka::new(name, spec, deps))),
        "rabbitmq" => Arc::new(Mutex::new(rabbitmq::RabbitMq::new(name, spec, deps))),
        "http-client" | "http" => {
            Arc::new(Mutex::new(http_client::HttpClient::new(name, spec, deps)))
        }
        // Legacy wiremock declarations get the native mock server.
        "http-server" | "wiremock" => {
            Arc::new(Mutex::new(http_server::HttpServer::new(name, spec, deps)))
        }
        "websocket-client" | "websocket" => Arc::new(Mutex::new(
            websocket_client::WebSocketClient::new(name, spec, deps),
        )),
        "websocket-server" => Arc::new(Mutex::new(websocket_server::WebSocketServer::new(
            name, spec, deps,
        ))),
        "shell" => Arc::new(Mutex::new(shell::Shell::new(name, spec, deps))),
        other => {
            return Err(ConfigError::UnknownResourceType {
                resource: name,
                kind: String::from(other),
            });
        }
    })
}

/// Map legacy alias type tags to their canonical names.
#[must_use]
pub fn canonical_kind(kind: &str) -> &str {
    match kind {
        "http" => "http-client",
        "postgresql" => "postgres",
        "websocket" => "websocket-client",
        "wiremock" => "http-server",
        other => other,
    }
}

/// Every resource type's vocabulary, for the `steps` and `docs` commands.
#[must_use]
pub fn vocabularies() -> Vec<(&'static str, StepCategory)> {
    vec![
        ("postgres", postgres::vocabulary()),
        ("mysql", mysql::vocabulary()),
        ("redis", redis::vocabulary()),
        ("kafka", kafka::vocabulary()),
        ("rabbitmq", rabbitmq::vocabulary()),
        ("http-client", http_client::vocabulary()),
        ("http-server", http_server::vocabulary()),
        ("websocket-client", websocket_client::vocabulary()),
        ("websocket-server", websocket_server::vocabulary()),
        ("shell", shell::vocabulary()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio_util::sync::CancellationToken;

    fn deps() -> HandlerDeps {
        let docker = bollard::Docker::connect_with_http(
            "http://nonexistent.tomato-test.invalid",
            5,
            bollard::API_DEFAULT_VERSION,
        )
        .expect("client construction is lazy");
        HandlerDeps {
            orchestrator: Arc::new(
                crate::orchestrator::Orchestrator::new(
                    docker,
                    BTreeMap::new(),
                    CancellationToken::new(),
                )
                .expect("empty graph"),
            ),
            variables: Arc::new(super::super::VariableStore::new()),
            cancel: CancellationToken::new(),
        }
    }

    fn resource(kind: &str) -> ResourceSpec {
        ResourceSpec {
            kind: String::from(kind),
            ..ResourceSpec::default()
        }
    }

    #[rstest]
    #[case("postgres")]
    #[case("postgresql")]
    #[case("mysql")]
    #[case("redis")]
    #[case("kafka")]
    #[case("rabbitmq")]
    #[case("http")]
    #[case("http-client")]
    #[case("http-server")]
    #[case("wiremock")]
    #[case("websocket")]
    #[case("websocket-client")]
    #[case("websocket-server")]
    #[case("shell")]
    fn factory_constructs_every_known_type(#[case] kind: &str) {
        let resources = BTreeMap::from([(String::from("r"), resource(kind))]);
        let registry = Registry::new(&resources, &deps()).expect("known type constructs");
        assert_eq!(registry.names(), vec!["r"]);
    }

    #[rstest]
    fn factory_rejects_unknown_types() {
        let resources = BTreeMap::from([(String::from("q"), resource("nsq"))]);
        let error = Registry::new(&resources, &deps()).expect_err("nsq is not registered");
        assert!(matches!(
            error,
            ConfigError::UnknownResourceType { kind, .. } if kind == "nsq"
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn aliases_share_the_canonical_vocabulary() {
        let resources = BTreeMap::from([
            (String::from("via-alias"), resource("http")),
            (String::from("canonical"), resource("http-client")),
        ]);
        let registry = Registry::new(&resources, &deps()).expect("aliases construct");

        let categories = registry.step_categories().await;
        let by_name: BTreeMap<&str, &StepCategory> = categories
            .iter()
            .map(|(name, category)| (name.as_str(), category))
            .collect();
        assert_eq!(by_name["via-alias"].name, by_name["canonical"].name);
    }

    #[rstest]
    #[tokio::test]
    async fn reset_policy_false_skips_the_handler() {
        // A shell handler records state that reset would clear; disabling
        // reset must leave it untouched.
        let mut spec = resource("shell");
        spec.reset = Some(false);
        let resources = BTreeMap::from([(String::from("sh"), spec)]);
        let registry = Registry::new(&resources, &deps()).expect("constructs");

        registry
            .run_step(
                "sh",
                "run-inline",
                &StepArgs::new(vec![String::from("echo state")], None, None),
            )
            .await
            .expect("command runs");

        registry.reset_all().await.expect("reset-all succeeds");

        // Still observable: reset was skipped for this handler.
        registry
            .run_step(
                "sh",
                "stdout-contains",
                &StepArgs::new(vec![String::from("state")], None, None),
            )
            .await
            .expect("stdout survived the skipped reset");
    }

    #[rstest]
    #[tokio::test]
    async fn reset_policy_unset_resets_the_handler() {
        let resources = BTreeMap::from([(String::from("sh"), resource("shell"))]);
        let registry = Registry::new(&resources, &deps()).expect("constructs");

        registry
            .run_step(
                "sh",
                "run-inline",
                &StepArgs::new(vec![String::from("echo state")], None, None),
            )
            .await
            .expect("command runs");

        registry.reset_all().await.expect("reset-all succeeds");

        let error = registry
            .run_step(
                "sh",
                "stdout-contains",
                &StepArgs::new(vec![String::from("state")], None, None),
            )
            .await
            .expect_err("stdout cleared by reset");
        assert!(error.to_string().contains("does not contain"));
    }

    #[rstest]
    #[tokio::test]
    async fn sql_hooks_require_the_sql_capability() {
        let resources = BTreeMap::from([(String::from("sh"), resource("shell"))]);
        let registry = Registry::new(&resources, &deps()).expect("constructs");

        let error = registry
            .exec_sql_hook("sh", "SELECT 1")
            .await
            .expect_err("shell has no SQL capability");
        assert!(matches!(error, HookError::SqlUnsupported { .. }));

        let missing = registry
            .exec_sql_hook("nope", "SELECT 1")
            .await
            .expect_err("unknown resource");
        assert!(matches!(missing, HookError::ResourceNotFound { .. }));
    }

    #[rstest]
    fn vocabularies_cover_every_canonical_type() {
        let names: Vec<&str> = vocabularies().iter().map(|(name, _)| *name).collect();
        assert_eq!(names.len(), 10);
        assert!(names.contains(&"postgres"));
        assert!(names.contains(&"http-server"));
        assert!(names.contains(&"websocket-client"));
    }
}
