//! Hook execution.
//!
//! A hook dispatches on its populated field: `sql` and `sql_file` resolve a
//! resource handler and require the SQL capability; `shell` and `exec`
//! resolve a container and run `sh -c` inside it via the orchestrator.
//! Callers decide fatality by position: `before_*` failures propagate,
//! `after_*` failures are logged.

use camino::Utf8Path;

use crate::config::Hook;
use crate::error::HookError;
use crate::handler::Registry;
use crate::orchestrator::Orchestrator;

/// Run a list of hooks in order, stopping at the first failure.
///
/// # Errors
///
/// Propagates the first hook's `HookError`.
pub async fn run_hooks(
    hooks: &[Hook],
    registry: &Registry,
    orchestrator: &Orchestrator,
) -> Result<(), HookError> {
    for hook in hooks {
        run_hook(hook, registry, orchestrator).await?;
    }
    Ok(())
}

async fn run_hook(
    hook: &Hook,
    registry: &Registry,
    orchestrator: &Orchestrator,
) -> Result<(), HookError> {
    if let Some(sql) = &hook.sql {
        let resource = hook.resource.as_deref().unwrap_or_default();
        return registry.exec_sql_hook(resource, sql).await;
    }

    if let Some(sql_file) = &hook.sql_file {
        let resource = hook.resource.as_deref().unwrap_or_default();
        return registry
            .exec_sql_file_hook(resource, Utf8Path::new(sql_file))
            .await;
    }

    let command = hook.exec.as_deref().or(hook.shell.as_deref());
    if let Some(command) = command {
        let container = hook.container.as_deref().unwrap_or_default();
        let argv = vec![
            String::from("sh"),
            String::from("-c"),
            String::from(command),
        ];
        return match orchestrator.exec(container, &argv).await {
            Ok((0, _)) => Ok(()),
            Ok((code, output)) => Err(HookError::ExecFailed {
                container: String::from(container),
                message: format!("exit code {code}: {output}"),
            }),
            Err(error) => Err(HookError::ExecFailed {
                container: String::from(container),
                message: error.to_string(),
            }),
        };
    }

    Err(HookError::EmptyHook)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    use crate::handler::{HandlerDeps, VariableStore};

    fn offline_orchestrator() -> Arc<Orchestrator> {
        let docker = bollard::Docker::connect_with_http(
            "http://nonexistent.tomato-test.invalid",
            5,
            bollard::API_DEFAULT_VERSION,
        )
        .expect("client construction is lazy");
        Arc::new(
            Orchestrator::new(docker, BTreeMap::new(), CancellationToken::new())
                .expect("empty graph"),
        )
    }

    fn registry() -> Registry {
        let orchestrator = offline_orchestrator();
        let deps = HandlerDeps {
            orchestrator,
            variables: Arc::new(VariableStore::new()),
            cancel: CancellationToken::new(),
        };
        let resources = BTreeMap::from([(
            String::from("sh"),
            crate::config::ResourceSpec {
                kind: String::from("shell"),
                ..crate::config::ResourceSpec::default()
            },
        )]);
        Registry::new(&resources, &deps).expect("registry constructs")
    }

    #[rstest]
    #[tokio::test]
    async fn empty_hook_is_a_precise_error() {
        let hook = Hook::default();
        let error = run_hook(&hook, &registry(), &offline_orchestrator())
            .await
            .expect_err("no populated field");
        assert!(matches!(error, HookError::EmptyHook));
    }

    #[rstest]
    #[tokio::test]
    async fn sql_hook_against_non_sql_handler_reports_capability() {
        let hook = Hook {
            sql: Some(String::from("SELECT 1")),
            resource: Some(String::from("sh")),
            ..Hook::default()
        };
        let error = run_hook(&hook, &registry(), &offline_orchestrator())
            .await
            .expect_err("shell has no SQL capability");
        assert!(matches!(error, HookError::SqlUnsupported { .. }));
    }

    #[rstest]
    #[tokio::test]
    async fn exec_hook_against_unknown_container_fails() {
        let hook = Hook {
            exec: Some(String::from("true")),
            container: Some(String::from("missing")),
            ..Hook::default()
        };
        let error = run_hook(&hook, &registry(), &offline_orchestrator())
            .await
            .expect_err("no such container");
        assert!(matches!(error, HookError::ExecFailed { .. }));
    }

    #[rstest]
    #[tokio::test]
    async fn first_failing_hook_stops_the_list() {
        let hooks = vec![
            Hook::default(),
            Hook {
                sql: Some(String::from("SELECT 1")),
                resource: Some(String::from("sh")),
                ..Hook::default()
            },
        ];
        let error = run_hooks(&hooks, &registry(), &offline_orchestrator())
            .await
            .expect_err("first hook fails");
        assert!(matches!(error, HookError::EmptyHook));
    }
}
