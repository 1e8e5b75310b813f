//! Semantic error types for the tomato engine.
//!
//! This module defines the error hierarchy for tomato, following the principle
//! of using semantic error enums (via `thiserror`) for conditions the caller
//! might inspect or map to an exit code, while reserving opaque errors
//! (`eyre::Report`) for the application boundary.
//!
//! The taxonomy mirrors the engine's failure surfaces: configuration load,
//! dependency-graph construction, infrastructure startup, step execution,
//! hook execution, and cleanup.

use camino::Utf8PathBuf;

use thiserror::Error;

/// Errors raised while loading or validating the configuration file.
///
/// These surface at load time; the engine refuses to start.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("reading configuration file '{path}': {message}")]
    ReadFailed {
        /// The path that could not be read.
        path: Utf8PathBuf,
        /// A description of the read failure.
        message: String,
    },

    /// The configuration file is not valid YAML.
    #[error("parsing configuration file: {message}")]
    ParseFailed {
        /// A description of the parse error.
        message: String,
    },

    /// The schema version is not supported.
    #[error("unsupported config version: {found} (expected 2)")]
    UnsupportedVersion {
        /// The version declared in the file.
        found: u32,
    },

    /// The reset level is not one of `scenario`, `feature`, `run`, `none`.
    #[error("invalid reset level: {level}")]
    InvalidResetLevel {
        /// The rejected level string.
        level: String,
    },

    /// A resource references a container that is not declared.
    #[error("resource '{resource}' references unknown container '{container}'")]
    UnknownContainerRef {
        /// The referencing resource.
        resource: String,
        /// The missing container name.
        container: String,
    },

    /// A container depends on a container that is not declared.
    #[error("container '{container}' depends on unknown container '{dependency}'")]
    UnknownDependency {
        /// The declaring container.
        container: String,
        /// The missing dependency name.
        dependency: String,
    },

    /// A resource declares an unknown type tag.
    #[error("resource '{resource}' has unknown type: {kind}")]
    UnknownResourceType {
        /// The declaring resource.
        resource: String,
        /// The rejected type tag.
        kind: String,
    },

    /// A container declares both an image and a build context, or neither.
    #[error("container '{container}': exactly one of 'image' or 'build' must be set")]
    AmbiguousImageSource {
        /// The offending container.
        container: String,
    },

    /// The app block declares both a build and a command, or neither.
    #[error("app: exactly one of 'build' or 'command' must be set")]
    AmbiguousAppSource,

    /// The output format is not one the engine knows how to produce.
    #[error("unknown output format: {format}")]
    UnknownOutputFormat {
        /// The rejected format name.
        format: String,
    },

    /// A configuration value failed validation.
    #[error("invalid configuration value for '{field}': {reason}")]
    InvalidValue {
        /// The name of the invalid field.
        field: String,
        /// The reason the value is invalid.
        reason: String,
    },
}

/// Errors raised while constructing the container dependency graph.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The `depends_on` edges form a cycle.
    #[error("circular dependency detected in container configuration")]
    CircularDependency,
}

/// Errors raised while bringing up infrastructure.
///
/// These surface during startup; teardown runs and the run fails before any
/// scenario executes.
#[derive(Debug, Error)]
pub enum InfraError {
    /// Failed to connect to the container engine socket.
    #[error("failed to connect to container engine: {message}")]
    EngineUnavailable {
        /// A description of the connection failure.
        message: String,
    },

    /// A container could not be created or started.
    #[error("starting container '{container}': {message}")]
    ContainerStartFailed {
        /// The container that failed.
        container: String,
        /// A description of the failure.
        message: String,
    },

    /// An image could not be pulled or built.
    #[error("preparing image for '{target}': {message}")]
    ImageFailed {
        /// The container or app the image was for.
        target: String,
        /// A description of the failure.
        message: String,
    },

    /// A readiness gate did not pass within its timeout.
    #[error("readiness gate for '{target}' timed out after {seconds}s")]
    ReadinessTimeout {
        /// The container or app being gated.
        target: String,
        /// The timeout that elapsed.
        seconds: u64,
    },

    /// A readiness gate failed outright.
    #[error("readiness gate for '{target}' failed: {message}")]
    ReadinessFailed {
        /// The container or app being gated.
        target: String,
        /// A description of the failure.
        message: String,
    },

    /// A host-side port mapping could not be resolved.
    #[error("no host mapping for port '{port}' of container '{container}'")]
    PortLookupFailed {
        /// The container queried.
        container: String,
        /// The container-side port that has no mapping.
        port: String,
    },

    /// A named container is not managed by the orchestrator.
    #[error("container not found: {container}")]
    ContainerNotFound {
        /// The unknown container name.
        container: String,
    },

    /// Executing a command inside a container failed.
    #[error("executing command in container '{container}': {message}")]
    ExecFailed {
        /// The container the command ran in.
        container: String,
        /// A description of the failure.
        message: String,
    },

    /// The system under test failed to launch.
    #[error("starting application: {message}")]
    AppStartFailed {
        /// A description of the failure.
        message: String,
    },

    /// A handler could not reach or prepare its backing resource.
    #[error("handler '{handler}': {message}")]
    HandlerInitFailed {
        /// The handler that failed.
        handler: String,
        /// A description of the failure.
        message: String,
    },

    /// A named handler is not registered.
    #[error("handler not found: {handler}")]
    HandlerNotFound {
        /// The unknown handler name.
        handler: String,
    },

    /// The run was cancelled while waiting on infrastructure.
    #[error("interrupted while waiting for '{target}'")]
    Interrupted {
        /// The container or app being waited on.
        target: String,
    },
}

/// Errors raised by a step's handler function during scenario execution.
///
/// Recorded against the step; the scenario is marked failed and its remaining
/// steps are skipped. Undefined and ambiguous dispatch outcomes carry their
/// own variants so the summary can report them separately.
#[derive(Debug, Error)]
pub enum StepError {
    /// An assertion made by the step did not hold.
    #[error("{message}")]
    AssertionFailed {
        /// The handler's diagnostic string.
        message: String,
    },

    /// The backing resource reported an error.
    #[error("{message}")]
    BackendFailed {
        /// A description of the backend failure.
        message: String,
    },

    /// A wait bounded by a step-level timeout expired.
    #[error("{message}")]
    TimedOut {
        /// A description of what was being waited for.
        message: String,
    },

    /// A step argument could not be coerced to its declared type.
    #[error("step argument {index}: {message}")]
    InvalidArgument {
        /// Zero-based capture-group index.
        index: usize,
        /// A description of the coercion failure.
        message: String,
    },

    /// The step requires a docstring or data table that was not attached.
    #[error("step requires {expected}")]
    MissingAttachment {
        /// What the step expected (`a docstring` or `a data table`).
        expected: String,
    },

    /// No registered pattern matched the step text.
    #[error("undefined step: {text}")]
    Undefined {
        /// The step text after variable substitution.
        text: String,
    },

    /// More than one registered pattern matched the step text.
    #[error("ambiguous step: {text} (matches {count} patterns)")]
    Ambiguous {
        /// The step text after variable substitution.
        text: String,
        /// How many patterns matched.
        count: usize,
    },

    /// The handler does not implement the requested step action.
    #[error("handler '{handler}' has no step action '{action}'")]
    UnknownAction {
        /// The handler that was dispatched to.
        handler: String,
        /// The unresolved action name.
        action: String,
    },
}

impl StepError {
    /// Build an assertion failure from any displayable diagnostic.
    pub fn assertion(message: impl Into<String>) -> Self {
        Self::AssertionFailed {
            message: message.into(),
        }
    }

    /// Build a backend failure from any displayable diagnostic.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::BackendFailed {
            message: message.into(),
        }
    }
}

/// Errors raised while executing a configured hook.
///
/// In `before_*` positions these are fatal to the enclosing scope; in
/// `after_*` positions they are logged and non-fatal.
#[derive(Debug, Error)]
pub enum HookError {
    /// The hook names a resource that is not registered.
    #[error("hook resource not found: {resource}")]
    ResourceNotFound {
        /// The unknown resource name.
        resource: String,
    },

    /// The hook's resource handler does not support SQL execution.
    #[error("handler '{resource}' does not support SQL")]
    SqlUnsupported {
        /// The resource that lacks the capability.
        resource: String,
    },

    /// The hook's SQL failed to execute.
    #[error("executing hook SQL on '{resource}': {message}")]
    SqlFailed {
        /// The resource the SQL ran against.
        resource: String,
        /// A description of the failure.
        message: String,
    },

    /// A SQL file hook could not read its file.
    #[error("reading hook SQL file '{path}': {message}")]
    SqlFileUnreadable {
        /// The file the hook referenced.
        path: Utf8PathBuf,
        /// A description of the failure.
        message: String,
    },

    /// An exec or shell hook failed inside its container.
    #[error("executing hook command in '{container}': {message}")]
    ExecFailed {
        /// The container the command ran in.
        container: String,
        /// A description of the failure.
        message: String,
    },

    /// The hook declaration populated none of the recognised fields.
    #[error("hook declares no action (expected sql, sql_file, shell, or exec)")]
    EmptyHook,
}

/// Errors raised during handler or orchestrator cleanup.
///
/// Collected and logged; never mutates the run's pass/fail verdict.
#[derive(Debug, Error)]
pub enum CleanupError {
    /// A handler failed to release its resources.
    #[error("cleaning up handler '{handler}': {message}")]
    HandlerFailed {
        /// The handler that failed.
        handler: String,
        /// A description of the failure.
        message: String,
    },

    /// Several cleanup steps failed; messages are joined.
    #[error("cleanup errors: {messages}")]
    Multiple {
        /// Joined failure descriptions.
        messages: String,
    },
}

/// Top-level error type for the tomato engine.
///
/// Aggregates all domain-specific errors into a single type. At the
/// application boundary (`main.rs`) these are converted to `eyre::Report`
/// for human-readable reporting, and mapped to exit codes (configuration
/// errors exit 2, everything else exits 1).
#[derive(Debug, Error)]
pub enum TomatoError {
    /// An error occurred during configuration load or validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The container dependency graph is invalid.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Infrastructure could not be brought up.
    #[error(transparent)]
    Infra(#[from] InfraError),

    /// A hook failed in a fatal position.
    #[error(transparent)]
    Hook(#[from] HookError),

    /// Cleanup failed.
    #[error(transparent)]
    Cleanup(#[from] CleanupError),

    /// One or more scenarios failed.
    #[error("{failed} of {total} scenarios failed")]
    ScenariosFailed {
        /// Number of failed scenarios.
        failed: usize,
        /// Total number of executed scenarios.
        total: usize,
    },
}

impl TomatoError {
    /// Whether this error should map to exit code 2 (configuration error).
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Graph(_))
    }
}

/// A specialised `Result` type for tomato operations.
pub type Result<T> = std::result::Result<T, TomatoError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn graph_error_mentions_circular_dependency() {
        let error = GraphError::CircularDependency;
        assert!(error.to_string().contains("circular dependency"));
    }

    #[rstest]
    #[case(3, "unsupported config version: 3 (expected 2)")]
    #[case(1, "unsupported config version: 1 (expected 2)")]
    fn config_error_version_displays_found_version(#[case] found: u32, #[case] expected: &str) {
        let error = ConfigError::UnsupportedVersion { found };
        assert_eq!(error.to_string(), expected);
    }

    #[rstest]
    fn config_error_unknown_container_ref_names_both_sides() {
        let error = ConfigError::UnknownContainerRef {
            resource: String::from("db"),
            container: String::from("postgres"),
        };
        assert_eq!(
            error.to_string(),
            "resource 'db' references unknown container 'postgres'"
        );
    }

    #[rstest]
    fn infra_error_readiness_timeout_displays_seconds() {
        let error = InfraError::ReadinessTimeout {
            target: String::from("kafka"),
            seconds: 60,
        };
        assert_eq!(
            error.to_string(),
            "readiness gate for 'kafka' timed out after 60s"
        );
    }

    #[rstest]
    fn step_error_ambiguous_displays_match_count() {
        let error = StepError::Ambiguous {
            text: String::from("\"api\" sends \"GET\" to \"/\""),
            count: 2,
        };
        assert!(error.to_string().contains("matches 2 patterns"));
    }

    #[rstest]
    fn hook_error_sql_unsupported_names_resource() {
        let error = HookError::SqlUnsupported {
            resource: String::from("cache"),
        };
        assert_eq!(error.to_string(), "handler 'cache' does not support SQL");
    }

    #[rstest]
    fn tomato_error_classifies_config_errors_for_exit_code() {
        let config: TomatoError = ConfigError::UnsupportedVersion { found: 1 }.into();
        let graph: TomatoError = GraphError::CircularDependency.into();
        let infra: TomatoError = InfraError::ContainerNotFound {
            container: String::from("redis"),
        }
        .into();

        assert!(config.is_config_error());
        assert!(graph.is_config_error());
        assert!(!infra.is_config_error());
    }

    #[rstest]
    fn tomato_error_preserves_wrapped_messages() {
        let error: TomatoError = InfraError::PortLookupFailed {
            container: String::from("postgres"),
            port: String::from("5432/tcp"),
        }
        .into();
        assert_eq!(
            error.to_string(),
            "no host mapping for port '5432/tcp' of container 'postgres'"
        );
    }
}
