//! Configuration loading: read, expand environment references, parse,
//! default, validate.
//!
//! Environment expansion happens on the raw text before YAML parsing, so a
//! `${DB_PASSWORD}` reference works in any string position. Unset variables
//! expand to the empty string, matching POSIX shell behaviour for unset
//! parameters.

use std::sync::LazyLock;

use camino::Utf8Path;
use mockable::Env;
use regex::{Captures, Regex};

use crate::error::ConfigError;

use super::types::Config;

/// Resource type tags the registry knows how to construct.
const KNOWN_RESOURCE_TYPES: &[&str] = &[
    "postgres",
    "postgresql",
    "mysql",
    "redis",
    "kafka",
    "rabbitmq",
    "http",
    "http-client",
    "http-server",
    "websocket",
    "websocket-client",
    "websocket-server",
    "shell",
    "wiremock",
];

/// Reset levels accepted by `settings.reset.level`.
const VALID_RESET_LEVELS: &[&str] = &["scenario", "feature", "run", "none"];

/// Output formats the formatter module can produce.
const VALID_OUTPUT_FORMATS: &[&str] = &["pretty", "json"];

/// `${VAR}` or `$VAR` references in the raw configuration text.
static ENV_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("env reference pattern is valid")
});

/// Load and validate a `tomato.yml` configuration file.
///
/// # Errors
///
/// Returns `ConfigError` when the file cannot be read, is not valid YAML, or
/// fails structural validation (version, reset level, output format, dangling
/// references, image sources).
pub fn load(path: &Utf8Path) -> Result<Config, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
        path: path.to_owned(),
        message: e.to_string(),
    })?;

    let expanded = expand_env(&raw);
    let mut config: Config =
        serde_yaml::from_str(&expanded).map_err(|e| ConfigError::ParseFailed {
            message: e.to_string(),
        })?;

    apply_defaults(&mut config);
    validate(&config)?;
    Ok(config)
}

/// Expand `${VAR}` and `$VAR` references from the process environment.
#[must_use]
pub fn expand_env(raw: &str) -> String {
    expand_env_with(raw, &mockable::DefaultEnv::new())
}

/// Expand environment references using the given environment provider.
///
/// The provider seam keeps expansion testable without mutating the process
/// environment.
pub fn expand_env_with<E: Env>(raw: &str, env: &E) -> String {
    ENV_REF
        .replace_all(raw, |caps: &Captures<'_>| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            env.string(name).unwrap_or_default()
        })
        .into_owned()
}

/// Fill in defaults the schema leaves optional.
fn apply_defaults(config: &mut Config) {
    if config.version == 0 {
        config.version = 2;
    }
    if config.settings.parallel == 0 {
        config.settings.parallel = 1;
    }
    if config.settings.output.is_empty() {
        config.settings.output = String::from("pretty");
    }
    if config.settings.reset.level.is_empty() {
        config.settings.reset.level = String::from("scenario");
    }
    if config.settings.reset.on_failure.is_empty() {
        config.settings.reset.on_failure = String::from("reset");
    }
    if config.features.paths.is_empty() {
        config
            .features
            .paths
            .push(camino::Utf8PathBuf::from("./features"));
    }
}

/// Structural validation; graph acyclicity is deferred to the orchestrator.
fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.version != 2 {
        return Err(ConfigError::UnsupportedVersion {
            found: config.version,
        });
    }

    if !VALID_RESET_LEVELS.contains(&config.settings.reset.level.as_str()) {
        return Err(ConfigError::InvalidResetLevel {
            level: config.settings.reset.level.clone(),
        });
    }

    if !VALID_OUTPUT_FORMATS.contains(&config.settings.output.as_str()) {
        return Err(ConfigError::UnknownOutputFormat {
            format: config.settings.output.clone(),
        });
    }

    for (name, resource) in &config.resources {
        if !KNOWN_RESOURCE_TYPES.contains(&resource.kind.as_str()) {
            return Err(ConfigError::UnknownResourceType {
                resource: name.clone(),
                kind: resource.kind.clone(),
            });
        }
        if let Some(container) = &resource.container
            && !config.containers.contains_key(container)
        {
            return Err(ConfigError::UnknownContainerRef {
                resource: name.clone(),
                container: container.clone(),
            });
        }
    }

    for (name, container) in &config.containers {
        if container.image.is_some() == container.build.is_some() {
            return Err(ConfigError::AmbiguousImageSource {
                container: name.clone(),
            });
        }
        for dependency in &container.depends_on {
            if !config.containers.contains_key(dependency) {
                return Err(ConfigError::UnknownDependency {
                    container: name.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
    }

    if let Some(app) = &config.app
        && app.build.is_some() == app.command.is_some()
    {
        return Err(ConfigError::AmbiguousAppSource);
    }

    Ok(())
}
