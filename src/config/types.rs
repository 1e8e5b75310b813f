//! Configuration data types for the `tomato.yml` schema.

use std::collections::BTreeMap;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::Deserialize;
use smart_default::SmartDefault;

/// Root of the parsed `tomato.yml` document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Schema version; only `2` is accepted (a missing version defaults to 2).
    pub version: u32,

    /// Global run settings.
    pub settings: Settings,

    /// The system under test, if the run should launch one.
    pub app: Option<AppSpec>,

    /// Dependency containers, keyed by user-chosen name.
    pub containers: BTreeMap<String, ContainerSpec>,

    /// Resources addressed from feature files, keyed by name.
    pub resources: BTreeMap<String, ResourceSpec>,

    /// Hook lists for the four lifecycle positions.
    pub hooks: Hooks,

    /// Feature discovery settings.
    pub features: Features,
}

impl Config {
    /// Whether an app block is present and runnable.
    #[must_use]
    pub fn is_app_configured(&self) -> bool {
        self.app
            .as_ref()
            .is_some_and(|app| app.build.is_some() || app.command.is_some())
    }
}

/// Global run settings.
#[derive(Debug, Clone, Deserialize, SmartDefault)]
#[serde(default)]
pub struct Settings {
    /// Upper bound for a single scenario, including its waits.
    #[default(Duration::from_secs(300))]
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Requested scenario concurrency. Accepted but executed serially; see
    /// the registry's per-scenario state contract.
    #[default = 1]
    pub parallel: usize,

    /// Abort the run at the first failing scenario.
    pub fail_fast: bool,

    /// Output format name (`pretty` or `json`).
    #[default = "pretty"]
    pub output: String,

    /// State reset policy.
    pub reset: ResetSettings,
}

/// State reset policy.
#[derive(Debug, Clone, Deserialize, SmartDefault)]
#[serde(default)]
pub struct ResetSettings {
    /// Boundary at which handler state is cleared.
    #[default = "scenario"]
    pub level: String,

    /// Whether to reset after a failed scenario (`reset`) or keep state for
    /// inspection (`keep`).
    #[default = "reset"]
    pub on_failure: String,
}

impl ResetSettings {
    /// The parsed reset level. Call only after validation.
    #[must_use]
    pub fn parsed_level(&self) -> ResetLevel {
        match self.level.as_str() {
            "feature" => ResetLevel::Feature,
            "run" => ResetLevel::Run,
            "none" => ResetLevel::None,
            _ => ResetLevel::Scenario,
        }
    }

    /// The parsed on-failure policy. Unrecognised values fall back to reset.
    #[must_use]
    pub fn parsed_on_failure(&self) -> OnFailure {
        match self.on_failure.as_str() {
            "keep" => OnFailure::Keep,
            _ => OnFailure::Reset,
        }
    }
}

/// Boundary at which handler state is cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetLevel {
    /// Before every scenario.
    Scenario,
    /// Before the first scenario of each feature.
    Feature,
    /// Once, before the first scenario of the run.
    Run,
    /// Never.
    None,
}

/// Whether state survives a failed scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnFailure {
    /// Reset at the configured boundary regardless of the previous outcome.
    Reset,
    /// Skip the next boundary reset so failure state can be inspected.
    Keep,
}

/// How to launch the system under test.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppSpec {
    /// Build the app image from a Dockerfile (docker mode).
    pub build: Option<BuildSpec>,

    /// Run the app as a local process via `sh -c` (command mode).
    pub command: Option<String>,

    /// Working directory for command mode.
    pub workdir: Option<Utf8PathBuf>,

    /// TCP port the app listens on. Zero means no port-based readiness.
    pub port: u16,

    /// Readiness check evaluated against `localhost:port`.
    pub ready: Option<ReadyCheck>,

    /// Stabilisation delay after the readiness check passes.
    #[serde(with = "humantime_serde")]
    pub wait: Option<Duration>,

    /// Environment for the app process. Values may contain
    /// `{{.CONTAINER.host}}` and `{{.CONTAINER.port.PORT}}` placeholders.
    pub env: BTreeMap<String, String>,
}

/// Dockerfile build input shared by containers and the app.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildSpec {
    /// Path to the Dockerfile, relative to the context.
    pub dockerfile: Utf8PathBuf,

    /// Build context directory; defaults to the current directory.
    #[serde(default)]
    pub context: Option<Utf8PathBuf>,
}

/// Readiness check for the system under test.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReadyCheck {
    /// Check kind: `http`, `tcp`, or `exec`.
    #[serde(rename = "type")]
    pub kind: String,

    /// HTTP path to poll (http kind).
    pub path: Option<String>,

    /// Expected HTTP status; defaults to 200 (http kind).
    pub status: Option<u16>,

    /// Shell command to poll (exec kind).
    pub command: Option<String>,

    /// Per-check timeout; defaults to 30s.
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

/// One dependency container declaration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ContainerSpec {
    /// Image reference to pull and run. Mutually exclusive with `build`.
    pub image: Option<String>,

    /// Build the image from a Dockerfile. Mutually exclusive with `image`.
    pub build: Option<BuildSpec>,

    /// Environment for the container.
    pub env: BTreeMap<String, String>,

    /// Exposed ports in container-port form (`"5432/tcp"`).
    pub ports: Vec<String>,

    /// Volume mounts in `host:container` form.
    pub volumes: Vec<String>,

    /// Containers that must be running before this one starts.
    pub depends_on: Vec<String>,

    /// Readiness gate evaluated after the container is running.
    pub wait_for: WaitFor,

    /// Internal cleanup of container state between scenarios.
    pub reset: ContainerReset,
}

/// Readiness gate declaration for a container.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WaitFor {
    /// Gate kind: `port`, `log`, `http`, or `exec`. Empty means "running is
    /// enough".
    #[serde(rename = "type")]
    pub kind: String,

    /// Gate target: a container port (`5432/tcp`), a log substring, an HTTP
    /// target port, or a shell command, depending on the kind.
    pub target: String,

    /// HTTP method override (http kind).
    pub method: Option<String>,

    /// HTTP path (http kind).
    pub path: Option<String>,

    /// Gate timeout; defaults to 60s.
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

/// Container-level reset declaration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ContainerReset {
    /// Strategy name; meaning is container-type specific.
    pub strategy: Option<String>,

    /// Tables to limit a database reset to.
    pub tables: Vec<String>,

    /// Tables to exclude from a database reset.
    pub exclude: Vec<String>,

    /// Queues to purge on reset.
    pub queues: Vec<String>,

    /// Topics to recreate on reset.
    pub topics: Vec<String>,
}

/// One resource declaration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResourceSpec {
    /// Resource type tag (`postgres`, `redis`, `http-client`, ...).
    #[serde(rename = "type")]
    pub kind: String,

    /// Name of the backing container, where the type needs one.
    pub container: Option<String>,

    /// Freeform per-type options.
    pub options: BTreeMap<String, serde_yaml::Value>,

    /// Tri-state reset toggle: unset follows the global level, `true` always
    /// resets, `false` never resets.
    pub reset: Option<bool>,

    /// Database name (SQL types).
    pub database: Option<String>,

    /// Base URL (HTTP client without a container).
    pub base_url: Option<String>,

    /// Broker list (kafka without a container).
    pub brokers: Vec<String>,

    /// Consumer group (kafka).
    pub consumer_group: Option<String>,

    /// WebSocket URL (websocket client without a container).
    pub url: Option<String>,
}

impl ResourceSpec {
    /// A string option, if present and a string.
    #[must_use]
    pub fn opt_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(serde_yaml::Value::as_str)
    }

    /// An integer option, if present and an integer.
    #[must_use]
    pub fn opt_i64(&self, key: &str) -> Option<i64> {
        self.options.get(key).and_then(serde_yaml::Value::as_i64)
    }

    /// A boolean option, if present and a boolean.
    #[must_use]
    pub fn opt_bool(&self, key: &str) -> Option<bool> {
        self.options.get(key).and_then(serde_yaml::Value::as_bool)
    }

    /// A string-sequence option; non-string entries are skipped.
    #[must_use]
    pub fn opt_str_list(&self, key: &str) -> Vec<String> {
        self.options
            .get(key)
            .and_then(serde_yaml::Value::as_sequence)
            .map(|seq| {
                seq.iter()
                    .filter_map(serde_yaml::Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// A duration option parsed from a humantime literal (`"30s"`).
    #[must_use]
    pub fn opt_duration(&self, key: &str) -> Option<Duration> {
        self.opt_str(key)
            .and_then(|raw| humantime::parse_duration(raw).ok())
    }
}

/// Hook lists for the four lifecycle positions.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Hooks {
    /// Run once before any scenario; failures abort the run.
    pub before_all: Vec<Hook>,

    /// Run once after the last scenario; failures are logged.
    pub after_all: Vec<Hook>,

    /// Run before each scenario; failures fail the scenario.
    pub before_scenario: Vec<Hook>,

    /// Run after each scenario; failures are logged.
    pub after_scenario: Vec<Hook>,
}

/// One hook declaration. Exactly one of the action fields should be set;
/// `sql`/`sql_file` pair with `resource`, `shell`/`exec` pair with
/// `container`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Hook {
    /// Inline SQL to run against `resource`.
    pub sql: Option<String>,

    /// Path to a SQL file to run against `resource`.
    pub sql_file: Option<Utf8PathBuf>,

    /// Shell command to run inside `container`.
    pub shell: Option<String>,

    /// Command to run inside `container` (alias of `shell`).
    pub exec: Option<String>,

    /// Target resource for SQL hooks.
    pub resource: Option<String>,

    /// Target container for shell/exec hooks.
    pub container: Option<String>,
}

/// Feature discovery settings.
#[derive(Debug, Clone, Deserialize, SmartDefault)]
#[serde(default)]
pub struct Features {
    /// Directories and files searched recursively for `.feature` files.
    #[default(vec![Utf8PathBuf::from("./features")])]
    pub paths: Vec<Utf8PathBuf>,

    /// Tag filter expression (`@a && ~@b`).
    pub tags: Option<String>,

    /// Scenario-name regex filter.
    pub scenario: Option<String>,
}
