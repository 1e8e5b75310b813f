//! Launcher for the system under test.
//!
//! The app runs either as a local process (`command` mode: `sh -c` with a
//! templated environment) or as a container built from a Dockerfile
//! (`docker` mode, attached to the orchestrator's network). In both modes
//! the runner waits for the configured readiness check before returning,
//! applies the post-ready stabilisation delay, and captures output into a
//! bounded in-memory ring that step failures can surface as diagnostics.
//!
//! Environment values may reference containers with `{{.NAME.host}}` and
//! `{{.NAME.port.PORT}}` placeholders. In command mode these resolve to the
//! daemon host and published host ports; in docker mode to the container's
//! network alias and internal port. Unresolved placeholders are left
//! verbatim so the app's own startup failure points at the real mistake.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::models::{ContainerCreateBody, EndpointSettings, HostConfig, NetworkingConfig};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, LogsOptionsBuilder, RemoveContainerOptionsBuilder,
    StopContainerOptionsBuilder,
};
use futures_util::StreamExt;
use regex::{Captures, Regex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{AppSpec, ReadyCheck};
use crate::error::InfraError;
use crate::orchestrator::{self, Orchestrator, normalize_port};
use crate::probe::{self, ProbeTarget, ReadinessProbe, StatusExpectation};
use crate::runlog::RunContext;

/// Capacity of the in-memory log ring.
const LOG_RING_CAPACITY: usize = 100;

/// Readiness timeout when the configuration does not set one.
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Settle time when no port and no ready check are configured.
const NO_CHECK_SETTLE: Duration = Duration::from_secs(2);

/// Image tag for docker-mode builds.
const APP_IMAGE_TAG: &str = "tomato-app:test";

/// Container name and network alias for docker mode.
const APP_CONTAINER_NAME: &str = "tomato-app";

/// How the app is run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Local process via `sh -c`.
    Command,
    /// Container built from the declared Dockerfile.
    Docker,
}

/// Launches and supervises the system under test.
pub struct AppRunner {
    spec: AppSpec,
    orchestrator: Arc<Orchestrator>,
    mode: Mode,
    show_logs: bool,
    ring: Arc<Mutex<VecDeque<String>>>,
    state: Mutex<RunState>,
    log_file: Arc<Mutex<Option<std::fs::File>>>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct RunState {
    child: Option<tokio::process::Child>,
    container_id: Option<String>,
    host: String,
    port: u16,
}

impl AppRunner {
    /// Create a runner for the declared app. The mode follows the
    /// declaration: a build block means docker mode, a command means
    /// command mode.
    #[must_use]
    pub fn new(spec: AppSpec, orchestrator: Arc<Orchestrator>, cancel: CancellationToken) -> Self {
        let mode = if spec.build.is_some() {
            Mode::Docker
        } else {
            Mode::Command
        };

        Self {
            spec,
            orchestrator,
            mode,
            show_logs: true,
            ring: Arc::new(Mutex::new(VecDeque::with_capacity(LOG_RING_CAPACITY))),
            state: Mutex::new(RunState::default()),
            log_file: Arc::new(Mutex::new(None)),
            cancel,
        }
    }

    /// The resolved run mode.
    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.mode
    }

    /// Enable or disable echoing app output to the terminal.
    pub fn set_show_logs(&mut self, show: bool) {
        self.show_logs = show;
    }

    /// Attach a run context so app output is captured to `app.log`.
    pub fn set_run_context(&self, run_log: &RunContext) {
        match run_log.create_log_file("app") {
            Ok(file) => {
                if let Ok(mut slot) = self.log_file.lock() {
                    *slot = Some(file);
                }
            }
            Err(error) => warn!(%error, "failed to create app log file"),
        }
    }

    /// Launch the app and block until it is ready.
    ///
    /// Returns only after the readiness check passes and the configured
    /// stabilisation delay has elapsed.
    ///
    /// # Errors
    ///
    /// Returns `InfraError::AppStartFailed` when the process or container
    /// cannot be launched, and readiness errors when the check never passes.
    pub async fn start(&self) -> Result<(), InfraError> {
        match self.mode {
            Mode::Command => self.start_command().await,
            Mode::Docker => self.start_docker().await,
        }
    }

    /// Stop the app. Idempotent: succeeds when nothing is running.
    pub async fn stop(&self) {
        let (child, container_id) = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            (state.child.take(), state.container_id.take())
        };

        if let Some(child) = child {
            stop_process(child).await;
        }

        if let Some(id) = container_id {
            debug!("stopping app container");
            let docker = self.orchestrator_docker();
            let stop = StopContainerOptionsBuilder::new().t(10).build();
            if let Err(error) = docker.stop_container(&id, Some(stop)).await {
                warn!(%error, "failed to stop app container");
            }
            let remove = RemoveContainerOptionsBuilder::new().force(true).build();
            if let Err(error) = docker.remove_container(&id, Some(remove)).await {
                debug!(%error, "failed to remove app container");
            }
        }
    }

    /// Base URL the test driver should use, `http://HOST:PORT`.
    #[must_use]
    pub fn base_url(&self) -> String {
        let (host, port) = self.host_port();
        format!("http://{host}:{port}")
    }

    /// The host and port the test driver should dial.
    #[must_use]
    pub fn host_port(&self) -> (String, u16) {
        self.state.lock().map_or_else(
            |_| (String::from("localhost"), self.spec.port),
            |state| {
                let host = if state.host.is_empty() {
                    String::from("localhost")
                } else {
                    state.host.clone()
                };
                let port = if state.port == 0 {
                    self.spec.port
                } else {
                    state.port
                };
                (host, port)
            },
        )
    }

    /// The most recent `n` captured log lines, oldest first.
    #[must_use]
    pub fn recent_logs(&self, n: usize) -> Vec<String> {
        if n == 0 {
            return Vec::new();
        }
        self.ring.lock().map_or_else(
            |_| Vec::new(),
            |ring| {
                let skip = ring.len().saturating_sub(n);
                ring.iter().skip(skip).cloned().collect()
            },
        )
    }

    /// One-shot health verification against the running app.
    ///
    /// # Errors
    ///
    /// Returns `InfraError::ReadinessFailed` when the app does not answer.
    pub async fn verify_healthy(&self) -> Result<(), InfraError> {
        let (host, port) = self.host_port();
        if port == 0 {
            return Ok(());
        }

        if let Some(ready) = &self.spec.ready
            && ready.kind == "http"
        {
            let path = ready.path.as_deref().unwrap_or("/health");
            let expected = ready.status.unwrap_or(200);
            let url = format!("http://{host}:{port}{path}");

            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .map_err(|e| readiness_failed(e.to_string()))?;
            let response = client
                .get(&url)
                .send()
                .await
                .map_err(|e| readiness_failed(format!("health check failed: {e}")))?;
            let status = response.status().as_u16();
            if status != expected {
                return Err(readiness_failed(format!(
                    "health check returned status {status}, expected {expected}"
                )));
            }
            return Ok(());
        }

        let address = format!("{host}:{port}");
        tokio::time::timeout(
            Duration::from_secs(5),
            tokio::net::TcpStream::connect(&address),
        )
        .await
        .map_err(|_| readiness_failed(format!("app not responding on {address}: timeout")))?
        .map_err(|e| readiness_failed(format!("app not responding on {address}: {e}")))?;
        Ok(())
    }

    /// Resolve `{{.NAME.host}}` / `{{.NAME.port.PORT}}` placeholders in the
    /// app's environment for the active mode.
    ///
    /// Lookups are cached per container per call; unresolved placeholders
    /// are left verbatim.
    pub async fn build_env(&self) -> BTreeMap<String, String> {
        let mut resolved = BTreeMap::new();
        let mut cache: HashMap<String, String> = HashMap::new();

        for (key, value) in &self.spec.env {
            let substituted = self.substitute_value(value, &mut cache).await;
            resolved.insert(key.clone(), substituted);
        }
        resolved
    }

    async fn substitute_value(
        &self,
        value: &str,
        cache: &mut HashMap<String, String>,
    ) -> String {
        let pattern = template_pattern();
        let mut result = String::with_capacity(value.len());
        let mut last_end = 0;

        for caps in pattern.captures_iter(value) {
            let full = caps.get(0).map(|m| (m.start(), m.end())).unwrap_or((0, 0));
            result.push_str(&value[last_end..full.0]);
            last_end = full.1;

            let replacement = self.resolve_placeholder(&caps, cache).await;
            match replacement {
                Some(text) => result.push_str(&text),
                None => result.push_str(&value[full.0..full.1]),
            }
        }
        result.push_str(&value[last_end..]);
        result
    }

    async fn resolve_placeholder(
        &self,
        caps: &Captures<'_>,
        cache: &mut HashMap<String, String>,
    ) -> Option<String> {
        let container = caps.get(1)?.as_str();
        let kind = caps.get(2)?.as_str();
        let port = caps.get(3).map(|m| m.as_str());

        match (self.mode, kind) {
            (Mode::Command, "host") => {
                let cache_key = format!("{container}/host");
                if let Some(found) = cache.get(&cache_key) {
                    return Some(found.clone());
                }
                let host = self.orchestrator.host(container).ok()?;
                cache.insert(cache_key, host.clone());
                Some(host)
            }
            (Mode::Docker, "host") => Some(String::from(container)),
            (Mode::Command, "port") => {
                let wanted = normalize_port(port?);
                let cache_key = format!("{container}/{wanted}");
                if let Some(found) = cache.get(&cache_key) {
                    return Some(found.clone());
                }
                match self.orchestrator.port(container, &wanted).await {
                    Ok(mapped) => {
                        let text = mapped.to_string();
                        cache.insert(cache_key, text.clone());
                        Some(text)
                    }
                    Err(_) => {
                        warn!(container, port = %wanted, "could not find mapped port");
                        None
                    }
                }
            }
            (Mode::Docker, "port") => {
                // Internal port: strip any protocol suffix.
                let raw = port?;
                Some(String::from(raw.split('/').next().unwrap_or(raw)))
            }
            _ => None,
        }
    }

    // =========================================================================
    // Command mode
    // =========================================================================

    async fn start_command(&self) -> Result<(), InfraError> {
        let command = self
            .spec
            .command
            .as_deref()
            .ok_or_else(|| app_failed("app command is required for command mode"))?;
        if command.trim().is_empty() {
            return Err(app_failed("empty command"));
        }

        let env = self.build_env().await;

        let mut builder = tokio::process::Command::new("sh");
        builder
            .arg("-c")
            .arg(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(workdir) = &self.spec.workdir {
            builder.current_dir(workdir.as_std_path());
        }
        for (key, value) in &env {
            builder.env(key, value);
        }

        debug!(%command, "starting app process");
        let mut child = builder
            .spawn()
            .map_err(|e| app_failed(format!("starting app: {e}")))?;

        if let Some(stdout) = child.stdout.take() {
            self.spawn_line_pump(stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            self.spawn_line_pump(stderr, "stderr");
        }

        if let Ok(mut state) = self.state.lock() {
            state.child = Some(child);
            state.host = String::from("localhost");
            state.port = self.spec.port;
        }

        if let Err(error) = self.wait_ready("localhost", self.spec.port).await {
            self.stop().await;
            return Err(error);
        }

        if let Some(delay) = self.spec.wait {
            tokio::time::sleep(delay).await;
        }

        debug!(port = self.spec.port, "app process ready");
        Ok(())
    }

    fn spawn_line_pump(
        &self,
        pipe: impl tokio::io::AsyncRead + Unpin + Send + 'static,
        source: &'static str,
    ) {
        let ring = Arc::clone(&self.ring);
        let log_file = Arc::clone(&self.log_file);
        let show = self.show_logs;
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            use tokio::io::AsyncBufReadExt;
            let mut lines = tokio::io::BufReader::new(pipe).lines();
            loop {
                let line = tokio::select! {
                    () = cancel.cancelled() => break,
                    line = lines.next_line() => line,
                };
                let Ok(Some(line)) = line else { break };
                if line.is_empty() {
                    continue;
                }
                record_line(&ring, &log_file, show, source, &line);
            }
        });
    }

    // =========================================================================
    // Docker mode
    // =========================================================================

    async fn start_docker(&self) -> Result<(), InfraError> {
        let build = self
            .spec
            .build
            .as_ref()
            .ok_or_else(|| app_failed("docker mode requires 'build' in app config"))?;

        let docker = self.orchestrator_docker();
        debug!(dockerfile = %build.dockerfile, "building app image");
        orchestrator::build_image_from_dockerfile(
            &docker,
            "app",
            build.dockerfile.as_str(),
            build.context.as_ref().map_or(".", |p| p.as_str()),
            APP_IMAGE_TAG,
        )
        .await?;

        let env: Vec<String> = self
            .build_env()
            .await
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();

        let exposed_ports: Vec<String> = if self.spec.port > 0 {
            vec![format!("{}/tcp", self.spec.port)]
        } else {
            Vec::new()
        };
        let endpoints: HashMap<String, EndpointSettings> = std::iter::once((
            self.orchestrator.network_name(),
            EndpointSettings {
                aliases: Some(vec![String::from(APP_CONTAINER_NAME)]),
                ..Default::default()
            },
        ))
        .collect();

        let body = ContainerCreateBody {
            image: Some(String::from(APP_IMAGE_TAG)),
            env: (!env.is_empty()).then_some(env),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            host_config: Some(HostConfig {
                publish_all_ports: Some(true),
                auto_remove: Some(false),
                ..Default::default()
            }),
            networking_config: Some(NetworkingConfig {
                endpoints_config: Some(endpoints),
            }),
            ..Default::default()
        };

        let options = CreateContainerOptionsBuilder::new()
            .name(APP_CONTAINER_NAME)
            .build();
        let created = docker
            .create_container(Some(options), body)
            .await
            .map_err(|e| app_failed(format!("creating app container: {e}")))?;

        if let Ok(mut state) = self.state.lock() {
            state.container_id = Some(created.id.clone());
        }

        docker
            .start_container(
                &created.id,
                None::<bollard::query_parameters::StartContainerOptions>,
            )
            .await
            .map_err(|e| app_failed(format!("starting app container: {e}")))?;

        self.spawn_container_log_pump(&created.id);

        let (host, port) = if self.spec.port > 0 {
            let host = String::from(self.orchestrator.daemon_host());
            let port = self
                .mapped_app_port(&docker, &created.id)
                .await
                .ok_or_else(|| app_failed("getting mapped app port"))?;
            (host, port)
        } else {
            (String::from("localhost"), 0)
        };

        if let Ok(mut state) = self.state.lock() {
            state.host = host.clone();
            state.port = port;
        }

        if let Err(error) = self.wait_ready(&host, port).await {
            self.stop().await;
            return Err(error);
        }

        if let Some(delay) = self.spec.wait {
            tokio::time::sleep(delay).await;
        }

        debug!(%host, port, "app container ready");
        Ok(())
    }

    async fn mapped_app_port(&self, docker: &Docker, id: &str) -> Option<u16> {
        let key = format!("{}/tcp", self.spec.port);
        for _ in 0..10 {
            let inspect = docker
                .inspect_container(id, None::<bollard::query_parameters::InspectContainerOptions>)
                .await
                .ok()?;
            let mapped = inspect
                .network_settings
                .and_then(|settings| settings.ports)
                .and_then(|ports| ports.get(&key).cloned().flatten())
                .and_then(|bindings| {
                    bindings
                        .iter()
                        .find_map(|binding| binding.host_port.as_deref()?.parse::<u16>().ok())
                });
            if mapped.is_some() {
                return mapped;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        None
    }

    fn spawn_container_log_pump(&self, id: &str) {
        let docker = self.orchestrator_docker();
        let id = String::from(id);
        let ring = Arc::clone(&self.ring);
        let log_file = Arc::clone(&self.log_file);
        let show = self.show_logs;
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let options = LogsOptionsBuilder::new()
                .follow(true)
                .stdout(true)
                .stderr(true)
                .build();
            let mut stream = docker.logs(&id, Some(options));
            loop {
                let frame = tokio::select! {
                    () = cancel.cancelled() => break,
                    frame = stream.next() => frame,
                };
                let Some(Ok(chunk)) = frame else { break };
                for line in chunk.to_string().lines() {
                    if line.is_empty() {
                        continue;
                    }
                    record_line(&ring, &log_file, show, "app", line);
                }
            }
        });
    }

    // =========================================================================
    // Readiness
    // =========================================================================

    async fn wait_ready(&self, host: &str, port: u16) -> Result<(), InfraError> {
        let (probe, timeout) = lower_ready_check(self.spec.ready.as_ref(), host, port);

        if matches!(probe, ReadinessProbe::None) {
            if port == 0 && self.spec.ready.is_none() {
                tokio::time::sleep(NO_CHECK_SETTLE).await;
            }
            return Ok(());
        }

        let target = AppProbeTarget { runner: self };
        probe::wait_until_ready(&probe, &target, "app", timeout, &self.cancel).await
    }

    fn orchestrator_docker(&self) -> Docker {
        self.orchestrator.docker_handle()
    }
}

/// Probe adapter for the app: logs come from the ring, exec runs on the
/// host shell (the readiness command contract for command mode).
struct AppProbeTarget<'a> {
    runner: &'a AppRunner,
}

#[async_trait]
impl ProbeTarget for AppProbeTarget<'_> {
    async fn logs(&self) -> Result<String, InfraError> {
        Ok(self.runner.recent_logs(LOG_RING_CAPACITY).join("\n"))
    }

    async fn exec(&self, command: &str) -> Result<i64, InfraError> {
        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| readiness_failed(format!("running ready command: {e}")))?;
        Ok(i64::from(status.code().unwrap_or(-1)))
    }
}

/// Lower the declared ready check to a probe against `host:port`.
///
/// No check configured: a non-zero port becomes a TCP probe with the default
/// timeout; port zero means no probe at all (the caller settles briefly).
fn lower_ready_check(
    ready: Option<&ReadyCheck>,
    host: &str,
    port: u16,
) -> (ReadinessProbe, Duration) {
    let Some(ready) = ready else {
        if port > 0 {
            return (
                ReadinessProbe::Port {
                    host: String::from(host),
                    port,
                },
                DEFAULT_READY_TIMEOUT,
            );
        }
        return (ReadinessProbe::None, DEFAULT_READY_TIMEOUT);
    };

    let timeout = ready.timeout.unwrap_or(DEFAULT_READY_TIMEOUT);
    let probe = match ready.kind.as_str() {
        "http" => ReadinessProbe::Http {
            url: format!(
                "http://{host}:{port}{}",
                ready.path.as_deref().unwrap_or("/health")
            ),
            method: String::from("GET"),
            expect: StatusExpectation::Exactly(ready.status.unwrap_or(200)),
        },
        "exec" => ReadinessProbe::Exec {
            command: ready.command.clone().unwrap_or_default(),
        },
        _ => ReadinessProbe::Port {
            host: String::from(host),
            port,
        },
    };
    (probe, timeout)
}

/// Append a line to the ring (evicting the oldest past capacity), mirror it
/// to the log file, and echo it with the log-column glyph.
fn record_line(
    ring: &Mutex<VecDeque<String>>,
    log_file: &Mutex<Option<std::fs::File>>,
    show: bool,
    source: &str,
    line: &str,
) {
    if let Ok(mut ring) = ring.lock() {
        if ring.len() == LOG_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(String::from(line));
    }

    if let Ok(mut file) = log_file.lock()
        && let Some(file) = file.as_mut()
    {
        use std::io::Write;
        let _ = writeln!(file, "[{source}] {line}");
    }

    if show {
        println!("    \u{2502} {line}");
    }
}

async fn stop_process(mut child: tokio::process::Child) {
    let Some(pid) = child.id() else {
        return;
    };
    debug!(pid, "stopping app process");

    // Graceful first: TERM via the shell, then force-kill after the grace
    // period.
    let _ = tokio::process::Command::new("kill")
        .arg(pid.to_string())
        .status()
        .await;

    match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            let _ = child.kill().await;
        }
    }
}

fn app_failed(message: impl Into<String>) -> InfraError {
    InfraError::AppStartFailed {
        message: message.into(),
    }
}

fn readiness_failed(message: impl Into<String>) -> InfraError {
    InfraError::ReadinessFailed {
        target: String::from("app"),
        message: message.into(),
    }
}

/// The `{{.container.host}}` / `{{.container.port.5432}}` template pattern.
fn template_pattern() -> &'static Regex {
    use std::sync::LazyLock;
    static PATTERN: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\{\{\s*\.(\w+)\.(host|port)(?:\.(\d+(?:/tcp)?))?\s*\}\}")
            .expect("template pattern is valid")
    });
    &PATTERN
}

#[cfg(test)]
mod tests;
