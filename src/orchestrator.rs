//! Container orchestration over the Docker API.
//!
//! The orchestrator owns the declared dependency containers for one run: it
//! computes a deterministic startup order, brings each container up behind
//! its readiness gate, exposes dynamically-assigned host/port mappings, runs
//! commands inside containers, and tears everything down in reverse order.
//!
//! All containers share one per-run bridge network, with each container's
//! configured name as its DNS alias, so a dockerised system under test can
//! reach `postgres:5432` while the test driver reaches the published host
//! port.

mod connect;
mod graph;

pub use connect::{SocketResolver, connect_lazy, connect_verified, resolve_socket};

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::models::{
    ContainerCreateBody, EndpointSettings, HostConfig, NetworkCreateRequest, NetworkingConfig,
};
use bollard::query_parameters::{
    BuildImageOptionsBuilder, CreateContainerOptionsBuilder, CreateImageOptionsBuilder,
    LogsOptionsBuilder, RemoveContainerOptionsBuilder, StopContainerOptionsBuilder,
};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{ContainerSpec, WaitFor};
use crate::error::{GraphError, InfraError};
use crate::probe::{self, ProbeTarget, ReadinessProbe, StatusExpectation};
use crate::runlog::RunContext;

/// Default readiness gate timeout.
const DEFAULT_GATE_TIMEOUT: Duration = Duration::from_secs(60);

/// Grace period given to a container on stop before it is killed.
const STOP_GRACE_SECONDS: i32 = 10;

/// Poll interval while waiting for an exec session to finish.
const EXEC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Manages the lifecycle of the run's dependency containers.
pub struct Orchestrator {
    docker: Docker,
    specs: BTreeMap<String, ContainerSpec>,
    order: Vec<String>,
    host: String,
    run_id: String,
    ids: Mutex<HashMap<String, String>>,
    network: Mutex<Option<String>>,
    run_log: Mutex<Option<Arc<RunContext>>>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Build an orchestrator for the declared containers.
    ///
    /// Computes the startup order eagerly so an invalid graph fails before
    /// anything is created.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::CircularDependency` when `depends_on` edges form
    /// a cycle.
    pub fn new(
        docker: Docker,
        specs: BTreeMap<String, ContainerSpec>,
        cancel: CancellationToken,
    ) -> Result<Self, GraphError> {
        let order = graph::start_order(&specs)?;
        let short_id: String = uuid::Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(8)
            .collect();

        Ok(Self {
            docker,
            specs,
            order,
            host: connect::daemon_host(&mockable::DefaultEnv::new()),
            run_id: short_id,
            ids: Mutex::new(HashMap::new()),
            network: Mutex::new(None),
            run_log: Mutex::new(None),
            cancel,
        })
    }

    /// Attach a run context so container logs are captured to files.
    pub fn set_run_context(&self, run_log: Arc<RunContext>) {
        if let Ok(mut slot) = self.run_log.lock() {
            *slot = Some(run_log);
        }
    }

    /// The computed startup order.
    #[must_use]
    pub fn start_order(&self) -> &[String] {
        &self.order
    }

    /// The name of the per-run bridge network.
    #[must_use]
    pub fn network_name(&self) -> String {
        format!("tomato-{}", self.run_id)
    }

    /// A handle to the underlying Docker client, shared with the app runner.
    #[must_use]
    pub fn docker_handle(&self) -> Docker {
        self.docker.clone()
    }

    /// The daemon host the test driver dials for published ports.
    #[must_use]
    pub fn daemon_host(&self) -> &str {
        &self.host
    }

    /// Start every container in dependency order, gating each on readiness.
    ///
    /// On the first failure the already-started set stays recorded so
    /// [`Self::stop_all`] can tear it down.
    ///
    /// # Errors
    ///
    /// Returns `InfraError` when the network, an image, a container, or a
    /// readiness gate fails.
    pub async fn start_all(&self) -> Result<(), InfraError> {
        self.create_network().await?;
        for name in &self.order {
            self.start_one(name).await?;
        }
        Ok(())
    }

    /// Stop and remove every started container in reverse startup order,
    /// then remove the network. Failures are logged, not propagated: the
    /// teardown path must visit everything.
    pub async fn stop_all(&self) {
        for name in self.order.iter().rev() {
            let id = {
                self.ids
                    .lock()
                    .ok()
                    .and_then(|mut ids| ids.remove(name.as_str()))
            };
            let Some(id) = id else { continue };

            debug!(container = %name, "stopping container");
            let stop = StopContainerOptionsBuilder::new().t(STOP_GRACE_SECONDS).build();
            if let Err(error) = self.docker.stop_container(&id, Some(stop)).await {
                warn!(container = %name, %error, "failed to stop container");
            }
            let remove = RemoveContainerOptionsBuilder::new().force(true).v(true).build();
            if let Err(error) = self.docker.remove_container(&id, Some(remove)).await {
                warn!(container = %name, %error, "failed to remove container");
            }
        }

        let network = self.network.lock().ok().and_then(|mut slot| slot.take());
        if let Some(network) = network {
            debug!(%network, "removing docker network");
            if let Err(error) = self.docker.remove_network(&network).await {
                warn!(%network, %error, "failed to remove network");
            }
        }
    }

    /// Host address the test driver should use to reach published ports.
    ///
    /// # Errors
    ///
    /// Returns `InfraError::ContainerNotFound` for unmanaged names.
    pub fn host(&self, name: &str) -> Result<String, InfraError> {
        self.container_id(name)?;
        Ok(self.host.clone())
    }

    /// Host-side port published for a container-side port (`"5432"` or
    /// `"5432/tcp"`).
    ///
    /// # Errors
    ///
    /// Returns `InfraError::PortLookupFailed` when the mapping does not
    /// exist yet, and `InfraError::ContainerNotFound` for unmanaged names.
    pub async fn port(&self, name: &str, container_port: &str) -> Result<u16, InfraError> {
        let id = self.container_id(name)?;
        let key = normalize_port(container_port);

        let inspect = self
            .docker
            .inspect_container(&id, None::<bollard::query_parameters::InspectContainerOptions>)
            .await
            .map_err(|_| InfraError::PortLookupFailed {
                container: String::from(name),
                port: key.clone(),
            })?;

        inspect
            .network_settings
            .and_then(|settings| settings.ports)
            .and_then(|ports| ports.get(&key).cloned().flatten())
            .and_then(|bindings| {
                bindings
                    .iter()
                    .find_map(|binding| binding.host_port.as_deref()?.parse::<u16>().ok())
            })
            .ok_or_else(|| InfraError::PortLookupFailed {
                container: String::from(name),
                port: key,
            })
    }

    /// `host:port` for a container's published port.
    ///
    /// # Errors
    ///
    /// Propagates [`Self::host`] and [`Self::port`] failures.
    pub async fn connection_string(
        &self,
        name: &str,
        container_port: &str,
    ) -> Result<String, InfraError> {
        let host = self.host(name)?;
        let port = self.port(name, container_port).await?;
        Ok(format!("{host}:{port}"))
    }

    /// Run a command inside a container, returning its exit code and
    /// combined output.
    ///
    /// # Errors
    ///
    /// Returns `InfraError::ExecFailed` when the exec session cannot be
    /// created or inspected.
    pub async fn exec(&self, name: &str, argv: &[String]) -> Result<(i64, String), InfraError> {
        let id = self.container_id(name)?;
        let exec_failed = |message: String| InfraError::ExecFailed {
            container: String::from(name),
            message,
        };

        let options = bollard::exec::CreateExecOptions::<String> {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(argv.to_vec()),
            ..Default::default()
        };
        let created = self
            .docker
            .create_exec(&id, options)
            .await
            .map_err(|e| exec_failed(format!("create exec failed: {e}")))?;

        let started = self
            .docker
            .start_exec(&created.id, None::<bollard::exec::StartExecOptions>)
            .await
            .map_err(|e| exec_failed(format!("start exec failed: {e}")))?;

        let mut output = String::new();
        if let bollard::exec::StartExecResults::Attached {
            output: mut frames, ..
        } = started
        {
            while let Some(frame) = frames.next().await {
                match frame {
                    Ok(chunk) => output.push_str(&chunk.to_string()),
                    Err(error) => {
                        debug!(container = name, %error, "exec output stream ended");
                        break;
                    }
                }
            }
        }

        loop {
            let inspect = self
                .docker
                .inspect_exec(&created.id)
                .await
                .map_err(|e| exec_failed(format!("inspect exec failed: {e}")))?;
            if inspect.running != Some(true) {
                return Ok((inspect.exit_code.unwrap_or(-1), output));
            }
            tokio::time::sleep(EXEC_POLL_INTERVAL).await;
        }
    }

    /// Captured log output of a container so far.
    ///
    /// # Errors
    ///
    /// Returns `InfraError::ContainerNotFound` for unmanaged names.
    pub async fn logs(&self, name: &str) -> Result<String, InfraError> {
        let id = self.container_id(name)?;
        let options = LogsOptionsBuilder::new().stdout(true).stderr(true).build();
        let mut stream = self.docker.logs(&id, Some(options));

        let mut collected = String::new();
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(chunk) => collected.push_str(&chunk.to_string()),
                Err(_) => break,
            }
        }
        Ok(collected)
    }

    // =========================================================================
    // Startup internals
    // =========================================================================

    async fn create_network(&self) -> Result<(), InfraError> {
        let name = self.network_name();
        debug!(network = %name, "creating docker network");

        let request = NetworkCreateRequest {
            name: name.clone(),
            driver: Some(String::from("bridge")),
            ..Default::default()
        };
        self.docker
            .create_network(request)
            .await
            .map_err(|e| InfraError::EngineUnavailable {
                message: format!("creating network: {e}"),
            })?;

        if let Ok(mut slot) = self.network.lock() {
            *slot = Some(name);
        }
        Ok(())
    }

    async fn start_one(&self, name: &str) -> Result<(), InfraError> {
        let spec = self
            .specs
            .get(name)
            .ok_or_else(|| InfraError::ContainerNotFound {
                container: String::from(name),
            })?
            .clone();

        let image = self.prepare_image(name, &spec).await?;
        debug!(container = %name, image = %image, "starting container");
        let started_at = std::time::Instant::now();

        let container_name = format!("tomato-{}-{name}", self.run_id);
        let options = CreateContainerOptionsBuilder::new()
            .name(&container_name)
            .build();
        let body = self.build_create_body(name, &spec, &image);

        let created = self
            .docker
            .create_container(Some(options), body)
            .await
            .map_err(|e| InfraError::ContainerStartFailed {
                container: String::from(name),
                message: format!("create failed: {e}"),
            })?;

        if let Ok(mut ids) = self.ids.lock() {
            ids.insert(String::from(name), created.id.clone());
        }

        self.docker
            .start_container(&created.id, None::<bollard::query_parameters::StartContainerOptions>)
            .await
            .map_err(|e| InfraError::ContainerStartFailed {
                container: String::from(name),
                message: format!("start failed: {e}"),
            })?;

        self.spawn_log_capture(name, &created.id);
        self.wait_for_gate(name, &spec.wait_for).await?;

        debug!(
            container = %name,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "container ready"
        );
        Ok(())
    }

    /// Resolve the image to run: pull a referenced image, or build one from
    /// the declared Dockerfile tagged `tomato-<name>:test`.
    async fn prepare_image(&self, name: &str, spec: &ContainerSpec) -> Result<String, InfraError> {
        if let Some(image) = &spec.image {
            self.pull_image(name, image).await?;
            return Ok(image.clone());
        }

        let build = spec
            .build
            .as_ref()
            .ok_or_else(|| InfraError::ImageFailed {
                target: String::from(name),
                message: String::from("neither image nor build declared"),
            })?;
        let tag = format!("tomato-{name}:test");
        build_image_from_dockerfile(
            &self.docker,
            name,
            build.dockerfile.as_str(),
            build.context.as_ref().map_or(".", |p| p.as_str()),
            &tag,
        )
        .await?;
        Ok(tag)
    }

    async fn pull_image(&self, name: &str, image: &str) -> Result<(), InfraError> {
        debug!(container = %name, %image, "pulling image");
        let options = CreateImageOptionsBuilder::new().from_image(image).build();
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            progress.map_err(|e| InfraError::ImageFailed {
                target: String::from(name),
                message: format!("pulling {image}: {e}"),
            })?;
        }
        Ok(())
    }

    fn build_create_body(
        &self,
        name: &str,
        spec: &ContainerSpec,
        image: &str,
    ) -> ContainerCreateBody {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();

        let exposed_ports: Vec<String> = spec
            .ports
            .iter()
            .map(|port| normalize_port(port))
            .collect();

        let endpoints: HashMap<String, EndpointSettings> = std::iter::once((
            self.network_name(),
            EndpointSettings {
                aliases: Some(vec![String::from(name)]),
                ..Default::default()
            },
        ))
        .collect();

        ContainerCreateBody {
            image: Some(String::from(image)),
            env: (!env.is_empty()).then_some(env),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            host_config: Some(HostConfig {
                publish_all_ports: Some(true),
                binds: (!spec.volumes.is_empty()).then(|| spec.volumes.clone()),
                ..Default::default()
            }),
            networking_config: Some(NetworkingConfig {
                endpoints_config: Some(endpoints),
            }),
            ..Default::default()
        }
    }

    /// Stream follow-mode logs into the run directory, when one is attached.
    fn spawn_log_capture(&self, name: &str, id: &str) {
        let run_log = self
            .run_log
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().cloned());
        let Some(run_log) = run_log else { return };

        let path = run_log.log_path(&format!("container-{name}"));
        let docker = self.docker.clone();
        let id = String::from(id);
        let name = String::from(name);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let Ok(mut file) = tokio::fs::File::create(path.as_std_path()).await else {
                warn!(container = %name, "failed to create container log file");
                return;
            };

            let options = LogsOptionsBuilder::new()
                .follow(true)
                .stdout(true)
                .stderr(true)
                .build();
            let mut stream = docker.logs(&id, Some(options));

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    frame = stream.next() => match frame {
                        Some(Ok(chunk)) => {
                            use tokio::io::AsyncWriteExt;
                            if file.write_all(chunk.to_string().as_bytes()).await.is_err() {
                                break;
                            }
                        }
                        _ => break,
                    },
                }
            }
        });
    }

    async fn wait_for_gate(&self, name: &str, wait: &WaitFor) -> Result<(), InfraError> {
        let probe = self.lower_wait_strategy(name, wait).await?;
        let timeout = wait.timeout.unwrap_or(DEFAULT_GATE_TIMEOUT);
        let target = ContainerProbeTarget {
            orchestrator: self,
            name: String::from(name),
        };
        probe::wait_until_ready(&probe, &target, name, timeout, &self.cancel).await
    }

    /// Lower a configured wait strategy to a concrete probe against this
    /// container's published mappings.
    async fn lower_wait_strategy(
        &self,
        name: &str,
        wait: &WaitFor,
    ) -> Result<ReadinessProbe, InfraError> {
        match wait.kind.as_str() {
            "port" => {
                let port = self.port_with_retry(name, &wait.target).await?;
                Ok(ReadinessProbe::Port {
                    host: self.host(name)?,
                    port,
                })
            }
            "log" => Ok(ReadinessProbe::Log {
                needle: wait.target.clone(),
            }),
            "http" => {
                let port = self.port_with_retry(name, &wait.target).await?;
                let path = wait.path.as_deref().unwrap_or("/");
                Ok(ReadinessProbe::Http {
                    url: format!("http://{}:{port}{path}", self.host(name)?),
                    method: wait.method.clone().unwrap_or_else(|| String::from("GET")),
                    expect: StatusExpectation::Success,
                })
            }
            "exec" => Ok(ReadinessProbe::Exec {
                command: wait.target.clone(),
            }),
            _ => Ok(ReadinessProbe::None),
        }
    }

    /// Port lookup with a short retry: the daemon may publish mappings a
    /// moment after start returns.
    async fn port_with_retry(&self, name: &str, container_port: &str) -> Result<u16, InfraError> {
        let mut last_error = None;
        for _ in 0..10 {
            match self.port(name, container_port).await {
                Ok(port) => return Ok(port),
                Err(error) => {
                    last_error = Some(error);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
        }
        Err(last_error.unwrap_or_else(|| InfraError::PortLookupFailed {
            container: String::from(name),
            port: normalize_port(container_port),
        }))
    }

    fn container_id(&self, name: &str) -> Result<String, InfraError> {
        self.ids
            .lock()
            .ok()
            .and_then(|ids| ids.get(name).cloned())
            .ok_or_else(|| InfraError::ContainerNotFound {
                container: String::from(name),
            })
    }
}

/// Probe adapter binding log/exec attempts to one managed container.
struct ContainerProbeTarget<'a> {
    orchestrator: &'a Orchestrator,
    name: String,
}

#[async_trait]
impl ProbeTarget for ContainerProbeTarget<'_> {
    async fn logs(&self) -> Result<String, InfraError> {
        self.orchestrator.logs(&self.name).await
    }

    async fn exec(&self, command: &str) -> Result<i64, InfraError> {
        let argv = vec![
            String::from("sh"),
            String::from("-c"),
            String::from(command),
        ];
        let (code, _) = self.orchestrator.exec(&self.name, &argv).await?;
        Ok(code)
    }
}

/// Build an image from a Dockerfile, shipping the context directory as a tar
/// archive. Shared with the app runner's docker mode.
pub(crate) async fn build_image_from_dockerfile(
    docker: &Docker,
    target: &str,
    dockerfile: &str,
    context: &str,
    tag: &str,
) -> Result<(), InfraError> {
    let image_failed = |message: String| InfraError::ImageFailed {
        target: String::from(target),
        message,
    };

    let mut archive = tar::Builder::new(Vec::new());
    archive
        .append_dir_all(".", context)
        .map_err(|e| image_failed(format!("archiving build context '{context}': {e}")))?;
    let tarball = archive
        .into_inner()
        .map_err(|e| image_failed(format!("finalising build context: {e}")))?;

    let options = BuildImageOptionsBuilder::new()
        .dockerfile(dockerfile)
        .t(tag)
        .build();
    let mut stream = docker.build_image(
        options,
        None,
        Some(bollard::body_full(bytes::Bytes::from(tarball))),
    );
    while let Some(progress) = stream.next().await {
        progress.map_err(|e| image_failed(format!("building {tag}: {e}")))?;
    }
    Ok(())
}

/// Normalise a container port to `PORT/tcp` form.
#[must_use]
pub fn normalize_port(port: &str) -> String {
    if port.contains('/') {
        String::from(port)
    } else {
        format!("{port}/tcp")
    }
}
