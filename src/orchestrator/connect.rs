//! Container engine socket resolution and connection.
//!
//! Resolves the Docker/Podman socket endpoint from the environment and
//! establishes a verified connection (connect, then ping) so a stopped
//! daemon is reported before any container work starts.

use std::time::Duration;

use bollard::Docker;
use mockable::Env;

use crate::error::InfraError;

/// Environment variable names checked in fallback order.
const FALLBACK_ENV_VARS: &[&str] = &["DOCKER_HOST", "CONTAINER_HOST", "PODMAN_HOST"];

/// Connection timeout in seconds for Docker/Podman API connections.
const CONNECTION_TIMEOUT_SECS: u64 = 120;

/// Timeout for the post-connect ping.
const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Default socket path for Unix platforms.
#[cfg(unix)]
const DEFAULT_SOCKET: &str = "unix:///var/run/docker.sock";

/// Default socket path for Windows platforms.
#[cfg(windows)]
const DEFAULT_SOCKET: &str = "npipe:////./pipe/docker_engine";

/// Resolves container engine socket endpoints from environment variables.
pub struct SocketResolver<'a, E: Env> {
    env: &'a E,
}

impl<'a, E: Env> SocketResolver<'a, E> {
    /// Creates a new socket resolver with the given environment provider.
    #[must_use]
    pub const fn new(env: &'a E) -> Self {
        Self { env }
    }

    /// Resolves the socket endpoint from fallback environment variables,
    /// checking `DOCKER_HOST`, `CONTAINER_HOST`, then `PODMAN_HOST`.
    #[must_use]
    pub fn resolve_from_env(&self) -> Option<String> {
        FALLBACK_ENV_VARS
            .iter()
            .filter_map(|var_name| self.env.string(var_name))
            .find(|value| !value.is_empty())
    }

    /// Returns the platform default socket path.
    #[must_use]
    pub const fn default_socket() -> &'static str {
        DEFAULT_SOCKET
    }
}

/// Resolve the socket endpoint without connecting: explicit value first,
/// then environment fallbacks, then the platform default.
#[must_use]
pub fn resolve_socket<E: Env>(explicit: Option<&str>, env: &E) -> String {
    explicit
        .filter(|value| !value.is_empty())
        .map(String::from)
        .or_else(|| SocketResolver::new(env).resolve_from_env())
        .unwrap_or_else(|| String::from(SocketResolver::<E>::default_socket()))
}

/// The host the test driver should dial for published container ports.
///
/// A TCP/HTTP daemon endpoint implies a possibly-remote host; a socket
/// endpoint means the daemon (and its published ports) are local.
#[must_use]
pub fn daemon_host<E: Env>(env: &E) -> String {
    let socket = resolve_socket(None, env);
    for scheme in ["tcp://", "http://", "https://"] {
        if let Some(rest) = socket.strip_prefix(scheme) {
            let host = rest.split(':').next().unwrap_or(rest);
            if !host.is_empty() {
                return String::from(host);
            }
        }
    }
    String::from("localhost")
}

/// Connect to the container engine and verify it responds to a ping.
///
/// Supports `unix://`, `npipe://`, `tcp://` (rewritten to HTTP), `http://`,
/// `https://`, and bare socket paths.
///
/// # Errors
///
/// Returns `InfraError::EngineUnavailable` when the connection cannot be
/// established or the daemon does not answer the ping in time.
pub async fn connect_verified(socket: &str) -> Result<Docker, InfraError> {
    let docker = connect_lazy(socket)?;

    tokio::time::timeout(PING_TIMEOUT, docker.ping())
        .await
        .map_err(|_| InfraError::EngineUnavailable {
            message: format!("daemon did not answer ping within {}s", PING_TIMEOUT.as_secs()),
        })?
        .map_err(|e| InfraError::EngineUnavailable {
            message: e.to_string(),
        })?;

    Ok(docker)
}

/// Build a client for the endpoint without contacting the daemon.
///
/// Useful when the run declares no containers: the client is only needed
/// for type plumbing and must not require a live daemon.
///
/// # Errors
///
/// Returns `InfraError::EngineUnavailable` for malformed endpoints.
pub fn connect_lazy(socket: &str) -> Result<Docker, InfraError> {
    let is_socket_scheme = socket.starts_with("unix://") || socket.starts_with("npipe://");
    let is_http_scheme = socket.starts_with("tcp://")
        || socket.starts_with("http://")
        || socket.starts_with("https://");

    let connected = if is_socket_scheme {
        Docker::connect_with_socket(socket, CONNECTION_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
    } else if is_http_scheme {
        // Rewrite tcp:// to http:// for Bollard compatibility.
        let http_socket = if socket.starts_with("tcp://") {
            socket.replacen("tcp://", "http://", 1)
        } else {
            String::from(socket)
        };
        Docker::connect_with_http(
            &http_socket,
            CONNECTION_TIMEOUT_SECS,
            bollard::API_DEFAULT_VERSION,
        )
    } else {
        let socket_uri = normalize_bare_path(socket);
        Docker::connect_with_socket(
            &socket_uri,
            CONNECTION_TIMEOUT_SECS,
            bollard::API_DEFAULT_VERSION,
        )
    };

    connected.map_err(|e| InfraError::EngineUnavailable {
        message: e.to_string(),
    })
}

/// Normalize a bare socket path to a URI with the appropriate scheme.
///
/// Detection is syntax-based, not platform-based: paths starting with `\\`
/// or `//` are treated as Windows named pipes, everything else as a Unix
/// socket.
fn normalize_bare_path(path: &str) -> String {
    if path.starts_with("\\\\") || path.starts_with("//") {
        format!("npipe://{path}")
    } else {
        format!("unix://{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockable::MockEnv;
    use rstest::rstest;

    fn env_with(values: &'static [(&'static str, &'static str)]) -> MockEnv {
        let mut env = MockEnv::new();
        env.expect_string().returning(move |name| {
            values
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| String::from(*value))
        });
        env
    }

    #[rstest]
    fn explicit_socket_wins_over_environment() {
        let env = env_with(&[("DOCKER_HOST", "tcp://elsewhere:2375")]);
        let socket = resolve_socket(Some("unix:///custom.sock"), &env);
        assert_eq!(socket, "unix:///custom.sock");
    }

    #[rstest]
    fn docker_host_is_preferred_fallback() {
        let env = env_with(&[
            ("DOCKER_HOST", "tcp://one:2375"),
            ("PODMAN_HOST", "tcp://two:2375"),
        ]);
        let socket = resolve_socket(None, &env);
        assert_eq!(socket, "tcp://one:2375");
    }

    #[rstest]
    fn empty_environment_yields_platform_default() {
        let env = env_with(&[]);
        let socket = resolve_socket(None, &env);
        assert_eq!(socket, SocketResolver::<MockEnv>::default_socket());
    }

    #[rstest]
    #[case(&[], "localhost")]
    #[case(&[("DOCKER_HOST", "tcp://build-host:2375")], "build-host")]
    #[case(&[("DOCKER_HOST", "unix:///var/run/docker.sock")], "localhost")]
    fn daemon_host_extracts_remote_hosts(
        #[case] values: &'static [(&'static str, &'static str)],
        #[case] expected: &str,
    ) {
        let env = env_with(values);
        assert_eq!(daemon_host(&env), expected);
    }

    #[rstest]
    #[case("/var/run/docker.sock", "unix:///var/run/docker.sock")]
    #[case("//./pipe/docker_engine", "npipe:////./pipe/docker_engine")]
    fn bare_paths_gain_a_scheme(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize_bare_path(input), expected);
    }
}
