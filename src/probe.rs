//! Readiness probes shared by containers and the system under test.
//!
//! Both container wait gates and app readiness checks reduce to the same four
//! probe kinds with different targets, so there is a single `ReadinessProbe`
//! variant and one evaluator that takes a probe, a deadline, and a
//! cancellation signal. Log tailing and in-container command execution are
//! target-specific, so they sit behind the [`ProbeTarget`] seam; port and
//! HTTP probes address the network directly.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::InfraError;

/// Interval between probe attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Per-attempt budget for network probes.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

/// A readiness check lowered from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessProbe {
    /// TCP connect to `host:port` succeeds.
    Port {
        /// Host to dial.
        host: String,
        /// Port to dial.
        port: u16,
    },

    /// The target's log output contains a substring.
    Log {
        /// Substring to look for.
        needle: String,
    },

    /// An HTTP request to `url` succeeds.
    Http {
        /// Full URL to request.
        url: String,
        /// HTTP method; defaults to GET in the lowering.
        method: String,
        /// Expected status outcome.
        expect: StatusExpectation,
    },

    /// A shell command run against the target exits zero.
    Exec {
        /// Command passed to `sh -c`.
        command: String,
    },

    /// No check; the target is ready as soon as it is running.
    None,
}

/// Expected outcome of an HTTP probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusExpectation {
    /// Any status below 400 (container gates).
    Success,
    /// One exact status (app readiness, default 200).
    Exactly(u16),
}

impl StatusExpectation {
    /// Whether an observed status satisfies the expectation.
    #[must_use]
    pub const fn matches(self, status: u16) -> bool {
        match self {
            Self::Success => status < 400,
            Self::Exactly(expected) => status == expected,
        }
    }
}

/// Target-specific operations a probe may need.
#[async_trait]
pub trait ProbeTarget: Send + Sync {
    /// Log output captured so far.
    async fn logs(&self) -> Result<String, InfraError>;

    /// Run `sh -c command` against the target, returning the exit code.
    async fn exec(&self, command: &str) -> Result<i64, InfraError>;
}

/// Block until the probe passes, the timeout elapses, or cancellation fires.
///
/// Attempts repeat every 500ms. A failing attempt is not fatal; only the
/// deadline or cancellation ends the wait early.
///
/// # Errors
///
/// Returns `InfraError::ReadinessTimeout` when the deadline elapses and
/// `InfraError::Interrupted` when the cancellation token fires.
pub async fn wait_until_ready(
    probe: &ReadinessProbe,
    target: &dyn ProbeTarget,
    name: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), InfraError> {
    if matches!(probe, ReadinessProbe::None) {
        return Ok(());
    }

    let attempts = async {
        loop {
            if probe_once(probe, target).await {
                return;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    };

    tokio::select! {
        () = cancel.cancelled() => Err(InfraError::Interrupted {
            target: String::from(name),
        }),
        outcome = tokio::time::timeout(timeout, attempts) => {
            outcome.map_err(|_| InfraError::ReadinessTimeout {
                target: String::from(name),
                seconds: timeout.as_secs(),
            })
        }
    }
}

/// One probe attempt; `true` means ready.
async fn probe_once(probe: &ReadinessProbe, target: &dyn ProbeTarget) -> bool {
    match probe {
        ReadinessProbe::Port { host, port } => {
            let address = format!("{host}:{port}");
            matches!(
                tokio::time::timeout(ATTEMPT_TIMEOUT, tokio::net::TcpStream::connect(&address))
                    .await,
                Ok(Ok(_))
            )
        }
        ReadinessProbe::Log { needle } => target
            .logs()
            .await
            .is_ok_and(|output| output.contains(needle)),
        ReadinessProbe::Http {
            url,
            method,
            expect,
        } => probe_http(url, method, *expect).await,
        ReadinessProbe::Exec { command } => {
            target.exec(command).await.is_ok_and(|code| code == 0)
        }
        ReadinessProbe::None => true,
    }
}

/// One HTTP probe attempt.
async fn probe_http(url: &str, method: &str, expect: StatusExpectation) -> bool {
    let Ok(client) = reqwest::Client::builder().timeout(ATTEMPT_TIMEOUT).build() else {
        return false;
    };
    let Ok(method) = reqwest::Method::from_bytes(method.as_bytes()) else {
        return false;
    };
    match client.request(method, url).send().await {
        Ok(response) => expect.matches(response.status().as_u16()),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    struct StaticTarget {
        logs: &'static str,
        exit_code: i64,
    }

    #[async_trait]
    impl ProbeTarget for StaticTarget {
        async fn logs(&self) -> Result<String, InfraError> {
            Ok(String::from(self.logs))
        }

        async fn exec(&self, _command: &str) -> Result<i64, InfraError> {
            Ok(self.exit_code)
        }
    }

    #[rstest]
    #[case(StatusExpectation::Success, 200, true)]
    #[case(StatusExpectation::Success, 399, true)]
    #[case(StatusExpectation::Success, 400, false)]
    #[case(StatusExpectation::Exactly(204), 204, true)]
    #[case(StatusExpectation::Exactly(204), 200, false)]
    fn status_expectation_matches(
        #[case] expect: StatusExpectation,
        #[case] status: u16,
        #[case] ready: bool,
    ) {
        assert_eq!(expect.matches(status), ready);
    }

    #[rstest]
    #[tokio::test]
    async fn none_probe_is_immediately_ready() {
        let target = StaticTarget {
            logs: "",
            exit_code: 1,
        };
        let cancel = CancellationToken::new();
        wait_until_ready(
            &ReadinessProbe::None,
            &target,
            "app",
            Duration::from_millis(10),
            &cancel,
        )
        .await
        .expect("none probe never waits");
    }

    #[rstest]
    #[tokio::test]
    async fn log_probe_matches_substring() {
        let target = StaticTarget {
            logs: "database system is ready to accept connections",
            exit_code: 0,
        };
        let cancel = CancellationToken::new();
        wait_until_ready(
            &ReadinessProbe::Log {
                needle: String::from("ready to accept"),
            },
            &target,
            "postgres",
            Duration::from_secs(1),
            &cancel,
        )
        .await
        .expect("log contains the needle");
    }

    #[rstest]
    #[tokio::test]
    async fn exec_probe_requires_zero_exit() {
        let failing = StaticTarget {
            logs: "",
            exit_code: 7,
        };
        let cancel = CancellationToken::new();
        let error = wait_until_ready(
            &ReadinessProbe::Exec {
                command: String::from("pg_isready"),
            },
            &failing,
            "postgres",
            Duration::from_millis(600),
            &cancel,
        )
        .await
        .expect_err("non-zero exit never becomes ready");
        assert!(matches!(error, InfraError::ReadinessTimeout { .. }));
    }

    #[rstest]
    #[tokio::test]
    async fn port_probe_times_out_when_nothing_listens() {
        let target = StaticTarget {
            logs: "",
            exit_code: 0,
        };
        let cancel = CancellationToken::new();
        let error = wait_until_ready(
            &ReadinessProbe::Port {
                host: String::from("127.0.0.1"),
                // Reserved port that should not be listening.
                port: 1,
            },
            &target,
            "db",
            Duration::from_millis(600),
            &cancel,
        )
        .await
        .expect_err("closed port never becomes ready");
        assert!(matches!(error, InfraError::ReadinessTimeout { .. }));
    }

    #[rstest]
    #[tokio::test]
    async fn port_probe_succeeds_against_live_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind ephemeral port");
        let port = listener.local_addr().expect("local addr").port();

        let target = StaticTarget {
            logs: "",
            exit_code: 0,
        };
        let cancel = CancellationToken::new();
        wait_until_ready(
            &ReadinessProbe::Port {
                host: String::from("127.0.0.1"),
                port,
            },
            &target,
            "db",
            Duration::from_secs(2),
            &cancel,
        )
        .await
        .expect("live listener is ready");
    }

    #[rstest]
    #[tokio::test]
    async fn cancellation_interrupts_the_wait() {
        let target = StaticTarget {
            logs: "",
            exit_code: 1,
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let error = wait_until_ready(
            &ReadinessProbe::Exec {
                command: String::from("true"),
            },
            &target,
            "kafka",
            Duration::from_secs(5),
            &cancel,
        )
        .await
        .expect_err("cancelled wait returns interrupted");
        assert!(matches!(error, InfraError::Interrupted { .. }));
    }
}
