//! Shell resource handler.
//!
//! Runs commands on the host through `sh -c` with per-handler working
//! directory, environment, and timeout state, then asserts on the captured
//! exit code, stdout, stderr, and resulting files. Relative file paths
//! resolve against the configured working directory. The process's full
//! environment is inherited, with the handler's variables layered on top.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use camino::Utf8PathBuf;

use crate::error::{CleanupError, InfraError, StepError};

use super::stepdef::{StepArgs, StepCategory, StepDef};
use super::{Handler, HandlerDeps};
use crate::config::ResourceSpec;

/// Command timeout when neither the resource nor the step sets one.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

mod action {
    pub const SET_ENV: &str = "set-env";
    pub const SET_WORKDIR: &str = "set-workdir";
    pub const RUN_DOCSTRING: &str = "run-docstring";
    pub const RUN_INLINE: &str = "run-inline";
    pub const RUN_SCRIPT: &str = "run-script";
    pub const RUN_WITH_TIMEOUT: &str = "run-with-timeout";
    pub const EXIT_CODE_IS: &str = "exit-code-is";
    pub const SUCCEEDS: &str = "succeeds";
    pub const FAILS: &str = "fails";
    pub const STDOUT_CONTAINS: &str = "stdout-contains";
    pub const STDOUT_NOT_CONTAINS: &str = "stdout-not-contains";
    pub const STDOUT_IS: &str = "stdout-is";
    pub const STDOUT_EMPTY: &str = "stdout-empty";
    pub const STDERR_CONTAINS: &str = "stderr-contains";
    pub const STDERR_EMPTY: &str = "stderr-empty";
    pub const FILE_EXISTS: &str = "file-exists";
    pub const FILE_NOT_EXISTS: &str = "file-not-exists";
    pub const FILE_CONTAINS: &str = "file-contains";
}

/// The shell step vocabulary.
#[allow(clippy::too_many_lines, reason = "one entry per vocabulary step")]
pub(super) fn vocabulary() -> StepCategory {
    StepCategory {
        name: "Shell",
        description: "Steps for running host commands and asserting their output",
        steps: vec![
            StepDef {
                group: "Setup",
                pattern: r#"^I set "{resource}" environment variable "([^"]*)" to "([^"]*)"$"#,
                description: "Sets an environment variable for later commands",
                example: "I set \"{resource}\" environment variable \"LOG_LEVEL\" to \"debug\"",
                action: action::SET_ENV,
            },
            StepDef {
                group: "Setup",
                pattern: r#"^I set "{resource}" working directory to "([^"]*)"$"#,
                description: "Sets the working directory for later commands",
                example: "I set \"{resource}\" working directory to \"/tmp/build\"",
                action: action::SET_WORKDIR,
            },
            StepDef {
                group: "Execution",
                pattern: r#"^I run command on "{resource}":$"#,
                description: "Runs a docstring command",
                example: "I run command on \"{resource}\":\n  \"\"\"\n  make build\n  \"\"\"",
                action: action::RUN_DOCSTRING,
            },
            StepDef {
                group: "Execution",
                pattern: r#"^I run "([^"]*)" on "{resource}"$"#,
                description: "Runs an inline command",
                example: "I run \"ls -la\" on \"{resource}\"",
                action: action::RUN_INLINE,
            },
            StepDef {
                group: "Execution",
                pattern: r#"^I run script "([^"]*)" on "{resource}"$"#,
                description: "Runs a script file",
                example: "I run script \"scripts/seed.sh\" on \"{resource}\"",
                action: action::RUN_SCRIPT,
            },
            StepDef {
                group: "Execution",
                pattern: r#"^I run command on "{resource}" with timeout "([^"]*)":$"#,
                description: "Runs a docstring command with a per-invocation timeout",
                example: "I run command on \"{resource}\" with timeout \"2m\":\n  \"\"\"\n  make slow-task\n  \"\"\"",
                action: action::RUN_WITH_TIMEOUT,
            },
            StepDef {
                group: "Exit Code",
                pattern: r#"^"{resource}" exit code should be "(\d+)"$"#,
                description: "Asserts the last exit code",
                example: "\"{resource}\" exit code should be \"0\"",
                action: action::EXIT_CODE_IS,
            },
            StepDef {
                group: "Exit Code",
                pattern: r#"^"{resource}" should succeed$"#,
                description: "Asserts the last command exited zero",
                example: "\"{resource}\" should succeed",
                action: action::SUCCEEDS,
            },
            StepDef {
                group: "Exit Code",
                pattern: r#"^"{resource}" should fail$"#,
                description: "Asserts the last command exited non-zero",
                example: "\"{resource}\" should fail",
                action: action::FAILS,
            },
            StepDef {
                group: "Output",
                pattern: r#"^"{resource}" stdout should contain "([^"]*)"$"#,
                description: "Asserts stdout contains a value",
                example: "\"{resource}\" stdout should contain \"done\"",
                action: action::STDOUT_CONTAINS,
            },
            StepDef {
                group: "Output",
                pattern: r#"^"{resource}" stdout should not contain "([^"]*)"$"#,
                description: "Asserts stdout does not contain a value",
                example: "\"{resource}\" stdout should not contain \"error\"",
                action: action::STDOUT_NOT_CONTAINS,
            },
            StepDef {
                group: "Output",
                pattern: r#"^"{resource}" stdout should be:$"#,
                description: "Asserts stdout exactly (whitespace-trimmed)",
                example: "\"{resource}\" stdout should be:\n  \"\"\"\n  done\n  \"\"\"",
                action: action::STDOUT_IS,
            },
            StepDef {
                group: "Output",
                pattern: r#"^"{resource}" stdout should be empty$"#,
                description: "Asserts stdout is empty",
                example: "\"{resource}\" stdout should be empty",
                action: action::STDOUT_EMPTY,
            },
            StepDef {
                group: "Output",
                pattern: r#"^"{resource}" stderr should contain "([^"]*)"$"#,
                description: "Asserts stderr contains a value",
                example: "\"{resource}\" stderr should contain \"warning\"",
                action: action::STDERR_CONTAINS,
            },
            StepDef {
                group: "Output",
                pattern: r#"^"{resource}" stderr should be empty$"#,
                description: "Asserts stderr is empty",
                example: "\"{resource}\" stderr should be empty",
                action: action::STDERR_EMPTY,
            },
            StepDef {
                group: "Files",
                pattern: r#"^"{resource}" file "([^"]*)" should exist$"#,
                description: "Asserts a file exists (workdir-relative)",
                example: "\"{resource}\" file \"out/report.txt\" should exist",
                action: action::FILE_EXISTS,
            },
            StepDef {
                group: "Files",
                pattern: r#"^"{resource}" file "([^"]*)" should not exist$"#,
                description: "Asserts a file is absent (workdir-relative)",
                example: "\"{resource}\" file \"out/report.txt\" should not exist",
                action: action::FILE_NOT_EXISTS,
            },
            StepDef {
                group: "Files",
                pattern: r#"^"{resource}" file "([^"]*)" should contain "([^"]*)"$"#,
                description: "Asserts a file contains a value (workdir-relative)",
                example: "\"{resource}\" file \"out/report.txt\" should contain \"passed\"",
                action: action::FILE_CONTAINS,
            },
        ],
    }
}

/// Handler for one declared `shell` resource.
pub struct Shell {
    name: String,
    spec: ResourceSpec,
    #[allow(dead_code, reason = "kept for parity with other handlers' wiring")]
    deps: HandlerDeps,
    env: BTreeMap<String, String>,
    workdir: Option<Utf8PathBuf>,
    timeout: Duration,
    last_exit_code: i64,
    last_stdout: String,
    last_stderr: String,
}

impl Shell {
    /// Create the handler with its configured workdir and timeout.
    #[must_use]
    pub fn new(name: String, spec: ResourceSpec, deps: HandlerDeps) -> Self {
        let timeout = spec.opt_duration("timeout").unwrap_or(DEFAULT_TIMEOUT);
        let workdir = spec.opt_str("workdir").map(Utf8PathBuf::from);

        Self {
            name,
            spec,
            deps,
            env: BTreeMap::new(),
            workdir,
            timeout,
            last_exit_code: 0,
            last_stdout: String::new(),
            last_stderr: String::new(),
        }
    }

    async fn execute(&mut self, command: &str, timeout: Duration) -> Result<(), StepError> {
        let mut builder = tokio::process::Command::new("sh");
        builder
            .arg("-c")
            .arg(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(workdir) = &self.workdir {
            builder.current_dir(workdir.as_std_path());
        }
        for (key, value) in &self.env {
            builder.env(key, value);
        }

        let child = builder
            .spawn()
            .map_err(|e| StepError::backend(format!("spawning command: {e}")))?;

        let output = tokio::time::timeout(timeout, child.wait_with_output()).await;
        match output {
            Ok(Ok(output)) => {
                self.last_stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                self.last_stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                self.last_exit_code = i64::from(output.status.code().unwrap_or(-1));
                Ok(())
            }
            Ok(Err(error)) => {
                self.last_exit_code = -1;
                Err(StepError::backend(format!("running command: {error}")))
            }
            Err(_) => {
                self.last_exit_code = -1;
                Err(StepError::TimedOut {
                    message: format!(
                        "command timed out after {}",
                        humantime::format_duration(timeout)
                    ),
                })
            }
        }
    }

    fn resolve_path(&self, path: &str) -> Utf8PathBuf {
        let candidate = Utf8PathBuf::from(path);
        match &self.workdir {
            Some(workdir) if candidate.is_relative() => workdir.join(candidate),
            _ => candidate,
        }
    }
}

#[async_trait]
impl Handler for Shell {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&mut self) -> Result<(), InfraError> {
        // Default environment from the resource declaration.
        if let Some(env) = self.spec.options.get("env").and_then(serde_yaml::Value::as_mapping) {
            for (key, value) in env {
                if let (Some(key), Some(value)) = (key.as_str(), value.as_str()) {
                    self.env.insert(String::from(key), String::from(value));
                }
            }
        }
        Ok(())
    }

    async fn ready(&mut self) -> Result<(), InfraError> {
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), InfraError> {
        // Env and workdir stay as configured; only run results clear.
        self.last_exit_code = 0;
        self.last_stdout.clear();
        self.last_stderr.clear();
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<(), CleanupError> {
        Ok(())
    }

    fn steps(&self) -> StepCategory {
        vocabulary()
    }

    async fn run_step(&mut self, action: &str, args: &StepArgs) -> Result<(), StepError> {
        match action {
            action::SET_ENV => {
                let (key, value) = (args.string(0)?, args.string(1)?);
                self.env.insert(String::from(key), String::from(value));
                Ok(())
            }
            action::SET_WORKDIR => {
                self.workdir = Some(Utf8PathBuf::from(args.string(0)?));
                Ok(())
            }
            action::RUN_DOCSTRING => {
                let command = args.docstring()?.to_owned();
                let timeout = self.timeout;
                self.execute(&command, timeout).await
            }
            action::RUN_INLINE => {
                let command = args.string(0)?.to_owned();
                let timeout = self.timeout;
                self.execute(&command, timeout).await
            }
            action::RUN_SCRIPT => {
                let path = self.resolve_path(args.string(0)?);
                let script = std::fs::read_to_string(&path)
                    .map_err(|e| StepError::backend(format!("reading script: {e}")))?;
                let timeout = self.timeout;
                self.execute(&script, timeout).await
            }
            action::RUN_WITH_TIMEOUT => {
                let timeout = args.duration(0)?;
                let command = args.docstring()?.to_owned();
                self.execute(&command, timeout).await
            }
            action::EXIT_CODE_IS => {
                let expected = args.int(0)?;
                if self.last_exit_code == expected {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "expected exit code {expected}, got {}\nstdout: {}\nstderr: {}",
                        self.last_exit_code, self.last_stdout, self.last_stderr
                    )))
                }
            }
            action::SUCCEEDS => {
                if self.last_exit_code == 0 {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "expected exit code 0, got {}\nstdout: {}\nstderr: {}",
                        self.last_exit_code, self.last_stdout, self.last_stderr
                    )))
                }
            }
            action::FAILS => {
                if self.last_exit_code == 0 {
                    Err(StepError::assertion(format!(
                        "expected command to fail, but it succeeded\nstdout: {}",
                        self.last_stdout
                    )))
                } else {
                    Ok(())
                }
            }
            action::STDOUT_CONTAINS => {
                let needle = args.string(0)?;
                if self.last_stdout.contains(needle) {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "stdout does not contain \"{needle}\"\nstdout: {}",
                        self.last_stdout
                    )))
                }
            }
            action::STDOUT_NOT_CONTAINS => {
                let needle = args.string(0)?;
                if self.last_stdout.contains(needle) {
                    Err(StepError::assertion(format!(
                        "stdout should not contain \"{needle}\"\nstdout: {}",
                        self.last_stdout
                    )))
                } else {
                    Ok(())
                }
            }
            action::STDOUT_IS => {
                let expected = args.docstring()?.trim();
                let actual = self.last_stdout.trim();
                if actual == expected {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "stdout mismatch\nexpected: {expected}\nactual: {actual}"
                    )))
                }
            }
            action::STDOUT_EMPTY => {
                if self.last_stdout.trim().is_empty() {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "expected empty stdout, got: {}",
                        self.last_stdout
                    )))
                }
            }
            action::STDERR_CONTAINS => {
                let needle = args.string(0)?;
                if self.last_stderr.contains(needle) {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "stderr does not contain \"{needle}\"\nstderr: {}",
                        self.last_stderr
                    )))
                }
            }
            action::STDERR_EMPTY => {
                if self.last_stderr.trim().is_empty() {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "expected empty stderr, got: {}",
                        self.last_stderr
                    )))
                }
            }
            action::FILE_EXISTS => {
                let path = self.resolve_path(args.string(0)?);
                if path.as_std_path().exists() {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "file \"{path}\" does not exist"
                    )))
                }
            }
            action::FILE_NOT_EXISTS => {
                let path = self.resolve_path(args.string(0)?);
                if path.as_std_path().exists() {
                    Err(StepError::assertion(format!(
                        "file \"{path}\" exists but should not"
                    )))
                } else {
                    Ok(())
                }
            }
            action::FILE_CONTAINS => {
                let path = self.resolve_path(args.string(0)?);
                let needle = args.string(1)?;
                let content = std::fs::read_to_string(&path)
                    .map_err(|e| StepError::backend(format!("reading file: {e}")))?;
                if content.contains(needle) {
                    Ok(())
                } else {
                    Err(StepError::assertion(format!(
                        "file \"{path}\" does not contain \"{needle}\""
                    )))
                }
            }
            other => Err(StepError::UnknownAction {
                handler: self.name.clone(),
                action: String::from(other),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};
    use std::sync::Arc;
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
                    std::collections::BTreeMap::new(),
                    CancellationToken::new(),
                )
                .expect("empty graph"),
            ),
            variables: Arc::new(super::super::VariableStore::new()),
            cancel: CancellationToken::new(),
        }
    }

    #[fixture]
    fn shell() -> Shell {
        Shell::new(String::from("sh"), ResourceSpec::default(), deps())
    }

    fn args(captures: &[&str]) -> StepArgs {
        StepArgs::new(captures.iter().map(|c| String::from(*c)).collect(), None, None)
    }

    fn docstring_args(doc: &str) -> StepArgs {
        StepArgs::new(Vec::new(), Some(String::from(doc)), None)
    }

    #[rstest]
    #[tokio::test]
    async fn inline_command_captures_stdout_and_exit_code(mut shell: Shell) {
        shell
            .run_step(action::RUN_INLINE, &args(&["echo tomato"]))
            .await
            .expect("echo runs");

        shell
            .run_step(action::SUCCEEDS, &args(&[]))
            .await
            .expect("echo exits zero");
        shell
            .run_step(action::STDOUT_CONTAINS, &args(&["tomato"]))
            .await
            .expect("stdout captured");
        shell
            .run_step(action::STDERR_EMPTY, &args(&[]))
            .await
            .expect("stderr empty");
    }

    #[rstest]
    #[tokio::test]
    async fn failing_command_is_observable(mut shell: Shell) {
        shell
            .run_step(action::RUN_INLINE, &args(&["exit 3"]))
            .await
            .expect("command runs to completion");

        shell
            .run_step(action::EXIT_CODE_IS, &args(&["3"]))
            .await
            .expect("exit code recorded");
        shell
            .run_step(action::FAILS, &args(&[]))
            .await
            .expect("non-zero means failure");

        let error = shell
            .run_step(action::SUCCEEDS, &args(&[]))
            .await
            .expect_err("succeed assertion fails");
        assert!(error.to_string().contains("expected exit code 0"));
    }

    #[rstest]
    #[tokio::test]
    async fn env_vars_reach_the_command(mut shell: Shell) {
        shell
            .run_step(action::SET_ENV, &args(&["TOMATO_FLAVOUR", "umami"]))
            .await
            .expect("env set");
        shell
            .run_step(
                action::RUN_DOCSTRING,
                &docstring_args("printf '%s' \"$TOMATO_FLAVOUR\""),
            )
            .await
            .expect("command runs");
        shell
            .run_step(action::STDOUT_IS, &docstring_args("umami"))
            .await
            .expect("env var visible");
    }

    #[rstest]
    #[tokio::test]
    async fn workdir_scopes_relative_file_assertions(mut shell: Shell) {
        let tmp = tempfile::tempdir().expect("temp dir");
        let dir = tmp.path().to_str().expect("utf-8 path");

        shell
            .run_step(action::SET_WORKDIR, &args(&[dir]))
            .await
            .expect("workdir set");
        shell
            .run_step(action::RUN_INLINE, &args(&["echo passed > report.txt"]))
            .await
            .expect("file written");

        shell
            .run_step(action::FILE_EXISTS, &args(&["report.txt"]))
            .await
            .expect("file exists relative to workdir");
        shell
            .run_step(action::FILE_CONTAINS, &args(&["report.txt", "passed"]))
            .await
            .expect("file content asserted");
        shell
            .run_step(action::FILE_NOT_EXISTS, &args(&["missing.txt"]))
            .await
            .expect("absent file asserted");
    }

    #[rstest]
    #[tokio::test]
    async fn timeout_maps_to_a_timed_out_step_error(mut shell: Shell) {
        let error = shell
            .run_step(
                action::RUN_WITH_TIMEOUT,
                &StepArgs::new(
                    vec![String::from("100ms")],
                    Some(String::from("sleep 5")),
                    None,
                ),
            )
            .await
            .expect_err("sleep exceeds the timeout");
        assert!(matches!(error, StepError::TimedOut { .. }));
    }

    #[rstest]
    #[tokio::test]
    async fn reset_clears_results_but_keeps_env(mut shell: Shell) {
        shell
            .run_step(action::SET_ENV, &args(&["KEEP", "me"]))
            .await
            .expect("env set");
        shell
            .run_step(action::RUN_INLINE, &args(&["echo output"]))
            .await
            .expect("command runs");

        shell.reset().await.expect("reset is infallible here");

        assert_eq!(shell.last_exit_code, 0);
        assert!(shell.last_stdout.is_empty());
        assert_eq!(shell.env.get("KEEP").map(String::as_str), Some("me"));
    }
}
