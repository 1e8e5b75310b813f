//! Configuration loading and validation tests.

use camino::Utf8PathBuf;
use mockable::MockEnv;
use rstest::{fixture, rstest};

use super::*;

fn write_config(dir: &tempfile::TempDir, yaml: &str) -> Utf8PathBuf {
    let path = dir.path().join("tomato.yml");
    std::fs::write(&path, yaml).expect("write config fixture");
    Utf8PathBuf::from_path_buf(path).expect("temp path is utf-8")
}

#[fixture]
fn tmp() -> tempfile::TempDir {
    tempfile::tempdir().expect("create temp dir")
}

#[rstest]
fn minimum_config_loads_with_defaults(tmp: tempfile::TempDir) {
    let path = write_config(&tmp, "version: 2\n");
    let config = load(&path).expect("minimum config is valid");

    assert_eq!(config.version, 2);
    assert_eq!(config.settings.parallel, 1);
    assert_eq!(config.settings.output, "pretty");
    assert_eq!(config.settings.reset.level, "scenario");
    assert_eq!(config.settings.reset.on_failure, "reset");
    assert_eq!(config.features.paths, vec![Utf8PathBuf::from("./features")]);
    assert!(config.containers.is_empty());
    assert!(config.resources.is_empty());
}

#[rstest]
fn missing_version_defaults_to_two(tmp: tempfile::TempDir) {
    let path = write_config(&tmp, "settings:\n  parallel: 2\n");
    let config = load(&path).expect("versionless config is valid");
    assert_eq!(config.version, 2);
    assert_eq!(config.settings.parallel, 2);
}

#[rstest]
#[case(1)]
#[case(3)]
fn unsupported_version_is_rejected(tmp: tempfile::TempDir, #[case] version: u32) {
    let path = write_config(&tmp, &format!("version: {version}\n"));
    let error = load(&path).expect_err("version must be 2");
    assert!(matches!(
        error,
        crate::error::ConfigError::UnsupportedVersion { found } if found == version
    ));
}

#[rstest]
fn invalid_reset_level_is_rejected(tmp: tempfile::TempDir) {
    let path = write_config(&tmp, "version: 2\nsettings:\n  reset:\n    level: sometimes\n");
    let error = load(&path).expect_err("reset level must be known");
    assert!(matches!(
        error,
        crate::error::ConfigError::InvalidResetLevel { level } if level == "sometimes"
    ));
}

#[rstest]
fn unknown_output_format_is_rejected(tmp: tempfile::TempDir) {
    let path = write_config(&tmp, "version: 2\nsettings:\n  output: cucumber\n");
    let error = load(&path).expect_err("output format must be known");
    assert!(matches!(
        error,
        crate::error::ConfigError::UnknownOutputFormat { format } if format == "cucumber"
    ));
}

#[rstest]
fn dangling_container_reference_is_rejected(tmp: tempfile::TempDir) {
    let yaml = "\
version: 2
resources:
  db:
    type: postgres
    container: postgres
";
    let path = write_config(&tmp, yaml);
    let error = load(&path).expect_err("resource references missing container");
    assert!(matches!(
        error,
        crate::error::ConfigError::UnknownContainerRef { resource, container }
            if resource == "db" && container == "postgres"
    ));
}

#[rstest]
fn dangling_dependency_is_rejected(tmp: tempfile::TempDir) {
    let yaml = "\
version: 2
containers:
  app:
    image: nginx:1
    depends_on: [db]
";
    let path = write_config(&tmp, yaml);
    let error = load(&path).expect_err("depends_on references missing container");
    assert!(matches!(
        error,
        crate::error::ConfigError::UnknownDependency { container, dependency }
            if container == "app" && dependency == "db"
    ));
}

#[rstest]
fn unknown_resource_type_is_rejected(tmp: tempfile::TempDir) {
    let yaml = "\
version: 2
resources:
  q:
    type: nsq
";
    let path = write_config(&tmp, yaml);
    let error = load(&path).expect_err("nsq is not a known type");
    assert!(matches!(
        error,
        crate::error::ConfigError::UnknownResourceType { kind, .. } if kind == "nsq"
    ));
}

#[rstest]
fn container_without_image_or_build_is_rejected(tmp: tempfile::TempDir) {
    let yaml = "\
version: 2
containers:
  broken:
    ports: [\"8080/tcp\"]
";
    let path = write_config(&tmp, yaml);
    let error = load(&path).expect_err("image xor build is required");
    assert!(matches!(
        error,
        crate::error::ConfigError::AmbiguousImageSource { container } if container == "broken"
    ));
}

#[rstest]
fn full_config_parses_durations_and_options(tmp: tempfile::TempDir) {
    let yaml = "\
version: 2
settings:
  timeout: 2m
  fail_fast: true
app:
  command: ./api-server
  port: 8080
  ready:
    type: http
    path: /health
    timeout: 45s
  wait: 1s
  env:
    DATABASE_URL: \"postgres://{{.postgres.host}}:{{.postgres.port.5432}}/test\"
containers:
  postgres:
    image: postgres:15
    ports: [\"5432/tcp\"]
    wait_for:
      type: port
      target: 5432/tcp
      timeout: 90s
resources:
  db:
    type: postgres
    container: postgres
    database: test
    reset: false
    options:
      user: postgres
      password: postgres
hooks:
  before_all:
    - sql: \"CREATE TABLE users (id int)\"
      resource: db
features:
  paths: [./specs]
  tags: \"@smoke && ~@slow\"
";
    let path = write_config(&tmp, yaml);
    let config = load(&path).expect("full config is valid");

    assert_eq!(config.settings.timeout, std::time::Duration::from_secs(120));
    assert!(config.settings.fail_fast);
    assert_eq!(
        config.containers["postgres"].wait_for.timeout,
        Some(std::time::Duration::from_secs(90))
    );
    let db = &config.resources["db"];
    assert_eq!(db.kind, "postgres");
    assert_eq!(db.reset, Some(false));
    assert_eq!(db.opt_str("user"), Some("postgres"));
    assert_eq!(config.hooks.before_all.len(), 1);
    assert_eq!(
        config.hooks.before_all[0].resource.as_deref(),
        Some("db")
    );
    assert_eq!(config.features.tags.as_deref(), Some("@smoke && ~@slow"));
    assert!(config.is_app_configured());
}

#[rstest]
fn expand_env_substitutes_braced_and_bare_references() {
    let mut env = MockEnv::new();
    env.expect_string()
        .returning(|name| match name {
            "DB_PASSWORD" => Some(String::from("hunter2")),
            "USER" => Some(String::from("tomato")),
            _ => None,
        });

    let expanded = expand_env_with("password: ${DB_PASSWORD}\nuser: $USER\n", &env);
    assert_eq!(expanded, "password: hunter2\nuser: tomato\n");
}

#[rstest]
fn expand_env_replaces_unset_references_with_empty() {
    let mut env = MockEnv::new();
    env.expect_string().returning(|_| None);

    let expanded = expand_env_with("token: ${MISSING_TOKEN}!", &env);
    assert_eq!(expanded, "token: !");
}

#[rstest]
#[case("scenario", ResetLevel::Scenario)]
#[case("feature", ResetLevel::Feature)]
#[case("run", ResetLevel::Run)]
#[case("none", ResetLevel::None)]
fn reset_level_parses_every_valid_value(#[case] raw: &str, #[case] expected: ResetLevel) {
    let settings = ResetSettings {
        level: String::from(raw),
        on_failure: String::from("reset"),
    };
    assert_eq!(settings.parsed_level(), expected);
}

#[rstest]
fn on_failure_keep_is_recognised() {
    let settings = ResetSettings {
        level: String::from("scenario"),
        on_failure: String::from("keep"),
    };
    assert_eq!(settings.parsed_on_failure(), OnFailure::Keep);
}
