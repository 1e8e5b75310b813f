//! `tomato` application entry point.
//!
//! The binary owns composition: it loads and validates configuration,
//! connects to the container engine, brings up the orchestrator, app
//! runner, and handler registry in order, hands control to the scenario
//! engine, and tears everything down in reverse. Semantic errors stay
//! inside the run functions; the boundary converts them to `eyre::Report`
//! for human-readable output and maps them to exit codes (2 for
//! configuration errors, 1 for everything else).

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tomato::apprunner::AppRunner;
use tomato::cli::{Cli, Commands, DocsArgs, RunArgs, StepsArgs, ValidateArgs};
use tomato::config;
use tomato::engine::{self, Engine, RunOptions, tags::TagExpression};
use tomato::error::{ConfigError, Result, TomatoError};
use tomato::formatter;
use tomato::handler::{HandlerDeps, Registry, VariableStore};
use tomato::orchestrator::{self, Orchestrator};
use tomato::runlog::RunContext;
use tomato::version;

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(error) => {
            let config_error = error.is_config_error();
            let report = eyre::Report::from(error);
            eprintln!("Error: {report:#}");
            if config_error { 2 } else { 1 }
        }
    };
    std::process::exit(code);
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Run(args) => cmd_run(args).await,
        Commands::Validate(args) => cmd_validate(&args),
        Commands::Steps(args) => Ok(cmd_steps(&args)),
        Commands::Docs(args) => cmd_docs(&args),
        Commands::Version => {
            println!("tomato {}", version::VERSION);
            Ok(0)
        }
    }
}

/// Execute all scenarios: bring up infrastructure, run, tear down.
async fn cmd_run(args: RunArgs) -> Result<i32> {
    let mut config = config::load(&args.config)?;
    apply_overrides(&mut config, &args)?;

    let env = mockable::DefaultEnv::new();
    if version::update_notice_enabled(&env) {
        info!("set {} to silence update checks", version::SKIP_UPDATE_CHECK_VAR);
    }

    // A single cancellation root: ^C propagates into every wait loop,
    // consumer, and reader task.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling run");
                cancel.cancel();
            }
        });
    }

    let socket = orchestrator::resolve_socket(None, &env);
    let needs_daemon = !config.containers.is_empty()
        || config.app.as_ref().is_some_and(|app| app.build.is_some());
    let docker = if needs_daemon {
        orchestrator::connect_verified(&socket).await?
    } else {
        orchestrator::connect_lazy(&socket)?
    };

    let orchestrator = Arc::new(Orchestrator::new(
        docker,
        config.containers.clone(),
        cancel.clone(),
    )?);

    let run_log = match RunContext::create_default() {
        Ok(run_log) => {
            let run_log = Arc::new(run_log);
            orchestrator.set_run_context(Arc::clone(&run_log));
            info!(dir = %run_log.dir(), "run artifacts");
            Some(run_log)
        }
        Err(error) => {
            warn!(%error, "failed to create run directory; continuing without artifacts");
            None
        }
    };

    if let Err(error) = orchestrator.start_all().await {
        orchestrator.stop_all().await;
        return Err(error.into());
    }

    let app = build_app_runner(&config, &args, &orchestrator, run_log.as_deref(), &cancel);
    if let Some(runner) = &app {
        let started = runner.start().await;
        let healthy = match started {
            Ok(()) => runner.verify_healthy().await,
            Err(error) => Err(error),
        };
        if let Err(error) = healthy {
            runner.stop().await;
            orchestrator.stop_all().await;
            return Err(error.into());
        }
    }

    let variables = Arc::new(VariableStore::new());
    let deps = HandlerDeps {
        orchestrator: Arc::clone(&orchestrator),
        variables: Arc::clone(&variables),
        cancel: cancel.clone(),
    };
    let registry = match Registry::new(&config.resources, &deps) {
        Ok(registry) => Arc::new(registry),
        Err(error) => {
            teardown(None, app.as_ref(), &orchestrator).await;
            return Err(error.into());
        }
    };
    if let Err(error) = registry.wait_ready().await {
        teardown(Some(registry.as_ref()), app.as_ref(), &orchestrator).await;
        return Err(error.into());
    }

    let mut formatter = formatter::for_format(&config.settings.output, args.quiet);
    let engine = Engine::new(
        config.clone(),
        Arc::clone(&registry),
        Arc::clone(&orchestrator),
        variables,
        RunOptions {
            randomize: args.randomize,
        },
    );
    let outcome = engine.run(formatter.as_mut()).await;

    teardown(Some(registry.as_ref()), app.as_ref(), &orchestrator).await;

    let summary = outcome?;
    Ok(if summary.all_passed() { 0 } else { 1 })
}

/// Handlers, then the SUT, then containers: the reverse of startup.
async fn teardown(
    registry: Option<&Registry>,
    app: Option<&AppRunner>,
    orchestrator: &Orchestrator,
) {
    if let Some(registry) = registry
        && let Err(error) = registry.cleanup().await
    {
        warn!(%error, "handler cleanup failed");
    }
    if let Some(runner) = app {
        runner.stop().await;
    }
    orchestrator.stop_all().await;
}

fn build_app_runner(
    config: &config::Config,
    args: &RunArgs,
    orchestrator: &Arc<Orchestrator>,
    run_log: Option<&RunContext>,
    cancel: &CancellationToken,
) -> Option<AppRunner> {
    if !config.is_app_configured() {
        return None;
    }
    let spec = config.app.clone()?;
    let mut runner = AppRunner::new(spec, Arc::clone(orchestrator), cancel.clone());
    if args.quiet {
        runner.set_show_logs(false);
    }
    if let Some(run_log) = run_log {
        runner.set_run_context(run_log);
    }
    Some(runner)
}

fn apply_overrides(config: &mut config::Config, args: &RunArgs) -> Result<()> {
    if !args.features.is_empty() {
        config.features.paths = args.features.clone();
    }
    if let Some(tags) = &args.tags {
        config.features.tags = Some(tags.clone());
    }
    if let Some(scenario) = &args.scenario {
        config.features.scenario = Some(scenario.clone());
    }
    if args.stop_on_failure {
        config.settings.fail_fast = true;
    }
    if let Some(format) = &args.format {
        if format != "pretty" && format != "json" {
            return Err(ConfigError::UnknownOutputFormat {
                format: format.clone(),
            }
            .into());
        }
        config.settings.output = format.clone();
    }
    Ok(())
}

/// Structural, feature-file, and step-binding validation.
///
/// Exit 0 when clean (warnings allowed), 1 when any error is found.
fn cmd_validate(args: &ValidateArgs) -> Result<i32> {
    let mut errors = Vec::new();

    let config = match config::load(&args.config) {
        Ok(config) => Some(config),
        Err(error) => {
            errors.push(error.to_string());
            None
        }
    };

    let mut warnings = Vec::new();
    if let Some(config) = &config {
        // Graph acyclicity, without touching a daemon.
        let socket = orchestrator::resolve_socket(None, &mockable::DefaultEnv::new());
        if let Ok(docker) = orchestrator::connect_lazy(&socket)
            && let Err(error) = Orchestrator::new(
                docker,
                config.containers.clone(),
                CancellationToken::new(),
            )
        {
            errors.push(error.to_string());
        }

        match engine::discover_features(&config.features.paths) {
            Ok(features) => {
                let filter = config
                    .features
                    .tags
                    .as_deref()
                    .map_or(Ok(TagExpression::All), TagExpression::parse);
                match filter {
                    Ok(filter) => {
                        let plan = engine::build_plan(&features, &filter);
                        warnings.extend(engine::check_step_bindings(config, &plan));
                    }
                    Err(error) => errors.push(error.to_string()),
                }
            }
            Err(error) => errors.push(error.to_string()),
        }
    }

    for warning in &warnings {
        println!("warning: {warning}");
    }
    for error in &errors {
        println!("error: {error}");
    }

    if errors.is_empty() {
        println!(
            "configuration valid ({} warnings)",
            warnings.len()
        );
        Ok(0)
    } else {
        Ok(1)
    }
}

fn cmd_steps(args: &StepsArgs) -> i32 {
    let selection = tomato::docs::filtered(args.kind.as_deref(), args.keyword.as_deref());
    print!("{}", tomato::docs::render_terminal(&selection));
    0
}

fn cmd_docs(args: &DocsArgs) -> Result<i32> {
    let selection = tomato::docs::filtered(None, None);
    let rendered = match args.format.as_str() {
        "html" => tomato::docs::render_html(&selection),
        "markdown" => tomato::docs::render_markdown(&selection),
        other => {
            return Err(TomatoError::Config(ConfigError::UnknownOutputFormat {
                format: String::from(other),
            }));
        }
    };

    match &args.output {
        Some(path) => {
            std::fs::write(path, rendered).map_err(|e| {
                TomatoError::Config(ConfigError::ReadFailed {
                    path: path.clone(),
                    message: e.to_string(),
                })
            })?;
            println!("wrote {path}");
        }
        None => print!("{rendered}"),
    }
    Ok(0)
}
