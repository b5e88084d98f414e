use std::io::{self, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{Value, json};
use tracing::level_filters::LevelFilter;

use askflow::chat::{render_response, run_chat_loop};
use askflow::cli::{Cli, Commands, ProfileCommands, TelemetryCommands, command_label};
use askflow::config::{RuntimeConfig, load_profiles, resolve_runtime_config};
use askflow::doctor::run_doctor;
use askflow::error::{categorize_error, format_cli_error};
use askflow::generation::build_generator;
use askflow::profiles::{run_profiles_list, run_profiles_show};
use askflow::retrieval::build_context_search;
use askflow::server::run_server;
use askflow::telemetry::{TelemetrySink, run_telemetry_report};
use askflow::tools::weather::OpenMeteoClient;
use askflow::workflow::{Orchestrator, OrchestratorConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Err(err) = run_cli(cli).await {
        eprintln!("{}", format_cli_error(&err));
        tracing::error!(category = %categorize_error(&err).code(), error = %err, "command failed");
        std::process::exit(1);
    }

    Ok(())
}

fn init_tracing(log_filter: &str) -> Result<()> {
    let level = log_filter
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_env_filter(log_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {e}"))
}

/// Loads the corpus and builds every capability once, before any query runs.
fn build_orchestrator(cfg: &RuntimeConfig) -> Result<Orchestrator> {
    let context_search = build_context_search(cfg)?;
    let generator = build_generator(cfg)?;
    let (geocoder, forecast) = OpenMeteoClient::new(
        Duration::from_secs(cfg.geocoding_timeout_secs),
        Duration::from_secs(cfg.forecast_timeout_secs),
    )?
    .into_capabilities();

    let generator_name = generator
        .as_ref()
        .map(|generator| generator.name().to_string())
        .unwrap_or_else(|| "disabled".to_string());
    tracing::info!(
        retrieval = context_search
            .as_ref()
            .map(|search| search.backend_name())
            .unwrap_or("disabled"),
        generator = %generator_name,
        "capabilities initialized"
    );

    Orchestrator::new(OrchestratorConfig {
        context_search,
        generator,
        geocoder,
        forecast,
    })
    .context("failed to build workflow graph")
}

async fn run_ask(
    orchestrator: &Orchestrator,
    telemetry: &TelemetrySink,
    query: &str,
    show_trace: bool,
) -> Result<()> {
    let started_at = Instant::now();
    telemetry.emit("query.started", json!({ "path": "ask" }));
    match orchestrator.handle_query(query).await {
        Ok(response) => {
            telemetry.emit_query_completed(&response, started_at.elapsed().as_millis());
            print!("{}", render_response(&response, show_trace));
            Ok(())
        }
        Err(err) => {
            telemetry.emit(
                "query.failed",
                json!({ "path": "ask", "error": err.to_string() }),
            );
            Err(err.into())
        }
    }
}

async fn run_tool(
    orchestrator: &Orchestrator,
    telemetry: &TelemetrySink,
    name: &str,
    args: &str,
) -> Result<()> {
    let args = serde_json::from_str::<Value>(args)
        .with_context(|| format!("invalid value for --args: '{args}' is not valid JSON"))?;
    telemetry.emit("tool.requested", json!({ "tool": name }));
    let result = orchestrator.tools().execute_by_name(name, &args).await;
    telemetry.emit_tool_result(name, &result);

    let rendered = serde_json::to_string_pretty(&result.to_json())
        .context("failed to render tool result")?;
    println!("{rendered}");
    if let Some(error) = result.error_message() {
        return Err(anyhow::anyhow!("tool '{name}' failed: {error}"));
    }
    Ok(())
}

async fn run_cli(cli: Cli) -> Result<()> {
    init_tracing(&cli.log_filter)?;
    let profiles = load_profiles(&cli.config_path)?;
    let cfg = resolve_runtime_config(&cli, &profiles)?;

    let command = cli.command.unwrap_or(Commands::Chat);
    let telemetry = TelemetrySink::new(&cfg, command_label(&command));

    match command {
        Commands::Ask { query, trace } => {
            let orchestrator = build_orchestrator(&cfg)?;
            run_ask(&orchestrator, &telemetry, &query.join(" "), trace).await?;
        }
        Commands::Chat => {
            let orchestrator = build_orchestrator(&cfg)?;
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            let mut stdout = io::stdout();
            run_chat_loop(&orchestrator, &telemetry, stdin, &mut stdout).await?;
            stdout.flush().context("failed to flush stdout")?;
        }
        Commands::Tool { name, args } => {
            let orchestrator = build_orchestrator(&cfg)?;
            run_tool(&orchestrator, &telemetry, &name, &args).await?;
        }
        Commands::Serve { host, port } => {
            let orchestrator = Arc::new(build_orchestrator(&cfg)?);
            run_server(orchestrator, cfg.profile.clone(), host, port, &telemetry).await?;
        }
        Commands::Doctor => {
            let orchestrator = build_orchestrator(&cfg)?;
            run_doctor(&cfg, &orchestrator)?;
        }
        Commands::Profiles { command } => match command {
            ProfileCommands::List => run_profiles_list(&profiles, &cfg)?,
            ProfileCommands::Show => run_profiles_show(&cfg)?,
        },
        Commands::Telemetry { command } => match command {
            TelemetryCommands::Report { path, limit } => {
                run_telemetry_report(&cfg, path, limit)?;
            }
        },
    }

    Ok(())
}
