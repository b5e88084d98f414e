use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use chrono::NaiveDate;
use serde_json::json;
use tempfile::tempdir;

use crate::chat::*;
use crate::cli::*;
use crate::config::*;
use crate::error::*;
use crate::generation::*;
use crate::retrieval::*;
use crate::server::*;
use crate::state::*;
use crate::telemetry::*;
use crate::tools::weather::*;
use crate::tools::*;
use crate::workflow::*;

struct StubSearch {
    passages: Vec<Passage>,
    fail: bool,
    calls: AtomicUsize,
}

impl StubSearch {
    fn with(passages: Vec<Passage>) -> Self {
        Self {
            passages,
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }
}

impl ContextSearch for StubSearch {
    fn backend_name(&self) -> &'static str {
        "stub"
    }

    fn search(&self, _query: &str, k: usize) -> Result<Vec<Passage>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(anyhow::anyhow!("index unavailable"));
        }
        Ok(self.passages.iter().take(k).cloned().collect())
    }
}

struct StubGenerator {
    answer: String,
    prompts: Mutex<Vec<String>>,
}

impl StubGenerator {
    fn answering(answer: &str) -> Self {
        Self {
            answer: answer.to_string(),
            prompts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Generator for StubGenerator {
    fn name(&self) -> &str {
        "stub-model"
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        self.prompts
            .lock()
            .expect("prompt log lock")
            .push(prompt.to_string());
        Ok(self.answer.clone())
    }
}

#[derive(Default)]
struct StubGeocoder {
    calls: AtomicUsize,
    not_found: bool,
    fail: bool,
}

#[async_trait]
impl Geocoder for StubGeocoder {
    async fn resolve(&self, name: &str) -> Result<Option<GeoLocation>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(anyhow::anyhow!("connection refused"));
        }
        if self.not_found {
            return Ok(None);
        }
        Ok(Some(GeoLocation {
            lat: 13.08,
            lon: 80.27,
            display_name: name.to_string(),
            country: "India".to_string(),
        }))
    }
}

/// Always returns a single day, whatever was requested.
#[derive(Default)]
struct StubForecast {
    calls: AtomicUsize,
    fail: bool,
}

#[async_trait]
impl ForecastProvider for StubForecast {
    async fn fetch(&self, _lat: f64, _lon: f64, _days: u8) -> Result<Vec<DailyForecast>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(anyhow::anyhow!("forecast service returned an error status"));
        }
        Ok(vec![DailyForecast {
            date: NaiveDate::from_ymd_opt(2025, 6, 1).expect("valid date"),
            temp_max_c: 36.4,
            temp_min_c: 28.1,
            precip_mm: 0.2,
            wind_max_kmh: 21.5,
        }])
    }
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    search: Arc<StubSearch>,
    generator: Arc<StubGenerator>,
    geocoder: Arc<StubGeocoder>,
    forecast: Arc<StubForecast>,
}

fn two_passages() -> Vec<Passage> {
    vec![
        Passage {
            text: "AI is applied in healthcare diagnostics.".to_string(),
            source: "ai-report.pdf".to_string(),
            page: 4,
        },
        Passage {
            text: "Applications of AI include fraud detection.".to_string(),
            source: "ai-report.pdf".to_string(),
            page: 9,
        },
    ]
}

fn harness_with(search: StubSearch, rag_enabled: bool) -> Harness {
    let search = Arc::new(search);
    let generator = Arc::new(StubGenerator::answering(
        "AI is used in healthcare and fraud detection.",
    ));
    let geocoder = Arc::new(StubGeocoder::default());
    let forecast = Arc::new(StubForecast::default());

    let context_search: Option<Arc<dyn ContextSearch>> = if rag_enabled {
        Some(search.clone())
    } else {
        None
    };
    let generation: Option<Arc<dyn Generator>> = if rag_enabled {
        Some(generator.clone())
    } else {
        None
    };
    let orchestrator = Orchestrator::new(OrchestratorConfig {
        context_search,
        generator: generation,
        geocoder: geocoder.clone(),
        forecast: forecast.clone(),
    })
    .expect("standard graph builds");

    Harness {
        orchestrator: Arc::new(orchestrator),
        search,
        generator,
        geocoder,
        forecast,
    }
}

fn harness() -> Harness {
    harness_with(StubSearch::with(two_passages()), true)
}

fn tool_orchestrator(geocoder: Arc<StubGeocoder>, forecast: Arc<StubForecast>) -> Orchestrator {
    Orchestrator::new(OrchestratorConfig {
        context_search: None,
        generator: None,
        geocoder,
        forecast,
    })
    .expect("standard graph builds")
}

fn base_cfg() -> RuntimeConfig {
    RuntimeConfig {
        profile: "default".to_string(),
        config_path: ".askflow/config.toml".to_string(),
        provider: Provider::Disabled,
        model: None,
        ollama_host: DEFAULT_OLLAMA_HOST.to_string(),
        max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
        generation_timeout_secs: DEFAULT_GENERATION_TIMEOUT_SECS,
        retrieval_backend: RetrievalBackend::Disabled,
        corpus_paths: Vec::new(),
        geocoding_timeout_secs: DEFAULT_GEOCODING_TIMEOUT_SECS,
        forecast_timeout_secs: DEFAULT_FORECAST_TIMEOUT_SECS,
        telemetry_enabled: false,
        telemetry_path: ".askflow/test-telemetry.jsonl".to_string(),
    }
}

fn test_cli(config_path: &str, profile: &str) -> Cli {
    Cli {
        provider: None,
        model: None,
        ollama_host: None,
        max_new_tokens: None,
        generation_timeout_secs: None,
        profile: profile.to_string(),
        config_path: config_path.to_string(),
        retrieval_backend: None,
        corpus_path: Vec::new(),
        geocoding_timeout_secs: None,
        forecast_timeout_secs: None,
        telemetry_enabled: None,
        telemetry_path: None,
        log_filter: "warn".to_string(),
        command: Some(Commands::Doctor),
    }
}

fn server_state(orchestrator: Arc<Orchestrator>, auth_token: Option<&str>) -> Arc<ServerState> {
    let cfg = base_cfg();
    Arc::new(ServerState {
        orchestrator,
        telemetry: TelemetrySink::new(&cfg, "serve".to_string()),
        profile: cfg.profile,
        auth_token: auth_token.map(str::to_string),
    })
}

#[tokio::test]
async fn calculator_query_round_trip() {
    let h = harness();
    let response = h
        .orchestrator
        .handle_query("calculate (10+20)/2")
        .await
        .unwrap();

    assert_eq!(response.operation, Operation::Tool);
    assert_eq!(response.tool_name, Some(ToolName::Calculator));
    assert_eq!(response.answer, "Result: 15.0");
    assert!(response.citations.is_empty());
    assert_eq!(response.trace.kinds(), vec!["reason", "act", "observe"]);
    assert_eq!(h.search.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn weather_query_formats_resolved_location() {
    let h = harness();
    let response = h
        .orchestrator
        .handle_query("weather in Chennai")
        .await
        .unwrap();

    assert_eq!(response.operation, Operation::Tool);
    assert_eq!(response.tool_name, Some(ToolName::Weather));
    let mut lines = response.answer.lines();
    assert_eq!(lines.next(), Some("Weather Forecast for Chennai, India:"));
    assert_eq!(
        lines.collect::<Vec<_>>(),
        vec!["- 2025-06-01: min 28.1°C, max 36.4°C, rain 0.2mm, wind 21.5km/h"]
    );
    assert!(response.citations.is_empty());
    assert_eq!(h.geocoder.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.forecast.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rag_query_is_grounded_and_cited() {
    let h = harness();
    let response = h
        .orchestrator
        .handle_query("Applications of AI")
        .await
        .unwrap();

    assert_eq!(response.operation, Operation::Rag);
    assert_eq!(response.answer, "AI is used in healthcare and fraud detection.");
    assert_eq!(
        response.citations,
        vec![
            Citation::new("ai-report.pdf", 4),
            Citation::new("ai-report.pdf", 9)
        ]
    );
    assert_eq!(
        response.trace.kinds(),
        vec!["reason", "act", "observe", "act"]
    );
    assert_eq!(
        response.trace.entries()[2],
        TraceEntry::observe("Retrieved 2 chunks")
    );

    let prompts = h.generator.prompts.lock().unwrap();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("(source=ai-report.pdf, page=4)\nAI is applied"));
    assert!(prompts[0].ends_with("Question: Applications of AI\nAnswer:"));
}

#[tokio::test]
async fn every_run_executes_exactly_three_stages() {
    let h = harness();
    let tool_run = h.orchestrator.run("2 * 21").await.unwrap();
    assert_eq!(
        tool_run.path,
        vec![Stage::Planner, Stage::Tool, Stage::Synthesis]
    );

    let rag_run = h.orchestrator.run("history of computing").await.unwrap();
    assert_eq!(
        rag_run.path,
        vec![Stage::Planner, Stage::Retrieval, Stage::Synthesis]
    );
}

#[tokio::test]
async fn calculator_rejects_identifiers_outside_allow_list() {
    let h = harness();
    for query in [
        "calculate __import__('os') + 1",
        "calculate os.system(1) + 2",
        "calculate x = 2 + 3",
    ] {
        let response = h.orchestrator.handle_query(query).await.unwrap();
        assert_eq!(response.tool_name, Some(ToolName::Calculator), "{query}");
        assert!(
            response.answer.starts_with("Tool 'calculator' failed:"),
            "{query}: {}",
            response.answer
        );
        assert!(!response.tool_result.as_ref().unwrap().ok());
    }
}

#[tokio::test]
async fn weather_validation_happens_before_network() {
    let h = harness();
    let tools = h.orchestrator.tools();

    for args in [
        json!({"location": "Paris", "days": 0}),
        json!({"location": "Paris", "days": 8}),
        json!({"location": "   ", "days": 3}),
    ] {
        let result = tools.execute_by_name("weather", &args).await;
        assert!(!result.ok(), "{args}");
    }
    assert_eq!(h.geocoder.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.forecast.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unresolved_location_is_a_tool_error() {
    let geocoder = Arc::new(StubGeocoder {
        not_found: true,
        ..StubGeocoder::default()
    });
    let forecast = Arc::new(StubForecast::default());
    let orchestrator = Orchestrator::new(OrchestratorConfig {
        context_search: None,
        generator: None,
        geocoder,
        forecast: forecast.clone(),
    })
    .unwrap();

    let response = orchestrator
        .handle_query("forecast in Atlantis")
        .await
        .unwrap();
    assert_eq!(
        response.tool_result.as_ref().and_then(ToolResult::error_message),
        Some("Location not found: Atlantis")
    );
    assert!(response.answer.starts_with("Tool 'weather' failed: {"));
    assert_eq!(forecast.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn geocoding_transport_failure_is_a_tool_error() {
    let geocoder = Arc::new(StubGeocoder {
        fail: true,
        ..StubGeocoder::default()
    });
    let forecast = Arc::new(StubForecast::default());
    let orchestrator = tool_orchestrator(geocoder.clone(), forecast.clone());

    let response = orchestrator
        .handle_query("weather in Oslo")
        .await
        .expect("tool failures never fail the run");
    let message = response
        .tool_result
        .as_ref()
        .and_then(ToolResult::error_message)
        .unwrap_or_default();
    assert_eq!(message, "Geocoding failed: connection refused");
    assert!(response.answer.starts_with("Tool 'weather' failed: {"));
    assert!(response.answer.contains("Geocoding failed: connection refused"));
    assert!(response.citations.is_empty());
    assert_eq!(response.trace.kinds(), vec!["reason", "act", "observe"]);
    assert_eq!(geocoder.calls.load(Ordering::SeqCst), 1);
    assert_eq!(forecast.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn forecast_transport_failure_is_a_tool_error() {
    let geocoder = Arc::new(StubGeocoder::default());
    let forecast = Arc::new(StubForecast {
        fail: true,
        ..StubForecast::default()
    });
    let orchestrator = tool_orchestrator(geocoder, forecast.clone());

    let response = orchestrator
        .handle_query("weather in Oslo")
        .await
        .expect("tool failures never fail the run");
    let message = response
        .tool_result
        .as_ref()
        .and_then(ToolResult::error_message)
        .unwrap_or_default();
    assert!(message.starts_with("Forecast failed:"), "{message}");
    assert!(response.answer.starts_with("Tool 'weather' failed: {"));
    assert!(response.citations.is_empty());
    assert_eq!(forecast.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn deeply_nested_calculation_is_an_error_result() {
    let h = harness();
    for expression in [
        format!("{}1{}", "(".repeat(10_000), ")".repeat(10_000)),
        format!("{}1", "-".repeat(10_000)),
        format!("{}1{}", "(".repeat(300), ")".repeat(300)),
    ] {
        let response = h
            .orchestrator
            .handle_query(&format!("calculate {expression}"))
            .await
            .expect("calculator failures never fail the run");
        assert_eq!(response.tool_name, Some(ToolName::Calculator));
        assert!(response.answer.starts_with("Tool 'calculator' failed:"));
        assert!(!response.tool_result.as_ref().unwrap().ok());
    }
}

#[tokio::test]
async fn generated_answer_is_kept_verbatim() {
    let generator: Arc<dyn Generator> = Arc::new(StubGenerator::answering("  AI helps.\n\n"));
    let search: Arc<dyn ContextSearch> = Arc::new(StubSearch::with(two_passages()));
    let orchestrator = Orchestrator::new(OrchestratorConfig {
        context_search: Some(search),
        generator: Some(generator),
        geocoder: Arc::new(StubGeocoder::default()),
        forecast: Arc::new(StubForecast::default()),
    })
    .unwrap();

    let response = orchestrator.handle_query("Applications of AI").await.unwrap();
    assert_eq!(response.answer, "  AI helps.\n\n");
}

#[tokio::test]
async fn unknown_tool_names_produce_error_results() {
    let h = harness();
    let result = h
        .orchestrator
        .tools()
        .execute_by_name("stock_price", &json!({}))
        .await;
    assert_eq!(
        result.to_json(),
        json!({"ok": false, "error": "Unknown tool: stock_price"})
    );
}

#[tokio::test]
async fn missing_rag_capabilities_are_fatal_only_for_rag() {
    let h = harness_with(StubSearch::with(Vec::new()), false);

    let err = h.orchestrator.ensure_ready().unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::CapabilityNotInitialized("context-search")
    ));

    let err = h
        .orchestrator
        .handle_query("Applications of AI")
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::CapabilityNotInitialized(_)));

    let response = h.orchestrator.handle_query("5 + 5").await.unwrap();
    assert_eq!(response.answer, "Result: 10.0");
}

#[tokio::test]
async fn failing_search_surfaces_as_capability_error() {
    let h = harness_with(
        StubSearch {
            passages: Vec::new(),
            fail: true,
            calls: AtomicUsize::new(0),
        },
        true,
    );
    let err = h
        .orchestrator
        .handle_query("Applications of AI")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("context-search call failed"));
    assert!(err.to_string().contains("index unavailable"));
}

#[tokio::test]
async fn empty_retrieval_still_generates() {
    let h = harness_with(StubSearch::with(Vec::new()), true);
    let response = h
        .orchestrator
        .handle_query("unrelated question")
        .await
        .unwrap();
    assert_eq!(response.operation, Operation::Rag);
    assert!(response.citations.is_empty());
    assert_eq!(
        response.trace.entries()[2],
        TraceEntry::observe("Retrieved 0 chunks")
    );
}

#[tokio::test]
async fn concurrent_queries_share_one_orchestrator() {
    let h = harness();
    let first = {
        let orchestrator = h.orchestrator.clone();
        tokio::spawn(async move { orchestrator.handle_query("12 / 4").await })
    };
    let second = {
        let orchestrator = h.orchestrator.clone();
        tokio::spawn(async move { orchestrator.handle_query("Applications of AI").await })
    };

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(first.answer, "Result: 3.0");
    assert!(first.citations.is_empty());
    assert_eq!(second.citations.len(), 2);
}

#[tokio::test]
async fn query_response_serializes_for_callers() {
    let h = harness();
    let response = h.orchestrator.handle_query("2+3").await.unwrap();
    let value = serde_json::to_value(&response).unwrap();

    assert_eq!(value["query"], "2+3");
    assert_eq!(value["operation"], "tool");
    assert_eq!(value["tool_name"], "calculator");
    assert_eq!(value["tool_result"], json!({"ok": true, "value": 5.0}));
    assert_eq!(value["citations"], json!([]));
    assert_eq!(
        value["trace"][1],
        json!({"act": "Tool.call", "input": {"tool": "calculator", "input": {"expression": "2+3"}}})
    );
}

#[test]
fn runtime_config_uses_selected_profile_values() {
    let dir = tempdir().expect("temp directory should create");
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[profiles.research]
provider = "ollama"
model = "mistral"
ollama_host = "http://gpu-box:11434"
max_new_tokens = 400
retrieval_backend = "local"
corpus_paths = ["docs/handbook.txt"]
forecast_timeout_secs = 30
"#,
    )
    .expect("config should write");

    let cli = test_cli(path.to_string_lossy().as_ref(), "research");
    let profiles = load_profiles(&cli.config_path).expect("profiles should load");
    let cfg = resolve_runtime_config(&cli, &profiles).expect("runtime config should resolve");

    assert_eq!(cfg.profile, "research");
    assert_eq!(cfg.provider, Provider::Ollama);
    assert_eq!(cfg.model.as_deref(), Some("mistral"));
    assert_eq!(cfg.ollama_host, "http://gpu-box:11434");
    assert_eq!(cfg.max_new_tokens, 400);
    assert_eq!(cfg.retrieval_backend, RetrievalBackend::Local);
    assert_eq!(cfg.corpus_paths, vec!["docs/handbook.txt".to_string()]);
    assert_eq!(cfg.forecast_timeout_secs, 30);
    assert_eq!(cfg.geocoding_timeout_secs, DEFAULT_GEOCODING_TIMEOUT_SECS);
    assert!(cfg.telemetry_enabled);
    assert_eq!(cfg.telemetry_path, DEFAULT_TELEMETRY_PATH);
}

#[test]
fn runtime_config_cli_overrides_profile_values() {
    let dir = tempdir().expect("temp directory should create");
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[profiles.dev]
provider = "ollama"
model = "mistral"
corpus_paths = ["a.txt"]
telemetry_enabled = true
telemetry_path = ".askflow/telemetry/dev.jsonl"
"#,
    )
    .expect("config should write");

    let mut cli = test_cli(path.to_string_lossy().as_ref(), "dev");
    cli.provider = Some(Provider::Disabled);
    cli.model = Some("llama3.2".to_string());
    cli.corpus_path = vec!["b.txt".to_string(), "a.txt".to_string()];
    cli.telemetry_enabled = Some(false);
    cli.telemetry_path = Some(".askflow/telemetry/override.jsonl".to_string());

    let profiles = load_profiles(&cli.config_path).expect("profiles should load");
    let cfg = resolve_runtime_config(&cli, &profiles).expect("runtime config should resolve");

    assert_eq!(cfg.provider, Provider::Disabled);
    assert_eq!(cfg.model.as_deref(), Some("llama3.2"));
    assert_eq!(
        cfg.corpus_paths,
        vec!["a.txt".to_string(), "b.txt".to_string()]
    );
    assert!(!cfg.telemetry_enabled);
    assert_eq!(cfg.telemetry_path, ".askflow/telemetry/override.jsonl");
}

#[test]
fn runtime_config_defaults_without_profiles_file() {
    let dir = tempdir().expect("temp directory should create");
    let path = dir.path().join("missing.toml");
    let cli = test_cli(path.to_string_lossy().as_ref(), "default");
    let profiles = load_profiles(&cli.config_path).expect("missing file is empty profiles");
    let cfg = resolve_runtime_config(&cli, &profiles).unwrap();

    assert_eq!(cfg.provider, Provider::Ollama);
    assert_eq!(cfg.retrieval_backend, RetrievalBackend::Disabled);
    assert_eq!(cfg.max_new_tokens, 220);
    assert_eq!(cfg.ollama_host, "http://localhost:11434");
}

#[test]
fn unknown_profile_and_unknown_fields_are_rejected() {
    let dir = tempdir().expect("temp directory should create");
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[profiles.dev]\nmodel = \"m\"\n").unwrap();

    let cli = test_cli(path.to_string_lossy().as_ref(), "prod");
    let profiles = load_profiles(&cli.config_path).unwrap();
    let err = resolve_runtime_config(&cli, &profiles).unwrap_err();
    assert!(err.to_string().contains("Available profiles: dev"));

    std::fs::write(&path, "[profiles.dev]\nsession_backend = \"sqlite\"\n").unwrap();
    let err = load_profiles(path.to_string_lossy().as_ref()).unwrap_err();
    assert!(format!("{err:#}").contains("invalid profile configuration"));
}

#[test]
fn local_backend_requires_corpus_paths() {
    let mut cfg = base_cfg();
    cfg.retrieval_backend = RetrievalBackend::Local;
    let err = build_context_search(&cfg).err().expect("missing corpus fails");
    assert!(err.to_string().contains("--corpus-path"));

    cfg.retrieval_backend = RetrievalBackend::Disabled;
    assert!(build_context_search(&cfg).unwrap().is_none());
    assert!(build_generator(&cfg).unwrap().is_none());
}

#[test]
fn local_corpus_feeds_the_context_search_capability() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("handbook.txt");
    std::fs::write(
        &path,
        "Welcome.\x0cNeural networks learn representations.\n\nTrees split on features.",
    )
    .unwrap();

    let mut cfg = base_cfg();
    cfg.retrieval_backend = RetrievalBackend::Local;
    cfg.corpus_paths = vec![path.to_string_lossy().to_string()];
    let search = build_context_search(&cfg).unwrap().expect("local backend");

    let passages = search.search("neural networks", RETRIEVAL_TOP_K).unwrap();
    assert_eq!(passages.len(), 1);
    assert_eq!(passages[0].source, "handbook.txt");
    assert_eq!(passages[0].page, 2);
}

#[test]
fn error_taxonomy_distinguishes_capability_input_and_tooling() {
    let capability: anyhow::Error =
        WorkflowError::CapabilityNotInitialized("generation").into();
    let input = anyhow::anyhow!("profile 'prod' not found in '.askflow/config.toml'");
    let tooling = anyhow::anyhow!("tool 'weather' failed: Location not found: Atlantis");
    let internal = anyhow::anyhow!("something odd happened");

    assert_eq!(categorize_error(&capability), ErrorCategory::Capability);
    assert_eq!(categorize_error(&input), ErrorCategory::Input);
    assert_eq!(categorize_error(&tooling), ErrorCategory::Tooling);
    assert_eq!(categorize_error(&internal), ErrorCategory::Internal);

    let rendered = format_cli_error(&capability);
    assert!(rendered.starts_with("[CAPABILITY] generation capability is not initialized"));
    assert!(rendered.contains("\nHint: "));
}

#[test]
fn telemetry_summary_counts_query_and_tool_events() {
    let lines = vec![
        json!({"ts_unix_ms": 1000, "event": "query.started", "run_id": "run-a", "command": "ask"})
            .to_string(),
        json!({"ts_unix_ms": 1100, "event": "tool.requested", "run_id": "run-a", "command": "ask", "tool": "weather"})
            .to_string(),
        json!({"ts_unix_ms": 1200, "event": "tool.failed", "run_id": "run-a", "command": "ask", "tool": "weather"})
            .to_string(),
        json!({"ts_unix_ms": 1300, "event": "query.completed", "run_id": "run-a", "command": "ask", "operation": "tool"})
            .to_string(),
        json!({"ts_unix_ms": 1400, "event": "query.completed", "run_id": "run-b", "command": "chat", "operation": "rag"})
            .to_string(),
        json!({"ts_unix_ms": 1500, "event": "query.failed", "run_id": "run-b", "command": "chat"})
            .to_string(),
        "invalid-json-line".to_string(),
    ];

    let summary = summarize_telemetry_lines(lines, 100);
    assert_eq!(summary.total_lines, 7);
    assert_eq!(summary.parsed_events, 6);
    assert_eq!(summary.parse_errors, 1);
    assert_eq!(summary.unique_runs.len(), 2);
    assert_eq!(summary.query_started, 1);
    assert_eq!(summary.query_completed, 2);
    assert_eq!(summary.query_failed, 1);
    assert_eq!(summary.tool_requested, 1);
    assert_eq!(summary.tool_succeeded, 0);
    assert_eq!(summary.tool_failed, 1);
    assert_eq!(summary.operation_counts.get("rag"), Some(&1));
    assert_eq!(summary.operation_counts.get("tool"), Some(&1));
    assert_eq!(summary.command_counts.get("ask"), Some(&4));
    assert_eq!(summary.last_event_ts_unix_ms, Some(1500));
}

#[test]
fn telemetry_limit_keeps_most_recent_lines() {
    let lines = (0..10)
        .map(|i| json!({"ts_unix_ms": i, "event": "query.started", "run_id": format!("run-{i}")}).to_string())
        .collect::<Vec<String>>();
    let summary = summarize_telemetry_lines(lines, 3);
    assert_eq!(summary.parsed_events, 3);
    assert!(summary.unique_runs.contains("run-9"));
    assert!(!summary.unique_runs.contains("run-0"));
}

#[tokio::test]
async fn telemetry_sink_appends_query_lifecycle() {
    let dir = tempdir().unwrap();
    let mut cfg = base_cfg();
    cfg.telemetry_enabled = true;
    cfg.telemetry_path = dir
        .path()
        .join("nested/events.jsonl")
        .to_string_lossy()
        .to_string();
    let sink = TelemetrySink::new(&cfg, "ask".to_string());

    let h = harness();
    let response = h.orchestrator.handle_query("weather in Oslo").await.unwrap();
    sink.emit("query.started", json!({"path": "ask"}));
    sink.emit_query_completed(&response, 12);

    let content = std::fs::read_to_string(&cfg.telemetry_path).unwrap();
    let lines = content.lines().map(str::to_string).collect::<Vec<String>>();
    assert_eq!(lines.len(), 4);

    let summary = summarize_telemetry_lines(lines, 100);
    assert_eq!(summary.query_started, 1);
    assert_eq!(summary.tool_requested, 1);
    assert_eq!(summary.tool_succeeded, 1);
    assert_eq!(summary.query_completed, 1);
    assert_eq!(summary.command_counts.get("ask"), Some(&4));
}

#[tokio::test]
async fn disabled_telemetry_writes_nothing() {
    let dir = tempdir().unwrap();
    let mut cfg = base_cfg();
    cfg.telemetry_path = dir.path().join("events.jsonl").to_string_lossy().to_string();
    let sink = TelemetrySink::new(&cfg, "ask".to_string());
    sink.emit("query.started", json!({}));
    assert!(!std::path::Path::new(&cfg.telemetry_path).exists());
}

#[tokio::test]
async fn chat_loop_answers_until_quit() {
    let h = harness();
    let sink = TelemetrySink::new(&base_cfg(), "chat".to_string());
    let input = tokio::io::BufReader::new(&b"7 - 3\n/trace\nApplications of AI\nquit\nnever asked\n"[..]);
    let mut out = Vec::new();

    run_chat_loop(&h.orchestrator, &sink, input, &mut out)
        .await
        .unwrap();
    let transcript = String::from_utf8(out).unwrap();

    assert!(transcript.contains("Answer:\nResult: 4.0\n\nNo citations available."));
    assert!(transcript.contains("Trace output on."));
    assert!(transcript.contains("Citations:\n- ai-report.pdf (page 4)\n- ai-report.pdf (page 9)"));
    assert!(transcript.contains("\"reason\": \"Use RAG"));
    assert!(transcript.trim_end().ends_with("Goodbye."));
    assert_eq!(h.search.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn chat_loop_stops_at_end_of_input_and_reports_errors() {
    let h = harness_with(StubSearch::with(Vec::new()), false);
    let sink = TelemetrySink::new(&base_cfg(), "chat".to_string());
    let input = tokio::io::BufReader::new(&b"what is in chapter two"[..]);
    let mut out = Vec::new();

    run_chat_loop(&h.orchestrator, &sink, input, &mut out)
        .await
        .unwrap();
    let transcript = String::from_utf8(out).unwrap();
    assert!(transcript.contains("Note: document answering is unavailable"));
    assert!(transcript.contains("Error: context-search capability is not initialized"));
    assert!(transcript.trim_end().ends_with("Goodbye."));
}

#[tokio::test]
async fn server_ask_returns_query_response() {
    let h = harness();
    let state = server_state(h.orchestrator.clone(), None);

    let Json(response) = handle_server_ask(
        State(state),
        HeaderMap::new(),
        Json(ServerAskRequest {
            query: "  calculate 2**10 ".to_string(),
        }),
    )
    .await
    .unwrap();
    assert_eq!(response.answer, "Result: 1024.0");
    assert_eq!(response.query, "calculate 2**10");
}

#[tokio::test]
async fn server_ask_maps_errors_to_status_codes() {
    let h = harness_with(StubSearch::with(Vec::new()), false);
    let state = server_state(h.orchestrator.clone(), None);

    let (status, _) = handle_server_ask(
        State(state.clone()),
        HeaderMap::new(),
        Json(ServerAskRequest {
            query: "   ".to_string(),
        }),
    )
    .await
    .unwrap_err();
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, Json(body)) = handle_server_ask(
        State(state),
        HeaderMap::new(),
        Json(ServerAskRequest {
            query: "Applications of AI".to_string(),
        }),
    )
    .await
    .unwrap_err();
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].as_str().unwrap().contains("context-search"));
}

#[tokio::test]
async fn server_requires_bearer_token_when_configured() {
    let h = harness();
    let state = server_state(h.orchestrator.clone(), Some("s3cret"));

    let (status, _) = handle_server_tool(
        State(state.clone()),
        HeaderMap::new(),
        Json(ServerToolRequest {
            tool: "calculator".to_string(),
            args: json!({"expression": "1+1"}),
        }),
    )
    .await
    .unwrap_err();
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let mut headers = HeaderMap::new();
    headers.insert(
        axum::http::header::AUTHORIZATION,
        HeaderValue::from_static("Bearer s3cret"),
    );
    let Json(result) = handle_server_tool(
        State(state),
        headers,
        Json(ServerToolRequest {
            tool: "calculator".to_string(),
            args: json!({"expression": "1+1"}),
        }),
    )
    .await
    .unwrap();
    assert_eq!(result, ToolResult::CalculatorResult { value: 2.0 });
}

#[tokio::test]
async fn server_health_reports_rag_readiness() {
    let ready = server_state(harness().orchestrator, None);
    let Json(health) = handle_server_health(State(ready)).await;
    assert_eq!(health.status, "ok");
    assert!(health.rag_ready);

    let not_ready = server_state(
        harness_with(StubSearch::with(Vec::new()), false).orchestrator,
        None,
    );
    let Json(health) = handle_server_health(State(not_ready)).await;
    assert!(!health.rag_ready);
}

#[test]
fn command_labels_are_stable() {
    assert_eq!(
        command_label(&Commands::Ask {
            query: vec!["hi".to_string()],
            trace: false
        }),
        "ask"
    );
    assert_eq!(
        command_label(&Commands::Tool {
            name: "Weather".to_string(),
            args: "{}".to_string()
        }),
        "tool.weather"
    );
    assert_eq!(
        command_label(&Commands::Telemetry {
            command: TelemetryCommands::Report {
                path: None,
                limit: 10
            }
        }),
        "telemetry.report"
    );
}

#[test]
fn cli_parses_corpus_list_and_ask_query() {
    use clap::Parser;

    let cli = Cli::try_parse_from([
        "askflow",
        "--corpus-path",
        "a.txt,b.txt",
        "--provider",
        "disabled",
        "ask",
        "--trace",
        "weather",
        "in",
        "Oslo",
    ])
    .expect("arguments should parse");

    assert_eq!(cli.corpus_path, vec!["a.txt".to_string(), "b.txt".to_string()]);
    assert_eq!(cli.provider, Some(Provider::Disabled));
    match cli.command {
        Some(Commands::Ask { query, trace }) => {
            assert!(trace);
            assert_eq!(query.join(" "), "weather in Oslo");
        }
        other => panic!("expected ask command, got {other:?}"),
    }
}

#[test]
fn profile_names_include_implicit_default() {
    let profiles: ProfilesFile =
        toml::from_str("[profiles.research]\nmodel = \"mistral\"\n[profiles.ci]\n").unwrap();
    assert_eq!(
        crate::profiles::profile_names(&profiles),
        vec!["ci".to_string(), "default".to_string(), "research".to_string()]
    );
}
