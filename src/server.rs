use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router as AxumRouter};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::WorkflowError;
use crate::telemetry::TelemetrySink;
use crate::tools::ToolResult;
use crate::workflow::{Orchestrator, QueryResponse};

pub const SERVER_AUTH_TOKEN_ENV: &str = "ASKFLOW_SERVER_AUTH_TOKEN";

#[derive(Clone)]
pub struct ServerState {
    pub orchestrator: Arc<Orchestrator>,
    pub telemetry: TelemetrySink,
    pub profile: String,
    pub auth_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ServerHealthResponse {
    pub status: &'static str,
    pub profile: String,
    pub rag_ready: bool,
}

#[derive(Debug, Deserialize)]
pub struct ServerAskRequest {
    pub query: String,
}

#[derive(Debug, Deserialize)]
pub struct ServerToolRequest {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

pub type ApiError = (StatusCode, Json<Value>);
pub type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

pub fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

fn workflow_status(err: &WorkflowError) -> StatusCode {
    match err {
        WorkflowError::CapabilityNotInitialized(_) => StatusCode::SERVICE_UNAVAILABLE,
        WorkflowError::Capability { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn check_server_auth(state: &ServerState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected_token) = state.auth_token.as_deref() else {
        return Ok(());
    };

    let header_value = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let provided_token = header_value
        .strip_prefix("Bearer ")
        .unwrap_or_default()
        .trim();

    if provided_token.is_empty() || provided_token != expected_token {
        return Err(api_error(
            StatusCode::UNAUTHORIZED,
            "missing or invalid Authorization bearer token",
        ));
    }

    Ok(())
}

pub async fn handle_server_health(
    State(state): State<Arc<ServerState>>,
) -> Json<ServerHealthResponse> {
    Json(ServerHealthResponse {
        status: "ok",
        profile: state.profile.clone(),
        rag_ready: state.orchestrator.ensure_ready().is_ok(),
    })
}

pub async fn handle_server_ask(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(request): Json<ServerAskRequest>,
) -> ApiResult<QueryResponse> {
    check_server_auth(&state, &headers)?;
    let started_at = Instant::now();

    let query = request.query.trim().to_string();
    if query.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "query cannot be empty for /v1/ask",
        ));
    }

    state
        .telemetry
        .emit("query.started", json!({ "path": "server" }));
    match state.orchestrator.handle_query(&query).await {
        Ok(response) => {
            state
                .telemetry
                .emit_query_completed(&response, started_at.elapsed().as_millis());
            Ok(Json(response))
        }
        Err(err) => {
            tracing::error!(error = %err, "server query failed");
            state.telemetry.emit(
                "query.failed",
                json!({ "path": "server", "error": err.to_string() }),
            );
            Err(api_error(workflow_status(&err), err.to_string()))
        }
    }
}

pub async fn handle_server_tool(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(request): Json<ServerToolRequest>,
) -> ApiResult<ToolResult> {
    check_server_auth(&state, &headers)?;
    let args = if request.args.is_null() {
        json!({})
    } else {
        request.args
    };

    state
        .telemetry
        .emit("tool.requested", json!({ "tool": request.tool.clone() }));
    let result = state
        .orchestrator
        .tools()
        .execute_by_name(&request.tool, &args)
        .await;
    state.telemetry.emit_tool_result(&request.tool, &result);
    Ok(Json(result))
}

pub fn build_server_router(state: Arc<ServerState>) -> AxumRouter {
    AxumRouter::new()
        .route("/healthz", get(handle_server_health))
        .route("/v1/ask", post(handle_server_ask))
        .route("/v1/tool", post(handle_server_tool))
        .with_state(state)
}

pub async fn run_server(
    orchestrator: Arc<Orchestrator>,
    profile: String,
    host: String,
    port: u16,
    telemetry: &TelemetrySink,
) -> Result<()> {
    let addr = format!("{host}:{port}")
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid server bind address '{}:{}'", host, port))?;

    if let Err(err) = orchestrator.ensure_ready() {
        tracing::warn!(error = %err, "document answering unavailable; tool queries still served");
    }

    let state = Arc::new(ServerState {
        orchestrator,
        telemetry: telemetry.clone(),
        profile: profile.clone(),
        auth_token: std::env::var(SERVER_AUTH_TOKEN_ENV)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty()),
    });

    telemetry.emit(
        "server.started",
        json!({
            "host": host,
            "port": port,
            "profile": profile,
            "auth": state.auth_token.is_some(),
        }),
    );

    println!(
        "Server mode listening on http://{} (health: /healthz, ask: /v1/ask, tool: /v1/tool)",
        addr
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind server listener")?;
    axum::serve(listener, build_server_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server runtime failed")
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { println!("\nReceived Ctrl+C, shutting down gracefully..."); }
        _ = terminate => { println!("\nReceived SIGTERM, shutting down gracefully..."); }
    }
}
