//! Intent router ("planner"): the one branching decision of a run.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::WorkflowError;
use crate::state::{Operation, TraceEntry, WorkflowState};
use crate::tools::calculator::CalculatorRequest;
use crate::tools::weather::{DEFAULT_FORECAST_DAYS, WeatherRequest};
use crate::tools::{ToolInput, ToolName};

pub const DEFAULT_WEATHER_LOCATION: &str = "Chennai";
pub const WEATHER_KEYWORDS: [&str; 3] = ["weather", "temperature", "forecast"];

pub const WEATHER_PLAN: &str = "Call weather tool (no API key) using Open-Meteo.";
pub const CALCULATOR_PLAN: &str = "Call calculator tool to compute the expression.";
pub const RAG_PLAN: &str =
    "Use RAG to retrieve context from the documents and answer grounded with citations.";

static CALCULATE_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bcalculate\b").expect("calculate pattern is valid"));
static BINARY_ARITHMETIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+\s*[+\-*/]\s*\d+").expect("arithmetic pattern is valid"));

#[derive(Debug, Clone, PartialEq)]
pub struct RouteDecision {
    pub operation: Operation,
    pub plan: String,
    pub tool_name: Option<ToolName>,
    pub tool_input: Option<ToolInput>,
}

impl RouteDecision {
    fn tool(plan: &str, input: ToolInput) -> Self {
        Self {
            operation: Operation::Tool,
            plan: plan.to_string(),
            tool_name: Some(input.tool_name()),
            tool_input: Some(input),
        }
    }
}

/// Text after the first " in ", or the fallback city. Matching is ASCII
/// case-insensitive so the byte offset is valid in the original text.
pub fn extract_location(query: &str) -> String {
    let lower = query.to_ascii_lowercase();
    lower
        .find(" in ")
        .map(|index| query[index + " in ".len()..].trim().to_string())
        .unwrap_or_else(|| DEFAULT_WEATHER_LOCATION.to_string())
}

pub fn extract_expression(query: &str) -> String {
    let stripped = CALCULATE_WORD.replace_all(query, "");
    let stripped = stripped.trim();
    if stripped.is_empty() {
        query.to_string()
    } else {
        stripped.to_string()
    }
}

pub fn is_weather_query(query: &str) -> bool {
    let lower = query.to_ascii_lowercase();
    WEATHER_KEYWORDS
        .iter()
        .any(|keyword| lower.contains(keyword))
}

/// Any occurrence of "calculate" triggers, even inside a longer word; only
/// expression extraction requires the standalone word.
pub fn is_calculator_query(query: &str) -> bool {
    query.to_ascii_lowercase().contains("calculate") || BINARY_ARITHMETIC.is_match(query)
}

/// Classifies a query. Rules are checked in order and the first match wins.
pub fn route(query: &str) -> RouteDecision {
    let query = query.trim();

    if is_weather_query(query) {
        return RouteDecision::tool(
            WEATHER_PLAN,
            ToolInput::Weather(WeatherRequest {
                location: extract_location(query),
                days: DEFAULT_FORECAST_DAYS,
            }),
        );
    }

    if is_calculator_query(query) {
        return RouteDecision::tool(
            CALCULATOR_PLAN,
            ToolInput::Calculator(CalculatorRequest {
                expression: extract_expression(query),
            }),
        );
    }

    RouteDecision {
        operation: Operation::Rag,
        plan: RAG_PLAN.to_string(),
        tool_name: None,
        tool_input: None,
    }
}

pub fn run_planner_stage(state: &mut WorkflowState) -> Result<(), WorkflowError> {
    let decision = route(state.user_query());
    tracing::info!(
        operation = %decision.operation,
        tool = decision.tool_name.map(ToolName::as_str).unwrap_or("none"),
        "query routed"
    );

    state.set_operation(decision.operation)?;
    state.plan = decision.plan;
    state.tool_name = decision.tool_name;
    state.tool_input = decision.tool_input;
    state.record(TraceEntry::reason(state.plan.clone()));
    Ok(())
}
