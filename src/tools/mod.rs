pub mod calculator;
pub mod weather;

use std::sync::Arc;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Value, json};

use crate::error::WorkflowError;
use crate::state::{Operation, TraceEntry, WorkflowState};

use calculator::{ALLOWED_NAMES, CalculatorRequest, run_calculator};
use weather::{
    DailyForecast, ForecastProvider, Geocoder, MAX_FORECAST_DAYS, MIN_FORECAST_DAYS,
    WeatherRequest, run_weather,
};

pub const WEATHER_TOOL_NAME: &str = "weather";
pub const CALCULATOR_TOOL_NAME: &str = "calculator";
pub const TOOL_CALL_ACTION: &str = "Tool.call";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolName {
    Weather,
    Calculator,
}

impl ToolName {
    pub const ALL: [ToolName; 2] = [ToolName::Weather, ToolName::Calculator];

    pub fn as_str(self) -> &'static str {
        match self {
            ToolName::Weather => WEATHER_TOOL_NAME,
            ToolName::Calculator => CALCULATOR_TOOL_NAME,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            WEATHER_TOOL_NAME => Some(ToolName::Weather),
            CALCULATOR_TOOL_NAME => Some(ToolName::Calculator),
            _ => None,
        }
    }

    pub fn description(self) -> String {
        match self {
            ToolName::Weather => format!(
                "Multi-day forecast from Open-Meteo. Args: location (required), days ({MIN_FORECAST_DAYS}-{MAX_FORECAST_DAYS}, default 3)."
            ),
            ToolName::Calculator => format!(
                "Evaluates + - * / % ** and parentheses with {}. Args: expression (required).",
                ALLOWED_NAMES.join(", ")
            ),
        }
    }

    fn error(self, message: String) -> ToolResult {
        match self {
            ToolName::Weather => ToolResult::WeatherError { message },
            ToolName::Calculator => ToolResult::CalculatorError { message },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ToolInput {
    Weather(WeatherRequest),
    Calculator(CalculatorRequest),
}

impl ToolInput {
    pub fn tool_name(&self) -> ToolName {
        match self {
            ToolInput::Weather(_) => ToolName::Weather,
            ToolInput::Calculator(_) => ToolName::Calculator,
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_args(tool_name: ToolName, args: &Value) -> Result<Self, String> {
        match tool_name {
            ToolName::Weather => serde_json::from_value::<WeatherRequest>(args.clone())
                .map(ToolInput::Weather)
                .map_err(|err| format!("invalid weather arguments: {err}")),
            ToolName::Calculator => serde_json::from_value::<CalculatorRequest>(args.clone())
                .map(ToolInput::Calculator)
                .map_err(|err| format!("invalid calculator arguments: {err}")),
        }
    }
}

/// Structured outcome of one tool call. Every failure mode lands in an error variant.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolResult {
    WeatherResult {
        location: String,
        days: u8,
        forecast: Vec<DailyForecast>,
    },
    WeatherError {
        message: String,
    },
    CalculatorResult {
        value: f64,
    },
    CalculatorError {
        message: String,
    },
    UnknownTool {
        error: String,
    },
}

impl ToolResult {
    pub fn unknown(name: &str) -> Self {
        ToolResult::UnknownTool {
            error: format!("Unknown tool: {name}"),
        }
    }

    pub fn ok(&self) -> bool {
        matches!(
            self,
            ToolResult::WeatherResult { .. } | ToolResult::CalculatorResult { .. }
        )
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            ToolResult::WeatherError { message } | ToolResult::CalculatorError { message } => {
                Some(message.as_str())
            }
            ToolResult::UnknownTool { error } => Some(error.as_str()),
            ToolResult::WeatherResult { .. } | ToolResult::CalculatorResult { .. } => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            ToolResult::WeatherResult {
                location,
                days,
                forecast,
            } => json!({
                "ok": true,
                "location": location,
                "days": days,
                "forecast": forecast,
            }),
            ToolResult::CalculatorResult { value } => json!({
                "ok": true,
                "value": value,
            }),
            ToolResult::WeatherError { message }
            | ToolResult::CalculatorError { message }
            | ToolResult::UnknownTool { error: message } => json!({
                "ok": false,
                "error": message,
            }),
        }
    }
}

impl Serialize for ToolResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// Dispatches tool calls to the fixed tool set using injected network capabilities.
#[derive(Clone)]
pub struct ToolExecutor {
    geocoder: Arc<dyn Geocoder>,
    forecast: Arc<dyn ForecastProvider>,
}

impl ToolExecutor {
    pub fn new(geocoder: Arc<dyn Geocoder>, forecast: Arc<dyn ForecastProvider>) -> Self {
        Self { geocoder, forecast }
    }

    pub async fn execute(
        &self,
        tool_name: Option<ToolName>,
        tool_input: Option<&ToolInput>,
    ) -> ToolResult {
        match (tool_name, tool_input) {
            (Some(ToolName::Weather), Some(ToolInput::Weather(request))) => {
                run_weather(request, self.geocoder.as_ref(), self.forecast.as_ref()).await
            }
            (Some(ToolName::Calculator), Some(ToolInput::Calculator(request))) => {
                run_calculator(request)
            }
            (name, _) => ToolResult::unknown(name.map(ToolName::as_str).unwrap_or_default()),
        }
    }

    /// Runs a tool from a free-form name and JSON arguments.
    pub async fn execute_by_name(&self, name: &str, args: &Value) -> ToolResult {
        let Some(tool_name) = ToolName::parse(name) else {
            return ToolResult::unknown(name);
        };
        match ToolInput::from_args(tool_name, args) {
            Ok(input) => self.execute(Some(tool_name), Some(&input)).await,
            Err(message) => tool_name.error(message),
        }
    }
}

pub async fn run_tool_stage(
    state: &mut WorkflowState,
    executor: &ToolExecutor,
) -> Result<(), WorkflowError> {
    state.require_operation("tool", Operation::Tool)?;

    let tool = state.tool_name.map(ToolName::as_str).unwrap_or_default();
    let input = state
        .tool_input
        .as_ref()
        .map(ToolInput::to_json)
        .unwrap_or_else(|| json!({}));
    state.record(TraceEntry::act(
        TOOL_CALL_ACTION,
        json!({ "tool": tool, "input": input }),
    ));
    tracing::info!(tool, "tool call requested");

    let result = executor
        .execute(state.tool_name, state.tool_input.as_ref())
        .await;
    match result.error_message() {
        None => tracing::info!(tool, "tool call succeeded"),
        Some(error) => tracing::warn!(tool, error, "tool call failed"),
    }

    state.record(TraceEntry::observe(result.to_json()));
    state.tool_result = Some(result);
    state.citations.clear();
    Ok(())
}
