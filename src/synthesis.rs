use serde_json::json;

use crate::error::WorkflowError;
use crate::generation::{GENERATION_CAPABILITY, Generator, grounded_prompt};
use crate::state::{Operation, TraceEntry, WorkflowState};
use crate::tools::{ToolName, ToolResult};

pub const GENERATE_ACTION: &str = "LLM.generate_grounded_answer";
pub const UNSUPPORTED_OPERATION: &str = "Unsupported operation.";

/// Whole numbers keep one decimal place so `15` prints as `15.0` and `0` as `0.0`.
pub fn format_number(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

pub fn format_tool_answer(tool_name: Option<ToolName>, result: Option<&ToolResult>) -> String {
    let name = tool_name.map(ToolName::as_str).unwrap_or_default();
    match result {
        Some(ToolResult::WeatherResult {
            location, forecast, ..
        }) => {
            let mut lines = vec![format!("Weather Forecast for {location}:")];
            lines.extend(forecast.iter().map(|day| {
                format!(
                    "- {}: min {}°C, max {}°C, rain {}mm, wind {}km/h",
                    day.date,
                    format_number(day.temp_min_c),
                    format_number(day.temp_max_c),
                    format_number(day.precip_mm),
                    format_number(day.wind_max_kmh)
                )
            }));
            lines.join("\n")
        }
        Some(ToolResult::CalculatorResult { value }) => {
            format!("Result: {}", format_number(*value))
        }
        Some(failed) => {
            let pretty = serde_json::to_string_pretty(&failed.to_json())
                .unwrap_or_else(|_| failed.to_json().to_string());
            format!("Tool '{name}' failed: {pretty}")
        }
        None => {
            let missing = ToolResult::unknown(name);
            let pretty = serde_json::to_string_pretty(&missing.to_json())
                .unwrap_or_else(|_| missing.to_json().to_string());
            format!("Tool '{name}' failed: {pretty}")
        }
    }
}

pub async fn run_synthesis_stage(
    state: &mut WorkflowState,
    generator: Option<&dyn Generator>,
) -> Result<(), WorkflowError> {
    match state.operation() {
        Operation::Rag => {
            let generator =
                generator.ok_or(WorkflowError::CapabilityNotInitialized(GENERATION_CAPABILITY))?;
            state.record(TraceEntry::act(
                GENERATE_ACTION,
                json!({ "model": generator.name() }),
            ));
            let prompt = grounded_prompt(&state.retrieved_context, state.user_query());
            let answer = generator
                .generate(&prompt)
                .await
                .map_err(|err| WorkflowError::capability(GENERATION_CAPABILITY, err))?;
            tracing::info!(
                model = generator.name(),
                answer_chars = answer.len(),
                citations = state.citations.len(),
                "grounded answer generated"
            );
            state.final_answer = answer;
        }
        Operation::Tool => {
            state.final_answer = format_tool_answer(state.tool_name, state.tool_result.as_ref());
            state.citations.clear();
        }
        Operation::Unset => {
            tracing::warn!("synthesis reached without a routed operation");
            state.final_answer = UNSUPPORTED_OPERATION.to_string();
            state.citations.clear();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Citation;
    use crate::tools::weather::DailyForecast;
    use chrono::NaiveDate;

    #[test]
    fn numbers_keep_one_decimal_when_whole() {
        assert_eq!(format_number(15.0), "15.0");
        assert_eq!(format_number(-4.0), "-4.0");
        assert_eq!(format_number(2.5), "2.5");
        assert_eq!(format_number(0.1 + 0.2), "0.30000000000000004");
    }

    #[test]
    fn weather_answer_has_one_line_per_day() {
        let result = ToolResult::WeatherResult {
            location: "Chennai, India".to_string(),
            days: 2,
            forecast: vec![
                DailyForecast {
                    date: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
                    temp_max_c: 33.1,
                    temp_min_c: 24.5,
                    precip_mm: 0.0,
                    wind_max_kmh: 18.2,
                },
                DailyForecast {
                    date: NaiveDate::from_ymd_opt(2025, 3, 2).unwrap(),
                    temp_max_c: 32.0,
                    temp_min_c: 25.0,
                    precip_mm: 1.4,
                    wind_max_kmh: 20.0,
                },
            ],
        };
        let answer = format_tool_answer(Some(ToolName::Weather), Some(&result));
        assert_eq!(
            answer,
            "Weather Forecast for Chennai, India:\n\
             - 2025-03-01: min 24.5°C, max 33.1°C, rain 0.0mm, wind 18.2km/h\n\
             - 2025-03-02: min 25.0°C, max 32.0°C, rain 1.4mm, wind 20.0km/h"
        );
    }

    #[test]
    fn failed_tool_answer_embeds_pretty_json() {
        let result = ToolResult::CalculatorError {
            message: "Expression cannot be empty.".to_string(),
        };
        let answer = format_tool_answer(Some(ToolName::Calculator), Some(&result));
        assert!(answer.starts_with("Tool 'calculator' failed: {"));
        assert!(answer.contains("\"ok\": false"));
        assert!(answer.contains("Expression cannot be empty."));
    }

    #[tokio::test]
    async fn tool_synthesis_clears_citations() {
        let mut state = WorkflowState::new("2+3");
        state.set_operation(Operation::Tool).unwrap();
        state.tool_name = Some(ToolName::Calculator);
        state.tool_result = Some(ToolResult::CalculatorResult { value: 5.0 });
        state.citations.push(Citation::new("stale.pdf", 2));

        run_synthesis_stage(&mut state, None).await.unwrap();
        assert_eq!(state.final_answer, "Result: 5.0");
        assert!(state.citations.is_empty());
    }

    #[tokio::test]
    async fn unset_operation_is_unsupported() {
        let mut state = WorkflowState::new("anything");
        state.citations.push(Citation::new("doc.pdf", 1));
        run_synthesis_stage(&mut state, None).await.unwrap();
        assert_eq!(state.final_answer, UNSUPPORTED_OPERATION);
        assert!(state.citations.is_empty());
    }

    #[tokio::test]
    async fn rag_synthesis_without_generator_is_fatal() {
        let mut state = WorkflowState::new("what is AI");
        state.set_operation(Operation::Rag).unwrap();
        let err = run_synthesis_stage(&mut state, None).await.unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::CapabilityNotInitialized(GENERATION_CAPABILITY)
        ));
    }
}
