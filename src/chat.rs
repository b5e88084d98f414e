use std::io::Write;
use std::time::Instant;

use anyhow::{Context, Result};
use serde_json::json;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::telemetry::TelemetrySink;
use crate::tools::ToolName;
use crate::workflow::{Orchestrator, QueryResponse};

pub const CHAT_BANNER: &str = "askflow ready. Type 'quit' to exit, /help for commands.";
pub const CHAT_PROMPT: &str = "\nAsk a question: ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Exit,
    Help,
    Tools,
    Trace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedChatInput {
    Query(String),
    Command(ChatCommand),
    UnknownCommand(String),
}

/// Empty input, `quit` and `exit` (any case, with or without a slash) end the loop.
pub fn parse_chat_input(input: &str) -> ParsedChatInput {
    let trimmed = input.trim();
    let slashless = trimmed.strip_prefix('/').unwrap_or(trimmed);

    if trimmed.is_empty()
        || slashless.eq_ignore_ascii_case("quit")
        || slashless.eq_ignore_ascii_case("exit")
    {
        return ParsedChatInput::Command(ChatCommand::Exit);
    }

    if !trimmed.starts_with('/') {
        return ParsedChatInput::Query(trimmed.to_string());
    }

    match slashless.to_ascii_lowercase().as_str() {
        "help" => ParsedChatInput::Command(ChatCommand::Help),
        "tools" => ParsedChatInput::Command(ChatCommand::Tools),
        "trace" => ParsedChatInput::Command(ChatCommand::Trace),
        other => ParsedChatInput::UnknownCommand(format!("/{other}")),
    }
}

fn write_chat_help(out: &mut impl Write) -> Result<()> {
    writeln!(out, "Chat commands:")?;
    writeln!(out, "- /help: show command quick reference")?;
    writeln!(out, "- /tools: list the available tools")?;
    writeln!(out, "- /trace: toggle printing the execution trace")?;
    writeln!(out, "- quit, exit or an empty line: end the session")?;
    Ok(())
}

/// Answer, citations and (optionally) the JSON trace, as printed by `ask` and `chat`.
pub fn render_response(response: &QueryResponse, show_trace: bool) -> String {
    let mut out = format!("\nAnswer:\n{}\n", response.answer);
    if response.citations.is_empty() {
        out.push_str("\nNo citations available.\n");
    } else {
        out.push_str("\nCitations:\n");
        for citation in &response.citations {
            out.push_str(&format!("- {} (page {})\n", citation.source, citation.page));
        }
    }
    if show_trace {
        let trace = serde_json::to_string_pretty(&response.trace)
            .unwrap_or_else(|_| "[]".to_string());
        out.push_str(&format!("\nTrace:\n{trace}\n"));
    }
    out
}

pub async fn run_chat_loop<R, W>(
    orchestrator: &Orchestrator,
    telemetry: &TelemetrySink,
    mut input: R,
    out: &mut W,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    writeln!(out, "{CHAT_BANNER}")?;
    if let Err(err) = orchestrator.ensure_ready() {
        writeln!(out, "Note: document answering is unavailable ({err}).")?;
    }

    let mut show_trace = false;
    let mut line = String::new();
    loop {
        write!(out, "{CHAT_PROMPT}")?;
        out.flush().context("failed to flush chat prompt")?;

        line.clear();
        let read = input
            .read_line(&mut line)
            .await
            .context("failed to read input")?;
        if read == 0 {
            break;
        }

        let query = match parse_chat_input(&line) {
            ParsedChatInput::Query(query) => query,
            ParsedChatInput::Command(ChatCommand::Exit) => break,
            ParsedChatInput::Command(ChatCommand::Help) => {
                write_chat_help(out)?;
                continue;
            }
            ParsedChatInput::Command(ChatCommand::Tools) => {
                for tool in ToolName::ALL {
                    writeln!(out, "- {}: {}", tool.as_str(), tool.description())?;
                }
                continue;
            }
            ParsedChatInput::Command(ChatCommand::Trace) => {
                show_trace = !show_trace;
                let state = if show_trace { "on" } else { "off" };
                writeln!(out, "Trace output {state}.")?;
                continue;
            }
            ParsedChatInput::UnknownCommand(command) => {
                writeln!(out, "Unknown command '{command}'. Type /help.")?;
                continue;
            }
        };

        let started_at = Instant::now();
        telemetry.emit("query.started", json!({ "path": "chat" }));
        match orchestrator.handle_query(&query).await {
            Ok(response) => {
                telemetry.emit_query_completed(&response, started_at.elapsed().as_millis());
                write!(out, "{}", render_response(&response, show_trace))?;
            }
            Err(err) => {
                tracing::error!(error = %err, "chat query failed");
                telemetry.emit(
                    "query.failed",
                    json!({ "path": "chat", "error": err.to_string() }),
                );
                writeln!(out, "\nError: {err}")?;
            }
        }
    }

    writeln!(out, "Goodbye.")?;
    Ok(())
}
