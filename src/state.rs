//! Per-run workflow state and the Reason/Act/Observe trace.

use std::num::NonZeroU32;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WorkflowError;
use crate::tools::{ToolInput, ToolName, ToolResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    #[default]
    Unset,
    Rag,
    Tool,
}

impl Operation {
    pub fn label(self) -> &'static str {
        match self {
            Operation::Unset => "unset",
            Operation::Rag => "rag",
            Operation::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One step of the execution audit log.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TraceEntry {
    Reason {
        #[serde(rename = "reason")]
        text: String,
    },
    Act {
        #[serde(rename = "act")]
        action: String,
        input: Value,
    },
    Observe {
        #[serde(rename = "observe")]
        outcome: Value,
    },
}

impl TraceEntry {
    pub fn reason(text: impl Into<String>) -> Self {
        TraceEntry::Reason { text: text.into() }
    }

    pub fn act(action: impl Into<String>, input: Value) -> Self {
        TraceEntry::Act {
            action: action.into(),
            input,
        }
    }

    pub fn observe(outcome: impl Into<Value>) -> Self {
        TraceEntry::Observe {
            outcome: outcome.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TraceEntry::Reason { .. } => "reason",
            TraceEntry::Act { .. } => "act",
            TraceEntry::Observe { .. } => "observe",
        }
    }
}

/// Append-only list of trace entries. Entries cannot be edited or reordered once pushed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Trace {
    entries: Vec<TraceEntry>,
}

impl Trace {
    pub fn push(&mut self, entry: TraceEntry) {
        tracing::debug!(kind = entry.kind(), position = self.entries.len(), "trace entry");
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.entries.iter().map(TraceEntry::kind).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub source: String,
    pub page: NonZeroU32,
}

impl Citation {
    /// Pages are 1-based; a zero page from a backend is clamped to the first page.
    pub fn new(source: impl Into<String>, page: u32) -> Self {
        Self {
            source: source.into(),
            page: NonZeroU32::new(page).unwrap_or(NonZeroU32::MIN),
        }
    }
}

/// Mutable record threaded through one run. Created fresh for every query.
#[derive(Debug, Clone)]
pub struct WorkflowState {
    user_query: String,
    operation: Operation,
    trace: Trace,
    pub plan: String,
    pub retrieved_context: String,
    pub citations: Vec<Citation>,
    pub tool_name: Option<ToolName>,
    pub tool_input: Option<ToolInput>,
    pub tool_result: Option<ToolResult>,
    pub final_answer: String,
    pub error: String,
}

impl WorkflowState {
    pub fn new(user_query: impl Into<String>) -> Self {
        Self {
            user_query: user_query.into(),
            operation: Operation::Unset,
            trace: Trace::default(),
            plan: String::new(),
            retrieved_context: String::new(),
            citations: Vec::new(),
            tool_name: None,
            tool_input: None,
            tool_result: None,
            final_answer: String::new(),
            error: String::new(),
        }
    }

    pub fn user_query(&self) -> &str {
        &self.user_query
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Fixes the run's path. Only the planner calls this, and only once.
    pub fn set_operation(&mut self, operation: Operation) -> Result<(), WorkflowError> {
        if self.operation != Operation::Unset {
            return Err(WorkflowError::OperationAlreadySet(self.operation.label()));
        }
        self.operation = operation;
        Ok(())
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn record(&mut self, entry: TraceEntry) {
        self.trace.push(entry);
    }

    pub(crate) fn into_trace(self) -> Trace {
        self.trace
    }

    pub(crate) fn require_operation(
        &self,
        stage: &'static str,
        expected: Operation,
    ) -> Result<(), WorkflowError> {
        if self.operation != expected {
            return Err(WorkflowError::StageMismatch {
                stage,
                operation: self.operation.label(),
            });
        }
        Ok(())
    }
}
