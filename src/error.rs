use thiserror::Error;

/// Failures that abort a run instead of being folded into a tool result.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("{0} capability is not initialized; initialize it before handling queries")]
    CapabilityNotInitialized(&'static str),

    #[error("{capability} call failed: {message}")]
    Capability {
        capability: &'static str,
        message: String,
    },

    #[error("operation already set to '{0}'")]
    OperationAlreadySet(&'static str),

    #[error("stage '{stage}' cannot run when operation is '{operation}'")]
    StageMismatch {
        stage: &'static str,
        operation: &'static str,
    },

    #[error("invalid workflow graph: {0}")]
    InvalidGraph(String),
}

impl WorkflowError {
    pub fn capability(capability: &'static str, err: impl std::fmt::Display) -> Self {
        WorkflowError::Capability {
            capability,
            message: format!("{err:#}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Capability,
    Tooling,
    Input,
    Internal,
}

impl ErrorCategory {
    pub fn code(self) -> &'static str {
        match self {
            ErrorCategory::Capability => "CAPABILITY",
            ErrorCategory::Tooling => "TOOLING",
            ErrorCategory::Input => "INPUT",
            ErrorCategory::Internal => "INTERNAL",
        }
    }

    pub fn hint(self) -> &'static str {
        match self {
            ErrorCategory::Capability => {
                "Configure --corpus-path and --provider ollama (or the active profile) so retrieval and generation are initialized."
            }
            ErrorCategory::Tooling => {
                "Review tool arguments and retry with RUST_LOG=info for detailed tool logs."
            }
            ErrorCategory::Input => "Run askflow --help and correct command arguments.",
            ErrorCategory::Internal => {
                "Retry with RUST_LOG=debug. If it persists, capture logs and open an issue."
            }
        }
    }
}

pub fn categorize_error(err: &anyhow::Error) -> ErrorCategory {
    if let Some(workflow_err) = err.downcast_ref::<WorkflowError>() {
        return match workflow_err {
            WorkflowError::CapabilityNotInitialized(_) | WorkflowError::Capability { .. } => {
                ErrorCategory::Capability
            }
            _ => ErrorCategory::Internal,
        };
    }

    let msg = format!("{err:#}").to_ascii_lowercase();

    if msg.contains("corpus")
        || msg.contains("ollama")
        || msg.contains("provider")
        || msg.contains("capability")
    {
        return ErrorCategory::Capability;
    }

    if msg.contains("invalid value")
        || msg.contains("unknown argument")
        || msg.contains("failed to read input")
        || msg.contains("profile")
        || msg.contains("bind address")
    {
        return ErrorCategory::Input;
    }

    if msg.contains("tool") || msg.contains("geocod") || msg.contains("forecast") {
        return ErrorCategory::Tooling;
    }

    ErrorCategory::Internal
}

pub fn format_cli_error(err: &anyhow::Error) -> String {
    let category = categorize_error(err);
    format!("[{}] {:#}\nHint: {}", category.code(), err, category.hint())
}
