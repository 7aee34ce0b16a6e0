use thiserror::Error;

#[derive(Debug, Error)]
pub enum MplpError {
    // Definition errors
    #[error("Invalid workflow definition: {0}")]
    WorkflowDefinition(String),

    // Execution errors
    #[error("Workflow execution error: {0}")]
    Execution(String),

    #[error("Step '{step_id}' failed: {message}")]
    StepExecution { step_id: String, message: String },

    #[error("Step '{step_id}' timed out after {timeout_ms}ms")]
    StepTimeout { step_id: String, timeout_ms: u64 },

    #[error("Workflow '{workflow_id}' timed out after {timeout_ms}ms")]
    WorkflowTimeout { workflow_id: String, timeout_ms: u64 },

    #[error("Execution cancelled: {0}")]
    Cancelled(String),

    // Not-found errors
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    // Orchestrator errors
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MplpError {
    /// Shorthand for a step-level failure.
    pub fn step(step_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StepExecution {
            step_id: step_id.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the failed step could change the outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StepExecution { .. } | Self::StepTimeout { .. } | Self::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MplpError>;
