use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier of one workflow run.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ExecutionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle of a single step execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    /// Whether the step has reached a final state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// Lifecycle of a workflow execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Scheduling hint carried by every step.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum StepPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Outcome of processing one step, mutated in place as the step progresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Wall time in milliseconds, set once the step is terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of attempts made (0 when skipped before dispatch).
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl StepResult {
    /// A freshly started step.
    pub fn running(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            result: None,
            error: None,
            attempts: 0,
            metadata: HashMap::new(),
        }
    }

    /// Move to a terminal status and stamp end time and duration.
    pub fn finish(&mut self, status: StepStatus) {
        let now = Utc::now();
        self.status = status;
        self.end_time = Some(now);
        self.duration_ms = Some(elapsed_ms(self.start_time, now));
    }
}

/// Aggregate outcome of one workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowResult {
    pub workflow_id: String,
    pub execution_id: ExecutionId,
    pub status: WorkflowStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Step results in completion order.
    #[serde(default)]
    pub steps: Vec<StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl WorkflowResult {
    pub fn running(workflow_id: impl Into<String>, execution_id: ExecutionId) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            execution_id,
            status: WorkflowStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            steps: Vec::new(),
            error: None,
            metadata: HashMap::new(),
        }
    }

    pub fn finish(&mut self, status: WorkflowStatus) {
        let now = Utc::now();
        self.status = status;
        self.end_time = Some(now);
        self.duration_ms = Some(elapsed_ms(self.start_time, now));
    }

    /// Look up the result of a step by id.
    pub fn step(&self, step_id: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }
}

fn elapsed_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    (end - start).num_milliseconds().max(0) as u64
}

/// Progress snapshot emitted as steps start and finish.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub workflow_id: String,
    pub execution_id: ExecutionId,
    pub step_id: String,
    /// Steps that reached a terminal status.
    pub finished: usize,
    /// Flattened count of every step in the definition.
    pub total: usize,
    /// `finished / total`, clamped to `[0.0, 1.0]`.
    pub progress: f64,
}

/// Message handed to fire-and-forget agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    pub action: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl AgentMessage {
    pub fn new(to: impl Into<String>, action: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            from: "execution-engine".to_string(),
            to: to.into(),
            action: action.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Discriminant used to subscribe to a class of events.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Progress,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepSkipped,
    StepRetrying,
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCancelled,
    AgentRegistered,
    AgentUnregistered,
    WorkflowRegistered,
    WorkflowUnregistered,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Progress => "progress",
            Self::StepStarted => "stepStarted",
            Self::StepCompleted => "stepCompleted",
            Self::StepFailed => "stepFailed",
            Self::StepSkipped => "stepSkipped",
            Self::StepRetrying => "stepRetrying",
            Self::WorkflowStarted => "workflowStarted",
            Self::WorkflowCompleted => "workflowCompleted",
            Self::WorkflowFailed => "workflowFailed",
            Self::WorkflowCancelled => "workflowCancelled",
            Self::AgentRegistered => "agentRegistered",
            Self::AgentUnregistered => "agentUnregistered",
            Self::WorkflowRegistered => "workflowRegistered",
            Self::WorkflowUnregistered => "workflowUnregistered",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Workflow event broadcast to all listeners.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkflowEvent {
    /// Progress recomputed after a step transition.
    Progress(ProgressUpdate),
    /// A step began processing.
    StepStarted { execution_id: ExecutionId, step_id: String },
    /// A step finished successfully.
    StepCompleted { execution_id: ExecutionId, result: StepResult },
    /// A step failed; the error propagates to its parent.
    StepFailed {
        execution_id: ExecutionId,
        result: StepResult,
        error: String,
    },
    /// A step's condition evaluated to false.
    StepSkipped { execution_id: ExecutionId, result: StepResult },
    /// A failed attempt is about to be retried.
    StepRetrying {
        execution_id: ExecutionId,
        step_id: String,
        attempt: u32,
        max_retries: u32,
        backoff_ms: u64,
        error: String,
    },
    WorkflowStarted {
        execution_id: ExecutionId,
        workflow_id: String,
    },
    WorkflowCompleted { result: WorkflowResult },
    WorkflowFailed { result: WorkflowResult, error: String },
    WorkflowCancelled { result: WorkflowResult },
    AgentRegistered { agent_id: String },
    AgentUnregistered { agent_id: String },
    WorkflowRegistered { workflow_id: String },
    WorkflowUnregistered { workflow_id: String },
}

impl WorkflowEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Progress(_) => EventKind::Progress,
            Self::StepStarted { .. } => EventKind::StepStarted,
            Self::StepCompleted { .. } => EventKind::StepCompleted,
            Self::StepFailed { .. } => EventKind::StepFailed,
            Self::StepSkipped { .. } => EventKind::StepSkipped,
            Self::StepRetrying { .. } => EventKind::StepRetrying,
            Self::WorkflowStarted { .. } => EventKind::WorkflowStarted,
            Self::WorkflowCompleted { .. } => EventKind::WorkflowCompleted,
            Self::WorkflowFailed { .. } => EventKind::WorkflowFailed,
            Self::WorkflowCancelled { .. } => EventKind::WorkflowCancelled,
            Self::AgentRegistered { .. } => EventKind::AgentRegistered,
            Self::AgentUnregistered { .. } => EventKind::AgentUnregistered,
            Self::WorkflowRegistered { .. } => EventKind::WorkflowRegistered,
            Self::WorkflowUnregistered { .. } => EventKind::WorkflowUnregistered,
        }
    }

    /// The execution this event belongs to, if any.
    pub fn execution_id(&self) -> Option<&ExecutionId> {
        match self {
            Self::Progress(p) => Some(&p.execution_id),
            Self::StepStarted { execution_id, .. }
            | Self::StepCompleted { execution_id, .. }
            | Self::StepFailed { execution_id, .. }
            | Self::StepSkipped { execution_id, .. }
            | Self::StepRetrying { execution_id, .. }
            | Self::WorkflowStarted { execution_id, .. } => Some(execution_id),
            Self::WorkflowCompleted { result }
            | Self::WorkflowFailed { result, .. }
            | Self::WorkflowCancelled { result } => Some(&result.execution_id),
            _ => None,
        }
    }

    /// Whether this event ends an execution.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted { .. } | Self::WorkflowFailed { .. } | Self::WorkflowCancelled { .. }
        )
    }
}
