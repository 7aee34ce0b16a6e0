use std::collections::HashMap;

use mplp_core::types::StepPriority;

use super::condition::Condition;

/// Loop bound applied when a loop step does not set one.
pub const DEFAULT_MAX_ITERATIONS: usize = 1000;

/// One unit of work in a workflow.
///
/// The common fields apply to every step type; `kind` carries the
/// type-specific payload. Composite kinds own their sub-steps.
#[derive(Debug, Clone)]
pub struct Step {
    /// Unique identifier within the workflow.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Ids of top-level steps that must finish first.
    pub dependencies: Vec<String>,
    /// Per-attempt timeout in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Retries after the first failed attempt.
    pub retries: Option<u32>,
    pub priority: StepPriority,
    pub metadata: HashMap<String, serde_json::Value>,
    /// When present and false, the step is skipped.
    pub condition: Option<Condition>,
    pub kind: StepKind,
}

/// Type-specific payload of a [`Step`].
#[derive(Debug, Clone)]
pub enum StepKind {
    /// Invoke an action on a registered agent.
    Agent {
        agent_id: String,
        action: String,
        parameters: serde_json::Map<String, serde_json::Value>,
    },
    /// Run sub-steps concurrently.
    Parallel {
        steps: Vec<Step>,
        /// Maximum sub-steps in flight; `None` falls back to the execution
        /// options, then the engine config, then the sub-step count.
        concurrency: Option<usize>,
        /// Abort on the first failure instead of collecting outcomes.
        fail_fast: bool,
    },
    /// Run sub-steps one after another.
    Sequential { steps: Vec<Step> },
    /// Run `then_step` or `else_step` depending on `condition`.
    Conditional {
        condition: Condition,
        then_step: Box<Step>,
        else_step: Option<Box<Step>>,
    },
    /// Run `body` while `condition` holds, at most `max_iterations` times.
    Loop {
        condition: Condition,
        body: Box<Step>,
        max_iterations: usize,
    },
}

impl StepKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Agent { .. } => "agent",
            Self::Parallel { .. } => "parallel",
            Self::Sequential { .. } => "sequential",
            Self::Conditional { .. } => "conditional",
            Self::Loop { .. } => "loop",
        }
    }
}

impl Step {
    fn with_kind(id: impl Into<String>, name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            dependencies: vec![],
            timeout_ms: None,
            retries: None,
            priority: StepPriority::default(),
            metadata: HashMap::new(),
            condition: None,
            kind,
        }
    }

    /// Create an agent step.
    pub fn agent(
        id: impl Into<String>,
        name: impl Into<String>,
        agent_id: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self::with_kind(
            id,
            name,
            StepKind::Agent {
                agent_id: agent_id.into(),
                action: action.into(),
                parameters: serde_json::Map::new(),
            },
        )
    }

    /// Create a parallel step.
    pub fn parallel(id: impl Into<String>, name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self::with_kind(
            id,
            name,
            StepKind::Parallel {
                steps,
                concurrency: None,
                fail_fast: false,
            },
        )
    }

    /// Create a sequential step.
    pub fn sequential(id: impl Into<String>, name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self::with_kind(id, name, StepKind::Sequential { steps })
    }

    /// Create a conditional step without an else branch.
    pub fn conditional(
        id: impl Into<String>,
        name: impl Into<String>,
        condition: Condition,
        then_step: Step,
    ) -> Self {
        Self::with_kind(
            id,
            name,
            StepKind::Conditional {
                condition,
                then_step: Box::new(then_step),
                else_step: None,
            },
        )
    }

    /// Create a loop step bounded by [`DEFAULT_MAX_ITERATIONS`].
    pub fn r#loop(
        id: impl Into<String>,
        name: impl Into<String>,
        condition: Condition,
        body: Step,
    ) -> Self {
        Self::with_kind(
            id,
            name,
            StepKind::Loop {
                condition,
                body: Box::new(body),
                max_iterations: DEFAULT_MAX_ITERATIONS,
            },
        )
    }

    /// Add one agent parameter. No effect on other step types.
    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        if let StepKind::Agent { parameters, .. } = &mut self.kind {
            parameters.insert(key.into(), value);
        }
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_priority(mut self, priority: StepPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Set the concurrency of a parallel step.
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        if let StepKind::Parallel { concurrency, .. } = &mut self.kind {
            *concurrency = Some(limit);
        }
        self
    }

    /// Set fail-fast on a parallel step.
    pub fn with_fail_fast(mut self, enabled: bool) -> Self {
        if let StepKind::Parallel { fail_fast, .. } = &mut self.kind {
            *fail_fast = enabled;
        }
        self
    }

    /// Set the else branch of a conditional step.
    pub fn with_else(mut self, step: Step) -> Self {
        if let StepKind::Conditional { else_step, .. } = &mut self.kind {
            *else_step = Some(Box::new(step));
        }
        self
    }

    /// Set the iteration bound of a loop step.
    pub fn with_max_iterations(mut self, limit: usize) -> Self {
        if let StepKind::Loop { max_iterations, .. } = &mut self.kind {
            *max_iterations = limit;
        }
        self
    }

    /// Direct sub-steps of a composite step.
    pub fn children(&self) -> Vec<&Step> {
        match &self.kind {
            StepKind::Agent { .. } => vec![],
            StepKind::Parallel { steps, .. } | StepKind::Sequential { steps } => {
                steps.iter().collect()
            }
            StepKind::Conditional {
                then_step,
                else_step,
                ..
            } => {
                let mut children = vec![then_step.as_ref()];
                children.extend(else_step.as_deref());
                children
            }
            StepKind::Loop { body, .. } => vec![body.as_ref()],
        }
    }

    /// This step and all nested sub-steps, depth first.
    pub fn flatten(&self) -> Vec<&Step> {
        let mut out = vec![self];
        for child in self.children() {
            out.extend(child.flatten());
        }
        out
    }
}
