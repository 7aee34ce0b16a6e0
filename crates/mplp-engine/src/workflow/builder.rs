use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use mplp_core::error::{MplpError, Result};
use mplp_core::types::StepPriority;

use super::condition::Condition;
use super::definition::WorkflowDefinition;
use super::step::{Step, StepKind, DEFAULT_MAX_ITERATIONS};

/// Options shared by every step type.
#[derive(Debug, Clone, Default)]
pub struct StepOptions {
    pub dependencies: Vec<String>,
    pub timeout_ms: Option<u64>,
    pub retries: Option<u32>,
    pub priority: StepPriority,
    pub metadata: HashMap<String, serde_json::Value>,
    pub condition: Option<Condition>,
}

/// Chainable setters for the [`StepOptions`] of a step config.
pub trait StepConfig: Sized {
    fn options_mut(&mut self) -> &mut StepOptions;

    fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options_mut()
            .dependencies
            .extend(deps.into_iter().map(Into::into));
        self
    }

    fn timeout(mut self, timeout_ms: u64) -> Self {
        self.options_mut().timeout_ms = Some(timeout_ms);
        self
    }

    fn retries(mut self, retries: u32) -> Self {
        self.options_mut().retries = Some(retries);
        self
    }

    fn priority(mut self, priority: StepPriority) -> Self {
        self.options_mut().priority = priority;
        self
    }

    fn when(mut self, condition: Condition) -> Self {
        self.options_mut().condition = Some(condition);
        self
    }

    fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options_mut().metadata.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct AgentStepConfig {
    pub name: String,
    pub agent_id: String,
    pub action: String,
    pub parameters: serde_json::Map<String, serde_json::Value>,
    pub options: StepOptions,
}

impl AgentStepConfig {
    pub fn new(
        name: impl Into<String>,
        agent_id: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            agent_id: agent_id.into(),
            action: action.into(),
            ..Default::default()
        }
    }

    pub fn parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParallelStepConfig {
    pub name: String,
    pub steps: Vec<Step>,
    pub concurrency: Option<usize>,
    pub fail_fast: bool,
    pub options: StepOptions,
}

impl ParallelStepConfig {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            steps,
            ..Default::default()
        }
    }

    pub fn concurrency(mut self, limit: usize) -> Self {
        self.concurrency = Some(limit);
        self
    }

    pub fn fail_fast(mut self, enabled: bool) -> Self {
        self.fail_fast = enabled;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct SequentialStepConfig {
    pub name: String,
    pub steps: Vec<Step>,
    pub options: StepOptions,
}

impl SequentialStepConfig {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            steps,
            options: StepOptions::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConditionalStepConfig {
    pub name: String,
    pub condition: Condition,
    pub then_step: Step,
    pub else_step: Option<Step>,
    pub options: StepOptions,
}

impl ConditionalStepConfig {
    pub fn new(name: impl Into<String>, condition: Condition, then_step: Step) -> Self {
        Self {
            name: name.into(),
            condition,
            then_step,
            else_step: None,
            options: StepOptions::default(),
        }
    }

    pub fn otherwise(mut self, step: Step) -> Self {
        self.else_step = Some(step);
        self
    }
}

#[derive(Debug, Clone)]
pub struct LoopStepConfig {
    pub name: String,
    pub condition: Condition,
    pub body: Step,
    pub max_iterations: usize,
    pub options: StepOptions,
}

impl LoopStepConfig {
    pub fn new(name: impl Into<String>, condition: Condition, body: Step) -> Self {
        Self {
            name: name.into(),
            condition,
            body,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            options: StepOptions::default(),
        }
    }

    pub fn max_iterations(mut self, limit: usize) -> Self {
        self.max_iterations = limit;
        self
    }
}

macro_rules! impl_step_config {
    ($($ty:ty),*) => {
        $(impl StepConfig for $ty {
            fn options_mut(&mut self) -> &mut StepOptions {
                &mut self.options
            }
        })*
    };
}

impl_step_config!(
    AgentStepConfig,
    ParallelStepConfig,
    SequentialStepConfig,
    ConditionalStepConfig,
    LoopStepConfig
);

/// Fluent constructor for [`WorkflowDefinition`]s.
///
/// Every step-adding call validates its input immediately and fails with
/// [`MplpError::WorkflowDefinition`]; [`build`](Self::build) then checks the
/// workflow as a whole (dependencies resolve, no cycles).
///
/// ```ignore
/// let workflow = WorkflowBuilder::new("Ingest")
///     .step("fetch", AgentStepConfig::new("Fetch", "fetcher", "fetch"))?
///     .step("store", AgentStepConfig::new("Store", "db", "insert").depends_on(["fetch"]))?
///     .build()?;
/// ```
#[derive(Debug, Clone)]
pub struct WorkflowBuilder {
    id: String,
    name: String,
    description: Option<String>,
    version: Option<String>,
    steps: Vec<Step>,
    ids: HashSet<String>,
    timeout_ms: Option<u64>,
    retries: Option<u32>,
    metadata: HashMap<String, serde_json::Value>,
}

impl WorkflowBuilder {
    /// Start a workflow with a generated id.
    pub fn new(name: impl Into<String>) -> Self {
        Self::create(name, None)
    }

    /// Start a workflow, optionally with a caller-chosen id.
    pub fn create(name: impl Into<String>, id: Option<String>) -> Self {
        Self {
            id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: name.into(),
            description: None,
            version: None,
            steps: Vec::new(),
            ids: HashSet::new(),
            timeout_ms: None,
            retries: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Whole-execution timeout. Must be greater than zero.
    pub fn timeout(mut self, timeout_ms: u64) -> Result<Self> {
        if timeout_ms == 0 {
            return Err(definition_error("Workflow timeout must be greater than 0"));
        }
        self.timeout_ms = Some(timeout_ms);
        Ok(self)
    }

    /// Workflow-wide retry default.
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Merge entries into the workflow metadata.
    pub fn metadata<I, K>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, serde_json::Value)>,
        K: Into<String>,
    {
        self.metadata
            .extend(entries.into_iter().map(|(k, v)| (k.into(), v)));
        self
    }

    /// Add an agent step.
    pub fn step(self, id: impl Into<String>, config: AgentStepConfig) -> Result<Self> {
        let step = Step {
            id: id.into(),
            name: config.name,
            kind: StepKind::Agent {
                agent_id: config.agent_id,
                action: config.action,
                parameters: config.parameters,
            },
            ..blank(config.options)
        };
        self.add_step(step)
    }

    /// Add a parallel step.
    pub fn parallel(self, id: impl Into<String>, config: ParallelStepConfig) -> Result<Self> {
        let step = Step {
            id: id.into(),
            name: config.name,
            kind: StepKind::Parallel {
                steps: config.steps,
                concurrency: config.concurrency,
                fail_fast: config.fail_fast,
            },
            ..blank(config.options)
        };
        self.add_step(step)
    }

    /// Add a sequential step.
    pub fn sequential(self, id: impl Into<String>, config: SequentialStepConfig) -> Result<Self> {
        let step = Step {
            id: id.into(),
            name: config.name,
            kind: StepKind::Sequential {
                steps: config.steps,
            },
            ..blank(config.options)
        };
        self.add_step(step)
    }

    /// Add a conditional step.
    pub fn condition(self, id: impl Into<String>, config: ConditionalStepConfig) -> Result<Self> {
        let step = Step {
            id: id.into(),
            name: config.name,
            kind: StepKind::Conditional {
                condition: config.condition,
                then_step: Box::new(config.then_step),
                else_step: config.else_step.map(Box::new),
            },
            ..blank(config.options)
        };
        self.add_step(step)
    }

    /// Add a loop step.
    pub fn r#loop(self, id: impl Into<String>, config: LoopStepConfig) -> Result<Self> {
        let step = Step {
            id: id.into(),
            name: config.name,
            kind: StepKind::Loop {
                condition: config.condition,
                body: Box::new(config.body),
                max_iterations: config.max_iterations,
            },
            ..blank(config.options)
        };
        self.add_step(step)
    }

    /// Add a fully constructed top-level step.
    pub fn add_step(mut self, step: Step) -> Result<Self> {
        validate_step(&step, true)?;

        for s in step.flatten() {
            if !self.ids.insert(s.id.clone()) {
                return Err(definition_error(format!(
                    "Step with ID '{}' already exists",
                    s.id
                )));
            }
        }
        self.steps.push(step);
        Ok(self)
    }

    /// Validate the whole workflow and produce the definition.
    pub fn build(self) -> Result<WorkflowDefinition> {
        if self.name.trim().is_empty() {
            return Err(definition_error("Workflow name is required"));
        }
        if self.steps.is_empty() {
            return Err(definition_error("Workflow must have at least one step"));
        }

        let top_level: HashSet<&str> = self.steps.iter().map(|s| s.id.as_str()).collect();
        for step in &self.steps {
            for dep in &step.dependencies {
                if !top_level.contains(dep.as_str()) {
                    return Err(definition_error(format!(
                        "Step '{}' depends on non-existent step '{}'",
                        step.id, dep
                    )));
                }
            }
        }

        if let Some(cycle) = find_cycle(&self.steps) {
            return Err(definition_error(format!(
                "Circular dependency detected: {}",
                cycle.join(" -> ")
            )));
        }

        Ok(WorkflowDefinition {
            id: self.id,
            name: self.name,
            description: self.description,
            version: self.version,
            steps: self.steps,
            timeout_ms: self.timeout_ms,
            retries: self.retries,
            metadata: self.metadata,
        })
    }
}

fn definition_error(msg: impl Into<String>) -> MplpError {
    MplpError::WorkflowDefinition(msg.into())
}

fn blank(options: StepOptions) -> Step {
    Step {
        id: String::new(),
        name: String::new(),
        dependencies: options.dependencies,
        timeout_ms: options.timeout_ms,
        retries: options.retries,
        priority: options.priority,
        metadata: options.metadata,
        condition: options.condition,
        kind: StepKind::Sequential { steps: vec![] },
    }
}

/// Structural checks for one step and its sub-steps.
fn validate_step(step: &Step, top_level: bool) -> Result<()> {
    if step.id.trim().is_empty() {
        return Err(definition_error("Step ID is required"));
    }
    if step.name.trim().is_empty() {
        return Err(definition_error(format!("Step '{}' requires a name", step.id)));
    }
    if step.timeout_ms == Some(0) {
        return Err(definition_error(format!(
            "Step '{}' timeout must be greater than 0",
            step.id
        )));
    }
    if !top_level && !step.dependencies.is_empty() {
        return Err(definition_error(format!(
            "Step '{}' is nested; dependencies are only allowed on top-level steps",
            step.id
        )));
    }

    match &step.kind {
        StepKind::Agent {
            agent_id, action, ..
        } => {
            if agent_id.trim().is_empty() {
                return Err(definition_error(format!(
                    "Agent step '{}' requires an agent id",
                    step.id
                )));
            }
            if action.trim().is_empty() {
                return Err(definition_error(format!(
                    "Agent step '{}' requires an action",
                    step.id
                )));
            }
        }
        StepKind::Parallel {
            steps, concurrency, ..
        } => {
            if steps.is_empty() {
                return Err(definition_error(format!(
                    "Parallel step '{}' requires at least one sub-step",
                    step.id
                )));
            }
            if *concurrency == Some(0) {
                return Err(definition_error(format!(
                    "Parallel step '{}' concurrency must be greater than 0",
                    step.id
                )));
            }
        }
        StepKind::Sequential { steps } => {
            if steps.is_empty() {
                return Err(definition_error(format!(
                    "Sequential step '{}' requires at least one sub-step",
                    step.id
                )));
            }
        }
        StepKind::Conditional { .. } => {}
        StepKind::Loop { max_iterations, .. } => {
            if *max_iterations == 0 {
                return Err(definition_error(format!(
                    "Loop step '{}' max iterations must be greater than 0",
                    step.id
                )));
            }
        }
    }

    for child in step.children() {
        validate_step(child, false)?;
    }
    Ok(())
}

/// Depth-first search with a recursion stack. Returns the first cycle found.
fn find_cycle(steps: &[Step]) -> Option<Vec<String>> {
    let deps: HashMap<&str, &[String]> = steps
        .iter()
        .map(|s| (s.id.as_str(), s.dependencies.as_slice()))
        .collect();
    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack: Vec<&str> = Vec::new();

    fn visit<'a>(
        id: &'a str,
        deps: &HashMap<&'a str, &'a [String]>,
        visited: &mut HashSet<&'a str>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        if let Some(pos) = stack.iter().position(|s| *s == id) {
            let mut cycle: Vec<String> = stack[pos..].iter().map(|s| s.to_string()).collect();
            cycle.push(id.to_string());
            return Some(cycle);
        }
        if !visited.insert(id) {
            return None;
        }
        stack.push(id);
        for dep in deps.get(id).copied().unwrap_or_default() {
            if let Some(cycle) = visit(dep.as_str(), deps, visited, stack) {
                return Some(cycle);
            }
        }
        stack.pop();
        None
    }

    for step in steps {
        if let Some(cycle) = visit(step.id.as_str(), &deps, &mut visited, &mut stack) {
            return Some(cycle);
        }
    }
    None
}
