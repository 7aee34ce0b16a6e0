//! Workflow model: steps, conditions, definitions and the fluent builder.
//!
//! A workflow is a list of top-level [`Step`]s that may depend on each other
//! by id. Composite steps (parallel, sequential, conditional, loop) own their
//! sub-steps. [`WorkflowBuilder`] validates everything up front so the
//! engine only ever sees well-formed [`WorkflowDefinition`]s.

pub mod builder;
pub mod condition;
pub mod definition;
pub mod step;

pub use builder::{
    AgentStepConfig, ConditionalStepConfig, LoopStepConfig, ParallelStepConfig,
    SequentialStepConfig, StepConfig, StepOptions, WorkflowBuilder,
};
pub use condition::{evaluate_condition, Condition};
pub use definition::WorkflowDefinition;
pub use step::{Step, StepKind, DEFAULT_MAX_ITERATIONS};
