pub mod agent;
pub mod context;
pub mod engine;
pub mod manifest;
pub mod plan;
pub mod retry;
pub mod run_log;
pub mod store;
pub mod workflow;

pub use agent::{FnAgent, MessageAgentAdapter};
pub use context::WorkflowContext;
pub use engine::{ExecutionEngine, ExecutionOptions};
pub use manifest::WorkflowFile;
pub use plan::ExecutionPlan;
pub use retry::RetryPolicy;
pub use run_log::RunLogger;
pub use store::ExecutionStore;
pub use workflow::{
    AgentStepConfig, Condition, ConditionalStepConfig, LoopStepConfig, ParallelStepConfig,
    SequentialStepConfig, Step, StepConfig, StepKind, StepOptions, WorkflowBuilder,
    WorkflowDefinition,
};
