use std::collections::{BTreeSet, HashMap};

use super::step::{Step, StepKind};

/// A validated, immutable workflow.
///
/// Produced by [`WorkflowBuilder::build`](super::WorkflowBuilder::build),
/// which guarantees a non-empty name, at least one step, unique step ids,
/// resolvable dependencies and an acyclic dependency graph.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub version: Option<String>,
    /// Top-level steps in declaration order.
    pub steps: Vec<Step>,
    /// Whole-execution timeout in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Workflow-wide retry default for steps that do not set their own.
    pub retries: Option<u32>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl WorkflowDefinition {
    /// Number of steps including every nested sub-step.
    pub fn total_steps(&self) -> usize {
        self.steps.iter().map(|s| s.flatten().len()).sum()
    }

    /// Find a step anywhere in the tree by id.
    pub fn find_step(&self, id: &str) -> Option<&Step> {
        self.steps
            .iter()
            .flat_map(|s| s.flatten())
            .find(|s| s.id == id)
    }

    /// Every agent id referenced by an agent step, sorted.
    pub fn agent_ids(&self) -> BTreeSet<String> {
        self.steps
            .iter()
            .flat_map(|s| s.flatten())
            .filter_map(|s| match &s.kind {
                StepKind::Agent { agent_id, .. } => Some(agent_id.clone()),
                _ => None,
            })
            .collect()
    }
}
