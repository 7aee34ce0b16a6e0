use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use mplp_core::types::{ExecutionId, StepResult, StepStatus};

/// Live state of one execution, shared by every step and predicate.
///
/// Variables start as the caller's parameters and may be changed by
/// predicates or agents holding the context. Step results are updated in
/// place as steps progress; the order in which they reach a terminal status
/// is kept for the final [`WorkflowResult`](mplp_core::types::WorkflowResult).
///
/// Locks are never held across an await point.
#[derive(Debug)]
pub struct WorkflowContext {
    workflow_id: String,
    execution_id: ExecutionId,
    start_time: DateTime<Utc>,
    metadata: HashMap<String, serde_json::Value>,
    variables: Mutex<HashMap<String, serde_json::Value>>,
    results: Mutex<StepResults>,
}

#[derive(Debug, Default)]
struct StepResults {
    by_id: HashMap<String, StepResult>,
    /// Step ids in the order they reached a terminal status.
    finished: Vec<String>,
    /// Steps that will not run: descendants of skipped steps, untaken
    /// branches, bodies of loops that never iterated.
    bypassed: HashSet<String>,
}

impl WorkflowContext {
    pub fn new(
        workflow_id: impl Into<String>,
        execution_id: ExecutionId,
        variables: HashMap<String, serde_json::Value>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            execution_id,
            start_time: Utc::now(),
            metadata,
            variables: Mutex::new(variables),
            results: Mutex::new(StepResults::default()),
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn metadata(&self) -> &HashMap<String, serde_json::Value> {
        &self.metadata
    }

    pub fn variable(&self, key: &str) -> Option<serde_json::Value> {
        lock(&self.variables).get(key).cloned()
    }

    /// Snapshot of all variables.
    pub fn variables(&self) -> HashMap<String, serde_json::Value> {
        lock(&self.variables).clone()
    }

    pub fn set_variable(&self, key: impl Into<String>, value: serde_json::Value) {
        lock(&self.variables).insert(key.into(), value);
    }

    pub fn step_result(&self, step_id: &str) -> Option<StepResult> {
        lock(&self.results).by_id.get(step_id).cloned()
    }

    /// Store the current state of a step, replacing any earlier entry.
    pub fn record_step(&self, result: StepResult) {
        let mut results = lock(&self.results);
        results.finished.retain(|id| *id != result.step_id);
        results.bypassed.remove(&result.step_id);
        if result.status.is_terminal() {
            results.finished.push(result.step_id.clone());
        }
        results.by_id.insert(result.step_id.clone(), result);
    }

    /// Count steps as done without a result. Ids that already reached a
    /// terminal status are ignored; recording a result later clears the mark.
    pub fn mark_bypassed(&self, step_ids: impl IntoIterator<Item = String>) {
        let mut results = lock(&self.results);
        for id in step_ids {
            if !results.finished.contains(&id) {
                results.bypassed.insert(id);
            }
        }
    }

    /// Number of steps in a terminal status plus those marked bypassed.
    pub fn finished_count(&self) -> usize {
        let results = lock(&self.results);
        results.finished.len() + results.bypassed.len()
    }

    /// All step results: terminal ones in completion order, then the rest
    /// by start time.
    pub fn results(&self) -> Vec<StepResult> {
        let results = lock(&self.results);
        let mut out: Vec<StepResult> = results
            .finished
            .iter()
            .filter_map(|id| results.by_id.get(id).cloned())
            .collect();

        let mut pending: Vec<StepResult> = results
            .by_id
            .values()
            .filter(|r| !r.status.is_terminal())
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.start_time);
        out.extend(pending);
        out
    }

    /// Mark running steps as cancelled. With `scope`, only those step ids
    /// are touched. Returns the ids that changed.
    pub fn cancel_running(&self, scope: Option<&HashSet<String>>) -> Vec<String> {
        let mut results = lock(&self.results);
        let mut cancelled = Vec::new();
        for (id, result) in results.by_id.iter_mut() {
            if result.status != StepStatus::Running {
                continue;
            }
            if scope.is_some_and(|s| !s.contains(id)) {
                continue;
            }
            result.finish(StepStatus::Cancelled);
            cancelled.push(id.clone());
        }
        cancelled.sort();
        results.finished.extend(cancelled.iter().cloned());
        cancelled
    }

    /// Data visible to expression conditions: the variables plus a
    /// `<step_id>_status` entry for every step with a result.
    pub fn condition_data(&self) -> HashMap<String, serde_json::Value> {
        let mut data = self.variables();
        for (id, result) in &lock(&self.results).by_id {
            let status = serde_json::to_value(result.status).unwrap_or(serde_json::Value::Null);
            data.insert(format!("{id}_status"), status);
        }
        data
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
