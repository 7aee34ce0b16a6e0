use std::collections::{HashMap, VecDeque};

use tokio::sync::RwLock;
use tracing::debug;

use mplp_core::types::{ExecutionId, WorkflowResult};

/// Execution results, keyed by execution id.
///
/// Holds at most `capacity` entries. When full, the oldest finished execution
/// is evicted; running executions are never evicted.
pub struct ExecutionStore {
    inner: RwLock<Inner>,
    capacity: usize,
}

#[derive(Default)]
struct Inner {
    results: HashMap<ExecutionId, WorkflowResult>,
    /// Insertion order.
    order: VecDeque<ExecutionId>,
}

impl ExecutionStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            capacity,
        }
    }

    /// Insert or replace a result.
    pub async fn put(&self, result: WorkflowResult) {
        let mut inner = self.inner.write().await;
        let id = result.execution_id.clone();
        if inner.results.insert(id.clone(), result).is_none() {
            inner.order.push_back(id);
        }

        while inner.results.len() > self.capacity {
            let Some(pos) = inner.order.iter().position(|id| {
                inner
                    .results
                    .get(id)
                    .is_some_and(|r| r.status.is_terminal())
            }) else {
                break;
            };
            if let Some(evicted) = inner.order.remove(pos) {
                inner.results.remove(&evicted);
                debug!(execution_id = %evicted, "Evicted finished execution");
            }
        }
    }

    pub async fn get(&self, id: &ExecutionId) -> Option<WorkflowResult> {
        self.inner.read().await.results.get(id).cloned()
    }

    /// All retained results, oldest first.
    pub async fn list(&self) -> Vec<WorkflowResult> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.results.get(id).cloned())
            .collect()
    }

    pub async fn remove(&self, id: &ExecutionId) -> Option<WorkflowResult> {
        let mut inner = self.inner.write().await;
        let removed = inner.results.remove(id);
        if removed.is_some() {
            inner.order.retain(|i| i != id);
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.results.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
