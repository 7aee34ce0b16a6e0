use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, FuturesUnordered, StreamExt};
use serde_json::json;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use mplp_core::config::EngineConfig;
use mplp_core::error::{MplpError, Result};
use mplp_core::event::EventBus;
use mplp_core::traits::{Agent, MessageAgent};
use mplp_core::types::{
    ExecutionId, ProgressUpdate, StepResult, StepStatus, WorkflowEvent, WorkflowResult,
    WorkflowStatus,
};

use crate::agent::MessageAgentAdapter;
use crate::context::WorkflowContext;
use crate::plan::ExecutionPlan;
use crate::retry::RetryPolicy;
use crate::store::ExecutionStore;
use crate::workflow::{Condition, Step, StepKind, WorkflowDefinition};

/// Per-call overrides for [`ExecutionEngine::execute_workflow`].
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Retry default for steps that do not set their own.
    pub retries: Option<u32>,
    /// Concurrency default for parallel steps that do not set their own.
    pub concurrency: Option<usize>,
    /// Whole-execution timeout, overriding the definition's.
    pub timeout_ms: Option<u64>,
    /// Merged over the definition metadata.
    pub metadata: HashMap<String, serde_json::Value>,
    /// External cancellation. Cancelling it has the same effect as
    /// [`ExecutionEngine::cancel_execution`].
    pub cancel: Option<CancellationToken>,
}

struct LiveExecution {
    context: Arc<WorkflowContext>,
    cancel: CancellationToken,
}

type AgentTable = RwLock<HashMap<String, Arc<dyn Agent>>>;
type StepFuture = BoxFuture<'static, Result<serde_json::Value>>;

/// State threaded through one execution. Everything is owned so step
/// futures are `'static` and can be boxed and scheduled independently.
struct Run {
    definition: Arc<WorkflowDefinition>,
    options: ExecutionOptions,
    ctx: Arc<WorkflowContext>,
    total_steps: usize,
    agents: Arc<AgentTable>,
    event_bus: Arc<EventBus>,
    config: EngineConfig,
    retry: RetryPolicy,
}

/// Runs workflow definitions against registered agents.
///
/// Top-level steps are scheduled from a dependency plan computed once per
/// execution: every step whose dependencies have finished starts immediately,
/// so independent steps run concurrently. The first failing top-level step
/// fails the execution and drops the steps still in flight.
///
/// Lifecycle events go to the shared [`EventBus`].
pub struct ExecutionEngine {
    agents: Arc<AgentTable>,
    live: RwLock<HashMap<ExecutionId, LiveExecution>>,
    store: ExecutionStore,
    event_bus: Arc<EventBus>,
    config: EngineConfig,
    retry: RetryPolicy,
}

impl ExecutionEngine {
    pub fn new(config: EngineConfig, event_bus: Arc<EventBus>) -> Self {
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
            live: RwLock::new(HashMap::new()),
            store: ExecutionStore::new(config.max_retained_executions),
            retry: RetryPolicy::from_config(&config),
            event_bus,
            config,
        }
    }

    /// An engine with its own event bus sized from `config`.
    pub fn with_config(config: EngineConfig) -> Self {
        let bus = Arc::new(EventBus::with_history_limit(256, config.event_history_limit));
        Self::new(config, bus)
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register an agent under its id. An existing agent with the same id
    /// is replaced.
    pub async fn register_agent(&self, agent: Arc<dyn Agent>) {
        let id = agent.id().to_string();
        if self.agents.write().await.insert(id.clone(), agent).is_some() {
            debug!(agent_id = %id, "Replaced registered agent");
        } else {
            debug!(agent_id = %id, "Registered agent");
        }
    }

    /// Register a message-style agent; it is wrapped so dispatch stays uniform.
    pub async fn register_message_agent(&self, agent: Arc<dyn MessageAgent>) {
        self.register_agent(Arc::new(MessageAgentAdapter::new(agent)))
            .await;
    }

    /// Returns true if the agent was registered.
    pub async fn unregister_agent(&self, agent_id: &str) -> bool {
        self.agents.write().await.remove(agent_id).is_some()
    }

    pub async fn get_agent(&self, agent_id: &str) -> Option<Arc<dyn Agent>> {
        self.agents.read().await.get(agent_id).cloned()
    }

    /// Registered agent ids, sorted.
    pub async fn agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Execute a workflow to completion.
    ///
    /// Returns the final result on success. On failure, timeout or
    /// cancellation the error is returned and the result (status `Failed` or
    /// `Cancelled`) stays available through [`get_execution`](Self::get_execution).
    pub async fn execute_workflow(
        &self,
        definition: &WorkflowDefinition,
        parameters: HashMap<String, serde_json::Value>,
        options: ExecutionOptions,
    ) -> Result<WorkflowResult> {
        let execution_id = ExecutionId::new();
        let mut metadata = definition.metadata.clone();
        metadata.extend(options.metadata.clone());

        let ctx = Arc::new(WorkflowContext::new(
            definition.id.clone(),
            execution_id.clone(),
            parameters,
            metadata.clone(),
        ));
        let cancel = options.cancel.clone().unwrap_or_default();

        let mut result = WorkflowResult::running(definition.id.clone(), execution_id.clone());
        result.metadata = metadata;

        self.live.write().await.insert(
            execution_id.clone(),
            LiveExecution {
                context: ctx.clone(),
                cancel: cancel.clone(),
            },
        );
        self.store.put(result.clone()).await;

        info!(
            workflow_id = %definition.id,
            workflow_name = %definition.name,
            execution_id = %execution_id,
            "Workflow execution started"
        );
        self.event_bus.emit(WorkflowEvent::WorkflowStarted {
            execution_id: execution_id.clone(),
            workflow_id: definition.id.clone(),
        });

        let run = Arc::new(Run {
            definition: Arc::new(definition.clone()),
            options: options.clone(),
            ctx: ctx.clone(),
            total_steps: definition.total_steps(),
            agents: self.agents.clone(),
            event_bus: self.event_bus.clone(),
            config: self.config.clone(),
            retry: self.retry,
        });
        let timeout_ms = options.timeout_ms.or(definition.timeout_ms);

        let steps = run.clone().run_steps();
        let work = async {
            match timeout_ms {
                Some(ms) => tokio::time::timeout(Duration::from_millis(ms), steps)
                    .await
                    .unwrap_or_else(|_| {
                        Err(MplpError::WorkflowTimeout {
                            workflow_id: definition.id.clone(),
                            timeout_ms: ms,
                        })
                    }),
                None => steps.await,
            }
        };

        let outcome = tokio::select! {
            outcome = work => outcome,
            _ = cancel.cancelled() => Err(MplpError::Cancelled(execution_id.to_string())),
        };

        self.live.write().await.remove(&execution_id);

        match outcome {
            Ok(()) => {
                run.finish_progress();
                result.steps = ctx.results();
                result.finish(WorkflowStatus::Completed);
                self.store.put(result.clone()).await;
                info!(
                    workflow_id = %definition.id,
                    execution_id = %execution_id,
                    duration_ms = result.duration_ms.unwrap_or_default(),
                    steps = result.steps.len(),
                    "Workflow execution completed"
                );
                self.event_bus.emit(WorkflowEvent::WorkflowCompleted {
                    result: result.clone(),
                });
                Ok(result)
            }
            Err(e) => {
                let cancelled = ctx.cancel_running(None);
                if !cancelled.is_empty() {
                    debug!(execution_id = %execution_id, steps = ?cancelled, "Cancelled in-flight steps");
                }
                result.steps = ctx.results();
                result.error = Some(e.to_string());

                if matches!(e, MplpError::Cancelled(_)) {
                    result.finish(WorkflowStatus::Cancelled);
                    self.store.put(result.clone()).await;
                    warn!(workflow_id = %definition.id, execution_id = %execution_id, "Workflow execution cancelled");
                    self.event_bus
                        .emit(WorkflowEvent::WorkflowCancelled { result });
                } else {
                    result.finish(WorkflowStatus::Failed);
                    self.store.put(result.clone()).await;
                    error!(
                        workflow_id = %definition.id,
                        execution_id = %execution_id,
                        error = %e,
                        "Workflow execution failed"
                    );
                    self.event_bus.emit(WorkflowEvent::WorkflowFailed {
                        result,
                        error: e.to_string(),
                    });
                }
                Err(e)
            }
        }
    }

    /// Current or final result of an execution. Running executions include
    /// the step results recorded so far.
    pub async fn get_execution(&self, execution_id: &ExecutionId) -> Option<WorkflowResult> {
        let mut result = self.store.get(execution_id).await?;
        if let Some(live) = self.live.read().await.get(execution_id) {
            result.steps = live.context.results();
        }
        Some(result)
    }

    /// Retained executions, oldest first.
    pub async fn list_executions(&self) -> Vec<WorkflowResult> {
        self.store.list().await
    }

    /// Ids of executions that are still running.
    pub async fn active_executions(&self) -> Vec<ExecutionId> {
        self.live.read().await.keys().cloned().collect()
    }

    /// Live context of a running execution.
    pub async fn context(&self, execution_id: &ExecutionId) -> Option<Arc<WorkflowContext>> {
        self.live
            .read()
            .await
            .get(execution_id)
            .map(|l| l.context.clone())
    }

    /// Request cancellation. Returns false if the execution is not running.
    pub async fn cancel_execution(&self, execution_id: &ExecutionId) -> bool {
        match self.live.read().await.get(execution_id) {
            Some(live) => {
                info!(execution_id = %execution_id, "Cancellation requested");
                live.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop a finished execution from the history. Running executions are kept.
    pub async fn clear_execution(&self, execution_id: &ExecutionId) -> bool {
        if self.live.read().await.contains_key(execution_id) {
            return false;
        }
        self.store.remove(execution_id).await.is_some()
    }
}

impl Run {
    /// Schedule the top-level steps by dependency.
    async fn run_steps(self: Arc<Self>) -> Result<()> {
        let steps = &self.definition.steps;
        let plan = ExecutionPlan::new(steps)?;
        let mut remaining = plan.in_degrees();
        let mut ready = plan.roots();
        let mut in_flight = FuturesUnordered::new();

        loop {
            // Higher priority starts first; ties keep declaration order.
            ready.sort_by_key(|&i| Reverse(steps[i].priority));
            for i in ready.drain(..) {
                let step = self.clone().execute_step(steps[i].clone());
                in_flight.push(step.map(move |outcome| (i, outcome)).boxed());
            }

            let Some((i, outcome)) = in_flight.next().await else {
                break;
            };
            outcome?;

            for &d in plan.dependents(i) {
                remaining[d] -= 1;
                if remaining[d] == 0 {
                    ready.push(d);
                }
            }
        }
        Ok(())
    }

    /// Process one step: condition, attempts with retry, result bookkeeping.
    fn execute_step(self: Arc<Self>, step: Step) -> StepFuture {
        Box::pin(async move {
            let ctx = self.ctx.clone();
            let mut record = StepResult::running(&step.id);
            record.metadata = step.metadata.clone();
            ctx.record_step(record.clone());

            debug!(step_id = %step.id, step_type = step.kind.type_name(), "Step started");
            self.event_bus.emit(WorkflowEvent::StepStarted {
                execution_id: ctx.execution_id().clone(),
                step_id: step.id.clone(),
            });
            self.emit_progress(&step.id);

            if let Some(condition) = &step.condition {
                let proceed = match self.evaluate(&step, condition).await {
                    Ok(proceed) => proceed,
                    Err(e) => return Err(self.fail_step(record, e)),
                };
                if !proceed {
                    record.finish(StepStatus::Skipped);
                    ctx.record_step(record.clone());
                    ctx.mark_bypassed(step.flatten().into_iter().skip(1).map(|s| s.id.clone()));
                    info!(step_id = %step.id, condition = %condition.description(), "Step skipped");
                    self.event_bus.emit(WorkflowEvent::StepSkipped {
                        execution_id: ctx.execution_id().clone(),
                        result: record,
                    });
                    self.emit_progress(&step.id);
                    return Ok(serde_json::Value::Null);
                }
            }

            if let StepKind::Agent { agent_id, .. } = &step.kind {
                if !self.agents.read().await.contains_key(agent_id) {
                    record.attempts = 1;
                    let e = MplpError::step(&step.id, format!("agent '{agent_id}' is not registered"));
                    return Err(self.fail_step(record, e));
                }
            }

            let max_retries = self.max_retries(&step);
            let mut attempt = 0u32;
            let outcome = loop {
                record.attempts = attempt + 1;
                ctx.record_step(record.clone());

                match self.attempt_step(&step).await {
                    Ok(value) => break Ok(value),
                    Err(e) if attempt < max_retries && e.is_retryable() => {
                        let backoff = self.retry.backoff(attempt);
                        warn!(
                            step_id = %step.id,
                            attempt = attempt + 1,
                            max_retries,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Retrying step"
                        );
                        self.event_bus.emit(WorkflowEvent::StepRetrying {
                            execution_id: ctx.execution_id().clone(),
                            step_id: step.id.clone(),
                            attempt: attempt + 1,
                            max_retries,
                            backoff_ms: backoff.as_millis() as u64,
                            error: e.to_string(),
                        });
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                    }
                    Err(e) => break Err(e),
                }
            };

            match outcome {
                Ok(value) => {
                    record.finish(StepStatus::Completed);
                    record.result = Some(value.clone());
                    ctx.record_step(record.clone());
                    info!(
                        step_id = %step.id,
                        attempts = record.attempts,
                        duration_ms = record.duration_ms.unwrap_or_default(),
                        "Step completed"
                    );
                    self.event_bus.emit(WorkflowEvent::StepCompleted {
                        execution_id: ctx.execution_id().clone(),
                        result: record,
                    });
                    self.emit_progress(&step.id);
                    Ok(value)
                }
                Err(e) => Err(self.fail_step(record, e)),
            }
        })
    }

    /// Agent steps inherit the retry default from the options, the
    /// definition and the engine config. Composite steps only retry when
    /// they set `retries` themselves, so nested retries do not multiply.
    fn max_retries(&self, step: &Step) -> u32 {
        match step.kind {
            StepKind::Agent { .. } => step
                .retries
                .or(self.options.retries)
                .or(self.definition.retries)
                .unwrap_or(self.config.default_retries),
            _ => step.retries.unwrap_or(0),
        }
    }

    /// One attempt, bounded by the step timeout.
    async fn attempt_step(self: &Arc<Self>, step: &Step) -> Result<serde_json::Value> {
        let Some(ms) = step.timeout_ms else {
            return self.dispatch(step).await;
        };

        match tokio::time::timeout(Duration::from_millis(ms), self.dispatch(step)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let nested: HashSet<String> =
                    step.flatten().into_iter().skip(1).map(|s| s.id.clone()).collect();
                self.ctx.cancel_running(Some(&nested));
                Err(MplpError::StepTimeout {
                    step_id: step.id.clone(),
                    timeout_ms: ms,
                })
            }
        }
    }

    /// Run the type-specific part of a step.
    async fn dispatch(self: &Arc<Self>, step: &Step) -> Result<serde_json::Value> {
        match &step.kind {
            StepKind::Agent {
                agent_id,
                action,
                parameters,
            } => {
                let agent = self.agents.read().await.get(agent_id).cloned();
                let agent = agent.ok_or_else(|| {
                    MplpError::step(&step.id, format!("agent '{agent_id}' is not registered"))
                })?;
                let params = merge_parameters(parameters, &self.ctx.variables());
                agent.invoke(action, params).await.map_err(|e| {
                    MplpError::step(
                        &step.id,
                        format!("agent '{agent_id}' failed on action '{action}': {e}"),
                    )
                })
            }

            StepKind::Parallel {
                steps,
                concurrency,
                fail_fast,
            } => {
                let limit = (*concurrency)
                    .or(self.options.concurrency)
                    .or(self.config.default_concurrency)
                    .unwrap_or(steps.len())
                    .clamp(1, steps.len().max(1));
                debug!(step_id = %step.id, sub_steps = steps.len(), limit, fail_fast, "Running parallel step");

                if *fail_fast {
                    self.run_parallel_fail_fast(step, steps, limit).await
                } else {
                    Ok(self.run_parallel_collect(steps, limit).await)
                }
            }

            StepKind::Sequential { steps } => {
                let mut outputs = Vec::with_capacity(steps.len());
                for sub in steps {
                    outputs.push(self.clone().execute_step(sub.clone()).await?);
                }
                Ok(serde_json::Value::Array(outputs))
            }

            StepKind::Conditional {
                condition,
                then_step,
                else_step,
            } => {
                let (taken, untaken) = if self.evaluate(step, condition).await? {
                    (Some(then_step.as_ref()), else_step.as_deref())
                } else {
                    (else_step.as_deref(), Some(then_step.as_ref()))
                };
                if let Some(untaken) = untaken {
                    self.ctx
                        .mark_bypassed(untaken.flatten().into_iter().map(|s| s.id.clone()));
                }
                match taken {
                    Some(sub) => self.clone().execute_step(sub.clone()).await,
                    None => Ok(serde_json::Value::Null),
                }
            }

            StepKind::Loop {
                condition,
                body,
                max_iterations,
            } => {
                let mut outputs = Vec::new();
                while self.evaluate(step, condition).await? {
                    if outputs.len() >= *max_iterations {
                        warn!(step_id = %step.id, max_iterations, "Loop reached its iteration limit");
                        break;
                    }
                    outputs.push(self.clone().execute_step(body.as_ref().clone()).await?);
                }
                if outputs.is_empty() {
                    self.ctx
                        .mark_bypassed(body.flatten().into_iter().map(|s| s.id.clone()));
                }
                debug!(step_id = %step.id, iterations = outputs.len(), "Loop finished");
                Ok(serde_json::Value::Array(outputs))
            }
        }
    }

    /// Stop at the first failing sub-step; sub-steps still in flight are
    /// dropped and marked cancelled. Outputs are in declaration order.
    async fn run_parallel_fail_fast(
        self: &Arc<Self>,
        step: &Step,
        steps: &[Step],
        limit: usize,
    ) -> Result<serde_json::Value> {
        let futures: Vec<_> = steps
            .iter()
            .enumerate()
            .map(|(i, sub)| {
                self.clone()
                    .execute_step(sub.clone())
                    .map(move |outcome| (i, outcome))
                    .boxed()
            })
            .collect();
        let mut outputs = vec![serde_json::Value::Null; steps.len()];
        let mut pending = stream::iter(futures).buffer_unordered(limit);

        while let Some((i, outcome)) = pending.next().await {
            match outcome {
                Ok(value) => outputs[i] = value,
                Err(e) => {
                    drop(pending);
                    let scope: HashSet<String> = steps
                        .iter()
                        .flat_map(|s| s.flatten())
                        .map(|s| s.id.clone())
                        .collect();
                    let cancelled = self.ctx.cancel_running(Some(&scope));
                    if !cancelled.is_empty() {
                        warn!(step_id = %step.id, cancelled = ?cancelled, "Parallel step aborted in-flight sub-steps");
                    }
                    return Err(e);
                }
            }
        }
        Ok(serde_json::Value::Array(outputs))
    }

    /// Run every sub-step and report each outcome as an envelope, in
    /// declaration order.
    async fn run_parallel_collect(self: &Arc<Self>, steps: &[Step], limit: usize) -> serde_json::Value {
        let futures: Vec<_> = steps
            .iter()
            .map(|sub| {
                let step_id = sub.id.clone();
                self.clone()
                    .execute_step(sub.clone())
                    .map(move |outcome| match outcome {
                        Ok(result) => json!({ "success": true, "stepId": step_id, "result": result }),
                        Err(e) => json!({ "success": false, "stepId": step_id, "error": e.to_string() }),
                    })
                    .boxed()
            })
            .collect();
        let envelopes: Vec<serde_json::Value> = stream::iter(futures).buffered(limit).collect().await;
        serde_json::Value::Array(envelopes)
    }

    async fn evaluate(&self, step: &Step, condition: &Condition) -> Result<bool> {
        condition.evaluate(self.ctx.clone()).await.map_err(|e| {
            MplpError::step(
                &step.id,
                format!("condition '{}' failed: {e}", condition.description()),
            )
        })
    }

    fn fail_step(&self, mut record: StepResult, e: MplpError) -> MplpError {
        record.finish(StepStatus::Failed);
        record.error = Some(e.to_string());
        self.ctx.record_step(record.clone());
        let step_id = record.step_id.clone();
        error!(step_id = %record.step_id, attempts = record.attempts, error = %e, "Step failed");
        self.event_bus.emit(WorkflowEvent::StepFailed {
            execution_id: self.ctx.execution_id().clone(),
            error: e.to_string(),
            result: record,
        });
        self.emit_progress(&step_id);
        e
    }

    /// Steps that never ran on a completed execution count as done, so the
    /// last progress update always reports 1.0.
    fn finish_progress(&self) {
        if self.ctx.finished_count() >= self.total_steps {
            return;
        }
        let all = self.definition.steps.iter().flat_map(|s| s.flatten());
        self.ctx.mark_bypassed(all.map(|s| s.id.clone()));
        let last = self.definition.steps.last().map(|s| s.id.as_str()).unwrap_or_default();
        self.emit_progress(last);
    }

    fn emit_progress(&self, step_id: &str) {
        let total = self.total_steps.max(1);
        let finished = self.ctx.finished_count().min(total);
        self.event_bus.emit(WorkflowEvent::Progress(ProgressUpdate {
            workflow_id: self.definition.id.clone(),
            execution_id: self.ctx.execution_id().clone(),
            step_id: step_id.to_string(),
            finished,
            total,
            progress: finished as f64 / total as f64,
        }));
    }
}

impl Default for ExecutionEngine {
    fn default() -> Self {
        Self::with_config(EngineConfig::default())
    }
}

/// Agent parameters: the step's own parameters plus every execution variable
/// under a `context_` prefix.
fn merge_parameters(
    parameters: &serde_json::Map<String, serde_json::Value>,
    variables: &HashMap<String, serde_json::Value>,
) -> serde_json::Value {
    let mut merged = parameters.clone();
    for (key, value) in variables {
        merged.insert(format!("context_{key}"), value.clone());
    }
    serde_json::Value::Object(merged)
}
