use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use mplp_core::config::EngineConfig;
use mplp_core::error::{MplpError, Result};
use mplp_core::event::{EventBus, ListenerId};
use mplp_core::traits::{Agent, MessageAgent};
use mplp_core::types::{
    EventKind, ExecutionId, ProgressUpdate, StepStatus, WorkflowEvent, WorkflowResult,
    WorkflowStatus,
};
use mplp_engine::agent::MessageAgentAdapter;
use mplp_engine::engine::{ExecutionEngine, ExecutionOptions};
use mplp_engine::workflow::{StepKind, WorkflowBuilder, WorkflowDefinition};

use crate::metrics::{
    recent_window, AuditEvent, AuditLog, HealthStatus, MetricSample, MetricsStore,
    PerformanceStats, SystemHealth, WorkflowAnalytics,
};
use crate::template::{self, TemplateSummary};

/// A registered agent as seen by the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub id: String,
    /// Grouping used by [`MultiAgentOrchestrator::optimal_agent`].
    pub kind: Option<String>,
    /// Load-balancing weight, 1.0 unless changed with
    /// [`MultiAgentOrchestrator::set_agent_weight`].
    pub weight: f64,
    pub registered_at: DateTime<Utc>,
}

/// Named access rules, checked with
/// [`MultiAgentOrchestrator::validate_security_policy`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityPolicy {
    /// `None` allows every agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_agents: Option<Vec<String>>,
}

impl SecurityPolicy {
    pub fn allow_agents<I, S>(agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_agents: Some(agents.into_iter().map(Into::into).collect()),
        }
    }

    /// Whether `agent_id` passes. A check without an agent always passes.
    pub fn allows(&self, agent_id: Option<&str>) -> bool {
        match (&self.allowed_agents, agent_id) {
            (Some(allowed), Some(id)) => allowed.iter().any(|a| a == id),
            _ => true,
        }
    }
}

/// A failure delivered to [`MultiAgentOrchestrator::on_error`] handlers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub execution_id: ExecutionId,
    /// The failing step, or `None` when the report is for the execution.
    pub step_id: Option<String>,
    pub error: String,
}

struct RegisteredAgent {
    agent: Arc<dyn Agent>,
    info: AgentInfo,
    seq: u64,
}

type WorkflowTable = RwLock<HashMap<String, Arc<WorkflowDefinition>>>;

/// Agent and workflow registries on top of an [`ExecutionEngine`].
///
/// Unlike the engine, registration here is strict: duplicate ids are
/// rejected and unknown ids are errors. Workflows are executed by id after
/// every agent they reference has been checked.
///
/// The orchestrator shares the engine's [`EventBus`]; engine events and the
/// registry events (`agentRegistered`, `workflowRegistered`, ...) arrive on
/// the same bus. Finished executions feed per-agent and per-workflow metrics.
pub struct MultiAgentOrchestrator {
    engine: Arc<ExecutionEngine>,
    agents: tokio::sync::RwLock<HashMap<String, RegisteredAgent>>,
    workflows: Arc<WorkflowTable>,
    templates: RwLock<HashMap<String, WorkflowDefinition>>,
    security_policies: RwLock<HashMap<String, SecurityPolicy>>,
    round_robin: Mutex<HashMap<String, usize>>,
    next_seq: Mutex<u64>,
    audit: AuditLog,
    metrics: Arc<MetricsStore>,
    listeners: Vec<(EventKind, ListenerId)>,
}

impl MultiAgentOrchestrator {
    pub fn new(engine: Arc<ExecutionEngine>) -> Self {
        let workflows: Arc<WorkflowTable> = Arc::new(RwLock::new(HashMap::new()));
        let metrics = Arc::new(MetricsStore::default());

        let bus = engine.event_bus();
        let listeners = [
            EventKind::WorkflowCompleted,
            EventKind::WorkflowFailed,
            EventKind::WorkflowCancelled,
        ]
        .into_iter()
        .map(|kind| {
            let workflows = workflows.clone();
            let metrics = metrics.clone();
            let id = bus.on(kind, move |event| {
                if let Some(result) = final_result(event) {
                    record_execution_metrics(&workflows, &metrics, result);
                }
            });
            (kind, id)
        })
        .collect();

        Self {
            engine,
            agents: tokio::sync::RwLock::new(HashMap::new()),
            workflows,
            templates: RwLock::new(HashMap::new()),
            security_policies: RwLock::new(HashMap::new()),
            round_robin: Mutex::new(HashMap::new()),
            next_seq: Mutex::new(0),
            audit: AuditLog::default(),
            metrics,
            listeners,
        }
    }

    /// An orchestrator over a fresh engine.
    pub fn with_config(config: EngineConfig) -> Self {
        Self::new(Arc::new(ExecutionEngine::with_config(config)))
    }

    /// Start a workflow definition; shorthand for [`WorkflowBuilder::create`].
    pub fn create_workflow(name: impl Into<String>, id: Option<String>) -> WorkflowBuilder {
        WorkflowBuilder::create(name, id)
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        self.engine.event_bus()
    }

    // -- Agents --

    /// Register an agent. Fails if the id is empty or already registered.
    pub async fn register_agent(&self, agent: Arc<dyn Agent>) -> Result<()> {
        self.insert_agent(agent, None).await
    }

    /// Register an agent under a kind used for load balancing.
    pub async fn register_agent_as(&self, agent: Arc<dyn Agent>, kind: impl Into<String>) -> Result<()> {
        self.insert_agent(agent, Some(kind.into())).await
    }

    pub async fn register_message_agent(&self, agent: Arc<dyn MessageAgent>) -> Result<()> {
        self.insert_agent(Arc::new(MessageAgentAdapter::new(agent)), None)
            .await
    }

    async fn insert_agent(&self, agent: Arc<dyn Agent>, kind: Option<String>) -> Result<()> {
        let id = agent.id().to_string();
        if id.trim().is_empty() {
            return Err(MplpError::Orchestrator("Invalid agent: agent must have an ID".into()));
        }

        {
            let mut agents = self.agents.write().await;
            if agents.contains_key(&id) {
                return Err(MplpError::Orchestrator(format!("Agent already registered: {id}")));
            }
            let seq = {
                let mut next = self.next_seq.lock().unwrap_or_else(PoisonError::into_inner);
                *next += 1;
                *next
            };
            agents.insert(
                id.clone(),
                RegisteredAgent {
                    agent: agent.clone(),
                    info: AgentInfo {
                        id: id.clone(),
                        kind: kind.clone(),
                        weight: 1.0,
                        registered_at: Utc::now(),
                    },
                    seq,
                },
            );
        }
        self.engine.register_agent(agent).await;

        info!(agent_id = %id, kind = ?kind, "Agent registered");
        self.audit
            .record("agent_registered", json!({ "agentId": id, "kind": kind }));
        self.event_bus()
            .emit(WorkflowEvent::AgentRegistered { agent_id: id });
        Ok(())
    }

    pub async fn unregister_agent(&self, agent_id: &str) -> Result<()> {
        if agent_id.trim().is_empty() {
            return Err(MplpError::Orchestrator("Invalid agent ID".into()));
        }
        if self.agents.write().await.remove(agent_id).is_none() {
            return Err(MplpError::AgentNotFound(agent_id.to_string()));
        }
        self.engine.unregister_agent(agent_id).await;

        info!(agent_id, "Agent unregistered");
        self.audit
            .record("agent_unregistered", json!({ "agentId": agent_id }));
        self.event_bus().emit(WorkflowEvent::AgentUnregistered {
            agent_id: agent_id.to_string(),
        });
        Ok(())
    }

    pub async fn get_agent(&self, agent_id: &str) -> Option<Arc<dyn Agent>> {
        self.agents
            .read()
            .await
            .get(agent_id)
            .map(|a| a.agent.clone())
    }

    /// Registered agents in registration order.
    pub async fn list_agents(&self) -> Vec<AgentInfo> {
        let agents = self.agents.read().await;
        let mut list: Vec<&RegisteredAgent> = agents.values().collect();
        list.sort_by_key(|a| a.seq);
        list.into_iter().map(|a| a.info.clone()).collect()
    }

    /// Pick the next agent of `kind`, round-robin over registration order.
    pub async fn optimal_agent(&self, kind: &str) -> Option<String> {
        let agents = self.agents.read().await;
        let mut candidates: Vec<&RegisteredAgent> = agents
            .values()
            .filter(|a| a.info.kind.as_deref() == Some(kind))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        candidates.sort_by_key(|a| a.seq);

        let mut counters = self.round_robin.lock().unwrap_or_else(PoisonError::into_inner);
        let turn = counters.entry(kind.to_string()).or_default();
        let chosen = candidates[*turn % candidates.len()].info.id.clone();
        *turn += 1;
        debug!(kind, agent_id = %chosen, "Selected agent");
        Some(chosen)
    }

    /// Change the weight recorded for an agent. Selection by
    /// [`optimal_agent`](Self::optimal_agent) stays round-robin.
    pub async fn set_agent_weight(&self, agent_id: &str, weight: f64) -> Result<()> {
        if !weight.is_finite() || weight < 0.0 {
            return Err(MplpError::Orchestrator(format!(
                "Invalid weight for agent {agent_id}: {weight}"
            )));
        }
        self.agents
            .write()
            .await
            .get_mut(agent_id)
            .ok_or_else(|| MplpError::AgentNotFound(agent_id.to_string()))?
            .info
            .weight = weight;

        debug!(agent_id, weight, "Agent weight changed");
        self.audit.record(
            "agent_weight_changed",
            json!({ "agentId": agent_id, "weight": weight }),
        );
        Ok(())
    }

    // -- Workflows --

    /// Register a workflow definition under its id.
    pub fn register_workflow(&self, workflow: WorkflowDefinition) -> Result<()> {
        if workflow.id.trim().is_empty() {
            return Err(MplpError::WorkflowDefinition(
                "Invalid workflow: workflow must have an ID".into(),
            ));
        }
        validate_workflow(&workflow)?;

        let id = workflow.id.clone();
        {
            let mut workflows = self.workflows.write().unwrap_or_else(PoisonError::into_inner);
            if workflows.contains_key(&id) {
                return Err(MplpError::WorkflowDefinition(format!(
                    "Workflow already registered: {id}"
                )));
            }
            workflows.insert(id.clone(), Arc::new(workflow));
        }

        info!(workflow_id = %id, "Workflow registered");
        self.audit
            .record("workflow_registered", json!({ "workflowId": id }));
        self.event_bus()
            .emit(WorkflowEvent::WorkflowRegistered { workflow_id: id });
        Ok(())
    }

    pub fn unregister_workflow(&self, workflow_id: &str) -> Result<()> {
        if workflow_id.trim().is_empty() {
            return Err(MplpError::WorkflowDefinition("Invalid workflow ID".into()));
        }
        let removed = self
            .workflows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(workflow_id);
        if removed.is_none() {
            return Err(MplpError::WorkflowNotFound(workflow_id.to_string()));
        }

        info!(workflow_id, "Workflow unregistered");
        self.audit
            .record("workflow_unregistered", json!({ "workflowId": workflow_id }));
        self.event_bus().emit(WorkflowEvent::WorkflowUnregistered {
            workflow_id: workflow_id.to_string(),
        });
        Ok(())
    }

    pub fn get_workflow(&self, workflow_id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.workflows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(workflow_id)
            .cloned()
    }

    /// Registered workflows sorted by id.
    pub fn list_workflows(&self) -> Vec<Arc<WorkflowDefinition>> {
        let mut list: Vec<_> = self
            .workflows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    // -- Execution --

    /// Execute a registered workflow.
    ///
    /// Fails with `WorkflowNotFound` for an unknown id and with
    /// `AgentNotFound` if any agent referenced anywhere in the step tree is
    /// not registered; nothing runs in either case.
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        parameters: HashMap<String, Value>,
        options: ExecutionOptions,
    ) -> Result<WorkflowResult> {
        let workflow = self
            .get_workflow(workflow_id)
            .ok_or_else(|| MplpError::WorkflowNotFound(workflow_id.to_string()))?;

        let missing = self.missing_agents(&workflow).await;
        if let Some(agent_id) = missing.into_iter().next() {
            warn!(workflow_id, agent_id = %agent_id, "Workflow references an unregistered agent");
            return Err(MplpError::AgentNotFound(agent_id));
        }

        match self
            .engine
            .execute_workflow(&workflow, parameters, options)
            .await
        {
            Ok(result) => {
                self.audit.record(
                    "workflow_executed",
                    json!({
                        "workflowId": workflow_id,
                        "executionId": result.execution_id,
                        "durationMs": result.duration_ms,
                    }),
                );
                Ok(result)
            }
            Err(e) => {
                self.audit.record(
                    "workflow_execution_failed",
                    json!({ "workflowId": workflow_id, "error": e.to_string() }),
                );
                Err(e)
            }
        }
    }

    pub async fn get_execution_status(&self, execution_id: &ExecutionId) -> Option<WorkflowResult> {
        self.engine.get_execution(execution_id).await
    }

    pub async fn list_executions(&self) -> Vec<WorkflowResult> {
        self.engine.list_executions().await
    }

    pub async fn cancel_execution(&self, execution_id: &ExecutionId) -> Result<()> {
        if !self.engine.cancel_execution(execution_id).await {
            return Err(MplpError::Orchestrator(format!(
                "Execution is not running: {execution_id}"
            )));
        }
        self.audit
            .record("execution_cancelled", json!({ "executionId": execution_id }));
        Ok(())
    }

    /// Pausing is not supported by the engine.
    pub async fn pause_execution(&self, execution_id: &ExecutionId) -> Result<()> {
        Err(MplpError::Orchestrator(format!(
            "Pausing executions is not supported (execution {execution_id})"
        )))
    }

    /// Resuming is not supported by the engine.
    pub async fn resume_execution(&self, execution_id: &ExecutionId) -> Result<()> {
        Err(MplpError::Orchestrator(format!(
            "Resuming executions is not supported (execution {execution_id})"
        )))
    }

    /// Call `handler` for every progress update.
    pub fn on_progress<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&ProgressUpdate) + Send + Sync + 'static,
    {
        self.event_bus().on(EventKind::Progress, move |event| {
            if let WorkflowEvent::Progress(update) = event {
                handler(update);
            }
        })
    }

    /// Call `handler` for every failed step and failed execution. Returns
    /// the listeners to pass to [`EventBus::off`].
    pub fn on_error<F>(&self, handler: F) -> Vec<(EventKind, ListenerId)>
    where
        F: Fn(&ErrorReport) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        [EventKind::StepFailed, EventKind::WorkflowFailed]
            .into_iter()
            .map(|kind| {
                let handler = handler.clone();
                let id = self.event_bus().on(kind, move |event| {
                    let report = match event {
                        WorkflowEvent::StepFailed {
                            execution_id,
                            error,
                            result,
                        } => ErrorReport {
                            execution_id: execution_id.clone(),
                            step_id: Some(result.step_id.clone()),
                            error: error.clone(),
                        },
                        WorkflowEvent::WorkflowFailed { result, error } => ErrorReport {
                            execution_id: result.execution_id.clone(),
                            step_id: None,
                            error: error.clone(),
                        },
                        _ => return,
                    };
                    handler(&report);
                });
                (kind, id)
            })
            .collect()
    }

    // -- Security policies --

    /// Store a named policy, replacing any earlier one.
    pub fn set_security_policy(&self, name: impl Into<String>, policy: SecurityPolicy) {
        let name = name.into();
        self.audit.record(
            "security_policy_updated",
            json!({ "policyName": name, "policy": policy }),
        );
        info!(policy = %name, "Security policy updated");
        self.security_policies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, policy);
    }

    pub fn security_policy(&self, name: &str) -> Option<SecurityPolicy> {
        self.security_policies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Check `agent_id` against the named policy. Unknown policies allow
    /// everything.
    pub fn validate_security_policy(&self, name: &str, agent_id: Option<&str>) -> bool {
        self.security_policies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map_or(true, |policy| policy.allows(agent_id))
    }

    // -- Templates --

    /// Store a workflow as a template. Re-registering an id replaces it.
    pub fn register_template(&self, template_id: impl Into<String>, template: WorkflowDefinition) {
        let template_id = template_id.into();
        self.audit.record(
            "workflow_template_registered",
            json!({ "templateId": template_id, "template": template.name }),
        );
        debug!(template_id = %template_id, "Template registered");
        self.templates
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(template_id, template);
    }

    /// Instantiate a template. The new workflow is returned, not registered.
    pub fn create_workflow_from_template(
        &self,
        template_id: &str,
        workflow_id: &str,
        parameters: &HashMap<String, Value>,
    ) -> Result<WorkflowDefinition> {
        let workflow = {
            let templates = self.templates.read().unwrap_or_else(PoisonError::into_inner);
            let template = templates
                .get(template_id)
                .ok_or_else(|| MplpError::TemplateNotFound(template_id.to_string()))?;
            template::instantiate(template_id, template, workflow_id, parameters)
        };

        self.audit.record(
            "workflow_created_from_template",
            json!({
                "templateId": template_id,
                "workflowId": workflow_id,
                "parameters": parameters,
            }),
        );
        Ok(workflow)
    }

    /// Templates sorted by id.
    pub fn list_templates(&self) -> Vec<TemplateSummary> {
        let templates = self.templates.read().unwrap_or_else(PoisonError::into_inner);
        let mut list: Vec<TemplateSummary> = templates
            .iter()
            .map(|(id, t)| TemplateSummary::of(id, t))
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    // -- Audit, metrics, analytics --

    pub fn record_audit_event(&self, event: impl Into<String>, details: Value) {
        self.audit.record(event, details);
    }

    /// The `limit` most recent audit entries, oldest first.
    pub fn audit_log(&self, limit: usize) -> Vec<AuditEvent> {
        self.audit.recent(limit)
    }

    pub fn record_metric(&self, key: impl Into<String>, sample: MetricSample) {
        self.metrics.record(key, sample);
    }

    pub fn performance_metrics(&self) -> HashMap<String, Vec<MetricSample>> {
        self.metrics.snapshot()
    }

    pub fn agent_performance_stats(&self, agent_id: &str) -> Option<PerformanceStats> {
        self.metrics.stats(&format!("agent_{agent_id}"))
    }

    /// Outcome statistics over retained executions, optionally for one workflow.
    pub async fn workflow_analytics(&self, workflow_id: Option<&str>) -> WorkflowAnalytics {
        let executions = self.engine.list_executions().await;
        WorkflowAnalytics::from_results(
            executions
                .iter()
                .filter(|e| workflow_id.map_or(true, |id| e.workflow_id == id)),
        )
    }

    /// Degraded when a registered workflow needs a missing agent or when most
    /// executions in the last hour did not complete.
    pub async fn system_health(&self) -> SystemHealth {
        let executions = self.engine.list_executions().await;
        let since = Utc::now() - recent_window();
        let recent: Vec<&WorkflowResult> = executions
            .iter()
            .filter(|e| e.start_time > since && e.status.is_terminal())
            .collect();
        let recent_success_rate = if recent.is_empty() {
            0.0
        } else {
            recent
                .iter()
                .filter(|e| e.status == WorkflowStatus::Completed)
                .count() as f64
                / recent.len() as f64
        };

        let mut broken_workflows = 0;
        for workflow in self.list_workflows() {
            if !self.missing_agents(&workflow).await.is_empty() {
                broken_workflows += 1;
            }
        }

        let status = if broken_workflows > 0 || (!recent.is_empty() && recent_success_rate < 0.5) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        let agents = self.agents.read().await.len();
        let active_executions = self.engine.active_executions().await.len();
        let workflows = self.workflows.read().unwrap_or_else(PoisonError::into_inner).len();
        let templates = self.templates.read().unwrap_or_else(PoisonError::into_inner).len();

        SystemHealth {
            status,
            agents,
            workflows,
            templates,
            total_executions: executions.len(),
            active_executions,
            recent_executions: recent.len(),
            recent_success_rate,
            average_response_ms: self.metrics.average_duration_since(since),
            timestamp: Utc::now(),
        }
    }

    /// Agents referenced by `workflow` that are not registered, sorted.
    async fn missing_agents(&self, workflow: &WorkflowDefinition) -> Vec<String> {
        let agents = self.agents.read().await;
        workflow
            .agent_ids()
            .into_iter()
            .filter(|id| !agents.contains_key(id))
            .collect()
    }
}

impl Drop for MultiAgentOrchestrator {
    fn drop(&mut self) {
        let bus = self.engine.event_bus();
        for (kind, id) in &self.listeners {
            bus.off(*kind, *id);
        }
    }
}

/// Structural checks repeated at registration for definitions that did not
/// come from [`WorkflowBuilder`].
fn validate_workflow(workflow: &WorkflowDefinition) -> Result<()> {
    if workflow.name.trim().is_empty() {
        return Err(MplpError::WorkflowDefinition(
            "Workflow must have a valid name".into(),
        ));
    }
    if workflow.steps.is_empty() {
        return Err(MplpError::WorkflowDefinition(
            "Workflow must have at least one step".into(),
        ));
    }

    let mut ids = HashSet::new();
    for step in workflow.steps.iter().flat_map(|s| s.flatten()) {
        if !ids.insert(step.id.as_str()) {
            return Err(MplpError::WorkflowDefinition(format!(
                "Duplicate step ID: {}",
                step.id
            )));
        }
    }

    let top_level: HashSet<&str> = workflow.steps.iter().map(|s| s.id.as_str()).collect();
    for step in &workflow.steps {
        if let Some(dep) = step.dependencies.iter().find(|d| !top_level.contains(d.as_str())) {
            return Err(MplpError::WorkflowDefinition(format!(
                "Step '{}' depends on non-existent step '{}'",
                step.id, dep
            )));
        }
    }
    Ok(())
}

fn final_result(event: &WorkflowEvent) -> Option<&WorkflowResult> {
    match event {
        WorkflowEvent::WorkflowCompleted { result }
        | WorkflowEvent::WorkflowFailed { result, .. }
        | WorkflowEvent::WorkflowCancelled { result } => Some(result),
        _ => None,
    }
}

/// One `workflow_<id>` sample per execution and one `agent_<id>` sample per
/// agent step that completed or failed.
fn record_execution_metrics(workflows: &WorkflowTable, metrics: &MetricsStore, result: &WorkflowResult) {
    metrics.record(
        format!("workflow_{}", result.workflow_id),
        MetricSample::new(
            result.duration_ms.unwrap_or_default(),
            result.status == WorkflowStatus::Completed,
        ),
    );

    let workflows = workflows.read().unwrap_or_else(PoisonError::into_inner);
    let Some(workflow) = workflows.get(&result.workflow_id) else {
        return;
    };
    for step_result in &result.steps {
        let success = match step_result.status {
            StepStatus::Completed => true,
            StepStatus::Failed => false,
            _ => continue,
        };
        if let Some(StepKind::Agent { agent_id, .. }) =
            workflow.find_step(&step_result.step_id).map(|s| &s.kind)
        {
            metrics.record(
                format!("agent_{agent_id}"),
                MetricSample::new(step_result.duration_ms.unwrap_or_default(), success),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mplp_engine::workflow::{AgentStepConfig, Step, StepConfig};
    use mplp_test_utils::RecordingAgent;

    fn two_step(id: &str) -> WorkflowDefinition {
        WorkflowBuilder::new("Pair")
            .with_id(id)
            .step("one", AgentStepConfig::new("One", "a1", "run"))
            .unwrap()
            .step("two", AgentStepConfig::new("Two", "a2", "run").depends_on(["one"]))
            .unwrap()
            .build()
            .unwrap()
    }

    #[test]
    fn test_validate_workflow() {
        let mut wf = two_step("wf");
        assert!(validate_workflow(&wf).is_ok());

        wf.steps[1].dependencies = vec!["ghost".into()];
        let err = validate_workflow(&wf).unwrap_err();
        assert!(err.to_string().contains("non-existent step 'ghost'"));

        wf.steps[1] = Step::agent("one", "Again", "a1", "run");
        let err = validate_workflow(&wf).unwrap_err();
        assert!(err.to_string().contains("Duplicate step ID: one"));

        wf.steps.clear();
        assert!(validate_workflow(&wf).is_err());
    }

    #[tokio::test]
    async fn test_round_robin_by_kind() {
        let orch = MultiAgentOrchestrator::with_config(EngineConfig::default());
        orch.register_agent_as(RecordingAgent::new("w1"), "worker").await.unwrap();
        orch.register_agent_as(RecordingAgent::new("w2"), "worker").await.unwrap();
        orch.register_agent(RecordingAgent::new("other")).await.unwrap();

        let mut chosen = Vec::new();
        for _ in 0..4 {
            chosen.push(orch.optimal_agent("worker").await.unwrap());
        }
        assert_eq!(chosen, vec!["w1", "w2", "w1", "w2"]);
        assert!(orch.optimal_agent("nobody").await.is_none());
    }

    #[tokio::test]
    async fn test_metrics_listener_records_agents() {
        let orch = MultiAgentOrchestrator::with_config(EngineConfig::default());
        orch.register_agent(RecordingAgent::new("a1")).await.unwrap();
        orch.register_agent(RecordingAgent::new("a2")).await.unwrap();
        orch.register_workflow(two_step("pair")).unwrap();

        orch.execute_workflow("pair", HashMap::new(), ExecutionOptions::default())
            .await
            .unwrap();

        let stats = orch.agent_performance_stats("a1").unwrap();
        assert_eq!(stats.total_executions, 1);
        assert_eq!(stats.success_rate, 1.0);
        assert!(orch.performance_metrics().contains_key("workflow_pair"));
    }

    #[tokio::test]
    async fn test_drop_removes_listeners() {
        let engine = Arc::new(ExecutionEngine::default());
        let orch = MultiAgentOrchestrator::new(engine.clone());
        assert_eq!(engine.event_bus().listener_count(EventKind::WorkflowCompleted), 1);
        drop(orch);
        assert_eq!(engine.event_bus().listener_count(EventKind::WorkflowCompleted), 0);
    }
}
