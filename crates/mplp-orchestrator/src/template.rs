use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::Utc;
use regex::{Captures, Regex};
use serde::Serialize;
use serde_json::Value;

use mplp_engine::workflow::{Step, StepKind, WorkflowDefinition};

/// Summary returned by `list_templates`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TemplateSummary {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TemplateSummary {
    pub(crate) fn of(id: &str, template: &WorkflowDefinition) -> Self {
        let description = template.description.clone().or_else(|| {
            template
                .metadata
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string)
        });
        Self {
            id: id.to_string(),
            name: template.name.clone(),
            description,
        }
    }
}

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| Regex::new(r"\{\{(\w+)\}\}").unwrap())
}

/// Replace every `{{key}}` with the matching parameter. String parameters are
/// inserted as-is, other values as JSON text. Unknown keys are left untouched.
pub fn substitute(text: &str, params: &HashMap<String, Value>) -> String {
    placeholder()
        .replace_all(text, |caps: &Captures| match params.get(&caps[1]) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// [`substitute`] applied to every string inside a JSON value.
pub fn substitute_value(value: &Value, params: &HashMap<String, Value>) -> Value {
    match value {
        Value::String(s) => Value::String(substitute(s, params)),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute_value(v, params)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_value(v, params)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Substitute placeholders in a step and everything nested under it.
///
/// Touches the step name, metadata and, for agent steps, the agent id,
/// action and parameters. Ids and dependencies are kept so the copy stays
/// structurally identical to the template.
pub fn substitute_step(step: &mut Step, params: &HashMap<String, Value>) {
    step.name = substitute(&step.name, params);
    for value in step.metadata.values_mut() {
        *value = substitute_value(value, params);
    }

    match &mut step.kind {
        StepKind::Agent {
            agent_id,
            action,
            parameters,
        } => {
            *agent_id = substitute(agent_id, params);
            *action = substitute(action, params);
            for value in parameters.values_mut() {
                *value = substitute_value(value, params);
            }
        }
        StepKind::Parallel { steps, .. } | StepKind::Sequential { steps } => {
            for sub in steps {
                substitute_step(sub, params);
            }
        }
        StepKind::Conditional {
            then_step,
            else_step,
            ..
        } => {
            substitute_step(then_step, params);
            if let Some(else_step) = else_step {
                substitute_step(else_step, params);
            }
        }
        StepKind::Loop { body, .. } => substitute_step(body, params),
    }
}

/// Instantiate a template as a new workflow.
///
/// `params["name"]` (a string) overrides the generated name and
/// `params["metadata"]` (an object) is merged into the metadata. The result
/// records its origin under `templateId`, `createdFrom` and `createdAt`.
pub fn instantiate(
    template_id: &str,
    template: &WorkflowDefinition,
    workflow_id: &str,
    params: &HashMap<String, Value>,
) -> WorkflowDefinition {
    let mut workflow = template.clone();
    workflow.id = workflow_id.to_string();
    workflow.name = match params.get("name").and_then(Value::as_str) {
        Some(name) => name.to_string(),
        None => format!("{} ({})", template.name, workflow_id),
    };
    workflow.description = template
        .description
        .as_deref()
        .map(|d| substitute(d, params));

    if let Some(Value::Object(extra)) = params.get("metadata") {
        for (k, v) in extra {
            workflow.metadata.insert(k.clone(), v.clone());
        }
    }
    workflow
        .metadata
        .insert("templateId".into(), Value::String(template_id.to_string()));
    workflow
        .metadata
        .insert("createdFrom".into(), Value::String(template_id.to_string()));
    workflow
        .metadata
        .insert("createdAt".into(), Value::String(Utc::now().to_rfc3339()));

    for step in &mut workflow.steps {
        substitute_step(step, params);
    }
    workflow
}
