//! Declarative workflow files (TOML or JSON).
//!
//! Conditions in files are expressions (see
//! [`evaluate_condition`](crate::workflow::evaluate_condition)); everything
//! else maps one-to-one onto the builder.
//!
//! ```toml
//! name = "Ingest"
//!
//! [[steps]]
//! id = "fetch"
//! name = "Fetch"
//! type = "agent"
//! agent_id = "fetcher"
//! action = "fetch"
//! parameters = { url = "https://example.com" }
//!
//! [[steps]]
//! id = "store"
//! name = "Store"
//! type = "agent"
//! agent_id = "db"
//! action = "insert"
//! dependencies = ["fetch"]
//! when = 'fetch_status == "completed"'
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use mplp_core::error::{MplpError, Result};
use mplp_core::types::StepPriority;

use crate::workflow::{Condition, Step, StepKind, WorkflowBuilder, WorkflowDefinition};

/// Top level of a workflow file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowFile {
    /// Generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

/// One step as written in a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub priority: StepPriority,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Skip the step unless this expression holds.
    #[serde(default)]
    pub when: Option<String>,
    #[serde(flatten)]
    pub kind: StepSpecKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StepSpecKind {
    Agent {
        agent_id: String,
        action: String,
        #[serde(default)]
        parameters: serde_json::Map<String, serde_json::Value>,
    },
    Parallel {
        steps: Vec<StepSpec>,
        #[serde(default)]
        concurrency: Option<usize>,
        #[serde(default)]
        fail_fast: bool,
    },
    Sequential {
        steps: Vec<StepSpec>,
    },
    Conditional {
        condition: String,
        then_step: Box<StepSpec>,
        #[serde(default)]
        else_step: Option<Box<StepSpec>>,
    },
    Loop {
        condition: String,
        body: Box<StepSpec>,
        #[serde(default)]
        max_iterations: Option<usize>,
    },
}

impl WorkflowFile {
    /// Load a workflow file. `.json` files are parsed as JSON, anything else
    /// as TOML.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json(&content)
        } else {
            Self::from_toml(&content)
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| MplpError::WorkflowDefinition(format!("invalid workflow file: {e}")))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Validate through [`WorkflowBuilder`] and produce a definition.
    pub fn into_definition(self) -> Result<WorkflowDefinition> {
        let mut builder = WorkflowBuilder::create(self.name, self.id).metadata(self.metadata);
        if let Some(description) = self.description {
            builder = builder.description(description);
        }
        if let Some(version) = self.version {
            builder = builder.version(version);
        }
        if let Some(timeout_ms) = self.timeout_ms {
            builder = builder.timeout(timeout_ms)?;
        }
        if let Some(retries) = self.retries {
            builder = builder.retries(retries);
        }
        for spec in self.steps {
            builder = builder.add_step(spec.into_step())?;
        }
        builder.build()
    }
}

impl StepSpec {
    pub fn into_step(self) -> Step {
        let kind = match self.kind {
            StepSpecKind::Agent {
                agent_id,
                action,
                parameters,
            } => StepKind::Agent {
                agent_id,
                action,
                parameters,
            },
            StepSpecKind::Parallel {
                steps,
                concurrency,
                fail_fast,
            } => StepKind::Parallel {
                steps: steps.into_iter().map(StepSpec::into_step).collect(),
                concurrency,
                fail_fast,
            },
            StepSpecKind::Sequential { steps } => StepKind::Sequential {
                steps: steps.into_iter().map(StepSpec::into_step).collect(),
            },
            StepSpecKind::Conditional {
                condition,
                then_step,
                else_step,
            } => StepKind::Conditional {
                condition: Condition::expr(condition),
                then_step: Box::new(then_step.into_step()),
                else_step: else_step.map(|s| Box::new(s.into_step())),
            },
            StepSpecKind::Loop {
                condition,
                body,
                max_iterations,
            } => StepKind::Loop {
                condition: Condition::expr(condition),
                body: Box::new(body.into_step()),
                max_iterations: max_iterations.unwrap_or(crate::workflow::DEFAULT_MAX_ITERATIONS),
            },
        };

        Step {
            id: self.id,
            name: self.name,
            dependencies: self.dependencies,
            timeout_ms: self.timeout_ms,
            retries: self.retries,
            priority: self.priority,
            metadata: self.metadata,
            condition: self.when.map(Condition::expr),
            kind,
        }
    }
}
