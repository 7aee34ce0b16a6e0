use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{MplpError, Result};

/// Top-level MPLP configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
    /// Agents registered by the CLI before running a workflow.
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

/// Execution engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Retries used when neither the step, the options nor the workflow set one.
    #[serde(default)]
    pub default_retries: u32,
    /// Concurrency for parallel steps that do not set their own.
    /// Unset means every sub-step may run at once.
    #[serde(default)]
    pub default_concurrency: Option<usize>,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    /// Finished executions kept for `get_execution`; the oldest is evicted first.
    #[serde(default = "default_max_retained")]
    pub max_retained_executions: usize,
    #[serde(default = "default_event_history")]
    pub event_history_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_retries: 0,
            default_concurrency: None,
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            max_retained_executions: default_max_retained(),
            event_history_limit: default_event_history(),
        }
    }
}

fn default_initial_backoff() -> u64 { 100 }
fn default_max_backoff() -> u64 { 5000 }
fn default_max_retained() -> usize { 1000 }
fn default_event_history() -> usize { 1000 }

/// JSONL run log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_dir")]
    pub dir: String,
    /// 1 = workflow lifecycle, 2 = + step events, 3 = + progress and retries.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

fn default_log_dir() -> String {
    "~/.mplp/logs".to_string()
}

fn default_log_level() -> u8 {
    2
}

impl LogConfig {
    /// Resolve the log directory (expand ~).
    pub fn log_dir(&self) -> PathBuf {
        expand_home(&self.dir)
    }
}

/// Built-in agent implementations available from config.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// Returns its action and parameters unchanged.
    #[default]
    Echo,
    /// Runs a local command; the action is passed as the last argument.
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    #[serde(default)]
    pub kind: AgentKind,
    /// Category used for round-robin selection in the orchestrator.
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| MplpError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| MplpError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`load`](Self::load), but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<()> {
        if self.engine.default_concurrency == Some(0) {
            return Err(MplpError::Config(
                "engine.default_concurrency must be greater than 0".into(),
            ));
        }
        for agent in &self.agents {
            if agent.id.trim().is_empty() {
                return Err(MplpError::Config("agent id must not be empty".into()));
            }
            if agent.kind == AgentKind::Command && agent.command.is_none() {
                return Err(MplpError::Config(format!(
                    "agent '{}' of kind command requires `command`",
                    agent.id
                )));
            }
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var("HOME").ok().map(PathBuf::from) {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
