use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use mplp_core::config::{AgentConfig, AgentKind};
use mplp_core::error::{MplpError, Result};
use mplp_core::traits::Agent;

/// Build the agent described by one `[[agents]]` entry.
pub fn build_agent(config: &AgentConfig) -> Result<Arc<dyn Agent>> {
    match config.kind {
        AgentKind::Echo => Ok(Arc::new(EchoAgent::new(&config.id))),
        AgentKind::Command => {
            let command = config.command.clone().ok_or_else(|| {
                MplpError::Config(format!("agent '{}' requires `command`", config.id))
            })?;
            Ok(Arc::new(CommandAgent {
                id: config.id.clone(),
                command,
                args: config.args.clone(),
                env: config.env.clone(),
            }))
        }
    }
}

/// Returns `{ "agentId", "action", "parameters" }`.
pub struct EchoAgent {
    id: String,
}

impl EchoAgent {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl Agent for EchoAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn invoke(&self, action: &str, parameters: Value) -> BoxFuture<'_, Result<Value>> {
        let output = json!({
            "agentId": self.id,
            "action": action,
            "parameters": parameters,
        });
        Box::pin(async move { Ok(output) })
    }
}

/// Runs a local program per invocation.
///
/// The action is appended to the configured arguments and the parameters
/// are written to stdin as JSON. Stdout is parsed as JSON when possible and
/// returned as a string otherwise. A non-zero exit fails the step.
pub struct CommandAgent {
    id: String,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
}

impl Agent for CommandAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn invoke(&self, action: &str, parameters: Value) -> BoxFuture<'_, Result<Value>> {
        let action = action.to_string();
        Box::pin(async move {
            debug!(agent_id = %self.id, command = %self.command, action = %action, "Running command agent");

            let input = serde_json::to_vec(&parameters)?;
            let mut child = tokio::process::Command::new(&self.command)
                .args(&self.args)
                .arg(&action)
                .envs(&self.env)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()?;

            if let Some(mut stdin) = child.stdin.take() {
                // The program may exit without reading its input.
                stdin.write_all(&input).await.ok();
            }

            let output = child.wait_with_output().await?;
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                let msg = if stderr.is_empty() { stdout } else { stderr };
                return Err(MplpError::step(
                    &self.id,
                    format!("exit code {}: {}", output.status.code().unwrap_or(-1), msg),
                ));
            }

            Ok(serde_json::from_str(&stdout).unwrap_or(Value::String(stdout)))
        })
    }
}
