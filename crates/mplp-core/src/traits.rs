use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::AgentMessage;

/// The single dispatch interface the engine calls for `agent` steps.
pub trait Agent: Send + Sync + 'static {
    /// Registry key referenced by `agent` steps.
    fn id(&self) -> &str;

    /// Perform `action` with the merged step parameters.
    /// The returned value becomes the step's result payload.
    fn invoke(
        &self,
        action: &str,
        parameters: serde_json::Value,
    ) -> BoxFuture<'_, Result<serde_json::Value>>;
}

/// Fire-and-forget agents that only accept messages.
///
/// These are normalized into [`Agent`] at registration time; the engine
/// never probes which style an agent implements.
pub trait MessageAgent: Send + Sync + 'static {
    fn id(&self) -> &str;

    /// Deliver a message. No payload flows back to the workflow.
    fn send_message(&self, message: AgentMessage) -> BoxFuture<'_, Result<()>>;
}
