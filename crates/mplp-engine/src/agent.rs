use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::json;

use mplp_core::error::Result;
use mplp_core::traits::{Agent, MessageAgent};
use mplp_core::types::AgentMessage;

/// Presents a [`MessageAgent`] as an [`Agent`].
///
/// Each invocation becomes one [`AgentMessage`] addressed to the agent. The
/// step result is an acknowledgement envelope:
/// `{"success": true, "messageId", "agentId", "action"}`.
pub struct MessageAgentAdapter {
    inner: Arc<dyn MessageAgent>,
}

impl MessageAgentAdapter {
    pub fn new(inner: Arc<dyn MessageAgent>) -> Self {
        Self { inner }
    }
}

impl Agent for MessageAgentAdapter {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn invoke(
        &self,
        action: &str,
        parameters: serde_json::Value,
    ) -> BoxFuture<'_, Result<serde_json::Value>> {
        let action = action.to_string();
        Box::pin(async move {
            let message = AgentMessage::new(self.inner.id(), action.clone(), parameters);
            let message_id = message.id.clone();
            self.inner.send_message(message).await?;
            Ok(json!({
                "success": true,
                "messageId": message_id,
                "agentId": self.inner.id(),
                "action": action,
            }))
        })
    }
}

type InvokeFn =
    dyn Fn(String, serde_json::Value) -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync;

/// An [`Agent`] backed by an async closure.
pub struct FnAgent {
    id: String,
    f: Arc<InvokeFn>,
}

impl FnAgent {
    pub fn new<F, Fut>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn(String, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        Self {
            id: id.into(),
            f: Arc::new(move |action, params| Box::pin(f(action, params))),
        }
    }
}

impl Agent for FnAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn invoke(
        &self,
        action: &str,
        parameters: serde_json::Value,
    ) -> BoxFuture<'_, Result<serde_json::Value>> {
        (self.f)(action.to_string(), parameters)
    }
}
