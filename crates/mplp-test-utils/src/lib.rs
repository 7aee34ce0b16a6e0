//! Mock agents and fixtures shared by the MPLP test suites.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use mplp_core::config::AppConfig;
use mplp_core::error::{MplpError, Result};
use mplp_core::traits::{Agent, MessageAgent};
use mplp_core::types::AgentMessage;

/// A recorded `invoke` call.
#[derive(Debug, Clone)]
pub struct Call {
    pub action: String,
    pub parameters: Value,
}

/// Succeeds every time and records each call.
///
/// Returns `{"agentId", "action", "parameters"}`.
pub struct RecordingAgent {
    id: String,
    calls: Mutex<Vec<Call>>,
}

impl RecordingAgent {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn actions(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.action).collect()
    }
}

impl Agent for RecordingAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn invoke(&self, action: &str, parameters: Value) -> BoxFuture<'_, Result<Value>> {
        self.calls.lock().unwrap().push(Call {
            action: action.to_string(),
            parameters: parameters.clone(),
        });
        let out = json!({ "agentId": self.id, "action": action, "parameters": parameters });
        Box::pin(async move { Ok(out) })
    }
}

/// Fails the first `failures` calls, then succeeds. `usize::MAX` never succeeds.
pub struct FlakyAgent {
    id: String,
    failures: usize,
    calls: AtomicUsize,
}

impl FlakyAgent {
    pub fn new(id: &str, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            failures,
            calls: AtomicUsize::new(0),
        })
    }

    /// An agent that always fails.
    pub fn always(id: &str) -> Arc<Self> {
        Self::new(id, usize::MAX)
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Agent for FlakyAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn invoke(&self, action: &str, _parameters: Value) -> BoxFuture<'_, Result<Value>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let action = action.to_string();
        Box::pin(async move {
            if n < self.failures {
                Err(MplpError::Execution(format!(
                    "{} failed on attempt {}",
                    self.id,
                    n + 1
                )))
            } else {
                Ok(json!({ "agentId": self.id, "action": action, "attempt": n + 1 }))
            }
        })
    }
}

/// Sleeps before answering and tracks how many calls overlap.
pub struct SlowAgent {
    id: String,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    started: AtomicUsize,
    finished: AtomicUsize,
}

impl SlowAgent {
    pub fn new(id: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            delay,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        })
    }

    /// Highest number of concurrent calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

impl Agent for SlowAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn invoke(&self, action: &str, _parameters: Value) -> BoxFuture<'_, Result<Value>> {
        let action = action.to_string();
        Box::pin(async move {
            self.started.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            tokio::time::sleep(self.delay).await;

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "agentId": self.id, "action": action }))
        })
    }
}

/// A message agent that keeps every message it receives.
pub struct MockMessageAgent {
    id: String,
    received: Mutex<Vec<AgentMessage>>,
}

impl MockMessageAgent {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            received: Mutex::new(Vec::new()),
        })
    }

    pub fn received(&self) -> Vec<AgentMessage> {
        self.received.lock().unwrap().clone()
    }
}

impl MessageAgent for MockMessageAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn send_message(&self, message: AgentMessage) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.received.lock().unwrap().push(message);
            Ok(())
        })
    }
}

/// Write `content` to `mplp.toml` in a fresh temp dir.
///
/// Keep the returned `TempDir` alive for as long as the file is needed.
pub fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mplp.toml");
    std::fs::write(&path, content).unwrap();
    (dir, path)
}

/// Parse an inline TOML config without touching the filesystem.
pub fn config_from_str(content: &str) -> AppConfig {
    toml::from_str(content).unwrap()
}
