use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use mplp_core::event::EventBus;
use mplp_core::types::{ExecutionId, WorkflowEvent};

/// JSONL execution logger.
///
/// Subscribes to the EventBus and writes one file per execution to
/// `{log_dir}/{execution_id}.jsonl`, one JSON object per line. Lines are
/// flushed as they are written, so a crash loses nothing already logged.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    execution_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    step_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level` controls verbosity: 1=workflow lifecycle, 2=per-step,
    /// 3=progress and retries.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Path of the log file for one execution.
    pub fn log_path(&self, execution_id: &ExecutionId) -> PathBuf {
        self.log_dir.join(format!("{}.jsonl", execution_id))
    }

    /// Subscribe now and log on a spawned task. Events emitted after this
    /// call returns are guaranteed to be seen.
    pub fn spawn(self, event_bus: &EventBus, cancel: CancellationToken) -> JoinHandle<()> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.consume(rx, cancel))
    }

    /// Run the logger as a background task.
    ///
    /// Writes until cancellation or until the event bus closes. On
    /// cancellation, events already queued are still written.
    pub async fn run(self, event_bus: Arc<EventBus>, cancel: CancellationToken) {
        let rx = event_bus.subscribe();
        self.consume(rx, cancel).await
    }

    async fn consume(self, mut rx: Receiver<WorkflowEvent>, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }
        info!(dir = %self.log_dir.display(), "RunLogger started");

        let mut writers: HashMap<ExecutionId, BufWriter<File>> = HashMap::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled, draining queued events");
                    loop {
                        match rx.try_recv() {
                            Ok(event) => self.handle(&mut writers, &event).await,
                            Err(TryRecvError::Lagged(n)) => {
                                debug!(skipped = n, "RunLogger lagged, skipped events");
                            }
                            Err(_) => break,
                        }
                    }
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => self.handle(&mut writers, &event).await,
                        Err(RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        // Final flush
        for (_, mut writer) in writers {
            writer.flush().await.ok();
        }
        debug!("RunLogger finished");
    }

    async fn handle(&self, writers: &mut HashMap<ExecutionId, BufWriter<File>>, event: &WorkflowEvent) {
        let Some(execution_id) = event.execution_id() else {
            return;
        };
        let Some(entry) = self.event_to_entry(execution_id, event) else {
            return;
        };

        if !writers.contains_key(execution_id) {
            let path = self.log_path(execution_id);
            match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(file) => {
                    debug!(path = %path.display(), "Opened execution log");
                    writers.insert(execution_id.clone(), BufWriter::new(file));
                }
                Err(e) => {
                    error!(error = %e, path = %path.display(), "Failed to open log file");
                    return;
                }
            }
        }

        if let Some(writer) = writers.get_mut(execution_id) {
            if let Ok(json) = serde_json::to_string(&entry) {
                let line = format!("{}\n", json);
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    error!(error = %e, "Failed to write log entry");
                }
                // Flush after each entry for crash resilience
                if let Err(e) = writer.flush().await {
                    error!(error = %e, "Failed to flush log");
                }
            }
        }

        // Close the file once the execution is over
        if event.is_final() {
            writers.remove(execution_id);
        }
    }

    /// Convert a WorkflowEvent to a log entry (returns None if filtered by level).
    fn event_to_entry(&self, execution_id: &ExecutionId, event: &WorkflowEvent) -> Option<LogEntry> {
        let entry = |event_type: &str, step_id: Option<&str>, detail: Option<serde_json::Value>| {
            Some(LogEntry {
                timestamp: Utc::now().to_rfc3339(),
                execution_id: execution_id.to_string(),
                event_type: event_type.to_string(),
                step_id: step_id.map(str::to_string),
                detail,
            })
        };

        match event {
            // L1: Always logged (execution summary)
            WorkflowEvent::WorkflowStarted { workflow_id, .. } => entry(
                "workflow_started",
                None,
                Some(serde_json::json!({ "workflow_id": workflow_id })),
            ),
            WorkflowEvent::WorkflowCompleted { result } => entry(
                "workflow_completed",
                None,
                Some(serde_json::json!({
                    "duration_ms": result.duration_ms,
                    "steps": result.steps.len(),
                })),
            ),
            WorkflowEvent::WorkflowFailed { result, error } => entry(
                "workflow_failed",
                None,
                Some(serde_json::json!({
                    "duration_ms": result.duration_ms,
                    "error": error,
                })),
            ),
            WorkflowEvent::WorkflowCancelled { result } => entry(
                "workflow_cancelled",
                None,
                Some(serde_json::json!({ "duration_ms": result.duration_ms })),
            ),

            // L2: Per-step events
            WorkflowEvent::StepStarted { step_id, .. } if self.level >= 2 => {
                entry("step_started", Some(step_id.as_str()), None)
            }
            WorkflowEvent::StepCompleted { result, .. } if self.level >= 2 => entry(
                "step_completed",
                Some(result.step_id.as_str()),
                Some(serde_json::json!({
                    "attempts": result.attempts,
                    "duration_ms": result.duration_ms,
                    "result_preview": result.result.as_ref().map(|r| truncate_json(r, 500)),
                })),
            ),
            WorkflowEvent::StepFailed { result, error, .. } if self.level >= 2 => entry(
                "step_failed",
                Some(result.step_id.as_str()),
                Some(serde_json::json!({
                    "attempts": result.attempts,
                    "error": error,
                })),
            ),
            WorkflowEvent::StepSkipped { result, .. } if self.level >= 2 => {
                entry("step_skipped", Some(result.step_id.as_str()), None)
            }

            // L3: Progress and retries
            WorkflowEvent::StepRetrying {
                step_id,
                attempt,
                max_retries,
                backoff_ms,
                error,
                ..
            } if self.level >= 3 => entry(
                "step_retrying",
                Some(step_id.as_str()),
                Some(serde_json::json!({
                    "attempt": attempt,
                    "max_retries": max_retries,
                    "backoff_ms": backoff_ms,
                    "error": error,
                })),
            ),
            WorkflowEvent::Progress(update) if self.level >= 3 => entry(
                "progress",
                Some(update.step_id.as_str()),
                Some(serde_json::json!({
                    "finished": update.finished,
                    "total": update.total,
                    "progress": update.progress,
                })),
            ),

            _ => None,
        }
    }
}

/// Truncate a JSON value for logging.
fn truncate_json(value: &serde_json::Value, max_len: usize) -> String {
    let s = value.to_string();
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
