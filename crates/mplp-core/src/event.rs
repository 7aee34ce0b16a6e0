use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error};

use crate::types::{EventKind, WorkflowEvent};

/// Synchronous listener callback.
pub type EventHandler = Arc<dyn Fn(&WorkflowEvent) + Send + Sync>;

/// Handle returned by [`EventBus::on`], used to remove the listener again.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub struct ListenerId(u64);

struct Listener {
    id: ListenerId,
    handler: EventHandler,
    once: bool,
}

/// A past emission kept in the bounded history.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub seq: u64,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub event: WorkflowEvent,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EventStats {
    pub total_events: u64,
    pub listener_failures: u64,
    pub events_by_kind: HashMap<String, u64>,
    pub last_event_time: Option<DateTime<Utc>>,
}

/// Process-wide publish/subscribe.
///
/// Listeners registered with [`on`](Self::on) run synchronously inside
/// [`emit`](Self::emit), in registration order. A panicking listener is
/// caught and logged; the remaining listeners still run and the emitter is
/// unaffected. Every emission is also forwarded to a tokio broadcast channel
/// for async consumers (see [`subscribe`](Self::subscribe)).
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<WorkflowEvent>,
    listeners: RwLock<HashMap<EventKind, Vec<Listener>>>,
    next_id: AtomicU64,
    history: Mutex<VecDeque<EventRecord>>,
    history_limit: usize,
    stats: Mutex<EventStats>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self::with_history_limit(capacity, 1000)
    }

    pub fn with_history_limit(capacity: usize, history_limit: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self {
            tx,
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            history: Mutex::new(VecDeque::new()),
            history_limit,
            stats: Mutex::new(EventStats::default()),
        }
    }

    /// Register a listener for one event kind.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> ListenerId
    where
        F: Fn(&WorkflowEvent) + Send + Sync + 'static,
    {
        self.add_listener(kind, Arc::new(handler), false)
    }

    /// Register a listener that is removed after its first invocation.
    pub fn once<F>(&self, kind: EventKind, handler: F) -> ListenerId
    where
        F: Fn(&WorkflowEvent) + Send + Sync + 'static,
    {
        self.add_listener(kind, Arc::new(handler), true)
    }

    fn add_listener(&self, kind: EventKind, handler: EventHandler, once: bool) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(Listener { id, handler, once });
        id
    }

    /// Remove a listener. Returns true if it was registered.
    pub fn off(&self, kind: EventKind, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        match listeners.get_mut(&kind) {
            Some(list) => {
                let before = list.len();
                list.retain(|l| l.id != id);
                list.len() != before
            }
            None => false,
        }
    }

    /// Remove every listener for `kind`, or all listeners when `None`.
    pub fn remove_all_listeners(&self, kind: Option<EventKind>) {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        match kind {
            Some(k) => {
                listeners.remove(&k);
            }
            None => listeners.clear(),
        }
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Emit an event. Returns whether any synchronous listener ran.
    pub fn emit(&self, event: WorkflowEvent) -> bool {
        let kind = event.kind();
        let seq = self.record(&event);

        // Snapshot handlers so listeners may call back into the bus.
        let handlers: Vec<EventHandler> = {
            let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
            match listeners.get_mut(&kind) {
                Some(list) => {
                    let handlers = list.iter().map(|l| l.handler.clone()).collect();
                    list.retain(|l| !l.once);
                    handlers
                }
                None => Vec::new(),
            }
        };

        for handler in &handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                error!(event = %kind, seq, "Event listener panicked, continuing");
                lock(&self.stats).listener_failures += 1;
            }
        }

        // Ignore error if no receivers
        let _ = self.tx.send(event);

        debug!(event = %kind, seq, listeners = handlers.len(), "Event emitted");
        !handlers.is_empty()
    }

    /// Receive every emitted event asynchronously.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }

    /// Most recent events, oldest first. `None` returns the whole history.
    pub fn history(&self, limit: Option<usize>) -> Vec<EventRecord> {
        let history = lock(&self.history);
        let skip = limit.map_or(0, |l| history.len().saturating_sub(l));
        history.iter().skip(skip).cloned().collect()
    }

    pub fn clear_history(&self) {
        lock(&self.history).clear();
    }

    pub fn stats(&self) -> EventStats {
        lock(&self.stats).clone()
    }

    fn record(&self, event: &WorkflowEvent) -> u64 {
        let kind = event.kind();
        let now = Utc::now();
        let seq = {
            let mut stats = lock(&self.stats);
            stats.total_events += 1;
            *stats.events_by_kind.entry(kind.as_str().to_string()).or_default() += 1;
            stats.last_event_time = Some(now);
            stats.total_events
        };

        if self.history_limit > 0 {
            let mut history = lock(&self.history);
            history.push_back(EventRecord {
                seq,
                kind,
                timestamp: now,
                event: event.clone(),
            });
            while history.len() > self.history_limit {
                history.pop_front();
            }
        }
        seq
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
