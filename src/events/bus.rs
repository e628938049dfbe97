//! In-process publish/subscribe bus for workflow events.
//!
//! Handlers run synchronously on the emitting thread, highest priority
//! first. A handler that returns an error or panics is logged and skipped;
//! the remaining handlers still run.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Default number of events kept in history.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Well-known workflow event types.
pub mod event_types {
    pub const WORKFLOW_INITIALIZED: &str = "workflow_initialized";
    pub const WORKFLOW_STARTED: &str = "workflow_started";
    pub const WORKFLOW_COMPLETED: &str = "workflow_completed";
    pub const PHASE_STARTED: &str = "phase_started";
    pub const PHASE_COMPLETED: &str = "phase_completed";
    pub const STEP_STARTED: &str = "step_started";
    pub const STEP_COMPLETED: &str = "step_completed";
    pub const STEP_FAILED: &str = "step_failed";

    /// Every workflow event type.
    pub const ALL: [&str; 8] = [
        WORKFLOW_INITIALIZED,
        WORKFLOW_STARTED,
        WORKFLOW_COMPLETED,
        PHASE_STARTED,
        PHASE_COMPLETED,
        STEP_STARTED,
        STEP_COMPLETED,
        STEP_FAILED,
    ];
}

/// A dispatched event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Event type tag
    pub event_type: String,
    /// Payload
    pub data: Map<String, Value>,
    /// Always carries `timestamp` and `eventId`
    pub metadata: Map<String, Value>,
}

impl Event {
    /// Create an event with fresh metadata.
    pub fn new(event_type: impl Into<String>, data: Map<String, Value>) -> Self {
        Self::with_metadata(event_type, data, Map::new())
    }

    /// Create an event, filling in `timestamp` and `eventId` if absent.
    pub fn with_metadata(
        event_type: impl Into<String>,
        data: Map<String, Value>,
        mut metadata: Map<String, Value>,
    ) -> Self {
        metadata
            .entry("timestamp")
            .or_insert_with(|| Value::String(chrono::Utc::now().to_rfc3339()));
        metadata
            .entry("eventId")
            .or_insert_with(|| Value::String(uuid::Uuid::new_v4().to_string()));
        Self { event_type: event_type.into(), data, metadata }
    }

    /// String field from the payload.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// A topic document was created or reset.
    pub fn workflow_initialized(topic: &str) -> Self {
        Self::new(event_types::WORKFLOW_INITIALIZED, payload(json!({ "topic": topic })))
    }

    /// Work began on a freshly initialized topic.
    pub fn workflow_started(topic: &str, total_steps: usize) -> Self {
        Self::new(
            event_types::WORKFLOW_STARTED,
            payload(json!({ "topic": topic, "totalSteps": total_steps })),
        )
    }

    /// The last phase of a topic completed.
    pub fn workflow_completed(topic: &str) -> Self {
        Self::new(event_types::WORKFLOW_COMPLETED, payload(json!({ "topic": topic })))
    }

    /// A phase moved to in progress.
    pub fn phase_started(topic: &str, phase_id: &str) -> Self {
        Self::new(event_types::PHASE_STARTED, payload(json!({ "topic": topic, "phaseId": phase_id })))
    }

    /// Every step of a phase completed.
    pub fn phase_completed(topic: &str, phase_id: &str) -> Self {
        Self::new(
            event_types::PHASE_COMPLETED,
            payload(json!({ "topic": topic, "phaseId": phase_id })),
        )
    }

    /// A step moved to in progress.
    pub fn step_started(topic: &str, phase_id: &str, step_id: &str) -> Self {
        Self::new(
            event_types::STEP_STARTED,
            payload(json!({ "topic": topic, "phaseId": phase_id, "stepId": step_id })),
        )
    }

    /// A step passed its criteria and completed; carries the result.
    pub fn step_completed(
        topic: &str,
        phase_id: &str,
        step_id: &str,
        result: &Map<String, Value>,
    ) -> Self {
        Self::new(
            event_types::STEP_COMPLETED,
            payload(json!({
                "topic": topic,
                "phaseId": phase_id,
                "stepId": step_id,
                "result": result,
            })),
        )
    }

    /// A step failed; carries the error message.
    pub fn step_failed(topic: &str, phase_id: &str, step_id: &str, error: &str) -> Self {
        Self::new(
            event_types::STEP_FAILED,
            payload(json!({
                "topic": topic,
                "phaseId": phase_id,
                "stepId": step_id,
                "error": error,
            })),
        )
    }
}

fn payload(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Handler callback.
pub type HandlerFn = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Handler filter predicate.
pub type FilterFn = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// A subscribed callback.
#[derive(Clone)]
pub struct EventHandler {
    id: String,
    callback: HandlerFn,
    filter: Option<FilterFn>,
    priority: i32,
}

impl fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandler")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

impl EventHandler {
    /// Create a handler with priority 0 and no filter.
    pub fn new<F>(id: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self { id: id.into(), callback: Arc::new(callback), filter: None, priority: 0 }
    }

    /// Only handle events for which `filter` returns true.
    #[must_use]
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Set the priority (higher runs first).
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub(crate) fn with_filter_fn(mut self, filter: Option<FilterFn>) -> Self {
        self.filter = filter;
        self
    }

    /// Handler id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Handler priority.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    fn should_handle(&self, event: &Event) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }
}

/// Bus statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBusStats {
    /// Whether events are dispatched
    pub enabled: bool,
    /// Subscribed handlers across all event types
    pub total_handlers: usize,
    /// Event types with at least one handler
    pub event_types: Vec<String>,
    /// Events currently retained
    pub history_size: usize,
    /// History capacity
    pub max_history: usize,
    /// Events emitted since creation
    pub events_emitted: u64,
    /// Handler errors and panics caught
    pub handler_failures: u64,
}

/// Synchronous event bus with bounded history.
pub struct EventBus {
    handlers: RwLock<HashMap<String, Vec<EventHandler>>>,
    history: Mutex<VecDeque<Event>>,
    max_history: usize,
    enabled: AtomicBool,
    emitted: AtomicU64,
    failures: AtomicU64,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("enabled", &self.is_enabled())
            .field("max_history", &self.max_history)
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl EventBus {
    /// Create a bus that keeps the last `max_history` events.
    pub fn new(max_history: usize) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::with_capacity(max_history.min(DEFAULT_HISTORY_CAPACITY))),
            max_history,
            enabled: AtomicBool::new(true),
            emitted: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Subscribe a handler. Returns false, with a warning, if a handler with
    /// the same id is already subscribed to `event_type`.
    pub fn subscribe(&self, event_type: &str, handler: EventHandler) -> bool {
        let mut handlers = self.handlers.write();
        let list = handlers.entry(event_type.to_string()).or_default();

        if list.iter().any(|h| h.id == handler.id) {
            tracing::warn!(handler = %handler.id, event_type, "Handler already subscribed");
            return false;
        }

        list.push(handler);
        list.sort_by(|a, b| b.priority.cmp(&a.priority));
        true
    }

    /// Remove a handler. Returns whether one was removed.
    pub fn unsubscribe(&self, event_type: &str, handler_id: &str) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(event_type) else {
            return false;
        };
        let before = list.len();
        list.retain(|h| h.id != handler_id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(event_type);
        }
        removed
    }

    /// Record an event and dispatch it to matching handlers.
    pub fn emit(&self, event: Event) {
        if !self.is_enabled() {
            return;
        }

        self.emitted.fetch_add(1, Ordering::Relaxed);
        if self.max_history > 0 {
            let mut history = self.history.lock();
            if history.len() >= self.max_history {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        // Snapshot so handlers may subscribe or emit without deadlocking
        let handlers = self.handlers.read().get(&event.event_type).cloned().unwrap_or_default();

        for handler in handlers {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                if handler.should_handle(&event) {
                    (handler.callback)(&event)
                } else {
                    Ok(())
                }
            }));

            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{e:#}"),
                Err(_) => "handler panicked".to_string(),
            };

            self.failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                handler = %handler.id,
                event_type = %event.event_type,
                error = %error,
                "Event handler failed"
            );
        }
    }

    /// Build and emit an event.
    pub fn emit_event(&self, event_type: &str, data: Map<String, Value>) {
        self.emit(Event::new(event_type, data));
    }

    /// Ids of the handlers subscribed to `event_type`, in dispatch order.
    pub fn handler_ids(&self, event_type: &str) -> Vec<String> {
        self.handlers
            .read()
            .get(event_type)
            .map(|list| list.iter().map(|h| h.id.clone()).collect())
            .unwrap_or_default()
    }

    /// Recorded events, most recent first.
    pub fn history(&self, event_type: Option<&str>, limit: Option<usize>) -> Vec<Event> {
        let history = self.history.lock();
        history
            .iter()
            .rev()
            .filter(|e| event_type.map_or(true, |t| e.event_type == t))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Forget recorded events.
    pub fn clear_history(&self) {
        self.history.lock().clear();
    }

    /// Resume dispatching.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    /// Stop dispatching and recording.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    /// Whether events are dispatched.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Current statistics.
    pub fn stats(&self) -> EventBusStats {
        let handlers = self.handlers.read();
        let mut event_types: Vec<String> = handlers.keys().cloned().collect();
        event_types.sort();

        EventBusStats {
            enabled: self.is_enabled(),
            total_handlers: handlers.values().map(Vec::len).sum(),
            event_types,
            history_size: self.history.lock().len(),
            max_history: self.max_history,
            events_emitted: self.emitted.load(Ordering::Relaxed),
            handler_failures: self.failures.load(Ordering::Relaxed),
        }
    }
}
