//! Hooks: named actions bound to event types.
//!
//! A [`Hook`] subscribes to one event type and runs a list of actions from
//! the [`ActionRegistry`] when it fires, optionally throttled so it runs at
//! most once per interval.

use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::bus::{Event, EventBus, EventHandler, FilterFn};
use crate::core::HooksConfig;

/// Action callback.
pub type ActionFn = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Limits how often a hook may run.
#[derive(Debug)]
pub struct HookThrottler {
    interval: Duration,
    last_execution: Mutex<HashMap<String, Instant>>,
}

impl HookThrottler {
    /// Allow at most one run per `interval` for each hook id.
    pub fn new(interval: Duration) -> Self {
        Self { interval, last_execution: Mutex::new(HashMap::new()) }
    }

    /// Returns true, and records the run, if `hook_id` is not throttled.
    pub fn should_execute(&self, hook_id: &str) -> bool {
        let mut last = self.last_execution.lock();
        let now = Instant::now();

        match last.get(hook_id) {
            Some(previous) if now.duration_since(*previous) < self.interval => false,
            _ => {
                last.insert(hook_id.to_string(), now);
                true
            }
        }
    }

    /// Forget the last run of one hook, or of every hook.
    pub fn reset(&self, hook_id: Option<&str>) {
        let mut last = self.last_execution.lock();
        match hook_id {
            Some(id) => {
                last.remove(id);
            }
            None => last.clear(),
        }
    }
}

/// A set of actions run when an event type fires.
pub struct Hook {
    id: String,
    event_type: String,
    actions: Vec<String>,
    enabled: AtomicBool,
    throttle_seconds: Option<u64>,
    throttler: Option<HookThrottler>,
    filter: Option<FilterFn>,
    priority: i32,
    execution_count: AtomicU64,
    last_execution: Mutex<Option<DateTime<Utc>>>,
}

impl std::fmt::Debug for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hook")
            .field("id", &self.id)
            .field("event_type", &self.event_type)
            .field("actions", &self.actions)
            .field("throttle_seconds", &self.throttle_seconds)
            .field("priority", &self.priority)
            .finish()
    }
}

impl Hook {
    /// Create an enabled, unthrottled hook.
    pub fn new(id: impl Into<String>, event_type: impl Into<String>, actions: Vec<String>) -> Self {
        Self {
            id: id.into(),
            event_type: event_type.into(),
            actions,
            enabled: AtomicBool::new(true),
            throttle_seconds: None,
            throttler: None,
            filter: None,
            priority: 0,
            execution_count: AtomicU64::new(0),
            last_execution: Mutex::new(None),
        }
    }

    /// Run at most once every `seconds`. Zero disables throttling.
    #[must_use]
    pub fn throttle(mut self, seconds: u64) -> Self {
        self.throttle_seconds = (seconds > 0).then_some(seconds);
        self.throttler = self.throttle_seconds.map(|s| HookThrottler::new(Duration::from_secs(s)));
        self
    }

    /// Only fire for events matching `filter`.
    #[must_use]
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Bus priority of the hook's handler.
    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Start enabled or disabled.
    #[must_use]
    pub fn enabled(self, enabled: bool) -> Self {
        self.enabled.store(enabled, Ordering::SeqCst);
        self
    }

    /// Hook id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Event type the hook listens to.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Whether the hook will run.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn handler_id(&self) -> String {
        format!("hook-{}", self.id)
    }

    fn matches(&self, event: &Event) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }

    /// Run the actions, honouring the throttle unless `bypass_throttle`.
    /// Returns whether the actions ran.
    fn execute(&self, event: &Event, registry: &ActionRegistry, bypass_throttle: bool) -> bool {
        if !self.is_enabled() {
            return false;
        }
        if !bypass_throttle {
            if let Some(throttler) = &self.throttler {
                if !throttler.should_execute(&self.id) {
                    tracing::debug!(hook = %self.id, "Hook throttled");
                    return false;
                }
            }
        }

        self.execution_count.fetch_add(1, Ordering::Relaxed);
        *self.last_execution.lock() = Some(Utc::now());

        for action in &self.actions {
            if let Err(e) = registry.execute(action, event) {
                tracing::warn!(hook = %self.id, action = %action, error = %format!("{e:#}"), "Hook action failed");
            }
        }
        true
    }

    /// Snapshot of this hook's counters.
    pub fn stats(&self) -> HookStats {
        HookStats {
            hook_id: self.id.clone(),
            event_type: self.event_type.clone(),
            enabled: self.is_enabled(),
            execution_count: self.execution_count.load(Ordering::Relaxed),
            last_execution: *self.last_execution.lock(),
            throttle_seconds: self.throttle_seconds,
            actions: self.actions.clone(),
        }
    }
}

/// Per-hook statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookStats {
    /// Hook id
    pub hook_id: String,
    /// Event type the hook listens to
    pub event_type: String,
    /// Whether the hook fires
    pub enabled: bool,
    /// Times the actions ran
    pub execution_count: u64,
    /// When the actions last ran
    pub last_execution: Option<DateTime<Utc>>,
    /// Minimum seconds between runs
    pub throttle_seconds: Option<u64>,
    /// Action names, in run order
    pub actions: Vec<String>,
}

/// Named actions hooks can run.
#[derive(Default)]
pub struct ActionRegistry {
    actions: RwLock<HashMap<String, ActionFn>>,
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry").field("actions", &self.available()).finish()
    }
}

impl ActionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace an action.
    pub fn register<F>(&self, name: impl Into<String>, action: F)
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.actions.write().insert(name.into(), Arc::new(action));
    }

    /// Remove an action.
    pub fn unregister(&self, name: &str) -> bool {
        self.actions.write().remove(name).is_some()
    }

    /// Run an action. Unknown actions are logged and skipped.
    pub fn execute(&self, name: &str, event: &Event) -> anyhow::Result<()> {
        let Some(action) = self.actions.read().get(name).cloned() else {
            tracing::warn!(action = name, "Action not registered");
            return Ok(());
        };

        match panic::catch_unwind(AssertUnwindSafe(|| action(event))) {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("action '{name}' panicked")),
        }
    }

    /// Registered action names, sorted.
    pub fn available(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actions.read().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Hooks manager statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HooksStats {
    /// Master switch
    pub enabled: bool,
    /// Installed hooks
    pub total_hooks: usize,
    /// Installed hooks that are enabled
    pub enabled_hooks: usize,
    /// Registered action names
    pub available_actions: Vec<String>,
    /// Per-hook statistics keyed by id
    pub hooks: BTreeMap<String, HookStats>,
}

/// Owns hooks and wires them onto an [`EventBus`].
pub struct HooksManager {
    bus: Arc<EventBus>,
    registry: Arc<ActionRegistry>,
    hooks: RwLock<HashMap<String, Arc<Hook>>>,
    enabled: Arc<AtomicBool>,
}

impl std::fmt::Debug for HooksManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HooksManager")
            .field("enabled", &self.is_enabled())
            .field("hooks", &self.hooks.read().len())
            .finish()
    }
}

impl HooksManager {
    /// Create a manager with the default actions registered.
    pub fn new(bus: Arc<EventBus>) -> Self {
        let manager = Self {
            bus,
            registry: Arc::new(ActionRegistry::new()),
            hooks: RwLock::new(HashMap::new()),
            enabled: Arc::new(AtomicBool::new(true)),
        };
        manager.register_default_actions();
        manager
    }

    fn register_default_actions(&self) {
        self.registry.register("log_to_audit", |event| {
            let data = Value::Object(event.data.clone());
            tracing::info!(
                target: "topicflow::audit",
                event_type = %event.event_type,
                data = %data,
                "Workflow event"
            );
            Ok(())
        });
        self.registry.register("update_workflow_state", |event| {
            tracing::debug!(event_type = %event.event_type, topic = ?event.data_str("topic"), "Updating workflow state");
            Ok(())
        });
        self.registry.register("mark_step_complete", |event| {
            tracing::debug!(step = ?event.data_str("stepId"), "Step completed");
            Ok(())
        });
        self.registry.register("check_next_step", |event| {
            tracing::debug!(after = ?event.data_str("stepId"), "Checking next step");
            Ok(())
        });
    }

    /// Register a custom action.
    pub fn register_action<F>(&self, name: impl Into<String>, action: F)
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.registry.register(name, action);
    }

    /// The action registry.
    pub fn actions(&self) -> &ActionRegistry {
        &self.registry
    }

    /// Install a hook, replacing any hook with the same id.
    pub fn add_hook(&self, hook: Hook) {
        self.remove_hook(hook.id());

        let hook = Arc::new(hook);
        let handler = {
            let handler_id = hook.handler_id();
            let priority = hook.priority;
            let filter = hook.filter.clone();
            let hook = Arc::clone(&hook);
            let registry = Arc::clone(&self.registry);
            let enabled = Arc::clone(&self.enabled);
            EventHandler::new(handler_id, move |event| {
                if enabled.load(Ordering::SeqCst) {
                    hook.execute(event, &registry, false);
                }
                Ok(())
            })
            .with_priority(priority)
            .with_filter_fn(filter)
        };

        self.bus.subscribe(hook.event_type(), handler);
        self.hooks.write().insert(hook.id().to_string(), hook);
    }

    /// Uninstall a hook.
    pub fn remove_hook(&self, hook_id: &str) -> bool {
        let Some(hook) = self.hooks.write().remove(hook_id) else {
            return false;
        };
        self.bus.unsubscribe(hook.event_type(), &hook.handler_id());
        true
    }

    /// Enable a hook. Returns false if it does not exist.
    pub fn enable_hook(&self, hook_id: &str) -> bool {
        self.set_hook_enabled(hook_id, true)
    }

    /// Disable a hook. Returns false if it does not exist.
    pub fn disable_hook(&self, hook_id: &str) -> bool {
        self.set_hook_enabled(hook_id, false)
    }

    fn set_hook_enabled(&self, hook_id: &str, enabled: bool) -> bool {
        match self.hooks.read().get(hook_id) {
            Some(hook) => {
                hook.enabled.store(enabled, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Install one hook per enabled event entry. A disabled `[hooks]`
    /// section disables the manager instead.
    pub fn load_from_config(&self, config: &HooksConfig) {
        if !config.enabled {
            self.disable();
            return;
        }

        for (event_type, event_config) in &config.events {
            if !event_config.enabled {
                continue;
            }
            let hook = Hook::new(event_type.clone(), event_type.clone(), event_config.actions.clone())
                .throttle(event_config.throttle_seconds.unwrap_or(0))
                .priority(event_config.priority);
            self.add_hook(hook);
        }
    }

    /// Run a hook's actions now, bypassing its throttle. Returns whether the
    /// actions ran.
    pub fn trigger(&self, hook_id: &str, event: &Event) -> bool {
        let Some(hook) = self.hooks.read().get(hook_id).cloned() else {
            tracing::warn!(hook = hook_id, "Cannot trigger unknown hook");
            return false;
        };
        if !self.is_enabled() || !hook.matches(event) {
            return false;
        }
        hook.execute(event, &self.registry, true)
    }

    /// Resume running hooks.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    /// Stop running hooks; subscriptions stay in place.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    /// Whether hooks run.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Current statistics.
    pub fn stats(&self) -> HooksStats {
        let hooks = self.hooks.read();
        HooksStats {
            enabled: self.is_enabled(),
            total_hooks: hooks.len(),
            enabled_hooks: hooks.values().filter(|h| h.is_enabled()).count(),
            available_actions: self.registry.available(),
            hooks: hooks.iter().map(|(id, hook)| (id.clone(), hook.stats())).collect(),
        }
    }
}
