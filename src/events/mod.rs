//! In-process events and hooks.
//!
//! The workflow manager emits [`Event`]s on an [`EventBus`]; hooks bind
//! named actions to event types.

mod bus;
mod hooks;

pub use bus::{
    event_types, Event, EventBus, EventBusStats, EventHandler, FilterFn, HandlerFn,
    DEFAULT_HISTORY_CAPACITY,
};
pub use hooks::{ActionFn, ActionRegistry, Hook, HookStats, HookThrottler, HooksManager, HooksStats};
