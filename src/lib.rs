//! # Topicflow
//!
//! File-backed workflow orchestration for AI coding-assistant plugins.
//!
//! Each topic keeps its progress in one JSON document. Steps are started,
//! completed against their completion criteria, failed, and rolled back
//! through the [`WorkflowManager`]; every change is written atomically under
//! an advisory file lock and recorded in an append-only audit log.
//!
//! ## Features
//!
//! - **State machine**: phases of steps with dependency and criteria gates
//! - **Atomic store**: lock, write to a temp file, validate, rename
//! - **Dependency graphs**: topological order and parallel execution levels
//! - **Parallel executor**: level-by-level runs on a bounded worker pool
//! - **Events & hooks**: in-process pub/sub with throttled hook actions
//!
//! ## Quick Start
//!
//! ```bash
//! topicflow init my-topic
//! topicflow start my-topic scan
//! topicflow complete my-topic scan '{"files": 12}'
//! topicflow status my-topic
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow common patterns that are intentional in this codebase
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::derivable_impls)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::map_unwrap_or)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::missing_panics_doc)]

pub mod app;
pub mod core;
pub mod events;
pub mod workflow;

// Re-export commonly used types
pub use app::App;
pub use core::{Config, DependencyGraph, GraphError, ParallelExecutor};
pub use events::{Event, EventBus, EventHandler, Hook, HooksManager};
pub use workflow::{
    CriteriaEvaluator, StepCompletion, WorkflowDefinition, WorkflowDocument, WorkflowError,
    WorkflowManager, WorkflowResult,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "topicflow";

/// Short alias
pub const APP_ALIAS: &str = "tflow";
