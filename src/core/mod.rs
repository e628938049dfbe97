//! Core types and functionality for Topicflow.
//!
//! This module contains the leaf utilities the workflow layer is built on:
//! configuration, dependency graphs, parallel execution, caching, and
//! timing statistics.

mod cache;
mod config;
mod graph;
mod parallel;
mod performance;

pub use cache::{CacheStats, WorkflowCache, DEFAULT_TTL};
pub use config::{
    CacheConfig, Config, EventsConfig, ExecutorConfig, GeneralConfig, HookEventConfig,
    HooksConfig, LOCAL_CONFIG_FILE,
};
pub use graph::{DependencyGraph, GraphError};
pub use parallel::{
    ExecutionReport, ExecutorError, ExecutorStats, ParallelExecutor, DEFAULT_MAX_WORKERS,
};
pub use performance::{OperationStats, PerformanceMonitor, PerformanceReport};
