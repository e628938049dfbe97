//! Application wiring.
//!
//! `App` is the composition root: it builds one instance of every service
//! from a [`Config`] and hands out references. Nothing in the crate keeps
//! global state.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::Value;

use crate::core::{
    Config, DependencyGraph, ExecutionReport, ExecutorError, ParallelExecutor, PerformanceMonitor,
    WorkflowCache,
};
use crate::events::{EventBus, HooksManager};
use crate::workflow::{WorkflowDefinition, WorkflowManager};

/// Every service of one topicflow session.
#[derive(Debug)]
pub struct App {
    /// Configuration the services were built from
    pub config: Config,

    /// Event bus shared by the workflow manager and hooks
    pub bus: Arc<EventBus>,

    /// Read cache for workflow documents
    pub cache: Arc<WorkflowCache>,

    /// Timing statistics
    pub monitor: Arc<PerformanceMonitor>,

    /// Hooks bound to the bus
    pub hooks: HooksManager,

    /// The workflow state machine
    pub workflow: WorkflowManager,

    /// Executor for definition dependency graphs
    pub executor: ParallelExecutor,
}

impl App {
    /// Build an app from the configuration found on disk.
    pub fn new() -> anyhow::Result<Self> {
        Self::from_config(Config::load()?)
    }

    /// Build an app from an explicit configuration.
    ///
    /// The workflow definition is optional; a definition that exists but
    /// cannot be parsed is an error.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let bus = Arc::new(EventBus::new(config.events.history_capacity));
        if !config.events.enabled {
            bus.disable();
        }

        let cache = Arc::new(WorkflowCache::new(Duration::from_secs(config.cache.ttl_seconds)));
        if !config.cache.enabled {
            cache.disable();
        }

        let monitor = Arc::new(PerformanceMonitor::new());

        let hooks = HooksManager::new(Arc::clone(&bus));
        hooks.load_from_config(&config.hooks);

        let mut workflow =
            WorkflowManager::new(config.topics_dir(), Arc::clone(&bus), Arc::clone(&monitor))
                .with_document_name(config.general.document_name.clone())
                .with_cache(Arc::clone(&cache));

        let definition_path = config.definition_path();
        if definition_path.is_file() {
            let definition = WorkflowDefinition::load(&definition_path).with_context(|| {
                format!("Failed to load workflow definition {}", definition_path.display())
            })?;
            workflow = workflow.with_definition(definition);
        } else {
            tracing::debug!(path = ?definition_path, "No workflow definition found");
        }

        let executor = ParallelExecutor::new().max_workers(config.executor.max_workers);
        if !config.executor.enabled {
            executor.disable();
        }

        Ok(Self { config, bus, cache, monitor, hooks, workflow, executor })
    }

    /// The loaded workflow definition.
    pub fn definition(&self) -> anyhow::Result<&WorkflowDefinition> {
        self.workflow.definition().ok_or_else(|| {
            anyhow::anyhow!(
                "No workflow definition at {}",
                self.config.definition_path().display()
            )
        })
    }

    /// Step dependency graph of the loaded definition.
    pub fn dependency_graph(&self) -> anyhow::Result<DependencyGraph> {
        Ok(self.definition()?.dependency_graph())
    }

    /// Batches of steps that may run concurrently, in order.
    pub fn plan(&self) -> anyhow::Result<Vec<BTreeSet<String>>> {
        Ok(self.dependency_graph()?.execution_levels()?)
    }

    /// Run `executor_fn` over every step of the definition, level by level.
    pub fn execute_definition<F>(&self, executor_fn: F) -> anyhow::Result<ExecutionReport>
    where
        F: Fn(&str) -> anyhow::Result<Value> + Sync,
    {
        let graph = self.dependency_graph()?;
        let report = self.executor.execute_graph(&graph, executor_fn).map_err(|e| match e {
            ExecutorError::Disabled => anyhow::anyhow!("Parallel execution is disabled in config"),
            other => other.into(),
        })?;
        Ok(report)
    }
}
