//! Parallel graph execution module.
//!
//! Runs the levels of a [`DependencyGraph`] in sequence, executing every node
//! of a level concurrently on a bounded pool of worker threads, and
//! aggregates per-node results.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use super::graph::{DependencyGraph, GraphError};
use super::performance::OperationStats;

/// Default number of worker threads.
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// Errors that prevent a graph from being executed at all.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The executor was switched off.
    #[error("Parallel execution is disabled")]
    Disabled,

    /// The graph cannot be levelled.
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Outcome of a single node, sent from a worker to the coordinator.
#[derive(Debug)]
struct NodeOutcome {
    node: String,
    result: Result<Value, String>,
}

/// Result of executing a graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// True if no node failed
    pub success: bool,
    /// Nodes that finished successfully
    pub completed: Vec<String>,
    /// Nodes that returned an error or panicked
    pub failed: Vec<String>,
    /// Per-node values; failed nodes map to `{"error": "..."}`
    pub results: BTreeMap<String, Value>,
    /// Wall-clock duration of the whole run
    pub duration_seconds: f64,
    /// Levels that were started (including a failing one)
    pub levels_executed: usize,
    /// Levels the graph was split into
    pub total_levels: usize,
}

impl ExecutionReport {
    /// Nodes never started because an earlier level failed.
    pub fn skipped(&self, graph: &DependencyGraph) -> Vec<String> {
        graph
            .nodes()
            .iter()
            .filter(|node| !self.results.contains_key(*node))
            .cloned()
            .collect()
    }
}

/// Executor statistics, accumulated across runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorStats {
    /// Whether the executor accepts work
    pub enabled: bool,
    /// Worker pool size
    pub max_workers: usize,
    /// Nodes that completed successfully
    pub total_executed: u64,
    /// Nodes that failed
    pub total_failed: u64,
    /// Nodes running right now
    pub currently_running: usize,
    /// Timing statistics over every node run
    pub timings: OperationStats,
    /// Most recent duration per node, in seconds
    pub per_node: BTreeMap<String, f64>,
}

#[derive(Debug, Default)]
struct ExecutorState {
    running: HashSet<String>,
    total_executed: u64,
    total_failed: u64,
    samples: Vec<Duration>,
    per_node: HashMap<String, Duration>,
}

/// Level-by-level parallel executor for dependency graphs.
#[derive(Debug)]
pub struct ParallelExecutor {
    /// Maximum number of concurrent workers
    max_workers: usize,
    /// Whether execution is allowed
    enabled: AtomicBool,
    /// Statistics and in-flight tracking
    state: Mutex<ExecutorState>,
}

impl Default for ParallelExecutor {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            enabled: AtomicBool::new(true),
            state: Mutex::new(ExecutorState::default()),
        }
    }
}

impl ParallelExecutor {
    /// Create a new parallel executor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker pool size.
    #[must_use]
    pub fn max_workers(mut self, max: usize) -> Self {
        self.max_workers = max.max(1);
        self
    }

    /// Worker pool size.
    pub fn worker_count(&self) -> usize {
        self.max_workers
    }

    /// Allow execution.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    /// Refuse execution until re-enabled.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    /// Whether execution is allowed.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Execute a graph without callbacks.
    pub fn execute_graph<F>(
        &self,
        graph: &DependencyGraph,
        executor_fn: F,
    ) -> Result<ExecutionReport, ExecutorError>
    where
        F: Fn(&str) -> anyhow::Result<Value> + Sync,
    {
        self.execute_graph_with(graph, executor_fn, |_, _| {}, |_, _| {})
    }

    /// Execute a graph, calling `on_complete` / `on_error` as nodes finish.
    ///
    /// Callbacks run on the calling thread as results arrive. Levels run
    /// strictly in order; if any node of a level fails, the remaining nodes
    /// of that level still finish but no later level is started.
    pub fn execute_graph_with<F, C, E>(
        &self,
        graph: &DependencyGraph,
        executor_fn: F,
        mut on_complete: C,
        mut on_error: E,
    ) -> Result<ExecutionReport, ExecutorError>
    where
        F: Fn(&str) -> anyhow::Result<Value> + Sync,
        C: FnMut(&str, &Value),
        E: FnMut(&str, &str),
    {
        if !self.is_enabled() {
            return Err(ExecutorError::Disabled);
        }

        let levels = graph.execution_levels()?;
        let total_levels = levels.len();
        let start = Instant::now();

        let mut completed = Vec::new();
        let mut failed = Vec::new();
        let mut results = BTreeMap::new();
        let mut levels_executed = 0;

        for (idx, level) in levels.iter().enumerate() {
            levels_executed = idx + 1;
            tracing::info!(level = idx + 1, total = total_levels, nodes = ?level, "Executing level");

            let mut level_failed = false;
            self.run_level(level, &executor_fn, |outcome| match outcome.result {
                Ok(value) => {
                    on_complete(&outcome.node, &value);
                    completed.push(outcome.node.clone());
                    results.insert(outcome.node, value);
                }
                Err(error) => {
                    level_failed = true;
                    tracing::warn!(node = %outcome.node, error = %error, "Node failed");
                    on_error(&outcome.node, &error);
                    failed.push(outcome.node.clone());
                    results.insert(outcome.node, json!({ "error": error }));
                }
            });

            if level_failed {
                tracing::warn!(level = idx + 1, "Stopping after failed level");
                break;
            }
        }

        completed.sort();
        failed.sort();

        Ok(ExecutionReport {
            success: failed.is_empty(),
            completed,
            failed,
            results,
            duration_seconds: start.elapsed().as_secs_f64(),
            levels_executed,
            total_levels,
        })
    }

    /// Run one level on the worker pool, handing each outcome to `handle`
    /// on the calling thread as it arrives.
    fn run_level<F, H>(&self, level: &BTreeSet<String>, executor_fn: &F, mut handle: H)
    where
        F: Fn(&str) -> anyhow::Result<Value> + Sync,
        H: FnMut(NodeOutcome),
    {
        let queue: Mutex<VecDeque<String>> = Mutex::new(level.iter().cloned().collect());
        let workers = self.max_workers.min(level.len()).max(1);
        let (tx, rx) = mpsc::channel::<NodeOutcome>();

        thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                scope.spawn(move || loop {
                    let next = queue.lock().pop_front();
                    let Some(node) = next else {
                        break;
                    };
                    let outcome = self.run_node(node, executor_fn);
                    if tx.send(outcome).is_err() {
                        break;
                    }
                });
            }

            // Drop the sender so the receiver ends when all workers are done
            drop(tx);
            for outcome in rx {
                handle(outcome);
            }
        });
    }

    /// Run a single node, recording timing whether it succeeds or not.
    fn run_node<F>(&self, node: String, executor_fn: &F) -> NodeOutcome
    where
        F: Fn(&str) -> anyhow::Result<Value> + Sync,
    {
        self.state.lock().running.insert(node.clone());
        let start = Instant::now();

        let result = match panic::catch_unwind(AssertUnwindSafe(|| executor_fn(node.as_str()))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(payload) => Err(panic_message(payload.as_ref())),
        };

        let duration = start.elapsed();
        {
            let mut state = self.state.lock();
            state.running.remove(&node);
            state.samples.push(duration);
            state.per_node.insert(node.clone(), duration);
            if result.is_ok() {
                state.total_executed += 1;
            } else {
                state.total_failed += 1;
            }
        }

        NodeOutcome { node, result }
    }

    /// Statistics accumulated across runs.
    pub fn stats(&self) -> ExecutorStats {
        let state = self.state.lock();
        ExecutorStats {
            enabled: self.is_enabled(),
            max_workers: self.max_workers,
            total_executed: state.total_executed,
            total_failed: state.total_failed,
            currently_running: state.running.len(),
            timings: OperationStats::from_samples(&state.samples),
            per_node: state
                .per_node
                .iter()
                .map(|(node, duration)| (node.clone(), duration.as_secs_f64()))
                .collect(),
        }
    }
}

/// Extract a readable message from a panic payload.
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn chain() -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        graph.add_edge("b", "a");
        graph.add_edge("c", "b");
        graph
    }

    #[test]
    fn test_parallel_executor_creation() {
        let executor = ParallelExecutor::new();
        assert_eq!(executor.worker_count(), DEFAULT_MAX_WORKERS);
        assert!(executor.is_enabled());
    }

    #[test]
    fn test_parallel_executor_builder() {
        let executor = ParallelExecutor::new().max_workers(0);
        assert_eq!(executor.worker_count(), 1);

        let executor = ParallelExecutor::new().max_workers(8);
        assert_eq!(executor.worker_count(), 8);
    }

    #[test]
    fn test_execute_empty() {
        let executor = ParallelExecutor::new();
        let report = executor.execute_graph(&DependencyGraph::new(), |_| Ok(json!(null))).unwrap();
        assert!(report.success);
        assert_eq!(report.total_levels, 0);
        assert_eq!(report.levels_executed, 0);
    }

    #[test]
    fn test_execute_chain_in_order() {
        let executor = ParallelExecutor::new();
        let order = Mutex::new(Vec::new());

        let report = executor
            .execute_graph(&chain(), |node| {
                order.lock().push(node.to_string());
                Ok(json!({ "node": node }))
            })
            .unwrap();

        assert!(report.success);
        assert_eq!(report.levels_executed, 3);
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
        assert_eq!(report.results["b"], json!({ "node": "b" }));
    }

    #[test]
    fn test_failure_stops_later_levels() {
        let executor = ParallelExecutor::new();
        let report = executor
            .execute_graph(&chain(), |node| {
                if node == "b" {
                    anyhow::bail!("boom");
                }
                Ok(json!(true))
            })
            .unwrap();

        assert!(!report.success);
        assert_eq!(report.completed, vec!["a"]);
        assert_eq!(report.failed, vec!["b"]);
        assert_eq!(report.levels_executed, 2);
        assert_eq!(report.total_levels, 3);
        assert_eq!(report.skipped(&chain()), vec!["c"]);
        assert_eq!(report.results["b"]["error"], json!("boom"));
    }

    #[test]
    fn test_sibling_runs_despite_failure() {
        let mut graph = DependencyGraph::new();
        graph.add_node("ok");
        graph.add_node("bad");

        let ran = AtomicUsize::new(0);
        let executor = ParallelExecutor::new();
        let report = executor
            .execute_graph(&graph, |node| {
                ran.fetch_add(1, Ordering::SeqCst);
                if node == "bad" {
                    anyhow::bail!("failed");
                }
                Ok(json!(1))
            })
            .unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 2);
        assert_eq!(report.completed, vec!["ok"]);
        assert_eq!(report.failed, vec!["bad"]);
    }

    #[test]
    fn test_panic_is_recorded_as_failure() {
        let mut graph = DependencyGraph::new();
        graph.add_node("explodes");

        let executor = ParallelExecutor::new();
        let report = executor.execute_graph(&graph, |_| panic!("kaboom")).unwrap();

        assert_eq!(report.failed, vec!["explodes"]);
        let message = report.results["explodes"]["error"].as_str().unwrap();
        assert!(message.contains("kaboom"));
    }

    #[test]
    fn test_disabled_executor_refuses() {
        let executor = ParallelExecutor::new();
        executor.disable();
        let err = executor.execute_graph(&chain(), |_| Ok(json!(null))).unwrap_err();
        assert!(matches!(err, ExecutorError::Disabled));

        executor.enable();
        assert!(executor.execute_graph(&chain(), |_| Ok(json!(null))).is_ok());
    }

    #[test]
    fn test_cycle_is_rejected_before_running() {
        let mut graph = DependencyGraph::new();
        graph.add_edge("a", "b");
        graph.add_edge("b", "a");

        let ran = AtomicUsize::new(0);
        let executor = ParallelExecutor::new();
        let err = executor
            .execute_graph(&graph, |_| {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(json!(null))
            })
            .unwrap_err();

        assert!(matches!(err, ExecutorError::Graph(_)));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_callbacks_and_stats() {
        let mut graph = DependencyGraph::new();
        graph.add_node("good");
        graph.add_node("bad");

        let executor = ParallelExecutor::new().max_workers(2);
        let mut completed = Vec::new();
        let mut errors = Vec::new();

        executor
            .execute_graph_with(
                &graph,
                |node| if node == "bad" { Err(anyhow::anyhow!("nope")) } else { Ok(json!(1)) },
                |node, _| completed.push(node.to_string()),
                |node, error| errors.push((node.to_string(), error.to_string())),
            )
            .unwrap();

        assert_eq!(completed, vec!["good"]);
        assert_eq!(errors, vec![("bad".to_string(), "nope".to_string())]);

        let stats = executor.stats();
        assert_eq!(stats.total_executed, 1);
        assert_eq!(stats.total_failed, 1);
        assert_eq!(stats.currently_running, 0);
        assert_eq!(stats.timings.count, 2);
        assert!(stats.per_node.contains_key("bad"));
    }
}
