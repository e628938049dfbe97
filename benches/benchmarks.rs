//! Performance benchmarks for Topicflow.
//!
//! This module contains benchmarks for:
//! - Execution level computation on layered graphs
//! - Completion criteria evaluation
//! - Atomic document writes
//!
//! Run with: `cargo bench`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::{json, Map, Value};
use tempfile::TempDir;

use topicflow::core::DependencyGraph;
use topicflow::workflow::{CriteriaEvaluator, StateStore, WorkflowDefinition};

// ============================================================================
// Fixtures
// ============================================================================

mod fixtures {
    use super::*;

    /// `layers` levels of `width` nodes, each depending on two nodes of the
    /// previous level.
    pub fn layered_graph(layers: usize, width: usize) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for layer in 0..layers {
            for i in 0..width {
                let node = format!("l{layer}-n{i}");
                graph.add_node(node.clone());
                if layer > 0 {
                    graph.add_edge(node.clone(), format!("l{}-n{}", layer - 1, i));
                    graph.add_edge(node, format!("l{}-n{}", layer - 1, (i + 1) % width));
                }
            }
        }
        graph
    }

    pub fn context() -> Map<String, Value> {
        match json!({
            "files": 42,
            "coverage": 87.5,
            "status": "green",
            "tests_passed": true,
            "blocked": false
        }) {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    pub fn definition(phases: usize, steps: usize) -> WorkflowDefinition {
        let phases: Vec<Value> = (0..phases)
            .map(|p| {
                let steps: Vec<Value> = (0..steps).map(|s| json!({ "id": format!("p{p}-s{s}") })).collect();
                json!({ "id": format!("p{p}"), "order": p + 1, "steps": steps })
            })
            .collect();
        let raw = json!({ "workflow": { "phases": phases } }).to_string();
        WorkflowDefinition::from_json_str(&raw).unwrap()
    }
}

// ============================================================================
// Graph Benchmarks
// ============================================================================

fn bench_execution_levels(c: &mut Criterion) {
    let mut group = c.benchmark_group("execution_levels");

    for (layers, width) in [(5, 10), (10, 50), (20, 100)] {
        let graph = fixtures::layered_graph(layers, width);
        group.throughput(Throughput::Elements((layers * width) as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{layers}x{width}")),
            &graph,
            |b, graph| b.iter(|| black_box(graph.execution_levels().unwrap())),
        );
    }

    group.finish();
}

fn bench_topological_order(c: &mut Criterion) {
    let graph = fixtures::layered_graph(20, 100);
    c.bench_function("topological_order_2000", |b| {
        b.iter(|| black_box(graph.topological_order().unwrap()));
    });
}

// ============================================================================
// Criteria Benchmarks
// ============================================================================

fn bench_criteria(c: &mut Criterion) {
    let context = fixtures::context();
    let mut group = c.benchmark_group("criteria");

    for criterion in ["tests_passed", "not blocked", "files > 10", "coverage >= 80.0", "status == 'green'"] {
        group.bench_with_input(BenchmarkId::from_parameter(criterion), &criterion, |b, criterion| {
            b.iter(|| black_box(CriteriaEvaluator::evaluate(criterion, &context)));
        });
    }

    let all = ["tests_passed", "not blocked", "files > 10", "coverage >= 80.0", "status == 'green'"];
    group.bench_function("evaluate_all", |b| {
        b.iter(|| black_box(CriteriaEvaluator::evaluate_all(&all, &context)));
    });

    group.finish();
}

// ============================================================================
// Store Benchmarks
// ============================================================================

fn bench_atomic_save(c: &mut Criterion) {
    let temp = TempDir::new().unwrap();
    let store = StateStore::default();
    let mut group = c.benchmark_group("atomic_save");

    for steps in [10, 100] {
        let doc = fixtures::definition(5, steps).instantiate(chrono::Utc::now());
        let path = temp.path().join(format!("topic-{steps}.json"));
        group.bench_with_input(BenchmarkId::from_parameter(steps * 5), &doc, |b, doc| {
            b.iter(|| store.save(&path, doc).unwrap());
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_execution_levels,
    bench_topological_order,
    bench_criteria,
    bench_atomic_save
);
criterion_main!(benches);
