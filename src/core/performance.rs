//! Operation timing and I/O statistics.
//!
//! Tracks how long named operations take (step completion, state reads and
//! writes, lock waits) so callers can report on workflow overhead.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Aggregated timing statistics for one operation name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationStats {
    /// Number of recorded samples
    pub count: usize,
    /// Average duration in milliseconds
    pub avg_ms: f64,
    /// Fastest sample in milliseconds
    pub min_ms: f64,
    /// Slowest sample in milliseconds
    pub max_ms: f64,
}

impl OperationStats {
    /// Build statistics from a set of samples.
    pub fn from_samples(samples: &[Duration]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }

        let millis: Vec<f64> = samples.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
        let total: f64 = millis.iter().sum();
        let min = millis.iter().copied().fold(f64::INFINITY, f64::min);
        let max = millis.iter().copied().fold(0.0, f64::max);

        Self {
            count: millis.len(),
            avg_ms: round2(total / millis.len() as f64),
            min_ms: round2(min),
            max_ms: round2(max),
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Snapshot of everything the monitor has recorded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceReport {
    /// Number of document reads
    pub file_reads: u64,
    /// Number of document writes
    pub file_writes: u64,
    /// Total time spent reading, in milliseconds
    pub total_read_ms: f64,
    /// Total time spent writing, in milliseconds
    pub total_write_ms: f64,
    /// Number of lock acquisitions
    pub lock_acquisitions: u64,
    /// Total time spent waiting for locks, in milliseconds
    pub total_lock_wait_ms: f64,
    /// Per-operation timing statistics
    pub operations: HashMap<String, OperationStats>,
}

#[derive(Debug, Default)]
struct MonitorState {
    file_reads: u64,
    file_writes: u64,
    read_time: Duration,
    write_time: Duration,
    lock_acquisitions: u64,
    lock_wait: Duration,
    operations: HashMap<String, Vec<Duration>>,
}

/// Thread-safe performance monitor.
///
/// One instance is owned by the application and shared (via `Arc`) with the
/// state store and the workflow manager.
#[derive(Debug, Default)]
pub struct PerformanceMonitor {
    state: Mutex<MonitorState>,
}

impl PerformanceMonitor {
    /// Create an empty monitor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a document read.
    pub fn record_file_read(&self, duration: Duration) {
        let mut state = self.state.lock();
        state.file_reads += 1;
        state.read_time += duration;
    }

    /// Record a document write.
    pub fn record_file_write(&self, duration: Duration) {
        let mut state = self.state.lock();
        state.file_writes += 1;
        state.write_time += duration;
    }

    /// Record how long a lock acquisition waited.
    pub fn record_lock_wait(&self, wait: Duration) {
        let mut state = self.state.lock();
        state.lock_acquisitions += 1;
        state.lock_wait += wait;
    }

    /// Record a named operation's duration.
    pub fn record_operation(&self, operation: &str, duration: Duration) {
        self.state.lock().operations.entry(operation.to_string()).or_default().push(duration);
    }

    /// Statistics for a single operation, if any samples exist.
    pub fn operation_stats(&self, operation: &str) -> Option<OperationStats> {
        self.state.lock().operations.get(operation).map(|samples| OperationStats::from_samples(samples))
    }

    /// Build a full report.
    pub fn report(&self) -> PerformanceReport {
        let state = self.state.lock();
        PerformanceReport {
            file_reads: state.file_reads,
            file_writes: state.file_writes,
            total_read_ms: round2(state.read_time.as_secs_f64() * 1000.0),
            total_write_ms: round2(state.write_time.as_secs_f64() * 1000.0),
            lock_acquisitions: state.lock_acquisitions,
            total_lock_wait_ms: round2(state.lock_wait.as_secs_f64() * 1000.0),
            operations: state
                .operations
                .iter()
                .map(|(name, samples)| (name.clone(), OperationStats::from_samples(samples)))
                .collect(),
        }
    }

    /// Forget everything recorded so far.
    pub fn reset(&self) {
        *self.state.lock() = MonitorState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_stats_empty() {
        let stats = OperationStats::from_samples(&[]);
        assert_eq!(stats.count, 0);
        assert_eq!(stats.avg_ms, 0.0);
    }

    #[test]
    fn test_operation_stats_min_max_avg() {
        let samples =
            [Duration::from_millis(10), Duration::from_millis(20), Duration::from_millis(30)];
        let stats = OperationStats::from_samples(&samples);
        assert_eq!(stats.count, 3);
        assert_eq!(stats.min_ms, 10.0);
        assert_eq!(stats.max_ms, 30.0);
        assert_eq!(stats.avg_ms, 20.0);
    }

    #[test]
    fn test_monitor_records_operations() {
        let monitor = PerformanceMonitor::new();
        monitor.record_operation("complete_step", Duration::from_millis(5));
        monitor.record_operation("complete_step", Duration::from_millis(15));
        monitor.record_file_read(Duration::from_millis(1));
        monitor.record_file_write(Duration::from_millis(2));

        let stats = monitor.operation_stats("complete_step").unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.avg_ms, 10.0);

        let report = monitor.report();
        assert_eq!(report.file_reads, 1);
        assert_eq!(report.file_writes, 1);
        assert!(report.operations.contains_key("complete_step"));

        monitor.reset();
        assert!(monitor.operation_stats("complete_step").is_none());
    }
}
