//! Execution statistics.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crate::graph::NodeId;

/// Receives execution statistics from graph executors.
///
/// All methods have no-op defaults.
pub trait StatisticsGatherer: Send + Sync {
    /// Called once per executed node.
    #[inline]
    fn node_executed(&self, _configuration: &str, _node: NodeId, _duration: Duration, _success: bool) {}

    /// Called once per executed graph.
    #[inline]
    fn graph_executed(&self, _configuration: &str, _nodes: usize, _duration: Duration) {}
}

/// Discards statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStatistics;

impl StatisticsGatherer for NoopStatistics {}

/// Counts executions.
#[derive(Debug, Default)]
pub struct CountingStatistics {
    nodes: AtomicUsize,
    failures: AtomicUsize,
    graphs: AtomicUsize,
    node_nanos: AtomicU64,
}

impl CountingStatistics {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Nodes executed.
    pub fn executed_nodes(&self) -> usize {
        self.nodes.load(Ordering::Relaxed)
    }

    /// Nodes whose execution failed.
    pub fn failed_nodes(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }

    /// Graphs executed.
    pub fn executed_graphs(&self) -> usize {
        self.graphs.load(Ordering::Relaxed)
    }

    /// Total time spent in node execution.
    pub fn node_time(&self) -> Duration {
        Duration::from_nanos(self.node_nanos.load(Ordering::Relaxed))
    }
}

impl StatisticsGatherer for CountingStatistics {
    fn node_executed(&self, _configuration: &str, _node: NodeId, duration: Duration, success: bool) {
        self.nodes.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.node_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    fn graph_executed(&self, _configuration: &str, _nodes: usize, _duration: Duration) {
        self.graphs.fetch_add(1, Ordering::Relaxed);
    }
}
