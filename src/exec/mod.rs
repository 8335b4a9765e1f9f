//! Computation cycle execution.
//!
//! A [`SingleComputationCycle`] loads market data into per-configuration
//! caches, optionally copies forward unchanged results from the previous
//! cycle, and hands the remaining executable subgraph of each configuration
//! to a [`GraphExecutor`]. Results stream back through a bounded queue to a
//! dedicated thread that records node states and notifies the
//! [`ResultListener`].

mod blacklist;
mod cycle;
mod delta;
mod executor;
mod log;
mod results;
mod statistics;

use std::fmt;

use papaya::HashMap;

use crate::graph::NodeId;
use crate::value::ValueSpecification;

pub use blacklist::{EmptyBlacklist, FunctionBlacklistQuery, FunctionIdBlacklist};
pub use cycle::{CycleInterruptHandle, SingleComputationCycle};
pub use delta::DeltaCalculator;
pub use executor::{
    ExecutionHandle, ExecutionRequest, ExecutionResult, GraphExecutor, LocalGraphExecutor,
};
pub use log::{
    ExecutionLog, ExecutionLogMode, ExecutionLogModeSource, FullLogForOutputs, LogEvent, LogLevel,
};
pub use results::{
    ChannelResultListener, ResultCollector, ResultEvent, ResultFragment, ResultListener,
    ResultModel,
};
pub use statistics::{CountingStatistics, NoopStatistics, StatisticsGatherer};

/// Lifecycle of a computation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CycleState {
    /// Created, not yet executing.
    AwaitingExecution,
    /// Executing.
    Executing,
    /// Every configuration finished.
    Executed,
    /// Execution was cancelled before finishing.
    ExecutionInterrupted,
    /// Resources released. Terminal.
    Destroyed,
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CycleState::AwaitingExecution => "AWAITING_EXECUTION",
            CycleState::Executing => "EXECUTING",
            CycleState::Executed => "EXECUTED",
            CycleState::ExecutionInterrupted => "EXECUTION_INTERRUPTED",
            CycleState::Destroyed => "DESTROYED",
        };
        f.write_str(s)
    }
}

/// What happened to a node in this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeStateFlag {
    /// Outputs are in the cache (computed, loaded or copied forward).
    Executed,
    /// Execution ran but outputs are sentinels.
    Failed,
    /// Execution was skipped and outputs are suppressed sentinels.
    Suppressed,
}

/// Per-configuration node states, written concurrently by the
/// result-streaming thread.
pub struct NodeStates {
    states: HashMap<NodeId, NodeStateFlag, ahash::RandomState>,
}

impl Default for NodeStates {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NodeStates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeStates")
            .field("len", &self.len())
            .finish()
    }
}

impl NodeStates {
    /// Create an empty state map.
    pub fn new() -> Self {
        Self {
            states: HashMap::with_hasher(ahash::RandomState::new()),
        }
    }

    /// State of `node`, if determined.
    pub fn get(&self, node: NodeId) -> Option<NodeStateFlag> {
        self.states.pin().get(&node).copied()
    }

    /// Record the state of `node`.
    pub fn set(&self, node: NodeId, state: NodeStateFlag) {
        self.states.pin().insert(node, state);
    }

    /// Number of nodes with a determined state.
    pub fn len(&self) -> usize {
        self.states.pin().len()
    }

    /// Returns `true` if no node state is determined.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Nodes currently in `state`.
    pub fn nodes_in(&self, state: NodeStateFlag) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .states
            .pin()
            .iter()
            .filter(|(_, s)| **s == state)
            .map(|(id, _)| *id)
            .collect();
        nodes.sort();
        nodes
    }
}

/// Execution log and diagnostics behind one cached output.
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    /// The producing node.
    pub node: NodeId,
    /// Its execution log.
    pub log: ExecutionLog,
    /// Inputs that were not-calculated sentinels.
    pub missing_inputs: Vec<ValueSpecification>,
}

/// Per-configuration job results keyed by output specification.
pub struct JobResultCache {
    entries: HashMap<ValueSpecification, JobResult, ahash::RandomState>,
}

impl Default for JobResultCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for JobResultCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobResultCache")
            .field("len", &self.len())
            .finish()
    }
}

impl JobResultCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            entries: HashMap::with_hasher(ahash::RandomState::new()),
        }
    }

    /// Job result behind `spec`.
    pub fn get(&self, spec: &ValueSpecification) -> Option<JobResult> {
        self.entries.pin().get(spec).cloned()
    }

    /// Record the job result behind `spec`.
    pub fn put(&self, spec: ValueSpecification, result: JobResult) {
        self.entries.pin().insert(spec, result);
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.pin().len()
    }

    /// Returns `true` if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
