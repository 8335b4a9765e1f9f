//! Graph execution scheduler interface and the in-process implementation.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use super::log::{ExecutionLog, ExecutionLogModeSource, LogLevel};
use super::statistics::StatisticsGatherer;
use crate::cache::{CacheValue, CycleId, NotCalculated, ResultCache};
use crate::error::ExecutionError;
use crate::function::FunctionInputs;
use crate::graph::{DependencyGraph, DependencyNode, NodeId};
use crate::value::{Value, ValueSpecification};

/// Everything a scheduler needs to execute one configuration's subgraph.
pub struct ExecutionRequest {
    /// Cycle being executed.
    pub cycle: CycleId,
    /// Calculation configuration name.
    pub configuration: String,
    /// Nodes to execute. Inputs produced outside this graph are already in `cache`.
    pub graph: DependencyGraph,
    /// Cache to read inputs from and write outputs to.
    pub cache: Arc<ResultCache>,
    /// Log detail per node.
    pub log_modes: Arc<dyn ExecutionLogModeSource>,
    /// Statistics sink.
    pub statistics: Arc<dyn StatisticsGatherer>,
    /// Result sink. One message per executed node, sent after its outputs are
    /// in the cache.
    pub results: SyncSender<ExecutionResult>,
}

/// Outcome of executing one node.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Calculation configuration name.
    pub configuration: String,
    /// The executed node.
    pub node: NodeId,
    /// Every output of the node, computed or sentinel.
    pub outputs: Vec<(ValueSpecification, CacheValue)>,
    /// Execution log.
    pub log: ExecutionLog,
    /// Inputs that were not-calculated sentinels.
    pub missing_inputs: Vec<ValueSpecification>,
    /// Returns `true` if the function did not run to completion.
    pub failed: bool,
}

/// Executes dependency graphs.
pub trait GraphExecutor: Send + Sync {
    /// Start executing `request.graph` and return immediately.
    fn execute(&self, request: ExecutionRequest) -> ExecutionHandle;
}

struct HandleInner {
    outcome: Mutex<Option<Result<(), ExecutionError>>>,
    done: Condvar,
    cancelled: AtomicBool,
}

/// Cancellable completion handle for one graph execution.
///
/// Cheap to clone - all data is behind an `Arc`.
#[derive(Clone)]
pub struct ExecutionHandle {
    inner: Arc<HandleInner>,
}

impl Default for ExecutionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("outcome", &*self.inner.outcome.lock())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl ExecutionHandle {
    /// Create an incomplete handle.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HandleInner {
                outcome: Mutex::new(None),
                done: Condvar::new(),
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    /// Complete the handle. The first outcome wins; returns `false` if the
    /// handle was already complete.
    pub fn complete(&self, outcome: Result<(), ExecutionError>) -> bool {
        let mut slot = self.inner.outcome.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        self.inner.done.notify_all();
        true
    }

    /// Request cancellation and complete the handle as cancelled.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.complete(Err(ExecutionError::Cancelled));
    }

    /// Returns `true` once [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Returns `true` once the handle is complete.
    pub fn is_done(&self) -> bool {
        self.inner.outcome.lock().is_some()
    }

    /// Wait up to `timeout` for completion.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<(), ExecutionError>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.inner.outcome.lock();
        while slot.is_none() {
            if self.inner.done.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        slot.clone()
    }

    /// Wait for completion.
    pub fn wait(&self) -> Result<(), ExecutionError> {
        let mut slot = self.inner.outcome.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            self.inner.done.wait(&mut slot);
        }
    }
}

/// Executes graphs on a rayon pool.
///
/// A node is spawned once every producer inside the graph has finished.
pub struct LocalGraphExecutor {
    pool: Arc<rayon::ThreadPool>,
}

impl LocalGraphExecutor {
    /// Create an executor running jobs on `pool`.
    pub fn new(pool: Arc<rayon::ThreadPool>) -> Self {
        Self { pool }
    }
}

impl GraphExecutor for LocalGraphExecutor {
    fn execute(&self, request: ExecutionRequest) -> ExecutionHandle {
        let handle = ExecutionHandle::new();
        let graph = &request.graph;
        if graph.is_empty() {
            handle.complete(Ok(()));
            return handle;
        }
        let remaining: HashMap<NodeId, AtomicUsize> = graph
            .nodes()
            .map(|(id, node)| {
                let producers = node
                    .input_nodes()
                    .into_iter()
                    .filter(|p| graph.contains(*p))
                    .count();
                (id, AtomicUsize::new(producers))
            })
            .collect();
        let mut ready: Vec<NodeId> = remaining
            .iter()
            .filter(|(_, count)| count.load(Ordering::Relaxed) == 0)
            .map(|(id, _)| *id)
            .collect();
        ready.sort();
        if ready.is_empty() {
            handle.complete(Err(ExecutionError::Fault(
                "graph has no node without producers".to_string(),
            )));
            return handle;
        }
        debug!(
            cycle = %request.cycle,
            configuration = %request.configuration,
            nodes = graph.len(),
            "executing graph"
        );
        let run = Arc::new(GraphRun {
            outstanding: AtomicUsize::new(graph.len()),
            remaining,
            handle: handle.clone(),
            started: Instant::now(),
            pool: Arc::clone(&self.pool),
            request,
        });
        for id in ready {
            run.spawn(id);
        }
        handle
    }
}

struct GraphRun {
    request: ExecutionRequest,
    remaining: HashMap<NodeId, AtomicUsize>,
    outstanding: AtomicUsize,
    handle: ExecutionHandle,
    started: Instant,
    pool: Arc<rayon::ThreadPool>,
}

impl GraphRun {
    fn spawn(self: &Arc<Self>, id: NodeId) {
        let run = Arc::clone(self);
        self.pool.spawn(move || run.run_node(id));
    }

    fn run_node(self: Arc<Self>, id: NodeId) {
        if self.handle.is_cancelled() {
            return;
        }
        let Some(node) = self.request.graph.node(id) else {
            return;
        };
        let started = Instant::now();
        let result = self.execute_node(id, node);
        self.request.cache.put_many(result.outputs.iter().cloned());
        self.request.statistics.node_executed(
            &self.request.configuration,
            id,
            started.elapsed(),
            !result.failed,
        );
        if self.handle.is_cancelled() {
            return;
        }
        if self.request.results.send(result).is_err() {
            error!(configuration = %self.request.configuration, "result queue closed");
            self.handle.complete(Err(ExecutionError::Fault(
                "result queue closed".to_string(),
            )));
            return;
        }
        for dependent in node.dependents() {
            if let Some(count) = self.remaining.get(dependent) {
                if count.fetch_sub(1, Ordering::AcqRel) == 1 {
                    self.spawn(*dependent);
                }
            }
        }
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            let elapsed = self.started.elapsed();
            self.request.statistics.graph_executed(
                &self.request.configuration,
                self.request.graph.len(),
                elapsed,
            );
            debug!(
                configuration = %self.request.configuration,
                elapsed = ?elapsed,
                "graph executed"
            );
            self.handle.complete(Ok(()));
        }
    }

    fn execute_node(&self, id: NodeId, node: &DependencyNode) -> ExecutionResult {
        let configuration = &self.request.configuration;
        let function = node.function();
        let mut log = ExecutionLog::new(self.request.log_modes.mode(configuration, node));
        let inputs: HashMap<ValueSpecification, CacheValue> = self
            .request
            .cache
            .get_many(node.input_specifications())
            .into_iter()
            .map(|(spec, value)| {
                (
                    spec,
                    value.unwrap_or(CacheValue::NotCalculated(NotCalculated::MissingInputs)),
                )
            })
            .collect();
        let inputs = FunctionInputs::new(inputs);
        let missing_inputs = inputs.missing();

        if !missing_inputs.is_empty() && !function.definition().can_handle_missing_inputs() {
            log.push(
                LogLevel::Warning,
                format!("{} input(s) not calculated", missing_inputs.len()),
            );
            return ExecutionResult {
                configuration: configuration.clone(),
                node: id,
                outputs: sentinels(node, NotCalculated::MissingInputs),
                log,
                missing_inputs,
                failed: true,
            };
        }

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            function
                .definition()
                .execute(node.target(), &inputs, node.outputs())
        }));
        let message = match outcome {
            Ok(Ok(values)) => {
                let mut computed: HashMap<ValueSpecification, Value> = values
                    .into_iter()
                    .map(|c| (c.specification, c.value))
                    .collect();
                let outputs = node
                    .outputs()
                    .iter()
                    .map(|spec| match computed.remove(spec) {
                        Some(value) => (spec.clone(), CacheValue::Value(value)),
                        None => {
                            log.push(LogLevel::Warning, format!("{} not produced", spec));
                            (spec.clone(), NotCalculated::EvaluationError.into())
                        }
                    })
                    .collect();
                log.push(LogLevel::Info, format!("{} executed on {}", function.id(), node.target()));
                return ExecutionResult {
                    configuration: configuration.clone(),
                    node: id,
                    outputs,
                    log,
                    missing_inputs,
                    failed: false,
                };
            }
            Ok(Err(e)) => format!("{:#}", e),
            Err(panic) => panic_message(panic.as_ref()),
        };
        warn!(
            configuration = %configuration,
            node = %id,
            function = %function.id(),
            error = %message,
            "function execution failed"
        );
        log.set_exception(message);
        ExecutionResult {
            configuration: configuration.clone(),
            node: id,
            outputs: sentinels(node, NotCalculated::EvaluationError),
            log,
            missing_inputs,
            failed: true,
        }
    }
}

fn sentinels(node: &DependencyNode, reason: NotCalculated) -> Vec<(ValueSpecification, CacheValue)> {
    node.outputs()
        .iter()
        .map(|spec| (spec.clone(), reason.into()))
        .collect()
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}
