//! One computation cycle of a compiled view.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::delta::DeltaCalculator;
use super::executor::{ExecutionHandle, ExecutionRequest, ExecutionResult};
use super::log::ExecutionLogMode;
use super::results::{ResultFragment, ResultListener, ResultModel};
use super::{CycleState, JobResult, JobResultCache, NodeStateFlag, NodeStates};
use crate::cache::{CacheValue, CycleId, NotCalculated, ResultCache};
use crate::config::EngineContext;
use crate::error::{CycleError, ExecutionError};
use crate::graph::{DependencyGraph, DependencyNode, NodeId};
use crate::market_data::{MarketDataSnapshot, OverrideOperation};
use crate::value::{ValueRequirement, ValueSpecification};
use crate::view::CompiledViewDefinition;

/// Cache, node states and job results of one configuration in one cycle.
struct ConfigurationRun {
    graph: Arc<DependencyGraph>,
    cache: Arc<ResultCache>,
    node_states: NodeStates,
    job_results: JobResultCache,
}

impl ConfigurationRun {
    fn terminal_values(
        &self,
        outputs: impl IntoIterator<Item = (ValueSpecification, CacheValue)>,
    ) -> Vec<(ValueSpecification, CacheValue)> {
        let terminals = self.graph.terminal_outputs();
        outputs
            .into_iter()
            .filter(|(spec, _)| terminals.contains_key(spec))
            .collect()
    }
}

/// How long the result streamer blocks before re-checking its control flags.
const STREAMER_TICK: Duration = Duration::from_millis(10);

/// Tells the result streamer when to stop.
#[derive(Default)]
struct StreamerControl {
    /// Every handle completed: drain what is queued, then exit.
    drain: AtomicBool,
    /// Execution was abandoned: exit without recording anything further.
    discard: AtomicBool,
}

struct InterruptState {
    interrupted: AtomicBool,
    handles: Mutex<Vec<ExecutionHandle>>,
}

/// Interrupts a running cycle from another thread.
///
/// Cheap to clone - all data is behind an `Arc`.
#[derive(Clone)]
pub struct CycleInterruptHandle {
    state: Arc<InterruptState>,
}

impl CycleInterruptHandle {
    /// Cancel all outstanding executions of the cycle.
    pub fn interrupt(&self) {
        self.state.interrupted.store(true, Ordering::Release);
        for handle in self.state.handles.lock().iter() {
            handle.cancel();
        }
    }

    /// Returns `true` once [`interrupt`](Self::interrupt) has been called.
    pub fn is_interrupted(&self) -> bool {
        self.state.interrupted.load(Ordering::Acquire)
    }
}

/// A single computation cycle over a compiled view.
///
/// ```text
/// AWAITING_EXECUTION -> EXECUTING -> EXECUTED
///                                 -> EXECUTION_INTERRUPTED
/// (any state except EXECUTING)    -> DESTROYED   (release)
/// ```
///
/// # Example
///
/// ```ignore
/// let cycle = SingleComputationCycle::new(engine.next_cycle_id(), view.clone(), engine.clone(), snapshot);
/// cycle.pre_execute(previous.as_ref())?;
/// cycle.execute()?;
/// let model = cycle.post_execute()?;
/// ```
pub struct SingleComputationCycle {
    id: CycleId,
    view: Arc<CompiledViewDefinition>,
    engine: EngineContext,
    snapshot: Arc<dyn MarketDataSnapshot>,
    listener: Option<Arc<dyn ResultListener>>,
    state: Mutex<CycleState>,
    prepared: AtomicBool,
    interrupt: CycleInterruptHandle,
    configurations: RwLock<BTreeMap<String, Arc<ConfigurationRun>>>,
    model: Arc<Mutex<ResultModel>>,
}

impl SingleComputationCycle {
    /// Create a cycle awaiting execution.
    pub fn new(
        id: CycleId,
        view: Arc<CompiledViewDefinition>,
        engine: EngineContext,
        snapshot: Arc<dyn MarketDataSnapshot>,
    ) -> Self {
        let model = ResultModel::new(id, view.name());
        Self {
            id,
            view,
            engine,
            snapshot,
            listener: None,
            state: Mutex::new(CycleState::AwaitingExecution),
            prepared: AtomicBool::new(false),
            interrupt: CycleInterruptHandle {
                state: Arc::new(InterruptState {
                    interrupted: AtomicBool::new(false),
                    handles: Mutex::new(Vec::new()),
                }),
            },
            configurations: RwLock::new(BTreeMap::new()),
            model: Arc::new(Mutex::new(model)),
        }
    }

    /// Deliver results to `listener` as they become available.
    pub fn with_listener(mut self, listener: Arc<dyn ResultListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Cycle id.
    pub fn id(&self) -> CycleId {
        self.id
    }

    /// The compiled view this cycle computes.
    pub fn view(&self) -> &Arc<CompiledViewDefinition> {
        &self.view
    }

    /// Current state.
    pub fn state(&self) -> CycleState {
        *self.state.lock()
    }

    /// Handle for interrupting [`execute`](Self::execute) from another thread.
    pub fn interrupt_handle(&self) -> CycleInterruptHandle {
        self.interrupt.clone()
    }

    /// Allocate caches, load market data and, if `previous` computed the same
    /// compiled view, copy forward results of nodes unaffected by market
    /// data changes.
    pub fn pre_execute(&self, previous: Option<&SingleComputationCycle>) -> Result<(), CycleError> {
        if let Some(previous) = previous {
            let previous_state = if std::ptr::eq(previous, self) {
                self.state()
            } else {
                previous.state()
            };
            if previous_state != CycleState::Executed {
                return Err(CycleError::PreviousCycleNotExecuted(previous_state));
            }
        }
        let fragments = {
            let state = self.state.lock();
            if *state != CycleState::AwaitingExecution || self.prepared.load(Ordering::Acquire) {
                return Err(CycleError::InvalidState {
                    operation: "pre-execute",
                    state: *state,
                });
            }
            self.prepare(previous)
        };
        for fragment in fragments {
            self.deliver(fragment);
        }
        Ok(())
    }

    /// Load market data and reuse unchanged results. Runs with the state lock
    /// held; the returned fragments are delivered once it is released.
    fn prepare(&self, previous: Option<&SingleComputationCycle>) -> Vec<ResultFragment> {
        let mut fragments = Vec::new();
        let requirements = self.view.market_data_requirements();
        let available = self.snapshot.query(&requirements);
        let mut runs = BTreeMap::new();
        for (name, graph) in self.view.graphs() {
            let cache = self.engine.cache_source().get_cache(self.id, name);
            let shift = self.compile_shift(name);
            let loaded: Vec<(ValueSpecification, CacheValue)> = graph
                .market_data_requirements()
                .into_iter()
                .map(|spec| {
                    let value: CacheValue = match (available.get(&spec), &shift) {
                        (Some(value), Some(shift)) => shift.apply(&spec, value.clone()).into(),
                        (Some(value), None) => value.clone().into(),
                        (None, _) => NotCalculated::MissingMarketData.into(),
                    };
                    (spec, value)
                })
                .collect();
            cache.put_many(loaded.iter().cloned());
            debug!(
                cycle = %self.id,
                configuration = %name,
                values = loaded.len(),
                "market data loaded"
            );
            fragments.push(ResultFragment::MarketData {
                configuration: name.to_string(),
                values: loaded,
            });
            runs.insert(
                name.to_string(),
                Arc::new(ConfigurationRun {
                    graph: Arc::clone(graph),
                    cache,
                    node_states: NodeStates::new(),
                    job_results: JobResultCache::new(),
                }),
            );
        }
        *self.configurations.write() = runs;

        if let Some(previous) = previous {
            if Arc::ptr_eq(&self.view, &previous.view) {
                self.reuse_unchanged(previous, &mut fragments);
            } else {
                debug!(cycle = %self.id, "previous cycle computed a different view, nothing reused");
            }
        }
        self.prepared.store(true, Ordering::Release);
        fragments
    }

    fn compile_shift(&self, configuration: &str) -> Option<Arc<dyn OverrideOperation>> {
        let expression = self.view.configuration(configuration)?.market_data_shift()?;
        match self.engine.override_compiler().compile(expression) {
            Ok(operation) => Some(operation),
            Err(e) => {
                warn!(
                    configuration = %configuration,
                    expression = %expression,
                    error = %e,
                    "ignoring invalid market data shift"
                );
                None
            }
        }
    }

    fn reuse_unchanged(&self, previous: &SingleComputationCycle, fragments: &mut Vec<ResultFragment>) {
        let runs = self.configurations.read();
        let previous_runs = previous.configurations.read();
        for (name, run) in runs.iter() {
            let Some(before) = previous_runs.get(name) else {
                continue;
            };
            let delta = DeltaCalculator::compute(&run.graph, &run.cache, &before.cache);
            let mut reused = 0;
            for &id in delta.unchanged() {
                let Some(node) = run.graph.node(id) else {
                    continue;
                };
                if node.is_market_data_sourcing() {
                    continue;
                }
                let Some(previous_state) = before.node_states.get(id) else {
                    continue;
                };
                let copied = match previous_state {
                    NodeStateFlag::Executed => {
                        if self.needs_full_log(name, node, before) {
                            continue;
                        }
                        copy_outputs(node, before, run, |previous| {
                            previous.unwrap_or(NotCalculated::EvaluationError.into())
                        })
                    }
                    NodeStateFlag::Failed | NodeStateFlag::Suppressed => {
                        copy_outputs(node, before, run, |previous| {
                            previous
                                .filter(|value| value.not_calculated().is_some())
                                .unwrap_or(NotCalculated::Suppressed.into())
                        })
                    }
                };
                run.node_states.set(id, previous_state);
                let terminal = run.terminal_values(copied);
                if !terminal.is_empty() {
                    fragments.push(ResultFragment::Computed {
                        configuration: name.clone(),
                        node: id,
                        values: terminal,
                    });
                }
                reused += 1;
            }
            info!(
                cycle = %self.id,
                configuration = %name,
                reused,
                changed = delta.changed().len(),
                "delta reuse applied"
            );
        }
    }

    /// A node now logged in full is recomputed unless its previous log was
    /// already kept in full.
    fn needs_full_log(&self, configuration: &str, node: &DependencyNode, before: &ConfigurationRun) -> bool {
        if self.engine.log_modes().mode(configuration, node) != ExecutionLogMode::Full {
            return false;
        }
        !node.outputs().iter().all(|spec| {
            before
                .job_results
                .get(spec)
                .is_some_and(|job| job.log.events().is_some())
        })
    }

    /// Execute every configuration's executable subgraph, blocking until all
    /// have finished or the cycle is interrupted.
    ///
    /// Runs [`pre_execute`](Self::pre_execute) without a previous cycle if it
    /// has not been called.
    pub fn execute(&self) -> Result<(), CycleError> {
        let fragments = {
            let mut state = self.state.lock();
            if *state != CycleState::AwaitingExecution {
                return Err(CycleError::InvalidState {
                    operation: "execute",
                    state: *state,
                });
            }
            let fragments = if self.prepared.load(Ordering::Acquire) {
                Vec::new()
            } else {
                self.prepare(None)
            };
            *state = CycleState::Executing;
            fragments
        };
        for fragment in fragments {
            self.deliver(fragment);
        }
        info!(cycle = %self.id, view = %self.view.name(), "cycle executing");

        let runs: BTreeMap<String, Arc<ConfigurationRun>> = self.configurations.read().clone();
        let (sender, receiver) = sync_channel(self.engine.config().result_queue_capacity.max(1));
        let control = Arc::new(StreamerControl::default());
        let streamer = match self.spawn_result_streamer(receiver, runs.clone(), Arc::clone(&control)) {
            Ok(streamer) => streamer,
            Err(e) => {
                *self.state.lock() = CycleState::ExecutionInterrupted;
                return Err(CycleError::ResultStreamer(e));
            }
        };

        let mut handles = Vec::with_capacity(runs.len());
        for (name, run) in &runs {
            let request = ExecutionRequest {
                cycle: self.id,
                configuration: name.clone(),
                graph: self.executable_subgraph(name, run),
                cache: Arc::clone(&run.cache),
                log_modes: Arc::clone(self.engine.log_modes()),
                statistics: Arc::clone(self.engine.statistics()),
                results: sender.clone(),
            };
            let handle = self.engine.executor().execute(request);
            self.interrupt.state.handles.lock().push(handle.clone());
            if self.interrupt.is_interrupted() {
                handle.cancel();
            }
            handles.push((name.clone(), handle));
        }
        drop(sender);

        let outcome = self.await_handles(&handles);
        if outcome.is_ok() {
            control.drain.store(true, Ordering::Release);
            if let Err(e) = streamer.join() {
                error!(cycle = %self.id, "result-streaming thread panicked: {:?}", e);
            }
        } else {
            // Jobs still in flight may hold the result sender for as long as
            // they run; their results are dropped.
            control.discard.store(true, Ordering::Release);
            for (_, handle) in &handles {
                handle.cancel();
            }
            drop(streamer);
        }
        self.interrupt.state.handles.lock().clear();

        let mut state = self.state.lock();
        match &outcome {
            Ok(()) => {
                *state = CycleState::Executed;
                info!(cycle = %self.id, "cycle executed");
            }
            Err(CycleError::Interrupted) => {
                *state = CycleState::ExecutionInterrupted;
                info!(cycle = %self.id, "cycle interrupted");
            }
            Err(e) => {
                *state = CycleState::ExecutionInterrupted;
                error!(cycle = %self.id, error = %e, "cycle execution failed");
            }
        }
        outcome
    }

    fn await_handles(&self, handles: &[(String, ExecutionHandle)]) -> Result<(), CycleError> {
        let timeout = self.engine.config().poll_timeout();
        for (name, handle) in handles {
            loop {
                if self.interrupt.is_interrupted() {
                    return Err(CycleError::Interrupted);
                }
                match handle.wait_timeout(timeout) {
                    None => debug!(cycle = %self.id, configuration = %name, "still executing"),
                    Some(Ok(())) => break,
                    Some(Err(ExecutionError::Cancelled)) if self.interrupt.is_interrupted() => {
                        return Err(CycleError::Interrupted);
                    }
                    Some(Err(source)) => {
                        return Err(CycleError::ExecutionFailed {
                            configuration: name.clone(),
                            source,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Nodes of `run` that still need executing. Market data nodes are marked
    /// executed, blacklisted nodes suppressed, and nodes reused from the
    /// previous cycle are left out.
    fn executable_subgraph(&self, configuration: &str, run: &ConfigurationRun) -> DependencyGraph {
        let blacklist = self.engine.blacklist();
        let mut suppressed = Vec::new();
        let graph = run.graph.subgraph(|id, node| {
            if node.is_market_data_sourcing() {
                run.node_states.set(id, NodeStateFlag::Executed);
                return false;
            }
            if run.node_states.get(id).is_some() {
                return false;
            }
            if blacklist.is_blacklisted(node) {
                run.node_states.set(id, NodeStateFlag::Suppressed);
                let values: Vec<(ValueSpecification, CacheValue)> = node
                    .outputs()
                    .iter()
                    .map(|spec| (spec.clone(), NotCalculated::Suppressed.into()))
                    .collect();
                run.cache.put_many(values.iter().cloned());
                suppressed.push((id, values));
                return false;
            }
            true
        });
        if !suppressed.is_empty() {
            info!(
                cycle = %self.id,
                configuration = %configuration,
                suppressed = suppressed.len(),
                "blacklisted nodes suppressed"
            );
        }
        for (id, values) in suppressed {
            let terminal = run.terminal_values(values);
            if !terminal.is_empty() {
                self.deliver(ResultFragment::Computed {
                    configuration: configuration.to_string(),
                    node: id,
                    values: terminal,
                });
            }
        }
        graph
    }

    fn spawn_result_streamer(
        &self,
        receiver: Receiver<ExecutionResult>,
        runs: BTreeMap<String, Arc<ConfigurationRun>>,
        control: Arc<StreamerControl>,
    ) -> std::io::Result<JoinHandle<()>> {
        let cycle = self.id;
        let model = Arc::clone(&self.model);
        let listener = self.listener.clone();
        thread::Builder::new()
            .name(format!("calc-flow-cycle-{}-results", cycle))
            .spawn(move || {
                let record = |result: ExecutionResult| {
                    if control.discard.load(Ordering::Acquire) {
                        return;
                    }
                    let ExecutionResult {
                        configuration,
                        node,
                        outputs,
                        log,
                        missing_inputs,
                        failed,
                    } = result;
                    let Some(run) = runs.get(&configuration) else {
                        warn!(cycle = %cycle, configuration = %configuration, "result for unknown configuration");
                        return;
                    };
                    let state = if failed {
                        NodeStateFlag::Failed
                    } else {
                        NodeStateFlag::Executed
                    };
                    run.node_states.set(node, state);
                    let job = JobResult {
                        node,
                        log,
                        missing_inputs,
                    };
                    for (spec, _) in &outputs {
                        run.job_results.put(spec.clone(), job.clone());
                    }
                    let terminal = run.terminal_values(outputs);
                    if !terminal.is_empty() {
                        deliver(
                            cycle,
                            &model,
                            listener.as_deref(),
                            ResultFragment::Computed {
                                configuration,
                                node,
                                values: terminal,
                            },
                        );
                    }
                };
                loop {
                    if control.discard.load(Ordering::Acquire) {
                        debug!(cycle = %cycle, "discarding late results");
                        break;
                    }
                    match receiver.recv_timeout(STREAMER_TICK) {
                        Ok(result) => record(result),
                        Err(RecvTimeoutError::Timeout) => {
                            if control.drain.load(Ordering::Acquire) {
                                while let Ok(result) = receiver.try_recv() {
                                    record(result);
                                }
                                break;
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!(cycle = %cycle, "result stream closed");
            })
    }

    fn deliver(&self, fragment: ResultFragment) {
        deliver(self.id, &self.model, self.listener.as_deref(), fragment);
    }

    /// Stamp the result model with its completion time and hand it to the
    /// listener.
    pub fn post_execute(&self) -> Result<ResultModel, CycleError> {
        let state = self.state();
        if state != CycleState::Executed {
            return Err(CycleError::InvalidState {
                operation: "post-execute",
                state,
            });
        }
        let model = {
            let mut model = self.model.lock();
            model.complete();
            model.clone()
        };
        if let Some(listener) = &self.listener {
            if catch_unwind(AssertUnwindSafe(|| listener.completed(self.id, &model))).is_err() {
                warn!(cycle = %self.id, "result listener panicked");
            }
        }
        info!(cycle = %self.id, duration = ?model.duration(), "cycle completed");
        Ok(model)
    }

    /// Release the cycle's caches, dumping them first if configured.
    ///
    /// The cycle is `DESTROYED` afterwards even if the dump fails.
    pub fn release(&self) -> Result<(), CycleError> {
        let mut state = self.state.lock();
        if matches!(*state, CycleState::Destroyed | CycleState::Executing) {
            return Err(CycleError::InvalidState {
                operation: "release",
                state: *state,
            });
        }
        let dump = if self.engine.config().dump_caches || self.view.dump_caches() {
            self.dump_caches()
        } else {
            Ok(())
        };
        self.engine.cache_source().release_caches(self.id);
        self.configurations.write().clear();
        *state = CycleState::Destroyed;
        info!(cycle = %self.id, "cycle released");
        dump.map_err(CycleError::from)
    }

    fn dump_caches(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.engine.config().dump_directory())?;
        for (name, run) in self.configurations.read().iter() {
            let path = self.cache_dump_path(name);
            run.cache.dump_to(&path)?;
            info!(cycle = %self.id, path = %path.display(), "cache dumped");
        }
        Ok(())
    }

    /// File a configuration's cache is dumped to on release.
    pub fn cache_dump_path(&self, configuration: &str) -> PathBuf {
        let name: String = configuration
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.engine
            .config()
            .dump_directory()
            .join(format!("cycle-{}-{}.txt", self.id, name))
    }

    fn run(&self, configuration: &str) -> Result<Arc<ConfigurationRun>, CycleError> {
        let state = self.state();
        if state == CycleState::Destroyed {
            return Err(CycleError::InvalidState {
                operation: "query",
                state,
            });
        }
        self.configurations
            .read()
            .get(configuration)
            .cloned()
            .ok_or_else(|| CycleError::UnknownConfiguration(configuration.to_string()))
    }

    /// Read arbitrary specifications from a configuration's cache.
    pub fn query_computation_caches(
        &self,
        configuration: &str,
        specs: &[ValueSpecification],
    ) -> Result<Vec<(ValueSpecification, Option<CacheValue>)>, CycleError> {
        Ok(self.run(configuration)?.cache.get_many(specs))
    }

    /// Every terminal output of a configuration currently in its cache.
    pub fn query_results(
        &self,
        configuration: &str,
    ) -> Result<BTreeMap<ValueSpecification, CacheValue>, CycleError> {
        let run = self.run(configuration)?;
        Ok(run
            .graph
            .terminal_outputs()
            .keys()
            .filter_map(|spec| run.cache.get(spec).map(|value| (spec.clone(), value)))
            .collect())
    }

    /// Cached value satisfying a requested terminal requirement.
    pub fn terminal_value(
        &self,
        configuration: &str,
        requirement: &ValueRequirement,
    ) -> Result<Option<CacheValue>, CycleError> {
        let run = self.run(configuration)?;
        Ok(run
            .graph
            .terminal_specification(requirement)
            .and_then(|spec| run.cache.get(spec)))
    }

    /// The cache of a configuration.
    pub fn cache(&self, configuration: &str) -> Result<Arc<ResultCache>, CycleError> {
        Ok(Arc::clone(&self.run(configuration)?.cache))
    }

    /// State of a node, if determined.
    pub fn node_state(&self, configuration: &str, node: NodeId) -> Option<NodeStateFlag> {
        self.run(configuration).ok()?.node_states.get(node)
    }

    /// Execution log and diagnostics behind a cached output.
    pub fn job_result(&self, configuration: &str, spec: &ValueSpecification) -> Option<JobResult> {
        self.run(configuration).ok()?.job_results.get(spec)
    }

    /// Snapshot of the result model.
    pub fn result_model(&self) -> ResultModel {
        self.model.lock().clone()
    }
}

impl std::fmt::Debug for SingleComputationCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleComputationCycle")
            .field("id", &self.id)
            .field("view", &self.view.name())
            .field("state", &self.state())
            .finish()
    }
}

fn copy_outputs(
    node: &DependencyNode,
    before: &ConfigurationRun,
    run: &ConfigurationRun,
    value_for: impl Fn(Option<CacheValue>) -> CacheValue,
) -> Vec<(ValueSpecification, CacheValue)> {
    node.outputs()
        .iter()
        .map(|spec| {
            let value = value_for(before.cache.get(spec));
            run.cache.put(spec.clone(), value.clone());
            if let Some(job) = before.job_results.get(spec) {
                run.job_results.put(spec.clone(), job);
            }
            (spec.clone(), value)
        })
        .collect()
}

fn deliver(
    cycle: CycleId,
    model: &Mutex<ResultModel>,
    listener: Option<&dyn ResultListener>,
    fragment: ResultFragment,
) {
    model.lock().apply(&fragment);
    if let Some(listener) = listener {
        if catch_unwind(AssertUnwindSafe(|| listener.fragment(cycle, &fragment))).is_err() {
            warn!(cycle = %cycle, "result listener panicked");
        }
    }
}
