//! Engine configuration and the collaborator bundle handed to every cycle.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::{ComputationCacheSource, CycleId, InMemoryCacheSource};
use crate::error::EngineError;
use crate::exec::{
    EmptyBlacklist, ExecutionLogMode, ExecutionLogModeSource, FunctionBlacklistQuery,
    GraphExecutor, LocalGraphExecutor, NoopStatistics, StatisticsGatherer,
};
use crate::function::FunctionRegistry;
use crate::graph::TargetCollapser;
use crate::market_data::{MarketDataAvailability, NumericShiftCompiler, OverrideOperationCompiler};
use crate::resolve::GraphBuildingContext;
use crate::value::SpecInterner;

/// Tunables for graph building and cycle execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // === Scheduling ===
    /// Worker threads in the shared pool (0 = one per CPU).
    pub worker_threads: usize,

    /// How long the cycle waits on an execution handle before checking for
    /// interruption again, in milliseconds.
    pub poll_timeout_ms: u64,

    /// Bound of the queue between graph executors and the result-streaming
    /// thread.
    pub result_queue_capacity: usize,

    // === Diagnostics ===
    /// Dump every configuration's cache to a text file when a cycle is released.
    pub dump_caches: bool,

    /// Directory for cache dumps (None = the system temp directory).
    pub dump_directory: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            poll_timeout_ms: 5_000,
            result_queue_capacity: 1_000,
            dump_caches: false,
            dump_directory: None,
        }
    }
}

impl EngineConfig {
    /// Set the worker thread count.
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Set the execution poll timeout.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout_ms = timeout.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    /// Set the result queue bound.
    pub fn with_result_queue_capacity(mut self, capacity: usize) -> Self {
        self.result_queue_capacity = capacity;
        self
    }

    /// Enable cache dumps on release, optionally into `directory`.
    pub fn with_cache_dumps(mut self, directory: Option<PathBuf>) -> Self {
        self.dump_caches = true;
        self.dump_directory = directory;
        self
    }

    /// The execution poll timeout.
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Where cache dumps are written.
    pub fn dump_directory(&self) -> PathBuf {
        self.dump_directory
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

struct EngineInner {
    registry: Arc<dyn FunctionRegistry>,
    availability: Arc<dyn MarketDataAvailability>,
    interner: SpecInterner,
    pool: Arc<rayon::ThreadPool>,
    executor: Arc<dyn GraphExecutor>,
    cache_source: Arc<dyn ComputationCacheSource>,
    blacklist: Arc<dyn FunctionBlacklistQuery>,
    log_modes: Arc<dyn ExecutionLogModeSource>,
    override_compiler: Arc<dyn OverrideOperationCompiler>,
    statistics: Arc<dyn StatisticsGatherer>,
    collapser: Option<Arc<dyn TargetCollapser>>,
    config: EngineConfig,
    next_cycle: AtomicU64,
}

/// Every collaborator the engine needs, passed explicitly at construction.
///
/// Cheap to clone - all data is behind an `Arc`.
///
/// # Example
///
/// ```ignore
/// let engine = EngineContext::builder(Arc::new(functions), Arc::new(market_data.clone()))
///     .with_config(EngineConfig::default().with_worker_threads(4))
///     .build()?;
/// let view = ViewCompiler::new(engine.clone()).compile(&definition)?;
/// ```
#[derive(Clone)]
pub struct EngineContext {
    inner: Arc<EngineInner>,
}

impl EngineContext {
    /// Start building a context around the two mandatory collaborators.
    pub fn builder(
        registry: Arc<dyn FunctionRegistry>,
        availability: Arc<dyn MarketDataAvailability>,
    ) -> EngineContextBuilder {
        EngineContextBuilder::new(registry, availability)
    }

    /// A fresh resolution context sharing this engine's pool and interner.
    pub fn graph_building_context(&self) -> GraphBuildingContext {
        GraphBuildingContext::new(
            Arc::clone(&self.inner.registry),
            Arc::clone(&self.inner.availability),
            self.inner.interner.clone(),
            Arc::clone(&self.inner.pool),
        )
    }

    /// Allocate the next cycle id.
    pub fn next_cycle_id(&self) -> CycleId {
        CycleId(self.inner.next_cycle.fetch_add(1, Ordering::Relaxed))
    }

    /// Function registry.
    pub fn registry(&self) -> &Arc<dyn FunctionRegistry> {
        &self.inner.registry
    }

    /// Specification interner shared by all resolutions.
    pub fn interner(&self) -> &SpecInterner {
        &self.inner.interner
    }

    /// Shared worker pool.
    pub fn pool(&self) -> &Arc<rayon::ThreadPool> {
        &self.inner.pool
    }

    /// Graph execution scheduler.
    pub fn executor(&self) -> &Arc<dyn GraphExecutor> {
        &self.inner.executor
    }

    /// Cache allocator.
    pub fn cache_source(&self) -> &Arc<dyn ComputationCacheSource> {
        &self.inner.cache_source
    }

    /// Execution blacklist.
    pub fn blacklist(&self) -> &Arc<dyn FunctionBlacklistQuery> {
        &self.inner.blacklist
    }

    /// Per-node execution log modes.
    pub fn log_modes(&self) -> &Arc<dyn ExecutionLogModeSource> {
        &self.inner.log_modes
    }

    /// Market data shift compiler.
    pub fn override_compiler(&self) -> &Arc<dyn OverrideOperationCompiler> {
        &self.inner.override_compiler
    }

    /// Execution statistics sink.
    pub fn statistics(&self) -> &Arc<dyn StatisticsGatherer> {
        &self.inner.statistics
    }

    /// Node collapser, if collapsing is enabled.
    pub fn collapser(&self) -> Option<&Arc<dyn TargetCollapser>> {
        self.inner.collapser.as_ref()
    }

    /// Engine tunables.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }
}

/// Builder for [`EngineContext`]. Every optional collaborator has an
/// in-process default.
pub struct EngineContextBuilder {
    registry: Arc<dyn FunctionRegistry>,
    availability: Arc<dyn MarketDataAvailability>,
    executor: Option<Arc<dyn GraphExecutor>>,
    cache_source: Option<Arc<dyn ComputationCacheSource>>,
    blacklist: Option<Arc<dyn FunctionBlacklistQuery>>,
    log_modes: Option<Arc<dyn ExecutionLogModeSource>>,
    override_compiler: Option<Arc<dyn OverrideOperationCompiler>>,
    statistics: Option<Arc<dyn StatisticsGatherer>>,
    collapser: Option<Arc<dyn TargetCollapser>>,
    config: EngineConfig,
}

impl EngineContextBuilder {
    fn new(
        registry: Arc<dyn FunctionRegistry>,
        availability: Arc<dyn MarketDataAvailability>,
    ) -> Self {
        Self {
            registry,
            availability,
            executor: None,
            cache_source: None,
            blacklist: None,
            log_modes: None,
            override_compiler: None,
            statistics: None,
            collapser: None,
            config: EngineConfig::default(),
        }
    }

    /// Use a different graph execution scheduler.
    ///
    /// Defaults to a [`LocalGraphExecutor`] on the engine's pool.
    pub fn with_executor(mut self, executor: Arc<dyn GraphExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Use a different cache allocator. Defaults to [`InMemoryCacheSource`].
    pub fn with_cache_source(mut self, source: Arc<dyn ComputationCacheSource>) -> Self {
        self.cache_source = Some(source);
        self
    }

    /// Suppress nodes matched by `blacklist`.
    pub fn with_blacklist(mut self, blacklist: Arc<dyn FunctionBlacklistQuery>) -> Self {
        self.blacklist = Some(blacklist);
        self
    }

    /// Choose execution log modes per node. Defaults to indicators only.
    pub fn with_log_modes(mut self, log_modes: Arc<dyn ExecutionLogModeSource>) -> Self {
        self.log_modes = Some(log_modes);
        self
    }

    /// Compile market data shifts with `compiler`. Defaults to [`NumericShiftCompiler`].
    pub fn with_override_compiler(mut self, compiler: Arc<dyn OverrideOperationCompiler>) -> Self {
        self.override_compiler = Some(compiler);
        self
    }

    /// Report execution statistics to `statistics`.
    pub fn with_statistics(mut self, statistics: Arc<dyn StatisticsGatherer>) -> Self {
        self.statistics = Some(statistics);
        self
    }

    /// Enable node collapsing.
    pub fn with_collapser(mut self, collapser: Arc<dyn TargetCollapser>) -> Self {
        self.collapser = Some(collapser);
        self
    }

    /// Set engine tunables.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Create the worker pool and assemble the context.
    pub fn build(self) -> Result<EngineContext, EngineError> {
        let pool = Arc::new(
            rayon::ThreadPoolBuilder::new()
                .num_threads(self.config.worker_threads)
                .thread_name(|i| format!("calc-flow-worker-{}", i))
                .build()?,
        );
        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(LocalGraphExecutor::new(Arc::clone(&pool))));
        Ok(EngineContext {
            inner: Arc::new(EngineInner {
                registry: self.registry,
                availability: self.availability,
                interner: SpecInterner::new(),
                pool,
                executor,
                cache_source: self
                    .cache_source
                    .unwrap_or_else(|| Arc::new(InMemoryCacheSource::new())),
                blacklist: self.blacklist.unwrap_or_else(|| Arc::new(EmptyBlacklist)),
                log_modes: self
                    .log_modes
                    .unwrap_or_else(|| Arc::new(ExecutionLogMode::Indicators)),
                override_compiler: self
                    .override_compiler
                    .unwrap_or_else(|| Arc::new(NumericShiftCompiler)),
                statistics: self.statistics.unwrap_or_else(|| Arc::new(NoopStatistics)),
                collapser: self.collapser,
                config: self.config,
                next_cycle: AtomicU64::new(1),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.poll_timeout(), Duration::from_secs(5));
        assert!(!config.dump_caches);
        assert_eq!(config.dump_directory(), std::env::temp_dir());
    }

    #[test]
    fn test_builder_methods() {
        let config = EngineConfig::default()
            .with_worker_threads(2)
            .with_poll_timeout(Duration::from_millis(250))
            .with_cache_dumps(Some(PathBuf::from("/tmp/dumps")));
        assert_eq!(config.worker_threads, 2);
        assert_eq!(config.poll_timeout_ms, 250);
        assert!(config.dump_caches);
        assert_eq!(config.dump_directory(), PathBuf::from("/tmp/dumps"));
    }
}
