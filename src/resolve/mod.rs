//! Backtracking requirement resolution.
//!
//! Each unresolved requirement is driven by a small state machine (see
//! [`task`]) whose steps run as [`ContextRunnable`]s on the context's thread
//! pool. A step never blocks waiting for another search: when it needs the
//! result of a child requirement it submits the child and returns, and the
//! child reports back through a [`ResolvedValueCallback`].
//!
//! Successful resolutions carry an optional [`ResolutionPump`]. Pumping asks
//! the search for the next alternative, closing it discards the remaining
//! alternatives and releases the suspended state.

mod failure;
mod task;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use papaya::HashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::function::{FunctionRegistry, ParameterizedFunction};
use crate::market_data::MarketDataAvailability;
use crate::value::{SpecInterner, ValueRequirement, ValueSpecification};

pub use failure::{FailureRenderer, ResolutionFailure, ResolutionFailureVisitor};
use task::{ApplyFunction, Downstream, ResolveTask};

/// A candidate resolution of a requirement.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedValue {
    /// The output specification satisfying the requirement.
    pub specification: ValueSpecification,
    /// The chosen function.
    pub function: ParameterizedFunction,
    /// Every output the function produces, including `specification`.
    pub outputs: Vec<ValueSpecification>,
    /// Specifications of the resolved inputs.
    pub inputs: Vec<ValueSpecification>,
}

/// Unit of work executed by the graph-building scheduler.
pub trait ContextRunnable: Send {
    /// Run the step. Further work is submitted through `ctx`.
    fn run(self, ctx: &GraphBuildingContext);
}

impl<F> ContextRunnable for F
where
    F: FnOnce(&GraphBuildingContext) + Send,
{
    fn run(self, ctx: &GraphBuildingContext) {
        self(ctx)
    }
}

/// Receives the outcome of a resolution request.
///
/// Both methods may be called concurrently from different worker threads.
pub trait ResolvedValueCallback: Send + Sync {
    /// The requirement resolved. If `pump` is `Some`, alternatives may exist:
    /// call [`ResolutionPump::pump`] for the next one or
    /// [`ResolutionPump::close`] to discard them.
    fn resolved(
        &self,
        ctx: &GraphBuildingContext,
        requirement: &ValueRequirement,
        value: ResolvedValue,
        pump: Option<ResolutionPump>,
    );

    /// The requirement failed, or a pumped search ran out of alternatives.
    fn failed(
        &self,
        ctx: &GraphBuildingContext,
        requirement: &ValueRequirement,
        failure: ResolutionFailure,
    );
}

enum PumpTarget {
    Candidates(Arc<ResolveTask>),
    Inputs(Arc<ApplyFunction>),
}

/// Handle onto a suspended search.
pub struct ResolutionPump {
    target: PumpTarget,
}

impl ResolutionPump {
    fn candidates(task: Arc<ResolveTask>) -> Self {
        Self {
            target: PumpTarget::Candidates(task),
        }
    }

    fn inputs(apply: Arc<ApplyFunction>) -> Self {
        Self {
            target: PumpTarget::Inputs(apply),
        }
    }

    /// Request the next alternative. The answer arrives asynchronously at the
    /// callback that received this pump, as either `resolved` or `failed`.
    pub fn pump(self, ctx: &GraphBuildingContext) {
        match self.target {
            PumpTarget::Candidates(task) => ctx.submit(move |ctx: &GraphBuildingContext| {
                task.next_candidate(ctx)
            }),
            PumpTarget::Inputs(apply) => {
                ctx.submit(move |ctx: &GraphBuildingContext| apply.pump(ctx))
            }
        }
    }

    /// Discard every remaining alternative.
    pub fn close(self) {
        match self.target {
            PumpTarget::Candidates(task) => task.close(),
            PumpTarget::Inputs(apply) => apply.close(),
        }
    }
}

impl std::fmt::Debug for ResolutionPump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.target {
            PumpTarget::Candidates(task) => write!(f, "ResolutionPump({})", task.requirement()),
            PumpTarget::Inputs(apply) => write!(f, "ResolutionPump({})", apply.specification()),
        }
    }
}

struct ContextInner {
    registry: Arc<dyn FunctionRegistry>,
    availability: Arc<dyn MarketDataAvailability>,
    interner: SpecInterner,
    pool: Arc<rayon::ThreadPool>,
    pending: Mutex<usize>,
    idle: Condvar,
    productions: HashMap<ValueSpecification, ResolvedValue, ahash::RandomState>,
    resolutions: HashMap<ValueRequirement, ResolvedValue, ahash::RandomState>,
}

/// Shared state of one graph-building run.
///
/// Cheap to clone - all data is behind an `Arc`.
#[derive(Clone)]
pub struct GraphBuildingContext {
    inner: Arc<ContextInner>,
}

impl GraphBuildingContext {
    /// Create a context over the given collaborators.
    pub fn new(
        registry: Arc<dyn FunctionRegistry>,
        availability: Arc<dyn MarketDataAvailability>,
        interner: SpecInterner,
        pool: Arc<rayon::ThreadPool>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                registry,
                availability,
                interner,
                pool,
                pending: Mutex::new(0),
                idle: Condvar::new(),
                productions: HashMap::with_hasher(ahash::RandomState::new()),
                resolutions: HashMap::with_hasher(ahash::RandomState::new()),
            }),
        }
    }

    /// Start resolving `requirement`, reporting to `callback`.
    pub fn resolve(&self, requirement: ValueRequirement, callback: Arc<dyn ResolvedValueCallback>) {
        debug!(requirement = %requirement, "resolving");
        let task = ResolveTask::new(requirement, Downstream::default(), callback);
        self.submit(move |ctx: &GraphBuildingContext| task.start(ctx));
    }

    /// Submit a step to the scheduler.
    pub fn submit<R: ContextRunnable + 'static>(&self, step: R) {
        *self.inner.pending.lock() += 1;
        let ctx = self.clone();
        self.inner.pool.spawn(move || {
            let _pending = PendingGuard(&ctx);
            if catch_unwind(AssertUnwindSafe(|| step.run(&ctx))).is_err() {
                error!("graph building step panicked");
            }
        });
    }

    /// Block until every submitted step, including steps submitted by other
    /// steps, has completed.
    pub fn run_until_idle(&self) {
        let mut pending = self.inner.pending.lock();
        while *pending > 0 {
            self.inner.idle.wait(&mut pending);
        }
    }

    /// Canonical instance of `spec`.
    pub fn intern(&self, spec: ValueSpecification) -> ValueSpecification {
        self.inner.interner.intern(spec)
    }

    /// The resolution that first produced `spec`, if any.
    pub fn production(&self, spec: &ValueSpecification) -> Option<ResolvedValue> {
        self.inner.productions.pin().get(spec).cloned()
    }

    pub(crate) fn registry(&self) -> &dyn FunctionRegistry {
        &*self.inner.registry
    }

    pub(crate) fn availability(&self) -> &dyn MarketDataAvailability {
        &*self.inner.availability
    }

    pub(crate) fn existing_resolution(&self, requirement: &ValueRequirement) -> Option<ResolvedValue> {
        self.inner.resolutions.pin().get(requirement).cloned()
    }

    pub(crate) fn record(&self, requirement: &ValueRequirement, value: &ResolvedValue) {
        self.inner
            .productions
            .pin()
            .get_or_insert(value.specification.clone(), value.clone());
        self.inner
            .resolutions
            .pin()
            .get_or_insert(requirement.clone(), value.clone());
    }
}

struct PendingGuard<'a>(&'a GraphBuildingContext);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut pending = self.0.inner.pending.lock();
        *pending -= 1;
        if *pending == 0 {
            self.0.inner.idle.notify_all();
        }
    }
}
