//! Per-requirement resolution state machine.
//!
//! ```text
//! start ──► recursion? ──► failed(Recursion)
//!   │
//!   ├──► market data ──► resolved (no pump)
//!   ├──► existing resolution ──► resolved (pump: fresh candidates)
//!   ▼
//! next_candidate ──► apply ──► resolve inputs ──► resolved (pump: vary inputs)
//!   ▲                  │              │
//!   └── rejected ◄─────┘   input failed / inputs exhausted
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{
    GraphBuildingContext, ResolutionFailure, ResolutionPump, ResolvedValue, ResolvedValueCallback,
};
use crate::function::{FunctionCandidate, ParameterizedFunction};
use crate::value::{ValueRequirement, ValueSpecification};

/// Requirements and specifications being resolved further up the chain.
#[derive(Clone, Default)]
pub(crate) struct Downstream(Option<Arc<DownstreamFrame>>);

struct DownstreamFrame {
    requirement: ValueRequirement,
    specification: ValueSpecification,
    parent: Downstream,
}

impl Downstream {
    fn push(&self, requirement: ValueRequirement, specification: ValueSpecification) -> Self {
        Downstream(Some(Arc::new(DownstreamFrame {
            requirement,
            specification,
            parent: self.clone(),
        })))
    }

    fn frames(&self) -> impl Iterator<Item = &DownstreamFrame> {
        std::iter::successors(self.0.as_deref(), |frame| frame.parent.0.as_deref())
    }

    fn contains_requirement(&self, requirement: &ValueRequirement) -> bool {
        self.frames().any(|frame| frame.requirement == *requirement)
    }

    fn contains_spec(&self, spec: &ValueSpecification) -> bool {
        self.frames().any(|frame| frame.specification == *spec)
    }
}

#[derive(Default)]
struct TaskState {
    candidates: Option<Box<dyn Iterator<Item = FunctionCandidate> + Send>>,
    failures: Vec<ResolutionFailure>,
    /// (function id, specification) pairs already offered to the callback.
    delivered: Vec<(String, ValueSpecification)>,
    closed: bool,
    finished: bool,
}

enum Applied {
    Pending,
    Delivered,
    Skipped,
    Rejected(ResolutionFailure),
}

pub(crate) struct ResolveTask {
    requirement: ValueRequirement,
    downstream: Downstream,
    callback: Arc<dyn ResolvedValueCallback>,
    state: Mutex<TaskState>,
}

impl ResolveTask {
    pub(crate) fn new(
        requirement: ValueRequirement,
        downstream: Downstream,
        callback: Arc<dyn ResolvedValueCallback>,
    ) -> Arc<Self> {
        Arc::new(Self {
            requirement,
            downstream,
            callback,
            state: Mutex::new(TaskState::default()),
        })
    }

    pub(crate) fn requirement(&self) -> &ValueRequirement {
        &self.requirement
    }

    pub(crate) fn start(self: &Arc<Self>, ctx: &GraphBuildingContext) {
        if self.downstream.contains_requirement(&self.requirement) {
            debug!(requirement = %self.requirement, "recursive requirement");
            self.state.lock().finished = true;
            self.callback.failed(
                ctx,
                &self.requirement,
                ResolutionFailure::Recursion {
                    requirement: self.requirement.clone(),
                },
            );
            return;
        }

        if let Some(spec) = ctx.availability().resolve(&self.requirement) {
            let spec = ctx.intern(spec);
            trace!(requirement = %self.requirement, "sourced from market data");
            self.state.lock().finished = true;
            let resolved = ResolvedValue {
                specification: spec.clone(),
                function: ParameterizedFunction::market_data_sourcing(),
                outputs: vec![spec],
                inputs: Vec::new(),
            };
            self.deliver(ctx, resolved, None);
            return;
        }

        if let Some(existing) = ctx.existing_resolution(&self.requirement) {
            if !self.downstream.contains_spec(&existing.specification) {
                trace!(requirement = %self.requirement, "reusing existing resolution");
                self.state.lock().delivered.push((
                    existing.function.id().to_string(),
                    existing.specification.clone(),
                ));
                let pump = ResolutionPump::candidates(Arc::clone(self));
                self.deliver(ctx, existing, Some(pump));
                return;
            }
        }

        self.next_candidate(ctx);
    }

    pub(crate) fn next_candidate(self: &Arc<Self>, ctx: &GraphBuildingContext) {
        loop {
            let candidate = {
                let mut state = self.state.lock();
                if state.closed || state.finished {
                    return;
                }
                let requirement = &self.requirement;
                state
                    .candidates
                    .get_or_insert_with(|| ctx.registry().candidates(requirement))
                    .next()
            };
            let Some(candidate) = candidate else {
                self.exhausted(ctx);
                return;
            };
            match self.apply(ctx, candidate) {
                Applied::Pending | Applied::Delivered => return,
                Applied::Skipped => continue,
                Applied::Rejected(failure) => {
                    trace!(requirement = %self.requirement, "candidate rejected");
                    self.state.lock().failures.push(failure);
                }
            }
        }
    }

    fn apply(self: &Arc<Self>, ctx: &GraphBuildingContext, candidate: FunctionCandidate) -> Applied {
        let requirement = &self.requirement;
        let Some(output) = candidate.outputs.iter().find(|output| {
            output.name() == requirement.name
                && *output.target() == requirement.target
                && requirement.constraints.is_satisfied_by(output.properties())
        }) else {
            return Applied::Rejected(ResolutionFailure::ConstraintMismatch {
                requirement: requirement.clone(),
                function: candidate.function.id().to_string(),
                offered: candidate.outputs.clone(),
            });
        };

        let specification = ctx.intern(output.compose(&requirement.constraints));
        if self.downstream.contains_spec(&specification) {
            return Applied::Rejected(ResolutionFailure::Recursion {
                requirement: requirement.clone(),
            });
        }

        let key = (candidate.function.id().to_string(), specification.clone());
        {
            let mut state = self.state.lock();
            if state.delivered.contains(&key) {
                return Applied::Skipped;
            }
            state.delivered.push(key);
        }

        let outputs: Vec<ValueSpecification> = candidate
            .outputs
            .iter()
            .map(|o| {
                if o == output {
                    specification.clone()
                } else {
                    ctx.intern(o.clone())
                }
            })
            .collect();

        if candidate.inputs.is_empty() {
            let resolved = ResolvedValue {
                specification,
                function: candidate.function,
                outputs,
                inputs: Vec::new(),
            };
            self.deliver(ctx, resolved, Some(ResolutionPump::candidates(Arc::clone(self))));
            return Applied::Delivered;
        }

        let apply = ApplyFunction::new(
            Arc::clone(self),
            candidate.function,
            specification,
            outputs,
            candidate.inputs.len(),
        );
        apply.start(ctx, candidate.inputs);
        Applied::Pending
    }

    fn exhausted(&self, ctx: &GraphBuildingContext) {
        let failure = {
            let mut state = self.state.lock();
            state.finished = true;
            state.candidates = None;
            let causes = std::mem::take(&mut state.failures);
            if causes.is_empty() {
                ResolutionFailure::NoFunctions {
                    requirement: self.requirement.clone(),
                }
            } else {
                ResolutionFailure::CouldNotResolve {
                    requirement: self.requirement.clone(),
                    causes,
                }
            }
        };
        debug!(requirement = %self.requirement, "no further resolutions");
        self.callback.failed(ctx, &self.requirement, failure);
    }

    fn candidate_failed(&self, failure: ResolutionFailure) {
        self.state.lock().failures.push(failure);
    }

    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.candidates = None;
    }

    fn deliver(
        &self,
        ctx: &GraphBuildingContext,
        resolved: ResolvedValue,
        pump: Option<ResolutionPump>,
    ) {
        debug!(
            requirement = %self.requirement,
            specification = %resolved.specification,
            function = resolved.function.id(),
            "resolved"
        );
        ctx.record(&self.requirement, &resolved);
        self.callback.resolved(ctx, &self.requirement, resolved, pump);
    }
}

struct ApplyState {
    inputs: Vec<Option<ValueSpecification>>,
    pumps: Vec<Option<ResolutionPump>>,
    outstanding: usize,
    pumping: Option<usize>,
    closed: bool,
}

/// A candidate function whose inputs are being resolved.
pub(crate) struct ApplyFunction {
    task: Arc<ResolveTask>,
    function: ParameterizedFunction,
    specification: ValueSpecification,
    outputs: Vec<ValueSpecification>,
    state: Mutex<ApplyState>,
}

impl ApplyFunction {
    fn new(
        task: Arc<ResolveTask>,
        function: ParameterizedFunction,
        specification: ValueSpecification,
        outputs: Vec<ValueSpecification>,
        input_count: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            task,
            function,
            specification,
            outputs,
            state: Mutex::new(ApplyState {
                inputs: vec![None; input_count],
                pumps: (0..input_count).map(|_| None).collect(),
                outstanding: input_count,
                pumping: None,
                closed: false,
            }),
        })
    }

    pub(crate) fn specification(&self) -> &ValueSpecification {
        &self.specification
    }

    fn start(self: &Arc<Self>, ctx: &GraphBuildingContext, inputs: Vec<ValueRequirement>) {
        let downstream = self
            .task
            .downstream
            .push(self.task.requirement.clone(), self.specification.clone());
        for (index, input) in inputs.into_iter().enumerate() {
            let callback = Arc::new(InputCallback {
                apply: Arc::clone(self),
                index,
            });
            let child = ResolveTask::new(input, downstream.clone(), callback);
            ctx.submit(move |ctx: &GraphBuildingContext| child.start(ctx));
        }
    }

    fn resolved_value(&self, state: &ApplyState) -> ResolvedValue {
        ResolvedValue {
            specification: self.specification.clone(),
            function: self.function.clone(),
            outputs: self.outputs.clone(),
            inputs: state.inputs.iter().flatten().cloned().collect(),
        }
    }

    /// Advance to the next alternative: vary the first input that still has
    /// alternatives, otherwise fall back to the next candidate function.
    pub(crate) fn pump(self: &Arc<Self>, ctx: &GraphBuildingContext) {
        let next = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            let next = state
                .pumps
                .iter_mut()
                .enumerate()
                .find_map(|(index, pump)| pump.take().map(|pump| (index, pump)));
            match next {
                Some((index, pump)) => {
                    state.pumping = Some(index);
                    Some(pump)
                }
                None => {
                    state.closed = true;
                    None
                }
            }
        };
        match next {
            Some(pump) => pump.pump(ctx),
            None => self.task.next_candidate(ctx),
        }
    }

    pub(crate) fn close(&self) {
        let pumps: Vec<ResolutionPump> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.pumps.iter_mut().filter_map(Option::take).collect()
        };
        for pump in pumps {
            pump.close();
        }
        self.task.close();
    }

    fn input_resolved(
        self: &Arc<Self>,
        ctx: &GraphBuildingContext,
        index: usize,
        value: ResolvedValue,
        pump: Option<ResolutionPump>,
    ) {
        let resolved = {
            let mut state = self.state.lock();
            if state.closed {
                drop(state);
                if let Some(pump) = pump {
                    pump.close();
                }
                return;
            }
            if state.inputs[index].is_none() {
                state.outstanding -= 1;
            }
            state.inputs[index] = Some(value.specification);
            state.pumps[index] = pump;
            if state.pumping == Some(index) {
                state.pumping = None;
            }
            (state.outstanding == 0).then(|| self.resolved_value(&state))
        };
        if let Some(resolved) = resolved {
            self.task
                .deliver(ctx, resolved, Some(ResolutionPump::inputs(Arc::clone(self))));
        }
    }

    fn input_failed(
        self: &Arc<Self>,
        ctx: &GraphBuildingContext,
        index: usize,
        failure: ResolutionFailure,
    ) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        if state.inputs[index].is_none() {
            state.closed = true;
            let pumps: Vec<ResolutionPump> =
                state.pumps.iter_mut().filter_map(Option::take).collect();
            drop(state);
            for pump in pumps {
                pump.close();
            }
            self.task.candidate_failed(ResolutionFailure::UnsatisfiedInputs {
                requirement: self.task.requirement.clone(),
                function: self.function.id().to_string(),
                inputs: vec![failure],
            });
            let task = Arc::clone(&self.task);
            ctx.submit(move |ctx: &GraphBuildingContext| task.next_candidate(ctx));
        } else if state.pumping == Some(index) {
            // This input has no more alternatives; move on to the next one.
            state.pumping = None;
            drop(state);
            self.pump(ctx);
        }
    }
}

struct InputCallback {
    apply: Arc<ApplyFunction>,
    index: usize,
}

impl ResolvedValueCallback for InputCallback {
    fn resolved(
        &self,
        ctx: &GraphBuildingContext,
        _requirement: &ValueRequirement,
        value: ResolvedValue,
        pump: Option<ResolutionPump>,
    ) {
        self.apply.input_resolved(ctx, self.index, value, pump);
    }

    fn failed(
        &self,
        ctx: &GraphBuildingContext,
        _requirement: &ValueRequirement,
        failure: ResolutionFailure,
    ) {
        self.apply.input_failed(ctx, self.index, failure);
    }
}
