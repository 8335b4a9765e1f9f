//! Turns the stream of terminal resolutions into graph nodes.
//!
//! Resolutions arrive concurrently from resolution workers. Each producer
//! pushes onto a queue and then tries to become the leader with a
//! compare-and-swap on a flag. The leader drains the queue to empty under the
//! state lock, then releases leadership and re-checks the queue, so an item
//! pushed while leadership was held is always drained by someone. Producers
//! never wait for each other.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use slab::Slab;
use tracing::{debug, trace, warn};

use super::collapse::{CollapseNodes, CollapseResult, TargetCollapser};
use super::node::{DependencyNode, NodeId};
use crate::function::ParameterizedFunction;
use crate::resolve::{
    GraphBuildingContext, ResolutionFailure, ResolutionPump, ResolvedValue, ResolvedValueCallback,
};
use crate::value::{TargetSpec, ValueRequirement, ValueSpecification};

enum Work {
    Resolved {
        requirement: ValueRequirement,
        value: ResolvedValue,
    },
    Collapsed(CollapseResult),
}

/// Per-function bookkeeping: nodes by target, and node-collapsing groups.
pub(crate) struct PerFunction {
    pub(crate) function: ParameterizedFunction,
    pub(crate) targets: HashMap<TargetSpec, Vec<NodeId>>,
    /// Targets not yet compared by the collapser.
    pub(crate) pending: Vec<TargetSpec>,
    /// One target per collapse group.
    pub(crate) representatives: Vec<TargetSpec>,
    /// Targets merged into another target.
    pub(crate) collapsed: HashMap<TargetSpec, TargetSpec>,
    pub(crate) collapsing: bool,
}

impl PerFunction {
    fn new(function: ParameterizedFunction) -> Self {
        Self {
            function,
            targets: HashMap::new(),
            pending: Vec::new(),
            representatives: Vec::new(),
            collapsed: HashMap::new(),
            collapsing: false,
        }
    }

    fn final_target(&self, target: &TargetSpec) -> TargetSpec {
        let mut current = target.clone();
        let mut seen = HashSet::new();
        while let Some(next) = self.collapsed.get(&current) {
            if !seen.insert(current.clone()) {
                break;
            }
            current = next.clone();
        }
        current
    }
}

/// Mutable graph under construction. Only touched by the leader.
#[derive(Default)]
pub(crate) struct AssemblyState {
    pub(crate) nodes: Slab<DependencyNode>,
    pub(crate) spec_index: HashMap<ValueSpecification, NodeId>,
    pub(crate) terminals: HashMap<ValueSpecification, BTreeSet<ValueRequirement>>,
    pub(crate) functions: HashMap<String, PerFunction>,
    deferred_collapses: Vec<(String, TargetSpec)>,
}

fn mismatch(existing: &[ValueSpecification], offered: &[ValueSpecification]) -> bool {
    offered.iter().any(|new| {
        existing.iter().any(|old| {
            old.name() == new.name() && !old.properties().is_compatible_with(new.properties())
        })
    })
}

impl AssemblyState {
    fn node(&self, id: NodeId) -> &DependencyNode {
        &self.nodes[id.0]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut DependencyNode {
        &mut self.nodes[id.0]
    }

    fn add_terminal(
        &mut self,
        ctx: &GraphBuildingContext,
        requirement: ValueRequirement,
        value: ResolvedValue,
    ) -> Result<(), ResolutionFailure> {
        let mut downstream = HashSet::new();
        match self.get_or_create_node(ctx, &value, &mut downstream) {
            Some((node, spec)) => {
                trace!(requirement = %requirement, node = %node, "terminal output");
                self.terminals.entry(spec).or_default().insert(requirement);
                Ok(())
            }
            None => Err(ResolutionFailure::UnsatisfiedInputs {
                requirement,
                function: value.function.id().to_string(),
                inputs: Vec::new(),
            }),
        }
    }

    /// Node producing `value.specification` (or a composition of it), creating
    /// it and its missing producers if needed.
    fn get_or_create_node(
        &mut self,
        ctx: &GraphBuildingContext,
        value: &ResolvedValue,
        downstream: &mut HashSet<ValueSpecification>,
    ) -> Option<(NodeId, ValueSpecification)> {
        if let Some(&id) = self.spec_index.get(&value.specification) {
            return Some((id, value.specification.clone()));
        }
        if !downstream.insert(value.specification.clone()) {
            warn!(specification = %value.specification, "cycle while materializing node");
            return None;
        }
        let result = self.materialize(ctx, value, downstream);
        downstream.remove(&value.specification);
        result
    }

    fn materialize(
        &mut self,
        ctx: &GraphBuildingContext,
        value: &ResolvedValue,
        downstream: &mut HashSet<ValueSpecification>,
    ) -> Option<(NodeId, ValueSpecification)> {
        let mut inputs = Vec::with_capacity(value.inputs.len());
        for input in &value.inputs {
            let edge = match self.spec_index.get(input) {
                Some(&producer) => (input.clone(), producer),
                None => {
                    let production = ctx.production(input)?;
                    let (producer, actual) = self.get_or_create_node(ctx, &production, downstream)?;
                    (actual, producer)
                }
            };
            inputs.push(edge);
        }

        if let Some(&id) = self.spec_index.get(&value.specification) {
            return Some((id, value.specification.clone()));
        }
        if let Some(found) = self.extend_existing(ctx, value, &inputs) {
            return Some(found);
        }
        let id = self.create_node(value, inputs);
        Some((id, value.specification.clone()))
    }

    /// Extend a compatible node already created for the same function and
    /// target, composing overlapping outputs.
    fn extend_existing(
        &mut self,
        ctx: &GraphBuildingContext,
        value: &ResolvedValue,
        inputs: &[(ValueSpecification, NodeId)],
    ) -> Option<(NodeId, ValueSpecification)> {
        let candidates = self
            .functions
            .get(value.function.id())?
            .targets
            .get(value.specification.target())?
            .clone();
        let id = candidates.into_iter().find(|id| {
            self.nodes.contains(id.0) && !mismatch(self.node(*id).outputs(), &value.outputs)
        })?;

        debug!(node = %id, specification = %value.specification, "extending existing node");
        let mut primary = (id, value.specification.clone());
        for output in &value.outputs {
            let merged = self.merge_output(ctx, id, output);
            if *output == value.specification {
                primary = merged;
            }
        }
        for (spec, producer) in inputs {
            self.connect(id, spec.clone(), *producer);
        }
        Some(primary)
    }

    /// Add `output` to node `id`, composing it with a same-named output if
    /// there is one. Returns the node and specification now covering it.
    pub(crate) fn merge_output(
        &mut self,
        ctx: &GraphBuildingContext,
        id: NodeId,
        output: &ValueSpecification,
    ) -> (NodeId, ValueSpecification) {
        if self.node(id).produces(output) {
            return (id, output.clone());
        }
        let same_name = self
            .node(id)
            .outputs()
            .iter()
            .find(|o| o.name() == output.name())
            .cloned();
        if let Some(existing) = same_name {
            let composed = ctx.intern(existing.compose(output.properties()));
            if composed == existing {
                return (id, existing);
            }
            return self.replace_output(id, &existing, composed);
        }
        match self.spec_index.get(output) {
            Some(&owner) => (owner, output.clone()),
            None => {
                self.node_mut(id).add_output(output.clone());
                self.spec_index.insert(output.clone(), id);
                (id, output.clone())
            }
        }
    }

    /// Replace `old` on node `id` by the more specific `new`, moving consumers
    /// and terminal requirements along.
    fn replace_output(
        &mut self,
        id: NodeId,
        old: &ValueSpecification,
        new: ValueSpecification,
    ) -> (NodeId, ValueSpecification) {
        let owner = self.spec_index.get(&new).copied();
        match owner {
            Some(owner) if owner != id => {
                let theirs = self.consumer_count(owner, &new);
                let ours = self.consumer_count(id, old);
                if ours <= theirs {
                    trace!(node = %id, owner = %owner, specification = %new, "existing owner keeps output");
                    self.node_mut(id).remove_output(old);
                    self.unindex(old, id);
                    self.repoint_consumers(id, old, owner, &new);
                    self.move_terminals(old, &new);
                    return (owner, new);
                }
                trace!(node = %id, owner = %owner, specification = %new, "taking over output");
                self.node_mut(owner).remove_output(&new);
                self.repoint_consumers(owner, &new, id, &new);
            }
            _ => {}
        }
        self.node_mut(id).replace_output(old, new.clone());
        self.unindex(old, id);
        self.spec_index.insert(new.clone(), id);
        self.repoint_consumers(id, old, id, &new);
        self.move_terminals(old, &new);
        (id, new)
    }

    fn unindex(&mut self, spec: &ValueSpecification, id: NodeId) {
        if self.spec_index.get(spec) == Some(&id) {
            self.spec_index.remove(spec);
        }
    }

    fn consumer_count(&self, id: NodeId, spec: &ValueSpecification) -> usize {
        let consumers = self
            .node(id)
            .dependents()
            .iter()
            .filter(|d| {
                self.nodes
                    .get(d.0)
                    .is_some_and(|n| n.input_specifications().any(|s| s == spec))
            })
            .count();
        consumers + self.terminals.get(spec).map_or(0, BTreeSet::len)
    }

    /// Consumers of `old` from node `from` now consume `new` from node `to`.
    pub(crate) fn repoint_consumers(
        &mut self,
        from: NodeId,
        old: &ValueSpecification,
        to: NodeId,
        new: &ValueSpecification,
    ) {
        let dependents: Vec<NodeId> = self.node(from).dependents().iter().copied().collect();
        for dependent in dependents {
            if dependent == to || !self.nodes.contains(dependent.0) {
                continue;
            }
            if !self.node_mut(dependent).replace_input(old, new, to) {
                continue;
            }
            if !self.node(dependent).consumes_from(from) {
                self.node_mut(from).remove_dependent(dependent);
            }
            if self.node(dependent).consumes_from(to) {
                self.node_mut(to).add_dependent(dependent);
            }
        }
    }

    pub(crate) fn move_terminals(&mut self, old: &ValueSpecification, new: &ValueSpecification) {
        if old == new {
            return;
        }
        if let Some(requirements) = self.terminals.remove(old) {
            self.terminals
                .entry(new.clone())
                .or_default()
                .extend(requirements);
        }
    }

    fn connect(&mut self, id: NodeId, spec: ValueSpecification, producer: NodeId) {
        if id == producer {
            return;
        }
        if self.node_mut(id).add_input(spec, producer) {
            self.node_mut(producer).add_dependent(id);
        }
    }

    /// Register a new node transactionally with all of its outputs. An output
    /// already claimed by another node stays with that node.
    fn create_node(
        &mut self,
        value: &ResolvedValue,
        inputs: Vec<(ValueSpecification, NodeId)>,
    ) -> NodeId {
        let target = value.specification.target().clone();
        let mut node = DependencyNode::new(value.function.clone(), target.clone());
        for output in &value.outputs {
            if self.spec_index.contains_key(output) {
                trace!(specification = %output, "output already claimed");
                continue;
            }
            node.add_output(output.clone());
        }
        let id = NodeId(self.nodes.insert(node));
        let outputs: Vec<ValueSpecification> = self.node(id).outputs().to_vec();
        for output in outputs {
            self.spec_index.insert(output, id);
        }
        for (spec, producer) in inputs {
            self.connect(id, spec, producer);
        }
        debug!(node = %id, function = value.function.id(), target = %target, "created node");

        let function_id = value.function.id().to_string();
        let per_function = self
            .functions
            .entry(function_id.clone())
            .or_insert_with(|| PerFunction::new(value.function.clone()));
        let nodes = per_function.targets.entry(target.clone()).or_default();
        let first_for_target = nodes.is_empty();
        nodes.push(id);
        if per_function.collapsed.contains_key(&target) {
            self.deferred_collapses.push((function_id, target));
        } else if first_for_target {
            per_function.pending.push(target);
        }
        id
    }

    pub(crate) fn remove_node(&mut self, id: NodeId) {
        if !self.nodes.contains(id.0) {
            return;
        }
        let node = self.nodes.remove(id.0);
        for producer in node.input_nodes() {
            if let Some(p) = self.nodes.get_mut(producer.0) {
                p.remove_dependent(id);
            }
        }
        for output in node.outputs() {
            self.unindex(output, id);
        }
        for per_function in self.functions.values_mut() {
            for nodes in per_function.targets.values_mut() {
                nodes.retain(|n| *n != id);
            }
        }
    }

    /// Merge every node of `function_id` on `from` into a compatible node on
    /// the final target `from` collapses into.
    fn collapse_target(&mut self, ctx: &GraphBuildingContext, function_id: &str, from: &TargetSpec) {
        let Some(per_function) = self.functions.get(function_id) else {
            return;
        };
        let to = per_function.final_target(from);
        if to == *from {
            return;
        }
        let from_nodes = per_function.targets.get(from).cloned().unwrap_or_default();
        let to_nodes = per_function.targets.get(&to).cloned().unwrap_or_default();
        for source in from_nodes {
            if !self.nodes.contains(source.0) {
                continue;
            }
            let remapped: Vec<(ValueSpecification, ValueSpecification)> = self
                .node(source)
                .outputs()
                .iter()
                .map(|o| (o.clone(), ctx.intern(o.with_target(to.clone()))))
                .collect();
            let new_specs: Vec<ValueSpecification> =
                remapped.iter().map(|(_, new)| new.clone()).collect();
            let Some(destination) = to_nodes.iter().copied().find(|t| {
                self.nodes.contains(t.0) && !mismatch(self.node(*t).outputs(), &new_specs)
            }) else {
                trace!(from = %from, to = %to, "no compatible node to collapse into");
                continue;
            };
            debug!(from = %source, to = %destination, "collapsing node");
            for (old, new) in remapped {
                let (owner, actual) = self.merge_output(ctx, destination, &new);
                self.repoint_consumers(source, &old, owner, &actual);
                self.move_terminals(&old, &actual);
            }
            self.remove_node(source);
        }
    }

    fn apply_collapse(&mut self, ctx: &GraphBuildingContext, result: CollapseResult) {
        let Some(per_function) = self.functions.get_mut(&result.function_id) else {
            return;
        };
        per_function.collapsing = false;
        per_function.representatives = result.representatives;
        for (from, to) in &result.merges {
            per_function.collapsed.insert(from.clone(), to.clone());
        }
        for (from, _) in result.merges {
            self.collapse_target(ctx, &result.function_id, &from);
        }
    }

    fn apply_deferred_collapses(&mut self, ctx: &GraphBuildingContext) {
        for (function_id, target) in std::mem::take(&mut self.deferred_collapses) {
            self.collapse_target(ctx, &function_id, &target);
        }
    }
}

struct AssemblerInner {
    queue: Mutex<VecDeque<Work>>,
    leader: AtomicBool,
    state: Mutex<AssemblyState>,
    failures: Mutex<Vec<ResolutionFailure>>,
    collapser: Option<Arc<dyn TargetCollapser>>,
}

/// Terminal-value callback that assembles resolutions into a graph.
///
/// Cheap to clone - all data is behind an `Arc`.
#[derive(Clone)]
pub struct GraphAssembler {
    inner: Arc<AssemblerInner>,
}

impl GraphAssembler {
    /// Create an assembler, optionally collapsing nodes across targets.
    pub fn new(collapser: Option<Arc<dyn TargetCollapser>>) -> Self {
        Self {
            inner: Arc::new(AssemblerInner {
                queue: Mutex::new(VecDeque::new()),
                leader: AtomicBool::new(false),
                state: Mutex::new(AssemblyState::default()),
                failures: Mutex::new(Vec::new()),
                collapser,
            }),
        }
    }

    pub(crate) fn push_collapsed(&self, ctx: &GraphBuildingContext, result: CollapseResult) {
        self.inner.queue.lock().push_back(Work::Collapsed(result));
        self.drain(ctx);
    }

    fn drain(&self, ctx: &GraphBuildingContext) {
        while !self.inner.queue.lock().is_empty()
            && self
                .inner
                .leader
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            {
                let mut state = self.inner.state.lock();
                loop {
                    let work = self.inner.queue.lock().pop_front();
                    let Some(work) = work else {
                        break;
                    };
                    match work {
                        Work::Resolved { requirement, value } => {
                            if let Err(failure) = state.add_terminal(ctx, requirement, value) {
                                warn!(requirement = %failure.requirement(), "could not materialize resolution");
                                self.inner.failures.lock().push(failure);
                            }
                        }
                        Work::Collapsed(result) => state.apply_collapse(ctx, result),
                    }
                }
                state.apply_deferred_collapses(ctx);
                self.schedule_collapsers(ctx, &mut state);
            }
            self.inner.leader.store(false, Ordering::Release);
        }
    }

    fn schedule_collapsers(&self, ctx: &GraphBuildingContext, state: &mut AssemblyState) {
        let Some(collapser) = &self.inner.collapser else {
            return;
        };
        for (function_id, per_function) in state.functions.iter_mut() {
            if per_function.collapsing || per_function.pending.is_empty() {
                continue;
            }
            if !collapser.can_apply_to(&per_function.function) {
                per_function.pending.clear();
                continue;
            }
            per_function.collapsing = true;
            ctx.submit(CollapseNodes {
                assembler: self.clone(),
                collapser: Arc::clone(collapser),
                function_id: function_id.clone(),
                function: per_function.function.clone(),
                new_targets: std::mem::take(&mut per_function.pending),
                representatives: per_function.representatives.clone(),
            });
        }
    }

    /// Take the assembled state and recorded failures, leaving the assembler empty.
    pub(crate) fn take(&self) -> (AssemblyState, Vec<ResolutionFailure>) {
        let state = std::mem::take(&mut *self.inner.state.lock());
        let failures = std::mem::take(&mut *self.inner.failures.lock());
        (state, failures)
    }
}

impl ResolvedValueCallback for GraphAssembler {
    fn resolved(
        &self,
        ctx: &GraphBuildingContext,
        requirement: &ValueRequirement,
        value: ResolvedValue,
        pump: Option<ResolutionPump>,
    ) {
        if let Some(pump) = pump {
            pump.close();
        }
        self.inner.queue.lock().push_back(Work::Resolved {
            requirement: requirement.clone(),
            value,
        });
        self.drain(ctx);
    }

    fn failed(
        &self,
        _ctx: &GraphBuildingContext,
        requirement: &ValueRequirement,
        failure: ResolutionFailure,
    ) {
        warn!(requirement = %requirement, "could not resolve requirement");
        self.inner.failures.lock().push(failure);
    }
}
