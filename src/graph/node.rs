//! Dependency graph vertices.

use std::collections::BTreeSet;
use std::fmt;

use crate::function::ParameterizedFunction;
use crate::value::{TargetSpec, ValueSpecification};

/// Identifier of a node within one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    /// Raw index.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An input edge: the consumed specification and the node producing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInput {
    /// Consumed specification.
    pub specification: ValueSpecification,
    /// Producing node.
    pub producer: NodeId,
}

/// A function bound to a target, with its inputs and outputs.
///
/// Mutable only inside the assembler's critical section; read-only once the
/// graph is finalized.
#[derive(Debug, Clone)]
pub struct DependencyNode {
    function: ParameterizedFunction,
    target: TargetSpec,
    inputs: Vec<NodeInput>,
    outputs: Vec<ValueSpecification>,
    dependents: BTreeSet<NodeId>,
}

impl DependencyNode {
    pub(crate) fn new(function: ParameterizedFunction, target: TargetSpec) -> Self {
        Self {
            function,
            target,
            inputs: Vec::new(),
            outputs: Vec::new(),
            dependents: BTreeSet::new(),
        }
    }

    /// The bound function.
    pub fn function(&self) -> &ParameterizedFunction {
        &self.function
    }

    /// The target.
    pub fn target(&self) -> &TargetSpec {
        &self.target
    }

    /// Input edges.
    pub fn inputs(&self) -> &[NodeInput] {
        &self.inputs
    }

    /// Consumed specifications.
    pub fn input_specifications(&self) -> impl Iterator<Item = &ValueSpecification> {
        self.inputs.iter().map(|input| &input.specification)
    }

    /// Distinct producer nodes.
    pub fn input_nodes(&self) -> BTreeSet<NodeId> {
        self.inputs.iter().map(|input| input.producer).collect()
    }

    /// Produced specifications.
    pub fn outputs(&self) -> &[ValueSpecification] {
        &self.outputs
    }

    /// Nodes consuming at least one output of this node.
    pub fn dependents(&self) -> &BTreeSet<NodeId> {
        &self.dependents
    }

    /// Returns `true` if the node loads its values from market data.
    pub fn is_market_data_sourcing(&self) -> bool {
        self.function.is_market_data_sourcing()
    }

    /// Returns `true` if `spec` is one of the outputs.
    pub fn produces(&self, spec: &ValueSpecification) -> bool {
        self.outputs.contains(spec)
    }

    pub(crate) fn add_output(&mut self, spec: ValueSpecification) {
        if !self.outputs.contains(&spec) {
            self.outputs.push(spec);
        }
    }

    pub(crate) fn remove_output(&mut self, spec: &ValueSpecification) -> bool {
        let before = self.outputs.len();
        self.outputs.retain(|o| o != spec);
        before != self.outputs.len()
    }

    pub(crate) fn replace_output(&mut self, old: &ValueSpecification, new: ValueSpecification) {
        if self.outputs.contains(&new) {
            self.remove_output(old);
        } else if let Some(slot) = self.outputs.iter_mut().find(|o| *o == old) {
            *slot = new;
        } else {
            self.outputs.push(new);
        }
    }

    pub(crate) fn retain_outputs(&mut self, keep: impl FnMut(&ValueSpecification) -> bool) {
        self.outputs.retain(keep);
    }

    /// Returns `true` if the input was not already present.
    pub(crate) fn add_input(&mut self, specification: ValueSpecification, producer: NodeId) -> bool {
        if self.inputs.iter().any(|i| i.specification == specification) {
            return false;
        }
        self.inputs.push(NodeInput {
            specification,
            producer,
        });
        true
    }

    /// Repoint the input consuming `old` to `new` produced by `producer`.
    /// Returns `true` if an input was changed.
    pub(crate) fn replace_input(
        &mut self,
        old: &ValueSpecification,
        new: &ValueSpecification,
        producer: NodeId,
    ) -> bool {
        let Some(position) = self.inputs.iter().position(|i| i.specification == *old) else {
            return false;
        };
        if old != new && self.inputs.iter().any(|i| i.specification == *new) {
            self.inputs.remove(position);
        } else {
            self.inputs[position] = NodeInput {
                specification: new.clone(),
                producer,
            };
        }
        true
    }

    pub(crate) fn consumes_from(&self, producer: NodeId) -> bool {
        self.inputs.iter().any(|i| i.producer == producer)
    }

    pub(crate) fn add_dependent(&mut self, node: NodeId) {
        self.dependents.insert(node);
    }

    pub(crate) fn remove_dependent(&mut self, node: NodeId) {
        self.dependents.remove(&node);
    }
}
