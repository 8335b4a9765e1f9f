//! Dependency graph assembly and the finalized, immutable graph.

mod assembler;
mod collapse;
mod node;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tracing::info;

use crate::error::GraphBuildError;
use crate::resolve::{GraphBuildingContext, ResolutionFailure};
use crate::value::{ValueRequirement, ValueSpecification};

pub use assembler::GraphAssembler;
use assembler::AssemblyState;
pub use collapse::TargetCollapser;
pub use node::{DependencyNode, NodeId, NodeInput};

/// Finalized per-configuration graph.
///
/// Immutable; nodes are shared read-only with every subgraph derived from it.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    configuration: String,
    nodes: BTreeMap<NodeId, Arc<DependencyNode>>,
    spec_index: HashMap<ValueSpecification, NodeId>,
    terminal_outputs: HashMap<ValueSpecification, BTreeSet<ValueRequirement>>,
}

impl DependencyGraph {
    fn finalize(configuration: String, state: AssemblyState) -> Self {
        let AssemblyState {
            mut nodes,
            terminals,
            ..
        } = state;

        // Drop non-terminal nodes nobody consumes, repeatedly.
        loop {
            let removable: Vec<usize> = nodes
                .iter()
                .filter(|(_, node)| {
                    node.dependents().is_empty()
                        && !node.outputs().iter().any(|o| terminals.contains_key(o))
                })
                .map(|(key, _)| key)
                .collect();
            if removable.is_empty() {
                break;
            }
            for key in removable {
                let node = nodes.remove(key);
                for producer in node.input_nodes() {
                    if let Some(p) = nodes.get_mut(producer.0) {
                        p.remove_dependent(NodeId(key));
                    }
                }
            }
        }

        // Drop outputs that are neither consumed nor requested.
        let consumed: HashSet<ValueSpecification> = nodes
            .iter()
            .flat_map(|(_, node)| node.input_specifications().cloned().collect::<Vec<_>>())
            .collect();
        for (_, node) in nodes.iter_mut() {
            node.retain_outputs(|o| consumed.contains(o) || terminals.contains_key(o));
        }

        let mut spec_index = HashMap::new();
        let mut graph_nodes = BTreeMap::new();
        for (key, node) in nodes {
            let id = NodeId(key);
            for output in node.outputs() {
                spec_index.insert(output.clone(), id);
            }
            graph_nodes.insert(id, Arc::new(node));
        }
        let terminal_outputs = terminals
            .into_iter()
            .filter(|(spec, _)| spec_index.contains_key(spec))
            .collect();

        let graph = Self {
            configuration,
            nodes: graph_nodes,
            spec_index,
            terminal_outputs,
        };
        info!(
            configuration = %graph.configuration,
            nodes = graph.nodes.len(),
            terminals = graph.terminal_outputs.len(),
            "dependency graph built"
        );
        graph
    }

    /// Name of the calculation configuration this graph belongs to.
    pub fn configuration(&self) -> &str {
        &self.configuration
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Arc<DependencyNode>)> {
        self.nodes.iter().map(|(id, node)| (*id, node))
    }

    /// Node by id.
    pub fn node(&self, id: NodeId) -> Option<&Arc<DependencyNode>> {
        self.nodes.get(&id)
    }

    /// Returns `true` if the graph contains `id`.
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Node producing `spec`.
    pub fn node_producing(&self, spec: &ValueSpecification) -> Option<NodeId> {
        self.spec_index.get(spec).copied()
    }

    /// Terminal output specifications and the requirements they satisfy.
    pub fn terminal_outputs(&self) -> &HashMap<ValueSpecification, BTreeSet<ValueRequirement>> {
        &self.terminal_outputs
    }

    /// Specification satisfying a requested requirement.
    pub fn terminal_specification(&self, requirement: &ValueRequirement) -> Option<&ValueSpecification> {
        self.terminal_outputs
            .iter()
            .find(|(_, requirements)| requirements.contains(requirement))
            .map(|(spec, _)| spec)
    }

    /// Every output specification of every node.
    pub fn output_specifications(&self) -> impl Iterator<Item = &ValueSpecification> {
        self.spec_index.keys()
    }

    /// Outputs of market-data-sourcing nodes, sorted.
    pub fn market_data_requirements(&self) -> Vec<ValueSpecification> {
        let mut specs: Vec<ValueSpecification> = self
            .nodes
            .values()
            .filter(|node| node.is_market_data_sourcing())
            .flat_map(|node| node.outputs().iter().cloned())
            .collect();
        specs.sort();
        specs
    }

    /// A graph with only the nodes accepted by `filter`.
    ///
    /// Inputs produced by excluded nodes are expected to be available from
    /// elsewhere (typically the cache).
    pub fn subgraph(&self, mut filter: impl FnMut(NodeId, &DependencyNode) -> bool) -> Self {
        let nodes: BTreeMap<NodeId, Arc<DependencyNode>> = self
            .nodes
            .iter()
            .filter(|(id, node)| filter(**id, node))
            .map(|(id, node)| (*id, Arc::clone(node)))
            .collect();
        let spec_index: HashMap<ValueSpecification, NodeId> = self
            .spec_index
            .iter()
            .filter(|(_, id)| nodes.contains_key(*id))
            .map(|(spec, id)| (spec.clone(), *id))
            .collect();
        let terminal_outputs = self
            .terminal_outputs
            .iter()
            .filter(|(spec, _)| spec_index.contains_key(*spec))
            .map(|(spec, reqs)| (spec.clone(), reqs.clone()))
            .collect();
        Self {
            configuration: self.configuration.clone(),
            nodes,
            spec_index,
            terminal_outputs,
        }
    }

    /// Nodes ordered so that every producer precedes its consumers.
    /// Producers outside this graph are ignored.
    pub fn topological_order(&self) -> Vec<NodeId> {
        let mut remaining: HashMap<NodeId, usize> = self
            .nodes
            .iter()
            .map(|(id, node)| {
                let count = node
                    .input_nodes()
                    .into_iter()
                    .filter(|p| self.nodes.contains_key(p))
                    .count();
                (*id, count)
            })
            .collect();
        let mut ready: BTreeSet<NodeId> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop_first() {
            order.push(id);
            for dependent in self.nodes[&id].dependents() {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(*dependent);
                    }
                }
            }
        }
        order
    }
}

/// Builds one configuration's graph from a set of requirements.
///
/// ```ignore
/// let builder = DependencyGraphBuilder::new("Default", engine.graph_building_context(), None);
/// builder.add_target(ValueRequirement::new("PV", trade));
/// let graph = builder.build()?;
/// ```
pub struct DependencyGraphBuilder {
    configuration: String,
    ctx: GraphBuildingContext,
    assembler: GraphAssembler,
}

impl DependencyGraphBuilder {
    /// Create a builder for `configuration`.
    pub fn new(
        configuration: impl Into<String>,
        ctx: GraphBuildingContext,
        collapser: Option<Arc<dyn TargetCollapser>>,
    ) -> Self {
        Self {
            configuration: configuration.into(),
            ctx,
            assembler: GraphAssembler::new(collapser),
        }
    }

    /// The context resolutions run in.
    pub fn context(&self) -> &GraphBuildingContext {
        &self.ctx
    }

    /// Start resolving a terminal requirement.
    pub fn add_target(&self, requirement: ValueRequirement) {
        self.ctx
            .resolve(requirement, Arc::new(self.assembler.clone()));
    }

    /// Start resolving several terminal requirements.
    pub fn add_targets(&self, requirements: impl IntoIterator<Item = ValueRequirement>) {
        for requirement in requirements {
            self.add_target(requirement);
        }
    }

    /// Wait for resolution to finish and finalize the graph.
    ///
    /// Fails if any terminal requirement could not be resolved.
    pub fn build(self) -> Result<DependencyGraph, GraphBuildError> {
        let configuration = self.configuration.clone();
        let (graph, failures) = self.build_partial();
        if failures.is_empty() {
            Ok(graph)
        } else {
            Err(GraphBuildError::Unsatisfiable {
                configuration,
                failures,
            })
        }
    }

    /// Wait for resolution to finish and finalize whatever resolved.
    pub fn build_partial(self) -> (DependencyGraph, Vec<ResolutionFailure>) {
        self.ctx.run_until_idle();
        let (state, failures) = self.assembler.take();
        (DependencyGraph::finalize(self.configuration, state), failures)
    }
}
