//! Partitioning a graph into nodes affected by market data changes and nodes
//! whose previous results can be reused.

use std::collections::BTreeSet;

use tracing::debug;

use crate::cache::ResultCache;
use crate::graph::{DependencyGraph, NodeId};

/// Changed and unchanged nodes of one graph between two cycles.
///
/// A market-data-sourcing node is changed if any of its loaded values differs
/// from the previous cycle's. Any other node is changed if one of its
/// producers is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaCalculator {
    changed: BTreeSet<NodeId>,
    unchanged: BTreeSet<NodeId>,
}

impl DeltaCalculator {
    /// Compare the market data in `cache` against `previous`.
    pub fn compute(graph: &DependencyGraph, cache: &ResultCache, previous: &ResultCache) -> Self {
        let mut delta = Self::default();
        for id in graph.topological_order() {
            let Some(node) = graph.node(id) else {
                continue;
            };
            let changed = if node.is_market_data_sourcing() {
                node.outputs()
                    .iter()
                    .any(|spec| cache.get(spec) != previous.get(spec))
            } else {
                node.input_nodes()
                    .iter()
                    .any(|producer| delta.changed.contains(producer))
            };
            if changed {
                delta.changed.insert(id);
            } else {
                delta.unchanged.insert(id);
            }
        }
        debug!(
            configuration = %graph.configuration(),
            changed = delta.changed.len(),
            unchanged = delta.unchanged.len(),
            "delta computed"
        );
        delta
    }

    /// Nodes that must be recomputed.
    pub fn changed(&self) -> &BTreeSet<NodeId> {
        &self.changed
    }

    /// Nodes whose previous results are still valid.
    pub fn unchanged(&self) -> &BTreeSet<NodeId> {
        &self.unchanged
    }

    /// Returns `true` if `node` must be recomputed.
    pub fn is_changed(&self, node: NodeId) -> bool {
        self.changed.contains(&node)
    }
}
