//! Execution blacklists.

use std::collections::HashSet;

use parking_lot::RwLock;

use crate::graph::DependencyNode;

/// Decides whether a node's execution is suppressed this cycle.
pub trait FunctionBlacklistQuery: Send + Sync {
    /// Returns `true` if `node` must not be executed.
    fn is_blacklisted(&self, node: &DependencyNode) -> bool;
}

/// Blacklists nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyBlacklist;

impl FunctionBlacklistQuery for EmptyBlacklist {
    fn is_blacklisted(&self, _node: &DependencyNode) -> bool {
        false
    }
}

/// Blacklists every node bound to one of a set of function ids.
///
/// The set may change between cycles.
#[derive(Debug, Default)]
pub struct FunctionIdBlacklist {
    ids: RwLock<HashSet<String>>,
}

impl FunctionIdBlacklist {
    /// Create an empty blacklist.
    pub fn new() -> Self {
        Self::default()
    }

    /// Suppress nodes of `function_id`.
    pub fn add(&self, function_id: impl Into<String>) {
        self.ids.write().insert(function_id.into());
    }

    /// Stop suppressing nodes of `function_id`.
    pub fn remove(&self, function_id: &str) {
        self.ids.write().remove(function_id);
    }
}

impl FunctionBlacklistQuery for FunctionIdBlacklist {
    fn is_blacklisted(&self, node: &DependencyNode) -> bool {
        self.ids.read().contains(node.function().id())
    }
}
