//! Node collapsing across substitutable targets.
//!
//! After each drained batch the assembler submits one [`CollapseNodes`] step
//! per function with newly seen targets. The step compares each new target
//! against one representative per existing group using the
//! [`TargetCollapser`] predicate, outside the assembler's critical section,
//! and posts the merges back to the assembler queue. Groups are built
//! greedily in arrival order, so the result is not a global optimum.

use std::sync::Arc;

use tracing::debug;

use super::assembler::GraphAssembler;
use crate::function::ParameterizedFunction;
use crate::resolve::{ContextRunnable, GraphBuildingContext};
use crate::value::TargetSpec;

/// Decides whether nodes for different targets compute equivalent results.
///
/// Must be conservative: returning a target for two targets whose nodes are
/// not interchangeable produces wrong results.
pub trait TargetCollapser: Send + Sync {
    /// Returns `true` if the collapser understands this function at all.
    fn can_apply_to(&self, function: &ParameterizedFunction) -> bool;

    /// If the targets are interchangeable for `function`, return the one to
    /// keep (`a` or `b`). Any other answer is ignored.
    fn collapse(
        &self,
        function: &ParameterizedFunction,
        a: &TargetSpec,
        b: &TargetSpec,
    ) -> Option<TargetSpec>;
}

/// Outcome of one collapse pass for one function.
pub(crate) struct CollapseResult {
    pub(crate) function_id: String,
    /// (merged target, surviving target) pairs.
    pub(crate) merges: Vec<(TargetSpec, TargetSpec)>,
    pub(crate) representatives: Vec<TargetSpec>,
}

pub(crate) struct CollapseNodes {
    pub(crate) assembler: GraphAssembler,
    pub(crate) collapser: Arc<dyn TargetCollapser>,
    pub(crate) function_id: String,
    pub(crate) function: ParameterizedFunction,
    pub(crate) new_targets: Vec<TargetSpec>,
    pub(crate) representatives: Vec<TargetSpec>,
}

impl ContextRunnable for CollapseNodes {
    fn run(self, ctx: &GraphBuildingContext) {
        let mut representatives = self.representatives;
        let mut merges = Vec::new();
        'targets: for target in self.new_targets {
            for representative in representatives.iter_mut() {
                let Some(keep) = self
                    .collapser
                    .collapse(&self.function, representative, &target)
                else {
                    continue;
                };
                if keep == *representative {
                    merges.push((target, representative.clone()));
                    continue 'targets;
                }
                if keep == target {
                    merges.push((representative.clone(), target.clone()));
                    *representative = target;
                    continue 'targets;
                }
            }
            representatives.push(target);
        }
        debug!(function = %self.function_id, merges = merges.len(), "collapse pass");
        self.assembler.push_collapsed(
            ctx,
            CollapseResult {
                function_id: self.function_id,
                merges,
                representatives,
            },
        );
    }
}
